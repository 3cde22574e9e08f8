//! docseal core - token data model, error taxonomy and signature inspection
//!
//! This crate holds everything that does not touch a driver or a runtime:
//! - Immutable snapshots of the selected signing credential
//! - Fault cause trees reported by drivers and container libraries
//! - The taxonomy that flattens a cause tree into a [`ClassifiedError`]
//! - Read-only inspection and validation of signature records

pub mod certificate;
pub mod digest;
pub mod error;
pub mod fault;
pub mod inspector;
pub mod taxonomy;
pub mod token;

pub use certificate::{Certificate, CertificateInfo, ExtendedUsage, KeyUsage};
pub use digest::{is_deprecated_algorithm, DigestMethod};
pub use error::{Error, Result};
pub use fault::{Fault, FaultCode};
pub use inspector::{
    OcspReference, OcspStatus, ProductionPlace, SignatureInspector, SignatureRecord,
    SignatureType, ValidationOutcome, ValidationStatus,
};
pub use taxonomy::{classify, native_code, ClassifiedError, ErrorKind};
pub use token::{KeyAlgorithm, TokenFlags, TokenHandle};
