//! Read-only inspection and validation of one signature record
//!
//! The container library owns signature records; this module only queries
//! them through [`SignatureRecord`] and derives classifications. Accessor
//! faults are swallowed into empty results. Validation faults are classified
//! and kept as the inspector's last error.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::certificate::Certificate;
use crate::digest::is_deprecated_algorithm;
use crate::fault::{Fault, FaultCode};
use crate::taxonomy::{classify, native_code, ClassifiedError, ErrorKind};

pub const MEDIA_TYPE_TM: &str = "signature/bdoc-1.0/TM";
pub const MEDIA_TYPE_TS: &str = "signature/bdoc-1.0/TS";
pub const MEDIA_TYPE_BES: &str = "signature/bdoc-1.0/BES";

const LEGACY_PREFIXES: &[&str] = &["DIGIDOC-XML", "SK-XML"];

/// Message attached when a BES profile signature is rejected
pub const BES_REJECTED_MESSAGE: &str =
    "Signature profile BES lacks a validity confirmation and is not equivalent to a qualified signature";

/// Display format of signature times
pub const DATE_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Native codes that make an offline failure inconclusive rather than invalid
const INCONCLUSIVE_CODES: &[FaultCode] = &[
    FaultCode::CertificateIssuerMissing,
    FaultCode::CertificateUnknown,
    FaultCode::OcspResponderMissing,
    FaultCode::OcspCertMissing,
];

/// Signature format and profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignatureType {
    /// Basic profile without revocation or timestamp evidence
    Bes,
    /// Time-mark profile, bound to an OCSP confirmation
    Tm,
    /// Time-stamp profile
    Ts,
    /// Legacy DigiDoc XML formats
    Legacy,
    Unknown,
}

impl SignatureType {
    pub fn classify(media_type: &str) -> Self {
        match media_type {
            MEDIA_TYPE_TM => SignatureType::Tm,
            MEDIA_TYPE_TS => SignatureType::Ts,
            MEDIA_TYPE_BES => SignatureType::Bes,
            m if LEGACY_PREFIXES.iter().any(|p| m.starts_with(p)) => SignatureType::Legacy,
            _ => SignatureType::Unknown,
        }
    }

    /// True if validation must confirm revocation status with the responder
    pub fn requires_online_confirmation(&self) -> bool {
        matches!(self, SignatureType::Tm)
    }

    /// True if the signature embeds an OCSP response reference
    pub fn has_ocsp_reference(&self) -> bool {
        matches!(self, SignatureType::Tm | SignatureType::Legacy)
    }
}

/// Revocation status reported by the OCSP responder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OcspStatus {
    Good,
    Revoked,
    Unknown,
}

/// Digest of the OCSP response embedded in a signature
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OcspReference {
    /// Digest algorithm URI
    pub method: String,
    pub digest: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProductionPlace {
    pub city: String,
    pub state_or_province: String,
    pub postal_code: String,
    pub country: String,
}

/// Read-only view of a signature owned by the container library
pub trait SignatureRecord {
    fn media_type(&self) -> String;

    fn signing_certificate(&self) -> Result<Certificate, Fault>;

    fn ocsp_certificate(&self) -> Result<Option<Certificate>, Fault>;

    /// OCSP response production time, for profiles that embed one
    fn produced_at(&self) -> Result<Option<DateTime<Utc>>, Fault>;

    /// Signing time claimed by the signer
    fn signing_time(&self) -> Result<Option<DateTime<Utc>>, Fault>;

    fn ocsp_reference(&self) -> Result<Option<OcspReference>, Fault>;

    fn claimed_roles(&self) -> Result<Vec<String>, Fault>;

    fn production_place(&self) -> Result<ProductionPlace, Fault>;

    /// Digest algorithm identifiers of every signed reference
    fn reference_digest_methods(&self) -> Result<Vec<String>, Fault>;

    /// Overall signature algorithm identifier
    fn signature_method(&self) -> Result<String, Fault>;

    /// Signature integrity, certificate chain and evidence presence
    fn validate_offline(&self) -> Result<(), Fault>;

    /// Ask the OCSP responder for the signing certificate's status
    fn validate_online(&self) -> Result<OcspStatus, Fault>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidationStatus {
    Valid,
    Invalid,
    Unknown,
}

/// Result of one validation run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationOutcome {
    pub status: ValidationStatus,
    /// Present whenever status is not Valid
    pub error: Option<ClassifiedError>,
    pub weak_digest: bool,
}

impl ValidationOutcome {
    pub fn is_valid(&self) -> bool {
        self.status == ValidationStatus::Valid
    }
}

/// Queries and validation over one signature record
pub struct SignatureInspector<'a> {
    record: &'a dyn SignatureRecord,
    last_error: Option<ClassifiedError>,
}

impl<'a> SignatureInspector<'a> {
    pub fn new(record: &'a dyn SignatureRecord) -> Self {
        Self {
            record,
            last_error: None,
        }
    }

    pub fn media_type(&self) -> String {
        self.record.media_type()
    }

    pub fn signature_type(&self) -> SignatureType {
        SignatureType::classify(&self.record.media_type())
    }

    pub fn signing_certificate(&self) -> Option<Certificate> {
        self.record.signing_certificate().ok()
    }

    pub fn ocsp_certificate(&self) -> Option<Certificate> {
        if !self.signature_type().has_ocsp_reference() {
            return None;
        }
        self.record.ocsp_certificate().ok().flatten()
    }

    /// OCSP production time for profiles that carry one, else the claimed signing time
    pub fn date_time(&self) -> Option<DateTime<Utc>> {
        let produced = if self.signature_type().has_ocsp_reference() {
            self.record.produced_at().ok().flatten()
        } else {
            None
        };
        produced.or_else(|| self.record.signing_time().ok().flatten())
    }

    pub fn date_time_string(&self) -> Option<String> {
        self.date_time()
            .map(|t| t.format(DATE_TIME_FORMAT).to_string())
    }

    fn ocsp_reference(&self) -> Option<OcspReference> {
        if !self.signature_type().has_ocsp_reference() {
            return None;
        }
        self.record.ocsp_reference().ok().flatten()
    }

    /// Digest algorithm URI of the embedded OCSP response reference
    pub fn digest_method(&self) -> Option<String> {
        self.ocsp_reference()
            .map(|r| r.method)
            .filter(|m| !m.is_empty())
    }

    pub fn digest_value(&self) -> Vec<u8> {
        self.ocsp_reference().map(|r| r.digest).unwrap_or_default()
    }

    pub fn roles(&self) -> Vec<String> {
        self.record
            .claimed_roles()
            .unwrap_or_default()
            .iter()
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .collect()
    }

    pub fn role(&self) -> String {
        self.roles().join(", ")
    }

    /// City, state, postal code and country, trimmed with empty parts removed
    pub fn locations(&self) -> Vec<String> {
        let place = self.record.production_place().unwrap_or_default();
        [
            place.city,
            place.state_or_province,
            place.postal_code,
            place.country,
        ]
        .iter()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
    }

    pub fn location(&self) -> String {
        self.locations().join(", ")
    }

    /// True if any reference digest or the signature algorithm is deprecated
    pub fn weak_digest_method(&self) -> bool {
        let references = self.record.reference_digest_methods().unwrap_or_default();
        if references.iter().any(|m| is_deprecated_algorithm(m)) {
            return true;
        }
        self.record
            .signature_method()
            .map(|m| is_deprecated_algorithm(&m))
            .unwrap_or(false)
    }

    /// Error recorded by the most recent [`validate`](Self::validate) call
    pub fn last_error(&self) -> Option<&ClassifiedError> {
        self.last_error.as_ref()
    }

    /// Run the validation state machine
    pub fn validate(&mut self) -> ValidationOutcome {
        let (status, error) = self.evaluate();
        self.last_error = error.clone();
        ValidationOutcome {
            status,
            error,
            weak_digest: self.weak_digest_method(),
        }
    }

    fn evaluate(&self) -> (ValidationStatus, Option<ClassifiedError>) {
        if let Err(fault) = self.record.validate_offline() {
            debug!("Offline validation failed: {}", fault);
            return fault_outcome(&fault);
        }

        let signature_type = self.signature_type();
        if signature_type == SignatureType::Bes {
            return (
                ValidationStatus::Invalid,
                Some(ClassifiedError::unclassified(BES_REJECTED_MESSAGE)),
            );
        }

        if !signature_type.requires_online_confirmation() {
            return (ValidationStatus::Valid, None);
        }

        match self.record.validate_online() {
            Ok(OcspStatus::Good) => (ValidationStatus::Valid, None),
            Ok(OcspStatus::Revoked) => (
                ValidationStatus::Invalid,
                Some(ClassifiedError::from_kind(ErrorKind::CertificateRevoked)),
            ),
            Ok(OcspStatus::Unknown) => (
                ValidationStatus::Unknown,
                Some(ClassifiedError::from_kind(ErrorKind::CertificateUnknown)),
            ),
            Err(fault) => {
                debug!("Online validation failed: {}", fault);
                fault_outcome(&fault)
            }
        }
    }
}

fn fault_outcome(fault: &Fault) -> (ValidationStatus, Option<ClassifiedError>) {
    let status = if INCONCLUSIVE_CODES.contains(&native_code(fault)) {
        ValidationStatus::Unknown
    } else {
        ValidationStatus::Invalid
    };
    (status, Some(classify(fault)))
}
