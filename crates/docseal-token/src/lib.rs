//! docseal token - signing token coordination
//!
//! This crate owns the one signing token a process talks to:
//! - Driver seam over PKCS#11 modules and the platform certificate store
//! - Credential selection by certificate usage
//! - [`TokenCoordinator`]: background detection and exclusive signing sessions
//! - [`ContainerFacade`]: signing and validating a document container
//!
//! # Usage
//!
//! ```ignore
//! let config = CoordinatorConfig::load(&CoordinatorConfig::default_path())?;
//! let driver = open_driver(&config.driver, prompt)?;
//! let coordinator = Arc::new(TokenCoordinator::new(driver, config));
//! let detection = coordinator.spawn_detection();
//!
//! match coordinator.sign(DigestMethod::Sha256, &digest).await? {
//!     SignOutcome::Signed(signature) => { /* embed the signature */ }
//!     SignOutcome::Canceled => {}
//! }
//! detection.stop().await;
//! ```

pub mod access_cert;
pub mod config;
pub mod coordinator;
pub mod driver;
pub mod error;
pub mod facade;
pub mod pin;
pub mod selection;

pub use access_cert::{assess_access_certificate, AccessCertStatus, AccessCertificate};
pub use config::{CoordinatorConfig, DriverConfig, PinRetryPolicy};
pub use coordinator::{
    DetectionHandle, SessionStage, SignOutcome, SigningSession, TokenCoordinator, TokenEvent,
};
pub use driver::{open_driver, AuthResult, DriverVariant, TokenDriver};
pub use error::{Result, TokenError};
pub use facade::{Container, ContainerFacade, SignatureParams};
pub use pin::{Pin, PinPrompt, PinRequest, PinResponse, StaticPin};
pub use selection::SelectionPolicy;
