//! Token driver abstraction
//!
//! One interface over the ways a signing credential can be reached:
//! - PKCS#11 modules (smart card middleware, HSMs, SoftHSM)
//! - The operating system certificate store, where enumeration happens
//!   before authentication and the store itself prompts for the PIN
//!
//! The driver variant is chosen once from configuration. Drivers report
//! failures as [`Fault`] trees; the coordinator classifies them.

#[cfg(feature = "pkcs11")]
pub mod pkcs11;

pub mod platform;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use docseal_core::{Certificate, DigestMethod, Fault, TokenFlags, TokenHandle};

use crate::config::DriverConfig;
use crate::error::{Result, TokenError};
use crate::pin::PinPrompt;
use crate::selection::SelectionPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverVariant {
    Pkcs11,
    PlatformStore,
}

/// Outcome of one authentication attempt
#[derive(Debug, Clone)]
pub enum AuthResult {
    Authenticated,
    /// The user dismissed the PIN prompt
    Canceled,
    /// Wrong PIN; carries the token flags read back after the attempt
    Incorrect { flags: TokenFlags },
    Failed(Fault),
}

/// Access to signing credentials on hardware or platform tokens
#[async_trait]
pub trait TokenDriver: Send + Sync {
    fn variant(&self) -> DriverVariant;

    /// Enumerate credentials on every present token
    async fn detect(&self) -> std::result::Result<Vec<TokenHandle>, Fault>;

    /// Pick the credential on `card` that satisfies `policy`
    async fn select_credential(
        &self,
        card: &str,
        policy: &SelectionPolicy,
    ) -> std::result::Result<TokenHandle, Fault> {
        let handles: Vec<TokenHandle> = self
            .detect()
            .await?
            .into_iter()
            .filter(|h| h.card() == card)
            .collect();

        policy
            .choose(&handles, Some(card), Utc::now())
            .cloned()
            .ok_or_else(|| Fault::general(format!("No suitable certificate on card {}", card)))
    }

    /// Unlock the credential's private key
    ///
    /// `attempt` counts attempts within the current session, starting at 1.
    async fn authenticate(&self, handle: &TokenHandle, attempt: u32) -> AuthResult;

    /// Sign a precomputed digest with an authenticated credential
    async fn raw_sign(
        &self,
        handle: &TokenHandle,
        method: DigestMethod,
        digest: &[u8],
    ) -> std::result::Result<Vec<u8>, Fault>;

    /// Certificates visible before authentication
    async fn list_available_certificates(&self) -> std::result::Result<Vec<Certificate>, Fault> {
        Ok(self
            .detect()
            .await?
            .into_iter()
            .map(|h| h.certificate().clone())
            .collect())
    }

    /// Drop any authenticated state held for the credential
    async fn logout(&self, _handle: &TokenHandle) {}
}

/// Open the driver named by configuration
pub fn open_driver(
    config: &DriverConfig,
    prompt: Arc<dyn PinPrompt>,
) -> Result<Arc<dyn TokenDriver>> {
    match config {
        #[cfg(feature = "pkcs11")]
        DriverConfig::Pkcs11 { module_path } => {
            let driver = pkcs11::Pkcs11Driver::open(module_path, prompt)?;
            Ok(Arc::new(driver))
        }
        #[cfg(not(feature = "pkcs11"))]
        DriverConfig::Pkcs11 { module_path } => {
            let _ = prompt;
            Err(TokenError::DriverUnavailable(format!(
                "PKCS#11 support not compiled in (module {})",
                module_path.display()
            )))
        }
        DriverConfig::PlatformStore => Err(TokenError::DriverUnavailable(
            "platform certificate store needs a CertificateStore implementation".to_string(),
        )),
    }
}
