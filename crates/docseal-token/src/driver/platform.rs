//! Platform certificate store driver
//!
//! The store lists certificates before any authentication and prompts for
//! the PIN itself when a private key is first opened. This driver maps the
//! store's outcomes onto the common [`TokenDriver`] contract.

use async_trait::async_trait;
use tracing::{debug, info};

use docseal_core::{
    classify, Certificate, DigestMethod, ErrorKind, Fault, TokenFlags, TokenHandle,
};

use super::{AuthResult, DriverVariant, TokenDriver};

/// A certificate with an associated private key in the store
#[derive(Debug, Clone)]
pub struct StoreEntry {
    /// Provider or reader name the key lives on
    pub provider: String,
    /// Certificate thumbprint used to reopen the key
    pub thumbprint: Vec<u8>,
    pub certificate: Certificate,
    pub flags: TokenFlags,
}

/// Operating system certificate store with private key access
#[async_trait]
pub trait CertificateStore: Send + Sync {
    /// Certificates that have an associated private key
    async fn entries(&self) -> Result<Vec<StoreEntry>, Fault>;

    /// Open the private key, letting the store prompt for the PIN
    async fn open_key(&self, thumbprint: &[u8]) -> Result<(), Fault>;

    async fn sign(
        &self,
        thumbprint: &[u8],
        method: DigestMethod,
        digest: &[u8],
    ) -> Result<Vec<u8>, Fault>;

    async fn close_key(&self, _thumbprint: &[u8]) {}
}

pub struct PlatformStoreDriver<S: CertificateStore> {
    store: S,
}

impl<S: CertificateStore> PlatformStoreDriver<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    fn to_handle(entry: StoreEntry) -> Option<TokenHandle> {
        let key_algorithm = match entry.certificate.key_algorithm() {
            Ok(alg) => alg,
            Err(e) => {
                debug!(
                    "Skipping store certificate {}: {}",
                    entry.certificate.short(),
                    e
                );
                return None;
            }
        };
        Some(TokenHandle::new(
            entry.provider,
            entry.thumbprint,
            entry.certificate,
            key_algorithm,
            entry.flags,
        ))
    }
}

#[async_trait]
impl<S: CertificateStore> TokenDriver for PlatformStoreDriver<S> {
    fn variant(&self) -> DriverVariant {
        DriverVariant::PlatformStore
    }

    async fn detect(&self) -> Result<Vec<TokenHandle>, Fault> {
        let entries = self.store.entries().await?;
        Ok(entries.into_iter().filter_map(Self::to_handle).collect())
    }

    async fn authenticate(&self, handle: &TokenHandle, attempt: u32) -> AuthResult {
        debug!(
            "Opening store key {} (attempt {})",
            handle.certificate().short(),
            attempt
        );
        match self.store.open_key(handle.credential_id()).await {
            Ok(()) => {
                info!("Store key {} opened", handle.certificate().short());
                AuthResult::Authenticated
            }
            Err(fault) => match classify(&fault).kind {
                ErrorKind::PinCanceled => AuthResult::Canceled,
                ErrorKind::PinIncorrect => AuthResult::Incorrect {
                    flags: TokenFlags {
                        pin_count_low: true,
                        ..handle.flags()
                    },
                },
                ErrorKind::PinLocked => AuthResult::Incorrect {
                    flags: TokenFlags {
                        pin_locked: true,
                        ..handle.flags()
                    },
                },
                _ => AuthResult::Failed(fault),
            },
        }
    }

    async fn raw_sign(
        &self,
        handle: &TokenHandle,
        method: DigestMethod,
        digest: &[u8],
    ) -> Result<Vec<u8>, Fault> {
        self.store
            .sign(handle.credential_id(), method, digest)
            .await
    }

    async fn list_available_certificates(&self) -> Result<Vec<Certificate>, Fault> {
        Ok(self
            .store
            .entries()
            .await?
            .into_iter()
            .map(|e| e.certificate)
            .collect())
    }

    async fn logout(&self, handle: &TokenHandle) {
        self.store.close_key(handle.credential_id()).await;
    }
}
