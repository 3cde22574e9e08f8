//! Server access certificate
//!
//! Time-mark signatures need an OCSP confirmation, and the OCSP responder
//! only answers clients holding a server access certificate. Downloading
//! one is an external capability; this module only decides whether the
//! installed certificate is usable.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use docseal_core::{Certificate, Fault, TokenHandle};

/// Renew when the certificate expires in fewer than this many days
pub const RENEWAL_WINDOW_DAYS: i64 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessCertStatus {
    /// Nothing installed
    Missing,
    /// Unparseable or outside its validity period
    Invalid,
    /// Usable now, but inside the renewal window
    ExpiringSoon,
    Valid,
}

impl AccessCertStatus {
    /// True if signing needing OCSP access can proceed without a download
    pub fn is_usable(&self) -> bool {
        matches!(self, AccessCertStatus::ExpiringSoon | AccessCertStatus::Valid)
    }
}

/// Provider of the server access certificate
#[async_trait]
pub trait AccessCertificate: Send + Sync {
    /// The certificate currently installed, if any
    async fn installed(&self) -> Result<Option<Certificate>, Fault>;

    /// Download and install a fresh certificate, authenticating to the
    /// server with the token's client credential
    async fn fetch(&self, credential: &TokenHandle) -> Result<Certificate, Fault>;
}

pub fn assess_access_certificate(
    certificate: Option<&Certificate>,
    now: DateTime<Utc>,
) -> AccessCertStatus {
    let Some(certificate) = certificate else {
        return AccessCertStatus::Missing;
    };

    let info = match certificate.info() {
        Ok(info) => info,
        Err(e) => {
            debug!("Access certificate {} unreadable: {}", certificate.short(), e);
            return AccessCertStatus::Invalid;
        }
    };

    if !info.is_valid_at(now) {
        AccessCertStatus::Invalid
    } else if info.expires_within(now, RENEWAL_WINDOW_DAYS) {
        AccessCertStatus::ExpiringSoon
    } else {
        AccessCertStatus::Valid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    const AUTHENTICATION: &[u8] =
        include_bytes!("../../docseal-core/tests/fixtures/authentication.der");
    const EXPIRED: &[u8] = include_bytes!("../../docseal-core/tests/fixtures/expired_signing.der");

    fn cert(der: &[u8]) -> Certificate {
        Certificate::from_der(der.to_vec())
    }

    #[test]
    fn test_missing_and_garbage() {
        let now = Utc.with_ymd_and_hms(2026, 10, 1, 0, 0, 0).unwrap();
        assert_eq!(assess_access_certificate(None, now), AccessCertStatus::Missing);
        assert_eq!(
            assess_access_certificate(Some(&cert(&[0x30, 0x03, 0x02, 0x01])), now),
            AccessCertStatus::Invalid
        );
        assert!(!AccessCertStatus::Missing.is_usable());
    }

    #[test]
    fn test_expired_is_invalid() {
        let now = Utc.with_ymd_and_hms(2026, 10, 1, 0, 0, 0).unwrap();
        assert_eq!(
            assess_access_certificate(Some(&cert(EXPIRED)), now),
            AccessCertStatus::Invalid
        );
    }

    #[test]
    fn test_renewal_window() {
        let certificate = cert(AUTHENTICATION);
        let not_after = certificate.info().unwrap().not_after;

        let comfortable = not_after - Duration::days(30);
        assert_eq!(
            assess_access_certificate(Some(&certificate), comfortable),
            AccessCertStatus::Valid
        );

        let soon = not_after - Duration::days(3);
        let status = assess_access_certificate(Some(&certificate), soon);
        assert_eq!(status, AccessCertStatus::ExpiringSoon);
        assert!(status.is_usable());
    }
}
