//! Credential selection by certificate usage

use chrono::{DateTime, Utc};
use tracing::debug;

use docseal_core::{CertificateInfo, ExtendedUsage, KeyUsage, TokenHandle};

/// Usage a certificate must carry to be chosen for an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectionPolicy {
    /// Every bit set here must be set on the certificate
    pub key_usage: KeyUsage,
    /// Extended purposes required, if the operation restricts them
    pub extended_usage: Option<ExtendedUsage>,
}

impl SelectionPolicy {
    /// Qualified signatures: non-repudiation key usage
    pub fn signing() -> Self {
        Self {
            key_usage: KeyUsage {
                non_repudiation: true,
                ..KeyUsage::default()
            },
            extended_usage: None,
        }
    }

    /// TLS client authentication: digital signature with the client-auth purpose
    pub fn client_authentication() -> Self {
        Self {
            key_usage: KeyUsage {
                digital_signature: true,
                ..KeyUsage::default()
            },
            extended_usage: Some(ExtendedUsage {
                client_auth: true,
                ..ExtendedUsage::default()
            }),
        }
    }

    /// True if the certificate is valid at `now` and carries the required usage
    pub fn matches(&self, info: &CertificateInfo, now: DateTime<Utc>) -> bool {
        if !info.is_valid_at(now) {
            return false;
        }

        let have = &info.key_usage;
        let need = &self.key_usage;
        let key_usage_ok = (!need.digital_signature || have.digital_signature)
            && (!need.non_repudiation || have.non_repudiation)
            && (!need.key_encipherment || have.key_encipherment)
            && (!need.data_encipherment || have.data_encipherment)
            && (!need.key_agreement || have.key_agreement);
        if !key_usage_ok {
            return false;
        }

        match &self.extended_usage {
            None => true,
            Some(need) => {
                let have = &info.extended_usage;
                have.any
                    || ((!need.client_auth || have.client_auth)
                        && (!need.email_protection || have.email_protection)
                        && (!need.ocsp_signing || have.ocsp_signing))
            }
        }
    }

    /// Choose the best matching credential
    ///
    /// Candidates on `preferred_card` win; otherwise the first match in
    /// detection order is returned.
    pub fn choose<'a>(
        &self,
        candidates: &'a [TokenHandle],
        preferred_card: Option<&str>,
        now: DateTime<Utc>,
    ) -> Option<&'a TokenHandle> {
        let mut matching = candidates.iter().filter(|handle| {
            match handle.certificate().info() {
                Ok(info) => self.matches(&info, now),
                Err(e) => {
                    debug!(
                        "Skipping unparseable certificate {}: {}",
                        handle.certificate().short(),
                        e
                    );
                    false
                }
            }
        });

        match preferred_card {
            Some(card) => {
                let matching: Vec<_> = matching.collect();
                matching
                    .iter()
                    .find(|h| h.card() == card)
                    .or_else(|| matching.first())
                    .copied()
            }
            None => matching.next(),
        }
    }
}
