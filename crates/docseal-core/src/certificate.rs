//! X.509 certificate wrapper and the usage facts credential selection needs

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;
use x509_parser::public_key::PublicKey;

use crate::error::{Error, Result};
use crate::token::KeyAlgorithm;

/// Subject serialNumber attribute (2.5.4.5)
const OID_SUBJECT_SERIAL_NUMBER: &str = "2.5.4.5";

/// DER-encoded X.509 certificate
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Certificate(#[serde(with = "hex_bytes")] Vec<u8>);

impl Certificate {
    pub fn from_der(der: Vec<u8>) -> Self {
        Self(der)
    }

    pub fn as_der(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// SHA-256 fingerprint as lowercase hex, used to identify the certificate in logs
    pub fn fingerprint(&self) -> String {
        hex::encode(Sha256::digest(&self.0))
    }

    /// Short display format (first 8 bytes of the fingerprint)
    pub fn short(&self) -> String {
        let digest = Sha256::digest(&self.0);
        hex::encode(&digest[..8])
    }

    /// Parse the fields used for selection and display
    pub fn info(&self) -> Result<CertificateInfo> {
        let (_, cert) = X509Certificate::from_der(&self.0)
            .map_err(|e| Error::Certificate(e.to_string()))?;

        let not_before = timestamp(cert.validity().not_before.timestamp())?;
        let not_after = timestamp(cert.validity().not_after.timestamp())?;

        let serial_number = cert
            .subject()
            .iter_attributes()
            .find(|attr| attr.attr_type().to_id_string() == OID_SUBJECT_SERIAL_NUMBER)
            .and_then(|attr| attr.as_str().ok())
            .map(str::to_string);

        let key_usage = match cert.key_usage() {
            Ok(Some(ext)) => KeyUsage {
                digital_signature: ext.value.digital_signature(),
                non_repudiation: ext.value.non_repudiation(),
                key_encipherment: ext.value.key_encipherment(),
                data_encipherment: ext.value.data_encipherment(),
                key_agreement: ext.value.key_agreement(),
            },
            Ok(None) => KeyUsage::default(),
            Err(e) => return Err(Error::Certificate(e.to_string())),
        };

        let extended_usage = match cert.extended_key_usage() {
            Ok(Some(ext)) => ExtendedUsage {
                any: ext.value.any,
                client_auth: ext.value.client_auth,
                email_protection: ext.value.email_protection,
                ocsp_signing: ext.value.ocsp_signing,
            },
            Ok(None) => ExtendedUsage::default(),
            Err(e) => return Err(Error::Certificate(e.to_string())),
        };

        Ok(CertificateInfo {
            subject: cert.subject().to_string(),
            serial_number,
            not_before,
            not_after,
            key_usage,
            extended_usage,
        })
    }

    /// Key algorithm and size of the subject public key
    pub fn key_algorithm(&self) -> Result<KeyAlgorithm> {
        let (_, cert) = X509Certificate::from_der(&self.0)
            .map_err(|e| Error::Certificate(e.to_string()))?;

        match cert.public_key().parsed() {
            Ok(PublicKey::RSA(rsa)) => Ok(KeyAlgorithm::Rsa {
                bits: rsa.key_size() as u32,
            }),
            Ok(PublicKey::EC(point)) => {
                // Uncompressed point: 0x04 || x || y
                let field_bytes = point.data().len().saturating_sub(1) / 2;
                let field_bits = match field_bytes {
                    66 => 521,
                    n => n as u32 * 8,
                };
                Ok(KeyAlgorithm::Ec { field_bits })
            }
            Ok(_) => Err(Error::Certificate(
                "unsupported public key algorithm".to_string(),
            )),
            Err(e) => Err(Error::Certificate(e.to_string())),
        }
    }
}

impl std::fmt::Debug for Certificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Certificate({})", self.short())
    }
}

impl AsRef<[u8]> for Certificate {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| Error::Certificate(format!("validity timestamp out of range: {}", secs)))
}

/// Key usage bits relevant to signing and authentication
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyUsage {
    pub digital_signature: bool,
    pub non_repudiation: bool,
    pub key_encipherment: bool,
    pub data_encipherment: bool,
    pub key_agreement: bool,
}

/// Extended key usage purposes relevant to credential selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendedUsage {
    pub any: bool,
    pub client_auth: bool,
    pub email_protection: bool,
    pub ocsp_signing: bool,
}

/// Parsed certificate facts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    /// Subject distinguished name in RFC 4514 form
    pub subject: String,
    /// Subject serialNumber attribute (personal code on national ID cards)
    pub serial_number: Option<String>,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub key_usage: KeyUsage,
    pub extended_usage: ExtendedUsage,
}

impl CertificateInfo {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.not_before <= now && now <= self.not_after
    }

    /// True if the certificate expires before `now + days`
    pub fn expires_within(&self, now: DateTime<Utc>, days: i64) -> bool {
        self.not_after < now + Duration::days(days)
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}
