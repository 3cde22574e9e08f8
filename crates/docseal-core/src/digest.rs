//! Digest methods used by signature references and raw token signing

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// SHA-1 and MD5 object identifiers, bare and combined with a signature scheme
const DEPRECATED_OIDS: &[&str] = &[
    "1.3.14.3.2.26",
    "1.2.840.113549.1.1.5",
    "1.2.840.10045.4.1",
    "1.2.840.113549.2.5",
    "1.2.840.113549.1.1.4",
];

/// Digest algorithm identified by its XML-DSig URI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DigestMethod {
    Sha1,
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}

impl DigestMethod {
    pub const ALL: [DigestMethod; 5] = [
        DigestMethod::Sha1,
        DigestMethod::Sha224,
        DigestMethod::Sha256,
        DigestMethod::Sha384,
        DigestMethod::Sha512,
    ];

    pub fn uri(&self) -> &'static str {
        match self {
            DigestMethod::Sha1 => "http://www.w3.org/2000/09/xmldsig#sha1",
            DigestMethod::Sha224 => "http://www.w3.org/2001/04/xmldsig-more#sha224",
            DigestMethod::Sha256 => "http://www.w3.org/2001/04/xmlenc#sha256",
            DigestMethod::Sha384 => "http://www.w3.org/2001/04/xmldsig-more#sha384",
            DigestMethod::Sha512 => "http://www.w3.org/2001/04/xmlenc#sha512",
        }
    }

    pub fn from_uri(uri: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|m| m.uri() == uri)
            .ok_or_else(|| Error::UnsupportedDigestMethod(uri.to_string()))
    }

    /// Digest output length in bytes
    pub fn digest_len(&self) -> usize {
        match self {
            DigestMethod::Sha1 => 20,
            DigestMethod::Sha224 => 28,
            DigestMethod::Sha256 => 32,
            DigestMethod::Sha384 => 48,
            DigestMethod::Sha512 => 64,
        }
    }

    /// DER prefix of the PKCS#1 v1.5 DigestInfo structure for this method
    pub fn digest_info_prefix(&self) -> &'static [u8] {
        match self {
            DigestMethod::Sha1 => &[
                0x30, 0x21, 0x30, 0x09, 0x06, 0x05, 0x2b, 0x0e, 0x03, 0x02, 0x1a, 0x05, 0x00, 0x04,
                0x14,
            ],
            DigestMethod::Sha224 => &[
                0x30, 0x2d, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02,
                0x04, 0x05, 0x00, 0x04, 0x1c,
            ],
            DigestMethod::Sha256 => &[
                0x30, 0x31, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02,
                0x01, 0x05, 0x00, 0x04, 0x20,
            ],
            DigestMethod::Sha384 => &[
                0x30, 0x41, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02,
                0x02, 0x05, 0x00, 0x04, 0x30,
            ],
            DigestMethod::Sha512 => &[
                0x30, 0x51, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02,
                0x03, 0x05, 0x00, 0x04, 0x40,
            ],
        }
    }

    /// Wrap a digest in a DigestInfo structure for RSA PKCS#1 v1.5 signing
    pub fn digest_info(&self, digest: &[u8]) -> Result<Vec<u8>> {
        self.check_len(digest)?;
        let prefix = self.digest_info_prefix();
        let mut out = Vec::with_capacity(prefix.len() + digest.len());
        out.extend_from_slice(prefix);
        out.extend_from_slice(digest);
        Ok(out)
    }

    pub fn check_len(&self, digest: &[u8]) -> Result<()> {
        if digest.len() != self.digest_len() {
            return Err(Error::DigestLength {
                expected: self.digest_len(),
                actual: digest.len(),
            });
        }
        Ok(())
    }
}

impl std::fmt::Display for DigestMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DigestMethod::Sha1 => "SHA-1",
            DigestMethod::Sha224 => "SHA-224",
            DigestMethod::Sha256 => "SHA-256",
            DigestMethod::Sha384 => "SHA-384",
            DigestMethod::Sha512 => "SHA-512",
        };
        f.write_str(name)
    }
}

/// True if the algorithm identifier names SHA-1 or MD5
///
/// Accepts XML-DSig URIs (`...#sha1`, `...#rsa-sha1`) and dotted OIDs.
pub fn is_deprecated_algorithm(id: &str) -> bool {
    let id = id.trim();
    if DEPRECATED_OIDS.contains(&id) {
        return true;
    }
    let fragment = id
        .rsplit(['#', '/'])
        .next()
        .unwrap_or(id)
        .to_ascii_lowercase();
    matches!(fragment.as_str(), "sha1" | "md5")
        || fragment.ends_with("-sha1")
        || fragment.ends_with("-md5")
}
