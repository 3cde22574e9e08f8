//! Immutable snapshot of a selected signing credential
//!
//! A [`TokenHandle`] is produced by a driver when a credential is selected and
//! is never mutated in place. Flag changes after an authentication attempt
//! produce a new handle through [`TokenHandle::with_flags`].

use serde::{Deserialize, Serialize};

use crate::certificate::Certificate;

/// PIN and capability flags reported by the token
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenFlags {
    /// PIN is blocked, no further attempts are possible
    pub pin_locked: bool,
    /// At least one incorrect PIN has been entered since the last success
    pub pin_count_low: bool,
    /// The next incorrect PIN locks the token
    pub pin_final_try: bool,
    pub supports_sign: bool,
    pub supports_decrypt: bool,
    /// PIN is entered on a reader pinpad rather than through the host
    pub protected_auth_path: bool,
}

impl TokenFlags {
    /// Flags for an unlocked token that can sign
    pub fn signing() -> Self {
        Self {
            supports_sign: true,
            ..Self::default()
        }
    }
}

/// Key algorithm of the credential, used to check raw signature lengths
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyAlgorithm {
    Rsa { bits: u32 },
    Ec { field_bits: u32 },
}

impl KeyAlgorithm {
    /// Expected length of a raw signature in bytes
    ///
    /// RSA signatures are the modulus size. ECDSA signatures are the
    /// concatenation r || s, each padded to the field size.
    pub fn signature_len(&self) -> usize {
        match self {
            KeyAlgorithm::Rsa { bits } => (*bits as usize).div_ceil(8),
            KeyAlgorithm::Ec { field_bits } => 2 * (*field_bits as usize).div_ceil(8),
        }
    }

    pub fn is_rsa(&self) -> bool {
        matches!(self, KeyAlgorithm::Rsa { .. })
    }
}

impl std::fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyAlgorithm::Rsa { bits } => write!(f, "RSA-{}", bits),
            KeyAlgorithm::Ec { field_bits } => write!(f, "EC-P{}", field_bits),
        }
    }
}

/// Selected signing credential
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenHandle {
    card: String,
    slot: Option<u64>,
    credential_id: Vec<u8>,
    certificate: Certificate,
    key_algorithm: KeyAlgorithm,
    flags: TokenFlags,
}

impl TokenHandle {
    pub fn new(
        card: impl Into<String>,
        credential_id: Vec<u8>,
        certificate: Certificate,
        key_algorithm: KeyAlgorithm,
        flags: TokenFlags,
    ) -> Self {
        Self {
            card: card.into(),
            slot: None,
            credential_id,
            certificate,
            key_algorithm,
            flags,
        }
    }

    /// Attach the reader slot the credential was found in
    pub fn with_slot(mut self, slot: u64) -> Self {
        self.slot = Some(slot);
        self
    }

    /// Replace the flag set, keeping everything else
    pub fn with_flags(mut self, flags: TokenFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Card identifier (token serial or store name)
    pub fn card(&self) -> &str {
        &self.card
    }

    pub fn slot(&self) -> Option<u64> {
        self.slot
    }

    /// Driver-specific key reference (CKA_ID or store thumbprint)
    pub fn credential_id(&self) -> &[u8] {
        &self.credential_id
    }

    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    pub fn key_algorithm(&self) -> KeyAlgorithm {
        self.key_algorithm
    }

    pub fn flags(&self) -> TokenFlags {
        self.flags
    }

    /// True if this handle refers to the same card and credential as `other`
    pub fn same_credential(&self, other: &TokenHandle) -> bool {
        self.card == other.card && self.credential_id == other.credential_id
    }
}
