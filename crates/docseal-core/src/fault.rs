//! Fault cause trees reported by drivers and container operations
//!
//! A [`Fault`] carries a code, a human message, an optional legacy numeric
//! code and zero or more nested causes. Faults are plain data so drivers
//! can build them from whatever their backend reports.

use serde::{Deserialize, Serialize};

/// Native fault codes recognised across drivers and container libraries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FaultCode {
    General,
    CertificateIssuerMissing,
    CertificateRevoked,
    CertificateUnknown,
    OcspResponderMissing,
    OcspCertMissing,
    OcspTimeSlot,
    OcspRequestUnauthorized,
    PinCanceled,
    PinFailed,
    PinIncorrect,
    PinLocked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    pub code: FaultCode,
    pub message: String,
    pub legacy_code: Option<i32>,
    pub causes: Vec<Fault>,
}

impl Fault {
    pub fn new(code: FaultCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            legacy_code: None,
            causes: Vec::new(),
        }
    }

    pub fn general(message: impl Into<String>) -> Self {
        Self::new(FaultCode::General, message)
    }

    pub fn with_legacy_code(mut self, code: i32) -> Self {
        self.legacy_code = Some(code);
        self
    }

    /// Append a nested cause
    pub fn caused_by(mut self, cause: Fault) -> Self {
        self.causes.push(cause);
        self
    }
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for Fault {}
