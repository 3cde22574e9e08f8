//! Flattening of fault cause trees into a stable error taxonomy
//!
//! The walk is depth-first with each fault visited before its causes, in the
//! order the causes were attached. Classification picks the first fault in
//! that order whose code maps to a recognised [`ErrorKind`]; faults deeper in
//! the tree are never skipped in favour of a later sibling.
//!
//! The walk is iterative and bounded by [`MAX_CAUSE_DEPTH`] and
//! [`MAX_VISITED_CAUSES`], so classification is total on any input. When a
//! bound is hit the result is still returned, with `truncated` set.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::fault::{Fault, FaultCode};

/// Deepest nesting level whose faults are visited (root is depth 0)
pub const MAX_CAUSE_DEPTH: usize = 32;

/// Maximum number of faults visited in one walk
pub const MAX_VISITED_CAUSES: usize = 512;

/// Classified failure kinds surfaced to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    CertificateRevoked,
    CertificateUnknown,
    OcspTimeSlotInvalid,
    OcspUnauthorized,
    PinCanceled,
    PinFailed,
    PinIncorrect,
    PinLocked,
    Unclassified,
}

impl ErrorKind {
    /// Map a native fault code to its kind, if it is one of the recognised codes
    pub fn from_code(code: FaultCode) -> Option<Self> {
        match code {
            FaultCode::CertificateRevoked => Some(ErrorKind::CertificateRevoked),
            FaultCode::CertificateUnknown => Some(ErrorKind::CertificateUnknown),
            FaultCode::OcspTimeSlot => Some(ErrorKind::OcspTimeSlotInvalid),
            FaultCode::OcspRequestUnauthorized => Some(ErrorKind::OcspUnauthorized),
            FaultCode::PinCanceled => Some(ErrorKind::PinCanceled),
            FaultCode::PinFailed => Some(ErrorKind::PinFailed),
            FaultCode::PinIncorrect => Some(ErrorKind::PinIncorrect),
            FaultCode::PinLocked => Some(ErrorKind::PinLocked),
            FaultCode::General
            | FaultCode::CertificateIssuerMissing
            | FaultCode::OcspResponderMissing
            | FaultCode::OcspCertMissing => None,
        }
    }

    /// Fixed user-facing message; empty for kinds without one
    pub fn message(&self) -> &'static str {
        match self {
            ErrorKind::CertificateRevoked => "Certificate status revoked",
            ErrorKind::CertificateUnknown => "Certificate status unknown",
            ErrorKind::OcspTimeSlotInvalid => "Check your computer time",
            ErrorKind::OcspUnauthorized => "Server access certificate is required",
            ErrorKind::PinCanceled => "",
            ErrorKind::PinFailed => "PIN Login failed",
            ErrorKind::PinIncorrect => "PIN Incorrect",
            ErrorKind::PinLocked => "PIN Locked",
            ErrorKind::Unclassified => "",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// A flattened, classified failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{}", self.summary())]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    /// Non-empty cause messages in walk order
    pub causes: Vec<String>,
    /// First legacy numeric code found in walk order, kept opaque
    pub legacy_code: Option<i32>,
    /// True when the walk stopped at a depth or visit bound
    pub truncated: bool,
}

impl ClassifiedError {
    /// Error of a known kind with its fixed message as the only cause
    pub fn from_kind(kind: ErrorKind) -> Self {
        let causes = match kind.message() {
            "" => Vec::new(),
            message => vec![message.to_string()],
        };
        Self {
            kind,
            causes,
            legacy_code: None,
            truncated: false,
        }
    }

    /// Unclassified error with a single message
    pub fn unclassified(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Unclassified,
            causes: vec![message.into()],
            legacy_code: None,
            truncated: false,
        }
    }

    /// User-facing message: the kind's fixed text, or every cause for unclassified errors
    pub fn summary(&self) -> String {
        match self.kind {
            ErrorKind::Unclassified => self.causes.join("\n"),
            kind => kind.message().to_string(),
        }
    }

    /// Deliberate user aborts are not reported
    pub fn is_silent(&self) -> bool {
        self.kind == ErrorKind::PinCanceled
    }

    /// The same request may be repeated
    pub fn is_retryable(&self) -> bool {
        self.kind == ErrorKind::PinIncorrect
    }
}

impl From<Fault> for ClassifiedError {
    fn from(fault: Fault) -> Self {
        classify(&fault)
    }
}

impl From<&Fault> for ClassifiedError {
    fn from(fault: &Fault) -> Self {
        classify(fault)
    }
}

/// Bounded depth-first walk over a cause tree, yielding each fault with its depth
pub struct CauseWalk<'a> {
    stack: Vec<(&'a Fault, usize)>,
    visited: usize,
    truncated: bool,
}

impl<'a> CauseWalk<'a> {
    pub fn new(root: &'a Fault) -> Self {
        Self {
            stack: vec![(root, 0)],
            visited: 0,
            truncated: false,
        }
    }

    /// True once the walk has skipped part of the tree
    pub fn truncated(&self) -> bool {
        self.truncated
    }
}

impl<'a> Iterator for CauseWalk<'a> {
    type Item = (&'a Fault, usize);

    fn next(&mut self) -> Option<Self::Item> {
        let (fault, depth) = self.stack.pop()?;

        if self.visited >= MAX_VISITED_CAUSES {
            self.truncated = true;
            self.stack.clear();
            return None;
        }
        self.visited += 1;

        if depth < MAX_CAUSE_DEPTH {
            self.stack
                .extend(fault.causes.iter().rev().map(|cause| (cause, depth + 1)));
        } else if !fault.causes.is_empty() {
            self.truncated = true;
        }

        Some((fault, depth))
    }
}

/// Flatten a cause tree into a [`ClassifiedError`]
pub fn classify(root: &Fault) -> ClassifiedError {
    let mut walk = CauseWalk::new(root);
    let mut kind = None;
    let mut causes = Vec::new();
    let mut legacy_code = None;

    for (fault, _) in walk.by_ref() {
        if kind.is_none() {
            kind = ErrorKind::from_code(fault.code);
        }
        if legacy_code.is_none() {
            legacy_code = fault.legacy_code;
        }
        if !fault.message.is_empty() {
            causes.push(fault.message.clone());
        }
    }

    let truncated = walk.truncated();
    if truncated {
        debug!("Cause tree truncated after {} faults", causes.len());
    }

    ClassifiedError {
        kind: kind.unwrap_or(ErrorKind::Unclassified),
        causes,
        legacy_code,
        truncated,
    }
}

/// First non-general native code in walk order
pub fn native_code(root: &Fault) -> FaultCode {
    CauseWalk::new(root)
        .map(|(fault, _)| fault.code)
        .find(|code| *code != FaultCode::General)
        .unwrap_or(FaultCode::General)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_revoked_nested_in_wrapper() {
        let fault = Fault::general("Failed to validate signature")
            .caused_by(Fault::new(FaultCode::CertificateRevoked, "OCSP status revoked"));

        let err = classify(&fault);
        assert_eq!(err.kind, ErrorKind::CertificateRevoked);
        assert_eq!(err.to_string(), "Certificate status revoked");
        assert_eq!(
            err.causes,
            vec!["Failed to validate signature", "OCSP status revoked"]
        );
        assert!(!err.truncated);
    }

    #[test]
    fn test_self_before_children_and_depth_first() {
        // root -> [a -> [a1(PinLocked)], b(PinIncorrect)]
        let fault = Fault::general("root")
            .caused_by(
                Fault::general("a").caused_by(Fault::new(FaultCode::PinLocked, "a1")),
            )
            .caused_by(Fault::new(FaultCode::PinIncorrect, "b"));

        let err = classify(&fault);
        assert_eq!(err.kind, ErrorKind::PinLocked);
        assert_eq!(err.causes, vec!["root", "a", "a1", "b"]);
    }

    #[test]
    fn test_root_code_wins_over_children() {
        let fault = Fault::new(FaultCode::PinFailed, "login")
            .caused_by(Fault::new(FaultCode::PinIncorrect, "inner"));
        assert_eq!(classify(&fault).kind, ErrorKind::PinFailed);
    }

    #[test]
    fn test_unclassified_joins_messages() {
        let fault = Fault::general("Failed to sign container")
            .caused_by(Fault::general(""))
            .caused_by(Fault::general("Driver returned 0x30"));

        let err = classify(&fault);
        assert_eq!(err.kind, ErrorKind::Unclassified);
        assert_eq!(err.to_string(), "Failed to sign container\nDriver returned 0x30");
    }

    #[test]
    fn test_legacy_code_preserved_when_unclassified() {
        let fault = Fault::general("outer")
            .caused_by(Fault::general("inner").with_legacy_code(70))
            .caused_by(Fault::general("later").with_legacy_code(71));

        let err = classify(&fault);
        assert_eq!(err.kind, ErrorKind::Unclassified);
        assert_eq!(err.legacy_code, Some(70));
    }

    #[test]
    fn test_unknown_set_codes_are_not_classified() {
        let fault = Fault::new(FaultCode::CertificateIssuerMissing, "issuer missing");
        assert_eq!(classify(&fault).kind, ErrorKind::Unclassified);
        assert_eq!(native_code(&fault), FaultCode::CertificateIssuerMissing);
    }

    #[test]
    fn test_native_code_skips_general() {
        let fault = Fault::general("outer")
            .caused_by(Fault::general("inner").caused_by(Fault::new(FaultCode::OcspCertMissing, "x")));
        assert_eq!(native_code(&fault), FaultCode::OcspCertMissing);
        assert_eq!(native_code(&Fault::general("plain")), FaultCode::General);
    }

    #[test]
    fn test_depth_bound_truncates() {
        let mut fault = Fault::new(FaultCode::PinLocked, "bottom");
        for i in 0..(MAX_CAUSE_DEPTH + 10) {
            fault = Fault::general(format!("level {}", i)).caused_by(fault);
        }

        let err = classify(&fault);
        assert!(err.truncated);
        assert_eq!(err.kind, ErrorKind::Unclassified);
        assert_eq!(err.causes.len(), MAX_CAUSE_DEPTH + 1);
    }

    #[test]
    fn test_visit_bound_truncates() {
        let mut fault = Fault::general("wide");
        for i in 0..(MAX_VISITED_CAUSES + 5) {
            fault = fault.caused_by(Fault::general(format!("leaf {}", i)));
        }

        let err = classify(&fault);
        assert!(err.truncated);
        assert_eq!(err.causes.len(), MAX_VISITED_CAUSES);
    }

    #[test]
    fn test_silent_and_retryable() {
        assert!(ClassifiedError::from_kind(ErrorKind::PinCanceled).is_silent());
        assert!(ClassifiedError::from_kind(ErrorKind::PinCanceled).causes.is_empty());
        assert!(ClassifiedError::from_kind(ErrorKind::PinIncorrect).is_retryable());
        assert!(!ClassifiedError::from_kind(ErrorKind::PinLocked).is_retryable());
        assert!(!ClassifiedError::from_kind(ErrorKind::PinLocked).is_silent());
    }
}
