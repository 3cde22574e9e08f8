#![no_main]

use arbitrary::{Arbitrary, Unstructured};
use docseal_core::{classify, native_code, ErrorKind, Fault, FaultCode};
use libfuzzer_sys::fuzz_target;

const CODES: [FaultCode; 12] = [
    FaultCode::General,
    FaultCode::CertificateIssuerMissing,
    FaultCode::CertificateRevoked,
    FaultCode::CertificateUnknown,
    FaultCode::OcspResponderMissing,
    FaultCode::OcspCertMissing,
    FaultCode::OcspTimeSlot,
    FaultCode::OcspRequestUnauthorized,
    FaultCode::PinCanceled,
    FaultCode::PinFailed,
    FaultCode::PinIncorrect,
    FaultCode::PinLocked,
];

/// Build a cause tree whose shape is driven by the input
fn fault(u: &mut Unstructured<'_>, depth: usize) -> arbitrary::Result<Fault> {
    let code = CODES[usize::from(u8::arbitrary(u)?) % CODES.len()];
    let message = String::arbitrary(u)?;
    let mut fault = Fault::new(code, message);
    if bool::arbitrary(u)? {
        fault = fault.with_legacy_code(i32::arbitrary(u)?);
    }

    // deep chains past the walk bound are the interesting case
    let children = if depth < 64 { u8::arbitrary(u)? % 4 } else { 0 };
    for _ in 0..children {
        fault = fault.caused_by(self::fault(u, depth + 1)?);
    }
    Ok(fault)
}

fuzz_target!(|data: &[u8]| {
    let mut u = Unstructured::new(data);
    let Ok(root) = fault(&mut u, 0) else {
        return;
    };

    // Classification is total and deterministic
    let first = classify(&root);
    assert_eq!(first, classify(&root));

    if first.kind == ErrorKind::Unclassified {
        assert_eq!(first.to_string(), first.causes.join("\n"));
    }
    if native_code(&root) == FaultCode::General {
        assert_eq!(first.kind, ErrorKind::Unclassified);
    }
});
