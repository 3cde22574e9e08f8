#![no_main]

use docseal_core::Certificate;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let certificate = Certificate::from_der(data.to_vec());

    // Parsing arbitrary DER must fail cleanly, never panic
    if let Ok(info) = certificate.info() {
        let _ = info.is_valid_at(info.not_before);
        let _ = info.expires_within(info.not_before, 8);
    }
    if let Ok(algorithm) = certificate.key_algorithm() {
        assert!(algorithm.signature_len() > 0);
    }

    assert_eq!(certificate.fingerprint().len(), 64);
});
