//! Integration tests for container signing and validation

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use docseal_core::{
    Certificate, DigestMethod, ErrorKind, Fault, FaultCode, KeyAlgorithm, OcspReference,
    OcspStatus, ProductionPlace, SignatureRecord, TokenFlags, TokenHandle, ValidationStatus,
};
use docseal_token::facade::{EMPTY_CONTAINER_MESSAGE, LEGACY_FORMAT_WARNING};
use docseal_token::{
    AccessCertificate, AuthResult, Container, ContainerFacade, CoordinatorConfig, DriverVariant,
    SignOutcome, SignatureParams, TokenCoordinator, TokenDriver,
};

const SIGNING: &[u8] = include_bytes!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/../docseal-core/tests/fixtures/signing.der"
));
const AUTHENTICATION: &[u8] = include_bytes!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/../docseal-core/tests/fixtures/authentication.der"
));

const TM: &str = "signature/bdoc-1.0/TM";
const BES: &str = "signature/bdoc-1.0/BES";

// ============================================================================
// Fakes
// ============================================================================

#[derive(Default)]
struct FakeDriver {
    auth_script: Mutex<VecDeque<AuthResult>>,
    auths: AtomicUsize,
    sign_fault: Mutex<Option<Fault>>,
    signing_only: AtomicBool,
}

#[async_trait]
impl TokenDriver for FakeDriver {
    fn variant(&self) -> DriverVariant {
        DriverVariant::Pkcs11
    }

    async fn detect(&self) -> Result<Vec<TokenHandle>, Fault> {
        let mut handles = vec![TokenHandle::new(
            "AA0000001",
            vec![0x45],
            Certificate::from_der(SIGNING.to_vec()),
            KeyAlgorithm::Ec { field_bits: 256 },
            TokenFlags::signing(),
        )];
        if !self.signing_only.load(Ordering::SeqCst) {
            handles.push(TokenHandle::new(
                "AA0000001",
                vec![0x46],
                Certificate::from_der(AUTHENTICATION.to_vec()),
                KeyAlgorithm::Ec { field_bits: 384 },
                TokenFlags::signing(),
            ));
        }
        Ok(handles)
    }

    async fn authenticate(&self, _handle: &TokenHandle, _attempt: u32) -> AuthResult {
        self.auths.fetch_add(1, Ordering::SeqCst);
        self.auth_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(AuthResult::Authenticated)
    }

    async fn raw_sign(
        &self,
        handle: &TokenHandle,
        _method: DigestMethod,
        _digest: &[u8],
    ) -> Result<Vec<u8>, Fault> {
        if let Some(fault) = self.sign_fault.lock().unwrap().clone() {
            return Err(fault);
        }
        Ok(vec![0x5A; handle.key_algorithm().signature_len()])
    }
}

struct FakeRecord {
    media_type: String,
    offline: Result<(), Fault>,
    online: Result<OcspStatus, Fault>,
}

impl FakeRecord {
    fn new(media_type: &str) -> Self {
        Self {
            media_type: media_type.to_string(),
            offline: Ok(()),
            online: Ok(OcspStatus::Good),
        }
    }
}

impl SignatureRecord for FakeRecord {
    fn media_type(&self) -> String {
        self.media_type.clone()
    }

    fn signing_certificate(&self) -> Result<Certificate, Fault> {
        Ok(Certificate::from_der(SIGNING.to_vec()))
    }

    fn ocsp_certificate(&self) -> Result<Option<Certificate>, Fault> {
        Ok(None)
    }

    fn produced_at(&self) -> Result<Option<chrono::DateTime<chrono::Utc>>, Fault> {
        Ok(None)
    }

    fn signing_time(&self) -> Result<Option<chrono::DateTime<chrono::Utc>>, Fault> {
        Ok(None)
    }

    fn ocsp_reference(&self) -> Result<Option<OcspReference>, Fault> {
        Ok(None)
    }

    fn claimed_roles(&self) -> Result<Vec<String>, Fault> {
        Ok(Vec::new())
    }

    fn production_place(&self) -> Result<ProductionPlace, Fault> {
        Ok(ProductionPlace::default())
    }

    fn reference_digest_methods(&self) -> Result<Vec<String>, Fault> {
        Ok(vec![DigestMethod::Sha256.uri().to_string()])
    }

    fn signature_method(&self) -> Result<String, Fault> {
        Ok("http://www.w3.org/2001/04/xmldsig-more#ecdsa-sha256".to_string())
    }

    fn validate_offline(&self) -> Result<(), Fault> {
        self.offline.clone()
    }

    fn validate_online(&self) -> Result<OcspStatus, Fault> {
        self.online.clone()
    }
}

struct Prepared {
    id: String,
    certificate: Certificate,
    params: SignatureParams,
    method: DigestMethod,
}

#[derive(Default)]
struct FakeContainer {
    documents: usize,
    records: Vec<FakeRecord>,
    /// Prepared signatures still waiting for a signature value
    prepared: Vec<Prepared>,
    signed: Vec<Prepared>,
    added: Vec<(String, Vec<u8>)>,
    discarded: Vec<String>,
    prepare_fault: Option<Fault>,
    add_fault: Option<Fault>,
    discard_fault: Option<Fault>,
}

impl FakeContainer {
    fn with_documents(documents: usize) -> Self {
        Self {
            documents,
            ..Self::default()
        }
    }
}

impl Container for FakeContainer {
    fn document_count(&self) -> usize {
        self.documents
    }

    fn signature_count(&self) -> usize {
        self.records.len()
    }

    fn signature(&self, index: usize) -> Result<&dyn SignatureRecord, Fault> {
        self.records
            .get(index)
            .map(|r| r as &dyn SignatureRecord)
            .ok_or_else(|| Fault::general(format!("No signature at index {}", index)))
    }

    fn new_signature_id(&self) -> String {
        format!("S{}", self.records.len())
    }

    fn prepare_signature(
        &mut self,
        id: &str,
        certificate: &Certificate,
        params: &SignatureParams,
        method: DigestMethod,
    ) -> Result<Vec<u8>, Fault> {
        if let Some(fault) = &self.prepare_fault {
            return Err(fault.clone());
        }
        self.prepared.push(Prepared {
            id: id.to_string(),
            certificate: certificate.clone(),
            params: params.clone(),
            method,
        });
        Ok(vec![0x22; method.digest_len()])
    }

    fn add_signature(&mut self, id: &str, signature_value: &[u8]) -> Result<(), Fault> {
        if let Some(fault) = &self.add_fault {
            return Err(fault.clone());
        }
        let index = self
            .prepared
            .iter()
            .position(|p| p.id == id)
            .ok_or_else(|| Fault::general(format!("Signature {} was not prepared", id)))?;
        self.signed.push(self.prepared.remove(index));
        self.added.push((id.to_string(), signature_value.to_vec()));
        self.records.push(FakeRecord::new(TM));
        Ok(())
    }

    fn discard_signature(&mut self, id: &str) -> Result<(), Fault> {
        self.discarded.push(id.to_string());
        if let Some(fault) = &self.discard_fault {
            return Err(fault.clone());
        }
        self.prepared.retain(|p| p.id != id);
        Ok(())
    }

    fn file_digest(&self, index: usize) -> Result<Vec<u8>, Fault> {
        if index < self.documents {
            Ok(vec![index as u8; 32])
        } else {
            Err(Fault::general(format!("No document at index {}", index)).with_legacy_code(10))
        }
    }
}

struct FakeAccessCert {
    installed: Option<Certificate>,
    download: Result<Certificate, Fault>,
    fetches: AtomicUsize,
    /// Client certificate each download authenticated with
    clients: Mutex<Vec<Vec<u8>>>,
}

impl FakeAccessCert {
    fn new(installed: Option<Certificate>, download: Result<Certificate, Fault>) -> Arc<Self> {
        Arc::new(Self {
            installed,
            download,
            fetches: AtomicUsize::new(0),
            clients: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl AccessCertificate for FakeAccessCert {
    async fn installed(&self) -> Result<Option<Certificate>, Fault> {
        Ok(self.installed.clone())
    }

    async fn fetch(&self, credential: &TokenHandle) -> Result<Certificate, Fault> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.clients
            .lock()
            .unwrap()
            .push(credential.certificate().as_der().to_vec());
        self.download.clone()
    }
}

fn incorrect() -> AuthResult {
    AuthResult::Incorrect {
        flags: TokenFlags {
            pin_count_low: true,
            ..TokenFlags::signing()
        },
    }
}

fn locked() -> AuthResult {
    AuthResult::Incorrect {
        flags: TokenFlags {
            pin_locked: true,
            ..TokenFlags::signing()
        },
    }
}

async fn setup(
    container: FakeContainer,
    script: Vec<AuthResult>,
) -> (ContainerFacade<FakeContainer>, Arc<FakeDriver>, Arc<TokenCoordinator>) {
    let driver = Arc::new(FakeDriver::default());
    *driver.auth_script.lock().unwrap() = script.into();
    let coordinator = Arc::new(TokenCoordinator::new(
        driver.clone(),
        CoordinatorConfig::default(),
    ));
    coordinator.refresh().await;
    let facade = ContainerFacade::new(container, coordinator.clone());
    (facade, driver, coordinator)
}

async fn assert_lock_free(coordinator: &TokenCoordinator) {
    tokio::time::timeout(Duration::from_secs(1), coordinator.lock())
        .await
        .expect("token lock was not released");
}

// ============================================================================
// Signing
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_empty_container_is_refused() {
    let (mut facade, driver, _) = setup(FakeContainer::default(), Vec::new()).await;

    let err = facade
        .sign(&SignatureParams::default(), |_| true)
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), EMPTY_CONTAINER_MESSAGE);
    assert_eq!(facade.last_error(), Some(&err));
    assert_eq!(driver.auths.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_sign_adds_signature_with_params() {
    let (mut facade, _, coordinator) = setup(FakeContainer::with_documents(2), Vec::new()).await;
    let params = SignatureParams {
        roles: vec!["  Manager ".to_string(), "".to_string()],
        production_place: ProductionPlace {
            city: "Tallinn".to_string(),
            country: "Estonia".to_string(),
            ..ProductionPlace::default()
        },
    };

    let outcome = facade.sign(&params, |_| true).await.unwrap();
    let signature = match outcome {
        SignOutcome::Signed(signature) => signature,
        SignOutcome::Canceled => panic!("unexpected cancel"),
    };
    assert_eq!(signature.len(), 64);

    let container = facade.container();
    assert!(container.prepared.is_empty());
    assert!(container.discarded.is_empty());
    assert_eq!(container.signed.len(), 1);
    let prepared = &container.signed[0];
    assert_eq!(prepared.id, "S0");
    assert_eq!(prepared.certificate.as_der(), SIGNING);
    assert_eq!(prepared.method, DigestMethod::Sha256);
    assert_eq!(prepared.params.claimed_roles(), vec!["Manager".to_string()]);
    assert_eq!(prepared.params.production_place.city, "Tallinn");
    assert_eq!(container.added, vec![("S0".to_string(), signature)]);
    assert!(facade.last_error().is_none());
    assert_lock_free(&coordinator).await;
}

#[tokio::test(start_paused = true)]
async fn test_incorrect_pin_asks_before_retrying() {
    let (mut facade, driver, _) = setup(
        FakeContainer::with_documents(1),
        vec![incorrect(), incorrect()],
    )
    .await;

    let mut asked = Vec::new();
    let outcome = facade
        .sign(&SignatureParams::default(), |attempt| {
            asked.push(attempt);
            true
        })
        .await
        .unwrap();

    assert!(matches!(outcome, SignOutcome::Signed(_)));
    assert_eq!(asked, vec![1, 2]);
    assert_eq!(driver.auths.load(Ordering::SeqCst), 3);
    assert_eq!(facade.container().added.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_declined_retry_reports_incorrect_pin() {
    let (mut facade, driver, coordinator) =
        setup(FakeContainer::with_documents(1), vec![incorrect()]).await;

    let err = facade
        .sign(&SignatureParams::default(), |_| false)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::PinIncorrect);
    assert_eq!(err.to_string(), "PIN Incorrect");
    assert_eq!(facade.last_error().map(|e| e.kind), Some(ErrorKind::PinIncorrect));
    assert_eq!(driver.auths.load(Ordering::SeqCst), 1);
    assert!(facade.container().added.is_empty());
    assert!(facade.container().prepared.is_empty());
    assert_eq!(facade.container().discarded, vec!["S0".to_string()]);
    assert_lock_free(&coordinator).await;
}

#[tokio::test(start_paused = true)]
async fn test_locked_pin_is_terminal() {
    let (mut facade, driver, _) = setup(
        FakeContainer::with_documents(1),
        vec![incorrect(), locked()],
    )
    .await;

    let mut asked = 0;
    let err = facade
        .sign(&SignatureParams::default(), |_| {
            asked += 1;
            true
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::PinLocked);
    assert_eq!(asked, 1);
    assert_eq!(driver.auths.load(Ordering::SeqCst), 2);
    assert!(facade.container().added.is_empty());
    assert!(facade.container().prepared.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_leaves_container_untouched() {
    let (mut facade, _, coordinator) =
        setup(FakeContainer::with_documents(1), vec![AuthResult::Canceled]).await;

    let outcome = facade
        .sign(&SignatureParams::default(), |_| true)
        .await
        .unwrap();
    assert_eq!(outcome, SignOutcome::Canceled);
    assert!(facade.container().added.is_empty());
    assert!(facade.container().prepared.is_empty());
    assert_eq!(facade.container().discarded, vec!["S0".to_string()]);
    assert!(facade.last_error().is_none());
    assert_lock_free(&coordinator).await;
}

#[tokio::test(start_paused = true)]
async fn test_token_fault_discards_prepared_signature() {
    let (mut facade, driver, coordinator) = setup(FakeContainer::with_documents(1), Vec::new()).await;
    *driver.sign_fault.lock().unwrap() = Some(Fault::new(FaultCode::PinFailed, "C_Sign failed"));

    let err = facade
        .sign(&SignatureParams::default(), |_| true)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::PinFailed);
    assert!(facade.container().prepared.is_empty());
    assert!(facade.container().added.is_empty());
    assert_eq!(facade.container().signature_count(), 0);
    assert_lock_free(&coordinator).await;
}

#[tokio::test(start_paused = true)]
async fn test_rejected_signature_value_is_discarded() {
    let container = FakeContainer {
        add_fault: Some(Fault::new(FaultCode::CertificateRevoked, "Certificate status: revoked")),
        ..FakeContainer::with_documents(1)
    };
    let (mut facade, _, _) = setup(container, Vec::new()).await;

    let err = facade
        .sign(&SignatureParams::default(), |_| true)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::CertificateRevoked);
    assert!(facade.container().prepared.is_empty());
    assert_eq!(facade.container().discarded, vec!["S0".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_discard_failure_keeps_first_error() {
    let container = FakeContainer {
        discard_fault: Some(Fault::general("Container is read-only")),
        ..FakeContainer::with_documents(1)
    };
    let (mut facade, _, coordinator) = setup(container, vec![locked()]).await;

    let err = facade
        .sign(&SignatureParams::default(), |_| true)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::PinLocked);
    assert_eq!(facade.last_error().map(|e| e.kind), Some(ErrorKind::PinLocked));
    assert_eq!(facade.container().discarded, vec!["S0".to_string()]);
    assert_lock_free(&coordinator).await;
}

#[tokio::test(start_paused = true)]
async fn test_container_faults_are_classified() {
    let container = FakeContainer {
        prepare_fault: Some(
            Fault::general("Failed to sign container")
                .caused_by(Fault::new(FaultCode::OcspTimeSlot, "OCSP response not in valid time slot")),
        ),
        ..FakeContainer::with_documents(1)
    };
    let (mut facade, driver, coordinator) = setup(container, Vec::new()).await;

    let err = facade
        .sign(&SignatureParams::default(), |_| true)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::OcspTimeSlotInvalid);
    assert_eq!(err.to_string(), "Check your computer time");
    // the PIN is never asked for a signature that cannot be built
    assert_eq!(driver.auths.load(Ordering::SeqCst), 0);
    assert_lock_free(&coordinator).await;

    let err = facade.file_digest(5).unwrap_err();
    assert_eq!(err.legacy_code, Some(10));
    assert_eq!(facade.last_error(), Some(&err));
    assert_eq!(facade.file_digest(0).unwrap(), vec![0u8; 32]);
}

// ============================================================================
// Server access certificate
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_missing_access_certificate_blocks_signing() {
    let (facade, driver, _) = setup(FakeContainer::with_documents(1), Vec::new()).await;
    let access = FakeAccessCert::new(None, Err(Fault::general("Failed to connect to host")));
    let mut facade = facade.with_access_certificate(access.clone());

    let err = facade
        .sign(&SignatureParams::default(), |_| true)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::OcspUnauthorized);
    assert_eq!(err.to_string(), "Server access certificate is required");
    assert!(err.causes.iter().any(|c| c == "Failed to connect to host"));
    assert_eq!(access.fetches.load(Ordering::SeqCst), 1);
    assert_eq!(driver.auths.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_access_certificate_download_then_sign() {
    let (facade, _, _) = setup(FakeContainer::with_documents(1), Vec::new()).await;
    let access = FakeAccessCert::new(None, Ok(Certificate::from_der(AUTHENTICATION.to_vec())));
    let mut facade = facade.with_access_certificate(access.clone());

    let outcome = facade
        .sign(&SignatureParams::default(), |_| true)
        .await
        .unwrap();
    assert!(matches!(outcome, SignOutcome::Signed(_)));
    assert_eq!(access.fetches.load(Ordering::SeqCst), 1);
    assert_eq!(*access.clients.lock().unwrap(), vec![AUTHENTICATION.to_vec()]);
}

#[tokio::test(start_paused = true)]
async fn test_access_certificate_download_needs_client_credential() {
    let (facade, driver, coordinator) = setup(FakeContainer::with_documents(1), Vec::new()).await;
    driver.signing_only.store(true, Ordering::SeqCst);
    coordinator.refresh().await;
    let access = FakeAccessCert::new(None, Ok(Certificate::from_der(AUTHENTICATION.to_vec())));
    let mut facade = facade.with_access_certificate(access.clone());

    let err = facade
        .sign(&SignatureParams::default(), |_| true)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::OcspUnauthorized);
    assert_eq!(access.fetches.load(Ordering::SeqCst), 0);
    assert_eq!(driver.auths.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_valid_access_certificate_is_not_renewed() {
    let (facade, _, _) = setup(FakeContainer::with_documents(1), Vec::new()).await;
    let access = FakeAccessCert::new(
        Some(Certificate::from_der(AUTHENTICATION.to_vec())),
        Err(Fault::general("unreachable")),
    );
    let mut facade = facade.with_access_certificate(access.clone());

    let outcome = facade
        .sign(&SignatureParams::default(), |_| true)
        .await
        .unwrap();
    assert!(matches!(outcome, SignOutcome::Signed(_)));
    assert_eq!(access.fetches.load(Ordering::SeqCst), 0);
}

// ============================================================================
// Inspection
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_legacy_format_warning() {
    let cases = [
        ("SK-XML", true),
        ("DIGIDOC-XML/1.1", true),
        ("DIGIDOC-XML/1.2", true),
        ("DIGIDOC-XML/1.3", false),
        (TM, false),
    ];
    for (media_type, warns) in cases {
        let container = FakeContainer {
            records: vec![FakeRecord::new(media_type)],
            ..FakeContainer::with_documents(1)
        };
        let (facade, _, _) = setup(container, Vec::new()).await;
        let expected = warns.then_some(LEGACY_FORMAT_WARNING);
        assert_eq!(facade.legacy_format_warning(), expected, "{}", media_type);
    }

    let (facade, _, _) = setup(FakeContainer::with_documents(1), Vec::new()).await;
    assert!(facade.legacy_format_warning().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_validate_all_in_container_order() {
    let revoked = FakeRecord {
        online: Ok(OcspStatus::Revoked),
        ..FakeRecord::new(TM)
    };
    let broken = FakeRecord {
        offline: Err(Fault::general("Signature validation failed")
            .caused_by(Fault::new(FaultCode::CertificateIssuerMissing, "Issuer not found"))),
        ..FakeRecord::new(TM)
    };
    let container = FakeContainer {
        records: vec![FakeRecord::new(TM), FakeRecord::new(BES), revoked, broken],
        ..FakeContainer::with_documents(1)
    };
    let (mut facade, _, _) = setup(container, Vec::new()).await;

    let outcomes = facade.validate_all();
    let statuses: Vec<_> = outcomes.iter().map(|o| o.status).collect();
    assert_eq!(
        statuses,
        vec![
            ValidationStatus::Valid,
            ValidationStatus::Invalid,
            ValidationStatus::Invalid,
            ValidationStatus::Unknown,
        ]
    );
    assert_eq!(
        outcomes[2].error.as_ref().map(|e| e.kind),
        Some(ErrorKind::CertificateRevoked)
    );

    let inspectors = facade.signatures();
    assert_eq!(inspectors.len(), 4);
    assert!(!inspectors[0].weak_digest_method());
}
