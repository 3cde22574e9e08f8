//! Container signing and validation
//!
//! [`ContainerFacade`] drives one document container through a signing
//! session on the [`TokenCoordinator`] and hands its signatures to
//! [`SignatureInspector`]. The container format itself lives behind the
//! [`Container`] trait; every fault it raises is classified before it
//! reaches the caller.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use docseal_core::{
    classify, Certificate, ClassifiedError, DigestMethod, ErrorKind, Fault, ProductionPlace,
    SignatureInspector, SignatureRecord, ValidationOutcome,
};

use crate::access_cert::{assess_access_certificate, AccessCertStatus, AccessCertificate};
use crate::coordinator::{SignOutcome, TokenCoordinator};
use crate::selection::SelectionPolicy;

pub const EMPTY_CONTAINER_MESSAGE: &str = "Cannot add signature to empty container";

pub const LEGACY_FORMAT_WARNING: &str =
    "The current file is a DigiDoc container not supported officially any longer.\n\
     We do not recommend you to add signature to this document.\n\
     There is an option to re-sign this document in a new container.";

/// Media type prefixes of container versions that should no longer be signed
const UNSUPPORTED_LEGACY_PREFIXES: &[&str] = &["SK-XML", "DIGIDOC-XML/1.1", "DIGIDOC-XML/1.2"];

/// Document container library
pub trait Container: Send {
    fn document_count(&self) -> usize;

    fn signature_count(&self) -> usize;

    fn signature(&self, index: usize) -> Result<&dyn SignatureRecord, Fault>;

    /// Identifier for the next signature, e.g. `S3`
    fn new_signature_id(&self) -> String;

    /// Build the signed properties for a new signature and return the digest to sign
    fn prepare_signature(
        &mut self,
        id: &str,
        certificate: &Certificate,
        params: &SignatureParams,
        method: DigestMethod,
    ) -> Result<Vec<u8>, Fault>;

    /// Attach the token's signature value to the prepared signature
    fn add_signature(&mut self, id: &str, signature_value: &[u8]) -> Result<(), Fault>;

    /// Remove a prepared signature that will not be completed
    fn discard_signature(&mut self, id: &str) -> Result<(), Fault>;

    fn file_digest(&self, index: usize) -> Result<Vec<u8>, Fault>;
}

/// Signer-supplied properties applied to a new signature
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureParams {
    pub roles: Vec<String>,
    pub production_place: ProductionPlace,
}

impl SignatureParams {
    /// Roles with surrounding whitespace removed, blanks dropped
    pub fn claimed_roles(&self) -> Vec<String> {
        self.roles
            .iter()
            .map(|r| r.trim())
            .filter(|r| !r.is_empty())
            .map(str::to_string)
            .collect()
    }
}

pub struct ContainerFacade<C: Container> {
    container: C,
    coordinator: Arc<TokenCoordinator>,
    access_cert: Option<Arc<dyn AccessCertificate>>,
    digest_method: DigestMethod,
    last_error: Option<ClassifiedError>,
}

impl<C: Container> ContainerFacade<C> {
    pub fn new(container: C, coordinator: Arc<TokenCoordinator>) -> Self {
        Self {
            container,
            coordinator,
            access_cert: None,
            digest_method: DigestMethod::Sha256,
            last_error: None,
        }
    }

    /// Check the server access certificate before each signature
    pub fn with_access_certificate(mut self, access_cert: Arc<dyn AccessCertificate>) -> Self {
        self.access_cert = Some(access_cert);
        self
    }

    pub fn with_digest_method(mut self, method: DigestMethod) -> Self {
        self.digest_method = method;
        self
    }

    pub fn container(&self) -> &C {
        &self.container
    }

    pub fn into_inner(self) -> C {
        self.container
    }

    /// Error from the last failed operation
    pub fn last_error(&self) -> Option<&ClassifiedError> {
        self.last_error.as_ref()
    }

    /// Warning to show before signing a container in an unsupported legacy format
    pub fn legacy_format_warning(&self) -> Option<&'static str> {
        if self.container.signature_count() == 0 {
            return None;
        }
        let media_type = self.container.signature(0).ok()?.media_type();
        UNSUPPORTED_LEGACY_PREFIXES
            .iter()
            .any(|p| media_type.starts_with(p))
            .then_some(LEGACY_FORMAT_WARNING)
    }

    /// Inspectors for every signature in the container
    ///
    /// Stops at the first signature the container cannot return.
    pub fn signatures(&mut self) -> Vec<SignatureInspector<'_>> {
        let mut failure = None;
        let mut records = Vec::new();
        for index in 0..self.container.signature_count() {
            match self.container.signature(index) {
                Ok(record) => records.push(record),
                Err(fault) => {
                    failure = Some(classify(&fault));
                    break;
                }
            }
        }
        if failure.is_some() {
            self.last_error = failure;
        }
        records.into_iter().map(SignatureInspector::new).collect()
    }

    /// Validate every signature in container order
    pub fn validate_all(&mut self) -> Vec<ValidationOutcome> {
        self.signatures()
            .iter_mut()
            .map(|inspector| inspector.validate())
            .collect()
    }

    pub fn file_digest(&mut self, index: usize) -> Result<Vec<u8>, ClassifiedError> {
        self.container
            .file_digest(index)
            .map_err(|fault| self.record(classify(&fault)))
    }

    /// Add a time-mark signature made with the active token
    ///
    /// `retry` is asked before each new PIN attempt after an incorrect PIN,
    /// with the number of attempts made so far; returning false ends the
    /// request with [`ErrorKind::PinIncorrect`]. A canceled PIN prompt
    /// returns [`SignOutcome::Canceled`]. Whenever the request does not end
    /// in a signature, the prepared signature is discarded again and the
    /// container is left as it was.
    pub async fn sign<F>(
        &mut self,
        params: &SignatureParams,
        mut retry: F,
    ) -> Result<SignOutcome, ClassifiedError>
    where
        F: FnMut(u32) -> bool + Send,
    {
        self.last_error = None;

        if self.container.document_count() == 0 {
            return Err(self.record(ClassifiedError::unclassified(EMPTY_CONTAINER_MESSAGE)));
        }

        if let Err(e) = self.ensure_access_certificate().await {
            return Err(self.record(e));
        }

        let method = self.digest_method;
        let coordinator = Arc::clone(&self.coordinator);
        let mut session = coordinator.lock().await;
        let mut prepared: Option<String> = None;

        let result = async {
            let certificate = session
                .select_credential(&SelectionPolicy::signing())
                .await?
                .certificate()
                .clone();

            let id = self.container.new_signature_id();
            let digest = self
                .container
                .prepare_signature(&id, &certificate, params, method)
                .map_err(|fault| classify(&fault))?;
            prepared = Some(id.clone());
            debug!("Prepared signature {} ({} digest)", id, method);

            let mut attempts = 1;
            loop {
                match session.authenticate().await {
                    Ok(()) => break,
                    Err(e) if e.is_retryable() && retry(attempts) => attempts += 1,
                    Err(e) => return Err(e),
                }
            }

            let signature = session.sign(method, &digest).await?;
            Ok::<_, ClassifiedError>((id, signature))
        }
        .await;

        session.unlock().await;

        let (id, signature) = match result {
            Ok(signed) => signed,
            Err(e) => {
                if let Some(id) = prepared {
                    self.discard(&id);
                }
                if e.is_silent() {
                    info!("Signing canceled by user");
                    return Ok(SignOutcome::Canceled);
                }
                return Err(self.record(e));
            }
        };

        if let Err(fault) = self.container.add_signature(&id, &signature) {
            self.discard(&id);
            return Err(self.record(classify(&fault)));
        }

        info!("Signature {} added to container", id);
        Ok(SignOutcome::Signed(signature))
    }

    /// Drop an unfinished signature; a failure here must not mask the error
    /// that ended the request
    fn discard(&mut self, id: &str) {
        match self.container.discard_signature(id) {
            Ok(()) => debug!("Discarded prepared signature {}", id),
            Err(fault) => warn!("Failed to discard prepared signature {}: {}", id, fault),
        }
    }

    /// Make sure a usable server access certificate is installed
    async fn ensure_access_certificate(&self) -> Result<(), ClassifiedError> {
        let Some(access_cert) = &self.access_cert else {
            return Ok(());
        };

        let installed = access_cert.installed().await.unwrap_or_else(|fault| {
            warn!("Failed to read access certificate: {}", classify(&fault));
            None
        });

        let status = assess_access_certificate(installed.as_ref(), Utc::now());
        if status == AccessCertStatus::Valid {
            return Ok(());
        }

        info!("Server access certificate is {:?}, downloading", status);
        let fetched = match self.coordinator.client_credential().await {
            Some(credential) => access_cert.fetch(&credential).await,
            None => Err(Fault::general("No client authentication certificate present")),
        };
        match fetched {
            Ok(cert) => {
                info!("Installed access certificate {}", cert.fingerprint());
                Ok(())
            }
            Err(fault) if status.is_usable() => {
                warn!(
                    "Access certificate renewal failed, using the current one: {}",
                    classify(&fault)
                );
                Ok(())
            }
            Err(fault) => {
                let cause = classify(&fault);
                let mut error = ClassifiedError::from_kind(ErrorKind::OcspUnauthorized);
                error.causes.extend(cause.causes);
                error.legacy_code = cause.legacy_code;
                Err(error)
            }
        }
    }

    fn record(&mut self, error: ClassifiedError) -> ClassifiedError {
        warn!("Container operation failed: {}", error);
        self.last_error = Some(error.clone());
        error
    }
}
