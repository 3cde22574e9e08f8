//! PKCS#11 token driver
//!
//! Works with any PKCS#11 module, including:
//! - OpenSC for national ID cards
//! - Vendor smart card middleware
//! - SoftHSM 2 (for development/testing)
//!
//! Every token with a certificate object is reported. The certificate's
//! CKA_ID links it to the private key used for signing. RSA keys sign a
//! PKCS#1 DigestInfo with CKM_RSA_PKCS; EC keys sign the bare digest with
//! CKM_ECDSA.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use cryptoki::context::{CInitializeArgs, Pkcs11};
use cryptoki::error::{Error as CryptokiError, RvError};
use cryptoki::mechanism::Mechanism;
use cryptoki::object::{Attribute, AttributeType, ObjectClass, ObjectHandle};
use cryptoki::session::{Session, UserType};
use cryptoki::slot::{Slot, TokenInfo};
use cryptoki::types::AuthPin;
use tracing::{debug, info, warn};

use docseal_core::{Certificate, DigestMethod, Fault, FaultCode, TokenFlags, TokenHandle};

use super::{AuthResult, DriverVariant, TokenDriver};
use crate::error::{Result, TokenError};
use crate::pin::{PinPrompt, PinRequest, PinResponse};

/// Logged-in session for one credential
struct ActiveSession {
    card: String,
    credential_id: Vec<u8>,
    session: Session,
}

impl ActiveSession {
    fn serves(&self, handle: &TokenHandle) -> bool {
        self.card == handle.card() && self.credential_id == handle.credential_id()
    }
}

pub struct Pkcs11Driver {
    ctx: Arc<Pkcs11>,
    prompt: Arc<dyn PinPrompt>,
    active: Mutex<Option<ActiveSession>>,
}

impl Pkcs11Driver {
    /// Load and initialize a PKCS#11 module
    pub fn open(module_path: &Path, prompt: Arc<dyn PinPrompt>) -> Result<Self> {
        info!("Loading PKCS#11 module {}", module_path.display());

        let ctx = Pkcs11::new(module_path).map_err(|e| {
            TokenError::DriverUnavailable(format!("Failed to load PKCS#11 module: {}", e))
        })?;

        ctx.initialize(CInitializeArgs::OsThreads).map_err(|e| {
            TokenError::DriverUnavailable(format!("Failed to initialize PKCS#11: {}", e))
        })?;

        Ok(Self {
            ctx: Arc::new(ctx),
            prompt,
            active: Mutex::new(None),
        })
    }

    fn find_slot(&self, handle: &TokenHandle) -> std::result::Result<Slot, Fault> {
        let slots = self
            .ctx
            .get_slots_with_token()
            .map_err(|e| driver_fault("Failed to list token slots", e))?;

        slots
            .into_iter()
            .find(|slot| match handle.slot() {
                Some(id) => slot.id() == id,
                None => self
                    .ctx
                    .get_token_info(*slot)
                    .map(|info| info.serial_number().trim() == handle.card())
                    .unwrap_or(false),
            })
            .ok_or_else(|| Fault::general(format!("Token {} is not present", handle.card())))
    }

    fn read_flags(&self, slot: Slot) -> Option<TokenFlags> {
        self.ctx.get_token_info(slot).ok().map(|info| token_flags(&info))
    }

    fn find_private_key(
        session: &Session,
        credential_id: &[u8],
    ) -> std::result::Result<ObjectHandle, Fault> {
        let template = vec![
            Attribute::Class(ObjectClass::PRIVATE_KEY),
            Attribute::Id(credential_id.to_vec()),
        ];

        session
            .find_objects(&template)
            .map_err(|e| driver_fault("Failed to find private key", e))?
            .into_iter()
            .next()
            .ok_or_else(|| Fault::general("Private key not found on token"))
    }

    fn store_session(&self, handle: &TokenHandle, session: Session) {
        match self.active.lock() {
            Ok(mut active) => {
                *active = Some(ActiveSession {
                    card: handle.card().to_string(),
                    credential_id: handle.credential_id().to_vec(),
                    session,
                });
            }
            Err(e) => warn!("Session state poisoned: {}", e),
        }
    }
}

fn token_flags(info: &TokenInfo) -> TokenFlags {
    TokenFlags {
        pin_locked: info.user_pin_locked(),
        pin_count_low: info.user_pin_count_low(),
        pin_final_try: info.user_pin_final_try(),
        supports_sign: false,
        supports_decrypt: false,
        protected_auth_path: info.protected_authentication_path(),
    }
}

/// Map a PKCS#11 return value onto the native fault codes
fn driver_fault(context: &str, err: CryptokiError) -> Fault {
    let code = match &err {
        CryptokiError::Pkcs11(rv, ..) => match rv {
            RvError::PinIncorrect => FaultCode::PinIncorrect,
            RvError::PinLocked => FaultCode::PinLocked,
            RvError::FunctionCanceled => FaultCode::PinCanceled,
            RvError::PinInvalid | RvError::PinLenRange | RvError::PinExpired => {
                FaultCode::PinFailed
            }
            _ => FaultCode::General,
        },
        _ => FaultCode::General,
    };
    Fault::general(context).caused_by(Fault::new(code, err.to_string()))
}

/// Enumerate certificate objects on every token
fn scan(ctx: &Pkcs11) -> std::result::Result<Vec<TokenHandle>, Fault> {
    let slots = ctx
        .get_slots_with_token()
        .map_err(|e| driver_fault("Failed to list token slots", e))?;

    let mut handles = Vec::new();
    for slot in slots {
        let info = match ctx.get_token_info(slot) {
            Ok(info) => info,
            Err(e) => {
                warn!("Failed to read token info for slot {}: {}", slot.id(), e);
                continue;
            }
        };
        let card = info.serial_number().trim().to_string();
        let flags = token_flags(&info);

        let session = match ctx.open_ro_session(slot) {
            Ok(session) => session,
            Err(e) => {
                warn!("Failed to open session on token {}: {}", card, e);
                continue;
            }
        };

        let objects = session
            .find_objects(&[Attribute::Class(ObjectClass::CERTIFICATE)])
            .map_err(|e| driver_fault("Failed to list certificates", e))?;

        for object in objects {
            let attrs = match session.get_attributes(object, &[AttributeType::Value, AttributeType::Id])
            {
                Ok(attrs) => attrs,
                Err(e) => {
                    debug!("Skipping unreadable certificate object on {}: {}", card, e);
                    continue;
                }
            };

            let mut der = None;
            let mut id = None;
            for attr in attrs {
                match attr {
                    Attribute::Value(value) => der = Some(value),
                    Attribute::Id(value) => id = Some(value),
                    _ => {}
                }
            }
            let (Some(der), Some(id)) = (der, id) else {
                continue;
            };

            let certificate = Certificate::from_der(der);
            let key_algorithm = match certificate.key_algorithm() {
                Ok(alg) => alg,
                Err(e) => {
                    debug!("Skipping certificate {}: {}", certificate.short(), e);
                    continue;
                }
            };
            let (supports_sign, supports_decrypt) = match certificate.info() {
                Ok(info) => (
                    info.key_usage.non_repudiation || info.key_usage.digital_signature,
                    info.key_usage.key_encipherment || info.key_usage.key_agreement,
                ),
                Err(_) => (false, false),
            };

            handles.push(
                TokenHandle::new(
                    card.clone(),
                    id,
                    certificate,
                    key_algorithm,
                    TokenFlags {
                        supports_sign,
                        supports_decrypt,
                        ..flags
                    },
                )
                .with_slot(slot.id()),
            );
        }
    }

    Ok(handles)
}

#[async_trait]
impl TokenDriver for Pkcs11Driver {
    fn variant(&self) -> DriverVariant {
        DriverVariant::Pkcs11
    }

    async fn detect(&self) -> std::result::Result<Vec<TokenHandle>, Fault> {
        let ctx = Arc::clone(&self.ctx);
        tokio::task::spawn_blocking(move || scan(&ctx))
            .await
            .map_err(|e| Fault::general(format!("Token scan task failed: {}", e)))?
    }

    async fn authenticate(&self, handle: &TokenHandle, attempt: u32) -> AuthResult {
        let slot = match self.find_slot(handle) {
            Ok(slot) => slot,
            Err(fault) => return AuthResult::Failed(fault),
        };
        let flags = self.read_flags(slot).unwrap_or_else(|| handle.flags());
        if flags.pin_locked {
            return AuthResult::Failed(Fault::new(FaultCode::PinLocked, "PIN is locked"));
        }

        let pin = if flags.protected_auth_path {
            info!("Waiting for PIN entry on reader pinpad");
            None
        } else {
            let request = PinRequest {
                card: handle.card().to_string(),
                subject: handle.certificate().info().ok().map(|i| i.subject),
                attempt,
                flags,
            };
            match self.prompt.request_pin(&request).await {
                PinResponse::Entered(pin) => Some(AuthPin::new(pin.expose().to_string())),
                PinResponse::Canceled => return AuthResult::Canceled,
            }
        };

        let session = match self.ctx.open_ro_session(slot) {
            Ok(session) => session,
            Err(e) => return AuthResult::Failed(driver_fault("Failed to open session", e)),
        };

        match session.login(UserType::User, pin.as_ref()) {
            Ok(()) | Err(CryptokiError::Pkcs11(RvError::UserAlreadyLoggedIn, ..)) => {
                info!("Logged in to token {}", handle.card());
                self.store_session(handle, session);
                AuthResult::Authenticated
            }
            Err(CryptokiError::Pkcs11(RvError::PinIncorrect, ..)) => {
                let flags = self.read_flags(slot).unwrap_or(TokenFlags {
                    pin_count_low: true,
                    ..flags
                });
                AuthResult::Incorrect { flags }
            }
            Err(CryptokiError::Pkcs11(RvError::FunctionCanceled, ..)) => AuthResult::Canceled,
            Err(e) => AuthResult::Failed(driver_fault("PIN login failed", e)),
        }
    }

    async fn raw_sign(
        &self,
        handle: &TokenHandle,
        method: DigestMethod,
        digest: &[u8],
    ) -> std::result::Result<Vec<u8>, Fault> {
        let (mechanism, data) = if handle.key_algorithm().is_rsa() {
            let info = method
                .digest_info(digest)
                .map_err(|e| Fault::general(e.to_string()))?;
            (Mechanism::RsaPkcs, info)
        } else {
            (Mechanism::Ecdsa, digest.to_vec())
        };

        let active = self
            .active
            .lock()
            .map_err(|e| Fault::general(format!("Session state poisoned: {}", e)))?;
        let active = active
            .as_ref()
            .filter(|a| a.serves(handle))
            .ok_or_else(|| Fault::general("Credential is not authenticated"))?;

        let key = Self::find_private_key(&active.session, handle.credential_id())?;
        debug!("Signing {} digest on token {}", method, handle.card());
        active
            .session
            .sign(&mechanism, key, &data)
            .map_err(|e| driver_fault("Token signing failed", e))
    }

    async fn logout(&self, handle: &TokenHandle) {
        let taken = match self.active.lock() {
            Ok(mut active) => {
                if active.as_ref().is_some_and(|a| a.serves(handle)) {
                    active.take()
                } else {
                    None
                }
            }
            Err(_) => None,
        };
        if let Some(active) = taken {
            let _ = active.session.logout();
            debug!("PKCS#11 session closed for token {}", active.card);
        }
    }
}

impl Drop for Pkcs11Driver {
    fn drop(&mut self) {
        // Logout when done
        if let Ok(mut active) = self.active.lock() {
            if let Some(active) = active.take() {
                let _ = active.session.logout();
            }
        }
        debug!("PKCS#11 driver closed");
    }
}
