//! Serialized access to the signing token
//!
//! [`TokenCoordinator`] owns the one driver handle. Every use of the token
//! goes through a single async mutex:
//! - Callers hold it for a whole [`SigningSession`]
//!   (lock, select credential, authenticate, sign, unlock)
//! - The detection loop takes it for each pass, with a bounded wait, so it
//!   never touches the token while a session is open
//!
//! The published [`TokenHandle`] snapshot and [`TokenEvent::Changed`] are
//! only updated by detection and card selection, both while holding the
//! lock, so no caller observes the handle change mid-session.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{broadcast, watch, Mutex, MutexGuard, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

use docseal_core::{classify, ClassifiedError, DigestMethod, ErrorKind, TokenHandle};

use crate::config::CoordinatorConfig;
use crate::driver::{AuthResult, TokenDriver};
use crate::selection::SelectionPolicy;

/// Event broadcast to token observers
#[derive(Debug, Clone)]
pub enum TokenEvent {
    /// The active credential or the set of present cards changed
    Changed {
        active: Option<TokenHandle>,
        cards: Vec<String>,
    },
    /// A PIN attempt was rejected; the session may prompt again
    PinIncorrect {
        card: String,
        attempt: u32,
        final_try: bool,
    },
}

/// Result of a signing request that did not fail
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignOutcome {
    Signed(Vec<u8>),
    /// The user canceled PIN entry; nothing was signed
    Canceled,
}

/// Progress of one signing session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStage {
    Locked,
    CredentialSelected,
    Authenticated,
    Signed,
    Canceled,
    Failed,
}

struct TokenState {
    /// Every credential found by the last detection pass
    available: Vec<TokenHandle>,
    /// Credential used for signing
    active: Option<TokenHandle>,
    /// Card chosen explicitly through `select_card`
    selected_card: Option<String>,
}

#[derive(Default)]
struct Published {
    active: Option<TokenHandle>,
    cards: Vec<String>,
}

pub struct TokenCoordinator {
    driver: Arc<dyn TokenDriver>,
    config: CoordinatorConfig,
    state: Mutex<TokenState>,
    published: RwLock<Published>,
    events: broadcast::Sender<TokenEvent>,
}

impl TokenCoordinator {
    pub fn new(driver: Arc<dyn TokenDriver>, config: CoordinatorConfig) -> Self {
        let (events, _) = broadcast::channel(16);
        info!("Token coordinator using {:?} driver", driver.variant());

        Self {
            driver,
            config,
            state: Mutex::new(TokenState {
                available: Vec::new(),
                active: None,
                selected_card: None,
            }),
            published: RwLock::new(Published::default()),
            events,
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn driver(&self) -> &Arc<dyn TokenDriver> {
        &self.driver
    }

    /// Subscribe to token events
    pub fn subscribe(&self) -> broadcast::Receiver<TokenEvent> {
        self.events.subscribe()
    }

    /// Snapshot of the active credential as of the last detection pass
    pub async fn current_token(&self) -> Option<TokenHandle> {
        self.published.read().await.active.clone()
    }

    /// Cards present as of the last detection pass
    pub async fn cards(&self) -> Vec<String> {
        self.published.read().await.cards.clone()
    }

    /// Client authentication credential, preferring the active card
    pub async fn client_credential(&self) -> Option<TokenHandle> {
        let state = self.state.lock().await;
        let preferred = state.active.as_ref().map(|h| h.card());
        SelectionPolicy::client_authentication()
            .choose(&state.available, preferred, Utc::now())
            .cloned()
    }

    /// Acquire exclusive use of the token, waiting until it is free
    pub async fn lock(&self) -> SigningSession<'_> {
        let state = self.state.lock().await;
        debug!("Token session opened");
        SigningSession {
            coordinator: self,
            state,
            credential: None,
            stage: SessionStage::Locked,
            attempts: 0,
            logged_in: false,
        }
    }

    /// Run one detection pass
    ///
    /// Skips the pass if a session holds the token longer than the configured
    /// lock wait. A detection call that fails or outlasts the detect timeout
    /// is treated as no token present. Returns true if observers were notified.
    pub async fn refresh(&self) -> bool {
        let mut state = match timeout(self.config.lock_wait(), self.state.lock()).await {
            Ok(state) => state,
            Err(_) => {
                debug!("Token in use, skipping detection pass");
                return false;
            }
        };

        let detected = match timeout(self.config.detect_timeout(), self.driver.detect()).await {
            Ok(Ok(handles)) => handles,
            Ok(Err(fault)) => {
                warn!("Token detection failed: {}", classify(&fault));
                Vec::new()
            }
            Err(_) => {
                warn!(
                    "Token detection timed out after {:?}",
                    self.config.detect_timeout()
                );
                Vec::new()
            }
        };

        let active = self.choose_active(&state, &detected);
        if detected == state.available && active == state.active {
            return false;
        }

        state.available = detected;
        state.active = active;
        self.publish(&state).await;
        true
    }

    /// Make `card` the active card
    ///
    /// Returns false if the card is not present or carries no signing credential.
    pub async fn select_card(&self, card: &str) -> bool {
        let mut state = self.state.lock().await;
        if !state.available.iter().any(|h| h.card() == card) {
            warn!("Card {} is not present", card);
            return false;
        }

        state.selected_card = Some(card.to_string());
        let active = self.choose_active(&state, &state.available);
        if active != state.active {
            state.active = active;
            self.publish(&state).await;
        }

        state.active.as_ref().is_some_and(|h| h.card() == card)
    }

    /// Start the background detection loop
    pub fn spawn_detection(self: &Arc<Self>) -> DetectionHandle {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let coordinator = Arc::clone(self);

        let task = tokio::spawn(async move {
            let period = coordinator.config.poll_interval();
            info!("Starting token detection every {:?}", period);

            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        coordinator.refresh().await;
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Token detection stopped");
        });

        DetectionHandle { shutdown, task }
    }

    /// Sign a digest with the active token's signing credential
    ///
    /// One full session: lock, select, authenticate, sign, unlock. PIN
    /// cancellation is not an error and yields [`SignOutcome::Canceled`].
    pub async fn sign(
        &self,
        method: DigestMethod,
        digest: &[u8],
    ) -> Result<SignOutcome, ClassifiedError> {
        let mut session = self.lock().await;

        let result = async {
            session.select_credential(&SelectionPolicy::signing()).await?;
            session.authenticate().await?;
            session.sign(method, digest).await
        }
        .await;

        session.unlock().await;

        match result {
            Ok(signature) => Ok(SignOutcome::Signed(signature)),
            Err(e) if e.is_silent() => {
                info!("Signing canceled by user");
                Ok(SignOutcome::Canceled)
            }
            Err(e) => Err(e),
        }
    }

    fn choose_active(&self, state: &TokenState, detected: &[TokenHandle]) -> Option<TokenHandle> {
        let present = |card: &str| detected.iter().any(|h| h.card() == card);
        let preferred = [
            state.selected_card.as_deref(),
            state.active.as_ref().map(|h| h.card()),
            self.config.preferred_card.as_deref(),
        ]
        .into_iter()
        .flatten()
        .find(|card| present(card));

        SelectionPolicy::signing()
            .choose(detected, preferred, Utc::now())
            .cloned()
    }

    async fn publish(&self, state: &TokenState) {
        let cards = card_list(&state.available);
        {
            let mut published = self.published.write().await;
            published.active = state.active.clone();
            published.cards = cards.clone();
        }

        match &state.active {
            Some(handle) => info!(
                "Active token {} certificate {}",
                handle.card(),
                handle.certificate().fingerprint()
            ),
            None => info!("No signing token present"),
        }

        let _ = self.events.send(TokenEvent::Changed {
            active: state.active.clone(),
            cards,
        });
    }
}

/// Card identifiers in detection order without duplicates
fn card_list(handles: &[TokenHandle]) -> Vec<String> {
    let mut cards: Vec<String> = Vec::new();
    for handle in handles {
        if !cards.iter().any(|c| c == handle.card()) {
            cards.push(handle.card().to_string());
        }
    }
    cards
}

/// Running detection loop
pub struct DetectionHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl DetectionHandle {
    /// Stop the loop and wait for the current pass to finish
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

/// Exclusive use of the token
///
/// Holds the coordinator lock until dropped. Operations must run in the
/// order select, authenticate, sign; out-of-order calls fail without
/// touching the driver.
pub struct SigningSession<'a> {
    coordinator: &'a TokenCoordinator,
    state: MutexGuard<'a, TokenState>,
    credential: Option<TokenHandle>,
    stage: SessionStage,
    attempts: u32,
    /// Driver holds authenticated state that unlock must drop
    logged_in: bool,
}

impl<'a> SigningSession<'a> {
    pub fn stage(&self) -> SessionStage {
        self.stage
    }

    /// Active credential as seen when the session opened
    pub fn active(&self) -> Option<&TokenHandle> {
        self.state.active.as_ref()
    }

    /// Credential chosen by [`select_credential`](Self::select_credential)
    pub fn credential(&self) -> Option<&TokenHandle> {
        self.credential.as_ref()
    }

    /// Ask the driver for the active card's credential matching `policy`
    pub async fn select_credential(
        &mut self,
        policy: &SelectionPolicy,
    ) -> Result<&TokenHandle, ClassifiedError> {
        let Some(card) = self.state.active.as_ref().map(|h| h.card().to_string()) else {
            return Err(self.fail(ClassifiedError::unclassified(
                "No signing token available",
            )));
        };

        match self.coordinator.driver.select_credential(&card, policy).await {
            Ok(handle) => {
                debug!(
                    "Selected credential {} on card {}",
                    handle.certificate().short(),
                    card
                );
                self.stage = SessionStage::CredentialSelected;
                self.attempts = 0;
                Ok(&*self.credential.insert(handle))
            }
            Err(fault) => Err(self.fail(classify(&fault))),
        }
    }

    /// Authenticate the selected credential, retrying per the PIN retry policy
    ///
    /// A PIN-incorrect result whose flags report the PIN as locked is
    /// classified as [`ErrorKind::PinLocked`]. After a plain
    /// [`ErrorKind::PinIncorrect`] the session keeps its credential and
    /// `authenticate` may be called again without releasing the lock.
    pub async fn authenticate(&mut self) -> Result<(), ClassifiedError> {
        if self.stage == SessionStage::Authenticated {
            return Ok(());
        }
        let mut handle = match self.credential.clone() {
            Some(handle) if self.stage == SessionStage::CredentialSelected => handle,
            _ => {
                return Err(self.fail(ClassifiedError::unclassified(
                    "No credential selected for authentication",
                )))
            }
        };

        let limit = self.coordinator.config.pin_retry.max_attempts();
        let mut tries = 0;
        loop {
            tries += 1;
            self.attempts += 1;

            match self.coordinator.driver.authenticate(&handle, self.attempts).await {
                AuthResult::Authenticated => {
                    info!("Token {} authenticated", handle.card());
                    self.stage = SessionStage::Authenticated;
                    self.logged_in = true;
                    return Ok(());
                }
                AuthResult::Canceled => {
                    debug!("PIN entry canceled");
                    self.stage = SessionStage::Canceled;
                    return Err(ClassifiedError::from_kind(ErrorKind::PinCanceled));
                }
                AuthResult::Incorrect { flags } => {
                    handle = handle.with_flags(flags);
                    self.record_flags(&handle);

                    if flags.pin_locked {
                        warn!("PIN locked on token {}", handle.card());
                        return Err(self.fail(ClassifiedError::from_kind(ErrorKind::PinLocked)));
                    }

                    warn!(
                        "Incorrect PIN for token {} (attempt {})",
                        handle.card(),
                        self.attempts
                    );
                    let _ = self.coordinator.events.send(TokenEvent::PinIncorrect {
                        card: handle.card().to_string(),
                        attempt: self.attempts,
                        final_try: flags.pin_final_try,
                    });

                    if limit.is_some_and(|limit| tries >= limit) {
                        // stays CredentialSelected so the caller may authenticate again
                        return Err(ClassifiedError::from_kind(ErrorKind::PinIncorrect));
                    }
                }
                AuthResult::Failed(fault) => {
                    return Err(self.fail(classify(&fault)));
                }
            }
        }
    }

    /// Sign a digest with the authenticated credential
    pub async fn sign(
        &mut self,
        method: DigestMethod,
        digest: &[u8],
    ) -> Result<Vec<u8>, ClassifiedError> {
        let handle = match self.credential.clone() {
            Some(handle) if self.stage == SessionStage::Authenticated => handle,
            _ => {
                return Err(self.fail(ClassifiedError::unclassified(
                    "Credential is not authenticated",
                )))
            }
        };

        if let Err(e) = method.check_len(digest) {
            return Err(self.fail(ClassifiedError::unclassified(e.to_string())));
        }

        let signature = match self.coordinator.driver.raw_sign(&handle, method, digest).await {
            Ok(signature) => signature,
            Err(fault) => return Err(self.fail(classify(&fault))),
        };

        let expected = handle.key_algorithm().signature_len();
        if signature.len() != expected {
            return Err(self.fail(ClassifiedError::unclassified(format!(
                "Token returned a {} byte signature, expected {} for {}",
                signature.len(),
                expected,
                handle.key_algorithm()
            ))));
        }

        info!(
            "Signed {} digest with certificate {}",
            method,
            handle.certificate().fingerprint()
        );
        self.stage = SessionStage::Signed;
        Ok(signature)
    }

    /// Log out of the credential and release the lock
    pub async fn unlock(self) {
        if self.logged_in {
            if let Some(handle) = &self.credential {
                self.coordinator.driver.logout(handle).await;
            }
        }
    }

    fn fail(&mut self, error: ClassifiedError) -> ClassifiedError {
        self.stage = SessionStage::Failed;
        error
    }

    /// Keep the session's view of the active credential in step with the token flags
    fn record_flags(&mut self, handle: &TokenHandle) {
        if let Some(active) = self.state.active.as_mut() {
            if active.same_credential(handle) {
                *active = handle.clone();
            }
        }
        self.credential = Some(handle.clone());
    }
}

impl Drop for SigningSession<'_> {
    fn drop(&mut self) {
        debug!("Token session released ({:?})", self.stage);
    }
}
