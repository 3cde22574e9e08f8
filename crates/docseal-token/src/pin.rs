//! PIN entry seam
//!
//! Drivers that authenticate through the host ask a [`PinPrompt`] for the
//! PIN. The PIN is held in zeroizing memory and never printed.

use async_trait::async_trait;
use zeroize::Zeroizing;

use docseal_core::TokenFlags;

/// A PIN entered by the user, zeroized on drop
#[derive(Clone)]
pub struct Pin(Zeroizing<String>);

impl Pin {
    pub fn new(pin: impl Into<String>) -> Self {
        Self(Zeroizing::new(pin.into()))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for Pin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Pin(<redacted>)")
    }
}

/// Context shown to the user when asking for a PIN
#[derive(Debug, Clone)]
pub struct PinRequest {
    pub card: String,
    /// Certificate subject of the credential being unlocked
    pub subject: Option<String>,
    /// 1-based attempt number within the current session
    pub attempt: u32,
    pub flags: TokenFlags,
}

impl PinRequest {
    /// Warning to show alongside the prompt, if any
    pub fn warning(&self) -> Option<&'static str> {
        if self.flags.pin_final_try {
            Some("PIN will be locked next failed attempt")
        } else if self.flags.pin_count_low {
            Some("PIN has been entered incorrectly at least once")
        } else {
            None
        }
    }
}

#[derive(Debug, Clone)]
pub enum PinResponse {
    Entered(Pin),
    Canceled,
}

/// Source of PINs for host-side authentication
#[async_trait]
pub trait PinPrompt: Send + Sync {
    async fn request_pin(&self, request: &PinRequest) -> PinResponse;
}

/// Prompt that answers every request with the same PIN
pub struct StaticPin(Pin);

impl StaticPin {
    pub fn new(pin: Pin) -> Self {
        Self(pin)
    }
}

#[async_trait]
impl PinPrompt for StaticPin {
    async fn request_pin(&self, _request: &PinRequest) -> PinResponse {
        PinResponse::Entered(self.0.clone())
    }
}
