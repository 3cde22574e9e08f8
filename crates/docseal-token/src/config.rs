//! Coordinator configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, TokenError};

/// Which driver family talks to the token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DriverConfig {
    /// PKCS#11 module loaded from a shared library
    Pkcs11 { module_path: PathBuf },
    /// Operating system certificate store
    PlatformStore,
}

impl Default for DriverConfig {
    fn default() -> Self {
        DriverConfig::Pkcs11 {
            module_path: default_pkcs11_module(),
        }
    }
}

#[cfg(target_os = "macos")]
fn default_pkcs11_module() -> PathBuf {
    PathBuf::from("/Library/OpenSC/lib/opensc-pkcs11.so")
}

#[cfg(windows)]
fn default_pkcs11_module() -> PathBuf {
    PathBuf::from("opensc-pkcs11.dll")
}

#[cfg(not(any(target_os = "macos", windows)))]
fn default_pkcs11_module() -> PathBuf {
    PathBuf::from("opensc-pkcs11.so")
}

/// How incorrect PIN entries are retried within one signing request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum PinRetryPolicy {
    /// One attempt per request; the caller re-invokes after PIN incorrect
    #[default]
    CallerDriven,
    /// Keep prompting until the token reports the PIN as locked
    UntilLocked,
    /// Prompt at most `attempts` times
    MaxAttempts { attempts: u32 },
}

impl PinRetryPolicy {
    /// Attempt limit for one session, `None` when only the token's lockout stops retries
    pub fn max_attempts(&self) -> Option<u32> {
        match self {
            PinRetryPolicy::CallerDriven => Some(1),
            PinRetryPolicy::UntilLocked => None,
            PinRetryPolicy::MaxAttempts { attempts } => Some((*attempts).max(1)),
        }
    }
}

/// Token coordinator configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub driver: DriverConfig,

    /// Interval between detection passes (milliseconds)
    pub poll_interval_ms: u64,

    /// Upper bound on a single driver detection call (milliseconds)
    pub detect_timeout_ms: u64,

    /// How long a detection pass waits for the token lock before skipping (milliseconds)
    pub lock_wait_ms: u64,

    pub pin_retry: PinRetryPolicy,

    /// Card identifier to prefer when several tokens are present
    pub preferred_card: Option<String>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            driver: DriverConfig::default(),
            poll_interval_ms: 2000,
            detect_timeout_ms: 5000,
            lock_wait_ms: 250,
            pin_retry: PinRetryPolicy::default(),
            preferred_card: None,
        }
    }
}

impl CoordinatorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn detect_timeout(&self) -> Duration {
        Duration::from_millis(self.detect_timeout_ms)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }

    /// Platform-appropriate default config file location
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("docseal")
            .join("config.json")
    }

    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(TokenError::Config(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.detect_timeout_ms == 0 {
            return Err(TokenError::Config(
                "detect_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if let PinRetryPolicy::MaxAttempts { attempts: 0 } = self.pin_retry {
            return Err(TokenError::Config(
                "pin_retry attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
