//! Device timing profiles: a coarse hardware class resolved to a bundle of
//! timing and retry constants. The rest of the stack only ever branches on
//! the resolved profile fields, never on hardware identity.

use std::time::Duration;

use log::info;
use serde::{Deserialize, Serialize};

/// Environment variable carrying the device-classification signal.
pub const CLASS_SIGNAL_ENV: &str = "LINKCHAT_DEVICE_CLASS";

/// Coarse hardware class supplied by the device-classification collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HardwareClass {
    /// Brings the link up quickly: short timeouts, few retries.
    Responsive,
    /// Slow link setup: long timeouts, more retries, strict init validation.
    Conservative,
    /// Everything else. Documented default: mid-range timeout and retries.
    Baseline,
}

impl HardwareClass {
    /// Map an opaque classification signal to a class. Unknown or empty
    /// input falls back to `Baseline`; there is no error path.
    pub fn from_signal(signal: &str) -> Self {
        match signal.trim().to_ascii_lowercase().as_str() {
            "responsive" => Self::Responsive,
            "conservative" => Self::Conservative,
            _ => Self::Baseline,
        }
    }

    /// Resolve from the environment signal, if present.
    pub fn detect() -> Self {
        match std::env::var(CLASS_SIGNAL_ENV) {
            Ok(signal) => Self::from_signal(&signal),
            Err(_) => Self::Baseline,
        }
    }
}

/// Immutable timing/retry constants for one hardware class. Cheap to copy
/// and cheap enough to resolve at every session attempt.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeviceTimingProfile {
    /// Transport connect timeout.
    pub socket_timeout_ms: u64,
    /// Startup delay before the admission controller signals readiness; also
    /// applied before the encounter is recorded on a fresh stream.
    pub init_delay_ms: u64,
    /// Settle delay before the first connect attempt.
    pub pre_connect_delay_ms: u64,
    /// Retries after the initial connect attempt.
    pub max_retries: u32,
    /// First retry delay.
    pub backoff_base_ms: u64,
    /// Growth factor per retry.
    pub backoff_multiplier: f64,
    /// Retry delay cap.
    pub max_backoff_ms: u64,
    /// Run the extra storage validation pass during admission init.
    pub strict_init_validation: bool,
}

impl DeviceTimingProfile {
    /// Resolve the timing bundle for a hardware class. Pure and idempotent.
    pub fn resolve(class: HardwareClass) -> Self {
        let common = Self {
            socket_timeout_ms: 12_000,
            init_delay_ms: 300,
            pre_connect_delay_ms: 100,
            max_retries: 4,
            backoff_base_ms: 1_000,
            backoff_multiplier: 1.5,
            max_backoff_ms: 5_000,
            strict_init_validation: false,
        };
        match class {
            HardwareClass::Responsive => Self {
                socket_timeout_ms: 10_000,
                init_delay_ms: 100,
                pre_connect_delay_ms: 50,
                max_retries: 3,
                ..common
            },
            HardwareClass::Conservative => Self {
                socket_timeout_ms: 15_000,
                init_delay_ms: 500,
                pre_connect_delay_ms: 200,
                max_retries: 5,
                strict_init_validation: true,
                ..common
            },
            HardwareClass::Baseline => common,
        }
    }

    /// Resolve using the environment signal.
    pub fn detect() -> Self {
        Self::resolve(HardwareClass::detect())
    }

    pub fn socket_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_timeout_ms)
    }

    pub fn init_delay(&self) -> Duration {
        Duration::from_millis(self.init_delay_ms)
    }

    pub fn pre_connect_delay(&self) -> Duration {
        Duration::from_millis(self.pre_connect_delay_ms)
    }

    /// Delay before retry number `attempt` (zero-based):
    /// `min(base * multiplier^attempt, max_backoff)`.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let raw = self.backoff_base_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        let capped = if raw >= self.max_backoff_ms as f64 {
            self.max_backoff_ms
        } else {
            raw as u64
        };
        Duration::from_millis(capped)
    }

    /// Dump the resolved profile once at startup.
    pub fn log_summary(&self, class: HardwareClass) {
        info!("device class: {:?}", class);
        info!("  socket timeout: {}ms", self.socket_timeout_ms);
        info!("  init delay: {}ms", self.init_delay_ms);
        info!("  pre-connect delay: {}ms", self.pre_connect_delay_ms);
        info!(
            "  retries: {} (backoff {}ms x{}, cap {}ms)",
            self.max_retries, self.backoff_base_ms, self.backoff_multiplier, self.max_backoff_ms
        );
    }
}
