//! Transfer configuration, loaded from `$SLOTA_HOME/config.json`

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::OtaError;

/// What the connect timeout does when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPolicy {
    /// Tell the user, keep waiting. A late connection is still accepted.
    #[default]
    Advisory,
    /// Fail the session with a connect timeout and drop the attempt.
    Authoritative,
}

/// What a disconnect outside the expected reboot windows does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectPolicy {
    #[default]
    Abort,
    /// Log it and carry on.
    LogOnly,
}

/// Settings for the btleplug link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub scan_timeout_ms: u64,
    pub rescan_interval_ms: u64,
    /// Frames buffered ahead of the radio before `write_data` reports backpressure.
    pub data_queue_depth: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            scan_timeout_ms: 30_000,
            rescan_interval_ms: 300,
            data_queue_depth: 8,
        }
    }
}

impl LinkConfig {
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    pub fn rescan_interval(&self) -> Duration {
        Duration::from_millis(self.rescan_interval_ms)
    }
}

/// Transfer timing and retry configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OtaConfig {
    pub connect_timeout_ms: u64,
    pub timeout_policy: TimeoutPolicy,
    /// Wait after the reboot-to-bootloader ack before reconnecting.
    pub reboot_wait_ms: u64,
    pub begin_delay_ms: u64,
    pub end_delay_ms: u64,
    pub app_reboot_delay_ms: u64,
    pub target_mtu: u16,
    pub write_backoff_ms: u64,
    /// `None` retries a rejected frame forever.
    pub max_frame_retries: Option<u32>,
    pub control_write_retries: u32,
    pub disconnect_policy: DisconnectPolicy,
    pub progress_interval_ms: u64,
    pub link: LinkConfig,
}

impl Default for OtaConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            timeout_policy: TimeoutPolicy::Advisory,
            reboot_wait_ms: 5_000,
            begin_delay_ms: 500,
            end_delay_ms: 1_500,
            app_reboot_delay_ms: 500,
            target_mtu: slota_proto::DEFAULT_TARGET_MTU,
            write_backoff_ms: 5,
            max_frame_retries: None,
            control_write_retries: 3,
            disconnect_policy: DisconnectPolicy::Abort,
            progress_interval_ms: 250,
            link: LinkConfig::default(),
        }
    }
}

impl OtaConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reboot_wait(&self) -> Duration {
        Duration::from_millis(self.reboot_wait_ms)
    }

    pub fn begin_delay(&self) -> Duration {
        Duration::from_millis(self.begin_delay_ms)
    }

    pub fn end_delay(&self) -> Duration {
        Duration::from_millis(self.end_delay_ms)
    }

    pub fn app_reboot_delay(&self) -> Duration {
        Duration::from_millis(self.app_reboot_delay_ms)
    }

    pub fn write_backoff(&self) -> Duration {
        Duration::from_millis(self.write_backoff_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        // tokio intervals panic on a zero period
        Duration::from_millis(self.progress_interval_ms.max(1))
    }

    /// Load config from a JSON file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self, OtaError> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Load config from file if it exists, otherwise the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, OtaError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn to_json(&self) -> Result<String, OtaError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

pub const CONFIG_FILE: &str = "config.json";

/// `$SLOTA_HOME`, falling back to `~/.slota`.
pub fn slota_home() -> PathBuf {
    if let Ok(home) = std::env::var("SLOTA_HOME") {
        return PathBuf::from(home);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".slota")
}

pub fn config_path() -> PathBuf {
    slota_home().join(CONFIG_FILE)
}
