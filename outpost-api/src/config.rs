use serde::Deserialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// How often the lifecycle executor looks for autostart/autostop work.
    #[serde(default = "default_autobuild_poll_interval")]
    pub autobuild_poll_interval_secs: u64,

    /// Running jobs without a heartbeat for this long are force-canceled.
    #[serde(default = "default_force_cancel_interval")]
    pub force_cancel_interval_secs: u64,

    /// Time a canceling job gets to acknowledge before it is finalized.
    #[serde(default = "default_cancel_grace_period")]
    pub cancel_grace_period_secs: u64,

    /// Upper bound on a daemon's AcquireJob long poll.
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,

    /// Budget for owners without an explicit allowance. 0 disables it.
    #[serde(default = "default_quota_budget")]
    pub default_quota_budget: i64,

    /// Users allowed to manage templates and act on anyone's workspace.
    #[serde(default = "default_admins")]
    pub admins: HashSet<String>,

    /// Shared key daemons must present. Unset accepts any daemon.
    #[serde(default = "default_provisioner_psk")]
    pub provisioner_psk: Option<String>,
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn default_bind_addr() -> String {
    std::env::var("OUTPOST_BIND").unwrap_or_else(|_| "0.0.0.0:3121".to_string())
}

fn default_db_path() -> PathBuf {
    if let Ok(path) = std::env::var("OUTPOST_DB_PATH") {
        return PathBuf::from(path);
    }

    if cfg!(windows) {
        let appdata = std::env::var("APPDATA").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(appdata).join("outpost").join("outpost.db")
    } else {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(".outpost").join("outpost.db")
    }
}

fn default_autobuild_poll_interval() -> u64 {
    env_u64("OUTPOST_AUTOBUILD_POLL_INTERVAL", 60)
}

fn default_force_cancel_interval() -> u64 {
    env_u64("OUTPOST_FORCE_CANCEL_INTERVAL", 600)
}

fn default_cancel_grace_period() -> u64 {
    env_u64("OUTPOST_CANCEL_GRACE_PERIOD", 60)
}

fn default_acquire_timeout() -> u64 {
    env_u64("OUTPOST_ACQUIRE_TIMEOUT", 10)
}

fn default_quota_budget() -> i64 {
    std::env::var("OUTPOST_DEFAULT_QUOTA_BUDGET")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

fn default_admins() -> HashSet<String> {
    std::env::var("OUTPOST_ADMINS")
        .map(|s| parse_list(&s))
        .unwrap_or_default()
}

fn default_provisioner_psk() -> Option<String> {
    std::env::var("OUTPOST_PROVISIONER_PSK")
        .ok()
        .filter(|s| !s.is_empty())
}

/// Comma separated, blanks dropped.
pub fn parse_list(s: &str) -> HashSet<String> {
    s.split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            db_path: default_db_path(),
            autobuild_poll_interval_secs: default_autobuild_poll_interval(),
            force_cancel_interval_secs: default_force_cancel_interval(),
            cancel_grace_period_secs: default_cancel_grace_period(),
            acquire_timeout_secs: default_acquire_timeout(),
            default_quota_budget: default_quota_budget(),
            admins: default_admins(),
            provisioner_psk: default_provisioner_psk(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::default()
    }

    pub fn autobuild_poll_interval(&self) -> Duration {
        Duration::from_secs(self.autobuild_poll_interval_secs.max(1))
    }

    pub fn force_cancel_interval(&self) -> Duration {
        Duration::from_secs(self.force_cancel_interval_secs)
    }

    pub fn cancel_grace_period(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_period_secs)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}
