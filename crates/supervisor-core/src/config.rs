//! Environment-driven supervisor configuration.
//!
//! Read only after the sanitizer has scrubbed the denylist. Nothing in here
//! may influence generation detection; that is a function of argument zero
//! alone.

use std::path::PathBuf;

use crate::startup_log::DEFAULT_LOG_CAP_BYTES;

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Skip the privileged-device ladder entirely.
    pub driverless: bool,
    /// Directory holding the device endpoint nodes.
    pub device_dir: PathBuf,
    /// Installation root whose binaries are integrity-checked.
    pub install_root: PathBuf,
    /// Trusted system library directory for load-time resolution.
    pub system_lib_dir: PathBuf,
    /// Backing-file name of the system runtime the controller locates in
    /// each child.
    pub runtime_lib: String,
    /// Ceiling on each wait for a child handshake request.
    pub request_timeout_secs: u64,
    /// Startup log size cap.
    pub startup_log_cap: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            driverless: false,
            device_dir: PathBuf::from("/dev"),
            install_root: PathBuf::from("/opt/vmguard"),
            system_lib_dir: PathBuf::from("/usr/lib"),
            runtime_lib: "libc.so.6".to_string(),
            request_timeout_secs: 30,
            startup_log_cap: DEFAULT_LOG_CAP_BYTES,
        }
    }
}

impl SupervisorConfig {
    pub fn load() -> Self {
        let mut config = Self::default();
        config.driverless = env_bool("VMSUP_DRIVERLESS", config.driverless);
        if let Some(dir) = env_path("VMSUP_DEVICE_DIR") {
            config.device_dir = dir;
        }
        if let Some(root) = env_path("VMSUP_INSTALL_ROOT") {
            config.install_root = root;
        }
        if let Some(dir) = env_path("VMSUP_SYSTEM_LIB_DIR") {
            config.system_lib_dir = dir;
        }
        if let Some(name) = env_non_empty("VMSUP_RUNTIME_LIB") {
            config.runtime_lib = name;
        }
        config.request_timeout_secs =
            env_u64("VMSUP_REQUEST_TIMEOUT_SECS", config.request_timeout_secs);
        config.startup_log_cap = env_u64("VMSUP_STARTUP_LOG_CAP", config.startup_log_cap);
        config
    }
}

fn env_non_empty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_path(name: &str) -> Option<PathBuf> {
    env_non_empty(name).map(PathBuf::from)
}

fn env_bool(name: &str, default: bool) -> bool {
    env_non_empty(name)
        .and_then(|v| v.parse::<bool>().ok())
        .unwrap_or(default)
}

fn env_u64(name: &str, default: u64) -> u64 {
    env_non_empty(name)
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}
