//! Privileged device collaborator.
//!
//! The driver exposes three named endpoints with escalating access. The
//! kernel side does its own verification of the opener; this side only needs
//! open-success-or-structured-failure semantics.

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;
use tracing::info;

/// Endpoint node names under the device directory.
pub const FULL_ENDPOINT: &str = "vmguard";
pub const RESTRICTED_ENDPOINT: &str = "vmguardusr";
pub const STUB_ENDPOINT: &str = "vmguardstub";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AccessLevel {
    /// Query-only pre-check interface.
    Restricted,
    /// Narrow endpoint that lets the driver vouch for a not-yet-initialized
    /// process.
    Stub,
    /// The whole control surface.
    Full,
}

/// Structured failure payload; serialized into the fatal report.
#[derive(Debug, Serialize)]
pub struct DeviceError {
    pub level: AccessLevel,
    pub endpoint: String,
    pub os_error: Option<i32>,
    pub detail: String,
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "device endpoint {} ({:?}) could not be opened: {}",
            self.endpoint, self.level, self.detail
        )
    }
}

impl std::error::Error for DeviceError {}

pub trait DeviceGateway {
    fn open_restricted(&self) -> Result<(), DeviceError>;
    fn open_stub(&self) -> Result<(), DeviceError>;
    fn open_full(&self) -> Result<(), DeviceError>;
}

/// Gateway over real device nodes.
pub struct DevNodeGateway {
    device_dir: PathBuf,
}

impl DevNodeGateway {
    pub fn new(device_dir: PathBuf) -> Self {
        Self { device_dir }
    }

    fn open(&self, level: AccessLevel, endpoint: &str) -> Result<(), DeviceError> {
        let path = self.device_dir.join(endpoint);
        match std::fs::OpenOptions::new().read(true).write(true).open(&path) {
            Ok(_) => {
                info!(endpoint, ?level, "device endpoint opened");
                Ok(())
            }
            Err(err) => Err(DeviceError {
                level,
                endpoint: path.display().to_string(),
                os_error: err.raw_os_error(),
                detail: err.to_string(),
            }),
        }
    }
}

impl DeviceGateway for DevNodeGateway {
    fn open_restricted(&self) -> Result<(), DeviceError> {
        self.open(AccessLevel::Restricted, RESTRICTED_ENDPOINT)
    }

    fn open_stub(&self) -> Result<(), DeviceError> {
        self.open(AccessLevel::Stub, STUB_ENDPOINT)
    }

    fn open_full(&self) -> Result<(), DeviceError> {
        self.open(AccessLevel::Full, FULL_ENDPOINT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_node_yields_structured_payload() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = DevNodeGateway::new(dir.path().to_path_buf());

        let err = gateway.open_stub().unwrap_err();
        assert_eq!(err.level, AccessLevel::Stub);
        assert!(err.endpoint.ends_with(STUB_ENDPOINT));
        assert!(err.os_error.is_some());

        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("Stub"));
        assert!(json.contains("vmguardstub"));
    }

    #[test]
    fn present_node_opens() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(RESTRICTED_ENDPOINT), b"").unwrap();
        let gateway = DevNodeGateway::new(dir.path().to_path_buf());
        gateway.open_restricted().expect("open");
    }
}
