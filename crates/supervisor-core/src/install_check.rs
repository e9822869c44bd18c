//! Installation integrity checking.
//!
//! Re-run at the start of every generation; a new process is a new trust
//! boundary. The checker itself is a seam so protocol tests can script
//! corrupt installations without touching the disk.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::debug;
use verification::{TrustVerdict, TrustVerifier, VerificationCache, VerifyFlags};

#[derive(Debug)]
pub struct IntegrityViolation {
    pub path: PathBuf,
    pub detail: String,
}

impl fmt::Display for IntegrityViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path.display(), self.detail)
    }
}

impl std::error::Error for IntegrityViolation {}

pub trait InstallIntegrity {
    fn verify_installation(&self) -> Result<(), IntegrityViolation>;
}

/// Real checker: every listed installed binary must pass the trust verifier.
pub struct VerifierInstallCheck {
    cache: Arc<VerificationCache>,
    verifier: Arc<dyn TrustVerifier>,
    files: Vec<PathBuf>,
}

impl VerifierInstallCheck {
    pub fn new(
        cache: Arc<VerificationCache>,
        verifier: Arc<dyn TrustVerifier>,
        files: Vec<PathBuf>,
    ) -> Self {
        Self {
            cache,
            verifier,
            files,
        }
    }
}

impl InstallIntegrity for VerifierInstallCheck {
    fn verify_installation(&self) -> Result<(), IntegrityViolation> {
        for path in &self.files {
            let flags = VerifyFlags {
                is_image: true,
                resolved_without_symlinks: false,
            };
            let entry = self
                .cache
                .verify_path(self.verifier.as_ref(), path, flags)
                .map_err(|err| IntegrityViolation {
                    path: path.clone(),
                    detail: err.to_string(),
                })?;
            match entry.verdict() {
                TrustVerdict::Accept => {
                    debug!(path = %path.display(), "installed file verified");
                }
                TrustVerdict::Reject { reason, message } => {
                    return Err(IntegrityViolation {
                        path: path.clone(),
                        detail: format!("{:?}: {}", reason, message),
                    });
                }
            }
        }
        Ok(())
    }
}
