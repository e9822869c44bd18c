use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use verification::{identity_of_file, TrustVerifier, VerificationCache, VerifyFlags};

use crate::errors::{InterceptError, InterceptResult};

/// Guard for the map-executable-memory-from-file interception point.
///
/// No file-backed executable mapping is created without the backing file
/// passing verification first, and the mapping that the OS actually created
/// is re-checked afterwards against the file that was verified.
pub struct MapExecGuard {
    cache: Arc<VerificationCache>,
    verifier: Arc<dyn TrustVerifier>,
}

impl MapExecGuard {
    pub fn new(cache: Arc<VerificationCache>, verifier: Arc<dyn TrustVerifier>) -> Self {
        Self { cache, verifier }
    }

    /// Pre-map check: canonicalize the backing file, consult the cache,
    /// verify on a miss. A rejection fails the mapping request the way the
    /// OS would fail it, it does not abort the process here.
    pub fn authorize(&self, backing: &Path) -> InterceptResult<()> {
        let canonical = backing
            .canonicalize()
            .map_err(|err| InterceptError::PolicyViolation {
                path: backing.to_path_buf(),
                detail: format!("cannot canonicalize backing file: {}", err),
            })?;

        let entry = self.cache.verify_path(
            self.verifier.as_ref(),
            &canonical,
            VerifyFlags {
                is_image: true,
                resolved_without_symlinks: true,
            },
        )?;

        match entry.verdict() {
            verdict if verdict.is_accepted() => {
                debug!(path = %canonical.display(), "executable mapping authorized");
                Ok(())
            }
            verdict => Err(InterceptError::PolicyViolation {
                path: canonical,
                detail: verdict.to_string(),
            }),
        }
    }

    /// Post-map check: the file actually backing the created mapping must be
    /// the same file-system object that was verified. Defends against
    /// double-indirection tricks where the handle opened for verification
    /// and the file the OS cache ultimately maps differ.
    pub fn confirm(&self, verified: &Path, actual_backing: &Path) -> InterceptResult<()> {
        let (_file, verified_identity) = identity_of_file(verified)?;
        let (_file, actual_identity) = identity_of_file(actual_backing)?;
        if verified_identity != actual_identity {
            return Err(InterceptError::BackingMismatch {
                requested: verified.to_path_buf(),
                actual: actual_backing.to_path_buf(),
            });
        }
        Ok(())
    }
}
