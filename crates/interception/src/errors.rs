use std::fmt;
use std::path::PathBuf;

use verification::VerifyError;

/// Failures produced by the interception layer.
///
/// These are policy rejections, not process-ending conditions: they are
/// handed back to the caller of the intercepted operation the way the real
/// operation would fail, and it is the caller (usually the loader) that may
/// then escalate.
#[derive(Debug)]
pub enum InterceptError {
    NameTooLong { name: String, limit: usize },
    RemotePath(String),
    DeniedName(String),
    NotFound(String),
    PolicyViolation { path: PathBuf, detail: String },
    BackingMismatch { requested: PathBuf, actual: PathBuf },
    Verify(VerifyError),
}

impl fmt::Display for InterceptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NameTooLong { name, limit } => {
                write!(f, "library name exceeds {} bytes: {:.64}...", limit, name)
            }
            Self::RemotePath(name) => {
                write!(f, "remote library paths are never loaded: {}", name)
            }
            Self::DeniedName(name) => write!(f, "library name is deny-listed: {}", name),
            Self::NotFound(name) => write!(f, "library not found in search order: {}", name),
            Self::PolicyViolation { path, detail } => {
                write!(f, "verification rejected {}: {}", path.display(), detail)
            }
            Self::BackingMismatch { requested, actual } => write!(
                f,
                "mapped file {} does not match verified file {}",
                actual.display(),
                requested.display()
            ),
            Self::Verify(err) => write!(f, "verification error: {}", err),
        }
    }
}

impl std::error::Error for InterceptError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Verify(err) => Some(err),
            _ => None,
        }
    }
}

impl From<VerifyError> for InterceptError {
    fn from(value: VerifyError) -> Self {
        Self::Verify(value)
    }
}

pub type InterceptResult<T> = std::result::Result<T, InterceptError>;
