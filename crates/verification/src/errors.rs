use std::fmt;
use std::path::PathBuf;

#[derive(Debug)]
pub enum VerifyError {
    Io(std::io::Error),
    Parse { path: PathBuf, detail: String },
    IdentityProbe { path: PathBuf, detail: String },
    DeepCheckUnavailable,
    InvalidInput(String),
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "io error: {}", err),
            Self::Parse { path, detail } => {
                write!(f, "parse image {}: {}", path.display(), detail)
            }
            Self::IdentityProbe { path, detail } => {
                write!(f, "probe identity of {}: {}", path.display(), detail)
            }
            Self::DeepCheckUnavailable => write!(f, "deep verifier not yet available"),
            Self::InvalidInput(msg) => write!(f, "invalid input: {}", msg),
        }
    }
}

impl std::error::Error for VerifyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for VerifyError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

pub type VerifyResult<T> = std::result::Result<T, VerifyError>;
