use std::fmt;

use purification::PurifyError;

#[derive(Debug)]
pub enum RespawnError {
    Io(std::io::Error),
    Spawn { detail: String },
    Protocol { detail: String },
    Timeout { phase: &'static str },
    /// The child posted an `Error` request; its diagnostic fields are carried
    /// verbatim so the parent's fatal report can surface them unchanged.
    ChildReported {
        where_tag: String,
        context: u32,
        status: u32,
        message: String,
    },
    RuntimeNotFound { expected: String },
    /// Purification hit its retry ceiling with fixes still flowing.
    Unrecoverable { outstanding_fixes: u32 },
    Purify(PurifyError),
}

impl fmt::Display for RespawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "io error: {}", err),
            Self::Spawn { detail } => write!(f, "failed to spawn child: {}", detail),
            Self::Protocol { detail } => write!(f, "handshake protocol violation: {}", detail),
            Self::Timeout { phase } => write!(f, "timed out during {}", phase),
            Self::ChildReported {
                where_tag,
                context,
                status,
                message,
            } => write!(
                f,
                "child reported error in {} (context {}, status {:#x}): {}",
                where_tag, context, status, message
            ),
            Self::RuntimeNotFound { expected } => {
                write!(f, "system runtime {} not found in child mappings", expected)
            }
            Self::Unrecoverable { outstanding_fixes } => write!(
                f,
                "purification did not converge; {} fixes outstanding at the retry ceiling",
                outstanding_fixes
            ),
            Self::Purify(err) => write!(f, "purification failed: {}", err),
        }
    }
}

impl std::error::Error for RespawnError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Purify(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for RespawnError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<PurifyError> for RespawnError {
    fn from(value: PurifyError) -> Self {
        Self::Purify(value)
    }
}

pub type RespawnResult<T> = std::result::Result<T, RespawnError>;
