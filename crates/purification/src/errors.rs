use std::fmt;

#[derive(Debug)]
pub enum PurifyError {
    Io(std::io::Error),
    MemoryAccess { pid: u32, detail: String },
    Unsupported(&'static str),
}

impl fmt::Display for PurifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "io error: {}", err),
            Self::MemoryAccess { pid, detail } => {
                write!(f, "memory access on pid {}: {}", pid, detail)
            }
            Self::Unsupported(what) => write!(f, "unsupported fix operation: {}", what),
        }
    }
}

impl std::error::Error for PurifyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for PurifyError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

pub type PurifyResult<T> = std::result::Result<T, PurifyError>;
