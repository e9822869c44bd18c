use std::fmt;

/// Why a binary was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    UntrustedLocation,
    OwnershipMismatch,
    SignatureMissing,
    SignatureInvalid,
    ArchitectureMismatch,
    ContentMismatch,
}

impl RejectReason {
    pub fn code(&self) -> &'static str {
        match self {
            Self::UntrustedLocation => "untrusted_location",
            Self::OwnershipMismatch => "ownership_mismatch",
            Self::SignatureMissing => "signature_missing",
            Self::SignatureInvalid => "signature_invalid",
            Self::ArchitectureMismatch => "architecture_mismatch",
            Self::ContentMismatch => "content_mismatch",
        }
    }
}

/// Outcome of verifying one binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustVerdict {
    Accept,
    Reject {
        reason: RejectReason,
        message: String,
    },
}

impl TrustVerdict {
    pub fn reject(reason: RejectReason, message: impl Into<String>) -> Self {
        Self::Reject {
            reason,
            message: message.into(),
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accept)
    }
}

impl fmt::Display for TrustVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accept => write!(f, "accept"),
            Self::Reject { reason, message } => {
                write!(f, "reject({}): {}", reason.code(), message)
            }
        }
    }
}
