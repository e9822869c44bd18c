//! Generation detection for the re-spawn ladder.
//!
//! A re-spawned process learns which generation it is from argument zero
//! alone. The markers are fixed high-entropy strings, so detection is a pure
//! function of those bytes; no environment variable or later argument can
//! influence it.

use std::ffi::{OsStr, OsString};

/// Argument zero of the first re-spawn (the "stub" process).
pub const GEN1_MARKER: &str = "1f4ab7c2e6d90358-vmsup-stub-9d83e6f05a714c2b";

/// Argument zero of the second re-spawn (the "final" process).
pub const GEN2_MARKER: &str = "8c2de951b04a7f63-vmsup-final-4b0a7f63c9e21d85";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Generation {
    /// The user's original invocation.
    Original,
    /// First re-spawn; may open the restricted stub device endpoint.
    Stub,
    /// Second re-spawn; opens full device access and runs the application.
    Final,
}

impl Generation {
    /// Exact byte comparison against the two markers; anything else,
    /// including near-misses, is the original invocation.
    pub fn detect(arg0: &OsStr) -> Self {
        if arg0 == OsStr::new(GEN1_MARKER) {
            Self::Stub
        } else if arg0 == OsStr::new(GEN2_MARKER) {
            Self::Final
        } else {
            Self::Original
        }
    }

    pub fn detect_from_args(args: &[OsString]) -> Self {
        args.first()
            .map(|arg0| Self::detect(arg0))
            .unwrap_or(Self::Original)
    }

    /// Marker to plant as argument zero when raising the next generation.
    pub fn next_marker(&self) -> Option<&'static str> {
        match self {
            Self::Original => Some(GEN1_MARKER),
            Self::Stub => Some(GEN2_MARKER),
            Self::Final => None,
        }
    }

    pub fn number(&self) -> u8 {
        match self {
            Self::Original => 0,
            Self::Stub => 1,
            Self::Final => 2,
        }
    }
}
