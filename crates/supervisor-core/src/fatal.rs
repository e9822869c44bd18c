//! The one exit door for fatal conditions.
//!
//! Every unrecoverable error funnels through `fatal_report`: it logs, prints
//! a category-specific hint for the user, gives a registered late-stage
//! callback a chance to present something richer, then terminates. There is
//! no return and no graceful degradation; this subsystem cannot run partly
//! hardened.

use std::sync::Mutex;

use serde::Serialize;
use tracing::error;

use crate::startup_log::StartupLog;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FatalCategory {
    /// On-disk installation or in-memory image failed verification.
    Integrity,
    /// A privileged device endpoint could not be opened.
    DeviceOpen,
    /// The child violated the handshake protocol or timed out.
    Protocol,
    /// An OS resource operation failed.
    Resource,
}

impl FatalCategory {
    pub fn hint(&self) -> &'static str {
        match self {
            Self::Integrity => "the installation appears damaged; reinstall the product",
            Self::DeviceOpen => "check that the vmguard driver is loaded",
            Self::Protocol => "a security product may be interfering with process startup",
            Self::Resource => "the system refused a required resource; check system limits",
        }
    }
}

/// Structured payload handed to the late error callback and logged as JSON.
#[derive(Debug, Serialize)]
pub struct FatalReport<'a> {
    pub category: FatalCategory,
    pub context: &'a str,
    pub hint: &'static str,
}

/// A richer error presenter the application may register once its UI
/// subsystem exists. Early-phase failures never have one.
pub type LateErrorCallback = fn(&FatalReport<'_>);

static LATE_CALLBACK: Mutex<Option<LateErrorCallback>> = Mutex::new(None);

pub fn set_late_error_callback(callback: LateErrorCallback) {
    if let Ok(mut slot) = LATE_CALLBACK.lock() {
        *slot = Some(callback);
    }
}

pub fn render_report<'a>(category: FatalCategory, context: &'a str) -> FatalReport<'a> {
    FatalReport {
        category,
        context,
        hint: category.hint(),
    }
}

/// Log, print, notify, exit. Never returns.
pub fn fatal_report(log: &StartupLog, category: FatalCategory, context: &str) -> ! {
    let report = render_report(category, context);
    error!(category = ?report.category, context, "fatal error");
    log.line(&format!("fatal: {:?}: {}", report.category, context));

    eprintln!("vmsup: fatal error: {}", context);
    eprintln!("vmsup: {}", report.hint);
    if let Ok(json) = serde_json::to_string(&report) {
        log.line(&json);
    }

    if let Ok(slot) = LATE_CALLBACK.lock() {
        if let Some(callback) = *slot {
            callback(&report);
        }
    }
    std::process::exit(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hints_name_the_remedial_action() {
        assert!(FatalCategory::Integrity.hint().contains("reinstall"));
        assert!(FatalCategory::DeviceOpen.hint().contains("driver"));
    }

    #[test]
    fn report_serializes_with_category_and_context() {
        let report = render_report(FatalCategory::Integrity, "/opt/vmguard/bin/vm is patched");
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("Integrity"));
        assert!(json.contains("/opt/vmguard/bin/vm is patched"));
        assert!(json.contains("reinstall"));
    }
}
