use std::time::{Duration, Instant};

use tracing::{debug, error, info};

use crate::adversary::AdversaryBitmask;
use crate::errors::PurifyResult;

/// Retry ceiling: a process still producing fixes after this many passes is
/// unrecoverable.
pub const PURIFY_MAX_PASSES: u32 = 16;

/// One anomaly found while scanning the target process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Anomaly {
    /// Executable memory not backed by any known, verified module mapping.
    UnbackedExecutableRegion { start: u64, len: u64 },
    /// Code bytes inside a verified module's executable section differing
    /// from the pristine on-disk image.
    PatchedModuleCode {
        module: String,
        region_start: u64,
        file_offset: u64,
        len: usize,
    },
    /// A loaded module not on the allow-list.
    DisallowedModule { module: String },
}

/// Access to the target process the engine scans and corrects.
pub trait ProcessInspector {
    fn scan(&mut self) -> PurifyResult<Vec<Anomaly>>;

    /// Try to free an unauthorized region. `Ok(false)` means freeing was not
    /// possible and the non-executable fallback should be used.
    fn free_region(&mut self, start: u64, len: u64) -> PurifyResult<bool>;

    /// Fallback for regions that could not be freed.
    fn make_region_non_executable(&mut self, start: u64, len: u64) -> PurifyResult<()>;

    /// Restore pristine image bytes over patched module code.
    fn restore_module_bytes(
        &mut self,
        module: &str,
        region_start: u64,
        file_offset: u64,
        len: usize,
    ) -> PurifyResult<()>;

    /// Request that a disallowed module be unloaded.
    fn unload_module(&mut self, module: &str) -> PurifyResult<()>;
}

#[derive(Debug, Clone)]
pub struct PurifyConfig {
    pub max_passes: u32,
    /// Settle delay before each pass, letting asynchronous injectors finish
    /// so their work is caught in one pass instead of chased across many.
    pub initial_settle: Duration,
    /// Settle delay once any anomaly has ever been seen this run.
    pub escalated_settle: Duration,
}

impl Default for PurifyConfig {
    fn default() -> Self {
        Self {
            max_passes: PURIFY_MAX_PASSES,
            initial_settle: Duration::from_millis(250),
            escalated_settle: Duration::from_millis(500),
        }
    }
}

impl PurifyConfig {
    /// No settle delays; used by tests driving scripted inspectors.
    pub fn immediate() -> Self {
        Self {
            max_passes: PURIFY_MAX_PASSES,
            initial_settle: Duration::ZERO,
            escalated_settle: Duration::ZERO,
        }
    }
}

/// State of the purification loop after each pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurifyState {
    Clean,
    Detected { adversary_mask: u32 },
    GivingUp { outstanding_fixes: u32 },
}

/// Result of a full purification run.
#[derive(Debug, Clone)]
pub struct PurifyOutcome {
    pub passes: u32,
    pub total_fixes: u32,
    pub state: PurifyState,
    /// State after each pass, in order; the last entry is `state`.
    pub transitions: Vec<PurifyState>,
}

impl PurifyOutcome {
    /// True when the retry ceiling was reached with fixes still flowing.
    /// The caller must terminate the target and abort the launch.
    pub fn is_fatal(&self) -> bool {
        matches!(self.state, PurifyState::GivingUp { .. })
    }
}

/// Run one scan-and-fix pass. Returns the number of fixes applied.
pub fn purify_pass(
    inspector: &mut dyn ProcessInspector,
    adversaries: &AdversaryBitmask,
) -> PurifyResult<u32> {
    let anomalies = inspector.scan()?;
    let mut fixes = 0u32;

    for anomaly in anomalies {
        match anomaly {
            Anomaly::UnbackedExecutableRegion { start, len } => {
                if inspector.free_region(start, len)? {
                    debug!(start = format_args!("{:#x}", start), len, "freed unbacked executable region");
                } else {
                    inspector.make_region_non_executable(start, len)?;
                    debug!(start = format_args!("{:#x}", start), len, "made region non-executable");
                }
                fixes += 1;
            }
            Anomaly::PatchedModuleCode {
                module,
                region_start,
                file_offset,
                len,
            } => {
                adversaries.record_from_module_path(&module);
                inspector.restore_module_bytes(&module, region_start, file_offset, len)?;
                info!(module = %module, len, "restored patched module code");
                fixes += 1;
            }
            Anomaly::DisallowedModule { module } => {
                adversaries.record_from_module_path(&module);
                inspector.unload_module(&module)?;
                info!(module = %module, "requested unload of disallowed module");
                fixes += 1;
            }
        }
    }

    if fixes > 0 && adversaries.is_empty() {
        adversaries.record_unknown();
    }
    Ok(fixes)
}

/// Purify the target process until it stabilizes or the retry ceiling hits.
pub fn purify(
    inspector: &mut dyn ProcessInspector,
    adversaries: &AdversaryBitmask,
    config: &PurifyConfig,
) -> PurifyResult<PurifyOutcome> {
    let mut transitions = Vec::new();
    let mut total_fixes = 0u32;
    let mut anomalies_ever_seen = false;
    let mut last_fixes = 0u32;

    for pass in 1..=config.max_passes {
        let settle_for = if anomalies_ever_seen {
            config.escalated_settle
        } else {
            config.initial_settle
        };
        settle(settle_for);

        let fixes = purify_pass(inspector, adversaries)?;
        last_fixes = fixes;
        total_fixes += fixes;

        if fixes == 0 {
            transitions.push(PurifyState::Clean);
            info!(pass, total_fixes, "purification converged");
            return Ok(PurifyOutcome {
                passes: pass,
                total_fixes,
                state: PurifyState::Clean,
                transitions,
            });
        }

        anomalies_ever_seen = true;
        let state = PurifyState::Detected {
            adversary_mask: adversaries.raw(),
        };
        transitions.push(state);
        info!(
            pass,
            fixes,
            adversaries = ?adversaries.known_names(),
            "purification pass applied fixes; retrying"
        );
    }

    let state = PurifyState::GivingUp {
        outstanding_fixes: last_fixes,
    };
    transitions.push(state);
    error!(
        passes = config.max_passes,
        outstanding_fixes = last_fixes,
        "purification did not converge within the retry ceiling"
    );
    Ok(PurifyOutcome {
        passes: config.max_passes,
        total_fixes,
        state,
        transitions,
    })
}

/// Burn the settle delay in scheduler yields rather than one sleep, so the
/// injector threads being waited out actually get scheduled.
fn settle(duration: Duration) {
    if duration.is_zero() {
        return;
    }
    let start = Instant::now();
    while start.elapsed() < duration {
        std::thread::yield_now();
    }
}
