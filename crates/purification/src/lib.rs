//! Purification engine.
//!
//! Scans a supervised (usually freshly spawned, still stopped) process for
//! injected code and either corrects what it finds or declares the launch
//! unrecoverable. Runs iteratively with settle delays so asynchronous
//! injectors lose the race in one pass instead of being chased forever.

mod adversary;
mod engine;
mod errors;
mod maps;

#[cfg(unix)]
mod procfs;

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
mod remote;

pub use adversary::{AdversaryBitmask, AdversarySignature, ADVERSARY_UNKNOWN, KNOWN_ADVERSARIES};
pub use engine::{
    purify, purify_pass, Anomaly, ProcessInspector, PurifyConfig, PurifyOutcome, PurifyState,
    PURIFY_MAX_PASSES,
};
pub use errors::{PurifyError, PurifyResult};
pub use maps::{parse_maps_content, parse_proc_maps, MemoryRegion};

#[cfg(unix)]
pub use procfs::ProcfsInspector;

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub use remote::RemoteProcess;
