use std::sync::atomic::{AtomicU32, Ordering};

/// Flag for interference that did not match any known product signature.
pub const ADVERSARY_UNKNOWN: u32 = 1 << 0;

/// A known third-party product that modifies process memory in ways that
/// interfere with verification, recognized by a marker substring in the
/// injected module's path.
#[derive(Debug, Clone, Copy)]
pub struct AdversarySignature {
    pub flag: u32,
    pub name: &'static str,
    pub marker: &'static str,
}

/// Products observed injecting into freshly spawned processes. Matching one
/// selects the longer purification settle delay up front and enables its
/// specific workarounds.
pub const KNOWN_ADVERSARIES: &[AdversarySignature] = &[
    AdversarySignature {
        flag: 1 << 1,
        name: "crowdstrike-falcon",
        marker: "falcon-sensor",
    },
    AdversarySignature {
        flag: 1 << 2,
        name: "sentinelone",
        marker: "sentinelone",
    },
    AdversarySignature {
        flag: 1 << 3,
        name: "sophos",
        marker: "libsophos",
    },
    AdversarySignature {
        flag: 1 << 4,
        name: "mcafee-ens",
        marker: "libmfe",
    },
];

/// Process-wide, append-only set of detected interference sources.
///
/// Set early in the orchestrator, consulted by the purification engine to
/// decide retry aggressiveness; never cleared for the life of the process.
#[derive(Debug, Default)]
pub struct AdversaryBitmask(AtomicU32);

impl AdversaryBitmask {
    pub fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    pub fn record(&self, flag: u32) {
        self.0.fetch_or(flag, Ordering::AcqRel);
    }

    pub fn record_unknown(&self) {
        self.record(ADVERSARY_UNKNOWN);
    }

    /// Record the adversary whose marker matches the given module path, or
    /// the unknown flag if none does. Returns the flag recorded.
    pub fn record_from_module_path(&self, path: &str) -> u32 {
        let lowered = path.to_ascii_lowercase();
        for signature in KNOWN_ADVERSARIES {
            if lowered.contains(signature.marker) {
                self.record(signature.flag);
                return signature.flag;
            }
        }
        self.record_unknown();
        ADVERSARY_UNKNOWN
    }

    pub fn contains(&self, flag: u32) -> bool {
        self.raw() & flag != 0
    }

    pub fn is_empty(&self) -> bool {
        self.raw() == 0
    }

    pub fn raw(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }

    /// Names of all matched known adversaries, for diagnostics.
    pub fn known_names(&self) -> Vec<&'static str> {
        let raw = self.raw();
        KNOWN_ADVERSARIES
            .iter()
            .filter(|signature| raw & signature.flag != 0)
            .map(|signature| signature.name)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitmask_is_append_only() {
        let mask = AdversaryBitmask::new();
        assert!(mask.is_empty());

        let flag = mask.record_from_module_path("/opt/CrowdStrike/falcon-sensor/inject.so");
        assert_ne!(flag, ADVERSARY_UNKNOWN);
        assert!(mask.contains(flag));

        mask.record_from_module_path("/tmp/mystery.so");
        assert!(mask.contains(ADVERSARY_UNKNOWN));
        assert!(mask.contains(flag), "earlier flags are never cleared");
        assert_eq!(mask.known_names(), vec!["crowdstrike-falcon"]);
    }
}
