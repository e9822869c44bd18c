//! Environment and argument scrubbing.
//!
//! Runs before anything that could pull in a third-party-influenced library.
//! The denylists are static; whether a failed purge is fatal is part of each
//! entry, since some of these variables let an attacker point the loader or a
//! plugin system at arbitrary code.

use std::ffi::OsString;
use std::fmt;

use tracing::{debug, warn};

pub struct EnvRule {
    pub name: &'static str,
    pub fatal_on_purge_failure: bool,
}

/// Inherited variables scrubbed at startup. Plugin-path variables let other
/// software inject code into our plugin hosts; the loader-path variables do
/// the same at the dynamic-linker level.
pub const ENV_DENYLIST: &[EnvRule] = &[
    EnvRule {
        name: "QT_QPA_PLATFORM_PLUGIN_PATH",
        fatal_on_purge_failure: true,
    },
    EnvRule {
        name: "QT_PLUGIN_PATH",
        fatal_on_purge_failure: true,
    },
    EnvRule {
        name: "ALSA_MIXER_SIMPLE_MODULES",
        fatal_on_purge_failure: true,
    },
    EnvRule {
        name: "LADSPA_PATH",
        fatal_on_purge_failure: true,
    },
    EnvRule {
        name: "LD_PRELOAD",
        fatal_on_purge_failure: true,
    },
    EnvRule {
        name: "LD_LIBRARY_PATH",
        fatal_on_purge_failure: true,
    },
    EnvRule {
        name: "LD_AUDIT",
        fatal_on_purge_failure: false,
    },
];

pub struct ArgRule {
    pub name: &'static str,
    pub takes_value: bool,
}

/// Arguments silently dropped before the remainder is handed to the
/// application. `-platformpluginpath` would reintroduce exactly what the
/// env purge above removes.
pub const ARG_PURGE: &[ArgRule] = &[ArgRule {
    name: "-platformpluginpath",
    takes_value: true,
}];

#[derive(Debug)]
pub struct PurgeFailure {
    pub variable: &'static str,
}

impl fmt::Display for PurgeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "environment variable {} could not be purged",
            self.variable
        )
    }
}

impl std::error::Error for PurgeFailure {}

/// Remove every denylisted variable from the process environment, verifying
/// each removal took. Returns the names that were present, or the first
/// fatal-on-failure variable that would not go away.
pub fn scrub_environment() -> Result<Vec<&'static str>, PurgeFailure> {
    let mut purged = Vec::new();
    for rule in ENV_DENYLIST {
        if std::env::var_os(rule.name).is_none() {
            continue;
        }
        std::env::remove_var(rule.name);
        if std::env::var_os(rule.name).is_some() {
            if rule.fatal_on_purge_failure {
                return Err(PurgeFailure {
                    variable: rule.name,
                });
            }
            warn!(variable = rule.name, "variable survived the purge");
            continue;
        }
        debug!(variable = rule.name, "purged inherited variable");
        purged.push(rule.name);
    }
    Ok(purged)
}

/// Drop purge-listed arguments (and their values) from the command line.
/// Argument zero is never touched; generation detection already consumed it.
pub fn purge_arguments(args: Vec<OsString>) -> (Vec<OsString>, Vec<String>) {
    let mut kept = Vec::with_capacity(args.len());
    let mut dropped = Vec::new();
    let mut iter = args.into_iter();

    if let Some(arg0) = iter.next() {
        kept.push(arg0);
    }
    while let Some(arg) = iter.next() {
        let matched = ARG_PURGE
            .iter()
            .find(|rule| arg == OsString::from(rule.name));
        match matched {
            Some(rule) => {
                dropped.push(rule.name.to_string());
                if rule.takes_value {
                    iter.next();
                }
            }
            None => kept.push(arg),
        }
    }
    (kept, dropped)
}
