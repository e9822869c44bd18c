//! The re-spawn ladder.
//!
//! Each generation re-verifies the installation, climbs one rung of the
//! device-access ladder, and either raises the next generation or hands off
//! to the application. Failures never fall through; they become a categorized
//! fatal error the caller funnels into the one exit door.

use std::sync::Arc;

use interception::InterceptionLayer;
use tracing::{debug, info};

use crate::device::DeviceGateway;
use crate::fatal::FatalCategory;
use crate::generation::Generation;
use crate::install_check::InstallIntegrity;
use crate::startup_log::StartupLog;
use crate::thread_gate::ThreadGate;

/// What main has to do once a generation's checks all passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchPlan {
    /// Spawn the next generation and mirror its exit code.
    RaiseNext(Generation),
    /// Generation 2 only: run the application.
    HandOff,
}

/// A failure bound for the fatal funnel.
#[derive(Debug)]
pub struct LaunchFailure {
    pub category: FatalCategory,
    pub context: String,
}

pub struct Orchestrator<'a> {
    driverless: bool,
    install: &'a dyn InstallIntegrity,
    device: &'a dyn DeviceGateway,
    log: &'a StartupLog,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        driverless: bool,
        install: &'a dyn InstallIntegrity,
        device: &'a dyn DeviceGateway,
        log: &'a StartupLog,
    ) -> Self {
        Self {
            driverless,
            install,
            device,
            log,
        }
    }

    /// Run the checks of one generation. Integrity comes first at every
    /// rung; a corrupt installation must abort before any child exists.
    pub fn run_generation(&self, generation: Generation) -> Result<LaunchPlan, LaunchFailure> {
        self.log
            .line(&format!("generation {} starting checks", generation.number()));

        self.install
            .verify_installation()
            .map_err(|violation| LaunchFailure {
                category: FatalCategory::Integrity,
                context: violation.to_string(),
            })?;
        debug!(generation = generation.number(), "installation verified");

        match generation {
            Generation::Original => {
                if self.driverless {
                    info!("driverless mode; skipping restricted device pre-check");
                } else {
                    self.device.open_restricted().map_err(device_failure)?;
                }
                Ok(LaunchPlan::RaiseNext(Generation::Stub))
            }
            Generation::Stub => {
                // The stub endpoint is where the driver first verifies us.
                self.device.open_stub().map_err(device_failure)?;
                Ok(LaunchPlan::RaiseNext(Generation::Final))
            }
            Generation::Final => {
                self.device.open_full().map_err(device_failure)?;
                self.log.line("full device access granted; handing off");
                Ok(LaunchPlan::HandOff)
            }
        }
    }
}

fn device_failure(err: crate::device::DeviceError) -> LaunchFailure {
    let context = match serde_json::to_string(&err) {
        Ok(json) => json,
        Err(_) => err.to_string(),
    };
    LaunchFailure {
        category: FatalCategory::DeviceOpen,
        context,
    }
}

/// Early process init, run before the normal runtime is allowed to start:
/// install the interception layer, engage the thread gate, and start the
/// parent watchdog through the gate's narrow lift window.
pub fn early_process_init(
    layer: &mut InterceptionLayer,
    gate: &Arc<ThreadGate>,
    parent_pid: Option<u32>,
) -> std::io::Result<()> {
    layer.install();
    gate.engage();
    if let Some(pid) = parent_pid {
        let _watchdog = gate.spawn_parent_watchdog(pid)?;
    }
    debug!("early process init complete");
    Ok(())
}
