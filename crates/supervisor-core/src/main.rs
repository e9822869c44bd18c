//! vmsup: the process hardening supervisor.
//!
//! Generation 0 is the user's invocation; it re-spawns itself twice, each
//! generation re-verifying the installation and climbing the privileged
//! device ladder, before the final generation hands off to the application.

mod config;
mod device;
mod fatal;
mod generation;
mod hooks;
mod install_check;
mod orchestrator;
mod sanitizer;
mod startup_log;
mod thread_gate;

use std::cell::UnsafeCell;
use std::ffi::{OsStr, OsString};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use interception::{InterceptError, InterceptionLayer};
use purification::{purify, AdversaryBitmask, ProcfsInspector, PurifyConfig, PurifyOutcome};
use respawn::{
    ChildHandshake, ChildProcess, ChildProcessController, ChildRequestBlock, ControllerConfig,
    EventFd, RespawnError, RespawnResult, SpawnedChild,
};
use verification::{
    FileTrustVerifier, LocationOnlySignaturePolicy, TrustVerifier, TrustedLocationPolicy,
    VerificationCache,
};

use config::SupervisorConfig;
use device::DevNodeGateway;
use fatal::{fatal_report, FatalCategory};
use generation::Generation;
use install_check::VerifierInstallCheck;
use orchestrator::{early_process_init, LaunchFailure, LaunchPlan, Orchestrator};
use startup_log::StartupLog;
use thread_gate::ThreadGate;

/// Handshake record shared with the next generation. Parent and child run
/// the same image, so the record sits at the same offset from each one's
/// image base; the parent plants it through the child's memory while the
/// child is halted at its entry point.
struct BlockCell(UnsafeCell<ChildRequestBlock>);

// SAFETY: written by exactly one process at a time; the event pair is the
// hand-off primitive.
unsafe impl Sync for BlockCell {}

static REQUEST_BLOCK: BlockCell = BlockCell(UnsafeCell::new(ChildRequestBlock::zeroed()));

fn main() {
    let raw_args: Vec<OsString> = std::env::args_os().collect();
    let generation = Generation::detect_from_args(&raw_args);

    // A re-spawned generation halts right here; the parent plants the
    // handshake record and surveys the image while nothing is running yet.
    if generation != Generation::Original {
        if let Err(err) = respawn::halt_for_adoption() {
            eprintln!("vmsup: could not halt for adoption: {}", err);
            std::process::exit(1);
        }
    }

    // Scrub before anything else reads the environment.
    let scrub = sanitizer::scrub_environment();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();

    let (args, dropped_args) = sanitizer::purge_arguments(raw_args);
    let config = SupervisorConfig::load();
    let log = open_startup_log(&args, config.startup_log_cap);
    log.line(&format!("vmsup generation {} starting", generation.number()));
    for name in &dropped_args {
        log.line(&format!("purged argument {}", name));
    }

    match scrub {
        Ok(purged) => {
            for name in purged {
                log.line(&format!("purged environment variable {}", name));
            }
        }
        Err(failure) => fatal_report(&log, FatalCategory::Resource, &failure.to_string()),
    }

    match run(generation, &args, &config, &log) {
        Ok(code) => std::process::exit(code),
        Err(failure) => fatal_report(&log, failure.category, &failure.context),
    }
}

fn run(
    generation: Generation,
    args: &[OsString],
    config: &SupervisorConfig,
    log: &StartupLog,
) -> Result<i32, LaunchFailure> {
    let exe = std::env::current_exe().map_err(|err| resource("locate own executable", &err))?;

    // Argument zero carried the generation marker; put the real executable
    // path back now that generation is established.
    let mut args = args.to_vec();
    if generation != Generation::Original {
        if let Some(first) = args.first_mut() {
            *first = exe.clone().into_os_string();
        }
    }

    let app_dir = exe
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| config.install_root.clone());

    let cache = Arc::new(VerificationCache::new());
    let policy = TrustedLocationPolicy::new(vec![
        config.install_root.clone(),
        config.system_lib_dir.clone(),
        app_dir.clone(),
    ]);
    let verifier = Arc::new(FileTrustVerifier::new(
        policy,
        Box::new(LocationOnlySignaturePolicy),
    ));

    let table = hooks::DispatchTable::new();
    let mut layer = InterceptionLayer::new(
        Arc::clone(&cache),
        Arc::clone(&verifier) as Arc<dyn TrustVerifier>,
        config.system_lib_dir.clone(),
        app_dir,
        table.interceptors(),
    );
    let gate = Arc::new(ThreadGate::new());
    let parent_pid = match generation {
        Generation::Original => None,
        _ => Some(std::os::unix::process::parent_id()),
    };
    early_process_init(&mut layer, &gate, parent_pid)
        .map_err(|err| resource("early process init", &err))?;

    // The system runtime is resolved through the dispatch table, the same
    // path every later load takes, so a tampered slot is caught now.
    match table.dispatch_library_load(&mut layer, &config.runtime_lib, None) {
        Some(Ok(resolved)) => debug!(?resolved, "system runtime resolved through guard"),
        Some(Err(InterceptError::NotFound(name))) => {
            debug!(name = %name, "system runtime not on the search path; deferred to first use");
        }
        Some(Err(err)) => {
            return Err(LaunchFailure {
                category: FatalCategory::Integrity,
                context: format!("{}: {}", config.runtime_lib, err),
            });
        }
        None => {
            return Err(LaunchFailure {
                category: FatalCategory::Integrity,
                context: "library-load dispatch no longer routes to its guard".to_string(),
            });
        }
    }

    // Re-spawned generations check in with their parent before anything else
    // in this process gets to load a library.
    if generation != Generation::Original {
        child_side_handshake(config, log)?;
    }

    // Early startup is over; the deep checker can run, so drain what was
    // provisionally accepted.
    verifier.mark_deep_check_ready();
    let rejections = cache.process_deferred_deep_checks(verifier.as_ref());
    if let Some((path, verdict)) = rejections.first() {
        return Err(LaunchFailure {
            category: FatalCategory::Integrity,
            context: format!("{}: {}", path.display(), verdict),
        });
    }

    let install = VerifierInstallCheck::new(
        Arc::clone(&cache),
        Arc::clone(&verifier) as Arc<dyn TrustVerifier>,
        vec![exe.clone()],
    );
    let devices = DevNodeGateway::new(config.device_dir.clone());
    let orchestrator = Orchestrator::new(config.driverless, &install, &devices, log);

    match orchestrator.run_generation(generation)? {
        LaunchPlan::RaiseNext(_next) => raise_child(generation, &exe, &args, config, log),
        LaunchPlan::HandOff => Ok(application_entry(log)),
    }
}

/// Child half of the handshake: pick up the record the parent planted while
/// we were halted at entry, adopt the inherited events, ask the parent to
/// purify us, then release the channel.
fn child_side_handshake(
    config: &SupervisorConfig,
    log: &StartupLog,
) -> Result<(), LaunchFailure> {
    // SAFETY: this process is single-threaded here and the parent only
    // writes the block while we are stopped or blocked on the event.
    let block = unsafe { &mut *REQUEST_BLOCK.0.get() };
    if block.parent_event_handle == 0 {
        return Err(LaunchFailure {
            category: FatalCategory::Protocol,
            context: "generation marker present but no handshake record was planted".to_string(),
        });
    }
    // SAFETY: the handles were placed in the block by the parent that
    // spawned us and refer to descriptors we inherited.
    let parent_event = unsafe { EventFd::from_inherited_handle(block.parent_event_handle) };
    let child_event = unsafe { EventFd::from_inherited_handle(block.child_event_handle) };

    let mut handshake = ChildHandshake::new(block, &parent_event, &child_event);
    handshake
        .request_purification(Duration::from_secs(config.request_timeout_secs))
        .map_err(protocol)?;
    handshake.request_event_close().map_err(protocol)?;
    log.line("handshake with parent complete");
    Ok(())
}

/// Raise the next generation and mirror its exit code.
fn raise_child(
    generation: Generation,
    exe: &Path,
    args: &[OsString],
    config: &SupervisorConfig,
    log: &StartupLog,
) -> Result<i32, LaunchFailure> {
    let marker = generation.next_marker().ok_or_else(|| LaunchFailure {
        category: FatalCategory::Protocol,
        context: "final generation asked to raise a child".to_string(),
    })?;

    let parent_event = EventFd::new_inheritable().map_err(|e| respawn_failure(&e))?;
    let child_event = EventFd::new_inheritable().map_err(|e| respawn_failure(&e))?;

    // Re-use the (already purged) command line with argument zero swapped
    // for the next generation's marker.
    let rest: Vec<&OsStr> = args.iter().skip(1).map(OsString::as_os_str).collect();
    let mut child = SpawnedChild::spawn_suspended(exe, &rest, OsStr::new(marker))
        .map_err(|e| respawn_failure(&e))?;
    log.line(&format!(
        "raised generation {} as pid {}",
        generation.number() + 1,
        child.pid()
    ));

    let block_offset = request_block_offset(exe).map_err(|err| LaunchFailure {
        category: FatalCategory::Resource,
        context: format!("{:#}", err),
    })?;
    let mut controller_config = ControllerConfig::new(exe.display().to_string(), block_offset);
    controller_config.runtime_path = config.runtime_lib.clone();
    controller_config.request_timeout = Duration::from_secs(config.request_timeout_secs);
    let controller = ChildProcessController::new(controller_config);

    let adversaries = AdversaryBitmask::new();
    let allowed = allowed_modules(exe);
    let mut purify_hook = |target: &mut dyn respawn::ChildProcess| -> RespawnResult<PurifyOutcome> {
        let mut inspector = ProcfsInspector::new(target.pid(), allowed.clone());
        purify(&mut inspector, &adversaries, &PurifyConfig::default()).map_err(RespawnError::from)
    };

    let code = controller
        .supervise(&mut child, &parent_event, &child_event, &mut purify_hook)
        .map_err(|err| respawn_failure(&err))?;
    log.line(&format!("child exited with code {}", code));
    Ok(code)
}

/// Executable mappings a freshly spawned copy of ourselves is allowed to
/// carry: our own image plus whatever this process legitimately maps (both
/// run the identical image, so the sets match).
fn allowed_modules(exe: &Path) -> Vec<String> {
    let mut allowed = vec![exe.display().to_string()];
    if let Ok(regions) = purification::parse_proc_maps(std::process::id()) {
        for region in regions {
            if region.is_executable() && region.is_file_backed() {
                if !allowed.contains(&region.path) {
                    allowed.push(region.path);
                }
            }
        }
    }
    allowed
}

/// Lowest mapped address of our own image, from this process's memory map.
fn own_image_base(exe: &Path) -> anyhow::Result<u64> {
    let path = exe.display().to_string();
    let suffix = format!("/{}", path);
    let regions =
        purification::parse_proc_maps(std::process::id()).context("reading own memory map")?;
    regions
        .iter()
        .filter(|r| r.path == path || r.path.ends_with(&suffix))
        .map(|r| r.start)
        .min()
        .with_context(|| format!("{} not found in own memory map", path))
}

/// Offset of the handshake record within the image. The offset is identical
/// in every process running this binary, whatever base randomization picked,
/// so the parent can locate the record in the child from the child's own
/// image base.
fn request_block_offset(exe: &Path) -> anyhow::Result<u64> {
    let base = own_image_base(exe)?;
    let addr = REQUEST_BLOCK.0.get() as u64;
    if addr < base {
        anyhow::bail!(
            "request block {:#x} sits below the image base {:#x}",
            addr,
            base
        );
    }
    Ok(addr - base)
}

/// The supervisor's job ends here; the product links the real application
/// entry point in place of this.
fn application_entry(log: &StartupLog) -> i32 {
    log.line("application entry reached");
    info!("hardened startup complete; transferring to application");
    0
}

fn open_startup_log(args: &[OsString], cap: u64) -> StartupLog {
    for arg in args.iter().skip(1) {
        if let Some(text) = arg.to_str() {
            if let Some(path) = text.strip_prefix("--startup-log=") {
                return StartupLog::open(Path::new(path), cap);
            }
        }
    }
    StartupLog::disabled()
}

fn resource(what: &str, err: &dyn std::fmt::Display) -> LaunchFailure {
    LaunchFailure {
        category: FatalCategory::Resource,
        context: format!("{}: {}", what, err),
    }
}

fn protocol(err: RespawnError) -> LaunchFailure {
    LaunchFailure {
        category: FatalCategory::Protocol,
        context: err.to_string(),
    }
}

/// Failures raising a child: IO problems are resource errors, everything
/// else (timeouts, bad requests, a child-posted error report) is protocol.
/// A child error report's where/context/message ride along verbatim.
fn respawn_failure(err: &RespawnError) -> LaunchFailure {
    let category = match err {
        RespawnError::Io(_) | RespawnError::Spawn { .. } => FatalCategory::Resource,
        _ => FatalCategory::Protocol,
    };
    LaunchFailure {
        category,
        context: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startup_log_path_comes_from_the_command_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.log");
        let args = vec![
            OsString::from("vmsup"),
            OsString::from(format!("--startup-log={}", path.display())),
        ];
        let log = open_startup_log(&args, 1024);
        log.line("hello");
        assert!(std::fs::read_to_string(&path).unwrap().contains("hello"));
    }

    #[test]
    fn argument_zero_is_not_mistaken_for_the_log_flag() {
        let args = vec![OsString::from("--startup-log=/tmp/nope")];
        let log = open_startup_log(&args, 1024);
        log.line("dropped");
    }

    #[test]
    fn child_error_reports_map_to_protocol_fatals() {
        let err = RespawnError::ChildReported {
            where_tag: "earlyInit".to_string(),
            context: 2,
            status: 5,
            message: "bad module".to_string(),
        };
        let failure = respawn_failure(&err);
        assert_eq!(failure.category, FatalCategory::Protocol);
        assert!(failure.context.contains("earlyInit"));
        assert!(failure.context.contains("bad module"));
    }

    #[test]
    fn own_image_is_always_an_allowed_module() {
        let exe = std::env::current_exe().unwrap();
        let allowed = allowed_modules(&exe);
        assert!(allowed.contains(&exe.display().to_string()));
    }

    #[test]
    fn request_block_offset_is_within_the_image() {
        let exe = std::env::current_exe().unwrap();
        let base = own_image_base(&exe).unwrap();
        assert!(base > 0);
        let offset = request_block_offset(&exe).unwrap();
        assert_eq!(base + offset, REQUEST_BLOCK.0.get() as u64);
    }
}
