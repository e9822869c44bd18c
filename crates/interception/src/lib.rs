//! Code interception layer.
//!
//! Ensures no executable code enters the supervised process without passing
//! the trust verifier: executable file mappings, dynamic library loads, and
//! asynchronous callback dispatch are all policed here. The hooks themselves
//! are abstracted behind [`Interceptor`] so the tamper self-check and
//! reinstall behavior is testable independently of the patching mechanism.

mod callback_gate;
mod errors;
mod interceptor;
mod lib_load;
mod map_exec;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::debug;

use verification::{TrustVerdict, TrustVerifier, VerificationCache};

pub use callback_gate::{CallbackDecision, CallbackGate};
pub use errors::{InterceptError, InterceptResult};
pub use interceptor::{
    self_check_and_repair, Interceptor, InterceptorState, PatchSite, PatchedInterceptor,
};
pub use lib_load::{LibraryLoadGuard, ResolvedLibrary, MAX_LIBRARY_NAME};
pub use map_exec::MapExecGuard;

/// The assembled interception layer for one process.
pub struct InterceptionLayer {
    cache: Arc<VerificationCache>,
    verifier: Arc<dyn TrustVerifier>,
    map_exec: MapExecGuard,
    lib_load: LibraryLoadGuard,
    gate: CallbackGate,
    hooks: Vec<Box<dyn Interceptor>>,
    /// Deferred deep checks that came back rejected. The orchestrator drains
    /// these and treats every entry as a fatal integrity error.
    integrity_failures: Mutex<Vec<(PathBuf, TrustVerdict)>>,
}

impl InterceptionLayer {
    pub fn new(
        cache: Arc<VerificationCache>,
        verifier: Arc<dyn TrustVerifier>,
        system_dir: PathBuf,
        app_dir: PathBuf,
        hooks: Vec<Box<dyn Interceptor>>,
    ) -> Self {
        let map_exec = MapExecGuard::new(Arc::clone(&cache), Arc::clone(&verifier));
        let lib_load = LibraryLoadGuard::new(system_dir, app_dir);
        Self {
            cache,
            verifier,
            map_exec,
            lib_load,
            gate: CallbackGate::new(),
            hooks,
            integrity_failures: Mutex::new(Vec::new()),
        }
    }

    /// Install every hook. Calling this twice leaves the same patched bytes
    /// as calling it once.
    pub fn install(&mut self) {
        for hook in &mut self.hooks {
            hook.install();
            debug!(hook = hook.name(), state = %hook.state(), "intercept installed");
        }
    }

    pub fn uninstall(&mut self) {
        for hook in &mut self.hooks {
            hook.uninstall();
        }
    }

    /// Opportunistic tamper check over all hooks; returns how many needed
    /// to be quietly reinstalled.
    pub fn self_check(&mut self, sole_thread: bool) -> usize {
        self_check_and_repair(&mut self.hooks, sole_thread)
    }

    pub fn hook_states(&self) -> Vec<(&'static str, InterceptorState)> {
        self.hooks
            .iter()
            .map(|hook| (hook.name(), hook.state()))
            .collect()
    }

    /// The dynamic-library-load interception point.
    ///
    /// Quiet points before and after the load drain the cache's deferred
    /// work, and every load event doubles as a hook self-check trigger.
    pub fn on_library_load(
        &mut self,
        name: &str,
        alternate_dir: Option<&Path>,
    ) -> InterceptResult<ResolvedLibrary> {
        self.drain_deferred_work();
        self.self_check(false);

        let resolved = self
            .lib_load
            .resolve_and_verify(name, alternate_dir, &self.map_exec);

        self.drain_deferred_work();
        resolved
    }

    /// The map-executable-from-file interception point, pre-map side.
    pub fn on_map_executable(&self, backing: &Path) -> InterceptResult<()> {
        self.map_exec.authorize(backing)
    }

    /// Post-map confirmation of the mapping the OS actually created.
    pub fn on_mapping_created(&self, verified: &Path, actual_backing: &Path) -> InterceptResult<()> {
        self.map_exec.confirm(verified, actual_backing)
    }

    /// The asynchronous-callback-dispatch interception point.
    pub fn on_callback(&self, tag: &str) -> CallbackDecision {
        self.gate.decide(tag)
    }

    pub fn callback_gate(&self) -> &CallbackGate {
        &self.gate
    }

    /// Integrity failures discovered by deferred deep checks since the last
    /// call. Any entry here must end the process.
    pub fn take_integrity_failures(&self) -> Vec<(PathBuf, TrustVerdict)> {
        self.integrity_failures
            .lock()
            .map(|mut failures| std::mem::take(&mut *failures))
            .unwrap_or_default()
    }

    fn drain_deferred_work(&self) {
        let mut rejected = self
            .cache
            .process_deferred_deep_checks(self.verifier.as_ref());

        let lib_load = &self.lib_load;
        let resolve = |name: &str| lib_load.resolve_for_import(name);
        rejected.extend(
            self.cache
                .process_deferred_imports(self.verifier.as_ref(), &resolve),
        );

        if !rejected.is_empty() {
            if let Ok(mut failures) = self.integrity_failures.lock() {
                failures.extend(rejected);
            }
        }
    }
}
