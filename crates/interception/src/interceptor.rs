use std::fmt;

use tracing::warn;

/// Length of the tight relative-jump prefix written first during a
/// non-atomic reinstall.
const SHORT_JUMP_PREFIX_LEN: usize = 2;

/// Readiness of one intercepted entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterceptorState {
    Uninstalled,
    Installed,
    /// Installed again after external tampering was detected.
    Reinstalled,
}

impl fmt::Display for InterceptorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Uninstalled => "uninstalled",
            Self::Installed => "installed",
            Self::Reinstalled => "reinstalled",
        };
        f.write_str(label)
    }
}

/// One intercepted operation, abstracted over the native hooking primitive.
pub trait Interceptor: Send {
    fn name(&self) -> &'static str;
    fn state(&self) -> InterceptorState;
    fn install(&mut self);
    fn uninstall(&mut self);
    /// Whether the live bytes at the entry point still match the expected
    /// patched bytes.
    fn is_intact(&self) -> bool;
    /// Re-apply the patch after tampering. `sole_thread` tells the backend
    /// whether it may write the whole patch at once or must use the
    /// best-effort staged write.
    fn reinstall(&mut self, sole_thread: bool);
}

/// Byte-level access to a hooked entry point. The real backend reads and
/// writes executable pages; tests supply an in-memory site.
pub trait PatchSite: Send {
    /// Pristine bytes as they were before installation.
    fn original_bytes(&self) -> &[u8];
    /// The bytes the hook is expected to leave at the entry point.
    fn patched_bytes(&self) -> &[u8];
    /// Current live bytes.
    fn read_live(&self) -> Vec<u8>;
    /// Overwrite live bytes starting at `offset`.
    fn write_live(&mut self, offset: usize, bytes: &[u8]);
}

/// Interceptor over a [`PatchSite`].
pub struct PatchedInterceptor {
    name: &'static str,
    site: Box<dyn PatchSite>,
    state: InterceptorState,
}

impl PatchedInterceptor {
    pub fn new(name: &'static str, site: Box<dyn PatchSite>) -> Self {
        Self {
            name,
            site,
            state: InterceptorState::Uninstalled,
        }
    }

    fn write_full_patch(&mut self) {
        let patched = self.site.patched_bytes().to_vec();
        self.site.write_live(0, &patched);
    }

    /// Staged write for when other threads may be executing the old bytes:
    /// land the short jump first so a racing thread at the entry point takes
    /// the detour, yield twice to let threads past the prefix drain, then
    /// write the remainder. This narrows the window, it does not close it;
    /// that residual race is accepted to keep startup cheap.
    fn write_staged_patch(&mut self) {
        let patched = self.site.patched_bytes().to_vec();
        let split = SHORT_JUMP_PREFIX_LEN.min(patched.len());
        self.site.write_live(0, &patched[..split]);
        std::thread::yield_now();
        std::thread::yield_now();
        if split < patched.len() {
            self.site.write_live(split, &patched[split..]);
        }
    }
}

impl Interceptor for PatchedInterceptor {
    fn name(&self) -> &'static str {
        self.name
    }

    fn state(&self) -> InterceptorState {
        self.state
    }

    fn install(&mut self) {
        // Idempotent: a second install writes the identical patch bytes.
        self.write_full_patch();
        if self.state == InterceptorState::Uninstalled {
            self.state = InterceptorState::Installed;
        }
    }

    fn uninstall(&mut self) {
        let original = self.site.original_bytes().to_vec();
        self.site.write_live(0, &original);
        self.state = InterceptorState::Uninstalled;
    }

    fn is_intact(&self) -> bool {
        self.site.read_live() == self.site.patched_bytes()
    }

    fn reinstall(&mut self, sole_thread: bool) {
        if sole_thread {
            self.write_full_patch();
        } else {
            self.write_staged_patch();
        }
        self.state = InterceptorState::Reinstalled;
    }
}

/// Opportunistic self-check over a set of interceptors: any installed hook
/// whose live bytes have drifted is quietly put back. Returns how many
/// hooks needed repair.
pub fn self_check_and_repair(hooks: &mut [Box<dyn Interceptor>], sole_thread: bool) -> usize {
    let mut repaired = 0;
    for hook in hooks.iter_mut() {
        if hook.state() == InterceptorState::Uninstalled {
            continue;
        }
        if !hook.is_intact() {
            warn!(hook = hook.name(), "intercept bytes tampered; reinstalling");
            hook.reinstall(sole_thread);
            repaired += 1;
        }
    }
    repaired
}
