//! In-process dispatch table behind the interception layer.
//!
//! The loader, exec-mapping, and async-callback paths in this process run
//! through wrapper functions that indirect through this table. A hook is
//! installed when its slot carries the guarded handler's address; tamper
//! detection compares the live slot bytes exactly the way a binary patch
//! would be compared, so the interceptor machinery is identical either way.

use std::path::Path;
use std::sync::{Arc, Mutex};

use interception::{
    CallbackDecision, InterceptResult, InterceptionLayer, Interceptor, PatchSite,
    PatchedInterceptor, ResolvedLibrary,
};

pub const HOOK_LIBRARY_LOAD: &str = "library-load";
pub const HOOK_MAP_EXEC: &str = "map-exec";
pub const HOOK_ASYNC_CALLBACK: &str = "async-callback";

/// One function-pointer slot. The live bytes are shared between the
/// interceptor that patches them and the wrappers that consult them.
#[derive(Clone)]
pub struct DispatchSlot {
    live: Arc<Mutex<[u8; 8]>>,
    original: [u8; 8],
    patched: [u8; 8],
}

impl DispatchSlot {
    fn new(passthrough: u64, guarded: u64) -> Self {
        Self {
            live: Arc::new(Mutex::new(passthrough.to_ne_bytes())),
            original: passthrough.to_ne_bytes(),
            patched: guarded.to_ne_bytes(),
        }
    }

    /// Whether calls through this slot currently reach the guarded handler.
    pub fn routes_to_guard(&self) -> bool {
        match self.live.lock() {
            Ok(live) => *live == self.patched,
            Err(_) => false,
        }
    }
}

impl PatchSite for DispatchSlot {
    fn original_bytes(&self) -> &[u8] {
        &self.original
    }

    fn patched_bytes(&self) -> &[u8] {
        &self.patched
    }

    fn read_live(&self) -> Vec<u8> {
        match self.live.lock() {
            Ok(live) => live.to_vec(),
            Err(_) => Vec::new(),
        }
    }

    fn write_live(&mut self, offset: usize, bytes: &[u8]) {
        if let Ok(mut live) = self.live.lock() {
            let end = (offset + bytes.len()).min(live.len());
            live[offset..end].copy_from_slice(&bytes[..end - offset]);
        }
    }
}

// Distinct bodies keep the linker from folding these into one address.
fn passthrough_handler() -> u32 {
    0
}

fn guarded_library_load() -> u32 {
    1
}

fn guarded_map_exec() -> u32 {
    2
}

fn guarded_async_callback() -> u32 {
    3
}

pub struct DispatchTable {
    pub library_load: DispatchSlot,
    pub map_exec: DispatchSlot,
    pub async_callback: DispatchSlot,
}

impl DispatchTable {
    pub fn new() -> Self {
        let passthrough = passthrough_handler as usize as u64;
        Self {
            library_load: DispatchSlot::new(passthrough, guarded_library_load as usize as u64),
            map_exec: DispatchSlot::new(passthrough, guarded_map_exec as usize as u64),
            async_callback: DispatchSlot::new(passthrough, guarded_async_callback as usize as u64),
        }
    }

    /// Library-load entry as the process sees it: the call reaches the guard
    /// only while the slot still carries the guard's address. `None` means a
    /// tampered slot routed the call straight to the unpoliced original.
    pub fn dispatch_library_load(
        &self,
        layer: &mut InterceptionLayer,
        name: &str,
        alternate_dir: Option<&Path>,
    ) -> Option<InterceptResult<ResolvedLibrary>> {
        self.library_load
            .routes_to_guard()
            .then(|| layer.on_library_load(name, alternate_dir))
    }

    /// Exec-mapping entry; same slot contract as [`Self::dispatch_library_load`].
    pub fn dispatch_map_executable(
        &self,
        layer: &InterceptionLayer,
        backing: &Path,
    ) -> Option<InterceptResult<()>> {
        self.map_exec
            .routes_to_guard()
            .then(|| layer.on_map_executable(backing))
    }

    /// Async-callback entry; same slot contract as [`Self::dispatch_library_load`].
    pub fn dispatch_callback(
        &self,
        layer: &InterceptionLayer,
        tag: &str,
    ) -> Option<CallbackDecision> {
        self.async_callback
            .routes_to_guard()
            .then(|| layer.on_callback(tag))
    }

    /// Interceptors over the table's slots, for the interception layer to
    /// own. The slots themselves stay with the table; live bytes are shared.
    pub fn interceptors(&self) -> Vec<Box<dyn Interceptor>> {
        vec![
            Box::new(PatchedInterceptor::new(
                HOOK_LIBRARY_LOAD,
                Box::new(self.library_load.clone()),
            )),
            Box::new(PatchedInterceptor::new(
                HOOK_MAP_EXEC,
                Box::new(self.map_exec.clone()),
            )),
            Box::new(PatchedInterceptor::new(
                HOOK_ASYNC_CALLBACK,
                Box::new(self.async_callback.clone()),
            )),
        ]
    }
}

impl Default for DispatchTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use interception::self_check_and_repair;

    #[test]
    fn fresh_slots_route_to_the_passthrough() {
        let table = DispatchTable::new();
        assert!(!table.library_load.routes_to_guard());
        assert!(!table.map_exec.routes_to_guard());
        assert!(!table.async_callback.routes_to_guard());
    }

    #[test]
    fn installing_routes_every_slot_to_its_guard() {
        let table = DispatchTable::new();
        let mut hooks = table.interceptors();
        for hook in hooks.iter_mut() {
            hook.install();
        }
        assert!(table.library_load.routes_to_guard());
        assert!(table.map_exec.routes_to_guard());
        assert!(table.async_callback.routes_to_guard());
    }

    #[test]
    fn tampered_slot_is_put_back_by_the_self_check() {
        let table = DispatchTable::new();
        let mut hooks = table.interceptors();
        for hook in hooks.iter_mut() {
            hook.install();
        }

        let mut rogue = table.map_exec.clone();
        rogue.write_live(0, &0xdeadbeefu64.to_ne_bytes());
        assert!(!table.map_exec.routes_to_guard());

        let repaired = self_check_and_repair(&mut hooks, true);
        assert_eq!(repaired, 1);
        assert!(table.map_exec.routes_to_guard());
    }

    #[test]
    fn tampered_slot_bypasses_the_guard_until_repaired() {
        use std::sync::Arc;
        use verification::{
            FileTrustVerifier, LocationOnlySignaturePolicy, TrustVerifier, TrustedLocationPolicy,
            VerificationCache,
        };

        let dir = tempfile::tempdir().expect("tempdir");
        let module = dir.path().join("dropped.so");
        std::fs::write(&module, b"not from a trusted location").expect("write module");

        // No trusted roots: the guard rejects every mapping it sees.
        let cache = Arc::new(VerificationCache::new());
        let verifier = Arc::new(FileTrustVerifier::new(
            TrustedLocationPolicy::new(Vec::new()),
            Box::new(LocationOnlySignaturePolicy),
        ));
        let table = DispatchTable::new();
        let mut layer = interception::InterceptionLayer::new(
            Arc::clone(&cache),
            verifier as Arc<dyn TrustVerifier>,
            dir.path().join("sys"),
            dir.path().join("app"),
            table.interceptors(),
        );
        layer.install();

        let guarded = table.dispatch_map_executable(&layer, &module);
        assert!(
            matches!(guarded, Some(Err(_))),
            "installed guard must see and reject the mapping: {:?}",
            guarded.map(|r| r.is_ok())
        );

        let mut rogue = table.map_exec.clone();
        rogue.write_live(0, &0xdeadbeefu64.to_ne_bytes());
        assert!(
            table.dispatch_map_executable(&layer, &module).is_none(),
            "a tampered slot routes the call past the guard entirely"
        );

        layer.self_check(true);
        let repaired = table.dispatch_map_executable(&layer, &module);
        assert!(matches!(repaired, Some(Err(_))), "repair restores policing");
    }
}
