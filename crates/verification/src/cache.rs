use std::collections::VecDeque;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, Ordering};
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::errors::{VerifyError, VerifyResult};
use crate::facade::{TrustVerifier, Verification, VerifyFlags};
use crate::hash_path;
use crate::identity::{FileIdentity, PinnedFile};
use crate::imports::enumerate_needed_libraries;
use crate::verdict::TrustVerdict;

/// Bucket count for the verdict table. Small prime; the working set is the
/// set of distinct binaries a VM process loads, a few dozen at most.
pub const CACHE_BUCKET_COUNT: usize = 29;

/// Cache hits stop being logged past this count unless the count is an
/// exact power of two, so hot paths stay quiet but still show liveness.
const HIT_LOG_THRESHOLD: u32 = 8;

/// One memoized trust verdict for a fully-resolved on-disk path.
pub struct CacheEntry {
    path: PathBuf,
    path_hash: u64,
    identity: FileIdentity,
    verdict: TrustVerdict,
    flags: VerifyFlags,
    confirmed_by_deep_check: AtomicBool,
    hits: AtomicU32,
    // The pinned handle is held, not read, after insertion.
    _handle: Box<dyn PinnedFile>,
    next: AtomicPtr<CacheEntry>,
}

impl CacheEntry {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn identity(&self) -> FileIdentity {
        self.identity
    }

    pub fn verdict(&self) -> &TrustVerdict {
        &self.verdict
    }

    pub fn flags(&self) -> VerifyFlags {
        self.flags
    }

    pub fn is_confirmed_by_deep_check(&self) -> bool {
        self.confirmed_by_deep_check.load(Ordering::Acquire)
    }

    pub fn hit_count(&self) -> u32 {
        self.hits.load(Ordering::Relaxed)
    }

    fn record_hit(&self) {
        let count = self.hits.fetch_add(1, Ordering::Relaxed).saturating_add(1);
        if count <= HIT_LOG_THRESHOLD || count.is_power_of_two() {
            debug!(path = %self.path.display(), hits = count, verdict = %self.verdict, "cache hit");
        }
    }
}

/// Outcome of a cache lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLookup {
    Hit,
    /// An entry exists for the path but the file behind it has changed
    /// identity; the caller must re-verify from scratch.
    StaleIdentity,
    Miss,
}

/// Process-lifetime verdict cache.
///
/// Bucket heads are lock-free: readers walk chains without locking and
/// inserters publish with a compare-and-swap. A lost insert race discards
/// the loser's entry, closing its pinned handle. Entries are never removed,
/// so chain pointers stay valid for the life of the cache.
pub struct VerificationCache {
    buckets: Box<[AtomicPtr<CacheEntry>; CACHE_BUCKET_COUNT]>,
    deferred_deep_checks: Mutex<VecDeque<PathBuf>>,
    deferred_imports: Mutex<VecDeque<String>>,
}

impl Default for VerificationCache {
    fn default() -> Self {
        Self::new()
    }
}

impl VerificationCache {
    pub fn new() -> Self {
        Self {
            buckets: Box::new([const { AtomicPtr::new(ptr::null_mut()) }; CACHE_BUCKET_COUNT]),
            deferred_deep_checks: Mutex::new(VecDeque::new()),
            deferred_imports: Mutex::new(VecDeque::new()),
        }
    }

    /// Look up a verdict for `path`, trusting it only if the caller's view
    /// of the file identity still matches the one recorded at verification.
    pub fn lookup(&self, path: &Path, current: FileIdentity) -> (CacheLookup, Option<&CacheEntry>) {
        let hash = hash_path(&path.to_string_lossy());
        match self.find(hash, path) {
            Some(entry) if entry.identity == current => {
                entry.record_hit();
                (CacheLookup::Hit, Some(entry))
            }
            Some(entry) => {
                warn!(
                    path = %path.display(),
                    cached_inode = entry.identity.inode,
                    current_inode = current.inode,
                    "cached file identity changed; verdict not trusted"
                );
                (CacheLookup::StaleIdentity, None)
            }
            None => (CacheLookup::Miss, None),
        }
    }

    /// Insert a fresh verdict. Handle ownership transfers to the cache; on a
    /// duplicate-detection race against an entry with the same file identity
    /// the new entry (and its handle) is dropped and the surviving entry
    /// returned. An existing entry with a *different* identity is stale (the
    /// file was replaced): the fresh entry is published in front of it, so
    /// every later walk finds the fresh verdict first and the stale node is
    /// only ever shadowed, never returned.
    ///
    /// Returns the entry now authoritative for the path and whether this
    /// call inserted it.
    pub fn insert(
        &self,
        path: &Path,
        handle: Box<dyn PinnedFile>,
        identity: FileIdentity,
        verdict: TrustVerdict,
        flags: VerifyFlags,
        confirmed_by_deep_check: bool,
    ) -> (&CacheEntry, bool) {
        let hash = hash_path(&path.to_string_lossy());
        let mut new_entry = Box::new(CacheEntry {
            path: path.to_path_buf(),
            path_hash: hash,
            identity,
            verdict,
            flags,
            confirmed_by_deep_check: AtomicBool::new(confirmed_by_deep_check),
            hits: AtomicU32::new(0),
            _handle: handle,
            next: AtomicPtr::new(ptr::null_mut()),
        });

        let bucket = &self.buckets[(hash % CACHE_BUCKET_COUNT as u64) as usize];
        loop {
            let head = bucket.load(Ordering::Acquire);
            if let Some(existing) = self.find_from(head, hash, path) {
                if existing.identity == identity {
                    // Lost the race; discarding the duplicate closes its
                    // handle.
                    debug!(path = %path.display(), "duplicate cache insert discarded");
                    return (existing, false);
                }
                // The file behind the path was replaced since the existing
                // entry was verified. A stale Accept must never shadow the
                // fresh verdict, so fall through and publish at the head.
                warn!(
                    path = %path.display(),
                    stale_inode = existing.identity.inode,
                    fresh_inode = identity.inode,
                    "superseding stale cache entry for replaced file"
                );
            }

            new_entry.next.store(head, Ordering::Relaxed);
            let raw = Box::into_raw(new_entry);
            match bucket.compare_exchange(head, raw, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => {
                    // SAFETY: `raw` was just published and entries are never
                    // freed while the cache is alive, so the reference is
                    // valid for the cache's lifetime.
                    return (unsafe { &*raw }, true);
                }
                Err(_) => {
                    // SAFETY: the CAS failed, so `raw` was never published
                    // and this thread still owns it exclusively.
                    new_entry = unsafe { Box::from_raw(raw) };
                }
            }
        }
    }

    /// Whether any entry exists for `path`, regardless of identity.
    pub fn contains_path(&self, path: &Path) -> bool {
        let hash = hash_path(&path.to_string_lossy());
        self.find(hash, path).is_some()
    }

    /// Full verification entry point: consult the cache, verify on a miss or
    /// stale identity, and memoize the fresh verdict. Provisional verdicts
    /// are queued for deferred deep re-confirmation.
    pub fn verify_path(
        &self,
        verifier: &dyn TrustVerifier,
        path: &Path,
        flags: VerifyFlags,
    ) -> VerifyResult<&CacheEntry> {
        let file = std::fs::File::open(path).map_err(|err| VerifyError::IdentityProbe {
            path: path.to_path_buf(),
            detail: err.to_string(),
        })?;
        let identity = file.identity()?;

        if let (CacheLookup::Hit, Some(entry)) = self.lookup(path, identity) {
            return Ok(entry);
        }

        let mut image = Vec::with_capacity(identity.size as usize);
        (&file).read_to_end(&mut image)?;
        let Verification {
            verdict,
            confirmed_by_deep_check,
        } = verifier.verify_image(path, &image, flags);

        if verdict.is_accepted() && flags.is_image {
            self.schedule_imports_for_verification(&image);
        }
        if !confirmed_by_deep_check {
            self.schedule_deferred_deep_check(path);
        }

        let (entry, _inserted) = self.insert(
            path,
            Box::new(file),
            identity,
            verdict,
            flags,
            confirmed_by_deep_check,
        );
        Ok(entry)
    }

    /// Queue a path whose fast verdict is pending the deep verifier.
    pub fn schedule_deferred_deep_check(&self, path: &Path) {
        if let Ok(mut queue) = self.deferred_deep_checks.lock() {
            queue.push_back(path.to_path_buf());
        }
    }

    /// Enumerate a verified module's declared imports and queue any not yet
    /// cached, anticipating the loader chasing the dependency chain.
    pub fn schedule_imports_for_verification(&self, image: &[u8]) {
        let Ok(needed) = enumerate_needed_libraries(image) else {
            return;
        };
        if let Ok(mut queue) = self.deferred_imports.lock() {
            for name in needed {
                if !queue.contains(&name) {
                    queue.push_back(name);
                }
            }
        }
    }

    /// Drain deferred deep checks now that the deep verifier may be up.
    /// Entries that still cannot run are left queued. Returns the paths
    /// whose re-verification came back rejected; the caller treats any such
    /// path as a fatal integrity error.
    pub fn process_deferred_deep_checks(
        &self,
        verifier: &dyn TrustVerifier,
    ) -> Vec<(PathBuf, TrustVerdict)> {
        if !verifier.deep_check_ready() {
            return Vec::new();
        }

        let pending: Vec<PathBuf> = match self.deferred_deep_checks.lock() {
            Ok(mut queue) => queue.drain(..).collect(),
            Err(_) => return Vec::new(),
        };

        let mut rejections = Vec::new();
        for path in pending {
            let hash = hash_path(&path.to_string_lossy());
            let Some(entry) = self.find(hash, &path) else {
                continue;
            };
            let image = match std::fs::read(&path) {
                Ok(image) => image,
                Err(err) => {
                    rejections.push((
                        path.clone(),
                        TrustVerdict::reject(
                            crate::verdict::RejectReason::ContentMismatch,
                            format!("re-reading for deep check failed: {}", err),
                        ),
                    ));
                    continue;
                }
            };

            let verification = verifier.verify_image(&path, &image, entry.flags);
            if !verification.confirmed_by_deep_check {
                // Still not ready after all; keep it queued.
                self.schedule_deferred_deep_check(&path);
                continue;
            }
            if verification.verdict.is_accepted() {
                entry
                    .confirmed_by_deep_check
                    .store(true, Ordering::Release);
                debug!(path = %path.display(), "deferred deep check confirmed");
            } else {
                rejections.push((path, verification.verdict));
            }
        }
        rejections
    }

    /// Drain the deferred-import queue, resolving names to paths with the
    /// caller's loader rules and verifying anything not yet cached.
    pub fn process_deferred_imports(
        &self,
        verifier: &dyn TrustVerifier,
        resolve: &dyn Fn(&str) -> Option<PathBuf>,
    ) -> Vec<(PathBuf, TrustVerdict)> {
        let pending: Vec<String> = match self.deferred_imports.lock() {
            Ok(mut queue) => queue.drain(..).collect(),
            Err(_) => return Vec::new(),
        };

        let mut rejections = Vec::new();
        for name in pending {
            let Some(path) = resolve(&name) else {
                debug!(import = %name, "deferred import did not resolve; skipped");
                continue;
            };
            if self.contains_path(&path) {
                continue;
            }
            match self.verify_path(
                verifier,
                &path,
                VerifyFlags {
                    is_image: true,
                    resolved_without_symlinks: false,
                },
            ) {
                Ok(entry) if entry.verdict().is_accepted() => {}
                Ok(entry) => rejections.push((path, entry.verdict().clone())),
                Err(err) => {
                    debug!(import = %name, error = %err, "deferred import verification failed");
                }
            }
        }
        rejections
    }

    pub fn deferred_deep_check_len(&self) -> usize {
        self.deferred_deep_checks
            .lock()
            .map(|queue| queue.len())
            .unwrap_or(0)
    }

    pub fn deferred_import_len(&self) -> usize {
        self.deferred_imports
            .lock()
            .map(|queue| queue.len())
            .unwrap_or(0)
    }

    fn find(&self, hash: u64, path: &Path) -> Option<&CacheEntry> {
        let bucket = &self.buckets[(hash % CACHE_BUCKET_COUNT as u64) as usize];
        self.find_from(bucket.load(Ordering::Acquire), hash, path)
    }

    fn find_from(
        &self,
        mut cursor: *mut CacheEntry,
        hash: u64,
        path: &Path,
    ) -> Option<&CacheEntry> {
        while !cursor.is_null() {
            // SAFETY: chain nodes are only ever appended, never freed while
            // the cache is alive; a pointer read from a bucket or a `next`
            // field stays valid for the cache's lifetime.
            let entry = unsafe { &*cursor };
            if entry.path_hash == hash && paths_equivalent(&entry.path, path) {
                return Some(entry);
            }
            cursor = entry.next.load(Ordering::Acquire);
        }
        None
    }
}

impl Drop for VerificationCache {
    fn drop(&mut self) {
        for bucket in self.buckets.iter() {
            let mut cursor = bucket.swap(ptr::null_mut(), Ordering::AcqRel);
            while !cursor.is_null() {
                // SAFETY: &mut self guarantees exclusive access; every node
                // was created by Box::into_raw in insert().
                let entry = unsafe { Box::from_raw(cursor) };
                cursor = entry.next.load(Ordering::Relaxed);
            }
        }
    }
}

fn paths_equivalent(a: &Path, b: &Path) -> bool {
    let a = a.to_string_lossy();
    let b = b.to_string_lossy();
    if a.len() != b.len() {
        return false;
    }
    a.bytes().zip(b.bytes()).all(|(x, y)| {
        let x = if x == b'\\' { b'/' } else { x.to_ascii_lowercase() };
        let y = if y == b'\\' { b'/' } else { y.to_ascii_lowercase() };
        x == y
    })
}
