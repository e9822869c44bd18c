use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::errors::{InterceptError, InterceptResult};
use crate::map_exec::MapExecGuard;

/// Longest library name the loader gate will even look at.
pub const MAX_LIBRARY_NAME: usize = 260;

/// Known-hostile preload/injection libraries, rejected by basename before
/// any path resolution happens.
const DENIED_LIBRARIES: &[&str] = &["libprocesshider.so", "beurk.so", "jynx2.so"];

/// Runtime-linkage "virtual" libraries with no backing file; the loader
/// resolves these internally and there is nothing on disk to verify.
const VIRTUAL_LIBRARIES: &[&str] = &["linux-vdso.so.1", "linux-gate.so.1"];

/// How a library name resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedLibrary {
    /// No backing file; pass through to the real loader untouched.
    Virtual(String),
    /// Resolved to a verified on-disk file; the real loader must be invoked
    /// with exactly this path.
    Disk(PathBuf),
}

/// Guard for the dynamic-library-load interception point.
pub struct LibraryLoadGuard {
    /// The trusted system library directory, searched first.
    system_dir: PathBuf,
    /// The application's own directory, searched second.
    app_dir: PathBuf,
}

impl LibraryLoadGuard {
    pub fn new(system_dir: PathBuf, app_dir: PathBuf) -> Self {
        Self { system_dir, app_dir }
    }

    /// Police one load request. Name-level rejections happen before any
    /// file is opened; in particular a remote path never touches the
    /// file system at all.
    pub fn resolve_and_verify(
        &self,
        name: &str,
        alternate_dir: Option<&Path>,
        map_exec: &MapExecGuard,
    ) -> InterceptResult<ResolvedLibrary> {
        if name.len() > MAX_LIBRARY_NAME {
            warn!(len = name.len(), "overlong library name rejected");
            return Err(InterceptError::NameTooLong {
                name: name.to_string(),
                limit: MAX_LIBRARY_NAME,
            });
        }

        if is_remote_path(name) {
            warn!(name, "remote library path rejected without file access");
            return Err(InterceptError::RemotePath(name.to_string()));
        }

        let basename = basename_of(name);
        if DENIED_LIBRARIES
            .iter()
            .any(|denied| basename.eq_ignore_ascii_case(denied))
        {
            warn!(name, "deny-listed library rejected");
            return Err(InterceptError::DeniedName(name.to_string()));
        }

        if VIRTUAL_LIBRARIES
            .iter()
            .any(|virt| name.eq_ignore_ascii_case(virt))
        {
            debug!(name, "virtual runtime library passed through");
            return Ok(ResolvedLibrary::Virtual(name.to_string()));
        }

        let resolved = self.resolve_path(name, alternate_dir)?;
        map_exec.authorize(&resolved)?;
        Ok(ResolvedLibrary::Disk(resolved))
    }

    /// Search-order resolution matching what the real loader would do for
    /// this process: absolute paths are taken as-is, everything else is
    /// looked up in the trusted system directory, then the application
    /// directory, then any caller-supplied alternate directory.
    fn resolve_path(&self, name: &str, alternate_dir: Option<&Path>) -> InterceptResult<PathBuf> {
        let requested = Path::new(name);
        if requested.is_absolute() {
            if requested.exists() {
                return Ok(requested.to_path_buf());
            }
            return Err(InterceptError::NotFound(name.to_string()));
        }

        let mut search_dirs: Vec<&Path> = vec![&self.system_dir, &self.app_dir];
        if let Some(alternate) = alternate_dir {
            search_dirs.push(alternate);
        }

        for dir in search_dirs {
            let candidate = dir.join(requested);
            if candidate.exists() {
                return Ok(candidate);
            }
        }
        Err(InterceptError::NotFound(name.to_string()))
    }
}

impl LibraryLoadGuard {
    /// Resolution-only entry point for the deferred-import queue: same
    /// search order, no verification, no policy errors.
    pub fn resolve_for_import(&self, name: &str) -> Option<PathBuf> {
        if name.len() > MAX_LIBRARY_NAME || is_remote_path(name) {
            return None;
        }
        self.resolve_path(name, None).ok()
    }
}

fn is_remote_path(name: &str) -> bool {
    name.starts_with("\\\\") || name.starts_with("//") || name.contains("://")
}

fn basename_of(name: &str) -> &str {
    name.rsplit(['/', '\\']).next().unwrap_or(name)
}
