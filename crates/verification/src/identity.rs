use std::fs::File;
use std::path::Path;

use crate::errors::{VerifyError, VerifyResult};

/// File-system-level identity of an open file.
///
/// Cached verdicts are only trusted while the identity of the file behind
/// the path still matches; a delete+recreate at the same path changes the
/// inode and invalidates the hit. String comparison of paths is never used
/// for this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileIdentity {
    pub device: u64,
    pub inode: u64,
    pub size: u64,
    /// Seconds component of the last modification time. Editing a file in
    /// place changes this even when the size stays the same.
    pub mtime: i64,
}

/// A verified file pinned open for the process lifetime.
///
/// Keeping the handle open prevents the verified bytes from being replaced
/// underneath the cached verdict on platforms where unlink+recreate would
/// otherwise go unnoticed between verification and mapping.
pub trait PinnedFile: Send + Sync {
    fn identity(&self) -> VerifyResult<FileIdentity>;
}

impl PinnedFile for File {
    #[cfg(unix)]
    fn identity(&self) -> VerifyResult<FileIdentity> {
        use std::os::unix::fs::MetadataExt;

        let meta = self.metadata()?;
        Ok(FileIdentity {
            device: meta.dev(),
            inode: meta.ino(),
            size: meta.size(),
            mtime: meta.mtime(),
        })
    }

    #[cfg(not(unix))]
    fn identity(&self) -> VerifyResult<FileIdentity> {
        let meta = self.metadata()?;
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        Ok(FileIdentity {
            device: 0,
            inode: 0,
            size: meta.len(),
            mtime,
        })
    }
}

/// Open-and-probe helper for call sites that hold a path, not a handle.
pub fn identity_of_file(path: &Path) -> VerifyResult<(File, FileIdentity)> {
    let file = File::open(path).map_err(|err| VerifyError::IdentityProbe {
        path: path.to_path_buf(),
        detail: err.to_string(),
    })?;
    let identity = file.identity()?;
    Ok((file, identity))
}
