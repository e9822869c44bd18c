//! Procfs-backed inspector for a stopped child process.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};

use tracing::warn;

use crate::engine::{Anomaly, ProcessInspector};
use crate::errors::{PurifyError, PurifyResult};
use crate::maps::{parse_proc_maps, MemoryRegion};

/// Largest file-backed region compared against its on-disk image.
const MAX_COMPARE_BYTES: u64 = 64 * 1024 * 1024;

/// Special regions the kernel maps into every process; never anomalies.
const KERNEL_REGIONS: &[&str] = &["[vdso]", "[vsyscall]", "[vectors]", "[sigpage]"];

/// Inspector reading a target's memory through `/proc/[pid]/mem`.
///
/// The target must be stopped (the controller holds it in SIGSTOP during
/// purification) and this process must be its ptrace-eligible parent.
/// Byte restoration goes straight through procfs; freeing a region and
/// dropping its protection run a syscall inside the target via
/// [`crate::RemoteProcess`].
pub struct ProcfsInspector {
    pid: u32,
    /// Canonical paths of modules that passed verification.
    allowed_modules: Vec<String>,
}

impl ProcfsInspector {
    pub fn new(pid: u32, allowed_modules: Vec<String>) -> Self {
        Self {
            pid,
            allowed_modules,
        }
    }

    fn is_allowed(&self, path: &str) -> bool {
        self.allowed_modules
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(path))
    }

    fn read_region(&self, region: &MemoryRegion) -> io::Result<Vec<u8>> {
        let mut file = File::open(format!("/proc/{}/mem", self.pid))?;
        file.seek(SeekFrom::Start(region.start))?;

        let size = region.size().min(MAX_COMPARE_BYTES) as usize;
        let mut buf = vec![0u8; size];

        // Process memory reads can fail partially (unmapped pages, races).
        // Read what we can and truncate.
        match file.read(&mut buf) {
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(e) if e.kind() == io::ErrorKind::Other || e.raw_os_error() == Some(libc::EIO) => {
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    /// Compare a verified module's executable region against the on-disk
    /// image; returns the divergent span, if any.
    fn diff_against_disk(&self, region: &MemoryRegion) -> PurifyResult<Option<(u64, usize)>> {
        let live = self.read_region(region)?;
        if live.is_empty() {
            return Ok(None);
        }

        let mut disk_file = File::open(&region.path)?;
        disk_file.seek(SeekFrom::Start(region.offset))?;
        let mut disk = vec![0u8; live.len()];
        let n = disk_file.read(&mut disk)?;
        disk.truncate(n);

        let compare_len = live.len().min(disk.len());
        let mut divergence: Option<usize> = None;
        for i in 0..compare_len {
            if live[i] != disk[i] {
                divergence = Some(i);
                break;
            }
        }

        let Some(first) = divergence else {
            return Ok(None);
        };
        let mut last = first;
        for i in (first..compare_len).rev() {
            if live[i] != disk[i] {
                last = i;
                break;
            }
        }
        Ok(Some((first as u64, last - first + 1)))
    }
}

impl ProcessInspector for ProcfsInspector {
    fn scan(&mut self) -> PurifyResult<Vec<Anomaly>> {
        let regions = parse_proc_maps(self.pid)?;
        let mut anomalies = Vec::new();
        let mut disallowed_seen: Vec<String> = Vec::new();

        for region in &regions {
            if !region.is_executable() {
                continue;
            }

            if !region.is_file_backed() {
                if KERNEL_REGIONS.iter().any(|k| region.path == *k) {
                    continue;
                }
                anomalies.push(Anomaly::UnbackedExecutableRegion {
                    start: region.start,
                    len: region.size(),
                });
                continue;
            }

            if !self.is_allowed(&region.path) {
                if !disallowed_seen.contains(&region.path) {
                    disallowed_seen.push(region.path.clone());
                    anomalies.push(Anomaly::DisallowedModule {
                        module: region.path.clone(),
                    });
                }
                continue;
            }

            match self.diff_against_disk(region) {
                Ok(Some((offset_in_region, len))) => {
                    anomalies.push(Anomaly::PatchedModuleCode {
                        module: region.path.clone(),
                        region_start: region.start + offset_in_region,
                        file_offset: region.offset + offset_in_region,
                        len,
                    });
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(
                        module = %region.path,
                        error = %err,
                        "could not compare module against disk image"
                    );
                }
            }
        }

        Ok(anomalies)
    }

    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    fn free_region(&mut self, start: u64, len: u64) -> PurifyResult<bool> {
        let attempt =
            crate::RemoteProcess::attach(self.pid).and_then(|mut remote| remote.munmap(start, len));
        match attempt {
            Ok(()) => Ok(true),
            Err(err) => {
                warn!(
                    start = format_args!("{:#x}", start),
                    error = %err,
                    "could not unmap region; falling back to non-executable"
                );
                Ok(false)
            }
        }
    }

    #[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
    fn free_region(&mut self, _start: u64, _len: u64) -> PurifyResult<bool> {
        // No remote-syscall support on this target.
        Ok(false)
    }

    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    fn make_region_non_executable(&mut self, start: u64, len: u64) -> PurifyResult<()> {
        let mut remote = crate::RemoteProcess::attach(self.pid)?;
        remote.mprotect(start, len, libc::PROT_READ as u64)
    }

    #[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
    fn make_region_non_executable(&mut self, _start: u64, _len: u64) -> PurifyResult<()> {
        Err(PurifyError::Unsupported(
            "changing foreign region protection needs remote syscalls",
        ))
    }

    fn restore_module_bytes(
        &mut self,
        module: &str,
        region_start: u64,
        file_offset: u64,
        len: usize,
    ) -> PurifyResult<()> {
        let mut disk_file = File::open(module)?;
        disk_file.seek(SeekFrom::Start(file_offset))?;
        let mut pristine = vec![0u8; len];
        disk_file
            .read_exact(&mut pristine)
            .map_err(|err| PurifyError::MemoryAccess {
                pid: self.pid,
                detail: format!("read pristine bytes of {}: {}", module, err),
            })?;

        let mut mem = OpenOptions::new()
            .write(true)
            .open(format!("/proc/{}/mem", self.pid))?;
        mem.seek(SeekFrom::Start(region_start))?;
        mem.write_all(&pristine)
            .map_err(|err| PurifyError::MemoryAccess {
                pid: self.pid,
                detail: format!("restore bytes at {:#x}: {}", region_start, err),
            })?;
        Ok(())
    }

    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    fn unload_module(&mut self, module: &str) -> PurifyResult<()> {
        let regions = parse_proc_maps(self.pid)?;
        let targets: Vec<&MemoryRegion> =
            regions.iter().filter(|r| r.path == module).collect();
        if targets.is_empty() {
            // Already gone; an earlier fix or the module's own teardown won.
            return Ok(());
        }
        let mut remote = crate::RemoteProcess::attach(self.pid)?;
        for region in targets {
            remote.munmap(region.start, region.size())?;
        }
        Ok(())
    }

    #[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
    fn unload_module(&mut self, _module: &str) -> PurifyResult<()> {
        Err(PurifyError::Unsupported(
            "unloading a foreign module needs remote syscalls",
        ))
    }
}
