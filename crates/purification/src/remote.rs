//! Remote syscall execution inside a stopped target.
//!
//! The procfs inspector can rewrite bytes, but freeing a mapping or
//! changing its protection has to happen from inside the target. This
//! attaches with ptrace, plants a `syscall` instruction at the stopped
//! instruction pointer, single-steps it with scratch registers, and puts
//! the original word and registers back afterwards.

use std::ffi::c_void;

use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use tracing::{debug, warn};

use crate::errors::{PurifyError, PurifyResult};

pub const NR_MPROTECT: u64 = 10;
pub const NR_MUNMAP: u64 = 11;
pub const NR_GETPID: u64 = 39;

/// `syscall` encodes as 0f 05; planted into the low bytes of the word at
/// the stopped instruction pointer.
const SYSCALL_INSN: u64 = 0x050f;

/// A ptrace attachment to a stopped process. Detach re-delivers `SIGSTOP`
/// so the target is exactly as halted as it was found.
pub struct RemoteProcess {
    pid: Pid,
}

impl RemoteProcess {
    /// Attach to `pid`, which must already be in a signal stop. Fails with
    /// `MemoryAccess` when the kernel refuses the attach (YAMA scoping,
    /// missing privilege, or a foreign tracer already holding the target).
    pub fn attach(pid: u32) -> PurifyResult<Self> {
        let target = Pid::from_raw(pid as i32);
        ptrace::attach(target).map_err(|errno| trace_err(pid, "attach", errno))?;
        match waitpid(target, None) {
            Ok(WaitStatus::Stopped(_, _)) => {}
            Ok(other) => {
                let _ = ptrace::detach(target, None);
                return Err(PurifyError::MemoryAccess {
                    pid,
                    detail: format!("target not stopped after attach: {:?}", other),
                });
            }
            Err(errno) => {
                let _ = ptrace::detach(target, None);
                return Err(trace_err(pid, "wait after attach", errno));
            }
        }
        debug!(pid, "attached to stopped target");
        Ok(Self { pid: target })
    }

    /// Execute one syscall in the target with up to six arguments; returns
    /// the raw return value. Registers and the patched text word are
    /// restored whatever the outcome.
    pub fn syscall(&mut self, nr: u64, args: &[u64]) -> PurifyResult<i64> {
        let pid = self.pid.as_raw() as u32;
        let saved_regs =
            ptrace::getregs(self.pid).map_err(|errno| trace_err(pid, "read registers", errno))?;
        let ip = saved_regs.rip;
        let saved_word = ptrace::read(self.pid, ip as *mut c_void)
            .map_err(|errno| trace_err(pid, "read text word", errno))? as u64;

        let patched = (saved_word & !0xffff) | SYSCALL_INSN;
        unsafe { ptrace::write(self.pid, ip as *mut c_void, patched as *mut c_void) }
            .map_err(|errno| trace_err(pid, "plant syscall insn", errno))?;

        let mut regs = saved_regs;
        regs.rax = nr;
        regs.rdi = args.first().copied().unwrap_or(0);
        regs.rsi = args.get(1).copied().unwrap_or(0);
        regs.rdx = args.get(2).copied().unwrap_or(0);
        regs.r10 = args.get(3).copied().unwrap_or(0);
        regs.r8 = args.get(4).copied().unwrap_or(0);
        regs.r9 = args.get(5).copied().unwrap_or(0);

        let result = self.step_syscall(&regs);

        // Restore even when the step failed; a half-patched target is worse
        // than a failed fix.
        if let Err(errno) = unsafe { ptrace::write(self.pid, ip as *mut c_void, saved_word as *mut c_void) } {
            warn!(pid, error = %errno, "could not restore text word");
        }
        if let Err(errno) = ptrace::setregs(self.pid, saved_regs) {
            warn!(pid, error = %errno, "could not restore registers");
        }
        result
    }

    fn step_syscall(&mut self, regs: &libc::user_regs_struct) -> PurifyResult<i64> {
        let pid = self.pid.as_raw() as u32;
        ptrace::setregs(self.pid, *regs)
            .map_err(|errno| trace_err(pid, "load scratch registers", errno))?;
        ptrace::step(self.pid, None).map_err(|errno| trace_err(pid, "single-step", errno))?;
        match waitpid(self.pid, None) {
            Ok(WaitStatus::Stopped(_, _)) => {}
            Ok(other) => {
                return Err(PurifyError::MemoryAccess {
                    pid,
                    detail: format!("target not stopped after step: {:?}", other),
                });
            }
            Err(errno) => return Err(trace_err(pid, "wait after step", errno)),
        }
        let after =
            ptrace::getregs(self.pid).map_err(|errno| trace_err(pid, "read result", errno))?;
        Ok(after.rax as i64)
    }

    fn checked_syscall(&mut self, what: &str, nr: u64, args: &[u64]) -> PurifyResult<i64> {
        let result = self.syscall(nr, args)?;
        if (-4095..0).contains(&result) {
            return Err(PurifyError::MemoryAccess {
                pid: self.pid.as_raw() as u32,
                detail: format!("{} failed with errno {}", what, -result),
            });
        }
        Ok(result)
    }

    pub fn getpid(&mut self) -> PurifyResult<i64> {
        self.checked_syscall("getpid", NR_GETPID, &[])
    }

    pub fn munmap(&mut self, addr: u64, len: u64) -> PurifyResult<()> {
        self.checked_syscall("munmap", NR_MUNMAP, &[addr, len])?;
        Ok(())
    }

    pub fn mprotect(&mut self, addr: u64, len: u64, prot: u64) -> PurifyResult<()> {
        self.checked_syscall("mprotect", NR_MPROTECT, &[addr, len, prot])?;
        Ok(())
    }
}

impl Drop for RemoteProcess {
    fn drop(&mut self) {
        // The target was in a signal stop before we attached; hand the stop
        // back so the controller still owns when it runs.
        if let Err(errno) = ptrace::detach(self.pid, Some(Signal::SIGSTOP)) {
            warn!(pid = self.pid.as_raw(), error = %errno, "detach failed");
        }
    }
}

fn trace_err(pid: u32, what: &str, errno: nix::errno::Errno) -> PurifyError {
    PurifyError::MemoryAccess {
        pid,
        detail: format!("{}: {}", what, errno),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::kill;
    use std::process::Command;

    struct StoppedChild {
        pid: Pid,
    }

    impl StoppedChild {
        fn spawn() -> Self {
            let child = Command::new("/bin/sleep")
                .arg("30")
                .spawn()
                .expect("spawn sleeper");
            let pid = Pid::from_raw(child.id() as i32);
            kill(pid, Signal::SIGSTOP).expect("stop sleeper");
            loop {
                match waitpid(pid, Some(nix::sys::wait::WaitPidFlag::WUNTRACED)) {
                    Ok(WaitStatus::Stopped(_, _)) => break,
                    Ok(_) => continue,
                    Err(err) => panic!("waiting for stop: {}", err),
                }
            }
            Self { pid }
        }
    }

    impl Drop for StoppedChild {
        fn drop(&mut self) {
            let _ = kill(self.pid, Signal::SIGKILL);
            let _ = kill(self.pid, Signal::SIGCONT);
            let _ = waitpid(self.pid, None);
        }
    }

    #[test]
    fn remote_getpid_answers_with_the_target_pid() {
        let child = StoppedChild::spawn();
        // Restricted environments refuse ptrace outright; nothing to test
        // there.
        let mut remote = match RemoteProcess::attach(child.pid.as_raw() as u32) {
            Ok(remote) => remote,
            Err(err) => {
                eprintln!("skipping: ptrace unavailable: {}", err);
                return;
            }
        };
        let answered = remote.getpid().expect("remote getpid");
        assert_eq!(answered, child.pid.as_raw() as i64);
    }

    #[test]
    fn failing_remote_syscall_surfaces_its_errno() {
        let child = StoppedChild::spawn();
        let mut remote = match RemoteProcess::attach(child.pid.as_raw() as u32) {
            Ok(remote) => remote,
            Err(err) => {
                eprintln!("skipping: ptrace unavailable: {}", err);
                return;
            }
        };
        // Unaligned address: munmap must report EINVAL, not succeed.
        let err = remote.munmap(0x1001, 0x1000).expect_err("unaligned munmap");
        assert!(matches!(err, PurifyError::MemoryAccess { .. }), "{:?}", err);
    }
}
