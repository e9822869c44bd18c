//! Access to the supervised child process.

use crate::errors::RespawnResult;

/// Capabilities the controller needs on the child it raised. The real
/// implementation reaches the child through procfs; protocol tests drive the
/// controller with an in-memory fake.
pub trait ChildProcess {
    fn pid(&self) -> u32;

    /// Base address of a named module inside the child, found by scanning
    /// its mapped regions for the expected backing path. Never a
    /// same-address assumption; randomization may place it anywhere.
    fn module_base(&mut self, expected_path: &str) -> RespawnResult<u64>;

    fn read_memory(&mut self, addr: u64, buf: &mut [u8]) -> RespawnResult<()>;
    fn write_memory(&mut self, addr: u64, bytes: &[u8]) -> RespawnResult<()>;

    /// Let the halted child start running.
    fn resume(&mut self) -> RespawnResult<()>;

    /// Give up everything except waiting, killing, and read-only memory
    /// access. Memory writes must fail after this.
    fn downgrade_handles(&mut self) -> RespawnResult<()>;

    /// Block until the child exits; returns its exit code.
    fn wait_exit(&mut self) -> RespawnResult<i32>;

    /// Non-blocking exit check: `Some(code)` once the child has exited.
    fn try_wait_exit(&mut self) -> RespawnResult<Option<i32>>;

    /// Force-terminate the child and reap it.
    fn terminate(&mut self) -> RespawnResult<()>;
}

#[cfg(unix)]
pub use unix_impl::{halt_for_adoption, SpawnedChild};

#[cfg(unix)]
mod unix_impl {
    use std::ffi::OsStr;
    use std::io::{Read, Seek, SeekFrom, Write};
    use std::os::unix::process::{CommandExt, ExitStatusExt};
    use std::path::Path;
    use std::process::{Child, Command, ExitStatus, Stdio};

    use nix::sys::signal::{kill, Signal};
    use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
    use nix::unistd::Pid;
    use tracing::{debug, warn};

    use purification::parse_proc_maps;

    use super::ChildProcess;
    use crate::errors::{RespawnError, RespawnResult};

    /// Halt the calling process with `SIGSTOP` so the parent that spawned it
    /// can plant the handshake record and scan the image before another
    /// instruction runs. A re-spawned generation calls this as its first act
    /// after recognizing its marker; execution continues once the parent
    /// sends `SIGCONT`.
    pub fn halt_for_adoption() -> std::io::Result<()> {
        // SAFETY: raise takes no pointers and is async-signal-safe.
        if unsafe { libc::raise(libc::SIGSTOP) } != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    /// A cooperatively suspended child: the spawned program halts itself at
    /// its entry point (see [`halt_for_adoption`]) and `spawn_suspended`
    /// returns only once that stop is observed, so the parent plants the
    /// request block against the real post-exec image.
    #[derive(Debug)]
    pub struct SpawnedChild {
        child: Child,
        downgraded: bool,
        reaped: Option<ExitStatus>,
    }

    impl SpawnedChild {
        /// Spawn `program` with `args`, substituting argument zero with the
        /// generation marker, and wait for its self-stop. The inherited
        /// environment and descriptors are whatever the caller already
        /// sanitized.
        pub fn spawn_suspended(
            program: &Path,
            args: &[&OsStr],
            arg0_marker: &OsStr,
        ) -> RespawnResult<Self> {
            let mut command = Command::new(program);
            command
                .args(args)
                .arg0(arg0_marker)
                .stdin(Stdio::inherit())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit());
            let child = command.spawn().map_err(|err| RespawnError::Spawn {
                detail: format!("{}: {}", program.display(), err),
            })?;
            let pid = Pid::from_raw(child.id() as i32);

            // The marker obliges the child to SIGSTOP itself before it does
            // anything else; wait for that stop (not an exit).
            match waitpid(pid, Some(WaitPidFlag::WUNTRACED)) {
                Ok(WaitStatus::Stopped(_, _)) => {}
                Ok(WaitStatus::Exited(_, code)) => {
                    return Err(RespawnError::Spawn {
                        detail: format!(
                            "{}: child exited with code {} instead of halting",
                            program.display(),
                            code
                        ),
                    });
                }
                Ok(other) => {
                    return Err(RespawnError::Spawn {
                        detail: format!(
                            "{}: unexpected wait status before halt: {:?}",
                            program.display(),
                            other
                        ),
                    });
                }
                Err(err) => {
                    return Err(RespawnError::Spawn {
                        detail: format!("{}: waiting for halt: {}", program.display(), err),
                    });
                }
            }
            debug!(pid = child.id(), "child halted at entry; adopted");
            Ok(Self {
                child,
                downgraded: false,
                reaped: None,
            })
        }

        fn mem_path(&self) -> String {
            format!("/proc/{}/mem", self.child.id())
        }

        fn ensure_write_access(&self) -> RespawnResult<()> {
            if self.downgraded {
                return Err(RespawnError::Protocol {
                    detail: "memory write attempted after handle downgrade".to_string(),
                });
            }
            Ok(())
        }

        fn exit_code(status: ExitStatus) -> i32 {
            if let Some(code) = status.code() {
                return code;
            }
            // Killed by a signal; mirror the shell convention.
            status.signal().map(|sig| 128 + sig).unwrap_or(1)
        }
    }

    impl ChildProcess for SpawnedChild {
        fn pid(&self) -> u32 {
            self.child.id()
        }

        fn module_base(&mut self, expected_path: &str) -> RespawnResult<u64> {
            let regions = parse_proc_maps(self.child.id())?;
            let suffix = format!("/{}", expected_path);
            let base = regions
                .iter()
                .filter(|r| r.path == expected_path || r.path.ends_with(&suffix))
                .map(|r| r.start)
                .min();
            base.ok_or_else(|| RespawnError::RuntimeNotFound {
                expected: expected_path.to_string(),
            })
        }

        fn read_memory(&mut self, addr: u64, buf: &mut [u8]) -> RespawnResult<()> {
            let mut mem = std::fs::File::open(self.mem_path())?;
            mem.seek(SeekFrom::Start(addr))?;
            mem.read_exact(buf)?;
            Ok(())
        }

        fn write_memory(&mut self, addr: u64, bytes: &[u8]) -> RespawnResult<()> {
            self.ensure_write_access()?;
            let mut mem = std::fs::OpenOptions::new().write(true).open(self.mem_path())?;
            mem.seek(SeekFrom::Start(addr))?;
            mem.write_all(bytes)?;
            Ok(())
        }

        fn resume(&mut self) -> RespawnResult<()> {
            kill(Pid::from_raw(self.child.id() as i32), Signal::SIGCONT)
                .map_err(|err| RespawnError::Spawn {
                    detail: format!("resume pid {}: {}", self.child.id(), err),
                })
        }

        fn downgrade_handles(&mut self) -> RespawnResult<()> {
            self.downgraded = true;
            Ok(())
        }

        fn wait_exit(&mut self) -> RespawnResult<i32> {
            if let Some(status) = self.reaped {
                return Ok(Self::exit_code(status));
            }
            let status = self.child.wait()?;
            Ok(Self::exit_code(status))
        }

        fn try_wait_exit(&mut self) -> RespawnResult<Option<i32>> {
            if let Some(status) = self.reaped {
                return Ok(Some(Self::exit_code(status)));
            }
            match self.child.try_wait()? {
                Some(status) => {
                    self.reaped = Some(status);
                    Ok(Some(Self::exit_code(status)))
                }
                None => Ok(None),
            }
        }

        fn terminate(&mut self) -> RespawnResult<()> {
            if self.reaped.is_some() {
                return Ok(());
            }
            if let Err(err) = self.child.kill() {
                warn!(pid = self.child.id(), error = %err, "kill failed");
            }
            let _ = self.child.wait()?;
            Ok(())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use std::ffi::OsString;

        fn spawn_self_stopping(exit_code: u32) -> SpawnedChild {
            let script = format!("kill -STOP $$; exit {}", exit_code);
            let args: Vec<OsString> = vec![OsString::from("-c"), OsString::from(script)];
            let arg_refs: Vec<&OsStr> = args.iter().map(OsString::as_os_str).collect();
            SpawnedChild::spawn_suspended(Path::new("/bin/sh"), &arg_refs, OsStr::new("sh"))
                .expect("spawn self-stopping child")
        }

        #[test]
        fn spawn_returns_with_the_child_halted_and_resume_releases_it() {
            let mut child = spawn_self_stopping(7);
            child.resume().expect("resume");
            assert_eq!(child.wait_exit().expect("wait"), 7);
        }

        #[test]
        fn try_wait_reports_nothing_while_halted_and_the_code_after_exit() {
            let mut child = spawn_self_stopping(3);
            assert_eq!(child.try_wait_exit().expect("try_wait"), None);
            child.resume().expect("resume");
            assert_eq!(child.wait_exit().expect("wait"), 3);
        }

        #[test]
        fn non_cooperating_program_is_a_spawn_error() {
            let args: Vec<&OsStr> = Vec::new();
            let err = SpawnedChild::spawn_suspended(
                Path::new("/bin/true"),
                &args,
                OsStr::new("true"),
            )
            .expect_err("a program that never halts must not be adopted");
            assert!(matches!(err, RespawnError::Spawn { .. }), "{:?}", err);
        }

        #[test]
        fn terminate_kills_a_halted_child() {
            let mut child = spawn_self_stopping(0);
            child.terminate().expect("terminate");
        }
    }
}
