//! Parent side of the re-spawn handshake.

use std::time::{Duration, Instant};

use purification::PurifyOutcome;
use tracing::{debug, error, info};

use crate::errors::{RespawnError, RespawnResult};
use crate::events::Event;
use crate::process::ChildProcess;
use crate::request_block::{ChildRequest, ChildRequestBlock, BLOCK_SIZE};

/// XOR mask applied to the runtime-base word in the planted block until
/// purification completes, so the first thing an injected fingerprinting
/// hook reads out of it is garbage.
const RUNTIME_BASE_SCRAMBLE: u64 = 0x5a5a_a5a5_5a5a_a5a5;

/// Granularity of the request wait; each slice ends with a child liveness
/// check so a dead child is noticed long before the request timeout.
const WAIT_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Backing path of the executable image both processes run; the request
    /// block lives at a fixed offset inside it.
    pub image_path: String,
    /// Offset of the request block within the image. Identical in parent and
    /// child because they run the same binary; each process's base is found
    /// by scanning its own memory map, so randomization is immaterial.
    pub block_offset: u64,
    /// Backing path of the system runtime library to locate in the child.
    pub runtime_path: String,
    /// Ceiling on each wait for a child request.
    pub request_timeout: Duration,
}

impl ControllerConfig {
    pub fn new(image_path: impl Into<String>, block_offset: u64) -> Self {
        Self {
            image_path: image_path.into(),
            block_offset,
            runtime_path: "libc.so.6".to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Purification hook the orchestrator supplies; boxed so tests can script it.
pub type PurifyHook<'a> =
    dyn FnMut(&mut dyn ChildProcess) -> RespawnResult<PurifyOutcome> + 'a;

pub struct ChildProcessController {
    config: ControllerConfig,
}

impl ChildProcessController {
    pub fn new(config: ControllerConfig) -> Self {
        Self { config }
    }

    /// Drive a freshly spawned, still halted child through the handshake:
    /// plant the block, resume, purify on request, downgrade our own access,
    /// signal the child onward, then mirror its exit code.
    ///
    /// Any protocol violation, timeout, or OS failure terminates the child
    /// before the error is surfaced; a compromised child is never left
    /// running.
    pub fn supervise(
        &self,
        child: &mut dyn ChildProcess,
        parent_event: &dyn Event,
        child_event: &dyn Event,
        purify: &mut PurifyHook<'_>,
    ) -> RespawnResult<i32> {
        match self.drive(child, parent_event, child_event, purify) {
            Ok(code) => Ok(code),
            Err(err) => {
                error!(error = %err, "handshake failed; terminating child");
                if let Err(kill_err) = child.terminate() {
                    error!(error = %kill_err, "child termination also failed");
                }
                Err(err)
            }
        }
    }

    fn drive(
        &self,
        child: &mut dyn ChildProcess,
        parent_event: &dyn Event,
        child_event: &dyn Event,
        purify: &mut PurifyHook<'_>,
    ) -> RespawnResult<i32> {
        let image_base = child.module_base(&self.config.image_path)?;
        let block_address = image_base + self.config.block_offset;
        let runtime_base = child.module_base(&self.config.runtime_path)?;
        debug!(
            pid = child.pid(),
            block_address = format_args!("{:#x}", block_address),
            runtime_base = format_args!("{:#x}", runtime_base),
            "located image and system runtime in child"
        );

        let mut block = ChildRequestBlock::new();
        block.parent_event_handle = parent_event.raw_handle();
        block.child_event_handle = child_event.raw_handle();
        block.runtime_base = runtime_base ^ RUNTIME_BASE_SCRAMBLE;
        child.write_memory(block_address, &block.to_bytes())?;

        child.resume()?;

        let request = self.await_request(child, parent_event, block_address, "purify handshake")?;
        match request.request() {
            Some(ChildRequest::PurifyAndCloseHandles) => {}
            Some(ChildRequest::Error) => return Err(child_reported(&request)),
            other => {
                return Err(RespawnError::Protocol {
                    detail: format!("expected purify request, got {:?}", other),
                })
            }
        }

        let outcome = purify(&mut *child)?;
        if outcome.is_fatal() {
            let outstanding = match outcome.state {
                purification::PurifyState::GivingUp { outstanding_fixes } => outstanding_fixes,
                _ => 0,
            };
            return Err(RespawnError::Unrecoverable {
                outstanding_fixes: outstanding,
            });
        }
        info!(
            passes = outcome.passes,
            fixes = outcome.total_fixes,
            "child purified"
        );

        // Descramble the runtime base and wipe everything else before the
        // child gets to look at the block again.
        let mut clean = ChildRequestBlock::new();
        clean.parent_event_handle = parent_event.raw_handle();
        clean.child_event_handle = child_event.raw_handle();
        clean.runtime_base = runtime_base;
        child.write_memory(block_address, &clean.to_bytes())?;

        // The proceed signal must come strictly after the downgrade; the
        // child must never run freely while we still hold full access to it.
        child.downgrade_handles()?;
        child_event.signal()?;

        let request = self.await_request(child, parent_event, block_address, "event teardown")?;
        match request.request() {
            Some(ChildRequest::CloseEvents) => {}
            Some(ChildRequest::Error) => return Err(child_reported(&request)),
            other => {
                return Err(RespawnError::Protocol {
                    detail: format!("expected close-events request, got {:?}", other),
                })
            }
        }

        let code = child.wait_exit()?;
        info!(code, "child exited; mirroring its exit code");
        Ok(code)
    }

    /// Wait for the child to post a request. The wait covers both the event
    /// and the child process itself: a child that dies before posting is
    /// reported immediately instead of burning the request timeout.
    fn await_request(
        &self,
        child: &mut dyn ChildProcess,
        parent_event: &dyn Event,
        block_address: u64,
        phase: &'static str,
    ) -> RespawnResult<ChildRequestBlock> {
        let deadline = Instant::now() + self.config.request_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if parent_event.wait(remaining.min(WAIT_SLICE))? {
                break;
            }
            if let Some(code) = child.try_wait_exit()? {
                return Err(RespawnError::Protocol {
                    detail: format!("child exited with code {} before its {}", code, phase),
                });
            }
            if Instant::now() >= deadline {
                return Err(RespawnError::Timeout { phase });
            }
        }
        let mut buf = vec![0u8; BLOCK_SIZE];
        child.read_memory(block_address, &mut buf)?;
        ChildRequestBlock::from_bytes(&buf).ok_or(RespawnError::Protocol {
            detail: "request block unreadable".to_string(),
        })
    }
}

fn child_reported(block: &ChildRequestBlock) -> RespawnError {
    RespawnError::ChildReported {
        where_tag: block.where_tag_str().to_string(),
        context: block.context,
        status: block.status,
        message: block.message_str().to_string(),
    }
}
