//! Child side of the re-spawn handshake.
//!
//! The re-spawned process finds the request block already planted in its own
//! image (the parent wrote it there before resume), adopts the inherited
//! event descriptors named in it, and runs this tiny protocol before its
//! normal runtime starts.

use std::time::Duration;

use tracing::debug;

use crate::errors::{RespawnError, RespawnResult};
use crate::events::Event;
use crate::request_block::{ChildRequest, ChildRequestBlock, OperationContext};

pub struct ChildHandshake<'a> {
    block: &'a mut ChildRequestBlock,
    parent_event: &'a dyn Event,
    child_event: &'a dyn Event,
}

impl<'a> ChildHandshake<'a> {
    pub fn new(
        block: &'a mut ChildRequestBlock,
        parent_event: &'a dyn Event,
        child_event: &'a dyn Event,
    ) -> Self {
        Self {
            block,
            parent_event,
            child_event,
        }
    }

    /// Ask the parent to purify this process and block until it signals the
    /// all-clear. Must run before anything else in the new process touches a
    /// library.
    pub fn request_purification(&mut self, timeout: Duration) -> RespawnResult<()> {
        self.block.set_request(ChildRequest::PurifyAndCloseHandles);
        self.parent_event.signal()?;
        if !self.child_event.wait(timeout)? {
            return Err(RespawnError::Timeout {
                phase: "waiting for purification to complete",
            });
        }
        debug!("parent signaled purification complete");
        Ok(())
    }

    /// Tell the parent the events are no longer needed; the parent tears the
    /// channel down and falls into its exit-mirroring wait.
    pub fn request_event_close(&mut self) -> RespawnResult<()> {
        self.block.set_request(ChildRequest::CloseEvents);
        self.parent_event.signal()
    }

    /// Post a fatal error to the parent. The parent surfaces the fields of
    /// this report verbatim in its own fatal report.
    pub fn report_error(
        &mut self,
        where_tag: &str,
        context: OperationContext,
        status: u32,
        message: &str,
    ) -> RespawnResult<()> {
        self.block.set_error(where_tag, context, status, message);
        self.parent_event.signal()
    }

    /// Runtime base the parent located for us, valid only after
    /// `request_purification` returned (it is scrambled before that).
    pub fn runtime_base(&self) -> u64 {
        self.block.runtime_base
    }
}
