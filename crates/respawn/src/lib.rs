//! Child process controller.
//!
//! Spawns the next generation suspended, plants the fixed-layout handshake
//! record into it, purifies it, downgrades its own access, and only then
//! lets it run. The event pair and the record are the only channel between
//! the two processes until the child is past the trust boundary.

mod child;
mod controller;
mod errors;
mod events;
mod process;
mod request_block;

pub use child::ChildHandshake;
pub use controller::{ChildProcessController, ControllerConfig, PurifyHook};
pub use errors::{RespawnError, RespawnResult};
pub use events::Event;
pub use process::ChildProcess;
pub use request_block::{
    ChildRequest, ChildRequestBlock, OperationContext, BLOCK_SIZE, MESSAGE_LEN, WHERE_TAG_LEN,
};

#[cfg(unix)]
pub use events::EventFd;
#[cfg(unix)]
pub use process::{halt_for_adoption, SpawnedChild};
