//! Fixed-layout handshake record shared between parent and child.
//!
//! The parent plants this block into the child's address space before
//! resuming it and reads it back whenever the child signals. Both sides run
//! the identical executable image, so one struct definition serves both; the
//! explicit byte codec below is the authoritative wire layout and is what
//! actually crosses the process boundary through `/proc/<pid>/mem`.

use std::fmt;

/// Bytes reserved for the short location tag of an error report.
pub const WHERE_TAG_LEN: usize = 128;

/// Bytes reserved for the error message text, 16K of message plus 1K of
/// context the reporter may append.
pub const MESSAGE_LEN: usize = 16 * 1024 + 1024;

/// Serialized size of the block. Three handle/pointer words, four 32-bit
/// words, then the two text buffers.
pub const BLOCK_SIZE: usize = 8 * 3 + 4 * 4 + WHERE_TAG_LEN + MESSAGE_LEN;

/// Request codes the child posts into the block before signaling the parent.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildRequest {
    None = 0,
    PurifyAndCloseHandles = 0x5f8c_0001,
    CloseEvents = 0x5f8c_0002,
    Error = 0x5f8c_00ff,
}

impl ChildRequest {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::None),
            0x5f8c_0001 => Some(Self::PurifyAndCloseHandles),
            0x5f8c_0002 => Some(Self::CloseEvents),
            0x5f8c_00ff => Some(Self::Error),
            _ => None,
        }
    }
}

/// What the child was doing when it posted the request; diagnostic only.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationContext {
    None = 0,
    EarlyInit = 1,
    Verification = 2,
    Purification = 3,
    DeviceOpen = 4,
}

impl OperationContext {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::None),
            1 => Some(Self::EarlyInit),
            2 => Some(Self::Verification),
            3 => Some(Self::Purification),
            4 => Some(Self::DeviceOpen),
            _ => None,
        }
    }
}

/// The handshake record itself. Field order matches the wire layout; the
/// reserved word keeps the struct a multiple of eight bytes with no implicit
/// padding anywhere.
#[repr(C)]
#[derive(Clone)]
pub struct ChildRequestBlock {
    pub parent_event_handle: u64,
    pub child_event_handle: u64,
    pub runtime_base: u64,
    pub request: u32,
    pub status: u32,
    pub context: u32,
    reserved: u32,
    pub where_tag: [u8; WHERE_TAG_LEN],
    pub message: [u8; MESSAGE_LEN],
}

impl ChildRequestBlock {
    pub const fn zeroed() -> Self {
        Self {
            parent_event_handle: 0,
            child_event_handle: 0,
            runtime_base: 0,
            request: 0,
            status: 0,
            context: 0,
            reserved: 0,
            where_tag: [0u8; WHERE_TAG_LEN],
            message: [0u8; MESSAGE_LEN],
        }
    }

    pub fn new() -> Self {
        Self::zeroed()
    }

    pub fn request(&self) -> Option<ChildRequest> {
        ChildRequest::from_raw(self.request)
    }

    pub fn set_request(&mut self, request: ChildRequest) {
        self.request = request as u32;
    }

    /// Fill in an error report. Overlong tag and message are truncated, a
    /// terminating NUL is always left in place.
    pub fn set_error(&mut self, where_tag: &str, context: OperationContext, status: u32, message: &str) {
        self.set_request(ChildRequest::Error);
        self.status = status;
        self.context = context as u32;
        copy_truncated(&mut self.where_tag, where_tag.as_bytes());
        copy_truncated(&mut self.message, message.as_bytes());
    }

    pub fn where_tag_str(&self) -> &str {
        text_field(&self.where_tag)
    }

    pub fn message_str(&self) -> &str {
        text_field(&self.message)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; BLOCK_SIZE];
        buf[0..8].copy_from_slice(&self.parent_event_handle.to_le_bytes());
        buf[8..16].copy_from_slice(&self.child_event_handle.to_le_bytes());
        buf[16..24].copy_from_slice(&self.runtime_base.to_le_bytes());
        buf[24..28].copy_from_slice(&self.request.to_le_bytes());
        buf[28..32].copy_from_slice(&self.status.to_le_bytes());
        buf[32..36].copy_from_slice(&self.context.to_le_bytes());
        buf[36..40].copy_from_slice(&self.reserved.to_le_bytes());
        buf[40..40 + WHERE_TAG_LEN].copy_from_slice(&self.where_tag);
        buf[40 + WHERE_TAG_LEN..].copy_from_slice(&self.message);
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() != BLOCK_SIZE {
            return None;
        }
        let mut block = Self::zeroed();
        block.parent_event_handle = u64::from_le_bytes(buf[0..8].try_into().ok()?);
        block.child_event_handle = u64::from_le_bytes(buf[8..16].try_into().ok()?);
        block.runtime_base = u64::from_le_bytes(buf[16..24].try_into().ok()?);
        block.request = u32::from_le_bytes(buf[24..28].try_into().ok()?);
        block.status = u32::from_le_bytes(buf[28..32].try_into().ok()?);
        block.context = u32::from_le_bytes(buf[32..36].try_into().ok()?);
        block.reserved = u32::from_le_bytes(buf[36..40].try_into().ok()?);
        block.where_tag.copy_from_slice(&buf[40..40 + WHERE_TAG_LEN]);
        block.message.copy_from_slice(&buf[40 + WHERE_TAG_LEN..]);
        Some(block)
    }
}

impl Default for ChildRequestBlock {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl fmt::Debug for ChildRequestBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChildRequestBlock")
            .field("parent_event_handle", &self.parent_event_handle)
            .field("child_event_handle", &self.child_event_handle)
            .field("runtime_base", &format_args!("{:#x}", self.runtime_base))
            .field("request", &self.request())
            .field("status", &self.status)
            .field("context", &self.context)
            .field("where_tag", &self.where_tag_str())
            .finish_non_exhaustive()
    }
}

fn copy_truncated(dest: &mut [u8], src: &[u8]) {
    dest.fill(0);
    let take = src.len().min(dest.len() - 1);
    dest[..take].copy_from_slice(&src[..take]);
}

fn text_field(buf: &[u8]) -> &str {
    let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
    std::str::from_utf8(&buf[..end]).unwrap_or("<non-utf8>")
}
