use crate::{
    cmd::table::{CommandEntry, Direction},
    Error,
};

pub mod table;

/// Host memory a data-bearing command reads from or writes into.
#[derive(Debug, Clone, Copy)]
pub struct DataBuffer {
    ptr: *mut u8,
    len: usize,
    direction: Direction,
}

// SAFETY: the pointer is only dereferenced by the engine while the owning
// descriptor is in flight, which the constructors make the caller guarantee.
unsafe impl Send for DataBuffer {}

impl DataBuffer {
    /// # Safety
    /// `ptr..ptr + len` must stay valid, and untouched by anything else,
    /// until the completion of every command that uses this buffer fires.
    pub unsafe fn from_raw_parts(ptr: *mut u8, len: usize, direction: Direction) -> Self {
        Self {
            ptr,
            len,
            direction,
        }
    }

    pub fn from_static(buf: &'static mut [u8], direction: Direction) -> Self {
        Self {
            ptr: buf.as_mut_ptr(),
            len: buf.len(),
            direction,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub(crate) fn addr(&self, offset: usize) -> usize {
        self.ptr as usize + offset
    }

    pub(crate) fn word_at(&self, offset: usize) -> u32 {
        let mut word = [0u8; 4];
        // SAFETY: callers keep offset + 4 within len
        unsafe { core::ptr::copy_nonoverlapping(self.ptr.add(offset), word.as_mut_ptr(), 4) };
        u32::from_le_bytes(word)
    }

    pub(crate) fn set_word_at(&self, offset: usize, value: u32) {
        let word = value.to_le_bytes();
        // SAFETY: callers keep offset + 4 within len
        unsafe { core::ptr::copy_nonoverlapping(word.as_ptr(), self.ptr.add(offset), 4) };
    }
}

/// Data phase of a submitted command.
#[derive(Debug, Clone, Copy)]
pub struct DataRequest {
    pub buffer: DataBuffer,
    /// Byte offset into `buffer` where this command's data starts.
    pub offset: usize,
    pub block_size: u32,
    pub block_count: u32,
    /// Blocks across every sub-command of a split transfer.
    pub block_count_total: u32,
}

impl DataRequest {
    pub fn new(buffer: DataBuffer, block_size: u32, block_count: u32) -> Self {
        Self {
            buffer,
            offset: 0,
            block_size,
            block_count,
            block_count_total: block_count,
        }
    }

    pub(crate) fn byte_len(&self) -> usize {
        self.block_size as usize * self.block_count as usize
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Notify {
    None,
    Callback {
        func: fn(usize, Result<u64, Error>),
        context: usize,
    },
    Sync,
}

/// What the engine does once a command reaches its terminal state.
///
/// Callbacks receive the opaque context and either the byte count moved
/// (`block_count_total * block_size`) or the failure.
#[derive(Debug, Clone, Copy)]
pub struct Completion(pub(crate) Notify);

impl Completion {
    pub const fn none() -> Self {
        Self(Notify::None)
    }

    pub const fn callback(func: fn(usize, Result<u64, Error>), context: usize) -> Self {
        Self(Notify::Callback { func, context })
    }

    pub(crate) const fn sync() -> Self {
        Self(Notify::Sync)
    }
}

#[derive(PartialEq, Debug, Clone, Copy)]
pub(crate) enum State {
    Start,
    CardSelectionSent,
    AppCommandSent,
    DataTransfer,
    CommandSent,
    Complete,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct CmdReply {
    pub result: Result<u64, Error>,
    pub response: [u32; 4],
}

/// Pool-owned command execution record.
#[derive(Debug)]
pub(crate) struct SdhcCmd {
    pub entry: &'static CommandEntry,
    pub arg: u32,
    pub timeout_ms: u64,
    pub state: State,
    pub new_selection: bool,
    /// Command-complete already seen while the data or busy phase runs on.
    pub cmd_done: bool,
    pub data: Option<DataRequest>,
    /// Bytes of the data phase already moved.
    pub offset: usize,
    pub response: [u32; 4],
    pub result: Result<(), Error>,
    pub completion: Completion,
    /// More parts of the same request follow this one in the queue.
    pub chained: bool,
    pub next: Option<u8>,
    pub(crate) allocated: bool,
}

impl Default for SdhcCmd {
    fn default() -> Self {
        Self {
            entry: table::lookup(crate::card::CardFamily::Sd200, 0),
            arg: 0,
            timeout_ms: 1000,
            state: State::Done,
            new_selection: false,
            cmd_done: false,
            data: None,
            offset: 0,
            response: [0u32; 4],
            result: Ok(()),
            completion: Completion::none(),
            chained: false,
            next: None,
            allocated: false,
        }
    }
}

impl SdhcCmd {
    pub const fn has_flag(&self, flag: u8) -> bool {
        self.entry.has_flag(flag)
    }

    /// Transfer direction is card-to-host, resolving `ChkBuffer` from the buffer.
    pub fn is_read(&self) -> bool {
        match self.entry.direction {
            Direction::CardToHost => true,
            Direction::ChkBuffer => self
                .data
                .is_some_and(|data| data.buffer.direction() == Direction::CardToHost),
            _ => false,
        }
    }

    pub fn byte_count(&self) -> usize {
        self.data.map_or(0, |data| data.byte_len())
    }

    pub(crate) fn reply(&self) -> CmdReply {
        let bytes = self.data.map_or(0, |data| {
            data.block_count_total as u64 * data.block_size as u64
        });
        CmdReply {
            result: self.result.map(|_| bytes),
            response: self.response,
        }
    }
}
