#![cfg_attr(not(test), no_std)]

mod block;
mod card;
mod cmd;
mod common;
mod engine;
mod pool;
mod sdhc;

#[cfg(test)]
mod mock;

pub use block::{MediaState, SdhcBlockDevice};
pub use card::{CardFamily, CardIdentity, Cid, Csd, ExtCsd, Scr};
pub use cmd::{
    table::{CommandEntry, Direction},
    Completion, DataBuffer, DataRequest,
};
pub use engine::{transfer::Adma2Table, CardEvent, Engine};
pub use sdhc::{ll::Mmio, ll::Registers, BusTiming, ControllerVersion, Sdhc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The operation needs a card and the slot is empty.
    NoMedia,
    /// The hardware did not raise the expected status in time.
    Timeout,
    /// The card was removed while the command was queued or running.
    Aborted,
    /// Every command descriptor is in use.
    NoResources,
    Unsupported,
    InvalidArg,
    InvalidCrc,
    InvalidResponse,
    InvalidState,
    Fail,
}

#[macro_export]
macro_rules! bit {
    ($offset: expr) => {
        1 << $offset
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    Bit1,
    Bit4,
    Bit8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    Pio,
    Sdma,
    Adma2,
}

/// Tunables shared by the controller layer, the engine and card bring-up.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Iterations a register bit wait may spin before giving up.
    pub poll_budget: u32,
    /// Delay between two register polls, in microseconds.
    pub poll_delay_us: u64,
    /// Settle time after a clock, power or bus width change.
    pub settle_ms: u64,
    pub op_cond_attempts: u32,
    pub op_cond_retry_ms: u64,
    /// Drive progress from the sync bridge by polling the interrupt status
    /// register instead of waiting for `Engine::on_interrupt`.
    pub polled: bool,
    pub allow_dma: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_budget: 100_000,
            poll_delay_us: 1,
            settle_ms: 50,
            op_cond_attempts: 20,
            op_cond_retry_ms: 1000,
            polled: false,
            allow_dma: true,
        }
    }
}
