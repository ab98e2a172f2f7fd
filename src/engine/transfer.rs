//! Data phase of a command: PIO block copies, SDMA segment programming and
//! ADMA2 descriptor chains.

use log::{trace, warn};
use static_cell::StaticCell;

use crate::{
    bit,
    cmd::{table::CMD_IGNORE_XFER_COMPLETE, SdhcCmd},
    common::{ADMA2_DESCRIPTORS, PAGE_SIZE, SDMA_SEGMENT},
    engine::Event,
    sdhc::{ll::*, Sdhc},
    Error, TransferMode,
};

const TAG: &'static str = "[SDHC_XFER]";

pub(crate) const ADMA2_VALID: u16 = bit!(0);
pub(crate) const ADMA2_END: u16 = bit!(1);
pub(crate) const ADMA2_ACT_TRAN: u16 = 0x4 << 3;

/// Longest run one descriptor covers; a page multiple below the 16-bit limit.
const ADMA2_MAX_SEGMENT: usize = 0xF000;

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Adma2Descriptor {
    pub attributes: u16,
    pub length: u16,
    pub address: u32,
}

/// 32-bit ADMA2 descriptor table sized for the largest single transfer.
#[repr(C, align(8))]
pub struct Adma2Table {
    entries: [Adma2Descriptor; ADMA2_DESCRIPTORS],
    used: usize,
}

static ADMA2_TABLE: StaticCell<Adma2Table> = StaticCell::new();

impl Adma2Table {
    pub const fn new() -> Self {
        Self {
            entries: [Adma2Descriptor {
                attributes: 0,
                length: 0,
                address: 0,
            }; ADMA2_DESCRIPTORS],
            used: 0,
        }
    }

    /// Hands out the crate's static table once, for single-slot systems.
    pub fn claim() -> Option<&'static mut Adma2Table> {
        ADMA2_TABLE.try_init(Adma2Table::new())
    }

    pub fn descriptors(&self) -> &[Adma2Descriptor] {
        &self.entries[..self.used]
    }

    pub(crate) fn base(&self) -> usize {
        self.entries.as_ptr() as usize
    }

    /// Rebuilds the chain for `len` bytes at host address `virt`, merging
    /// pages whose bus addresses are contiguous. Returns the entry count.
    pub fn build(
        &mut self,
        virt: usize,
        len: usize,
        bus_of: impl Fn(usize) -> u64,
    ) -> Result<usize, Error> {
        if len == 0 {
            Err(Error::InvalidArg)?;
        }

        let previous = self.used;
        let mut count = 0;
        let mut offset = 0;
        while offset < len {
            let start = bus_of(virt + offset);
            let mut seg = (PAGE_SIZE - (virt + offset) % PAGE_SIZE).min(len - offset);
            while offset + seg < len && seg < ADMA2_MAX_SEGMENT {
                if bus_of(virt + offset + seg) != start + seg as u64 {
                    break;
                }
                seg += PAGE_SIZE.min(len - offset - seg).min(ADMA2_MAX_SEGMENT - seg);
            }

            if start + seg as u64 > u32::MAX as u64 + 1 {
                warn!("{TAG} segment at {start:#x} is out of 32-bit DMA reach");
                Err(Error::InvalidArg)?;
            }
            if count == self.entries.len() {
                warn!("{TAG} transfer of {len} bytes needs more than {count} descriptors");
                Err(Error::NoResources)?;
            }

            self.entries[count] = Adma2Descriptor {
                attributes: ADMA2_VALID | ADMA2_ACT_TRAN,
                length: seg as u16,
                address: start as u32,
            };
            count += 1;
            offset += seg;
        }
        self.entries[count - 1].attributes |= ADMA2_END;

        for stale in &mut self.entries[count..previous.max(count)] {
            *stale = Adma2Descriptor::default();
        }
        self.used = count;
        Ok(count)
    }
}

impl Default for Adma2Table {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Registers> Sdhc<R> {
    /// Programs the SDMA address for the next segment, stopping at the
    /// 4 KiB boundary the controller interrupts on.
    fn program_sdma_segment(&self, cmd: &mut SdhcCmd) -> Result<(), Error> {
        let data = cmd.data.ok_or(Error::InvalidState)?;
        let remaining = data.byte_len() - cmd.offset;
        let bus = self.regs.bus_address(data.buffer.addr(data.offset + cmd.offset));
        let seg = (SDMA_SEGMENT - (bus as usize % SDMA_SEGMENT)).min(remaining);
        if bus + seg as u64 > u32::MAX as u64 + 1 {
            warn!("{TAG} sdma segment at {bus:#x} is out of 32-bit DMA reach");
            Err(Error::InvalidArg)?;
        }

        trace!("{TAG} sdma segment {bus:#x} len {seg}");
        self.regs.write32(SDHC_SDMA_ADDRESS, bus as u32);
        cmd.offset += seg;
        Ok(())
    }

    /// Sets up the data phase and returns the transfer mode register value.
    pub(crate) fn prepare_transfer(
        &self,
        mode: TransferMode,
        adma: &mut Adma2Table,
        cmd: &mut SdhcCmd,
    ) -> Result<u16, Error> {
        let data = cmd.data.ok_or(Error::InvalidState)?;
        let len = data.byte_len();
        cmd.offset = 0;

        match mode {
            TransferMode::Pio => {}
            TransferMode::Sdma => self.program_sdma_segment(cmd)?,
            TransferMode::Adma2 => {
                let count = adma.build(data.buffer.addr(data.offset), len, |virt| {
                    self.regs.bus_address(virt)
                })?;
                let table = self.regs.bus_address(adma.base());
                if table > u32::MAX as u64 {
                    Err(Error::InvalidArg)?;
                }
                trace!("{TAG} adma2 table {table:#x} with {count} entries");
                self.regs.write64(SDHC_ADMA_ADDRESS, table);
                cmd.offset = len;
            }
        }

        self.regs.write16(SDHC_BLOCK_SIZE, data.block_size as u16);
        self.regs.write16(SDHC_BLOCK_COUNT, data.block_count as u16);

        let mut transfer_mode = SDHC_TRANSFER_MODE_BLOCK_COUNT_ENABLE | cmd.entry.host_flags;
        if cmd.is_read() {
            transfer_mode |= SDHC_TRANSFER_MODE_READ;
        }
        if mode != TransferMode::Pio {
            transfer_mode |= SDHC_TRANSFER_MODE_DMA_ENABLE;
        }
        Ok(transfer_mode)
    }

    /// Moves the data phase forward for one status event. Returns true once
    /// every byte moved and the transfer-complete bit (unless ignored) is in.
    pub(crate) fn execute_transfer(
        &self,
        mode: TransferMode,
        cmd: &mut SdhcCmd,
        event: &Event,
    ) -> Result<bool, Error> {
        let data = cmd.data.ok_or(Error::InvalidState)?;
        let len = data.byte_len();
        let ignore_xfer = cmd.has_flag(CMD_IGNORE_XFER_COMPLETE);

        if cmd.offset < len {
            match mode {
                TransferMode::Pio => {
                    let ready = if cmd.is_read() {
                        SDHC_INT_BUFFER_READ_READY
                    } else {
                        SDHC_INT_BUFFER_WRITE_READY
                    };
                    if event.normal & ready != 0 || ignore_xfer {
                        self.pio_block(cmd, data.offset, data.block_size as usize);
                    }
                }
                TransferMode::Sdma => {
                    if event.normal & SDHC_INT_DMA != 0 {
                        self.program_sdma_segment(cmd)?;
                    }
                }
                TransferMode::Adma2 => {}
            }
        }

        Ok(cmd.offset >= len && (event.normal & SDHC_INT_XFER_COMPLETE != 0 || ignore_xfer))
    }

    fn pio_block(&self, cmd: &mut SdhcCmd, base: usize, block_size: usize) {
        let Some(data) = cmd.data else { return };
        let read = cmd.is_read();
        for word in (0..block_size).step_by(4) {
            let at = base + cmd.offset + word;
            if read {
                data.buffer.set_word_at(at, self.regs.read32(SDHC_BUFFER_DATA_PORT));
            } else {
                self.regs.write32(SDHC_BUFFER_DATA_PORT, data.buffer.word_at(at));
            }
        }
        cmd.offset += block_size;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(virt: usize) -> u64 {
        virt as u64
    }

    fn check_chain(table: &Adma2Table, len: usize) {
        let entries = table.descriptors();
        let total: usize = entries.iter().map(|entry| entry.length as usize).sum();
        assert_eq!(total, len);
        assert!(entries
            .iter()
            .all(|entry| entry.attributes & (ADMA2_VALID | ADMA2_ACT_TRAN) == ADMA2_VALID | ADMA2_ACT_TRAN));

        let ends: Vec<usize> = entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.attributes & ADMA2_END != 0)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(ends, [entries.len() - 1]);
    }

    #[test]
    fn contiguous_buffer_merges_pages() {
        let mut table = Box::new(Adma2Table::new());
        let len = 512 * 1000;
        let count = table.build(0x10_0200, len, identity).unwrap();
        check_chain(&table, len);
        // 512000 bytes in 60 KiB runs
        assert_eq!(count, 9);
        assert_eq!(table.descriptors()[0].length as usize, ADMA2_MAX_SEGMENT);
        assert_eq!(table.descriptors()[0].address, 0x10_0200);
        assert_eq!(table.descriptors()[1].address, 0x10_0200 + ADMA2_MAX_SEGMENT as u32);
    }

    #[test]
    fn scattered_pages_get_one_entry_each() {
        let mut table = Box::new(Adma2Table::new());
        // every page lands somewhere unrelated on the bus
        let scatter = |virt: usize| ((virt / PAGE_SIZE) as u64 * 3 * PAGE_SIZE as u64) + (virt % PAGE_SIZE) as u64;
        let len = 10 * PAGE_SIZE + 100;
        let count = table.build(0x4000, len, scatter).unwrap();
        assert_eq!(count, 11);
        check_chain(&table, len);
        assert!(table.descriptors().iter().all(|entry| entry.length as usize <= PAGE_SIZE));
    }

    #[test]
    fn rebuild_leaves_a_single_end_flag() {
        let mut table = Box::new(Adma2Table::new());
        let scatter = |virt: usize| (virt as u64) * 2;
        table.build(0x1000, 8 * PAGE_SIZE, scatter).unwrap();
        table.build(0x1000, 512, identity).unwrap();
        check_chain(&table, 512);
        assert_eq!(table.descriptors().len(), 1);
        assert_eq!(table.entries[1], Adma2Descriptor::default());
    }

    #[test]
    fn largest_transfer_fits() {
        let mut table = Box::new(Adma2Table::new());
        let len = crate::common::MAX_BLOCKS_PER_TRANSFER as usize * 512;
        let scatter = |virt: usize| (virt as u64) * 2;
        assert_eq!(table.build(0, len, scatter).unwrap(), ADMA2_DESCRIPTORS);
        check_chain(&table, len);
    }

    #[test]
    fn out_of_reach_buffers_are_rejected() {
        let mut table = Box::new(Adma2Table::new());
        let high = |virt: usize| virt as u64 + (1 << 32);
        assert_eq!(table.build(0, 512, high), Err(Error::InvalidArg));
        assert_eq!(table.build(0, 0, identity), Err(Error::InvalidArg));
    }

    #[test]
    fn static_table_is_claimed_once() {
        assert!(Adma2Table::claim().is_some());
        assert!(Adma2Table::claim().is_none());
    }
}
