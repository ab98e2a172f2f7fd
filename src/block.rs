//! Block-storage view of a brought-up card: 512-byte blocks, large
//! transfers split into controller-sized commands.

use embassy_futures::block_on;
use embedded_sdmmc::{Block, BlockCount, BlockIdx};
use log::{debug, trace, warn};

use crate::{
    cmd::{table::Direction, Completion, DataBuffer, DataRequest},
    common::*,
    engine::Engine,
    sdhc::ll::Registers,
    Error,
};

const TAG: &'static str = "[SDHC_BLOCK]";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MediaState {
    pub present: bool,
    /// Presence differs from the last bring-up.
    pub changed: bool,
}

pub struct SdhcBlockDevice<'a, R, const N: usize = POOL_SIZE> {
    engine: &'a Engine<R, N>,
}

impl<'a, R: Registers, const N: usize> SdhcBlockDevice<'a, R, N> {
    pub fn new(engine: &'a Engine<R, N>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &'a Engine<R, N> {
        self.engine
    }

    /// Command argument for `lba`: a block number on high-capacity cards,
    /// a byte offset otherwise.
    fn address(&self, lba: u64) -> Result<u32, Error> {
        let addr = if self.engine.card().high_capacity {
            lba
        } else {
            lba * BLOCK_SIZE as u64
        };
        u32::try_from(addr).map_err(|_| Error::InvalidArg)
    }

    /// Queues a multi-block read of `nblks` blocks at `lba` into `buffer`.
    /// `completion` fires once, after the last split command.
    pub async fn read_async(
        &self,
        lba: u64,
        buffer: DataBuffer,
        nblks: u64,
        completion: Completion,
    ) -> Result<(), Error> {
        self.transfer_async(MMC_READ_BLOCK_MULTIPLE, lba, buffer, nblks, completion)
            .await
    }

    pub async fn write_async(
        &self,
        lba: u64,
        buffer: DataBuffer,
        nblks: u64,
        completion: Completion,
    ) -> Result<(), Error> {
        self.transfer_async(MMC_WRITE_BLOCK_MULTIPLE, lba, buffer, nblks, completion)
            .await
    }

    async fn transfer_async(
        &self,
        index: u8,
        lba: u64,
        buffer: DataBuffer,
        nblks: u64,
        completion: Completion,
    ) -> Result<(), Error> {
        trace!("{TAG} CMD{index} lba {lba} of {nblks} blocks");
        let total = u32::try_from(nblks).map_err(|_| Error::NoResources)?;
        if total == 0 || buffer.len() < total as usize * BLOCK_SIZE as usize {
            warn!("{TAG} buffer of {} bytes cannot hold {nblks} blocks", buffer.len());
            Err(Error::InvalidArg)?;
        }

        self.engine.wait_awake().await?;

        // the last part starts at the highest address, so checking it covers all
        let last_start = (total - 1) / MAX_BLOCKS_PER_TRANSFER * MAX_BLOCKS_PER_TRANSFER;
        self.address(lba + last_start as u64)?;
        let scale = if self.engine.card().high_capacity { 1 } else { BLOCK_SIZE };
        let base = self.address(lba)?;
        if total > MAX_BLOCKS_PER_TRANSFER {
            debug!(
                "{TAG} splitting {total} blocks into {} commands",
                total.div_ceil(MAX_BLOCKS_PER_TRANSFER)
            );
        }

        let parts = (0..total).step_by(MAX_BLOCKS_PER_TRANSFER as usize).map(move |done| {
            let count = (total - done).min(MAX_BLOCKS_PER_TRANSFER);
            let data = DataRequest {
                offset: done as usize * BLOCK_SIZE as usize,
                block_count_total: total,
                ..DataRequest::new(buffer, BLOCK_SIZE, count)
            };
            (base + done * scale, Some(data))
        });
        self.engine
            .submit_parts(index as u32, TIMEOUT_120S, parts, completion)
            .inspect_err(|err| warn!("{TAG} CMD{index} at lba {lba} not queued: {err:?}"))
    }

    /// Reads `buf.len() / 512` blocks starting at `lba`.
    pub async fn read_blocks(&self, lba: u64, buf: &mut [u8]) -> Result<(), Error> {
        self.transfer(MMC_READ_BLOCK_MULTIPLE, lba, buf.as_mut_ptr(), buf.len(), Direction::CardToHost)
            .await
    }

    pub async fn write_blocks(&self, lba: u64, buf: &[u8]) -> Result<(), Error> {
        // the engine only reads from a host-to-card buffer
        self.transfer(
            MMC_WRITE_BLOCK_MULTIPLE,
            lba,
            buf.as_ptr() as *mut u8,
            buf.len(),
            Direction::HostToCard,
        )
        .await
    }

    async fn transfer(
        &self,
        index: u8,
        lba: u64,
        ptr: *mut u8,
        len: usize,
        direction: Direction,
    ) -> Result<(), Error> {
        if len == 0 || len % BLOCK_SIZE as usize != 0 {
            Err(Error::InvalidArg)?;
        }
        self.engine.wait_awake().await?;

        // SAFETY: the caller's borrow outlives every sync command below, and
        // the sync bridge waits for the engine even when dropped.
        let buffer = unsafe { DataBuffer::from_raw_parts(ptr, len, direction) };
        let total = (len / BLOCK_SIZE as usize) as u32;
        let mut done = 0;
        while done < total {
            let count = (total - done).min(MAX_BLOCKS_PER_TRANSFER);
            let data = DataRequest {
                offset: done as usize * BLOCK_SIZE as usize,
                ..DataRequest::new(buffer, BLOCK_SIZE, count)
            };
            self.engine
                .send_command_with_data(
                    index as u32,
                    self.address(lba + done as u64)?,
                    TIMEOUT_120S,
                    Some(data),
                )
                .await
                .inspect_err(|err| warn!("{TAG} CMD{index} at lba {lba} failed: {err:?}"))?;
            done += count;
        }
        Ok(())
    }

    pub fn block_size(&self) -> u32 {
        BLOCK_SIZE
    }

    pub fn max_valid_block(&self) -> Result<u64, Error> {
        if !self.engine.host().is_card_present() {
            Err(Error::NoMedia)?;
        }
        Ok(self.engine.card().block_count.saturating_sub(1))
    }

    pub fn is_ejectable(&self) -> bool {
        !self.engine.card().embedded
    }

    pub fn is_removable(&self) -> bool {
        !self.engine.card().embedded
    }

    pub fn media_state(&self) -> MediaState {
        let present = self.engine.host().is_card_present();
        let inserted = self.engine.with_state(|st| st.slot.inserted);
        MediaState {
            present,
            changed: present != inserted,
        }
    }

    pub fn write_protection(&self) -> Result<bool, Error> {
        if !self.engine.host().is_card_present() {
            Err(Error::NoMedia)?;
        }
        Ok(self.engine.host().is_write_protected())
    }

    pub fn synchronize_cache(&self) -> Result<(), Error> {
        if !self.engine.host().is_card_present() {
            Err(Error::NoMedia)?;
        }
        Ok(())
    }

    pub fn eject(&self) -> Result<(), Error> {
        debug!("{TAG} eject");
        Ok(())
    }

    pub fn format(&self, _capacity: u64) -> Result<(), Error> {
        Err(Error::Unsupported)
    }

    pub fn lock(&self, _locked: bool) -> Result<(), Error> {
        Err(Error::Unsupported)
    }

    pub fn write_cache_enabled(&self) -> Result<bool, Error> {
        Err(Error::Unsupported)
    }

    pub fn set_write_cache(&self, _enabled: bool) -> Result<(), Error> {
        Err(Error::Unsupported)
    }
}

impl<R: Registers, const N: usize> embedded_sdmmc::BlockDevice for SdhcBlockDevice<'_, R, N> {
    type Error = Error;

    fn read(&self, blocks: &mut [Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
        for (i, block) in blocks.iter_mut().enumerate() {
            let lba = start_block_idx.0 as u64 + i as u64;
            block_on(self.read_blocks(lba, &mut block.contents))?;
        }
        Ok(())
    }

    fn write(&self, blocks: &[Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
        for (i, block) in blocks.iter().enumerate() {
            let lba = start_block_idx.0 as u64 + i as u64;
            block_on(self.write_blocks(lba, &block.contents))?;
        }
        Ok(())
    }

    fn num_blocks(&self) -> Result<BlockCount, Self::Error> {
        let count = self.max_valid_block()? + 1;
        Ok(BlockCount(u32::try_from(count).map_err(|_| Error::Unsupported)?))
    }
}
