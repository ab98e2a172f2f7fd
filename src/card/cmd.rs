use log::{trace, warn};
use sdio_host::{common_cmd, emmc_cmd, sd_cmd};

use crate::{
    cmd::{table::Direction, DataBuffer, DataRequest},
    common::*,
    engine::Engine,
    sdhc::ll::Registers,
    Error,
};

const TAG: &'static str = "[SDHC_CMD]";

/// Per-command timeout for everything bring-up sends without a longer one.
const DEFAULT_TIMEOUT_MS: u64 = 1000;

impl<R: Registers, const N: usize> Engine<R, N> {
    async fn read_into(&self, id: u32, arg: u32, buf: &mut [u8], block_size: u32) -> Result<[u32; 4], Error> {
        // SAFETY: the sync bridge does not return, or drop, before the
        // engine has finished with the buffer.
        let buffer = unsafe { DataBuffer::from_raw_parts(buf.as_mut_ptr(), buf.len(), Direction::CardToHost) };
        let blocks = buf.len() as u32 / block_size;
        let data = DataRequest::new(buffer, block_size, blocks);
        self.send_command_with_data(id, arg, DEFAULT_TIMEOUT_MS, Some(data))
            .await
    }

    pub async fn cmd_go_idle_state(&self, timeout_ms: u64) -> Result<(), Error> {
        let cmd = common_cmd::idle();
        self.send_command(cmd.cmd as u32, cmd.arg, timeout_ms).await?;
        Ok(())
    }

    /// CMD8 with the 2.7-3.6 V range and the 0xAA check pattern.
    pub async fn cmd_send_if_cond(&self, timeout_ms: u64) -> Result<(), Error> {
        let cmd = sd_cmd::send_if_cond(1, 0xAA);
        let resp = self.send_command(cmd.cmd as u32, cmd.arg, timeout_ms).await?;
        if resp[0] & 0xFFF != SD_IF_COND_CHECK {
            warn!("{TAG} expected {SD_IF_COND_CHECK:#x} echo, received {:#x}", resp[0] & 0xFFF);
            Err(Error::InvalidResponse)?;
        }
        Ok(())
    }

    /// ACMD41. Returns the OCR the card answered with.
    pub async fn cmd_app_op_cond(&self, high_capacity: bool) -> Result<u32, Error> {
        let cmd = sd_cmd::sd_send_op_cond(high_capacity, false, false, 0x1FF);
        let resp = self
            .send_command(app(cmd.cmd), cmd.arg, DEFAULT_TIMEOUT_MS)
            .await?;
        trace!("{TAG} ACMD41 ocr {:#010x}", resp[0]);
        Ok(resp[0])
    }

    /// CMD1 asking for sector addressing.
    pub async fn cmd_mmc_op_cond(&self) -> Result<u32, Error> {
        let cmd = emmc_cmd::send_op_cond(MMC_OCR_INIT);
        let resp = self.send_command(cmd.cmd as u32, cmd.arg, DEFAULT_TIMEOUT_MS).await?;
        trace!("{TAG} CMD1 ocr {:#010x}", resp[0]);
        Ok(resp[0])
    }

    pub async fn cmd_all_send_cid(&self) -> Result<[u32; 4], Error> {
        let cmd = common_cmd::all_send_cid();
        self.send_command(cmd.cmd as u32, cmd.arg, DEFAULT_TIMEOUT_MS).await
    }

    /// SD cards publish their own RCA; MMC devices are assigned one.
    pub async fn cmd_set_relative_addr(&self, is_sd: bool) -> Result<u16, Error> {
        if !is_sd {
            let cmd = emmc_cmd::assign_relative_address(MMC_RCA);
            self.send_command(cmd.cmd as u32, cmd.arg, DEFAULT_TIMEOUT_MS).await?;
            return Ok(MMC_RCA);
        }

        let cmd = sd_cmd::send_relative_address();
        let mut rca = 0;
        for _ in 0..2 {
            let resp = self.send_command(cmd.cmd as u32, cmd.arg, DEFAULT_TIMEOUT_MS).await?;
            rca = (resp[0] >> 16) as u16;
            if rca != 0 {
                break;
            }
        }
        if rca == 0 {
            warn!("{TAG} card published RCA 0");
            Err(Error::InvalidResponse)?;
        }
        Ok(rca)
    }

    pub async fn cmd_send_csd(&self, rca: u16) -> Result<[u32; 4], Error> {
        let cmd = common_cmd::send_csd(rca);
        self.send_command(cmd.cmd as u32, cmd.arg, DEFAULT_TIMEOUT_MS).await
    }

    pub async fn cmd_set_blocklen(&self, len: u32) -> Result<(), Error> {
        let cmd = common_cmd::set_block_length(len);
        self.send_command(cmd.cmd as u32, cmd.arg, DEFAULT_TIMEOUT_MS).await?;
        Ok(())
    }

    pub async fn cmd_send_ext_csd(&self, buf: &mut [u8; EXT_CSD_LEN]) -> Result<(), Error> {
        self.read_into(MMC_SEND_EXT_CSD as u32, 0, buf, EXT_CSD_LEN as u32)
            .await?;
        Ok(())
    }

    /// CMD6 writing one extended CSD byte.
    pub async fn cmd_switch(&self, index: usize, value: u8) -> Result<(), Error> {
        let cmd = emmc_cmd::modify_ext_csd(emmc_cmd::AccessMode::WriteByte, index as u8, value);
        let resp = self.send_command(cmd.cmd as u32, cmd.arg, DEFAULT_TIMEOUT_MS).await?;
        if resp[0] & MMC_R1_SWITCH_ERROR != 0 {
            warn!("{TAG} switch of ext csd [{index}] to {value} rejected");
            Err(Error::Fail)?;
        }
        Ok(())
    }

    pub async fn cmd_send_scr(&self, buf: &mut [u8; SCR_LEN]) -> Result<(), Error> {
        let cmd = sd_cmd::send_scr();
        self.read_into(app(cmd.cmd), cmd.arg, buf, SCR_LEN as u32)
            .await?;
        Ok(())
    }

    /// ACMD6.
    pub async fn cmd_set_bus_width_4(&self) -> Result<(), Error> {
        let cmd = sd_cmd::set_bus_width(true);
        debug_assert_eq!(cmd.arg, SD_BUS_WIDTH_ARG_4);
        self.send_command(app(cmd.cmd), cmd.arg, DEFAULT_TIMEOUT_MS).await?;
        Ok(())
    }

    /// CMD21 reading one tuning block into `buf`.
    pub async fn cmd_send_tuning_block(&self, buf: &mut [u8]) -> Result<(), Error> {
        let block_size = buf.len() as u32;
        self.read_into(MMC_SEND_TUNING_BLOCK as u32, 0, buf, block_size)
            .await?;
        Ok(())
    }
}
