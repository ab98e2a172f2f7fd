use log::{debug, info, warn};

use crate::{
    card::ExtCsd,
    common::*,
    engine::Engine,
    sdhc::{ll::Registers, BusTiming},
    Error, Width,
};

const TAG: &'static str = "[SDHC_INIT]";

impl<R: Registers, const N: usize> Engine<R, N> {
    /// Full card bring-up: reset, identify, then configure block length,
    /// bus width, timing and transfer mode.
    pub async fn init_card(&self) -> Result<(), Error> {
        if !self.host.is_card_present() {
            debug!("{TAG} no card is currently inserted");
            self.with_state(|st| st.slot.inserted = false);
            Err(Error::NoMedia)?;
        }
        self.with_state(|st| st.slot.inserted = true);

        let result = self.bring_up().await;
        if let Err(err) = result {
            warn!("{TAG} failed to initialize card: {err:?}");
            self.host.set_power(false).await;
            let _ = self.set_clock(0).await;
            self.with_state(|st| st.slot.inserted = false);
        }
        result
    }

    async fn bring_up(&self) -> Result<(), Error> {
        self.set_clock(CLOCK_INIT).await?;
        self.host.set_power(true).await;

        self.init_ocr().await?;
        self.init_cid().await?;
        self.init_rca().await?;
        self.init_csd().await?;

        let card = self.card();
        let ext_csd = if !card.family.is_sd() && self.is_ext_csd_supported() {
            Some(self.init_ext_csd().await?)
        } else {
            None
        };

        let clock = if card.family.is_sd() {
            CLOCK_SD_DEFAULT
        } else {
            self.card().max_std_clock
        };
        self.set_clock(clock).await?;

        self.cmd_set_blocklen(BLOCK_SIZE)
            .await
            .inspect_err(|err| warn!("{TAG} set_blocklen returned {err:?}"))?;

        if card.family.is_sd() {
            self.init_sd_bus().await?;
        } else if let Some(ext_csd) = ext_csd {
            self.init_mmc_bus(ext_csd).await?;
        }

        self.init_transfer_mode();

        let card = self.card();
        info!(
            "{TAG} {:?} card up: {} blocks, {:?} at {} Hz, {:?}",
            card.family,
            card.block_count,
            self.bus_width(),
            self.with_state(|st| st.slot.clock_hz),
            self.bus_timing()
        );
        Ok(())
    }

    async fn set_clock(&self, hz: u32) -> Result<(), Error> {
        self.host.set_clock(hz).await?;
        self.with_state(|st| st.slot.clock_hz = hz);
        Ok(())
    }

    async fn set_width(&self, width: Width) {
        self.host.set_bus_width(width);
        self.with_state(|st| st.slot.width = width);
        self.host.settle().await;
    }

    /// 4-bit when the SCR lists it. SD stays at default speed.
    async fn init_sd_bus(&self) -> Result<(), Error> {
        let scr = self.init_scr().await?;
        if scr.bus_widths() & SCR_BUS_WIDTH_4 == 0 {
            info!("{TAG} card only supports a 1-bit bus");
            return Ok(());
        }

        self.cmd_set_bus_width_4()
            .await
            .inspect_err(|err| warn!("{TAG} set_bus_width returned {err:?}"))?;
        self.set_width(Width::Bit4).await;
        Ok(())
    }

    async fn init_mmc_bus(&self, ext_csd: ExtCsd) -> Result<(), Error> {
        let (width, width_value) = if self.host.supports_8bit() {
            (Width::Bit8, EXT_CSD_BUS_WIDTH_8)
        } else {
            (Width::Bit4, EXT_CSD_BUS_WIDTH_4)
        };
        debug!("{TAG} setting mmc bus width to {width:?}");
        self.cmd_switch(EXT_CSD_BUS_WIDTH, width_value)
            .await
            .inspect_err(|err| warn!("{TAG} bus width switch returned {err:?}"))?;
        self.set_width(width).await;

        let device_type = ext_csd.device_type;
        let hs200 = device_type & EXT_CSD_CARD_TYPE_HS200 != 0;
        if hs200 && !self.host.supports_hs200() {
            info!("{TAG} controller cannot run hs200, staying at high speed");
        }
        let (timing, timing_value, clock) = if hs200 && self.host.supports_hs200() {
            // HS400 capable parts run in HS200 as well
            (BusTiming::Hs200, EXT_CSD_TIMING_HS200, CLOCK_MMC_HS200)
        } else if device_type & EXT_CSD_CARD_TYPE_HS_52 != 0 {
            (BusTiming::HighSpeed, EXT_CSD_TIMING_HS, CLOCK_MMC_HS_52)
        } else if device_type & EXT_CSD_CARD_TYPE_HS_26 != 0 {
            (BusTiming::HighSpeed, EXT_CSD_TIMING_HS, CLOCK_MMC_26)
        } else {
            (BusTiming::Default, EXT_CSD_TIMING_LEGACY, self.card().max_std_clock)
        };

        // driver type B
        let hs_timing = (1 << EXT_CSD_DRIVER_TYPE_SHIFT) | timing_value;
        debug!("{TAG} setting mmc timing {timing:?}");
        self.cmd_switch(EXT_CSD_HS_TIMING, hs_timing)
            .await
            .inspect_err(|err| warn!("{TAG} timing switch returned {err:?}"))?;
        self.host.set_timing(timing);
        self.with_state(|st| st.slot.timing = timing);
        self.host.settle().await;
        self.set_clock(clock).await?;

        if timing == BusTiming::Hs200 {
            let tuned = self.tune(width).await;
            info!("{TAG} tuning complete: {tuned}");
        }

        let confirmed = self.init_ext_csd().await?;
        if confirmed.bus_width != width_value || confirmed.hs_timing != hs_timing {
            warn!(
                "{TAG} ext csd reports width {} timing {:#x}, expected {width_value} and {hs_timing:#x}",
                confirmed.bus_width, confirmed.hs_timing
            );
        }
        Ok(())
    }

    /// Reads tuning blocks while the controller keeps execute-tuning set.
    /// Returns false when a tuning read failed or the rounds ran out.
    async fn tune(&self, width: Width) -> bool {
        let mut buf = [0u8; TUNING_BLOCK_8BIT as usize];
        let len = match width {
            Width::Bit8 => TUNING_BLOCK_8BIT,
            _ => TUNING_BLOCK_4BIT,
        } as usize;

        debug!("{TAG} starting tuning with {len} byte blocks");
        self.host.start_tuning();
        let mut rounds = 0;
        while self.host.is_tuning() {
            if rounds == TUNING_MAX_ROUNDS {
                warn!("{TAG} tuning did not finish in {rounds} rounds");
                self.host.stop_tuning();
                return false;
            }
            if let Err(err) = self.cmd_send_tuning_block(&mut buf[..len]).await {
                warn!("{TAG} tuning block read returned {err:?}");
                self.host.stop_tuning();
                return false;
            }
            rounds += 1;
        }
        true
    }
}
