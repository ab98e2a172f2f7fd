use embassy_time::Timer;
use log::{debug, info, warn};

use crate::{
    card::{raw_response, CardFamily, Cid, Csd, ExtCsd, Scr},
    common::*,
    engine::Engine,
    sdhc::ll::Registers,
    Error, TransferMode,
};

const TAG: &'static str = "[SDHC_COMMON]";

impl<R: Registers, const N: usize> Engine<R, N> {
    fn set_family(&self, family: CardFamily) {
        self.with_state(|st| st.card.family = family);
    }

    fn family(&self) -> CardFamily {
        self.with_state(|st| st.card.family)
    }

    /// Resets the card and works out its family from which commands it
    /// answers, leaving it in the ready state.
    pub(crate) async fn init_ocr(&self) -> Result<(), Error> {
        // SD 2.00 until the card proves otherwise
        self.with_state(|st| {
            st.card = Default::default();
            st.slot.selected = false;
        });

        self.cmd_go_idle_state(TIMEOUT_2S)
            .await
            .inspect_err(|err| warn!("{TAG} go_idle_state returned {err:?}"))?;

        match self.cmd_send_if_cond(TIMEOUT_2S).await {
            Ok(()) => {}
            Err(Error::Timeout) => {
                debug!("{TAG} no answer to SEND_IF_COND, not an SD 2.00 card");
                self.set_family(CardFamily::SdLegacy);
            }
            Err(err) => {
                warn!("{TAG} send_if_cond returned {err:?}");
                Err(err)?
            }
        }

        let mut ocr = 0;
        for attempt in 0..self.config.op_cond_attempts {
            let family = self.family();
            match self.cmd_app_op_cond(family == CardFamily::Sd200).await {
                Ok(value) => ocr = value,
                Err(Error::Timeout) if family == CardFamily::SdLegacy => {
                    debug!("{TAG} no answer to SD_SEND_OP_COND, not an SD card");
                    self.set_family(CardFamily::Mmc);
                    break;
                }
                Err(err) => {
                    warn!("{TAG} sd_send_op_cond returned {err:?}");
                    Err(err)?
                }
            }

            if ocr & OCR_BUSY != 0 {
                break;
            }
            debug!("{TAG} card still powering up, attempt {attempt}");
            Timer::after_millis(self.config.op_cond_retry_ms).await;
        }

        if self.family().is_sd() {
            if ocr & OCR_BUSY == 0 {
                warn!("{TAG} timed out initializing card");
                Err(Error::Timeout)?;
            }
            self.with_state(|st| {
                st.card.high_capacity = st.card.family == CardFamily::Sd200 && ocr & OCR_CCS != 0
            });
        } else {
            self.cmd_go_idle_state(TIMEOUT_10S)
                .await
                .inspect_err(|err| warn!("{TAG} mmc go_idle_state returned {err:?}"))?;

            let mut attempts = 0;
            loop {
                ocr = self
                    .cmd_mmc_op_cond()
                    .await
                    .inspect_err(|err| warn!("{TAG} mmc send_op_cond returned {err:?}"))?;
                if ocr & OCR_BUSY != 0 {
                    break;
                }
                attempts += 1;
                if attempts >= self.config.op_cond_attempts * 50 {
                    warn!("{TAG} mmc never left power up");
                    Err(Error::Timeout)?;
                }
                Timer::after_millis(1).await;
            }
            self.with_state(|st| st.card.high_capacity = ocr & MMC_OCR_SECTOR_MODE != 0);
        }

        info!(
            "{TAG} {:?} card ready, ocr {ocr:#010x}",
            self.family()
        );
        Ok(())
    }

    pub(crate) async fn init_cid(&self) -> Result<(), Error> {
        let resp = self
            .cmd_all_send_cid()
            .await
            .inspect_err(|err| warn!("{TAG} all_send_cid returned {err:?}"))?;

        let raw = raw_response(resp);
        self.with_state(|st| {
            let cid = Cid::parse(st.card.family, raw);
            st.card.raw_cid = raw;
            st.card.cid = Some(cid);
            st.card.embedded = cid.is_embedded();
            info!(
                "{TAG} found {} {} (serial {}, rev {}, embedded {})",
                cid.vendor(),
                cid.name(),
                cid.serial(),
                cid.revision(),
                st.card.embedded
            );
        });
        Ok(())
    }

    pub(crate) async fn init_rca(&self) -> Result<(), Error> {
        let rca = self
            .cmd_set_relative_addr(self.family().is_sd())
            .await
            .inspect_err(|err| warn!("{TAG} set_relative_addr returned {err:?}"))?;
        debug!("{TAG} card at rca {rca:#x}");
        self.with_state(|st| st.card.rca = rca);
        Ok(())
    }

    pub(crate) async fn init_csd(&self) -> Result<(), Error> {
        let rca = self.with_state(|st| st.card.rca);
        let resp = self
            .cmd_send_csd(rca)
            .await
            .inspect_err(|err| warn!("{TAG} send_csd returned {err:?}"))?;

        let csd = Csd::parse(self.family(), raw_response(resp))
            .inspect_err(|err| warn!("{TAG} decoding CSD failed {err:?}"))?;
        self.with_state(|st| {
            st.card.csd = Some(csd);
            st.card.block_count = csd.block_count();
            st.card.max_std_clock = csd.max_clock_hz().unwrap_or(CLOCK_SD_DEFAULT);
        });
        info!(
            "{TAG} capacity {} bytes ({} blocks)",
            csd.capacity_bytes(),
            csd.block_count()
        );
        Ok(())
    }

    /// Extended CSD exists from MMC system version 4 on.
    pub(crate) fn is_ext_csd_supported(&self) -> bool {
        self.with_state(|st| {
            st.card
                .csd
                .and_then(|csd| csd.mmc_spec_version())
                .is_some_and(|version| version >= 4)
        })
    }

    pub(crate) async fn init_ext_csd(&self) -> Result<ExtCsd, Error> {
        let mut raw = [0u8; EXT_CSD_LEN];
        self.cmd_send_ext_csd(&mut raw)
            .await
            .inspect_err(|err| warn!("{TAG} send_ext_csd returned {err:?}"))?;

        let ext_csd = ExtCsd::parse(&raw);
        self.with_state(|st| {
            st.card.ext_csd = Some(ext_csd);
            st.card.block_count = ext_csd.sector_count as u64;
            st.card.high_capacity = true;
        });
        debug!(
            "{TAG} ext csd rev {} device type {:#x} sectors {}",
            ext_csd.revision, ext_csd.device_type, ext_csd.sector_count
        );
        Ok(ext_csd)
    }

    pub(crate) async fn init_scr(&self) -> Result<Scr, Error> {
        let mut raw = [0u8; SCR_LEN];
        self.cmd_send_scr(&mut raw)
            .await
            .inspect_err(|err| warn!("{TAG} send_scr returned {err:?}"))?;

        let scr = Scr::parse(&raw);
        self.with_state(|st| st.card.scr = Some(scr));
        debug!(
            "{TAG} scr structure {} version {} bus widths {:#x}",
            scr.structure(),
            scr.spec_version(),
            scr.bus_widths()
        );
        Ok(scr)
    }

    /// Picks the best DMA level the controller offers and programs it.
    pub(crate) fn init_transfer_mode(&self) -> TransferMode {
        let mode = if self.config.allow_dma {
            self.host.best_transfer_mode()
        } else {
            TransferMode::Pio
        };
        self.host.set_dma_mode(mode);
        self.with_state(|st| st.slot.transfer_mode = mode);
        info!("{TAG} using {mode:?} transfers");
        mode
    }
}
