use embassy_time::{block_for, Duration, Timer};
use log::{debug, info, warn};

pub(crate) mod ll;

use crate::{sdhc::ll::*, Config, Error, TransferMode, Width};

const TAG: &'static str = "[SDHC]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerVersion {
    V1_00,
    V2_00,
    V3_00,
    V4_00,
    V4_10,
    V4_20,
    Unknown(u8),
}

impl ControllerVersion {
    fn from_register(value: u16) -> Self {
        match value & SDHC_VERSION_MASK {
            SDHC_VERSION_1_00 => Self::V1_00,
            SDHC_VERSION_2_00 => Self::V2_00,
            SDHC_VERSION_3_00 => Self::V3_00,
            SDHC_VERSION_4_00 => Self::V4_00,
            SDHC_VERSION_4_10 => Self::V4_10,
            SDHC_VERSION_4_20 => Self::V4_20,
            other => Self::Unknown(other as u8),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::V1_00 => "1.00",
            Self::V2_00 => "2.00",
            Self::V3_00 => "3.00",
            Self::V4_00 => "4.00",
            Self::V4_10 => "4.10",
            Self::V4_20 => "4.20",
            Self::Unknown(_) => "Unknown",
        }
    }

    fn has_10bit_divider(&self) -> bool {
        !matches!(self, Self::V1_00 | Self::V2_00)
    }
}

/// Bus timing the card and controller agreed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusTiming {
    Default,
    HighSpeed,
    Hs200,
    Hs400,
}

/// One SDHCI slot: the register window plus the bounded polling budget.
pub struct Sdhc<R> {
    pub(crate) regs: R,
    poll_budget: u32,
    poll_delay_us: u64,
    settle_ms: u64,
}

impl<R: Registers> Sdhc<R> {
    pub fn new(regs: R, config: &Config) -> Self {
        Self {
            regs,
            poll_budget: config.poll_budget,
            poll_delay_us: config.poll_delay_us,
            settle_ms: config.settle_ms,
        }
    }

    pub fn regs(&self) -> &R {
        &self.regs
    }

    pub fn version(&self) -> ControllerVersion {
        ControllerVersion::from_register(self.regs.read16(SDHC_HOST_VERSION))
    }

    pub fn is_card_present(&self) -> bool {
        self.ll_present_state() & SDHC_PRESENT_STATE_CARD_INSERTED != 0
    }

    pub fn is_write_protected(&self) -> bool {
        self.ll_present_state() & SDHC_PRESENT_STATE_WRITE_ENABLED == 0
    }

    pub fn supports_8bit(&self) -> bool {
        self.ll_capabilities() & SDHC_CAPS_8BIT != 0
    }

    /// HS200 runs on the 1.8 V SDR104 signalling path.
    pub fn supports_hs200(&self) -> bool {
        self.ll_capabilities() & SDHC_CAPS_SDR104 != 0
    }

    /// Best transfer mode the capability register advertises.
    pub fn best_transfer_mode(&self) -> TransferMode {
        let caps = self.ll_capabilities();
        if caps & SDHC_CAPS_ADMA2 != 0 {
            TransferMode::Adma2
        } else if caps & SDHC_CAPS_SDMA != 0 {
            TransferMode::Sdma
        } else {
            TransferMode::Pio
        }
    }

    pub fn base_clock_hz(&self) -> u32 {
        let caps = self.ll_capabilities();
        let mask = if self.version().has_10bit_divider() {
            SDHC_CAPS_BASE_CLOCK_MASK_V3
        } else {
            SDHC_CAPS_BASE_CLOCK_MASK_V2
        };
        ((caps & mask) >> SDHC_CAPS_BASE_CLOCK_SHIFT) as u32 * crate::common::MHZ
    }

    fn wait_for(&self, mut done: impl FnMut() -> bool) -> Result<(), Error> {
        for _ in 0..self.poll_budget {
            if done() {
                return Ok(());
            }
            block_for(Duration::from_micros(self.poll_delay_us));
        }
        if done() {
            Ok(())
        } else {
            Err(Error::Timeout)
        }
    }

    pub fn wait_for_bits8(&self, offset: usize, mask: u8, set: bool) -> Result<(), Error> {
        self.wait_for(|| {
            let value = self.regs.read8(offset);
            if set {
                value & mask == mask
            } else {
                value & mask == 0
            }
        })
    }

    /// Waits for `mask` to be set (or cleared). With `write_clear` the bits
    /// are written back once seen, for write-1-to-clear status registers.
    pub fn wait_for_bits16(
        &self,
        offset: usize,
        mask: u16,
        set: bool,
        write_clear: bool,
    ) -> Result<(), Error> {
        self.wait_for(|| {
            let value = self.regs.read16(offset);
            if set {
                value & mask == mask
            } else {
                value & mask == 0
            }
        })?;
        if write_clear {
            self.regs.write16(offset, mask);
        }
        Ok(())
    }

    pub fn wait_for_bits32(&self, offset: usize, mask: u32, set: bool) -> Result<(), Error> {
        self.wait_for(|| {
            let value = self.regs.read32(offset);
            if set {
                value & mask == mask
            } else {
                value & mask == 0
            }
        })
    }

    pub fn reset(&self, bits: u8) -> Result<(), Error> {
        debug!("{TAG} reset {bits:#x}");
        self.regs.write8(SDHC_SOFTWARE_RESET, bits);
        self.wait_for_bits8(SDHC_SOFTWARE_RESET, bits, false)
            .inspect_err(|err| warn!("{TAG} reset {bits:#x} did not finish: {err:?}"))
    }

    /// Resets the whole slot and programs the status and signal enables.
    pub fn init(&self) -> Result<(), Error> {
        self.reset(SDHC_SOFTWARE_RESET_ALL)?;
        self.regs.write8(SDHC_TIMEOUT_CONTROL, SDHC_DATA_TIMEOUT_MAX);
        self.regs.write16(SDHC_NORMAL_INT_STATUS_ENABLE, 0xFFFF);
        self.regs.write16(SDHC_ERROR_INT_STATUS_ENABLE, 0xFFFF);
        self.regs
            .write16(SDHC_NORMAL_INT_SIGNAL_ENABLE, SDHC_INT_SIGNAL_DEFAULT);
        self.regs
            .write16(SDHC_ERROR_INT_SIGNAL_ENABLE, SDHC_ERR_SIGNAL_DEFAULT);
        info!(
            "{TAG} controller v{} base clock {} Hz",
            self.version().as_str(),
            self.base_clock_hz()
        );
        Ok(())
    }

    fn clock_divider_bits(&self, base: u32, hz: u32) -> u16 {
        if hz >= base {
            return 0;
        }
        if self.version().has_10bit_divider() {
            let divisor = base.div_ceil(hz).min(SDHC_CLOCK_DIVIDER_MAX_V3);
            let n = (divisor.div_ceil(2)) as u16;
            ((n & 0xFF) << 8) | ((n >> 8) & 0x3) << 6
        } else {
            let mut divisor = 1;
            while divisor < SDHC_CLOCK_DIVIDER_MAX_V2 && base / divisor > hz {
                divisor *= 2;
            }
            ((divisor / 2) as u16) << 8
        }
    }

    /// Programs the SD clock. A zero frequency gates the clock off.
    pub async fn set_clock(&self, hz: u32) -> Result<(), Error> {
        self.regs.write16(SDHC_CLOCK_CONTROL, 0);
        if hz == 0 {
            return Ok(());
        }

        let base = self.base_clock_hz();
        if base == 0 {
            warn!("{TAG} capabilities report no base clock");
            Err(Error::Unsupported)?;
        }

        let clock = self.clock_divider_bits(base, hz) | SDHC_CLOCK_INTERNAL_ENABLE;
        self.regs.write16(SDHC_CLOCK_CONTROL, clock);
        self.wait_for_bits16(SDHC_CLOCK_CONTROL, SDHC_CLOCK_INTERNAL_STABLE, true, false)
            .inspect_err(|err| warn!("{TAG} clock never stabilized: {err:?}"))?;
        self.regs
            .write16(SDHC_CLOCK_CONTROL, clock | SDHC_CLOCK_CARD_ENABLE);

        debug!("{TAG} sd clock {hz} Hz (base {base} Hz)");
        Timer::after_millis(self.settle_ms).await;
        Ok(())
    }

    pub async fn set_power(&self, on: bool) {
        if !on {
            self.regs.write8(SDHC_POWER_CONTROL, 0);
            return;
        }

        let caps = self.ll_capabilities();
        let voltage = if caps & SDHC_CAPS_3_3V != 0 {
            SDHC_POWER_CONTROL_3_3V
        } else if caps & SDHC_CAPS_3_0V != 0 {
            SDHC_POWER_CONTROL_3_0V
        } else {
            SDHC_POWER_CONTROL_1_8V
        };
        self.regs.write8(SDHC_POWER_CONTROL, voltage);
        self.regs
            .write8(SDHC_POWER_CONTROL, voltage | SDHC_POWER_CONTROL_ON);
        Timer::after_millis(self.settle_ms).await;
    }

    pub fn set_bus_width(&self, width: Width) {
        debug!("{TAG} bus width {width:?}");
        self.ll_set_bus_width(width);
    }

    pub fn set_dma_mode(&self, mode: TransferMode) {
        self.ll_set_dma_select(mode);
    }

    /// Mirrors the negotiated bus timing into host control 1 and 2.
    pub fn set_timing(&self, timing: BusTiming) {
        if timing == BusTiming::Default {
            self.ll_clear_bits8(SDHC_HOST_CONTROL1, SDHC_HOST_CONTROL1_HIGH_SPEED);
        } else {
            self.ll_set_bits8(SDHC_HOST_CONTROL1, SDHC_HOST_CONTROL1_HIGH_SPEED);
        }

        let mut ctrl2 = self.regs.read16(SDHC_HOST_CONTROL2)
            & !(SDHC_HOST_CONTROL2_1_8V | SDHC_HOST_CONTROL2_UHS_MASK);
        match timing {
            BusTiming::Hs200 => ctrl2 |= SDHC_HOST_CONTROL2_1_8V | SDHC_HOST_CONTROL2_UHS_SDR104,
            BusTiming::Hs400 => ctrl2 |= SDHC_HOST_CONTROL2_1_8V | SDHC_HOST_CONTROL2_UHS_HS400,
            _ => {}
        }
        self.regs.write16(SDHC_HOST_CONTROL2, ctrl2);
    }

    pub fn start_tuning(&self) {
        self.ll_set_bits16(SDHC_HOST_CONTROL2, SDHC_HOST_CONTROL2_EXECUTE_TUNING);
    }

    pub fn stop_tuning(&self) {
        self.ll_clear_bits16(SDHC_HOST_CONTROL2, SDHC_HOST_CONTROL2_EXECUTE_TUNING);
    }

    pub fn is_tuning(&self) -> bool {
        self.regs.read16(SDHC_HOST_CONTROL2) & SDHC_HOST_CONTROL2_EXECUTE_TUNING != 0
    }

    pub async fn settle(&self) {
        Timer::after_millis(self.settle_ms).await;
    }
}
