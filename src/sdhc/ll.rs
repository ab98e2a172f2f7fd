use core::ptr::{read_volatile, write_volatile};

use crate::{bit, sdhc::Sdhc, TransferMode, Width};

pub(crate) const SDHC_SDMA_ADDRESS: usize = 0x00;
pub(crate) const SDHC_BLOCK_SIZE: usize = 0x04;
pub(crate) const SDHC_BLOCK_COUNT: usize = 0x06;
pub(crate) const SDHC_ARGUMENT: usize = 0x08;
pub(crate) const SDHC_TRANSFER_MODE: usize = 0x0C;
pub(crate) const SDHC_COMMAND: usize = 0x0E;
pub(crate) const SDHC_RESPONSE: usize = 0x10;
pub(crate) const SDHC_BUFFER_DATA_PORT: usize = 0x20;
pub(crate) const SDHC_PRESENT_STATE: usize = 0x24;
pub(crate) const SDHC_HOST_CONTROL1: usize = 0x28;
pub(crate) const SDHC_POWER_CONTROL: usize = 0x29;
pub(crate) const SDHC_CLOCK_CONTROL: usize = 0x2C;
pub(crate) const SDHC_TIMEOUT_CONTROL: usize = 0x2E;
pub(crate) const SDHC_SOFTWARE_RESET: usize = 0x2F;
pub(crate) const SDHC_NORMAL_INT_STATUS: usize = 0x30;
pub(crate) const SDHC_ERROR_INT_STATUS: usize = 0x32;
pub(crate) const SDHC_NORMAL_INT_STATUS_ENABLE: usize = 0x34;
pub(crate) const SDHC_ERROR_INT_STATUS_ENABLE: usize = 0x36;
pub(crate) const SDHC_NORMAL_INT_SIGNAL_ENABLE: usize = 0x38;
pub(crate) const SDHC_ERROR_INT_SIGNAL_ENABLE: usize = 0x3A;
pub(crate) const SDHC_HOST_CONTROL2: usize = 0x3E;
pub(crate) const SDHC_CAPABILITIES: usize = 0x40;
pub(crate) const SDHC_ADMA_ERROR_STATUS: usize = 0x54;
pub(crate) const SDHC_ADMA_ADDRESS: usize = 0x58;
pub(crate) const SDHC_HOST_VERSION: usize = 0xFE;

pub(crate) const SDHC_TRANSFER_MODE_DMA_ENABLE: u16 = bit!(0);
pub(crate) const SDHC_TRANSFER_MODE_BLOCK_COUNT_ENABLE: u16 = bit!(1);
pub(crate) const SDHC_TRANSFER_MODE_AUTO_CMD12: u16 = bit!(2);
pub(crate) const SDHC_TRANSFER_MODE_READ: u16 = bit!(4);
pub(crate) const SDHC_TRANSFER_MODE_MULTI_BLOCK: u16 = bit!(5);

pub(crate) const SDHC_PRESENT_STATE_CMD_INHIBIT: u32 = bit!(0);
pub(crate) const SDHC_PRESENT_STATE_DAT_INHIBIT: u32 = bit!(1);
pub(crate) const SDHC_PRESENT_STATE_CARD_INSERTED: u32 = bit!(16);
pub(crate) const SDHC_PRESENT_STATE_WRITE_ENABLED: u32 = bit!(19);

pub(crate) const SDHC_HOST_CONTROL1_LED: u8 = bit!(0);
pub(crate) const SDHC_HOST_CONTROL1_DATA_WIDTH_4: u8 = bit!(1);
pub(crate) const SDHC_HOST_CONTROL1_HIGH_SPEED: u8 = bit!(2);
pub(crate) const SDHC_HOST_CONTROL1_DMA_ADMA2_32: u8 = bit!(4);
pub(crate) const SDHC_HOST_CONTROL1_DMA_MASK: u8 = bit!(3) | bit!(4);
pub(crate) const SDHC_HOST_CONTROL1_DATA_WIDTH_8: u8 = bit!(5);

pub(crate) const SDHC_POWER_CONTROL_ON: u8 = bit!(0);
pub(crate) const SDHC_POWER_CONTROL_1_8V: u8 = bit!(1) | bit!(3);
pub(crate) const SDHC_POWER_CONTROL_3_0V: u8 = bit!(2) | bit!(3);
pub(crate) const SDHC_POWER_CONTROL_3_3V: u8 = bit!(1) | bit!(2) | bit!(3);

pub(crate) const SDHC_CLOCK_INTERNAL_ENABLE: u16 = bit!(0);
pub(crate) const SDHC_CLOCK_INTERNAL_STABLE: u16 = bit!(1);
pub(crate) const SDHC_CLOCK_CARD_ENABLE: u16 = bit!(2);

pub(crate) const SDHC_DATA_TIMEOUT_MAX: u8 = 0xE;

pub(crate) const SDHC_SOFTWARE_RESET_ALL: u8 = bit!(0);
pub(crate) const SDHC_SOFTWARE_RESET_CMD: u8 = bit!(1);
pub(crate) const SDHC_SOFTWARE_RESET_DAT: u8 = bit!(2);

pub(crate) const SDHC_INT_CMD_COMPLETE: u16 = bit!(0);
pub(crate) const SDHC_INT_XFER_COMPLETE: u16 = bit!(1);
pub(crate) const SDHC_INT_BLOCK_GAP: u16 = bit!(2);
pub(crate) const SDHC_INT_DMA: u16 = bit!(3);
pub(crate) const SDHC_INT_BUFFER_WRITE_READY: u16 = bit!(4);
pub(crate) const SDHC_INT_BUFFER_READ_READY: u16 = bit!(5);
pub(crate) const SDHC_INT_CARD_INSERTION: u16 = bit!(6);
pub(crate) const SDHC_INT_CARD_REMOVAL: u16 = bit!(7);
pub(crate) const SDHC_INT_ERROR: u16 = bit!(15);

pub(crate) const SDHC_INT_CARD_CHANGE: u16 = SDHC_INT_CARD_INSERTION | SDHC_INT_CARD_REMOVAL;
pub(crate) const SDHC_INT_DATA_EVENTS: u16 = SDHC_INT_XFER_COMPLETE
    | SDHC_INT_DMA
    | SDHC_INT_BUFFER_WRITE_READY
    | SDHC_INT_BUFFER_READ_READY;
pub(crate) const SDHC_INT_COMMAND_EVENTS: u16 = SDHC_INT_CMD_COMPLETE | SDHC_INT_DATA_EVENTS;
pub(crate) const SDHC_INT_SIGNAL_DEFAULT: u16 = SDHC_INT_COMMAND_EVENTS | SDHC_INT_CARD_CHANGE;

pub(crate) const SDHC_ERR_CMD_TIMEOUT: u16 = bit!(0);
pub(crate) const SDHC_ERR_CMD_CRC: u16 = bit!(1);
pub(crate) const SDHC_ERR_CMD_END_BIT: u16 = bit!(2);
pub(crate) const SDHC_ERR_CMD_INDEX: u16 = bit!(3);
pub(crate) const SDHC_ERR_DATA_TIMEOUT: u16 = bit!(4);
pub(crate) const SDHC_ERR_DATA_CRC: u16 = bit!(5);
pub(crate) const SDHC_ERR_DATA_END_BIT: u16 = bit!(6);
pub(crate) const SDHC_ERR_AUTO_CMD12: u16 = bit!(8);
pub(crate) const SDHC_ERR_ADMA: u16 = bit!(9);

pub(crate) const SDHC_ERR_TIMEOUT_MASK: u16 = SDHC_ERR_CMD_TIMEOUT | SDHC_ERR_DATA_TIMEOUT;
pub(crate) const SDHC_ERR_CRC_MASK: u16 = SDHC_ERR_CMD_CRC | SDHC_ERR_DATA_CRC;
pub(crate) const SDHC_ERR_SIGNAL_DEFAULT: u16 = SDHC_ERR_CMD_TIMEOUT
    | SDHC_ERR_CMD_CRC
    | SDHC_ERR_CMD_END_BIT
    | SDHC_ERR_CMD_INDEX
    | SDHC_ERR_DATA_TIMEOUT
    | SDHC_ERR_DATA_CRC
    | SDHC_ERR_DATA_END_BIT
    | SDHC_ERR_AUTO_CMD12
    | SDHC_ERR_ADMA;

pub(crate) const SDHC_HOST_CONTROL2_UHS_MASK: u16 = 0x7;
pub(crate) const SDHC_HOST_CONTROL2_UHS_SDR104: u16 = 3;
pub(crate) const SDHC_HOST_CONTROL2_UHS_HS400: u16 = 5;
pub(crate) const SDHC_HOST_CONTROL2_1_8V: u16 = bit!(3);
pub(crate) const SDHC_HOST_CONTROL2_EXECUTE_TUNING: u16 = bit!(6);

pub(crate) const SDHC_CAPS_BASE_CLOCK_MASK_V3: u64 = 0xFF00;
pub(crate) const SDHC_CAPS_BASE_CLOCK_MASK_V2: u64 = 0x3F00;
pub(crate) const SDHC_CAPS_BASE_CLOCK_SHIFT: u32 = 8;
pub(crate) const SDHC_CAPS_8BIT: u64 = bit!(18);
pub(crate) const SDHC_CAPS_ADMA2: u64 = bit!(19);
pub(crate) const SDHC_CAPS_SDMA: u64 = bit!(22);
pub(crate) const SDHC_CAPS_3_3V: u64 = bit!(24);
pub(crate) const SDHC_CAPS_3_0V: u64 = bit!(25);
pub(crate) const SDHC_CAPS_1_8V: u64 = bit!(26);
pub(crate) const SDHC_CAPS_SDR104: u64 = bit!(33);

pub(crate) const SDHC_VERSION_MASK: u16 = 0xFF;
pub(crate) const SDHC_VERSION_1_00: u16 = 0x00;
pub(crate) const SDHC_VERSION_2_00: u16 = 0x01;
pub(crate) const SDHC_VERSION_3_00: u16 = 0x02;
pub(crate) const SDHC_VERSION_4_00: u16 = 0x03;
pub(crate) const SDHC_VERSION_4_10: u16 = 0x04;
pub(crate) const SDHC_VERSION_4_20: u16 = 0x05;

pub(crate) const SDHC_CLOCK_DIVIDER_MAX_V3: u32 = 2046;
pub(crate) const SDHC_CLOCK_DIVIDER_MAX_V2: u32 = 256;

/// Little-endian access to one slot's register window.
///
/// Offsets are relative to the slot base. Implementations take `&self` so a
/// single window can be shared between the engine and the interrupt path.
pub trait Registers {
    fn read8(&self, offset: usize) -> u8;
    fn read16(&self, offset: usize) -> u16;
    fn read32(&self, offset: usize) -> u32;
    fn read64(&self, offset: usize) -> u64;
    fn write8(&self, offset: usize, value: u8);
    fn write16(&self, offset: usize, value: u16);
    fn write32(&self, offset: usize, value: u32);
    fn write64(&self, offset: usize, value: u64);

    /// Address the controller must use to reach the host byte at `virt`.
    fn bus_address(&self, virt: usize) -> u64 {
        virt as u64
    }
}

/// Memory-mapped register window.
pub struct Mmio {
    base: *mut u8,
}

// SAFETY: the window is only touched through volatile accesses, and the
// engine serializes every read-modify-write behind its gate.
unsafe impl Send for Mmio {}
unsafe impl Sync for Mmio {}

impl Mmio {
    /// # Safety
    /// `base` must point to a mapped SDHCI slot window of at least 256 bytes
    /// that stays valid for the lifetime of the returned value.
    pub const unsafe fn new(base: *mut u8) -> Self {
        Self { base }
    }
}

impl Registers for Mmio {
    fn read8(&self, offset: usize) -> u8 {
        unsafe { read_volatile(self.base.add(offset)) }
    }

    fn read16(&self, offset: usize) -> u16 {
        u16::from_le(unsafe { read_volatile(self.base.add(offset) as *const u16) })
    }

    fn read32(&self, offset: usize) -> u32 {
        u32::from_le(unsafe { read_volatile(self.base.add(offset) as *const u32) })
    }

    fn read64(&self, offset: usize) -> u64 {
        let low = self.read32(offset) as u64;
        let high = self.read32(offset + 4) as u64;
        low | high << 32
    }

    fn write8(&self, offset: usize, value: u8) {
        unsafe { write_volatile(self.base.add(offset), value) }
    }

    fn write16(&self, offset: usize, value: u16) {
        unsafe { write_volatile(self.base.add(offset) as *mut u16, value.to_le()) }
    }

    fn write32(&self, offset: usize, value: u32) {
        unsafe { write_volatile(self.base.add(offset) as *mut u32, value.to_le()) }
    }

    fn write64(&self, offset: usize, value: u64) {
        self.write32(offset, value as u32);
        self.write32(offset + 4, (value >> 32) as u32);
    }
}

impl<R: Registers> Sdhc<R> {
    pub(crate) fn ll_set_bits8(&self, offset: usize, bits: u8) {
        let value = self.regs.read8(offset);
        self.regs.write8(offset, value | bits);
    }

    pub(crate) fn ll_clear_bits8(&self, offset: usize, bits: u8) {
        let value = self.regs.read8(offset);
        self.regs.write8(offset, value & !bits);
    }

    pub(crate) fn ll_set_bits16(&self, offset: usize, bits: u16) {
        let value = self.regs.read16(offset);
        self.regs.write16(offset, value | bits);
    }

    pub(crate) fn ll_clear_bits16(&self, offset: usize, bits: u16) {
        let value = self.regs.read16(offset);
        self.regs.write16(offset, value & !bits);
    }

    pub(crate) fn ll_present_state(&self) -> u32 {
        self.regs.read32(SDHC_PRESENT_STATE)
    }

    pub(crate) fn ll_capabilities(&self) -> u64 {
        self.regs.read64(SDHC_CAPABILITIES)
    }

    pub(crate) fn ll_set_bus_width(&self, width: Width) {
        let mut ctrl = self.regs.read8(SDHC_HOST_CONTROL1)
            & !(SDHC_HOST_CONTROL1_DATA_WIDTH_4 | SDHC_HOST_CONTROL1_DATA_WIDTH_8);
        ctrl |= match width {
            Width::Bit1 => 0,
            Width::Bit4 => SDHC_HOST_CONTROL1_DATA_WIDTH_4,
            Width::Bit8 => SDHC_HOST_CONTROL1_DATA_WIDTH_8,
        };
        self.regs.write8(SDHC_HOST_CONTROL1, ctrl);
    }

    pub(crate) fn ll_set_dma_select(&self, mode: TransferMode) {
        let mut ctrl = self.regs.read8(SDHC_HOST_CONTROL1) & !SDHC_HOST_CONTROL1_DMA_MASK;
        if mode == TransferMode::Adma2 {
            ctrl |= SDHC_HOST_CONTROL1_DMA_ADMA2_32;
        }
        self.regs.write8(SDHC_HOST_CONTROL1, ctrl);
    }

    pub(crate) fn ll_response(&self) -> [u32; 4] {
        let low = self.regs.read64(SDHC_RESPONSE);
        let high = self.regs.read64(SDHC_RESPONSE + 8);
        [low as u32, (low >> 32) as u32, high as u32, (high >> 32) as u32]
    }
}
