//! Software SDHCI slot with a card model behind it, so the engine, bring-up
//! and block layer run on the host.

use std::{
    cell::RefCell,
    collections::{BTreeMap, HashMap},
};

use crate::{
    card::tests::put,
    cmd::Completion,
    common::*,
    engine::{
        transfer::{Adma2Table, ADMA2_END, ADMA2_VALID},
        Engine,
    },
    sdhc::ll::*,
    Config, Error,
};

/// DMA payloads above this size are accounted for but not copied.
const COPY_LIMIT: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CardKind {
    Sd2,
    SdLegacy,
    Mmc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MockEvent {
    Command { index: u8, arg: u32, blocks: u32 },
    Reset(u8),
}

/// Byte the card returns at offset `i` of block `lba` until it is written.
pub(crate) fn pattern(lba: u32, i: usize) -> u8 {
    (lba as u8).wrapping_mul(31).wrapping_add(i as u8)
}

pub(crate) struct MockCard {
    pub kind: CardKind,
    pub high_capacity: bool,
    /// Operating-condition polls answered busy after each reset.
    pub power_up_polls: u32,
    pub rca: u16,
    pub cid: u128,
    pub csd: u128,
    pub ext_csd: [u8; EXT_CSD_LEN],
    pub scr: [u8; SCR_LEN],
    pub tuning_rounds: u32,
    pub write_protected: bool,
    /// Commands the card never finishes, not even with a timeout status.
    pub muted: Vec<u8>,
    /// Commands answered with a command timeout status.
    pub timing_out: Vec<u8>,
    pub storage: HashMap<u32, Vec<u8>>,
    pub selected: bool,
    pub bus_width_4: bool,
    pub tuning: u32,
    app: bool,
    polls: u32,
}

enum Reply {
    None,
    Short(u32),
    Long(u128),
    Timeout,
}

impl MockCard {
    fn base(kind: CardKind) -> Self {
        Self {
            kind,
            high_capacity: false,
            power_up_polls: 2,
            rca: 0,
            cid: 0,
            csd: 0,
            ext_csd: [0; EXT_CSD_LEN],
            scr: [0x02, 0x35, 0x80, 0x00, 0, 0, 0, 0],
            tuning_rounds: 3,
            write_protected: false,
            muted: Vec::new(),
            timing_out: Vec::new(),
            storage: HashMap::new(),
            selected: false,
            bus_width_4: false,
            tuning: 0,
            app: false,
            polls: 0,
        }
    }

    /// 512 MiB SDHC card.
    pub fn sd2() -> Self {
        let mut card = Self::base(CardKind::Sd2);
        card.high_capacity = true;
        card.rca = 0x1234;
        put(&mut card.cid, 112, 8, 0x03);
        for (i, c) in b"SU08G".iter().enumerate() {
            put(&mut card.cid, 88 - 8 * i as u32, 8, *c as u32);
        }
        put(&mut card.cid, 16, 32, 0x0102_0304);
        put(&mut card.csd, 118, 2, 1);
        put(&mut card.csd, 40, 22, 1023);
        card
    }

    /// 1 GiB SD 1.x card.
    pub fn legacy() -> Self {
        let mut card = Self::base(CardKind::SdLegacy);
        card.rca = 0x4567;
        put(&mut card.cid, 112, 8, 0x1B);
        put(&mut card.csd, 54, 12, 4095);
        put(&mut card.csd, 39, 3, 7);
        put(&mut card.csd, 72, 4, 9);
        card
    }

    /// eMMC with HS200 and HS400 support.
    pub fn mmc() -> Self {
        let mut card = Self::base(CardKind::Mmc);
        card.high_capacity = true;
        put(&mut card.cid, 112, 8, 0x15);
        put(&mut card.cid, 104, 2, 1);
        for (i, c) in b"MMC32G".iter().enumerate() {
            put(&mut card.cid, 88 - 8 * i as u32, 8, *c as u32);
        }
        put(&mut card.csd, 114, 4, 4);
        put(&mut card.csd, 88, 8, 0x32);
        put(&mut card.csd, 54, 12, 0xFFF);
        put(&mut card.csd, 39, 3, 7);
        put(&mut card.csd, 72, 4, 9);
        card.ext_csd[EXT_CSD_SEC_COUNT..EXT_CSD_SEC_COUNT + 4].copy_from_slice(&0x00E9_0000u32.to_le_bytes());
        card.ext_csd[EXT_CSD_DEVICE_TYPE] = 0x57;
        card.ext_csd[EXT_CSD_REV] = 8;
        card
    }

    fn is_sd(&self) -> bool {
        self.kind != CardKind::Mmc
    }

    fn block_of(&self, arg: u32) -> u32 {
        if self.high_capacity {
            arg
        } else {
            arg / BLOCK_SIZE
        }
    }

    fn op_cond(&mut self) -> u32 {
        if self.polls > 0 {
            self.polls -= 1;
            OCR_VOLTAGE_MASK
        } else {
            OCR_BUSY | OCR_VOLTAGE_MASK
        }
    }

    fn respond(&mut self, index: u8, arg: u32, app: bool) -> Reply {
        let status = MMC_R1_READY_FOR_DATA;
        if self.timing_out.contains(&index) {
            return Reply::Timeout;
        }
        match (index, app) {
            (MMC_GO_IDLE_STATE, _) => {
                self.selected = false;
                self.polls = self.power_up_polls;
                Reply::None
            }
            (SD_SEND_IF_COND, false) if !self.selected => match self.kind {
                CardKind::Sd2 => Reply::Short(arg & 0xFFF),
                _ => Reply::Timeout,
            },
            (MMC_APP_CMD, _) if self.is_sd() => {
                self.app = true;
                Reply::Short(status | MMC_R1_APP_CMD)
            }
            (MMC_APP_CMD, _) => Reply::Timeout,
            (SD_APP_OP_COND, true) => {
                let mut ocr = self.op_cond();
                if ocr & OCR_BUSY != 0 && self.kind == CardKind::Sd2 && self.high_capacity && arg & OCR_CCS != 0 {
                    ocr |= OCR_CCS;
                }
                Reply::Short(ocr)
            }
            (MMC_SEND_OP_COND, false) if !self.is_sd() => {
                let mut ocr = self.op_cond();
                if ocr & OCR_BUSY != 0 && self.high_capacity {
                    ocr |= MMC_OCR_SECTOR_MODE;
                }
                Reply::Short(ocr)
            }
            (MMC_ALL_SEND_CID, false) => Reply::Long(self.cid),
            (SD_SEND_RELATIVE_ADDR, false) if self.is_sd() => Reply::Short((self.rca as u32) << 16),
            (MMC_SET_RELATIVE_ADDR, false) => {
                self.rca = (arg >> 16) as u16;
                Reply::Short(status)
            }
            (MMC_SEND_CSD, false) => Reply::Long(self.csd),
            (MMC_SELECT_CARD, false) => {
                self.selected = arg >> 16 != 0 && arg >> 16 == self.rca as u32;
                if arg == 0 {
                    Reply::None
                } else {
                    Reply::Short(status)
                }
            }
            (SD_APP_SET_BUS_WIDTH, true) => {
                self.bus_width_4 = arg == SD_BUS_WIDTH_ARG_4;
                Reply::Short(status)
            }
            (MMC_SWITCH, false) if !self.is_sd() => {
                self.ext_csd[(arg >> 16) as u8 as usize] = (arg >> 8) as u8;
                Reply::Short(status)
            }
            (MMC_SEND_TUNING_BLOCK, false) => {
                self.tuning += 1;
                Reply::Short(status)
            }
            _ => Reply::Short(status),
        }
    }

    fn read_data(&self, index: u8, arg: u32, len: usize) -> Vec<u8> {
        match index {
            MMC_SEND_EXT_CSD => self.ext_csd.to_vec(),
            SD_APP_SEND_SCR => self.scr.to_vec(),
            MMC_SEND_TUNING_BLOCK => (0..len).map(|i| i as u8).collect(),
            _ if len > COPY_LIMIT => Vec::new(),
            _ => {
                let first = self.block_of(arg);
                let mut data = Vec::with_capacity(len);
                for block in 0..(len / BLOCK_SIZE as usize) as u32 {
                    let lba = first + block;
                    match self.storage.get(&lba) {
                        Some(stored) => data.extend_from_slice(stored),
                        None => data.extend((0..BLOCK_SIZE as usize).map(|i| pattern(lba, i))),
                    }
                }
                data
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Pio,
    Sdma,
}

struct Pending {
    mode: Mode,
    read: bool,
    data: Vec<u8>,
    pos: usize,
    len: usize,
    block_size: usize,
    /// First block a write lands on.
    target: Option<u32>,
}

struct MockState {
    regs: [u8; 0x100],
    card: Option<MockCard>,
    pending: Option<Pending>,
    /// Bus page to the upper half of the host address it came from.
    bus_pages: BTreeMap<u64, u64>,
    events: Vec<MockEvent>,
}

impl MockState {
    fn load(&self, offset: usize, len: usize) -> u64 {
        (0..len)
            .rev()
            .fold(0u64, |value, i| value << 8 | self.regs[offset + i] as u64)
    }

    fn store(&mut self, offset: usize, len: usize, value: u64) {
        for i in 0..len {
            self.regs[offset + i] = (value >> (8 * i)) as u8;
        }
    }

    fn raise(&mut self, normal: u16, error: u16) {
        let current = self.load(SDHC_NORMAL_INT_STATUS, 2) as u16;
        self.store(SDHC_NORMAL_INT_STATUS, 2, (current | normal & !SDHC_INT_ERROR) as u64);
        let current = self.load(SDHC_ERROR_INT_STATUS, 2) as u16;
        self.store(SDHC_ERROR_INT_STATUS, 2, (current | error) as u64);
    }

    fn host_ptr(&self, bus: u64) -> *mut u8 {
        let high = self
            .bus_pages
            .range(..=bus >> 12)
            .next_back()
            .map_or(0, |(_, high)| *high);
        (high << 32 | bus) as usize as *mut u8
    }

    fn copy_in(&self, bus: u64, out: &mut [u8]) {
        let src = self.host_ptr(bus);
        // SAFETY: bus addresses only come from buffers the engine handed out
        unsafe { core::ptr::copy_nonoverlapping(src, out.as_mut_ptr(), out.len()) };
    }

    fn copy_out(&self, bus: u64, data: &[u8]) {
        let dst = self.host_ptr(bus);
        // SAFETY: as in copy_in
        unsafe { core::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len()) };
    }

    fn read(&mut self, offset: usize, len: usize) -> u64 {
        match offset {
            SDHC_PRESENT_STATE => {
                let mut state = 0;
                if let Some(card) = &self.card {
                    state |= SDHC_PRESENT_STATE_CARD_INSERTED;
                    if !card.write_protected {
                        state |= SDHC_PRESENT_STATE_WRITE_ENABLED;
                    }
                }
                state as u64
            }
            SDHC_BUFFER_DATA_PORT => self.pio_read() as u64,
            SDHC_NORMAL_INT_STATUS if len == 2 => {
                let mut normal = self.load(offset, 2);
                if self.load(SDHC_ERROR_INT_STATUS, 2) != 0 {
                    normal |= SDHC_INT_ERROR as u64;
                }
                normal
            }
            _ => self.load(offset, len),
        }
    }

    fn write(&mut self, offset: usize, len: usize, value: u64) {
        match offset {
            SDHC_NORMAL_INT_STATUS | SDHC_ERROR_INT_STATUS if len == 2 => {
                let current = self.load(offset, 2);
                self.store(offset, 2, current & !value);
            }
            SDHC_SOFTWARE_RESET => self.reset(value as u8),
            SDHC_CLOCK_CONTROL if len == 2 => {
                let mut clock = value as u16 & !SDHC_CLOCK_INTERNAL_STABLE;
                if clock & SDHC_CLOCK_INTERNAL_ENABLE != 0 {
                    clock |= SDHC_CLOCK_INTERNAL_STABLE;
                }
                self.store(offset, 2, clock as u64);
            }
            SDHC_COMMAND if len == 2 => {
                self.store(offset, 2, value);
                self.execute(value as u16);
            }
            SDHC_SDMA_ADDRESS if len == 4 => {
                self.store(offset, 4, value);
                if self.pending.as_ref().is_some_and(|p| p.mode == Mode::Sdma) {
                    self.sdma_step();
                }
            }
            SDHC_BUFFER_DATA_PORT => self.pio_write(value as u32),
            _ => self.store(offset, len, value),
        }
    }

    fn reset(&mut self, bits: u8) {
        self.events.push(MockEvent::Reset(bits));
        if bits & SDHC_SOFTWARE_RESET_ALL != 0 {
            let caps = self.load(SDHC_CAPABILITIES, 8);
            let version = self.load(SDHC_HOST_VERSION, 2);
            self.regs = [0; 0x100];
            self.store(SDHC_CAPABILITIES, 8, caps);
            self.store(SDHC_HOST_VERSION, 2, version);
        }
        if bits & (SDHC_SOFTWARE_RESET_ALL | SDHC_SOFTWARE_RESET_DAT) != 0 {
            self.pending = None;
        }
    }

    fn execute(&mut self, command: u16) {
        let index = (command >> 8) as u8;
        let arg = self.load(SDHC_ARGUMENT, 4) as u32;
        let mode = self.load(SDHC_TRANSFER_MODE, 2) as u16;
        let has_data = command & RSP_DATA as u16 != 0;
        let blocks = match (has_data, mode & SDHC_TRANSFER_MODE_BLOCK_COUNT_ENABLE != 0) {
            (false, _) => 0,
            (true, true) => self.load(SDHC_BLOCK_COUNT, 2) as u32,
            (true, false) => 1,
        };
        self.events.push(MockEvent::Command { index, arg, blocks });

        let (reply, app) = match self.card.as_mut() {
            None => (Reply::Timeout, false),
            Some(card) if card.muted.contains(&index) => return,
            Some(card) => {
                let app = core::mem::take(&mut card.app);
                (card.respond(index, arg, app), app)
            }
        };

        match reply {
            Reply::Timeout => {
                self.raise(0, SDHC_ERR_CMD_TIMEOUT);
                return;
            }
            Reply::None => {}
            Reply::Short(status) => {
                self.store(SDHC_RESPONSE, 8, status as u64);
                self.store(SDHC_RESPONSE + 8, 8, 0);
            }
            Reply::Long(raw) => {
                self.store(SDHC_RESPONSE, 8, raw as u64);
                self.store(SDHC_RESPONSE + 8, 8, (raw >> 64) as u64);
            }
        }

        if index == MMC_SEND_TUNING_BLOCK
            && !app
            && self.card.as_ref().is_some_and(|card| card.tuning >= card.tuning_rounds)
        {
            let ctrl2 = self.load(SDHC_HOST_CONTROL2, 2) as u16;
            self.store(SDHC_HOST_CONTROL2, 2, (ctrl2 & !SDHC_HOST_CONTROL2_EXECUTE_TUNING) as u64);
        }

        let mut normal = SDHC_INT_CMD_COMPLETE;
        if !has_data && command & RSP_48_BUSY as u16 == RSP_48_BUSY as u16 {
            normal |= SDHC_INT_XFER_COMPLETE;
        }
        self.raise(normal, 0);

        if has_data {
            self.start_data(index, arg, mode, blocks);
        }
    }

    fn start_data(&mut self, index: u8, arg: u32, mode: u16, blocks: u32) {
        let Some(card) = self.card.as_ref() else { return };
        let block_size = (self.load(SDHC_BLOCK_SIZE, 2) & 0xFFF) as usize;
        let len = block_size * blocks as usize;
        let read = mode & SDHC_TRANSFER_MODE_READ != 0;
        let (data, target) = if read {
            (card.read_data(index, arg, len), None)
        } else {
            (Vec::new(), Some(card.block_of(arg)))
        };

        let mut pending = Pending {
            mode: Mode::Pio,
            read,
            data,
            pos: 0,
            len,
            block_size,
            target,
        };

        if mode & SDHC_TRANSFER_MODE_DMA_ENABLE == 0 {
            self.pending = Some(pending);
            self.raise(
                if read {
                    SDHC_INT_BUFFER_READ_READY
                } else {
                    SDHC_INT_BUFFER_WRITE_READY
                },
                0,
            );
        } else if self.regs[SDHC_HOST_CONTROL1] & SDHC_HOST_CONTROL1_DMA_MASK == SDHC_HOST_CONTROL1_DMA_ADMA2_32 {
            self.adma2(pending);
        } else {
            pending.mode = Mode::Sdma;
            self.pending = Some(pending);
            self.sdma_step();
        }
    }

    fn adma2(&mut self, mut pending: Pending) {
        let mut at = self.load(SDHC_ADMA_ADDRESS, 8);
        let mut segments = Vec::new();
        loop {
            let mut raw = [0u8; 8];
            self.copy_in(at, &mut raw);
            let attributes = u16::from_le_bytes([raw[0], raw[1]]);
            let length = u16::from_le_bytes([raw[2], raw[3]]) as usize;
            let address = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]) as u64;
            if attributes & ADMA2_VALID == 0 || segments.len() == ADMA2_DESCRIPTORS {
                self.raise(0, SDHC_ERR_ADMA);
                return;
            }
            segments.push((address, length));
            if attributes & ADMA2_END != 0 {
                break;
            }
            at += 8;
        }

        let total: usize = segments.iter().map(|(_, length)| length).sum();
        if total != pending.len {
            self.raise(0, SDHC_ERR_ADMA);
            return;
        }

        if pending.len <= COPY_LIMIT {
            let mut pos = 0;
            for (address, length) in segments {
                if pending.read {
                    self.copy_out(address, &pending.data[pos..pos + length]);
                } else {
                    let mut chunk = vec![0u8; length];
                    self.copy_in(address, &mut chunk);
                    pending.data.extend_from_slice(&chunk);
                }
                pos += length;
            }
        }
        pending.pos = pending.len;
        self.finish(pending);
    }

    fn sdma_step(&mut self) {
        let Some(mut pending) = self.pending.take() else { return };
        let address = self.load(SDHC_SDMA_ADDRESS, 4);
        let seg = (SDMA_SEGMENT - address as usize % SDMA_SEGMENT).min(pending.len - pending.pos);
        if pending.len <= COPY_LIMIT {
            if pending.read {
                self.copy_out(address, &pending.data[pending.pos..pending.pos + seg]);
            } else {
                let mut chunk = vec![0u8; seg];
                self.copy_in(address, &mut chunk);
                pending.data.extend_from_slice(&chunk);
            }
        }
        pending.pos += seg;

        if pending.pos >= pending.len {
            self.finish(pending);
        } else {
            self.pending = Some(pending);
            self.raise(SDHC_INT_DMA, 0);
        }
    }

    fn pio_read(&mut self) -> u32 {
        let Some(mut pending) = self.pending.take() else { return 0 };
        let word = pending
            .data
            .get(pending.pos..pending.pos + 4)
            .map_or(0, |bytes| u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]));
        pending.pos += 4;
        self.pio_boundary(pending, SDHC_INT_BUFFER_READ_READY);
        word
    }

    fn pio_write(&mut self, value: u32) {
        let Some(mut pending) = self.pending.take() else { return };
        pending.data.extend_from_slice(&value.to_le_bytes());
        pending.pos += 4;
        self.pio_boundary(pending, SDHC_INT_BUFFER_WRITE_READY);
    }

    fn pio_boundary(&mut self, pending: Pending, ready: u16) {
        if pending.pos >= pending.len {
            self.finish(pending);
        } else {
            if pending.pos % pending.block_size == 0 {
                self.raise(ready, 0);
            }
            self.pending = Some(pending);
        }
    }

    fn finish(&mut self, pending: Pending) {
        if let (Some(first), Some(card)) = (pending.target, self.card.as_mut()) {
            for (i, block) in pending.data.chunks(BLOCK_SIZE as usize).enumerate() {
                card.storage.insert(first + i as u32, block.to_vec());
            }
        }
        self.raise(SDHC_INT_XFER_COMPLETE, 0);
    }
}

pub(crate) struct MockSdhc {
    inner: RefCell<MockState>,
}

impl MockSdhc {
    /// Version 3.00 controller with no capabilities and an empty slot.
    pub fn empty() -> Self {
        let mock = Self {
            inner: RefCell::new(MockState {
                regs: [0; 0x100],
                card: None,
                pending: None,
                bus_pages: BTreeMap::new(),
                events: Vec::new(),
            }),
        };
        mock.set_version(SDHC_VERSION_3_00);
        mock
    }

    /// 200 MHz controller with SDMA, ADMA2, 8-bit and 3.3 V support.
    pub fn with_card(card: MockCard) -> Self {
        let mock = Self::empty();
        mock.set_capabilities(
            200 << SDHC_CAPS_BASE_CLOCK_SHIFT | SDHC_CAPS_ADMA2 | SDHC_CAPS_SDMA | SDHC_CAPS_8BIT | SDHC_CAPS_3_3V | SDHC_CAPS_SDR104,
        );
        mock.inner.borrow_mut().card = Some(card);
        mock
    }

    pub fn set_version(&self, version: u16) {
        self.inner.borrow_mut().store(SDHC_HOST_VERSION, 2, version as u64);
    }

    pub fn set_capabilities(&self, caps: u64) {
        self.inner.borrow_mut().store(SDHC_CAPABILITIES, 8, caps);
    }

    pub fn raise(&self, normal: u16, error: u16) {
        self.inner.borrow_mut().raise(normal, error);
    }

    pub fn insert_card(&self, card: MockCard) {
        let mut inner = self.inner.borrow_mut();
        inner.card = Some(card);
        inner.raise(SDHC_INT_CARD_INSERTION, 0);
    }

    pub fn remove_card(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.card = None;
        inner.pending = None;
        inner.raise(SDHC_INT_CARD_REMOVAL, 0);
    }

    pub fn card<T>(&self, f: impl FnOnce(&mut MockCard) -> T) -> T {
        let mut inner = self.inner.borrow_mut();
        f(inner.card.as_mut().expect("no card in the mock slot"))
    }

    pub fn events(&self) -> Vec<MockEvent> {
        self.inner.borrow().events.clone()
    }

    pub fn commands(&self) -> Vec<u8> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                MockEvent::Command { index, .. } => Some(index),
                MockEvent::Reset(_) => None,
            })
            .collect()
    }

    pub fn clear_events(&self) {
        self.inner.borrow_mut().events.clear();
    }
}

impl Registers for MockSdhc {
    fn read8(&self, offset: usize) -> u8 {
        self.inner.borrow_mut().read(offset, 1) as u8
    }

    fn read16(&self, offset: usize) -> u16 {
        self.inner.borrow_mut().read(offset, 2) as u16
    }

    fn read32(&self, offset: usize) -> u32 {
        self.inner.borrow_mut().read(offset, 4) as u32
    }

    fn read64(&self, offset: usize) -> u64 {
        self.inner.borrow_mut().read(offset, 8)
    }

    fn write8(&self, offset: usize, value: u8) {
        self.inner.borrow_mut().write(offset, 1, value as u64)
    }

    fn write16(&self, offset: usize, value: u16) {
        self.inner.borrow_mut().write(offset, 2, value as u64)
    }

    fn write32(&self, offset: usize, value: u32) {
        self.inner.borrow_mut().write(offset, 4, value as u64)
    }

    fn write64(&self, offset: usize, value: u64) {
        self.inner.borrow_mut().write(offset, 8, value)
    }

    /// Low 32 bits of the host address; the upper half is remembered per
    /// page so DMA can find the memory again.
    fn bus_address(&self, virt: usize) -> u64 {
        let bus = virt as u64 & 0xFFFF_FFFF;
        self.inner
            .borrow_mut()
            .bus_pages
            .insert(bus >> 12, virt as u64 >> 32);
        bus
    }
}

pub(crate) fn test_config() -> Config {
    Config {
        poll_budget: 1000,
        poll_delay_us: 0,
        settle_ms: 0,
        op_cond_attempts: 20,
        op_cond_retry_ms: 0,
        polled: true,
        allow_dma: true,
    }
}

pub(crate) fn attach_with<const N: usize>(mock: MockSdhc, config: Config) -> Engine<MockSdhc, N> {
    Engine::new(mock, config, Box::leak(Box::new(Adma2Table::new())))
}

pub(crate) fn attach(mock: MockSdhc) -> Engine<MockSdhc> {
    attach_with(mock, test_config())
}

/// Collects callback results through the opaque completion context.
#[derive(Default)]
pub(crate) struct Recorder {
    results: RefCell<Vec<Result<u64, Error>>>,
}

impl Recorder {
    pub fn completion(&self) -> Completion {
        Completion::callback(Self::record, self as *const Self as usize)
    }

    fn record(context: usize, result: Result<u64, Error>) {
        // SAFETY: tests keep the recorder alive until the engine is idle
        let recorder = unsafe { &*(context as *const Recorder) };
        recorder.results.borrow_mut().push(result);
    }

    pub fn results(&self) -> Vec<Result<u64, Error>> {
        self.results.borrow().clone()
    }
}
