use core::cell::RefCell;

use embassy_futures::{
    select::{select, Either},
    yield_now,
};
use embassy_sync::{
    blocking_mutex::{raw::CriticalSectionRawMutex, Mutex},
    channel::Channel,
    mutex::Mutex as AsyncMutex,
    signal::Signal,
};
use embassy_time::{Duration, Instant, Timer};
use log::{debug, trace, warn};

pub(crate) mod supervisor;
pub mod transfer;

use crate::{
    block::MediaState,
    card::CardIdentity,
    cmd::{
        table::{self, *},
        CmdReply, Completion, DataRequest, Notify, SdhcCmd, State,
    },
    common::*,
    engine::transfer::Adma2Table,
    pool::CmdPool,
    sdhc::{ll::*, BusTiming, Sdhc},
    Config, Error, TransferMode, Width,
};

const TAG: &'static str = "[SDHC_ENGINE]";

/// How often the sync bridge re-checks the deadline while waiting on the
/// interrupt path.
const SYNC_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Event {
    pub normal: u16,
    pub error: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardEvent {
    Inserted,
    Removed,
}

/// Controller side of the slot, rebuilt on every controller init.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SlotContext {
    pub width: Width,
    pub transfer_mode: TransferMode,
    pub timing: BusTiming,
    pub clock_hz: u32,
    pub selected: bool,
    /// Card state as of the last bring-up, compared against the present
    /// switch on card-change events.
    pub inserted: bool,
    pub suspended: bool,
}

impl SlotContext {
    const fn new() -> Self {
        Self {
            width: Width::Bit1,
            transfer_mode: TransferMode::Pio,
            timing: BusTiming::Default,
            clock_hz: 0,
            selected: false,
            inserted: false,
            suspended: false,
        }
    }
}

pub(crate) struct EngineState<const N: usize> {
    pub pool: CmdPool<N>,
    head: Option<u8>,
    tail: Option<u8>,
    pub current: Option<u8>,
    pub card: CardIdentity,
    pub slot: SlotContext,
    pub deadline: Option<Instant>,
    adma: &'static mut Adma2Table,
}

impl<const N: usize> EngineState<N> {
    fn enqueue(&mut self, slot: u8) {
        self.pool.get_mut(slot).next = None;
        match self.tail {
            Some(tail) => self.pool.get_mut(tail).next = Some(slot),
            None => self.head = Some(slot),
        }
        self.tail = Some(slot);
    }

    fn dequeue(&mut self) -> Option<u8> {
        let slot = self.head?;
        self.head = self.pool.get_mut(slot).next.take();
        if self.head.is_none() {
            self.tail = None;
        }
        Some(slot)
    }

    pub fn queued(&self) -> usize {
        let mut count = 0;
        let mut at = self.head;
        while let Some(slot) = at {
            count += 1;
            at = self.pool.get(slot).next;
        }
        count
    }
}

/// Completions gathered under the gate, fired once it is released.
pub(crate) struct Finished<const N: usize> {
    items: [Option<(Completion, CmdReply)>; N],
    len: usize,
}

impl<const N: usize> Finished<N> {
    fn new() -> Self {
        Self {
            items: [None; N],
            len: 0,
        }
    }

    fn push(&mut self, cmd: &SdhcCmd) {
        if let Some(item) = self.items.get_mut(self.len) {
            *item = Some((cmd.completion, cmd.reply()));
            self.len += 1;
        }
    }
}

enum Flow {
    /// Waiting for the next status event.
    Suspend,
    Continue,
    /// The current descriptor went back to the pool.
    Finished,
}

/// Queued, interrupt-driven SDHCI command engine for one slot.
///
/// Every submission and every interrupt passes through one gate, so a single
/// descriptor is current at any time and queued ones run in FIFO order.
pub struct Engine<R, const N: usize = POOL_SIZE> {
    pub(crate) host: Sdhc<R>,
    pub(crate) config: Config,
    state: Mutex<CriticalSectionRawMutex, RefCell<EngineState<N>>>,
    reply: Signal<CriticalSectionRawMutex, CmdReply>,
    sync_lock: AsyncMutex<CriticalSectionRawMutex, ()>,
    timer_rearm: Signal<CriticalSectionRawMutex, ()>,
    pub(crate) card_events: Channel<CriticalSectionRawMutex, CardEvent, 4>,
    pub(crate) media: Signal<CriticalSectionRawMutex, MediaState>,
}

impl<R: Registers, const N: usize> Engine<R, N> {
    pub fn new(regs: R, config: Config, adma: &'static mut Adma2Table) -> Self {
        Self {
            host: Sdhc::new(regs, &config),
            config,
            state: Mutex::new(RefCell::new(EngineState {
                pool: CmdPool::new(),
                head: None,
                tail: None,
                current: None,
                card: CardIdentity::default(),
                slot: SlotContext::new(),
                deadline: None,
                adma,
            })),
            reply: Signal::new(),
            sync_lock: AsyncMutex::new(()),
            timer_rearm: Signal::new(),
            card_events: Channel::new(),
            media: Signal::new(),
        }
    }

    pub fn host(&self) -> &Sdhc<R> {
        &self.host
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Point-in-time copy of the card identity.
    pub fn card(&self) -> CardIdentity {
        self.with_state(|st| st.card)
    }

    pub fn transfer_mode(&self) -> TransferMode {
        self.with_state(|st| st.slot.transfer_mode)
    }

    pub fn bus_width(&self) -> Width {
        self.with_state(|st| st.slot.width)
    }

    pub fn bus_timing(&self) -> BusTiming {
        self.with_state(|st| st.slot.timing)
    }

    pub(crate) fn with_state<T>(&self, f: impl FnOnce(&mut EngineState<N>) -> T) -> T {
        self.state.lock(|cell| f(&mut cell.borrow_mut()))
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.with_state(|st| st.deadline)
    }

    /// Queues a command. `cmd` is the command index, with
    /// [`SD_APP_FLAG`](crate::common::SD_APP_FLAG) set for SD application
    /// commands.
    ///
    /// # Panics
    /// If the command has no entry in the active family's table.
    pub fn submit(
        &self,
        cmd: u32,
        arg: u32,
        timeout_ms: u64,
        data: Option<DataRequest>,
        completion: Completion,
    ) -> Result<(), Error> {
        self.submit_parts(cmd, timeout_ms, core::iter::once((arg, data)), completion)
    }

    /// Queues the parts of one request back to back.
    ///
    /// Nothing is queued unless every part passes validation and the pool has
    /// a free descriptor for each. `completion` rides on the last part. A part
    /// that fails completes the rest of the request with its error, so the
    /// last part reports the first failure.
    pub(crate) fn submit_parts<I>(
        &self,
        cmd: u32,
        timeout_ms: u64,
        parts: I,
        completion: Completion,
    ) -> Result<(), Error>
    where
        I: Iterator<Item = (u32, Option<DataRequest>)> + Clone,
    {
        if !self.host.is_card_present() {
            Err(Error::NoMedia)?;
        }
        if deadline_after(timeout_ms).is_none() {
            warn!("{TAG} timeout of {timeout_ms} ms is out of range");
            Err(Error::InvalidArg)?;
        }

        let mut finished = Finished::new();
        let result: Result<(), Error> = self.with_state(|st| {
            let entry = table::lookup(st.card.family, cmd);
            assert!(entry.valid, "command {cmd:#x} has no {:?} table entry", st.card.family);

            let mut count = 0;
            for (_, data) in parts.clone() {
                if let Some(data) = data {
                    check_data_request(entry, &data)?;
                } else if entry.has_data() {
                    warn!("{TAG} CMD{} needs a data buffer", entry.index);
                    Err(Error::InvalidArg)?;
                }
                count += 1;
            }
            if count == 0 {
                Err(Error::InvalidArg)?;
            }
            let free = N - st.pool.in_use();
            if count > free {
                warn!("{TAG} CMD{} needs {count} descriptors, {free} free", entry.index);
                Err(Error::NoResources)?;
            }

            for (part, (arg, data)) in parts.enumerate() {
                let chained = part + 1 < count;
                let slot = st.pool.acquire().ok_or(Error::NoResources)?;
                *st.pool.get_mut(slot) = SdhcCmd {
                    entry,
                    arg,
                    timeout_ms,
                    state: State::Start,
                    data,
                    completion: if chained { Completion::none() } else { completion },
                    chained,
                    allocated: true,
                    ..Default::default()
                };
                st.enqueue(slot);
                debug!("{TAG} queued CMD{} arg {arg:#x} in slot {slot}", entry.index);
            }

            if st.current.is_none() {
                self.process(st, Event::default(), &mut finished);
            }
            Ok(())
        });
        self.fire(finished);
        result
    }

    /// Runs the current descriptor with `event`, then keeps dispatching queued
    /// descriptors for as long as each one finishes without waiting.
    pub(crate) fn process(&self, st: &mut EngineState<N>, mut event: Event, finished: &mut Finished<N>) {
        loop {
            if st.current.is_none() {
                let Some(slot) = st.dequeue() else {
                    st.deadline = None;
                    return;
                };
                let timeout_ms = st.pool.get(slot).timeout_ms;
                st.current = Some(slot);
                st.deadline = deadline_after(timeout_ms);
                self.timer_rearm.signal(());
                event = Event::default();
            }

            match self.advance(st, event, finished) {
                Flow::Finished => continue,
                _ => return,
            }
        }
    }

    fn advance(&self, st: &mut EngineState<N>, mut event: Event, finished: &mut Finished<N>) -> Flow {
        let Some(slot) = st.current else {
            trace!("{TAG} no current command for status {:#x}", event.normal);
            return Flow::Suspend;
        };

        if mask_check_and_clear(&mut event.normal, SDHC_INT_ERROR) {
            let err = error_from_status(event.error);
            warn!(
                "{TAG} CMD{} failed with error status {:#x}: {err:?}",
                st.pool.get(slot).entry.index,
                event.error
            );
            let _ = self.host.reset(SDHC_SOFTWARE_RESET_CMD);
            let _ = self.host.reset(SDHC_SOFTWARE_RESET_DAT);
            let cmd = st.pool.get_mut(slot);
            cmd.result = Err(err);
            cmd.state = State::Complete;
        }

        loop {
            let state = st.pool.get(slot).state;
            let flow = match state {
                State::Start => self.start(st, slot, &mut event),
                State::CardSelectionSent => {
                    if mask_check_and_clear(&mut event.normal, SDHC_INT_CMD_COMPLETE) {
                        st.slot.selected = st.pool.get(slot).new_selection;
                        trace!("{TAG} card selected: {}", st.slot.selected);
                        self.send_app_prefix(st, slot, &mut event)
                    } else {
                        Flow::Suspend
                    }
                }
                State::AppCommandSent => {
                    if mask_check_and_clear(&mut event.normal, SDHC_INT_CMD_COMPLETE) {
                        if self.host.ll_response()[0] & MMC_R1_APP_CMD == 0 {
                            warn!("{TAG} card did not accept APP_CMD");
                            self.fail(st, slot, Error::Unsupported)
                        } else {
                            self.issue(st, slot, &mut event)
                        }
                    } else {
                        Flow::Suspend
                    }
                }
                State::DataTransfer => self.data_transfer(st, slot, &mut event),
                State::CommandSent => {
                    let cmd = st.pool.get_mut(slot);
                    cmd.response = self.host.ll_response();
                    cmd.result = Ok(());
                    cmd.state = State::Complete;
                    Flow::Continue
                }
                State::Complete => {
                    let cmd = st.pool.get(slot);
                    debug!("{TAG} CMD{} complete: {:?}", cmd.entry.index, cmd.result);
                    let failed_part = match cmd.result {
                        Err(err) if cmd.chained => Some(err),
                        _ => None,
                    };
                    finished.push(cmd);
                    st.pool.release(slot);
                    st.current = None;
                    st.deadline = None;
                    if let Some(err) = failed_part {
                        self.fail_remaining_parts(st, err, finished);
                    }
                    Flow::Finished
                }
                State::Done => {
                    warn!("{TAG} slot {slot} is current but already done");
                    st.current = None;
                    Flow::Finished
                }
            };

            match flow {
                Flow::Continue => {}
                other => return other,
            }
        }
    }

    /// Completes the queued remainder of a request with the error of its
    /// failed part. Parts are queued together, so they sit at the head.
    fn fail_remaining_parts(&self, st: &mut EngineState<N>, err: Error, finished: &mut Finished<N>) {
        while let Some(slot) = st.dequeue() {
            let part = st.pool.get_mut(slot);
            part.result = Err(err);
            part.state = State::Complete;
            let more = part.chained;
            finished.push(part);
            st.pool.release(slot);
            if !more {
                break;
            }
        }
    }

    fn fail(&self, st: &mut EngineState<N>, slot: u8, err: Error) -> Flow {
        let cmd = st.pool.get_mut(slot);
        cmd.result = Err(err);
        cmd.state = State::Complete;
        Flow::Continue
    }

    fn start(&self, st: &mut EngineState<N>, slot: u8, event: &mut Event) -> Flow {
        let cmd = st.pool.get_mut(slot);
        cmd.new_selection = st.slot.selected;

        if !cmd.has_flag(CMD_IGNORE_SELECTION_STATE) {
            let needs = cmd.has_flag(CMD_NEEDS_SELECTION);
            let deselecting_select = !needs && cmd.entry.index == MMC_SELECT_CARD;
            if needs != st.slot.selected && !deselecting_select {
                let select = table::lookup(st.card.family, MMC_SELECT_CARD as u32);
                let (arg, response) = if needs {
                    ((st.card.rca as u32) << 16, select.response)
                } else {
                    (0, RSP_R0)
                };
                cmd.new_selection = needs;
                cmd.state = State::CardSelectionSent;
                trace!("{TAG} {} card for CMD{}", if needs { "selecting" } else { "deselecting" }, cmd.entry.index);
                return match self.send_raw(select.index, arg, response, 0) {
                    Ok(()) => {
                        event.normal = 0;
                        Flow::Suspend
                    }
                    Err(err) => self.fail(st, slot, err),
                };
            }
        }

        self.send_app_prefix(st, slot, event)
    }

    fn send_app_prefix(&self, st: &mut EngineState<N>, slot: u8, event: &mut Event) -> Flow {
        let cmd = st.pool.get_mut(slot);
        if st.card.family.is_sd() && cmd.has_flag(CMD_IS_APP) {
            cmd.state = State::AppCommandSent;
            let arg = (st.card.rca as u32) << 16;
            return match self.send_raw(MMC_APP_CMD, arg, RSP_R1, 0) {
                Ok(()) => {
                    event.normal = 0;
                    Flow::Suspend
                }
                Err(err) => self.fail(st, slot, err),
            };
        }
        self.issue(st, slot, event)
    }

    fn issue(&self, st: &mut EngineState<N>, slot: u8, event: &mut Event) -> Flow {
        let mode = st.slot.transfer_mode;
        let cmd = st.pool.get_mut(slot);

        let transfer_mode = if cmd.data.is_some() {
            match self.host.prepare_transfer(mode, st.adma, cmd) {
                Ok(bits) => bits,
                Err(err) => return self.fail(st, slot, err),
            }
        } else {
            0
        };

        cmd.state = State::DataTransfer;
        if let Err(err) = self.send_raw(cmd.entry.index, cmd.arg, cmd.entry.response, transfer_mode) {
            return self.fail(st, slot, err);
        }
        event.normal = 0;

        if cmd.has_flag(CMD_IGNORE_CMD_COMPLETE) {
            trace!("{TAG} not waiting for CMD{} to complete", cmd.entry.index);
            Flow::Continue
        } else {
            Flow::Suspend
        }
    }

    fn data_transfer(&self, st: &mut EngineState<N>, slot: u8, event: &mut Event) -> Flow {
        let mode = st.slot.transfer_mode;
        let cmd = st.pool.get_mut(slot);

        let done = if cmd.data.is_some() {
            match self.host.execute_transfer(mode, cmd, event) {
                Ok(done) => done,
                Err(err) => return self.fail(st, slot, err),
            }
        } else {
            if cmd.has_flag(CMD_IGNORE_CMD_COMPLETE) || event.normal & SDHC_INT_CMD_COMPLETE != 0 {
                cmd.cmd_done = true;
            }
            // R1b commands hold DAT0 busy and report its release as transfer complete
            let busy_done = cmd.entry.response & RSP_48_BUSY != RSP_48_BUSY
                || event.normal & SDHC_INT_XFER_COMPLETE != 0;
            cmd.cmd_done && busy_done
        };

        if done {
            cmd.state = State::CommandSent;
            Flow::Continue
        } else {
            Flow::Suspend
        }
    }

    /// Writes argument, transfer mode and command registers.
    fn send_raw(&self, index: u8, arg: u32, response: u8, transfer_mode: u16) -> Result<(), Error> {
        if index != MMC_GO_IDLE_STATE {
            self.host
                .wait_for_bits32(
                    SDHC_PRESENT_STATE,
                    SDHC_PRESENT_STATE_CMD_INHIBIT | SDHC_PRESENT_STATE_DAT_INHIBIT,
                    false,
                )
                .inspect_err(|err| warn!("{TAG} CMD{index} lines stayed inhibited: {err:?}"))?;
        }

        let regs = self.host.regs();
        regs.write16(SDHC_NORMAL_INT_STATUS, SDHC_INT_COMMAND_EVENTS);
        regs.write16(SDHC_ERROR_INT_STATUS, 0xFFFF);
        regs.write32(SDHC_ARGUMENT, arg);
        regs.write16(SDHC_TRANSFER_MODE, transfer_mode);
        regs.write16(SDHC_COMMAND, (index as u16) << 8 | response as u16);
        trace!("{TAG} sent CMD{index} arg {arg:#x} response {response:#x} mode {transfer_mode:#x}");
        Ok(())
    }

    pub(crate) fn fire(&self, finished: Finished<N>) {
        for (completion, reply) in finished.items.into_iter().take(finished.len).flatten() {
            match completion.0 {
                Notify::None => {}
                Notify::Callback { func, context } => func(context, reply.result),
                Notify::Sync => self.reply.signal(reply),
            }
        }
    }

    /// Runs one command to completion and returns its response words.
    pub async fn send_command(&self, cmd: u32, arg: u32, timeout_ms: u64) -> Result<[u32; 4], Error> {
        self.send_command_with_data(cmd, arg, timeout_ms, None).await
    }

    /// Runs one data-bearing command to completion.
    ///
    /// The buffer behind `data` must outlive the command. If this future is
    /// dropped while the command is in flight, the drop blocks until the
    /// engine has finished with the buffer.
    pub async fn send_command_with_data(
        &self,
        cmd: u32,
        arg: u32,
        timeout_ms: u64,
        data: Option<DataRequest>,
    ) -> Result<[u32; 4], Error> {
        let _sync = self.sync_lock.lock().await;
        self.reply.reset();
        self.submit(cmd, arg, timeout_ms, data, Completion::sync())?;

        let mut in_flight = InFlight {
            engine: self,
            armed: true,
        };
        let reply = self.wait_reply().await;
        in_flight.armed = false;

        reply.result.map(|_| reply.response)
    }

    async fn wait_reply(&self) -> CmdReply {
        loop {
            if let Some(reply) = self.reply.try_take() {
                return reply;
            }

            if self.config.polled {
                self.on_interrupt();
                self.check_timeout(Instant::now());
                if let Some(reply) = self.reply.try_take() {
                    return reply;
                }
                yield_now().await;
            } else {
                let fallback = Instant::now() + SYNC_POLL_INTERVAL;
                let wake = self.deadline().map_or(fallback, |at| at.min(fallback));
                match select(self.reply.wait(), Timer::at(wake)).await {
                    Either::First(reply) => return reply,
                    Either::Second(()) => {
                        self.check_timeout(Instant::now());
                    }
                }
            }
        }
    }
}

struct InFlight<'a, R: Registers, const N: usize> {
    engine: &'a Engine<R, N>,
    armed: bool,
}

impl<R: Registers, const N: usize> Drop for InFlight<'_, R, N> {
    fn drop(&mut self) {
        if self.armed {
            warn!("{TAG} sync command dropped in flight, waiting for it");
            embassy_futures::block_on(self.engine.wait_reply());
        }
    }
}

/// Deadline `timeout_ms` from now, if that is representable.
fn deadline_after(timeout_ms: u64) -> Option<Instant> {
    if timeout_ms > TIMEOUT_MAX {
        return None;
    }
    Instant::now().checked_add(Duration::from_millis(timeout_ms))
}

fn check_data_request(entry: &CommandEntry, data: &DataRequest) -> Result<(), Error> {
    if !entry.has_data()
        || data.block_size == 0
        || data.block_size % 4 != 0
        || data.block_count == 0
        || data.block_count > u16::MAX as u32
        || data.offset + data.byte_len() > data.buffer.len()
    {
        warn!(
            "{TAG} CMD{} rejected data request of {} x {} bytes",
            entry.index, data.block_count, data.block_size
        );
        Err(Error::InvalidArg)?;
    }
    Ok(())
}

fn error_from_status(status: u16) -> Error {
    if status & SDHC_ERR_TIMEOUT_MASK != 0 {
        Error::Timeout
    } else if status & SDHC_ERR_CRC_MASK != 0 {
        Error::InvalidCrc
    } else if status & (SDHC_ERR_CMD_END_BIT | SDHC_ERR_CMD_INDEX) != 0 {
        Error::InvalidResponse
    } else {
        Error::Fail
    }
}

fn mask_check_and_clear(state: &mut u16, mask: u16) -> bool {
    let ret = ((*state) & mask) != 0;
    *state &= !mask;
    ret
}
