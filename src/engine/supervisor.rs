//! Interrupt, timeout and card-change entry points into the engine.

use embassy_futures::select::{select, Either};
use embassy_time::{Duration, Instant, Timer};
use log::{debug, info, trace, warn};

use crate::{
    block::MediaState,
    card::CardIdentity,
    cmd::State,
    common::TIMEOUT_30S,
    engine::{mask_check_and_clear, CardEvent, Engine, EngineState, Event, Finished, SlotContext},
    sdhc::ll::*,
    Error,
};

const TAG: &'static str = "[SDHC_SUPERVISOR]";

impl<R: Registers, const N: usize> Engine<R, N> {
    /// Interrupt handler body. Acknowledges the pending status and feeds it
    /// to the current command.
    pub fn on_interrupt(&self) {
        let regs = self.host.regs();
        let normal = regs.read16(SDHC_NORMAL_INT_STATUS);
        if normal == 0 {
            return;
        }
        regs.write16(SDHC_NORMAL_INT_STATUS, normal);

        let mut error = 0;
        if normal & SDHC_INT_ERROR != 0 {
            error = regs.read16(SDHC_ERROR_INT_STATUS);
            regs.write16(SDHC_ERROR_INT_STATUS, error);
        }
        trace!("{TAG} status {normal:#06x} error {error:#06x}");

        let mut event = Event { normal, error };
        let mut finished = Finished::new();
        self.with_state(|st| {
            if mask_check_and_clear(&mut event.normal, SDHC_INT_CARD_REMOVAL) {
                self.abort_all(st, &mut finished);
            }
            event.normal &= !SDHC_INT_CARD_INSERTION;

            if st.current.is_some() && event.normal != 0 {
                self.process(st, event, &mut finished);
            }
        });
        self.fire(finished);

        if normal & SDHC_INT_CARD_REMOVAL != 0 {
            self.notify_card_change(CardEvent::Removed);
        }
        if normal & SDHC_INT_CARD_INSERTION != 0 {
            self.notify_card_change(CardEvent::Inserted);
        }
    }

    fn notify_card_change(&self, event: CardEvent) {
        debug!("{TAG} card event {event:?}");
        if self.card_events.try_send(event).is_err() {
            warn!("{TAG} card event queue full, dropping {event:?}");
        }
    }

    /// Fails the current command and everything queued behind it.
    fn abort_all(&self, st: &mut EngineState<N>, finished: &mut Finished<N>) {
        let mut aborted = 0;
        while let Some(slot) = st.current.take().or_else(|| st.dequeue()) {
            let cmd = st.pool.get_mut(slot);
            cmd.result = Err(Error::Aborted);
            cmd.state = State::Complete;
            finished.push(cmd);
            st.pool.release(slot);
            aborted += 1;
        }
        st.deadline = None;
        st.slot.selected = false;
        if aborted > 0 {
            warn!("{TAG} card removed, aborted {aborted} commands");
        }
    }

    /// Fires the deadline if it passed. Returns true when a command timed out.
    pub fn check_timeout(&self, now: Instant) -> bool {
        let mut finished = Finished::new();
        let expired = self.with_state(|st| {
            let Some(slot) = st.current else {
                return false;
            };
            if !st.deadline.is_some_and(|at| now >= at) {
                return false;
            }

            warn!(
                "{TAG} CMD{} timed out after {} ms",
                st.pool.get(slot).entry.index,
                st.pool.get(slot).timeout_ms
            );
            let _ = self.host.reset(SDHC_SOFTWARE_RESET_CMD);
            let _ = self.host.reset(SDHC_SOFTWARE_RESET_DAT);
            let cmd = st.pool.get_mut(slot);
            cmd.result = Err(Error::Timeout);
            cmd.state = State::Complete;
            self.process(st, Event::default(), &mut finished);
            true
        });
        self.fire(finished);
        expired
    }

    /// Timer task: sleeps until the current deadline and fires it. Each
    /// dispatch re-arms it.
    pub async fn run_timeout_timer(&self) -> ! {
        loop {
            match self.deadline() {
                Some(at) => {
                    if let Either::Second(()) = select(self.timer_rearm.wait(), Timer::at(at)).await {
                        self.check_timeout(Instant::now());
                    }
                }
                None => self.timer_rearm.wait().await,
            }
        }
    }

    /// Card-change task: handles insert/remove events outside interrupt
    /// context.
    pub async fn run_card_change_task(&self) -> ! {
        loop {
            let event = self.card_events.receive().await;
            debug!("{TAG} handling {event:?}");
            self.handle_card_change().await;
        }
    }

    /// Re-initializes the slot if the card came or went since the last
    /// bring-up and publishes the resulting media state.
    pub async fn handle_card_change(&self) -> MediaState {
        let present = self.host.is_card_present();
        let inserted = self.with_state(|st| st.slot.inserted);
        let changed = present != inserted;

        if changed {
            info!("{TAG} card {}", if present { "inserted" } else { "removed" });
            if let Err(err) = self.init_controller() {
                warn!("{TAG} controller init failed: {err:?}");
            } else if present {
                let _ = self
                    .init_card()
                    .await
                    .inspect_err(|err| warn!("{TAG} card init failed: {err:?}"));
            } else {
                self.with_state(|st| {
                    st.slot.inserted = false;
                    st.card = CardIdentity::default();
                });
            }
        }

        let state = MediaState { present, changed };
        self.media.signal(state);
        state
    }

    /// Waits for the next media state published by the card-change task.
    pub async fn wait_media_change(&self) -> MediaState {
        self.media.wait().await
    }

    /// Resets the controller and forgets the previous slot configuration.
    pub(crate) fn init_controller(&self) -> Result<(), Error> {
        self.host.init()?;
        self.host.set_bus_width(crate::Width::Bit1);
        self.host.set_dma_mode(crate::TransferMode::Pio);
        self.with_state(|st| {
            let inserted = st.slot.inserted;
            let suspended = st.slot.suspended;
            st.slot = SlotContext {
                inserted,
                suspended,
                ..SlotContext::new()
            };
        });
        Ok(())
    }

    /// Brings up the controller and, when a card is present, the card.
    pub async fn init(&self) -> Result<(), Error> {
        self.init_controller()?;
        if self.host.is_card_present() {
            self.init_card().await?;
        } else {
            info!("{TAG} no card present");
        }
        Ok(())
    }

    /// Blocks new I/O until [`resume`](Self::resume).
    pub fn suspend(&self) {
        info!("{TAG} suspending");
        self.with_state(|st| st.slot.suspended = true);
    }

    /// Re-runs controller and card bring-up, then lets I/O through again.
    pub async fn resume(&self) -> Result<(), Error> {
        info!("{TAG} resuming");
        let result = self.init().await;
        self.with_state(|st| st.slot.suspended = false);
        result
    }

    pub fn is_suspended(&self) -> bool {
        self.with_state(|st| st.slot.suspended)
    }

    /// Waits up to 30 s for a pending resume.
    pub(crate) async fn wait_awake(&self) -> Result<(), Error> {
        if !self.is_suspended() {
            return Ok(());
        }

        debug!("{TAG} waiting for resume");
        let until = Instant::now() + Duration::from_millis(TIMEOUT_30S);
        while self.is_suspended() {
            if Instant::now() >= until {
                warn!("{TAG} timed out waiting for resume");
                Err(Error::Timeout)?;
            }
            Timer::after_millis(10).await;
        }
        Ok(())
    }
}
