//! Bus transceiver: idle tracking and the TX/RX state machine.
//!
//! One lock guards one electrical transaction:
//! idle wait → transmit → TX complete → (reply capture → decode).
//! All waits share a single `bus_timeout_ms` budget counted from the start
//! of the transaction. There are no retries here.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace, warn};

use crate::codec::{self, BUS_IDLE_TIME_US};
use crate::config::Config;
use crate::error::{DriverStatus, Result, TransactionResult};
use crate::frame::Frame;
use crate::phy::{BusEvent, BusPhy, CaptureSink, EVENT_QUEUE_DEPTH};

const TRANSMIT_RETRY_INTERVAL: Duration = Duration::from_micros(200);
const REPLY_POLL_SLICE: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum TransceiverState {
    Idle = 0,
    WaitingForIdleLine = 1,
    Transmitting = 2,
    AwaitingReply = 3,
    Receiving = 4,
    Decoding = 5,
}

impl TransceiverState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => TransceiverState::WaitingForIdleLine,
            2 => TransceiverState::Transmitting,
            3 => TransceiverState::AwaitingReply,
            4 => TransceiverState::Receiving,
            5 => TransceiverState::Decoding,
            _ => TransceiverState::Idle,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransceiverStats {
    pub frames_sent: u32,
    pub replies_decoded: u32,
    pub busy_rejections: u32,
    pub timeouts: u32,
    pub frame_errors: u32,
    pub collisions: u32,
}

#[derive(Debug, Default)]
struct Counters {
    frames_sent: AtomicU32,
    replies_decoded: AtomicU32,
    busy_rejections: AtomicU32,
    timeouts: AtomicU32,
    frame_errors: AtomicU32,
    collisions: AtomicU32,
}

impl Counters {
    fn record(&self, status: DriverStatus) {
        let counter = match status {
            DriverStatus::BusBusy => &self.busy_rejections,
            DriverStatus::Timeout => &self.timeouts,
            DriverStatus::FrameError => &self.frame_errors,
            DriverStatus::Collision => &self.collisions,
            DriverStatus::Ok | DriverStatus::QueueFull => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

struct Channel {
    phy: Box<dyn BusPhy>,
    events: Receiver<BusEvent>,
}

impl Channel {
    /// Discard completions left over from async sends or abandoned replies.
    fn drain_stale(&mut self) {
        let mut drained = 0;
        while self.events.try_recv().is_ok() {
            drained += 1;
        }
        if drained > 0 {
            trace!("Drained {} stale bus events", drained);
        }
    }
}

/// Exclusive owner of one physical bus.
pub struct Transceiver {
    config: Config,
    sink: CaptureSink,
    state: AtomicU8,
    counters: Counters,
    channel: Mutex<Channel>,
}

impl Transceiver {
    /// Claim the hardware and start tracking bus activity.
    ///
    /// Failing to claim the channels is the only fatal error in the driver.
    pub fn init<P: BusPhy + 'static>(config: Config, mut phy: P) -> Result<Self> {
        config.validate()?;

        let (sink, events) = CaptureSink::new(EVENT_QUEUE_DEPTH);
        if let Err(e) = phy.claim(&config, sink.clone()) {
            error!(
                "Failed to claim DALI channels (rx={}, tx={}): {}",
                config.rx_pin, config.tx_pin, e
            );
            return Err(e);
        }
        sink.on_edge();

        info!(
            "DALI transceiver ready (rx={}, tx={}, timeout={}ms)",
            config.rx_pin, config.tx_pin, config.bus_timeout_ms
        );

        Ok(Self {
            config,
            sink,
            state: AtomicU8::new(TransceiverState::Idle as u8),
            counters: Counters::default(),
            channel: Mutex::new(Channel {
                phy: Box::new(phy),
                events,
            }),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> TransceiverState {
        TransceiverState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Microseconds since init of the most recent edge on the line.
    pub fn last_activity_us(&self) -> u64 {
        self.sink.last_activity_us()
    }

    pub fn is_idle(&self) -> bool {
        self.sink.idle_for_us() >= BUS_IDLE_TIME_US
    }

    pub fn stats(&self) -> TransceiverStats {
        let c = &self.counters;
        TransceiverStats {
            frames_sent: c.frames_sent.load(Ordering::Relaxed),
            replies_decoded: c.replies_decoded.load(Ordering::Relaxed),
            busy_rejections: c.busy_rejections.load(Ordering::Relaxed),
            timeouts: c.timeouts.load(Ordering::Relaxed),
            frame_errors: c.frame_errors.load(Ordering::Relaxed),
            collisions: c.collisions.load(Ordering::Relaxed),
        }
    }

    /// Fire-and-forget transmit. Never blocks.
    ///
    /// Returns `BusBusy` without side effects if another transaction holds
    /// the bus, the line has been active within the idle threshold, or the
    /// transmitter is still sending.
    pub fn send_async(&self, frame: &Frame) -> DriverStatus {
        let mut channel = match self.channel.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return self.finish(frame, DriverStatus::BusBusy),
        };

        if !self.is_idle() {
            return self.finish(frame, DriverStatus::BusBusy);
        }

        let pulses = codec::encode(frame);
        match channel.phy.transmit(&pulses) {
            Ok(()) => {
                self.sink.on_edge();
                self.counters.frames_sent.fetch_add(1, Ordering::Relaxed);
                trace!("Async frame {} dispatched", frame);
                DriverStatus::Ok
            }
            Err(nb::Error::WouldBlock) => self.finish(frame, DriverStatus::BusBusy),
            Err(nb::Error::Other(e)) => {
                error!("Transmitter rejected frame {}: {}", frame, e);
                self.finish(frame, DriverStatus::BusBusy)
            }
        }
    }

    /// Blocking transmit without a reply.
    pub fn send_raw(&self, frame: &Frame) -> DriverStatus {
        self.transact(frame, false).status
    }

    /// Blocking transmit expecting a backward frame.
    ///
    /// Timeouts, framing errors and collisions all read as "no answer";
    /// use [`Transceiver::transact`] to tell them apart.
    pub fn send_query(&self, frame: &Frame) -> Option<u8> {
        self.transact(frame, true).backward_byte()
    }

    /// One full electrical transaction under the transceiver lock.
    ///
    /// Without `expect_reply` a successful result carries no data.
    pub fn transact(&self, frame: &Frame, expect_reply: bool) -> TransactionResult {
        let mut channel = self.lock_channel();
        let result = self.transact_locked(&mut channel, frame, expect_reply);
        self.set_state(TransceiverState::Idle);
        self.finish(frame, result.status);
        result
    }

    fn transact_locked(
        &self,
        channel: &mut Channel,
        frame: &Frame,
        expect_reply: bool,
    ) -> TransactionResult {
        // One budget for every phase of the transaction
        let deadline = Instant::now() + self.config.bus_timeout();

        self.set_state(TransceiverState::WaitingForIdleLine);
        if !self.wait_for_idle(deadline) {
            debug!("Line never went idle, frame {} not sent", frame);
            return TransactionResult::failed(DriverStatus::Timeout);
        }

        channel.drain_stale();
        let pulses = codec::encode(frame);
        if expect_reply {
            channel.phy.arm_receive();
        }

        self.set_state(TransceiverState::Transmitting);
        loop {
            match channel.phy.transmit(&pulses) {
                Ok(()) => break,
                Err(nb::Error::WouldBlock) => {
                    if Instant::now() >= deadline {
                        return TransactionResult::failed(DriverStatus::Timeout);
                    }
                    thread::sleep(TRANSMIT_RETRY_INTERVAL);
                }
                Err(nb::Error::Other(e)) => {
                    error!("Transmitter rejected frame {}: {}", frame, e);
                    return TransactionResult::failed(DriverStatus::BusBusy);
                }
            }
        }
        self.sink.on_edge();
        self.counters.frames_sent.fetch_add(1, Ordering::Relaxed);

        if let Err(status) = self.wait_tx_done(channel, deadline) {
            return TransactionResult::failed(status);
        }
        if !expect_reply {
            return TransactionResult::ok(0, 0);
        }

        self.set_state(TransceiverState::AwaitingReply);
        self.await_reply(channel, deadline)
    }

    fn wait_tx_done(
        &self,
        channel: &mut Channel,
        deadline: Instant,
    ) -> std::result::Result<(), DriverStatus> {
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match channel.events.recv_timeout(remaining) {
                Ok(BusEvent::TxDone) => return Ok(()),
                Ok(BusEvent::BusFault) => return Err(DriverStatus::Collision),
                // Capture of someone else's traffic, not ours
                Ok(BusEvent::RxDone(_)) => continue,
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    warn!("No transmit completion within {:?}", self.config.bus_timeout());
                    return Err(DriverStatus::Timeout);
                }
            }
        }
    }

    fn await_reply(&self, channel: &mut Channel, deadline: Instant) -> TransactionResult {
        let tx_done_us = self.sink.last_activity_us();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return TransactionResult::failed(DriverStatus::Timeout);
            }
            match channel.events.recv_timeout(remaining.min(REPLY_POLL_SLICE)) {
                Ok(BusEvent::RxDone(capture)) => {
                    self.set_state(TransceiverState::Decoding);
                    let result = codec::decode(&capture);
                    if result.status.is_ok() {
                        self.counters.replies_decoded.fetch_add(1, Ordering::Relaxed);
                    }
                    return result;
                }
                Ok(BusEvent::BusFault) => return TransactionResult::failed(DriverStatus::Collision),
                Ok(BusEvent::TxDone) => continue,
                Err(RecvTimeoutError::Timeout) => {
                    if self.sink.last_activity_us() > tx_done_us {
                        self.set_state(TransceiverState::Receiving);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return TransactionResult::failed(DriverStatus::Timeout);
                }
            }
        }
    }

    /// Sleep until the line has been quiet for the idle threshold.
    fn wait_for_idle(&self, deadline: Instant) -> bool {
        loop {
            let idle_for = self.sink.idle_for_us();
            if idle_for >= BUS_IDLE_TIME_US {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let needed = Duration::from_micros(BUS_IDLE_TIME_US - idle_for);
            thread::sleep(needed.min(deadline - now));
        }
    }

    fn lock_channel(&self) -> MutexGuard<'_, Channel> {
        self.channel.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: TransceiverState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn finish(&self, frame: &Frame, status: DriverStatus) -> DriverStatus {
        self.counters.record(status);
        match status {
            DriverStatus::Ok => {}
            DriverStatus::BusBusy | DriverStatus::Timeout | DriverStatus::QueueFull => {
                debug!("Frame {}: {}", frame, status)
            }
            DriverStatus::FrameError | DriverStatus::Collision => {
                warn!("Frame {}: {}", frame, status)
            }
        }
        status
    }
}

impl Drop for Transceiver {
    fn drop(&mut self) {
        let channel = self
            .channel
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        channel.phy.release();
        debug!("DALI transceiver released (tx={})", self.config.tx_pin);
    }
}

impl core::fmt::Debug for Transceiver {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Transceiver")
            .field("config", &self.config)
            .field("state", &self.state())
            .field("last_activity_us", &self.last_activity_us())
            .finish()
    }
}

