//! Hardware boundary.
//!
//! A [`BusPhy`] is one TX/RX channel pair wired to the bus. The transceiver
//! hands it a [`CaptureSink`] at claim time; the PHY reports edges and
//! completions through that sink from whatever context its hardware callback
//! runs in. Levels on this boundary follow [`crate::codec::Level`]: Active
//! is the driven state, and a logical 1 is Active then Idle.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::time::Instant;

use crate::codec::{Pulse, PulseTrain};
use crate::config::Config;
use crate::error::{DaliError, Result};

/// Depth of the event channel between the capture callback and the
/// transceiver.
pub const EVENT_QUEUE_DEPTH: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    /// The last waveform handed to [`BusPhy::transmit`] left the wire.
    TxDone,
    /// A complete capture ended by the receiver's idle threshold.
    RxDone(PulseTrain),
    /// The line was driven while we were transmitting.
    BusFault,
}

/// State shared between the transceiver and the capture callback.
///
/// The callback may only bump the timestamp and post events; it never
/// blocks, allocates, or touches the transceiver lock.
#[derive(Debug)]
struct CaptureContext {
    epoch: Instant,
    last_activity_us: AtomicU64,
    events: SyncSender<BusEvent>,
    dropped_events: AtomicU32,
}

/// Cloneable handle to the capture context, registered with the PHY.
#[derive(Debug, Clone)]
pub struct CaptureSink {
    ctx: Arc<CaptureContext>,
}

impl CaptureSink {
    /// Create a sink and the receiving end of its event channel.
    pub fn new(depth: usize) -> (Self, Receiver<BusEvent>) {
        let (tx, rx) = sync_channel(depth);
        let sink = Self {
            ctx: Arc::new(CaptureContext {
                epoch: Instant::now(),
                last_activity_us: AtomicU64::new(0),
                events: tx,
                dropped_events: AtomicU32::new(0),
            }),
        };
        (sink, rx)
    }

    /// Microseconds since the sink was created. Monotonic.
    pub fn now_us(&self) -> u64 {
        self.ctx.epoch.elapsed().as_micros() as u64
    }

    pub fn last_activity_us(&self) -> u64 {
        self.ctx.last_activity_us.load(Ordering::Acquire)
    }

    /// Microseconds the line has been quiet.
    pub fn idle_for_us(&self) -> u64 {
        self.now_us().saturating_sub(self.last_activity_us())
    }

    /// Record a level transition observed now.
    pub fn on_edge(&self) {
        let now = self.now_us();
        self.stamp(now);
    }

    /// Record a level transition at a known instant.
    pub fn on_edge_at(&self, at: Instant) {
        let us = at.saturating_duration_since(self.ctx.epoch).as_micros() as u64;
        self.stamp(us);
    }

    pub fn on_tx_done(&self) {
        self.post(BusEvent::TxDone);
    }

    pub fn on_rx_done(&self, capture: PulseTrain) {
        self.post(BusEvent::RxDone(capture));
    }

    /// Report a capture built from a borrowed slice. Excess pulses are
    /// truncated, which the decoder then rejects.
    pub fn on_rx_done_from(&self, pulses: &[Pulse]) {
        let mut capture = PulseTrain::new();
        for pulse in pulses {
            if capture.push(*pulse).is_err() {
                break;
            }
        }
        self.on_rx_done(capture);
    }

    pub fn on_bus_fault(&self) {
        self.post(BusEvent::BusFault);
    }

    /// Events lost because the channel was full.
    pub fn dropped_events(&self) -> u32 {
        self.ctx.dropped_events.load(Ordering::Relaxed)
    }

    fn stamp(&self, us: u64) {
        // Edges may be reported out of order by different sources
        self.ctx.last_activity_us.fetch_max(us, Ordering::AcqRel);
    }

    fn post(&self, event: BusEvent) {
        match self.ctx.events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.ctx.dropped_events.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// One claimed TX/RX channel pair.
///
/// Implementations must report every edge they see (own or third-party
/// traffic) through [`CaptureSink::on_edge`] and exactly one
/// [`BusEvent::TxDone`] per accepted transmission.
pub trait BusPhy: Send {
    /// Acquire the hardware channels for `config.rx_pin` / `config.tx_pin`
    /// and install the capture callback.
    fn claim(&mut self, config: &Config, sink: CaptureSink) -> Result<()>;

    /// Start sending a waveform. `WouldBlock` means the transmitter is still
    /// busy with a previous frame.
    fn transmit(&mut self, pulses: &[Pulse]) -> nb::Result<(), DaliError>;

    /// Capture the reply to the next transmission. Arming applies to one
    /// transmission only.
    fn arm_receive(&mut self);

    /// Give the channels back. Called when the transceiver is dropped.
    fn release(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edge_stamps_are_monotonic() {
        let (sink, _rx) = CaptureSink::new(EVENT_QUEUE_DEPTH);
        let later = Instant::now() + std::time::Duration::from_millis(5);
        sink.on_edge_at(later);
        let stamped = sink.last_activity_us();
        sink.on_edge_at(Instant::now());
        assert_eq!(sink.last_activity_us(), stamped);
    }

    #[test]
    fn test_full_channel_counts_drops() {
        let (sink, rx) = CaptureSink::new(2);
        sink.on_tx_done();
        sink.on_tx_done();
        sink.on_bus_fault();
        assert_eq!(sink.dropped_events(), 1);
        assert_eq!(rx.try_recv(), Ok(BusEvent::TxDone));
    }
}
