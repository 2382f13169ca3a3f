use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use super::faults::{LineFault, LineFaultConfig, LineFaultInjector, LineFaultStats};
use super::gear::{ControlGear, GearState};
use crate::codec::{self, Level, Pulse, PulseTrain, HALF_BIT_US};
use crate::config::Config;
use crate::error::{DaliError, Result};
use crate::frame::{Frame, FrameLength};
use crate::phy::{BusPhy, CaptureSink};

/// Gap between the end of a forward frame and the start of the reply.
pub const BACKWARD_SETTLING: Duration = Duration::from_millis(4);
/// How long a stuck transmitter holds the line.
pub const STUCK_ACTIVE_US: u32 = 5_000;

// Stretched half-bit used for timing corruption, between the T and 2T windows
const CORRUPT_HALF_BIT_US: u32 = 3 * HALF_BIT_US / 2;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
struct LineShared {
    gear: Mutex<Vec<ControlGear>>,
    faults: Mutex<LineFaultInjector>,
    sink: Mutex<Option<CaptureSink>>,
    claimed: AtomicBool,
}

impl LineShared {
    /// Let every gear hear a forward frame; collect their answers.
    fn deliver(&self, pulses: &[Pulse], heard_at: Instant) -> Vec<u8> {
        let heard = codec::decode(pulses);
        if !heard.status.is_ok() || heard.bit_length != FrameLength::Forward16.bits() {
            return Vec::new();
        }
        lock(&self.gear)
            .iter_mut()
            .filter_map(|gear| gear.handle(heard.data as u16, heard_at))
            .collect()
    }

    fn sink(&self) -> Option<CaptureSink> {
        lock(&self.sink).clone()
    }
}

/// Sleep until `at`, reporting nothing.
fn wait_until(at: Instant) {
    let now = Instant::now();
    if at > now {
        thread::sleep(at - now);
    }
}

/// Drive a waveform onto the line in real time, stamping each transition.
fn play(sink: Option<&CaptureSink>, pulses: &[Pulse]) {
    let mut at = Instant::now();
    let mut level = Level::Idle;
    for pulse in pulses {
        wait_until(at);
        if pulse.level != level {
            if let Some(sink) = sink {
                sink.on_edge_at(at);
            }
            level = pulse.level;
        }
        at += Duration::from_micros(u64::from(pulse.duration_us));
    }
    wait_until(at);
}

/// Superimpose backward frames: Active dominates, like the real current loop.
fn wired_and(replies: &[u8]) -> PulseTrain {
    let mut combined = PulseTrain::new();
    for (index, reply) in replies.iter().enumerate() {
        let waveform = codec::encode(&Frame::backward(*reply));
        if index == 0 {
            combined = waveform;
            continue;
        }
        for (line, driven) in combined.iter_mut().zip(waveform.iter()) {
            if driven.level == Level::Active {
                line.level = Level::Active;
            }
        }
    }
    combined
}

#[derive(Debug)]
struct Job {
    pulses: PulseTrain,
    capture_reply: bool,
}

fn run_worker(
    shared: Arc<LineShared>,
    sink: CaptureSink,
    jobs: Receiver<Job>,
    busy: Arc<AtomicBool>,
) {
    for job in jobs.iter() {
        let fault = lock(&shared.faults).roll();

        if fault == Some(LineFault::StuckActive) {
            debug!("Simulated line stuck active");
            sink.on_edge();
            sink.on_bus_fault();
            play(Some(&sink), &[Pulse::new(Level::Active, STUCK_ACTIVE_US)]);
            sink.on_edge();
            busy.store(false, Ordering::Release);
            continue;
        }

        play(Some(&sink), &job.pulses);
        sink.on_tx_done();

        let replies = shared.deliver(&job.pulses, Instant::now());
        if !replies.is_empty() && fault != Some(LineFault::DropReply) {
            thread::sleep(BACKWARD_SETTLING);
            let mut reply = wired_and(&replies);
            if replies.len() > 1 {
                trace!("{} gear answered at once", replies.len());
            }
            if fault == Some(LineFault::CorruptTiming) {
                if let Some(pulse) = reply.get_mut(3) {
                    pulse.duration_us = CORRUPT_HALF_BIT_US;
                }
            }
            play(Some(&sink), &reply);
            if job.capture_reply {
                sink.on_rx_done(reply);
            }
        }

        busy.store(false, Ordering::Release);
    }
    trace!("Simulated line worker stopped");
}

/// An in-process DALI line with simulated control gear.
///
/// Cloning yields another handle to the same wire.
#[derive(Debug, Clone)]
pub struct SimulatedLine {
    shared: Arc<LineShared>,
}

impl SimulatedLine {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(LineShared {
                gear: Mutex::new(Vec::new()),
                faults: Mutex::new(LineFaultInjector::disabled()),
                sink: Mutex::new(None),
                claimed: AtomicBool::new(false),
            }),
        }
    }

    pub fn with_gear(self, gear: ControlGear) -> Self {
        self.add_gear(gear);
        self
    }

    pub fn add_gear(&self, gear: ControlGear) {
        lock(&self.shared.gear).push(gear);
    }

    /// State of the first gear answering to `short_address`.
    pub fn gear_state(&self, short_address: u8) -> Option<GearState> {
        lock(&self.shared.gear)
            .iter()
            .find(|g| g.short_address() == Some(short_address))
            .map(ControlGear::state)
    }

    pub fn gear_snapshot(&self) -> Vec<GearState> {
        lock(&self.shared.gear).iter().map(ControlGear::state).collect()
    }

    pub fn set_faults(&self, config: LineFaultConfig) {
        *lock(&self.shared.faults) = LineFaultInjector::new(config);
    }

    pub fn fault_stats(&self) -> LineFaultStats {
        lock(&self.shared.faults).stats().clone()
    }

    pub fn is_claimed(&self) -> bool {
        self.shared.claimed.load(Ordering::Acquire)
    }

    /// A fresh, unclaimed PHY attached to this line.
    pub fn phy(&self) -> SimulatedPhy {
        SimulatedPhy {
            shared: Arc::clone(&self.shared),
            jobs: None,
            worker: None,
            busy: Arc::new(AtomicBool::new(false)),
            armed: false,
            tx_pin: 0,
        }
    }

    /// Play a forward frame from another controller on the line.
    ///
    /// Gear act on it and answer as usual; the claimed transceiver sees the
    /// edges but no capture.
    pub fn inject_traffic(&self, frame: Frame) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        thread::spawn(move || {
            let sink = shared.sink();
            let pulses = codec::encode(&frame);
            play(sink.as_ref(), &pulses);
            let replies = shared.deliver(&pulses, Instant::now());
            if !replies.is_empty() {
                thread::sleep(BACKWARD_SETTLING);
                play(sink.as_ref(), &wired_and(&replies));
            }
        })
    }
}

impl Default for SimulatedLine {
    fn default() -> Self {
        Self::new()
    }
}

/// [`BusPhy`] backed by a [`SimulatedLine`].
///
/// A worker thread plays each waveform in real time, so bus timing seen by
/// the transceiver matches a physical 1200 baud line.
#[derive(Debug)]
pub struct SimulatedPhy {
    shared: Arc<LineShared>,
    jobs: Option<SyncSender<Job>>,
    worker: Option<JoinHandle<()>>,
    busy: Arc<AtomicBool>,
    armed: bool,
    tx_pin: u8,
}

impl BusPhy for SimulatedPhy {
    fn claim(&mut self, config: &Config, sink: CaptureSink) -> Result<()> {
        if config.rx_pin == config.tx_pin {
            return Err(DaliError::PinConflict(config.rx_pin));
        }
        if self
            .shared
            .claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(DaliError::ChannelUnavailable {
                pin: config.tx_pin,
                reason: "line already claimed by another transceiver".into(),
            });
        }

        let (tx, rx) = sync_channel(1);
        let shared = Arc::clone(&self.shared);
        let busy = Arc::clone(&self.busy);
        let worker_sink = sink.clone();
        let spawned = thread::Builder::new()
            .name(format!("dali-sim-tx{}", config.tx_pin))
            .spawn(move || run_worker(shared, worker_sink, rx, busy));

        let worker = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.shared.claimed.store(false, Ordering::Release);
                return Err(e.into());
            }
        };

        *lock(&self.shared.sink) = Some(sink);
        self.jobs = Some(tx);
        self.worker = Some(worker);
        self.tx_pin = config.tx_pin;
        debug!("Simulated line claimed (tx={})", config.tx_pin);
        Ok(())
    }

    fn transmit(&mut self, pulses: &[Pulse]) -> nb::Result<(), DaliError> {
        let jobs = match &self.jobs {
            Some(jobs) => jobs,
            None => {
                return Err(nb::Error::Other(DaliError::ChannelUnavailable {
                    pin: self.tx_pin,
                    reason: "transmit before claim".into(),
                }))
            }
        };
        if self.busy.swap(true, Ordering::AcqRel) {
            return Err(nb::Error::WouldBlock);
        }

        let mut waveform = PulseTrain::new();
        for pulse in pulses {
            if waveform.push(*pulse).is_err() {
                self.busy.store(false, Ordering::Release);
                return Err(nb::Error::Other(DaliError::InvalidConfig(
                    "waveform exceeds pulse train capacity".into(),
                )));
            }
        }

        let job = Job {
            pulses: waveform,
            capture_reply: std::mem::take(&mut self.armed),
        };
        if jobs.try_send(job).is_err() {
            warn!("Simulated transmitter queue rejected a frame");
            self.busy.store(false, Ordering::Release);
            return Err(nb::Error::WouldBlock);
        }
        Ok(())
    }

    fn arm_receive(&mut self) {
        self.armed = true;
    }

    fn release(&mut self) {
        // Dropping the sender ends the worker loop
        self.jobs = None;
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
            *lock(&self.shared.sink) = None;
            self.shared.claimed.store(false, Ordering::Release);
            debug!("Simulated line released (tx={})", self.tx_pin);
        }
    }
}

impl Drop for SimulatedPhy {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wired_and_of_identical_replies_is_clean() {
        let combined = wired_and(&[0x5A, 0x5A]);
        assert_eq!(codec::decode(&combined).backward_byte(), Some(0x5A));
    }

    #[test]
    fn test_wired_and_of_different_replies_collides() {
        let combined = wired_and(&[0x01, 0x80]);
        assert_eq!(
            codec::decode(&combined).status,
            crate::error::DriverStatus::Collision
        );
    }

    #[test]
    fn test_deliver_reaches_addressed_gear() {
        let line = SimulatedLine::new()
            .with_gear(ControlGear::new(3).with_level(77))
            .with_gear(ControlGear::new(4).with_level(12));
        let query = Frame::forward(0x07, crate::frame::opcode::QUERY_ACTUAL_LEVEL);
        let replies = line.shared.deliver(&codec::encode(&query), Instant::now());
        assert_eq!(replies, vec![77]);
    }
}
