//! Manchester frame codec.
//!
//! Electrical convention (IEC 62386-101): a logical 1 is an Active half-bit
//! followed by an Idle half-bit, a logical 0 is Idle then Active. Every frame
//! starts with a 1 and ends with at least two half-bit times of Idle.
//!
//! Both functions are pure and allocation-free; [`PulseTrain`] has a fixed
//! capacity large enough for a 24-bit frame plus guard.

use heapless::Vec;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;

use crate::error::{DriverStatus, TransactionResult};
use crate::frame::{Frame, FrameLength};

/// Bit time element T.
pub const HALF_BIT_US: u32 = 416;
/// Stop condition: two half-bit times of idle.
pub const GUARD_US: u32 = 2 * HALF_BIT_US;
/// Line must be quiet this long before a new transaction may start.
pub const BUS_IDLE_TIME_US: u64 = 2000;

pub const HALF_BIT_MIN_US: u32 = 312;
pub const HALF_BIT_MAX_US: u32 = 520;
pub const DOUBLE_HALF_BIT_MIN_US: u32 = 700;
pub const DOUBLE_HALF_BIT_MAX_US: u32 = 960;

pub const MAX_PULSES: usize = 64;

// start bit + 24 data bits, two half-bits each, plus the guard
const MAX_ENCODED_PULSES: usize = 2 * (1 + 24) + 1;
const MAX_HALF_BITS: usize = 2 * (1 + 24);

const_assert!(MAX_ENCODED_PULSES <= MAX_PULSES);
const_assert!(HALF_BIT_MIN_US < HALF_BIT_US && HALF_BIT_US < HALF_BIT_MAX_US);
const_assert!(HALF_BIT_MAX_US < DOUBLE_HALF_BIT_MIN_US);
const_assert!(DOUBLE_HALF_BIT_MIN_US < GUARD_US && GUARD_US < DOUBLE_HALF_BIT_MAX_US);

/// Line level. Active is the driven (low voltage) state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Level {
    Active,
    Idle,
}

impl Level {
    pub fn inverted(self) -> Self {
        match self {
            Level::Active => Level::Idle,
            Level::Idle => Level::Active,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pulse {
    pub level: Level,
    pub duration_us: u32,
}

impl Pulse {
    pub const fn new(level: Level, duration_us: u32) -> Self {
        Self { level, duration_us }
    }

    pub const fn half(level: Level) -> Self {
        Self::new(level, HALF_BIT_US)
    }
}

pub type PulseTrain = Vec<Pulse, MAX_PULSES>;

fn push_pulse(train: &mut PulseTrain, pulse: Pulse) {
    let pushed = train.push(pulse);
    debug_assert!(pushed.is_ok(), "pulse train capacity exceeded");
}

fn push_bit(train: &mut PulseTrain, bit: bool) {
    let first = if bit { Level::Active } else { Level::Idle };
    push_pulse(train, Pulse::half(first));
    push_pulse(train, Pulse::half(first.inverted()));
}

/// Manchester-encode a frame, MSB first.
///
/// One pulse per half-bit, never merged: `2 * (1 + bits)` pulses for the
/// start bit and data followed by a single Idle guard pulse.
pub fn encode(frame: &Frame) -> PulseTrain {
    let mut train = PulseTrain::new();
    push_bit(&mut train, true);

    let bits = frame.bit_length();
    for i in (0..bits).rev() {
        push_bit(&mut train, (frame.data() >> i) & 1 == 1);
    }

    push_pulse(&mut train, Pulse::new(Level::Idle, GUARD_US));
    train
}

/// Number of half-bits a run of one level stands for.
enum RunClass {
    Half(usize),
    Collision,
    Malformed,
}

fn classify(level: Level, duration_us: u32) -> RunClass {
    if (HALF_BIT_MIN_US..=HALF_BIT_MAX_US).contains(&duration_us) {
        RunClass::Half(1)
    } else if (DOUBLE_HALF_BIT_MIN_US..=DOUBLE_HALF_BIT_MAX_US).contains(&duration_us) {
        RunClass::Half(2)
    } else if level == Level::Active && duration_us > DOUBLE_HALF_BIT_MAX_US {
        // A lone transmitter never holds the line active past 2T
        RunClass::Collision
    } else {
        RunClass::Malformed
    }
}

/// Decode a captured pulse sequence.
///
/// Leading idle is ignored and adjacent same-level pulses are merged before
/// timing is checked, so both raw RMT captures and encoder output decode the
/// same way. The final Idle run is the stop condition and must hold for at
/// least 2T past the last half-bit.
pub fn decode(pulses: &[Pulse]) -> TransactionResult {
    let start = match pulses.iter().position(|p| p.level == Level::Active) {
        Some(index) => index,
        None => return TransactionResult::failed(DriverStatus::Timeout),
    };

    let mut runs: Vec<Pulse, MAX_PULSES> = Vec::new();
    for pulse in &pulses[start..] {
        match runs.last_mut() {
            Some(last) if last.level == pulse.level => {
                last.duration_us = last.duration_us.saturating_add(pulse.duration_us);
            }
            _ => {
                if runs.push(*pulse).is_err() {
                    return TransactionResult::failed(DriverStatus::FrameError);
                }
            }
        }
    }

    let mut halves: Vec<Level, MAX_HALF_BITS> = Vec::new();
    let last_index = runs.len() - 1;
    let mut stopped = false;

    for (index, run) in runs.iter().enumerate() {
        if index == last_index && run.level == Level::Idle {
            // The stop needs 2T of idle after the last half-bit, which this
            // run may also have to supply.
            let completes_bit = halves.len() % 2 == 1;
            let stop_min_us = if completes_bit {
                HALF_BIT_MIN_US + DOUBLE_HALF_BIT_MIN_US
            } else {
                DOUBLE_HALF_BIT_MIN_US
            };
            if run.duration_us < stop_min_us {
                return TransactionResult::failed(DriverStatus::FrameError);
            }
            if completes_bit && halves.push(Level::Idle).is_err() {
                return TransactionResult::failed(DriverStatus::FrameError);
            }
            stopped = true;
            break;
        }

        let count = match classify(run.level, run.duration_us) {
            RunClass::Half(count) => count,
            RunClass::Collision => return TransactionResult::failed(DriverStatus::Collision),
            RunClass::Malformed => return TransactionResult::failed(DriverStatus::FrameError),
        };
        for _ in 0..count {
            if halves.push(run.level).is_err() {
                return TransactionResult::failed(DriverStatus::FrameError);
            }
        }
    }

    // A capture that ends driven never saw its stop condition
    if !stopped || halves.len() % 2 == 1 {
        return TransactionResult::failed(DriverStatus::FrameError);
    }

    let mut data: u32 = 0;
    let mut bits: u8 = 0;
    for (index, pair) in halves.chunks(2).enumerate() {
        let bit = match (pair[0], pair[1]) {
            (Level::Active, Level::Idle) => true,
            (Level::Idle, Level::Active) => false,
            _ => return TransactionResult::failed(DriverStatus::Collision),
        };
        if index == 0 {
            if !bit {
                return TransactionResult::failed(DriverStatus::FrameError);
            }
            continue;
        }
        data = (data << 1) | u32::from(bit);
        bits += 1;
    }

    match FrameLength::from_bits(bits) {
        Some(length) => TransactionResult::ok(data, length.bits()),
        None => TransactionResult::failed(DriverStatus::FrameError),
    }
}
