//! Bus arbitration layer.
//!
//! [`DaliBus`] is the handle every caller shares. It holds a coarse lock for
//! a whole logical operation (first frame, optional repeat and the settling
//! gap) on top of the transceiver's per-transaction lock, so commands from
//! different callers never interleave on the wire.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{DriverStatus, TransactionResult};
use crate::frame::{opcode, AddressError, AddressType, Frame, MAX_GROUP};
use crate::transceiver::Transceiver;

/// Pause between the two frames of a send-twice command.
pub const REPEAT_SETTLE: Duration = Duration::from_millis(10);
/// Both frames of a send-twice command must land within this window.
pub const REPEAT_WINDOW: Duration = Duration::from_millis(100);

/// Answer to QUERY ACTUAL LEVEL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LevelReading {
    Level(u8),
    /// Gear reports MASK (0xFF): level unknown, e.g. during power-on.
    Mask,
    NoReply,
}

impl LevelReading {
    pub fn from_reply(reply: Option<u8>) -> Self {
        match reply {
            Some(0xFF) => LevelReading::Mask,
            Some(level) => LevelReading::Level(level),
            None => LevelReading::NoReply,
        }
    }

    pub fn level(self) -> Option<u8> {
        match self {
            LevelReading::Level(level) => Some(level),
            _ => None,
        }
    }
}

pub struct DaliBus {
    transceiver: Arc<Transceiver>,
    lock: Mutex<()>,
}

impl DaliBus {
    pub fn new(transceiver: Transceiver) -> Self {
        Self::from_shared(Arc::new(transceiver))
    }

    pub fn from_shared(transceiver: Arc<Transceiver>) -> Self {
        Self {
            transceiver,
            lock: Mutex::new(()),
        }
    }

    pub fn transceiver(&self) -> &Arc<Transceiver> {
        &self.transceiver
    }

    /// Standard command; `repeat` sends the frame a second time within the
    /// send-twice window when the first one went out cleanly.
    ///
    /// For [`AddressType::Special`], `command` is the special opcode and
    /// `address` its data byte.
    pub fn send_command(
        &self,
        address_type: AddressType,
        address: u8,
        command: u8,
        repeat: bool,
    ) -> DriverStatus {
        match Frame::command(address_type, address, command) {
            Ok(frame) => self.send(&frame, repeat),
            Err(e) => rejected(e),
        }
    }

    /// Query a single byte; every failure reads as `None`.
    pub fn send_query(&self, address_type: AddressType, address: u8, command: u8) -> Option<u8> {
        match Frame::command(address_type, address, command) {
            Ok(frame) => self.query(&frame).backward_byte(),
            Err(e) => {
                rejected(e);
                None
            }
        }
    }

    /// Send any frame under the arbitration lock.
    pub fn send(&self, frame: &Frame, repeat: bool) -> DriverStatus {
        let _guard = self.lock();
        let started = Instant::now();

        let mut status = self.transceiver.send_raw(frame);
        if status.is_ok() && repeat {
            thread::sleep(REPEAT_SETTLE);
            status = self.transceiver.send_raw(frame);
            let elapsed = started.elapsed();
            if elapsed > REPEAT_WINDOW {
                warn!("Repeat of {} took {:?}, gear may ignore it", frame, elapsed);
            }
        }

        self.settle();
        status
    }

    /// Transmit a frame and capture the reply, with the full status.
    pub fn query(&self, frame: &Frame) -> TransactionResult {
        let _guard = self.lock();
        let result = self.transceiver.transact(frame, true);
        self.settle();
        result
    }

    /// Direct arc power control. Level 0 is sent as OFF so gear fade out
    /// the same way a wall switch turns them off.
    pub fn set_level(&self, address_type: AddressType, address: u8, level: u8) -> DriverStatus {
        if level == 0 {
            return self.send_command(address_type, address, opcode::OFF, false);
        }
        match Frame::dapc(address_type, address, level) {
            Ok(frame) => self.send(&frame, false),
            Err(e) => rejected(e),
        }
    }

    pub fn send_special(&self, special_opcode: u8, data: u8, repeat: bool) -> DriverStatus {
        match Frame::special(special_opcode, data) {
            Ok(frame) => self.send(&frame, repeat),
            Err(e) => rejected(e),
        }
    }

    pub fn query_special(&self, special_opcode: u8, data: u8) -> Option<u8> {
        match Frame::special(special_opcode, data) {
            Ok(frame) => self.query(&frame).backward_byte(),
            Err(e) => {
                rejected(e);
                None
            }
        }
    }

    pub fn query_level(&self, address_type: AddressType, address: u8) -> LevelReading {
        LevelReading::from_reply(self.send_query(address_type, address, opcode::QUERY_ACTUAL_LEVEL))
    }

    /// Add a gear to or remove it from a group. Always sent twice.
    pub fn manage_group(&self, short_address: u8, group: u8, add: bool) -> DriverStatus {
        if group > MAX_GROUP {
            return rejected(AddressError::GroupOutOfRange(group));
        }
        let command = if add {
            opcode::ADD_TO_GROUP + group
        } else {
            opcode::REMOVE_FROM_GROUP + group
        };
        debug!(
            "{} short {} {} group {}",
            if add { "Adding" } else { "Removing" },
            short_address,
            if add { "to" } else { "from" },
            group
        );
        self.send_command(AddressType::Short, short_address, command, true)
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn settle(&self) {
        thread::sleep(self.transceiver.config().inter_frame_delay());
    }
}

impl core::fmt::Debug for DaliBus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DaliBus")
            .field("transceiver", &self.transceiver)
            .finish()
    }
}

/// Address outside the DALI range: nothing is sent.
fn rejected(err: AddressError) -> DriverStatus {
    warn!("Frame not sent: {}", err);
    DriverStatus::FrameError
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_reading_from_reply() {
        assert_eq!(LevelReading::from_reply(Some(128)), LevelReading::Level(128));
        assert_eq!(LevelReading::from_reply(Some(0xFF)), LevelReading::Mask);
        assert_eq!(LevelReading::from_reply(None), LevelReading::NoReply);
        assert_eq!(LevelReading::Level(0).level(), Some(0));
        assert_eq!(LevelReading::Mask.level(), None);
    }
}
