//! # DALI Bus Driver
//!
//! Drives a DALI (IEC 62386) lighting bus: a half-duplex, Manchester-coded
//! current loop at 1200 baud shared by up to 64 control gear.
//!
//! ## Features
//!
//! - **Frame codec**: bit-exact Manchester encode/decode with tolerance windows
//!   and collision detection
//! - **Transceiver**: idle tracking, blocking send/query and non-blocking send,
//!   every wait bounded by the bus timeout
//! - **Arbitration**: one logical operation at a time, send-twice commands and
//!   inter-frame settling
//! - **Command processor**: bounded multi-producer queue drained by a single
//!   cancellable consumer, with an outcome broadcast for messaging bridges
//! - **Simulated line**: control gear, wired-AND collisions and line faults for
//!   tests and demos
//!
//! ## Quick Start
//!
//! ```no_run
//! use dalibus::sim::{ControlGear, SimulatedLine};
//! use dalibus::{AddressType, Config, DaliBus, Transceiver};
//!
//! let line = SimulatedLine::new().with_gear(ControlGear::new(5));
//! let transceiver = Transceiver::init(Config::new(4, 5), line.phy())?;
//! let bus = DaliBus::new(transceiver);
//!
//! bus.set_level(AddressType::Short, 5, 200);
//! let level = bus.query_level(AddressType::Short, 5);
//! println!("level: {:?}", level);
//! # Ok::<(), dalibus::DaliError>(())
//! ```
//!
//! ## Architecture
//!
//! Leaves first:
//!
//! - [`codec`] - Manchester waveforms
//! - [`frame`] - Address bytes, opcodes and frame builders
//! - [`phy`] - Hardware boundary and capture callback context
//! - [`transceiver`] - TX/RX state machine
//! - [`bus`] - Arbitration facade
//! - [`router`] / [`processor`] / [`poller`] - Request handling
//! - [`sim`] - In-process bus

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]

pub mod bus;
pub mod codec;
pub mod config;
pub mod error;
pub mod frame;
pub mod phy;
pub mod poller;
pub mod processor;
pub mod router;
pub mod sim;
pub mod transceiver;

// Re-export main public types for convenience
pub use bus::{DaliBus, LevelReading};
pub use codec::{decode, encode, Level, Pulse, PulseTrain};
pub use config::{Config, ProcessorConfig};
pub use error::{DaliError, DriverStatus, TransactionResult};
pub use frame::{AddressType, Frame, FrameLength};
pub use phy::{BusEvent, BusPhy, CaptureSink};
pub use processor::{
    command_queue, CommandOutcome, CommandProcessor, CommandQueue, CommandRequest,
    ProcessorStats, ShutdownHandle, ShutdownSignal,
};
pub use router::{BusAction, LightState, RouteError, Target};
pub use transceiver::{Transceiver, TransceiverState};
