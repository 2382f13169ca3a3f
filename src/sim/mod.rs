//! In-process DALI line for tests and the CLI.
//!
//! [`SimulatedLine`] is the wire: it holds the control gear and a fault
//! injector. [`SimulatedPhy`] is the channel pair a transceiver claims on
//! it. Waveforms are played in real time, replies from several gear are
//! superimposed so they collide the way they would electrically.

pub mod faults;
pub mod gear;
pub mod line;

pub use faults::{LineFault, LineFaultConfig, LineFaultInjector, LineFaultStats};
pub use gear::{ControlGear, GearState};
pub use line::{SimulatedLine, SimulatedPhy};
