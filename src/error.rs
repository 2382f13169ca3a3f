use serde::{Deserialize, Serialize};

/// Outcome of a bus operation.
///
/// This is the only status vocabulary that leaves the crate. Every blocking
/// bus call reports one of these instead of failing; only [`DaliError`] is
/// reserved for startup and configuration problems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DriverStatus {
    Ok,
    /// Line carried traffic within the idle threshold. Retry later.
    BusBusy,
    /// No edges or no reply within `bus_timeout_ms`.
    Timeout,
    /// Pulse timing or start/stop framing was malformed.
    FrameError,
    /// Captured levels contradict a single Manchester transmitter.
    Collision,
    /// Command queue saturated.
    QueueFull,
}

impl DriverStatus {
    pub fn is_ok(self) -> bool {
        matches!(self, DriverStatus::Ok)
    }

    /// Statuses that should be logged as warnings rather than debug noise.
    pub fn is_fault(self) -> bool {
        matches!(self, DriverStatus::FrameError | DriverStatus::Collision)
    }
}

impl core::fmt::Display for DriverStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            DriverStatus::Ok => write!(f, "ok"),
            DriverStatus::BusBusy => write!(f, "bus busy"),
            DriverStatus::Timeout => write!(f, "timeout"),
            DriverStatus::FrameError => write!(f, "frame error"),
            DriverStatus::Collision => write!(f, "collision"),
            DriverStatus::QueueFull => write!(f, "queue full"),
        }
    }
}

/// Result of one electrical transaction.
///
/// `data` and `bit_length` carry meaning only when `status` is
/// [`DriverStatus::Ok`]; the constructors zero them otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionResult {
    pub status: DriverStatus,
    pub data: u32,
    pub bit_length: u8,
}

impl TransactionResult {
    pub fn ok(data: u32, bit_length: u8) -> Self {
        Self {
            status: DriverStatus::Ok,
            data,
            bit_length,
        }
    }

    pub fn failed(status: DriverStatus) -> Self {
        Self {
            status,
            data: 0,
            bit_length: 0,
        }
    }

    /// The reply byte of a backward frame, if this result carries one.
    pub fn backward_byte(&self) -> Option<u8> {
        if self.status.is_ok() && self.bit_length == 8 {
            Some((self.data & 0xFF) as u8)
        } else {
            None
        }
    }
}

/// Fatal and configuration errors.
///
/// Bus traffic problems are never reported through this type; see
/// [`DriverStatus`].
#[derive(Debug, thiserror::Error)]
pub enum DaliError {
    /// The hardware channel behind a pin could not be claimed.
    #[error("hardware channel unavailable on pin {pin}: {reason}")]
    ChannelUnavailable { pin: u8, reason: String },

    #[error("pin conflict: rx and tx both assigned to pin {0}")]
    PinConflict(u8),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("configuration parse error: {0}")]
    Config(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DaliError>;
