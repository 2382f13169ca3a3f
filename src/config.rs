use serde::{Deserialize, Serialize};

use crate::error::{DaliError, Result};

pub const DEFAULT_BUS_TIMEOUT_MS: u64 = 500;
pub const DEFAULT_INTER_FRAME_DELAY_MS: u64 = 20;
pub const DEFAULT_QUEUE_CAPACITY: usize = 10;
pub const DEFAULT_BASE_TOPIC: &str = "dali";

// Highest GPIO number on the supported boards
pub const MAX_PIN: u8 = 48;

/// Bus driver settings. Immutable once the transceiver is initialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub rx_pin: u8,
    pub tx_pin: u8,
    #[serde(default = "default_bus_timeout_ms")]
    pub bus_timeout_ms: u64,
    /// Settling gap enforced after every logical operation.
    #[serde(default = "default_inter_frame_delay_ms")]
    pub inter_frame_delay_ms: u64,
}

fn default_bus_timeout_ms() -> u64 {
    DEFAULT_BUS_TIMEOUT_MS
}

fn default_inter_frame_delay_ms() -> u64 {
    DEFAULT_INTER_FRAME_DELAY_MS
}

impl Config {
    pub fn new(rx_pin: u8, tx_pin: u8) -> Self {
        Self {
            rx_pin,
            tx_pin,
            bus_timeout_ms: DEFAULT_BUS_TIMEOUT_MS,
            inter_frame_delay_ms: DEFAULT_INTER_FRAME_DELAY_MS,
        }
    }

    pub fn with_bus_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.bus_timeout_ms = timeout_ms;
        self
    }

    pub fn with_inter_frame_delay_ms(mut self, delay_ms: u64) -> Self {
        self.inter_frame_delay_ms = delay_ms;
        self
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.rx_pin == self.tx_pin {
            return Err(DaliError::PinConflict(self.rx_pin));
        }
        if self.rx_pin > MAX_PIN || self.tx_pin > MAX_PIN {
            return Err(DaliError::InvalidConfig(format!(
                "pins must be <= {} (rx={}, tx={})",
                MAX_PIN, self.rx_pin, self.tx_pin
            )));
        }
        if self.bus_timeout_ms == 0 {
            return Err(DaliError::InvalidConfig(
                "bus_timeout_ms must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub fn bus_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.bus_timeout_ms)
    }

    pub fn inter_frame_delay(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.inter_frame_delay_ms)
    }
}

/// Settings for the command processor and the level poller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorConfig {
    #[serde(default = "default_base_topic")]
    pub base_topic: String,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// `None` disables periodic polling.
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
    /// Bit n set = poll short address n.
    #[serde(default)]
    pub poll_devices: u64,
    /// Bit n set = poll group n.
    #[serde(default)]
    pub poll_groups: u16,
}

fn default_base_topic() -> String {
    DEFAULT_BASE_TOPIC.to_string()
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            base_topic: default_base_topic(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            poll_interval_ms: None,
            poll_devices: 0,
            poll_groups: 0,
        }
    }
}

impl ProcessorConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: ProcessorConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(DaliError::InvalidConfig(
                "queue_capacity must be greater than zero".into(),
            ));
        }
        if self.base_topic.is_empty() || self.base_topic.ends_with('/') {
            return Err(DaliError::InvalidConfig(format!(
                "invalid base topic '{}'",
                self.base_topic
            )));
        }
        if self.poll_interval_ms == Some(0) {
            return Err(DaliError::InvalidConfig(
                "poll_interval_ms must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}
