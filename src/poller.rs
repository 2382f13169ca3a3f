//! Periodic level polling with change detection.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::bus::{DaliBus, LevelReading};
use crate::config::ProcessorConfig;
use crate::frame::{MAX_GROUP, MAX_SHORT_ADDRESS};
use crate::router::Target;

/// A target whose reading changed since the previous poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateReport {
    pub target: Target,
    pub reading: LevelReading,
    /// `None` on the first poll after start or reset.
    pub previous: Option<LevelReading>,
}

#[derive(Debug, Clone)]
pub struct LevelPoller {
    targets: Vec<Target>,
    last: HashMap<Target, LevelReading>,
    polls: u64,
}

impl LevelPoller {
    /// `devices` bit n selects short address n, `groups` bit n selects group n.
    pub fn new(devices: u64, groups: u16) -> Self {
        let shorts = (0..=MAX_SHORT_ADDRESS)
            .filter(|a| devices & (1u64 << a) != 0)
            .map(Target::short);
        let groups = (0..=MAX_GROUP)
            .filter(|g| groups & (1u16 << g) != 0)
            .map(Target::group);
        Self {
            targets: shorts.chain(groups).collect(),
            last: HashMap::new(),
            polls: 0,
        }
    }

    pub fn from_config(config: &ProcessorConfig) -> Self {
        Self::new(config.poll_devices, config.poll_groups)
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    pub fn polls(&self) -> u64 {
        self.polls
    }

    pub fn last_reading(&self, target: &Target) -> Option<LevelReading> {
        self.last.get(target).copied()
    }

    /// Forget cached readings so the next poll reports every target.
    pub fn reset(&mut self) {
        self.last.clear();
    }

    /// Query every target once and report the ones that changed.
    pub fn poll_once(&mut self, bus: &DaliBus) -> Vec<StateReport> {
        self.polls += 1;
        let mut reports = Vec::new();

        for target in &self.targets {
            let reading = bus.query_level(target.address_type, target.address);
            let previous = self.last.insert(*target, reading);
            if previous == Some(reading) {
                trace!("{} unchanged at {:?}", target, reading);
                continue;
            }
            debug!("{} changed {:?} -> {:?}", target, previous, reading);
            reports.push(StateReport {
                target: *target,
                reading,
                previous,
            });
        }
        reports
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_targets_from_masks() {
        let poller = LevelPoller::new(0b1010 | (1 << 63), 0b1 | (1 << 15));
        assert_eq!(
            poller.targets(),
            &[
                Target::short(1),
                Target::short(3),
                Target::short(63),
                Target::group(0),
                Target::group(15),
            ]
        );
    }

    #[test]
    fn test_empty_masks_poll_nothing() {
        let config = ProcessorConfig::default();
        let poller = LevelPoller::from_config(&config);
        assert!(poller.targets().is_empty());
        assert_eq!(poller.polls(), 0);
    }
}
