use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::frame::{opcode, special, MAX_GROUP, MAX_SHORT_ADDRESS};

pub const DEFAULT_MAX_LEVEL: u8 = 254;
pub const DEFAULT_MIN_LEVEL: u8 = 1;
/// DAPC value meaning "leave the level alone".
pub const MASK: u8 = 0xFF;
/// Window in which a configuration command must be repeated.
pub const SEND_TWICE_WINDOW: Duration = Duration::from_millis(100);

const STATUS_LAMP_FAILURE: u8 = 0x02;
const STATUS_LAMP_ON: u8 = 0x04;
const STATUS_MISSING_SHORT_ADDRESS: u8 = 0x40;
const YES: u8 = 0xFF;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GearState {
    pub short_address: Option<u8>,
    pub actual_level: u8,
    pub max_level: u8,
    pub min_level: u8,
    pub groups: u16,
    pub lamp_failure: bool,
}

/// A simulated DALI ballast.
///
/// Handles the direct-level, recall and query commands plus group
/// membership. Configuration commands only take effect on the second
/// identical frame within [`SEND_TWICE_WINDOW`].
#[derive(Debug, Clone)]
pub struct ControlGear {
    state: GearState,
    dtr0: u8,
    pending_config: Option<(u16, Instant)>,
    frames_seen: u32,
}

impl ControlGear {
    pub fn new(short_address: u8) -> Self {
        debug_assert!(short_address <= MAX_SHORT_ADDRESS);
        Self {
            state: GearState {
                short_address: Some(short_address & MAX_SHORT_ADDRESS),
                actual_level: 0,
                max_level: DEFAULT_MAX_LEVEL,
                min_level: DEFAULT_MIN_LEVEL,
                groups: 0,
                lamp_failure: false,
            },
            dtr0: 0,
            pending_config: None,
            frames_seen: 0,
        }
    }

    /// Gear without a short address only answers broadcast.
    pub fn unaddressed() -> Self {
        let mut gear = Self::new(0);
        gear.state.short_address = None;
        gear
    }

    pub fn with_level(mut self, level: u8) -> Self {
        self.state.actual_level = level;
        self
    }

    pub fn with_groups(mut self, groups: u16) -> Self {
        self.state.groups = groups;
        self
    }

    pub fn with_lamp_failure(mut self, failed: bool) -> Self {
        self.state.lamp_failure = failed;
        self
    }

    pub fn short_address(&self) -> Option<u8> {
        self.state.short_address
    }

    pub fn level(&self) -> u8 {
        self.state.actual_level
    }

    pub fn groups(&self) -> u16 {
        self.state.groups
    }

    pub fn frames_seen(&self) -> u32 {
        self.frames_seen
    }

    pub fn state(&self) -> GearState {
        self.state.clone()
    }

    /// Process a 16-bit forward frame heard at `at`. Returns the backward
    /// frame byte if the gear answers.
    pub fn handle(&mut self, frame: u16, at: Instant) -> Option<u8> {
        self.frames_seen += 1;
        let address = (frame >> 8) as u8;
        let data = frame as u8;

        // Any other frame breaks a pending send-twice sequence
        let pending = self.pending_config.take();

        if special::is_special(address) {
            if address == special::DTR0 {
                self.dtr0 = data;
            }
            return None;
        }

        if !self.is_addressed(address) {
            return None;
        }

        if address & 0x01 == 0 {
            self.direct_level(data);
            return None;
        }

        if opcode::is_config_command(data) {
            match pending {
                Some((previous, heard))
                    if previous == frame && at.duration_since(heard) <= SEND_TWICE_WINDOW =>
                {
                    self.configure(data);
                }
                _ => self.pending_config = Some((frame, at)),
            }
            return None;
        }

        self.command(data)
    }

    fn is_addressed(&self, address: u8) -> bool {
        match address {
            0xFE | 0xFF => true,
            0x00..=0x7F => self.state.short_address == Some(address >> 1),
            0x80..=0x9F => {
                let group = (address >> 1) & MAX_GROUP;
                self.state.groups & (1 << group) != 0
            }
            _ => false,
        }
    }

    fn direct_level(&mut self, level: u8) {
        match level {
            MASK => {}
            0 => self.state.actual_level = 0,
            _ => self.state.actual_level = level.clamp(self.state.min_level, self.state.max_level),
        }
    }

    fn command(&mut self, op: u8) -> Option<u8> {
        let state = &mut self.state;
        match op {
            opcode::OFF => {
                state.actual_level = 0;
                None
            }
            opcode::RECALL_MAX_LEVEL => {
                state.actual_level = state.max_level;
                None
            }
            opcode::RECALL_MIN_LEVEL => {
                state.actual_level = state.min_level;
                None
            }
            opcode::STEP_UP => {
                if state.actual_level > 0 && state.actual_level < state.max_level {
                    state.actual_level += 1;
                }
                None
            }
            opcode::STEP_DOWN => {
                if state.actual_level > state.min_level {
                    state.actual_level -= 1;
                }
                None
            }
            opcode::QUERY_STATUS => {
                let mut status = 0;
                if state.lamp_failure {
                    status |= STATUS_LAMP_FAILURE;
                }
                if state.actual_level > 0 {
                    status |= STATUS_LAMP_ON;
                }
                if state.short_address.is_none() {
                    status |= STATUS_MISSING_SHORT_ADDRESS;
                }
                Some(status)
            }
            opcode::QUERY_CONTROL_GEAR => Some(YES),
            opcode::QUERY_LAMP_FAILURE => state.lamp_failure.then_some(YES),
            opcode::QUERY_LAMP_POWER_ON => (state.actual_level > 0).then_some(YES),
            opcode::QUERY_ACTUAL_LEVEL => Some(state.actual_level),
            opcode::QUERY_MAX_LEVEL => Some(state.max_level),
            opcode::QUERY_MIN_LEVEL => Some(state.min_level),
            opcode::QUERY_GROUPS_0_7 => Some(state.groups as u8),
            opcode::QUERY_GROUPS_8_15 => Some((state.groups >> 8) as u8),
            _ => None,
        }
    }

    fn configure(&mut self, op: u8) {
        let state = &mut self.state;
        match op {
            opcode::RESET => {
                state.actual_level = DEFAULT_MAX_LEVEL;
                state.max_level = DEFAULT_MAX_LEVEL;
                state.min_level = DEFAULT_MIN_LEVEL;
                state.groups = 0;
            }
            opcode::STORE_ACTUAL_LEVEL_IN_DTR0 => self.dtr0 = state.actual_level,
            op if (opcode::ADD_TO_GROUP..opcode::REMOVE_FROM_GROUP).contains(&op) => {
                state.groups |= 1 << (op - opcode::ADD_TO_GROUP);
            }
            op if (opcode::REMOVE_FROM_GROUP..opcode::STORE_SHORT_ADDRESS).contains(&op) => {
                state.groups &= !(1 << (op - opcode::REMOVE_FROM_GROUP));
            }
            opcode::STORE_SHORT_ADDRESS => {
                state.short_address = if self.dtr0 == MASK {
                    None
                } else {
                    Some((self.dtr0 >> 1) & MAX_SHORT_ADDRESS)
                };
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forward(address: u8, data: u8) -> u16 {
        (u16::from(address) << 8) | u16::from(data)
    }

    #[test]
    fn test_dapc_and_recall() {
        let mut gear = ControlGear::new(5);
        let now = Instant::now();
        assert_eq!(gear.handle(forward(0x0A, 100), now), None);
        assert_eq!(gear.level(), 100);

        gear.handle(forward(0x0B, opcode::RECALL_MAX_LEVEL), now);
        assert_eq!(gear.level(), DEFAULT_MAX_LEVEL);

        gear.handle(forward(0xFF, opcode::OFF), now);
        assert_eq!(gear.level(), 0);

        // Mask leaves the level unchanged
        gear.handle(forward(0xFE, MASK), now);
        assert_eq!(gear.level(), 0);
    }

    #[test]
    fn test_ignores_other_short_addresses() {
        let mut gear = ControlGear::new(5).with_level(42);
        assert_eq!(gear.handle(forward(0x0D, opcode::QUERY_ACTUAL_LEVEL), Instant::now()), None);
        assert_eq!(
            gear.handle(forward(0x0B, opcode::QUERY_ACTUAL_LEVEL), Instant::now()),
            Some(42)
        );
    }

    #[test]
    fn test_group_add_requires_repeat() {
        let mut gear = ControlGear::new(1);
        let t0 = Instant::now();
        let add_group_3 = forward(0x03, opcode::ADD_TO_GROUP + 3);

        gear.handle(add_group_3, t0);
        assert_eq!(gear.groups(), 0);
        gear.handle(add_group_3, t0 + Duration::from_millis(30));
        assert_eq!(gear.groups(), 1 << 3);

        // Group-addressed queries now reach the gear
        assert_eq!(
            gear.handle(forward(0x87, opcode::QUERY_CONTROL_GEAR), t0),
            Some(YES)
        );
    }

    #[test]
    fn test_repeat_outside_window_is_ignored() {
        let mut gear = ControlGear::new(1);
        let t0 = Instant::now();
        let add = forward(0x03, opcode::ADD_TO_GROUP);
        gear.handle(add, t0);
        gear.handle(add, t0 + Duration::from_millis(150));
        assert_eq!(gear.groups(), 0);

        // Interleaved frame breaks the sequence
        let mut gear = ControlGear::new(1);
        gear.handle(add, t0);
        gear.handle(forward(0x03, opcode::QUERY_STATUS), t0);
        gear.handle(add, t0 + Duration::from_millis(10));
        assert_eq!(gear.groups(), 0);
    }

    #[test]
    fn test_status_and_group_queries() {
        let mut gear = ControlGear::new(2).with_groups(0x0102).with_lamp_failure(true);
        let now = Instant::now();
        assert_eq!(gear.handle(forward(0x05, opcode::QUERY_GROUPS_0_7), now), Some(0x02));
        assert_eq!(gear.handle(forward(0x05, opcode::QUERY_GROUPS_8_15), now), Some(0x01));
        assert_eq!(
            gear.handle(forward(0x05, opcode::QUERY_STATUS), now),
            Some(STATUS_LAMP_FAILURE)
        );
    }

    #[test]
    fn test_store_short_address_from_dtr0() {
        let mut gear = ControlGear::unaddressed();
        let t0 = Instant::now();
        gear.handle(forward(special::DTR0, (9 << 1) | 1), t0);
        gear.handle(forward(0xFF, opcode::STORE_SHORT_ADDRESS), t0);
        gear.handle(forward(0xFF, opcode::STORE_SHORT_ADDRESS), t0 + Duration::from_millis(20));
        assert_eq!(gear.short_address(), Some(9));
    }
}
