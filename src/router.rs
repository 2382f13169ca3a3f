//! Topic and payload to bus action mapping.
//!
//! Topics below the base topic:
//!
//! - `light/<short>/set`, `light/group/<g>/set`, `light/broadcast/set`
//!   with `{"state":"ON"|"OFF","brightness":0..=254}`
//! - `light/<short>/get`, `light/group/<g>/get`
//! - `config/group/set` with `{"short":n,"group":g,"state":"add"|"remove"}`
//! - `command` with a raw frame description

use core::fmt::Write as _;

use arrayvec::ArrayString;
use serde::{Deserialize, Serialize};

use crate::frame::{opcode, special, AddressType, Frame, MAX_GROUP, MAX_SHORT_ADDRESS};

pub const MAX_TOPIC_LEN: usize = 128;
pub const MAX_LEVEL: u8 = 254;

pub type TopicBuffer = ArrayString<MAX_TOPIC_LEN>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("topic '{0}' is not below the base topic")]
    ForeignTopic(String),
    #[error("unknown topic '{0}'")]
    UnknownTopic(String),
    #[error("invalid address '{0}'")]
    InvalidAddress(String),
    #[error("malformed payload: {0}")]
    Payload(String),
    #[error("payload requests no action")]
    EmptyCommand,
}

impl From<serde_json::Error> for RouteError {
    fn from(err: serde_json::Error) -> Self {
        RouteError::Payload(err.to_string())
    }
}

/// Light target named by a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    pub address_type: AddressType,
    pub address: u8,
}

impl Target {
    pub fn short(address: u8) -> Self {
        Self {
            address_type: AddressType::Short,
            address,
        }
    }

    pub fn group(group: u8) -> Self {
        Self {
            address_type: AddressType::Group,
            address: group,
        }
    }

    pub fn broadcast() -> Self {
        Self {
            address_type: AddressType::Broadcast,
            address: 0,
        }
    }

    /// `<base>/light/<target>/state`, or `None` if it does not fit.
    pub fn state_topic(&self, base_topic: &str) -> Option<TopicBuffer> {
        let mut topic = TopicBuffer::new();
        write!(topic, "{}/light/{}/state", base_topic, self).ok()?;
        Some(topic)
    }
}

impl core::fmt::Display for Target {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.address_type {
            AddressType::Short => write!(f, "{}", self.address),
            AddressType::Group => write!(f, "group/{}", self.address),
            AddressType::Broadcast => write!(f, "broadcast"),
            AddressType::Special => write!(f, "special/{:02X}", self.address),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LightPower {
    On,
    Off,
}

/// Published light state, in the shape home automation bridges expect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LightState {
    pub target: Target,
    pub state: LightPower,
    /// `None` when the light was switched on to a level we did not set.
    pub brightness: Option<u8>,
}

impl LightState {
    pub fn from_level(target: Target, level: u8) -> Self {
        Self {
            target,
            state: if level == 0 { LightPower::Off } else { LightPower::On },
            brightness: Some(level),
        }
    }
}

/// What the processor will do on the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BusAction {
    Command {
        address_type: AddressType,
        address: u8,
        command: u8,
        repeat: bool,
    },
    SetLevel {
        address_type: AddressType,
        address: u8,
        level: u8,
    },
    Query {
        address_type: AddressType,
        address: u8,
        command: u8,
    },
    QueryLevel {
        address_type: AddressType,
        address: u8,
    },
    ManageGroup {
        short_address: u8,
        group: u8,
        add: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub action: BusAction,
    /// Set for light topics; their result is published as a [`LightState`].
    pub target: Option<Target>,
}

#[derive(Debug, Deserialize)]
struct LightCommand {
    state: Option<String>,
    brightness: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct GroupCommand {
    short: u8,
    group: u8,
    state: String,
}

#[derive(Debug, Deserialize)]
struct RawCommand {
    address_type: AddressType,
    #[serde(default)]
    address: u8,
    command: u8,
    #[serde(default)]
    repeat: bool,
    #[serde(default)]
    query: bool,
}

/// Map one request onto a bus action.
pub fn route(base_topic: &str, topic: &str, payload: &[u8]) -> Result<Route, RouteError> {
    let rest = topic
        .strip_prefix(base_topic)
        .and_then(|rest| rest.strip_prefix('/'))
        .ok_or_else(|| RouteError::ForeignTopic(topic.to_string()))?;

    let parts: Vec<&str> = rest.split('/').collect();
    match parts.as_slice() {
        ["light", target @ .., "set"] => {
            let target = parse_target(target, rest)?;
            let command: LightCommand = serde_json::from_slice(payload)?;
            Ok(Route {
                action: light_action(target, command)?,
                target: Some(target),
            })
        }
        ["light", target @ .., "get"] => {
            let target = parse_target(target, rest)?;
            if target.address_type == AddressType::Broadcast {
                // Every gear would answer at once
                return Err(RouteError::UnknownTopic(topic.to_string()));
            }
            Ok(Route {
                action: BusAction::QueryLevel {
                    address_type: target.address_type,
                    address: target.address,
                },
                target: Some(target),
            })
        }
        ["config", "group", "set"] => {
            let command: GroupCommand = serde_json::from_slice(payload)?;
            group_action(command).map(|action| Route {
                action,
                target: None,
            })
        }
        ["command"] => {
            let command: RawCommand = serde_json::from_slice(payload)?;
            raw_action(command).map(|action| Route {
                action,
                target: None,
            })
        }
        _ => Err(RouteError::UnknownTopic(topic.to_string())),
    }
}

fn parse_target(parts: &[&str], topic: &str) -> Result<Target, RouteError> {
    let invalid = || RouteError::InvalidAddress(topic.to_string());
    match parts {
        ["broadcast"] => Ok(Target::broadcast()),
        ["group", group] => match group.parse::<u8>() {
            Ok(g) if g <= MAX_GROUP => Ok(Target::group(g)),
            _ => Err(invalid()),
        },
        [short] => match short.parse::<u8>() {
            Ok(a) if a <= MAX_SHORT_ADDRESS => Ok(Target::short(a)),
            _ => Err(invalid()),
        },
        _ => Err(invalid()),
    }
}

fn light_action(target: Target, command: LightCommand) -> Result<BusAction, RouteError> {
    let power = match command.state.as_deref() {
        Some("ON") => Some(true),
        Some("OFF") => Some(false),
        Some(other) => return Err(RouteError::Payload(format!("unknown state '{}'", other))),
        None => None,
    };
    let brightness = command
        .brightness
        .map(|b| b.clamp(0, i64::from(MAX_LEVEL)) as u8);

    let off = BusAction::Command {
        address_type: target.address_type,
        address: target.address,
        command: opcode::OFF,
        repeat: false,
    };
    let level = |level: u8| BusAction::SetLevel {
        address_type: target.address_type,
        address: target.address,
        level,
    };

    match (power, brightness) {
        (Some(false), _) => Ok(off),
        (Some(true), Some(b)) if b > 0 => Ok(level(b)),
        (Some(true), _) => Ok(BusAction::Command {
            address_type: target.address_type,
            address: target.address,
            command: opcode::RECALL_MAX_LEVEL,
            repeat: false,
        }),
        (None, Some(0)) => Ok(off),
        (None, Some(b)) => Ok(level(b)),
        (None, None) => Err(RouteError::EmptyCommand),
    }
}

fn group_action(command: GroupCommand) -> Result<BusAction, RouteError> {
    if command.short > MAX_SHORT_ADDRESS {
        return Err(RouteError::InvalidAddress(command.short.to_string()));
    }
    if command.group > MAX_GROUP {
        return Err(RouteError::InvalidAddress(format!("group {}", command.group)));
    }
    let add = match command.state.as_str() {
        "add" => true,
        "remove" => false,
        other => return Err(RouteError::Payload(format!("unknown group state '{}'", other))),
    };
    Ok(BusAction::ManageGroup {
        short_address: command.short,
        group: command.group,
        add,
    })
}

fn raw_action(command: RawCommand) -> Result<BusAction, RouteError> {
    // Reject addresses the frame builder would refuse
    Frame::command(command.address_type, command.address, command.command)
        .map_err(|e| RouteError::InvalidAddress(e.to_string()))?;

    if command.query {
        return Ok(BusAction::Query {
            address_type: command.address_type,
            address: command.address,
            command: command.command,
        });
    }

    let mandatory_repeat = match command.address_type {
        AddressType::Special => special::requires_repeat(command.command),
        _ => opcode::is_config_command(command.command),
    };
    Ok(BusAction::Command {
        address_type: command.address_type,
        address: command.address,
        command: command.command,
        repeat: command.repeat || mandatory_repeat,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_light_set_variants() {
        let routed = route("dali", "dali/light/5/set", br#"{"state":"OFF"}"#).unwrap();
        assert_eq!(routed.target, Some(Target::short(5)));
        assert!(matches!(
            routed.action,
            BusAction::Command { command: opcode::OFF, .. }
        ));

        let routed = route("dali", "dali/light/group/2/set", br#"{"state":"ON","brightness":120}"#)
            .unwrap();
        assert_eq!(
            routed.action,
            BusAction::SetLevel {
                address_type: AddressType::Group,
                address: 2,
                level: 120
            }
        );

        let routed = route("dali", "dali/light/broadcast/set", br#"{"state":"ON"}"#).unwrap();
        assert!(matches!(
            routed.action,
            BusAction::Command { command: opcode::RECALL_MAX_LEVEL, address_type: AddressType::Broadcast, .. }
        ));
    }

    #[test]
    fn test_brightness_only_and_clamping() {
        let routed = route("dali", "dali/light/1/set", br#"{"brightness":0}"#).unwrap();
        assert!(matches!(routed.action, BusAction::Command { command: opcode::OFF, .. }));

        let routed = route("dali", "dali/light/1/set", br#"{"brightness":999}"#).unwrap();
        assert!(matches!(routed.action, BusAction::SetLevel { level: 254, .. }));
    }

    #[test]
    fn test_rejects_bad_topics_and_payloads() {
        assert!(matches!(
            route("dali", "other/light/1/set", b"{}"),
            Err(RouteError::ForeignTopic(_))
        ));
        assert!(matches!(
            route("dali", "dali/light/64/set", br#"{"state":"ON"}"#),
            Err(RouteError::InvalidAddress(_))
        ));
        assert!(matches!(
            route("dali", "dali/light/group/16/set", br#"{"state":"ON"}"#),
            Err(RouteError::InvalidAddress(_))
        ));
        assert!(matches!(
            route("dali", "dali/light/1/set", b"not json"),
            Err(RouteError::Payload(_))
        ));
        assert_eq!(
            route("dali", "dali/light/1/set", b"{}"),
            Err(RouteError::EmptyCommand)
        );
        assert!(matches!(
            route("dali", "dali/scene/set", b"{}"),
            Err(RouteError::UnknownTopic(_))
        ));
    }

    #[test]
    fn test_group_config_and_get() {
        let routed = route(
            "home/dali",
            "home/dali/config/group/set",
            br#"{"short":4,"group":7,"state":"add"}"#,
        )
        .unwrap();
        assert_eq!(
            routed.action,
            BusAction::ManageGroup {
                short_address: 4,
                group: 7,
                add: true
            }
        );

        let routed = route("dali", "dali/light/group/3/get", b"").unwrap();
        assert_eq!(
            routed.action,
            BusAction::QueryLevel {
                address_type: AddressType::Group,
                address: 3
            }
        );
        assert!(route("dali", "dali/light/broadcast/get", b"").is_err());
    }

    #[test]
    fn test_raw_command_forces_config_repeat() {
        let routed = route(
            "dali",
            "dali/command",
            br#"{"address_type":"short","address":2,"command":99}"#,
        )
        .unwrap();
        assert!(matches!(routed.action, BusAction::Command { repeat: true, .. }));

        let routed = route(
            "dali",
            "dali/command",
            br#"{"address_type":"broadcast","command":160,"query":true}"#,
        )
        .unwrap();
        assert!(matches!(routed.action, BusAction::Query { command: 0xA0, .. }));

        assert!(route(
            "dali",
            "dali/command",
            br#"{"address_type":"special","address":0,"command":162}"#,
        )
        .is_err());
    }

    #[test]
    fn test_state_topic_formatting() {
        let topic = Target::group(3).state_topic("dali").unwrap();
        assert_eq!(topic.as_str(), "dali/light/group/3/state");
        let long_base = "x".repeat(MAX_TOPIC_LEN);
        assert!(Target::short(1).state_topic(&long_base).is_none());
    }
}
