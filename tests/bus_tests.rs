use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use dalibus::frame::{opcode, special};
use dalibus::sim::{ControlGear, LineFaultConfig, SimulatedLine};
use dalibus::*;

fn bus_on(line: &SimulatedLine) -> DaliBus {
    DaliBus::new(Transceiver::init(Config::new(4, 5), line.phy()).unwrap())
}

fn only_fault(drop: f32, corrupt: f32, stuck: f32) -> LineFaultConfig {
    LineFaultConfig {
        enabled: true,
        drop_reply_percent: drop,
        corrupt_timing_percent: corrupt,
        stuck_active_percent: stuck,
        ..LineFaultConfig::default()
    }
}

#[test]
fn test_set_and_query_level() {
    let line = SimulatedLine::new().with_gear(ControlGear::new(5));
    let bus = bus_on(&line);

    assert_eq!(bus.set_level(AddressType::Short, 5, 200), DriverStatus::Ok);
    assert_eq!(bus.query_level(AddressType::Short, 5), LevelReading::Level(200));

    // Zero goes out as OFF
    assert_eq!(bus.set_level(AddressType::Short, 5, 0), DriverStatus::Ok);
    assert_eq!(line.gear_state(5).unwrap().actual_level, 0);
    assert_eq!(bus.query_level(AddressType::Short, 5), LevelReading::Level(0));
}

#[test]
fn test_group_membership_needs_repeat() {
    let line = SimulatedLine::new().with_gear(ControlGear::new(1));
    let bus = bus_on(&line);

    // A single configuration frame is ignored by the gear
    let status = bus.send_command(AddressType::Short, 1, opcode::ADD_TO_GROUP + 3, false);
    assert_eq!(status, DriverStatus::Ok);
    assert_eq!(line.gear_state(1).unwrap().groups, 0);

    assert_eq!(bus.manage_group(1, 3, true), DriverStatus::Ok);
    assert_eq!(line.gear_state(1).unwrap().groups, 1 << 3);

    // Group addressing now reaches it
    assert_eq!(bus.set_level(AddressType::Group, 3, 90), DriverStatus::Ok);
    assert_eq!(line.gear_state(1).unwrap().actual_level, 90);

    assert_eq!(bus.manage_group(1, 3, false), DriverStatus::Ok);
    assert_eq!(line.gear_state(1).unwrap().groups, 0);
}

#[test]
fn test_invalid_addresses_send_nothing() {
    let line = SimulatedLine::new().with_gear(ControlGear::new(1));
    let bus = bus_on(&line);

    assert_eq!(
        bus.send_command(AddressType::Short, 64, opcode::OFF, false),
        DriverStatus::FrameError
    );
    assert_eq!(bus.set_level(AddressType::Group, 16, 10), DriverStatus::FrameError);
    assert_eq!(bus.manage_group(1, 16, true), DriverStatus::FrameError);
    assert_eq!(bus.send_query(AddressType::Short, 70, opcode::QUERY_STATUS), None);
    assert_eq!(bus.send_special(0xA2, 0, false), DriverStatus::FrameError);

    assert_eq!(bus.transceiver().stats().frames_sent, 0);
}

#[test]
fn test_broadcast_query_with_different_answers_collides() {
    let line = SimulatedLine::new()
        .with_gear(ControlGear::new(1).with_level(1))
        .with_gear(ControlGear::new(2).with_level(128));
    let bus = bus_on(&line);

    let frame = Frame::command(AddressType::Broadcast, 0, opcode::QUERY_ACTUAL_LEVEL).unwrap();
    let result = bus.query(&frame);
    assert_eq!(result.status, DriverStatus::Collision);
    assert_eq!(result.backward_byte(), None);
    assert_eq!(bus.transceiver().stats().collisions, 1);
}

#[test]
fn test_broadcast_query_with_identical_answers_is_clean() {
    let line = SimulatedLine::new()
        .with_gear(ControlGear::new(1).with_level(40))
        .with_gear(ControlGear::new(2).with_level(40));
    let bus = bus_on(&line);

    let reply = bus.send_query(AddressType::Broadcast, 0, opcode::QUERY_ACTUAL_LEVEL);
    assert_eq!(reply, Some(40));
}

#[test]
fn test_query_without_answer_is_bounded() {
    let line = SimulatedLine::new();
    let bus = bus_on(&line);

    let started = Instant::now();
    assert_eq!(bus.query_level(AddressType::Short, 12), LevelReading::NoReply);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(500), "{:?}", elapsed);
    assert!(elapsed < Duration::from_millis(600), "{:?}", elapsed);
}

#[test]
fn test_mask_level_leaves_gear_alone() {
    let line = SimulatedLine::new().with_gear(ControlGear::new(0));
    let bus = bus_on(&line);
    // Broadcast DAPC with MASK leaves the level alone
    assert_eq!(bus.set_level(AddressType::Short, 0, 33), DriverStatus::Ok);
    let frame = Frame::dapc(AddressType::Broadcast, 0, 0xFF).unwrap();
    assert_eq!(bus.send(&frame, false), DriverStatus::Ok);
    assert_eq!(bus.query_level(AddressType::Short, 0), LevelReading::Level(33));
}

#[test]
fn test_special_commands_reach_the_line() {
    let line = SimulatedLine::new().with_gear(ControlGear::new(0));
    let bus = bus_on(&line);

    assert_eq!(bus.send_special(special::DTR0, 0x42, false), DriverStatus::Ok);
    assert_eq!(bus.send_special(special::INITIALISE, 0x00, true), DriverStatus::Ok);
    // Gear never answer special frames
    assert_eq!(bus.query_special(special::QUERY_SHORT_ADDRESS, 0), None);
    assert_eq!(bus.transceiver().stats().frames_sent, 4);
}

#[test]
fn test_dropped_reply_times_out() {
    let line = SimulatedLine::new().with_gear(ControlGear::new(3).with_level(50));
    line.set_faults(only_fault(100.0, 0.0, 0.0));
    let bus = bus_on(&line);

    let frame = Frame::command(AddressType::Short, 3, opcode::QUERY_ACTUAL_LEVEL).unwrap();
    assert_eq!(bus.query(&frame).status, DriverStatus::Timeout);
    assert_eq!(line.fault_stats().replies_dropped, 1);
}

#[test]
fn test_corrupted_reply_is_frame_error() {
    // 200 = 1100_1000: the stretched half-bit is an idle run between windows
    let line = SimulatedLine::new().with_gear(ControlGear::new(3).with_level(200));
    line.set_faults(only_fault(0.0, 100.0, 0.0));
    let bus = bus_on(&line);

    let frame = Frame::command(AddressType::Short, 3, opcode::QUERY_ACTUAL_LEVEL).unwrap();
    assert_eq!(bus.query(&frame).status, DriverStatus::FrameError);
    assert_eq!(line.fault_stats().timings_corrupted, 1);
}

#[test]
fn test_stuck_line_is_collision() {
    let line = SimulatedLine::new().with_gear(ControlGear::new(3));
    line.set_faults(only_fault(0.0, 0.0, 100.0));
    let bus = bus_on(&line);

    assert_eq!(
        bus.send_command(AddressType::Short, 3, opcode::RECALL_MAX_LEVEL, false),
        DriverStatus::Collision
    );
    // The frame never made it to the gear
    assert_eq!(line.gear_state(3).unwrap().actual_level, 0);
}

#[test]
fn test_repeat_is_not_split_by_other_callers() {
    let line = SimulatedLine::new()
        .with_gear(ControlGear::new(1))
        .with_gear(ControlGear::new(2));
    let bus = Arc::new(bus_on(&line));

    let chatter = {
        let bus = Arc::clone(&bus);
        thread::spawn(move || {
            for level in 10..16 {
                assert_eq!(bus.set_level(AddressType::Short, 2, level), DriverStatus::Ok);
            }
        })
    };
    let groups: Vec<_> = (0..4u8)
        .map(|group| {
            let bus = Arc::clone(&bus);
            thread::spawn(move || bus.manage_group(1, group, true))
        })
        .collect();

    for handle in groups {
        assert_eq!(handle.join().unwrap(), DriverStatus::Ok);
    }
    chatter.join().unwrap();

    // Any interleaved frame would have cancelled a pending configuration
    assert_eq!(line.gear_state(1).unwrap().groups, 0b1111);
    assert_eq!(line.gear_state(2).unwrap().actual_level, 15);
}

#[test]
fn test_shared_transceiver_handle() {
    let line = SimulatedLine::new().with_gear(ControlGear::new(7).with_level(9));
    let transceiver = Arc::new(Transceiver::init(Config::new(1, 2), line.phy()).unwrap());
    let bus = DaliBus::from_shared(Arc::clone(&transceiver));

    assert_eq!(bus.query_level(AddressType::Short, 7), LevelReading::Level(9));
    assert_eq!(transceiver.stats().replies_decoded, 1);
}
