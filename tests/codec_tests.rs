use dalibus::codec::*;
use dalibus::frame::{AddressType, Frame, FrameLength};
use dalibus::DriverStatus;

fn train(runs: &[(Level, u32)]) -> Vec<Pulse> {
    runs.iter().map(|&(level, d)| Pulse::new(level, d)).collect()
}

#[test]
fn test_every_frame_length_decodes_to_itself() {
    let frames = [
        Frame::backward(0x00),
        Frame::backward(0xA5),
        Frame::backward(0xFF),
        Frame::forward(0xFF, 0x05),
        Frame::forward(0x0B, 0xA0),
        Frame::device_command(0x7F, 0xFE, 0x30),
        Frame::new(0x00FF_FFFF, FrameLength::Forward24),
    ];
    for frame in &frames {
        let result = decode(&encode(frame));
        assert_eq!(result.status, DriverStatus::Ok, "frame {}", frame);
        assert_eq!(result.data, frame.data(), "frame {}", frame);
        assert_eq!(result.bit_length, frame.bit_length(), "frame {}", frame);
    }
}

#[test]
fn test_backward_0x05_waveform() {
    let pulses = encode(&Frame::backward(0x05));

    // Start bit, 16 data half-bits and the guard
    assert_eq!(pulses.len(), 19);
    assert_eq!(pulses[0], Pulse::new(Level::Active, HALF_BIT_US));
    assert_eq!(pulses[1], Pulse::new(Level::Idle, HALF_BIT_US));
    assert!(pulses[2..18].iter().all(|p| p.duration_us == HALF_BIT_US));
    assert_eq!(pulses[18], Pulse::new(Level::Idle, GUARD_US));

    // 0x05 = 0000 0101: last three bits are 1, 0, 1
    assert_eq!(pulses[12].level, Level::Active);
    assert_eq!(pulses[13].level, Level::Idle);
    assert_eq!(pulses[14].level, Level::Idle);
    assert_eq!(pulses[15].level, Level::Active);
    assert_eq!(pulses[16].level, Level::Active);
    assert_eq!(pulses[17].level, Level::Idle);

    let result = decode(&pulses);
    assert_eq!(result.status, DriverStatus::Ok);
    assert_eq!(result.data, 0x05);
    assert_eq!(result.bit_length, 8);
}

#[test]
fn test_broadcast_recall_max_frame() {
    let frame = Frame::command(AddressType::Broadcast, 0, 0x05).unwrap();
    assert_eq!(frame.data(), 0xFF05);
    let pulses = encode(&frame);
    assert_eq!(pulses.len(), 2 * 17 + 1);
    assert_eq!(decode(&pulses).data, 0xFF05);
}

#[test]
fn test_timing_drift_inside_windows_is_accepted() {
    // Every half-bit stretched to the window edges, alternating slow and fast
    let mut pulses = encode(&Frame::backward(0x3C));
    for (index, pulse) in pulses.iter_mut().enumerate() {
        if pulse.duration_us == HALF_BIT_US {
            pulse.duration_us = if index % 2 == 0 { 330 } else { 500 };
        }
    }
    let result = decode(&pulses);
    assert_eq!(result.status, DriverStatus::Ok);
    assert_eq!(result.data, 0x3C);
}

#[test]
fn test_two_transmitters_collide() {
    use Level::*;
    // Start bit, then Active held across both halves of the next bit
    let pulses = train(&[
        (Active, 416),
        (Idle, 416),
        (Active, 832),
        (Idle, 416),
        (Active, 416),
        (Idle, 2000),
    ]);
    assert_eq!(decode(&pulses).status, DriverStatus::Collision);
}

#[test]
fn test_line_held_active_is_collision() {
    use Level::*;
    let pulses = train(&[(Active, 416), (Idle, 416), (Active, 2500), (Idle, 1000)]);
    assert_eq!(decode(&pulses).status, DriverStatus::Collision);
}

#[test]
fn test_malformed_captures() {
    use Level::*;
    // Half-bit between the T and 2T windows
    let stretched = train(&[(Active, 416), (Idle, 624), (Active, 416), (Idle, 1000)]);
    assert_eq!(decode(&stretched).status, DriverStatus::FrameError);

    // Glitch shorter than a half-bit
    let glitch = train(&[(Active, 100), (Idle, 1000)]);
    assert_eq!(decode(&glitch).status, DriverStatus::FrameError);

    // Nine data bits
    let mut nine = train(&[(Active, 416), (Idle, 416)]);
    for _ in 0..9 {
        nine.push(Pulse::new(Active, 416));
        nine.push(Pulse::new(Idle, 416));
    }
    nine.push(Pulse::new(Idle, 1000));
    assert_eq!(decode(&nine).status, DriverStatus::FrameError);
}

#[test]
fn test_cut_off_forward_frame_is_not_a_reply() {
    // Address byte of a 16-bit frame followed by a single half-bit of idle
    let full = encode(&Frame::forward(0xA5, 0xFF));
    let mut cut = full[..18].to_vec();
    cut.push(Pulse::new(Level::Idle, 416));
    let result = decode(&cut);
    assert_eq!(result.status, DriverStatus::FrameError);
    assert_eq!(result.backward_byte(), None);
}

#[test]
fn test_stop_shorter_than_two_half_bits_is_frame_error() {
    // 0xA4 ends in a 0 bit, so the guard alone is the stop
    let mut pulses = encode(&Frame::backward(0xA4)).to_vec();
    pulses.pop();
    pulses.push(Pulse::new(Level::Idle, 50));
    assert_eq!(decode(&pulses).status, DriverStatus::FrameError);

    // A full 2T guard still decodes
    pulses.pop();
    pulses.push(Pulse::new(Level::Idle, 2 * HALF_BIT_US));
    assert_eq!(decode(&pulses).data, 0xA4);
}

#[test]
fn test_empty_and_quiet_captures_time_out() {
    assert_eq!(decode(&[]).status, DriverStatus::Timeout);
    let quiet = train(&[(Level::Idle, 5000)]);
    assert_eq!(decode(&quiet).status, DriverStatus::Timeout);
}

#[test]
fn test_failed_results_carry_no_data() {
    let result = decode(&train(&[(Level::Active, 100), (Level::Idle, 1000)]));
    assert_eq!(result.data, 0);
    assert_eq!(result.bit_length, 0);
    assert_eq!(result.backward_byte(), None);
}
