use cubesat_obc::checksum::checksum;
use cubesat_obc::framing::*;
use cubesat_obc::protocol::*;

fn sample_snapshot() -> TelemetryPacket {
    TelemetryPacket {
        packet_type: TELEMETRY_PACKET_TYPE,
        sequence_number: 0x1234,
        timestamp: 60_000,
        mag_x: 0.25,
        mag_y: -0.5,
        mag_z: 0.125,
        corrosion_raw: 612,
        radiation_cps: 37,
        temperature_bme: 21.5,
        pressure: 101_325.0,
        humidity: 40.0,
        temperature_tmp: 21.75,
        latitude: 473_977_000,
        longitude: 85_456_000,
        altitude: 408_000_000,
        gps_quality: 1,
        gps_satellites: 7,
        battery_voltage: 3900,
        battery_current: 350,
        boot_count: 4,
        error_flags: ErrorFlags::empty().with(ErrorFlag::I2c),
        system_state: SystemState::Nominal,
        uptime: 125,
    }
}

#[test]
fn test_telemetry_frame_layout() {
    let frame = sample_snapshot().to_frame();

    assert_eq!(frame.len(), TELEMETRY_FRAME_LEN);
    assert_eq!(&frame[..3], &[0xAA, 0x55, 0x01]);
    // sequence, little-endian
    assert_eq!(&frame[3..5], &[0x34, 0x12]);
    // battery_voltage sits after the GPS block
    assert_eq!(u16::from_le_bytes([frame[57], frame[58]]), 3900);
    assert_eq!(frame[61], 4, "boot count");
    assert_eq!(frame[62], 0b0000_0001, "I2C flag is code 1, bit 0");
    assert_eq!(frame[63], SystemState::Nominal.as_u8());

    let embedded = u16::from_le_bytes([frame[68], frame[69]]);
    assert_eq!(embedded, checksum(&frame[..68]));
}

#[test]
fn test_telemetry_roundtrip_through_decoder() {
    let snapshot = sample_snapshot();
    let mut decoder = FrameDecoder::new();

    let frames: Vec<_> = decoder.decode(&snapshot.to_frame()).collect();
    assert_eq!(frames, vec![Ok(Frame::Telemetry(snapshot))]);
    assert_eq!(decoder.state(), DecoderState::AwaitingSync1);
    assert_eq!(decoder.stats().telemetry_frames, 1);
}

#[test]
fn test_command_roundtrip_byte_by_byte() {
    let cmd = CommandPacket::new(CommandId::SetMode, 0x0102, &[SystemState::Nominal.as_u8()]).unwrap();
    let frame = cmd.to_frame();
    assert_eq!(frame.len(), COMMAND_FRAME_LEN);

    let mut decoder = FrameDecoder::new();
    let mut out = Vec::new();
    for &b in frame.iter() {
        if let Some(result) = decoder.push_byte(b) {
            out.push(result);
        }
    }
    assert_eq!(out.len(), 1);
    let Ok(Frame::Command(decoded)) = out[0] else {
        panic!("expected a command frame, got {:?}", out[0]);
    };
    assert_eq!(decoded.command(), Ok(CommandId::SetMode));
    assert_eq!(decoded.params(), &[0x02]);
}

#[test]
fn test_corrupted_telemetry_is_dropped() {
    let mut frame = sample_snapshot().to_frame();
    frame[20] ^= 0x40;

    let mut decoder = FrameDecoder::new();
    let results: Vec<_> = decoder.decode(&frame).collect();

    assert_eq!(results.len(), 1);
    assert!(matches!(
        results[0],
        Err(FrameError::Checksum {
            kind: PacketKind::Telemetry,
            ..
        })
    ));
    assert_eq!(decoder.state(), DecoderState::AwaitingSync1);
    assert!(decoder.pending().is_empty());
    assert_eq!(decoder.stats().checksum_failures, 1);
}

#[test]
fn test_resync_after_noise_and_bad_frame() {
    let good = CommandPacket::new(CommandId::Ping, 7, &[]).unwrap().to_frame();
    let mut bad = good;
    bad[10] = 0xFF;

    let mut stream = vec![0x00, 0x13, 0xAA, 0x42, 0x99];
    stream.extend_from_slice(&bad);
    stream.extend_from_slice(&[0xAA, 0xAA]);
    stream.extend_from_slice(&good[1..]);

    let mut decoder = FrameDecoder::new();
    let results: Vec<_> = decoder.decode(&stream).collect();

    assert_eq!(results.len(), 2);
    assert!(results[0].is_err());
    match results[1] {
        Ok(Frame::Command(cmd)) => assert_eq!(cmd.sequence_number, 7),
        ref other => panic!("resync failed: {other:?}"),
    }
}

#[test]
fn test_frames_split_across_reads() {
    let first = sample_snapshot();
    let second = TelemetryPacket {
        sequence_number: first.sequence_number + 1,
        ..first
    };
    let mut bytes = first.to_frame().to_vec();
    bytes.extend_from_slice(&second.to_frame());

    let mut decoder = FrameDecoder::new();
    let mut seen = Vec::new();
    for chunk in bytes.chunks(17) {
        for result in decoder.decode(chunk) {
            if let Ok(Frame::Telemetry(p)) = result {
                seen.push(p.sequence_number);
            }
        }
    }
    assert_eq!(seen, vec![0x1234, 0x1235]);
}

#[test]
fn test_oversized_parameter_length_is_clamped() {
    let mut cmd = CommandPacket::new(CommandId::TransmitFile, 3, &[0x5A; 8]).unwrap();
    cmd.parameter_length = 200;
    let frame = cmd.to_frame();

    let mut decoder = FrameDecoder::new();
    let results: Vec<_> = decoder.decode(&frame).collect();
    let Ok(Frame::Command(decoded)) = results[0] else {
        panic!("frame with a checksum-valid oversized length must still decode");
    };
    assert_eq!(decoded.parameter_length, 200);
    assert_eq!(decoded.params().len(), MAX_PARAMETERS);
    assert_eq!(&decoded.params()[..8], &[0x5A; 8]);
}

#[test]
fn test_unknown_state_byte_is_malformed() {
    let mut frame = sample_snapshot().to_frame();
    frame[63] = 0x20;
    let sum = checksum(&frame[..68]).to_le_bytes();
    frame[68] = sum[0];
    frame[69] = sum[1];

    let mut decoder = FrameDecoder::new();
    let results: Vec<_> = decoder.decode(&frame).collect();
    assert_eq!(
        results,
        vec![Err(FrameError::Malformed {
            kind: PacketKind::Telemetry,
            source: ProtocolError::UnknownState(0x20),
        })]
    );
    assert_eq!(decoder.stats().malformed_frames, 1);
}

#[test]
fn test_parameter_block_too_long_rejected_at_build() {
    assert_eq!(
        CommandPacket::new(CommandId::TransmitFile, 1, &[0; 65]),
        Err(ProtocolError::ParameterTooLong { len: 65 })
    );
}

#[test]
fn test_ack_and_beacon_bytes() {
    let ack = Ack::for_sequence(0x0A05);
    assert_eq!(ack.to_bytes(), [0xAA, 0x57, 0x01, 0x05]);

    let noisy = [0x00, 0xAA, 0x55, 0xAA, 0x57, 0x01, 0x05, 0x10];
    assert_eq!(Ack::find(&noisy), Some(ack));
    assert_eq!(Ack::find(&noisy[..5]), None);

    let beacon = Beacon {
        system_state: SystemState::Idle,
        boot_count: 9,
        battery_voltage: 3812,
    };
    let bytes = beacon.to_bytes();
    assert_eq!(bytes, [0xAA, 0x59, 0x01, 9, 0x0E, 0xE4]);
    assert_eq!(Beacon::parse(&bytes), Ok(beacon));
}
