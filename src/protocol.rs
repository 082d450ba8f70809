use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use static_assertions::const_assert_eq;
use thiserror::Error;

use crate::checksum::checksum;

pub const SYNC_BYTE: u8 = 0xAA;

pub const SYNC_TELEMETRY: u16 = 0xAA55;
pub const SYNC_COMMAND: u16 = 0xAA56;
pub const SYNC_ACK: u16 = 0xAA57;
pub const SYNC_IMAGE: u16 = 0xAA58;
pub const SYNC_FILE: u16 = 0xAA59;

/// `packet_type` tag carried by every telemetry frame.
pub const TELEMETRY_PACKET_TYPE: u8 = 0x01;

pub const MAX_PARAMETERS: usize = 64;

pub const TELEMETRY_FRAME_LEN: usize = 70;
pub const COMMAND_FRAME_LEN: usize = 73;
pub const BEACON_FRAME_LEN: usize = 6;
pub const ACK_FRAME_LEN: usize = 4;

/// Largest frame the decoder ever has to hold.
pub const MAX_FRAME_LEN: usize = COMMAND_FRAME_LEN;

// Field-by-field sums of the packed wire layouts.
const_assert_eq!(TELEMETRY_FRAME_LEN, 3 + 2 + 4 + 12 + 2 + 4 + 16 + 12 + 2 + 4 + 3 + 4 + 2);
const_assert_eq!(COMMAND_FRAME_LEN, 3 + 2 + 2 + MAX_PARAMETERS + 2);

pub type TelemetryFrame = [u8; TELEMETRY_FRAME_LEN];
pub type CommandFrame = [u8; COMMAND_FRAME_LEN];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("unknown command identifier 0x{0:02X}")]
    UnknownCommand(u8),
    #[error("unknown system state 0x{0:02X}")]
    UnknownState(u8),
    #[error("unknown error flag code {0}")]
    UnknownErrorFlag(u8),
    #[error("parameter block of {len} bytes exceeds 64")]
    ParameterTooLong { len: usize },
    #[error("frame is {found} bytes, expected {expected}")]
    WrongLength { expected: usize, found: usize },
    #[error("bad sync bytes {found:02X?}")]
    BadSync { found: [u8; 2] },
    #[error("checksum mismatch: computed 0x{computed:04X}, embedded 0x{embedded:04X}")]
    BadChecksum { computed: u16, embedded: u16 },
}

/// Second sync byte, identifying what follows the `0xAA` lead byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PacketKind {
    Telemetry,
    Command,
    Ack,
    Image,
    FileOrBeacon,
}

impl PacketKind {
    #[must_use]
    pub fn from_type_byte(byte: u8) -> Option<Self> {
        match byte {
            0x55 => Some(Self::Telemetry),
            0x56 => Some(Self::Command),
            0x57 => Some(Self::Ack),
            0x58 => Some(Self::Image),
            0x59 => Some(Self::FileOrBeacon),
            _ => None,
        }
    }

    #[must_use]
    pub fn type_byte(self) -> u8 {
        let word = match self {
            Self::Telemetry => SYNC_TELEMETRY,
            Self::Command => SYNC_COMMAND,
            Self::Ack => SYNC_ACK,
            Self::Image => SYNC_IMAGE,
            Self::FileOrBeacon => SYNC_FILE,
        };
        word.to_be_bytes()[1]
    }

    /// Length of a complete frame of this kind, if it is one the frame codec
    /// accumulates.
    #[must_use]
    pub fn frame_len(self) -> Option<usize> {
        match self {
            Self::Telemetry => Some(TELEMETRY_FRAME_LEN),
            Self::Command => Some(COMMAND_FRAME_LEN),
            _ => None,
        }
    }
}

/// Operating mode of the spacecraft. Wire values match the `system_state`
/// telemetry byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum SystemState {
    #[default]
    Boot = 0x00,
    Idle = 0x01,
    Nominal = 0x02,
    Safe = 0x03,
    LowPower = 0x04,
    Emergency = 0x05,
    ImageCapture = 0x06,
    DataTx = 0x07,
}

impl SystemState {
    pub const ALL: [SystemState; 8] = [
        Self::Boot,
        Self::Idle,
        Self::Nominal,
        Self::Safe,
        Self::LowPower,
        Self::Emergency,
        Self::ImageCapture,
        Self::DataTx,
    ];

    #[must_use]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Beacons are only broadcast while the spacecraft is healthy.
    #[must_use]
    pub fn allows_beacon(self) -> bool {
        matches!(self, Self::Nominal | Self::Idle)
    }

    #[must_use]
    pub fn is_safing(self) -> bool {
        matches!(self, Self::Safe | Self::LowPower | Self::Emergency)
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Boot => "boot",
            Self::Idle => "idle",
            Self::Nominal => "nominal",
            Self::Safe => "safe",
            Self::LowPower => "low-power",
            Self::Emergency => "emergency",
            Self::ImageCapture => "image-capture",
            Self::DataTx => "data-tx",
        }
    }
}

impl TryFrom<u8> for SystemState {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::ALL
            .iter()
            .copied()
            .find(|s| s.as_u8() == value)
            .ok_or(ProtocolError::UnknownState(value))
    }
}

impl FromStr for SystemState {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        Self::ALL
            .iter()
            .copied()
            .find(|state| state.name() == normalized)
            .ok_or(ProtocolError::UnknownState(0xFF))
    }
}

impl fmt::Display for SystemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum CommandId {
    Ping = 0x01,
    GetTelemetry = 0x02,
    CaptureImage = 0x03,
    SetMode = 0x04,
    Reset = 0x05,
    TransmitFile = 0x06,
    UpdateFirmware = 0x07,
    SetSchedule = 0x08,
    Beacon = 0x09,
}

impl CommandId {
    #[must_use]
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for CommandId {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x01 => Self::Ping,
            0x02 => Self::GetTelemetry,
            0x03 => Self::CaptureImage,
            0x04 => Self::SetMode,
            0x05 => Self::Reset,
            0x06 => Self::TransmitFile,
            0x07 => Self::UpdateFirmware,
            0x08 => Self::SetSchedule,
            0x09 => Self::Beacon,
            other => return Err(ProtocolError::UnknownCommand(other)),
        })
    }
}

/// Fault categories reported in the telemetry `error_flags` byte.
///
/// The enumerated code `n` occupies bit `n - 1`, so all eight categories are
/// distinguishable in one byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ErrorFlag {
    I2c = 0x01,
    Spi = 0x02,
    Uart = 0x03,
    Adc = 0x04,
    Battery = 0x05,
    Temperature = 0x06,
    TaskHang = 0x07,
    Memory = 0x08,
}

impl ErrorFlag {
    pub const ALL: [ErrorFlag; 8] = [
        Self::I2c,
        Self::Spi,
        Self::Uart,
        Self::Adc,
        Self::Battery,
        Self::Temperature,
        Self::TaskHang,
        Self::Memory,
    ];

    #[must_use]
    pub fn code(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub fn mask(self) -> u8 {
        1 << (self.code() - 1)
    }
}

impl TryFrom<u8> for ErrorFlag {
    type Error = ProtocolError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Self::ALL
            .iter()
            .copied()
            .find(|f| f.code() == code)
            .ok_or(ProtocolError::UnknownErrorFlag(code))
    }
}

/// Accumulated fault bitset as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorFlags(u8);

impl ErrorFlags {
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    #[must_use]
    pub fn with(self, flag: ErrorFlag) -> Self {
        Self(self.0 | flag.mask())
    }

    #[must_use]
    pub fn contains(self, flag: ErrorFlag) -> bool {
        self.0 & flag.mask() != 0
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = ErrorFlag> {
        ErrorFlag::ALL.into_iter().filter(move |f| self.contains(*f))
    }
}

/// Little-endian cursor over a fixed-size outgoing frame.
struct FrameWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> FrameWriter<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn put(&mut self, bytes: &[u8]) {
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }

    fn u8(&mut self, v: u8) {
        self.put(&[v]);
    }

    fn u16(&mut self, v: u16) {
        self.put(&v.to_le_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.put(&v.to_le_bytes());
    }

    fn i32(&mut self, v: i32) {
        self.put(&v.to_le_bytes());
    }

    fn f32(&mut self, v: f32) {
        self.put(&v.to_le_bytes());
    }

    /// Appends the checksum of everything written so far.
    fn finish(mut self) {
        let sum = checksum(&self.buf[..self.pos]);
        self.u16(sum);
        debug_assert_eq!(self.pos, self.buf.len(), "frame layout does not fill buffer");
    }
}

/// Little-endian cursor over a received frame of known length.
struct FrameReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FrameReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        out
    }

    fn u8(&mut self) -> u8 {
        self.take::<1>()[0]
    }

    fn u16(&mut self) -> u16 {
        u16::from_le_bytes(self.take())
    }

    fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.take())
    }

    fn i32(&mut self) -> i32 {
        i32::from_le_bytes(self.take())
    }

    fn f32(&mut self) -> f32 {
        f32::from_le_bytes(self.take())
    }
}

fn check_frame(frame: &[u8], expected_len: usize, kind: PacketKind) -> Result<(), ProtocolError> {
    if frame.len() != expected_len {
        return Err(ProtocolError::WrongLength {
            expected: expected_len,
            found: frame.len(),
        });
    }
    if frame[0] != SYNC_BYTE || frame[1] != kind.type_byte() {
        return Err(ProtocolError::BadSync {
            found: [frame[0], frame[1]],
        });
    }
    crate::checksum::verify_trailing(frame)
        .map_err(|(computed, embedded)| ProtocolError::BadChecksum { computed, embedded })
}

/// One sensor-cycle snapshot. Plain `Copy` data: it is handed between units
/// by value, never by reference.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TelemetryPacket {
    pub packet_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,

    pub mag_x: f32,
    pub mag_y: f32,
    pub mag_z: f32,
    pub corrosion_raw: u16,
    pub radiation_cps: u32,
    pub temperature_bme: f32,
    pub pressure: f32,
    pub humidity: f32,
    pub temperature_tmp: f32,

    pub latitude: i32,  // 1e-7 deg
    pub longitude: i32, // 1e-7 deg
    pub altitude: i32,  // mm
    pub gps_quality: u8,
    pub gps_satellites: u8,

    pub battery_voltage: u16, // mV
    pub battery_current: u16, // mA
    pub boot_count: u8,
    pub error_flags: ErrorFlags,
    pub system_state: SystemState,
    pub uptime: u32, // s
}

impl TelemetryPacket {
    /// Serializes with sync bytes and a freshly computed checksum.
    #[must_use]
    pub fn to_frame(&self) -> TelemetryFrame {
        let mut frame = [0u8; TELEMETRY_FRAME_LEN];
        let mut w = FrameWriter::new(&mut frame);
        w.u8(SYNC_BYTE);
        w.u8(PacketKind::Telemetry.type_byte());
        w.u8(self.packet_type);
        w.u16(self.sequence_number);
        w.u32(self.timestamp);
        w.f32(self.mag_x);
        w.f32(self.mag_y);
        w.f32(self.mag_z);
        w.u16(self.corrosion_raw);
        w.u32(self.radiation_cps);
        w.f32(self.temperature_bme);
        w.f32(self.pressure);
        w.f32(self.humidity);
        w.f32(self.temperature_tmp);
        w.i32(self.latitude);
        w.i32(self.longitude);
        w.i32(self.altitude);
        w.u8(self.gps_quality);
        w.u8(self.gps_satellites);
        w.u16(self.battery_voltage);
        w.u16(self.battery_current);
        w.u8(self.boot_count);
        w.u8(self.error_flags.bits());
        w.u8(self.system_state.as_u8());
        w.u32(self.uptime);
        w.finish();
        frame
    }

    pub fn from_frame(frame: &[u8]) -> Result<Self, ProtocolError> {
        check_frame(frame, TELEMETRY_FRAME_LEN, PacketKind::Telemetry)?;
        let mut r = FrameReader::new(&frame[2..]);
        Ok(Self {
            packet_type: r.u8(),
            sequence_number: r.u16(),
            timestamp: r.u32(),
            mag_x: r.f32(),
            mag_y: r.f32(),
            mag_z: r.f32(),
            corrosion_raw: r.u16(),
            radiation_cps: r.u32(),
            temperature_bme: r.f32(),
            pressure: r.f32(),
            humidity: r.f32(),
            temperature_tmp: r.f32(),
            latitude: r.i32(),
            longitude: r.i32(),
            altitude: r.i32(),
            gps_quality: r.u8(),
            gps_satellites: r.u8(),
            battery_voltage: r.u16(),
            battery_current: r.u16(),
            boot_count: r.u8(),
            error_flags: ErrorFlags::from_bits(r.u8()),
            system_state: SystemState::try_from(r.u8())?,
            uptime: r.u32(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandPacket {
    pub command_id: u8,
    pub sequence_number: u16,
    /// As received. Never trusted past [`MAX_PARAMETERS`]; use
    /// [`CommandPacket::params`].
    pub parameter_length: u16,
    #[serde(with = "serde_bytes")]
    pub parameters: [u8; MAX_PARAMETERS],
}

impl Default for CommandPacket {
    fn default() -> Self {
        Self {
            command_id: 0,
            sequence_number: 0,
            parameter_length: 0,
            parameters: [0; MAX_PARAMETERS],
        }
    }
}

impl CommandPacket {
    pub fn new(command: CommandId, sequence_number: u16, params: &[u8]) -> Result<Self, ProtocolError> {
        if params.len() > MAX_PARAMETERS {
            return Err(ProtocolError::ParameterTooLong { len: params.len() });
        }
        let mut parameters = [0u8; MAX_PARAMETERS];
        parameters[..params.len()].copy_from_slice(params);
        Ok(Self {
            command_id: command.as_u8(),
            sequence_number,
            parameter_length: params.len() as u16,
            parameters,
        })
    }

    pub fn command(&self) -> Result<CommandId, ProtocolError> {
        CommandId::try_from(self.command_id)
    }

    /// Declared parameters, clamped to the fixed buffer.
    #[must_use]
    pub fn params(&self) -> &[u8] {
        let len = usize::from(self.parameter_length).min(MAX_PARAMETERS);
        &self.parameters[..len]
    }

    #[must_use]
    pub fn to_frame(&self) -> CommandFrame {
        let mut frame = [0u8; COMMAND_FRAME_LEN];
        let mut w = FrameWriter::new(&mut frame);
        w.u8(SYNC_BYTE);
        w.u8(PacketKind::Command.type_byte());
        w.u8(self.command_id);
        w.u16(self.sequence_number);
        w.u16(self.parameter_length);
        w.put(&self.parameters);
        w.finish();
        frame
    }

    pub fn from_frame(frame: &[u8]) -> Result<Self, ProtocolError> {
        check_frame(frame, COMMAND_FRAME_LEN, PacketKind::Command)?;
        let mut r = FrameReader::new(&frame[2..]);
        Ok(Self {
            command_id: r.u8(),
            sequence_number: r.u16(),
            parameter_length: r.u16(),
            parameters: r.take(),
        })
    }
}

/// Minimal status broadcast on the radio link. No checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Beacon {
    pub system_state: SystemState,
    pub boot_count: u8,
    pub battery_voltage: u16,
}

impl Beacon {
    #[must_use]
    pub fn to_bytes(&self) -> [u8; BEACON_FRAME_LEN] {
        let [hi, lo] = self.battery_voltage.to_be_bytes();
        [
            SYNC_BYTE,
            PacketKind::FileOrBeacon.type_byte(),
            self.system_state.as_u8(),
            self.boot_count,
            hi,
            lo,
        ]
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, ProtocolError> {
        match bytes {
            [SYNC_BYTE, 0x59, state, boot, hi, lo] => Ok(Self {
                system_state: SystemState::try_from(*state)?,
                boot_count: *boot,
                battery_voltage: u16::from_be_bytes([*hi, *lo]),
            }),
            [a, b, ..] if bytes.len() == BEACON_FRAME_LEN => Err(ProtocolError::BadSync { found: [*a, *b] }),
            _ => Err(ProtocolError::WrongLength {
                expected: BEACON_FRAME_LEN,
                found: bytes.len(),
            }),
        }
    }
}

/// Ping acknowledgement: `{0xAA, 0x57, 0x01, seq_low}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub sequence_low: u8,
}

impl Ack {
    const STATUS_OK: u8 = 0x01;

    #[must_use]
    pub fn for_sequence(sequence_number: u16) -> Self {
        Self {
            sequence_low: sequence_number.to_le_bytes()[0],
        }
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; ACK_FRAME_LEN] {
        [SYNC_BYTE, PacketKind::Ack.type_byte(), Self::STATUS_OK, self.sequence_low]
    }

    /// Finds the first acknowledgement anywhere in `bytes`.
    #[must_use]
    pub fn find(bytes: &[u8]) -> Option<Self> {
        bytes
            .windows(ACK_FRAME_LEN)
            .find(|w| w[0] == SYNC_BYTE && w[1] == 0x57 && w[2] == Self::STATUS_OK)
            .map(|w| Self { sequence_low: w[3] })
    }
}
