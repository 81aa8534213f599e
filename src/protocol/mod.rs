//! Binary control protocol spoken with the vehicle firmware.
//!
//! Event frame: `[code: u8]`
//! Value frame: `[code: u8] [value: i16 LE]`
//!
//! The numeric codes must match the firmware; changing one is a protocol break.

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

pub const EVENT_FRAME_LEN: usize = 1;
pub const VALUE_FRAME_LEN: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EventCode {
    None = 0,
    Timeout = 1,
    Estop = 2,
    RevertSettings = 3,
    SaveSettings = 4,
}

impl EventCode {
    pub const ALL: [EventCode; 5] = [
        EventCode::None,
        EventCode::Timeout,
        EventCode::Estop,
        EventCode::RevertSettings,
        EventCode::SaveSettings,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Timeout => "timeout",
            Self::Estop => "estop",
            Self::RevertSettings => "revert_settings",
            Self::SaveSettings => "save_settings",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ValueCode {
    None = 0,
    Speed = 1,
    Steering = 2,
    TopServo = 3,
    SteeringMaxPulse = 4,
    SteeringMinPulse = 5,
    TopMaxPulse = 6,
    TopMinPulse = 7,
    WsTimeout = 8,
    PidSpeedKp = 9,
    PidSpeedKi = 10,
    PidSpeedKd = 11,
    PidSpeedDAlpha = 12,
    PidSpeedIDeadband = 13,
    PidAngleKp = 14,
    PidAngleKi = 15,
    PidAngleKd = 16,
    PidAngleDAlpha = 17,
    PidAngleIDeadband = 18,
}

impl ValueCode {
    pub const ALL: [ValueCode; 19] = [
        ValueCode::None,
        ValueCode::Speed,
        ValueCode::Steering,
        ValueCode::TopServo,
        ValueCode::SteeringMaxPulse,
        ValueCode::SteeringMinPulse,
        ValueCode::TopMaxPulse,
        ValueCode::TopMinPulse,
        ValueCode::WsTimeout,
        ValueCode::PidSpeedKp,
        ValueCode::PidSpeedKi,
        ValueCode::PidSpeedKd,
        ValueCode::PidSpeedDAlpha,
        ValueCode::PidSpeedIDeadband,
        ValueCode::PidAngleKp,
        ValueCode::PidAngleKi,
        ValueCode::PidAngleKd,
        ValueCode::PidAngleDAlpha,
        ValueCode::PidAngleIDeadband,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Speed => "speed",
            Self::Steering => "steering",
            Self::TopServo => "top_servo",
            Self::SteeringMaxPulse => "steering_max_pulse",
            Self::SteeringMinPulse => "steering_min_pulse",
            Self::TopMaxPulse => "top_max_pulse",
            Self::TopMinPulse => "top_min_pulse",
            Self::WsTimeout => "ws_timeout",
            Self::PidSpeedKp => "pid_speed_kp",
            Self::PidSpeedKi => "pid_speed_ki",
            Self::PidSpeedKd => "pid_speed_kd",
            Self::PidSpeedDAlpha => "pid_speed_d_alpha",
            Self::PidSpeedIDeadband => "pid_speed_i_deadband",
            Self::PidAngleKp => "pid_angle_kp",
            Self::PidAngleKi => "pid_angle_ki",
            Self::PidAngleKd => "pid_angle_kd",
            Self::PidAngleDAlpha => "pid_angle_d_alpha",
            Self::PidAngleIDeadband => "pid_angle_i_deadband",
        }
    }

    /// Persistent settings, as opposed to live control inputs.
    pub fn is_setting(self) -> bool {
        !matches!(
            self,
            Self::None | Self::Speed | Self::Steering | Self::TopServo
        )
    }
}

impl From<EventCode> for u8 {
    fn from(code: EventCode) -> Self {
        code as u8
    }
}

impl From<ValueCode> for u8 {
    fn from(code: ValueCode) -> Self {
        code as u8
    }
}

impl TryFrom<u8> for EventCode {
    type Error = u8;

    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        EventCode::ALL.get(raw as usize).copied().ok_or(raw)
    }
}

impl TryFrom<u8> for ValueCode {
    type Error = u8;

    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        ValueCode::ALL.get(raw as usize).copied().ok_or(raw)
    }
}

impl FromStr for EventCode {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase();
        EventCode::ALL
            .iter()
            .copied()
            .find(|code| code.name() == needle)
            .ok_or(ProtocolError::UnknownName(needle))
    }
}

impl FromStr for ValueCode {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase();
        ValueCode::ALL
            .iter()
            .copied()
            .find(|code| code.name() == needle)
            .ok_or(ProtocolError::UnknownName(needle))
    }
}

impl fmt::Display for EventCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl fmt::Display for ValueCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventFrame {
    pub code: u8,
}

impl EventFrame {
    pub fn kind(&self) -> Option<EventCode> {
        EventCode::try_from(self.code).ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueFrame {
    pub code: u8,
    pub value: i16,
}

impl ValueFrame {
    pub fn kind(&self) -> Option<ValueCode> {
        ValueCode::try_from(self.code).ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame {
    Event(EventFrame),
    Value(ValueFrame),
}

impl Frame {
    pub fn event(code: impl Into<u8>) -> Self {
        Frame::Event(EventFrame { code: code.into() })
    }

    pub fn value(code: impl Into<u8>, value: i16) -> Self {
        Frame::Value(ValueFrame {
            code: code.into(),
            value,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Frame::Event(ev) => encode_event(ev.code).to_vec(),
            Frame::Value(v) => encode_value_i16(v.code, v.value).to_vec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    InvalidLength(usize),
    ValueOutOfRange(i64),
    UnknownName(String),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidLength(len) => write!(f, "undecodable frame length: {len}"),
            Self::ValueOutOfRange(v) => {
                write!(f, "value {v} outside i16 range [{}, {}]", i16::MIN, i16::MAX)
            }
            Self::UnknownName(name) => write!(f, "unknown code name: {name}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

pub fn encode_event(code: u8) -> [u8; EVENT_FRAME_LEN] {
    [code]
}

/// Encode a value frame. Values outside the i16 range are rejected rather than
/// wrapped.
pub fn encode_value(code: u8, value: i64) -> Result<[u8; VALUE_FRAME_LEN], ProtocolError> {
    let value = i16::try_from(value).map_err(|_| ProtocolError::ValueOutOfRange(value))?;
    Ok(encode_value_i16(code, value))
}

pub fn encode_value_i16(code: u8, value: i16) -> [u8; VALUE_FRAME_LEN] {
    let le = value.to_le_bytes();
    [code, le[0], le[1]]
}

/// Decode one inbound binary payload.
///
/// Length 1 is an event, length >= 3 a value frame (bytes past index 2 are
/// ignored). Lengths 0 and 2 are undecodable.
pub fn decode(bytes: &[u8]) -> Result<Frame, ProtocolError> {
    match bytes.len() {
        EVENT_FRAME_LEN => Ok(Frame::Event(EventFrame { code: bytes[0] })),
        len if len >= VALUE_FRAME_LEN => Ok(Frame::Value(ValueFrame {
            code: bytes[0],
            value: i16::from_le_bytes([bytes[1], bytes[2]]),
        })),
        len => Err(ProtocolError::InvalidLength(len)),
    }
}

/// JSON drive command understood by older firmware on the text path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveCommand {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<i16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub steering: Option<i16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top: Option<i16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estop: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estop_event_is_single_byte() {
        let bytes = encode_event(EventCode::Estop.into());
        assert_eq!(bytes, [0x02]);
        assert_eq!(
            decode(&bytes).unwrap(),
            Frame::Event(EventFrame { code: 2 })
        );
    }

    #[test]
    fn negative_value_is_little_endian() {
        let bytes = encode_value(ValueCode::Speed.into(), -100).unwrap();
        assert_eq!(bytes, [0x01, 0x9C, 0xFF]);
        assert_eq!(
            decode(&bytes).unwrap(),
            Frame::Value(ValueFrame {
                code: 1,
                value: -100
            })
        );
    }

    #[test]
    fn value_range_edges_encode() {
        assert_eq!(encode_value(2, 32767).unwrap(), [0x02, 0xFF, 0x7F]);
        assert_eq!(encode_value(2, -32768).unwrap(), [0x02, 0x00, 0x80]);
    }

    #[test]
    fn out_of_range_value_is_rejected_before_encoding() {
        assert_eq!(
            encode_value(1, 32768),
            Err(ProtocolError::ValueOutOfRange(32768))
        );
        assert_eq!(
            encode_value(1, -32769),
            Err(ProtocolError::ValueOutOfRange(-32769))
        );
    }

    #[test]
    fn empty_and_two_byte_payloads_fail_to_decode() {
        assert_eq!(decode(&[]), Err(ProtocolError::InvalidLength(0)));
        assert_eq!(decode(&[0xAB, 0xCD]), Err(ProtocolError::InvalidLength(2)));
    }

    #[test]
    fn trailing_bytes_after_value_frame_are_ignored() {
        let frame = decode(&[0x09, 0x10, 0x00, 0xDE, 0xAD]).unwrap();
        assert_eq!(frame, Frame::value(ValueCode::PidSpeedKp, 16));
    }

    #[test]
    fn unknown_codes_still_decode() {
        let frame = decode(&[0xEE]).unwrap();
        match frame {
            Frame::Event(ev) => {
                assert_eq!(ev.code, 0xEE);
                assert!(ev.kind().is_none());
            }
            other => panic!("expected event frame, got {other:?}"),
        }
    }

    #[test]
    fn code_tables_match_firmware_numbering() {
        for (idx, code) in EventCode::ALL.iter().enumerate() {
            assert_eq!(u8::from(*code) as usize, idx);
        }
        for (idx, code) in ValueCode::ALL.iter().enumerate() {
            assert_eq!(u8::from(*code) as usize, idx);
        }
        assert_eq!(u8::from(ValueCode::PidAngleIDeadband), 18);
        assert_eq!(u8::from(EventCode::SaveSettings), 4);
    }

    #[test]
    fn names_parse_back_to_codes() {
        assert_eq!("estop".parse::<EventCode>().unwrap(), EventCode::Estop);
        assert_eq!(
            "PID_ANGLE_KD".parse::<ValueCode>().unwrap(),
            ValueCode::PidAngleKd
        );
        assert!("warp".parse::<ValueCode>().is_err());
    }

    #[test]
    fn drive_command_omits_unset_fields() {
        let cmd = DriveCommand {
            speed: Some(-20),
            steering: Some(5),
            ..Default::default()
        };
        let json = serde_json::to_string(&cmd).unwrap();
        assert_eq!(json, r#"{"speed":-20,"steering":5}"#);
    }
}
