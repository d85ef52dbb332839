//! Text protocol spoken with cockpit boards.
//!
//! Every frame is a single ASCII line terminated by `\n` (a trailing `\r` is
//! tolerated). The host greets with [`GREETING`]; the board answers with a line
//! starting with [`HANDSHAKE_MARKER`] followed by `;`-separated `key=value`
//! fields.

use crate::{DeviceError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Line sent by the host right after the port settles.
pub const GREETING: &str = "HELLO";

/// Prefix of the board's handshake reply.
pub const HANDSHAKE_MARKER: &str = "XPDR";

/// Known board families, classified from the handshake `board` field.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoardFamily {
    Esp32S3,
    Esp32,
    Esp8266,
    ArduinoMega,
    ArduinoUno,
    ArduinoNano,
    ArduinoLeonardo,
    Rp2040,
    Teensy,
    #[default]
    Unknown,
}

impl BoardFamily {
    /// Classify a free-form board string by substring. More specific families
    /// are checked first (`esp32s3` before `esp32`).
    pub fn classify(board: &str) -> Self {
        let norm: String = board
            .chars()
            .filter(|c| !matches!(c, '-' | '_' | ' '))
            .flat_map(char::to_lowercase)
            .collect();
        if norm.contains("esp32s3") {
            BoardFamily::Esp32S3
        } else if norm.contains("esp32") {
            BoardFamily::Esp32
        } else if norm.contains("esp8266") || norm.contains("nodemcu") || norm.contains("wemos") {
            BoardFamily::Esp8266
        } else if norm.contains("mega") {
            BoardFamily::ArduinoMega
        } else if norm.contains("uno") {
            BoardFamily::ArduinoUno
        } else if norm.contains("nano") {
            BoardFamily::ArduinoNano
        } else if norm.contains("leonardo") || norm.contains("promicro") {
            BoardFamily::ArduinoLeonardo
        } else if norm.contains("rp2040") || norm.contains("pico") {
            BoardFamily::Rp2040
        } else if norm.contains("teensy") {
            BoardFamily::Teensy
        } else {
            BoardFamily::Unknown
        }
    }
}

impl fmt::Display for BoardFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BoardFamily::Esp32S3 => "ESP32S3",
            BoardFamily::Esp32 => "ESP32",
            BoardFamily::Esp8266 => "ESP8266",
            BoardFamily::ArduinoMega => "ARDUINO_MEGA",
            BoardFamily::ArduinoUno => "ARDUINO_UNO",
            BoardFamily::ArduinoNano => "ARDUINO_NANO",
            BoardFamily::ArduinoLeonardo => "ARDUINO_LEONARDO",
            BoardFamily::Rp2040 => "RP2040",
            BoardFamily::Teensy => "TEENSY",
            BoardFamily::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// Identity reported by a board during the handshake.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HandshakeInfo {
    pub firmware_version: Option<String>,
    pub board: Option<String>,
    pub board_family: BoardFamily,
    pub device_name: Option<String>,
}

/// Parse a handshake reply such as `XPDR;fw=2.1;board=esp32s3;name=FGCP`.
pub fn parse_handshake(line: &str) -> Result<HandshakeInfo> {
    let line = line.trim();
    let rest = line
        .strip_prefix(HANDSHAKE_MARKER)
        .ok_or_else(|| DeviceError::Handshake(format!("unexpected reply: {line}")))?;

    let mut info = HandshakeInfo::default();
    for field in rest.split(';') {
        let Some((key, value)) = field.split_once('=') else {
            continue;
        };
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        match key.trim().to_ascii_lowercase().as_str() {
            "fw" => info.firmware_version = Some(value.to_string()),
            "board" => {
                info.board_family = BoardFamily::classify(value);
                info.board = Some(value.to_string());
            }
            "name" => info.device_name = Some(value.to_string()),
            other => tracing::debug!(field = other, "ignoring handshake field"),
        }
    }
    Ok(info)
}

/// A line received from a board.
#[derive(Clone, Debug, PartialEq)]
pub enum DeviceMessage {
    /// `INPUT <key> <value>`: a switch, axis or encoder changed.
    Input { key: String, value: f32 },
    /// `DREF <name> <value>`: the board asks the host to write a value.
    Dref { name: String, value: f32 },
    /// `CMD <name>`: the board asks the host to fire a command.
    Cmd { name: String },
    Ack(String),
    Status(String),
    Handshake(HandshakeInfo),
    Unknown(String),
}

/// Classify one inbound line. Known verbs with malformed arguments are errors;
/// unknown verbs come back as [`DeviceMessage::Unknown`].
pub fn parse_line(line: &str) -> Result<DeviceMessage> {
    let line = line.trim();
    if line.starts_with(HANDSHAKE_MARKER) {
        return parse_handshake(line).map(DeviceMessage::Handshake);
    }
    let (verb, rest) = match line.split_once(' ') {
        Some((verb, rest)) => (verb, rest.trim()),
        None => (line, ""),
    };
    match verb {
        "INPUT" => {
            let mut parts = rest.split_whitespace();
            let key = parts
                .next()
                .ok_or_else(|| DeviceError::InvalidLine(line.to_string()))?;
            let value = parts
                .next()
                .and_then(|v| v.parse::<f32>().ok())
                .ok_or_else(|| DeviceError::InvalidLine(line.to_string()))?;
            Ok(DeviceMessage::Input {
                key: key.to_string(),
                value,
            })
        }
        "DREF" => {
            // Names may contain spaces in their path segments, so split on the last one.
            let (name, value) = rest
                .rsplit_once(' ')
                .ok_or_else(|| DeviceError::InvalidLine(line.to_string()))?;
            let value = value
                .trim()
                .parse::<f32>()
                .map_err(|_| DeviceError::InvalidLine(line.to_string()))?;
            let name = name.trim();
            if name.is_empty() {
                return Err(DeviceError::InvalidLine(line.to_string()));
            }
            Ok(DeviceMessage::Dref {
                name: name.to_string(),
                value,
            })
        }
        "CMD" => {
            if rest.is_empty() {
                return Err(DeviceError::InvalidLine(line.to_string()));
            }
            Ok(DeviceMessage::Cmd {
                name: rest.to_string(),
            })
        }
        "ACK" => Ok(DeviceMessage::Ack(rest.to_string())),
        "STATUS" => Ok(DeviceMessage::Status(rest.to_string())),
        _ => Ok(DeviceMessage::Unknown(line.to_string())),
    }
}

/// A line sent from the host to a board.
#[derive(Clone, Debug, PartialEq)]
pub enum HostCommand {
    Set { key: String, value: f32 },
    Dref { name: String, value: f32 },
    Cmd { name: String },
    Raw(String),
}

impl HostCommand {
    /// Render without the line terminator.
    pub fn encode(&self) -> String {
        match self {
            HostCommand::Set { key, value } => format!("SET {key} {value:.4}"),
            HostCommand::Dref { name, value } => format!("DREF {name} {value}"),
            HostCommand::Cmd { name } => format!("CMD {name}"),
            HostCommand::Raw(line) => line.clone(),
        }
    }
}

/// Pop one complete line from an accumulation buffer, without `\r\n`.
#[cfg(any(feature = "serial", test))]
pub(crate) fn take_line(acc: &mut Vec<u8>) -> Option<String> {
    let pos = acc.iter().position(|&b| b == b'\n')?;
    let raw = acc.drain(..=pos).collect::<Vec<u8>>();
    let trimmed = &raw[..raw.len().saturating_sub(1)];
    let trimmed = trimmed.strip_suffix(b"\r").unwrap_or(trimmed);
    Some(String::from_utf8_lossy(trimmed).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_reply_is_parsed() {
        let info = parse_handshake("XPDR;fw=2.1;board=esp32s3;name=FGCP").unwrap();
        assert_eq!(info.firmware_version.as_deref(), Some("2.1"));
        assert_eq!(info.board_family, BoardFamily::Esp32S3);
        assert_eq!(info.board_family.to_string(), "ESP32S3");
        assert_eq!(info.device_name.as_deref(), Some("FGCP"));
    }

    #[test]
    fn handshake_requires_marker() {
        assert!(parse_handshake("HELLO;fw=1").is_err());
    }

    #[test]
    fn board_classification_prefers_specific_family() {
        assert_eq!(BoardFamily::classify("ESP32-S3-DevKitC"), BoardFamily::Esp32S3);
        assert_eq!(BoardFamily::classify("esp32 wroom"), BoardFamily::Esp32);
        assert_eq!(BoardFamily::classify("Arduino Mega 2560"), BoardFamily::ArduinoMega);
        assert_eq!(BoardFamily::classify("Pro Micro"), BoardFamily::ArduinoLeonardo);
        assert_eq!(BoardFamily::classify("mystery"), BoardFamily::Unknown);
    }

    #[test]
    fn dref_splits_on_last_space() {
        let msg = parse_line("DREF sim/cockpit/radios/com1 freq 121.5").unwrap();
        assert_eq!(
            msg,
            DeviceMessage::Dref {
                name: "sim/cockpit/radios/com1 freq".into(),
                value: 121.5
            }
        );
    }

    #[test]
    fn input_and_command_lines() {
        assert_eq!(
            parse_line("INPUT BTN_GEAR 1").unwrap(),
            DeviceMessage::Input {
                key: "BTN_GEAR".into(),
                value: 1.0
            }
        );
        assert_eq!(
            parse_line("CMD sim/lights/landing_lights_toggle").unwrap(),
            DeviceMessage::Cmd {
                name: "sim/lights/landing_lights_toggle".into()
            }
        );
        assert!(parse_line("INPUT BTN_GEAR abc").is_err());
        assert!(matches!(parse_line("NOISE 1 2").unwrap(), DeviceMessage::Unknown(_)));
    }

    #[test]
    fn set_frame_uses_four_decimals() {
        let cmd = HostCommand::Set {
            key: "GEAR".into(),
            value: 1.0,
        };
        assert_eq!(cmd.encode(), "SET GEAR 1.0000");
    }

    #[test]
    fn take_line_strips_terminators() {
        let mut acc = b"ACK ok\r\nSTAT".to_vec();
        assert_eq!(take_line(&mut acc).as_deref(), Some("ACK ok"));
        assert_eq!(take_line(&mut acc), None);
        assert_eq!(acc, b"STAT");
    }
}
