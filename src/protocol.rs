//! Line-delimited JSON command/event protocol.
//!
//! One UTF-8 JSON object per `\n`-terminated line, at most
//! [`MAX_LINE_BYTES`] long. Commands arrive on stdin and carry a `type`
//! tag plus (for stream-mutating commands) a `request_id` that is echoed
//! back on resulting events. Events leave on stdout through a single
//! writer so no two events ever interleave bytes.
//!
//! Validation is schema-strict in one direction only: unknown keys are
//! tolerated, missing required keys are a `ProtocolError`.

use serde::{Deserialize, Serialize};

use crate::error::{BackendError, Result};

/// Maximum accepted line length; longer frames are skipped with a
/// `ProtocolError`.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Device fields shared by `AddStream`, `ReplaceAllStreams` and
/// `ChangeDevice`: either an explicit `udid` or a (device type, runtime)
/// pair to look up or create.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSelection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub udid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_type_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_id: Option<String>,
}

impl DeviceSelection {
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.udid.is_none() && self.device_type_id.is_none() && self.runtime_id.is_none()
    }
}

/// Preview selector: zero-based index or exact title.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Selector {
    Index(usize),
    Title(String),
}

/// Input forwarded to the frame transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum InputEvent {
    Touch { phase: TouchPhase, x: f64, y: f64 },
    Text { string: String },
    Button { name: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TouchPhase {
    Down,
    Move,
    Up,
}

/// Commands read from stdin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Command {
    AddStream {
        request_id: String,
        stream_id: String,
        file: std::path::PathBuf,
        #[serde(flatten)]
        device: DeviceSelection,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        selector: Option<Selector>,
    },
    RemoveStream {
        request_id: String,
        stream_id: String,
    },
    ReplaceAllStreams {
        request_id: String,
        stream_id: String,
        file: std::path::PathBuf,
        #[serde(flatten)]
        device: DeviceSelection,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        selector: Option<Selector>,
    },
    SendInput {
        stream_id: String,
        event: InputEvent,
    },
    NextPreview {
        stream_id: String,
    },
    ChangeDevice {
        request_id: String,
        stream_id: String,
        #[serde(flatten)]
        device: DeviceSelection,
    },
}

impl Command {
    /// The `request_id` when this command carries one.
    #[must_use]
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::AddStream { request_id, .. }
            | Self::RemoveStream { request_id, .. }
            | Self::ReplaceAllStreams { request_id, .. }
            | Self::ChangeDevice { request_id, .. } => Some(request_id),
            Self::SendInput { .. } | Self::NextPreview { .. } => None,
        }
    }

    #[must_use]
    pub fn stream_id(&self) -> &str {
        match self {
            Self::AddStream { stream_id, .. }
            | Self::RemoveStream { stream_id, .. }
            | Self::ReplaceAllStreams { stream_id, .. }
            | Self::SendInput { stream_id, .. }
            | Self::NextPreview { stream_id, .. }
            | Self::ChangeDevice { stream_id, .. } => stream_id,
        }
    }
}

/// Stream phase as reported on `StreamStatus` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusPhase {
    Initializing,
    Building,
    Booting,
    Launching,
    Running,
    Rebuilding,
    CompileError,
}

/// Device identity reported on `StreamStarted`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub udid: String,
    pub name: String,
}

/// A single encoded video frame, base64 on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FramePayload {
    pub data: String,
}

/// Events written to stdout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    StreamStarted {
        stream_id: String,
        device: DeviceInfo,
        preview_title: String,
    },
    Frame {
        stream_id: String,
        frame: FramePayload,
    },
    StreamStatus {
        stream_id: String,
        phase: StatusPhase,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        diagnostic: Option<String>,
    },
    StreamStopped {
        stream_id: String,
        reason: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        diagnostic: Option<String>,
    },
    ProtocolError {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        message: String,
    },
}

impl Event {
    /// Frames may be dropped under backpressure; lifecycle events never.
    #[must_use]
    pub const fn is_frame(&self) -> bool {
        matches!(self, Self::Frame { .. })
    }

    #[must_use]
    pub fn stream_id(&self) -> Option<&str> {
        match self {
            Self::StreamStarted { stream_id, .. }
            | Self::Frame { stream_id, .. }
            | Self::StreamStatus { stream_id, .. }
            | Self::StreamStopped { stream_id, .. } => Some(stream_id),
            Self::ProtocolError { .. } => None,
        }
    }
}

/// Parse one command line.
///
/// # Errors
///
/// [`BackendError::Protocol`] on oversize lines, invalid JSON, unknown
/// `type`, or missing required keys.
pub fn parse_command(line: &str) -> Result<Command> {
    if line.len() > MAX_LINE_BYTES {
        return Err(BackendError::Protocol(format!(
            "line of {} bytes exceeds the {MAX_LINE_BYTES}-byte limit",
            line.len()
        )));
    }
    serde_json::from_str(line).map_err(|e| BackendError::Protocol(e.to_string()))
}

/// Serialize an event to its wire line (no trailing newline).
#[must_use]
pub fn encode_event(event: &Event) -> String {
    serde_json::to_string(event).expect("events always serialize")
}

/// Best-effort `request_id` recovery from a line that failed to parse as a
/// command, so `ProtocolError` can reference the offending request.
#[must_use]
pub fn salvage_request_id(line: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(line).ok()?;
    value
        .get("request_id")
        .and_then(serde_json::Value::as_str)
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::{
        Command, DeviceSelection, Event, InputEvent, MAX_LINE_BYTES, Selector, StatusPhase,
        TouchPhase, encode_event, parse_command, salvage_request_id,
    };

    #[test]
    fn parses_add_stream_with_device_pair() {
        let line = r#"{"type":"AddStream","request_id":"r1","stream_id":"s1","file":"/p/V.swift","device_type_id":"com.apple.CoreSimulator.SimDeviceType.iPhone-16-Pro","runtime_id":"com.apple.CoreSimulator.SimRuntime.iOS-18-2"}"#;
        let Command::AddStream {
            request_id,
            stream_id,
            file,
            device,
            selector,
        } = parse_command(line).unwrap()
        else {
            panic!("wrong variant");
        };
        assert_eq!(request_id, "r1");
        assert_eq!(stream_id, "s1");
        assert_eq!(file, std::path::Path::new("/p/V.swift"));
        assert!(device.udid.is_none());
        assert!(device.runtime_id.is_some());
        assert!(selector.is_none());
    }

    #[test]
    fn selector_accepts_index_and_title() {
        let by_index = parse_command(
            r#"{"type":"AddStream","request_id":"r","stream_id":"s","file":"/f.swift","selector":2}"#,
        )
        .unwrap();
        let by_title = parse_command(
            r#"{"type":"AddStream","request_id":"r","stream_id":"s","file":"/f.swift","selector":"Dark Mode"}"#,
        )
        .unwrap();
        assert!(matches!(
            by_index,
            Command::AddStream { selector: Some(Selector::Index(2)), .. }
        ));
        assert!(matches!(
            by_title,
            Command::AddStream { selector: Some(Selector::Title(ref t)), .. } if t == "Dark Mode"
        ));
    }

    #[test]
    fn unknown_type_and_missing_keys_are_rejected() {
        assert!(parse_command(r#"{"type":"Bogus"}"#).is_err());
        assert!(parse_command(r#"{"type":"RemoveStream","request_id":"r"}"#).is_err());
        assert!(parse_command("not json").is_err());
    }

    #[test]
    fn unknown_keys_are_tolerated() {
        let line = r#"{"type":"NextPreview","stream_id":"s1","future_field":true}"#;
        assert!(parse_command(line).is_ok());
    }

    #[test]
    fn oversize_lines_are_rejected() {
        let padding = "x".repeat(MAX_LINE_BYTES);
        let line = format!(r#"{{"type":"NextPreview","stream_id":"{padding}"}}"#);
        assert!(parse_command(&line).is_err());
    }

    #[test]
    fn input_events_round_trip() {
        let touch = r#"{"type":"SendInput","stream_id":"s1","event":{"type":"Touch","phase":"down","x":10.0,"y":22.5}}"#;
        let Command::SendInput { event, .. } = parse_command(touch).unwrap() else {
            panic!("wrong variant");
        };
        assert_eq!(
            event,
            InputEvent::Touch { phase: TouchPhase::Down, x: 10.0, y: 22.5 }
        );
    }

    // Reserialized commands must match the original after key-order
    // normalization (serde_json::Value comparison is order-insensitive).
    #[test]
    fn commands_round_trip_normalized() {
        let lines = [
            r#"{"type":"AddStream","request_id":"r1","stream_id":"s1","file":"/p/V.swift","udid":"ABCD","selector":"Main"}"#,
            r#"{"type":"ReplaceAllStreams","request_id":"r2","stream_id":"s2","file":"/p/W.swift","device_type_id":"t","runtime_id":"r"}"#,
            r#"{"type":"RemoveStream","request_id":"r3","stream_id":"s1"}"#,
            r#"{"type":"SendInput","stream_id":"s1","event":{"type":"Text","string":"hi"}}"#,
            r#"{"type":"NextPreview","stream_id":"s1"}"#,
            r#"{"type":"ChangeDevice","request_id":"r4","stream_id":"s1","udid":"EFGH"}"#,
        ];
        for line in lines {
            let command = parse_command(line).unwrap();
            let reserialized = serde_json::to_string(&command).unwrap();
            let original: serde_json::Value = serde_json::from_str(line).unwrap();
            let roundtripped: serde_json::Value =
                serde_json::from_str(&reserialized).unwrap();
            assert_eq!(original, roundtripped, "line {line}");
        }
    }

    #[test]
    fn events_serialize_without_null_noise() {
        let event = Event::StreamStatus {
            stream_id: "s1".into(),
            phase: StatusPhase::Building,
            diagnostic: None,
        };
        let line = encode_event(&event);
        assert_eq!(
            line,
            r#"{"type":"StreamStatus","stream_id":"s1","phase":"building"}"#
        );

        let error = Event::StreamStatus {
            stream_id: "s1".into(),
            phase: StatusPhase::CompileError,
            diagnostic: Some("expected '}'".into()),
        };
        assert!(encode_event(&error).contains(r#""phase":"compile_error""#));
    }

    #[test]
    fn envelope_accessors_cover_every_command() {
        let remove = parse_command(r#"{"type":"RemoveStream","request_id":"r3","stream_id":"s1"}"#)
            .unwrap();
        assert_eq!(remove.request_id(), Some("r3"));
        assert_eq!(remove.stream_id(), "s1");

        let next = parse_command(r#"{"type":"NextPreview","stream_id":"s2"}"#).unwrap();
        assert_eq!(next.request_id(), None);
        assert_eq!(next.stream_id(), "s2");
    }

    #[test]
    fn salvages_request_id_from_malformed_commands() {
        assert_eq!(
            salvage_request_id(r#"{"type":"Bogus","request_id":"r9"}"#).as_deref(),
            Some("r9")
        );
        assert_eq!(salvage_request_id("not json"), None);
    }

    #[test]
    fn frame_events_are_classified_for_backpressure() {
        let frame = Event::Frame {
            stream_id: "s1".into(),
            frame: super::FramePayload { data: "AAAA".into() },
        };
        let stopped = Event::StreamStopped {
            stream_id: "s1".into(),
            reason: "Stopped".into(),
            message: "stream stopped".into(),
            diagnostic: None,
        };
        assert!(frame.is_frame());
        assert!(!stopped.is_frame());
        assert_eq!(frame.stream_id(), Some("s1"));
    }

    #[test]
    fn device_selection_emptiness() {
        assert!(DeviceSelection::default().is_empty());
        let sel = DeviceSelection { udid: Some("U".into()), ..DeviceSelection::default() };
        assert!(!sel.is_empty());
    }
}
