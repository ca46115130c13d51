use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;

static PROGRESS: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)progress\s*[:=]\s*(\d{1,3})").ok());

/// Typed record derived from one raw push record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryEvent {
    pub ts: i64,
    pub name: String,
    pub pm_id: u32,
    #[serde(flatten)]
    pub kind: TelemetryKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TelemetryKind {
    Log { data: String },
    #[serde(rename = "error")]
    ErrorLog { data: String },
    Status { status: String },
    Progress { progress: u8, raw: String },
}

impl TelemetryEvent {
    pub fn new(name: impl Into<String>, pm_id: u32, ts: i64, kind: TelemetryKind) -> Self {
        Self {
            ts,
            name: name.into(),
            pm_id,
            kind,
        }
    }

    /// Stream event name for this record
    pub fn event_name(&self) -> &'static str {
        match self.kind {
            TelemetryKind::Log { .. } => "log",
            TelemetryKind::ErrorLog { .. } => "error",
            TelemetryKind::Status { .. } => "status",
            TelemetryKind::Progress { .. } => "progress",
        }
    }
}

/// Drop the `<timestamp>: ` prefix the process manager puts on log lines
pub fn strip_manager_timestamp(line: &str) -> &str {
    match line.find(": ") {
        Some(idx) if idx > 10 => &line[idx + 2..],
        _ => line,
    }
}

/// Progress percentage announced by a log line, clamped to 0..=100
pub fn parse_progress(line: &str) -> Option<u8> {
    let re = PROGRESS.as_ref()?;
    let digits = re.captures(line)?.get(1)?.as_str();
    let value: u16 = digits.parse().ok()?;
    Some(value.min(100) as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_timestamp_prefix() {
        assert_eq!(
            strip_manager_timestamp("2024-05-01T10:00:00: page loaded"),
            "page loaded"
        );
        // separator too close to the start is part of the message
        assert_eq!(strip_manager_timestamp("warn: low disk"), "warn: low disk");
        assert_eq!(strip_manager_timestamp("plain line"), "plain line");
    }

    #[test]
    fn test_parse_progress() {
        assert_eq!(parse_progress("progress: 42"), Some(42));
        assert_eq!(parse_progress("Upload PROGRESS=7 done"), Some(7));
        assert_eq!(parse_progress("progress :  100"), Some(100));
        assert_eq!(parse_progress("progress: 250"), Some(100));
        assert_eq!(parse_progress("progress: none"), None);
        assert_eq!(parse_progress("made progress today"), None);
    }

    #[test]
    fn test_event_serializes_flat() {
        let event = TelemetryEvent::new(
            "bot",
            3,
            1000,
            TelemetryKind::Progress {
                progress: 50,
                raw: "progress: 50".to_string(),
            },
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "progress");
        assert_eq!(json["progress"], 50);
        assert_eq!(json["pm_id"], 3);
        assert_eq!(event.event_name(), "progress");

        let err = TelemetryEvent::new(
            "bot",
            3,
            1000,
            TelemetryKind::ErrorLog {
                data: "boom".to_string(),
            },
        );
        assert_eq!(serde_json::to_value(&err).unwrap()["type"], "error");
    }
}
