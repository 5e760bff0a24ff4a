//! JSON-lines logs: one message object per line.
//!
//! ```text
//! {"topic": "/vehicle/status", "timestamp": 1700000000.1, "message": {"speed": 42.0}}
//! {"topic": "/odom", "receiveTime": {"sec": 1700000000, "nsec": 200000000},
//!  "publishTime": {"sec": 1700000000, "nsec": 150000000}, "schemaName": "Odometry",
//!  "message": {"x": 1.0}}
//! ```
//!
//! The receive time is `receiveTime` if present, else `timestamp` in
//! floating-point seconds. `schemaName` defaults to [`DEFAULT_SCHEMA`].

use super::index::IndexEntry;
use super::indexed::{IndexedSource, LogFormat, ScanItem, ScanReport};
use crate::error::{PlayerError, Result};
use crate::time::Time;
use crate::types::MessageEvent;
use serde::de::IgnoredAny;
use serde::Deserialize;
use serde_json::Value;
use std::path::Path;

/// Schema name used when a line does not carry one.
pub const DEFAULT_SCHEMA: &str = "json";

/// Fields needed to index a line without materializing the message.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LineHeader {
    topic: String,
    #[serde(default)]
    timestamp: Option<f64>,
    #[serde(default)]
    receive_time: Option<Time>,
    #[serde(default)]
    schema_name: Option<String>,
    #[allow(dead_code)]
    message: IgnoredAny,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LineRecord {
    topic: String,
    #[serde(default)]
    timestamp: Option<f64>,
    #[serde(default)]
    receive_time: Option<Time>,
    #[serde(default)]
    publish_time: Option<Time>,
    #[serde(default)]
    schema_name: Option<String>,
    message: Value,
}

fn receive_time(receive_time: Option<Time>, timestamp: Option<f64>) -> Option<Time> {
    receive_time
        .map(|t| Time::new(t.sec, t.nsec))
        .or_else(|| timestamp.map(Time::from_secs_f64))
}

/// The JSON-lines [`LogFormat`].
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonLinesFormat;

impl LogFormat for JsonLinesFormat {
    fn id(&self) -> &'static str {
        "jsonl"
    }

    fn scan(&self, bytes: &[u8]) -> Result<ScanReport> {
        let mut report = ScanReport::default();
        let mut offset = 0usize;

        while offset < bytes.len() {
            let line_end = bytes[offset..]
                .iter()
                .position(|&b| b == b'\n')
                .map_or(bytes.len(), |p| offset + p);
            let line = &bytes[offset..line_end];

            if !line.iter().all(u8::is_ascii_whitespace) {
                match serde_json::from_slice::<LineHeader>(line) {
                    Ok(header) => match receive_time(header.receive_time, header.timestamp) {
                        Some(time) => report.items.push(ScanItem::Record {
                            offset: offset as u64,
                            len: line.len() as u32,
                            time,
                            topic: header.topic,
                            schema_name: header
                                .schema_name
                                .unwrap_or_else(|| DEFAULT_SCHEMA.to_string()),
                        }),
                        None => report.items.push(ScanItem::Malformed {
                            offset: offset as u64,
                            reason: "missing receiveTime/timestamp".into(),
                        }),
                    },
                    Err(e) => report.items.push(ScanItem::Malformed {
                        offset: offset as u64,
                        reason: e.to_string(),
                    }),
                }
            }

            offset = line_end + 1;
        }

        Ok(report)
    }

    fn decode(&self, bytes: &[u8], entry: &IndexEntry, _topic: &str) -> Result<MessageEvent> {
        let start = entry.offset as usize;
        let end = start + entry.len as usize;
        let line = bytes.get(start..end).ok_or_else(|| PlayerError::Decode {
            offset: entry.offset,
            reason: "record extends past end of file".into(),
        })?;

        let record: LineRecord = serde_json::from_slice(line).map_err(|e| PlayerError::Decode {
            offset: entry.offset,
            reason: e.to_string(),
        })?;
        let time = receive_time(record.receive_time, record.timestamp).ok_or_else(|| {
            PlayerError::Decode {
                offset: entry.offset,
                reason: "missing receiveTime/timestamp".into(),
            }
        })?;

        let mut event = MessageEvent::new(
            record.topic,
            record
                .schema_name
                .unwrap_or_else(|| DEFAULT_SCHEMA.to_string()),
            time,
            record.message,
        )
        .with_size(line.len());
        event.publish_time = record.publish_time.map(|t| Time::new(t.sec, t.nsec));
        Ok(event)
    }
}

/// Open a JSON-lines log.
pub fn open_jsonl(path: impl AsRef<Path>) -> IndexedSource<JsonLinesFormat> {
    IndexedSource::new(path, JsonLinesFormat)
}
