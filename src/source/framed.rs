//! Framed binary logs.
//!
//! ```text
//! file    := magic "TLG\0" | version u8 | record*
//! record  := body_len u32 | receive_ns u64 | topic_len u16 | topic
//!            | schema_len u16 | schema | payload (msgpack) | crc32 u32
//! ```
//!
//! `body_len` counts everything between itself and the checksum. The
//! checksum covers the same bytes. All integers are little-endian.

use super::index::IndexEntry;
use super::indexed::{IndexedSource, LogFormat, ScanItem, ScanReport};
use crate::error::{PlayerError, Result};
use crate::time::Time;
use crate::types::MessageEvent;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Magic bytes for framed logs.
const LOG_MAGIC: &[u8; 4] = b"TLG\0";

/// Current framed log version.
const LOG_VERSION: u8 = 1;

/// File header size (magic + version).
const HEADER_SIZE: usize = 5;

/// Fixed part of a record body (receive time + two string lengths).
const FIXED_BODY_SIZE: usize = 8 + 2 + 2;

/// Length prefix + checksum.
const FRAME_OVERHEAD: usize = 4 + 4;

/// Serialized message payload.
#[derive(Serialize, Deserialize)]
struct Payload {
    publish_time: Option<Time>,
    message: Value,
}

/// Borrowed view of one frame's body.
struct Frame<'a> {
    time: Time,
    topic: &'a str,
    schema_name: &'a str,
    payload: &'a [u8],
}

fn read_u16(bytes: &[u8], at: usize) -> Option<u16> {
    bytes
        .get(at..at + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
}

fn read_u32(bytes: &[u8], at: usize) -> Option<u32> {
    bytes
        .get(at..at + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

fn read_u64(bytes: &[u8], at: usize) -> Option<u64> {
    let b = bytes.get(at..at + 8)?;
    let mut buf = [0u8; 8];
    buf.copy_from_slice(b);
    Some(u64::from_le_bytes(buf))
}

/// Parse a verified body into its parts.
fn parse_body(body: &[u8], offset: u64) -> Result<Frame<'_>> {
    let malformed = |reason: &str| PlayerError::Decode {
        offset,
        reason: reason.to_string(),
    };

    let nanos = read_u64(body, 0).ok_or_else(|| malformed("short body"))?;
    let topic_len = read_u16(body, 8).ok_or_else(|| malformed("short body"))? as usize;
    let topic_start = 10;
    let topic = body
        .get(topic_start..topic_start + topic_len)
        .ok_or_else(|| malformed("topic overruns body"))?;
    let schema_len_at = topic_start + topic_len;
    let schema_len = read_u16(body, schema_len_at).ok_or_else(|| malformed("short body"))? as usize;
    let schema_start = schema_len_at + 2;
    let schema = body
        .get(schema_start..schema_start + schema_len)
        .ok_or_else(|| malformed("schema overruns body"))?;

    Ok(Frame {
        time: Time::from_nanos(nanos),
        topic: std::str::from_utf8(topic).map_err(|_| malformed("topic is not UTF-8"))?,
        schema_name: std::str::from_utf8(schema).map_err(|_| malformed("schema is not UTF-8"))?,
        payload: &body[schema_start + schema_len..],
    })
}

/// Return the checked body of the frame starting at `offset`.
fn checked_body(bytes: &[u8], offset: usize) -> Result<&[u8]> {
    let body_len = read_u32(bytes, offset).ok_or(PlayerError::Decode {
        offset: offset as u64,
        reason: "frame past end of file".into(),
    })? as usize;
    let body_start = offset + 4;
    let body = bytes
        .get(body_start..body_start + body_len)
        .ok_or(PlayerError::Decode {
            offset: offset as u64,
            reason: "frame past end of file".into(),
        })?;
    let stored = read_u32(bytes, body_start + body_len).ok_or(PlayerError::Decode {
        offset: offset as u64,
        reason: "missing checksum".into(),
    })?;
    let computed = crc32fast::hash(body);
    if stored != computed {
        return Err(PlayerError::ChecksumMismatch {
            expected: stored,
            got: computed,
        });
    }
    Ok(body)
}

/// The framed binary [`LogFormat`].
#[derive(Clone, Copy, Debug, Default)]
pub struct FramedFormat;

impl LogFormat for FramedFormat {
    fn id(&self) -> &'static str {
        "tlog"
    }

    fn scan(&self, bytes: &[u8]) -> Result<ScanReport> {
        if bytes.len() < HEADER_SIZE || &bytes[0..4] != LOG_MAGIC {
            return Err(PlayerError::InvalidFormat("Invalid framed log magic".into()));
        }
        if bytes[4] != LOG_VERSION {
            return Err(PlayerError::InvalidFormat(format!(
                "Unsupported framed log version: {}",
                bytes[4]
            )));
        }

        let mut report = ScanReport::default();
        let mut offset = HEADER_SIZE;

        while offset < bytes.len() {
            let Some(body_len) = read_u32(bytes, offset).map(|l| l as usize) else {
                report.truncated_at = Some(offset as u64);
                break;
            };
            let frame_len = body_len + FRAME_OVERHEAD;
            if body_len < FIXED_BODY_SIZE || offset + frame_len > bytes.len() {
                report.truncated_at = Some(offset as u64);
                break;
            }

            let item = checked_body(bytes, offset)
                .and_then(|body| parse_body(body, offset as u64))
                .map(|frame| ScanItem::Record {
                    offset: offset as u64,
                    len: frame_len as u32,
                    time: frame.time,
                    topic: frame.topic.to_string(),
                    schema_name: frame.schema_name.to_string(),
                });
            report.items.push(item.unwrap_or_else(|e| ScanItem::Malformed {
                offset: offset as u64,
                reason: e.to_string(),
            }));

            offset += frame_len;
        }

        Ok(report)
    }

    fn decode(&self, bytes: &[u8], entry: &IndexEntry, _topic: &str) -> Result<MessageEvent> {
        let body = checked_body(bytes, entry.offset as usize)?;
        let frame = parse_body(body, entry.offset)?;
        let payload: Payload = rmp_serde::from_slice(frame.payload).map_err(|e| {
            PlayerError::Decode {
                offset: entry.offset,
                reason: e.to_string(),
            }
        })?;

        let mut event = MessageEvent::new(frame.topic, frame.schema_name, frame.time, payload.message)
            .with_size(entry.len as usize);
        event.publish_time = payload.publish_time;
        Ok(event)
    }
}

/// Open a framed binary log.
pub fn open_framed(path: impl AsRef<Path>) -> IndexedSource<FramedFormat> {
    IndexedSource::new(path, FramedFormat)
}

/// Append-only writer for framed logs.
pub struct FramedLogWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    records: u64,
}

impl FramedLogWriter {
    /// Create (or truncate) a log at `path`.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        let mut writer = BufWriter::new(file);

        // Write magic
        writer.write_all(LOG_MAGIC)?;

        // Write version
        writer.write_all(&[LOG_VERSION])?;

        Ok(Self {
            path,
            writer,
            records: 0,
        })
    }

    /// Append one message.
    pub fn append(&mut self, event: &MessageEvent) -> Result<()> {
        let topic = event.topic.as_bytes();
        let schema = event.schema_name.as_bytes();
        if topic.len() > u16::MAX as usize || schema.len() > u16::MAX as usize {
            return Err(PlayerError::InvalidArgument(
                "topic and schema names must be shorter than 64KiB".into(),
            ));
        }

        let payload = rmp_serde::to_vec_named(&Payload {
            publish_time: event.publish_time,
            message: (*event.message).clone(),
        })?;

        let mut body = Vec::with_capacity(FIXED_BODY_SIZE + topic.len() + schema.len() + payload.len());
        body.extend_from_slice(&event.receive_time.as_nanos().to_le_bytes());
        body.extend_from_slice(&(topic.len() as u16).to_le_bytes());
        body.extend_from_slice(topic);
        body.extend_from_slice(&(schema.len() as u16).to_le_bytes());
        body.extend_from_slice(schema);
        body.extend_from_slice(&payload);

        let body_len = u32::try_from(body.len())
            .map_err(|_| PlayerError::InvalidArgument("message too large".into()))?;

        // Length
        self.writer.write_all(&body_len.to_le_bytes())?;

        // Body
        self.writer.write_all(&body)?;

        // Checksum
        self.writer.write_all(&crc32fast::hash(&body).to_le_bytes())?;

        self.records += 1;
        Ok(())
    }

    /// Number of records written so far.
    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush and sync to disk.
    pub fn finish(mut self) -> Result<u64> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(self.records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::cancel::CancellationToken;
    use crate::source::types::{
        BackfillArgs, IterableSource, IteratorStep, MessageIteratorArgs, TopicSelection,
    };
    use serde_json::json;
    use tempfile::TempDir;

    fn write_sample(path: &Path, count: u32) {
        let mut writer = FramedLogWriter::create(path).unwrap();
        for i in 0..count {
            let event = MessageEvent::new("/imu", "Imu", Time::new(i, 0), json!({"i": i}))
                .with_publish_time(Time::new(i, 1));
            writer.append(&event).unwrap();
        }
        assert_eq!(writer.finish().unwrap(), count as u64);
    }

    #[test]
    fn test_write_and_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.tlog");
        write_sample(&path, 5);

        let mut source = open_framed(&path);
        let init = source.initialize().unwrap();
        assert_eq!(init.start, Time::new(0, 0));
        assert_eq!(init.end, Time::new(4, 0));
        assert_eq!(init.topics[0].schema_name, "Imu");

        let mut iter = source
            .message_iterator(MessageIteratorArgs {
                topics: TopicSelection::all_fields(["/imu"]),
                start: Some(Time::new(2, 0)),
                end: None,
            })
            .unwrap();
        let cancel = CancellationToken::new();
        let IteratorStep::Message(first) = iter.next(&cancel) else {
            panic!("expected a message");
        };
        assert_eq!(first.receive_time, Time::new(2, 0));
        assert_eq!(first.publish_time, Some(Time::new(2, 1)));
        assert_eq!(*first.message, json!({"i": 2}));
    }

    #[test]
    fn test_corrupt_record_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.tlog");
        write_sample(&path, 3);

        // Flip a byte inside the second record's payload.
        let mut bytes = std::fs::read(&path).unwrap();
        let first_len = u32::from_le_bytes(bytes[5..9].try_into().unwrap()) as usize;
        let second = HEADER_SIZE + first_len + FRAME_OVERHEAD;
        bytes[second + 10] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let mut source = open_framed(&path);
        let init = source.initialize().unwrap();
        assert_eq!(init.topic_stats["/imu"].message_count, 2);
        assert_eq!(init.alerts.len(), 1);
    }

    #[test]
    fn test_truncated_tail() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.tlog");
        write_sample(&path, 3);

        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();

        let mut source = open_framed(&path);
        let init = source.initialize().unwrap();
        assert_eq!(init.topic_stats["/imu"].message_count, 2);
        assert!(init.alerts.iter().any(|a| a.message.contains("truncated")));

        let found = source
            .backfill_messages(
                BackfillArgs {
                    topics: TopicSelection::all_fields(["/imu"]),
                    time: Time::new(10, 0),
                },
                &CancellationToken::new(),
            )
            .unwrap();
        assert_eq!(found[0].receive_time, Time::new(1, 0));
    }

    #[test]
    fn test_bad_magic() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.tlog");
        std::fs::write(&path, b"NOPE\x01").unwrap();

        let mut source = open_framed(&path);
        assert!(matches!(
            source.initialize(),
            Err(PlayerError::InvalidFormat(_))
        ));
    }
}
