//! Redis Streams-backed stream log (durable, at-least-once delivery).
//!
//! Command surface: XADD (with approximate MAXLEN), XGROUP CREATE … MKSTREAM,
//! XREADGROUP COUNT/BLOCK, XACK, XPENDING, XRANGE, XINFO.
//!
//! Connections: the bus's three logical connections map to a cached general
//! connection (admin/ack/introspection), a cached publisher connection
//! (appends), and per-read subscriber connections, since a blocking
//! XREADGROUP cannot share a connection without serializing every consume
//! loop on the BLOCK.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use meridian_events::Stream;

use crate::config::BusConfig;

use super::log::{
    GroupCreated, GroupInfo, LogEntry, LogError, PendingEntry, StreamInfo, StreamLog,
};

/// Upper bound on pending entries fetched per reclaim pass.
const PENDING_BATCH: usize = 128;

pub struct RedisLog {
    client: redis::Client,
    stream_prefix: String,
    general: Mutex<Option<redis::Connection>>,
    publisher: Mutex<Option<redis::Connection>>,
}

impl RedisLog {
    pub fn new(config: &BusConfig) -> Result<Self, LogError> {
        let client = redis::Client::open(config.redis_url.as_str())
            .map_err(|e| LogError::Connection(e.to_string()))?;
        Ok(Self {
            client,
            stream_prefix: config.stream_prefix.clone(),
            general: Mutex::new(None),
            publisher: Mutex::new(None),
        })
    }

    fn stream_key(&self, stream: Stream) -> String {
        format!("{}:{}", self.stream_prefix, stream.as_str())
    }

    /// Run a command on a cached connection, opening it on first use and
    /// discarding it after IO failures so the next call reconnects.
    fn with_conn<T>(
        &self,
        slot: &Mutex<Option<redis::Connection>>,
        f: impl FnOnce(&mut redis::Connection) -> redis::RedisResult<T>,
    ) -> Result<T, LogError> {
        let mut guard = slot.lock().unwrap();
        let conn = match guard.as_mut() {
            Some(conn) => conn,
            None => {
                let conn = self
                    .client
                    .get_connection()
                    .map_err(|e| LogError::Connection(e.to_string()))?;
                guard.insert(conn)
            }
        };
        match f(conn) {
            Ok(value) => Ok(value),
            Err(e) => {
                if e.is_io_error() || e.is_connection_dropped() {
                    *guard = None;
                }
                Err(LogError::Command(e.to_string()))
            }
        }
    }
}

impl StreamLog for RedisLog {
    fn connect(&self) -> Result<(), LogError> {
        self.with_conn(&self.general, |conn| redis::cmd("PING").query::<String>(conn))?;
        self.with_conn(&self.publisher, |conn| redis::cmd("PING").query::<String>(conn))?;
        Ok(())
    }

    fn disconnect(&self) {
        *self.general.lock().unwrap() = None;
        *self.publisher.lock().unwrap() = None;
    }

    fn append(
        &self,
        stream: Stream,
        fields: &[(String, String)],
        max_len: Option<usize>,
    ) -> Result<String, LogError> {
        let key = self.stream_key(stream);
        self.with_conn(&self.publisher, |conn| {
            let mut cmd = redis::cmd("XADD");
            cmd.arg(&key);
            if let Some(max) = max_len {
                cmd.arg("MAXLEN").arg("~").arg(max);
            }
            cmd.arg("*");
            for (field, value) in fields {
                cmd.arg(field).arg(value);
            }
            cmd.query::<String>(conn)
        })
    }

    fn create_group(
        &self,
        stream: Stream,
        group: &str,
        start_id: &str,
    ) -> Result<GroupCreated, LogError> {
        let key = self.stream_key(stream);
        self.with_conn(&self.general, |conn| {
            let created = redis::cmd("XGROUP")
                .arg("CREATE")
                .arg(&key)
                .arg(group)
                .arg(start_id)
                .arg("MKSTREAM")
                .query::<String>(conn);
            match created {
                Ok(_) => Ok(GroupCreated::Created),
                Err(e) if e.to_string().contains("BUSYGROUP") => Ok(GroupCreated::AlreadyExists),
                Err(e) => Err(e),
            }
        })
    }

    fn read_group(
        &self,
        stream: Stream,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<LogEntry>, LogError> {
        let key = self.stream_key(stream);
        let mut conn = self
            .client
            .get_connection()
            .map_err(|e| LogError::Connection(e.to_string()))?;

        let reply: redis::Value = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(group)
            .arg(consumer)
            .arg("COUNT")
            .arg(count)
            .arg("BLOCK")
            .arg(block_ms)
            .arg("STREAMS")
            .arg(&key)
            .arg(">")
            .query(&mut conn)
            .map_err(|e| LogError::Command(format!("XREADGROUP failed: {e}")))?;

        parse_read_reply(reply)
    }

    fn ack(&self, stream: Stream, group: &str, id: &str) -> Result<(), LogError> {
        let key = self.stream_key(stream);
        self.with_conn(&self.general, |conn| {
            redis::cmd("XACK")
                .arg(&key)
                .arg(group)
                .arg(id)
                .query::<u64>(conn)
                .map(|_| ())
        })
    }

    fn pending(&self, stream: Stream, group: &str) -> Result<Vec<PendingEntry>, LogError> {
        let key = self.stream_key(stream);
        let rows: Vec<(String, String, u64, u64)> = self.with_conn(&self.general, |conn| {
            redis::cmd("XPENDING")
                .arg(&key)
                .arg(group)
                .arg("-")
                .arg("+")
                .arg(PENDING_BATCH)
                .query(conn)
        })?;

        Ok(rows
            .into_iter()
            .map(|(id, consumer, idle_ms, deliveries)| PendingEntry {
                id,
                consumer,
                idle: Duration::from_millis(idle_ms),
                deliveries,
            })
            .collect())
    }

    fn read_one(&self, stream: Stream, id: &str) -> Result<Option<LogEntry>, LogError> {
        let key = self.stream_key(stream);
        let reply: redis::Value = self.with_conn(&self.general, |conn| {
            redis::cmd("XRANGE")
                .arg(&key)
                .arg(id)
                .arg(id)
                .arg("COUNT")
                .arg(1)
                .query(conn)
        })?;

        let entries = match reply {
            redis::Value::Nil => return Ok(None),
            redis::Value::Bulk(entries) => entries,
            other => return Err(malformed_reply("XRANGE", &other)),
        };
        entries.into_iter().next().map(parse_entry).transpose()
    }

    fn stream_info(&self, stream: Stream) -> Result<StreamInfo, LogError> {
        let key = self.stream_key(stream);
        let reply: redis::Value = self.with_conn(&self.general, |conn| {
            redis::cmd("XINFO").arg("STREAM").arg(&key).query(conn)
        })?;

        let map = reply_map(reply)?;
        Ok(StreamInfo {
            length: int_field(&map, "length"),
            last_id: string_field(&map, "last-generated-id"),
            groups: int_field(&map, "groups"),
        })
    }

    fn group_info(&self, stream: Stream) -> Result<Vec<GroupInfo>, LogError> {
        let key = self.stream_key(stream);
        let reply: redis::Value = self.with_conn(&self.general, |conn| {
            redis::cmd("XINFO").arg("GROUPS").arg(&key).query(conn)
        })?;

        let groups = match reply {
            redis::Value::Bulk(groups) => groups,
            other => return Err(malformed_reply("XINFO GROUPS", &other)),
        };

        groups
            .into_iter()
            .map(|raw| {
                let map = reply_map(raw)?;
                Ok(GroupInfo {
                    name: string_field(&map, "name"),
                    consumers: int_field(&map, "consumers"),
                    pending: int_field(&map, "pending"),
                    last_delivered_id: string_field(&map, "last-delivered-id"),
                })
            })
            .collect()
    }
}

fn malformed_reply(command: &str, value: &redis::Value) -> LogError {
    LogError::Command(format!("unexpected {command} reply shape: {value:?}"))
}

/// XREADGROUP reply: `[[key, [entry, …]], …]`, or Nil on BLOCK timeout.
fn parse_read_reply(reply: redis::Value) -> Result<Vec<LogEntry>, LogError> {
    let streams = match reply {
        redis::Value::Nil => return Ok(Vec::new()),
        redis::Value::Bulk(streams) => streams,
        other => return Err(malformed_reply("XREADGROUP", &other)),
    };

    let mut entries = Vec::new();
    for stream_block in streams {
        let pair = match stream_block {
            redis::Value::Bulk(pair) => pair,
            other => return Err(malformed_reply("XREADGROUP", &other)),
        };
        let raw_entries = match pair.into_iter().nth(1) {
            Some(redis::Value::Bulk(raw_entries)) => raw_entries,
            _ => {
                return Err(LogError::Command(
                    "unexpected XREADGROUP reply shape: stream block too short".to_string(),
                ));
            }
        };
        for raw in raw_entries {
            entries.push(parse_entry(raw)?);
        }
    }
    Ok(entries)
}

/// Entry: `[id, [field, value, field, value, …]]`.
fn parse_entry(raw: redis::Value) -> Result<LogEntry, LogError> {
    let parts = match raw {
        redis::Value::Bulk(parts) => parts,
        other => return Err(malformed_reply("stream entry", &other)),
    };
    let mut parts = parts.into_iter();

    let id = match parts.next() {
        Some(value) => string_of(value)?,
        None => return Err(LogError::Command("stream entry missing id".to_string())),
    };

    let raw_fields = match parts.next() {
        Some(redis::Value::Bulk(fields)) => fields,
        Some(other) => return Err(malformed_reply("stream entry fields", &other)),
        None => Vec::new(),
    };

    let mut fields = HashMap::new();
    let mut raw_fields = raw_fields.into_iter();
    while let (Some(field), Some(value)) = (raw_fields.next(), raw_fields.next()) {
        fields.insert(string_of(field)?, string_of(value)?);
    }

    Ok(LogEntry { id, fields })
}

fn string_of(value: redis::Value) -> Result<String, LogError> {
    match value {
        redis::Value::Data(bytes) => Ok(String::from_utf8_lossy(&bytes).to_string()),
        redis::Value::Status(status) => Ok(status),
        other => Err(malformed_reply("string", &other)),
    }
}

/// XINFO replies are flat `[key, value, key, value, …]` arrays.
fn reply_map(reply: redis::Value) -> Result<HashMap<String, redis::Value>, LogError> {
    let parts = match reply {
        redis::Value::Bulk(parts) => parts,
        other => return Err(malformed_reply("XINFO", &other)),
    };
    let mut map = HashMap::new();
    let mut parts = parts.into_iter();
    while let (Some(key), Some(value)) = (parts.next(), parts.next()) {
        map.insert(string_of(key)?, value);
    }
    Ok(map)
}

fn int_field(map: &HashMap<String, redis::Value>, key: &str) -> u64 {
    match map.get(key) {
        Some(redis::Value::Int(n)) => *n as u64,
        _ => 0,
    }
}

fn string_field(map: &HashMap<String, redis::Value>, key: &str) -> String {
    match map.get(key) {
        Some(redis::Value::Data(bytes)) => String::from_utf8_lossy(bytes).to_string(),
        Some(redis::Value::Status(status)) => status.clone(),
        _ => String::new(),
    }
}
