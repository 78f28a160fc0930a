//! In-memory stream log for tests/dev.
//!
//! Same contract as the production store: per-group cursors, competing
//! consumers, per-consumer pending sets, blocking reads with timeout. No IO.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use meridian_events::Stream;

use super::log::{
    GroupCreated, GroupInfo, LogEntry, LogError, PendingEntry, StreamInfo, StreamLog,
};

#[derive(Debug)]
struct PendingMsg {
    consumer: String,
    delivered_at: Instant,
    deliveries: u64,
}

#[derive(Debug, Default)]
struct GroupState {
    /// Index of the next entry to deliver to this group.
    cursor: usize,
    pending: HashMap<String, PendingMsg>,
}

#[derive(Debug, Default)]
struct StreamState {
    entries: Vec<LogEntry>,
    groups: HashMap<String, GroupState>,
    next_seq: u64,
}

/// Mutex + condvar log. Blocking readers are woken by appends.
#[derive(Debug, Default)]
pub struct InMemoryLog {
    inner: Mutex<HashMap<Stream, StreamState>>,
    wakeup: Condvar,
    pending_unsupported: bool,
}

impl InMemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a store without pending-entry enumeration (the contract
    /// allows it; dead-letter recovery must degrade to a no-op).
    pub fn with_pending_unsupported(mut self) -> Self {
        self.pending_unsupported = true;
        self
    }
}

fn no_such_group(stream: Stream, group: &str) -> LogError {
    LogError::Command(format!("no such consumer group {group} on stream {stream}"))
}

impl StreamLog for InMemoryLog {
    fn connect(&self) -> Result<(), LogError> {
        Ok(())
    }

    fn disconnect(&self) {}

    fn append(
        &self,
        stream: Stream,
        fields: &[(String, String)],
        _max_len: Option<usize>,
    ) -> Result<String, LogError> {
        // Retention is the store's policy; the in-memory double keeps
        // everything so cursors stay index-stable.
        let mut streams = self.inner.lock().unwrap();
        let state = streams.entry(stream).or_default();
        state.next_seq += 1;
        let id = format!("{}-0", state.next_seq);
        state.entries.push(LogEntry {
            id: id.clone(),
            fields: fields.iter().cloned().collect(),
        });
        self.wakeup.notify_all();
        Ok(id)
    }

    fn create_group(
        &self,
        stream: Stream,
        group: &str,
        start_id: &str,
    ) -> Result<GroupCreated, LogError> {
        let mut streams = self.inner.lock().unwrap();
        let state = streams.entry(stream).or_default();
        if state.groups.contains_key(group) {
            return Ok(GroupCreated::AlreadyExists);
        }
        let cursor = match start_id {
            "$" => state.entries.len(),
            _ => 0,
        };
        state.groups.insert(
            group.to_string(),
            GroupState {
                cursor,
                pending: HashMap::new(),
            },
        );
        Ok(GroupCreated::Created)
    }

    fn read_group(
        &self,
        stream: Stream,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<LogEntry>, LogError> {
        let deadline = Instant::now() + Duration::from_millis(block_ms);
        let mut streams = self.inner.lock().unwrap();
        loop {
            let batch = {
                let state = streams
                    .get_mut(&stream)
                    .ok_or_else(|| no_such_group(stream, group))?;
                let StreamState { entries, groups, .. } = state;
                let group_state = groups
                    .get_mut(group)
                    .ok_or_else(|| no_such_group(stream, group))?;

                let mut batch = Vec::new();
                while batch.len() < count && group_state.cursor < entries.len() {
                    let entry = entries[group_state.cursor].clone();
                    group_state.cursor += 1;
                    group_state.pending.insert(
                        entry.id.clone(),
                        PendingMsg {
                            consumer: consumer.to_string(),
                            delivered_at: Instant::now(),
                            deliveries: 1,
                        },
                    );
                    batch.push(entry);
                }
                batch
            };

            if !batch.is_empty() {
                return Ok(batch);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let (guard, _timed_out) = self.wakeup.wait_timeout(streams, deadline - now).unwrap();
            streams = guard;
        }
    }

    fn ack(&self, stream: Stream, group: &str, id: &str) -> Result<(), LogError> {
        let mut streams = self.inner.lock().unwrap();
        let state = streams
            .get_mut(&stream)
            .ok_or_else(|| no_such_group(stream, group))?;
        let group_state = state
            .groups
            .get_mut(group)
            .ok_or_else(|| no_such_group(stream, group))?;
        // Acking an unknown id is a no-op, as in the production store.
        group_state.pending.remove(id);
        Ok(())
    }

    fn pending(&self, stream: Stream, group: &str) -> Result<Vec<PendingEntry>, LogError> {
        if self.pending_unsupported {
            return Err(LogError::Unsupported);
        }
        let streams = self.inner.lock().unwrap();
        let state = streams
            .get(&stream)
            .ok_or_else(|| no_such_group(stream, group))?;
        let group_state = state
            .groups
            .get(group)
            .ok_or_else(|| no_such_group(stream, group))?;

        let mut entries: Vec<PendingEntry> = group_state
            .pending
            .iter()
            .map(|(id, msg)| PendingEntry {
                id: id.clone(),
                consumer: msg.consumer.clone(),
                idle: msg.delivered_at.elapsed(),
                deliveries: msg.deliveries,
            })
            .collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(entries)
    }

    fn read_one(&self, stream: Stream, id: &str) -> Result<Option<LogEntry>, LogError> {
        let streams = self.inner.lock().unwrap();
        Ok(streams
            .get(&stream)
            .and_then(|state| state.entries.iter().find(|e| e.id == id))
            .cloned())
    }

    fn stream_info(&self, stream: Stream) -> Result<StreamInfo, LogError> {
        let streams = self.inner.lock().unwrap();
        let state = streams
            .get(&stream)
            .ok_or_else(|| LogError::Command(format!("no such stream: {stream}")))?;
        Ok(StreamInfo {
            length: state.entries.len() as u64,
            last_id: state
                .entries
                .last()
                .map(|e| e.id.clone())
                .unwrap_or_else(|| "0-0".to_string()),
            groups: state.groups.len() as u64,
        })
    }

    fn group_info(&self, stream: Stream) -> Result<Vec<GroupInfo>, LogError> {
        let streams = self.inner.lock().unwrap();
        let state = streams
            .get(&stream)
            .ok_or_else(|| LogError::Command(format!("no such stream: {stream}")))?;
        let mut infos: Vec<GroupInfo> = state
            .groups
            .iter()
            .map(|(name, group)| {
                let mut consumers: Vec<&str> =
                    group.pending.values().map(|m| m.consumer.as_str()).collect();
                consumers.sort_unstable();
                consumers.dedup();
                GroupInfo {
                    name: name.clone(),
                    consumers: consumers.len() as u64,
                    pending: group.pending.len() as u64,
                    last_delivered_id: group
                        .cursor
                        .checked_sub(1)
                        .and_then(|i| state.entries.get(i))
                        .map(|e| e.id.clone())
                        .unwrap_or_else(|| "0-0".to_string()),
                }
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(infos)
    }
}
