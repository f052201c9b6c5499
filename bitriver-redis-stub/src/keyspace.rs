//! Keyspace shared by every stub connection
//!
//! Holds counters and streams under one key namespace, with lazy expiry:
//! an expired key is removed the next time anything touches it.

use bitriver_redis_core::value::RespValue;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

const WRONGTYPE: &str = "WRONGTYPE Operation against a key holding the wrong kind of value";
const INVALID_ID: &str = "ERR Invalid stream ID specified as stream command argument";

/// Stream entry id, `<ms>-<seq>`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub(crate) struct StreamId {
    ms: u64,
    seq: u64,
}

impl StreamId {
    /// Parse `ms-seq` or a bare `ms` (sequence 0)
    pub(crate) fn parse(input: &str) -> Option<Self> {
        match input.split_once('-') {
            Some((ms, seq)) => Some(Self {
                ms: ms.parse().ok()?,
                seq: seq.parse().ok()?,
            }),
            None => Some(Self {
                ms: input.parse().ok()?,
                seq: 0,
            }),
        }
    }

    fn next(self, now_ms: u64) -> Self {
        if now_ms > self.ms {
            Self { ms: now_ms, seq: 0 }
        } else {
            Self {
                ms: self.ms,
                seq: self.seq + 1,
            }
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

struct Entry {
    id: StreamId,
    fields: Vec<(Bytes, Bytes)>,
}

impl Entry {
    fn to_resp(&self) -> RespValue {
        let fields = self
            .fields
            .iter()
            .flat_map(|(field, value)| {
                [
                    RespValue::BulkString(field.clone()),
                    RespValue::BulkString(value.clone()),
                ]
            })
            .collect();
        RespValue::Array(vec![
            RespValue::BulkString(Bytes::from(self.id.to_string())),
            RespValue::Array(fields),
        ])
    }
}

#[derive(Default)]
struct Group {
    last_delivered: StreamId,
    /// Delivered but unacknowledged ids, with the consumer that holds them
    pending: BTreeMap<StreamId, String>,
}

#[derive(Default)]
struct Stream {
    entries: Vec<Entry>,
    last_id: StreamId,
    groups: HashMap<String, Group>,
}

enum Value {
    Counter(i64),
    Stream(Stream),
}

struct Slot {
    value: Value,
    expires_at: Option<Instant>,
}

impl Slot {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// One `XREADGROUP` call
#[derive(Debug, Clone)]
pub(crate) struct ReadRequest {
    pub(crate) group: String,
    pub(crate) consumer: String,
    pub(crate) count: Option<usize>,
    pub(crate) no_ack: bool,
    /// `(stream, id)` pairs; `>` asks for new entries
    pub(crate) streams: Vec<(String, String)>,
}

#[derive(Default)]
pub(crate) struct Keyspace {
    slots: HashMap<String, Slot>,
}

impl Keyspace {
    fn live(&mut self, key: &str) -> Option<&mut Slot> {
        let now = Instant::now();
        if self.slots.get(key).is_some_and(|slot| slot.is_expired(now)) {
            self.slots.remove(key);
        }
        self.slots.get_mut(key)
    }

    fn stream_mut(&mut self, key: &str) -> Result<Option<&mut Stream>, String> {
        match self.live(key) {
            Some(Slot {
                value: Value::Stream(stream),
                ..
            }) => Ok(Some(stream)),
            Some(_) => Err(WRONGTYPE.to_string()),
            None => Ok(None),
        }
    }

    /// Add `delta` to the counter at `key`, starting from 0 when it is missing
    pub(crate) fn incr_by(&mut self, key: &str, delta: i64) -> Result<i64, String> {
        match self.live(key) {
            Some(Slot {
                value: Value::Counter(n),
                ..
            }) => {
                *n = n
                    .checked_add(delta)
                    .ok_or_else(|| "ERR increment or decrement would overflow".to_string())?;
                Ok(*n)
            }
            Some(_) => Err(WRONGTYPE.to_string()),
            None => {
                self.slots
                    .insert(key.to_string(), Slot::new(Value::Counter(delta)));
                Ok(delta)
            }
        }
    }

    /// `1` when the expiry was applied, `0` when the key is missing
    pub(crate) fn expire(&mut self, key: &str, seconds: i64) -> i64 {
        let Some(slot) = self.live(key) else {
            return 0;
        };
        match u64::try_from(seconds) {
            Ok(seconds) if seconds > 0 => {
                slot.expires_at = Some(Instant::now() + Duration::from_secs(seconds));
            }
            _ => {
                self.slots.remove(key);
            }
        }
        1
    }

    pub(crate) fn ttl(&mut self, key: &str) -> i64 {
        match self.live(key) {
            None => -2,
            Some(Slot {
                expires_at: None, ..
            }) => -1,
            Some(Slot {
                expires_at: Some(at),
                ..
            }) => {
                let remaining = at.saturating_duration_since(Instant::now()).as_millis();
                i64::try_from((remaining + 500) / 1000).unwrap_or(i64::MAX)
            }
        }
    }

    pub(crate) fn xadd(
        &mut self,
        key: &str,
        id: &str,
        fields: Vec<(Bytes, Bytes)>,
    ) -> Result<StreamId, String> {
        if self.stream_mut(key)?.is_none() {
            self.slots
                .insert(key.to_string(), Slot::new(Value::Stream(Stream::default())));
        }
        let stream = self
            .stream_mut(key)?
            .ok_or_else(|| WRONGTYPE.to_string())?;

        let id = if id == "*" {
            stream.last_id.next(unix_millis())
        } else {
            let id = StreamId::parse(id).ok_or_else(|| INVALID_ID.to_string())?;
            if id <= stream.last_id {
                return Err(
                    "ERR The ID specified in XADD is equal or smaller than the target stream top item"
                        .to_string(),
                );
            }
            id
        };

        stream.entries.push(Entry { id, fields });
        stream.last_id = id;
        Ok(id)
    }

    pub(crate) fn group_create(
        &mut self,
        key: &str,
        group: &str,
        start: &str,
        mkstream: bool,
    ) -> Result<(), String> {
        if self.stream_mut(key)?.is_none() {
            if !mkstream {
                return Err("ERR The XGROUP subcommand requires the key to exist. \
                            Note that for CREATE you may want to use the MKSTREAM option \
                            to create an empty stream automatically."
                    .to_string());
            }
            self.slots
                .insert(key.to_string(), Slot::new(Value::Stream(Stream::default())));
        }
        let stream = self
            .stream_mut(key)?
            .ok_or_else(|| WRONGTYPE.to_string())?;

        if stream.groups.contains_key(group) {
            return Err("BUSYGROUP Consumer Group name already exists".to_string());
        }
        let last_delivered = if start == "$" {
            stream.last_id
        } else {
            StreamId::parse(start).ok_or_else(|| INVALID_ID.to_string())?
        };
        stream.groups.insert(
            group.to_string(),
            Group {
                last_delivered,
                pending: BTreeMap::new(),
            },
        );
        Ok(())
    }

    /// Deliver entries to a consumer
    ///
    /// `None` means nothing new was available and the caller may block.
    /// Reads of a consumer's own pending history never block.
    pub(crate) fn read_group(&mut self, request: &ReadRequest) -> Result<Option<RespValue>, String> {
        let mut starts = Vec::with_capacity(request.streams.len());
        for (key, id) in &request.streams {
            let known = self
                .stream_mut(key)?
                .is_some_and(|stream| stream.groups.contains_key(&request.group));
            if !known {
                return Err(format!(
                    "NOGROUP No such key '{}' or consumer group '{}' in XREADGROUP with GROUP option",
                    key, request.group
                ));
            }
            let start = if id == ">" {
                None
            } else {
                Some(StreamId::parse(id).ok_or_else(|| INVALID_ID.to_string())?)
            };
            starts.push(start);
        }

        let limit = request.count.unwrap_or(usize::MAX);
        let mut replies = Vec::new();
        let mut history = false;

        for ((key, _), start) in request.streams.iter().zip(starts) {
            let Some(stream) = self.stream_mut(key)? else {
                continue;
            };
            let Stream {
                entries, groups, ..
            } = stream;
            let Some(group) = groups.get_mut(&request.group) else {
                continue;
            };

            let delivered: Vec<RespValue> = match start {
                Some(after) => {
                    history = true;
                    entries
                        .iter()
                        .filter(|entry| {
                            entry.id > after
                                && group.pending.get(&entry.id) == Some(&request.consumer)
                        })
                        .take(limit)
                        .map(Entry::to_resp)
                        .collect()
                }
                None => {
                    let fresh: Vec<&Entry> = entries
                        .iter()
                        .filter(|entry| entry.id > group.last_delivered)
                        .take(limit)
                        .collect();
                    if let Some(last) = fresh.last() {
                        group.last_delivered = last.id;
                    }
                    if !request.no_ack {
                        for entry in &fresh {
                            group.pending.insert(entry.id, request.consumer.clone());
                        }
                    }
                    if fresh.is_empty() {
                        continue;
                    }
                    fresh.into_iter().map(Entry::to_resp).collect()
                }
            };

            replies.push(RespValue::Array(vec![
                RespValue::BulkString(Bytes::from(key.clone())),
                RespValue::Array(delivered),
            ]));
        }

        if replies.is_empty() && !history {
            return Ok(None);
        }
        Ok(Some(RespValue::Array(replies)))
    }

    /// Number of ids removed from the group's pending list
    pub(crate) fn ack(&mut self, key: &str, group: &str, ids: &[StreamId]) -> Result<i64, String> {
        let Some(stream) = self.stream_mut(key)? else {
            return Ok(0);
        };
        let Some(group) = stream.groups.get_mut(group) else {
            return Ok(0);
        };
        let removed = ids
            .iter()
            .filter(|id| group.pending.remove(*id).is_some())
            .count();
        Ok(i64::try_from(removed).unwrap_or(i64::MAX))
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}
