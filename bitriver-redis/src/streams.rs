//! Stream queue built on consumer groups
//!
//! Producers append entries with [`Client::produce`]; consumers in a group
//! read entries nobody in the group has seen yet with [`Client::consume`]
//! and confirm them with [`Client::acknowledge`]. An entry stays pending
//! until acknowledged, so delivery is at-least-once.
//!
//! # Examples
//!
//! ```no_run
//! use bitriver_redis::{Client, ConnectionConfig};
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::connect(ConnectionConfig::new("redis://localhost:6379")).await?;
//!
//! client.ensure_group("chat:42", "readers").await?;
//! client
//!     .produce("chat:42", &[("user", "alice"), ("msg", "hi")])
//!     .await?;
//!
//! let entries = client
//!     .consume("chat:42", "readers", "worker-1", 10, Duration::from_millis(100))
//!     .await?;
//! for entry in &entries {
//!     println!("{}: {:?}", entry.id, entry.get_field("msg"));
//! }
//! let ids = entries.into_iter().map(|e| e.id).collect();
//! client.acknowledge("chat:42", "readers", ids).await?;
//! # Ok(())
//! # }
//! ```

use crate::client::Client;
use crate::commands::{XAckCommand, XAddCommand, XGroupCreateCommand, XReadGroupCommand};
use bitriver_redis_core::{
    error::{RedisError, RedisResult},
    value::RespValue,
};
use rand::Rng;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Represents a single entry in a Redis Stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    /// The unique ID of the entry (e.g., "1234567890123-0")
    pub id: String,
    /// The field-value pairs of the entry, in the order they were produced
    pub fields: Vec<(String, String)>,
}

impl StreamEntry {
    /// Create a new stream entry
    pub fn new(id: impl Into<String>, fields: Vec<(String, String)>) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    /// Get the first value stored under `field`
    #[must_use]
    pub fn get_field(&self, field: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, value)| value.as_str())
    }

    /// Check if the entry has a specific field
    #[must_use]
    pub fn has_field(&self, field: &str) -> bool {
        self.fields.iter().any(|(name, _)| name == field)
    }

    /// Get the timestamp part of the entry ID
    ///
    /// # Examples
    ///
    /// ```
    /// use bitriver_redis::StreamEntry;
    ///
    /// let entry = StreamEntry::new("1234567890123-0", Vec::new());
    /// assert_eq!(entry.timestamp(), Some(1234567890123));
    /// ```
    #[must_use]
    pub fn timestamp(&self) -> Option<u64> {
        self.id.split('-').next()?.parse().ok()
    }

    /// Get the sequence number part of the entry ID
    ///
    /// # Examples
    ///
    /// ```
    /// use bitriver_redis::StreamEntry;
    ///
    /// let entry = StreamEntry::new("1234567890123-5", Vec::new());
    /// assert_eq!(entry.sequence(), Some(5));
    /// ```
    #[must_use]
    pub fn sequence(&self) -> Option<u64> {
        self.id.split('-').nth(1)?.parse().ok()
    }
}

/// Where a new consumer group starts reading
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum GroupStart {
    /// Deliver every entry already in the stream (`0`)
    #[default]
    Beginning,
    /// Deliver only entries added after the group is created (`$`)
    Latest,
    /// Deliver entries after an explicit id
    After(String),
}

impl GroupStart {
    fn as_id(&self) -> &str {
        match self {
            Self::Beginning => "0",
            Self::Latest => "$",
            Self::After(id) => id,
        }
    }
}

/// Parse stream entries from XRANGE/XREAD-style responses
pub fn parse_stream_entries(response: RespValue) -> RedisResult<Vec<StreamEntry>> {
    if response.is_null() {
        return Ok(Vec::new());
    }

    let mut entries = Vec::new();
    for item in response.into_array()? {
        let mut entry_data = item.into_array()?;
        if entry_data.len() != 2 {
            return Err(RedisError::Type(format!(
                "Invalid stream entry format: {} elements",
                entry_data.len()
            )));
        }
        let field_values = entry_data.pop().unwrap_or(RespValue::NullArray);
        let id = entry_data[0].as_string()?;

        // Entries deleted while pending come back with a nil field list.
        let mut fields = Vec::new();
        if !field_values.is_null() {
            let field_values = field_values.into_array()?;
            if field_values.len() % 2 != 0 {
                return Err(RedisError::Type(format!(
                    "Odd number of field values in entry {id}"
                )));
            }
            for pair in field_values.chunks(2) {
                fields.push((pair[0].as_string()?, pair[1].as_string()?));
            }
        }
        entries.push(StreamEntry::new(id, fields));
    }
    Ok(entries)
}

/// Parse an XREAD/XREADGROUP response into per-stream entries
///
/// Both nil kinds mean "no entries".
pub fn parse_xread_response(response: RespValue) -> RedisResult<Vec<(String, Vec<StreamEntry>)>> {
    if response.is_null() {
        return Ok(Vec::new());
    }

    let mut result = Vec::new();
    for stream in response.into_array()? {
        let mut stream_data = stream.into_array()?;
        if stream_data.len() != 2 {
            return Err(RedisError::Type(format!(
                "Invalid XREAD response format: {} elements",
                stream_data.len()
            )));
        }
        let entries = parse_stream_entries(stream_data.pop().unwrap_or(RespValue::NullArray))?;
        let stream_name = stream_data[0].as_string()?;
        result.push((stream_name, entries));
    }
    Ok(result)
}

impl Client {
    /// Append an entry to `stream` and return its server-assigned id
    ///
    /// Fields keep their order. At least one field is required.
    pub async fn produce<K, V>(&self, stream: &str, fields: &[(K, V)]) -> RedisResult<String>
    where
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        if fields.is_empty() {
            return Err(RedisError::Config(
                "An entry needs at least one field".to_string(),
            ));
        }
        let cmd = fields
            .iter()
            .fold(XAddCommand::new(stream), |cmd, (name, value)| {
                cmd.field(name, value)
            });
        self.run(cmd).await
    }

    /// Create `group` on `stream` reading from the beginning, creating the
    /// stream if needed. An existing group counts as success.
    pub async fn ensure_group(&self, stream: &str, group: &str) -> RedisResult<()> {
        self.ensure_group_from(stream, group, GroupStart::Beginning)
            .await
    }

    /// Like [`ensure_group`](Self::ensure_group) with an explicit start position
    pub async fn ensure_group_from(
        &self,
        stream: &str,
        group: &str,
        start: GroupStart,
    ) -> RedisResult<()> {
        let cmd = XGroupCreateCommand::new(stream, group, start.as_id()).mkstream();
        match self.run(cmd).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_busy_group() => {
                debug!("Group {} already exists on {}", group, stream);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Read up to `count` new entries for `consumer`, waiting up to `block`
    ///
    /// Returns an empty list when nothing arrives in time. A zero `block`
    /// returns immediately.
    pub async fn consume(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> RedisResult<Vec<StreamEntry>> {
        let cmd = XReadGroupCommand::new(group, consumer, stream, count).block(block);
        self.run(cmd).await
    }

    /// Remove `ids` from the group's pending list; returns how many were pending
    pub async fn acknowledge(&self, stream: &str, group: &str, ids: Vec<String>) -> RedisResult<i64> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.run(XAckCommand::new(stream, group, ids)).await
    }

    /// Start a background consumer that forwards entries through a channel
    ///
    /// The task stops when the returned [`Subscription`] is closed or dropped.
    pub fn subscribe(&self, stream: &str, group: &str, options: SubscribeOptions) -> Subscription {
        let consumer = options.consumer.clone().unwrap_or_else(random_consumer_name);
        let (tx, rx) = mpsc::channel(options.buffer.max(1));

        let worker = SubscriptionWorker {
            client: self.clone(),
            stream: stream.to_string(),
            group: group.to_string(),
            consumer: consumer.clone(),
            options,
            tx,
        };
        let handle = tokio::spawn(worker.run());

        Subscription {
            receiver: rx,
            consumer,
            handle,
        }
    }
}

/// Settings for [`Client::subscribe`]
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    /// Consumer name; a random `consumer-<hex>` name when unset
    pub consumer: Option<String>,
    /// Entries requested per read
    pub batch_size: usize,
    /// How long each read waits for new entries
    pub block: Duration,
    /// Channel capacity
    pub buffer: usize,
    /// Acknowledge each entry once it has been handed to the channel
    pub auto_ack: bool,
    /// Pause after a failed read
    pub error_backoff: Duration,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            consumer: None,
            batch_size: 32,
            block: Duration::from_secs(2),
            buffer: 128,
            auto_ack: false,
            error_backoff: Duration::from_millis(200),
        }
    }
}

impl SubscribeOptions {
    /// Use a fixed consumer name
    #[must_use]
    pub fn with_consumer(mut self, consumer: impl Into<String>) -> Self {
        self.consumer = Some(consumer.into());
        self
    }

    /// Set how long each read waits
    #[must_use]
    pub const fn with_block(mut self, block: Duration) -> Self {
        self.block = block;
        self
    }

    /// Acknowledge entries after delivery to the channel
    #[must_use]
    pub const fn with_auto_ack(mut self, auto_ack: bool) -> Self {
        self.auto_ack = auto_ack;
        self
    }
}

/// Receiving end of a background consumer
pub struct Subscription {
    receiver: mpsc::Receiver<StreamEntry>,
    consumer: String,
    handle: JoinHandle<()>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("consumer", &self.consumer)
            .finish_non_exhaustive()
    }
}

impl Subscription {
    /// Wait for the next entry; `None` once the subscription has stopped
    pub async fn next(&mut self) -> Option<StreamEntry> {
        self.receiver.recv().await
    }

    /// Name this subscription reads under
    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    /// Stop the background consumer
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

struct SubscriptionWorker {
    client: Client,
    stream: String,
    group: String,
    consumer: String,
    options: SubscribeOptions,
    tx: mpsc::Sender<StreamEntry>,
}

impl SubscriptionWorker {
    async fn run(self) {
        debug!("Subscription {} started on {}", self.consumer, self.stream);
        while !self.tx.is_closed() {
            let read = self
                .client
                .consume(
                    &self.stream,
                    &self.group,
                    &self.consumer,
                    self.options.batch_size,
                    self.options.block,
                )
                .await;

            let entries = match read {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("Stream read for {} failed: {}", self.consumer, e);
                    tokio::time::sleep(self.options.error_backoff).await;
                    continue;
                }
            };

            for entry in entries {
                let id = entry.id.clone();
                if self.tx.send(entry).await.is_err() {
                    return;
                }
                if self.options.auto_ack {
                    if let Err(e) = self
                        .client
                        .acknowledge(&self.stream, &self.group, vec![id.clone()])
                        .await
                    {
                        warn!("Acknowledging {} failed: {}", id, e);
                    }
                }
            }
        }
        debug!("Subscription {} stopped", self.consumer);
    }
}

fn random_consumer_name() -> String {
    let bytes: [u8; 8] = rand::thread_rng().gen();
    let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    format!("consumer-{hex}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_entry_fields() {
        let entry = StreamEntry::new(
            "1700000000000-3",
            vec![
                ("user".to_string(), "alice".to_string()),
                ("msg".to_string(), "hi".to_string()),
            ],
        );
        assert_eq!(entry.get_field("user"), Some("alice"));
        assert!(entry.has_field("msg"));
        assert!(!entry.has_field("missing"));
        assert_eq!(entry.timestamp(), Some(1_700_000_000_000));
        assert_eq!(entry.sequence(), Some(3));
    }

    #[test]
    fn test_parse_entries_keeps_order_and_nil_fields() {
        let reply = RespValue::Array(vec![
            RespValue::Array(vec![
                RespValue::from("1-0"),
                RespValue::Array(vec![
                    RespValue::from("z"),
                    RespValue::from("1"),
                    RespValue::from("a"),
                    RespValue::from("2"),
                ]),
            ]),
            RespValue::Array(vec![RespValue::from("2-0"), RespValue::NullArray]),
        ]);
        let entries = parse_stream_entries(reply).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(
            entries[0].fields,
            vec![
                ("z".to_string(), "1".to_string()),
                ("a".to_string(), "2".to_string())
            ]
        );
        assert!(entries[1].fields.is_empty());
    }

    #[test]
    fn test_parse_entries_rejects_malformed() {
        let odd = RespValue::Array(vec![RespValue::Array(vec![
            RespValue::from("1-0"),
            RespValue::Array(vec![RespValue::from("lonely")]),
        ])]);
        assert!(parse_stream_entries(odd).is_err());
        assert!(parse_stream_entries(RespValue::Integer(1)).is_err());
    }

    #[test]
    fn test_parse_xread_nil_kinds() {
        assert!(parse_xread_response(RespValue::Null).unwrap().is_empty());
        assert!(parse_xread_response(RespValue::NullArray).unwrap().is_empty());
    }

    #[test]
    fn test_group_start_ids() {
        assert_eq!(GroupStart::default().as_id(), "0");
        assert_eq!(GroupStart::Latest.as_id(), "$");
        assert_eq!(GroupStart::After("5-1".to_string()).as_id(), "5-1");
    }

    #[test]
    fn test_random_consumer_name() {
        let a = random_consumer_name();
        let b = random_consumer_name();
        assert!(a.starts_with("consumer-"));
        assert_eq!(a.len(), "consumer-".len() + 16);
        assert_ne!(a, b);
    }
}
