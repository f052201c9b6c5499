//! Stream and consumer group command builders

use super::{arg, Command};
use crate::streams::{parse_xread_response, StreamEntry};
use bitriver_redis_core::{
    error::{RedisError, RedisResult},
    value::RespValue,
};
use bytes::Bytes;
use std::time::Duration;

/// XADD command builder with a server-assigned id
pub struct XAddCommand {
    stream: String,
    fields: Vec<(Bytes, Bytes)>,
}

impl XAddCommand {
    /// Create a new XADD command
    pub fn new(stream: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            fields: Vec::new(),
        }
    }

    /// Append a field; fields are sent in the order they are added
    pub fn field(mut self, name: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Self {
        self.fields.push((arg(name), arg(value)));
        self
    }

    /// Number of field/value pairs
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether no field has been added
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl Command for XAddCommand {
    /// The id assigned by the server
    type Output = String;

    fn command_name(&self) -> &str {
        "XADD"
    }

    fn args(&self) -> Vec<Bytes> {
        let mut args = Vec::with_capacity(2 + self.fields.len() * 2);
        args.push(arg(&self.stream));
        args.push(Bytes::from_static(b"*"));
        for (name, value) in &self.fields {
            args.push(name.clone());
            args.push(value.clone());
        }
        args
    }

    fn parse_response(&self, response: RespValue) -> RedisResult<Self::Output> {
        response.as_string()
    }
}

/// XGROUP CREATE command builder
pub struct XGroupCreateCommand {
    stream: String,
    group: String,
    start_id: String,
    mkstream: bool,
}

impl XGroupCreateCommand {
    /// Create a group on `stream` that starts delivering after `start_id`
    pub fn new(
        stream: impl Into<String>,
        group: impl Into<String>,
        start_id: impl Into<String>,
    ) -> Self {
        Self {
            stream: stream.into(),
            group: group.into(),
            start_id: start_id.into(),
            mkstream: false,
        }
    }

    /// Create the stream if it does not exist (MKSTREAM)
    pub fn mkstream(mut self) -> Self {
        self.mkstream = true;
        self
    }
}

impl Command for XGroupCreateCommand {
    type Output = ();

    fn command_name(&self) -> &str {
        "XGROUP"
    }

    fn args(&self) -> Vec<Bytes> {
        let mut args = vec![
            Bytes::from_static(b"CREATE"),
            arg(&self.stream),
            arg(&self.group),
            arg(&self.start_id),
        ];
        if self.mkstream {
            args.push(Bytes::from_static(b"MKSTREAM"));
        }
        args
    }

    fn parse_response(&self, response: RespValue) -> RedisResult<Self::Output> {
        match response {
            RespValue::SimpleString(ref s) if s == "OK" => Ok(()),
            other => Err(RedisError::UnexpectedResponse(format!("{:?}", other))),
        }
    }
}

/// XREADGROUP command builder reading new entries (`>`) from one stream
pub struct XReadGroupCommand {
    group: String,
    consumer: String,
    stream: String,
    count: usize,
    block: Duration,
}

impl XReadGroupCommand {
    /// Read up to `count` undelivered entries of `stream` for `consumer`
    pub fn new(
        group: impl Into<String>,
        consumer: impl Into<String>,
        stream: impl Into<String>,
        count: usize,
    ) -> Self {
        Self {
            group: group.into(),
            consumer: consumer.into(),
            stream: stream.into(),
            count,
            block: Duration::ZERO,
        }
    }

    /// Wait up to `block` for an entry; zero means do not wait at all
    pub fn block(mut self, block: Duration) -> Self {
        self.block = block;
        self
    }
}

impl Command for XReadGroupCommand {
    type Output = Vec<StreamEntry>;

    fn command_name(&self) -> &str {
        "XREADGROUP"
    }

    fn args(&self) -> Vec<Bytes> {
        let mut args = vec![
            Bytes::from_static(b"GROUP"),
            arg(&self.group),
            arg(&self.consumer),
            Bytes::from_static(b"COUNT"),
            Bytes::from(self.count.max(1).to_string()),
        ];
        // BLOCK 0 waits forever, so a zero block leaves the option out and
        // anything under a millisecond is sent as 1.
        if !self.block.is_zero() {
            let millis = self.block.as_millis().max(1);
            args.push(Bytes::from_static(b"BLOCK"));
            args.push(Bytes::from(millis.to_string()));
        }
        args.push(Bytes::from_static(b"STREAMS"));
        args.push(arg(&self.stream));
        args.push(Bytes::from_static(b">"));
        args
    }

    fn parse_response(&self, response: RespValue) -> RedisResult<Self::Output> {
        Ok(parse_xread_response(response)?
            .into_iter()
            .filter(|(stream, _)| *stream == self.stream)
            .flat_map(|(_, entries)| entries)
            .collect())
    }

    fn block_duration(&self) -> Duration {
        self.block
    }
}

/// XACK command builder
pub struct XAckCommand {
    stream: String,
    group: String,
    ids: Vec<String>,
}

impl XAckCommand {
    /// Acknowledge `ids` in `group`
    pub fn new(stream: impl Into<String>, group: impl Into<String>, ids: Vec<String>) -> Self {
        Self {
            stream: stream.into(),
            group: group.into(),
            ids,
        }
    }
}

impl Command for XAckCommand {
    /// Number of ids removed from the pending list
    type Output = i64;

    fn command_name(&self) -> &str {
        "XACK"
    }

    fn args(&self) -> Vec<Bytes> {
        let mut args = Vec::with_capacity(2 + self.ids.len());
        args.push(arg(&self.stream));
        args.push(arg(&self.group));
        args.extend(self.ids.iter().map(arg));
        args
    }

    fn parse_response(&self, response: RespValue) -> RedisResult<Self::Output> {
        response.as_int()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(args: Vec<Bytes>) -> Vec<String> {
        args.into_iter()
            .map(|b| String::from_utf8(b.to_vec()).unwrap())
            .collect()
    }

    #[test]
    fn test_xadd_preserves_field_order() {
        let cmd = XAddCommand::new("chat:42")
            .field("user", "alice")
            .field("msg", "hi")
            .field("at", "2026-10-18T12:00:00Z");
        assert_eq!(cmd.len(), 3);
        assert_eq!(
            strings(cmd.args()),
            vec![
                "chat:42",
                "*",
                "user",
                "alice",
                "msg",
                "hi",
                "at",
                "2026-10-18T12:00:00Z"
            ]
        );
        assert_eq!(
            cmd.parse_response(RespValue::from("1700000000000-0")).unwrap(),
            "1700000000000-0"
        );
    }

    #[test]
    fn test_xgroup_create_args() {
        let cmd = XGroupCreateCommand::new("chat:42", "readers", "0").mkstream();
        assert_eq!(
            strings(cmd.args()),
            vec!["CREATE", "chat:42", "readers", "0", "MKSTREAM"]
        );
        assert!(cmd
            .parse_response(RespValue::SimpleString("OK".to_string()))
            .is_ok());
    }

    #[test]
    fn test_xreadgroup_block_option() {
        let blocking = XReadGroupCommand::new("readers", "c1", "chat:42", 10)
            .block(Duration::from_millis(100));
        assert_eq!(
            strings(blocking.args()),
            vec![
                "GROUP", "readers", "c1", "COUNT", "10", "BLOCK", "100", "STREAMS", "chat:42", ">"
            ]
        );
        assert_eq!(blocking.block_duration(), Duration::from_millis(100));

        let immediate = XReadGroupCommand::new("readers", "c1", "chat:42", 10);
        assert!(!strings(immediate.args()).contains(&"BLOCK".to_string()));

        let tiny = XReadGroupCommand::new("readers", "c1", "chat:42", 1)
            .block(Duration::from_micros(10));
        let args = strings(tiny.args());
        assert_eq!(args[5..7], ["BLOCK".to_string(), "1".to_string()]);
    }

    #[test]
    fn test_xreadgroup_parse() {
        let cmd = XReadGroupCommand::new("readers", "c1", "chat:42", 10);
        assert!(cmd.parse_response(RespValue::NullArray).unwrap().is_empty());
        assert!(cmd.parse_response(RespValue::Null).unwrap().is_empty());

        let reply = RespValue::Array(vec![RespValue::Array(vec![
            RespValue::from("chat:42"),
            RespValue::Array(vec![RespValue::Array(vec![
                RespValue::from("5-0"),
                RespValue::Array(vec![
                    RespValue::from("user"),
                    RespValue::from("alice"),
                    RespValue::from("msg"),
                    RespValue::from("hi"),
                ]),
            ])]),
        ])]);
        let entries = cmd.parse_response(reply).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "5-0");
        assert_eq!(entries[0].get_field("msg"), Some("hi"));
    }

    #[test]
    fn test_xack_args() {
        let cmd = XAckCommand::new("chat:42", "readers", vec!["1-0".into(), "2-0".into()]);
        assert_eq!(
            strings(cmd.args()),
            vec!["chat:42", "readers", "1-0", "2-0"]
        );
        assert_eq!(cmd.parse_response(RespValue::Integer(2)).unwrap(), 2);
    }
}
