//! Structured message side-channel.
//!
//! When a session runs with `ui.message-output = "channel"`, user-facing
//! notices travel as MessagePack maps on the `m` channel instead of plain
//! bytes on `e`. The channel is strictly additive: every message also has a
//! byte rendition, and clients that ignore `m` entirely still see the full
//! conversation on the byte channels.
//!
//! Each frame payload is one map. The text of the message lives under the
//! reserved `"data"` key; everything else is free-form metadata merged in by
//! the sender.

use std::collections::BTreeMap;
use std::io::{self, Write};

use serde::{Deserialize, Serialize};

use crate::protocol::{channel, write_frame};

/// Conventional values for the `"type"` field.
pub mod kind {
    pub const MESSAGE: &str = "message";
    pub const PROMPT: &str = "prompt";
    pub const PROGRESS: &str = "progress";
}

/// Scalar metadata value. Untagged so the wire form is a plain MessagePack
/// scalar, not a tagged enum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

/// Encode one message map. `data` lands under the reserved `"data"` key;
/// a `fields` entry with that name is overridden.
pub fn encode(data: &str, fields: &[(&str, Value)]) -> Result<Vec<u8>, rmp_serde::encode::Error> {
    let mut map: BTreeMap<&str, Value> = fields.iter().cloned().collect();
    map.insert("data", Value::Str(data.to_owned()));
    rmp_serde::to_vec(&map)
}

/// Decode one message map (used by clients and tests).
pub fn decode(payload: &[u8]) -> Result<BTreeMap<String, Value>, rmp_serde::decode::Error> {
    rmp_serde::from_slice(payload)
}

/// Sender for the `m` channel: one frame per message.
pub struct MessageWriter<S: Write> {
    stream: S,
}

impl<S: Write> MessageWriter<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    pub fn write(&mut self, data: &str, fields: &[(&str, Value)]) -> io::Result<()> {
        let payload = encode(data, fields).map_err(io::Error::other)?;
        write_frame(&mut self.stream, channel::MESSAGE, &payload)?;
        Ok(())
    }
}
