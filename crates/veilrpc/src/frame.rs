//! # Protocol Frames
//!
//! The envelope structure crossing a message channel.
//!
//! ## Invariants
//! - **Panic Safety**: all decoding paths return `Result`, never panicking on
//!   unknown data.
//! - **Forward Compatibility**: unknown map fields are ignored on decode.
//! - **Correlation**: every frame carries the service `key` it belongs to and
//!   the `seq` correlation id of the call it answers or advances.

use std::collections::BTreeMap;

use veilpack::WireValue;

use crate::error::Fault;
use crate::error::ProtocolError as Error;
use crate::error::Result;

/// An envelope crossing the channel.
///
/// `Request`/`ReplyOk`/`ReplyErr` carry plain calls; `Next`/`Done`/`Cancel`
/// carry the incremental updates of a streaming call, where `index` is the
/// monotonically increasing position of each yielded value.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Request {
        key: String,
        seq: u64,
        method: String,
        args: Vec<WireValue>,
    },
    ReplyOk {
        key: String,
        seq: u64,
        result: WireValue,
    },
    ReplyErr {
        key: String,
        seq: u64,
        fault: Fault,
        message: String,
        stack: Option<String>,
    },
    Next {
        key: String,
        seq: u64,
        index: u64,
        item: WireValue,
    },
    Done {
        key: String,
        seq: u64,
        index: u64,
    },
    Cancel {
        key: String,
        seq: u64,
    },
}

impl Frame {
    /// The service key this frame belongs to.
    pub fn key(&self) -> &str {
        match self {
            Frame::Request { key, .. }
            | Frame::ReplyOk { key, .. }
            | Frame::ReplyErr { key, .. }
            | Frame::Next { key, .. }
            | Frame::Done { key, .. }
            | Frame::Cancel { key, .. } => key,
        }
    }

    /// The correlation id this frame belongs to.
    pub fn seq(&self) -> u64 {
        match self {
            Frame::Request { seq, .. }
            | Frame::ReplyOk { seq, .. }
            | Frame::ReplyErr { seq, .. }
            | Frame::Next { seq, .. }
            | Frame::Done { seq, .. }
            | Frame::Cancel { seq, .. } => *seq,
        }
    }

    /// Encodes this frame into its wire representation.
    pub fn encode(&self) -> WireValue {
        let mut map = BTreeMap::new();
        match self {
            Frame::Request {
                key,
                seq,
                method,
                args,
            } => {
                write_header(&mut map, "request", key, *seq);
                map.insert("method".to_string(), WireValue::Text(method.clone()));
                map.insert("args".to_string(), WireValue::List(args.clone()));
            }
            Frame::ReplyOk { key, seq, result } => {
                write_header(&mut map, "ok", key, *seq);
                map.insert("result".to_string(), result.clone());
            }
            Frame::ReplyErr {
                key,
                seq,
                fault,
                message,
                stack,
            } => {
                write_header(&mut map, "err", key, *seq);
                map.insert(
                    "fault".to_string(),
                    WireValue::Text(fault.as_tag().to_string()),
                );
                map.insert("message".to_string(), WireValue::Text(message.clone()));
                if let Some(stack) = stack {
                    map.insert("stack".to_string(), WireValue::Text(stack.clone()));
                }
            }
            Frame::Next {
                key,
                seq,
                index,
                item,
            } => {
                write_header(&mut map, "next", key, *seq);
                map.insert("index".to_string(), WireValue::Int(*index as i64));
                map.insert("item".to_string(), item.clone());
            }
            Frame::Done { key, seq, index } => {
                write_header(&mut map, "done", key, *seq);
                map.insert("index".to_string(), WireValue::Int(*index as i64));
            }
            Frame::Cancel { key, seq } => {
                write_header(&mut map, "cancel", key, *seq);
            }
        }
        WireValue::Map(map)
    }

    /// Decodes a frame from its wire representation.
    pub fn decode(wire: &WireValue) -> Result<Self> {
        let map = expect_map(wire)?;
        let frame_type = expect_text(map, "type")?;
        let key = expect_text(map, "key")?.to_string();
        let seq = expect_u64(map, "seq")?;

        match frame_type {
            "request" => {
                let method = expect_text(map, "method")?.to_string();
                let args = match map.get("args") {
                    Some(WireValue::List(args)) => args.clone(),
                    Some(_) => {
                        return Err(Error::TypeMismatch {
                            field: "args",
                            expected: "list",
                        });
                    }
                    None => return Err(Error::MissingField("args")),
                };
                Ok(Frame::Request {
                    key,
                    seq,
                    method,
                    args,
                })
            }
            "ok" => {
                let result = map
                    .get("result")
                    .cloned()
                    .ok_or(Error::MissingField("result"))?;
                Ok(Frame::ReplyOk { key, seq, result })
            }
            "err" => {
                let fault = Fault::from_tag(expect_text(map, "fault")?)?;
                let message = expect_text(map, "message")?.to_string();
                let stack = match map.get("stack") {
                    Some(WireValue::Text(stack)) => Some(stack.clone()),
                    _ => None,
                };
                Ok(Frame::ReplyErr {
                    key,
                    seq,
                    fault,
                    message,
                    stack,
                })
            }
            "next" => {
                let index = expect_u64(map, "index")?;
                let item = map
                    .get("item")
                    .cloned()
                    .ok_or(Error::MissingField("item"))?;
                Ok(Frame::Next {
                    key,
                    seq,
                    index,
                    item,
                })
            }
            "done" => {
                let index = expect_u64(map, "index")?;
                Ok(Frame::Done { key, seq, index })
            }
            "cancel" => Ok(Frame::Cancel { key, seq }),
            other => Err(Error::UnknownFrame(other.to_string())),
        }
    }
}

/// Decodes just the correlation id from a raw frame.
///
/// Useful for answering a malformed frame whose body fails full decoding but
/// whose header is intact.
pub fn decode_seq(wire: &WireValue) -> Result<u64> {
    let map = expect_map(wire)?;
    expect_u64(map, "seq")
}

/// Decodes just the service key from a raw frame.
pub fn decode_key(wire: &WireValue) -> Result<&str> {
    let map = expect_map(wire)?;
    expect_text(map, "key")
}

fn write_header(map: &mut BTreeMap<String, WireValue>, frame_type: &str, key: &str, seq: u64) {
    map.insert("type".to_string(), WireValue::Text(frame_type.to_string()));
    map.insert("key".to_string(), WireValue::Text(key.to_string()));
    map.insert("seq".to_string(), WireValue::Int(seq as i64));
}

fn expect_map(wire: &WireValue) -> Result<&BTreeMap<String, WireValue>> {
    match wire {
        WireValue::Map(map) => Ok(map),
        _ => Err(Error::TypeMismatch {
            field: "frame",
            expected: "map",
        }),
    }
}

fn expect_text<'a>(map: &'a BTreeMap<String, WireValue>, field: &'static str) -> Result<&'a str> {
    match map.get(field) {
        Some(WireValue::Text(text)) => Ok(text),
        Some(_) => Err(Error::TypeMismatch {
            field,
            expected: "text",
        }),
        None => Err(Error::MissingField(field)),
    }
}

fn expect_u64(map: &BTreeMap<String, WireValue>, field: &'static str) -> Result<u64> {
    match map.get(field) {
        Some(WireValue::Int(value)) if *value >= 0 => Ok(*value as u64),
        Some(_) => Err(Error::TypeMismatch {
            field,
            expected: "non-negative int",
        }),
        None => Err(Error::MissingField(field)),
    }
}
