/*
 * Copyright 2017-2023 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! Decoding raw RESP values into the typed reply a command expects.
//!
//! Every command declares up-front, via a [`ReplyShape`], which shape it expects its reply in.
//! When a raw value arrives it is decoded into a [`Reply`] of that shape, or classified with a
//! non-`Ok` [`ReplyStatus`] when it cannot be.  Decoding never fails with a panic or an `Err`,
//! the status carries the outcome.

use std::collections::{BTreeSet, HashSet};

use crate::protocol::resp::RespValue;

/// The shape a command expects its reply to be decoded into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplyShape {
    /// The raw `RespValue`, passed through untouched.  Accepts anything except errors.
    Raw,
    /// A byte string.  Accepts bulk and simple strings, preserves length (the payload may
    /// contain NULs).
    Bytes,
    /// A 32-bit integer, truncated from the server's 64-bit value.
    Int,
    /// The server's full 64-bit integer.
    Long,
    /// The nil marker, and nothing else.
    Nil,
    /// An array of strings, preserving the server's order.
    Vector,
    /// An array of strings collected into an ordered set.
    Set,
    /// An array of strings collected into an unordered set.
    HashSet,
}

/// A decoded reply value.  The variant always corresponds to the [`ReplyShape`] the command
/// was created with.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Raw(RespValue),
    Bytes(Vec<u8>),
    Int(i32),
    Long(i64),
    Nil,
    Vector(Vec<String>),
    Set(BTreeSet<String>),
    HashSet(HashSet<String>),
}

/// The terminal classification of one reply delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplyStatus {
    /// No terminal state was reached, either because no reply has arrived yet or because the
    /// command was dropped before one could
    NoReply = 0,
    /// The reply decoded into the expected shape
    Ok = 1,
    /// The server sent nil where the expected shape does not accept it
    NilReply = 2,
    /// The server sent an error, the error text is available alongside the status
    ErrorReply = 3,
    /// The server sent a valid reply of an unexpected shape
    WrongType = 4,
    /// The command could not be submitted to the server
    SendError = 5,
}

impl ReplyStatus {
    pub(crate) fn from_u8(raw: u8) -> ReplyStatus {
        match raw {
            1 => ReplyStatus::Ok,
            2 => ReplyStatus::NilReply,
            3 => ReplyStatus::ErrorReply,
            4 => ReplyStatus::WrongType,
            5 => ReplyStatus::SendError,
            _ => ReplyStatus::NoReply,
        }
    }
}

/// The outcome of decoding one raw value against one expected shape.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Decoded {
    pub(crate) status: ReplyStatus,
    pub(crate) reply: Option<Reply>,
    pub(crate) error: Option<String>,
}

impl Decoded {
    pub(crate) fn ok(reply: Reply) -> Decoded {
        Decoded {
            status: ReplyStatus::Ok,
            reply: Some(reply),
            error: None,
        }
    }

    fn nil() -> Decoded {
        Decoded {
            status: ReplyStatus::NilReply,
            reply: None,
            error: None,
        }
    }

    fn remote_error(text: String) -> Decoded {
        Decoded {
            status: ReplyStatus::ErrorReply,
            reply: None,
            error: Some(text),
        }
    }

    fn wrong_type() -> Decoded {
        Decoded {
            status: ReplyStatus::WrongType,
            reply: None,
            error: None,
        }
    }
}

/// Collects the elements of an array reply as strings, or bails out if any element is not a
/// string.  Partial results are never delivered.
fn element_strings(items: Vec<RespValue>) -> Option<Vec<String>> {
    let mut strings = Vec::with_capacity(items.len());
    for item in items {
        match item {
            RespValue::BulkString(bytes) => {
                strings.push(String::from_utf8_lossy(&bytes).into_owned())
            }
            RespValue::SimpleString(text) => strings.push(text),
            _ => return None,
        }
    }
    Some(strings)
}

pub(crate) fn decode(shape: ReplyShape, raw: RespValue) -> Decoded {
    // Errors trump the expected shape
    if let RespValue::Error(text) = raw {
        return Decoded::remote_error(text);
    }

    match shape {
        ReplyShape::Raw => Decoded::ok(Reply::Raw(raw)),
        ReplyShape::Nil => match raw {
            RespValue::Nil => Decoded::ok(Reply::Nil),
            _ => Decoded::wrong_type(),
        },
        _ if raw == RespValue::Nil => Decoded::nil(),
        ReplyShape::Bytes => match raw {
            RespValue::BulkString(bytes) => Decoded::ok(Reply::Bytes(bytes)),
            RespValue::SimpleString(text) => Decoded::ok(Reply::Bytes(text.into_bytes())),
            _ => Decoded::wrong_type(),
        },
        ReplyShape::Int => match raw {
            RespValue::Integer(value) => Decoded::ok(Reply::Int(value as i32)),
            _ => Decoded::wrong_type(),
        },
        ReplyShape::Long => match raw {
            RespValue::Integer(value) => Decoded::ok(Reply::Long(value)),
            _ => Decoded::wrong_type(),
        },
        ReplyShape::Vector => match raw {
            RespValue::Array(items) => match element_strings(items) {
                Some(strings) => Decoded::ok(Reply::Vector(strings)),
                None => Decoded::wrong_type(),
            },
            _ => Decoded::wrong_type(),
        },
        ReplyShape::Set => match raw {
            RespValue::Array(items) => match element_strings(items) {
                Some(strings) => Decoded::ok(Reply::Set(strings.into_iter().collect())),
                None => Decoded::wrong_type(),
            },
            _ => Decoded::wrong_type(),
        },
        ReplyShape::HashSet => match raw {
            RespValue::Array(items) => match element_strings(items) {
                Some(strings) => Decoded::ok(Reply::HashSet(strings.into_iter().collect())),
                None => Decoded::wrong_type(),
            },
            _ => Decoded::wrong_type(),
        },
    }
}

impl Reply {
    /// The raw value, for `Raw`-shaped replies.
    pub fn as_raw(&self) -> Option<&RespValue> {
        match self {
            Reply::Raw(value) => Some(value),
            _ => None,
        }
    }

    /// The byte string, for `Bytes`-shaped replies.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Reply::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// The 32-bit integer, for `Int`-shaped replies.
    pub fn as_int(&self) -> Option<i32> {
        match self {
            Reply::Int(value) => Some(*value),
            _ => None,
        }
    }

    /// The 64-bit integer, for `Long`-shaped replies.
    pub fn as_long(&self) -> Option<i64> {
        match self {
            Reply::Long(value) => Some(*value),
            _ => None,
        }
    }
}
