/*
 * Copyright 2017-2023 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! Classifying the frames a server pushes down a subscription connection.
//!
//! A subscription connection carries three families of frame, all arrays: confirmations of
//! (un)subscribe commands, messages for subscribed channels, and messages matched by
//! subscribed patterns.  Anything else is unrecognised and left for the caller to log.

use crate::protocol::resp::RespValue;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PubsubFrame {
    /// `["subscribe", topic, count]`
    Subscribed { topic: String },
    /// `["unsubscribe", topic, count]`
    Unsubscribed { topic: String },
    /// `["psubscribe", pattern, count]`
    PatternSubscribed { pattern: String },
    /// `["punsubscribe", pattern, count]`
    PatternUnsubscribed { pattern: String },
    /// `["message", topic, payload]`
    Message { topic: String, payload: Vec<u8> },
    /// `["pmessage", pattern, channel, payload]`
    PatternMessage {
        pattern: String,
        channel: String,
        payload: Vec<u8>,
    },
}

fn as_bytes(value: &RespValue) -> Option<&[u8]> {
    match value {
        RespValue::BulkString(bytes) => Some(bytes),
        RespValue::SimpleString(text) => Some(text.as_bytes()),
        _ => None,
    }
}

fn string_at(items: &[RespValue], index: usize) -> Option<String> {
    as_bytes(items.get(index)?).map(|bytes| String::from_utf8_lossy(bytes).into_owned())
}

fn bytes_at(items: &[RespValue], index: usize) -> Option<Vec<u8>> {
    as_bytes(items.get(index)?).map(|bytes| bytes.to_vec())
}

pub(crate) fn parse(frame: &RespValue) -> Option<PubsubFrame> {
    let items = match frame {
        RespValue::Array(items) => items,
        _ => return None,
    };
    let kind = as_bytes(items.first()?)?;
    match (kind, items.len()) {
        (b"subscribe", 3) => Some(PubsubFrame::Subscribed {
            topic: string_at(items, 1)?,
        }),
        (b"unsubscribe", 3) => Some(PubsubFrame::Unsubscribed {
            topic: string_at(items, 1)?,
        }),
        (b"psubscribe", 3) => Some(PubsubFrame::PatternSubscribed {
            pattern: string_at(items, 1)?,
        }),
        (b"punsubscribe", 3) => Some(PubsubFrame::PatternUnsubscribed {
            pattern: string_at(items, 1)?,
        }),
        (b"message", 3) => Some(PubsubFrame::Message {
            topic: string_at(items, 1)?,
            payload: bytes_at(items, 2)?,
        }),
        (b"pmessage", 4) => Some(PubsubFrame::PatternMessage {
            pattern: string_at(items, 1)?,
            channel: string_at(items, 2)?,
            payload: bytes_at(items, 3)?,
        }),
        _ => None,
    }
}
