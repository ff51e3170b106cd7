/*
 * Copyright 2017-2023 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! Incremental parsing of RESP frames from a byte buffer.

use std::str;

use bytes::BytesMut;

use crate::{error::Error, protocol::resp::RespValue};

/// The outcome of a single parse attempt: the parsed value plus the index of the first byte
/// after it, or `None` when the buffer does not yet hold a complete value.
pub(crate) type ParseResult = Result<Option<(usize, RespValue)>, Error>;

fn corrupt(message: String) -> Error {
    Error::RESP(message, None)
}

/// Looks for the CRLF-terminated line beginning at `from`.  Returns the line without its
/// terminator, and the index just past the terminator.
fn take_line(buf: &BytesMut, from: usize) -> Option<(usize, &[u8])> {
    let mut pos = from;
    while pos + 1 < buf.len() {
        if buf[pos] == b'\r' && buf[pos + 1] == b'\n' {
            return Some((pos + 2, &buf[from..pos]));
        }
        pos += 1;
    }
    None
}

/// Lengths and integer values are both transmitted as ASCII decimal lines.
fn parse_i64(line: &[u8]) -> Result<i64, Error> {
    let text =
        str::from_utf8(line).map_err(|_| corrupt(format!("Not a valid string: {:?}", line)))?;
    text.parse()
        .map_err(|_| corrupt(format!("Not an integer: {}", text)))
}

fn bulk_string(buf: &BytesMut, from: usize) -> ParseResult {
    let (header_end, line) = match take_line(buf, from) {
        Some(found) => found,
        None => return Ok(None),
    };
    match parse_i64(line)? {
        -1 => Ok(Some((header_end, RespValue::Nil))),
        len if len >= 0 => {
            let len = len as usize;
            // The payload is length-counted, the trailing CRLF is not part of it
            if buf.len() < header_end + len + 2 {
                return Ok(None);
            }
            let data = buf[header_end..header_end + len].to_vec();
            Ok(Some((header_end + len + 2, RespValue::BulkString(data))))
        }
        len => Err(corrupt(format!("Invalid string length: {}", len))),
    }
}

fn array(buf: &BytesMut, from: usize) -> ParseResult {
    let (mut pos, line) = match take_line(buf, from) {
        Some(found) => found,
        None => return Ok(None),
    };
    match parse_i64(line)? {
        -1 => Ok(Some((pos, RespValue::Nil))),
        len if len >= 0 => {
            let mut values = Vec::with_capacity(len as usize);
            for _ in 0..len {
                match parse(buf, pos)? {
                    Some((next, value)) => {
                        values.push(value);
                        pos = next;
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((pos, RespValue::Array(values))))
        }
        len => Err(corrupt(format!("Invalid array length: {}", len))),
    }
}

fn integer(buf: &BytesMut, from: usize) -> ParseResult {
    match take_line(buf, from) {
        Some((pos, line)) => Ok(Some((pos, RespValue::Integer(parse_i64(line)?)))),
        None => Ok(None),
    }
}

fn simple_string(buf: &BytesMut, from: usize) -> ParseResult {
    match take_line(buf, from) {
        Some((pos, line)) => Ok(Some((
            pos,
            RespValue::SimpleString(String::from_utf8_lossy(line).into_owned()),
        ))),
        None => Ok(None),
    }
}

fn error_value(buf: &BytesMut, from: usize) -> ParseResult {
    match take_line(buf, from) {
        Some((pos, line)) => Ok(Some((
            pos,
            RespValue::Error(String::from_utf8_lossy(line).into_owned()),
        ))),
        None => Ok(None),
    }
}

pub(crate) fn parse(buf: &BytesMut, from: usize) -> ParseResult {
    if from >= buf.len() {
        return Ok(None);
    }
    let rest = from + 1;
    match buf[from] {
        b'$' => bulk_string(buf, rest),
        b'*' => array(buf, rest),
        b':' => integer(buf, rest),
        b'+' => simple_string(buf, rest),
        b'-' => error_value(buf, rest),
        byte => Err(corrupt(format!("Unexpected leading byte: {}", byte))),
    }
}
