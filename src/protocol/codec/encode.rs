/*
 * Copyright 2017-2023 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! Serialising RESP frames into a byte buffer.

use bytes::{BufMut, BytesMut};

use crate::protocol::resp::RespValue;

const CRLF: &[u8] = b"\r\n";

fn put_line(buf: &mut BytesMut, prefix: u8, line: &[u8]) {
    buf.reserve(line.len() + 3);
    buf.put_u8(prefix);
    buf.put_slice(line);
    buf.put_slice(CRLF);
}

/// Writes a type marker followed by a length (or, for integers, the value itself).
fn put_header(buf: &mut BytesMut, prefix: u8, len: i64) {
    put_line(buf, prefix, len.to_string().as_bytes());
}

pub(crate) fn write(value: RespValue, buf: &mut BytesMut) {
    match value {
        RespValue::Nil => put_header(buf, b'$', -1),
        RespValue::Array(items) => {
            put_header(buf, b'*', items.len() as i64);
            for item in items {
                write(item, buf);
            }
        }
        RespValue::BulkString(data) => {
            put_header(buf, b'$', data.len() as i64);
            buf.reserve(data.len() + 2);
            buf.put_slice(&data);
            buf.put_slice(CRLF);
        }
        RespValue::Error(text) => put_line(buf, b'-', text.as_bytes()),
        RespValue::Integer(value) => put_header(buf, b':', value),
        RespValue::SimpleString(text) => put_line(buf, b'+', text.as_bytes()),
    }
}
