use anyhow::{anyhow, Result};
use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::command::Command;
use super::types::RespValue;

/// RESP2 codec for the proxy's own outbound connections (sentinel and
/// upstream nodes). Client-facing framing lives outside this crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct RespCodec;

impl Decoder for RespCodec {
    type Item = RespValue;
    type Error = anyhow::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        let mut pos = 0usize;
        match parse_value(&src[..], &mut pos)? {
            Some(frame) => {
                src.advance(pos);
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }
}

impl Encoder<RespValue> for RespCodec {
    type Error = anyhow::Error;

    fn encode(&mut self, item: RespValue, dst: &mut BytesMut) -> Result<()> {
        write_value(&item, dst);
        Ok(())
    }
}

impl Encoder<Command> for RespCodec {
    type Error = anyhow::Error;

    fn encode(&mut self, item: Command, dst: &mut BytesMut) -> Result<()> {
        let parts = item.parts();
        dst.extend_from_slice(b"*");
        dst.extend_from_slice(parts.len().to_string().as_bytes());
        dst.extend_from_slice(b"\r\n");
        for part in parts {
            write_bulk(part, dst);
        }
        Ok(())
    }
}

fn parse_value(src: &[u8], pos: &mut usize) -> Result<Option<RespValue>> {
    if *pos >= src.len() {
        return Ok(None);
    }
    let start = *pos;
    let prefix = src[*pos];
    *pos += 1;

    match prefix {
        b'+' | b'-' | b':' => {
            let line = match read_line(src, pos) {
                Some(line) => line,
                None => {
                    *pos = start;
                    return Ok(None);
                }
            };
            let value = match prefix {
                b'+' => RespValue::SimpleString(Bytes::copy_from_slice(line)),
                b'-' => RespValue::Error(Bytes::copy_from_slice(line)),
                _ => {
                    let text = std::str::from_utf8(line)?;
                    RespValue::Integer(
                        text.parse::<i64>()
                            .map_err(|err| anyhow!("invalid integer: {err}"))?,
                    )
                }
            };
            Ok(Some(value))
        }
        b'$' => parse_bulk_string(src, pos, start),
        b'*' => parse_array(src, pos, start),
        _ => Err(anyhow!("unsupported RESP prefix '{}'.", prefix as char)),
    }
}

fn parse_bulk_string(src: &[u8], pos: &mut usize, start: usize) -> Result<Option<RespValue>> {
    let line = match read_line(src, pos) {
        Some(line) => line,
        None => {
            *pos = start;
            return Ok(None);
        }
    };
    let len = parse_length(line, "bulk string")?;
    if len < 0 {
        return Ok(Some(RespValue::NullBulk));
    }
    let len = len as usize;
    if *pos + len + 2 > src.len() {
        *pos = start;
        return Ok(None);
    }
    let data = &src[*pos..*pos + len];
    *pos += len + 2;
    Ok(Some(RespValue::BulkString(Bytes::copy_from_slice(data))))
}

fn parse_array(src: &[u8], pos: &mut usize, start: usize) -> Result<Option<RespValue>> {
    let line = match read_line(src, pos) {
        Some(line) => line,
        None => {
            *pos = start;
            return Ok(None);
        }
    };
    let len = parse_length(line, "array")?;
    if len < 0 {
        return Ok(Some(RespValue::NullArray));
    }
    let mut values = Vec::with_capacity(len.min(1024) as usize);
    for _ in 0..len {
        match parse_value(src, pos)? {
            Some(value) => values.push(value),
            None => {
                *pos = start;
                return Ok(None);
            }
        }
    }
    Ok(Some(RespValue::Array(values)))
}

fn parse_length(bytes: &[u8], kind: &str) -> Result<isize> {
    let text = std::str::from_utf8(bytes)?;
    text.parse::<isize>()
        .map_err(|err| anyhow!("invalid {kind} length: {err}"))
}

fn read_line<'a>(src: &'a [u8], pos: &mut usize) -> Option<&'a [u8]> {
    let offset = src[*pos..].windows(2).position(|w| w == b"\r\n")?;
    let line = &src[*pos..*pos + offset];
    *pos += offset + 2;
    Some(line)
}

fn write_value(value: &RespValue, dst: &mut BytesMut) {
    match value {
        RespValue::SimpleString(data) => {
            dst.extend_from_slice(b"+");
            dst.extend_from_slice(data);
            dst.extend_from_slice(b"\r\n");
        }
        RespValue::Error(data) => {
            dst.extend_from_slice(b"-");
            dst.extend_from_slice(data);
            dst.extend_from_slice(b"\r\n");
        }
        RespValue::Integer(value) => {
            dst.extend_from_slice(b":");
            dst.extend_from_slice(value.to_string().as_bytes());
            dst.extend_from_slice(b"\r\n");
        }
        RespValue::BulkString(data) => write_bulk(data, dst),
        RespValue::NullBulk => dst.extend_from_slice(b"$-1\r\n"),
        RespValue::Array(values) => {
            dst.extend_from_slice(b"*");
            dst.extend_from_slice(values.len().to_string().as_bytes());
            dst.extend_from_slice(b"\r\n");
            for value in values {
                write_value(value, dst);
            }
        }
        RespValue::NullArray => dst.extend_from_slice(b"*-1\r\n"),
    }
}

fn write_bulk(data: &[u8], dst: &mut BytesMut) {
    dst.extend_from_slice(b"$");
    dst.extend_from_slice(data.len().to_string().as_bytes());
    dst.extend_from_slice(b"\r\n");
    dst.extend_from_slice(data);
    dst.extend_from_slice(b"\r\n");
}
