//! Binary streaming frame.
//!
//! Layout: `[u16 big-endian id length][UTF-8 connection id][payload...]`.
//! The payload runs to the end of the transport frame, so one binary
//! WebSocket message carries exactly one frame.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{Error, Result};

const LEN_PREFIX: usize = 2;

/// A decoded frame borrowing from the received buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinaryFrame<'a> {
    pub connection_id: &'a str,
    pub payload: &'a [u8],
}

impl<'a> BinaryFrame<'a> {
    pub fn new(connection_id: &'a str, payload: &'a [u8]) -> Self {
        Self {
            connection_id,
            payload,
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        encode(self.connection_id, self.payload)
    }

    pub fn decode(buf: &'a [u8]) -> Result<Self> {
        if buf.len() < LEN_PREFIX {
            return Err(Error::Protocol("frame shorter than length prefix".into()));
        }
        let id_len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
        let id_end = LEN_PREFIX + id_len;
        if buf.len() < id_end {
            return Err(Error::Protocol(format!(
                "connection id length {} exceeds frame of {} bytes",
                id_len,
                buf.len()
            )));
        }
        let connection_id = std::str::from_utf8(&buf[LEN_PREFIX..id_end])
            .map_err(|e| Error::Protocol(format!("connection id is not UTF-8: {}", e)))?;
        Ok(Self {
            connection_id,
            payload: &buf[id_end..],
        })
    }
}

/// Encode a payload for `connection_id` into a single frame
pub fn encode(connection_id: &str, payload: &[u8]) -> Result<Bytes> {
    let id = connection_id.as_bytes();
    let id_len = u16::try_from(id.len())
        .map_err(|_| Error::Protocol(format!("connection id too long: {} bytes", id.len())))?;
    let mut buf = BytesMut::with_capacity(LEN_PREFIX + id.len() + payload.len());
    buf.put_u16(id_len);
    buf.put_slice(id);
    buf.put_slice(payload);
    Ok(buf.freeze())
}
