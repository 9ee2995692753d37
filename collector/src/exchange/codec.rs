//! Frame encoding for the exchange socket.
//!
//! Every frame starts with a one byte tag:
//!
//! ```text
//! R                                   consumer is ready
//! A                                   consumer dequeued one item
//! E <u32 len> <header> <u64 len> <payload>   one record
//! D                                   no more records follow
//! ```
//!
//! Lengths are big endian. The header is the JSON form of the record without
//! its payload.

use crate::error::{Error, Result};
use model::Record;

pub const TAG_READY: u8 = b'R';
pub const TAG_ACK: u8 = b'A';
pub const TAG_ENTRY: u8 = b'E';
pub const TAG_DONE: u8 = b'D';

/// Upper bound for a record header.
pub const MAX_HEADER_LEN: u32 = 64 * 1024 * 1024;

/// Upper bound for a record payload.
pub const MAX_PAYLOAD_LEN: u64 = 16 * 1024 * 1024 * 1024;

/// One unit on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Ready,
    Ack,
    Entry(Record),
    Done,
}

/// Encode a frame.
pub fn encode(frame: &Frame) -> Result<Vec<u8>> {
    match frame {
        Frame::Ready => Ok(vec![TAG_READY]),
        Frame::Ack => Ok(vec![TAG_ACK]),
        Frame::Done => Ok(vec![TAG_DONE]),
        Frame::Entry(record) => {
            let header = serde_json::to_vec(record)?;
            let payload = record.payload();
            let header_len = u32::try_from(header.len())
                .ok()
                .filter(|len| *len <= MAX_HEADER_LEN)
                .ok_or_else(|| Error::Protocol(format!("header of {} too large", record.name())))?;

            let mut out = Vec::with_capacity(1 + 4 + header.len() + 8 + payload.len());
            out.push(TAG_ENTRY);
            out.extend_from_slice(&header_len.to_be_bytes());
            out.extend_from_slice(&header);
            out.extend_from_slice(&(payload.len() as u64).to_be_bytes());
            out.extend_from_slice(payload);
            Ok(out)
        }
    }
}

/// Decode the first frame in `buf`.
///
/// Returns the frame and the number of bytes it used, or `None` when `buf`
/// does not yet hold a complete frame.
pub fn decode(buf: &[u8]) -> Result<Option<(Frame, usize)>> {
    let Some(&tag) = buf.first() else {
        return Ok(None);
    };

    match tag {
        TAG_READY => Ok(Some((Frame::Ready, 1))),
        TAG_ACK => Ok(Some((Frame::Ack, 1))),
        TAG_DONE => Ok(Some((Frame::Done, 1))),
        TAG_ENTRY => decode_entry(buf),
        other => Err(Error::Protocol(format!("unknown frame tag 0x{:02x}", other))),
    }
}

fn decode_entry(buf: &[u8]) -> Result<Option<(Frame, usize)>> {
    let mut pos = 1;

    let Some(bytes) = buf.get(pos..pos + 4) else {
        return Ok(None);
    };
    let header_len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if header_len > MAX_HEADER_LEN {
        return Err(Error::Protocol(format!("header length {} out of range", header_len)));
    }
    pos += 4;

    let Some(header) = buf.get(pos..pos + header_len as usize) else {
        return Ok(None);
    };
    pos += header_len as usize;

    let Some(bytes) = buf.get(pos..pos + 8) else {
        return Ok(None);
    };
    let mut len = [0u8; 8];
    len.copy_from_slice(bytes);
    let payload_len = u64::from_be_bytes(len);
    if payload_len > MAX_PAYLOAD_LEN {
        return Err(Error::Protocol(format!("payload length {} out of range", payload_len)));
    }
    pos += 8;

    let payload_len = usize::try_from(payload_len)
        .map_err(|_| Error::Protocol(format!("payload length {} out of range", payload_len)))?;
    let Some(payload) = buf.get(pos..pos + payload_len) else {
        return Ok(None);
    };
    pos += payload_len;

    let header: Record = serde_json::from_slice(header)?;
    Ok(Some((
        Frame::Entry(Record::from_parts(header, payload.to_vec())),
        pos,
    )))
}
