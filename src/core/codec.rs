//! Stream framing for cross-host transport.
//!
//! The fixed-layout [`Buffer`] carries no internal length, so TCP hops wrap
//! each record in an explicit length frame, followed by an optional payload
//! id and the payload bytes.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::core::message::{Buffer, Payload, MESSAGE_SIZE};
use crate::{Error, Result};

/// One framed unit on the wire: a message record plus optional payload.
#[derive(Debug, Clone)]
pub struct Frame {
    pub buffer: Buffer,
    pub payload: Option<Payload>,
}

impl Frame {
    pub fn new(buffer: Buffer) -> Self {
        Self {
            buffer,
            payload: None,
        }
    }

    pub fn with_payload(buffer: Buffer, payload: Payload) -> Self {
        Self {
            buffer,
            payload: Some(payload),
        }
    }
}

/// Length-delimited codec for [`Frame`]s.
#[derive(Debug, Default)]
pub struct MessageCodec;

const LEN_FIELD: usize = 4;
/// Caps a frame at the record plus a payload of at most 1 GiB.
const MAX_FRAME: usize = MESSAGE_SIZE + 9 + (1 << 30);

impl Encoder<Frame> for MessageCodec {
    type Error = Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        let payload_len = frame.payload.as_ref().map(|p| 8 + p.bytes.len()).unwrap_or(0);
        let frame_len = MESSAGE_SIZE + 1 + payload_len;

        dst.reserve(LEN_FIELD + frame_len);
        dst.put_u32(frame_len as u32);
        dst.put_slice(frame.buffer.as_bytes());
        match frame.payload {
            Some(payload) => {
                dst.put_u8(1);
                dst.put_u64(payload.id);
                dst.put_slice(&payload.bytes);
            }
            None => dst.put_u8(0),
        }
        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < LEN_FIELD {
            return Ok(None);
        }
        let mut len_bytes = [0u8; LEN_FIELD];
        len_bytes.copy_from_slice(&src[..LEN_FIELD]);
        let frame_len = u32::from_be_bytes(len_bytes) as usize;

        if frame_len < MESSAGE_SIZE + 1 || frame_len > MAX_FRAME {
            return Err(Error::Protocol(format!("invalid frame length {}", frame_len)));
        }
        if src.len() < LEN_FIELD + frame_len {
            src.reserve(LEN_FIELD + frame_len - src.len());
            return Ok(None);
        }

        src.advance(LEN_FIELD);
        let mut record = [0u8; MESSAGE_SIZE];
        record.copy_from_slice(&src[..MESSAGE_SIZE]);
        src.advance(MESSAGE_SIZE);
        let buffer = Buffer::from_bytes(record);

        let has_payload = src.get_u8();
        let payload = match has_payload {
            0 if frame_len == MESSAGE_SIZE + 1 => None,
            0 => {
                return Err(Error::Protocol(format!(
                    "{} stray bytes after a frame without payload",
                    frame_len - MESSAGE_SIZE - 1
                )));
            }
            1 if frame_len >= MESSAGE_SIZE + 1 + 8 => {
                let id = src.get_u64();
                let payload_len = frame_len - MESSAGE_SIZE - 1 - 8;
                let bytes = src.split_to(payload_len).to_vec();
                Some(Payload { id, bytes })
            }
            1 => {
                return Err(Error::Protocol(format!(
                    "frame length {} too short for a payload header",
                    frame_len
                )));
            }
            other => {
                return Err(Error::Protocol(format!("invalid payload flag {}", other)));
            }
        };

        Ok(Some(Frame { buffer, payload }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::{Envelope, MessageKind, ModuleId};

    fn sample_frame(with_payload: bool) -> Frame {
        let env = Envelope::new(ModuleId(2), 0, MessageKind::Quit);
        let buffer = Buffer::encode(&env).unwrap();
        if with_payload {
            Frame::with_payload(buffer, Payload::new(vec![1, 2, 3, 4, 5]))
        } else {
            Frame::new(buffer)
        }
    }

    #[test]
    fn frame_roundtrip() {
        let mut codec = MessageCodec;
        let mut wire = BytesMut::new();

        codec.encode(sample_frame(false), &mut wire).unwrap();
        codec.encode(sample_frame(true), &mut wire).unwrap();

        let first = codec.decode(&mut wire).unwrap().unwrap();
        assert!(first.payload.is_none());
        assert_eq!(first.buffer.decode().unwrap().kind, MessageKind::Quit);

        let second = codec.decode(&mut wire).unwrap().unwrap();
        assert_eq!(second.payload.unwrap().bytes, vec![1, 2, 3, 4, 5]);
        assert!(wire.is_empty());
    }

    #[test]
    fn partial_frame_waits_for_more_data() {
        let mut codec = MessageCodec;
        let mut wire = BytesMut::new();
        codec.encode(sample_frame(true), &mut wire).unwrap();

        let mut partial = wire.split_to(wire.len() / 2);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.unsplit(wire);
        assert!(codec.decode(&mut partial).unwrap().is_some());
    }

    #[test]
    fn corrupt_length_is_a_protocol_error() {
        let mut codec = MessageCodec;
        let mut wire = BytesMut::new();
        wire.put_u32(3);
        wire.put_slice(&[0; 16]);
        assert!(matches!(codec.decode(&mut wire), Err(Error::Protocol(_))));
    }

    #[test]
    fn truncated_payload_header_is_rejected() {
        // Flag claims a payload but the frame ends before the payload id.
        let mut codec = MessageCodec;
        let mut wire = BytesMut::new();
        wire.put_u32((MESSAGE_SIZE + 1) as u32);
        wire.put_slice(&[0; MESSAGE_SIZE]);
        wire.put_u8(1);
        assert!(matches!(codec.decode(&mut wire), Err(Error::Protocol(_))));

        // Same with a few bytes of the id present.
        let mut wire = BytesMut::new();
        wire.put_u32((MESSAGE_SIZE + 1 + 4) as u32);
        wire.put_slice(&[0; MESSAGE_SIZE]);
        wire.put_u8(1);
        wire.put_slice(&[0; 4]);
        assert!(matches!(codec.decode(&mut wire), Err(Error::Protocol(_))));
    }

    #[test]
    fn bad_payload_flag_is_rejected() {
        let mut codec = MessageCodec;
        let mut wire = BytesMut::new();
        wire.put_u32((MESSAGE_SIZE + 1) as u32);
        wire.put_slice(&[0; MESSAGE_SIZE]);
        wire.put_u8(7);
        assert!(matches!(codec.decode(&mut wire), Err(Error::Protocol(_))));
    }

    #[test]
    fn stray_trailing_bytes_are_rejected() {
        // No-payload flag with extra bytes would desynchronize the stream.
        let mut codec = MessageCodec;
        let mut wire = BytesMut::new();
        wire.put_u32((MESSAGE_SIZE + 1 + 3) as u32);
        wire.put_slice(&[0; MESSAGE_SIZE]);
        wire.put_u8(0);
        wire.put_slice(&[0; 3]);
        assert!(matches!(codec.decode(&mut wire), Err(Error::Protocol(_))));
    }
}
