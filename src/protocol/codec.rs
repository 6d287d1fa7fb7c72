use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::core::{Error, Result, MAX_FRAME_SIZE};
use super::frame::Packet;

/// Length-prefixed frame codec shared by the MAC and radio drivers
#[derive(Clone, Default)]
pub struct FrameCodec;

impl FrameCodec {
    /// Creates a new frame codec
    pub fn new() -> Self {
        FrameCodec
    }
}

impl Decoder for FrameCodec {
    type Item = Packet;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.len() < 4 {
            // Need more data to read frame length
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&src[..4]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > MAX_FRAME_SIZE {
            return Err(Error::codec(format!("Frame length {} exceeds limit", length)));
        }

        if src.len() < 4 + length {
            return Ok(None);
        }

        src.advance(4);
        let frame_bytes = src.split_to(length);

        bincode::deserialize(&frame_bytes)
            .map(Some)
            .map_err(|e| Error::codec(format!("Failed to deserialize frame: {}", e)))
    }
}

impl Encoder<&Packet> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, item: &Packet, dst: &mut BytesMut) -> Result<()> {
        let bytes = bincode::serialize(item)
            .map_err(|e| Error::codec(format!("Failed to serialize frame: {}", e)))?;

        if bytes.len() > MAX_FRAME_SIZE {
            return Err(Error::codec(format!(
                "{} frame of {} bytes exceeds limit",
                item.frame.kind(),
                bytes.len()
            )));
        }

        dst.reserve(4 + bytes.len());
        dst.put_u32(bytes.len() as u32);
        dst.extend_from_slice(&bytes);

        Ok(())
    }
}

/// Encodes a single packet into a radio buffer
pub fn encode_packet(packet: &Packet) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    FrameCodec::new().encode(packet, &mut buf)?;
    Ok(buf.freeze())
}

/// Decodes a single radio buffer into a packet
pub fn decode_packet(raw: &[u8]) -> Result<Packet> {
    let mut buf = BytesMut::from(raw);
    FrameCodec::new()
        .decode(&mut buf)?
        .ok_or_else(|| Error::codec("Truncated frame"))
}
