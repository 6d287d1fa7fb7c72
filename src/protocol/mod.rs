//! Frame definitions and encoding
//!
//! This module defines the MAC frames exchanged over the air and the codec that
//! turns them into radio buffers. Frames are decoded once at ingress; every later
//! decision matches on the [`Frame`] variant.

pub mod codec;
pub mod frame;

pub use self::codec::{decode_packet, encode_packet, FrameCodec};
pub use self::frame::{Frame, Packet};
