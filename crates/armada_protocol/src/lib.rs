//! # Armada Protocol
//!
//! Wire protocol primitives shared by every Armada component: the structured
//! buffer used as the payload of all cluster traffic, the length-prefixed
//! frame codec that turns byte streams into discrete messages, and the
//! chunked-transfer envelope for payloads too large for one frame.
//!
//! ## Wire format
//!
//! Every message on a connection is one frame:
//!
//! ```text
//! int32 channelId | varint headerLen | header | varint bodyLen | body
//! ```
//!
//! Header and body are both [`DataBuf`]s: cursor-based binary buffers with
//! read/write support for primitives, length-prefixed strings, 128-bit
//! unique ids stored as two 64-bit halves, nested buffers and nullable
//! values. Integers are little-endian; lengths are LEB128 varints.
//!
//! ## Quick start
//!
//! ```rust
//! use armada_protocol::{channel_ids, DataBuf, Frame, FrameDecoder};
//!
//! # fn main() -> Result<(), armada_protocol::ProtocolError> {
//! let mut body = DataBuf::new();
//! body.write_string("update_node_info_snapshot")?;
//! body.write_bool(true)?;
//!
//! let frame = Frame::bare(channel_ids::MESSAGE, body);
//! let wire = frame.encode();
//!
//! let mut decoder = FrameDecoder::default();
//! decoder.extend(&wire);
//! let mut decoded = decoder.next_frame()?.expect("complete frame");
//! assert_eq!(decoded.body.read_string()?, "update_node_info_snapshot");
//! # Ok(())
//! # }
//! ```
//!
//! This crate is transport-agnostic and contains no async code; the network
//! layer owns sockets and feeds the decoder.

mod buf;
mod chunk;
mod error;
mod frame;
mod varint;

pub use buf::{read_json, write_json, BufObject, DataBuf};
pub use bytes::Bytes;
pub use chunk::{
    failure_frame, split_into_frames, ChunkAssembler, ChunkProgress, TransferStatus,
    DEFAULT_CHUNK_SIZE,
};
pub use error::ProtocolError;
pub use frame::{channel_ids, Frame, FrameDecoder, DEFAULT_MAX_FRAME_SIZE};
pub use varint::{peek_var_u64, var_len, write_var_u64, MAX_VAR_LEN};
