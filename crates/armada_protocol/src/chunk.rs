//! Chunked transfer of large payloads.
//!
//! Payloads too big for a single frame (service templates, static
//! directories) are split into a sequence of frames on the dedicated
//! transfer channel, closed by a final status frame. Each frame's body
//! opens with the transfer id, a monotonically increasing chunk index and a
//! marker byte; the chunk data follows. The consuming side reassembles per
//! transfer id, so transfers may interleave on one channel.

use crate::buf::DataBuf;
use crate::error::ProtocolError;
use crate::frame::{channel_ids, Frame};
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use uuid::Uuid;

/// Default size of one chunk body.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

const MARKER_CHUNK: u8 = 0;
const MARKER_SUCCESS: u8 = 1;
const MARKER_FAILURE: u8 = 2;

/// Terminal status of a chunked transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Success,
    Failure,
}

impl TransferStatus {
    fn marker(self) -> u8 {
        match self {
            TransferStatus::Success => MARKER_SUCCESS,
            TransferStatus::Failure => MARKER_FAILURE,
        }
    }
}

/// Outcome of feeding one transfer frame to the assembler.
#[derive(Debug)]
pub enum ChunkProgress {
    /// Chunk accepted, transfer still in progress.
    Accepted { transfer_id: Uuid, index: u64 },
    /// Final status frame received, payload fully reassembled.
    Complete { transfer_id: Uuid, payload: Bytes },
    /// Transfer aborted by a `FAILURE` status frame.
    Failed { transfer_id: Uuid },
}

fn transfer_frame(
    transfer_id: Uuid,
    index: u64,
    marker: u8,
    chunk: &[u8],
) -> Result<Frame, ProtocolError> {
    let mut body = DataBuf::with_capacity(18 + chunk.len());
    body.write_unique_id(&transfer_id)?;
    body.write_var_u64(index)?;
    body.write_u8(marker)?;
    body.write_bytes(chunk)?;
    Ok(Frame::bare(channel_ids::TRANSFER, body))
}

/// Splits `payload` into chunk frames followed by a `SUCCESS` status frame.
///
/// The status frame's index equals the number of data chunks, which lets the
/// receiver verify nothing was lost even though the channel is ordered.
pub fn split_into_frames(
    transfer_id: Uuid,
    payload: &[u8],
    chunk_size: usize,
) -> Result<Vec<Frame>, ProtocolError> {
    let chunk_size = chunk_size.max(1);
    let chunk_count = payload.len().div_ceil(chunk_size);
    let mut frames = Vec::with_capacity(chunk_count + 1);
    for (index, chunk) in payload.chunks(chunk_size).enumerate() {
        frames.push(transfer_frame(transfer_id, index as u64, MARKER_CHUNK, chunk)?);
    }
    frames.push(transfer_frame(
        transfer_id,
        chunk_count as u64,
        TransferStatus::Success.marker(),
        &[],
    )?);
    Ok(frames)
}

/// A status frame aborting `transfer_id` on the sending side.
pub fn failure_frame(transfer_id: Uuid, index: u64) -> Result<Frame, ProtocolError> {
    transfer_frame(
        transfer_id,
        index,
        TransferStatus::Failure.marker(),
        &[],
    )
}

/// Receiver-side reassembly of interleaved chunked transfers.
#[derive(Default)]
pub struct ChunkAssembler {
    sessions: HashMap<Uuid, Session>,
}

struct Session {
    received: BytesMut,
    next_index: u64,
}

impl ChunkAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of transfers currently in flight.
    pub fn active_transfers(&self) -> usize {
        self.sessions.len()
    }

    /// Discards an in-flight transfer, returning whether one existed.
    pub fn abort(&mut self, transfer_id: &Uuid) -> bool {
        self.sessions.remove(transfer_id).is_some()
    }

    /// Feeds the body of one frame from the transfer channel.
    ///
    /// Out-of-sequence chunks and chunks for unknown transfers are errors;
    /// the session is discarded before the error is returned so the caller
    /// can answer with a [`failure_frame`] and move on.
    pub fn handle_body(&mut self, body: &mut DataBuf) -> Result<ChunkProgress, ProtocolError> {
        let transfer_id = body.read_unique_id()?;
        let index = body.read_var_u64()?;
        let marker = body.read_u8()?;

        match marker {
            MARKER_CHUNK => self.handle_chunk(transfer_id, index, body),
            MARKER_SUCCESS => self.handle_success(transfer_id, index),
            MARKER_FAILURE => {
                self.sessions.remove(&transfer_id);
                Ok(ChunkProgress::Failed { transfer_id })
            }
            tag => Err(ProtocolError::UnknownTag {
                tag,
                context: "transfer marker",
            }),
        }
    }

    fn handle_chunk(
        &mut self,
        transfer_id: Uuid,
        index: u64,
        body: &mut DataBuf,
    ) -> Result<ChunkProgress, ProtocolError> {
        let chunk = body.read_bytes()?;
        if index == 0 {
            // First chunk opens (or restarts) the session.
            let mut session = Session {
                received: BytesMut::new(),
                next_index: 1,
            };
            session.received.extend_from_slice(&chunk);
            self.sessions.insert(transfer_id, session);
            return Ok(ChunkProgress::Accepted { transfer_id, index });
        }

        let Some(session) = self.sessions.get_mut(&transfer_id) else {
            return Err(ProtocolError::UnknownTransfer(transfer_id));
        };
        if index != session.next_index {
            let expected = session.next_index;
            self.sessions.remove(&transfer_id);
            return Err(ProtocolError::ChunkOutOfSequence {
                transfer_id,
                expected,
                got: index,
            });
        }
        session.received.extend_from_slice(&chunk);
        session.next_index += 1;
        Ok(ChunkProgress::Accepted { transfer_id, index })
    }

    fn handle_success(
        &mut self,
        transfer_id: Uuid,
        index: u64,
    ) -> Result<ChunkProgress, ProtocolError> {
        match self.sessions.remove(&transfer_id) {
            Some(session) if session.next_index == index => Ok(ChunkProgress::Complete {
                transfer_id,
                payload: session.received.freeze(),
            }),
            Some(session) => Err(ProtocolError::ChunkOutOfSequence {
                transfer_id,
                expected: session.next_index,
                got: index,
            }),
            // A zero-chunk transfer carries only the status frame.
            None if index == 0 => Ok(ChunkProgress::Complete {
                transfer_id,
                payload: Bytes::new(),
            }),
            None => Err(ProtocolError::UnknownTransfer(transfer_id)),
        }
    }
}
