//! # Structured buffer
//!
//! `DataBuf` is the payload unit of every wire frame: an ordered byte region
//! with an independent read cursor and write cursor, read/write operations
//! for primitives, length-prefixed strings and byte arrays, 128-bit unique
//! ids, nested buffers and nullable values.
//!
//! Buffers carry a manual acquire/release count because they are routinely
//! handed across asynchronous boundaries (queued outbound writes, query
//! completion slots) after the originating call has returned. The count
//! starts at 1; `release()` decrements it and reclaims the backing storage
//! once it reaches zero, after which every read or write fails fast with
//! [`ProtocolError::BufferReleased`].

mod object;

pub use object::{read_json, write_json, BufObject};

use crate::error::ProtocolError;
use crate::varint;
use bytes::{Buf, BufMut, BytesMut};
use uuid::Uuid;

/// Cursor-based transactional binary reader/writer.
pub struct DataBuf {
    data: BytesMut,
    read_pos: usize,
    acquires: i32,
    transaction: Option<Mark>,
}

/// Saved cursor positions for `start_transaction`/`redo_transaction`.
#[derive(Debug, Clone, Copy)]
struct Mark {
    read_pos: usize,
    write_len: usize,
}

impl DataBuf {
    /// Creates an empty buffer with an acquire count of 1.
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Creates an empty buffer with pre-allocated storage.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity),
            read_pos: 0,
            acquires: 1,
            transaction: None,
        }
    }

    /// Wraps already-encoded bytes; the read cursor starts at the front.
    pub fn from_bytes(data: BytesMut) -> Self {
        Self {
            data,
            read_pos: 0,
            acquires: 1,
            transaction: None,
        }
    }

    /// Copies a slice into a fresh buffer.
    pub fn from_slice(data: &[u8]) -> Self {
        Self::from_bytes(BytesMut::from(data))
    }

    // ====== Lifecycle ======

    /// Whether the buffer can still be read from or written to.
    pub fn accessible(&self) -> bool {
        self.acquires > 0
    }

    /// Increments the acquire count, keeping the buffer alive across an
    /// asynchronous hand-off.
    pub fn acquire(&mut self) -> Result<(), ProtocolError> {
        self.ensure_accessible()?;
        self.acquires += 1;
        Ok(())
    }

    /// Decrements the acquire count; at zero the backing storage is
    /// reclaimed and the buffer becomes permanently inaccessible.
    pub fn release(&mut self) {
        if self.acquires > 0 {
            self.acquires -= 1;
            if self.acquires == 0 {
                self.data = BytesMut::new();
                self.read_pos = 0;
                self.transaction = None;
            }
        }
    }

    /// Releases regardless of how many acquires are outstanding.
    pub fn force_release(&mut self) {
        self.acquires = self.acquires.min(1);
        self.release();
    }

    // ====== Cursors ======

    /// Exact number of unread bytes between the read and write cursors.
    pub fn readable_bytes(&self) -> usize {
        self.data.len() - self.read_pos
    }

    /// Total number of bytes written so far.
    pub fn written_bytes(&self) -> usize {
        self.data.len()
    }

    /// The unread remainder as a slice. Empty once released.
    pub fn readable_slice(&self) -> &[u8] {
        &self.data[self.read_pos..]
    }

    /// Marks both cursors so a later `redo_transaction` can rewind to this
    /// exact position.
    pub fn start_transaction(&mut self) -> Result<(), ProtocolError> {
        self.ensure_accessible()?;
        self.transaction = Some(Mark {
            read_pos: self.read_pos,
            write_len: self.data.len(),
        });
        Ok(())
    }

    /// Rewinds both cursors to the last mark. The mark survives, so the
    /// same transaction can be redone repeatedly.
    pub fn redo_transaction(&mut self) -> Result<(), ProtocolError> {
        self.ensure_accessible()?;
        let mark = self.transaction.ok_or(ProtocolError::NoTransaction)?;
        self.data.truncate(mark.write_len);
        self.read_pos = mark.read_pos;
        Ok(())
    }

    // ====== Primitive reads ======

    pub fn read_bool(&mut self) -> Result<bool, ProtocolError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u8(&mut self) -> Result<u8, ProtocolError> {
        let mut s = self.take(1)?;
        Ok(s.get_u8())
    }

    pub fn read_i8(&mut self) -> Result<i8, ProtocolError> {
        let mut s = self.take(1)?;
        Ok(s.get_i8())
    }

    pub fn read_u16(&mut self) -> Result<u16, ProtocolError> {
        let mut s = self.take(2)?;
        Ok(s.get_u16_le())
    }

    pub fn read_i16(&mut self) -> Result<i16, ProtocolError> {
        let mut s = self.take(2)?;
        Ok(s.get_i16_le())
    }

    pub fn read_u32(&mut self) -> Result<u32, ProtocolError> {
        let mut s = self.take(4)?;
        Ok(s.get_u32_le())
    }

    pub fn read_i32(&mut self) -> Result<i32, ProtocolError> {
        let mut s = self.take(4)?;
        Ok(s.get_i32_le())
    }

    pub fn read_u64(&mut self) -> Result<u64, ProtocolError> {
        let mut s = self.take(8)?;
        Ok(s.get_u64_le())
    }

    pub fn read_i64(&mut self) -> Result<i64, ProtocolError> {
        let mut s = self.take(8)?;
        Ok(s.get_i64_le())
    }

    pub fn read_f32(&mut self) -> Result<f32, ProtocolError> {
        let mut s = self.take(4)?;
        Ok(s.get_f32_le())
    }

    pub fn read_f64(&mut self) -> Result<f64, ProtocolError> {
        let mut s = self.take(8)?;
        Ok(s.get_f64_le())
    }

    /// Reads a variable-length unsigned integer.
    pub fn read_var_u64(&mut self) -> Result<u64, ProtocolError> {
        self.ensure_accessible()?;
        match varint::peek_var_u64(self.readable_slice())? {
            Some((value, consumed)) => {
                self.read_pos += consumed;
                Ok(value)
            }
            None => Err(ProtocolError::Underrun {
                needed: self.readable_bytes() + 1,
                available: self.readable_bytes(),
            }),
        }
    }

    // ====== Primitive writes ======

    pub fn write_bool(&mut self, value: bool) -> Result<(), ProtocolError> {
        self.write_u8(u8::from(value))
    }

    pub fn write_u8(&mut self, value: u8) -> Result<(), ProtocolError> {
        self.ensure_accessible()?;
        self.data.put_u8(value);
        Ok(())
    }

    pub fn write_i8(&mut self, value: i8) -> Result<(), ProtocolError> {
        self.ensure_accessible()?;
        self.data.put_i8(value);
        Ok(())
    }

    pub fn write_u16(&mut self, value: u16) -> Result<(), ProtocolError> {
        self.ensure_accessible()?;
        self.data.put_u16_le(value);
        Ok(())
    }

    pub fn write_i16(&mut self, value: i16) -> Result<(), ProtocolError> {
        self.ensure_accessible()?;
        self.data.put_i16_le(value);
        Ok(())
    }

    pub fn write_u32(&mut self, value: u32) -> Result<(), ProtocolError> {
        self.ensure_accessible()?;
        self.data.put_u32_le(value);
        Ok(())
    }

    pub fn write_i32(&mut self, value: i32) -> Result<(), ProtocolError> {
        self.ensure_accessible()?;
        self.data.put_i32_le(value);
        Ok(())
    }

    pub fn write_u64(&mut self, value: u64) -> Result<(), ProtocolError> {
        self.ensure_accessible()?;
        self.data.put_u64_le(value);
        Ok(())
    }

    pub fn write_i64(&mut self, value: i64) -> Result<(), ProtocolError> {
        self.ensure_accessible()?;
        self.data.put_i64_le(value);
        Ok(())
    }

    pub fn write_f32(&mut self, value: f32) -> Result<(), ProtocolError> {
        self.ensure_accessible()?;
        self.data.put_f32_le(value);
        Ok(())
    }

    pub fn write_f64(&mut self, value: f64) -> Result<(), ProtocolError> {
        self.ensure_accessible()?;
        self.data.put_f64_le(value);
        Ok(())
    }

    /// Writes a variable-length unsigned integer.
    pub fn write_var_u64(&mut self, value: u64) -> Result<(), ProtocolError> {
        self.ensure_accessible()?;
        varint::write_var_u64(&mut self.data, value);
        Ok(())
    }

    // ====== Composite values ======

    /// Reads a length-prefixed byte array.
    pub fn read_bytes(&mut self) -> Result<Vec<u8>, ProtocolError> {
        let len = self.read_var_u64()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    /// Writes a length-prefixed byte array.
    pub fn write_bytes(&mut self, value: &[u8]) -> Result<(), ProtocolError> {
        self.write_var_u64(value.len() as u64)?;
        self.data.extend_from_slice(value);
        Ok(())
    }

    /// Reads a length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> Result<String, ProtocolError> {
        let raw = self.read_bytes()?;
        Ok(String::from_utf8(raw)?)
    }

    /// Writes a length-prefixed UTF-8 string.
    pub fn write_string(&mut self, value: &str) -> Result<(), ProtocolError> {
        self.write_bytes(value.as_bytes())
    }

    /// Reads a 128-bit unique id stored as two 64-bit halves, most
    /// significant half first.
    pub fn read_unique_id(&mut self) -> Result<Uuid, ProtocolError> {
        let high = self.read_u64()?;
        let low = self.read_u64()?;
        Ok(Uuid::from_u64_pair(high, low))
    }

    /// Writes a 128-bit unique id as two 64-bit halves.
    pub fn write_unique_id(&mut self, value: &Uuid) -> Result<(), ProtocolError> {
        let (high, low) = value.as_u64_pair();
        self.write_u64(high)?;
        self.write_u64(low)
    }

    /// Reads a nested buffer written by [`DataBuf::write_buf`].
    pub fn read_buf(&mut self) -> Result<DataBuf, ProtocolError> {
        let raw = self.read_bytes()?;
        Ok(DataBuf::from_slice(&raw))
    }

    /// Writes the unread remainder of `other` as a nested, length-prefixed
    /// buffer. The source buffer's cursors are not moved.
    pub fn write_buf(&mut self, other: &DataBuf) -> Result<(), ProtocolError> {
        self.write_bytes(other.readable_slice())
    }

    /// Reads a value written by [`DataBuf::write_nullable`]: one presence
    /// flag, then the payload only if present.
    pub fn read_nullable<T, F>(&mut self, read: F) -> Result<Option<T>, ProtocolError>
    where
        F: FnOnce(&mut DataBuf) -> Result<T, ProtocolError>,
    {
        if self.read_bool()? {
            Ok(Some(read(self)?))
        } else {
            Ok(None)
        }
    }

    /// Writes a presence flag followed by the payload only if present.
    pub fn write_nullable<T, F>(
        &mut self,
        value: Option<&T>,
        write: F,
    ) -> Result<(), ProtocolError>
    where
        F: FnOnce(&mut DataBuf, &T) -> Result<(), ProtocolError>,
    {
        match value {
            Some(inner) => {
                self.write_bool(true)?;
                write(self, inner)
            }
            None => self.write_bool(false),
        }
    }

    /// Reads a value through its object codec.
    pub fn read_object<T: BufObject>(&mut self) -> Result<T, ProtocolError> {
        T::read_from(self)
    }

    /// Writes a value through its object codec.
    pub fn write_object<T: BufObject>(&mut self, value: &T) -> Result<(), ProtocolError> {
        value.write_into(self)
    }

    // ====== Internals ======

    fn ensure_accessible(&self) -> Result<(), ProtocolError> {
        if self.accessible() {
            Ok(())
        } else {
            Err(ProtocolError::BufferReleased)
        }
    }

    fn take(&mut self, n: usize) -> Result<&[u8], ProtocolError> {
        self.ensure_accessible()?;
        let available = self.readable_bytes();
        if available < n {
            return Err(ProtocolError::Underrun {
                needed: n,
                available,
            });
        }
        let start = self.read_pos;
        self.read_pos += n;
        Ok(&self.data[start..start + n])
    }
}

impl Default for DataBuf {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for DataBuf {
    /// Clones the content and read cursor into an independent buffer with a
    /// fresh acquire count of 1 and no transaction mark.
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            read_pos: self.read_pos,
            acquires: 1,
            transaction: None,
        }
    }
}

impl PartialEq for DataBuf {
    /// Buffers compare by their remaining readable bytes; consumed data and
    /// bookkeeping state do not count.
    fn eq(&self, other: &Self) -> bool {
        self.readable_slice() == other.readable_slice()
    }
}

impl Eq for DataBuf {}

impl std::fmt::Debug for DataBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataBuf")
            .field("written", &self.data.len())
            .field("read_pos", &self.read_pos)
            .field("acquires", &self.acquires)
            .field("in_transaction", &self.transaction.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitives_round_trip() {
        let mut buf = DataBuf::new();
        buf.write_bool(true).unwrap();
        buf.write_u8(0xAB).unwrap();
        buf.write_i16(-1234).unwrap();
        buf.write_u32(0xDEAD_BEEF).unwrap();
        buf.write_i64(i64::MIN).unwrap();
        buf.write_f32(1.5).unwrap();
        buf.write_f64(-2.25).unwrap();
        buf.write_var_u64(300).unwrap();

        assert!(buf.read_bool().unwrap());
        assert_eq!(buf.read_u8().unwrap(), 0xAB);
        assert_eq!(buf.read_i16().unwrap(), -1234);
        assert_eq!(buf.read_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(buf.read_i64().unwrap(), i64::MIN);
        assert_eq!(buf.read_f32().unwrap(), 1.5);
        assert_eq!(buf.read_f64().unwrap(), -2.25);
        assert_eq!(buf.read_var_u64().unwrap(), 300);
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn strings_and_ids_round_trip() {
        let id = Uuid::new_v4();
        let mut buf = DataBuf::new();
        buf.write_string("lobby-1 ünïcode").unwrap();
        buf.write_unique_id(&id).unwrap();

        assert_eq!(buf.read_string().unwrap(), "lobby-1 ünïcode");
        assert_eq!(buf.read_unique_id().unwrap(), id);
    }

    #[test]
    fn unique_id_wire_form_is_two_halves() {
        let id = Uuid::new_v4();
        let (high, low) = id.as_u64_pair();
        let mut buf = DataBuf::new();
        buf.write_unique_id(&id).unwrap();
        assert_eq!(buf.read_u64().unwrap(), high);
        assert_eq!(buf.read_u64().unwrap(), low);
    }

    #[test]
    fn nested_buffers_round_trip() {
        let mut inner = DataBuf::new();
        inner.write_string("nested").unwrap();
        inner.write_u32(7).unwrap();

        let mut outer = DataBuf::new();
        outer.write_u8(1).unwrap();
        outer.write_buf(&inner).unwrap();
        outer.write_u8(2).unwrap();

        assert_eq!(outer.read_u8().unwrap(), 1);
        let mut decoded = outer.read_buf().unwrap();
        assert_eq!(decoded.read_string().unwrap(), "nested");
        assert_eq!(decoded.read_u32().unwrap(), 7);
        assert_eq!(outer.read_u8().unwrap(), 2);
    }

    #[test]
    fn nullable_round_trips_present_and_absent() {
        let mut buf = DataBuf::new();
        buf.write_nullable(Some(&"here".to_string()), |b, v| b.write_string(v))
            .unwrap();
        buf.write_nullable::<String, _>(None, |b, v| b.write_string(v))
            .unwrap();

        let present = buf.read_nullable(|b| b.read_string()).unwrap();
        let absent = buf.read_nullable(|b| b.read_string()).unwrap();
        assert_eq!(present.as_deref(), Some("here"));
        assert_eq!(absent, None);
    }

    #[test]
    fn transaction_rewinds_both_cursors() {
        let mut buf = DataBuf::new();
        buf.write_u32(1).unwrap();
        buf.start_transaction().unwrap();
        buf.write_u32(2).unwrap();
        assert_eq!(buf.read_u32().unwrap(), 1);

        buf.redo_transaction().unwrap();
        assert_eq!(buf.written_bytes(), 4);
        assert_eq!(buf.readable_bytes(), 4);
        assert_eq!(buf.read_u32().unwrap(), 1);

        // The mark survives a redo.
        buf.redo_transaction().unwrap();
        assert_eq!(buf.read_u32().unwrap(), 1);
    }

    #[test]
    fn redo_without_mark_fails() {
        let mut buf = DataBuf::new();
        assert!(matches!(
            buf.redo_transaction(),
            Err(ProtocolError::NoTransaction)
        ));
    }

    #[test]
    fn released_buffer_fails_fast() {
        let mut buf = DataBuf::new();
        buf.write_u32(42).unwrap();
        buf.acquire().unwrap();
        buf.release();
        // Still one acquire outstanding.
        assert_eq!(buf.read_u32().unwrap(), 42);

        buf.release();
        assert!(!buf.accessible());
        assert!(matches!(buf.write_u8(0), Err(ProtocolError::BufferReleased)));
        assert!(matches!(buf.read_u8(), Err(ProtocolError::BufferReleased)));
        assert!(matches!(buf.acquire(), Err(ProtocolError::BufferReleased)));
        assert_eq!(buf.readable_slice(), &[] as &[u8]);
    }

    #[test]
    fn underrun_reports_exact_counts() {
        let mut buf = DataBuf::new();
        buf.write_u16(9).unwrap();
        match buf.read_u64() {
            Err(ProtocolError::Underrun { needed, available }) => {
                assert_eq!(needed, 8);
                assert_eq!(available, 2);
            }
            other => panic!("expected underrun, got {other:?}"),
        }
        // The failed read must not have consumed anything.
        assert_eq!(buf.read_u16().unwrap(), 9);
    }

    #[test]
    fn readable_bytes_tracks_remainder() {
        let mut buf = DataBuf::new();
        buf.write_bytes(&[1, 2, 3, 4, 5]).unwrap();
        let total = buf.readable_bytes();
        assert_eq!(total, 6); // 1 length byte + 5 payload bytes
        let _ = buf.read_var_u64().unwrap();
        assert_eq!(buf.readable_bytes(), 5);
    }

    #[test]
    fn clone_is_independent() {
        let mut buf = DataBuf::new();
        buf.write_string("shared").unwrap();
        let mut copy = buf.clone();
        assert_eq!(copy.read_string().unwrap(), "shared");
        // Original cursor unaffected.
        assert_eq!(buf.read_string().unwrap(), "shared");
    }
}
