//! Value-object codec over [`DataBuf`].
//!
//! Every type shipped through the RPC argument path implements [`BufObject`]
//! with explicit read/write calls. For application value types that do not
//! warrant a hand-written codec, [`write_json`]/[`read_json`] bridge through
//! serde as a fallback object mapper.

use super::DataBuf;
use crate::error::ProtocolError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;
use uuid::Uuid;

/// A value with an explicit wire form inside a [`DataBuf`].
pub trait BufObject: Sized {
    fn write_into(&self, buf: &mut DataBuf) -> Result<(), ProtocolError>;
    fn read_from(buf: &mut DataBuf) -> Result<Self, ProtocolError>;
}

macro_rules! primitive_buf_object {
    ($($ty:ty => $write:ident / $read:ident),* $(,)?) => {
        $(impl BufObject for $ty {
            fn write_into(&self, buf: &mut DataBuf) -> Result<(), ProtocolError> {
                buf.$write(*self)
            }

            fn read_from(buf: &mut DataBuf) -> Result<Self, ProtocolError> {
                buf.$read()
            }
        })*
    };
}

primitive_buf_object! {
    bool => write_bool / read_bool,
    u8 => write_u8 / read_u8,
    i8 => write_i8 / read_i8,
    u16 => write_u16 / read_u16,
    i16 => write_i16 / read_i16,
    u32 => write_u32 / read_u32,
    i32 => write_i32 / read_i32,
    u64 => write_u64 / read_u64,
    i64 => write_i64 / read_i64,
    f32 => write_f32 / read_f32,
    f64 => write_f64 / read_f64,
}

impl BufObject for () {
    fn write_into(&self, _buf: &mut DataBuf) -> Result<(), ProtocolError> {
        Ok(())
    }

    fn read_from(_buf: &mut DataBuf) -> Result<Self, ProtocolError> {
        Ok(())
    }
}

impl BufObject for String {
    fn write_into(&self, buf: &mut DataBuf) -> Result<(), ProtocolError> {
        buf.write_string(self)
    }

    fn read_from(buf: &mut DataBuf) -> Result<Self, ProtocolError> {
        buf.read_string()
    }
}

impl BufObject for Uuid {
    fn write_into(&self, buf: &mut DataBuf) -> Result<(), ProtocolError> {
        buf.write_unique_id(self)
    }

    fn read_from(buf: &mut DataBuf) -> Result<Self, ProtocolError> {
        buf.read_unique_id()
    }
}

impl BufObject for Duration {
    /// Stored as whole milliseconds, matching the timestamp granularity used
    /// across the cluster.
    fn write_into(&self, buf: &mut DataBuf) -> Result<(), ProtocolError> {
        buf.write_var_u64(self.as_millis() as u64)
    }

    fn read_from(buf: &mut DataBuf) -> Result<Self, ProtocolError> {
        Ok(Duration::from_millis(buf.read_var_u64()?))
    }
}

impl BufObject for DataBuf {
    fn write_into(&self, buf: &mut DataBuf) -> Result<(), ProtocolError> {
        buf.write_buf(self)
    }

    fn read_from(buf: &mut DataBuf) -> Result<Self, ProtocolError> {
        buf.read_buf()
    }
}

impl<T: BufObject> BufObject for Option<T> {
    fn write_into(&self, buf: &mut DataBuf) -> Result<(), ProtocolError> {
        buf.write_nullable(self.as_ref(), |b, v| v.write_into(b))
    }

    fn read_from(buf: &mut DataBuf) -> Result<Self, ProtocolError> {
        buf.read_nullable(T::read_from)
    }
}

impl<T: BufObject> BufObject for Vec<T> {
    fn write_into(&self, buf: &mut DataBuf) -> Result<(), ProtocolError> {
        buf.write_var_u64(self.len() as u64)?;
        for item in self {
            item.write_into(buf)?;
        }
        Ok(())
    }

    fn read_from(buf: &mut DataBuf) -> Result<Self, ProtocolError> {
        let len = buf.read_var_u64()? as usize;
        let mut items = Vec::with_capacity(len.min(1024));
        for _ in 0..len {
            items.push(T::read_from(buf)?);
        }
        Ok(items)
    }
}

impl<K, V> BufObject for HashMap<K, V>
where
    K: BufObject + Eq + Hash,
    V: BufObject,
{
    fn write_into(&self, buf: &mut DataBuf) -> Result<(), ProtocolError> {
        buf.write_var_u64(self.len() as u64)?;
        for (key, value) in self {
            key.write_into(buf)?;
            value.write_into(buf)?;
        }
        Ok(())
    }

    fn read_from(buf: &mut DataBuf) -> Result<Self, ProtocolError> {
        let len = buf.read_var_u64()? as usize;
        let mut map = HashMap::with_capacity(len.min(1024));
        for _ in 0..len {
            let key = K::read_from(buf)?;
            let value = V::read_from(buf)?;
            map.insert(key, value);
        }
        Ok(map)
    }
}

/// Writes any serde-serializable value as a length-prefixed JSON blob.
pub fn write_json<T: Serialize>(buf: &mut DataBuf, value: &T) -> Result<(), ProtocolError> {
    let raw = serde_json::to_vec(value)?;
    buf.write_bytes(&raw)
}

/// Reads a value written by [`write_json`].
pub fn read_json<T: DeserializeOwned>(buf: &mut DataBuf) -> Result<T, ProtocolError> {
    let raw = buf.read_bytes()?;
    Ok(serde_json::from_slice(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn collections_round_trip() {
        let values = vec!["alpha".to_string(), "beta".to_string()];
        let mut counts = HashMap::new();
        counts.insert("lobby".to_string(), 3u32);
        counts.insert("proxy".to_string(), 1u32);

        let mut buf = DataBuf::new();
        buf.write_object(&values).unwrap();
        buf.write_object(&counts).unwrap();
        buf.write_object(&Some(42u64)).unwrap();
        buf.write_object(&Option::<u64>::None).unwrap();

        assert_eq!(buf.read_object::<Vec<String>>().unwrap(), values);
        assert_eq!(buf.read_object::<HashMap<String, u32>>().unwrap(), counts);
        assert_eq!(buf.read_object::<Option<u64>>().unwrap(), Some(42));
        assert_eq!(buf.read_object::<Option<u64>>().unwrap(), None);
    }

    #[test]
    fn duration_keeps_millisecond_precision() {
        let mut buf = DataBuf::new();
        buf.write_object(&Duration::from_millis(1500)).unwrap();
        assert_eq!(
            buf.read_object::<Duration>().unwrap(),
            Duration::from_millis(1500)
        );
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct CustomValue {
        name: String,
        weight: u32,
    }

    #[test]
    fn json_fallback_round_trips_custom_types() {
        let value = CustomValue {
            name: "build-queue".to_string(),
            weight: 9,
        };
        let mut buf = DataBuf::new();
        write_json(&mut buf, &value).unwrap();
        assert_eq!(read_json::<CustomValue>(&mut buf).unwrap(), value);
    }

    #[test]
    fn truncated_collection_reports_underrun() {
        let mut buf = DataBuf::new();
        buf.write_var_u64(3).unwrap();
        buf.write_u32(1).unwrap();
        // Promised three elements, wrote one.
        assert!(matches!(
            buf.read_object::<Vec<u32>>(),
            Err(ProtocolError::Underrun { .. })
        ));
    }
}
