use crate::error::{Result, UmbraError};
use crate::storage::property_value::{PropertyValue, TemporalData, TemporalKind};
use crate::storage::types::Gid;

const TYPE_NULL: u8 = 0;
const TYPE_BOOL: u8 = 1;
const TYPE_INT: u8 = 2;
const TYPE_DOUBLE: u8 = 3;
const TYPE_STRING: u8 = 4;
const TYPE_LIST: u8 = 5;
const TYPE_MAP: u8 = 6;
const TYPE_TEMPORAL: u8 = 7;

/// Little-endian byte writer shared by the snapshot and WAL formats.
#[derive(Debug, Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn position(&self) -> u64 {
        self.buf.len() as u64
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buf.push(u8::from(value));
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_i64(&mut self, value: i64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_f64(&mut self, value: f64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_string(&mut self, value: &str) {
        self.write_u32(value.len() as u32);
        self.buf.extend_from_slice(value.as_bytes());
    }

    pub fn write_gid(&mut self, gid: Gid) {
        self.write_u64(gid.as_u64());
    }

    /// One type byte plus a kind-specific payload; map keys are emitted in
    /// sorted order so the writer output is deterministic.
    pub fn write_property_value(&mut self, value: &PropertyValue) {
        match value {
            PropertyValue::Null => self.write_u8(TYPE_NULL),
            PropertyValue::Bool(value) => {
                self.write_u8(TYPE_BOOL);
                self.write_bool(*value);
            }
            PropertyValue::Int(value) => {
                self.write_u8(TYPE_INT);
                self.write_i64(*value);
            }
            PropertyValue::Double(value) => {
                self.write_u8(TYPE_DOUBLE);
                self.write_f64(*value);
            }
            PropertyValue::String(value) => {
                self.write_u8(TYPE_STRING);
                self.write_string(value);
            }
            PropertyValue::List(values) => {
                self.write_u8(TYPE_LIST);
                self.write_u32(values.len() as u32);
                for value in values {
                    self.write_property_value(value);
                }
            }
            PropertyValue::Map(entries) => {
                self.write_u8(TYPE_MAP);
                self.write_u32(entries.len() as u32);
                for (key, value) in entries {
                    self.write_string(key);
                    self.write_property_value(value);
                }
            }
            PropertyValue::TemporalData(data) => {
                self.write_u8(TYPE_TEMPORAL);
                self.write_u8(match data.kind {
                    TemporalKind::Date => 0,
                    TemporalKind::LocalTime => 1,
                    TemporalKind::LocalDateTime => 2,
                    TemporalKind::Duration => 3,
                });
                self.write_i64(data.microseconds);
            }
        }
    }
}

/// Cursor over an encoded byte slice.
#[derive(Debug)]
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_exhausted(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.pos + len > self.buf.len() {
            return Err(UmbraError::Corruption("encoded payload truncated"));
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(UmbraError::Corruption("invalid bool payload")),
        }
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().expect("length checked")))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let bytes = self.take(8)?;
        Ok(u64::from_le_bytes(bytes.try_into().expect("length checked")))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        let bytes = self.take(8)?;
        Ok(i64::from_le_bytes(bytes.try_into().expect("length checked")))
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        let bytes = self.take(8)?;
        Ok(f64::from_le_bytes(bytes.try_into().expect("length checked")))
    }

    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| UmbraError::Corruption("stored string not utf8"))
    }

    pub fn read_gid(&mut self) -> Result<Gid> {
        Ok(Gid::from_u64(self.read_u64()?))
    }

    pub fn read_exact(&mut self, len: usize) -> Result<&'a [u8]> {
        self.take(len)
    }

    pub fn read_property_value(&mut self) -> Result<PropertyValue> {
        match self.read_u8()? {
            TYPE_NULL => Ok(PropertyValue::Null),
            TYPE_BOOL => Ok(PropertyValue::Bool(self.read_bool()?)),
            TYPE_INT => Ok(PropertyValue::Int(self.read_i64()?)),
            TYPE_DOUBLE => Ok(PropertyValue::Double(self.read_f64()?)),
            TYPE_STRING => Ok(PropertyValue::String(self.read_string()?)),
            TYPE_LIST => {
                let len = self.read_u32()? as usize;
                let mut values = Vec::with_capacity(len);
                for _ in 0..len {
                    values.push(self.read_property_value()?);
                }
                Ok(PropertyValue::List(values))
            }
            TYPE_MAP => {
                let len = self.read_u32()? as usize;
                let mut entries = std::collections::BTreeMap::new();
                for _ in 0..len {
                    let key = self.read_string()?;
                    let value = self.read_property_value()?;
                    entries.insert(key, value);
                }
                Ok(PropertyValue::Map(entries))
            }
            TYPE_TEMPORAL => {
                let kind = match self.read_u8()? {
                    0 => TemporalKind::Date,
                    1 => TemporalKind::LocalTime,
                    2 => TemporalKind::LocalDateTime,
                    3 => TemporalKind::Duration,
                    _ => return Err(UmbraError::Corruption("unknown temporal kind tag")),
                };
                Ok(PropertyValue::TemporalData(TemporalData::new(
                    kind,
                    self.read_i64()?,
                )))
            }
            _ => Err(UmbraError::Corruption("unknown property type tag")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn property_value_roundtrip() {
        let values = vec![
            PropertyValue::Null,
            PropertyValue::Bool(true),
            PropertyValue::Int(-42),
            PropertyValue::Double(2.5),
            PropertyValue::String("nandare".into()),
            PropertyValue::List(vec![
                PropertyValue::Int(1),
                PropertyValue::String("x".into()),
            ]),
            PropertyValue::Map(BTreeMap::from([
                ("a".to_string(), PropertyValue::Bool(false)),
                ("b".to_string(), PropertyValue::List(vec![PropertyValue::Null])),
            ])),
            PropertyValue::TemporalData(TemporalData::new(TemporalKind::LocalDateTime, 123_456)),
        ];
        let mut encoder = Encoder::new();
        for value in &values {
            encoder.write_property_value(value);
        }
        let bytes = encoder.into_bytes();
        let mut decoder = Decoder::new(&bytes);
        for value in &values {
            assert_eq!(&decoder.read_property_value().unwrap(), value);
        }
        assert!(decoder.is_exhausted());
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let mut encoder = Encoder::new();
        encoder.write_property_value(&PropertyValue::String("longer than nothing".into()));
        let bytes = encoder.into_bytes();
        let mut decoder = Decoder::new(&bytes[..bytes.len() - 3]);
        assert!(decoder.read_property_value().is_err());
    }

    #[test]
    fn scalar_roundtrip() {
        let mut encoder = Encoder::new();
        encoder.write_u8(7);
        encoder.write_u32(1 << 30);
        encoder.write_u64(u64::MAX - 1);
        encoder.write_i64(-5);
        encoder.write_string("header");
        let bytes = encoder.into_bytes();
        let mut decoder = Decoder::new(&bytes);
        assert_eq!(decoder.read_u8().unwrap(), 7);
        assert_eq!(decoder.read_u32().unwrap(), 1 << 30);
        assert_eq!(decoder.read_u64().unwrap(), u64::MAX - 1);
        assert_eq!(decoder.read_i64().unwrap(), -5);
        assert_eq!(decoder.read_string().unwrap(), "header");
    }
}
