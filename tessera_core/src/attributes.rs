//! The Attribute Codec - typed slot list with partial-state diffing
//!
//! Every replicated object and every event carries one of these. Slots are
//! appended once and then only overwritten; each overwrite marks the slot
//! dirty so the next diff carries just what changed.
//!
//! # Layout
//!
//! ```text
//! +-------+----------+--------------------------------+-----------------+
//! | count | data_len | count x (index, type, length)  | data bytes ...  |
//! |  u8   |   u16    |        u8     u8     u16       |  data_len bytes |
//! +-------+----------+--------------------------------+-----------------+
//! ```
//!
//! All fields are fixed-width and machine-native. Strings are raw bytes whose
//! length sits in the record header; vec3 is three `f32`. An empty selection
//! packs to zero bytes.

use crate::error::CodecError;
use crate::wire::{Reader, Writer};
use nalgebra::Vector3;

/// Three-component float vector carried in attribute slots.
pub type Vec3 = Vector3<f32>;

const HEADER_LEN: usize = 3;
const RECORD_LEN: usize = 4;

/// A value held in one attribute slot.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Bool(bool),
    Int(i32),
    Float(f32),
    Text(String),
    Vec3(Vec3),
}

impl AttrValue {
    pub const BOOL: u8 = 1;
    pub const INT: u8 = 2;
    pub const FLOAT: u8 = 3;
    pub const TEXT: u8 = 4;
    pub const VEC3: u8 = 5;

    /// Wire type code of this value.
    pub fn type_code(&self) -> u8 {
        match self {
            AttrValue::Bool(_) => Self::BOOL,
            AttrValue::Int(_) => Self::INT,
            AttrValue::Float(_) => Self::FLOAT,
            AttrValue::Text(_) => Self::TEXT,
            AttrValue::Vec3(_) => Self::VEC3,
        }
    }

    fn encoded_len(&self) -> usize {
        match self {
            AttrValue::Bool(_) => 1,
            AttrValue::Int(_) | AttrValue::Float(_) => 4,
            AttrValue::Text(s) => s.len(),
            AttrValue::Vec3(_) => 12,
        }
    }

    fn write(&self, w: &mut Writer<'_>) {
        match self {
            AttrValue::Bool(b) => w.put_bool(*b),
            AttrValue::Int(i) => w.put_i32(*i),
            AttrValue::Float(f) => w.put_f32(*f),
            AttrValue::Text(s) => w.put_bytes(s.as_bytes()),
            AttrValue::Vec3(v) => {
                w.put_f32(v.x);
                w.put_f32(v.y);
                w.put_f32(v.z);
            }
        }
    }

    fn read(type_code: u8, data: &[u8]) -> Result<Self, CodecError> {
        let bad_length = || CodecError::BadLength {
            type_code,
            length: data.len(),
        };
        let mut r = Reader::new(data);
        let value = match type_code {
            Self::BOOL => AttrValue::Bool(r.get_bool().ok_or_else(bad_length)?),
            Self::INT => AttrValue::Int(r.get_i32().ok_or_else(bad_length)?),
            Self::FLOAT => AttrValue::Float(r.get_f32().ok_or_else(bad_length)?),
            Self::TEXT => {
                let text = std::str::from_utf8(data).map_err(|_| CodecError::InvalidText)?;
                return Ok(AttrValue::Text(text.to_owned()));
            }
            Self::VEC3 => {
                let x = r.get_f32().ok_or_else(bad_length)?;
                let y = r.get_f32().ok_or_else(bad_length)?;
                let z = r.get_f32().ok_or_else(bad_length)?;
                AttrValue::Vec3(Vec3::new(x, y, z))
            }
            other => return Err(CodecError::UnknownType(other)),
        };
        if r.remaining() != 0 {
            return Err(bad_length());
        }
        Ok(value)
    }
}

impl From<bool> for AttrValue {
    fn from(v: bool) -> Self {
        AttrValue::Bool(v)
    }
}

impl From<i32> for AttrValue {
    fn from(v: i32) -> Self {
        AttrValue::Int(v)
    }
}

impl From<f32> for AttrValue {
    fn from(v: f32) -> Self {
        AttrValue::Float(v)
    }
}

impl From<String> for AttrValue {
    fn from(v: String) -> Self {
        AttrValue::Text(v)
    }
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        AttrValue::Text(v.to_owned())
    }
}

impl From<Vec3> for AttrValue {
    fn from(v: Vec3) -> Self {
        AttrValue::Vec3(v)
    }
}

/// Rust types that can be read back out of a slot with [`AttributeList::get`].
pub trait AttrType: Sized {
    /// Wire type code this Rust type maps to.
    const TYPE_CODE: u8;

    fn from_value(value: &AttrValue) -> Option<Self>;
}

impl AttrType for bool {
    const TYPE_CODE: u8 = AttrValue::BOOL;

    fn from_value(value: &AttrValue) -> Option<Self> {
        match value {
            AttrValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl AttrType for i32 {
    const TYPE_CODE: u8 = AttrValue::INT;

    fn from_value(value: &AttrValue) -> Option<Self> {
        match value {
            AttrValue::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl AttrType for f32 {
    const TYPE_CODE: u8 = AttrValue::FLOAT;

    fn from_value(value: &AttrValue) -> Option<Self> {
        match value {
            AttrValue::Float(f) => Some(*f),
            _ => None,
        }
    }
}

impl AttrType for String {
    const TYPE_CODE: u8 = AttrValue::TEXT;

    fn from_value(value: &AttrValue) -> Option<Self> {
        match value {
            AttrValue::Text(s) => Some(s.clone()),
            _ => None,
        }
    }
}

impl AttrType for Vec3 {
    const TYPE_CODE: u8 = AttrValue::VEC3;

    fn from_value(value: &AttrValue) -> Option<Self> {
        match value {
            AttrValue::Vec3(v) => Some(*v),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Slot {
    value: AttrValue,
    dirty: bool,
}

/// Fixed-slot, heterogeneously typed value list with per-slot dirty bits.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttributeList {
    slots: Vec<Slot>,
    dirty: bool,
}

impl AttributeList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Appends a slot and returns its index. The new slot starts dirty.
    pub fn add(&mut self, value: impl Into<AttrValue>) -> usize {
        self.slots.push(Slot {
            value: value.into(),
            dirty: true,
        });
        self.dirty = true;
        self.slots.len() - 1
    }

    /// Raw value at `index`, if the slot exists.
    pub fn value(&self, index: usize) -> Option<&AttrValue> {
        self.slots.get(index).map(|slot| &slot.value)
    }

    /// Typed read of a slot.
    ///
    /// # Errors
    /// `OutOfRange` for a missing slot, `TypeMismatch` when the slot holds a
    /// different type than `T`.
    pub fn get<T: AttrType>(&self, index: usize) -> Result<T, CodecError> {
        let value = self.value(index).ok_or(CodecError::OutOfRange {
            index,
            len: self.slots.len(),
        })?;
        T::from_value(value).ok_or(CodecError::TypeMismatch {
            index,
            expected: T::TYPE_CODE,
            found: value.type_code(),
        })
    }

    /// Overwrites a slot and marks it dirty. The slot keeps its type.
    pub fn set(&mut self, index: usize, value: impl Into<AttrValue>) -> Result<(), CodecError> {
        let len = self.slots.len();
        let slot = self
            .slots
            .get_mut(index)
            .ok_or(CodecError::OutOfRange { index, len })?;
        let value = value.into();
        if slot.value.type_code() != value.type_code() {
            return Err(CodecError::TypeMismatch {
                index,
                expected: slot.value.type_code(),
                found: value.type_code(),
            });
        }
        slot.value = value;
        slot.dirty = true;
        self.dirty = true;
        Ok(())
    }

    /// True if any slot changed since the last [`reset_dirty`](Self::reset_dirty).
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn is_slot_dirty(&self, index: usize) -> bool {
        self.slots.get(index).is_some_and(|slot| slot.dirty)
    }

    /// Dirty slots in index order.
    pub fn dirty_slots(&self) -> impl Iterator<Item = (usize, &AttrValue)> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.dirty)
            .map(|(i, slot)| (i, &slot.value))
    }

    pub fn reset_dirty(&mut self) {
        for slot in &mut self.slots {
            slot.dirty = false;
        }
        self.dirty = false;
    }

    /// Serializes every slot, returning the number of bytes appended to `out`.
    pub fn pack_all(&self, out: &mut Vec<u8>) -> Result<usize, CodecError> {
        self.pack(out, false)
    }

    /// Serializes only dirty slots, returning the number of bytes appended.
    pub fn pack_dirty(&self, out: &mut Vec<u8>) -> Result<usize, CodecError> {
        self.pack(out, true)
    }

    fn pack(&self, out: &mut Vec<u8>, dirty_only: bool) -> Result<usize, CodecError> {
        let selected: Vec<(usize, &AttrValue)> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| !dirty_only || slot.dirty)
            .map(|(i, slot)| (i, &slot.value))
            .collect();

        if selected.is_empty() {
            return Ok(0);
        }
        if selected.len() > u8::MAX as usize || self.slots.len() > u8::MAX as usize + 1 {
            return Err(CodecError::TooLarge(format!("{} slots", self.slots.len())));
        }

        let mut data_len = 0usize;
        for (_, value) in &selected {
            let len = value.encoded_len();
            if len > u16::MAX as usize {
                return Err(CodecError::TooLarge(format!("{len}-byte value")));
            }
            data_len += len;
        }
        if data_len > u16::MAX as usize {
            return Err(CodecError::TooLarge(format!("{data_len} data bytes")));
        }

        let mut w = Writer::new(out);
        w.put_u8(selected.len() as u8);
        w.put_u16(data_len as u16);
        for (index, value) in &selected {
            w.put_u8(*index as u8);
            w.put_u8(value.type_code());
            w.put_u16(value.encoded_len() as u16);
        }
        for (_, value) in &selected {
            value.write(&mut w);
        }
        Ok(w.written())
    }

    /// Applies a packed stream, returning the number of bytes consumed.
    ///
    /// A record for index `len()` appends a slot; a record for an existing
    /// index overwrites it. Either way the slot ends up dirty so the receiver
    /// propagates it further. The whole stream is validated before anything
    /// is applied, so a bad stream leaves the list untouched.
    pub fn unpack(&mut self, bytes: &[u8]) -> Result<usize, CodecError> {
        if bytes.is_empty() {
            return Ok(0);
        }

        let mut r = Reader::new(bytes);
        let count = r.get_u8().ok_or(CodecError::Truncated)? as usize;
        let data_len = r.get_u16().ok_or(CodecError::Truncated)? as usize;

        let mut records = Vec::with_capacity(count);
        for _ in 0..count {
            let index = r.get_u8().ok_or(CodecError::Truncated)? as usize;
            let type_code = r.get_u8().ok_or(CodecError::Truncated)?;
            let length = r.get_u16().ok_or(CodecError::Truncated)? as usize;
            records.push((index, type_code, length));
        }

        let total: usize = records.iter().map(|(_, _, len)| len).sum();
        if total != data_len {
            return Err(CodecError::BadLength {
                type_code: 0,
                length: data_len,
            });
        }

        let mut decoded = Vec::with_capacity(count);
        let mut next_len = self.slots.len();
        for (index, type_code, length) in records {
            let data = r.take(length).ok_or(CodecError::Truncated)?;
            let value = AttrValue::read(type_code, data)?;

            if index > next_len {
                return Err(CodecError::CorruptIndex { index, len: next_len });
            }
            if index == next_len {
                next_len += 1;
            } else {
                let existing = decoded
                    .iter()
                    .rev()
                    .find(|(i, _): &&(usize, AttrValue)| *i == index)
                    .map(|(_, v)| v.type_code())
                    .or_else(|| self.slots.get(index).map(|s| s.value.type_code()));
                if let Some(expected) = existing {
                    if expected != value.type_code() {
                        return Err(CodecError::TypeMismatch {
                            index,
                            expected,
                            found: value.type_code(),
                        });
                    }
                }
            }
            decoded.push((index, value));
        }

        debug_assert_eq!(HEADER_LEN + count * RECORD_LEN + data_len, r.consumed());

        for (index, value) in decoded {
            if index == self.slots.len() {
                self.slots.push(Slot { value, dirty: true });
            } else {
                self.slots[index] = Slot { value, dirty: true };
            }
        }
        self.dirty = true;
        Ok(r.consumed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    fn sample() -> AttributeList {
        let mut list = AttributeList::new();
        list.add(true);
        list.add(42);
        list.add(1.5f32);
        list.add("hello");
        list.add(Vec3::new(1.0, -2.0, 3.0));
        list
    }

    #[test]
    fn test_add_returns_indices() {
        let mut list = AttributeList::new();
        assert_eq!(list.add(1), 0);
        assert_eq!(list.add("x"), 1);
        assert_eq!(list.len(), 2);
        assert!(list.is_dirty());
    }

    #[test]
    fn test_typed_get() {
        let list = sample();
        assert!(list.get::<bool>(0).unwrap());
        assert_eq!(list.get::<i32>(1).unwrap(), 42);
        assert_relative_eq!(list.get::<f32>(2).unwrap(), 1.5);
        assert_eq!(list.get::<String>(3).unwrap(), "hello");
        assert_relative_eq!(list.get::<Vec3>(4).unwrap().y, -2.0);
    }

    #[test]
    fn test_get_errors() {
        let list = sample();
        assert_eq!(
            list.get::<i32>(0),
            Err(CodecError::TypeMismatch { index: 0, expected: AttrValue::INT, found: AttrValue::BOOL })
        );
        assert_eq!(list.get::<i32>(9), Err(CodecError::OutOfRange { index: 9, len: 5 }));
    }

    #[test]
    fn test_set_marks_dirty() {
        let mut list = sample();
        list.reset_dirty();
        assert!(!list.is_dirty());

        list.set(1, 7).unwrap();
        assert!(list.is_dirty());
        assert!(list.is_slot_dirty(1));
        assert!(!list.is_slot_dirty(0));
        assert_eq!(list.dirty_slots().map(|(i, _)| i).collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn test_set_rejects_type_change() {
        let mut list = sample();
        assert!(matches!(list.set(1, "nope"), Err(CodecError::TypeMismatch { .. })));
        assert!(matches!(list.set(5, 1), Err(CodecError::OutOfRange { .. })));
        assert_eq!(list.get::<i32>(1).unwrap(), 42);
    }

    #[test]
    fn test_empty_packs_to_nothing() {
        let mut out = Vec::new();
        assert_eq!(AttributeList::new().pack_all(&mut out).unwrap(), 0);

        let mut list = sample();
        list.reset_dirty();
        assert_eq!(list.pack_dirty(&mut out).unwrap(), 0);
        assert!(out.is_empty());
    }

    #[test]
    fn test_pack_layout() {
        let mut list = AttributeList::new();
        list.add(5);
        list.add("ab");

        let mut out = Vec::new();
        let n = list.pack_all(&mut out).unwrap();
        // header + 2 records + 4 bytes int + 2 bytes text
        assert_eq!(n, 3 + 2 * 4 + 6);
        assert_eq!(out.len(), n);
        assert_eq!(out[0], 2);
        assert_eq!(out[3], 0);
        assert_eq!(out[4], AttrValue::INT);
        assert_eq!(out[7], 1);
        assert_eq!(out[8], AttrValue::TEXT);
        assert_eq!(&out[n - 2..], b"ab");
    }

    #[test]
    fn test_unpack_round_trip() {
        let list = sample();
        let mut out = Vec::new();
        let n = list.pack_all(&mut out).unwrap();

        let mut copy = AttributeList::new();
        assert_eq!(copy.unpack(&out).unwrap(), n);
        assert_eq!(copy, list);
    }

    #[test]
    fn test_unpack_appends_at_end_only() {
        let mut source = AttributeList::new();
        source.add(1);
        source.add(2);
        source.reset_dirty();
        source.set(1, 3).unwrap();

        let mut diff = Vec::new();
        source.pack_dirty(&mut diff).unwrap();

        let mut empty = AttributeList::new();
        assert_eq!(empty.unpack(&diff), Err(CodecError::CorruptIndex { index: 1, len: 0 }));
        assert!(empty.is_empty());
    }

    #[test]
    fn test_unpack_type_mismatch_is_atomic() {
        let mut receiver = AttributeList::new();
        receiver.add(1);
        receiver.add(2);
        receiver.reset_dirty();

        let mut sender = AttributeList::new();
        sender.add(9);
        sender.add("text");
        let mut bytes = Vec::new();
        sender.pack_all(&mut bytes).unwrap();

        assert!(matches!(receiver.unpack(&bytes), Err(CodecError::TypeMismatch { index: 1, .. })));
        assert_eq!(receiver.get::<i32>(0).unwrap(), 1);
        assert!(!receiver.is_dirty());
    }

    #[test]
    fn test_unpack_truncated() {
        let mut out = Vec::new();
        sample().pack_all(&mut out).unwrap();
        out.truncate(out.len() - 1);

        let mut copy = AttributeList::new();
        assert_eq!(copy.unpack(&out), Err(CodecError::Truncated));
        assert!(copy.is_empty());
    }

    #[test]
    fn test_unpack_unknown_type() {
        let mut list = AttributeList::new();
        list.add(1);
        let mut out = Vec::new();
        list.pack_all(&mut out).unwrap();
        out[4] = 9;

        assert_eq!(AttributeList::new().unpack(&out), Err(CodecError::UnknownType(9)));
    }

    #[test]
    fn test_unpack_rejects_invalid_text() {
        let mut list = AttributeList::new();
        list.add("hi");
        let mut out = Vec::new();
        list.pack_all(&mut out).unwrap();
        out[7] = 0xFF;

        let mut copy = AttributeList::new();
        assert_eq!(copy.unpack(&out), Err(CodecError::InvalidText));
        assert!(copy.is_empty());
    }

    fn arb_value() -> impl Strategy<Value = AttrValue> {
        prop_oneof![
            any::<bool>().prop_map(AttrValue::Bool),
            any::<i32>().prop_map(AttrValue::Int),
            (-1.0e6f32..1.0e6).prop_map(AttrValue::Float),
            "[a-z]{0,12}".prop_map(AttrValue::Text),
            (-100.0f32..100.0, -100.0f32..100.0, -100.0f32..100.0)
                .prop_map(|(x, y, z)| AttrValue::Vec3(Vec3::new(x, y, z))),
        ]
    }

    fn same_type(template: &AttrValue, seed: &AttrValue) -> AttrValue {
        match (template, seed) {
            (a, b) if a.type_code() == b.type_code() => b.clone(),
            (AttrValue::Bool(b), _) => AttrValue::Bool(!b),
            (AttrValue::Int(i), _) => AttrValue::Int(i.wrapping_add(1)),
            (AttrValue::Float(f), _) => AttrValue::Float(f + 1.0),
            (AttrValue::Text(s), _) => AttrValue::Text(format!("{s}!")),
            (AttrValue::Vec3(v), _) => AttrValue::Vec3(v * 2.0),
        }
    }

    proptest! {
        #[test]
        fn prop_dirty_diff_converges(
            initial in prop::collection::vec(arb_value(), 1..12),
            edits in prop::collection::vec((0usize..12, arb_value()), 0..24),
        ) {
            let mut source = AttributeList::new();
            for value in &initial {
                source.add(value.clone());
            }

            let mut snapshot = Vec::new();
            source.pack_all(&mut snapshot).unwrap();
            let mut replica = AttributeList::new();
            replica.unpack(&snapshot).unwrap();
            source.reset_dirty();

            for (index, seed) in edits {
                let index = index % initial.len();
                let value = same_type(&initial[index], &seed);
                source.set(index, value).unwrap();
            }

            let mut diff = Vec::new();
            source.pack_dirty(&mut diff).unwrap();
            replica.unpack(&diff).unwrap();

            for i in 0..source.len() {
                prop_assert_eq!(replica.value(i), source.value(i));
            }
        }

        #[test]
        fn prop_pack_all_round_trip(values in prop::collection::vec(arb_value(), 0..20)) {
            let mut list = AttributeList::new();
            for value in values {
                list.add(value);
            }
            let mut out = Vec::new();
            let n = list.pack_all(&mut out).unwrap();

            let mut copy = AttributeList::new();
            prop_assert_eq!(copy.unpack(&out).unwrap(), n);
            prop_assert_eq!(copy, list);
        }
    }
}
