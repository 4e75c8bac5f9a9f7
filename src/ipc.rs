//! Typed property map marshalled through a shared memory segment.
//!
//! Cross-process state (the per-level tile status maps) is flattened into
//! named, typed, multi-dimensional properties. Scalars are stored as a
//! `u64` with bit-casting for `f64` and `bool`; strings live in a side
//! slot of the same variant. The segment itself is modelled as a byte
//! budget charged by property allocation, so exhaustion surfaces as
//! `CacheError::BadAlloc` exactly where an in-segment allocator would
//! have failed.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, CacheResult};

/// Types a property value can take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IpcValueType {
    Bool,
    I32,
    U32,
    U64,
    F64,
    Str,
}

/// One element of a property: a raw scalar plus an optional string slot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct IpcValue {
    scalar: u64,
    text: Option<String>,
}

/// A named property: a type tag and a vector of values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpcProperty {
    ty: IpcValueType,
    values: Vec<IpcValue>,
}

impl IpcProperty {
    fn new(ty: IpcValueType) -> Self {
        Self { ty, values: Vec::new() }
    }

    pub fn value_type(&self) -> IpcValueType {
        self.ty
    }

    /// Number of dimensions (elements) currently held.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn resize(&mut self, n: usize) {
        self.values.resize(n, IpcValue::default());
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    pub fn get_bool(&self, index: usize) -> Option<bool> {
        if self.ty != IpcValueType::Bool {
            return None;
        }
        self.values.get(index).map(|v| v.scalar != 0)
    }

    pub fn set_bool(&mut self, index: usize, value: bool) {
        debug_assert_eq!(self.ty, IpcValueType::Bool);
        self.values[index].scalar = value as u64;
    }

    pub fn get_i32(&self, index: usize) -> Option<i32> {
        if self.ty != IpcValueType::I32 {
            return None;
        }
        self.values.get(index).map(|v| v.scalar as u32 as i32)
    }

    pub fn set_i32(&mut self, index: usize, value: i32) {
        debug_assert_eq!(self.ty, IpcValueType::I32);
        self.values[index].scalar = value as u32 as u64;
    }

    pub fn get_u32(&self, index: usize) -> Option<u32> {
        if self.ty != IpcValueType::U32 {
            return None;
        }
        self.values.get(index).map(|v| v.scalar as u32)
    }

    pub fn set_u32(&mut self, index: usize, value: u32) {
        debug_assert_eq!(self.ty, IpcValueType::U32);
        self.values[index].scalar = value as u64;
    }

    pub fn get_u64(&self, index: usize) -> Option<u64> {
        if self.ty != IpcValueType::U64 {
            return None;
        }
        self.values.get(index).map(|v| v.scalar)
    }

    pub fn set_u64(&mut self, index: usize, value: u64) {
        debug_assert_eq!(self.ty, IpcValueType::U64);
        self.values[index].scalar = value;
    }

    pub fn get_f64(&self, index: usize) -> Option<f64> {
        if self.ty != IpcValueType::F64 {
            return None;
        }
        self.values.get(index).map(|v| f64::from_bits(v.scalar))
    }

    pub fn set_f64(&mut self, index: usize, value: f64) {
        debug_assert_eq!(self.ty, IpcValueType::F64);
        self.values[index].scalar = value.to_bits();
    }

    pub fn get_str(&self, index: usize) -> Option<&str> {
        if self.ty != IpcValueType::Str {
            return None;
        }
        self.values.get(index).and_then(|v| v.text.as_deref())
    }

    pub fn set_str(&mut self, index: usize, value: &str) {
        debug_assert_eq!(self.ty, IpcValueType::Str);
        self.values[index].text = Some(value.to_owned());
    }

    /// Approximate footprint of this property in the segment.
    fn footprint(&self) -> usize {
        let strings: usize = self
            .values
            .iter()
            .map(|v| v.text.as_ref().map_or(0, |s| s.len()))
            .sum();
        self.values.len() * std::mem::size_of::<u64>() * 2 + strings
    }
}

/// Named property container, ordered so serialization is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IpcPropertyMap {
    properties: BTreeMap<String, IpcProperty>,
}

impl IpcPropertyMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the existing property, or inserts a fresh empty one.
    /// Requesting an existing name with a different type is a programmer
    /// error.
    pub fn get_or_create(&mut self, name: &str, ty: IpcValueType) -> CacheResult<&mut IpcProperty> {
        let prop = self
            .properties
            .entry(name.to_owned())
            .or_insert_with(|| IpcProperty::new(ty));
        if prop.ty != ty {
            debug_assert!(false, "property {name} requested with mismatched type");
            return Err(CacheError::failed(format!(
                "property {name} exists with a different type"
            )));
        }
        Ok(prop)
    }

    pub fn get(&self, name: &str) -> Option<&IpcProperty> {
        self.properties.get(name)
    }

    pub fn remove(&mut self, name: &str) {
        self.properties.remove(name);
    }

    pub fn clear(&mut self) {
        self.properties.clear();
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    fn footprint(&self) -> usize {
        const PER_PROPERTY_OVERHEAD: usize = 64;
        self.properties
            .iter()
            .map(|(name, p)| name.len() + p.footprint() + PER_PROPERTY_OVERHEAD)
            .sum()
    }
}

/// Default byte budget of a segment; matches the table-of-content slice the
/// cache reserves per entry.
pub const DEFAULT_SEGMENT_CAPACITY: usize = 1 << 20;

/// A capacity-bounded region holding one entry's property map.
///
/// `commit_budget` must be called after mutating the map; it fails with
/// `BadAlloc` when the map no longer fits, at which point the caller is
/// expected to drop the in-flight properties it was building.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentStorage {
    capacity: usize,
    map: IpcPropertyMap,
}

impl SegmentStorage {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, map: IpcPropertyMap::new() }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn map(&self) -> &IpcPropertyMap {
        &self.map
    }

    pub fn map_mut(&mut self) -> &mut IpcPropertyMap {
        &mut self.map
    }

    /// Verify the map still fits in the segment.
    pub fn commit_budget(&self) -> CacheResult<()> {
        if self.map.footprint() > self.capacity {
            Err(CacheError::BadAlloc)
        } else {
            Ok(())
        }
    }

    /// Serialized form for mirroring into an actual mapped region.
    pub fn to_bytes(&self) -> CacheResult<Vec<u8>> {
        let bytes = serde_json::to_vec(self).map_err(|e| CacheError::failed(e.to_string()))?;
        if bytes.len() > self.capacity {
            return Err(CacheError::BadAlloc);
        }
        Ok(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> CacheResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| CacheError::failed(e.to_string()))
    }
}

impl Default for SegmentStorage {
    fn default() -> Self {
        Self::new(DEFAULT_SEGMENT_CAPACITY)
    }
}
