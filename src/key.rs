// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! Typed key tuples and the schema-defined comparator used by the sorted
//! partition index.
//!
//! A key is a tuple of typed values encoded field by field in schema order.
//! The same encoding is stored in index entries and carried (base64-encoded)
//! in the `start`/`end` parameters of range-shuffle requests, so both sides
//! compare keys identically.
//!
//! Field encodings are little-endian:
//!
//! ```text
//! Int32   [4]  i32
//! Int64   [8]  i64
//! Float64 [8]  IEEE-754 bits
//! Utf8    [4]  u32 byte length, then UTF-8 bytes
//! ```

use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

use crate::error::{Result, ShuffleError};

/// Field type of a key column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    Int32,
    Int64,
    Float64,
    Utf8,
}

impl KeyType {
    /// On-disk tag used in the index header.
    pub fn tag(&self) -> u8 {
        match self {
            KeyType::Int32 => 0,
            KeyType::Int64 => 1,
            KeyType::Float64 => 2,
            KeyType::Utf8 => 3,
        }
    }

    /// Inverse of [`KeyType::tag`].
    pub fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(KeyType::Int32),
            1 => Ok(KeyType::Int64),
            2 => Ok(KeyType::Float64),
            3 => Ok(KeyType::Utf8),
            other => Err(ShuffleError::IndexUnreadable(format!(
                "unknown key type tag: {other}"
            ))),
        }
    }
}

/// A single decoded key field.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyValue {
    Int32(i32),
    Int64(i64),
    Float64(f64),
    Utf8(String),
}

impl Display for KeyValue {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            KeyValue::Int32(v) => write!(f, "{v}"),
            KeyValue::Int64(v) => write!(f, "{v}"),
            KeyValue::Float64(v) => write!(f, "{v}"),
            KeyValue::Utf8(v) => write!(f, "{v:?}"),
        }
    }
}

/// A decoded key tuple, ordered by a [`KeySchema`] comparator.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyTuple {
    values: Vec<KeyValue>,
}

impl KeyTuple {
    pub fn new(values: Vec<KeyValue>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[KeyValue] {
        &self.values
    }
}

impl Display for KeyTuple {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "(")?;
        for (i, v) in self.values.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{v}")?;
        }
        write!(f, ")")
    }
}

/// Ordered list of key field types, with the tuple codec and comparator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySchema {
    fields: Vec<KeyType>,
}

impl KeySchema {
    pub fn new(fields: Vec<KeyType>) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &[KeyType] {
        &self.fields
    }

    /// Encodes a tuple in schema order.
    ///
    /// Fails when the tuple's arity or field types do not match the schema.
    pub fn encode(&self, tuple: &KeyTuple) -> Result<Vec<u8>> {
        if tuple.values.len() != self.fields.len() {
            return Err(ShuffleError::General(format!(
                "key tuple has {} fields, schema expects {}",
                tuple.values.len(),
                self.fields.len()
            )));
        }
        let mut out = Vec::new();
        for (value, field) in tuple.values.iter().zip(self.fields.iter()) {
            match (value, field) {
                (KeyValue::Int32(v), KeyType::Int32) => {
                    out.extend_from_slice(&v.to_le_bytes())
                }
                (KeyValue::Int64(v), KeyType::Int64) => {
                    out.extend_from_slice(&v.to_le_bytes())
                }
                (KeyValue::Float64(v), KeyType::Float64) => {
                    out.extend_from_slice(&v.to_le_bytes())
                }
                (KeyValue::Utf8(v), KeyType::Utf8) => {
                    out.extend_from_slice(&(v.len() as u32).to_le_bytes());
                    out.extend_from_slice(v.as_bytes());
                }
                (value, field) => {
                    return Err(ShuffleError::General(format!(
                        "key value {value} does not match schema field {field:?}"
                    )))
                }
            }
        }
        Ok(out)
    }

    /// Decodes a tuple, requiring the input to be consumed exactly.
    pub fn decode(&self, bytes: &[u8]) -> Result<KeyTuple> {
        let mut pos = 0usize;
        let mut values = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            let value = match field {
                KeyType::Int32 => {
                    KeyValue::Int32(i32::from_le_bytes(read_array(bytes, &mut pos)?))
                }
                KeyType::Int64 => {
                    KeyValue::Int64(i64::from_le_bytes(read_array(bytes, &mut pos)?))
                }
                KeyType::Float64 => {
                    KeyValue::Float64(f64::from_le_bytes(read_array(bytes, &mut pos)?))
                }
                KeyType::Utf8 => {
                    let len =
                        u32::from_le_bytes(read_array(bytes, &mut pos)?) as usize;
                    let raw = read_slice(bytes, &mut pos, len)?;
                    let text = std::str::from_utf8(raw).map_err(|e| {
                        ShuffleError::General(format!("key field is not UTF-8: {e}"))
                    })?;
                    KeyValue::Utf8(text.to_string())
                }
            };
            values.push(value);
        }
        if pos != bytes.len() {
            return Err(ShuffleError::General(format!(
                "{} trailing bytes after decoding key tuple",
                bytes.len() - pos
            )));
        }
        Ok(KeyTuple::new(values))
    }

    /// Compares two tuples field-wise in schema order. The first non-equal
    /// field decides; floats use IEEE total order.
    ///
    /// # Panics
    /// Panics if either tuple was not produced by this schema.
    pub fn compare(&self, a: &KeyTuple, b: &KeyTuple) -> Ordering {
        assert_eq!(a.values.len(), self.fields.len(), "key arity mismatch");
        assert_eq!(b.values.len(), self.fields.len(), "key arity mismatch");
        for (left, right) in a.values.iter().zip(b.values.iter()) {
            let ord = match (left, right) {
                (KeyValue::Int32(l), KeyValue::Int32(r)) => l.cmp(r),
                (KeyValue::Int64(l), KeyValue::Int64(r)) => l.cmp(r),
                (KeyValue::Float64(l), KeyValue::Float64(r)) => l.total_cmp(r),
                (KeyValue::Utf8(l), KeyValue::Utf8(r)) => l.cmp(r),
                _ => panic!("key tuple does not match schema"),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}

fn read_array<const N: usize>(bytes: &[u8], pos: &mut usize) -> Result<[u8; N]> {
    let slice = read_slice(bytes, pos, N)?;
    let mut out = [0u8; N];
    out.copy_from_slice(slice);
    Ok(out)
}

fn read_slice<'a>(bytes: &'a [u8], pos: &mut usize, len: usize) -> Result<&'a [u8]> {
    let end = pos.checked_add(len).filter(|end| *end <= bytes.len());
    match end {
        Some(end) => {
            let slice = &bytes[*pos..end];
            *pos = end;
            Ok(slice)
        }
        None => Err(ShuffleError::General(
            "truncated key tuple encoding".to_string(),
        )),
    }
}
