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

//! Sorted partition index mapping key tuples to byte offsets in the
//! companion data file.
//!
//! Written once by the producing task, opened read-only per request. Format:
//!
//! ```text
//! [8]  magic  "TSRIDX01"
//! [2]  u16    key field count N
//! [N]  u8     key field type tags
//! [8]  u64    entry count E
//! E × { [4] u32 key length, [..] encoded key tuple, [8] u64 data offset }
//! ```
//!
//! - All integers are little-endian
//! - Keys are strictly increasing under the schema comparator
//! - Offsets are monotonically non-decreasing

use std::cmp::Ordering;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use log::debug;

use crate::error::{Result, ShuffleError};
use crate::key::{KeySchema, KeyTuple, KeyType};

const INDEX_MAGIC: [u8; 8] = *b"TSRIDX01";

/// Read-only view of a partition index, fully loaded at open.
///
/// A reader is opened per request and released on drop; nothing is cached
/// across requests.
#[derive(Debug)]
pub struct IndexReader {
    schema: KeySchema,
    entries: Vec<(KeyTuple, u64)>,
}

impl IndexReader {
    /// Opens and loads an index file.
    ///
    /// Fails with [`ShuffleError::IndexUnreadable`] when the file is absent,
    /// truncated, or has an incompatible layout.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            ShuffleError::IndexUnreadable(format!(
                "cannot open index at {}: {e}",
                path.display()
            ))
        })?;
        let mut reader = BufReader::new(file);

        let magic: [u8; 8] = read_array(&mut reader, path)?;
        if magic != INDEX_MAGIC {
            return Err(ShuffleError::IndexUnreadable(format!(
                "bad magic in index at {}",
                path.display()
            )));
        }

        let field_count =
            u16::from_le_bytes(read_array(&mut reader, path)?) as usize;
        let mut fields = Vec::with_capacity(field_count);
        for _ in 0..field_count {
            let tag: [u8; 1] = read_array(&mut reader, path)?;
            fields.push(KeyType::from_tag(tag[0])?);
        }
        let schema = KeySchema::new(fields);

        let entry_count = u64::from_le_bytes(read_array(&mut reader, path)?);
        let mut entries = Vec::with_capacity(entry_count.min(1 << 20) as usize);
        for _ in 0..entry_count {
            let key_len =
                u32::from_le_bytes(read_array(&mut reader, path)?) as usize;
            let mut key_bytes = vec![0u8; key_len];
            reader.read_exact(&mut key_bytes).map_err(|e| {
                ShuffleError::IndexUnreadable(format!(
                    "truncated index entry in {}: {e}",
                    path.display()
                ))
            })?;
            let key = schema.decode(&key_bytes).map_err(|e| {
                ShuffleError::IndexUnreadable(format!(
                    "undecodable index key in {}: {e}",
                    path.display()
                ))
            })?;
            let offset = u64::from_le_bytes(read_array(&mut reader, path)?);
            entries.push((key, offset));
        }

        debug!(
            "loaded index {} ({} entries, {} key fields)",
            path.display(),
            entries.len(),
            schema.fields().len()
        );

        Ok(Self { schema, entries })
    }

    /// Key schema stored in the index header, used to decode request
    /// boundary keys.
    pub fn key_schema(&self) -> &KeySchema {
        &self.schema
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Minimum indexed key, `None` iff the index has no entries.
    pub fn first_key(&self) -> Option<&KeyTuple> {
        self.entries.first().map(|(k, _)| k)
    }

    /// Maximum indexed key, `None` iff the index has no entries.
    pub fn last_key(&self) -> Option<&KeyTuple> {
        self.entries.last().map(|(k, _)| k)
    }

    /// Looks up the byte offset for a key.
    ///
    /// With `higher` unset, only an exact key match is returned. With
    /// `higher` set, the offset of the first entry whose key is strictly
    /// greater than `key` is returned — the approximate-match mode used
    /// when a requested key falls in an index gap.
    pub fn find(&self, key: &KeyTuple, higher: bool) -> Option<u64> {
        if higher {
            let idx = self
                .entries
                .partition_point(|(k, _)| self.schema.compare(k, key) != Ordering::Greater);
            self.entries.get(idx).map(|(_, offset)| *offset)
        } else {
            self.entries
                .binary_search_by(|(k, _)| self.schema.compare(k, key))
                .ok()
                .map(|idx| self.entries[idx].1)
        }
    }
}

/// Producer-side writer for the index format above.
#[derive(Debug)]
pub struct IndexWriter {
    schema: KeySchema,
    entries: Vec<(KeyTuple, u64)>,
}

impl IndexWriter {
    pub fn new(schema: KeySchema) -> Self {
        Self {
            schema,
            entries: Vec::new(),
        }
    }

    /// Appends an entry. Keys must be strictly increasing and offsets
    /// monotonically non-decreasing.
    pub fn add(&mut self, key: KeyTuple, offset: u64) -> Result<()> {
        if let Some((last_key, last_offset)) = self.entries.last() {
            if self.schema.compare(&key, last_key) != Ordering::Greater {
                return Err(ShuffleError::General(format!(
                    "index keys must be strictly increasing: {key} after {last_key}"
                )));
            }
            if offset < *last_offset {
                return Err(ShuffleError::General(format!(
                    "index offsets must not decrease: {offset} after {last_offset}"
                )));
            }
        }
        self.entries.push((key, offset));
        Ok(())
    }

    /// Writes the index to a file.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let file = File::create(path).map_err(ShuffleError::IoError)?;
        let mut writer = BufWriter::new(file);

        writer.write_all(&INDEX_MAGIC)?;
        writer.write_all(&(self.schema.fields().len() as u16).to_le_bytes())?;
        for field in self.schema.fields() {
            writer.write_all(&[field.tag()])?;
        }
        writer.write_all(&(self.entries.len() as u64).to_le_bytes())?;
        for (key, offset) in &self.entries {
            let key_bytes = self.schema.encode(key)?;
            writer.write_all(&(key_bytes.len() as u32).to_le_bytes())?;
            writer.write_all(&key_bytes)?;
            writer.write_all(&offset.to_le_bytes())?;
        }

        writer.flush().map_err(ShuffleError::IoError)?;
        Ok(())
    }
}

fn read_array<R: Read, const N: usize>(reader: &mut R, path: &Path) -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    reader.read_exact(&mut buf).map_err(|e| {
        ShuffleError::IndexUnreadable(format!(
            "truncated index at {}: {e}",
            path.display()
        ))
    })?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::KeyValue;
    use tempfile::TempDir;

    fn int64_schema() -> KeySchema {
        KeySchema::new(vec![KeyType::Int64])
    }

    fn int64_key(v: i64) -> KeyTuple {
        KeyTuple::new(vec![KeyValue::Int64(v)])
    }

    fn write_index(path: &Path, entries: &[(i64, u64)]) {
        let mut writer = IndexWriter::new(int64_schema());
        for (key, offset) in entries {
            writer.add(int64_key(*key), *offset).unwrap();
        }
        writer.write_to_file(path).unwrap();
    }

    #[test]
    fn test_write_and_read() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("index");
        write_index(&path, &[(1, 0), (5, 100), (9, 300)]);

        let reader = IndexReader::open(&path).unwrap();
        assert_eq!(reader.entry_count(), 3);
        assert_eq!(reader.first_key(), Some(&int64_key(1)));
        assert_eq!(reader.last_key(), Some(&int64_key(9)));
        assert_eq!(reader.key_schema(), &int64_schema());
    }

    #[test]
    fn test_empty_index_has_no_keys() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("index");
        write_index(&path, &[]);

        let reader = IndexReader::open(&path).unwrap();
        assert_eq!(reader.entry_count(), 0);
        assert!(reader.first_key().is_none());
        assert!(reader.last_key().is_none());
    }

    #[test]
    fn test_find_exact_and_higher() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("index");
        write_index(&path, &[(1, 0), (5, 100), (9, 300)]);
        let reader = IndexReader::open(&path).unwrap();

        // exact mode hits only stored keys
        assert_eq!(reader.find(&int64_key(5), false), Some(100));
        assert_eq!(reader.find(&int64_key(4), false), None);
        assert_eq!(reader.find(&int64_key(20), false), None);

        // higher mode returns the first strictly-greater entry
        assert_eq!(reader.find(&int64_key(4), true), Some(100));
        assert_eq!(reader.find(&int64_key(5), true), Some(300));
        assert_eq!(reader.find(&int64_key(0), true), Some(0));
        assert_eq!(reader.find(&int64_key(9), true), None);
    }

    #[test]
    fn test_find_is_monotonic() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("index");
        write_index(&path, &[(2, 0), (4, 50), (8, 120), (16, 400)]);
        let reader = IndexReader::open(&path).unwrap();

        let mut last = 0u64;
        for k in 0..20 {
            if let Some(offset) = reader.find(&int64_key(k), false) {
                assert!(offset >= last);
                last = offset;
            }
        }
    }

    #[test]
    fn test_open_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let err = IndexReader::open(&temp_dir.path().join("absent")).unwrap_err();
        assert!(matches!(err, ShuffleError::IndexUnreadable(_)));
    }

    #[test]
    fn test_open_bad_magic() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("index");
        std::fs::write(&path, b"NOTANIDXFILE....").unwrap();
        let err = IndexReader::open(&path).unwrap_err();
        assert!(matches!(err, ShuffleError::IndexUnreadable(_)));
    }

    #[test]
    fn test_open_truncated() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("index");
        write_index(&path, &[(1, 0), (5, 100)]);
        let full = std::fs::read(&path).unwrap();
        std::fs::write(&path, &full[..full.len() - 4]).unwrap();

        let err = IndexReader::open(&path).unwrap_err();
        assert!(matches!(err, ShuffleError::IndexUnreadable(_)));
    }

    #[test]
    fn test_writer_rejects_out_of_order() {
        let mut writer = IndexWriter::new(int64_schema());
        writer.add(int64_key(5), 100).unwrap();
        assert!(writer.add(int64_key(5), 200).is_err());
        assert!(writer.add(int64_key(3), 200).is_err());
        assert!(writer.add(int64_key(9), 50).is_err());
        writer.add(int64_key(9), 300).unwrap();
    }
}
