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

//! Resolution of a requested key range into a byte span of the partition
//! data file, using the sorted index.
//!
//! Producers may sample keys sparsely, so a requested boundary key is not
//! required to hit an indexed entry: each lookup first tries an exact match
//! and then falls back to the first strictly-greater entry. A `final`
//! request, or an end key beyond the last indexed key, clamps the end of the
//! span to the physical length of the data file.

use std::cmp::Ordering;
use std::path::Path;

use log::{debug, error, warn};

use crate::chunk::FileChunk;
use crate::error::{Result, ShuffleError};
use crate::index::IndexReader;
use crate::key::KeyTuple;
use crate::workdir::{DATA_FILE_NAME, INDEX_FILE_NAME};

/// Resolves `[start, end]` (schema-serialized boundary keys) against the
/// index in `out_dir`, returning the byte span to serve from the partition
/// data file, or `None` when the request does not intersect stored data.
pub fn resolve_range(
    out_dir: &Path,
    start_bytes: &[u8],
    end_bytes: &[u8],
    is_final: bool,
) -> Result<Option<FileChunk>> {
    let index = IndexReader::open(&out_dir.join(INDEX_FILE_NAME))?;
    let data_path = out_dir.join(DATA_FILE_NAME);
    let schema = index.key_schema();

    let start = schema.decode(start_bytes).map_err(|e| {
        ShuffleError::InvalidRequest(format!("undecodable start key: {e}"))
    })?;
    let end = schema.decode(end_bytes).map_err(|e| {
        ShuffleError::InvalidRequest(format!("undecodable end key: {e}"))
    })?;

    let (first, last) = match (index.first_key(), index.last_key()) {
        (Some(first), Some(last)) => (first.clone(), last.clone()),
        // zero rows were produced: a valid empty outcome
        _ => {
            debug!("index at {} has no entries", out_dir.display());
            return Ok(None);
        }
    };

    if schema.compare(&end, &first) == Ordering::Less
        || schema.compare(&last, &start) == Ordering::Less
    {
        warn!(
            "out of scope: indexed data [{first}, {last}], requested start: {start}, end: {end}"
        );
        return Ok(None);
    }

    let start_offset = match index
        .find(&start, false)
        .or_else(|| index.find(&start, true))
    {
        Some(offset) => offset,
        None => {
            // the intersection check above proved overlap, so a missing
            // start offset is a server-side inconsistency
            let dump = state_dump(&start, &end, &first, &last);
            error!("start offset not found; {dump}");
            return Err(ShuffleError::IndexState(format!(
                "start offset not found; {dump}"
            )));
        }
    };

    let mut end_offset = index.find(&end, false).or_else(|| index.find(&end, true));

    if is_final || (end_offset.is_none() && schema.compare(&last, &end) == Ordering::Less)
    {
        // the caller requested through end of partition
        let len = std::fs::metadata(&data_path)
            .map_err(|e| {
                ShuffleError::General(format!(
                    "cannot stat data file {}: {e}",
                    data_path.display()
                ))
            })?
            .len();
        end_offset = Some(len);
    }

    let end_offset = match end_offset {
        Some(offset) => offset,
        None => {
            let dump = state_dump(&start, &end, &first, &last);
            error!("end offset not found; {dump}");
            return Err(ShuffleError::IndexState(format!(
                "end offset not found; {dump}"
            )));
        }
    };

    let length = match end_offset.checked_sub(start_offset) {
        Some(length) => length,
        None => {
            let dump = state_dump(&start, &end, &first, &last);
            error!(
                "negative chunk length ({start_offset} > {end_offset}); {dump}"
            );
            return Err(ShuffleError::IndexState(format!(
                "negative chunk length ({start_offset} > {end_offset}); {dump}"
            )));
        }
    };

    if length == 0 {
        return Ok(None);
    }

    let chunk = FileChunk::new(data_path, start_offset, length);
    debug!("resolved chunk: {chunk}");
    Ok(Some(chunk))
}

fn state_dump(start: &KeyTuple, end: &KeyTuple, first: &KeyTuple, last: &KeyTuple) -> String {
    format!(
        "state dump (requested range: [{start}, {end}), idx min: {first}, idx max: {last})"
    )
}
