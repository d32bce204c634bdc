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

//! Typed shuffle requests parsed from HTTP query parameters.

use crate::error::{Result, ShuffleError};
use crate::http::HttpRequest;
use crate::workdir::is_safe_component;

/// How the upstream stage partitioned its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShuffleMode {
    /// Sorted key ranges; consumers fetch by `[start, end]` key range.
    Range,
    /// One complete file per hash bucket.
    Hash,
    /// Hash partitioning scattered across multiple files per bucket.
    ScatteredHash,
}

impl ShuffleMode {
    fn from_code(code: &str) -> Option<Self> {
        match code {
            "r" => Some(ShuffleMode::Range),
            "h" => Some(ShuffleMode::Hash),
            "s" => Some(ShuffleMode::ScatteredHash),
            _ => None,
        }
    }
}

/// A fully validated shuffle request, consumed within one request/response
/// cycle.
#[derive(Debug, Clone)]
pub struct ShuffleRequest {
    pub mode: ShuffleMode,
    pub query_id: String,
    pub stage_id: String,
    pub partition_id: String,
    /// Source task ids in request order.
    pub task_ids: Vec<String>,
    /// Schema-serialized start boundary key (range mode).
    pub start_key: Option<Vec<u8>>,
    /// Schema-serialized end boundary key (range mode).
    pub end_key: Option<Vec<u8>>,
    /// Clamp the end of the range to the end of the partition.
    pub is_final: bool,
}

impl ShuffleRequest {
    /// Parses and validates the query parameters of a shuffle GET.
    pub fn parse(req: &HttpRequest) -> Result<Self> {
        let types = req.param_values("type");
        let qids = req.param_values("qid");
        let sids = req.param_values("sid");
        let parts = req.param_values("p");
        let task_lists = req.param_values("ta");

        if types.is_empty()
            || qids.is_empty()
            || sids.is_empty()
            || parts.is_empty()
            || task_lists.is_empty()
        {
            return Err(ShuffleError::InvalidRequest(
                "required query parameters: type, qid, sid, p, ta".to_string(),
            ));
        }
        if types.len() != 1 || qids.len() != 1 || sids.len() != 1 {
            return Err(ShuffleError::InvalidRequest(
                "type, qid, and sid must each be given exactly once".to_string(),
            ));
        }

        let mode = ShuffleMode::from_code(types[0]).ok_or_else(|| {
            ShuffleError::InvalidRequest(format!("unknown shuffle type: {}", types[0]))
        })?;

        let query_id = qids[0].to_string();
        let stage_id = sids[0].to_string();
        let partition_id = parts[0].to_string();

        let task_ids: Vec<String> = task_lists
            .iter()
            .flat_map(|list| list.split(','))
            .filter(|id| !id.is_empty())
            .map(ToString::to_string)
            .collect();
        if task_ids.is_empty() {
            return Err(ShuffleError::InvalidRequest(
                "at least one source task id is required".to_string(),
            ));
        }

        for component in [&query_id, &stage_id, &partition_id]
            .into_iter()
            .chain(task_ids.iter())
        {
            if !is_safe_component(component) {
                return Err(ShuffleError::InvalidRequest(format!(
                    "illegal path component in request: {component:?}"
                )));
            }
        }

        let (start_key, end_key, is_final) = match mode {
            ShuffleMode::Range => {
                if task_ids.len() != 1 {
                    return Err(ShuffleError::InvalidRequest(format!(
                        "range shuffle requires exactly one source task id, got {}",
                        task_ids.len()
                    )));
                }
                let start = decode_boundary_key(req, "start")?;
                let end = decode_boundary_key(req, "end")?;
                (Some(start), Some(end), req.has_param("final"))
            }
            ShuffleMode::Hash | ShuffleMode::ScatteredHash => (None, None, false),
        };

        Ok(Self {
            mode,
            query_id,
            stage_id,
            partition_id,
            task_ids,
            start_key,
            end_key,
            is_final,
        })
    }
}

fn decode_boundary_key(req: &HttpRequest, name: &str) -> Result<Vec<u8>> {
    let values = req.param_values(name);
    let encoded = values.first().ok_or_else(|| {
        ShuffleError::InvalidRequest(format!(
            "range shuffle requires the {name} parameter"
        ))
    })?;
    base64::decode(encoded).map_err(|e| {
        ShuffleError::InvalidRequest(format!("{name} key is not valid base64: {e}"))
    })
}
