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

//! Local working-directory allocation and the on-disk layout of task
//! output.
//!
//! Task output lives under one or more configured base directories:
//!
//! ```text
//! {base}/{queryId}/output/{stageId}/{taskId}/output/         range mode
//!     ├── output   partition data file
//!     └── index    sorted key index
//! {base}/{queryId}/output/{stageId}/{taskId}/output/{p}      hash modes
//! ```
//!
//! A relative path resolves to the first base directory that contains it.

use std::path::PathBuf;

/// Data file name inside a range-partition output directory.
pub const DATA_FILE_NAME: &str = "output";

/// Index file name inside a range-partition output directory.
pub const INDEX_FILE_NAME: &str = "index";

/// Resolves relative output paths against the configured base directories.
#[derive(Debug, Clone)]
pub struct LocalDirAllocator {
    base_dirs: Vec<PathBuf>,
}

impl LocalDirAllocator {
    pub fn new<I, P>(base_dirs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            base_dirs: base_dirs.into_iter().map(Into::into).collect(),
        }
    }

    /// Returns true if the relative path exists under any base directory.
    pub fn path_exists(&self, relative: &str) -> bool {
        self.path_to_read(relative).is_some()
    }

    /// Returns the first absolute path at which the relative path exists.
    pub fn path_to_read(&self, relative: &str) -> Option<PathBuf> {
        self.base_dirs.iter().find_map(|base| {
            let candidate = base.join(relative);
            candidate.exists().then_some(candidate)
        })
    }

    pub fn base_dirs(&self) -> &[PathBuf] {
        &self.base_dirs
    }
}

/// Relative path of a range-shuffle output directory.
pub fn range_output_dir(query_id: &str, stage_id: &str, task_id: &str) -> String {
    format!("{query_id}/output/{stage_id}/{task_id}/output")
}

/// Relative path of a hash-shuffle partition file.
pub fn hash_partition_file(
    query_id: &str,
    stage_id: &str,
    task_id: &str,
    partition_id: &str,
) -> String {
    format!("{query_id}/output/{stage_id}/{task_id}/output/{partition_id}")
}

/// Returns true when a request-supplied path component cannot escape the
/// working directory.
pub fn is_safe_component(component: &str) -> bool {
    !component.is_empty()
        && component != "."
        && component != ".."
        && !component.contains('/')
        && !component.contains('\\')
        && !component.contains('\0')
}
