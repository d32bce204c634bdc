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

//! Chunk descriptors produced by request resolution and consumed by the
//! transfer engine.

use std::fmt::{Display, Formatter};
use std::path::PathBuf;

/// An exact byte span of a partition file to transmit.
///
/// Produced once by resolution, consumed exactly once by the transfer
/// engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChunk {
    /// Path of the backing data file.
    pub path: PathBuf,
    /// Starting byte offset within the file.
    pub offset: u64,
    /// Number of bytes to transmit.
    pub length: u64,
}

impl FileChunk {
    pub fn new(path: PathBuf, offset: u64, length: u64) -> Self {
        Self {
            path,
            offset,
            length,
        }
    }
}

impl Display for FileChunk {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "{} [{}, {})",
            self.path.display(),
            self.offset,
            self.offset + self.length
        )
    }
}
