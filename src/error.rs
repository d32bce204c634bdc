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

//! Shuffle server error types

use std::{
    error::Error,
    fmt::{Display, Formatter},
    io, result,
};

/// Result type alias for shuffle server operations.
pub type Result<T> = result::Result<T, ShuffleError>;

/// Error types for the shuffle transfer service.
#[derive(Debug)]
pub enum ShuffleError {
    /// General error with a descriptive message.
    General(String),
    /// Internal error indicating a bug or unexpected state.
    Internal(String),
    /// Configuration error with invalid settings.
    Configuration(String),
    /// The client sent a request this server cannot satisfy as stated:
    /// missing or duplicated parameters, an unknown shuffle mode, or
    /// boundary keys that do not decode under the partition's key schema.
    InvalidRequest(String),
    /// A resolved chunk's backing file vanished between resolution and
    /// open. Expected under concurrent producer/consumer cleanup.
    ChunkNotFound(String),
    /// The index file is absent, truncated, or has an incompatible layout.
    IndexUnreadable(String),
    /// A range-resolution invariant was violated. Carries a boundary-state
    /// dump for postmortem diagnosis; treated as a server bug.
    IndexState(String),
    /// I/O operation error.
    IoError(io::Error),
    /// Tokio task join error.
    TokioError(tokio::task::JoinError),
}

/// Creates a general shuffle error from a string message.
pub fn shuffle_error(message: &str) -> ShuffleError {
    ShuffleError::General(message.to_owned())
}

impl From<String> for ShuffleError {
    fn from(e: String) -> Self {
        ShuffleError::General(e)
    }
}

impl From<io::Error> for ShuffleError {
    fn from(e: io::Error) -> Self {
        ShuffleError::IoError(e)
    }
}

impl From<tokio::task::JoinError> for ShuffleError {
    fn from(e: tokio::task::JoinError) -> Self {
        ShuffleError::TokioError(e)
    }
}

impl Display for ShuffleError {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            ShuffleError::General(desc) => write!(f, "General error: {desc}"),
            ShuffleError::Internal(desc) => {
                write!(f, "Internal shuffle server error: {desc}")
            }
            ShuffleError::Configuration(desc) => {
                write!(f, "Configuration error: {desc}")
            }
            ShuffleError::InvalidRequest(desc) => {
                write!(f, "Invalid shuffle request: {desc}")
            }
            ShuffleError::ChunkNotFound(desc) => {
                write!(f, "Chunk not found: {desc}")
            }
            ShuffleError::IndexUnreadable(desc) => {
                write!(f, "Index unreadable: {desc}")
            }
            ShuffleError::IndexState(desc) => {
                write!(f, "Index state error: {desc}")
            }
            ShuffleError::IoError(desc) => write!(f, "IO error: {desc}"),
            ShuffleError::TokioError(desc) => write!(f, "Tokio join error: {desc}"),
        }
    }
}

impl Error for ShuffleError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let e = ShuffleError::InvalidRequest("missing qid".to_string());
        assert_eq!(e.to_string(), "Invalid shuffle request: missing qid");

        let e = shuffle_error("boom");
        assert_eq!(e.to_string(), "General error: boom");
    }

    #[test]
    fn test_from_io_error() {
        let io = io::Error::new(io::ErrorKind::NotFound, "gone");
        let e = ShuffleError::from(io);
        assert!(matches!(e, ShuffleError::IoError(_)));
    }
}
