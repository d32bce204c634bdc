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

//! HTTP shuffle transfer service for distributed query execution.
//!
//! Upstream compute tasks write partitioned intermediate output to local
//! disk; this service serves it to downstream tasks over persistent HTTP
//! connections. Range-partitioned output is located through an on-disk
//! sorted key index; hash-partitioned output is served as whole files.
//! Plaintext connections stream chunks with zero-copy `sendfile`, TLS
//! connections through a bounded buffer pipeline, with OS page-cache hints
//! issued around the transfer either way.

pub mod chunk;
pub mod config;
pub mod error;
pub mod http;
pub mod index;
pub mod key;
pub mod metrics;
pub mod registry;
pub mod request;
pub mod resolver;
pub mod server;
pub mod shutdown;
pub mod transfer;
pub mod workdir;

pub use chunk::FileChunk;
pub use config::ShuffleServerConfig;
pub use error::{Result, ShuffleError};
pub use server::{deserialize_port, serialize_port, ShuffleServer};

/// Crate version, reported at startup.
pub const SHUFFLE_SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");
