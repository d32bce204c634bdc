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

//! Configuration for the shuffle transfer service.

use crate::error::{Result, ShuffleError};

/// Configuration for the shuffle server process.
///
/// Controls network binding, OS page-cache management around transfers,
/// TLS termination, and graceful-shutdown behavior.
#[derive(Debug, Clone)]
pub struct ShuffleServerConfig {
    /// Local IP address to bind the listening socket to.
    pub bind_host: String,
    /// Port to listen on. `0` binds an ephemeral port; the resolved port is
    /// available from the running server.
    pub port: u16,
    /// Base directories holding task output. A request path is resolved
    /// against each base directory in order.
    pub base_dirs: Vec<String>,
    /// Number of worker threads for the I/O runtime. `0` uses twice the
    /// number of available cores.
    pub worker_threads: usize,
    /// Whether to issue posix_fadvise calls to manage the OS page cache
    /// around transfers (read-ahead before, drop-behind after).
    pub manage_os_cache: bool,
    /// Read-ahead window in bytes when `manage_os_cache` is set (default: 4MB).
    pub readahead_bytes: u64,
    /// Whether to terminate TLS on accepted connections.
    pub ssl_enabled: bool,
    /// PEM-encoded certificate chain, required when `ssl_enabled` is set.
    pub ssl_cert_path: Option<String>,
    /// PEM-encoded private key, required when `ssl_enabled` is set.
    pub ssl_key_path: Option<String>,
    /// Buffer size for the user-space copy pipeline used on encrypted
    /// connections, where zero-copy transfer is unavailable (default: 60KB).
    pub ssl_file_buffer_size: usize,
    /// Maximum accepted size of an HTTP request header block. Larger
    /// requests are rejected with `400` (default: 8KB).
    pub max_header_bytes: usize,
    /// Grace period in seconds for in-flight connections during shutdown.
    pub shutdown_grace_seconds: u64,
}

impl Default for ShuffleServerConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".into(),
            port: 0,
            base_dirs: vec![],
            worker_threads: 0,
            manage_os_cache: true,
            readahead_bytes: 4 * 1024 * 1024,
            ssl_enabled: false,
            ssl_cert_path: None,
            ssl_key_path: None,
            ssl_file_buffer_size: 60 * 1024,
            max_header_bytes: 8 * 1024,
            shutdown_grace_seconds: 10,
        }
    }
}

impl ShuffleServerConfig {
    /// Returns the configured worker thread count, or twice the number of
    /// available cores when unset.
    pub fn worker_threads_or_default(&self) -> usize {
        if self.worker_threads == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get() * 2)
                .unwrap_or(2)
        } else {
            self.worker_threads
        }
    }

    /// Validates the configuration, returning a descriptive error for
    /// settings the server cannot start with.
    pub fn validate(&self) -> Result<()> {
        if self.base_dirs.is_empty() {
            return Err(ShuffleError::Configuration(
                "at least one base directory is required".to_string(),
            ));
        }
        if self.ssl_enabled && (self.ssl_cert_path.is_none() || self.ssl_key_path.is_none())
        {
            return Err(ShuffleError::Configuration(
                "ssl_cert_path and ssl_key_path are required when TLS is enabled"
                    .to_string(),
            ));
        }
        if self.ssl_file_buffer_size == 0 {
            return Err(ShuffleError::Configuration(
                "ssl_file_buffer_size must be non-zero".to_string(),
            ));
        }
        if self.max_header_bytes == 0 {
            return Err(ShuffleError::Configuration(
                "max_header_bytes must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}
