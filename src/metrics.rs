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

//! Transfer counters for the shuffle service.
//!
//! Bytes are counted at transfer start (optimistically, before the outcome
//! is known); success/failure counters and the in-flight gauge settle at
//! completion. Each transfer attempt records a start and exactly one
//! completion.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Shared transfer counters. Cheap to clone behind an `Arc`.
#[derive(Debug, Default)]
pub struct ShuffleMetrics {
    output_bytes: AtomicU64,
    transfers_ok: AtomicU64,
    transfers_failed: AtomicU64,
    active_transfers: AtomicI64,
}

/// Point-in-time view of the counters, for embedding processes and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub output_bytes: u64,
    pub transfers_ok: u64,
    pub transfers_failed: u64,
    pub active_transfers: i64,
}

impl ShuffleMetrics {
    /// Records the start of a chunk transfer of `bytes` bytes.
    pub fn transfer_started(&self, bytes: u64) {
        self.output_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.active_transfers.fetch_add(1, Ordering::Relaxed);
    }

    /// Records the completion of a chunk transfer. Must be called exactly
    /// once per started transfer.
    pub fn transfer_completed(&self, ok: bool) {
        if ok {
            self.transfers_ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.transfers_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.active_transfers.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            output_bytes: self.output_bytes.load(Ordering::Relaxed),
            transfers_ok: self.transfers_ok.load(Ordering::Relaxed),
            transfers_failed: self.transfers_failed.load(Ordering::Relaxed),
            active_transfers: self.active_transfers.load(Ordering::Relaxed),
        }
    }
}
