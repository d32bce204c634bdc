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

//! Application bookkeeping supplied by the embedding query master.
//!
//! Tracks which user owns each running application. Mutated only at
//! application start/stop, never on the per-request transfer path.

use dashmap::DashMap;
use log::info;

/// Application-id to owning-user registry, owned by the server and torn
/// down with it.
#[derive(Debug, Default)]
pub struct AppRegistry {
    users: DashMap<String, String>,
}

impl AppRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an application and its owning user.
    pub fn register(&self, app_id: &str, user: &str) {
        info!("registering application {app_id} for user {user}");
        self.users.insert(app_id.to_string(), user.to_string());
    }

    /// Removes an application registration.
    pub fn unregister(&self, app_id: &str) {
        info!("unregistering application {app_id}");
        self.users.remove(app_id);
    }

    /// Returns the owning user of an application, if registered.
    pub fn user_for(&self, app_id: &str) -> Option<String> {
        self.users.get(app_id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}
