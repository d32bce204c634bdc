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

//! Graceful shutdown coordination between the accept loop and connection
//! tasks. Based on the mini-redis example from Tokio.
//!
//! Shutdown is announced on a broadcast channel; each connection task holds
//! a [`Shutdown`] listener and a clone of a completion `mpsc::Sender`.
//! Dropping all completion senders closes the channel, which the server
//! awaits (with a grace period) to know every connection has wound down.

use tokio::sync::{broadcast, mpsc};

/// Per-task listener for the server shutdown signal.
#[derive(Debug)]
pub struct Shutdown {
    received: bool,
    notify: broadcast::Receiver<()>,
}

impl Shutdown {
    /// Wraps a broadcast receiver subscribed to the shutdown channel.
    pub fn from_receiver(notify: broadcast::Receiver<()>) -> Shutdown {
        Shutdown {
            received: false,
            notify,
        }
    }

    /// Returns true once the shutdown signal has been observed.
    pub fn is_shutdown(&self) -> bool {
        self.received
    }

    /// Waits for the shutdown signal. Returns immediately if it was
    /// already observed. Only one value is ever sent, so a lag error
    /// cannot occur.
    pub async fn recv(&mut self) {
        if self.received {
            return;
        }
        let _ = self.notify.recv().await;
        self.received = true;
    }
}

/// Server-side shutdown broadcaster plus completion tracking.
pub struct ShutdownNotifier {
    /// Broadcasts the shutdown signal to all subscribed tasks.
    pub notify_shutdown: broadcast::Sender<()>,
    /// Receives `None` once every completion sender has been dropped.
    pub shutdown_complete_rx: mpsc::Receiver<()>,
    /// Cloned into each connection task; dropped when the task finishes.
    pub shutdown_complete_tx: mpsc::Sender<()>,
}

impl ShutdownNotifier {
    pub fn new() -> Self {
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, shutdown_complete_rx) = mpsc::channel(1);
        Self {
            notify_shutdown,
            shutdown_complete_rx,
            shutdown_complete_tx,
        }
    }

    /// Creates a listener that will observe the shutdown signal.
    pub fn subscribe(&self) -> Shutdown {
        Shutdown::from_receiver(self.notify_shutdown.subscribe())
    }
}

impl Default for ShutdownNotifier {
    fn default() -> Self {
        ShutdownNotifier::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_observe_shutdown() {
        let notifier = ShutdownNotifier::new();
        let mut first = notifier.subscribe();
        let mut second = notifier.subscribe();
        assert!(!first.is_shutdown());

        drop(notifier.notify_shutdown);

        first.recv().await;
        second.recv().await;
        assert!(first.is_shutdown());
        assert!(second.is_shutdown());

        // subsequent calls return immediately
        first.recv().await;
    }

    #[tokio::test]
    async fn test_completion_channel_drains() {
        let ShutdownNotifier {
            mut shutdown_complete_rx,
            shutdown_complete_tx,
            ..
        } = ShutdownNotifier::new();

        let worker_tx = shutdown_complete_tx.clone();
        let handle = tokio::spawn(async move {
            let _guard = worker_tx;
        });
        handle.await.unwrap();

        drop(shutdown_complete_tx);
        assert!(shutdown_complete_rx.recv().await.is_none());
    }
}
