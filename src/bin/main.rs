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

//! Shuffle server binary.

use anyhow::Result;
use clap::Parser;
use log::info;
use tokio::signal;

use shuffle_server::config::ShuffleServerConfig;
use shuffle_server::server::ShuffleServer;
use shuffle_server::SHUFFLE_SERVER_VERSION;

#[derive(Debug, Parser)]
#[command(name = "shuffle-server", version, about = "Serves partitioned task output to downstream tasks over HTTP")]
struct Args {
    /// Local IP address to bind to.
    #[arg(long, default_value = "0.0.0.0")]
    bind_host: String,

    /// Port to listen on (0 binds an ephemeral port).
    #[arg(long, default_value_t = 0)]
    port: u16,

    /// Base directory holding task output; may be given multiple times.
    #[arg(long = "base-dir", required = true)]
    base_dirs: Vec<String>,

    /// Worker threads for the I/O runtime (0 = twice the core count).
    #[arg(long, default_value_t = 0)]
    worker_threads: usize,

    /// Manage the OS page cache around transfers.
    #[arg(long, action = clap::ArgAction::Set, default_value_t = true)]
    manage_os_cache: bool,

    /// Read-ahead window in bytes.
    #[arg(long, default_value_t = 4 * 1024 * 1024)]
    readahead_bytes: u64,

    /// Terminate TLS on accepted connections.
    #[arg(long)]
    ssl: bool,

    /// PEM certificate chain (required with --ssl).
    #[arg(long)]
    ssl_cert: Option<String>,

    /// PEM private key (required with --ssl).
    #[arg(long)]
    ssl_key: Option<String>,

    /// Buffer size for transfers over TLS.
    #[arg(long, default_value_t = 60 * 1024)]
    ssl_file_buffer_size: usize,

    /// Grace period in seconds for in-flight connections at shutdown.
    #[arg(long, default_value_t = 10)]
    shutdown_grace_seconds: u64,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config = ShuffleServerConfig {
        bind_host: args.bind_host,
        port: args.port,
        base_dirs: args.base_dirs,
        worker_threads: args.worker_threads,
        manage_os_cache: args.manage_os_cache,
        readahead_bytes: args.readahead_bytes,
        ssl_enabled: args.ssl,
        ssl_cert_path: args.ssl_cert,
        ssl_key_path: args.ssl_key,
        ssl_file_buffer_size: args.ssl_file_buffer_size,
        shutdown_grace_seconds: args.shutdown_grace_seconds,
        ..Default::default()
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_threads_or_default())
        .enable_all()
        .build()?;
    runtime.block_on(run(config))
}

async fn run(config: ShuffleServerConfig) -> Result<()> {
    info!("shuffle server starting ... (version {SHUFFLE_SERVER_VERSION})");

    let mut server = ShuffleServer::new(config)?;
    server.start().await?;
    if let Some(port) = server.bound_port() {
        info!("serving shuffle data on port {port}");
    }

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("received ctrl-c event");
        }
        _ = sig_term() => {
            info!("received terminate signal");
        }
    }

    server.stop().await?;
    Ok(())
}

/// Waits for a termination signal: SIGTERM on Unix, Ctrl+Break on Windows.
async fn sig_term() -> std::io::Result<()> {
    #[cfg(unix)]
    tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?
        .recv()
        .await;
    #[cfg(windows)]
    tokio::signal::windows::ctrl_break()?.recv().await;
    Ok(())
}
