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

//! The shuffle server: accept loop, per-connection request handling, and
//! service lifecycle.
//!
//! Each accepted connection is handled by one task: optional TLS
//! termination, then a keep-alive loop of parse → resolve → transfer.
//! Within one response, chunks are written strictly in request order;
//! across connections there is no ordering. Live connections are tracked in
//! a sharded concurrent map so accept and close never contend on a single
//! lock; shutdown drains in-flight connections within a bounded grace
//! period, then aborts stragglers.

use std::io::BufReader;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use log::{debug, error, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio_rustls::TlsAcceptor;

use crate::chunk::FileChunk;
use crate::config::ShuffleServerConfig;
use crate::error::{Result, ShuffleError};
use crate::http::{self, HttpRequest, StatusCode};
use crate::metrics::{MetricsSnapshot, ShuffleMetrics};
use crate::registry::AppRegistry;
use crate::request::{ShuffleMode, ShuffleRequest};
use crate::resolver::resolve_range;
use crate::shutdown::{Shutdown, ShutdownNotifier};
use crate::transfer::{self, ShuffleConnection, TransferOptions};
use crate::workdir::{hash_partition_file, range_output_dir, LocalDirAllocator};

/// Version byte of the serialized port blob handed to the embedding
/// process.
pub const PORT_METADATA_VERSION: u8 = 1;

/// Serializes the bound port for inter-process handoff.
pub fn serialize_port(port: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(5);
    out.push(PORT_METADATA_VERSION);
    out.extend_from_slice(&(port as u32).to_be_bytes());
    out
}

/// Inverse of [`serialize_port`], rejecting unknown versions and malformed
/// blobs.
pub fn deserialize_port(meta: &[u8]) -> Result<u16> {
    if meta.len() != 5 {
        return Err(ShuffleError::General(format!(
            "port metadata must be 5 bytes, got {}",
            meta.len()
        )));
    }
    if meta[0] != PORT_METADATA_VERSION {
        return Err(ShuffleError::General(format!(
            "unsupported port metadata version: {}",
            meta[0]
        )));
    }
    let port = u32::from_be_bytes([meta[1], meta[2], meta[3], meta[4]]);
    u16::try_from(port)
        .map_err(|_| ShuffleError::General(format!("port {port} out of range")))
}

/// State shared by the accept loop and all connection tasks.
struct ServerContext {
    config: ShuffleServerConfig,
    metrics: ShuffleMetrics,
    dirs: LocalDirAllocator,
    connections: DashMap<u64, SocketAddr>,
}

/// The shuffle transfer service.
///
/// Owns the listener, the live-connection set, the metrics, and the
/// application registry; connection handling itself runs in a stateless
/// [`RequestHandler`] given a reference to the shared context.
pub struct ShuffleServer {
    context: Arc<ServerContext>,
    registry: AppRegistry,
    tls: Option<TlsAcceptor>,
    bound_port: Option<u16>,
    notifier: Option<ShutdownNotifier>,
    accept_handle: Option<JoinHandle<()>>,
}

impl ShuffleServer {
    /// Validates the configuration and prepares the working-directory
    /// allocator. The server does not listen until [`ShuffleServer::start`].
    pub fn new(config: ShuffleServerConfig) -> Result<Self> {
        config.validate()?;
        let dirs = LocalDirAllocator::new(config.base_dirs.iter().cloned());
        Ok(Self {
            context: Arc::new(ServerContext {
                config,
                metrics: ShuffleMetrics::default(),
                dirs,
                connections: DashMap::new(),
            }),
            registry: AppRegistry::new(),
            tls: None,
            bound_port: None,
            notifier: None,
            accept_handle: None,
        })
    }

    /// Binds the listening socket and starts accepting connections.
    ///
    /// A configured port of `0` binds an ephemeral port; the resolved port
    /// is available from [`ShuffleServer::bound_port`] afterwards.
    pub async fn start(&mut self) -> Result<()> {
        if self.accept_handle.is_some() {
            return Err(ShuffleError::Internal(
                "shuffle server already started".to_string(),
            ));
        }

        if self.context.config.ssl_enabled {
            self.tls = Some(build_tls_acceptor(&self.context.config)?);
        }

        let addr = format!(
            "{}:{}",
            self.context.config.bind_host, self.context.config.port
        );
        let listener = TcpListener::bind(&addr).await.map_err(|e| {
            ShuffleError::Configuration(format!("cannot bind {addr}: {e}"))
        })?;
        let local_addr = listener.local_addr().map_err(ShuffleError::IoError)?;
        self.bound_port = Some(local_addr.port());
        info!("shuffle server listening on {local_addr}");

        let notifier = ShutdownNotifier::new();
        let accept_shutdown = notifier.subscribe();
        let notify_tx = notifier.notify_shutdown.clone();
        let complete_tx = notifier.shutdown_complete_tx.clone();
        self.notifier = Some(notifier);

        let context = self.context.clone();
        let tls = self.tls.clone();
        self.accept_handle = Some(tokio::spawn(accept_loop(
            listener,
            tls,
            context,
            accept_shutdown,
            notify_tx,
            complete_tx,
        )));
        Ok(())
    }

    /// The port the listener is bound to, once started.
    pub fn bound_port(&self) -> Option<u16> {
        self.bound_port
    }

    /// Versioned serialized form of the bound port, for handoff to the
    /// process embedding this service.
    pub fn port_metadata(&self) -> Result<Vec<u8>> {
        let port = self.bound_port.ok_or_else(|| {
            ShuffleError::Internal("shuffle server is not started".to_string())
        })?;
        Ok(serialize_port(port))
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.context.metrics.snapshot()
    }

    /// Number of currently tracked connections.
    pub fn connection_count(&self) -> usize {
        self.context.connections.len()
    }

    /// Records the owning user of an application (query-master
    /// bookkeeping; not consulted on the transfer path).
    pub fn register_application(&self, app_id: &str, user: &str) {
        self.registry.register(app_id, user);
    }

    pub fn unregister_application(&self, app_id: &str) {
        self.registry.unregister(app_id);
    }

    pub fn application_user(&self, app_id: &str) -> Option<String> {
        self.registry.user_for(app_id)
    }

    /// Stops accepting, lets in-flight connections finish within the
    /// configured grace period, aborts stragglers, and releases TLS
    /// resources.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(notifier) = self.notifier.take() else {
            return Ok(());
        };
        info!("stopping shuffle server");

        let ShutdownNotifier {
            notify_shutdown,
            shutdown_complete_tx,
            mut shutdown_complete_rx,
        } = notifier;

        // the accept loop reacts by draining its connection tasks, with
        // the grace period applied there
        let _ = notify_shutdown.send(());
        if let Some(handle) = self.accept_handle.take() {
            handle.await?;
        }
        drop(notify_shutdown);
        drop(shutdown_complete_tx);

        // wait for every connection task to finish unwinding
        let _ = shutdown_complete_rx.recv().await;

        self.tls = None;
        self.bound_port = None;
        info!("shuffle server stopped");
        Ok(())
    }
}

fn build_tls_acceptor(config: &ShuffleServerConfig) -> Result<TlsAcceptor> {
    // a concurrently embedded component may have installed a provider
    let _ = rustls::crypto::ring::default_provider().install_default();

    let cert_path = config.ssl_cert_path.as_deref().ok_or_else(|| {
        ShuffleError::Configuration("ssl_cert_path is required".to_string())
    })?;
    let key_path = config.ssl_key_path.as_deref().ok_or_else(|| {
        ShuffleError::Configuration("ssl_key_path is required".to_string())
    })?;

    let certs = rustls_pemfile::certs(&mut BufReader::new(
        std::fs::File::open(cert_path).map_err(|e| {
            ShuffleError::Configuration(format!("cannot open {cert_path}: {e}"))
        })?,
    ))
    .collect::<std::result::Result<Vec<_>, _>>()
    .map_err(|e| {
        ShuffleError::Configuration(format!("cannot parse {cert_path}: {e}"))
    })?;

    let key = rustls_pemfile::private_key(&mut BufReader::new(
        std::fs::File::open(key_path).map_err(|e| {
            ShuffleError::Configuration(format!("cannot open {key_path}: {e}"))
        })?,
    ))
    .map_err(|e| ShuffleError::Configuration(format!("cannot parse {key_path}: {e}")))?
    .ok_or_else(|| {
        ShuffleError::Configuration(format!("no private key found in {key_path}"))
    })?;

    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ShuffleError::Configuration(format!("invalid TLS identity: {e}")))?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

async fn accept_loop(
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    context: Arc<ServerContext>,
    mut shutdown: Shutdown,
    notify_tx: broadcast::Sender<()>,
    complete_tx: mpsc::Sender<()>,
) {
    let mut tasks: JoinSet<()> = JoinSet::new();
    let mut next_id: u64 = 0;

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("accept failed: {e}");
                        continue;
                    }
                };
                let id = next_id;
                next_id += 1;
                tasks.spawn(handle_connection(
                    stream,
                    peer,
                    tls.clone(),
                    id,
                    context.clone(),
                    Shutdown::from_receiver(notify_tx.subscribe()),
                    complete_tx.clone(),
                ));
            }
        }
    }
    drop(listener);

    let grace = Duration::from_secs(context.config.shutdown_grace_seconds);
    if tokio::time::timeout(grace, drain(&mut tasks)).await.is_err() {
        warn!(
            "{} connections still open after {}s grace period; aborting them",
            context.connections.len(),
            grace.as_secs()
        );
        tasks.abort_all();
        drain(&mut tasks).await;
    }
    debug!("accept loop exited");
}

async fn drain(tasks: &mut JoinSet<()>) {
    while tasks.join_next().await.is_some() {}
}

/// Membership of one connection in the server-wide live set, held for the
/// lifetime of the connection task. Removal runs on every exit path,
/// including abort.
struct ConnectionTracker {
    context: Arc<ServerContext>,
    id: u64,
}

impl ConnectionTracker {
    fn register(context: Arc<ServerContext>, id: u64, peer: SocketAddr) -> Self {
        context.connections.insert(id, peer);
        Self { context, id }
    }
}

impl Drop for ConnectionTracker {
    fn drop(&mut self) {
        self.context.connections.remove(&self.id);
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    tls: Option<TlsAcceptor>,
    id: u64,
    context: Arc<ServerContext>,
    mut shutdown: Shutdown,
    _complete: mpsc::Sender<()>,
) {
    let _tracker = ConnectionTracker::register(context.clone(), id, peer);
    info!(
        "accepted shuffle connection from {peer} ({} live)",
        context.connections.len()
    );

    let mut conn = match tls {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(stream) => ShuffleConnection::Tls(Box::new(stream)),
            Err(e) => {
                warn!("TLS handshake with {peer} failed: {e}");
                return;
            }
        },
        None => ShuffleConnection::Plain(stream),
    };

    let handler = RequestHandler { context: &context };
    loop {
        let request = tokio::select! {
            _ = shutdown.recv() => break,
            request = http::read_request(&mut conn, context.config.max_header_bytes) => request,
        };

        match request {
            // peer closed between requests
            Ok(None) => break,
            Ok(Some(request)) => {
                if !handler.handle(&request, &mut conn).await {
                    break;
                }
            }
            Err(ShuffleError::InvalidRequest(message)) => {
                let _ =
                    http::write_error(&mut conn, StatusCode::BadRequest, &message).await;
                break;
            }
            Err(e) => {
                debug!("connection {id} from {peer} errored: {e}");
                break;
            }
        }
    }

    debug!("closed shuffle connection {id} from {peer}");
}

/// Stateless per-connection request handling over the shared server
/// context.
struct RequestHandler<'a> {
    context: &'a ServerContext,
}

impl RequestHandler<'_> {
    /// Handles one parsed HTTP request. Returns whether the connection may
    /// be kept alive for another request.
    async fn handle(&self, request: &HttpRequest, conn: &mut ShuffleConnection) -> bool {
        if request.method != "GET" {
            let _ = http::write_error(
                conn,
                StatusCode::MethodNotAllowed,
                &format!("method {} is not allowed", request.method),
            )
            .await;
            return false;
        }

        let shuffle_request = match ShuffleRequest::parse(request) {
            Ok(parsed) => parsed,
            Err(e) => {
                let (status, message) = error_response(&e);
                let _ = http::write_error(conn, status, &message).await;
                return false;
            }
        };

        debug!(
            "shuffle request: mode={:?} qid={} sid={} p={} tasks={:?}",
            shuffle_request.mode,
            shuffle_request.query_id,
            shuffle_request.stage_id,
            shuffle_request.partition_id,
            shuffle_request.task_ids
        );

        let chunks = match self.resolve_chunks(&shuffle_request) {
            Ok(Some(chunks)) if !chunks.is_empty() => chunks,
            Ok(_) => {
                // zero rows upstream is a valid outcome, not an error
                if http::write_head(conn, StatusCode::NoContent, None).await.is_err() {
                    return false;
                }
                return request.keep_alive();
            }
            Err(e) => {
                let (status, message) = error_response(&e);
                let _ = http::write_error(conn, status, &message).await;
                return false;
            }
        };

        let total: u64 = chunks.iter().map(|chunk| chunk.length).sum();
        if http::write_head(conn, StatusCode::Ok, Some(total)).await.is_err() {
            return false;
        }

        let options = TransferOptions {
            cache_managed: self.context.config.manage_os_cache,
            readahead_bytes: self.context.config.readahead_bytes,
            buffer_size: self.context.config.ssl_file_buffer_size,
        };

        for chunk in &chunks {
            match transfer::send_chunk(conn, chunk, &options, &self.context.metrics).await
            {
                Ok(()) => {}
                Err(ShuffleError::ChunkNotFound(message)) => {
                    // the file vanished after resolution; earlier chunks may
                    // already be on the wire — the client treats the broken
                    // body as a failed fetch
                    warn!("{message}");
                    let _ =
                        http::write_error(conn, StatusCode::NotFound, &message).await;
                    return false;
                }
                Err(e) => {
                    error!("chunk transfer to {:?} failed: {e}", conn.peer_addr());
                    let _ = http::write_error(
                        conn,
                        StatusCode::InternalServerError,
                        &e.to_string(),
                    )
                    .await;
                    return false;
                }
            }
        }

        request.keep_alive()
    }

    /// Resolves a request into chunk descriptors. `Ok(None)` means the
    /// expected task output is absent — a `204 No Content` outcome.
    fn resolve_chunks(&self, request: &ShuffleRequest) -> Result<Option<Vec<FileChunk>>> {
        match request.mode {
            ShuffleMode::Range => {
                let relative = range_output_dir(
                    &request.query_id,
                    &request.stage_id,
                    &request.task_ids[0],
                );
                let Some(out_dir) = self.context.dirs.path_to_read(&relative) else {
                    warn!("output directory {relative} does not exist");
                    return Ok(None);
                };
                let start = request.start_key.as_deref().unwrap_or_default();
                let end = request.end_key.as_deref().unwrap_or_default();
                let chunk = resolve_range(&out_dir, start, end, request.is_final)?;
                Ok(Some(chunk.into_iter().collect()))
            }
            ShuffleMode::Hash | ShuffleMode::ScatteredHash => {
                let mut chunks = Vec::with_capacity(request.task_ids.len());
                for task_id in &request.task_ids {
                    let relative = hash_partition_file(
                        &request.query_id,
                        &request.stage_id,
                        task_id,
                        &request.partition_id,
                    );
                    let Some(path) = self.context.dirs.path_to_read(&relative) else {
                        warn!("partition file {relative} does not exist");
                        return Ok(None);
                    };
                    let length = std::fs::metadata(&path)
                        .map_err(ShuffleError::IoError)?
                        .len();
                    chunks.push(FileChunk::new(path, 0, length));
                }
                Ok(Some(chunks))
            }
        }
    }
}

fn error_response(e: &ShuffleError) -> (StatusCode, String) {
    match e {
        ShuffleError::InvalidRequest(message) => {
            (StatusCode::BadRequest, message.clone())
        }
        ShuffleError::ChunkNotFound(message) => (StatusCode::NotFound, message.clone()),
        other => (StatusCode::InternalServerError, other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_metadata_round_trip() {
        let meta = serialize_port(31337);
        assert_eq!(meta.len(), 5);
        assert_eq!(meta[0], PORT_METADATA_VERSION);
        assert_eq!(deserialize_port(&meta).unwrap(), 31337);
    }

    #[test]
    fn test_port_metadata_rejects_malformed() {
        assert!(deserialize_port(&[]).is_err());
        assert!(deserialize_port(&[PORT_METADATA_VERSION, 0, 0]).is_err());

        let mut meta = serialize_port(1024);
        meta[0] = 99;
        assert!(deserialize_port(&meta).is_err());
    }

    #[tokio::test]
    async fn test_start_binds_ephemeral_port_and_stops() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = ShuffleServerConfig {
            bind_host: "127.0.0.1".to_string(),
            base_dirs: vec![dir.path().to_string_lossy().into_owned()],
            ..Default::default()
        };
        let mut server = ShuffleServer::new(config).unwrap();
        assert!(server.bound_port().is_none());
        assert!(server.port_metadata().is_err());

        server.start().await.unwrap();
        let port = server.bound_port().unwrap();
        assert_ne!(port, 0);
        assert_eq!(
            deserialize_port(&server.port_metadata().unwrap()).unwrap(),
            port
        );
        assert_eq!(server.connection_count(), 0);

        server.stop().await.unwrap();
        assert!(server.bound_port().is_none());

        // stopping again is a no-op
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_application_registry_lifecycle() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = ShuffleServerConfig {
            bind_host: "127.0.0.1".to_string(),
            base_dirs: vec![dir.path().to_string_lossy().into_owned()],
            ..Default::default()
        };
        let server = ShuffleServer::new(config).unwrap();

        server.register_application("app_7", "carol");
        assert_eq!(server.application_user("app_7").as_deref(), Some("carol"));
        server.unregister_application("app_7");
        assert!(server.application_user("app_7").is_none());
    }
}
