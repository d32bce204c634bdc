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

//! End-to-end tests driving the shuffle server over real sockets.

use std::path::Path;

use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use shuffle_server::config::ShuffleServerConfig;
use shuffle_server::index::IndexWriter;
use shuffle_server::key::{KeySchema, KeyTuple, KeyType, KeyValue};
use shuffle_server::server::ShuffleServer;
use shuffle_server::workdir::{DATA_FILE_NAME, INDEX_FILE_NAME};

const QUERY_ID: &str = "q_1423";
const STAGE_ID: &str = "2";
const RANGE_TASK: &str = "7";
const EMPTY_TASK: &str = "8";

fn int64_schema() -> KeySchema {
    KeySchema::new(vec![KeyType::Int64])
}

fn int64_key(v: i64) -> KeyTuple {
    KeyTuple::new(vec![KeyValue::Int64(v)])
}

fn encoded_key(v: i64) -> String {
    base64::encode(int64_schema().encode(&int64_key(v)).unwrap())
}

/// Populates a working directory with:
/// - a range partition for task 7: 400 data bytes, keys [1, 5, 9] at
///   offsets [0, 100, 300]
/// - a zero-row range partition for task 8
/// - hash partition 0 files for tasks 1 and 2
fn populate_workdir(base: &Path) -> Vec<u8> {
    let range_dir = base.join(format!(
        "{QUERY_ID}/output/{STAGE_ID}/{RANGE_TASK}/output"
    ));
    std::fs::create_dir_all(&range_dir).unwrap();
    let data: Vec<u8> = (0..400u32).map(|i| (i.wrapping_mul(31) % 251) as u8).collect();
    std::fs::write(range_dir.join(DATA_FILE_NAME), &data).unwrap();
    let mut writer = IndexWriter::new(int64_schema());
    writer.add(int64_key(1), 0).unwrap();
    writer.add(int64_key(5), 100).unwrap();
    writer.add(int64_key(9), 300).unwrap();
    writer.write_to_file(&range_dir.join(INDEX_FILE_NAME)).unwrap();

    let empty_dir = base.join(format!(
        "{QUERY_ID}/output/{STAGE_ID}/{EMPTY_TASK}/output"
    ));
    std::fs::create_dir_all(&empty_dir).unwrap();
    std::fs::write(empty_dir.join(DATA_FILE_NAME), b"").unwrap();
    IndexWriter::new(int64_schema())
        .write_to_file(&empty_dir.join(INDEX_FILE_NAME))
        .unwrap();

    for (task, content) in [("1", b"alpha-partition".as_slice()), ("2", b"beta".as_slice())]
    {
        let dir = base.join(format!("{QUERY_ID}/output/{STAGE_ID}/{task}/output"));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("0"), content).unwrap();
    }

    data
}

async fn start_server(base: &Path) -> ShuffleServer {
    let config = ShuffleServerConfig {
        bind_host: "127.0.0.1".to_string(),
        base_dirs: vec![base.to_string_lossy().into_owned()],
        ..Default::default()
    };
    let mut server = ShuffleServer::new(config).unwrap();
    server.start().await.unwrap();
    server
}

struct Response {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Response {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

struct TestClient {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl TestClient {
    async fn connect(port: u16) -> Self {
        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        Self {
            stream,
            buf: Vec::new(),
        }
    }

    async fn request(&mut self, target: &str, close: bool) -> Response {
        let connection = if close { "Connection: close\r\n" } else { "" };
        let raw = format!("GET {target} HTTP/1.1\r\nHost: localhost\r\n{connection}\r\n");
        self.stream.write_all(raw.as_bytes()).await.unwrap();
        self.read_response().await
    }

    async fn request_raw(&mut self, raw: &str) -> Response {
        self.stream.write_all(raw.as_bytes()).await.unwrap();
        self.read_response().await
    }

    async fn read_response(&mut self) -> Response {
        let head_end = loop {
            if let Some(pos) = self
                .buf
                .windows(4)
                .position(|w| w == b"\r\n\r\n")
            {
                break pos + 4;
            }
            let mut chunk = [0u8; 4096];
            let n = self.stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed before response head");
            self.buf.extend_from_slice(&chunk[..n]);
        };

        let head = String::from_utf8(self.buf[..head_end].to_vec()).unwrap();
        self.buf.drain(..head_end);

        let mut lines = head.split("\r\n");
        let status_line = lines.next().unwrap();
        let status: u16 = status_line.split_whitespace().nth(1).unwrap().parse().unwrap();
        let headers: Vec<(String, String)> = lines
            .filter(|line| !line.is_empty())
            .filter_map(|line| line.split_once(':'))
            .map(|(n, v)| (n.trim().to_string(), v.trim().to_string()))
            .collect();

        let content_length = headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case("content-length"))
            .and_then(|(_, v)| v.parse::<usize>().ok());

        let body = match content_length {
            Some(len) => {
                while self.buf.len() < len {
                    let mut chunk = [0u8; 4096];
                    let n = self.stream.read(&mut chunk).await.unwrap();
                    assert!(n > 0, "connection closed mid-body");
                    self.buf.extend_from_slice(&chunk[..n]);
                }
                self.buf.drain(..len).collect()
            }
            None => Vec::new(),
        };

        Response {
            status,
            headers,
            body,
        }
    }
}

async fn get(port: u16, target: &str) -> Response {
    let mut client = TestClient::connect(port).await;
    client.request(target, true).await
}

fn range_target(task: &str, start: i64, end: i64, is_final: bool) -> String {
    let mut target = format!(
        "/?type=r&qid={QUERY_ID}&sid={STAGE_ID}&p=0&ta={task}&start={}&end={}",
        encoded_key(start),
        encoded_key(end)
    );
    if is_final {
        target.push_str("&final");
    }
    target
}

#[tokio::test]
async fn test_range_request_returns_resolved_span() {
    let dir = TempDir::new().unwrap();
    let data = populate_workdir(dir.path());
    let mut server = start_server(dir.path()).await;
    let port = server.bound_port().unwrap();

    let response = get(port, &range_target(RANGE_TASK, 5, 9, false)).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.header("content-length"), Some("200"));
    assert_eq!(response.body, &data[100..300]);

    let metrics = server.metrics();
    assert_eq!(metrics.transfers_ok, 1);
    assert_eq!(metrics.output_bytes, 200);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_final_range_clamps_to_end_of_partition() {
    let dir = TempDir::new().unwrap();
    let data = populate_workdir(dir.path());
    let mut server = start_server(dir.path()).await;
    let port = server.bound_port().unwrap();

    let response = get(port, &range_target(RANGE_TASK, 9, 20, true)).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, &data[300..]);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_empty_index_and_missing_output_yield_no_content() {
    let dir = TempDir::new().unwrap();
    populate_workdir(dir.path());
    let mut server = start_server(dir.path()).await;
    let port = server.bound_port().unwrap();

    // zero-row partition
    let response = get(port, &range_target(EMPTY_TASK, 1, 9, false)).await;
    assert_eq!(response.status, 204);
    assert!(response.body.is_empty());

    // task that never produced output
    let response = get(port, &range_target("99", 1, 9, false)).await;
    assert_eq!(response.status, 204);

    // range entirely outside the indexed keys
    let response = get(port, &range_target(RANGE_TASK, 30, 40, false)).await;
    assert_eq!(response.status, 204);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_hash_request_concatenates_partitions_in_order() {
    let dir = TempDir::new().unwrap();
    populate_workdir(dir.path());
    let mut server = start_server(dir.path()).await;
    let port = server.bound_port().unwrap();

    let response = get(
        port,
        &format!("/?type=h&qid={QUERY_ID}&sid={STAGE_ID}&p=0&ta=1,2"),
    )
    .await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"alpha-partitionbeta");

    // reversed order reverses the body
    let response = get(
        port,
        &format!("/?type=s&qid={QUERY_ID}&sid={STAGE_ID}&p=0&ta=2,1"),
    )
    .await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"betaalpha-partition");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_missing_hash_partition_yields_no_content() {
    let dir = TempDir::new().unwrap();
    populate_workdir(dir.path());
    let mut server = start_server(dir.path()).await;
    let port = server.bound_port().unwrap();

    // partition 9 exists for no task
    let response = get(
        port,
        &format!("/?type=h&qid={QUERY_ID}&sid={STAGE_ID}&p=9&ta=1,2"),
    )
    .await;
    assert_eq!(response.status, 204);

    // one of the tasks is missing: the whole request is empty
    let response = get(
        port,
        &format!("/?type=h&qid={QUERY_ID}&sid={STAGE_ID}&p=0&ta=1,42"),
    )
    .await;
    assert_eq!(response.status, 204);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_client_errors() {
    let dir = TempDir::new().unwrap();
    populate_workdir(dir.path());
    let mut server = start_server(dir.path()).await;
    let port = server.bound_port().unwrap();

    // wrong method
    let mut client = TestClient::connect(port).await;
    let response = client
        .request_raw("POST / HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await;
    assert_eq!(response.status, 405);

    // missing parameters
    let response = get(port, "/?type=h&qid=q_1423").await;
    assert_eq!(response.status, 400);

    // unknown shuffle type
    let response = get(
        port,
        &format!("/?type=x&qid={QUERY_ID}&sid={STAGE_ID}&p=0&ta=1"),
    )
    .await;
    assert_eq!(response.status, 400);

    // boundary key that is not base64
    let response = get(
        port,
        &format!("/?type=r&qid={QUERY_ID}&sid={STAGE_ID}&p=0&ta=7&start=%21%21&end=%21%21"),
    )
    .await;
    assert_eq!(response.status, 400);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_keep_alive_serves_multiple_requests() {
    let dir = TempDir::new().unwrap();
    let data = populate_workdir(dir.path());
    let mut server = start_server(dir.path()).await;
    let port = server.bound_port().unwrap();

    let mut client = TestClient::connect(port).await;

    let response = client.request(&range_target(RANGE_TASK, 1, 5, false), false).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, &data[0..100]);

    let response = client
        .request(
            &format!("/?type=h&qid={QUERY_ID}&sid={STAGE_ID}&p=0&ta=2"),
            false,
        )
        .await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"beta");

    // 204 also keeps the connection alive
    let response = client.request(&range_target(EMPTY_TASK, 1, 9, false), false).await;
    assert_eq!(response.status, 204);

    let response = client.request(&range_target(RANGE_TASK, 5, 9, false), true).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, &data[100..300]);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_disjoint_fetches_do_not_interfere() {
    let dir = TempDir::new().unwrap();
    let data = populate_workdir(dir.path());
    let mut server = start_server(dir.path()).await;
    let port = server.bound_port().unwrap();

    let spans: Vec<(i64, i64, bool, std::ops::Range<usize>)> = vec![
        (1, 5, false, 0..100),
        (5, 9, false, 100..300),
        (9, 20, true, 300..400),
    ];

    let mut handles = Vec::new();
    for _ in 0..4 {
        for (start, end, is_final, expected) in spans.clone() {
            let data = data.clone();
            handles.push(tokio::spawn(async move {
                let target = range_target(RANGE_TASK, start, end, is_final);
                let response = get(port, &target).await;
                assert_eq!(response.status, 200);
                assert_eq!(response.body, &data[expected]);
            }));
        }
    }
    for result in futures::future::join_all(handles).await {
        result.unwrap();
    }

    let metrics = server.metrics();
    assert_eq!(metrics.transfers_ok, 12);
    assert_eq!(metrics.transfers_failed, 0);
    assert_eq!(metrics.active_transfers, 0);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_sub_ranges_reassemble_the_partition() {
    let dir = TempDir::new().unwrap();
    let data = populate_workdir(dir.path());
    let mut server = start_server(dir.path()).await;
    let port = server.bound_port().unwrap();

    let mut assembled = Vec::new();
    for (start, end, is_final) in [(1, 5, false), (5, 9, false), (9, 100, true)] {
        let response = get(port, &range_target(RANGE_TASK, start, end, is_final)).await;
        assert_eq!(response.status, 200);
        assembled.extend_from_slice(&response.body);
    }
    assert_eq!(assembled, data);

    server.stop().await.unwrap();
}
