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

//! Minimal server-side HTTP/1.1 framing for the shuffle protocol.
//!
//! Shuffle requests are bodyless `GET`s and responses are raw chunk bytes,
//! so the codec stays at the byte level: the transfer engine needs the
//! socket itself for zero-copy writes, which rules out handing the
//! connection to an HTTP framework. The header block is read with a hard
//! size cap; oversized or malformed framing is a client error.
//!
//! Query parameters are percent-decoded. A literal `+` is preserved rather
//! than translated to a space: boundary keys are standard base64, whose
//! alphabet includes `+`.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, ShuffleError};

/// HTTP protocol version of a parsed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    Http10,
    Http11,
}

/// Response status codes used by the shuffle protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok,
    NoContent,
    BadRequest,
    NotFound,
    MethodNotAllowed,
    InternalServerError,
}

impl StatusCode {
    pub fn code(&self) -> u16 {
        match self {
            StatusCode::Ok => 200,
            StatusCode::NoContent => 204,
            StatusCode::BadRequest => 400,
            StatusCode::NotFound => 404,
            StatusCode::MethodNotAllowed => 405,
            StatusCode::InternalServerError => 500,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::NoContent => "No Content",
            StatusCode::BadRequest => "Bad Request",
            StatusCode::NotFound => "Not Found",
            StatusCode::MethodNotAllowed => "Method Not Allowed",
            StatusCode::InternalServerError => "Internal Server Error",
        }
    }
}

/// A parsed, bodyless HTTP request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub version: HttpVersion,
    headers: Vec<(String, String)>,
    params: Vec<(String, String)>,
}

impl HttpRequest {
    /// Case-insensitive single-header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values of a query parameter, in request order.
    pub fn param_values(&self, name: &str) -> Vec<&str> {
        self.params
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// Whether the parameter is present at all (with or without a value).
    pub fn has_param(&self, name: &str) -> bool {
        self.params.iter().any(|(n, _)| n == name)
    }

    /// Keep-alive per standard HTTP semantics: HTTP/1.1 defaults to
    /// keep-alive, HTTP/1.0 to close, an explicit `Connection` header wins.
    pub fn keep_alive(&self) -> bool {
        match self.header("connection") {
            Some(v) if v.eq_ignore_ascii_case("close") => false,
            Some(v) if v.eq_ignore_ascii_case("keep-alive") => true,
            _ => self.version == HttpVersion::Http11,
        }
    }
}

/// Reads one request header block from the connection.
///
/// Returns `Ok(None)` when the peer closed the connection before sending
/// anything (a clean end of a keep-alive session). Oversized or malformed
/// framing yields [`ShuffleError::InvalidRequest`].
pub async fn read_request<R>(
    reader: &mut R,
    max_header_bytes: usize,
) -> Result<Option<HttpRequest>>
where
    R: AsyncRead + Unpin,
{
    let mut buf: Vec<u8> = Vec::with_capacity(512);
    let mut chunk = [0u8; 1024];

    let header_end = loop {
        if let Some(end) = find_header_end(&buf) {
            break end;
        }
        if buf.len() > max_header_bytes {
            return Err(ShuffleError::InvalidRequest(
                "request header block too large".to_string(),
            ));
        }
        let n = reader.read(&mut chunk).await.map_err(ShuffleError::IoError)?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(ShuffleError::InvalidRequest(
                "connection closed mid-request".to_string(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    if header_end > max_header_bytes {
        return Err(ShuffleError::InvalidRequest(
            "request header block too large".to_string(),
        ));
    }

    parse_request(&buf[..header_end]).map(Some)
}

/// Byte length of the header block including the terminating blank line,
/// or `None` if incomplete.
fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

fn parse_request(raw: &[u8]) -> Result<HttpRequest> {
    let text = std::str::from_utf8(raw).map_err(|_| {
        ShuffleError::InvalidRequest("request header is not valid UTF-8".to_string())
    })?;
    let mut lines = text.split("\r\n");

    let request_line = lines.next().unwrap_or("");
    let mut parts = request_line.split_whitespace();
    let (method, uri, version) = match (parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(u), Some(v)) if parts.next().is_none() => (m, u, v),
        _ => {
            return Err(ShuffleError::InvalidRequest(format!(
                "malformed request line: {request_line:?}"
            )))
        }
    };

    let version = match version {
        "HTTP/1.1" => HttpVersion::Http11,
        "HTTP/1.0" => HttpVersion::Http10,
        other => {
            return Err(ShuffleError::InvalidRequest(format!(
                "unsupported HTTP version: {other}"
            )))
        }
    };

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line.split_once(':').ok_or_else(|| {
            ShuffleError::InvalidRequest(format!("malformed header line: {line:?}"))
        })?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    let (path, query) = match uri.split_once('?') {
        Some((path, query)) => (path, query),
        None => (uri, ""),
    };

    Ok(HttpRequest {
        method: method.to_string(),
        path: path.to_string(),
        version,
        headers,
        params: parse_query(query)?,
    })
}

fn parse_query(query: &str) -> Result<Vec<(String, String)>> {
    let mut params = Vec::new();
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (name, value) = match pair.split_once('=') {
            Some((name, value)) => (name, value),
            None => (pair, ""),
        };
        params.push((percent_decode(name)?, percent_decode(value)?));
    }
    Ok(params)
}

fn percent_decode(input: &str) -> Result<String> {
    let raw = input.as_bytes();
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        match raw[i] {
            b'%' => {
                let hex = raw.get(i + 1..i + 3).ok_or_else(|| {
                    ShuffleError::InvalidRequest(format!(
                        "truncated percent escape in {input:?}"
                    ))
                })?;
                let hex = std::str::from_utf8(hex).ok().and_then(|h| {
                    u8::from_str_radix(h, 16).ok()
                });
                match hex {
                    Some(byte) => out.push(byte),
                    None => {
                        return Err(ShuffleError::InvalidRequest(format!(
                            "invalid percent escape in {input:?}"
                        )))
                    }
                }
                i += 3;
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }
    String::from_utf8(out).map_err(|_| {
        ShuffleError::InvalidRequest(format!(
            "query parameter is not valid UTF-8: {input:?}"
        ))
    })
}

/// Writes a response status line and headers. `content_length` of `None`
/// omits the header entirely (used for `204 No Content`).
pub async fn write_head<W>(
    writer: &mut W,
    status: StatusCode,
    content_length: Option<u64>,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let head = match content_length {
        Some(len) => format!(
            "HTTP/1.1 {} {}\r\nContent-Length: {}\r\n\r\n",
            status.code(),
            status.reason(),
            len
        ),
        None => format!("HTTP/1.1 {} {}\r\n\r\n", status.code(), status.reason()),
    };
    writer.write_all(head.as_bytes()).await?;
    writer.flush().await
}

/// Writes an error response with a UTF-8 text body. The connection is
/// always closed by the caller after an error response.
pub async fn write_error<W>(
    writer: &mut W,
    status: StatusCode,
    message: &str,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain; charset=UTF-8\r\nConnection: close\r\nContent-Length: {}\r\n\r\n",
        status.code(),
        status.reason(),
        message.len()
    );
    writer.write_all(head.as_bytes()).await?;
    writer.write_all(message.as_bytes()).await?;
    writer.flush().await
}
