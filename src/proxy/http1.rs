/* printrelay (AGPL-3.0)

Copyright (C) 2025 - printrelay contributors

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU Affero General Public License as published by
the Free Software Foundation, either version 3 of the License, or
(at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU Affero General Public License for more details.

You should have received a copy of the GNU Affero General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.

*/

// HTTP/1.x framing over buffered tokio streams.
//
// Heads are parsed line-wise into `http` crate types; bodies are exposed
// as a streaming `BodyReader` instead of an owned buffer, because the
// proxy must forward IPP document data without buffering it.

use std::{
    io,
    pin::Pin,
    task::{ready, Context, Poll},
};

use http::{header, HeaderMap, Method, StatusCode, Uri, Version};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::utils::{ProxyError, ProxyResult};

/// Upper bound for a request or response head.
const MAX_HEAD_BYTES: usize = 64 * 1024;

/// Upper bound for one chunk-size or trailer line.
const MAX_LINE_BYTES: usize = 1024;

#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    /// Request target exactly as received, usually origin-form.
    pub target: String,
    pub version: Version,
    pub headers: HeaderMap,
}

impl RequestHead {
    /// Path and query of the request target, defaulting to "/".
    pub fn path_and_query(&self) -> String {
        match self.target.parse::<Uri>() {
            Ok(uri) => uri
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_else(|| "/".to_string()),
            Err(_) => "/".to_string(),
        }
    }

    /// The Host header value, if present.
    pub fn host(&self) -> Option<&str> {
        self.headers.get(header::HOST).and_then(|v| v.to_str().ok())
    }

    pub fn content_length(&self) -> Option<u64> {
        content_length(&self.headers)
    }
}

#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub version: Version,
    pub headers: HeaderMap,
}

impl ResponseHead {
    pub fn content_length(&self) -> Option<u64> {
        content_length(&self.headers)
    }
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

pub fn has_chunked_encoding(headers: &HeaderMap) -> bool {
    headers
        .get(header::TRANSFER_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|raw| {
            raw.to_ascii_lowercase()
                .split(',')
                .any(|enc| enc.trim() == "chunked")
        })
        .unwrap_or(false)
}

/// Reads one request head. `Ok(None)` means the peer closed the connection
/// cleanly before sending another request.
pub async fn read_request_head<R>(r: &mut R) -> ProxyResult<Option<RequestHead>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let n = r.read_line(&mut line).await?;
    if n == 0 {
        return Ok(None);
    }

    let mut parts = line.split_whitespace();
    let (method, target, version) = match (parts.next(), parts.next(), parts.next(), parts.next())
    {
        (Some(m), Some(t), Some(v), None) => (m, t, v),
        _ => {
            return Err(ProxyError::Http(format!(
                "malformed request line: {:?}",
                line.trim_end()
            )))
        }
    };

    let method: Method = method
        .parse()
        .map_err(|_| ProxyError::Http(format!("bad method: {method:?}")))?;
    let version = parse_version(version)?;
    let headers = read_headers(r, line.len()).await?;

    Ok(Some(RequestHead {
        method,
        target: target.to_string(),
        version,
        headers,
    }))
}

/// Reads one response head. EOF here is always an error.
pub async fn read_response_head<R>(r: &mut R) -> ProxyResult<ResponseHead>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let n = r.read_line(&mut line).await?;
    if n == 0 {
        return Err(ProxyError::Http(
            "connection closed before response status line".into(),
        ));
    }

    let trimmed = line.trim_end_matches(['\r', '\n']);
    let mut parts = trimmed.splitn(3, ' ');
    let version = parts
        .next()
        .ok_or_else(|| ProxyError::Http("empty status line".into()))?;
    let status = parts
        .next()
        .ok_or_else(|| ProxyError::Http(format!("status line missing code: {trimmed:?}")))?;

    let version = parse_version(version)?;
    let status = status
        .parse::<u16>()
        .ok()
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| ProxyError::Http(format!("bad status code in {trimmed:?}")))?;

    let headers = read_headers(r, line.len()).await?;

    Ok(ResponseHead {
        status,
        version,
        headers,
    })
}

async fn read_headers<R>(r: &mut R, mut total: usize) -> ProxyResult<HeaderMap>
where
    R: AsyncBufRead + Unpin,
{
    let mut headers = HeaderMap::new();
    let mut line = String::new();
    loop {
        line.clear();
        let n = r.read_line(&mut line).await?;
        if n == 0 {
            return Err(ProxyError::Http("EOF inside header section".into()));
        }
        total += n;
        if total > MAX_HEAD_BYTES {
            return Err(ProxyError::Http("header section too large".into()));
        }

        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            return Ok(headers);
        }

        let (name, value) = trimmed
            .split_once(':')
            .ok_or_else(|| ProxyError::Http(format!("malformed header line: {trimmed:?}")))?;
        let name = header::HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|_| ProxyError::Http(format!("bad header name: {name:?}")))?;
        let value = header::HeaderValue::from_str(value.trim())
            .map_err(|_| ProxyError::Http(format!("bad header value for {name}")))?;
        headers.append(name, value);
    }
}

fn parse_version(v: &str) -> ProxyResult<Version> {
    match v {
        "HTTP/1.0" => Ok(Version::HTTP_10),
        "HTTP/1.1" => Ok(Version::HTTP_11),
        other => Err(ProxyError::Http(format!("unsupported HTTP version: {other:?}"))),
    }
}

pub fn version_str(v: Version) -> &'static str {
    match v {
        Version::HTTP_10 => "HTTP/1.0",
        _ => "HTTP/1.1",
    }
}

/// Serializes a request head. Requests always go out as HTTP/1.1.
pub async fn write_request_head<W>(w: &mut W, head: &RequestHead) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut out = format!("{} {} HTTP/1.1\r\n", head.method, head.target);
    for (name, value) in head.headers.iter() {
        out.push_str(name.as_str());
        out.push_str(": ");
        out.push_str(&String::from_utf8_lossy(value.as_bytes()));
        out.push_str("\r\n");
    }
    out.push_str("\r\n");
    w.write_all(out.as_bytes()).await
}

pub async fn write_response_head<W>(w: &mut W, head: &ResponseHead) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let reason = head.status.canonical_reason().unwrap_or("");
    let mut out = format!(
        "{} {} {}\r\n",
        version_str(head.version),
        head.status.as_u16(),
        reason
    );
    for (name, value) in head.headers.iter() {
        out.push_str(name.as_str());
        out.push_str(": ");
        out.push_str(&String::from_utf8_lossy(value.as_bytes()));
        out.push_str("\r\n");
    }
    out.push_str("\r\n");
    w.write_all(out.as_bytes()).await
}

/// Message body framing derived from the head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    None,
    Exact(u64),
    Chunked,
    UntilEof,
}

/// Framing of a request body. A request without Content-Length and
/// without chunked encoding carries no body (RFC 7230 SS3.3.3).
pub fn request_body_kind(head: &RequestHead) -> BodyKind {
    if has_chunked_encoding(&head.headers) {
        return BodyKind::Chunked;
    }
    match head.content_length() {
        Some(0) | None => BodyKind::None,
        Some(n) => BodyKind::Exact(n),
    }
}

/// Framing of a response body, which additionally depends on the request
/// method and the status class.
pub fn response_body_kind(head: &ResponseHead, req_method: &Method) -> BodyKind {
    if req_method == Method::HEAD
        || head.status.is_informational()
        || matches!(head.status.as_u16(), 204 | 304)
    {
        return BodyKind::None;
    }
    if has_chunked_encoding(&head.headers) {
        return BodyKind::Chunked;
    }
    match head.content_length() {
        Some(0) => BodyKind::None,
        Some(n) => BodyKind::Exact(n),
        None => BodyKind::UntilEof,
    }
}

/// Streaming body reader over a buffered connection.
///
/// Yields exactly the body bytes for the given framing and leaves the
/// connection positioned at the next message, so the caller can keep the
/// connection alive. `is_drained` reports whether the body reached its
/// well-defined end.
pub struct BodyReader<'a, R> {
    inner: &'a mut R,
    state: BodyState,
}

enum BodyState {
    Done,
    Exact { remaining: u64 },
    UntilEof,
    ChunkSize { line: Vec<u8> },
    ChunkData { remaining: u64 },
    ChunkDataCrlf { seen: usize },
    Trailer { line: Vec<u8> },
}

impl<'a, R: AsyncBufRead + Unpin> BodyReader<'a, R> {
    pub fn new(inner: &'a mut R, kind: BodyKind) -> Self {
        let state = match kind {
            BodyKind::None => BodyState::Done,
            BodyKind::Exact(0) => BodyState::Done,
            BodyKind::Exact(n) => BodyState::Exact { remaining: n },
            BodyKind::UntilEof => BodyState::UntilEof,
            BodyKind::Chunked => BodyState::ChunkSize { line: Vec::new() },
        };
        Self { inner, state }
    }

    /// True when the body ended at a well-defined boundary (everything
    /// consumed for Exact/Chunked, EOF seen for UntilEof).
    pub fn is_drained(&self) -> bool {
        matches!(self.state, BodyState::Done)
    }
}

impl<R: AsyncBufRead + Unpin> AsyncRead for BodyReader<'_, R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if out.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        let me = &mut *self;
        loop {
            match &mut me.state {
                BodyState::Done => return Poll::Ready(Ok(())),

                BodyState::Exact { remaining } => {
                    let available = ready!(Pin::new(&mut *me.inner).poll_fill_buf(cx))?;
                    if available.is_empty() {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "body ended before Content-Length",
                        )));
                    }
                    let n = available
                        .len()
                        .min(out.remaining())
                        .min(*remaining as usize);
                    out.put_slice(&available[..n]);
                    Pin::new(&mut *me.inner).consume(n);
                    *remaining -= n as u64;
                    if *remaining == 0 {
                        me.state = BodyState::Done;
                    }
                    return Poll::Ready(Ok(()));
                }

                BodyState::UntilEof => {
                    let available = ready!(Pin::new(&mut *me.inner).poll_fill_buf(cx))?;
                    if available.is_empty() {
                        me.state = BodyState::Done;
                        return Poll::Ready(Ok(()));
                    }
                    let n = available.len().min(out.remaining());
                    out.put_slice(&available[..n]);
                    Pin::new(&mut *me.inner).consume(n);
                    return Poll::Ready(Ok(()));
                }

                BodyState::ChunkSize { line } => {
                    let (done, consumed) = {
                        let available = ready!(Pin::new(&mut *me.inner).poll_fill_buf(cx))?;
                        if available.is_empty() {
                            return Poll::Ready(Err(io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                "EOF inside chunk size line",
                            )));
                        }
                        match available.iter().position(|&b| b == b'\n') {
                            Some(pos) => {
                                line.extend_from_slice(&available[..pos]);
                                (true, pos + 1)
                            }
                            None => {
                                line.extend_from_slice(available);
                                (false, available.len())
                            }
                        }
                    };
                    Pin::new(&mut *me.inner).consume(consumed);
                    if line.len() > MAX_LINE_BYTES {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "chunk size line too long",
                        )));
                    }
                    if !done {
                        continue;
                    }

                    let text = String::from_utf8_lossy(line);
                    let token = text.trim_end_matches('\r');
                    let token = token.split(';').next().unwrap_or(token).trim();
                    let size = u64::from_str_radix(token, 16).map_err(|_| {
                        io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("invalid chunk size: {token:?}"),
                        )
                    })?;

                    me.state = if size == 0 {
                        BodyState::Trailer { line: Vec::new() }
                    } else {
                        BodyState::ChunkData { remaining: size }
                    };
                }

                BodyState::ChunkData { remaining } => {
                    let available = ready!(Pin::new(&mut *me.inner).poll_fill_buf(cx))?;
                    if available.is_empty() {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "EOF inside chunk data",
                        )));
                    }
                    let n = available
                        .len()
                        .min(out.remaining())
                        .min(*remaining as usize);
                    out.put_slice(&available[..n]);
                    Pin::new(&mut *me.inner).consume(n);
                    *remaining -= n as u64;
                    if *remaining == 0 {
                        me.state = BodyState::ChunkDataCrlf { seen: 0 };
                    }
                    return Poll::Ready(Ok(()));
                }

                BodyState::ChunkDataCrlf { seen } => {
                    let (advance, bad) = {
                        let available = ready!(Pin::new(&mut *me.inner).poll_fill_buf(cx))?;
                        if available.is_empty() {
                            return Poll::Ready(Err(io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                "EOF inside chunk terminator",
                            )));
                        }
                        let expected: &[u8] = b"\r\n";
                        let want = 2 - *seen;
                        let take = available.len().min(want);
                        let ok = available[..take] == expected[*seen..*seen + take];
                        (take, !ok)
                    };
                    if bad {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "chunk missing CRLF terminator",
                        )));
                    }
                    Pin::new(&mut *me.inner).consume(advance);
                    *seen += advance;
                    if *seen == 2 {
                        me.state = BodyState::ChunkSize { line: Vec::new() };
                    }
                }

                BodyState::Trailer { line } => {
                    let (done, consumed) = {
                        let available = ready!(Pin::new(&mut *me.inner).poll_fill_buf(cx))?;
                        if available.is_empty() {
                            return Poll::Ready(Err(io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                "EOF inside trailer section",
                            )));
                        }
                        match available.iter().position(|&b| b == b'\n') {
                            Some(pos) => {
                                line.extend_from_slice(&available[..pos]);
                                (true, pos + 1)
                            }
                            None => {
                                line.extend_from_slice(available);
                                (false, available.len())
                            }
                        }
                    };
                    Pin::new(&mut *me.inner).consume(consumed);
                    if line.len() > MAX_LINE_BYTES {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "trailer line too long",
                        )));
                    }
                    if !done {
                        continue;
                    }
                    if line.iter().all(|&b| b == b'\r') {
                        me.state = BodyState::Done;
                        return Poll::Ready(Ok(()));
                    }
                    line.clear();
                }
            }
        }
    }
}

/// Copies a body with chunked framing, terminating with the last-chunk
/// marker. Returns the number of payload bytes written.
pub async fn copy_chunked<R, W>(body: &mut R, w: &mut W) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = [0u8; 16 * 1024];
    let mut total = 0u64;
    loop {
        let n = body.read(&mut buf).await?;
        if n == 0 {
            w.write_all(b"0\r\n\r\n").await?;
            return Ok(total);
        }
        w.write_all(format!("{n:x}\r\n").as_bytes()).await?;
        w.write_all(&buf[..n]).await?;
        w.write_all(b"\r\n").await?;
        total += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use tokio::io::{AsyncReadExt, BufReader};

    use super::*;

    #[tokio::test]
    async fn parses_request_head() {
        let raw = b"POST /ipp/print HTTP/1.1\r\nHost: 127.0.0.1:50000\r\nContent-Type: application/ipp\r\nContent-Length: 9\r\n\r\nbody-here";
        let mut r = BufReader::new(Cursor::new(raw.to_vec()));
        let head = read_request_head(&mut r).await.unwrap().unwrap();
        assert_eq!(head.method, Method::POST);
        assert_eq!(head.target, "/ipp/print");
        assert_eq!(head.version, Version::HTTP_11);
        assert_eq!(head.host(), Some("127.0.0.1:50000"));
        assert_eq!(head.content_length(), Some(9));
        assert_eq!(request_body_kind(&head), BodyKind::Exact(9));

        let mut body = Vec::new();
        BodyReader::new(&mut r, BodyKind::Exact(9))
            .read_to_end(&mut body)
            .await
            .unwrap();
        assert_eq!(body, b"body-here");
    }

    #[tokio::test]
    async fn eof_before_first_request_is_none() {
        let mut r = BufReader::new(Cursor::new(Vec::new()));
        assert!(read_request_head(&mut r).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn parses_response_head_and_exact_body() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 5\r\n\r\nhello";
        let mut r = BufReader::new(Cursor::new(raw.to_vec()));
        let head = read_response_head(&mut r).await.unwrap();
        assert_eq!(head.status, StatusCode::OK);
        assert_eq!(response_body_kind(&head, &Method::GET), BodyKind::Exact(5));

        let mut body = Vec::new();
        let mut reader = BodyReader::new(&mut r, BodyKind::Exact(5));
        reader.read_to_end(&mut body).await.unwrap();
        assert!(reader.is_drained());
        assert_eq!(body, b"hello");
    }

    #[tokio::test]
    async fn decodes_chunked_body_and_leaves_stream_aligned() {
        let raw = b"4\r\nwiki\r\n5\r\npedia\r\n0\r\nX-Trailer: 1\r\n\r\nNEXT";
        let mut r = BufReader::new(Cursor::new(raw.to_vec()));
        let mut body = Vec::new();
        {
            let mut reader = BodyReader::new(&mut r, BodyKind::Chunked);
            reader.read_to_end(&mut body).await.unwrap();
            assert!(reader.is_drained());
        }
        assert_eq!(body, b"wikipedia");

        // The connection is positioned right after the trailer.
        let mut rest = Vec::new();
        r.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"NEXT");
    }

    #[tokio::test]
    async fn truncated_exact_body_errors() {
        let mut r = BufReader::new(Cursor::new(b"abc".to_vec()));
        let mut body = Vec::new();
        let err = BodyReader::new(&mut r, BodyKind::Exact(10))
            .read_to_end(&mut body)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn chunked_writer_emits_wire_format() {
        let mut src = Cursor::new(b"hello world".to_vec());
        let mut out = Vec::new();
        let n = copy_chunked(&mut src, &mut out).await.unwrap();
        assert_eq!(n, 11);
        assert_eq!(out, b"b\r\nhello world\r\n0\r\n\r\n");

        // And it decodes back through BodyReader.
        let mut r = BufReader::new(Cursor::new(out));
        let mut body = Vec::new();
        BodyReader::new(&mut r, BodyKind::Chunked)
            .read_to_end(&mut body)
            .await
            .unwrap();
        assert_eq!(body, b"hello world");
    }

    #[tokio::test]
    async fn head_responses_have_no_body() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\n";
        let mut r = BufReader::new(Cursor::new(raw.to_vec()));
        let head = read_response_head(&mut r).await.unwrap();
        assert_eq!(response_body_kind(&head, &Method::HEAD), BodyKind::None);
    }
}
