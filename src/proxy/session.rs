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

// Per-connection and per-request handling.
//
// Requests on one connection are served in arrival order. An IPP POST goes
// through decode, URL translation, re-encode and splice; a GET passes
// through with header hygiene only; everything else is rejected. Both
// pipelines stream bodies, so document data following an IPP operation
// message never gets buffered.

use std::{net::SocketAddr, panic::AssertUnwindSafe, sync::atomic::Ordering, sync::Arc};

use futures::FutureExt;
use http::{header, HeaderMap, Method, StatusCode, Uri, Version};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};

use crate::ipp::{self, DecodeOptions, MsgXlat, UrlXlat};
use crate::net::{PeekBody, TeeReader};
use crate::proxy::client::UpstreamResponse;
use crate::proxy::http1::{
    copy_chunked, read_request_head, request_body_kind, response_body_kind, write_response_head,
    BodyKind, BodyReader, RequestHead, ResponseHead,
};
use crate::proxy::server::Shared;
use crate::trace::magic;
use crate::utils::ProxyResult;

const CONTENT_TYPE_IPP: &str = "application/ipp";

/// Headers scoped to a single connection, RFC 7230 SS6.1. Removed on both
/// the forward and the reverse path, together with any header named in a
/// Connection token list.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
];

/// Serves one client connection until EOF, error, shutdown or a request
/// that forces a close. A panic inside a handler is caught and logged;
/// the connection is dropped without a response and the process lives on.
pub(crate) async fn serve_connection<S>(shared: Arc<Shared>, stream: S, peer: Option<SocketAddr>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let peer = peer.map(|p| p.to_string()).unwrap_or_else(|| "?".into());
    let (r, w) = tokio::io::split(stream);
    let mut reader = BufReader::new(r);
    let mut writer = BufWriter::new(w);

    loop {
        let head = tokio::select! {
            res = read_request_head(&mut reader) => match res {
                Ok(Some(head)) => head,
                Ok(None) => break,
                Err(err) => {
                    tracing::debug!(%peer, "bad request head: {err}");
                    break;
                }
            },
            _ = shared.cancel.cancelled() => break,
        };

        tracing::debug!(%peer, "{} {}", head.method, head.target);

        let handler = AssertUnwindSafe(handle_request(&shared, &mut reader, &mut writer, &head))
            .catch_unwind();
        let keep_alive = tokio::select! {
            res = handler => match res {
                Ok(Ok(keep_alive)) => keep_alive,
                Ok(Err(err)) => {
                    tracing::debug!(%peer, "request failed: {err}");
                    false
                }
                Err(panic) => {
                    tracing::error!(%peer, "handler panicked: {}", panic_message(&panic));
                    false
                }
            },
            _ = shared.cancel.cancelled() => false,
        };

        if !keep_alive || client_wants_close(&head) {
            break;
        }
    }

    let _ = writer.flush().await;
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".into()
    }
}

fn client_wants_close(head: &RequestHead) -> bool {
    if head.version == Version::HTTP_10 {
        return true;
    }
    connection_tokens(&head.headers)
        .iter()
        .any(|t| t.eq_ignore_ascii_case("close"))
}

/// Dispatches one request. Returns whether the connection may serve more.
async fn handle_request<R, W>(
    shared: &Shared,
    reader: &mut BufReader<R>,
    writer: &mut W,
    head: &RequestHead,
) -> ProxyResult<bool>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let content_type = head
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_ascii_lowercase();

    if shared.mapping.protocol == crate::config::ProxyProtocol::Ipp
        && head.method == Method::POST
        && content_type == CONTENT_TYPE_IPP
    {
        if head.content_length().is_none()
            && head.version == Version::HTTP_10
            && !crate::proxy::http1::has_chunked_encoding(&head.headers)
        {
            // HTTP/1.0 has no chunked framing, so the length can never be
            // recovered once the message is rewritten.
            return reject(writer, StatusCode::LENGTH_REQUIRED, "Length Required").await;
        }
        return do_ipp(shared, reader, writer, head).await;
    }

    if head.method == Method::GET {
        return do_http(shared, reader, writer, head).await;
    }

    reject(writer, StatusCode::BAD_REQUEST, "Bad Request").await
}

/// Bare HTTP passthrough.
async fn do_http<R, W>(
    shared: &Shared,
    reader: &mut BufReader<R>,
    writer: &mut W,
    head: &RequestHead,
) -> ProxyResult<bool>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    log_request("HTTP", head);

    let body_kind = request_body_kind(head);
    let mut out_head = outgoing_request_head(shared, head);
    set_body_framing(&mut out_head.headers, body_kind);

    tracing::debug!(
        "HTTP: forward request to: {}{}",
        shared.mapping.target_url,
        out_head.target
    );

    let mut body = BodyReader::new(reader, body_kind);
    let send = shared
        .client
        .send(
            &shared.mapping.target_url,
            &out_head,
            Some(&mut body),
            body_kind,
        )
        .await;
    let rsp = match send {
        Ok(rsp) => rsp,
        Err(err) => {
            tracing::debug!("HTTP: {err}");
            return reject(writer, StatusCode::BAD_GATEWAY, &err.to_string()).await;
        }
    };

    log_response("HTTP", &rsp.head);
    relay_response(shared, writer, head, rsp).await
}

/// IPP pipeline: decode the operation message off the body, translate the
/// URLs, splice the re-encoded message back in front of the remaining
/// document data and fix up Content-Length; then the same in reverse for
/// the response.
async fn do_ipp<R, W>(
    shared: &Shared,
    reader: &mut BufReader<R>,
    writer: &mut W,
    head: &RequestHead,
) -> ProxyResult<bool>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let rqnum = shared.rqnum.fetch_add(1, Ordering::SeqCst) + 1;

    log_request("IPP", head);

    // The client addressed the proxy by whatever Host it used; that is the
    // local side of the translation.
    let local_origin = match head.host().map(|h| format!("http://{h}")) {
        Some(s) => match s.parse::<Uri>() {
            Ok(uri) => uri,
            Err(_) => {
                let msg = format!("{s:?}: can't parse local URL");
                return reject(writer, StatusCode::BAD_GATEWAY, &msg).await;
            }
        },
        None => {
            return reject(writer, StatusCode::BAD_GATEWAY, "missing Host header").await;
        }
    };
    let xlat = MsgXlat::new(UrlXlat::new(&local_origin, &shared.mapping.target_url));

    // Prefetch and decode the operation message; everything past the
    // end-of-attributes tag stays on the wire.
    let body_kind = request_body_kind(head);
    let body = BodyReader::new(reader, body_kind);
    let mut peek = PeekBody::new(body);

    let msg = match ipp::decode(&mut peek, DecodeOptions::lenient()).await {
        Ok(msg) => msg,
        Err(err) => {
            let msg = format!("IPP error: {err}");
            tracing::debug!("IPP: {err}");
            return reject(writer, StatusCode::BAD_GATEWAY, &msg).await;
        }
    };

    if let Some(trace) = &shared.trace {
        let name = format!("{rqnum:08}-{}.ipp", ipp::operation_name(msg.code));
        trace.send(&name, peek.bytes());
    }

    let (msg, changes) = xlat.forward(&msg);
    if !changes.is_empty() {
        tracing::debug!("IPP: translated attributes:\n{changes}");
    }

    let encoded = ipp::encode(&msg);
    let consumed = peek.count();
    peek.replace(&encoded);

    // The outgoing body is the re-encoded message followed by whatever the
    // client keeps sending, so a known length shifts by the size delta.
    let out_framing = match head.content_length() {
        Some(len) => BodyKind::Exact((len + encoded.len() as u64).saturating_sub(consumed)),
        None => BodyKind::Chunked,
    };
    let mut out_head = outgoing_request_head(shared, head);
    set_body_framing(&mut out_head.headers, out_framing);

    tracing::debug!(
        "IPP: forward request to: {}{}",
        shared.mapping.target_url,
        out_head.target
    );

    let rsp = if shared.trace.is_some() {
        // Sniff the outgoing body so trailing document data can be traced
        // once the request has been streamed.
        let mut tee = TeeReader::new(peek);
        let send = shared
            .client
            .send(
                &shared.mapping.target_url,
                &out_head,
                Some(&mut tee),
                out_framing,
            )
            .await;
        if let (Some(trace), Ok(_)) = (&shared.trace, &send) {
            let sniffed = tee.sniffed();
            if sniffed.len() > encoded.len() {
                let data = &sniffed[encoded.len()..];
                let name = format!("{rqnum:08}-data.{}", magic(data));
                trace.send(&name, data);
            }
        }
        send
    } else {
        shared
            .client
            .send(
                &shared.mapping.target_url,
                &out_head,
                Some(&mut peek),
                out_framing,
            )
            .await
    };

    let rsp = match rsp {
        Ok(rsp) => rsp,
        Err(err) => {
            tracing::debug!("IPP: {err}");
            return reject(writer, StatusCode::BAD_GATEWAY, &err.to_string()).await;
        }
    };

    log_response("IPP", &rsp.head);

    let rsp_ct = rsp
        .head
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_ascii_lowercase();

    if rsp_ct != CONTENT_TYPE_IPP {
        return relay_response(shared, writer, head, rsp).await;
    }

    do_ipp_response(shared, writer, head, rsp, &xlat, rqnum).await
}

/// Reverse half of the IPP pipeline: decode the response message, reverse
/// the translation, splice and stream back to the client.
async fn do_ipp_response<W>(
    shared: &Shared,
    writer: &mut W,
    req_head: &RequestHead,
    mut rsp: UpstreamResponse,
    xlat: &MsgXlat,
    rqnum: u32,
) -> ProxyResult<bool>
where
    W: AsyncWrite + Unpin + Send,
{
    let rsp_head = rsp.head.clone();
    let body_kind = response_body_kind(&rsp_head, &req_head.method);

    let drained = {
        let body = BodyReader::new(&mut rsp.reader, body_kind);
        let mut peek = PeekBody::new(body);

        let msg = match ipp::decode(&mut peek, DecodeOptions::lenient()).await {
            Ok(msg) => msg,
            Err(err) => {
                tracing::debug!("IPP: {err}");
                let msg = format!("IPP error: {err}");
                return reject(writer, StatusCode::BAD_GATEWAY, &msg).await;
            }
        };

        let (msg, changes) = xlat.reverse(&msg);
        if !changes.is_empty() {
            tracing::debug!("IPP: translated attributes:\n{changes}");
        }

        let encoded = ipp::encode(&msg);
        let consumed = peek.count();
        peek.replace(&encoded);

        if let Some(trace) = &shared.trace {
            let name = format!("{rqnum:08}-{}.ipp", ipp::status_name(msg.code));
            trace.send(&name, &encoded);
        }

        let out_framing = match rsp_head.content_length() {
            Some(len) => {
                BodyKind::Exact((len + encoded.len() as u64).saturating_sub(consumed))
            }
            None => BodyKind::Chunked,
        };

        let mut out_head = ResponseHead {
            status: rsp_head.status,
            version: Version::HTTP_11,
            headers: end_to_end_headers(&rsp_head.headers),
        };
        set_body_framing(&mut out_head.headers, out_framing);

        write_response_head(writer, &out_head).await?;
        match out_framing {
            BodyKind::Chunked => {
                copy_chunked(&mut peek, writer).await?;
            }
            _ => {
                tokio::io::copy(&mut peek, writer).await?;
            }
        }
        writer.flush().await?;

        // An until-EOF body means the device closed the connection to
        // delimit it; that connection is spent.
        peek.get_ref().is_drained() && body_kind != BodyKind::UntilEof
    };

    shared.client.recycle(rsp, drained);
    Ok(true)
}

/// Streams an upstream response back to the client unchanged, modulo
/// hop-by-hop hygiene and re-framing.
async fn relay_response<W>(
    shared: &Shared,
    writer: &mut W,
    req_head: &RequestHead,
    mut rsp: UpstreamResponse,
) -> ProxyResult<bool>
where
    W: AsyncWrite + Unpin + Send,
{
    let body_kind = response_body_kind(&rsp.head, &req_head.method);

    let mut out_head = ResponseHead {
        status: rsp.head.status,
        version: Version::HTTP_11,
        headers: end_to_end_headers(&rsp.head.headers),
    };
    match body_kind {
        BodyKind::None => {
            // HEAD responses advertise the length they would have had.
            if let Some(len) = rsp.head.content_length() {
                set_body_framing(&mut out_head.headers, BodyKind::Exact(len));
            }
        }
        BodyKind::Exact(len) => set_body_framing(&mut out_head.headers, BodyKind::Exact(len)),
        BodyKind::Chunked | BodyKind::UntilEof => {
            set_body_framing(&mut out_head.headers, BodyKind::Chunked)
        }
    }

    write_response_head(writer, &out_head).await?;

    let drained = {
        let mut body = BodyReader::new(&mut rsp.reader, body_kind);
        match body_kind {
            BodyKind::None => {}
            BodyKind::Exact(_) => {
                tokio::io::copy(&mut body, writer).await?;
            }
            BodyKind::Chunked | BodyKind::UntilEof => {
                copy_chunked(&mut body, writer).await?;
            }
        }
        body.is_drained() && body_kind != BodyKind::UntilEof
    };
    writer.flush().await?;

    shared.client.recycle(rsp, drained);
    Ok(true)
}

/// Builds the outgoing request head: cloned end-to-end headers, Host set
/// to the target authority, original path and query. Body framing headers
/// are set separately by the caller.
fn outgoing_request_head(shared: &Shared, head: &RequestHead) -> RequestHead {
    let mut headers = end_to_end_headers(&head.headers);

    let authority = shared
        .mapping
        .target_url
        .authority()
        .map(|a| a.as_str())
        .unwrap_or_default();
    if let Ok(value) = header::HeaderValue::from_str(authority) {
        headers.insert(header::HOST, value);
    }

    RequestHead {
        method: head.method.clone(),
        target: head.path_and_query(),
        version: Version::HTTP_11,
        headers,
    }
}

/// Clones `src` minus hop-by-hop headers, Connection-named tokens and
/// Content-Length (framing is re-derived on the way out).
fn end_to_end_headers(src: &HeaderMap) -> HeaderMap {
    let mut headers = src.clone();

    for token in connection_tokens(&headers) {
        if let Ok(name) = header::HeaderName::from_bytes(token.as_bytes()) {
            headers.remove(name);
        }
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
    headers.remove(header::CONTENT_LENGTH);

    headers
}

fn connection_tokens(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

fn set_body_framing(headers: &mut HeaderMap, kind: BodyKind) {
    match kind {
        BodyKind::Exact(len) => {
            headers.insert(
                header::CONTENT_LENGTH,
                header::HeaderValue::from_str(&len.to_string()).unwrap(),
            );
        }
        BodyKind::Chunked => {
            headers.insert(
                header::TRANSFER_ENCODING,
                header::HeaderValue::from_static("chunked"),
            );
        }
        BodyKind::None | BodyKind::UntilEof => {}
    }
}

/// Completes a request with an error status. The connection is closed
/// afterwards since the request body may be partly unread.
async fn reject<W>(writer: &mut W, status: StatusCode, text: &str) -> ProxyResult<bool>
where
    W: AsyncWrite + Unpin + Send,
{
    let body = format!("{text}\n");

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
    headers.insert(header::PRAGMA, header::HeaderValue::from_static("no-cache"));
    headers.insert(header::EXPIRES, header::HeaderValue::from_static("0"));
    headers.insert(
        header::CONNECTION,
        header::HeaderValue::from_static("close"),
    );
    headers.insert(
        header::CONTENT_LENGTH,
        header::HeaderValue::from_str(&body.len().to_string()).unwrap(),
    );

    let head = ResponseHead {
        status,
        version: Version::HTTP_11,
        headers,
    };
    write_response_head(writer, &head).await?;
    writer.write_all(body.as_bytes()).await?;
    writer.flush().await?;

    Ok(false)
}

fn log_request(proto: &str, head: &RequestHead) {
    if tracing::enabled!(tracing::Level::DEBUG) {
        tracing::debug!(
            "{proto}: request received:\n{} {} {:?}\n{}",
            head.method,
            head.target,
            head.version,
            dump_headers(&head.headers)
        );
    }
}

fn log_response(proto: &str, head: &ResponseHead) {
    if tracing::enabled!(tracing::Level::DEBUG) {
        tracing::debug!(
            "{proto}: response received:\n{:?} {}\n{}",
            head.version,
            head.status,
            dump_headers(&head.headers)
        );
    }
}

fn dump_headers(headers: &HeaderMap) -> String {
    let mut out = String::new();
    for (name, value) in headers.iter() {
        out.push_str(name.as_str());
        out.push_str(": ");
        out.push_str(&String::from_utf8_lossy(value.as_bytes()));
        out.push('\n');
    }
    out
}
