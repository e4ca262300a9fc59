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

// End-to-end proxy scenarios against a hand-rolled fake device: GET
// passthrough, IPP URL rewriting in both directions, trailing document
// data with tracing, header hygiene and upstream failure mapping.

use std::net::SocketAddr;
use std::time::Duration;

use printrelay::config::{MappingConfig, ProxyProtocol, TlsConfig, UpstreamConfig};
use printrelay::ipp::{self, Attr, DecodeOptions, Group, Message};
use printrelay::proxy::Proxy;
use printrelay::trace::TraceWriter;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// One request as seen by the fake device.
#[derive(Debug)]
struct SeenRequest {
    head: String,
    body: Vec<u8>,
}

impl SeenRequest {
    fn has_header(&self, name: &str) -> bool {
        self.head
            .lines()
            .any(|l| l.to_ascii_lowercase().starts_with(&format!("{}:", name)))
    }

    fn header(&self, name: &str) -> Option<String> {
        self.head.lines().find_map(|l| {
            let (n, v) = l.split_once(':')?;
            if n.trim().eq_ignore_ascii_case(name) {
                Some(v.trim().to_string())
            } else {
                None
            }
        })
    }

    fn request_line(&self) -> &str {
        self.head.lines().next().unwrap_or("")
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Starts a fake device that answers every request on every connection
/// with the same canned response and records what it saw.
async fn spawn_upstream(response: Vec<u8>) -> (SocketAddr, mpsc::UnboundedReceiver<SeenRequest>) {
    spawn_upstream_with(move |_| response).await
}

/// Like [`spawn_upstream`], but the response may embed the device's own
/// address, which is only known after binding.
async fn spawn_upstream_with<F>(
    make_response: F,
) -> (SocketAddr, mpsc::UnboundedReceiver<SeenRequest>)
where
    F: FnOnce(SocketAddr) -> Vec<u8>,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let response = make_response(addr);
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let Ok((mut conn, _)) = listener.accept().await else {
                break;
            };
            let tx = tx.clone();
            let response = response.clone();
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut tmp = [0u8; 4096];
                let head_end = loop {
                    match conn.read(&mut tmp).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => buf.extend_from_slice(&tmp[..n]),
                    }
                    if let Some(pos) = find_subsequence(&buf, b"\r\n\r\n") {
                        break pos + 4;
                    }
                };

                let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
                let content_length: usize = head
                    .lines()
                    .find_map(|l| {
                        let (n, v) = l.split_once(':')?;
                        n.trim()
                            .eq_ignore_ascii_case("content-length")
                            .then(|| v.trim().parse().ok())?
                    })
                    .unwrap_or(0);

                let mut body = buf[head_end..].to_vec();
                while body.len() < content_length {
                    match conn.read(&mut tmp).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => body.extend_from_slice(&tmp[..n]),
                    }
                }

                let _ = tx.send(SeenRequest { head, body });
                let _ = conn.write_all(&response).await;
                let _ = conn.shutdown().await;
            });
        }
    });

    (addr, rx)
}

async fn start_proxy(target_url: String, trace: Option<TraceWriter>) -> (Proxy, SocketAddr) {
    let mapping = MappingConfig {
        local_port: 0,
        target_url,
        protocol: ProxyProtocol::Ipp,
    }
    .mapping()
    .unwrap();

    let cancel = CancellationToken::new();
    let proxy = Proxy::start(
        &cancel,
        mapping,
        &TlsConfig::default(),
        &UpstreamConfig::default(),
        trace,
    )
    .await
    .unwrap();
    let addr = proxy.local_addr();
    let addr = SocketAddr::from(([127, 0, 0, 1], addr.port()));
    (proxy, addr)
}

/// Sends raw bytes to the proxy and reads the connection to EOF.
async fn roundtrip(addr: SocketAddr, request: &[u8]) -> Vec<u8> {
    let mut conn = TcpStream::connect(addr).await.unwrap();
    conn.write_all(request).await.unwrap();
    let mut out = Vec::new();
    timeout(TEST_TIMEOUT, conn.read_to_end(&mut out))
        .await
        .unwrap()
        .unwrap();
    out
}

fn split_response(raw: &[u8]) -> (String, Vec<u8>) {
    let pos = find_subsequence(raw, b"\r\n\r\n").expect("no header/body separator");
    (
        String::from_utf8_lossy(&raw[..pos + 4]).to_string(),
        raw[pos + 4..].to_vec(),
    )
}

fn charset_attrs() -> Vec<Attr> {
    vec![
        Attr {
            tag: 0x47,
            name: b"attributes-charset".to_vec(),
            value: b"utf-8".to_vec(),
        },
        Attr {
            tag: 0x48,
            name: b"attributes-natural-language".to_vec(),
            value: b"en".to_vec(),
        },
    ]
}

fn uri_attr(name: &str, value: String) -> Attr {
    Attr {
        tag: 0x45,
        name: name.as_bytes().to_vec(),
        value: value.into_bytes(),
    }
}

fn ipp_request(code: u16, attrs: Vec<Attr>) -> Vec<u8> {
    ipp::encode(&Message {
        version: (1, 1),
        code,
        request_id: 1,
        groups: vec![Group { tag: 0x01, attrs }],
    })
}

fn ipp_response_bytes(attr_groups: Vec<Group>) -> Vec<u8> {
    ipp::encode(&Message {
        version: (1, 1),
        code: 0x0000,
        request_id: 1,
        groups: attr_groups,
    })
}

fn http_response(content_type: &str, body: &[u8]) -> Vec<u8> {
    let mut out = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        content_type,
        body.len()
    )
    .into_bytes();
    out.extend_from_slice(body);
    out
}

#[tokio::test]
async fn get_passthrough() {
    // S1: plain GET goes through untouched, with the upstream seeing the
    // original path and query and its own Host.
    let (upstream_addr, mut seen) = spawn_upstream(http_response("text/plain", b"hello")).await;
    let (proxy, addr) = start_proxy(format!("http://{upstream_addr}"), None).await;

    let request = format!(
        "GET /foo?bar=1 HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n"
    );
    let raw = roundtrip(addr, request.as_bytes()).await;
    let (head, body) = split_response(&raw);

    assert!(head.starts_with("HTTP/1.1 200"), "head: {head}");
    assert!(head.to_ascii_lowercase().contains("content-type: text/plain"));
    assert_eq!(body, b"hello");

    let req = seen.recv().await.unwrap();
    assert_eq!(req.request_line(), "GET /foo?bar=1 HTTP/1.1");
    assert_eq!(req.header("host").unwrap(), upstream_addr.to_string());

    proxy.shutdown().await;
}

#[tokio::test]
async fn hop_by_hop_headers_are_stripped() {
    let (upstream_addr, mut seen) = spawn_upstream(http_response("text/plain", b"ok")).await;
    let (proxy, addr) = start_proxy(format!("http://{upstream_addr}"), None).await;

    let request = format!(
        "GET / HTTP/1.1\r\nHost: {addr}\r\nKeep-Alive: timeout=5\r\nX-Secret-Hop: 1\r\nX-Keep: yes\r\nConnection: close, X-Secret-Hop\r\n\r\n"
    );
    let _ = roundtrip(addr, request.as_bytes()).await;

    let req = seen.recv().await.unwrap();
    assert!(!req.has_header("connection"), "head: {}", req.head);
    assert!(!req.has_header("keep-alive"));
    assert!(!req.has_header("x-secret-hop"));
    assert!(req.has_header("x-keep"));

    proxy.shutdown().await;
}

#[tokio::test]
async fn unsupported_method_is_rejected() {
    let (upstream_addr, _seen) = spawn_upstream(http_response("text/plain", b"ok")).await;
    let (proxy, addr) = start_proxy(format!("http://{upstream_addr}"), None).await;

    let request = format!("PUT /x HTTP/1.1\r\nHost: {addr}\r\nContent-Length: 0\r\n\r\n");
    let raw = roundtrip(addr, request.as_bytes()).await;
    let (head, body) = split_response(&raw);

    assert!(head.starts_with("HTTP/1.1 400"), "head: {head}");
    let head = head.to_ascii_lowercase();
    assert!(head.contains("cache-control: no-cache, no-store, must-revalidate"));
    assert!(head.contains("pragma: no-cache"));
    assert!(head.contains("expires: 0"));
    assert_eq!(body, b"Bad Request\n");

    proxy.shutdown().await;
}

#[tokio::test]
async fn ipp_urls_are_rewritten_both_ways() {
    // S2: printer-uri is rewritten to the device origin on the way out;
    // printer-uri-supported is rewritten back on the way in; other
    // attributes survive byte for byte.
    let (upstream_addr, mut seen) = spawn_upstream_with(|device_addr| {
        let response_msg = ipp_response_bytes(vec![
            Group {
                tag: 0x01,
                attrs: charset_attrs(),
            },
            Group {
                tag: 0x04,
                attrs: vec![uri_attr(
                    "printer-uri-supported",
                    format!("ipp://{device_addr}/ipp/print"),
                )],
            },
        ]);
        http_response("application/ipp", &response_msg)
    })
    .await;

    let (proxy, addr) = start_proxy(format!("ipp://{upstream_addr}/ipp/print"), None).await;

    let mut attrs = charset_attrs();
    attrs.push(uri_attr("printer-uri", format!("ipp://{addr}/ipp/print")));
    let msg = ipp_request(0x000b, attrs);

    let request_head = format!(
        "POST /ipp/print HTTP/1.1\r\nHost: {addr}\r\nContent-Type: application/ipp\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        msg.len()
    );
    let mut request = request_head.into_bytes();
    request.extend_from_slice(&msg);

    let raw = roundtrip(addr, &request).await;
    let (head, body) = split_response(&raw);
    assert!(head.starts_with("HTTP/1.1 200"), "head: {head}");

    // The device saw its own origin in printer-uri.
    let req = seen.recv().await.unwrap();
    let mut cursor = std::io::Cursor::new(req.body.clone());
    let sent = ipp::decode(&mut cursor, DecodeOptions::default()).await.unwrap();
    let printer_uri = sent.groups[0]
        .attrs
        .iter()
        .find(|a| a.name == b"printer-uri")
        .unwrap();
    assert_eq!(
        String::from_utf8_lossy(&printer_uri.value),
        format!("ipp://{upstream_addr}/ipp/print")
    );
    // Untouched attributes are byte-identical.
    assert_eq!(sent.groups[0].attrs[0].value, b"utf-8");
    assert_eq!(
        req.header("content-length").unwrap(),
        req.body.len().to_string()
    );

    // The client got the device origin translated back to the proxy.
    let mut cursor = std::io::Cursor::new(body);
    let received = ipp::decode(&mut cursor, DecodeOptions::default()).await.unwrap();
    let supported = received
        .groups
        .iter()
        .flat_map(|g| g.attrs.iter())
        .find(|a| a.name == b"printer-uri-supported")
        .unwrap();
    assert_eq!(
        String::from_utf8_lossy(&supported.value),
        format!("ipp://{addr}/ipp/print")
    );

    proxy.shutdown().await;
}

#[tokio::test]
async fn trailing_document_data_streams_and_traces() {
    // S3: a Send-Document with PDF payload. The trace captures the IPP
    // part and the document separately; the upstream length reflects the
    // re-encoded prefix plus the payload.
    let response_msg = ipp_response_bytes(vec![Group {
        tag: 0x01,
        attrs: charset_attrs(),
    }]);
    let (upstream_addr, mut seen) =
        spawn_upstream(http_response("application/ipp", &response_msg)).await;

    let trace_dir = tempfile::tempdir().unwrap();
    let trace = TraceWriter::new(trace_dir.path().to_path_buf()).unwrap();
    let (proxy, addr) = start_proxy(format!("ipp://{upstream_addr}/ipp/print"), Some(trace)).await;

    let msg = ipp_request(0x0006, charset_attrs());
    let pdf: Vec<u8> = b"%PDF-1.7\nfake document payload".to_vec();

    let request_head = format!(
        "POST /ipp/print HTTP/1.1\r\nHost: {addr}\r\nContent-Type: application/ipp\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        msg.len() + pdf.len()
    );
    let mut request = request_head.into_bytes();
    request.extend_from_slice(&msg);
    request.extend_from_slice(&pdf);

    let raw = roundtrip(addr, &request).await;
    let (head, _) = split_response(&raw);
    assert!(head.starts_with("HTTP/1.1 200"), "head: {head}");

    // No URLs in this message, so the upstream body is byte-identical.
    let req = seen.recv().await.unwrap();
    assert_eq!(req.body.len(), msg.len() + pdf.len());
    assert!(req.body.ends_with(&pdf));
    assert_eq!(
        req.header("content-length").unwrap(),
        (msg.len() + pdf.len()).to_string()
    );

    proxy.shutdown().await;

    let request_record = std::fs::read(trace_dir.path().join("00000001-Send-Document.ipp")).unwrap();
    assert_eq!(request_record, msg);

    let data_record = std::fs::read(trace_dir.path().join("00000001-data.pdf")).unwrap();
    assert_eq!(data_record, pdf);

    let response_record =
        std::fs::read(trace_dir.path().join("00000001-successful-ok.ipp")).unwrap();
    assert_eq!(response_record, response_msg);
}

#[tokio::test]
async fn unreachable_upstream_maps_to_bad_gateway() {
    // S6: nobody listens on the target; the client gets a 502 whose body
    // carries the transport error and a trailing newline.
    let (proxy, addr) = start_proxy("ipp://127.0.0.1:1/ipp/print".to_string(), None).await;

    let msg = ipp_request(0x000b, charset_attrs());
    let request_head = format!(
        "POST /ipp/print HTTP/1.1\r\nHost: {addr}\r\nContent-Type: application/ipp\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        msg.len()
    );
    let mut request = request_head.into_bytes();
    request.extend_from_slice(&msg);

    let raw = roundtrip(addr, &request).await;
    let (head, body) = split_response(&raw);

    assert!(head.starts_with("HTTP/1.1 502"), "head: {head}");
    let text = String::from_utf8_lossy(&body);
    assert!(text.ends_with('\n'));
    assert!(text.contains("127.0.0.1:1"), "body: {text}");

    proxy.shutdown().await;
}

#[tokio::test]
async fn malformed_request_does_not_wedge_the_proxy() {
    let (upstream_addr, _seen) = spawn_upstream(http_response("text/plain", b"ok")).await;
    let (proxy, addr) = start_proxy(format!("http://{upstream_addr}"), None).await;

    // Garbage on one connection...
    let mut bad = TcpStream::connect(addr).await.unwrap();
    bad.write_all(b"not an http request at all\r\n\r\n").await.unwrap();
    let mut sink = Vec::new();
    let _ = timeout(TEST_TIMEOUT, bad.read_to_end(&mut sink)).await;

    // ...and a healthy request right after still succeeds.
    let request = format!("GET / HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
    let raw = roundtrip(addr, request.as_bytes()).await;
    let (head, body) = split_response(&raw);
    assert!(head.starts_with("HTTP/1.1 200"), "head: {head}");
    assert_eq!(body, b"ok");

    proxy.shutdown().await;
}

#[tokio::test]
async fn tls_clients_are_served_on_the_same_port() {
    // The encrypted half terminates TLS with the generated certificate;
    // an insecure client config mirrors how IPP tooling talks to devices.
    let (upstream_addr, _seen) = spawn_upstream(http_response("text/plain", b"secure")).await;
    let (proxy, addr) = start_proxy(format!("http://{upstream_addr}"), None).await;

    let connector = tokio_rustls::TlsConnector::from(printrelay::tls::client_config(true));
    let tcp = TcpStream::connect(addr).await.unwrap();
    let server_name = rustls::pki_types::ServerName::try_from("localhost").unwrap();
    let mut stream = timeout(TEST_TIMEOUT, connector.connect(server_name, tcp))
        .await
        .unwrap()
        .unwrap();

    let request = format!("GET /s HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut raw = Vec::new();
    timeout(TEST_TIMEOUT, stream.read_to_end(&mut raw))
        .await
        .unwrap()
        .unwrap();

    let (head, body) = split_response(&raw);
    assert!(head.starts_with("HTTP/1.1 200"), "head: {head}");
    assert_eq!(body, b"secure");

    proxy.shutdown().await;
}
