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

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use http::{header, Uri, Version};
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

use crate::config::{effective_port, target_is_tls, UpstreamConfig};
use crate::proxy::http1::{
    copy_chunked, read_response_head, write_request_head, BodyKind, RequestHead, ResponseHead,
};
use crate::tls;
use crate::utils::{ProxyError, ProxyResult};

/// Device-facing streams are either plain TCP or TLS; both sides of the
/// proxy only ever see this object.
pub trait IoStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> IoStream for T {}

pub type BoxStream = Box<dyn IoStream>;

/// Max idle connections kept per target.
const POOL_MAX_IDLE: usize = 8;

/// HTTP/1.1 client for the device side of the proxy.
///
/// One instance per proxy, shared by all sessions. Keep-alive connections
/// are parked in a small idle pool and handed out again for the same
/// target; there is no replay, so a connection that died while idle
/// surfaces as a transport error on its next use.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    tls: Arc<rustls::ClientConfig>,
    connect_timeout: Duration,
    pool: Mutex<HashMap<String, Vec<BufReader<BoxStream>>>>,
}

/// An upstream response whose body has not been read yet. The session
/// streams the body through `reader` and then offers the connection back
/// via [`Client::recycle`].
pub struct UpstreamResponse {
    pub head: ResponseHead,
    pub(crate) reader: BufReader<BoxStream>,
    key: String,
}

impl Client {
    pub fn new(cfg: &UpstreamConfig) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                tls: tls::client_config(cfg.insecure_tls),
                connect_timeout: Duration::from_secs(cfg.connect_timeout),
                pool: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Performs one request against `target`: writes the head, streams the
    /// body with the given framing and reads the response head. The
    /// response body stays on the wire for the caller to stream.
    pub async fn send(
        &self,
        target: &Uri,
        head: &RequestHead,
        mut body: Option<&mut (dyn AsyncRead + Unpin + Send)>,
        framing: BodyKind,
    ) -> ProxyResult<UpstreamResponse> {
        let key = pool_key(target);
        let mut reader = match self.checkout(&key) {
            Some(idle) => idle,
            None => self.connect(target).await?,
        };

        write_request_head(reader.get_mut(), head)
            .await
            .map_err(|e| ProxyError::Upstream(format!("send to {key}: {e}")))?;

        if let Some(body) = body.as_deref_mut() {
            let copied = match framing {
                BodyKind::Chunked => copy_chunked(body, reader.get_mut()).await,
                BodyKind::None => Ok(0),
                _ => tokio::io::copy(body, reader.get_mut()).await,
            };
            copied.map_err(|e| ProxyError::Upstream(format!("send body to {key}: {e}")))?;
        }

        reader
            .get_mut()
            .flush()
            .await
            .map_err(|e| ProxyError::Upstream(format!("send to {key}: {e}")))?;

        let head = read_response_head(&mut reader)
            .await
            .map_err(|e| ProxyError::Upstream(format!("response from {key}: {e}")))?;

        Ok(UpstreamResponse { head, reader, key })
    }

    /// Returns a finished response's connection to the idle pool. Only
    /// connections whose body was drained to a well-defined end on a
    /// keep-alive response are reusable; everything else is dropped.
    pub fn recycle(&self, rsp: UpstreamResponse, drained: bool) {
        let reusable = drained
            && rsp.head.version == Version::HTTP_11
            && !wants_close(&rsp.head);
        if !reusable {
            return;
        }

        let mut pool = self.inner.pool.lock().unwrap();
        let idle = pool.entry(rsp.key).or_default();
        if idle.len() < POOL_MAX_IDLE {
            idle.push(rsp.reader);
        }
    }

    fn checkout(&self, key: &str) -> Option<BufReader<BoxStream>> {
        let mut pool = self.inner.pool.lock().unwrap();
        pool.get_mut(key).and_then(Vec::pop)
    }

    async fn connect(&self, target: &Uri) -> ProxyResult<BufReader<BoxStream>> {
        let host = target
            .host()
            .ok_or_else(|| ProxyError::Upstream("target URL has no host".into()))?;
        let port = effective_port(target);
        let label = format!("{host}:{port}");

        let tcp = timeout(self.inner.connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| ProxyError::Upstream(format!("connect to {label} timed out")))?
            .map_err(|e| ProxyError::Upstream(format!("connect to {label}: {e}")))?;
        let _ = tcp.set_nodelay(true);

        if !target_is_tls(target) {
            return Ok(BufReader::new(Box::new(tcp) as BoxStream));
        }

        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| ProxyError::Upstream(format!("invalid TLS server name: {host:?}")))?;
        let connector = TlsConnector::from(self.inner.tls.clone());
        let stream = timeout(self.inner.connect_timeout, connector.connect(server_name, tcp))
            .await
            .map_err(|_| ProxyError::Upstream(format!("TLS handshake with {label} timed out")))?
            .map_err(|e| ProxyError::Upstream(format!("TLS handshake with {label}: {e}")))?;

        Ok(BufReader::new(Box::new(stream) as BoxStream))
    }
}

fn wants_close(head: &ResponseHead) -> bool {
    head.headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("close"))
}

fn pool_key(target: &Uri) -> String {
    format!(
        "{}://{}:{}",
        if target_is_tls(target) { "tls" } else { "tcp" },
        target.host().unwrap_or_default(),
        effective_port(target)
    )
}
