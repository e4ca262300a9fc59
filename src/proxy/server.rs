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

use std::{net::SocketAddr, sync::atomic::AtomicU32, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::time::sleep;
use tokio_rustls::TlsAcceptor;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::config::{Mapping, TlsConfig, UpstreamConfig};
use crate::net::AutoTlsListener;
use crate::proxy::client::Client;
use crate::proxy::session;
use crate::trace::TraceWriter;
use crate::tls;
use crate::utils::ProxyError;

/// One proxy instance: a local port, an auto-TLS listener pair, a plain
/// and a TLS-terminated serve loop, and the shared upstream client.
///
/// All tasks spawned here are tracked; [`Proxy::shutdown`] fires the
/// cancellation token, closes the listeners and waits until every task
/// has drained.
pub struct Proxy {
    cancel: CancellationToken,
    tracker: TaskTracker,
    local_addr: SocketAddr,
    mapping: Mapping,
}

/// Per-proxy state shared by every session: the mapping, the upstream
/// client, the trace handle, the request counter and the shutdown token.
pub(crate) struct Shared {
    pub(crate) mapping: Mapping,
    pub(crate) client: Client,
    pub(crate) trace: Option<TraceWriter>,
    pub(crate) rqnum: AtomicU32,
    pub(crate) cancel: CancellationToken,
}

impl Proxy {
    /// Binds the local port and starts serving. The proxy derives its
    /// lifetime from `parent`: cancelling it is equivalent to shutdown.
    pub async fn start(
        parent: &CancellationToken,
        mapping: Mapping,
        tls_cfg: &TlsConfig,
        upstream_cfg: &UpstreamConfig,
        trace: Option<TraceWriter>,
    ) -> Result<Proxy> {
        let listener = TcpListener::bind(("0.0.0.0", mapping.local_port))
            .await
            .with_context(|| format!("failed to bind port {}", mapping.local_port))?;
        let local_addr = listener.local_addr()?;

        tracing::debug!(
            "proxy started: {} -> {}",
            mapping.local_port,
            mapping.target_url
        );

        let (plain, encrypted) = AutoTlsListener::new(listener)?;
        let acceptor = TlsAcceptor::from(tls::server_config(tls_cfg)?);

        let cancel = parent.child_token();
        let shared = Arc::new(Shared {
            mapping: mapping.clone(),
            client: Client::new(upstream_cfg),
            trace,
            rqnum: AtomicU32::new(0),
            cancel: cancel.clone(),
        });
        let tracker = TaskTracker::new();

        // Cancellation closes the listener pair, which unblocks both
        // serve loops and aborts anything still in detection.
        {
            let cancel = cancel.clone();
            let closer = plain.clone();
            tracker.spawn(async move {
                cancel.cancelled().await;
                closer.close().await;
            });
        }

        {
            let shared = shared.clone();
            let conn_tracker = tracker.clone();
            tracker.spawn(serve_plain(plain, shared, conn_tracker));
        }
        {
            let shared = shared.clone();
            let conn_tracker = tracker.clone();
            tracker.spawn(serve_encrypted(encrypted, acceptor, shared, conn_tracker));
        }

        Ok(Proxy {
            cancel,
            tracker,
            local_addr,
            mapping,
        })
    }

    /// Address the proxy is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Fires the cancellation token and waits until every accept loop and
    /// connection task has finished.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        tracing::debug!(
            "proxy finished: {} -> {}",
            self.mapping.local_port,
            self.mapping.target_url
        );
    }
}

async fn serve_plain(listener: AutoTlsListener, shared: Arc<Shared>, tracker: TaskTracker) {
    loop {
        match listener.accept().await {
            Ok(conn) => {
                let peer = conn.peer_addr().ok();
                let shared = shared.clone();
                tracker.spawn(async move {
                    session::serve_connection(shared, conn, peer).await;
                });
            }
            Err(ProxyError::ListenerClosed) => break,
            Err(err) => {
                // Detection failures abort the offending socket only.
                tracing::warn!("accept: {err}");
                sleep(Duration::from_millis(50)).await;
            }
        }
    }
}

async fn serve_encrypted(
    listener: AutoTlsListener,
    acceptor: TlsAcceptor,
    shared: Arc<Shared>,
    tracker: TaskTracker,
) {
    loop {
        match listener.accept().await {
            Ok(conn) => {
                let peer = conn.peer_addr().ok();
                let acceptor = acceptor.clone();
                let shared = shared.clone();
                tracker.spawn(async move {
                    let stream = tokio::select! {
                        res = acceptor.accept(conn) => match res {
                            Ok(stream) => stream,
                            Err(err) => {
                                tracing::debug!("TLS handshake failed: {err}");
                                return;
                            }
                        },
                        _ = shared.cancel.cancelled() => return,
                    };
                    session::serve_connection(shared, stream, peer).await;
                });
            }
            Err(ProxyError::ListenerClosed) => break,
            Err(err) => {
                tracing::warn!("accept: {err}");
                sleep(Duration::from_millis(50)).await;
            }
        }
    }
}
