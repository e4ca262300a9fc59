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

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::config::RelayConfig;
use crate::proxy::Proxy;
use crate::trace::TraceWriter;

/// Wires configuration into running proxies: one [`Proxy`] per configured
/// mapping, all sharing one trace sink and one shutdown token.
pub struct App {
    proxies: Vec<Proxy>,
    cancel: CancellationToken,
}

impl App {
    pub async fn new(config: RelayConfig) -> Result<Self> {
        let cancel = CancellationToken::new();

        let trace = match &config.trace.dir {
            Some(dir) => {
                tracing::info!("tracing requests to {}", dir.display());
                Some(TraceWriter::new(dir.clone())?)
            }
            None => None,
        };

        let mut proxies = Vec::new();
        for mapping in config.mappings()? {
            tracing::info!(
                "mapping port {} -> {} ({:?})",
                mapping.local_port,
                mapping.target_url,
                mapping.protocol
            );
            let proxy = Proxy::start(
                &cancel,
                mapping,
                &config.tls,
                &config.upstream,
                trace.clone(),
            )
            .await?;
            proxies.push(proxy);
        }

        Ok(Self { proxies, cancel })
    }

    /// Serves until Ctrl-C, then shuts everything down and waits for all
    /// in-flight work to drain.
    pub async fn run(self) -> Result<()> {
        tokio::signal::ctrl_c().await?;
        tracing::info!("shutting down");
        self.shutdown().await;
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.cancel.cancel();
        for proxy in &self.proxies {
            proxy.shutdown().await;
        }
    }
}
