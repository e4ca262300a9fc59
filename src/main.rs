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

use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Parser;
use printrelay::app::App;
use printrelay::config::{MappingConfig, ProxyProtocol, RelayConfig, TraceConfig, UpstreamConfig};
use printrelay::utils::init_tracing;

/// Intercepting IPP/HTTP reverse proxy for multi-function printers.
///
/// Either point it at a TOML config file with one or more [[proxy]]
/// mappings, or describe a single mapping directly on the command line.
#[derive(Debug, Parser)]
#[command(name = "printrelay")]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Local TCP port to listen on (single-mapping mode).
    #[arg(long)]
    local_port: Option<u16>,

    /// Device URL, e.g. ipp://printer.local:631/ipp/print
    /// (single-mapping mode).
    #[arg(long)]
    target: Option<String>,

    /// Protocol served on the local port: ipp or http.
    #[arg(long, default_value = "ipp")]
    protocol: String,

    /// Directory for per-request trace records.
    #[arg(long)]
    trace_dir: Option<PathBuf>,

    /// Skip certificate verification when dialing https/ipps devices.
    #[arg(long)]
    insecure: bool,

    /// Enable JSON-formatted logs.
    #[arg(long, default_value_t = false)]
    json_logs: bool,
}

impl Cli {
    fn into_config(self) -> Result<RelayConfig> {
        if let Some(path) = &self.config {
            let mut config = RelayConfig::load(path)?;
            if let Some(dir) = self.trace_dir {
                config.trace.dir = Some(dir);
            }
            if self.insecure {
                config.upstream.insecure_tls = true;
            }
            return Ok(config);
        }

        let (local_port, target_url) = match (self.local_port, self.target) {
            (Some(port), Some(target)) => (port, target),
            _ => bail!("either --config or both --local-port and --target are required"),
        };
        let protocol = match self.protocol.as_str() {
            "ipp" => ProxyProtocol::Ipp,
            "http" => ProxyProtocol::Http,
            other => bail!("bad --protocol {other:?}, expected ipp or http"),
        };

        Ok(RelayConfig {
            proxies: vec![MappingConfig {
                local_port,
                target_url,
                protocol,
            }],
            tls: Default::default(),
            upstream: UpstreamConfig {
                insecure_tls: self.insecure,
                ..Default::default()
            },
            trace: TraceConfig {
                dir: self.trace_dir,
            },
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = cli.into_config()?;
    for m in &config.proxies {
        m.mapping()?;
    }

    let app = App::new(config).await?;
    app.run().await
}
