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

use std::{fs, path::Path, path::PathBuf};

use anyhow::{bail, Context, Result};
use http::Uri;
use serde::Deserialize;

/// Top-level configuration parsed from the printrelay TOML file.
///
/// Each nested struct captures one subsystem (mappings, TLS, upstream,
/// trace) so changes stay localized.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// One proxy instance per entry: a local port mapped onto one device.
    #[serde(rename = "proxy")]
    pub proxies: Vec<MappingConfig>,

    /// Server-side TLS material for the encrypted listener half.
    #[serde(default)]
    pub tls: TlsConfig,

    /// Upstream (device-side) connection options.
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Request tracing. Absent means tracing is off.
    #[serde(default)]
    pub trace: TraceConfig,
}

impl RelayConfig {
    /// Reads the config file, deserializes TOML and validates every mapping.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let cfg: RelayConfig = toml::from_str(&raw)
            .with_context(|| format!("invalid printrelay config: {}", path.display()))?;

        if cfg.proxies.is_empty() {
            bail!("{}: no [[proxy]] mappings configured", path.display());
        }
        for m in &cfg.proxies {
            m.mapping()?;
        }

        Ok(cfg)
    }

    /// Resolved mappings, in configuration order.
    pub fn mappings(&self) -> Result<Vec<Mapping>> {
        self.proxies.iter().map(MappingConfig::mapping).collect()
    }
}

/// Raw `[[proxy]]` table as written by the operator.
#[derive(Debug, Clone, Deserialize)]
pub struct MappingConfig {
    /// TCP port to listen on (all interfaces).
    pub local_port: u16,
    /// Device URL, e.g. `ipp://printer.local:631/ipp/print`.
    pub target_url: String,
    /// Protocol expected on this port.
    #[serde(default)]
    pub protocol: ProxyProtocol,
}

impl MappingConfig {
    pub fn mapping(&self) -> Result<Mapping> {
        let target_url = parse_target_url(&self.target_url)?;
        Ok(Mapping {
            local_port: self.local_port,
            target_url,
            protocol: self.protocol,
        })
    }
}

/// Immutable per-proxy configuration: one local port mapped onto one
/// target device origin.
#[derive(Debug, Clone)]
pub struct Mapping {
    pub local_port: u16,
    pub target_url: Uri,
    pub protocol: ProxyProtocol,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProxyProtocol {
    /// IPP bodies are decoded and rewritten; GET falls through as HTTP.
    #[default]
    Ipp,
    /// Bare HTTP passthrough only.
    Http,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TlsConfig {
    /// PEM certificate chain for the encrypted listener. When absent a
    /// self-signed certificate is generated at startup.
    pub cert_path: Option<PathBuf>,
    /// PEM private key matching `cert_path`.
    pub key_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Skip certificate verification when dialing https/ipps devices.
    /// Printers commonly ship self-signed certificates.
    #[serde(default)]
    pub insecure_tls: bool,

    /// Connect timeout, seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            insecure_tls: false,
            connect_timeout: default_connect_timeout(),
        }
    }
}

fn default_connect_timeout() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TraceConfig {
    /// Directory receiving one file per trace record.
    pub dir: Option<PathBuf>,
}

/// Parses and validates a device URL. The URL must be absolute with an
/// http, https, ipp or ipps scheme and a host.
pub fn parse_target_url(s: &str) -> Result<Uri> {
    let uri: Uri = s
        .parse()
        .with_context(|| format!("invalid target URL: {s:?}"))?;

    let scheme = uri
        .scheme_str()
        .with_context(|| format!("target URL {s:?} has no scheme"))?;
    if !matches!(scheme, "http" | "https" | "ipp" | "ipps") {
        bail!("target URL {s:?}: unsupported scheme {scheme:?}");
    }
    if uri.host().is_none() {
        bail!("target URL {s:?} has no host");
    }

    Ok(uri)
}

/// Default port for a URL scheme (RFC 8010 assigns 631 to ipp and ipps).
pub fn scheme_default_port(scheme: &str) -> u16 {
    match scheme {
        "https" => 443,
        "ipp" | "ipps" => 631,
        _ => 80,
    }
}

/// Effective port of a URI, falling back to the scheme default.
pub fn effective_port(uri: &Uri) -> u16 {
    uri.port_u16()
        .unwrap_or_else(|| scheme_default_port(uri.scheme_str().unwrap_or("http")))
}

/// True when the target must be dialed over TLS.
pub fn target_is_tls(uri: &Uri) -> bool {
    matches!(uri.scheme_str(), Some("https") | Some("ipps"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_ipp_target() {
        let uri = parse_target_url("ipp://device.local:631/ipp/print").unwrap();
        assert_eq!(uri.host(), Some("device.local"));
        assert_eq!(effective_port(&uri), 631);
        assert!(!target_is_tls(&uri));
    }

    #[test]
    fn ipp_default_port_is_631() {
        let uri = parse_target_url("ipp://device.local/ipp/print").unwrap();
        assert_eq!(effective_port(&uri), 631);
    }

    #[test]
    fn rejects_unknown_scheme() {
        assert!(parse_target_url("ftp://device.local/").is_err());
    }

    #[test]
    fn loads_toml_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.toml");
        std::fs::write(
            &path,
            r#"
[[proxy]]
local_port = 50000
target_url = "ipp://device.local:631/ipp/print"
protocol = "ipp"

[upstream]
insecure_tls = true
"#,
        )
        .unwrap();

        let cfg = RelayConfig::load(&path).unwrap();
        let mappings = cfg.mappings().unwrap();
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].local_port, 50000);
        assert_eq!(mappings[0].protocol, ProxyProtocol::Ipp);
        assert!(cfg.upstream.insecure_tls);
        assert!(cfg.trace.dir.is_none());
    }
}
