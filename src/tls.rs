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

use std::{fs::File, io::BufReader, sync::Arc};

use anyhow::{anyhow, Context, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, ServerConfig};

use crate::config::TlsConfig;

/// Builds the rustls server config for the encrypted listener half.
///
/// Certificate and key come from the configured PEM files; without them a
/// self-signed certificate is generated at startup, which is enough for
/// clients that skip verification the way most IPP tooling does.
pub fn server_config(cfg: &TlsConfig) -> Result<Arc<ServerConfig>> {
    let (certs, key) = match (&cfg.cert_path, &cfg.key_path) {
        (Some(cert_path), Some(key_path)) => {
            let mut reader = BufReader::new(
                File::open(cert_path)
                    .with_context(|| format!("failed to open {}", cert_path.display()))?,
            );
            let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
                .collect::<std::io::Result<_>>()
                .with_context(|| format!("bad certificate PEM: {}", cert_path.display()))?;

            let mut reader = BufReader::new(
                File::open(key_path)
                    .with_context(|| format!("failed to open {}", key_path.display()))?,
            );
            let key = rustls_pemfile::private_key(&mut reader)
                .with_context(|| format!("bad key PEM: {}", key_path.display()))?
                .ok_or_else(|| anyhow!("no private key in {}", key_path.display()))?;

            (certs, key)
        }
        (None, None) => generate_self_signed()?,
        _ => {
            return Err(anyhow!(
                "tls.cert_path and tls.key_path must be configured together"
            ))
        }
    };

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("invalid server certificate")?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}

fn generate_self_signed() -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .context("failed to generate self-signed certificate")?;
    let der = cert.serialize_der().context("certificate serialization")?;
    let key = cert.serialize_private_key_der();

    tracing::info!("no TLS material configured, using a generated self-signed certificate");

    Ok((
        vec![CertificateDer::from(der)],
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key)),
    ))
}

/// Builds the client config used when dialing https/ipps devices.
/// `insecure` skips certificate verification, which most printers with
/// factory self-signed certificates require.
pub fn client_config(insecure: bool) -> Arc<ClientConfig> {
    let config = if insecure {
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerify::new()))
            .with_no_client_auth()
    } else {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    };
    Arc::new(config)
}

/// Accepts any server certificate. Signatures are still checked so the
/// session itself is sound; only the identity binding is skipped.
#[derive(Debug)]
struct NoVerify {
    provider: rustls::crypto::CryptoProvider,
}

impl NoVerify {
    fn new() -> Self {
        Self {
            provider: rustls::crypto::aws_lc_rs::default_provider(),
        }
    }
}

impl rustls::client::danger::ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
