//! TLS credential assembly for the control plane.
//!
//! With only a certificate and key, peers get confidentiality and server
//! authentication. Adding a CA file turns on mutual authentication: the
//! server requires client certificates signed by that CA, and clients
//! verify the server against it.

use std::net::IpAddr;

use anyhow::Context;
use tonic::transport::{Certificate, ClientTlsConfig, Identity, ServerTlsConfig};

use crate::config::TlsConfig;

/// Server-side credentials. A configured CA enables required client-cert
/// verification.
pub fn server_tls(cfg: &TlsConfig) -> anyhow::Result<ServerTlsConfig> {
    let identity = load_identity(cfg)?;
    let mut tls = ServerTlsConfig::new().identity(identity);
    if let Some(ca_file) = &cfg.ca_file {
        let ca = std::fs::read(ca_file)
            .with_context(|| format!("failed to read CA file {}", ca_file.display()))?;
        tls = tls.client_ca_root(Certificate::from_pem(ca));
    }
    Ok(tls)
}

/// Client-side credentials for dialing a peer at `peer_address`. The peer's
/// certificate must carry the address as a SAN.
pub fn client_tls(cfg: &TlsConfig, peer_address: IpAddr) -> anyhow::Result<ClientTlsConfig> {
    let identity = load_identity(cfg)?;
    let mut tls = ClientTlsConfig::new()
        .identity(identity)
        .domain_name(peer_address.to_string());
    if let Some(ca_file) = &cfg.ca_file {
        let ca = std::fs::read(ca_file)
            .with_context(|| format!("failed to read CA file {}", ca_file.display()))?;
        tls = tls.ca_certificate(Certificate::from_pem(ca));
    }
    Ok(tls)
}

fn load_identity(cfg: &TlsConfig) -> anyhow::Result<Identity> {
    let cert = std::fs::read(&cfg.cert_file)
        .with_context(|| format!("failed to read certificate {}", cfg.cert_file.display()))?;
    let key = std::fs::read(&cfg.key_file)
        .with_context(|| format!("failed to read key {}", cfg.key_file.display()))?;
    Ok(Identity::from_pem(cert, key))
}
