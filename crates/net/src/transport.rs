//! QUIC endpoints using quinn with rustls.
//!
//! Development builds use self-signed certificates; clients skip verification.

use anyhow::{Context, Result};
use quinn::{ClientConfig, Endpoint, ServerConfig};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// ALPN identifier negotiated by both ends.
pub const ALPN: &[u8] = b"skirmish";

/// Transport tuning shared by server and client drivers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Keep-alive ping interval in seconds.
    pub keep_alive_secs: u64,
    /// Connection idle timeout in seconds.
    pub idle_timeout_secs: u64,
    /// Worker threads for the I/O runtime.
    pub io_threads: usize,
    /// Capacity of the transport → simulation event queue.
    pub event_queue_capacity: usize,
    /// Server name presented during the TLS handshake.
    pub server_name: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            keep_alive_secs: 5,
            idle_timeout_secs: 30,
            io_threads: 2,
            event_queue_capacity: 1024,
            server_name: "localhost".to_string(),
        }
    }
}

impl TransportConfig {
    fn quinn_transport(&self) -> Result<quinn::TransportConfig> {
        let mut transport = quinn::TransportConfig::default();
        transport.keep_alive_interval(Some(Duration::from_secs(self.keep_alive_secs)));
        transport.max_idle_timeout(Some(
            Duration::from_secs(self.idle_timeout_secs)
                .try_into()
                .context("Idle timeout out of range")?,
        ));
        Ok(transport)
    }
}

/// Server endpoint for accepting QUIC connections.
pub struct ServerEndpoint {
    endpoint: Endpoint,
    addr: SocketAddr,
}

impl ServerEndpoint {
    /// Bind a server endpoint. Must be called inside a tokio runtime context.
    pub fn bind(addr: SocketAddr, config: &TransportConfig) -> Result<Self> {
        info!(%addr, "Creating server endpoint");

        let _ = rustls::crypto::ring::default_provider().install_default();

        let (cert, key) = generate_self_signed_cert()?;

        let mut server_crypto = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert], key)
            .context("Failed to build rustls ServerConfig")?;
        server_crypto.alpn_protocols = vec![ALPN.to_vec()];

        let mut server_config = ServerConfig::with_crypto(Arc::new(
            quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)
                .context("Failed to create QuicServerConfig")?,
        ));
        server_config.transport_config(Arc::new(config.quinn_transport()?));

        let endpoint =
            Endpoint::server(server_config, addr).context("Failed to bind server endpoint")?;
        let actual_addr = endpoint.local_addr()?;
        info!(addr = %actual_addr, "Server endpoint bound");

        Ok(Self {
            endpoint,
            addr: actual_addr,
        })
    }

    /// Local address this endpoint is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Accept an incoming connection; `None` once the endpoint is closed.
    pub async fn accept(&self) -> Option<quinn::Incoming> {
        self.endpoint.accept().await
    }

    /// Close the endpoint, rejecting new connections.
    pub fn close(&self) {
        self.endpoint.close(0u32.into(), b"server shutting down");
    }
}

/// Client endpoint for establishing QUIC connections.
pub struct ClientEndpoint {
    endpoint: Endpoint,
    server_name: String,
}

impl ClientEndpoint {
    /// Create a client endpoint on an ephemeral port. Must be called inside a tokio
    /// runtime context.
    pub fn new(config: &TransportConfig) -> Result<Self> {
        debug!("Creating client endpoint");

        let _ = rustls::crypto::ring::default_provider().install_default();

        let mut client_crypto = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
            .with_no_client_auth();
        client_crypto.alpn_protocols = vec![ALPN.to_vec()];

        let mut client_config = ClientConfig::new(Arc::new(
            quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)
                .context("Failed to create QuicClientConfig")?,
        ));
        client_config.transport_config(Arc::new(config.quinn_transport()?));

        let mut endpoint = Endpoint::client("0.0.0.0:0".parse()?)?;
        endpoint.set_default_client_config(client_config);

        debug!(addr = %endpoint.local_addr()?, "Client endpoint created");

        Ok(Self {
            endpoint,
            server_name: config.server_name.clone(),
        })
    }

    /// Local address of the client socket.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.endpoint.local_addr()?)
    }

    /// Start a handshake; await the returned future for the connection.
    pub fn begin_connect(&self, server_addr: SocketAddr) -> Result<quinn::Connecting> {
        info!(%server_addr, "Connecting to server");
        self.endpoint
            .connect(server_addr, &self.server_name)
            .context("Failed to initiate connection")
    }

    /// Connect and wait for the handshake to finish.
    pub async fn connect(&self, server_addr: SocketAddr) -> Result<quinn::Connection> {
        let connection = self
            .begin_connect(server_addr)?
            .await
            .context("Failed to establish connection")?;
        info!(%server_addr, "Connected to server");
        Ok(connection)
    }

    /// Close the endpoint, terminating all connections.
    pub fn close(&self) {
        self.endpoint.close(0u32.into(), b"client shutting down");
    }
}

fn generate_self_signed_cert() -> Result<(CertificateDer<'static>, PrivateKeyDer<'static>)> {
    debug!("Generating self-signed certificate");

    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .context("Failed to generate certificate")?;

    let key = PrivateKeyDer::Pkcs8(cert.key_pair.serialize_der().into());
    let cert_der = CertificateDer::from(cert.cert);

    Ok((cert_der, key))
}

/// Accepts any server certificate. Development only.
#[derive(Debug)]
struct SkipServerVerification;

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn server_binds_ephemeral_port() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let server =
            ServerEndpoint::bind(addr, &TransportConfig::default()).expect("Failed to bind server");
        assert!(server.local_addr().port() > 0);
    }

    #[tokio::test]
    async fn handshake_negotiates_alpn() {
        let config = TransportConfig::default();
        let server = ServerEndpoint::bind("127.0.0.1:0".parse().unwrap(), &config)
            .expect("Failed to bind server");
        let server_addr = server.local_addr();

        let server_handle = tokio::spawn(async move {
            let incoming = server.accept().await.expect("Server closed before accepting");
            incoming.await.expect("Failed to accept connection")
        });

        let client = ClientEndpoint::new(&config).expect("Failed to create client");
        let client_conn = client.connect(server_addr).await.expect("Failed to connect");
        let server_conn = server_handle.await.expect("Server task panicked");

        assert_eq!(client_conn.remote_address(), server_addr);
        assert!(server_conn.remote_address().port() > 0);

        client_conn.close(0u32.into(), b"done");
        server_conn.close(0u32.into(), b"done");
    }

    #[test]
    fn config_defaults_fill_missing_fields() {
        let config: TransportConfig = serde_json::from_str(r#"{"idle_timeout_secs": 10}"#).unwrap();
        assert_eq!(config.idle_timeout_secs, 10);
        assert_eq!(config.keep_alive_secs, 5);
        assert_eq!(config.server_name, "localhost");
    }
}
