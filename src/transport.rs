use anyhow::Context;
use quinn::{Connection, Endpoint, RecvStream, SendStream};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::info;

const SERVER_NAME: &str = "wireline-peer";

/// Ordered bidirectional text channel between the two endpoints. The bridge
/// is generic over this seam; the production implementation rides one QUIC
/// bidirectional stream.
#[allow(async_fn_in_trait)]
pub trait Channel {
    async fn send_text(&mut self, text: &str) -> anyhow::Result<()>;
    /// Returns `None` once the channel has closed.
    async fn recv_text(&mut self) -> Option<String>;
    /// Opaque connection-state string carried in METRIC frames.
    fn status(&self) -> String;
}

/// QUIC-backed peer channel: text messages framed as a big-endian u16 length
/// followed by that many UTF-8 bytes, on a single bidirectional stream.
pub struct PeerChannel {
    // Keeps the endpoint driver alive for the life of the connection.
    _endpoint: Endpoint,
    conn: Connection,
    send: SendStream,
    recv: RecvStream,
}

impl Channel for PeerChannel {
    async fn send_text(&mut self, text: &str) -> anyhow::Result<()> {
        let bytes = text.as_bytes();
        let len = u16::try_from(bytes.len()).context("channel message exceeds 64 KiB")?;
        self.send.write_all(&len.to_be_bytes()).await?;
        self.send.write_all(bytes).await?;
        Ok(())
    }

    async fn recv_text(&mut self) -> Option<String> {
        let len = self.recv.read_u16().await.ok()?;
        let mut buf = vec![0u8; len as usize];
        self.recv.read_exact(&mut buf).await.ok()?;
        Some(String::from_utf8_lossy(&buf).into_owned())
    }

    fn status(&self) -> String {
        match self.conn.close_reason() {
            None => format!("connected:{}", self.conn.remote_address()),
            Some(reason) => format!("closed:{reason}"),
        }
    }
}

/// Builds the initiator's listening endpoint. Manual socket creation so a
/// `[::]` listener accepts both address families.
pub fn bind(listen: SocketAddr, key_path: &str) -> anyhow::Result<Endpoint> {
    let server_config = configure_server(key_path)?;

    let socket = socket2::Socket::new(
        if listen.is_ipv4() {
            socket2::Domain::IPV4
        } else {
            socket2::Domain::IPV6
        },
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )?;
    socket.set_reuse_address(true)?;
    #[cfg(not(windows))]
    socket.set_reuse_port(true)?;
    if listen.is_ipv6() {
        socket.set_only_v6(false)?;
    }
    socket.bind(&listen.into())?;
    socket.set_nonblocking(true)?;

    let std_socket: std::net::UdpSocket = socket.into();
    let endpoint = Endpoint::new(
        Default::default(),
        Some(server_config),
        std_socket,
        Arc::new(quinn::TokioRuntime),
    )?;
    Ok(endpoint)
}

/// Accepts the responder's connection and the channel stream on it. The
/// stream surfaces once the responder sends its first message.
pub async fn accept_channel(endpoint: &Endpoint) -> anyhow::Result<PeerChannel> {
    let incoming = endpoint
        .accept()
        .await
        .context("channel endpoint closed while waiting for the peer")?;
    let conn = incoming.await?;
    info!("peer connected from {}", conn.remote_address());
    let (send, recv) = conn.accept_bi().await?;
    Ok(PeerChannel {
        _endpoint: endpoint.clone(),
        conn,
        send,
        recv,
    })
}

/// Dials the address advertised in the offer and opens the channel stream.
pub async fn connect(addr: SocketAddr) -> anyhow::Result<PeerChannel> {
    let bind: SocketAddr = if addr.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let endpoint = Endpoint::client(bind)?;
    let conn = endpoint
        .connect_with(configure_client(), addr, SERVER_NAME)?
        .await?;
    info!("channel connected to {}", conn.remote_address());
    let (send, recv) = conn.open_bi().await?;
    Ok(PeerChannel {
        _endpoint: endpoint,
        conn,
        send,
        recv,
    })
}

fn configure_server(key_path: &str) -> anyhow::Result<quinn::ServerConfig> {
    let pem = std::fs::read_to_string(key_path)
        .with_context(|| format!("read private key {key_path}"))?;
    let (cert_chain, key) = identity_from_pem(&pem)?;

    let mut server_config = quinn::ServerConfig::with_single_cert(cert_chain, key)?;

    let mut transport_config = quinn::TransportConfig::default();
    transport_config.max_idle_timeout(Some(std::time::Duration::from_secs(10).try_into()?));
    server_config.transport_config(Arc::new(transport_config));

    Ok(server_config)
}

fn identity_from_pem(
    pem: &str,
) -> anyhow::Result<(
    Vec<rustls::pki_types::CertificateDer<'static>>,
    rustls::pki_types::PrivateKeyDer<'static>,
)> {
    let key_pair =
        rcgen::KeyPair::from_pem(pem).map_err(|e| anyhow::anyhow!("failed to parse key: {}", e))?;

    let subject_alt_names = vec!["localhost".to_string(), SERVER_NAME.to_string()];
    let mut params = rcgen::CertificateParams::new(subject_alt_names);
    params.key_pair = Some(key_pair);

    let cert = rcgen::Certificate::from_params(params)?;
    let cert_der = cert.serialize_der()?;
    let priv_key_der = cert.serialize_private_key_der();

    let priv_key = rustls::pki_types::PrivateKeyDer::Pkcs8(priv_key_der.into());
    let cert_chain = vec![rustls::pki_types::CertificateDer::from(cert_der)];

    Ok((cert_chain, priv_key))
}

fn configure_client() -> quinn::ClientConfig {
    let mut crypto = rustls::ClientConfig::builder()
        .with_root_certificates(rustls::RootCertStore::empty())
        .with_no_client_auth();

    // Peers present self-signed certificates.
    // TODO: pin the certificate fingerprint exchanged in the offer.
    crypto
        .dangerous()
        .set_certificate_verifier(Arc::new(SkipServerVerification));

    // unwrap is safe as long as crypto is valid for QUIC (TLS 1.3)
    let quic_config = quinn::crypto::rustls::QuicClientConfig::try_from(crypto).unwrap();

    quinn::ClientConfig::new(Arc::new(quic_config))
}

#[derive(Debug)]
struct SkipServerVerification;

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

/// In-memory channel double for bridge tests: two crossed mpsc pairs.
#[cfg(test)]
pub struct MockChannel {
    pub tx: tokio::sync::mpsc::UnboundedSender<String>,
    pub rx: tokio::sync::mpsc::UnboundedReceiver<String>,
}

#[cfg(test)]
impl Channel for MockChannel {
    async fn send_text(&mut self, text: &str) -> anyhow::Result<()> {
        self.tx.send(text.to_string())?;
        Ok(())
    }

    async fn recv_text(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    fn status(&self) -> String {
        "mock".to_string()
    }
}

#[cfg(test)]
pub fn mock_pair() -> (MockChannel, MockChannel) {
    let (a_tx, a_rx) = tokio::sync::mpsc::unbounded_channel();
    let (b_tx, b_rx) = tokio::sync::mpsc::unbounded_channel();
    (
        MockChannel { tx: a_tx, rx: b_rx },
        MockChannel { tx: b_tx, rx: a_rx },
    )
}
