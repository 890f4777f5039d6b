//! Broker client construction
//!
//! Builds the `rumqttc` clients the bridge talks through: URL parsing with
//! per-scheme default ports, TLS transport for the cloud side, token
//! authentication, and the CONNACK wait that turns "client created" into
//! "client connected".

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Packet, QoS,
    TlsConfiguration, Transport,
};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::BridgeTuning;
use crate::route::{Destination, PublishError};

use super::BridgeError;

/// Broker connection scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerScheme {
    /// Plain MQTT over TCP (`tcp://`, `mqtt://`)
    Tcp,
    /// MQTT over TLS (`ssl://`, `mqtts://`, `tls://`)
    Ssl,
}

impl BrokerScheme {
    /// Default port for this scheme.
    pub fn default_port(&self) -> u16 {
        match self {
            BrokerScheme::Tcp => 1883,
            BrokerScheme::Ssl => 8883,
        }
    }

    /// Check if this scheme uses TLS.
    pub fn uses_tls(&self) -> bool {
        matches!(self, BrokerScheme::Ssl)
    }
}

impl fmt::Display for BrokerScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerScheme::Tcp => write!(f, "tcp"),
            BrokerScheme::Ssl => write!(f, "ssl"),
        }
    }
}

/// A parsed broker URL: scheme, host and port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerUrl {
    scheme: BrokerScheme,
    host: String,
    port: u16,
}

impl BrokerUrl {
    /// Parse a `scheme://host[:port]` broker URL.
    ///
    /// Missing ports fall back to the scheme default (1883 plain, 8883 TLS).
    pub fn parse(url: &str) -> Result<Self, BridgeError> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| BridgeError::InvalidUrl(format!("missing scheme in {:?}", url)))?;

        let scheme = match scheme {
            "tcp" | "mqtt" => BrokerScheme::Tcp,
            "ssl" | "mqtts" | "tls" => BrokerScheme::Ssl,
            other => {
                return Err(BridgeError::InvalidUrl(format!(
                    "unsupported scheme {:?} in {:?}",
                    other, url
                )))
            }
        };

        let authority = rest.split('/').next().unwrap_or("");
        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse().map_err(|_| {
                    BridgeError::InvalidUrl(format!("invalid port {:?} in {:?}", port, url))
                })?;
                (host, port)
            }
            None => (authority, scheme.default_port()),
        };

        if host.is_empty() {
            return Err(BridgeError::InvalidUrl(format!("missing host in {:?}", url)));
        }

        Ok(Self {
            scheme,
            host: host.to_string(),
            port,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_tls(&self) -> bool {
        self.scheme.uses_tls()
    }
}

impl fmt::Display for BrokerUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// Build a client id carrying a millisecond timestamp.
pub(crate) fn timestamped_id(prefix: &str) -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    format!("{}-{}", prefix, millis)
}

/// Connect a client to a broker and wait for its CONNACK.
///
/// A non-empty token is presented as the MQTT username with an empty
/// password. Returns the connected client and its event loop; the caller
/// owns polling from here on.
pub(crate) async fn connect(
    url: &BrokerUrl,
    token: &str,
    client_id: String,
    tuning: &BridgeTuning,
) -> Result<(AsyncClient, EventLoop), BridgeError> {
    debug!("building client {} for {}", client_id, url);

    let mut options = MqttOptions::new(client_id, url.host(), url.port());
    options.set_keep_alive(Duration::from_secs(tuning.keep_alive));
    options.set_clean_session(true);

    if !token.is_empty() {
        options.set_credentials(token, "");
    }

    if url.is_tls() {
        let tls = tls_config(tuning.tls_insecure)?;
        options.set_transport(Transport::Tls(TlsConfiguration::Rustls(Arc::new(tls))));
    }

    let (client, mut eventloop) = AsyncClient::new(options, 64);

    match timeout(
        Duration::from_secs(tuning.connect_timeout),
        await_connack(&mut eventloop),
    )
    .await
    {
        Ok(Ok(())) => Ok((client, eventloop)),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(BridgeError::Connect(format!("timed out connecting to {}", url))),
    }
}

/// Poll the event loop until the broker accepts or rejects the connection.
async fn await_connack(eventloop: &mut EventLoop) -> Result<(), BridgeError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return match ack.code {
                    ConnectReturnCode::Success => Ok(()),
                    code => Err(connack_error(code)),
                };
            }
            Ok(_) => continue,
            Err(e) => return Err(classify(&e)),
        }
    }
}

fn connack_error(code: ConnectReturnCode) -> BridgeError {
    match code {
        ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized => {
            BridgeError::BadCredentials(format!("connection refused: {:?}", code))
        }
        code => BridgeError::Connect(format!("connection refused: {:?}", code)),
    }
}

/// Map an event-loop error onto the bridge error taxonomy.
///
/// Credential rejections get their own variant so the reconnect backoff can
/// treat them differently.
pub(crate) fn classify(error: &ConnectionError) -> BridgeError {
    match error {
        ConnectionError::ConnectionRefused(code) => connack_error(*code),
        other => BridgeError::Connect(other.to_string()),
    }
}

/// TLS client configuration for the cloud connection.
///
/// Verifies against the platform root store unless `insecure` is set, in
/// which case certificate verification is skipped entirely.
fn tls_config(insecure: bool) -> Result<rustls::ClientConfig, BridgeError> {
    if insecure {
        warn!("TLS certificate verification is disabled");
        return Ok(rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
            .with_no_client_auth());
    }

    let mut roots = rustls::RootCertStore::empty();
    let certs = rustls_native_certs::load_native_certs()
        .map_err(|e| BridgeError::Connect(format!("loading root certificates: {}", e)))?;
    for cert in certs {
        // tolerate individual unparsable platform certificates
        let _ = roots.add(cert);
    }

    Ok(rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth())
}

/// Skip server certificate verification (opt-in via `bridge.tls_insecure`).
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
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

#[async_trait]
impl Destination for AsyncClient {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), PublishError> {
        AsyncClient::publish(self, topic, QoS::AtMostOnce, false, payload)
            .await
            .map_err(|e| PublishError(e.to_string()))
    }
}
