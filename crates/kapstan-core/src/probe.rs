//! Waits for the control plane's TLS endpoint to become usable.
//!
//! Chain-of-trust verification is disabled (the control plane serves a
//! self-signed certificate), but identity is still checked: the peer
//! certificate must carry a subject-alternative-name equal to the guest's
//! current address. A freshly restarted guest can briefly serve a
//! certificate scoped to its previous address, and accepting it would let
//! clients talk to the wrong endpoint.

use std::net::{IpAddr, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::{ClientConfig, ClientConnection, DigitallySignedStruct, SignatureScheme};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use tracing::{debug, warn};
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::CoreError;

/// Accepts any chain; identity is checked separately against the SAN list.
#[derive(Debug)]
struct AcceptAnyChain(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyChain {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

pub struct ReadinessProbe {
    delay: Duration,
    tls: Arc<ClientConfig>,
}

impl Default for ReadinessProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadinessProbe {
    #[must_use]
    pub fn new() -> Self {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let tls = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyChain(provider)))
            .with_no_client_auth();
        Self {
            delay: Duration::from_millis(500),
            tls: Arc::new(tls),
        }
    }

    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Polls until the endpoint at the guest's address serves a certificate
    /// naming that address, or `cancelled` returns true.
    ///
    /// Never gives up on its own: refused or reset connections are the
    /// normal not-up-yet case, and anything else is logged and retried as
    /// possibly transient. Returns the address that became ready, or `None`
    /// when cancelled.
    pub fn wait_for_ready(
        &self,
        address: impl Fn() -> Option<String>,
        port: u16,
        cancelled: impl Fn() -> bool,
    ) -> Result<Option<String>, CoreError> {
        loop {
            if cancelled() {
                return Ok(None);
            }
            if let Some(addr) = address() {
                match self.attempt(&addr, port) {
                    Ok(true) => return Ok(Some(addr)),
                    Ok(false) => {}
                    Err(err) => {
                        warn!(address = %addr, port, %err, "readiness check failed, retrying");
                    }
                }
            } else {
                debug!("guest address not assigned yet");
            }
            thread::sleep(self.delay);
        }
    }

    /// One connection attempt. `Ok(false)` means not ready yet.
    fn attempt(&self, addr: &str, port: u16) -> Result<bool, CoreError> {
        let mut tcp = match TcpStream::connect((addr, port)) {
            Ok(stream) => stream,
            Err(err) if is_not_up_yet(&err) => return Ok(false),
            Err(err) => return Err(err.into()),
        };
        let server_name = ServerName::try_from(addr.to_owned())
            .map_err(|_| rustls::Error::General(format!("invalid server name {addr}")))?;
        let mut conn = ClientConnection::new(Arc::clone(&self.tls), server_name)?;
        while conn.is_handshaking() {
            match conn.complete_io(&mut tcp) {
                Ok(_) => {}
                Err(err) if is_not_up_yet(&err) => return Ok(false),
                Err(err) => return Err(err.into()),
            }
        }
        let Some(cert) = conn.peer_certificates().and_then(|certs| certs.first()) else {
            return Ok(false);
        };
        if san_matches(cert.as_ref(), addr) {
            Ok(true)
        } else {
            debug!(address = addr, "certificate does not name the guest address yet");
            Ok(false)
        }
    }
}

fn is_not_up_yet(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::ConnectionReset
    )
}

/// True when the certificate's SAN list contains `addr` as either a DNS
/// name or an IP address entry.
fn san_matches(der: &[u8], addr: &str) -> bool {
    let Ok((_, cert)) = X509Certificate::from_der(der) else {
        debug!("peer certificate is not parseable");
        return false;
    };
    let Ok(Some(san)) = cert.subject_alternative_name() else {
        return false;
    };
    let ip: Option<IpAddr> = addr.parse().ok();
    san.value.general_names.iter().any(|name| match name {
        GeneralName::DNSName(dns) => *dns == addr,
        GeneralName::IPAddress(bytes) => match ip {
            Some(IpAddr::V4(v4)) => *bytes == v4.octets().as_slice(),
            Some(IpAddr::V6(v6)) => *bytes == v6.octets().as_slice(),
            None => false,
        },
        _ => false,
    })
}
