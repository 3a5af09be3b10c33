//! TLS helpers for Explicit and Implicit FTPS (RFC 4217).
//!
//! - Builds a rustls `ClientConfig` backed by the system trust store, or a
//!   non-verifying one when the profile opts out.
//! - Provides `upgrade_to_tls` for wrapping an existing plain codec.
//! - Wraps data connections with the same config so the server can resume
//!   the control session.

use crate::ftp::protocol::{FtpCodec, ReadHalf, WriteHalf};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{self, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use xfer_core::{XfrError, XfrResult};

/// Build the client TLS configuration for one session.
pub fn build_client_config(verify_certificates: bool) -> XfrResult<Arc<ClientConfig>> {
    let provider = Arc::new(crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| XfrError::protocol(format!("TLS setup: {}", e)))?;

    let config = if verify_certificates {
        let loaded = rustls_native_certs::load_native_certs();
        for err in &loaded.errors {
            log::warn!("Skipping unreadable system certificate: {}", err);
        }
        let mut roots = RootCertStore::empty();
        let (added, ignored) = roots.add_parsable_certificates(loaded.certs);
        log::debug!("Loaded {} system root certificates ({} ignored)", added, ignored);
        if roots.is_empty() {
            return Err(XfrError::certificate(
                "No trusted root certificates available on this system",
            ));
        }
        builder.with_root_certificates(roots).with_no_client_auth()
    } else {
        log::warn!("FTPS certificate verification disabled for this profile");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate(provider)))
            .with_no_client_auth()
    };
    Ok(Arc::new(config))
}

fn server_name(host: &str) -> XfrResult<ServerName<'static>> {
    ServerName::try_from(host.to_string())
        .map_err(|e| XfrError::protocol(format!("Invalid TLS server name '{}': {}", host, e)))
}

/// Perform a client handshake over `tcp`.
pub async fn handshake(
    config: &Arc<ClientConfig>,
    host: &str,
    tcp: TcpStream,
    what: &str,
) -> XfrResult<TlsStream<TcpStream>> {
    let connector = TlsConnector::from(config.clone());
    connector
        .connect(server_name(host)?, tcp)
        .await
        .map_err(|e| classify_handshake_error(e, what))
}

/// Certificate rejections are authentication failures; everything else is
/// a transport problem.
fn classify_handshake_error(e: std::io::Error, what: &str) -> XfrError {
    let rejected = e
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>())
        .map(|tls| {
            matches!(
                tls,
                rustls::Error::InvalidCertificate(_) | rustls::Error::NoCertificatesPresented
            )
        })
        .unwrap_or(false);
    if rejected {
        XfrError::certificate(format!("{}: certificate rejected: {}", what, e))
    } else {
        XfrError::connection(format!("{}: {}", what, e))
    }
}

/// Upgrade an existing **plain** control connection to TLS.
///
/// Called after successful `AUTH TLS` + 234 reply.
/// Consumes the plain codec, performs the TLS handshake, returns a new codec.
pub async fn upgrade_to_tls(
    codec: FtpCodec,
    host: &str,
    config: &Arc<ClientConfig>,
) -> XfrResult<FtpCodec> {
    let io_timeout = codec.io_timeout;
    let tcp = reunite_plain(codec)?;
    let tls = handshake(config, host, tcp, "Explicit TLS handshake").await?;
    Ok(FtpCodec::from_tls(tls, io_timeout))
}

/// Reunite the read + write halves back into a `TcpStream`.
/// Only works when both halves are `Plain`.
fn reunite_plain(codec: FtpCodec) -> XfrResult<TcpStream> {
    let rd = match codec.reader {
        ReadHalf::Plain(br) => {
            if !br.buffer().is_empty() {
                return Err(XfrError::protocol(
                    "Server sent data before the TLS handshake",
                ));
            }
            br.into_inner()
        }
        ReadHalf::Tls(_) => {
            return Err(XfrError::protocol("Cannot upgrade: connection is already TLS"))
        }
    };
    let wr = match codec.writer {
        WriteHalf::Plain(w) => w,
        WriteHalf::Tls(_) => {
            return Err(XfrError::protocol("Cannot upgrade: connection is already TLS"))
        }
    };
    rd.reunite(wr)
        .map_err(|e| XfrError::protocol(format!("Reunite failed: {}", e)))
}

/// Verifier used when the profile disables certificate validation.
/// Signatures are still checked so the handshake itself stays sound.
#[derive(Debug)]
struct AcceptAnyCertificate(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCertificate {
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
        crypto::verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        crypto::verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
