//! TCP + TLS transport for the FTP control connection.
//!
//! Handles plain-TCP connect, implicit-FTPS wrapping, and the connect
//! timeout from `FtpConnectionConfig`.

use crate::ftp::protocol::FtpCodec;
use crate::ftp::tls;
use crate::ftp::types::{FtpConnectionConfig, FtpResponse, FtpSecurityMode};
use rustls::ClientConfig;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::time::timeout;
use xfer_core::{XfrError, XfrResult};

/// Establish the control connection and return a ready-to-use codec
/// **plus** the server welcome banner.
///
/// For Explicit FTPS the caller must later issue AUTH TLS themselves
/// (handled in `client.rs`).
pub async fn connect(
    config: &FtpConnectionConfig,
    tls_config: Option<&Arc<ClientConfig>>,
) -> XfrResult<(FtpCodec, FtpResponse)> {
    let addr = format!("{}:{}", config.host, config.port);

    let tcp = timeout(config.connect_timeout, TcpStream::connect(&addr))
        .await
        .map_err(|_| XfrError::timeout(format!("TCP connect to {} timed out", addr)))?
        .map_err(|e| XfrError::connection(format!("TCP connect to {}: {}", addr, e)))?;

    tcp.set_nodelay(true).ok();

    let mut codec = match (config.security, tls_config) {
        (FtpSecurityMode::Implicit, Some(tls_config)) => {
            // Implicit FTPS: TLS wraps the socket immediately.
            let stream = timeout(
                config.connect_timeout,
                tls::handshake(tls_config, &config.host, tcp, "Implicit TLS handshake"),
            )
            .await
            .map_err(|_| XfrError::timeout("Implicit TLS handshake timed out"))??;
            FtpCodec::from_tls(stream, config.io_timeout)
        }
        (FtpSecurityMode::Implicit, None) => {
            return Err(XfrError::protocol("Implicit FTPS requires a TLS configuration"))
        }
        // Plain TCP (None or Explicit; Explicit upgrades later).
        _ => FtpCodec::from_tcp(tcp, config.io_timeout),
    };

    let banner = codec.read_response().await?;
    if !banner.is_success() {
        return Err(XfrError::from_reply(banner.code, banner.message()));
    }
    log::info!("FTP connected to {}: {}", addr, banner.message());
    Ok((codec, banner))
}
