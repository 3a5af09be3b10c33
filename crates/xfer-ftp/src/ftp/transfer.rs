//! Data-channel management for FTP transfers.
//!
//! Supports four modes (RFC 959 + RFC 2428):
//! - **PASV**: server opens a port, client connects
//! - **EPSV**: extended passive (IPv6-ready)
//! - **PORT**: client opens a port, tells server
//! - **EPRT**: extended active (IPv6-ready)
//!
//! The data socket is TLS-wrapped for FTPS (PROT P).

use crate::ftp::protocol::FtpCodec;
use crate::ftp::tls;
use crate::ftp::types::DataChannelMode;
use lazy_static::lazy_static;
use regex::Regex;
use rustls::ClientConfig;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};
use tokio_rustls::client::TlsStream;
use xfer_core::{XfrError, XfrResult};

lazy_static! {
    static ref PASV_RE: Regex =
        Regex::new(r"\((\d+),(\d+),(\d+),(\d+),(\d+),(\d+)\)").expect("valid PASV regex");
    static ref EPSV_RE: Regex = Regex::new(r"\|\|\|(\d+)\|").expect("valid EPSV regex");
}

/// Abstraction over a plain or TLS-wrapped data stream.
pub enum DataStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for DataStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            DataStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            DataStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for DataStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            DataStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            DataStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            DataStream::Plain(s) => Pin::new(s).poll_flush(cx),
            DataStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            DataStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            DataStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// A data connection that has been negotiated but not yet connected.
///
/// Passive modes connect right away; active modes accept only after the
/// transfer command was sent, as RFC 959 requires.
pub enum PendingData {
    Connected(TcpStream),
    Listening(TcpListener),
}

impl PendingData {
    /// Finish establishing the data connection and wrap it for FTPS.
    pub async fn establish(
        self,
        tls_config: Option<&Arc<ClientConfig>>,
        host: &str,
        data_timeout: Duration,
    ) -> XfrResult<DataStream> {
        let tcp = match self {
            PendingData::Connected(tcp) => tcp,
            PendingData::Listening(listener) => {
                let (tcp, _) = timeout(data_timeout, listener.accept())
                    .await
                    .map_err(|_| XfrError::transfer("Active data accept timed out"))?
                    .map_err(|e| XfrError::transfer(format!("Active data accept: {}", e)))?;
                tcp
            }
        };
        match tls_config {
            Some(cfg) => {
                let stream = timeout(
                    data_timeout,
                    tls::handshake(cfg, host, tcp, "Data channel TLS"),
                )
                .await
                .map_err(|_| XfrError::transfer("Data channel TLS handshake timed out"))??;
                Ok(DataStream::Tls(Box::new(stream)))
            }
            None => Ok(DataStream::Plain(tcp)),
        }
    }
}

/// Negotiate a data channel according to the configured mode.
pub async fn prepare_data_channel(
    codec: &mut FtpCodec,
    mode: DataChannelMode,
    host: &str,
    data_timeout: Duration,
    active_bind: Option<&str>,
) -> XfrResult<PendingData> {
    match mode {
        DataChannelMode::Passive => open_pasv(codec, host, data_timeout)
            .await
            .map(PendingData::Connected),
        DataChannelMode::ExtendedPassive => open_epsv(codec, host, data_timeout)
            .await
            .map(PendingData::Connected),
        DataChannelMode::Active => open_port(codec, active_bind)
            .await
            .map(PendingData::Listening),
        DataChannelMode::ExtendedActive => open_eprt(codec, active_bind)
            .await
            .map(PendingData::Listening),
    }
}

async fn connect_data(addr: SocketAddr, data_timeout: Duration, what: &str) -> XfrResult<TcpStream> {
    timeout(data_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| XfrError::transfer(format!("{} data connect timed out", what)))?
        .map_err(|e| XfrError::transfer(format!("{} data connect: {}", what, e)))
}

// ─── PASV ────────────────────────────────────────────────────────────

/// Issue `PASV`, parse the response, connect to the returned address.
///
/// Response format: `227 Entering Passive Mode (h1,h2,h3,h4,p1,p2)`
async fn open_pasv(codec: &mut FtpCodec, host: &str, data_timeout: Duration) -> XfrResult<TcpStream> {
    let resp = codec.expect_ok("PASV").await?;
    let mut addr = parse_pasv_response(&resp.text())?;
    // Servers behind NAT often report an unusable address.
    if addr.ip().is_unspecified() {
        if let Ok(ip) = host.parse::<IpAddr>() {
            addr.set_ip(ip);
        }
    }
    connect_data(addr, data_timeout, "PASV").await
}

/// Parse `(h1,h2,h3,h4,p1,p2)` from a 227 response.
pub fn parse_pasv_response(text: &str) -> XfrResult<SocketAddr> {
    let caps = PASV_RE
        .captures(text)
        .ok_or_else(|| XfrError::protocol(format!("Cannot parse PASV: {}", text)))?;

    let nums: Vec<u8> = (1..=6)
        .map(|i| {
            caps[i]
                .parse::<u8>()
                .map_err(|_| XfrError::protocol("PASV number out of range"))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let ip = IpAddr::from([nums[0], nums[1], nums[2], nums[3]]);
    let port = (nums[4] as u16) * 256 + (nums[5] as u16);
    Ok(SocketAddr::new(ip, port))
}

// ─── EPSV ────────────────────────────────────────────────────────────

/// Issue `EPSV`, parse port, connect to the *same host* on that port.
///
/// Response format: `229 Entering Extended Passive Mode (|||port|)`
async fn open_epsv(codec: &mut FtpCodec, host: &str, data_timeout: Duration) -> XfrResult<TcpStream> {
    let resp = codec.expect_ok("EPSV").await?;
    let port = parse_epsv_response(&resp.text())?;
    let addr = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| XfrError::connection(format!("Resolve {}: {}", host, e)))?
        .next()
        .ok_or_else(|| XfrError::connection(format!("No address for {}", host)))?;
    connect_data(addr, data_timeout, "EPSV").await
}

pub fn parse_epsv_response(text: &str) -> XfrResult<u16> {
    let caps = EPSV_RE
        .captures(text)
        .ok_or_else(|| XfrError::protocol(format!("Cannot parse EPSV: {}", text)))?;
    caps[1]
        .parse::<u16>()
        .map_err(|_| XfrError::protocol("EPSV port out of range"))
}

// ─── PORT ────────────────────────────────────────────────────────────

/// Bind a local TCP listener and tell the server via `PORT`.
async fn open_port(codec: &mut FtpCodec, bind_addr: Option<&str>) -> XfrResult<TcpListener> {
    let bind = bind_addr.unwrap_or("0.0.0.0");
    let listener = TcpListener::bind(format!("{}:0", bind))
        .await
        .map_err(|e| XfrError::transfer(format!("PORT bind: {}", e)))?;
    let local = listener
        .local_addr()
        .map_err(|e| XfrError::transfer(format!("PORT local_addr: {}", e)))?;

    let ip = match local.ip() {
        IpAddr::V4(v4) => v4,
        _ => return Err(XfrError::unsupported("PORT requires IPv4")),
    };
    let octets = ip.octets();
    let port = local.port();

    let cmd = format!(
        "PORT {},{},{},{},{},{}",
        octets[0],
        octets[1],
        octets[2],
        octets[3],
        port / 256,
        port % 256
    );
    codec.expect_ok(&cmd).await?;
    Ok(listener)
}

// ─── EPRT ────────────────────────────────────────────────────────────

/// Bind a local listener and tell the server via `EPRT`.
///
/// Command format: `EPRT |1|ip|port|` (1 = IPv4, 2 = IPv6)
async fn open_eprt(codec: &mut FtpCodec, bind_addr: Option<&str>) -> XfrResult<TcpListener> {
    let bind = bind_addr.unwrap_or("0.0.0.0");
    let listener = TcpListener::bind(format!("{}:0", bind))
        .await
        .map_err(|e| XfrError::transfer(format!("EPRT bind: {}", e)))?;
    let local = listener
        .local_addr()
        .map_err(|e| XfrError::transfer(format!("EPRT local_addr: {}", e)))?;

    let af = match local.ip() {
        IpAddr::V4(_) => 1,
        IpAddr::V6(_) => 2,
    };
    let cmd = format!("EPRT |{}|{}|{}|", af, local.ip(), local.port());
    codec.expect_ok(&cmd).await?;
    Ok(listener)
}
