//! Stateful FTP client. Owns the control connection and issues commands.
//!
//! Lifecycle: `connect()` → optional TLS upgrade → authenticate →
//! FEAT/SYST/PWD probing → set TYPE → optionally CWD.
//!
//! The client exposes low-level command helpers used by `directory.rs`
//! and `file_ops.rs` for higher-level operations.

use crate::ftp::connection;
use crate::ftp::parser;
use crate::ftp::protocol::FtpCodec;
use crate::ftp::tls;
use crate::ftp::transfer::{self, DataStream, PendingData};
use crate::ftp::types::*;
use chrono::{DateTime, Utc};
use rustls::ClientConfig;
use secrecy::ExposeSecret;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use uuid::Uuid;
use xfer_core::{join_remote, XfrError, XfrResult};

/// Upper bound for draining replies after ABOR.
const ABORT_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// A connected FTP client session.
pub struct FtpClient {
    pub id: String,
    pub codec: FtpCodec,
    pub config: FtpConnectionConfig,
    pub info: FtpSessionInfo,
    pub features: ServerFeatures,
    tls: Option<Arc<ClientConfig>>,
    /// Set when the control channel is out of sync; the session must not
    /// be reused.
    pub(crate) broken: bool,
    pub(crate) closed: bool,
    pub(crate) last_skipped: usize,
    /// Cleared once the server turns down `LIST -a`.
    list_all: bool,
}

impl FtpClient {
    /// Establish a new FTP session.
    pub async fn connect(config: FtpConnectionConfig) -> XfrResult<Self> {
        if config.host.is_empty() {
            return Err(XfrError::protocol("Host must not be empty"));
        }

        let tls_config = match config.security {
            FtpSecurityMode::None => None,
            _ => Some(tls::build_client_config(config.verify_certificates)?),
        };

        let session_id = Uuid::new_v4().to_string();
        let (mut codec, banner) = connection::connect(&config, tls_config.as_ref()).await?;
        let banner_text = banner.text();

        // ── Explicit FTPS: AUTH TLS ──────────────────────────────
        if let (FtpSecurityMode::Explicit, Some(cfg)) = (config.security, tls_config.as_ref()) {
            let resp = codec.execute("AUTH TLS").await?;
            if !resp.is_success() {
                return Err(XfrError::unsupported(format!(
                    "AUTH TLS rejected: {}",
                    resp.text()
                ))
                .with_code(resp.code));
            }
            codec = timeout_io(
                config.connect_timeout,
                tls::upgrade_to_tls(codec, &config.host, cfg),
                "Explicit TLS handshake timed out",
            )
            .await?;
        }

        // Data channels are protected on both FTPS flavours.
        if tls_config.is_some() {
            codec.expect_ok("PBSZ 0").await?;
            codec.expect_ok("PROT P").await?;
        }

        // ── Authenticate ─────────────────────────────────────────
        let user_resp = codec.execute(&format!("USER {}", config.username)).await?;
        if user_resp.code == 331 || user_resp.code == 332 {
            let pass_resp = codec
                .execute(&format!("PASS {}", config.password.expose_secret()))
                .await?;
            if !pass_resp.is_success() {
                return Err(XfrError::authentication(format!(
                    "Login failed for {}: {}",
                    config.username,
                    pass_resp.message()
                ))
                .with_code(pass_resp.code));
            }
        } else if !user_resp.is_success() {
            return Err(XfrError::authentication(format!(
                "USER rejected: {}",
                user_resp.message()
            ))
            .with_code(user_resp.code));
        }

        // ── FEAT ─────────────────────────────────────────────────
        let features = Self::query_features(&mut codec).await;

        // ── OPTS UTF8 ON ─────────────────────────────────────────
        if config.utf8 && features.utf8 {
            let _ = codec.execute("OPTS UTF8 ON").await?;
        }

        // ── SYST ─────────────────────────────────────────────────
        let system_type = match codec.execute("SYST").await? {
            r if r.is_success() => Some(r.message().to_string()),
            _ => None,
        };

        // ── PWD ──────────────────────────────────────────────────
        let cwd = Self::get_pwd(&mut codec).await.unwrap_or_else(|_| "/".into());

        // ── TYPE ─────────────────────────────────────────────────
        codec.expect_ok("TYPE I").await?;

        // ── Initial CWD ──────────────────────────────────────────
        let initial_dir = match config.initial_directory.as_deref() {
            Some(dir) if !dir.is_empty() => {
                let resp = codec.execute(&format!("CWD {}", dir)).await?;
                if resp.is_success() {
                    Self::get_pwd(&mut codec).await.unwrap_or_else(|_| dir.to_string())
                } else {
                    log::warn!("Initial directory {} not available: {}", dir, resp.message());
                    cwd
                }
            }
            _ => cwd,
        };

        log::info!(
            "FTP session {} ready on {}:{} (cwd {})",
            session_id,
            config.host,
            config.port,
            initial_dir
        );

        let now = Utc::now();
        let info = FtpSessionInfo {
            id: session_id.clone(),
            host: config.host.clone(),
            port: config.port,
            username: config.username.clone(),
            security: config.security,
            connected: true,
            current_directory: initial_dir,
            server_banner: Some(banner_text),
            system_type,
            connected_at: now,
            last_activity: now,
            transfer_type: TransferType::Binary,
            bytes_uploaded: 0,
            bytes_downloaded: 0,
        };

        Ok(Self {
            id: session_id,
            codec,
            config,
            info,
            features,
            tls: tls_config,
            broken: false,
            closed: false,
            last_skipped: 0,
            list_all: true,
        })
    }

    /// Send a NOOP to keep the control connection alive.
    pub async fn noop(&mut self) -> XfrResult<()> {
        self.codec.expect_ok("NOOP").await?;
        self.touch();
        Ok(())
    }

    // ─── PWD / CWD ───────────────────────────────────────────────

    /// Parse the current working directory from a PWD reply.
    pub async fn get_pwd(codec: &mut FtpCodec) -> XfrResult<String> {
        let resp = codec.expect_ok("PWD").await?;
        parse_pwd(&resp.text())
    }

    /// Change into `path` and update `current_directory`.
    pub async fn cwd(&mut self, path: &str) -> XfrResult<String> {
        self.codec.expect_ok(&format!("CWD {}", path)).await?;
        let new_pwd = Self::get_pwd(&mut self.codec).await?;
        self.info.current_directory = new_pwd.clone();
        self.touch();
        Ok(new_pwd)
    }

    /// Resolve `path` against the current directory.
    pub fn absolute(&self, path: &str) -> String {
        if path.starts_with('/') {
            path.to_string()
        } else if path.is_empty() || path == "." {
            self.info.current_directory.clone()
        } else {
            join_remote(&self.info.current_directory, path)
        }
    }

    // ─── FEAT ────────────────────────────────────────────────────

    async fn query_features(codec: &mut FtpCodec) -> ServerFeatures {
        let resp = match codec.execute("FEAT").await {
            Ok(r) if r.is_success() => r,
            _ => return ServerFeatures::default(),
        };

        let raw: Vec<String> = resp
            .lines
            .iter()
            .skip(1) // "211-Features:"
            .filter(|l| !l.starts_with("211"))
            .map(|l| l.trim().to_uppercase())
            .collect();

        let has = |feat: &str| raw.iter().any(|l| l.starts_with(feat));

        ServerFeatures {
            mlsd: has("MLSD") || has("MLST"),
            mlst: has("MLST"),
            size: has("SIZE"),
            mdtm: has("MDTM"),
            rest_stream: has("REST STREAM"),
            utf8: has("UTF8"),
            epsv: has("EPSV"),
            eprt: has("EPRT"),
            mfmt: has("MFMT"),
            raw_features: raw,
        }
    }

    // ─── Data channel helper ─────────────────────────────────────

    fn data_mode(&self) -> DataChannelMode {
        match (self.config.passive, self.features.epsv, self.features.eprt) {
            (true, true, _) => DataChannelMode::ExtendedPassive,
            (true, false, _) => DataChannelMode::Passive,
            (false, _, true) => DataChannelMode::ExtendedActive,
            (false, _, false) => DataChannelMode::Active,
        }
    }

    /// Negotiate a data channel with the current configuration.
    pub(crate) async fn prepare_data_channel(&mut self) -> XfrResult<PendingData> {
        let mode = self.data_mode();
        transfer::prepare_data_channel(
            &mut self.codec,
            mode,
            &self.config.host,
            self.config.io_timeout,
            self.config.active_bind_address.as_deref(),
        )
        .await
    }

    /// Open a data channel, send `cmd` and return the connected stream plus
    /// whether a final completion reply is still outstanding.
    pub(crate) async fn open_transfer(&mut self, cmd: &str) -> XfrResult<(DataStream, bool)> {
        let pending = self.prepare_data_channel().await?;
        let resp = self.codec.execute(cmd).await?;
        if !resp.is_preliminary() && !resp.is_success() {
            return Err(XfrError::from_reply(resp.code, resp.message()));
        }
        let established = pending
            .establish(self.tls.as_ref(), &self.config.host, self.config.io_timeout)
            .await;
        match established {
            Ok(stream) => Ok((stream, resp.is_preliminary())),
            Err(e) => {
                self.broken = true;
                Err(e)
            }
        }
    }

    /// Read the transfer-complete reply that follows a data transfer.
    pub(crate) async fn finish_transfer(&mut self, outstanding: bool) -> XfrResult<()> {
        if !outstanding {
            return Ok(());
        }
        let done = match self.codec.read_response().await {
            Ok(r) => r,
            Err(e) => {
                self.broken = true;
                return Err(e);
            }
        };
        if !done.is_success() {
            return Err(XfrError::from_reply(done.code, done.message()));
        }
        Ok(())
    }

    // ─── Listing ─────────────────────────────────────────────────

    /// Retrieve a directory listing (prefers MLSD, falls back to LIST).
    pub async fn list(&mut self, path: &str) -> XfrResult<ParsedListing> {
        let path = self.absolute(path);
        let data = if self.features.mlsd {
            self.retrieve_data_as_string(&format!("MLSD {}", path)).await?
        } else {
            self.list_unix(&path).await?
        };
        self.touch();
        let listing = parser::parse_listing(&data);
        self.last_skipped = listing.skipped;
        if listing.skipped > 0 {
            log::warn!(
                "Skipped {} unparseable listing line(s) for {}",
                listing.skipped,
                path
            );
        }
        Ok(listing)
    }

    /// `LIST -a` so dotfiles show up as they do in MLSD and in local walks.
    /// A server that refuses the option gets plain `LIST` from then on.
    async fn list_unix(&mut self, path: &str) -> XfrResult<String> {
        if !self.list_all {
            return self.retrieve_data_as_string(&format!("LIST {}", path)).await;
        }
        match self.retrieve_data_as_string(&format!("LIST -a {}", path)).await {
            Err(e) if !self.broken && e.code.map_or(false, |c| c >= 500) => {
                let plain = self.retrieve_data_as_string(&format!("LIST {}", path)).await?;
                log::debug!("Server rejected LIST -a ({}); using plain LIST", e.message);
                self.list_all = false;
                Ok(plain)
            }
            other => other,
        }
    }

    /// Number of listing lines the last `list` could not parse.
    pub fn last_skipped_lines(&self) -> usize {
        self.last_skipped
    }

    /// Generic helper: open data channel, send command, collect body as String.
    pub async fn retrieve_data_as_string(&mut self, cmd: &str) -> XfrResult<String> {
        let (ds, outstanding) = self.open_transfer(cmd).await?;
        let data = match read_data_stream_to_string(ds, self.config.io_timeout).await {
            Ok(data) => data,
            Err(e) => {
                self.broken = true;
                return Err(e);
            }
        };
        self.finish_transfer(outstanding).await?;
        Ok(data)
    }

    // ─── SIZE / MDTM ────────────────────────────────────────────

    /// Get the size of a remote file (RFC 3659 SIZE).
    pub async fn size(&mut self, path: &str) -> XfrResult<u64> {
        let resp = self.codec.expect_ok(&format!("SIZE {}", path)).await?;
        let msg = resp.message().trim();
        msg.parse::<u64>()
            .map_err(|_| XfrError::protocol(format!("Cannot parse SIZE: {}", resp.text())))
    }

    /// Get the modification time of a remote file (RFC 3659 MDTM).
    pub async fn mdtm(&mut self, path: &str) -> XfrResult<DateTime<Utc>> {
        let resp = self.codec.expect_ok(&format!("MDTM {}", path)).await?;
        parser::parse_mlsd_time(resp.message().trim())
            .ok_or_else(|| XfrError::protocol(format!("Cannot parse MDTM: {}", resp.text())))
    }

    // ─── QUIT ────────────────────────────────────────────────────

    /// Gracefully close the session. Calling it twice is a no-op.
    pub async fn quit(&mut self) -> XfrResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.info.connected = false;
        if !self.broken {
            let _ = self.codec.execute("QUIT").await;
        }
        log::info!("FTP session {} closed", self.id);
        Ok(())
    }

    // ─── ABORT ───────────────────────────────────────────────────

    /// Send ABOR after the data stream was dropped and drain the replies.
    ///
    /// Depending on timing a server answers `426` then `226`, or only
    /// `226`/`225`. A trailing NOOP marks where the stale replies end;
    /// failing to find it marks the session broken.
    pub async fn abort(&mut self) {
        let result = tokio::time::timeout(ABORT_REPLY_TIMEOUT, async {
            self.codec.send_command("ABOR").await?;
            self.codec.send_command("NOOP").await?;
            for _ in 0..4 {
                if self.codec.read_response().await?.code == 200 {
                    return Ok(());
                }
            }
            Err(XfrError::protocol("No NOOP reply after ABOR"))
        })
        .await;
        match result {
            Ok(Ok(())) => self.touch(),
            Ok(Err(e)) => {
                log::warn!("ABOR failed on session {}: {}", self.id, e);
                self.broken = true;
            }
            Err(_) => {
                log::warn!("ABOR reply timed out on session {}", self.id);
                self.broken = true;
            }
        }
    }

    // ─── Utility ─────────────────────────────────────────────────

    pub(crate) fn touch(&mut self) {
        self.info.last_activity = Utc::now();
    }

    pub fn is_connected(&self) -> bool {
        self.info.connected && !self.broken && !self.closed
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────

/// Await `fut` under `dur`, mapping an elapsed timer to a connection error.
pub(crate) async fn timeout_io<T, F>(dur: Duration, fut: F, what: &str) -> XfrResult<T>
where
    F: Future<Output = XfrResult<T>>,
{
    tokio::time::timeout(dur, fut)
        .await
        .map_err(|_| XfrError::timeout(what.to_string()))?
}

/// Parse `257 "/some/path"` into the path string.
fn parse_pwd(text: &str) -> XfrResult<String> {
    if let Some(start) = text.find('"') {
        if let Some(end) = text[start + 1..].find('"') {
            return Ok(text[start + 1..start + 1 + end].to_string());
        }
    }
    Err(XfrError::protocol(format!("Cannot parse PWD: {}", text)))
}

/// Read an entire data stream into a UTF-8 string.
async fn read_data_stream_to_string(mut ds: DataStream, io_timeout: Duration) -> XfrResult<String> {
    let mut buf = Vec::new();
    let mut chunk = vec![0u8; DEFAULT_CHUNK];
    loop {
        let n = tokio::time::timeout(io_timeout, ds.read(&mut chunk))
            .await
            .map_err(|_| XfrError::timeout("Listing data timed out"))?
            .map_err(|e| XfrError::transfer(format!("Listing data: {}", e)))?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pwd() {
        assert_eq!(parse_pwd("257 \"/home/user\" is cwd").unwrap(), "/home/user");
        assert!(parse_pwd("257 no quotes").is_err());
    }
}
