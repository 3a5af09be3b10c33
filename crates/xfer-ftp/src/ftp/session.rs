//! `RemoteSession` implementation for FTP and FTPS.

use crate::ftp::client::FtpClient;
use crate::ftp::parser;
use crate::ftp::types::{FtpConnectionConfig, FtpEntry, FtpEntryKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::Path;
use xfer_core::{
    join_remote, EntryKind, RemoteEntry, RemoteSession, TransferHandle, TransferOutcome, XfrResult,
};

/// One authenticated FTP/FTPS control connection.
pub struct FtpSession {
    client: FtpClient,
}

impl FtpSession {
    pub async fn connect(config: FtpConnectionConfig) -> XfrResult<Self> {
        Ok(Self {
            client: FtpClient::connect(config).await?,
        })
    }

    pub fn client(&self) -> &FtpClient {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut FtpClient {
        &mut self.client
    }

    /// Listing lines the most recent `list` could not parse.
    pub fn last_skipped_lines(&self) -> usize {
        self.client.last_skipped_lines()
    }
}

/// Map a parsed listing entry under `dir` to the shared entry type.
/// Entries of unknown kind are dropped.
pub fn to_remote_entry(dir: &str, entry: FtpEntry) -> Option<RemoteEntry> {
    let kind = match entry.kind {
        FtpEntryKind::File => EntryKind::File,
        FtpEntryKind::Directory => EntryKind::Directory,
        FtpEntryKind::Symlink => EntryKind::Symlink,
        FtpEntryKind::Unknown => return None,
    };
    let path = if entry.name.starts_with('/') {
        entry.name.clone()
    } else {
        join_remote(dir, &entry.name)
    };
    Some(RemoteEntry {
        path,
        size: entry.size,
        modified: entry.modified,
        kind,
        permissions: entry.permissions.as_deref().and_then(parser::permission_bits),
    })
}

#[async_trait]
impl RemoteSession for FtpSession {
    fn profile_id(&self) -> &str {
        &self.client.config.profile_id
    }

    fn is_open(&self) -> bool {
        self.client.is_connected()
    }

    async fn list(&mut self, path: &str) -> XfrResult<Vec<RemoteEntry>> {
        let dir = self.client.absolute(path);
        let listing = self.client.list(&dir).await?;
        Ok(listing
            .entries
            .into_iter()
            .filter_map(|e| to_remote_entry(&dir, e))
            .collect())
    }

    async fn get(
        &mut self,
        remote: &str,
        local: &Path,
        offset: u64,
        handle: &TransferHandle,
    ) -> XfrResult<TransferOutcome> {
        self.client.download(remote, local, offset, handle).await
    }

    async fn put(
        &mut self,
        local: &Path,
        remote: &str,
        offset: u64,
        handle: &TransferHandle,
    ) -> XfrResult<TransferOutcome> {
        self.client.upload(local, remote, offset, handle).await
    }

    async fn mkdir(&mut self, path: &str) -> XfrResult<()> {
        self.client.mkdir_all(path).await
    }

    async fn delete(&mut self, path: &str) -> XfrResult<()> {
        self.client.remove(path).await
    }

    async fn rename(&mut self, from: &str, to: &str) -> XfrResult<()> {
        self.client.rename(from, to).await
    }

    async fn stat(&mut self, path: &str) -> XfrResult<Option<RemoteEntry>> {
        let abs = self.client.absolute(path);
        let entry = self.client.stat_entry(&abs).await?;
        Ok(entry.and_then(|e| {
            let mut entry = to_remote_entry("/", e)?;
            entry.path = abs;
            Some(entry)
        }))
    }

    async fn set_modified(&mut self, path: &str, modified: DateTime<Utc>) -> XfrResult<()> {
        self.client.set_modified(path, modified).await
    }

    async fn close(&mut self) -> XfrResult<()> {
        self.client.quit().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ftp::types::FtpSecurityMode;
    use crate::testing::{MockFeatures, MockFtpServer, MockTls};
    use chrono::TimeZone;
    use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
    use rustls::ServerConfig;
    use secrecy::SecretString;
    use std::sync::Arc;
    use std::time::Duration;
    use uuid::Uuid;
    use xfer_core::{AuthFailure, ConnectionProfile, ErrorKind, Event, EventBus, Scheme, TlsMode};

    fn entry(name: &str, kind: FtpEntryKind) -> FtpEntry {
        FtpEntry {
            name: name.into(),
            kind,
            size: 7,
            modified: None,
            permissions: Some("-rw-r--r--".into()),
            owner: None,
            group: None,
            link_target: None,
        }
    }

    async fn server(features: MockFeatures) -> MockFtpServer {
        let server = MockFtpServer::start("u", "p", features).await.unwrap();
        server.add_dir("/inbox");
        server.add_dir("/inbox/sub");
        let data: Vec<u8> = (0..100u8).collect();
        server.add_file(
            "/inbox/a.txt",
            &data,
            Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap(),
        );
        server
    }

    async fn connect(server: &MockFtpServer, password: &str) -> XfrResult<FtpSession> {
        let profile = ConnectionProfile::new(Scheme::Ftp, "127.0.0.1")
            .with_port(server.port())
            .with_username("u")
            .with_initial_path("/inbox");
        let mut config = FtpConnectionConfig::from_profile(&profile, SecretString::new(password.into()));
        config.io_timeout = Duration::from_secs(5);
        FtpSession::connect(config).await
    }

    fn self_signed() -> Arc<ServerConfig> {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let der = CertificateDer::from(cert.serialize_der().unwrap());
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.serialize_private_key_der()));
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(vec![der], key)
            .unwrap();
        Arc::new(config)
    }

    async fn tls_server(mode: MockTls) -> MockFtpServer {
        let server = MockFtpServer::start_tls("u", "p", MockFeatures::all(), mode, self_signed())
            .await
            .unwrap();
        server.add_dir("/inbox");
        let data: Vec<u8> = (0..100u8).collect();
        server.add_file(
            "/inbox/a.txt",
            &data,
            Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap(),
        );
        server
    }

    async fn connect_tls(server: &MockFtpServer, mode: TlsMode, verify: bool) -> XfrResult<FtpSession> {
        let mut profile = ConnectionProfile::new(Scheme::Ftps, "127.0.0.1")
            .with_port(server.port())
            .with_username("u")
            .with_tls_mode(mode)
            .with_initial_path("/inbox");
        profile.verify_certificates = verify;
        let mut config = FtpConnectionConfig::from_profile(&profile, SecretString::new("p".into()));
        config.io_timeout = Duration::from_secs(5);
        FtpSession::connect(config).await
    }

    async fn exercise_secure_session(server: &MockFtpServer, mut session: FtpSession) {
        let entries = session.list(".").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "/inbox/a.txt");

        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("a.txt");
        let handle = TransferHandle::detached();
        let outcome = session.get("/inbox/a.txt", &local, 0, &handle).await.unwrap();
        assert_eq!(outcome, TransferOutcome::Completed(100));
        assert_eq!(std::fs::read(&local).unwrap(), server.read("/inbox/a.txt").unwrap());

        let up = dir.path().join("up.bin");
        std::fs::write(&up, vec![9u8; 3000]).unwrap();
        let outcome = session
            .put(&up, "/inbox/up.bin", 0, &TransferHandle::detached())
            .await
            .unwrap();
        assert_eq!(outcome, TransferOutcome::Completed(3000));
        assert_eq!(server.read("/inbox/up.bin").unwrap(), vec![9u8; 3000]);

        session.close().await.unwrap();
    }

    #[test]
    fn test_to_remote_entry_joins_paths() {
        let e = to_remote_entry("/inbox", entry("a.txt", FtpEntryKind::File)).unwrap();
        assert_eq!(e.path, "/inbox/a.txt");
        assert_eq!(e.kind, EntryKind::File);
        assert_eq!(e.permissions, Some(0o644));

        let e = to_remote_entry("/", entry("sub", FtpEntryKind::Directory)).unwrap();
        assert_eq!(e.path, "/sub");
        assert!(e.is_dir());
    }

    #[test]
    fn test_unknown_kinds_are_dropped() {
        assert!(to_remote_entry("/", entry("dev", FtpEntryKind::Unknown)).is_none());
    }

    #[tokio::test]
    async fn test_list_without_extensions() {
        let server = server(MockFeatures::default()).await;
        let mut session = connect(&server, "p").await.unwrap();
        assert!(session.is_open());
        assert_eq!(session.client().info.current_directory, "/inbox");

        let mut entries = session.list(".").await.unwrap();
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].path, "/inbox/a.txt");
        assert_eq!(entries[0].size, 100);
        assert_eq!(entries[1].path, "/inbox/sub");
        assert!(entries[1].is_dir());
        assert_eq!(session.last_skipped_lines(), 0);
        assert!(server.commands().iter().any(|c| c.starts_with("LIST")));

        session.close().await.unwrap();
        session.close().await.unwrap();
        assert!(!session.is_open());
    }

    #[tokio::test]
    async fn test_list_includes_dotfiles() {
        let server = server(MockFeatures::default()).await;
        server.add_file("/inbox/.env", b"KEY=1", Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap());
        let mut session = connect(&server, "p").await.unwrap();

        let entries = session.list(".").await.unwrap();
        assert_eq!(entries.len(), 3);
        assert!(entries.iter().any(|e| e.path == "/inbox/.env" && e.size == 5));
        assert!(server.commands().iter().any(|c| c == "LIST -a /inbox"));
    }

    #[tokio::test]
    async fn test_list_falls_back_when_options_rejected() {
        let server = server(MockFeatures {
            reject_list_options: true,
            ..MockFeatures::default()
        })
        .await;
        server.add_file("/inbox/.env", b"KEY=1", Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap());
        let mut session = connect(&server, "p").await.unwrap();

        let entries = session.list(".").await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(session.is_open());
        let entries = session.list("/inbox/sub").await.unwrap();
        assert!(entries.is_empty());

        let commands = server.commands();
        let with_option = commands.iter().filter(|c| c.starts_with("LIST -a")).count();
        assert_eq!(with_option, 1);
        assert!(commands.iter().any(|c| c == "LIST /inbox/sub"));
    }

    #[tokio::test]
    async fn test_explicit_ftps_protects_control_and_data() {
        let server = tls_server(MockTls::Explicit).await;
        let session = connect_tls(&server, TlsMode::Explicit, false).await.unwrap();
        assert_eq!(session.client().info.security, FtpSecurityMode::Explicit);
        exercise_secure_session(&server, session).await;

        let commands = server.commands();
        let pos = |cmd: &str| commands.iter().position(|c| c == cmd).unwrap();
        assert!(pos("AUTH TLS") < pos("PBSZ 0"));
        assert!(pos("PROT P") < pos("USER u"));
    }

    #[tokio::test]
    async fn test_implicit_ftps_protects_control_and_data() {
        let server = tls_server(MockTls::Implicit).await;
        let session = connect_tls(&server, TlsMode::Implicit, false).await.unwrap();
        assert_eq!(session.client().info.security, FtpSecurityMode::Implicit);
        exercise_secure_session(&server, session).await;
        assert!(!server.commands().iter().any(|c| c.starts_with("AUTH")));
    }

    #[tokio::test]
    async fn test_untrusted_certificate_is_rejected_when_verifying() {
        for (tls, mode) in [
            (MockTls::Explicit, TlsMode::Explicit),
            (MockTls::Implicit, TlsMode::Implicit),
        ] {
            let server = tls_server(tls).await;
            let err = connect_tls(&server, mode, true).await.err().unwrap();
            assert_eq!(err.kind, ErrorKind::Authentication);
            assert_eq!(err.auth, Some(AuthFailure::Certificate));
            assert!(!server.commands().iter().any(|c| c.starts_with("USER")));
        }
    }

    #[tokio::test]
    async fn test_bad_password_is_authentication_error() {
        let server = server(MockFeatures::default()).await;
        let err = connect(&server, "wrong").await.err().unwrap();
        assert_eq!(err.kind, ErrorKind::Authentication);
        assert_eq!(err.code, Some(530));
    }

    #[tokio::test]
    async fn test_resume_without_rest_restarts_with_warning() {
        let server = server(MockFeatures::default()).await;
        let mut session = connect(&server, "p").await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("a.txt");
        std::fs::write(&local, [0u8; 40]).unwrap();

        let bus = EventBus::new(64);
        let mut rx = bus.subscribe();
        let handle = TransferHandle::new(Uuid::new_v4(), bus, Duration::from_millis(0));
        let outcome = session.get("a.txt", &local, 40, &handle).await.unwrap();
        assert_eq!(outcome, TransferOutcome::Completed(100));
        assert_eq!(std::fs::read(&local).unwrap(), server.read("/inbox/a.txt").unwrap());

        let mut warned = false;
        while let Ok(ev) = rx.try_recv() {
            warned |= matches!(ev, Event::TransferWarning { .. });
        }
        assert!(warned);
        assert!(!server.commands().iter().any(|c| c.starts_with("REST")));
    }

    #[tokio::test]
    async fn test_resume_with_rest_fetches_only_the_tail() {
        let server = server(MockFeatures::all()).await;
        let mut session = connect(&server, "p").await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("a.txt");
        let original = server.read("/inbox/a.txt").unwrap();
        std::fs::write(&local, &original[..30]).unwrap();

        let handle = TransferHandle::detached();
        let outcome = session.get("/inbox/a.txt", &local, 30, &handle).await.unwrap();
        assert_eq!(outcome, TransferOutcome::Completed(100));
        assert_eq!(std::fs::read(&local).unwrap(), original);
        assert!(server.commands().iter().any(|c| c == "REST 30"));
    }

    #[tokio::test]
    async fn test_upload_mkdir_rename_delete() {
        let server = server(MockFeatures::all()).await;
        let mut session = connect(&server, "p").await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("up.bin");
        std::fs::write(&local, vec![7u8; 5000]).unwrap();

        session.mkdir("/inbox/x/y").await.unwrap();
        session.mkdir("/inbox/x/y").await.unwrap();
        assert!(server.exists("/inbox/x/y"));

        let outcome = session
            .put(&local, "/inbox/x/y/up.bin", 0, &TransferHandle::detached())
            .await
            .unwrap();
        assert_eq!(outcome, TransferOutcome::Completed(5000));
        assert_eq!(server.read("/inbox/x/y/up.bin").unwrap().len(), 5000);

        session.rename("/inbox/x/y/up.bin", "/inbox/x/up.bin").await.unwrap();
        let st = session.stat("/inbox/x/up.bin").await.unwrap().unwrap();
        assert_eq!(st.size, 5000);
        assert!(session.stat("/inbox/x/y/up.bin").await.unwrap().is_none());

        session.delete("/inbox/x/up.bin").await.unwrap();
        session.delete("/inbox/x/up.bin").await.unwrap();
        session.delete("/inbox/x/y").await.unwrap();
        assert!(!server.exists("/inbox/x/y"));
    }

    #[tokio::test]
    async fn test_set_modified_uses_mfmt() {
        let server = server(MockFeatures::all()).await;
        let mut session = connect(&server, "p").await.unwrap();
        let t = Utc.with_ymd_and_hms(2021, 3, 4, 5, 6, 7).unwrap();
        session.set_modified("/inbox/a.txt", t).await.unwrap();
        assert_eq!(server.modified("/inbox/a.txt"), Some(t));
        let st = session.stat("/inbox/a.txt").await.unwrap().unwrap();
        assert_eq!(st.modified, Some(t));

        let plain = self::server(MockFeatures::default()).await;
        let mut session = connect(&plain, "p").await.unwrap();
        let err = session.set_modified("/inbox/a.txt", t).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Protocol);
    }

    #[tokio::test]
    async fn test_paused_download_leaves_session_usable() {
        let server = server(MockFeatures::all()).await;
        let mut session = connect(&server, "p").await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("a.txt");

        let handle = TransferHandle::detached();
        handle.request_pause();
        let outcome = session.get("/inbox/a.txt", &local, 0, &handle).await.unwrap();
        assert_eq!(outcome, TransferOutcome::Paused(0));
        assert!(session.is_open());
        assert_eq!(session.list("/inbox").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_paused_upload_publishes_final_progress() {
        let server = server(MockFeatures::all()).await;
        let mut session = connect(&server, "p").await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("up.bin");
        std::fs::write(&local, vec![3u8; 2048]).unwrap();

        let bus = EventBus::new(64);
        let mut rx = bus.subscribe();
        let handle = TransferHandle::new(Uuid::new_v4(), bus, Duration::from_secs(3600));
        handle.request_pause();
        let outcome = session.put(&local, "/inbox/up.bin", 0, &handle).await.unwrap();
        assert_eq!(outcome, TransferOutcome::Paused(0));

        let mut progress = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            if let Event::TransferProgress { bytes_done, bytes_total, .. } = ev {
                progress.push((bytes_done, bytes_total));
            }
        }
        assert_eq!(progress, vec![(0, Some(2048))]);
        assert!(session.is_open());
    }

    #[tokio::test]
    async fn test_cancelled_transfer_retires_the_session() {
        let server = server(MockFeatures::all()).await;
        let mut session = connect(&server, "p").await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("a.txt");

        let handle = TransferHandle::detached();
        handle.request_cancel();
        let err = session.get("/inbox/a.txt", &local, 0, &handle).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Cancelled);
        assert!(!session.is_open());
    }
}
