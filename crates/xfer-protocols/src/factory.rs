//! Scheme → variant mapping with credential resolution.

use crate::session::ProtocolSession;
use async_trait::async_trait;
use log::{debug, info};
use secrecy::SecretString;
use std::path::PathBuf;
use std::sync::Arc;
use xfer_core::{
    ConnectionProfile, Connector, CredentialError, CredentialStore, RemoteSession, Scheme,
    XfrError, XfrResult,
};
use xfer_ftp::{FtpConnectionConfig, FtpSession};
use xfer_sftp::{KnownHosts, SftpConnectionConfig, SftpSession};

/// Conventional password for anonymous FTP logins.
const ANONYMOUS_PASSWORD: &str = "anonymous@";

/// Opens sessions for profiles. Holds no connection state of its own.
#[derive(Clone)]
pub struct ProtocolFactory {
    credentials: Arc<dyn CredentialStore>,
    known_hosts: PathBuf,
}

impl ProtocolFactory {
    pub fn new(credentials: Arc<dyn CredentialStore>) -> Self {
        Self {
            credentials,
            known_hosts: KnownHosts::default_path(),
        }
    }

    /// Known-hosts file used by SFTP profiles that do not name their own.
    pub fn with_known_hosts(mut self, path: impl Into<PathBuf>) -> Self {
        self.known_hosts = path.into();
        self
    }

    pub fn known_hosts_path(&self) -> &std::path::Path {
        &self.known_hosts
    }

    /// Secret for one connect attempt. A missing entry is not an error: FTP
    /// falls back to the anonymous convention, SFTP to key/agent auth.
    fn resolve_secret(&self, profile: &ConnectionProfile) -> XfrResult<Option<SecretString>> {
        match self.credentials.resolve(profile.credential_ref()) {
            Ok(secret) => Ok(Some(secret)),
            Err(CredentialError::NotFound(_)) => {
                debug!("No stored credential for {}", profile.id);
                Ok(None)
            }
            Err(e) => Err(XfrError::authentication(format!(
                "Credential lookup for {} failed: {}",
                profile.id, e
            ))),
        }
    }

    pub async fn open(&self, profile: &ConnectionProfile) -> XfrResult<ProtocolSession> {
        if profile.host.is_empty() {
            return Err(XfrError::protocol("Profile has no host"));
        }
        let secret = self.resolve_secret(profile)?;
        info!("Opening {} session to {}", profile.scheme, profile.address());

        let session = match profile.scheme {
            Scheme::Ftp | Scheme::Ftps => {
                let password =
                    secret.unwrap_or_else(|| SecretString::new(ANONYMOUS_PASSWORD.to_string()));
                let config = FtpConnectionConfig::from_profile(profile, password);
                let session = FtpSession::connect(config).await?;
                if profile.scheme == Scheme::Ftps {
                    ProtocolSession::Ftps(session)
                } else {
                    ProtocolSession::Ftp(session)
                }
            }
            Scheme::Sftp => {
                let config =
                    SftpConnectionConfig::from_profile(profile, secret, self.known_hosts.clone());
                ProtocolSession::Sftp(SftpSession::connect(config).await?)
            }
        };
        Ok(session)
    }
}

#[async_trait]
impl Connector for ProtocolFactory {
    async fn connect(&self, profile: &ConnectionProfile) -> XfrResult<Box<dyn RemoteSession>> {
        Ok(Box::new(self.open(profile).await?))
    }
}
