//! Command façade consumed by a UI or CLI.
//!
//! One `Client` owns the event bus, the session pool, the transfer manager
//! and the sync engine. Every command is a plain async method; progress and
//! state changes arrive on the receiver returned by [`Client::subscribe`].

use crate::config::AppConfig;
use secrecy::{ExposeSecret, SecretString};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use xfer_core::{
    AuthFailure, ConnectionProfile, Connector, CredentialError, CredentialStore, Event, EventBus,
    EventReceiver, MemoryCredentialStore, RemoteEntry, TaskId, TransferRequest, XfrError,
    XfrResult,
};
use xfer_protocols::{parse_url, ProtocolFactory};
use xfer_sftp::KnownHosts;
use xfer_sync::{SyncEngine, SyncPlan, SyncReport, SyncRequest};
use xfer_transfer::{QueueStats, SessionPool, TransferManager, TransferTask};

/// Passwords typed inline in a URL, consulted before the caller's store.
struct LayeredCredentials {
    inline: Arc<MemoryCredentialStore>,
    backend: Arc<dyn CredentialStore>,
}

impl CredentialStore for LayeredCredentials {
    fn resolve(&self, profile_id: &str) -> Result<SecretString, CredentialError> {
        match self.inline.resolve(profile_id) {
            Err(CredentialError::NotFound(_)) => self.backend.resolve(profile_id),
            other => other,
        }
    }
}

pub struct Client {
    config: AppConfig,
    events: EventBus,
    inline: Arc<MemoryCredentialStore>,
    known_hosts: KnownHosts,
    manager: TransferManager,
    sync: SyncEngine,
}

impl Client {
    /// Client backed by the real protocol factory. Must be called inside a
    /// tokio runtime.
    pub fn new(config: AppConfig, credentials: Arc<dyn CredentialStore>) -> Self {
        let inline = Arc::new(MemoryCredentialStore::new());
        let known_hosts = known_hosts_path(&config);
        let factory = ProtocolFactory::new(Arc::new(LayeredCredentials {
            inline: inline.clone(),
            backend: credentials,
        }))
        .with_known_hosts(known_hosts.clone());
        Self::assemble(config, Arc::new(factory), inline, known_hosts)
    }

    /// Client over any connector, e.g. an in-memory remote.
    pub fn with_connector(config: AppConfig, connector: Arc<dyn Connector>) -> Self {
        let known_hosts = known_hosts_path(&config);
        Self::assemble(
            config,
            connector,
            Arc::new(MemoryCredentialStore::new()),
            known_hosts,
        )
    }

    fn assemble(
        config: AppConfig,
        connector: Arc<dyn Connector>,
        inline: Arc<MemoryCredentialStore>,
        known_hosts: PathBuf,
    ) -> Self {
        let events = EventBus::new(config.event_capacity);
        let pool = Arc::new(SessionPool::new(connector, config.pool.clone(), events.clone()));
        let manager = TransferManager::new(config.transfer.clone(), pool, events.clone());
        let sync = SyncEngine::new(manager.clone(), config.sync.clone());
        info!(
            workers = config.transfer.workers,
            max_sessions = config.pool.max_sessions_per_profile,
            "client ready"
        );
        Self {
            config,
            events,
            inline,
            known_hosts: KnownHosts::new(known_hosts),
            manager,
            sync,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    pub fn transfers(&self) -> &TransferManager {
        &self.manager
    }

    // ── Sessions ─────────────────────────────────────────────────────

    /// Open (or reuse) a pooled session to prove the profile works.
    pub async fn connect(&self, profile: &ConnectionProfile) -> XfrResult<()> {
        let pooled = self.manager.pool().checkout(profile).await?;
        pooled.release();
        Ok(())
    }

    /// Parse `url`, remember an inline password for this client's lifetime
    /// and connect. Returns the derived profile.
    pub async fn connect_url(&self, url: &str) -> XfrResult<ConnectionProfile> {
        let parsed = parse_url(url)?;
        if let Some(password) = &parsed.password {
            self.inline.insert(
                parsed.profile.credential_ref(),
                password.expose_secret().to_string(),
            );
        }
        self.connect(&parsed.profile).await?;
        Ok(parsed.profile)
    }

    /// Close the idle sessions of a profile and forget its inline password.
    pub async fn disconnect(&self, profile_id: &str) {
        self.manager.pool().close_profile(profile_id, "user request").await;
        self.inline.remove(profile_id);
    }

    /// List `path` and publish `listing-updated`.
    pub async fn list(&self, profile: &ConnectionProfile, path: &str) -> XfrResult<Vec<RemoteEntry>> {
        let mut pooled = self.manager.pool().checkout(profile).await?;
        let entries = pooled.session()?.list(path).await;
        pooled.release();
        let entries = entries?;
        self.events.publish(Event::ListingUpdated {
            profile_id: profile.id.clone(),
            path: path.to_string(),
            entries: entries.clone(),
        });
        Ok(entries)
    }

    // ── Host keys ────────────────────────────────────────────────────

    /// Known-hosts store consulted when connecting `profile`: its own
    /// override, else the client-wide file.
    pub fn known_hosts_for(&self, profile: &ConnectionProfile) -> KnownHosts {
        match &profile.known_hosts_path {
            Some(path) => KnownHosts::new(path.clone()),
            None => self.known_hosts.clone(),
        }
    }

    pub fn accept_host_key(
        &self,
        profile: &ConnectionProfile,
        key_type: &str,
        fingerprint: &str,
    ) -> XfrResult<()> {
        self.known_hosts_for(profile)
            .accept(&profile.host, profile.port, key_type, fingerprint)
    }

    /// Trust the key reported by an unknown-host-key failure of `profile`.
    /// Mismatches are never accepted this way; the old key has to be
    /// forgotten first.
    pub fn accept_host_key_from(&self, profile: &ConnectionProfile, err: &XfrError) -> XfrResult<()> {
        match &err.auth {
            Some(AuthFailure::UnknownHostKey {
                host,
                port,
                key_type,
                fingerprint,
            }) => self
                .known_hosts_for(profile)
                .accept(host, *port, key_type, fingerprint),
            _ => Err(XfrError::protocol("error does not carry an unknown host key")),
        }
    }

    pub fn forget_host_key(&self, profile: &ConnectionProfile) -> XfrResult<()> {
        self.known_hosts_for(profile).forget(&profile.host, profile.port)
    }

    // ── Transfers ────────────────────────────────────────────────────

    pub fn enqueue_transfer(&self, request: TransferRequest) -> XfrResult<TaskId> {
        self.manager.enqueue(request)
    }

    pub fn pause(&self, id: TaskId) -> XfrResult<()> {
        self.manager.pause(id)
    }

    pub fn resume(&self, id: TaskId) -> XfrResult<()> {
        self.manager.resume(id)
    }

    pub fn cancel(&self, id: TaskId) -> XfrResult<()> {
        self.manager.cancel(id)
    }

    pub fn retry(&self, id: TaskId) -> XfrResult<()> {
        self.manager.retry(id)
    }

    pub fn task(&self, id: TaskId) -> Option<TransferTask> {
        self.manager.task(id)
    }

    pub fn tasks(&self) -> Vec<TransferTask> {
        self.manager.tasks()
    }

    /// Forget a task that is no longer queued or running.
    pub fn remove_transfer(&self, id: TaskId) -> XfrResult<TransferTask> {
        self.manager.remove(id)
    }

    /// Forget every completed and cancelled task.
    pub fn clear_finished(&self) -> usize {
        self.manager.clear_finished()
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.manager.stats()
    }

    // ── Sync ─────────────────────────────────────────────────────────

    /// Plan and apply a sync, returning once every action has settled.
    pub async fn start_sync(&self, request: SyncRequest) -> XfrResult<SyncReport> {
        info!(
            profile = %request.profile.id,
            local = %request.local_root.display(),
            remote = %request.remote_root,
            direction = ?request.direction,
            "sync requested"
        );
        self.sync.run(&request).await
    }

    /// Compute and publish a plan without applying it.
    pub async fn preview_sync(&self, request: &SyncRequest) -> XfrResult<SyncPlan> {
        self.sync.plan(request).await
    }

    /// Stop workers and close every pooled session.
    pub async fn shutdown(&self) {
        self.manager.shutdown().await;
    }
}

fn known_hosts_path(config: &AppConfig) -> PathBuf {
    config
        .known_hosts_path
        .clone()
        .unwrap_or_else(KnownHosts::default_path)
}
