//! Per-profile session pool.
//!
//! Each profile gets a semaphore sized to its session limit. A checkout
//! holds one permit for as long as the session is out; waiting for a permit
//! suspends the caller. Returned sessions are kept idle for reuse. A session
//! dropped without being returned is closed by dropping it and its permit is
//! released with it.

use crate::transfer::types::PoolConfig;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};
use xfer_core::{
    ConnectionProfile, Connector, Event, EventBus, RemoteSession, XfrError, XfrResult,
};

struct IdleSession {
    since: Instant,
    session: Box<dyn RemoteSession>,
}

struct ProfileSlot {
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<IdleSession>>,
}

pub struct SessionPool {
    connector: Arc<dyn Connector>,
    config: PoolConfig,
    events: EventBus,
    slots: Mutex<HashMap<String, Arc<ProfileSlot>>>,
}

/// A session checked out of the pool. Call [`PooledSession::release`] to
/// hand it back for reuse; dropping it discards the connection.
pub struct PooledSession {
    session: Option<Box<dyn RemoteSession>>,
    slot: Arc<ProfileSlot>,
    _permit: OwnedSemaphorePermit,
}

impl PooledSession {
    pub fn session(&mut self) -> XfrResult<&mut (dyn RemoteSession + 'static)> {
        self.session
            .as_deref_mut()
            .ok_or_else(|| XfrError::connection("pooled session already released"))
    }

    /// Return the session to the idle list if it is still usable.
    pub fn release(mut self) {
        if let Some(session) = self.session.take() {
            if session.is_open() {
                if let Ok(mut idle) = self.slot.idle.lock() {
                    idle.push(IdleSession {
                        since: Instant::now(),
                        session,
                    });
                }
            } else {
                debug!(profile = session.profile_id(), "dropping closed session");
            }
        }
    }
}

impl SessionPool {
    pub fn new(connector: Arc<dyn Connector>, config: PoolConfig, events: EventBus) -> Self {
        Self {
            connector,
            config,
            events,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, profile_id: &str) -> XfrResult<Arc<ProfileSlot>> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|_| XfrError::connection("session pool lock poisoned"))?;
        let limit = self.config.max_sessions_per_profile.max(1);
        Ok(slots
            .entry(profile_id.to_string())
            .or_insert_with(|| {
                Arc::new(ProfileSlot {
                    permits: Arc::new(Semaphore::new(limit)),
                    idle: Mutex::new(Vec::new()),
                })
            })
            .clone())
    }

    /// Get a session for `profile`, reusing an idle one when possible.
    /// Suspends while the profile is at its session limit.
    pub async fn checkout(&self, profile: &ConnectionProfile) -> XfrResult<PooledSession> {
        let slot = self.slot(&profile.id)?;
        let permit = slot
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| XfrError::cancelled("session pool is shut down"))?;

        let mut stale = Vec::new();
        let reused = {
            let mut idle = slot
                .idle
                .lock()
                .map_err(|_| XfrError::connection("session pool lock poisoned"))?;
            let timeout = self.config.idle_timeout();
            let mut found = None;
            while let Some(entry) = idle.pop() {
                if entry.session.is_open() && entry.since.elapsed() < timeout {
                    found = Some(entry.session);
                    break;
                }
                stale.push(entry.session);
            }
            found
        };
        for mut s in stale {
            let _ = s.close().await;
        }

        let session = match reused {
            Some(s) => {
                debug!(profile = %profile.id, "reusing idle session");
                s
            }
            None => {
                let s = self.connector.connect(profile).await?;
                info!(profile = %profile.id, "session opened");
                self.events.publish(Event::Connected {
                    profile_id: profile.id.clone(),
                });
                s
            }
        };

        Ok(PooledSession {
            session: Some(session),
            slot,
            _permit: permit,
        })
    }

    /// Sessions currently available for `profile_id` without connecting.
    pub fn idle_count(&self, profile_id: &str) -> usize {
        self.slots
            .lock()
            .ok()
            .and_then(|s| s.get(profile_id).cloned())
            .and_then(|slot| slot.idle.lock().ok().map(|i| i.len()))
            .unwrap_or(0)
    }

    /// Free permits for `profile_id`; equals the session limit when nothing
    /// is checked out.
    pub fn available(&self, profile_id: &str) -> usize {
        match self.slots.lock().ok().and_then(|s| s.get(profile_id).cloned()) {
            Some(slot) => slot.permits.available_permits(),
            None => self.config.max_sessions_per_profile.max(1),
        }
    }

    /// Close the idle sessions of one profile. Checked-out sessions are
    /// discarded when their holders finish.
    pub async fn close_profile(&self, profile_id: &str, reason: &str) {
        let slot = match self.slots.lock().ok().and_then(|s| s.get(profile_id).cloned()) {
            Some(slot) => slot,
            None => return,
        };
        let drained: Vec<IdleSession> = match slot.idle.lock() {
            Ok(mut idle) => idle.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        let had_sessions = !drained.is_empty();
        for mut entry in drained {
            let _ = entry.session.close().await;
        }
        if had_sessions {
            info!(profile = %profile_id, reason, "sessions closed");
            self.events.publish(Event::Disconnected {
                profile_id: profile_id.to_string(),
                reason: reason.to_string(),
            });
        }
    }

    pub async fn close_all(&self, reason: &str) {
        let ids: Vec<String> = match self.slots.lock() {
            Ok(s) => s.keys().cloned().collect(),
            Err(_) => Vec::new(),
        };
        for id in ids {
            self.close_profile(&id, reason).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use xfer_core::testing::{MemoryConnector, MemoryFs};
    use xfer_core::Scheme;

    fn pool(connector: &MemoryConnector, max: usize) -> SessionPool {
        SessionPool::new(
            Arc::new(connector.clone()),
            PoolConfig {
                max_sessions_per_profile: max,
                idle_timeout_secs: 300,
            },
            EventBus::new(16),
        )
    }

    #[tokio::test]
    async fn test_released_session_is_reused() {
        let connector = MemoryConnector::new(MemoryFs::new());
        let pool = pool(&connector, 2);
        let profile = ConnectionProfile::new(Scheme::Ftp, "h");

        for _ in 0..3 {
            let mut s = pool.checkout(&profile).await.unwrap();
            s.session().unwrap().list("/").await.unwrap();
            s.release();
        }
        assert_eq!(connector.stats.connects.load(Ordering::SeqCst), 1);
        assert_eq!(pool.idle_count(&profile.id), 1);
        assert_eq!(pool.available(&profile.id), 2);
    }

    #[tokio::test]
    async fn test_checkout_waits_at_limit() {
        let connector = MemoryConnector::new(MemoryFs::new());
        let pool = Arc::new(pool(&connector, 1));
        let profile = ConnectionProfile::new(Scheme::Ftp, "h");

        let held = pool.checkout(&profile).await.unwrap();
        assert_eq!(pool.available(&profile.id), 0);

        let waiter = {
            let pool = pool.clone();
            let profile = profile.clone();
            tokio::spawn(async move { pool.checkout(&profile).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        // Dropping discards the session but frees the permit.
        drop(held);
        tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(connector.stats.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_connect_failure_returns_permit() {
        let connector = MemoryConnector::new(MemoryFs::new());
        connector.fail_next_connect(XfrError::connection("refused"));
        let pool = pool(&connector, 1);
        let profile = ConnectionProfile::new(Scheme::Sftp, "h");

        assert!(pool.checkout(&profile).await.is_err());
        assert_eq!(pool.available(&profile.id), 1);
        assert!(pool.checkout(&profile).await.is_ok());
    }

    #[tokio::test]
    async fn test_close_profile_publishes_disconnected() {
        let connector = MemoryConnector::new(MemoryFs::new());
        let bus = EventBus::new(16);
        let pool = SessionPool::new(Arc::new(connector.clone()), PoolConfig::default(), bus.clone());
        let mut rx = bus.subscribe();
        let profile = ConnectionProfile::new(Scheme::Ftp, "h");

        pool.checkout(&profile).await.unwrap().release();
        pool.close_profile(&profile.id, "user request").await;
        assert_eq!(pool.idle_count(&profile.id), 0);
        assert_eq!(connector.live_sessions(), 0);

        let mut names = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            names.push(ev.name());
        }
        assert_eq!(names, vec!["connected", "disconnected"]);
    }
}
