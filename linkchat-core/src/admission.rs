//! Encounter admission: decides whether a new connection to a peer is
//! currently permitted, and tracks active connections.
//!
//! Two maps with different lifetimes: last-encounter timestamps are never
//! cleared (the cooldown must survive a session's teardown), the
//! active-connections set is cleared per-release and on reset.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::profile::DeviceTimingProfile;

/// Default cooldown between encounters with the same peer.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_millis(5000);

/// Link layer a connection runs over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    /// Ad-hoc layer-2 link between the two devices.
    AdHoc,
    /// Routed network. Not used by the daemon today.
    Internet,
}

/// Admission initialization failure. Surfaced once, no retry.
#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("failed to create storage dir {0}: {1}")]
    CreateStorage(PathBuf, #[source] std::io::Error),
    #[error("storage dir {0} is not read/write accessible: {1}")]
    StorageAccess(PathBuf, #[source] std::io::Error),
}

pub struct AdmissionController {
    /// Local peer id, for logs only.
    peer_id: String,
    storage_dir: PathBuf,
    cooldown: Duration,
    init_delay: Duration,
    strict_init: bool,
    ready: AtomicBool,
    init_lock: Mutex<()>,
    last_encounter: Mutex<HashMap<String, Instant>>,
    active: Mutex<HashMap<String, Instant>>,
}

impl AdmissionController {
    pub fn new(
        peer_id: impl Into<String>,
        storage_dir: impl Into<PathBuf>,
        cooldown: Duration,
        profile: &DeviceTimingProfile,
    ) -> Self {
        Self {
            peer_id: peer_id.into(),
            storage_dir: storage_dir.into(),
            cooldown,
            init_delay: profile.init_delay(),
            strict_init: profile.strict_init_validation,
            ready: AtomicBool::new(false),
            init_lock: Mutex::new(()),
            last_encounter: Mutex::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
        }
    }

    /// One-time initialization: apply the device-specific startup delay, then
    /// create and probe the storage location. Concurrent callers converge on
    /// a single outcome; repeated calls after success are no-ops. On failure
    /// partial state is released and the controller stays not-ready.
    pub fn initialize(&self) -> Result<(), InitError> {
        let _guard = lock_or_recover(&self.init_lock);
        if self.ready.load(Ordering::Acquire) {
            debug!("admission controller already initialized");
            return Ok(());
        }
        debug!(
            "initializing admission controller for {} (storage {}, cooldown {}ms, delay {}ms)",
            self.peer_id,
            self.storage_dir.display(),
            self.cooldown.as_millis(),
            self.init_delay.as_millis()
        );
        if !self.init_delay.is_zero() {
            std::thread::sleep(self.init_delay);
        }
        match self.prepare_storage() {
            Ok(()) => {
                self.ready.store(true, Ordering::Release);
                info!("admission controller ready for {}", self.peer_id);
                Ok(())
            }
            Err(e) => {
                error!("admission controller initialization failed: {e}");
                lock_or_recover(&self.active).clear();
                self.ready.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    fn prepare_storage(&self) -> Result<(), InitError> {
        fs::create_dir_all(&self.storage_dir)
            .map_err(|e| InitError::CreateStorage(self.storage_dir.clone(), e))?;
        self.probe_storage()?;
        if self.strict_init {
            // Slow-setup hardware occasionally reports the directory writable
            // before it is; settle and probe again.
            std::thread::sleep(Duration::from_millis(100));
            self.probe_storage()?;
            debug!("strict storage validation pass completed");
        }
        Ok(())
    }

    /// Write a probe file, read it back, remove it. Proves read/write access.
    fn probe_storage(&self) -> Result<(), InitError> {
        let probe = self.storage_dir.join(".probe");
        let check = || -> std::io::Result<()> {
            fs::write(&probe, b"linkchat")?;
            fs::read(&probe)?;
            fs::remove_file(&probe)?;
            Ok(())
        };
        check().map_err(|e| InitError::StorageAccess(self.storage_dir.clone(), e))
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// May a connection to `peer` be created now? Allows when no encounter is
    /// on record or the cooldown has elapsed. Fails open: a not-ready or
    /// malfunctioning controller never blocks connectivity.
    pub fn should_connect(&self, peer: &str, link: LinkKind) -> bool {
        if !self.is_ready() {
            warn!("admission controller not initialized, allowing connection to {peer} by default");
            return true;
        }
        let map = lock_or_recover(&self.last_encounter);
        match map.get(peer) {
            None => {
                debug!("no prior encounter with {peer}, allowing ({link:?})");
                true
            }
            Some(&at) => {
                let elapsed = at.elapsed();
                let allow = elapsed >= self.cooldown;
                info!(
                    "admission decision for {peer} ({link:?}): {} ({}ms since last encounter)",
                    if allow { "allow" } else { "deny, cooldown active" },
                    elapsed.as_millis()
                );
                allow
            }
        }
    }

    /// Record a live encounter: update the peer's last-encounter timestamp
    /// and add it to the active-connections set. Never fails the caller.
    pub fn record_encounter(&self, peer: &str, link: LinkKind) {
        if !self.is_ready() {
            warn!("admission controller not initialized, skipping encounter record for {peer}");
            return;
        }
        let now = Instant::now();
        lock_or_recover(&self.last_encounter).insert(peer.to_string(), now);
        let active = {
            let mut active = lock_or_recover(&self.active);
            active.insert(peer.to_string(), now);
            active.len()
        };
        info!("encounter recorded for {peer} ({link:?}), {active} active connection(s)");
    }

    /// Remove `peer` from the active-connections set. Idempotent: releasing
    /// an absent peer is a no-op. Encounter history is kept so the cooldown
    /// still applies after disconnect.
    pub fn release_connection(&self, peer: &str) {
        let mut active = lock_or_recover(&self.active);
        if active.remove(peer).is_some() {
            debug!("released connection to {peer}, {} remaining", active.len());
        } else {
            debug!("release for {peer}: not in active set");
        }
    }

    /// Full shutdown: clear the active set and readiness. Last-encounter
    /// timestamps are preserved by design.
    pub fn reset(&self) {
        lock_or_recover(&self.active).clear();
        self.ready.store(false, Ordering::Release);
        info!("admission controller reset");
    }

    pub fn active_count(&self) -> usize {
        lock_or_recover(&self.active).len()
    }

    /// One-line status for the UI surface.
    pub fn status_line(&self) -> String {
        if self.is_ready() {
            format!(
                "ready - peer {}, cooldown {}ms, {} active",
                self.peer_id,
                self.cooldown.as_millis(),
                self.active_count()
            )
        } else {
            "not initialized".to_string()
        }
    }

    /// Multi-line active-connection dump for debugging.
    pub fn active_connections_info(&self) -> String {
        let active = lock_or_recover(&self.active);
        let mut out = format!("active connections ({}):\n", active.len());
        for (peer, started) in active.iter() {
            out.push_str(&format!("  - {}: {}ms ago\n", peer, started.elapsed().as_millis()));
        }
        out
    }
}

/// A poisoned map is still structurally sound; recover rather than block
/// connectivity on a panicked writer.
fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            error!("admission lock poisoned, recovering");
            poisoned.into_inner()
        }
    }
}
