//! Discovery-collaborator interface: peer lists, group formation, link state.
//! The discovery layer pushes `LinkEvent`s; `drive` feeds them to the session
//! manager and the UI.

use std::net::IpAddr;
use std::sync::Arc;

use log::{debug, info};
use tokio::sync::mpsc;

use linkchat_core::{AdmissionController, LinkKind};

use crate::session::SessionManager;
use crate::ui::UiSink;

/// A discovered peer as reported by the discovery layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    /// Opaque link-layer identifier, stable for the discovery epoch.
    pub peer_id: String,
    pub display_name: String,
}

/// Group-formation report from the discovery layer.
#[derive(Debug, Clone, Copy)]
pub struct GroupInfo {
    pub group_formed: bool,
    pub is_group_owner: bool,
    pub owner_address: Option<IpAddr>,
}

/// Events pushed by the discovery layer.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// Link layer enabled or disabled.
    StateChanged(bool),
    /// Fresh peer list.
    PeersChanged(Vec<PeerInfo>),
    /// Group formed or dissolved.
    GroupChanged(GroupInfo),
}

/// Filter a discovered peer list down to peers the admission controller
/// would currently allow a connection to.
pub fn filter_available(admission: &AdmissionController, peers: &[PeerInfo]) -> Vec<PeerInfo> {
    peers
        .iter()
        .filter(|p| {
            let allow = admission.should_connect(&p.peer_id, LinkKind::AdHoc);
            if !allow {
                debug!("hiding peer {} ({}): cooldown active", p.display_name, p.peer_id);
            }
            allow
        })
        .cloned()
        .collect()
}

/// Consume discovery events until the channel closes.
pub async fn drive(
    manager: Arc<SessionManager>,
    admission: Arc<AdmissionController>,
    ui: Arc<dyn UiSink>,
    mut events: mpsc::UnboundedReceiver<LinkEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            LinkEvent::StateChanged(enabled) => {
                info!("link state changed: enabled={enabled}");
                ui.status(if enabled { "link enabled" } else { "link disabled" });
                if !enabled {
                    manager.teardown("link disabled").await;
                }
            }
            LinkEvent::PeersChanged(peers) => {
                let available = filter_available(&admission, &peers);
                if peers.is_empty() {
                    ui.status("no peers found");
                } else if available.is_empty() {
                    ui.status(&format!("{} peer(s) found, but all in cooldown", peers.len()));
                } else {
                    ui.status(&format!("{} of {} peer(s) available", available.len(), peers.len()));
                }
                ui.peers(&available);
            }
            LinkEvent::GroupChanged(info) => {
                manager.clone().on_group_formed(info).await;
            }
        }
    }
    debug!("discovery event channel closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use linkchat_core::{DeviceTimingProfile, HardwareClass};
    use std::time::Duration;
    use tempdir::TempDir;

    fn peer(id: &str) -> PeerInfo {
        PeerInfo {
            peer_id: id.to_string(),
            display_name: format!("dev-{id}"),
        }
    }

    #[test]
    fn uninitialized_admission_shows_all_peers() {
        let dir = TempDir::new("linkchat-events").unwrap();
        let profile = DeviceTimingProfile {
            init_delay_ms: 0,
            ..DeviceTimingProfile::resolve(HardwareClass::Baseline)
        };
        let admission =
            AdmissionController::new("self", dir.path(), Duration::from_secs(3600), &profile);
        let peers = vec![peer("aa"), peer("bb")];
        assert_eq!(filter_available(&admission, &peers), peers);
    }

    #[test]
    fn peers_in_cooldown_are_hidden() {
        let dir = TempDir::new("linkchat-events").unwrap();
        let profile = DeviceTimingProfile {
            init_delay_ms: 0,
            ..DeviceTimingProfile::resolve(HardwareClass::Baseline)
        };
        let admission =
            AdmissionController::new("self", dir.path(), Duration::from_secs(3600), &profile);
        admission.initialize().unwrap();
        admission.record_encounter("aa", LinkKind::AdHoc);

        let available = filter_available(&admission, &[peer("aa"), peer("bb")]);
        assert_eq!(available, vec![peer("bb")]);
    }
}
