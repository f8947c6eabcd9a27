//! Narrow UI callback surface. The session manager is handed a `UiSink` at
//! construction and never sees the concrete front end.

use std::time::SystemTime;

use crate::events::PeerInfo;

/// Message direction as shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Sent,
    Received,
}

/// Callbacks into the UI/status surface. Implementations must not block:
/// they run on session and receive-loop tasks.
pub trait UiSink: Send + Sync {
    /// Human-readable status update.
    fn status(&self, text: &str);
    /// One delivered chat message with its send/receive timestamp.
    fn message(&self, direction: Direction, text: &str, at: SystemTime);
    /// Peer list after admission filtering.
    fn peers(&self, peers: &[PeerInfo]);
}

/// Terminal front end: prints to stdout.
pub struct TerminalUi;

impl UiSink for TerminalUi {
    fn status(&self, text: &str) {
        println!("[status] {text}");
    }

    fn message(&self, direction: Direction, text: &str, _at: SystemTime) {
        let who = match direction {
            Direction::Sent => "you",
            Direction::Received => "them",
        };
        println!("{who}: {text}");
    }

    fn peers(&self, peers: &[PeerInfo]) {
        for (i, peer) in peers.iter().enumerate() {
            println!("[{i}] {} ({})", peer.display_name, peer.peer_id);
        }
    }
}
