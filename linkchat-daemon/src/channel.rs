//! Receive side of the message channel: reads the stream in fixed chunks,
//! reassembles newline-delimited messages, delivers them to the UI.

use std::sync::Arc;
use std::time::SystemTime;

use log::{debug, info, warn};
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;

use linkchat_core::{LineAssembler, READ_CHUNK_SIZE};

use crate::session::{SessionManager, SessionState};
use crate::ui::Direction;

/// Read until EOF or error, delivering each complete message as it arrives.
/// Tears the session down when the loop ends while the session is active.
pub(crate) async fn receive_loop(mut reader: OwnedReadHalf, manager: Arc<SessionManager>) {
    let mut assembler = LineAssembler::new();
    let mut buf = [0u8; READ_CHUNK_SIZE];
    let reason = loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                info!("peer closed the connection");
                break "peer disconnected";
            }
            Ok(n) => {
                debug!("received {n} byte(s)");
                for line in assembler.push(&buf[..n]) {
                    manager.ui().message(Direction::Received, &line, SystemTime::now());
                }
            }
            Err(e) => {
                warn!("read failed: {e}");
                break "connection lost";
            }
        }
    };
    if assembler.pending() > 0 {
        debug!("discarding {} byte(s) of partial message", assembler.pending());
    }
    // A loop ending while the session is not already closing is an
    // unexpected disconnect.
    if !matches!(manager.state(), SessionState::Idle | SessionState::Closing) {
        manager.spawn_teardown(reason);
    }
}
