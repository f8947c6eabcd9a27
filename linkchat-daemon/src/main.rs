// linkchat daemon: ad-hoc link chat transport with encounter admission.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use log::{error, info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, Notify};

use linkchat_core::{AdmissionController, DeviceTimingProfile, HardwareClass};
use linkchat_daemon::events::{self, GroupInfo, LinkEvent, PeerInfo};
use linkchat_daemon::session::SessionManager;
use linkchat_daemon::ui::TerminalUi;
use linkchat_daemon::{config, ui::UiSink};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("linkchat {}", VERSION);
            return Ok(());
        }
    }

    env_logger::init();
    let cfg = config::load();

    let class = cfg.device_class.unwrap_or_else(HardwareClass::detect);
    let profile = DeviceTimingProfile::resolve(class);
    profile.log_summary(class);

    let peer_id = format!("linkchat-{}", uuid::Uuid::new_v4());
    info!("local peer id: {peer_id}");

    let admission = Arc::new(AdmissionController::new(
        peer_id,
        &cfg.storage_dir,
        Duration::from_millis(cfg.cooldown_ms),
        &profile,
    ));
    // Fail open: a broken admission store degrades to allow-all, the daemon
    // still runs.
    if let Err(e) = admission.initialize() {
        error!("admission initialization failed, continuing without cooldowns: {e}");
    }

    let rt = tokio::runtime::Runtime::new().context("failed to start runtime")?;
    rt.block_on(run(cfg, profile, admission))
}

async fn run(
    cfg: config::Config,
    profile: DeviceTimingProfile,
    admission: Arc<AdmissionController>,
) -> anyhow::Result<()> {
    let ui: Arc<dyn UiSink> = Arc::new(TerminalUi);
    let manager = SessionManager::new(
        cfg.transport_port,
        cfg.subnet_prefix.clone(),
        profile,
        admission.clone(),
        ui.clone(),
    );

    let (event_tx, event_rx) = mpsc::unbounded_channel::<LinkEvent>();
    tokio::spawn(events::drive(
        manager.clone(),
        admission.clone(),
        ui.clone(),
        event_rx,
    ));

    let quit = Arc::new(Notify::new());
    tokio::spawn(stdin_loop(
        manager.clone(),
        admission.clone(),
        ui.clone(),
        event_tx,
        quit.clone(),
    ));

    ui.status(&admission.status_line());
    ui.status("commands: host | join <addr> | peers | leave | quit; anything else is sent as a message");

    tokio::select! {
        res = shutdown_signal() => res?,
        _ = quit.notified() => {}
    }

    manager.teardown("shutting down").await;
    admission.reset();
    Ok(())
}

/// Read operator commands from stdin until EOF or `quit`.
async fn stdin_loop(
    manager: Arc<SessionManager>,
    admission: Arc<AdmissionController>,
    ui: Arc<dyn UiSink>,
    events: mpsc::UnboundedSender<LinkEvent>,
    quit: Arc<Notify>,
) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("stdin read failed: {e}");
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line.split_once(' ') {
            _ if line == "quit" => break,
            _ if line == "host" => {
                let _ = events.send(LinkEvent::GroupChanged(GroupInfo {
                    group_formed: true,
                    is_group_owner: true,
                    owner_address: None,
                }));
            }
            _ if line == "peers" => {
                ui.status(&admission.status_line());
                ui.status(admission.active_connections_info().trim_end());
            }
            _ if line == "leave" => {
                let _ = events.send(LinkEvent::GroupChanged(GroupInfo {
                    group_formed: false,
                    is_group_owner: false,
                    owner_address: None,
                }));
            }
            Some(("join", addr)) => match addr.trim().parse::<IpAddr>() {
                Ok(owner) => {
                    let peer = PeerInfo {
                        peer_id: owner.to_string(),
                        display_name: owner.to_string(),
                    };
                    if manager.request_connection(&peer) {
                        let _ = events.send(LinkEvent::GroupChanged(GroupInfo {
                            group_formed: true,
                            is_group_owner: false,
                            owner_address: Some(owner),
                        }));
                    }
                }
                Err(e) => ui.status(&format!("bad address {addr:?}: {e}")),
            },
            _ => {
                if let Err(e) = manager.send(line).await {
                    warn!("send failed: {e}");
                }
            }
        }
    }
    quit.notify_one();
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("sigterm handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
