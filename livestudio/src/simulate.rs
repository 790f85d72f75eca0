//! Scripted studio session against the loopback SFU
//!
//! The host talks to the server through the line-delimited JSON channel;
//! guests use in-process connections.

use anyhow::{anyhow, Context, Result};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use livestudio_core::Config;
use livestudio_sfu::{
    JsonLineChannel, LoopbackSfu, Role, ServerEvent, Session, SessionConfig, SessionPhase,
    SignalingChannel, SimulatedMedia, SocketId, StudioNotice,
};

const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Options {
    pub guests: usize,
    pub deny: usize,
    pub screen_share: bool,
}

struct Guest {
    session: Session,
    socket_id: SocketId,
    admitted: bool,
}

fn start_session(
    config: SessionConfig,
    channel: Arc<dyn SignalingChannel>,
    events: tokio::sync::mpsc::Receiver<ServerEvent>,
) -> Session {
    let media = Arc::new(SimulatedMedia::new());
    let session = Session::new(config, channel, media.clone(), media);

    let runner = session.clone();
    tokio::spawn(async move { runner.run(events).await });

    let name = session.config().display_name.clone();
    let mut notices = session.subscribe();
    tokio::spawn(async move {
        loop {
            match notices.recv().await {
                Ok(notice) => log_notice(&name, &notice),
                Err(RecvError::Lagged(skipped)) => warn!(%name, skipped, "Notices dropped"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    session
}

fn log_notice(name: &str, notice: &StudioNotice) {
    match notice {
        StudioNotice::GuestRequested(request) => {
            info!(%name, guest = %request.display_name, "Guest waiting for approval");
        }
        StudioNotice::AdmissionChanged(state) => info!(%name, ?state, "Admission changed"),
        other => warn!(%name, notice = ?other, "Studio notice"),
    }
}

async fn settle(what: &str, mut condition: impl FnMut() -> bool) -> Result<()> {
    tokio::time::timeout(SETTLE_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .map_err(|_| anyhow!("Timed out waiting for {what}"))
}

pub async fn run(config: &Config, options: Options) -> Result<Value> {
    let sfu = LoopbackSfu::new().with_event_buffer(config.signaling.event_buffer);

    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let server = sfu.clone();
    let max_frame_len = config.signaling.max_frame_len;
    tokio::spawn(async move {
        if let Err(e) = server.serve(server_io, max_frame_len).await {
            warn!(error = %e, "Loopback connection failed");
        }
    });
    let (channel, events) =
        JsonLineChannel::connect(client_io, &config.signaling.channel_options());

    let mut host_config = config.studio.session_config();
    host_config.role = Role::Host;
    let room_id = host_config.room_id.clone();
    let host = start_session(host_config, Arc::new(channel), events);

    host.join().await.context("host failed to join")?;
    if config.studio.publish_camera {
        host.enable_camera().await?;
    }
    if config.studio.publish_microphone {
        host.enable_microphone().await?;
    }
    if options.screen_share {
        host.start_screen_share().await?;
    }
    let host_producers = [
        config.studio.publish_camera,
        config.studio.publish_microphone,
        options.screen_share,
    ]
    .into_iter()
    .filter(|enabled| *enabled)
    .count();

    let mut guests = Vec::with_capacity(options.guests);
    for index in 0..options.guests {
        let (channel, events) = sfu.connect();
        let socket_id = channel.socket_id().clone();
        let session = start_session(
            SessionConfig::guest(room_id.clone(), format!("Guest {}", index + 1)),
            Arc::new(channel),
            events,
        );
        session.request_admission().await?;
        settle("guest request", || {
            host.pending_guests()
                .iter()
                .any(|g| g.requester_socket_id == socket_id)
        })
        .await?;

        let admitted = index >= options.deny;
        if admitted {
            host.approve_guest(&socket_id).await?;
        } else {
            host.deny_guest(&socket_id)?;
        }
        guests.push(Guest {
            session,
            socket_id,
            admitted,
        });
    }

    let admitted: Vec<&Guest> = guests.iter().filter(|g| g.admitted).collect();
    for guest in &admitted {
        settle("guest join", || guest.session.phase() == SessionPhase::Joined).await?;
        guest.session.enable_camera().await?;
        guest.session.enable_microphone().await?;
    }

    settle("host consumers", || {
        host.snapshot().consumer_count() == admitted.len() * 2
    })
    .await?;
    let per_guest = host_producers + (admitted.len().saturating_sub(1)) * 2;
    for guest in &admitted {
        settle("guest consumers", || {
            guest.session.snapshot().consumer_count() == per_guest
        })
        .await?;
    }

    let report = json!({
        "host": host.snapshot(),
        "guests": guests
            .iter()
            .map(|g| json!({
                "socketId": g.socket_id,
                "admission": g.session.admission_state(),
                "phase": g.session.phase(),
                "consumers": g.session.snapshot().consumer_count(),
            }))
            .collect::<Vec<_>>(),
        "server": sfu.stats(),
    });

    for guest in &guests {
        guest.session.leave();
    }
    host.leave();
    settle("server cleanup", || sfu.stats().members == 0).await?;
    info!(room_id = %room_id, "Simulation finished");

    Ok(report)
}
