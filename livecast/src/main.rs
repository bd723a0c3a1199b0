use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use livecast_core::{
    logging,
    media::{MediaCapture, SimulatedBackend, SyntheticCapture},
    roster::RosterClient,
    Config, Session, SessionStatus, SignalingChannel,
};

#[derive(Parser, Debug)]
#[command(name = "livecast")]
#[command(about = "Publish a live track to a media-routing server", long_about = None)]
struct Args {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, env = "LIVECAST_CONFIG_PATH")]
    config: Option<String>,

    /// Signaling server WebSocket URL
    #[arg(long)]
    server: Option<String>,

    /// Display name announced on the roster (enables the roster)
    #[arg(long)]
    name: Option<String>,

    /// User id announced on the roster (generated if omitted)
    #[arg(long)]
    user_id: Option<String>,

    /// Publish the microphone track only
    #[arg(long, conflicts_with = "video_only")]
    audio_only: bool,

    /// Publish the camera track only
    #[arg(long)]
    video_only: bool,

    /// Request a TCP-only transport
    #[arg(long)]
    force_tcp: bool,

    /// Print the users currently live and exit
    #[arg(long)]
    list_live: bool,
}

fn apply_overrides(config: &mut Config, args: &Args) {
    if let Some(server) = &args.server {
        config.signaling.url.clone_from(server);
    }
    if let Some(name) = &args.name {
        config.roster.user_name.clone_from(name);
        config.roster.enabled = true;
    }
    if let Some(user_id) = &args.user_id {
        config.roster.user_id.clone_from(user_id);
    }
    if config.roster.enabled && config.roster.user_id.is_empty() {
        config.roster.user_id = nanoid::nanoid!(8);
    }
    if args.audio_only {
        config.stream.video = false;
        config.stream.audio = true;
    }
    if args.video_only {
        config.stream.audio = false;
        config.stream.video = true;
    }
    if args.force_tcp {
        config.stream.force_tcp = true;
    }
}

async fn log_status_changes(mut rx: watch::Receiver<SessionStatus>) {
    while rx.changed().await.is_ok() {
        let status = *rx.borrow_and_update();
        if status.is_failure() {
            warn!(status = %status, "Streaming status");
        } else {
            info!(status = %status, "Streaming status");
        }
    }
}

async fn shutdown(session: &Session, roster: Option<&RosterClient>, marked_live: bool) {
    session.stop_stream().await;

    if let (Some(roster), true) = (roster, marked_live) {
        if let Err(e) = roster.stop_stream().await {
            warn!(error = %e, "Failed to mark stream stopped on roster");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load configuration, command-line flags take precedence
    let mut config = Config::load(args.config.as_deref()).context("Failed to load config")?;
    apply_overrides(&mut config, &args);

    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("LiveCast client starting...");

    let roster = if config.roster.enabled {
        Some(RosterClient::new(&config.roster)?)
    } else {
        None
    };

    if args.list_live {
        let roster = roster.ok_or_else(|| anyhow!("--list-live needs the roster enabled"))?;
        for user in roster.live_users().await? {
            println!("{}\t{}", user.id, user.name);
        }
        return Ok(());
    }

    // 3. Acquire the local track
    let capture = SyntheticCapture::new();
    let track = capture
        .acquire_local_track(&config.stream.constraints())
        .await
        .context("Could not acquire local track")?;

    // 4. Connect signaling and join the room
    let channel = Arc::new(SignalingChannel::connect(&config.signaling).await);
    if !channel.is_connected() {
        return Err(anyhow!(
            "Signaling server {} is unreachable",
            config.signaling.url
        ));
    }

    let session = Session::new(
        Arc::clone(&channel),
        Arc::new(SimulatedBackend::new()),
        &config.stream,
    );
    let status_task = tokio::spawn(log_status_changes(session.subscribe_status()));
    info!(session_id = %session.id(), "Session ready");

    session.join_room()?;
    if let Err(e) = session
        .wait_until_joined(config.signaling.join_timeout())
        .await
    {
        warn!(error = %e, "Room membership not confirmed, continuing");
    }

    // 5. Negotiate and go live
    let producer = match session.start_streaming(&track).await {
        Ok(producer) => producer,
        Err(e) => {
            error!(status = %session.status(), error = %e, "Failed to start streaming");
            shutdown(&session, roster.as_ref(), false).await;
            status_task.abort();
            return Err(e.into());
        }
    };
    info!(producer_id = %producer.id, kind = %producer.kind, "Streaming live");

    let mut marked_live = false;
    if let Some(roster) = &roster {
        match roster
            .start_stream(&config.roster.user_name, &config.roster.user_id)
            .await
        {
            Ok(started) => marked_live = started,
            Err(e) => warn!(error = %e, "Failed to mark live on roster"),
        }
    }

    // 6. Run until interrupted
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    if let Some(stats) = session.latest_stats() {
        info!(received_at = %stats.received_at, stats = %stats.stats, "Last RTP stats");
    }
    shutdown(&session, roster.as_ref(), marked_live).await;
    track.stop();
    status_task.abort();

    info!("LiveCast client stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides_config() {
        let args = Args::parse_from([
            "livecast",
            "--server",
            "wss://media.example.com/ws",
            "--name",
            "alice",
            "--audio-only",
            "--force-tcp",
        ]);
        let mut config = Config::default();
        apply_overrides(&mut config, &args);

        assert_eq!(config.signaling.url, "wss://media.example.com/ws");
        assert!(config.roster.enabled);
        assert_eq!(config.roster.user_name, "alice");
        assert_eq!(config.roster.user_id.len(), 8);
        assert!(config.stream.audio);
        assert!(!config.stream.video);
        assert!(config.stream.force_tcp);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_audio_and_video_only_conflict() {
        assert!(Args::try_parse_from(["livecast", "--audio-only", "--video-only"]).is_err());
    }
}
