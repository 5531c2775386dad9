//! SafeTalk call CLI

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use config::TurnArg;
use coordinator::{Coordinator, HELP, RING_HELP};
use safetalk_call_core::prelude::*;
use safetalk_call_core::SignalingConnector;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::BufReader;

mod config;
mod coordinator;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Signaling server base URL
    #[arg(
        long,
        env = "SAFETALK_SIGNALING_URL",
        default_value = "ws://127.0.0.1:8000"
    )]
    signaling_url: String,

    /// STUN server URL (repeatable)
    #[arg(long)]
    stun: Vec<String>,

    /// TURN relay as url,username,credential (repeatable)
    #[arg(long)]
    turn: Vec<TurnArg>,

    /// JSON session config file
    #[arg(long, env = "SAFETALK_CALL_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Place a call on a session created by the control plane
    Call {
        /// Call session id
        session_id: String,

        /// voice or video
        #[arg(long, default_value = "video")]
        call_type: CallType,
    },

    /// Answer an incoming call
    Answer {
        /// Call session id
        session_id: String,

        /// voice or video
        #[arg(long, default_value = "video")]
        call_type: CallType,

        /// Accept without ringing first
        #[arg(long)]
        auto_accept: bool,
    },

    /// Call yourself through an in-process signaling hub
    Loopback {
        /// voice or video
        #[arg(long, default_value = "video")]
        call_type: CallType,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "safetalk=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = config::resolve(cli.config.as_deref(), &cli.stun, &cli.turn)?;
    let connector = Arc::new(WebSocketConnector::new(WebSocketConfig {
        base_url: cli.signaling_url.clone(),
        ..WebSocketConfig::default()
    }));

    let state = match cli.command {
        Commands::Call {
            session_id,
            call_type,
        } => handle_call(connector, config, SessionId::new(session_id), call_type).await?,
        Commands::Answer {
            session_id,
            call_type,
            auto_accept,
        } => {
            handle_answer(
                connector,
                config,
                SessionId::new(session_id),
                call_type,
                auto_accept,
            )
            .await?
        }
        Commands::Loopback { call_type } => handle_loopback(config, call_type).await?,
    };

    if let CallState::Failed(reason) = state {
        bail!("call failed: {reason}");
    }
    Ok(())
}

fn factory(connector: Arc<dyn SignalingConnector>, config: SessionConfig) -> CallFactory {
    CallFactory::new(
        connector,
        Arc::new(SyntheticDevices::default()),
        Arc::new(WebRtcPeerFactory::new()),
    )
    .with_config(config)
}

fn stdin() -> BufReader<tokio::io::Stdin> {
    BufReader::new(tokio::io::stdin())
}

async fn handle_call(
    connector: Arc<dyn SignalingConnector>,
    config: SessionConfig,
    session_id: SessionId,
    call_type: CallType,
) -> Result<CallState> {
    println!("Calling on session {session_id} ({call_type:?})");
    println!("{HELP}");

    let session = factory(connector, config).create();
    let coordinator = Coordinator::new(session.clone(), session_id.clone(), call_type);
    let (state, started) = tokio::join!(
        coordinator.run(stdin()),
        session.start(session_id, call_type, CallRole::Initiator)
    );
    started?;
    state
}

async fn handle_answer(
    connector: Arc<dyn SignalingConnector>,
    config: SessionConfig,
    session_id: SessionId,
    call_type: CallType,
    auto_accept: bool,
) -> Result<CallState> {
    let session = factory(connector, config).create();
    let coordinator = Coordinator::new(session.clone(), session_id.clone(), call_type);

    if auto_accept {
        println!("Answering session {session_id} ({call_type:?})");
        println!("{HELP}");
        let (state, accepted) = tokio::join!(
            coordinator.run(stdin()),
            session.accept_incoming(session_id, call_type)
        );
        accepted?;
        return state;
    }

    session.notify_incoming(session_id.clone(), call_type)?;
    println!("Incoming {call_type:?} call on session {session_id}");
    println!("{RING_HELP}, then {HELP}");
    coordinator.run(stdin()).await
}

async fn handle_loopback(mut config: SessionConfig, call_type: CallType) -> Result<CallState> {
    config.peer = PeerConfig::loopback();
    let hub = Arc::new(MemorySignalingHub::new());
    let calls = factory(hub, config);
    let session_id = SessionId::generate();

    let callee = calls.create();
    let mut callee_events = callee.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = callee_events.recv().await {
            tracing::info!(event = %coordinator::describe(&event), "Loopback callee");
        }
    });

    println!("Loopback call on session {session_id} ({call_type:?})");
    println!("{HELP}");

    let caller = calls.create();
    let coordinator = Coordinator::new(caller.clone(), session_id.clone(), call_type);
    let (state, started, answered) = tokio::join!(
        coordinator.run(stdin()),
        caller.start(session_id.clone(), call_type, CallRole::Initiator),
        callee.start(session_id, call_type, CallRole::Responder),
    );
    started?;
    answered?;

    callee.hangup().await;
    state
}
