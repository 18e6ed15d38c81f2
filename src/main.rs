//! gatecall - Realtime call/session coordination engine
//!
//! Turns a scanned-QR visitor request into a live chat, audio, or video
//! session. This binary is the signaling test harness around the engine:
//! it drives real sessions against a signaling server with a loopback
//! media runtime standing in for the browser stack.

mod alerts;
mod api;
mod call;
mod chat;
mod config;
mod signaling;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use alerts::{Alert, ChannelAlertSink};
use call::access::AccessGrants;
use call::bandwidth::BandwidthAdaptationPolicy;
use call::harness::LoopbackRuntime;
use call::{SessionDriver, SessionIntent};
use config::Config;
use signaling::event::{SenderRole, SignalEvent};
use signaling::pool::SignalingPool;
use signaling::{ChannelEvent, SignalClient};

#[derive(Parser)]
#[command(name = "gatecall")]
#[command(about = "Call/session coordination engine for QR doorstep intercoms", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Join a session and print decoded signaling events
    Listen {
        /// Session id (from the scanned QR)
        session_id: String,

        /// Automatically accept an incoming call
        #[arg(long)]
        auto_answer: bool,
    },

    /// Place a call into a session (loopback media runtime)
    Call {
        /// Session id (from the scanned QR)
        session_id: String,

        /// Request video as well as audio
        #[arg(long)]
        video: bool,
    },

    /// Send one chat message and wait for the persistence ack
    Send {
        /// Session id (from the scanned QR)
        session_id: String,

        /// Message content
        message: String,
    },

    /// Toggle the persisted low-bandwidth preference
    SetBandwidth {
        /// "on" or "off"
        mode: String,
    },

    /// Show current configuration
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match cli.command {
        Commands::Listen {
            session_id,
            auto_answer,
        } => {
            run_session(&session_id, SenderRole::Resident, None, auto_answer).await?;
        }
        Commands::Call { session_id, video } => {
            run_session(&session_id, SenderRole::Visitor, Some(video), false).await?;
        }
        Commands::Send {
            session_id,
            message,
        } => {
            send_message(&session_id, &message).await?;
        }
        Commands::SetBandwidth { mode } => {
            let on = match mode.as_str() {
                "on" => true,
                "off" => false,
                other => anyhow::bail!("expected 'on' or 'off', got '{}'", other),
            };
            let mut cfg = Config::load()?;
            cfg.low_bandwidth = on;
            cfg.save()?;
            println!("Low-bandwidth mode: {}", mode);
        }
        Commands::Status => {
            let cfg = Config::load()?;
            println!("Signaling URL:   {}", cfg.signaling_url());
            println!("History URL:     {}", cfg.history_url());
            println!("Display name:    {}", cfg.display_name());
            println!("Low bandwidth:   {}", cfg.low_bandwidth);
            println!("Device class:    {}", cfg.device_class.as_str());
        }
    }

    Ok(())
}

/// Build the process-wide signaling pool from the configuration.
fn make_pool(cfg: &Config) -> SignalingPool<SignalClient> {
    let base_url = cfg.signaling_url().to_string();
    let display_name = cfg.display_name().to_string();
    SignalingPool::new(move |session_id| {
        let base_url = base_url.clone();
        let display_name = display_name.clone();
        Box::pin(async move { SignalClient::connect(&base_url, &session_id, &display_name).await })
            as BoxFuture<'static, Result<Arc<SignalClient>>>
    })
}

/// Join a session and run the call engine until Ctrl-C or call end.
async fn run_session(
    session_id: &str,
    role: SenderRole,
    start_video: Option<bool>,
    auto_answer: bool,
) -> Result<()> {
    let cfg = Config::load().context("Failed to load config")?;
    let pool = make_pool(&cfg);
    let client = pool.acquire(session_id).await?;
    let signals = client.subscribe();

    // Outbound events flow through the pooled client.
    let (signal_tx, mut signal_rx) = mpsc::unbounded_channel::<SignalEvent>();
    {
        let client = Arc::clone(&client);
        tokio::spawn(async move {
            while let Some(event) = signal_rx.recv().await {
                client.send(event);
            }
        });
    }

    let (alert_sink, mut alerts_rx) = ChannelAlertSink::new();
    let grants = Arc::new(AccessGrants::new());
    let adaptation = BandwidthAdaptationPolicy::new(cfg.device_class, cfg.low_bandwidth);

    let (mut driver, mut snapshots) = SessionDriver::new(
        session_id,
        cfg.display_name(),
        role,
        LoopbackRuntime,
        adaptation,
        signal_tx,
        Arc::new(alert_sink),
        Arc::clone(&grants),
    );

    // Seed the chat with persisted history (best-effort).
    let http = reqwest::Client::new();
    match api::fetch_history(&http, cfg.history_url(), session_id).await {
        Ok(history) => {
            if !history.is_empty() {
                println!("--- {} earlier messages ---", history.len());
            }
            driver.merge_history(history);
        }
        Err(e) => tracing::debug!("History fetch skipped: {:#}", e),
    }

    let (intents_tx, intents_rx) = mpsc::channel(16);
    tokio::spawn(driver.run(intents_rx, signals));

    if let Some(video) = start_video {
        intents_tx
            .send(SessionIntent::StartCall { wants_video: video })
            .await
            .ok();
    }

    println!("Session {} joined. Ctrl-C to leave.", session_id);

    let mut last_state = String::new();
    let mut seen_messages = 0usize;
    let mut answered = false;

    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snap = snapshots.borrow().clone();
                if snap.state != last_state {
                    println!(
                        "[{}] quality={} stage={:?}",
                        snap.state,
                        snap.quality.as_str(),
                        snap.launch_stage
                    );
                    last_state = snap.state.clone();
                }
                for msg in snap.messages.iter().skip(seen_messages) {
                    println!(
                        "  <{}> {}{}",
                        msg.display_name,
                        msg.text,
                        if msg.persisted { "" } else { " (sending...)" }
                    );
                }
                seen_messages = snap.messages.len();
                if let Some(ref status) = snap.status_message {
                    println!("  ! {}", status);
                }
                if auto_answer && !answered && snap.state == "incoming" {
                    answered = true;
                    println!("  Auto-answering call...");
                    intents_tx.send(SessionIntent::AcceptCall).await.ok();
                }
                if snap.state == "ended" && start_video.is_some() {
                    break;
                }
            }
            alert = alerts_rx.recv() => {
                match alert {
                    Some(Alert::IncomingCall { display_name, wants_video, .. }) => {
                        println!(
                            "  Incoming {} call from {}",
                            if wants_video { "video" } else { "audio" },
                            if display_name.is_empty() { "visitor" } else { &display_name }
                        );
                    }
                    Some(Alert::NetworkDegraded { .. }) => {
                        println!("  Network looks slow; still trying.");
                    }
                    Some(Alert::CaptureFailed { message, .. }) => {
                        println!("  {}", message);
                    }
                    Some(Alert::MessageNotSaved { error, .. }) => {
                        println!("  Message not saved: {} (retry available)", error);
                    }
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("Leaving session...");
                intents_tx.send(SessionIntent::Shutdown).await.ok();
                break;
            }
        }
    }

    pool.release(session_id).await;
    Ok(())
}

/// Send one message over the signaling channel and wait for its fate.
async fn send_message(session_id: &str, text: &str) -> Result<()> {
    let cfg = Config::load().context("Failed to load config")?;
    let pool = make_pool(&cfg);
    let client = pool.acquire(session_id).await?;
    let mut signals = client.subscribe();

    let client_id = Uuid::new_v4().to_string();
    client.send(SignalEvent::ChatMessage {
        session_id: session_id.to_string(),
        text: text.to_string(),
        display_name: cfg.display_name().to_string(),
        sender_type: SenderRole::Resident,
        client_id: client_id.clone(),
    });

    let outcome = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match signals.recv().await {
                Ok(ChannelEvent::Signal(SignalEvent::ChatPersisted {
                    id,
                    client_id: cid,
                    ..
                })) if cid == client_id => {
                    return Ok(id);
                }
                Ok(ChannelEvent::Signal(SignalEvent::ChatPersistFailed {
                    client_id: cid,
                    error,
                    ..
                })) if cid == client_id => {
                    return Err(anyhow::anyhow!(error));
                }
                Ok(_) => continue,
                Err(e) => return Err(anyhow::anyhow!("signaling stream ended: {}", e)),
            }
        }
    })
    .await;

    match outcome {
        Ok(Ok(id)) => println!("Message persisted (id {}).", id),
        Ok(Err(e)) => println!("Message not persisted: {:#}", e),
        Err(_) => println!("Message sent; no persistence ack within 10s."),
    }

    pool.release(session_id).await;
    Ok(())
}
