use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ephemera::clock::SystemClock;
use ephemera::config::Config;
use ephemera::driver::{Command, Driver, DriverEvent};
use ephemera::models::room::{Role, RoomId};
use ephemera::services::timer::format_remaining;
use ephemera::session::ChatSession;
use ephemera::store::memory::MemoryStore;
use ephemera::store::redis_store::RedisStore;
use ephemera::store::SharedStore;
use ephemera::validation::message::validate_display_name;

/// Join an ephemeral encrypted chat room from the terminal.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Room identifier shared by both participants.
    #[arg(long)]
    room: String,

    /// Which side of the chat you are on (coach or user).
    #[arg(long, default_value = "user")]
    role: Role,

    /// Display name for user messages.
    #[arg(long, default_value = "")]
    name: String,

    /// Use a process-local store instead of Redis.
    #[arg(long)]
    memory: bool,
}

const EVENT_BUFFER: usize = 64;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    dotenvy::dotenv().ok();

    let args = Args::parse();
    let config = Config::from_env()?;
    tracing::info!("✅ Configuration loaded successfully");

    let room_id = RoomId::new(args.room)?;
    let display_name = match args.role {
        Role::User => validate_display_name(&args.name)?,
        Role::Coach => String::new(),
    };

    let store: Arc<dyn SharedStore> = if args.memory {
        tracing::warn!("⚠️  Using in-memory store; nobody else can join this room");
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(RedisStore::connect(&config.redis_url, config.store_prefix.clone()).await?)
    };

    let session = ChatSession::new(
        &config,
        room_id,
        args.role,
        display_name,
        store,
        Arc::new(SystemClock),
    );

    let (command_tx, command_rx) = mpsc::channel(EVENT_BUFFER);
    let (event_tx, mut event_rx) = mpsc::channel(EVENT_BUFFER);
    let driver = tokio::spawn(Driver::new(session, event_tx).run(command_rx));

    let input = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let command = match line.trim() {
                "/quit" => Command::Quit,
                "/end" => Command::End,
                _ => Command::Send(line),
            };
            let quit = command == Command::Quit;
            if command_tx.send(command).await.is_err() || quit {
                break;
            }
        }
    });

    let mut last_countdown = String::new();
    while let Some(event) = event_rx.recv().await {
        match event {
            DriverEvent::Transcript(messages) => {
                println!("----");
                for message in messages {
                    println!("[{}] {}", message.display_name, message.text);
                }
            }
            DriverEvent::Countdown(remaining) => {
                let countdown = format_remaining(remaining);
                // Only print on minute boundaries and state changes.
                if countdown != last_countdown && (countdown.ends_with(":00") || !countdown.contains(':')) {
                    println!("⏱️  {}", countdown);
                }
                last_countdown = countdown;
            }
            DriverEvent::KeyEstablished(fingerprint) => println!("🔐 session key {}", fingerprint),
            DriverEvent::Sent(_) => {}
            DriverEvent::TimerStartFailed(message) => eprintln!("timer not started: {}", message),
            DriverEvent::SendDeferred => println!("… session key not ready, message not sent"),
            DriverEvent::SessionEnded => println!("Chat session ended."),
            DriverEvent::Error(message) => eprintln!("error: {}", message),
        }
    }

    input.abort();
    driver.await??;
    Ok(())
}
