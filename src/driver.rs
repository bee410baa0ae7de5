//! Event loop for one session view.
//!
//! Multiplexes the two store subscriptions, a 1 Hz local tick and user
//! commands onto a single task that owns the [`ChatSession`]. Subscriptions
//! are taken on entry and released when the loop exits, however it exits.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use crate::error::{AppError, Result};
use crate::models::message::RenderedMessage;
use crate::services::messages::SendOutcome;
use crate::session::ChatSession;

/// Interval of the local timer re-evaluation.
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Requests from the participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Send a message.
    Send(String),
    /// End the chat for both sides.
    End,
    /// Leave the room.
    Quit,
}

/// Notifications for whatever renders the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverEvent {
    /// The full transcript after a change.
    Transcript(Vec<RenderedMessage>),
    /// Remaining time after a tick; `None` before the timer starts.
    Countdown(Option<i64>),
    /// A session key was adopted or created; carries its fingerprint.
    KeyEstablished(String),
    /// A message was sent under the given id.
    Sent(String),
    /// A message was sent but the timer could not be started.
    TimerStartFailed(String),
    /// A send was dropped because no session key is available yet.
    SendDeferred,
    /// The session is over. Emitted once per view.
    SessionEnded,
    /// A non-fatal failure to show the participant.
    Error(String),
}

/// Drives a [`ChatSession`] until the participant quits or the command
/// channel closes.
pub struct Driver {
    session: ChatSession,
    events: mpsc::Sender<DriverEvent>,
}

impl Driver {
    /// Creates a driver that reports to `events`.
    pub fn new(session: ChatSession, events: mpsc::Sender<DriverEvent>) -> Self {
        Self { session, events }
    }

    /// Runs the event loop.
    ///
    /// Only a failure to subscribe is returned as an error; everything after
    /// that is reported as a [`DriverEvent::Error`] and the loop continues.
    pub async fn run(mut self, mut commands: mpsc::Receiver<Command>) -> Result<ChatSession> {
        let store = self.session.store();
        let mut room_feed = store.subscribe(&self.session.room_path()).await?;
        let mut message_feed = store.subscribe(&self.session.messages_path()).await?;

        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!("🚀 Joined room {}", self.session.room_id());

        loop {
            tokio::select! {
                snapshot = room_feed.next() => {
                    let Some(snapshot) = snapshot else {
                        tracing::warn!("⚠️  Room feed closed for {}", self.session.room_id());
                        break;
                    };
                    if self.session.apply_room_snapshot(&snapshot) {
                        self.announce_key().await;
                        self.emit(DriverEvent::Transcript(self.session.transcript())).await;
                    }
                    self.check_ended().await;
                }
                snapshot = message_feed.next() => {
                    let Some(snapshot) = snapshot else {
                        tracing::warn!("⚠️  Message feed closed for {}", self.session.room_id());
                        break;
                    };
                    self.session.apply_messages_snapshot(&snapshot);
                    self.emit(DriverEvent::Transcript(self.session.transcript())).await;
                }
                _ = ticker.tick() => {
                    self.emit(DriverEvent::Countdown(self.session.remaining_ms())).await;
                    self.check_ended().await;
                }
                command = commands.recv() => {
                    match command {
                        None | Some(Command::Quit) => break,
                        Some(Command::Send(text)) => self.handle_send(&text).await,
                        Some(Command::End) => self.handle_end().await,
                    }
                }
            }
        }

        tracing::info!("👋 Leaving room {}", self.session.room_id());
        drop(room_feed);
        drop(message_feed);
        Ok(self.session)
    }

    async fn handle_send(&mut self, text: &str) {
        let had_key = self.session.session_key().is_some();
        match self.session.send_message(text).await {
            Ok(SendOutcome::Sent { id, timer_error, .. }) => {
                if !had_key {
                    self.announce_key().await;
                }
                self.emit(DriverEvent::Sent(id)).await;
                if let Some(error) = timer_error {
                    self.emit(DriverEvent::TimerStartFailed(error)).await;
                }
            }
            Ok(SendOutcome::Deferred) => self.emit(DriverEvent::SendDeferred).await,
            Err(e) => self.report(e).await,
        }
    }

    async fn handle_end(&mut self) {
        match self.session.end_chat().await {
            Ok(()) => self.check_ended().await,
            Err(e) => self.report(e).await,
        }
    }

    async fn check_ended(&mut self) {
        if self.session.poll_end_alert() {
            self.emit(DriverEvent::SessionEnded).await;
        }
    }

    async fn announce_key(&self) {
        if let Some(key) = self.session.session_key() {
            self.emit(DriverEvent::KeyEstablished(key.fingerprint())).await;
        }
    }

    async fn report(&self, error: AppError) {
        match &error {
            AppError::RemoteUnavailable(_) => tracing::error!("❌ {}", error),
            _ => tracing::warn!("⚠️  {}", error),
        }
        self.emit(DriverEvent::Error(error.to_string())).await;
    }

    async fn emit(&self, event: DriverEvent) {
        if self.events.send(event).await.is_err() {
            tracing::debug!("Event receiver dropped");
        }
    }
}
