//! Async driver for a [`VerificationStateMachine`].
//!
//! One task owns the machine. Tick timers, the retry backoff and external
//! commands are all serialised through a single `select!` loop, so a tick can
//! never run concurrently with a decision. The tick interval only exists
//! while the machine is scanning and is dropped the moment it leaves, so it
//! cannot fire after cancellation.

use crate::session::{SessionSnapshot, TickOutcome, VerificationStateMachine};
use crate::types::Channel;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use uuid::Uuid;

const COMMAND_QUEUE_DEPTH: usize = 8;

#[derive(Error, Debug)]
pub enum ScannerError {
    #[error("scanner task exited")]
    ChannelClosed,
    #[error("failed to spawn scanner thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Messages from handles to the scanner task.
#[derive(Debug)]
pub enum ScanCommand {
    /// Start a fresh session after Matched/Rejected, or after capability
    /// retries ran out.
    Reset,
    SwitchChannel(Channel),
    Decoded(String),
    Snapshot(oneshot::Sender<SessionSnapshot>),
    Shutdown,
}

/// Clone-safe handle to a running scanner.
#[derive(Clone)]
pub struct ScannerHandle {
    tx: mpsc::Sender<ScanCommand>,
}

impl ScannerHandle {
    /// Resume scanning after a Matched/Rejected outcome or exhausted
    /// capability retries.
    pub async fn reset(&self) -> Result<(), ScannerError> {
        self.send(ScanCommand::Reset).await
    }

    pub async fn switch_channel(&self, channel: Channel) -> Result<(), ScannerError> {
        self.send(ScanCommand::SwitchChannel(channel)).await
    }

    /// Deliver an externally decoded credential payload.
    pub async fn submit_decoded(&self, payload: impl Into<String>) -> Result<(), ScannerError> {
        self.send(ScanCommand::Decoded(payload.into())).await
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, ScannerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(ScanCommand::Snapshot(reply_tx)).await?;
        reply_rx.await.map_err(|_| ScannerError::ChannelClosed)
    }

    pub async fn shutdown(&self) -> Result<(), ScannerError> {
        self.send(ScanCommand::Shutdown).await
    }

    async fn send(&self, command: ScanCommand) -> Result<(), ScannerError> {
        self.tx
            .send(command)
            .await
            .map_err(|_| ScannerError::ChannelClosed)
    }
}

/// Create a handle and the command receiver for [`run_scanner`].
pub fn scanner_channel() -> (ScannerHandle, mpsc::Receiver<ScanCommand>) {
    let (tx, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
    (ScannerHandle { tx }, rx)
}

/// Run the machine on a dedicated OS thread with its own runtime, keeping
/// blocking detector calls off the caller's executor.
pub fn spawn_scanner(machine: VerificationStateMachine) -> Result<ScannerHandle, ScannerError> {
    let (handle, commands) = scanner_channel();

    std::thread::Builder::new()
        .name("checkpoint-scanner".into())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
            {
                Ok(runtime) => runtime,
                Err(err) => {
                    tracing::error!(error = %err, "failed to build scanner runtime");
                    return;
                }
            };
            runtime.block_on(run_scanner(machine, commands));
        })?;

    Ok(handle)
}

enum Event {
    Command(Option<ScanCommand>),
    Tick,
    RetryDue,
}

/// Active tick timer, keyed by the session and period it was created for.
struct Ticker {
    session: Uuid,
    period: Duration,
    interval: Interval,
}

/// Drive `machine` until shutdown or until every handle is dropped.
pub async fn run_scanner(
    mut machine: VerificationStateMachine,
    mut commands: mpsc::Receiver<ScanCommand>,
) {
    tracing::info!(channel = %machine.session().channel(), "scanner started");
    if let Err(err) = machine.start(now()) {
        tracing::warn!(error = %err, "scanner start rejected");
    }

    let mut ticker: Option<Ticker> = None;

    loop {
        sync_ticker(&machine, &mut ticker);
        let retry_at = machine.retry_deadline().map(Instant::from_std);

        let event = tokio::select! {
            command = commands.recv() => Event::Command(command),
            () = next_tick(&mut ticker) => Event::Tick,
            () = sleep_until(retry_at) => Event::RetryDue,
        };

        match event {
            Event::Command(None) | Event::Command(Some(ScanCommand::Shutdown)) => break,
            Event::Command(Some(command)) => handle_command(&mut machine, command),
            Event::Tick => {
                if machine.tick(now()) == TickOutcome::CandidateLocked {
                    ticker = None;
                    if let Err(err) = machine.decide(now()) {
                        tracing::warn!(error = %err, "decision skipped");
                    }
                }
            }
            Event::RetryDue => {
                if let Err(err) = machine.retry_capability(now()) {
                    tracing::debug!(error = %err, "stale retry deadline");
                }
            }
        }
    }

    machine.shutdown();
    tracing::info!("scanner stopped");
}

fn handle_command(machine: &mut VerificationStateMachine, command: ScanCommand) {
    match command {
        ScanCommand::Reset => {
            if let Err(err) = machine.reset(now()) {
                tracing::warn!(error = %err, "reset ignored");
            }
        }
        ScanCommand::SwitchChannel(channel) => {
            machine.switch_channel(channel, now());
        }
        ScanCommand::Decoded(payload) => {
            if let Err(err) = machine.on_decoded(&payload, now()) {
                tracing::debug!(error = %err, "decode event ignored");
            }
        }
        ScanCommand::Snapshot(reply) => {
            let _ = reply.send(machine.snapshot());
        }
        ScanCommand::Shutdown => {}
    }
}

fn sync_ticker(machine: &VerificationStateMachine, ticker: &mut Option<Ticker>) {
    let Some(period) = machine.tick_period() else {
        *ticker = None;
        return;
    };
    let session = machine.session().id();
    if ticker
        .as_ref()
        .is_some_and(|t| t.session == session && t.period == period)
    {
        return;
    }
    // First tick one period from now, like a plain repeating timer.
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    *ticker = Some(Ticker {
        session,
        period,
        interval,
    });
}

async fn next_tick(ticker: &mut Option<Ticker>) {
    match ticker {
        Some(t) => {
            t.interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn now() -> std::time::Instant {
    Instant::now().into_std()
}
