//! The I/O side of a network connection.
//!
//! [`run`] owns one network: it connects (rotating through the configured
//! servers, honoring cached STS policies), pumps lines between the socket
//! and the [`Session`], paces output through a token bucket, runs jobs on
//! the worker pool, keeps the link alive with PINGs and reconnects with
//! exponential backoff when the link drops.

pub mod labels;
pub mod sasl;
pub mod sts;
pub mod throttle;
pub mod tls;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::ServerAddr;
use crate::message::Message;
use crate::msgs;
use crate::session::{Request, Session};
use crate::worker::JobResult;

use throttle::{Backoff, TokenBucket};
use tls::Stream;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// A connection that lasted this long resets the reconnect backoff.
const STABLE_AFTER: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("TLS error: {0}")]
    Tls(String),
    #[error("no servers configured for {0}")]
    NoServers(String),
}

// ── Shutdown signal ──

/// Bot-wide shutdown flag carrying the quit reason.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<Option<String>>>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Start shutting down. The first reason wins.
    pub fn trigger(&self, reason: &str) {
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason.to_string());
            true
        });
    }

    pub fn reason(&self) -> Option<String> {
        self.tx.borrow().clone()
    }

    pub fn is_triggered(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.tx.subscribe()
    }
}

/// How one connection ended.
#[derive(Debug, Clone, PartialEq)]
enum Exit {
    Shutdown,
    Reconnect { tls: bool, port: u16 },
    Lost(String),
}

/// Tag section plus message body, each at its IRCv3 maximum.
const MAX_LINE_BYTES: usize = 8191 + 512;

/// Ceiling for any delay read from configuration.
const MAX_DELAY: Duration = Duration::from_secs(365 * 24 * 3600);

/// Seconds from configuration as a timer-safe duration.
fn delay(secs: f64) -> Duration {
    match Duration::try_from_secs_f64(secs) {
        Ok(d) => d.min(MAX_DELAY),
        Err(_) if secs > 0.0 => MAX_DELAY,
        Err(_) => Duration::ZERO,
    }
}

// ── Supervisor loop ──

/// Keep `session`'s network connected until shutdown.
pub async fn run(mut session: Session, shutdown: Shutdown) -> Result<()> {
    let settings = session.settings().clone();
    let network = settings.name.clone();
    if settings.servers.is_empty() {
        return Err(DriverError::NoServers(network).into());
    }
    let ctx = session.context().clone();
    let registry = ctx.registry.clone();
    let secs = |key: &str| delay(registry.float(key, Some(&network), None));
    let mut backoff = Backoff::new(
        secs("protocols.irc.reconnect.initialDelay"),
        secs("protocols.irc.reconnect.maximumDelay"),
    );
    let mut shutdown_rx = shutdown.subscribe();
    let mut next_server = 0usize;
    let mut upgrade: Option<(bool, u16)> = None;

    while !shutdown.is_triggered() {
        let configured = &settings.servers[next_server % settings.servers.len()];
        let (mut server, mut tls) = match upgrade.take() {
            Some((tls, port)) => (ServerAddr { host: configured.host.clone(), port }, tls),
            None => (configured.clone(), settings.tls),
        };
        match sts::effective(&ctx.networks, &network, &server, tls, ctx.now()) {
            Ok((addr, secure)) => (server, tls) = (addr, secure),
            Err(e) => tracing::warn!(%network, error = %e, "Could not read STS policy"),
        }

        tracing::info!(%network, %server, tls, "Connecting");
        let started = Instant::now();
        let connecting = tokio::time::timeout(
            CONNECT_TIMEOUT,
            tls::connect(&server, tls, settings.tls_insecure, settings.certfile.as_deref()),
        );
        let exit = tokio::select! {
            connected = connecting => match connected {
                Ok(Ok(stream)) => serve_stream(&mut session, stream, &server, tls, &shutdown).await,
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Err(anyhow::anyhow!("connecting to {server} timed out")),
            },
            _ = wait_for(&mut shutdown_rx) => Ok(Exit::Shutdown),
        };
        let reason = match exit {
            Ok(Exit::Shutdown) => break,
            Ok(Exit::Reconnect { tls, port }) => {
                upgrade = Some((tls, port));
                continue;
            }
            Ok(Exit::Lost(reason)) => reason,
            Err(e) => format!("{e:#}"),
        };
        tracing::warn!(%network, %server, %reason, "Connection ended");

        if started.elapsed() >= STABLE_AFTER {
            backoff.reset();
        }
        next_server += 1;
        let delay = backoff.next_delay();
        tracing::info!(%network, delay_secs = delay.as_secs_f64(), "Reconnecting after delay");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = wait_for(&mut shutdown_rx) => break,
        }
    }
    tracing::info!(%network, "Driver stopped");
    Ok(())
}

async fn wait_for(rx: &mut watch::Receiver<Option<String>>) {
    // The sender lives as long as any Shutdown handle; an error means
    // nobody can trigger it any more.
    if rx.wait_for(Option::is_some).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Run one established connection, always leaving the session disconnected.
async fn serve_stream(session: &mut Session, stream: Stream, server: &ServerAddr, tls: bool, shutdown: &Shutdown) -> Result<Exit> {
    session.on_connected(server, tls);
    let result = match stream {
        Stream::Plain(tcp) => {
            let (reader, writer) = tokio::io::split(tcp);
            serve(session, BufReader::new(reader), writer, shutdown).await
        }
        Stream::Tls(tls) => {
            let (reader, writer) = tokio::io::split(*tls);
            serve(session, BufReader::new(reader), writer, shutdown).await
        }
    };
    let reason = match &result {
        Ok(Exit::Lost(reason)) => reason.clone(),
        Ok(Exit::Shutdown) => "shutdown".to_string(),
        Ok(Exit::Reconnect { .. }) => "reconnect requested".to_string(),
        Err(e) => format!("{e:#}"),
    };
    session.on_disconnect(&reason);
    result
}

// ── Connection loop ──

async fn serve<R, W>(session: &mut Session, mut reader: R, mut writer: W, shutdown: &Shutdown) -> Result<Exit>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let ctx = session.context().clone();
    let registry = ctx.registry.clone();
    let network = session.network().to_string();
    let net = Some(network.as_str());

    let throttle = || {
        let burst = registry.int("protocols.irc.throttleBurst", net, None).clamp(1, u32::MAX as i64) as u32;
        (burst, registry.float("protocols.irc.throttleTime", net, None))
    };
    let (burst, refill) = throttle();
    let mut bucket = TokenBucket::new(burst, refill, ctx.now());

    let ping_enabled = registry.bool("protocols.irc.ping", net, None);
    let ping_interval = delay(registry.int("protocols.irc.ping.interval", net, None).max(1) as f64);
    let mut ping_deadline = Instant::now() + ping_interval;
    let mut awaiting_pong = false;

    let mut shutdown_rx = shutdown.subscribe();
    let mut quit_deadline: Option<Instant> = None;
    let mut jobs: JoinSet<JobResult> = JoinSet::new();
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut line: Vec<u8> = Vec::with_capacity(512);
    let mut discarding = false;

    loop {
        if quit_deadline.is_none()
            && let Some(reason) = shutdown.reason()
        {
            let reason = if reason.is_empty() { registry.string("protocols.irc.quitMessage", net, None) } else { reason };
            session.quit(&reason);
            let grace = registry.float("protocols.irc.shutdownTimeout", None, None);
            quit_deadline = Some(Instant::now() + delay(grace));
        }

        write_pending(session, &mut writer, &mut bucket, &network).await?;
        if quit_deadline.is_some() && !session.has_outbound() {
            return Ok(Exit::Shutdown);
        }

        for job in session.take_jobs() {
            let workers = ctx.workers.clone();
            tracing::debug!(%network, job = job.id, "Starting job");
            jobs.spawn(async move { workers.execute(job).await });
        }
        for request in session.take_requests() {
            match request {
                Request::Reconnect { tls, port, reason } => {
                    tracing::info!(%network, port, tls, %reason, "Reconnecting on request");
                    return Ok(Exit::Reconnect { tls, port });
                }
                Request::Shutdown(reason) => shutdown.trigger(&reason),
            }
        }
        if shutdown.is_triggered() && quit_deadline.is_none() {
            continue;
        }

        let throttled = session.has_outbound();
        let wait = delay(bucket.wait(ctx.now()));
        let mut limited = (&mut reader).take((MAX_LINE_BYTES - line.len()) as u64);

        tokio::select! {
            read = limited.read_until(b'\n', &mut line) => {
                let n = read.context("read from server failed")?;
                if n == 0 {
                    if quit_deadline.is_some() {
                        return Ok(Exit::Shutdown);
                    }
                    return Ok(Exit::Lost("connection closed by server".into()));
                }
                ping_deadline = Instant::now() + ping_interval;
                awaiting_pong = false;
                if line.ends_with(b"\n") {
                    if !discarding {
                        let text = String::from_utf8_lossy(&line);
                        let text = text.trim_end_matches(['\r', '\n']);
                        if !text.is_empty() {
                            tracing::debug!(%network, "<< {text}");
                            session.feed_line(text);
                        }
                    }
                    discarding = false;
                    line.clear();
                } else if line.len() >= MAX_LINE_BYTES {
                    if !discarding {
                        tracing::warn!(%network, limit = MAX_LINE_BYTES, "Dropping overlong line from server");
                    }
                    discarding = true;
                    line.clear();
                }
            }
            Some(joined) = jobs.join_next(), if !jobs.is_empty() => match joined {
                Ok(result) => session.deliver_job(result),
                Err(e) => tracing::error!(%network, error = %e, "Job task failed"),
            },
            _ = tokio::time::sleep(wait), if throttled => {}
            _ = ticker.tick() => {
                let (burst, refill) = throttle();
                bucket.reconfigure(burst, refill);
                session.tick(ctx.now());
            }
            _ = tokio::time::sleep_until(ping_deadline), if ping_enabled && quit_deadline.is_none() => {
                if awaiting_pong {
                    return Ok(Exit::Lost("ping timeout".into()));
                }
                write_message(&mut writer, &network, &msgs::ping(&network)).await?;
                writer.flush().await?;
                awaiting_pong = true;
                ping_deadline = Instant::now() + ping_interval;
            }
            _ = shutdown_rx.changed(), if quit_deadline.is_none() => {}
            _ = sleep_until_opt(quit_deadline) => {
                tracing::warn!(%network, dropped = session.drain_outbound().len(), "Shutdown timeout, closing with output pending");
                return Ok(Exit::Shutdown);
            }
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Priority messages go out at once; the rest as the bucket allows.
async fn write_pending<W>(session: &mut Session, writer: &mut W, bucket: &mut TokenBucket, network: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let now = session.context().now();
    let mut wrote = false;
    while let Some(msg) = session.pop_priority() {
        write_message(writer, network, &msg).await?;
        wrote = true;
    }
    while session.has_outbound() && bucket.try_take(now) {
        let Some(msg) = session.pop_outbound() else { break };
        write_message(writer, network, &msg).await?;
        wrote = true;
    }
    if wrote {
        writer.flush().await.context("flush to server failed")?;
    }
    Ok(())
}

async fn write_message<W>(writer: &mut W, network: &str, msg: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    tracing::debug!(%network, ">> {}", redacted(msg));
    let mut line = msg.to_string();
    line.push_str("\r\n");
    writer.write_all(line.as_bytes()).await.context("write to server failed")?;
    Ok(())
}

/// The line as it may appear in logs: no passwords or SASL payloads.
fn redacted(msg: &Message) -> String {
    match msg.command.as_str() {
        "PASS" => "PASS <hidden>".into(),
        "AUTHENTICATE" if msg.param(0).is_some_and(|p| !matches!(p, "PLAIN" | "EXTERNAL" | "+" | "*")) => {
            "AUTHENTICATE <hidden>".into()
        }
        "REGISTER" => format!("REGISTER {} <hidden>", msg.param(0).unwrap_or_default()),
        _ => msg.to_string(),
    }
}
