// Copyright (C) 2026 Craftops
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::time::Duration;

use anyhow::{Context, bail};
use chrono::{DateTime, Utc};
use craftops_common::{AwsEcs, EnvReader, Orchestrator, parse_player_count};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

const DEFAULT_RCON_PORT: u16 = 25575;

// Source RCON packet types.
const RCON_AUTH: i32 = 3;
const RCON_EXEC_COMMAND: i32 = 2;
const RCON_AUTH_RESPONSE: i32 = 2;
const RCON_RESPONSE_VALUE: i32 = 0;

// id + type headers plus the two trailing NULs.
const RCON_FRAME_OVERHEAD: usize = 10;
const RCON_MAX_FRAME: usize = 4096 + RCON_FRAME_OVERHEAD;

#[derive(Clone)]
struct Config {
    cluster: String,
    service: String,
    rcon_host: String,
    rcon_port: u16,
    rcon_password: String,
    rcon_timeout: Duration,
    webhook_url: Option<String>,
    dns_name: Option<String>,
    check_interval: Duration,
    idle_threshold: chrono::Duration,
}

impl Config {
    fn from_env() -> anyhow::Result<Self> {
        let mut env = EnvReader::from_env();
        let cluster = env.require("ECS_CLUSTER");
        let service = env.require("ECS_SERVICE");
        let rcon_host = env.require("RCON_HOST");
        let rcon_port = env.parsed_or("RCON_PORT", DEFAULT_RCON_PORT);
        let rcon_password = env.optional_or("RCON_PASSWORD", "");
        let rcon_timeout = Duration::from_secs(env.parsed_or("RCON_TIMEOUT", 5_u64));
        let webhook_url = env.optional("DISCORD_WEBHOOK");
        let dns_name = env.optional("DNS_NAME");
        let check_interval = Duration::from_secs(env.parsed_or("CHECK_INTERVAL", 60_u64));
        let idle_threshold = chrono::Duration::seconds(env.parsed_or("IDLE_THRESHOLD", 600_i64));
        env.finish()?;
        Ok(Self {
            cluster,
            service,
            rcon_host,
            rcon_port,
            rcon_password,
            rcon_timeout,
            webhook_url,
            dns_name,
            check_interval,
            idle_threshold,
        })
    }
}

/// Encode one RCON frame: little-endian length prefix over
/// `{id, type, body, NUL, NUL}`.
fn encode_rcon_frame(id: i32, kind: i32, body: &str) -> Vec<u8> {
    let length = (body.len() + RCON_FRAME_OVERHEAD) as i32;
    let mut frame = Vec::with_capacity(body.len() + RCON_FRAME_OVERHEAD + 4);
    frame.extend_from_slice(&length.to_le_bytes());
    frame.extend_from_slice(&id.to_le_bytes());
    frame.extend_from_slice(&kind.to_le_bytes());
    frame.extend_from_slice(body.as_bytes());
    frame.extend_from_slice(&[0, 0]);
    frame
}

/// Decode a frame payload (everything after the length prefix).
fn decode_rcon_frame(payload: &[u8]) -> anyhow::Result<(i32, i32, String)> {
    if payload.len() < RCON_FRAME_OVERHEAD {
        bail!("rcon frame too short: {} bytes", payload.len());
    }
    let id = i32::from_le_bytes(payload[0..4].try_into()?);
    let kind = i32::from_le_bytes(payload[4..8].try_into()?);
    let body = String::from_utf8_lossy(&payload[8..payload.len() - 2]).into_owned();
    Ok((id, kind, body))
}

/// Minimal Source-RCON client. The watchdog opens a fresh connection per
/// probe; there is no persistent session and no pipelining.
struct RconClient {
    stream: TcpStream,
    io_timeout: Duration,
    next_id: i32,
}

impl RconClient {
    async fn connect(
        host: &str,
        port: u16,
        password: &str,
        io_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let stream = timeout(io_timeout, TcpStream::connect((host, port)))
            .await
            .context("rcon connect timed out")?
            .context("rcon connect failed")?;
        let mut client = Self {
            stream,
            io_timeout,
            next_id: 0,
        };
        client.authenticate(password).await?;
        Ok(client)
    }

    async fn authenticate(&mut self, password: &str) -> anyhow::Result<()> {
        let id = self.send_frame(RCON_AUTH, password).await?;
        // Some servers prefix the auth response with an empty
        // response-value frame; skip past it.
        loop {
            let (response_id, kind, _body) = self.read_frame().await?;
            if kind != RCON_AUTH_RESPONSE {
                continue;
            }
            if response_id == -1 {
                bail!("rcon authentication rejected");
            }
            if response_id != id {
                bail!("rcon auth response for unexpected request id {response_id}");
            }
            return Ok(());
        }
    }

    async fn command(&mut self, command: &str) -> anyhow::Result<String> {
        let id = self.send_frame(RCON_EXEC_COMMAND, command).await?;
        let (response_id, kind, body) = self.read_frame().await?;
        if kind != RCON_RESPONSE_VALUE || response_id != id {
            bail!("unexpected rcon response (id {response_id}, type {kind})");
        }
        Ok(body)
    }

    async fn send_frame(&mut self, kind: i32, body: &str) -> anyhow::Result<i32> {
        self.next_id += 1;
        let id = self.next_id;
        let frame = encode_rcon_frame(id, kind, body);
        timeout(self.io_timeout, self.stream.write_all(&frame))
            .await
            .context("rcon write timed out")?
            .context("rcon write failed")?;
        Ok(id)
    }

    async fn read_frame(&mut self) -> anyhow::Result<(i32, i32, String)> {
        let mut length_bytes = [0_u8; 4];
        timeout(self.io_timeout, self.stream.read_exact(&mut length_bytes))
            .await
            .context("rcon read timed out")?
            .context("rcon read failed")?;
        let length = i32::from_le_bytes(length_bytes);
        if !(RCON_FRAME_OVERHEAD as i32..=RCON_MAX_FRAME as i32).contains(&length) {
            bail!("malformed rcon frame length {length}");
        }

        let mut payload = vec![0_u8; length as usize];
        timeout(self.io_timeout, self.stream.read_exact(&mut payload))
            .await
            .context("rcon read timed out")?
            .context("rcon read failed")?;
        decode_rcon_frame(&payload)
    }
}

/// What one poll tick observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProbeResult {
    /// The orchestrator reports zero running tasks; nothing to probe.
    ServiceStopped,
    /// The status read or the RCON probe failed.
    Unreachable,
    /// Successful probe with the observed player count.
    Players(u32),
}

/// Watch-loop state. Owned by the loop, passed and returned by value on
/// every tick, forgotten on restart.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct WatchState {
    reachable: bool,
    idle_since: Option<DateTime<Utc>>,
}

/// The outcome of one tick: the next state plus the decisions the loop has
/// to act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Tick {
    state: WatchState,
    announce_online: bool,
    shut_down: bool,
}

/// Advance the watch state by one tick. Pure, so probe sequences can be
/// replayed in tests against a synthetic clock.
///
/// The online announcement is edge-triggered: it fires on the first
/// successful probe after the server was unreachable and never while the
/// server is already marked reachable.
fn advance(
    state: WatchState,
    probe: ProbeResult,
    now: DateTime<Utc>,
    idle_threshold: chrono::Duration,
) -> Tick {
    match probe {
        ProbeResult::ServiceStopped | ProbeResult::Unreachable => Tick {
            state: WatchState::default(),
            announce_online: false,
            shut_down: false,
        },
        ProbeResult::Players(count) => {
            let announce_online = !state.reachable;
            if count > 0 {
                return Tick {
                    state: WatchState {
                        reachable: true,
                        idle_since: None,
                    },
                    announce_online,
                    shut_down: false,
                };
            }

            let idle_since = state.idle_since.unwrap_or(now);
            Tick {
                state: WatchState {
                    reachable: true,
                    idle_since: Some(idle_since),
                },
                announce_online,
                shut_down: now - idle_since >= idle_threshold,
            }
        }
    }
}

/// Map a raw `list` response to a probe result. An unparseable response is
/// a failed probe, not an empty server: a server we cannot read must never
/// accumulate idle time.
fn probe_from_response(response: &str) -> ProbeResult {
    match parse_player_count(response) {
        Some(count) => ProbeResult::Players(count),
        None => {
            warn!(response = %response, "unparseable list response, treating probe as failed");
            ProbeResult::Unreachable
        }
    }
}

async fn observe(orchestrator: &dyn Orchestrator, config: &Config) -> ProbeResult {
    match orchestrator.counts().await {
        Ok(counts) if counts.running == 0 => {
            debug!("service has no running tasks, skipping probe");
            return ProbeResult::ServiceStopped;
        }
        Ok(_) => {}
        Err(error) => {
            error!(error = %error, "failed to read service status");
            return ProbeResult::Unreachable;
        }
    }

    match probe_player_count(config).await {
        Ok(response) => probe_from_response(&response),
        Err(error) => {
            warn!(error = %error, "player count probe failed");
            ProbeResult::Unreachable
        }
    }
}

/// One connect-authenticate-command-disconnect cycle against the server.
async fn probe_player_count(config: &Config) -> anyhow::Result<String> {
    let mut rcon = RconClient::connect(
        &config.rcon_host,
        config.rcon_port,
        &config.rcon_password,
        config.rcon_timeout,
    )
    .await?;
    rcon.command("list").await
}

/// Best-effort Discord webhook. Failures are logged and swallowed; an
/// unconfigured webhook disables sends entirely.
#[derive(Clone)]
struct Webhook {
    client: reqwest::Client,
    url: Option<String>,
}

impl Webhook {
    fn new(url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }

    async fn send(&self, content: &str) {
        let Some(url) = &self.url else {
            return;
        };
        let payload = serde_json::json!({"content": content});
        match self
            .client
            .post(url)
            .json(&payload)
            .timeout(Duration::from_secs(10))
            .send()
            .await
        {
            Ok(response) if !response.status().is_success() => {
                warn!(status = %response.status(), "notification webhook rejected message");
            }
            Ok(_) => debug!("notification sent"),
            Err(error) => warn!(error = %error, "failed to send notification"),
        }
    }
}

/// Notify, then scale to zero. Returns whether the scale call succeeded; a
/// failure leaves the caller's idle timer intact so the next tick retries
/// instead of treating the server as shut down.
async fn attempt_shutdown(orchestrator: &dyn Orchestrator, webhook: &Webhook) -> bool {
    webhook
        .send("Minecraft server is shutting down due to inactivity. 💤")
        .await;
    match orchestrator.scale_to(0).await {
        Ok(()) => {
            info!("server shutdown initiated");
            true
        }
        Err(error) => {
            error!(error = %error, "failed to scale service to zero, will retry next tick");
            false
        }
    }
}

async fn run_watch_loop(
    config: &Config,
    orchestrator: &dyn Orchestrator,
    webhook: &Webhook,
) -> anyhow::Result<()> {
    let mut state = WatchState::default();

    loop {
        let probe = observe(orchestrator, config).await;
        if let ProbeResult::Players(count) = probe
            && count > 0
        {
            info!(players = count, "players online, idle timer reset");
        }

        let tick = advance(state, probe, Utc::now(), config.idle_threshold);

        if tick.announce_online {
            let address = config
                .dns_name
                .clone()
                .unwrap_or_else(|| config.rcon_host.clone());
            info!(address = %address, "server became reachable");
            webhook
                .send(&format!(
                    "🟢 Minecraft server is online and reachable at `{address}`"
                ))
                .await;
        }

        if let Some(idle_since) = tick.state.idle_since {
            info!(
                idle_seconds = (Utc::now() - idle_since).num_seconds(),
                "server is idle"
            );
        }

        state = tick.state;

        if tick.shut_down {
            info!("idle threshold reached, shutting down server");
            if attempt_shutdown(orchestrator, webhook).await {
                return Ok(());
            }
        }

        tokio::time::sleep(config.check_interval).await;
    }
}

/// Out-of-band termination path: warn in-game, notify the webhook, pause
/// briefly for delivery, then let the process exit. One-shot and not
/// cancellable; it does not coordinate with an in-flight tick.
async fn handle_termination(config: &Config, webhook: &Webhook) {
    warn!("termination signal received, broadcasting shutdown warning");

    if let Err(error) = broadcast_shutdown_warning(config).await {
        warn!(error = %error, "failed to broadcast in-game shutdown warning");
    }
    webhook.send("⚠️ Minecraft server is going offline shortly.").await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    info!("idle watcher stopped");
}

async fn broadcast_shutdown_warning(config: &Config) -> anyhow::Result<()> {
    let mut rcon = RconClient::connect(
        &config.rcon_host,
        config.rcon_port,
        &config.rcon_password,
        config.rcon_timeout,
    )
    .await?;
    rcon.command("say Server is shutting down in 5 seconds!")
        .await?;
    Ok(())
}

#[cfg(unix)]
async fn termination_signal() -> std::io::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn termination_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "idle_watcher_service=debug".to_string()),
        )
        .init();

    let config = Config::from_env()?;
    info!(
        rcon_host = %config.rcon_host,
        rcon_port = config.rcon_port,
        check_interval_seconds = config.check_interval.as_secs(),
        idle_threshold_seconds = config.idle_threshold.num_seconds(),
        "starting idle watcher"
    );

    let orchestrator = AwsEcs::from_env(config.cluster.clone(), config.service.clone()).await;
    let webhook = Webhook::new(config.webhook_url.clone());

    tokio::select! {
        result = run_watch_loop(&config, &orchestrator, &webhook) => result,
        signal = termination_signal() => {
            signal.context("failed to listen for termination signals")?;
            handle_termination(&config, &webhook).await;
            Ok(())
        }
    }
}
