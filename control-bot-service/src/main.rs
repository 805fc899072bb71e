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

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use craftops_common::{AwsEcs, EnvReader, Orchestrator, service_status};
use lambda_http::run as lambda_run;
use serde::Deserialize;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};

// Discord interaction wire contract, the narrow slice this service consumes.
const INTERACTION_PING: u8 = 1;
const INTERACTION_APPLICATION_COMMAND: u8 = 2;
const RESPONSE_PONG: u8 = 1;
const RESPONSE_CHANNEL_MESSAGE: u8 = 4;

#[derive(Clone)]
struct AppState {
    orchestrator: Arc<dyn Orchestrator>,
    service_name: String,
}

struct Config {
    cluster: String,
    service: String,
}

impl Config {
    fn from_env() -> anyhow::Result<Self> {
        let mut env = EnvReader::from_env();
        let cluster = env.require("ECS_CLUSTER");
        let service = env.require("ECS_SERVICE");
        env.finish()?;
        Ok(Self { cluster, service })
    }
}

#[derive(Debug, Deserialize)]
struct Interaction {
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default)]
    data: Option<CommandInvocation>,
    #[serde(default)]
    member: Option<GuildMember>,
}

#[derive(Debug, Deserialize)]
struct CommandInvocation {
    name: String,
}

#[derive(Debug, Deserialize)]
struct GuildMember {
    #[serde(default)]
    user: Option<DiscordUser>,
}

#[derive(Debug, Deserialize)]
struct DiscordUser {
    username: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "control_bot_service=debug,tower_http=info".to_string()),
        )
        .init();

    let config = Config::from_env()?;
    info!(
        cluster = %config.cluster,
        service = %config.service,
        "starting control bot"
    );

    let state = AppState {
        orchestrator: Arc::new(
            AwsEcs::from_env(config.cluster.clone(), config.service.clone()).await,
        ),
        service_name: config.service,
    };

    let app = build_router(state);

    if std::env::var("AWS_LAMBDA_RUNTIME_API").is_ok() {
        info!("AWS Lambda runtime detected; running control-bot-service in lambda mode");
        lambda_run(app)
            .await
            .map_err(|e| anyhow::Error::msg(format!("lambda runtime error: {e}")))?;
        return Ok(());
    }

    let bind_addr = parse_bind_addr("BOT_SERVICE_BIND", "0.0.0.0:8080")?;
    info!(%bind_addr, "control-bot-service listening");
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/interactions", post(interactions_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

fn parse_bind_addr(var_name: &str, default: &str) -> anyhow::Result<SocketAddr> {
    let value = std::env::var(var_name)
        .ok()
        .unwrap_or_else(|| default.to_string());
    value.parse().context(format!("invalid {var_name}"))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"ok": true, "service": "control-bot-service"}))
}

/// Every interaction gets exactly one response: a pong for pings, a channel
/// message for commands. Command failures are rendered into that one
/// message, never propagated.
async fn interactions_handler(
    State(state): State<AppState>,
    Json(interaction): Json<Interaction>,
) -> Result<Json<serde_json::Value>, ApiError> {
    match interaction.kind {
        INTERACTION_PING => Ok(Json(serde_json::json!({"type": RESPONSE_PONG}))),
        INTERACTION_APPLICATION_COMMAND => {
            let Some(command) = interaction.data else {
                return Err(ApiError::bad_request("application command without data"));
            };
            let user = interaction
                .member
                .and_then(|member| member.user)
                .map(|user| user.username)
                .unwrap_or_else(|| "unknown".to_string());
            info!(command = %command.name, user = %user, "command invoked");

            let content = handle_command(&state, &command.name).await;
            Ok(Json(serde_json::json!({
                "type": RESPONSE_CHANNEL_MESSAGE,
                "data": {"content": content}
            })))
        }
        other => Err(ApiError::bad_request(format!(
            "unsupported interaction type {other}"
        ))),
    }
}

async fn handle_command(state: &AppState, name: &str) -> String {
    match name {
        "server-start" => scale_service(state, 1).await,
        "server-stop" => scale_service(state, 0).await,
        "server-status" => status_message(state).await,
        "help" => help_message(),
        other => {
            warn!(command = %other, "unknown command");
            format!("❌ Unknown command: `{other}`")
        }
    }
}

/// Scale the service only if needed: reads current counts first and skips
/// the mutating call when the desired count already matches.
async fn scale_service(state: &AppState, desired: i32) -> String {
    let counts = match state.orchestrator.counts().await {
        Ok(counts) => counts,
        Err(error) => {
            error!(error = %error, "failed to read service status before scaling");
            return format!("❌ Error updating service: {error:#}");
        }
    };

    if counts.desired == desired {
        info!(desired, "service already at desired count, no action needed");
        return format!(
            "ℹ️ Service `{}` is already at desired count = {desired} (running = {})",
            state.service_name, counts.running
        );
    }

    info!(from = counts.desired, to = desired, "scaling service");
    match state.orchestrator.scale_to(desired).await {
        Ok(()) => format!(
            "✅ Service `{}` updated to desired count = {desired}",
            state.service_name
        ),
        Err(error) => {
            error!(error = %error, "failed to update service");
            format!("❌ Error updating service: {error:#}")
        }
    }
}

async fn status_message(state: &AppState) -> String {
    match service_status(state.orchestrator.as_ref()).await {
        Ok(status) => {
            let mut message = format!(
                "📊 **Service Status**\nService: `{}`\nDesired: {}\nRunning: {}",
                state.service_name, status.desired, status.running
            );
            if !status.public_ips.is_empty() {
                message.push_str(&format!("\nPublic IPs: {}", status.public_ips.join(", ")));
            }
            if !status.public_ips_v6.is_empty() {
                message.push_str(&format!(
                    "\nPublic IPv6: {}",
                    status.public_ips_v6.join(", ")
                ));
            }
            message
        }
        Err(error) => {
            error!(error = %error, "failed to get service status");
            format!("❌ Error getting status: {error:#}")
        }
    }
}

fn help_message() -> String {
    "🎮 **Minecraft Server Bot Commands**\n\n\
     `/server-start` - Start the Minecraft server (scale to 1 task)\n\
     `/server-stop` - Stop the Minecraft server (scale to 0 tasks)\n\
     `/server-status` - Check current server status and IP addresses\n\
     `/help` - Show this help message\n\n\
     The server runs on AWS ECS Fargate and may take a few minutes to start up."
        .to_string()
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        warn!(status = %self.status, message = %self.message, "request failed");
        (
            self.status,
            Json(serde_json::json!({"error": self.message})),
        )
            .into_response()
    }
}
