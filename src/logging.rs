use crate::{COMMAND_TARGET, CONSOLE_TARGET, Data, ENFORCEMENT_TARGET, ERROR_TARGET, Error};
use poise::{Context, FrameworkError};
use dashmap::DashMap;
use std::path::Path;
use std::sync::LazyLock;
use std::time::{Duration, Instant};
use tracing::{error, info};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter, Layer,
    filter::Targets,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Log directory name
pub const LOG_DIR: &str = "logs";
/// Command log file name
pub const COMMAND_LOG_FILE: &str = "commands";
/// Enforcement decisions and failures
pub const ENFORCEMENT_LOG_FILE: &str = "enforcement";
/// Default directives when `RUST_LOG` is unset
pub const DEFAULT_DIRECTIVES: &str = "info,serenity=error,songbird=warn";

/// Initialize the logging system with console and file outputs
pub fn init() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Create log directory if it doesn't exist
    if !Path::new(LOG_DIR).exists() {
        std::fs::create_dir_all(LOG_DIR)?;
    }

    // Set up file appenders with daily rotation
    let command_file = RollingFileAppender::new(Rotation::DAILY, LOG_DIR, COMMAND_LOG_FILE);
    let enforcement_file =
        RollingFileAppender::new(Rotation::DAILY, LOG_DIR, ENFORCEMENT_LOG_FILE);

    // Create a layer for console output (human-readable format)
    let console_layer = fmt::layer()
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .with_ansi(true);

    // Create a layer for command logs (JSON format)
    let command_layer = fmt::layer()
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .with_ansi(false)
        .json()
        .with_writer(command_file);

    // Only the enforcement target goes to its own file
    let enforcement_layer = fmt::layer()
        .with_target(true)
        .with_ansi(false)
        .json()
        .with_writer(enforcement_file)
        .with_filter(Targets::new().with_target(ENFORCEMENT_TARGET, tracing::Level::DEBUG));

    // RUST_LOG overrides the defaults; serenity heartbeat logs are noisy
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(command_layer)
        .with(enforcement_layer)
        .try_init()?;

    info!("Logging system initialized");
    Ok(())
}

/// Start times keyed by invocation id; hooks may run on different worker threads
static COMMAND_STARTS: LazyLock<DashMap<u64, Instant>> = LazyLock::new(DashMap::new);

fn record_start(invocation: u64) {
    COMMAND_STARTS.insert(invocation, Instant::now());
}

/// Time since the invocation started, forgetting the start
fn take_elapsed(invocation: u64) -> Option<Duration> {
    COMMAND_STARTS
        .remove(&invocation)
        .map(|(_, start)| start.elapsed())
}

/// Log the start of a command execution (pre-command hook)
pub fn log_command_start(ctx: Context<'_, Data, Error>) {
    record_start(ctx.id());

    let command_name = ctx.command().qualified_name.clone();
    let guild_id = ctx
        .guild_id()
        .map_or_else(|| "DM".to_string(), |id| id.get().to_string());
    let user_id = ctx.author().id.get().to_string();

    let args = if ctx.command().parameters.is_empty() {
        String::new()
    } else {
        ctx.invocation_string()
    };

    info!(
        target: COMMAND_TARGET,
        command = %command_name,
        guild_id = %guild_id,
        user_id = %user_id,
        arguments = %args,
        event = "start",
        "Command execution started"
    );
}

/// Log the end of a command execution (post-command hook)
pub fn log_command_end(ctx: Context<'_, Data, Error>) {
    let duration = take_elapsed(ctx.id());

    let command_name = ctx.command().qualified_name.clone();
    let guild_id = ctx
        .guild_id()
        .map_or_else(|| "DM".to_string(), |id| id.get().to_string());
    let user_id = ctx.author().id.get().to_string();

    let duration_ms = u64::try_from(duration.map_or(0, |d| d.as_millis())).unwrap_or_default();
    info!(
        target: COMMAND_TARGET,
        command = %command_name,
        guild_id = %guild_id,
        user_id = %user_id,
        duration_ms = duration_ms,
        event = "end",
        "Command execution completed"
    );
}

/// Log errors that occur during command execution
///
/// `post_command` does not run for failed commands, so the start time is
/// dropped here.
pub fn log_command_error(error: &FrameworkError<'_, Data, Error>) {
    if let Some(ctx) = error.ctx() {
        take_elapsed(ctx.id());
    }
    match error {
        FrameworkError::Command { error, ctx, .. } => {
            let command_name = ctx.command().qualified_name.clone();
            let guild_id = ctx
                .guild_id()
                .as_ref()
                .map_or_else(|| "DM".to_string(), ToString::to_string);
            let user_id = ctx.author().id.get().to_string();

            error!(
                target: ERROR_TARGET,
                command = %command_name,
                guild_id = %guild_id,
                user_id = %user_id,
                error = %error,
                "Command error"
            );
        }
        FrameworkError::CommandCheckFailed { error, ctx, .. } => {
            let command_name = ctx.command().qualified_name.clone();
            let guild_id = ctx
                .guild_id()
                .as_ref()
                .map_or_else(|| "DM".to_string(), ToString::to_string);
            let user_id = ctx.author().id.get().to_string();

            let error_msg = error
                .as_ref()
                .map_or_else(|| "Check failed".to_string(), ToString::to_string);

            error!(
                target: ERROR_TARGET,
                command = %command_name,
                guild_id = %guild_id,
                user_id = %user_id,
                error = %error_msg,
                "Command check failed"
            );
        }
        FrameworkError::Setup { error, .. } => {
            error!(target: ERROR_TARGET, error = %error, "Framework setup failed");
        }
        err => {
            error!(
                target: ERROR_TARGET,
                error = %err,
                "Other framework error"
            );
        }
    }
}

pub fn log_console(message: String) {
    info!(
        target: CONSOLE_TARGET,
        message = %message,
        event = "console",
    );
}
