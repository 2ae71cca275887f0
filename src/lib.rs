pub mod commands;
pub mod config;
pub mod data;
pub mod enforcement;
pub mod handlers;
pub mod health;
pub mod listener;
pub mod logging;
pub mod platform;

pub const BOT_NAME: &str = "voice_warden";
pub const COMMAND_TARGET: &str = "voice_warden::command";
pub const ERROR_TARGET: &str = "voice_warden::error";
pub const EVENT_TARGET: &str = "voice_warden::handlers";
pub const ENFORCEMENT_TARGET: &str = "voice_warden::enforcement";
pub const CONSOLE_TARGET: &str = "voice_warden";

pub use config::{BotConfig, ConfigError};
pub use data::{Data, DataInner};
pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Context<'a> = poise::Context<'a, Data, Error>;
