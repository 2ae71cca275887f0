//! Enforcement actions
//!
//! The actions the bot can take against a member, and the audit-log reasons
//! attached to them.

use crate::enforcement::ActionResult;
use derive_more::Display;
use poise::serenity_prelude::{ChannelId, GuildId, UserId};
use std::time::Duration;

/// Kind of platform action, used in logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum ActionKind {
    #[display("relocate")]
    Relocate,
    #[display("remove_from_voice")]
    RemoveFromVoice,
    #[display("suspend")]
    Suspend,
}

/// Audit-log reasons
pub mod reason {
    pub const JOINED_DEAFENED: &str = "joining while already deafened";
    pub const DEAFENED: &str = "deafening";
    pub const DISCIPLINE_MOVE: &str = "discipline: deafened";
    pub const DISCIPLINE_RETURN: &str = "discipline: undeafened, returning to original channel";
    pub const DISCIPLINE_FALLBACK: &str = "discipline could not continue";
    pub const SPEECH_QUOTA: &str = "speaking quota exceeded";
}

/// Member actions against the platform
///
/// Every failure comes back classified so callers can pick a fallback.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait VoiceActions: Send + Sync {
    /// Move a connected member into another voice channel
    async fn relocate(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        channel_id: ChannelId,
        reason: &str,
    ) -> ActionResult<()>;

    /// Disconnect a member from voice
    async fn remove_from_voice(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        reason: &str,
    ) -> ActionResult<()>;

    /// Time a member out for `duration`
    async fn suspend(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        duration: Duration,
        reason: &str,
    ) -> ActionResult<()>;

    /// Whether the bot outranks the member and may time them out
    async fn can_suspend(&self, guild_id: GuildId, user_id: UserId) -> bool;
}
