//! Serenity-backed topology and action provider
//!
//! Reads guild layout and voice states from the gateway cache and performs
//! member edits over HTTP. Errors are classified into [`ActionError`] here and
//! nowhere else.

use crate::ENFORCEMENT_TARGET;
use crate::enforcement::{
    ActionError, ActionKind, ActionResult, ChannelSnapshot, PermissionGrant, VoiceActions,
    VoicePresence, VoiceTopology,
};
use poise::serenity_prelude::{
    self as serenity, Cache, ChannelId, ChannelType, EditMember, Guild, GuildChannel, GuildId,
    Http, Member, Permissions, RoleId, Timestamp, UserId,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Longest timeout Discord accepts
pub const MAX_TIMEOUT: Duration = Duration::from_secs(28 * 24 * 60 * 60);

/// Topology and actions for the live gateway connection
#[derive(Clone)]
pub struct SerenityVoice {
    cache: Arc<Cache>,
    http: Arc<Http>,
}

impl SerenityVoice {
    #[must_use]
    pub fn new(cache: Arc<Cache>, http: Arc<Http>) -> Self {
        Self { cache, http }
    }

    fn bot_id(&self) -> UserId {
        self.cache.current_user().id
    }

    /// Run `f` against the cached guild; the cache guard never crosses an await
    fn with_guild<R>(&self, guild_id: GuildId, f: impl FnOnce(&Guild) -> R) -> Option<R> {
        self.cache.guild(guild_id).map(|guild| f(&*guild))
    }

    async fn edit(
        &self,
        kind: ActionKind,
        guild_id: GuildId,
        user_id: UserId,
        builder: EditMember<'_>,
    ) -> ActionResult<()> {
        match guild_id.edit_member(self.http.as_ref(), user_id, builder).await {
            Ok(_) => {
                debug!(
                    target: ENFORCEMENT_TARGET,
                    action = %kind,
                    user_id = %user_id,
                    guild_id = %guild_id,
                    "Platform action succeeded"
                );
                Ok(())
            }
            Err(e) => {
                let error = ActionError::from(e);
                warn!(
                    target: ENFORCEMENT_TARGET,
                    action = %kind,
                    user_id = %user_id,
                    guild_id = %guild_id,
                    class = error.class(),
                    error = %error,
                    "Platform action failed"
                );
                Err(error)
            }
        }
    }

    /// Fetch the target member, preferring the cache
    async fn member(&self, guild_id: GuildId, user_id: UserId) -> Option<Member> {
        let cached = self.with_guild(guild_id, |guild| guild.members.get(&user_id).cloned());
        if let Some(member) = cached.flatten() {
            return Some(member);
        }
        match guild_id.member(self.http.as_ref(), user_id).await {
            Ok(member) => Some(member),
            Err(e) => {
                debug!(
                    target: ENFORCEMENT_TARGET,
                    user_id = %user_id,
                    guild_id = %guild_id,
                    error = %e,
                    "Could not fetch member"
                );
                None
            }
        }
    }
}

fn is_voice_kind(kind: ChannelType) -> bool {
    matches!(kind, ChannelType::Voice | ChannelType::Stage)
}

fn grant_from(permissions: Permissions) -> PermissionGrant {
    PermissionGrant {
        connect: permissions.contains(Permissions::CONNECT),
        move_members: permissions.contains(Permissions::MOVE_MEMBERS),
        view: permissions.contains(Permissions::VIEW_CHANNEL),
    }
}

fn snapshot(guild: &Guild, channel: &GuildChannel, bot: Option<&Member>) -> ChannelSnapshot {
    let occupants = guild
        .voice_states
        .values()
        .filter(|state| state.channel_id == Some(channel.id))
        .map(|state| state.user_id)
        .collect();
    let grant = bot.map_or_else(PermissionGrant::default, |bot| {
        grant_from(guild.user_permissions_in(channel, bot))
    });
    ChannelSnapshot {
        id: channel.id,
        name: channel.name.clone(),
        is_voice: is_voice_kind(channel.kind),
        occupants,
        grant,
    }
}

/// Guild-wide permissions from the @everyone role and the member's roles
fn guild_permissions(
    everyone: Permissions,
    roles: impl IntoIterator<Item = Permissions>,
    is_owner: bool,
) -> Permissions {
    if is_owner {
        return Permissions::all();
    }
    let permissions = roles.into_iter().fold(everyone, |acc, role| acc | role);
    if permissions.contains(Permissions::ADMINISTRATOR) {
        Permissions::all()
    } else {
        permissions
    }
}

/// What decides whether the bot may time a member out
#[derive(Debug, Clone, Copy)]
struct Authority {
    bot_permissions: Permissions,
    bot_position: u16,
    target_permissions: Permissions,
    target_position: u16,
    target_is_owner: bool,
}

impl Authority {
    fn from_guild(guild: &Guild, bot: &Member, target: &Member) -> Self {
        let everyone = guild
            .roles
            .get(&RoleId::new(guild.id.get()))
            .map_or_else(Permissions::empty, |role| role.permissions);
        let permissions_of = |member: &Member| {
            guild_permissions(
                everyone,
                member
                    .roles
                    .iter()
                    .filter_map(|id| guild.roles.get(id))
                    .map(|role| role.permissions),
                guild.owner_id == member.user.id,
            )
        };
        let position_of = |member: &Member| {
            member
                .roles
                .iter()
                .filter_map(|id| guild.roles.get(id))
                .map(|role| role.position)
                .max()
                .unwrap_or(0)
        };
        Self {
            bot_permissions: permissions_of(bot),
            bot_position: position_of(bot),
            target_permissions: permissions_of(target),
            target_position: position_of(target),
            target_is_owner: guild.owner_id == target.user.id,
        }
    }

    fn can_suspend(&self) -> bool {
        self.bot_permissions.contains(Permissions::MODERATE_MEMBERS)
            && !self.target_is_owner
            && !self.target_permissions.contains(Permissions::ADMINISTRATOR)
            && self.bot_position > self.target_position
    }
}

/// Audit-log text for an action
fn audit_reason(kind: ActionKind, reason: &str) -> String {
    match kind {
        ActionKind::RemoveFromVoice => format!("Auto-kicked for {reason}"),
        ActionKind::Relocate | ActionKind::Suspend => reason.to_string(),
    }
}

#[serenity::async_trait]
impl VoiceTopology for SerenityVoice {
    async fn list_channels(&self, guild_id: GuildId) -> Vec<ChannelSnapshot> {
        let bot_id = self.bot_id();
        self.with_guild(guild_id, |guild| {
            let bot = guild.members.get(&bot_id);
            let mut channels: Vec<&GuildChannel> = guild.channels.values().collect();
            channels.sort_by_key(|channel| (channel.position, channel.id));
            channels
                .into_iter()
                .map(|channel| snapshot(guild, channel, bot))
                .collect()
        })
        .unwrap_or_default()
    }

    async fn channel(&self, guild_id: GuildId, channel_id: ChannelId) -> Option<ChannelSnapshot> {
        let bot_id = self.bot_id();
        self.with_guild(guild_id, |guild| {
            guild
                .channels
                .get(&channel_id)
                .map(|channel| snapshot(guild, channel, guild.members.get(&bot_id)))
        })
        .flatten()
    }

    async fn voice_presence(&self, guild_id: GuildId, user_id: UserId) -> Option<VoicePresence> {
        self.with_guild(guild_id, |guild| {
            let state = guild.voice_states.get(&user_id)?;
            Some(VoicePresence {
                channel_id: state.channel_id?,
                self_deaf: state.self_deaf,
            })
        })
        .flatten()
    }

    async fn presences_of(&self, user_id: UserId) -> Vec<(GuildId, VoicePresence)> {
        let mut presences = Vec::new();
        for guild_id in self.cache.guilds() {
            if let Some(presence) = self.voice_presence(guild_id, user_id).await {
                presences.push((guild_id, presence));
            }
        }
        presences
    }
}

#[serenity::async_trait]
impl VoiceActions for SerenityVoice {
    async fn relocate(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        channel_id: ChannelId,
        reason: &str,
    ) -> ActionResult<()> {
        let audit = audit_reason(ActionKind::Relocate, reason);
        let builder = EditMember::new()
            .voice_channel(channel_id)
            .audit_log_reason(&audit);
        self.edit(ActionKind::Relocate, guild_id, user_id, builder)
            .await
    }

    async fn remove_from_voice(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        reason: &str,
    ) -> ActionResult<()> {
        let audit = audit_reason(ActionKind::RemoveFromVoice, reason);
        let builder = EditMember::new().disconnect_member().audit_log_reason(&audit);
        self.edit(ActionKind::RemoveFromVoice, guild_id, user_id, builder)
            .await
    }

    async fn suspend(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        duration: Duration,
        reason: &str,
    ) -> ActionResult<()> {
        let duration = duration.min(MAX_TIMEOUT);
        let span = chrono::Duration::from_std(duration)
            .map_err(|e| ActionError::Unknown(format!("invalid timeout duration: {e}")))?;
        let until = Timestamp::from(chrono::Utc::now() + span);
        let audit = audit_reason(ActionKind::Suspend, reason);
        let builder = EditMember::new()
            .disable_communication_until_datetime(until)
            .audit_log_reason(&audit);
        self.edit(ActionKind::Suspend, guild_id, user_id, builder)
            .await?;
        info!(
            target: ENFORCEMENT_TARGET,
            user_id = %user_id,
            guild_id = %guild_id,
            until = %until,
            "Member timed out"
        );
        Ok(())
    }

    async fn can_suspend(&self, guild_id: GuildId, user_id: UserId) -> bool {
        let bot_id = self.bot_id();
        let (Some(bot), Some(target)) = (
            self.member(guild_id, bot_id).await,
            self.member(guild_id, user_id).await,
        ) else {
            return false;
        };
        self.with_guild(guild_id, |guild| {
            Authority::from_guild(guild, &bot, &target).can_suspend()
        })
        .unwrap_or(false)
    }
}
