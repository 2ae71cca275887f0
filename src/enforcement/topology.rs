//! Voice topology queries
//!
//! Read-only views of a guild's voice channels and of where a user currently
//! sits. Snapshots are fetched fresh for every decision; nothing here caches.

use poise::serenity_prelude::{ChannelId, GuildId, UserId};

/// Capabilities the bot holds on a channel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PermissionGrant {
    pub connect: bool,
    pub move_members: bool,
    pub view: bool,
}

impl PermissionGrant {
    /// Grant with every capability needed to relocate someone into the channel
    #[must_use]
    pub const fn full() -> Self {
        Self {
            connect: true,
            move_members: true,
            view: true,
        }
    }

    #[must_use]
    pub fn allows_relocation(&self) -> bool {
        self.connect && self.move_members && self.view
    }
}

/// Point-in-time view of one guild channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSnapshot {
    pub id: ChannelId,
    pub name: String,
    /// Voice or stage channel
    pub is_voice: bool,
    /// Users connected to the channel at query time
    pub occupants: Vec<UserId>,
    pub grant: PermissionGrant,
}

impl ChannelSnapshot {
    #[must_use]
    pub fn occupant_count(&self) -> usize {
        self.occupants.len()
    }

    #[must_use]
    pub fn contains(&self, user_id: UserId) -> bool {
        self.occupants.contains(&user_id)
    }

    /// Whether the channel can serve as a decoy right now
    #[must_use]
    pub fn is_eligible_decoy(&self, exclude: Option<ChannelId>) -> bool {
        self.is_voice
            && Some(self.id) != exclude
            && self.occupant_count() == 0
            && self.grant.allows_relocation()
    }
}

/// A user's voice state inside a guild
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoicePresence {
    pub channel_id: ChannelId,
    pub self_deaf: bool,
}

/// Source of live channel and presence data
#[async_trait::async_trait]
pub trait VoiceTopology: Send + Sync {
    /// All channels of a guild, with occupancy and the bot's grant
    async fn list_channels(&self, guild_id: GuildId) -> Vec<ChannelSnapshot>;

    /// A single channel, re-read for last-moment verification
    async fn channel(&self, guild_id: GuildId, channel_id: ChannelId) -> Option<ChannelSnapshot>;

    /// The voice-state record of a user, if they are connected
    async fn voice_presence(&self, guild_id: GuildId, user_id: UserId) -> Option<VoicePresence>;

    /// Every guild in which the user is currently connected to voice
    async fn presences_of(&self, user_id: UserId) -> Vec<(GuildId, VoicePresence)>;
}

/// Empty voice channels the bot can move someone into, minus `exclude`
///
/// An empty result is a normal answer, not a failure.
pub async fn find_eligible_channels(
    topology: &dyn VoiceTopology,
    guild_id: GuildId,
    exclude: Option<ChannelId>,
) -> Vec<ChannelSnapshot> {
    topology
        .list_channels(guild_id)
        .await
        .into_iter()
        .filter(|channel| channel.is_eligible_decoy(exclude))
        .collect()
}

/// The channel whose occupant list contains the user
pub async fn occupied_channel(
    topology: &dyn VoiceTopology,
    guild_id: GuildId,
    user_id: UserId,
) -> Option<ChannelId> {
    topology
        .list_channels(guild_id)
        .await
        .into_iter()
        .find(|channel| channel.is_voice && channel.contains(user_id))
        .map(|channel| channel.id)
}
