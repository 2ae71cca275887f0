use crate::enforcement::{PresenceChange, SpeechQuota, VoicePresence};
use crate::{Data, EVENT_TARGET, listener};
use poise::serenity_prelude::{
    self as serenity, ChannelId, Context, EventHandler, GuildId, Ready, UserId, VoiceState,
};
use tracing::{debug, info, warn};

pub struct Handler;

/// What the quota listener should do after the watched user's voice state changes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerMove {
    Follow(ChannelId),
    Leave,
    Stay,
}

impl ListenerMove {
    #[must_use]
    pub fn for_change(
        quota: Option<&SpeechQuota>,
        guild_id: GuildId,
        user_id: UserId,
        previous: Option<ChannelId>,
        current: Option<ChannelId>,
    ) -> Self {
        let watched = quota
            .is_some_and(|q| q.enabled && q.guild_id == guild_id && q.target_id == user_id);
        if !watched || previous == current {
            return Self::Stay;
        }
        current.map_or(Self::Leave, Self::Follow)
    }
}

#[must_use]
pub fn presence_of(channel_id: Option<ChannelId>, self_deaf: bool) -> Option<VoicePresence> {
    channel_id.map(|channel_id| VoicePresence {
        channel_id,
        self_deaf,
    })
}

#[serenity::async_trait]
impl EventHandler for Handler {
    /// Called when the bot is ready, but the cache may not be fully populated yet.
    async fn ready(&self, ctx: Context, ready: Ready) {
        let user_name = ready.user.name.clone();
        let shard_id = ctx.shard_id;
        info!(target: EVENT_TARGET, "Connected as {user_name}, shard {shard_id}");
    }

    /// Called when the cache is fully populated.
    async fn cache_ready(&self, ctx: Context, guilds: Vec<GuildId>) {
        let guild_count_cache = ctx.cache.guild_count();
        let guild_count = guilds.len();
        if guild_count != guild_count_cache {
            warn!(
                target: EVENT_TARGET,
                "Cache guild count mismatch: {guild_count_cache} (cache) vs {guild_count} (actual)"
            );
        }
        info!(target: EVENT_TARGET, "Cache ready! The bot is in {guild_count} guild(s)");

        if let Some(data) = Data::from_context(&ctx).await {
            crate::commands::update_presence(&ctx, &data);
            data.engine.enforce_existing_presence().await;
        }
    }

    async fn voice_state_update(&self, ctx: Context, old: Option<VoiceState>, new: VoiceState) {
        let Some(guild_id) = new.guild_id else {
            return;
        };
        if new.user_id == ctx.cache.current_user().id {
            return;
        }
        let Some(data) = Data::from_context(&ctx).await else {
            warn!(target: EVENT_TARGET, "Voice state update before data was initialised");
            return;
        };

        let previous = old
            .as_ref()
            .and_then(|old| presence_of(old.channel_id, old.self_deaf));
        let current = presence_of(new.channel_id, new.self_deaf);
        debug!(
            target: EVENT_TARGET,
            user_id = %new.user_id,
            guild_id = %guild_id,
            previous = ?previous,
            current = ?current,
            "Voice state update"
        );

        let change = PresenceChange {
            guild_id,
            user_id: new.user_id,
            previous,
            current,
        };
        if let Some(outcome) = data.engine.on_presence_change(change).await {
            info!(target: EVENT_TARGET, user_id = %new.user_id, outcome = ?outcome, "Enforced");
        }

        let quota = data.quota.status();
        match ListenerMove::for_change(
            quota.as_ref(),
            guild_id,
            new.user_id,
            previous.map(|p| p.channel_id),
            current.map(|p| p.channel_id),
        ) {
            ListenerMove::Follow(channel_id) => {
                if let Err(e) = listener::follow(&ctx, &data, guild_id, channel_id).await {
                    warn!(target: EVENT_TARGET, error = %e, "Failed to follow target");
                }
            }
            ListenerMove::Leave => listener::leave(&ctx, guild_id).await,
            ListenerMove::Stay => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn quota() -> SpeechQuota {
        SpeechQuota {
            guild_id: GuildId::new(1),
            target_id: UserId::new(42),
            limit: 3,
            count: 0,
            timeout: Duration::from_secs(60),
            enabled: true,
        }
    }

    #[test]
    fn test_handler_implements_event_handler() {
        fn assert_impl<T: EventHandler>() {}
        assert_impl::<Handler>();
    }

    #[test]
    fn test_presence_of() {
        assert_eq!(presence_of(None, true), None);
        assert_eq!(
            presence_of(Some(ChannelId::new(5)), true),
            Some(VoicePresence {
                channel_id: ChannelId::new(5),
                self_deaf: true,
            })
        );
    }

    #[test]
    fn test_listener_follows_watched_user() {
        let quota = quota();
        let guild = GuildId::new(1);
        let user = UserId::new(42);

        assert_eq!(
            ListenerMove::for_change(Some(&quota), guild, user, None, Some(ChannelId::new(7))),
            ListenerMove::Follow(ChannelId::new(7))
        );
        assert_eq!(
            ListenerMove::for_change(
                Some(&quota),
                guild,
                user,
                Some(ChannelId::new(7)),
                Some(ChannelId::new(8))
            ),
            ListenerMove::Follow(ChannelId::new(8))
        );
        assert_eq!(
            ListenerMove::for_change(Some(&quota), guild, user, Some(ChannelId::new(8)), None),
            ListenerMove::Leave
        );
        // deafen toggles in place do not move the listener
        assert_eq!(
            ListenerMove::for_change(
                Some(&quota),
                guild,
                user,
                Some(ChannelId::new(8)),
                Some(ChannelId::new(8))
            ),
            ListenerMove::Stay
        );
    }

    #[test]
    fn test_listener_ignores_others() {
        let quota = quota();
        let to = Some(ChannelId::new(7));

        assert_eq!(
            ListenerMove::for_change(Some(&quota), GuildId::new(1), UserId::new(99), None, to),
            ListenerMove::Stay
        );
        assert_eq!(
            ListenerMove::for_change(Some(&quota), GuildId::new(2), UserId::new(42), None, to),
            ListenerMove::Stay
        );
        assert_eq!(
            ListenerMove::for_change(None, GuildId::new(1), UserId::new(42), None, to),
            ListenerMove::Stay
        );

        let stopped = SpeechQuota {
            enabled: false,
            ..quota
        };
        assert_eq!(
            ListenerMove::for_change(Some(&stopped), GuildId::new(1), UserId::new(42), None, to),
            ListenerMove::Stay
        );
    }
}
