//! Voice receive for the speaking quota
//!
//! While a quota is active the bot sits in the target's voice channel and
//! turns songbird's per-tick audio reports into speaking start/stop edges.

use crate::{Data, ENFORCEMENT_TARGET, EVENT_TARGET, Error};
use dashmap::DashMap;
use poise::serenity_prelude::{self as serenity, ChannelId, GuildId, UserId};
use songbird::events::context_data::VoiceTick;
use songbird::model::payload::{ClientDisconnect, Speaking};
use songbird::{CoreEvent, Event, EventContext, EventHandler as VoiceEventHandler};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

/// A speaking edge for one user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpeakingChange {
    pub user_id: UserId,
    pub was_speaking: bool,
    pub is_speaking: bool,
}

/// Maps RTP sources to users and diffs consecutive ticks
#[derive(Debug, Default)]
pub struct SpeechDetector {
    users: DashMap<u32, UserId>,
    speaking: Mutex<HashSet<u32>>,
}

impl SpeechDetector {
    pub fn map_source(&self, ssrc: u32, user_id: UserId) {
        self.users.insert(ssrc, user_id);
    }

    /// Drop every source belonging to a user who left the call
    pub fn forget_user(&self, user_id: UserId) -> Vec<SpeakingChange> {
        let sources: Vec<u32> = self
            .users
            .iter()
            .filter(|entry| *entry.value() == user_id)
            .map(|entry| *entry.key())
            .collect();
        let mut speaking = self.speaking.lock().unwrap_or_else(PoisonError::into_inner);
        let mut changes = Vec::new();
        for ssrc in sources {
            self.users.remove(&ssrc);
            if speaking.remove(&ssrc) {
                changes.push(SpeakingChange {
                    user_id,
                    was_speaking: true,
                    is_speaking: false,
                });
            }
        }
        changes
    }

    /// Compare the sources heard this tick against the previous tick
    ///
    /// Sources without a known user are tracked but produce no changes.
    pub fn tick(&self, heard: HashSet<u32>) -> Vec<SpeakingChange> {
        let mut speaking = self.speaking.lock().unwrap_or_else(PoisonError::into_inner);
        let stopped = speaking.difference(&heard).map(|ssrc| (*ssrc, false));
        let started = heard.difference(&speaking).map(|ssrc| (*ssrc, true));
        let changes = stopped
            .chain(started)
            .filter_map(|(ssrc, is_speaking)| {
                self.users.get(&ssrc).map(|user| SpeakingChange {
                    user_id: *user,
                    was_speaking: !is_speaking,
                    is_speaking,
                })
            })
            .collect();
        *speaking = heard;
        changes
    }
}

/// Songbird event handler feeding the quota tracker
struct Receiver {
    data: Data,
    detector: Arc<SpeechDetector>,
}

impl Receiver {
    fn dispatch(&self, changes: Vec<SpeakingChange>) {
        for change in changes {
            let breach =
                self.data
                    .quota
                    .on_speaking_change(change.user_id, change.was_speaking, change.is_speaking);
            if let Some(breach) = breach {
                let data = self.data.clone();
                tokio::spawn(async move {
                    let outcome = data.quota.enforce(breach).await;
                    debug!(target: ENFORCEMENT_TARGET, outcome = ?outcome, "Quota enforcement finished");
                });
            }
        }
    }
}

#[async_trait::async_trait]
impl VoiceEventHandler for Receiver {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        match ctx {
            EventContext::SpeakingStateUpdate(Speaking {
                ssrc,
                user_id: Some(user_id),
                ..
            }) => {
                self.detector.map_source(*ssrc, UserId::new(user_id.0));
            }
            EventContext::VoiceTick(VoiceTick { speaking, .. }) => {
                let heard = speaking.keys().copied().collect();
                self.dispatch(self.detector.tick(heard));
            }
            EventContext::ClientDisconnect(ClientDisconnect { user_id, .. }) => {
                self.dispatch(self.detector.forget_user(UserId::new(user_id.0)));
            }
            _ => {}
        }
        None
    }
}

/// Join `channel_id` and start feeding speaking events to the quota tracker
///
/// Does nothing if the bot is already listening in that channel.
///
/// # Errors
/// Returns an error if songbird is not registered or the join fails.
pub async fn follow(
    ctx: &serenity::Context,
    data: &Data,
    guild_id: GuildId,
    channel_id: ChannelId,
) -> Result<(), Error> {
    let manager = songbird::get(ctx)
        .await
        .ok_or("songbird voice client is not registered")?;

    if let Some(call) = manager.get(guild_id) {
        if call.lock().await.current_channel() == Some(channel_id.into()) {
            return Ok(());
        }
    }

    let call = manager.join(guild_id, channel_id).await?;
    let mut call = call.lock().await;
    call.remove_all_global_events();
    let detector = Arc::new(SpeechDetector::default());
    for event in [
        CoreEvent::SpeakingStateUpdate,
        CoreEvent::VoiceTick,
        CoreEvent::ClientDisconnect,
    ] {
        call.add_global_event(
            event.into(),
            Receiver {
                data: data.clone(),
                detector: Arc::clone(&detector),
            },
        );
    }

    info!(
        target: EVENT_TARGET,
        guild_id = %guild_id,
        channel_id = %channel_id,
        "Listening for speech"
    );
    Ok(())
}

/// Leave voice in `guild_id` if the bot is connected there
pub async fn leave(ctx: &serenity::Context, guild_id: GuildId) {
    let Some(manager) = songbird::get(ctx).await else {
        return;
    };
    if manager.get(guild_id).is_none() {
        return;
    }
    match manager.remove(guild_id).await {
        Ok(()) => info!(target: EVENT_TARGET, guild_id = %guild_id, "Stopped listening"),
        Err(e) => warn!(target: EVENT_TARGET, guild_id = %guild_id, error = %e, "Failed to leave voice"),
    }
}
