//! In-memory guild used by the enforcement tests
//!
//! Implements both the topology and the action provider so relocations
//! actually change occupancy between ticks.

use crate::enforcement::{
    ActionError, ActionResult, ChannelSnapshot, PermissionGrant, VoiceActions, VoicePresence,
    VoiceTopology,
};
use poise::serenity_prelude::{ChannelId, GuildId, UserId};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

pub const GUILD_ID: u64 = 9000;

/// A recorded action call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Relocate {
        user_id: UserId,
        channel_id: ChannelId,
        reason: String,
    },
    Remove {
        user_id: UserId,
        reason: String,
    },
    Suspend {
        user_id: UserId,
        duration: Duration,
        reason: String,
    },
}

struct FakeChannel {
    id: ChannelId,
    name: String,
    is_voice: bool,
    grant: PermissionGrant,
}

#[derive(Default)]
struct Inner {
    channels: Vec<FakeChannel>,
    presences: HashMap<UserId, VoicePresence>,
    hidden_voice_states: HashSet<UserId>,
    phantom_occupants: HashSet<ChannelId>,
    relocate_failures: VecDeque<ActionError>,
    ignore_moves: bool,
    remove_failure: Option<ActionError>,
    suspend_failure: Option<ActionError>,
    can_suspend: bool,
    listing_delay: Duration,
    calls: Vec<Call>,
}

pub struct FakeGuild {
    guild_id: GuildId,
    inner: Mutex<Inner>,
}

impl FakeGuild {
    pub fn new() -> Self {
        Self {
            guild_id: GuildId::new(GUILD_ID),
            inner: Mutex::new(Inner {
                can_suspend: true,
                ..Inner::default()
            }),
        }
    }

    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    fn with<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        f(&mut self.inner.lock().unwrap())
    }

    pub fn add_voice_channel(&self, id: u64, name: &str) {
        self.with(|inner| {
            inner.channels.push(FakeChannel {
                id: ChannelId::new(id),
                name: name.to_string(),
                is_voice: true,
                grant: PermissionGrant::full(),
            });
        });
    }

    pub fn add_text_channel(&self, id: u64, name: &str) {
        self.with(|inner| {
            inner.channels.push(FakeChannel {
                id: ChannelId::new(id),
                name: name.to_string(),
                is_voice: false,
                grant: PermissionGrant::full(),
            });
        });
    }

    pub fn set_grant(&self, channel: u64, grant: PermissionGrant) {
        self.with(|inner| {
            if let Some(c) = inner.channels.iter_mut().find(|c| c.id.get() == channel) {
                c.grant = grant;
            }
        });
    }

    pub fn connect(&self, user: u64, channel: u64, self_deaf: bool) {
        self.with(|inner| {
            inner.presences.insert(
                UserId::new(user),
                VoicePresence {
                    channel_id: ChannelId::new(channel),
                    self_deaf,
                },
            );
        });
    }

    pub fn disconnect(&self, user: u64) {
        self.with(|inner| {
            inner.presences.remove(&UserId::new(user));
        });
    }

    pub fn set_deaf(&self, user: u64, self_deaf: bool) {
        self.with(|inner| {
            if let Some(presence) = inner.presences.get_mut(&UserId::new(user)) {
                presence.self_deaf = self_deaf;
            }
        });
    }

    /// Drop the user's voice-state record while keeping them in occupant lists
    pub fn hide_voice_state(&self, user: u64) {
        self.with(|inner| {
            inner.hidden_voice_states.insert(UserId::new(user));
        });
    }

    /// Make `channel()` report an occupant that `list_channels()` does not show
    pub fn add_phantom_occupant(&self, channel: u64) {
        self.with(|inner| {
            inner.phantom_occupants.insert(ChannelId::new(channel));
        });
    }

    pub fn fail_next_relocate(&self, error: ActionError) {
        self.with(|inner| inner.relocate_failures.push_back(error));
    }

    /// Relocations succeed at the API level but nobody actually moves
    pub fn ignore_moves(&self) {
        self.with(|inner| inner.ignore_moves = true);
    }

    pub fn fail_removals(&self, error: ActionError) {
        self.with(|inner| inner.remove_failure = Some(error));
    }

    pub fn fail_suspensions(&self, error: ActionError) {
        self.with(|inner| inner.suspend_failure = Some(error));
    }

    /// Make every channel listing take `delay` to come back
    pub fn slow_listing(&self, delay: Duration) {
        self.with(|inner| inner.listing_delay = delay);
    }

    pub fn deny_suspension(&self) {
        self.with(|inner| inner.can_suspend = false);
    }

    pub fn location(&self, user: u64) -> Option<ChannelId> {
        self.with(|inner| inner.presences.get(&UserId::new(user)).map(|p| p.channel_id))
    }

    pub fn calls(&self) -> Vec<Call> {
        self.with(|inner| inner.calls.clone())
    }

    pub fn relocations(&self) -> Vec<ChannelId> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Relocate { channel_id, .. } => Some(channel_id),
                _ => None,
            })
            .collect()
    }

    pub fn removals(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Remove { reason, .. } => Some(reason),
                _ => None,
            })
            .collect()
    }

    pub fn suspensions(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, Call::Suspend { .. }))
            .count()
    }

    fn snapshot(inner: &Inner, channel: &FakeChannel) -> ChannelSnapshot {
        let occupants = inner
            .presences
            .iter()
            .filter(|(_, presence)| presence.channel_id == channel.id)
            .map(|(user, _)| *user)
            .collect();
        ChannelSnapshot {
            id: channel.id,
            name: channel.name.clone(),
            is_voice: channel.is_voice,
            occupants,
            grant: channel.grant,
        }
    }
}

#[async_trait::async_trait]
impl VoiceTopology for FakeGuild {
    async fn list_channels(&self, guild_id: GuildId) -> Vec<ChannelSnapshot> {
        if guild_id != self.guild_id {
            return Vec::new();
        }
        let delay = self.with(|inner| inner.listing_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.with(|inner| {
            inner
                .channels
                .iter()
                .map(|channel| Self::snapshot(inner, channel))
                .collect()
        })
    }

    async fn channel(&self, guild_id: GuildId, channel_id: ChannelId) -> Option<ChannelSnapshot> {
        if guild_id != self.guild_id {
            return None;
        }
        self.with(|inner| {
            let channel = inner.channels.iter().find(|c| c.id == channel_id)?;
            let mut snapshot = Self::snapshot(inner, channel);
            if inner.phantom_occupants.contains(&channel_id) {
                snapshot.occupants.push(UserId::new(u64::MAX));
            }
            Some(snapshot)
        })
    }

    async fn voice_presence(&self, guild_id: GuildId, user_id: UserId) -> Option<VoicePresence> {
        if guild_id != self.guild_id {
            return None;
        }
        self.with(|inner| {
            if inner.hidden_voice_states.contains(&user_id) {
                None
            } else {
                inner.presences.get(&user_id).copied()
            }
        })
    }

    async fn presences_of(&self, user_id: UserId) -> Vec<(GuildId, VoicePresence)> {
        self.with(|inner| {
            inner
                .presences
                .get(&user_id)
                .map(|presence| vec![(self.guild_id, *presence)])
                .unwrap_or_default()
        })
    }
}

#[async_trait::async_trait]
impl VoiceActions for FakeGuild {
    async fn relocate(
        &self,
        _guild_id: GuildId,
        user_id: UserId,
        channel_id: ChannelId,
        reason: &str,
    ) -> ActionResult<()> {
        self.with(|inner| {
            inner.calls.push(Call::Relocate {
                user_id,
                channel_id,
                reason: reason.to_string(),
            });
            if let Some(error) = inner.relocate_failures.pop_front() {
                return Err(error);
            }
            if inner.ignore_moves {
                return Ok(());
            }
            match inner.presences.get_mut(&user_id) {
                Some(presence) => {
                    presence.channel_id = channel_id;
                    Ok(())
                }
                None => Err(ActionError::TargetUnreachable("not connected".to_string())),
            }
        })
    }

    async fn remove_from_voice(
        &self,
        _guild_id: GuildId,
        user_id: UserId,
        reason: &str,
    ) -> ActionResult<()> {
        self.with(|inner| {
            inner.calls.push(Call::Remove {
                user_id,
                reason: reason.to_string(),
            });
            if let Some(error) = inner.remove_failure.clone() {
                return Err(error);
            }
            inner.presences.remove(&user_id);
            Ok(())
        })
    }

    async fn suspend(
        &self,
        _guild_id: GuildId,
        user_id: UserId,
        duration: Duration,
        reason: &str,
    ) -> ActionResult<()> {
        self.with(|inner| {
            inner.calls.push(Call::Suspend {
                user_id,
                duration,
                reason: reason.to_string(),
            });
            match inner.suspend_failure.clone() {
                Some(error) => Err(error),
                None => Ok(()),
            }
        })
    }

    async fn can_suspend(&self, _guild_id: GuildId, _user_id: UserId) -> bool {
        self.with(|inner| inner.can_suspend)
    }
}
