//! Enforcement engine
//!
//! Turns the target's voice presence changes into enforcement: a single
//! removal in kick mode, or a discipline session in discipline mode.

use crate::ENFORCEMENT_TARGET;
use crate::enforcement::action::reason;
use crate::enforcement::discipline::{DisciplineController, DisciplineSettings, StartOutcome};
use crate::enforcement::{
    ModerationMode, ModerationState, Toggle, VoiceActions, VoicePresence, VoiceTopology,
};
use poise::serenity_prelude::{ChannelId, GuildId, UserId};
use dashmap::DashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use tracing::{error, info, warn};

/// A voice presence change for one user in one guild
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceChange {
    pub guild_id: GuildId,
    pub user_id: UserId,
    pub previous: Option<VoicePresence>,
    pub current: Option<VoicePresence>,
}

/// Which rule fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    JoinedDeafened,
    Deafened,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.reason())
    }
}

impl Trigger {
    /// Rule evaluation for a presence transition
    #[must_use]
    pub fn evaluate(previous: Option<VoicePresence>, current: Option<VoicePresence>) -> Option<Self> {
        let current = current?;
        if !current.self_deaf {
            return None;
        }
        match previous {
            None => Some(Self::JoinedDeafened),
            Some(previous) if !previous.self_deaf => Some(Self::Deafened),
            Some(_) => None,
        }
    }

    #[must_use]
    pub fn reason(self) -> &'static str {
        match self {
            Self::JoinedDeafened => reason::JOINED_DEAFENED,
            Self::Deafened => reason::DEAFENED,
        }
    }
}

/// What the engine did about an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnforcementOutcome {
    Removed,
    RemovalFailed,
    DisciplineStarted,
    DisciplineAlreadyRunning,
    /// A stopped session for the target had not wound down yet
    DisciplineStopping,
}

/// Consumes presence changes and enforces the moderation rules
pub struct ModerationEngine {
    state: RwLock<ModerationState>,
    /// Target's last observed presence per guild, used when an event has no previous state
    last_seen: DashMap<GuildId, VoicePresence>,
    discipline: DisciplineController,
    topology: Arc<dyn VoiceTopology>,
    actions: Arc<dyn VoiceActions>,
}

impl ModerationEngine {
    #[must_use]
    pub fn new(
        target_id: UserId,
        topology: Arc<dyn VoiceTopology>,
        actions: Arc<dyn VoiceActions>,
        settings: DisciplineSettings,
    ) -> Self {
        Self {
            state: RwLock::new(ModerationState::new(target_id)),
            last_seen: DashMap::new(),
            discipline: DisciplineController::new(topology.clone(), actions.clone(), settings),
            topology,
            actions,
        }
    }

    /// Copy of the current moderation state
    #[must_use]
    pub fn state(&self) -> ModerationState {
        self.state
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn discipline(&self) -> &DisciplineController {
        &self.discipline
    }

    #[must_use]
    pub fn topology(&self) -> &dyn VoiceTopology {
        self.topology.as_ref()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut ModerationState) -> R) -> R {
        let mut state = self
            .state
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut state)
    }

    /// Enable or disable moderation
    ///
    /// Enabling checks whether the target is already sitting deafened in
    /// voice and enforces right away. Disabling stops any discipline session.
    pub async fn set_enabled(&self, enabled: bool) -> Toggle {
        let toggle = self.with_state(|state| state.set_enabled(enabled));
        if !toggle.changed() {
            return toggle;
        }

        info!(target: ENFORCEMENT_TARGET, enabled, event = "moderation_toggled", "Moderation toggled");
        if enabled {
            self.enforce_existing_presence().await;
        } else {
            self.discipline.stop_all();
        }
        toggle
    }

    /// Switch between kick and discipline mode
    ///
    /// Leaving discipline mode stops running sessions.
    pub fn set_mode(&self, mode: ModerationMode) -> Toggle {
        let toggle = self.with_state(|state| state.set_mode(mode));
        if toggle.changed() {
            info!(target: ENFORCEMENT_TARGET, mode = %mode, event = "mode_changed", "Moderation mode changed");
            if mode == ModerationMode::Kick {
                self.discipline.stop_all();
            }
        }
        toggle
    }

    /// Enforce against a target who is already sitting deafened in voice
    ///
    /// Runs on enable and once the gateway cache is ready.
    pub async fn enforce_existing_presence(&self) {
        let state = self.state();
        if !state.enabled {
            return;
        }
        let target_id = state.target_id;
        for (guild_id, presence) in self.topology.presences_of(target_id).await {
            self.last_seen.insert(guild_id, presence);
            if presence.self_deaf {
                info!(
                    target: ENFORCEMENT_TARGET,
                    user_id = %target_id,
                    guild_id = %guild_id,
                    "Target is already deafened in voice"
                );
                self.enforce(guild_id, target_id, presence.channel_id, Trigger::JoinedDeafened)
                    .await;
            }
        }
    }

    /// Handle a voice presence change
    ///
    /// Returns `None` when nothing was enforced.
    pub async fn on_presence_change(&self, change: PresenceChange) -> Option<EnforcementOutcome> {
        let state = self.state();
        if !state.is_target(change.user_id) {
            return None;
        }
        let previous = self.remember(change.guild_id, change.previous, change.current);
        if !state.enabled {
            return None;
        }

        let trigger = Trigger::evaluate(previous, change.current)?;
        let channel_id = change.current?.channel_id;
        info!(
            target: ENFORCEMENT_TARGET,
            user_id = %change.user_id,
            guild_id = %change.guild_id,
            channel_id = %channel_id,
            trigger = %trigger,
            "Target triggered enforcement"
        );
        Some(self.enforce(change.guild_id, change.user_id, channel_id, trigger).await)
    }

    /// Record the target's new presence and return the best known previous one
    fn remember(
        &self,
        guild_id: GuildId,
        previous: Option<VoicePresence>,
        current: Option<VoicePresence>,
    ) -> Option<VoicePresence> {
        let seen = match current {
            Some(current) => self.last_seen.insert(guild_id, current),
            None => self.last_seen.remove(&guild_id).map(|(_, seen)| seen),
        };
        previous.or(seen)
    }

    async fn enforce(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        channel_id: ChannelId,
        trigger: Trigger,
    ) -> EnforcementOutcome {
        match self.state().mode {
            ModerationMode::Discipline => match self.discipline.start(guild_id, user_id, channel_id) {
                StartOutcome::Started(_) => EnforcementOutcome::DisciplineStarted,
                StartOutcome::AlreadyRunning(_) => EnforcementOutcome::DisciplineAlreadyRunning,
                StartOutcome::Stopping(session_id) => {
                    warn!(
                        target: ENFORCEMENT_TARGET,
                        user_id = %user_id,
                        session_id = %session_id,
                        "Previous discipline session is still shutting down"
                    );
                    EnforcementOutcome::DisciplineStopping
                }
            },
            ModerationMode::Kick => {
                match self
                    .actions
                    .remove_from_voice(guild_id, user_id, trigger.reason())
                    .await
                {
                    Ok(()) => {
                        info!(
                            target: ENFORCEMENT_TARGET,
                            user_id = %user_id,
                            guild_id = %guild_id,
                            reason = trigger.reason(),
                            event = "removed",
                            "Removed target from voice"
                        );
                        EnforcementOutcome::Removed
                    }
                    Err(e) => {
                        error!(
                            target: ENFORCEMENT_TARGET,
                            user_id = %user_id,
                            guild_id = %guild_id,
                            class = e.class(),
                            error = %e,
                            "Failed to remove target from voice"
                        );
                        EnforcementOutcome::RemovalFailed
                    }
                }
            }
        }
    }
}
