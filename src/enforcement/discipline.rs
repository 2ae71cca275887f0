//! Discipline mode
//!
//! A discipline session bounces a deafened target between empty voice
//! channels until they undeafen, leave, or the bot runs out of places to put
//! them. [`DisciplineSession::tick`] is one step of that loop and holds all of
//! the transition logic; [`DisciplineController`] owns one scheduler task per
//! target that calls it on a timer.

use crate::ENFORCEMENT_TARGET;
use crate::enforcement::action::reason;
use crate::enforcement::topology::{find_eligible_channels, occupied_channel};
use crate::enforcement::{ActionError, ChannelSnapshot, VoiceActions, VoiceTopology};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use derive_more::Display;
use poise::serenity_prelude::{ChannelId, GuildId, UserId};
use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Pacing of the relocation loop
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisciplineSettings {
    /// Tick period a new session starts with
    pub initial_interval_ms: u64,
    /// Upper bound for the tick period under rate limiting
    pub max_interval_ms: u64,
    /// Multiplier applied to the tick period on each rate limit
    pub backoff_factor: f64,
    /// Pause after a rate limit before ticking resumes
    pub cooldown_ms: u64,
    /// Wait between a relocation and checking where the target ended up
    pub settle_delay_ms: u64,
}

impl Default for DisciplineSettings {
    fn default() -> Self {
        Self {
            initial_interval_ms: 750,
            max_interval_ms: 5000,
            backoff_factor: 1.5,
            cooldown_ms: 1000,
            settle_delay_ms: 100,
        }
    }
}

impl DisciplineSettings {
    #[must_use]
    pub fn initial_interval(&self) -> Duration {
        Duration::from_millis(self.initial_interval_ms)
    }

    #[must_use]
    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms)
    }

    #[must_use]
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    #[must_use]
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// First field that would stall or break the relocation loop, with its value
    #[must_use]
    pub fn invalid_field(&self) -> Option<(&'static str, String)> {
        if self.initial_interval_ms == 0 {
            return Some(("discipline.initial_interval_ms", "0".to_string()));
        }
        if self.initial_interval_ms > self.max_interval_ms {
            return Some((
                "discipline.max_interval_ms",
                self.max_interval_ms.to_string(),
            ));
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Some(("discipline.backoff_factor", self.backoff_factor.to_string()));
        }
        None
    }

    /// Next tick period after a rate limit
    #[must_use]
    pub fn backed_off(&self, interval: Duration) -> Duration {
        interval
            .mul_f64(self.backoff_factor.max(1.0))
            .min(self.max_interval())
            .max(interval)
    }
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
pub enum StopReason {
    #[display("left voice")]
    LeftVoice,
    #[display("undeafened")]
    Undeafened,
    #[display("no channels")]
    NoChannels,
    #[display("permission denied")]
    PermissionDenied,
    #[display("target not connected")]
    TargetGone,
    #[display("relocation failed")]
    Failed,
    #[display("stopped by operator")]
    Cancelled,
}

impl StopReason {
    /// Whether the target should be disconnected once the session ends
    #[must_use]
    pub fn falls_back_to_removal(self) -> bool {
        matches!(self, Self::NoChannels | Self::PermissionDenied)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Running,
    Stopped(StopReason),
}

/// Result of a single tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Target was moved and the move was verified
    Moved,
    /// Relocation call succeeded but the target is somewhere else
    Missed,
    /// The chosen channel failed re-verification; nothing was done
    Skipped,
    /// Rate limited; the scheduler should pause before the next tick
    Cooldown,
    Stopped(StopReason),
}

/// State of one target's discipline loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisciplineSession {
    pub id: Uuid,
    pub guild_id: GuildId,
    pub target_id: UserId,
    pub original_channel_id: ChannelId,
    pub current_channel_id: ChannelId,
    pub move_count: u32,
    pub interval: Duration,
    pub rate_limit_strikes: u32,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
}

impl DisciplineSession {
    #[must_use]
    pub fn new(
        guild_id: GuildId,
        target_id: UserId,
        channel_id: ChannelId,
        settings: &DisciplineSettings,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            guild_id,
            target_id,
            original_channel_id: channel_id,
            current_channel_id: channel_id,
            move_count: 0,
            interval: settings.initial_interval(),
            rate_limit_strikes: 0,
            status: SessionStatus::Running,
            started_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.status == SessionStatus::Running
    }

    /// Mark the session stopped; a second call keeps the first reason
    pub fn stop(&mut self, reason: StopReason) -> bool {
        if !self.is_running() {
            return false;
        }
        self.status = SessionStatus::Stopped(reason);
        info!(
            target: ENFORCEMENT_TARGET,
            session_id = %self.id,
            user_id = %self.target_id,
            guild_id = %self.guild_id,
            moves = self.move_count,
            reason = %reason,
            event = "discipline_stopped",
            "Discipline session stopped"
        );
        true
    }

    fn finish(&mut self, reason: StopReason) -> TickOutcome {
        self.stop(reason);
        TickOutcome::Stopped(reason)
    }

    fn back_off(&mut self, settings: &DisciplineSettings) {
        self.rate_limit_strikes += 1;
        self.interval = settings.backed_off(self.interval);
    }

    /// Run one step of the relocation loop
    pub async fn tick(
        &mut self,
        topology: &dyn VoiceTopology,
        actions: &dyn VoiceActions,
        settings: &DisciplineSettings,
    ) -> TickOutcome {
        if let SessionStatus::Stopped(reason) = self.status {
            return TickOutcome::Stopped(reason);
        }

        // The voice-state record can lag behind; only give up when the
        // occupant lists agree the target is gone.
        let presence = topology.voice_presence(self.guild_id, self.target_id).await;
        let occupied = occupied_channel(topology, self.guild_id, self.target_id).await;
        let current = match (presence, occupied) {
            (Some(presence), _) => presence.channel_id,
            (None, Some(channel_id)) => channel_id,
            (None, None) => return self.finish(StopReason::LeftVoice),
        };
        self.current_channel_id = current;

        if presence.is_some_and(|p| !p.self_deaf) {
            self.return_to_origin(actions).await;
            return self.finish(StopReason::Undeafened);
        }

        let eligible = find_eligible_channels(topology, self.guild_id, Some(current)).await;
        let Some(destination) = pick_decoy(&eligible) else {
            return self.finish(StopReason::NoChannels);
        };

        let still_eligible = topology
            .channel(self.guild_id, destination)
            .await
            .is_some_and(|fresh| fresh.is_eligible_decoy(Some(current)));
        if !still_eligible {
            debug!(
                target: ENFORCEMENT_TARGET,
                session_id = %self.id,
                channel_id = %destination,
                "Decoy channel changed before the move, skipping tick"
            );
            return TickOutcome::Skipped;
        }

        match actions
            .relocate(self.guild_id, self.target_id, destination, reason::DISCIPLINE_MOVE)
            .await
        {
            Ok(()) => {
                tokio::time::sleep(settings.settle_delay()).await;
                let after = topology
                    .voice_presence(self.guild_id, self.target_id)
                    .await
                    .map(|p| p.channel_id);
                if after == Some(destination) {
                    self.move_count += 1;
                    self.rate_limit_strikes = self.rate_limit_strikes.saturating_sub(1);
                    self.current_channel_id = destination;
                    debug!(
                        target: ENFORCEMENT_TARGET,
                        session_id = %self.id,
                        channel_id = %destination,
                        moves = self.move_count,
                        "Discipline move verified"
                    );
                    TickOutcome::Moved
                } else {
                    warn!(
                        target: ENFORCEMENT_TARGET,
                        session_id = %self.id,
                        user_id = %self.target_id,
                        before = %current,
                        intended = %destination,
                        after = ?after,
                        "Discipline move did not land"
                    );
                    TickOutcome::Missed
                }
            }
            Err(ActionError::RateLimited(message)) => {
                self.back_off(settings);
                warn!(
                    target: ENFORCEMENT_TARGET,
                    session_id = %self.id,
                    strikes = self.rate_limit_strikes,
                    interval_ms = self.interval.as_secs_f64() * 1000.0,
                    error = %message,
                    "Rate limited during discipline, backing off"
                );
                TickOutcome::Cooldown
            }
            Err(e) => {
                error!(
                    target: ENFORCEMENT_TARGET,
                    session_id = %self.id,
                    user_id = %self.target_id,
                    class = e.class(),
                    error = %e,
                    "Discipline move failed"
                );
                let reason = match e {
                    ActionError::PermissionDenied(_) => StopReason::PermissionDenied,
                    ActionError::TargetUnreachable(_) => StopReason::TargetGone,
                    _ => StopReason::Failed,
                };
                self.finish(reason)
            }
        }
    }

    async fn return_to_origin(&self, actions: &dyn VoiceActions) {
        if self.current_channel_id == self.original_channel_id {
            return;
        }
        if let Err(e) = actions
            .relocate(
                self.guild_id,
                self.target_id,
                self.original_channel_id,
                reason::DISCIPLINE_RETURN,
            )
            .await
        {
            warn!(
                target: ENFORCEMENT_TARGET,
                session_id = %self.id,
                user_id = %self.target_id,
                channel_id = %self.original_channel_id,
                error = %e,
                "Failed to return target to original channel"
            );
        }
    }
}

fn pick_decoy(eligible: &[ChannelSnapshot]) -> Option<ChannelId> {
    eligible.choose(&mut rand::rng()).map(|channel| channel.id)
}

/// Whether `start` created a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started(Uuid),
    AlreadyRunning(Uuid),
    /// The previous session was stopped and its task has not exited yet
    Stopping(Uuid),
}

struct SessionHandle {
    id: Uuid,
    cancel: CancellationToken,
    state: watch::Receiver<DisciplineSession>,
}

impl SessionHandle {
    fn is_live(&self) -> bool {
        !self.cancel.is_cancelled() && self.state.borrow().is_running()
    }
}

/// Owns the discipline sessions, at most one task per target
///
/// A handle stays registered until its task retires, so a stopped session
/// still blocks a new one for the same target until it has fully wound down.
#[derive(Clone)]
pub struct DisciplineController {
    sessions: Arc<DashMap<UserId, SessionHandle>>,
    finished: Arc<DashMap<UserId, DisciplineSession>>,
    topology: Arc<dyn VoiceTopology>,
    actions: Arc<dyn VoiceActions>,
    settings: DisciplineSettings,
}

impl DisciplineController {
    #[must_use]
    pub fn new(
        topology: Arc<dyn VoiceTopology>,
        actions: Arc<dyn VoiceActions>,
        settings: DisciplineSettings,
    ) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            finished: Arc::new(DashMap::new()),
            topology,
            actions,
            settings,
        }
    }

    #[must_use]
    pub fn settings(&self) -> &DisciplineSettings {
        &self.settings
    }

    /// Start disciplining `target_id`, who is currently in `channel_id`
    pub fn start(&self, guild_id: GuildId, target_id: UserId, channel_id: ChannelId) -> StartOutcome {
        let mut entry = match self.sessions.entry(target_id) {
            Entry::Occupied(entry) if entry.get().cancel.is_cancelled() => {
                return StartOutcome::Stopping(entry.get().id);
            }
            Entry::Occupied(entry) if entry.get().state.borrow().is_running() => {
                return StartOutcome::AlreadyRunning(entry.get().id);
            }
            entry => entry,
        };

        let session = DisciplineSession::new(guild_id, target_id, channel_id, &self.settings);
        let id = session.id;
        let (tx, rx) = watch::channel(session.clone());
        let cancel = CancellationToken::new();

        info!(
            target: ENFORCEMENT_TARGET,
            session_id = %id,
            user_id = %target_id,
            guild_id = %guild_id,
            channel_id = %channel_id,
            event = "discipline_started",
            "Discipline session started"
        );

        tokio::spawn(drive(
            session,
            self.clone(),
            cancel.clone(),
            tx,
        ));

        let handle = SessionHandle {
            id,
            cancel,
            state: rx,
        };
        match entry {
            Entry::Occupied(ref mut occupied) => {
                occupied.insert(handle);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(handle);
            }
        }
        StartOutcome::Started(id)
    }

    /// Stop the target's running session, if any
    ///
    /// Once this returns the session issues no further actions, including the
    /// fallback removal. Calling it again is a no-op.
    pub fn stop(&self, target_id: UserId) -> bool {
        match self.sessions.get(&target_id) {
            Some(handle) if handle.is_live() => {
                handle.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Stop every running session, returning how many were stopped
    pub fn stop_all(&self) -> usize {
        let targets: Vec<UserId> = self.sessions.iter().map(|entry| *entry.key()).collect();
        targets.into_iter().filter(|target| self.stop(*target)).count()
    }

    #[must_use]
    pub fn is_running(&self, target_id: UserId) -> bool {
        self.sessions
            .get(&target_id)
            .is_some_and(|handle| handle.is_live())
    }

    /// Latest known state of the target's session, running or finished
    #[must_use]
    pub fn session(&self, target_id: UserId) -> Option<DisciplineSession> {
        if let Some(handle) = self.sessions.get(&target_id) {
            return Some(handle.state.borrow().clone());
        }
        self.finished.get(&target_id).map(|entry| entry.value().clone())
    }

    fn retire(&self, session: DisciplineSession) {
        let (id, target_id) = (session.id, session.target_id);
        self.finished.insert(target_id, session);
        self.sessions.remove_if(&target_id, |_, handle| handle.id == id);
    }
}

/// Scheduler task for one session
async fn drive(
    mut session: DisciplineSession,
    controller: DisciplineController,
    cancel: CancellationToken,
    publish: watch::Sender<DisciplineSession>,
) {
    let settings = controller.settings;
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                session.stop(StopReason::Cancelled);
                break;
            }
            () = tokio::time::sleep(session.interval) => {}
        }

        // An in-flight tick is abandoned at its next await once cancelled
        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            outcome = session.tick(
                controller.topology.as_ref(),
                controller.actions.as_ref(),
                &settings,
            ) => Some(outcome),
        };
        let Some(outcome) = outcome else {
            session.stop(StopReason::Cancelled);
            break;
        };
        publish.send_replace(session.clone());

        match outcome {
            TickOutcome::Moved | TickOutcome::Missed | TickOutcome::Skipped => {}
            TickOutcome::Cooldown => {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => {
                        session.stop(StopReason::Cancelled);
                        break;
                    }
                    () = tokio::time::sleep(settings.cooldown()) => {}
                }
            }
            TickOutcome::Stopped(reason) => {
                if reason.falls_back_to_removal() {
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => {}
                        () = fallback_removal(&session, controller.actions.as_ref()) => {}
                    }
                }
                break;
            }
        }
    }

    publish.send_replace(session.clone());
    controller.retire(session);
}

async fn fallback_removal(session: &DisciplineSession, actions: &dyn VoiceActions) {
    match actions
        .remove_from_voice(session.guild_id, session.target_id, reason::DISCIPLINE_FALLBACK)
        .await
    {
        Ok(()) => info!(
            target: ENFORCEMENT_TARGET,
            session_id = %session.id,
            user_id = %session.target_id,
            event = "discipline_fallback",
            "Removed target from voice after discipline ended"
        ),
        Err(e) => error!(
            target: ENFORCEMENT_TARGET,
            session_id = %session.id,
            user_id = %session.target_id,
            error = %e,
            "Fallback removal failed"
        ),
    }
}
