//! Speaking quota
//!
//! Counts speaking turns per user and, once the monitored target reaches the
//! configured limit, times them out or removes them from voice. The quota is
//! recurring: a successful enforcement resets the count and monitoring goes
//! on.

use crate::ENFORCEMENT_TARGET;
use crate::enforcement::VoiceActions;
use crate::enforcement::action::reason;
use dashmap::{DashMap, DashSet};
use poise::serenity_prelude::{GuildId, UserId};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{error, info, warn};

/// Quota configuration and running count for one target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeechQuota {
    pub guild_id: GuildId,
    pub target_id: UserId,
    pub limit: u32,
    pub count: u32,
    pub timeout: Duration,
    pub enabled: bool,
}

impl SpeechQuota {
    #[must_use]
    pub fn is_exceeded(&self) -> bool {
        self.count >= self.limit
    }
}

/// A quota limit was reached and should be enforced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaBreach {
    pub guild_id: GuildId,
    pub target_id: UserId,
    pub count: u32,
    pub timeout: Duration,
}

/// Which action ended up enforcing a breach
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaEnforcement {
    TimedOut,
    Removed,
    Failed,
}

/// Lifetime speaking statistics
#[derive(Debug, Default)]
pub struct SpeakingActivity {
    counts: DashMap<UserId, u64>,
    speaking: DashSet<UserId>,
}

impl SpeakingActivity {
    /// Record a speaking transition; returns whether a new turn started
    pub fn record(&self, user_id: UserId, was_speaking: bool, is_speaking: bool) -> bool {
        match (was_speaking, is_speaking) {
            (false, true) => {
                self.speaking.insert(user_id);
                *self.counts.entry(user_id).or_insert(0) += 1;
                true
            }
            (true, false) => {
                self.speaking.remove(&user_id);
                false
            }
            _ => false,
        }
    }

    #[must_use]
    pub fn count(&self, user_id: UserId) -> u64 {
        self.counts.get(&user_id).map_or(0, |count| *count)
    }

    #[must_use]
    pub fn is_speaking(&self, user_id: UserId) -> bool {
        self.speaking.contains(&user_id)
    }
}

/// Speaking quota tracker
pub struct QuotaTracker {
    activity: SpeakingActivity,
    quota: Mutex<Option<SpeechQuota>>,
    enforcing: AtomicBool,
    actions: Arc<dyn VoiceActions>,
}

impl QuotaTracker {
    #[must_use]
    pub fn new(actions: Arc<dyn VoiceActions>) -> Self {
        Self {
            activity: SpeakingActivity::default(),
            quota: Mutex::new(None),
            enforcing: AtomicBool::new(false),
            actions,
        }
    }

    fn quota(&self) -> MutexGuard<'_, Option<SpeechQuota>> {
        self.quota.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn activity(&self) -> &SpeakingActivity {
        &self.activity
    }

    /// Copy of the current quota, if monitoring was ever started
    #[must_use]
    pub fn status(&self) -> Option<SpeechQuota> {
        self.quota().clone()
    }

    /// Start monitoring `target_id`, replacing any previous quota
    pub fn start(&self, guild_id: GuildId, target_id: UserId, limit: u32, timeout: Duration) -> SpeechQuota {
        let quota = SpeechQuota {
            guild_id,
            target_id,
            limit: limit.max(1),
            count: 0,
            timeout,
            enabled: true,
        };
        *self.quota() = Some(quota.clone());
        info!(
            target: ENFORCEMENT_TARGET,
            user_id = %target_id,
            guild_id = %guild_id,
            limit = quota.limit,
            timeout_secs = timeout.as_secs(),
            event = "quota_started",
            "Speech quota monitoring started"
        );
        quota
    }

    /// Stop monitoring; returns the quota that was active
    pub fn stop(&self) -> Option<SpeechQuota> {
        let stopped = self.quota().take();
        if let Some(quota) = &stopped {
            info!(
                target: ENFORCEMENT_TARGET,
                user_id = %quota.target_id,
                event = "quota_stopped",
                "Speech quota monitoring stopped"
            );
        }
        stopped
    }

    /// Reset the count to zero; returns false when no quota is active
    pub fn reset(&self) -> bool {
        match self.quota().as_mut() {
            Some(quota) => {
                quota.count = 0;
                true
            }
            None => false,
        }
    }

    /// Record a speaking transition
    ///
    /// Returns a breach when the monitored target reaches the limit and no
    /// other enforcement for the quota is in flight.
    pub fn on_speaking_change(
        &self,
        user_id: UserId,
        was_speaking: bool,
        is_speaking: bool,
    ) -> Option<QuotaBreach> {
        if !self.activity.record(user_id, was_speaking, is_speaking) {
            return None;
        }

        let breach = {
            let mut guard = self.quota();
            let quota = guard
                .as_mut()
                .filter(|quota| quota.enabled && quota.target_id == user_id)?;
            quota.count += 1;
            info!(
                target: ENFORCEMENT_TARGET,
                user_id = %user_id,
                count = quota.count,
                limit = quota.limit,
                "Target started speaking"
            );
            if !quota.is_exceeded() {
                return None;
            }
            QuotaBreach {
                guild_id: quota.guild_id,
                target_id: quota.target_id,
                count: quota.count,
                timeout: quota.timeout,
            }
        };

        if self
            .enforcing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!(
                target: ENFORCEMENT_TARGET,
                user_id = %user_id,
                "Quota enforcement already in progress, not starting another"
            );
            return None;
        }
        Some(breach)
    }

    /// Enforce a breach: timeout if allowed, otherwise removal from voice
    pub async fn enforce(&self, breach: QuotaBreach) -> QuotaEnforcement {
        let outcome = self.run_enforcement(breach).await;
        if outcome != QuotaEnforcement::Failed {
            self.reset_after_enforcement(breach.target_id);
        }
        self.enforcing.store(false, Ordering::Release);
        outcome
    }

    async fn run_enforcement(&self, breach: QuotaBreach) -> QuotaEnforcement {
        let QuotaBreach {
            guild_id,
            target_id,
            ..
        } = breach;

        if self.actions.can_suspend(guild_id, target_id).await {
            match self
                .actions
                .suspend(guild_id, target_id, breach.timeout, reason::SPEECH_QUOTA)
                .await
            {
                Ok(()) => {
                    info!(
                        target: ENFORCEMENT_TARGET,
                        user_id = %target_id,
                        guild_id = %guild_id,
                        count = breach.count,
                        timeout_secs = breach.timeout.as_secs(),
                        event = "quota_timeout",
                        "Timed out target for exceeding speech quota"
                    );
                    return QuotaEnforcement::TimedOut;
                }
                Err(e) => warn!(
                    target: ENFORCEMENT_TARGET,
                    user_id = %target_id,
                    error = %e,
                    "Timeout failed, falling back to voice removal"
                ),
            }
        } else {
            warn!(
                target: ENFORCEMENT_TARGET,
                user_id = %target_id,
                guild_id = %guild_id,
                "Not allowed to time out target, falling back to voice removal"
            );
        }

        match self
            .actions
            .remove_from_voice(guild_id, target_id, reason::SPEECH_QUOTA)
            .await
        {
            Ok(()) => {
                info!(
                    target: ENFORCEMENT_TARGET,
                    user_id = %target_id,
                    guild_id = %guild_id,
                    event = "quota_removed",
                    "Removed target from voice for exceeding speech quota"
                );
                QuotaEnforcement::Removed
            }
            Err(e) => {
                error!(
                    target: ENFORCEMENT_TARGET,
                    user_id = %target_id,
                    guild_id = %guild_id,
                    error = %e,
                    "Speech quota enforcement failed"
                );
                QuotaEnforcement::Failed
            }
        }
    }

    fn reset_after_enforcement(&self, target_id: UserId) {
        if let Some(quota) = self
            .quota()
            .as_mut()
            .filter(|quota| quota.target_id == target_id)
        {
            quota.count = 0;
        }
    }
}
