//! Moderation state store
//!
//! Holds the enabled flag, the enforcement mode and the designated target.
//! Setters are idempotent and report whether anything changed.

use derive_more::Display;
use poise::serenity_prelude::UserId;
use serde::{Deserialize, Serialize};

/// How a trigger is enforced
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
pub enum ModerationMode {
    /// Disconnect from voice right away
    #[default]
    #[display("KICK")]
    Kick,
    /// Bounce the target between empty channels until they undeafen
    #[display("DISCIPLINE")]
    Discipline,
}

/// Result of an idempotent setter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Toggle {
    Changed,
    Unchanged,
}

impl Toggle {
    #[must_use]
    pub fn changed(self) -> bool {
        self == Self::Changed
    }
}

/// Current moderation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModerationState {
    pub enabled: bool,
    pub mode: ModerationMode,
    pub target_id: UserId,
}

impl ModerationState {
    /// Defaults: enabled, kick mode
    #[must_use]
    pub fn new(target_id: UserId) -> Self {
        Self {
            enabled: true,
            mode: ModerationMode::Kick,
            target_id,
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) -> Toggle {
        if self.enabled == enabled {
            return Toggle::Unchanged;
        }
        self.enabled = enabled;
        Toggle::Changed
    }

    pub fn set_mode(&mut self, mode: ModerationMode) -> Toggle {
        if self.mode == mode {
            return Toggle::Unchanged;
        }
        self.mode = mode;
        Toggle::Changed
    }

    #[must_use]
    pub fn is_target(&self, user_id: UserId) -> bool {
        self.target_id == user_id
    }
}
