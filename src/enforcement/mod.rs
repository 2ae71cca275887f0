//! Enforcement system for Voice Warden
//!
//! Everything that decides what happens to the target lives here. The
//! platform is reached only through [`VoiceTopology`] and [`VoiceActions`],
//! which the bot implements on top of the serenity cache and HTTP client.

pub mod action;
pub mod discipline;
pub mod engine;
mod error;
pub mod quota;
mod state;
pub mod topology;

#[cfg(test)]
pub(crate) mod testing;

pub use action::{ActionKind, VoiceActions};
pub use discipline::{
    DisciplineController, DisciplineSession, DisciplineSettings, SessionStatus, StartOutcome,
    StopReason,
};
pub use engine::{EnforcementOutcome, ModerationEngine, PresenceChange, Trigger};
pub use error::{ActionError, ActionResult};
pub use quota::{QuotaBreach, QuotaEnforcement, QuotaTracker, SpeakingActivity, SpeechQuota};
pub use state::{ModerationMode, ModerationState, Toggle};
pub use topology::{ChannelSnapshot, PermissionGrant, VoicePresence, VoiceTopology};
