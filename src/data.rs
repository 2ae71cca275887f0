use std::{fmt, ops::Deref, sync::Arc};

use crate::config::BotConfig;
use crate::enforcement::{ModerationEngine, QuotaTracker, VoiceActions, VoiceTopology};
use crate::platform::SerenityVoice;
use poise::serenity_prelude as serenity;
use serenity::prelude::TypeMapKey;

/// Shared bot state
#[derive(Clone)]
pub struct Data(pub Arc<DataInner>);

// Implement TypeMapKey for Data to allow storing it in Serenity's data map
impl TypeMapKey for Data {
    type Value = Data;
}

impl fmt::Debug for Data {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Data")
            .field("config", &self.config)
            .field("moderation", &self.engine.state())
            .field("quota", &self.quota.status())
            .finish_non_exhaustive()
    }
}

impl Deref for Data {
    type Target = DataInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

pub struct DataInner {
    pub config: BotConfig,
    /// Enabled flag, mode and deafen enforcement
    pub engine: ModerationEngine,
    /// Speaking quota for `/bmp`
    pub quota: QuotaTracker,
}

impl Data {
    /// Wire the engine and quota tracker to the given platform provider
    #[must_use]
    pub fn with_provider(
        config: BotConfig,
        topology: Arc<dyn VoiceTopology>,
        actions: Arc<dyn VoiceActions>,
    ) -> Self {
        let engine = ModerationEngine::new(
            config.target_user_id,
            topology,
            Arc::clone(&actions),
            config.discipline,
        );
        let quota = QuotaTracker::new(actions);
        Self(Arc::new(DataInner {
            config,
            engine,
            quota,
        }))
    }

    /// Data backed by the live gateway cache and HTTP client
    #[must_use]
    pub fn new(config: BotConfig, cache: Arc<serenity::Cache>, http: Arc<serenity::Http>) -> Self {
        let voice = Arc::new(SerenityVoice::new(cache, http));
        Self::with_provider(config, voice.clone(), voice)
    }

    /// Fetch the shared data stored in serenity's type map
    pub async fn from_context(ctx: &serenity::Context) -> Option<Self> {
        ctx.data.read().await.get::<Data>().cloned()
    }
}
