use crate::enforcement::{
    DisciplineSession, ModerationMode, ModerationState, SessionStatus, SpeechQuota, Toggle,
};
use crate::{COMMAND_TARGET, Context, Data, Error, listener};
use poise::serenity_prelude::{self as serenity, ActivityData, OnlineStatus, UserId};
use poise::{ChoiceParameter, command};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ChoiceParameter)]
pub enum WkAction {
    #[name = "on"]
    On,
    #[name = "off"]
    Off,
    #[name = "check"]
    Check,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ChoiceParameter)]
pub enum ModeChoice {
    #[name = "kick"]
    Kick,
    #[name = "discipline"]
    Discipline,
}

impl From<ModeChoice> for ModerationMode {
    fn from(choice: ModeChoice) -> Self {
        match choice {
            ModeChoice::Kick => Self::Kick,
            ModeChoice::Discipline => Self::Discipline,
        }
    }
}

pub const LOCKED_OUT: &str = "🚫 You cannot control this bot!";

/// Framework-wide check: the moderated user cannot drive the bot
///
/// # Errors
/// Returns an error if the lock-out reply cannot be sent.
pub async fn not_target(ctx: Context<'_>) -> Result<bool, Error> {
    if !ctx.data().engine.state().is_target(ctx.author().id) {
        return Ok(true);
    }
    ctx.send(
        poise::CreateReply::default()
            .content(LOCKED_OUT)
            .ephemeral(true),
    )
    .await?;
    Ok(false)
}

/// Display name for a user from the cache, or the raw id
#[must_use]
pub fn user_label(cache: &serenity::Cache, user_id: UserId) -> String {
    cache
        .user(user_id)
        .map_or_else(|| format!("User ID: {user_id}"), |user| user.tag())
}

/// Presence shown while moderation is on or off
#[must_use]
pub fn presence_for(enabled: bool, target: &str) -> (ActivityData, OnlineStatus) {
    if enabled {
        (
            ActivityData::custom(format!("👁️ Watching {target}")),
            OnlineStatus::Online,
        )
    } else {
        (ActivityData::custom("😴 Sleeping"), OnlineStatus::Idle)
    }
}

pub fn update_presence(ctx: &serenity::Context, data: &Data) {
    let state = data.engine.state();
    let name = ctx
        .cache
        .user(state.target_id)
        .map_or_else(|| state.target_id.to_string(), |user| user.name.clone());
    let (activity, status) = presence_for(state.enabled, &name);
    ctx.set_presence(Some(activity), status);
    info!(
        target: COMMAND_TARGET,
        enabled = state.enabled,
        "Presence updated"
    );
}

#[must_use]
pub fn toggle_reply(enabled: bool, toggle: Toggle) -> String {
    let label = if enabled { "ENABLED" } else { "DISABLED" };
    match (toggle, enabled) {
        (Toggle::Unchanged, _) => format!("⚠️ Voice kick bot is already **{label}**!"),
        (Toggle::Changed, true) => format!("✅ Voice kick bot is now **{label}**"),
        (Toggle::Changed, false) => format!("🛑 Voice kick bot is now **{label}**"),
    }
}

#[must_use]
pub fn mode_reply(mode: ModerationMode, toggle: Toggle) -> String {
    match toggle {
        Toggle::Changed => format!("🔀 Moderation mode is now **{mode}**"),
        Toggle::Unchanged => format!("⚠️ Moderation mode is already **{mode}**!"),
    }
}

#[must_use]
pub fn status_reply(
    state: &ModerationState,
    target: &str,
    session: Option<&DisciplineSession>,
) -> String {
    let status = if state.enabled {
        "**ENABLED** ✅"
    } else {
        "**DISABLED** 🛑"
    };
    let mut reply = format!(
        "📊 **Bot Status:** {status}\n🎛️ **Mode:** {}\n👤 **Target User:** {target}",
        state.mode
    );
    if let Some(session) = session {
        let line = match session.status {
            SessionStatus::Running => format!(
                "\n🔁 **Discipline:** running, {} move(s), every {}ms",
                session.move_count,
                session.interval.as_millis()
            ),
            SessionStatus::Stopped(reason) => format!(
                "\n🔁 **Discipline:** stopped ({reason}) after {} move(s)",
                session.move_count
            ),
        };
        reply.push_str(&line);
    }
    reply
}

#[must_use]
pub fn quota_reply(quota: Option<&SpeechQuota>, target: &str, lifetime: u64) -> String {
    match quota {
        Some(quota) if quota.enabled => format!(
            "🎙️ **Speaking quota:** {}/{} for {target}\n⏱️ **Timeout:** {}s\n📈 **Lifetime turns:** {lifetime}",
            quota.count,
            quota.limit,
            quota.timeout.as_secs()
        ),
        _ => "🎙️ **Speaking quota:** off".to_string(),
    }
}

/// Reply for `/bmp start`; `joined` is `None` when the target is not in voice
#[must_use]
pub fn quota_start_reply(target: &str, limit: u32, joined: Option<Result<(), String>>) -> String {
    let mut reply =
        format!("🎙️ Speaking quota started for {target}: timeout after **{limit}** turn(s)");
    match joined {
        Some(Ok(())) => {}
        Some(Err(e)) => reply.push_str(&format!("\n⚠️ Could not join voice: {e}")),
        None => reply.push_str("\n💤 Not in voice yet; listening starts when they join"),
    }
    reply
}

/// Voice kick bot control
#[command(slash_command, guild_only)]
pub async fn wk(
    ctx: Context<'_>,
    #[description = "Turn the bot on/off or check status"] action: WkAction,
) -> Result<(), Error> {
    let data = ctx.data();
    let reply = match action {
        WkAction::On | WkAction::Off => {
            let enabled = action == WkAction::On;
            let toggle = data.engine.set_enabled(enabled).await;
            if toggle.changed() {
                update_presence(ctx.serenity_context(), data);
            }
            toggle_reply(enabled, toggle)
        }
        WkAction::Check => {
            let state = data.engine.state();
            let target = user_label(ctx.cache(), state.target_id);
            let session = data.engine.discipline().session(state.target_id);
            status_reply(&state, &target, session.as_ref())
        }
    };
    ctx.say(reply).await?;
    Ok(())
}

/// Choose between kicking and discipline
#[command(slash_command, guild_only)]
pub async fn wkmode(
    ctx: Context<'_>,
    #[description = "Enforcement mode"] mode: ModeChoice,
) -> Result<(), Error> {
    let mode = ModerationMode::from(mode);
    let toggle = ctx.data().engine.set_mode(mode);
    ctx.say(mode_reply(mode, toggle)).await?;
    Ok(())
}

/// Speaking quota
#[command(
    slash_command,
    guild_only,
    subcommands("bmp_start", "bmp_stop", "bmp_reset", "bmp_status"),
    subcommand_required
)]
pub async fn bmp(_ctx: Context<'_>) -> Result<(), Error> {
    Ok(())
}

/// Start counting a user's speaking turns
#[command(slash_command, guild_only, rename = "start")]
pub async fn bmp_start(
    ctx: Context<'_>,
    #[description = "Turns allowed before a timeout"]
    #[min = 1]
    limit: u32,
    #[description = "User to watch (defaults to the target)"] user: Option<serenity::User>,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("guild only")?;
    let data = ctx.data();
    let target_id = user.map_or(data.engine.state().target_id, |user| user.id);
    let quota = data
        .quota
        .start(guild_id, target_id, limit, data.config.quota_timeout());

    let presence = data
        .engine
        .topology()
        .voice_presence(guild_id, target_id)
        .await;
    let joined = match presence {
        Some(presence) => Some(
            listener::follow(ctx.serenity_context(), data, guild_id, presence.channel_id)
                .await
                .map_err(|e| {
                    warn!(
                        target: COMMAND_TARGET,
                        guild_id = %guild_id,
                        error = %e,
                        "Could not join voice for the speaking quota"
                    );
                    e.to_string()
                }),
        ),
        None => None,
    };
    let target = user_label(ctx.cache(), target_id);
    ctx.say(quota_start_reply(&target, quota.limit, joined)).await?;
    Ok(())
}

/// Stop counting
#[command(slash_command, guild_only, rename = "stop")]
pub async fn bmp_stop(ctx: Context<'_>) -> Result<(), Error> {
    let reply = match ctx.data().quota.stop() {
        Some(quota) => {
            listener::leave(ctx.serenity_context(), quota.guild_id).await;
            format!("🛑 Speaking quota stopped at {}/{}", quota.count, quota.limit)
        }
        None => "⚠️ Speaking quota is not running!".to_string(),
    };
    ctx.say(reply).await?;
    Ok(())
}

/// Reset the turn counter
#[command(slash_command, guild_only, rename = "reset")]
pub async fn bmp_reset(ctx: Context<'_>) -> Result<(), Error> {
    let reply = if ctx.data().quota.reset() {
        "🔄 Speaking quota counter reset"
    } else {
        "⚠️ Speaking quota is not running!"
    };
    ctx.say(reply).await?;
    Ok(())
}

/// Show the quota counter
#[command(slash_command, guild_only, rename = "status")]
pub async fn bmp_status(ctx: Context<'_>) -> Result<(), Error> {
    let data = ctx.data();
    let quota = data.quota.status();
    let reply = match &quota {
        Some(quota) => quota_reply(
            Some(quota),
            &user_label(ctx.cache(), quota.target_id),
            data.quota.activity().count(quota.target_id),
        ),
        None => quota_reply(None, "", 0),
    };
    ctx.say(reply).await?;
    Ok(())
}

/// Every command the framework registers
#[must_use]
pub fn all() -> Vec<poise::Command<Data, Error>> {
    vec![wk(), wkmode(), bmp()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enforcement::StopReason;
    use chrono::Utc;
    use poise::serenity_prelude::{ActivityType, ChannelId, GuildId};
    use std::time::Duration;
    use uuid::Uuid;

    fn state(enabled: bool, mode: ModerationMode) -> ModerationState {
        let mut state = ModerationState::new(UserId::new(42));
        state.set_enabled(enabled);
        state.set_mode(mode);
        state
    }

    fn session(status: SessionStatus) -> DisciplineSession {
        DisciplineSession {
            id: Uuid::new_v4(),
            guild_id: GuildId::new(1),
            target_id: UserId::new(42),
            original_channel_id: ChannelId::new(10),
            current_channel_id: ChannelId::new(11),
            move_count: 3,
            interval: Duration::from_millis(750),
            rate_limit_strikes: 0,
            status,
            started_at: Utc::now(),
        }
    }

    #[test]
    fn test_toggle_replies() {
        assert_eq!(
            toggle_reply(true, Toggle::Changed),
            "✅ Voice kick bot is now **ENABLED**"
        );
        assert_eq!(
            toggle_reply(true, Toggle::Unchanged),
            "⚠️ Voice kick bot is already **ENABLED**!"
        );
        assert_eq!(
            toggle_reply(false, Toggle::Changed),
            "🛑 Voice kick bot is now **DISABLED**"
        );
        assert_eq!(
            toggle_reply(false, Toggle::Unchanged),
            "⚠️ Voice kick bot is already **DISABLED**!"
        );
    }

    #[test]
    fn test_mode_replies() {
        assert_eq!(
            mode_reply(ModerationMode::Discipline, Toggle::Changed),
            "🔀 Moderation mode is now **DISCIPLINE**"
        );
        assert_eq!(
            mode_reply(ModerationMode::Kick, Toggle::Unchanged),
            "⚠️ Moderation mode is already **KICK**!"
        );
    }

    #[test]
    fn test_status_reply() {
        let reply = status_reply(&state(true, ModerationMode::Kick), "karl#0001", None);
        assert_eq!(
            reply,
            "📊 **Bot Status:** **ENABLED** ✅\n🎛️ **Mode:** KICK\n👤 **Target User:** karl#0001"
        );

        let reply = status_reply(&state(false, ModerationMode::Kick), "User ID: 42", None);
        assert!(reply.contains("**DISABLED** 🛑"));
        assert!(reply.contains("User ID: 42"));
    }

    #[test]
    fn test_status_reply_with_session() {
        let running = session(SessionStatus::Running);
        let reply = status_reply(
            &state(true, ModerationMode::Discipline),
            "karl",
            Some(&running),
        );
        assert!(reply.contains("running, 3 move(s), every 750ms"));

        let stopped = session(SessionStatus::Stopped(StopReason::Undeafened));
        let reply = status_reply(
            &state(true, ModerationMode::Discipline),
            "karl",
            Some(&stopped),
        );
        assert!(reply.contains("stopped (undeafened) after 3 move(s)"));
    }

    #[test]
    fn test_quota_reply() {
        let quota = SpeechQuota {
            guild_id: GuildId::new(1),
            target_id: UserId::new(42),
            limit: 5,
            count: 2,
            timeout: Duration::from_secs(60),
            enabled: true,
        };
        let reply = quota_reply(Some(&quota), "karl", 17);
        assert!(reply.contains("2/5 for karl"));
        assert!(reply.contains("60s"));
        assert!(reply.contains("17"));

        let stopped = SpeechQuota {
            enabled: false,
            ..quota
        };
        assert_eq!(
            quota_reply(Some(&stopped), "karl", 17),
            "🎙️ **Speaking quota:** off"
        );
        assert_eq!(quota_reply(None, "", 0), "🎙️ **Speaking quota:** off");
    }

    #[test]
    fn test_quota_start_reply_reports_join_failure() {
        let reply = quota_start_reply("karl", 3, Some(Ok(())));
        assert_eq!(
            reply,
            "🎙️ Speaking quota started for karl: timeout after **3** turn(s)"
        );

        let reply = quota_start_reply(
            "karl",
            3,
            Some(Err("songbird voice client is not registered".to_string())),
        );
        assert!(reply.starts_with("🎙️ Speaking quota started for karl"));
        assert!(reply.ends_with("\n⚠️ Could not join voice: songbird voice client is not registered"));

        let reply = quota_start_reply("karl", 3, None);
        assert!(reply.ends_with("listening starts when they join"));
    }

    #[test]
    fn test_presence() {
        let (activity, status) = presence_for(true, "Karl");
        assert_eq!(status, OnlineStatus::Online);
        assert_eq!(activity.kind, ActivityType::Custom);
        assert_eq!(activity.state.as_deref(), Some("👁️ Watching Karl"));

        let (activity, status) = presence_for(false, "Karl");
        assert_eq!(status, OnlineStatus::Idle);
        assert_eq!(activity.state.as_deref(), Some("😴 Sleeping"));
    }

    #[test]
    fn test_user_label_falls_back_to_id() {
        let cache = serenity::Cache::new();
        assert_eq!(user_label(&cache, UserId::new(42)), "User ID: 42");
    }

    #[test]
    fn test_mode_choice_conversion() {
        assert_eq!(ModerationMode::from(ModeChoice::Kick), ModerationMode::Kick);
        assert_eq!(
            ModerationMode::from(ModeChoice::Discipline),
            ModerationMode::Discipline
        );
    }

    #[test]
    fn test_command_definitions() {
        let wk = wk();
        assert_eq!(wk.name, "wk");
        assert!(wk.guild_only);
        assert!(wk.create_as_slash_command().is_some());

        let bmp = bmp();
        let names: Vec<&str> = bmp.subcommands.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["start", "stop", "reset", "status"]);
        assert!(bmp.subcommand_required);

        assert_eq!(all().len(), 3);
    }
}
