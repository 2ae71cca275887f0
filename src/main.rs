use poise::serenity_prelude::{self as serenity};
use serenity::GatewayIntents;
use songbird::SerenityInit;
use songbird::driver::DecodeMode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use voice_warden::{BotConfig, Data, ERROR_TARGET, Error, commands, handlers, health, logging};

/// Main function to run the bot
async fn async_main() -> Result<(), Error> {
    logging::init()?;

    let config = BotConfig::load().await?;
    info!(
        target_user_id = %config.target_user_id,
        port = config.port,
        "Configuration loaded"
    );

    let shutdown = CancellationToken::new();
    let health_task = {
        let port = config.port;
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = health::serve(port, shutdown).await {
                error!(target: ERROR_TARGET, error = %e, "Health server failed");
            }
        })
    };

    let framework = poise::Framework::builder()
        .options(poise::FrameworkOptions {
            commands: commands::all(),
            command_check: Some(|ctx| Box::pin(commands::not_target(ctx))),
            pre_command: |ctx| {
                Box::pin(async move {
                    logging::log_command_start(ctx);
                })
            },
            post_command: |ctx| {
                Box::pin(async move {
                    logging::log_command_end(ctx);
                })
            },
            on_error: |error| {
                Box::pin(async move {
                    logging::log_command_error(&error);
                })
            },
            ..Default::default()
        })
        .setup(|ctx, _ready, framework| {
            Box::pin(async move {
                logging::log_console("Registering commands globally".to_string());
                poise::builtins::register_globally(ctx, &framework.options().commands).await?;
                let data = Data::from_context(ctx)
                    .await
                    .ok_or("shared data was not initialised")?;
                commands::update_presence(ctx, &data);
                Ok(data)
            })
        })
        .build();

    // Voice states drive enforcement; songbird needs them to join calls
    let intents = GatewayIntents::non_privileged();
    let voice_config = songbird::Config::default().decode_mode(DecodeMode::Decrypt);
    let mut client = serenity::ClientBuilder::new(&config.token, intents)
        .event_handler(handlers::Handler)
        .framework(framework)
        .register_songbird_from_config(voice_config)
        .await?;

    // Handlers and the framework read the same Data out of the type map
    let data = Data::new(config, client.cache.clone(), client.http.clone());
    client.data.write().await.insert::<Data>(data);

    let shard_manager = client.shard_manager.clone();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            signal_shutdown.cancel();
            shard_manager.shutdown_all().await;
        }
    });

    info!("Starting bot...");
    let result = client.start().await;
    shutdown.cancel();
    if let Err(e) = health_task.await {
        error!(target: ERROR_TARGET, error = %e, "Health server task panicked");
    }
    result?;
    Ok(())
}

fn main() {
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Error building runtime: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = runtime.block_on(async_main()) {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}
