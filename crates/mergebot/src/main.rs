use anyhow::Result;
use dotenvy::dotenv;
use std::sync::Arc;
use std::time::Duration;
use teloxide::prelude::*;
use tokio::time::{interval, sleep};

use mergebot::cli::{Cli, Commands};
use mergebot::telegram::admin::format_stats;
use mergebot::telegram::{create_bot, schema, setup_bot_commands, HandlerDeps, TelegramTransport};
use mergecore::core::{init_logger, log_startup_configuration};
use mergecore::merge::FfmpegMerger;
use mergecore::service::{ServiceParts, ServiceStats};
use mergecore::staging::StagingArea;
use mergecore::storage::logs::{global_stats, top_users};
use mergecore::storage::{create_pool, get_connection};
use mergecore::{MergeService, Settings};

/// Main entry point for the bot
///
/// Parses CLI arguments and dispatches to the subcommand; no subcommand
/// runs the bot.
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();

    // Log panics in spawned tasks instead of losing them silently
    std::panic::set_hook(Box::new(|panic_info| {
        log::error!("Panic caught: {:?}", panic_info);
        if let Some(location) = panic_info.location() {
            log::error!("Panic at {}:{}:{}", location.file(), location.line(), location.column());
        }
        if let Some(msg) = panic_info.payload().downcast_ref::<&str>() {
            log::error!("Panic message: {}", msg);
        }
    }));

    // Load environment variables from .env if present
    let _ = dotenv();

    let settings = Arc::new(Settings::load()?);
    init_logger(&settings.log_file_path, settings.log_level)?;

    match cli.command {
        Some(Commands::Run) | None => run_bot(settings).await,
        Some(Commands::CheckConfig) => {
            println!("{:#?}", settings);
            println!("✅ Configuration is valid");
            Ok(())
        }
        Some(Commands::Stats { top }) => print_stats(&settings, top),
    }
}

/// Prints the same statistics as /stats, straight from the database
fn print_stats(settings: &Settings, top: usize) -> Result<()> {
    let pool = create_pool(&settings.database_url).map_err(|e| anyhow::anyhow!("Failed to create database pool: {}", e))?;
    let conn = get_connection(&pool)?;
    let stats = ServiceStats {
        global: global_stats(&conn, chrono::Utc::now())?,
        active_sessions: 0,
        top_users: top_users(&conn, top)?,
    };
    println!("{}", format_stats(&stats));
    Ok(())
}

async fn run_bot(settings: Arc<Settings>) -> Result<()> {
    let bot_init_start = std::time::Instant::now();
    log::info!("Starting bot...");
    log_startup_configuration(&settings);

    if !FfmpegMerger::from_settings(&settings).is_available().await {
        log::warn!("⚠️ {} is not runnable, every merge will fail until it is installed", settings.ffmpeg_bin);
    }

    // Leftovers of a previous run belong to sessions that no longer exist
    match StagingArea::new(settings.staging_root()).purge_all().await {
        Ok(0) => {}
        Ok(count) => log::info!("Removed {} stale staging director(ies)", count),
        Err(e) => log::warn!("Failed to clean the staging directory: {}", e),
    }

    let db_pool = Arc::new(
        create_pool(&settings.database_url).map_err(|e| anyhow::anyhow!("Failed to create database pool: {}", e))?,
    );

    let bot = create_bot(&settings)?;

    // Retry while a local Bot API server is still starting up
    let bot_info = {
        let startup_max_retries = 60;
        let mut startup_retry = 0;
        loop {
            match bot.get_me().await {
                Ok(info) => break info,
                Err(e) => {
                    let is_retryable = matches!(
                        e,
                        teloxide::RequestError::Network(_) | teloxide::RequestError::Io(_)
                    ) || e.to_string().contains("restart");

                    startup_retry += 1;
                    if startup_retry >= startup_max_retries || !is_retryable {
                        return Err(anyhow::anyhow!(
                            "Failed to connect to Bot API after {} retries: {}",
                            startup_retry,
                            e
                        ));
                    }

                    log::warn!(
                        "Bot API not ready (attempt {}/{}): {}. Retrying in 5 seconds...",
                        startup_retry,
                        startup_max_retries,
                        e
                    );
                    sleep(Duration::from_secs(5)).await;
                }
            }
        }
    };
    let bot_username = bot_info.username.clone();
    let bot_id = bot_info.id;
    log::info!("Bot username: {:?}, Bot ID: {}", bot_username, bot_id);

    if let Err(e) = setup_bot_commands(&bot).await {
        log::warn!("Failed to register bot commands: {}", e);
    }

    let http = reqwest::Client::builder().timeout(settings.request_timeout).build()?;
    let transport = Arc::new(TelegramTransport::new(bot.clone(), http));
    let parts = ServiceParts::production(&settings, transport.clone(), transport.clone(), transport)?;
    let service = Arc::new(MergeService::new(Arc::clone(&settings), Arc::clone(&db_pool), parts));

    // Expire sessions nobody touched within the idle timeout
    let sweeper = Arc::clone(&service);
    let sweep_every = settings.session_sweep_interval;
    tokio::spawn(async move {
        let mut interval = interval(sweep_every);
        loop {
            interval.tick().await;
            let expired = sweeper.sweep_idle().await;
            if expired > 0 {
                log::info!("Expired {} idle session(s)", expired);
            }
        }
    });

    let handler_deps = HandlerDeps::new(Arc::clone(&service), bot_username, bot_id);
    let handler = schema(handler_deps);

    log::info!("================================================");
    log::info!(
        "🎉 Bot initialization complete in {:.2}s",
        bot_init_start.elapsed().as_secs_f64()
    );
    log::info!("📡 Ready to receive updates!");
    log::info!("================================================");

    let listener = teloxide::update_listeners::Polling::builder(bot.clone())
        .drop_pending_updates()
        .build();

    Dispatcher::builder(bot, handler)
        .dependencies(DependencyMap::new())
        .enable_ctrlc_handler()
        .build()
        .dispatch_with_listener(
            listener,
            LoggingErrorHandler::with_custom_text("An error from the update listener"),
        )
        .await;

    log::info!("Dispatcher shutdown gracefully");
    Ok(())
}
