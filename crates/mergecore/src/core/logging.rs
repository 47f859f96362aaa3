//! Logging initialization and startup diagnostics
//!
//! This module provides:
//! - Logger initialization (console + file)
//! - A one-shot summary of which optional features are enabled

use anyhow::Result;
use simplelog::*;
use std::fs::File;

use crate::core::config::Settings;

/// Initialize logger for both console and file output
///
/// # Arguments
/// * `log_file_path` - Path to the log file
/// * `level` - Maximum level written by both sinks
///
/// # Returns
/// * `Ok(())` - Logger initialized successfully
/// * `Err(anyhow::Error)` - Failed to create the file or a logger was already set
pub fn init_logger(log_file_path: &str, level: LevelFilter) -> Result<()> {
    let log_file = File::create(log_file_path).map_err(|e| anyhow::anyhow!("Failed to create log file: {}", e))?;

    let config = ConfigBuilder::new()
        .add_filter_ignore_str("hyper")
        .add_filter_ignore_str("reqwest")
        .add_filter_ignore_str("rustls")
        .build();

    CombinedLogger::init(vec![
        TermLogger::new(level, config.clone(), TerminalMode::Mixed, ColorChoice::Auto),
        WriteLogger::new(level, config, log_file),
    ])
    .map_err(|e| anyhow::anyhow!("Failed to initialize logger: {}", e))?;

    Ok(())
}

/// Logs which optional features the loaded settings switch on.
pub fn log_startup_configuration(settings: &Settings) {
    log::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    log::info!("⚙️  {} configuration", settings.bot_name);
    log::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    log::info!("👑 Owner: {}, admins: {}", settings.owner_id, settings.admin_ids.len());
    log::info!("🗄️  Database: {}", settings.database_url);
    if let Some(name) = &settings.database_name {
        log::info!("   DATABASE_NAME={} is ignored by the SQLite backend", name);
    }
    log::info!("📂 Staging directory: {}", settings.staging_dir.display());

    match &settings.force_sub_channel {
        Some(channel) => log::info!("✅ Force-subscribe: {}", channel),
        None => log::info!("➖ Force-subscribe: disabled"),
    }
    if settings.authorized_chats.is_empty() {
        log::info!("➖ No statically authorized group chats");
    } else {
        log::info!("✅ Statically authorized chats: {:?}", settings.authorized_chats);
    }
    match settings.log_channel {
        Some(id) => log::info!("✅ New-user log channel: {}", id),
        None => log::info!("➖ New-user log channel: disabled"),
    }
    match settings.merge_log_channel {
        Some(id) => log::info!("✅ Merge log channel: {}", id),
        None => log::info!("➖ Merge log channel: disabled"),
    }
    if settings.gofile_token.is_some() {
        log::info!("✅ GoFile: account token configured");
    } else {
        log::info!("➖ GoFile: anonymous uploads");
    }
    match &settings.bot_api_url {
        Some(url) => log::info!("✅ Bot API server: {}", url),
        None => log::info!("➖ Bot API server: api.telegram.org"),
    }
    log::info!(
        "🎬 ffmpeg: {} / {} (preset {}, crf {}, timeout {}s)",
        settings.ffmpeg_bin,
        settings.ffprobe_bin,
        settings.merge_preset,
        settings.merge_crf,
        settings.merge_timeout.as_secs()
    );
    log::info!(
        "📤 Upload ceiling: {}",
        crate::core::utils::format_file_size(settings.max_upload_bytes)
    );
    log::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
}
