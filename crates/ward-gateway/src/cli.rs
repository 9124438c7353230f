use std::path::PathBuf;

use clap::Parser;
use ward_bot::TelegramBotMode;
use ward_call_runtime::DEFAULT_RESPONSE_WINDOW_MS;

fn parse_positive_u64(value: &str) -> Result<u64, String> {
    let parsed = value
        .parse::<u64>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

fn parse_telegram_mode(value: &str) -> Result<TelegramBotMode, String> {
    value.parse::<TelegramBotMode>().map_err(|error| error.to_string())
}

#[derive(Debug, Clone, Parser)]
#[command(
    name = "ward-gateway",
    about = "Departmental emergency-call dispatch gateway",
    version
)]
pub struct WardGatewayCli {
    #[arg(
        long,
        env = "WARD_BIND",
        default_value = "127.0.0.1:8790",
        help = "Socket address for HTTP and websocket traffic (host:port)"
    )]
    pub bind: String,

    #[arg(
        long,
        env = "WARD_DATABASE",
        default_value = ".ward/calls.sqlite3",
        help = "SQLite file holding call attempts"
    )]
    pub database: PathBuf,

    #[arg(
        long = "response-window-ms",
        env = "WARD_RESPONSE_WINDOW_MS",
        default_value_t = DEFAULT_RESPONSE_WINDOW_MS,
        value_parser = parse_positive_u64,
        help = "Milliseconds recipients have to answer before pending attempts time out"
    )]
    pub response_window_ms: u64,

    #[arg(
        long,
        env = "WARD_DIRECTORY",
        help = "JSON directory file with identities, bearer tokens and bot links"
    )]
    pub directory: Option<PathBuf>,

    #[arg(
        long = "state-dir",
        env = "WARD_STATE_DIR",
        default_value = ".ward",
        help = "Directory for the call audit log"
    )]
    pub state_dir: PathBuf,

    #[arg(
        long = "telegram-mode",
        env = "WARD_TELEGRAM_MODE",
        default_value = "dry_run",
        value_parser = parse_telegram_mode,
        help = "Telegram delivery mode: dry_run or provider"
    )]
    pub telegram_mode: TelegramBotMode,

    #[arg(
        long = "telegram-token",
        env = "WARD_TELEGRAM_TOKEN",
        hide_env_values = true,
        help = "Telegram bot token used in provider mode"
    )]
    pub telegram_token: Option<String>,

    #[arg(
        long = "telegram-api-base",
        env = "WARD_TELEGRAM_API_BASE",
        default_value = "https://api.telegram.org",
        help = "Base URL for the Telegram Bot API"
    )]
    pub telegram_api_base: String,

    #[arg(
        long = "telegram-webhook-secret",
        env = "WARD_TELEGRAM_WEBHOOK_SECRET",
        hide_env_values = true,
        help = "Secret expected in X-Telegram-Bot-Api-Secret-Token on callback webhooks"
    )]
    pub telegram_webhook_secret: Option<String>,
}
