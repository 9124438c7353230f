//! Telegram bot adapter for Ward calls.
//!
//! Delivers calls to recipients without a live socket, maps inline-keyboard
//! callbacks back onto the reconciler and tells linked recipients how their
//! pending calls ended.

pub mod callback;
pub mod link_directory;
pub mod status_observer;
pub mod telegram;

pub use callback::{
    apply_bot_callback, parse_telegram_callback_update, BotCallbackAction, BotCallbackError,
    BotCallbackOutcome, TelegramCallback,
};
pub use link_directory::BotLinkDirectory;
pub use status_observer::TelegramStatusObserver;
pub use telegram::{
    BotDeliveryError, TelegramBotConfig, TelegramBotMode, TelegramBotTransport,
    TelegramDeliveryReceipt,
};
