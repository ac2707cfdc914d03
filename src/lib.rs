pub mod aggregate;
pub mod auth;
pub mod chat;
pub mod client;
pub mod constants;
pub mod encoder;
pub mod events;
pub mod frame;
pub mod hardening;
pub mod health;
pub mod logging;
pub mod main_helper;
pub mod reducer;
pub mod relay;
pub mod router;
pub mod server;
pub mod session;
pub mod store;
pub mod str_utils;
pub mod types;

pub use types::*;

pub use main_helper::{AppConfig, AppState, Cli, Command, ServeArgs};
