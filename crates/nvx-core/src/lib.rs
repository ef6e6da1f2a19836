//! Credential lifecycle and access-control core for the NOVAXA Telegram bot.
//!
//! This crate is intentionally transport-agnostic. Telegram lives in an adapter
//! crate that talks to the core only through [`commands::CommandSurface`].

pub mod commands;
pub mod config;
pub mod credentials;
pub mod domain;
pub mod errors;
pub mod events;
pub mod logging;
pub mod security;
pub mod utils;

pub use errors::{Error, Result};
