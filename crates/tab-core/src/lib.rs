//! Core of the Telegram archive bot.
//!
//! This crate is framework-agnostic: it knows how to persist incoming items,
//! roll them up into periodic zip archives and bundle operator logs. Telegram
//! lives in the adapter crate.

pub mod archive;
pub mod config;
pub mod domain;
pub mod errors;
pub mod item;
pub mod log_bundle;
pub mod logging;
pub mod store;

pub use errors::{Error, Result};
