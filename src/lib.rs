//! Receives Zendesk webhooks, mirrors the referenced ticket into SQLite and
//! notifies registered receivers about what changed.

pub mod config;
pub mod error;
pub mod models;
pub mod processor;
pub mod server;
pub mod service;
pub mod signals;
