//! Core types, config, errors, and chat context for Parley.

pub mod audio;
pub mod chat;
pub mod config;
pub mod error;
pub mod types;
