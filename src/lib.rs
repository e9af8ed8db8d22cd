#![forbid(unsafe_code)]

//! clipfetch: resolves social-media video URLs through `yt-dlp` with a
//! retry/fallback ladder, a storage-backed response cache, and an axum API.

pub mod api;
pub mod cache;
pub mod config;
pub mod credentials;
pub mod error;
pub mod extractor;
pub mod failure;
pub mod orchestrator;
pub mod platform;
pub mod scrape;
pub mod security;
pub mod service;
pub mod storage;
pub mod tool;
