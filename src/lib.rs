pub mod app;
pub mod config;
pub mod domain;
pub mod downloader;
pub mod error;
pub mod listing;
pub mod output;
pub mod portal;
pub mod resolver;
pub mod session;
pub mod shard;
pub mod store;
pub mod transform;
