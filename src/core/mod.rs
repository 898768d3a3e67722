pub mod assembler;
pub mod config;
pub mod downloader;
pub mod engine;
pub mod error;
pub mod events;
pub mod model;
pub mod progress;
pub mod range_map;
pub mod retry;
pub mod stall;
