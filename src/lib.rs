//! Parallel range-based file downloader.
//!
//! [`core::downloader::Downloader`] fetches a single resource over several
//! concurrent range requests, coordinated through a [`core::range_map::RangeMap`].
//! [`core::engine::Engine`] runs batches of links on top of it.

pub mod core;
pub mod plugins;
