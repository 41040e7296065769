//! m3u-hub: IPTV playlist aggregation and freshness engine
//!
//! Pulls M3U playlists from subscribed providers, stores their channels,
//! and serves filtered, rebranded playlists per output source. A background
//! scheduler keeps subscriptions, EPG guides, and stream health current.

pub mod checker;
pub mod config;
pub mod database;
pub mod epg;
pub mod errors;
pub mod ingestor;
pub mod models;
pub mod output;
pub mod web;
