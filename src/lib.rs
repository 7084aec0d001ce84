//! Library surface for `hdhr-bridge`: an HDHomeRun-compatible tuner and
//! XMLTV EPG bridge for arbitrary IPTV streams. `src/main.rs` wires these
//! modules together; integration tests and the binary both depend on this
//! crate rather than duplicating module declarations.

pub mod assets;
pub mod cache;
pub mod config;
pub mod database;
pub mod epg;
pub mod errors;
pub mod hdhomerun;
pub mod identity;
pub mod ingestor;
pub mod models;
pub mod streaming;
pub mod web;
