//! A sans-IO HLS adaptive-demultiplexer core: playlist parsing, playlist
//! loading, segment walking, fragment processing, time-mapping/resync, and
//! variant/rendition control, as a single-threaded cooperative state
//! machine with no networking or async runtime dependency of its own.
//!
//! The enclosing application drives this crate by implementing
//! [`download::Downloader`] and [`download::Clock`] and feeding their
//! results back through each component's `on_*` methods; see `hls-cli` for
//! a concrete driver built on `reqwest` and `tokio`.

pub mod config;
pub mod download;
pub mod error;
pub mod fragment;
pub mod loader;
pub mod playlist;
pub mod stream;
pub mod time;
pub mod timemap;
pub mod uri;
pub mod variant;

pub use error::{Error, Result};
