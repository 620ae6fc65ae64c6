//! Runtime-tunable knobs (spec.md §4.6, §6's `start_bitrate` property).

/// Configuration the enclosing demuxer hands to a variant/rendition
/// controller at construction time. Grounded in the clap-free, plain-struct
/// half of `moq-native`'s `ServerConfig`/`ClientConfig` split: the network
/// edge (here, `hls-cli`) owns the clap derive, the library just owns
/// values.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
	/// Desired starting bitrate in bits/second. `0` means "pick the
	/// master's declared default variant" (spec.md §4.6).
	pub start_bitrate: u32,

	/// Never select a variant below this bandwidth, even if `start_bitrate`
	/// would otherwise land below it.
	pub min_bitrate: u32,

	/// Permit requesting delta (`_HLS_skip`) playlist updates.
	pub allow_delta_updates: bool,

	/// Permit blocking-reload (`_HLS_msn`/`_HLS_part`) playlist requests.
	pub allow_blocking_reload: bool,

	/// Consecutive playlist-load failures tolerated before a variant is
	/// declared failed (spec.md §4.2, §7).
	pub max_load_retries: u32,
}

impl Default for RuntimeConfig {
	fn default() -> Self {
		Self {
			start_bitrate: 0,
			min_bitrate: 0,
			allow_delta_updates: true,
			allow_blocking_reload: true,
			max_load_retries: 3,
		}
	}
}
