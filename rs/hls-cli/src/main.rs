mod client;
mod log;

use clap::Parser;
use log::Log;
use hls_core::config::RuntimeConfig;
use url::Url;

#[derive(Parser)]
#[command(name = "hls", about = "Play back an HLS master or media playlist")]
struct Cli {
	#[command(flatten)]
	log: Log,

	/// The master or media playlist URL to play.
	url: Url,

	/// Desired starting bitrate in bits/second; 0 picks the master's default variant.
	#[arg(long, default_value_t = 0)]
	start_bitrate: u32,

	/// Never select a variant below this bandwidth.
	#[arg(long, default_value_t = 0)]
	min_bitrate: u32,

	/// Disable EXT-X-SKIP delta playlist updates.
	#[arg(long)]
	no_delta_updates: bool,

	/// Disable blocking-reload (_HLS_msn/_HLS_part) playlist requests.
	#[arg(long)]
	no_blocking_reload: bool,

	/// Consecutive playlist-load failures tolerated before a variant is declared failed.
	#[arg(long, default_value_t = 3)]
	max_load_retries: u32,

	/// Stop after this many fragments (segments + partials); unset plays until end-of-stream.
	#[arg(long)]
	max_segments: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let cli = Cli::parse();
	cli.log.init();

	let config = RuntimeConfig {
		start_bitrate: cli.start_bitrate,
		min_bitrate: cli.min_bitrate,
		allow_delta_updates: !cli.no_delta_updates,
		allow_blocking_reload: !cli.no_blocking_reload,
		max_load_retries: cli.max_load_retries,
	};

	client::play(cli.url, config, cli.max_segments).await
}
