use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Logging configuration shared by every subcommand, grounded in the same
/// `RUST_LOG`-first, sane-default-second pattern `moq-native::Log` uses.
#[derive(Parser, Clone)]
pub struct Log {
	/// Log format: "pretty" for a human terminal, "json" for a log collector.
	#[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
	pub format: LogFormat,
}

#[derive(clap::ValueEnum, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
	Pretty,
	Json,
}

impl Log {
	pub fn init(&self) {
		let filter = tracing_subscriber::EnvFilter::try_from_default_env()
			.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("hls_cli=info,hls_core=info"));

		match self.format {
			LogFormat::Pretty => {
				tracing_subscriber::registry()
					.with(tracing_subscriber::fmt::layer().pretty().with_target(true))
					.with(filter)
					.init();
			}
			LogFormat::Json => {
				tracing_subscriber::registry()
					.with(tracing_subscriber::fmt::layer().json().with_target(true))
					.with(filter)
					.init();
			}
		}
	}
}
