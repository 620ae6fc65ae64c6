//! Drives the sans-IO `hls-core` state machines over `reqwest`: the only
//! place in this crate that touches a socket or a clock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use reqwest::Client;
use tracing::{debug, info, warn};

use hls_core::config::RuntimeConfig;
use hls_core::fragment::{FragmentProcessor, FragmentTimestamp, ProcessOutcome};
use hls_core::loader::{Loader, LoaderAction, LoaderStep};
use hls_core::playlist::{self, MediaPlaylist, MediaSegment, Playlist};
use hls_core::stream::{AdvanceOutcome, SegmentWalker};
use hls_core::timemap::{Reconciliation, TimeMapRegistry};
use hls_core::uri::Uri;
use hls_core::variant::VariantController;

pub async fn play(url: Uri, config: RuntimeConfig, max_segments: Option<u64>) -> anyhow::Result<()> {
	let client = Client::builder()
		.user_agent(concat!("hls-cli/", env!("CARGO_PKG_VERSION")))
		.build()
		.context("failed to build HTTP client")?;

	let root_body = fetch_text(&client, &url).await?;
	let root = playlist::parse(&root_body, &url).context("failed to parse root playlist")?;

	let mut session = match root {
		Playlist::Media(_) => Session::single_variant(url, root_body, config)?,
		Playlist::Master(master) => Session::from_master(url, master, config)?,
	};

	session.run(&client, max_segments).await
}

async fn fetch_text(client: &Client, uri: &Uri) -> anyhow::Result<String> {
	let bytes = fetch_bytes(client, uri, None).await?;
	String::from_utf8(bytes).context("playlist response was not valid UTF-8")
}

async fn fetch_bytes(client: &Client, uri: &Uri, range: Option<(u64, Option<u64>)>) -> anyhow::Result<Vec<u8>> {
	let mut req = client.get(uri.as_str());
	if let Some((offset, size)) = range {
		let header = match size {
			Some(size) => format!("bytes={}-{}", offset, offset + size.saturating_sub(1)),
			None => format!("bytes={}-", offset),
		};
		req = req.header(reqwest::header::RANGE, header);
	}
	let response = req.send().await.with_context(|| format!("request to {uri} failed"))?;
	let response = response
		.error_for_status()
		.with_context(|| format!("request to {uri} returned an error status"))?;
	Ok(response.bytes().await.with_context(|| format!("failed to read body from {uri}"))?.to_vec())
}

/// Drive a loader's pending action through to its next published playlist,
/// following retries and blocking-reload timers as needed. Returns the
/// playlist and the action to resume from on the *next* refresh.
async fn drive_loader(client: &Client, loader: &mut Loader, mut action: LoaderAction) -> anyhow::Result<(Arc<MediaPlaylist>, LoaderAction)> {
	loop {
		match action {
			LoaderAction::None => {
				let playlist = loader.current().cloned().context("loader idle with no playlist loaded")?;
				return Ok((playlist, LoaderAction::None));
			}
			LoaderAction::SubmitDownload(request) => {
				let request_time = Instant::now();
				match fetch_text(client, &request.uri).await {
					Ok(body) => {
						let now = Instant::now();
						match loader.on_download_success(&body, request_time, now) {
							Ok(LoaderStep::Success { playlist, next }) => return Ok((playlist, next)),
							Ok(LoaderStep::Retrying(next)) => action = next,
							Ok(LoaderStep::Failed) => anyhow::bail!("playlist load retries exhausted for {}", request.uri),
							Err(err) => return Err(err.into()),
						}
					}
					Err(err) => {
						warn!(uri = %request.uri, %err, "playlist request failed");
						match loader.on_download_error() {
							LoaderStep::Retrying(next) => action = next,
							LoaderStep::Failed => anyhow::bail!("playlist load failed repeatedly for {}", request.uri),
							LoaderStep::Success { .. } => unreachable!("on_download_error never reports success"),
						}
					}
				}
			}
			LoaderAction::ScheduleTimer(delay) => {
				tokio::time::sleep(delay).await;
				action = loader.on_timer_fired();
			}
			LoaderAction::CancelDownload | LoaderAction::CancelTimer => {
				anyhow::bail!("loader requested a cancel outside of a live session");
			}
		}
	}
}

struct Session {
	base_uri: Uri,
	controller: Option<VariantController>,
	loader: Loader,
	pending_action: LoaderAction,
	walker: Option<SegmentWalker>,
	timemap: TimeMapRegistry,
	keys: HashMap<Uri, [u8; 16]>,
	last_stream_time: Option<hls_core::time::StreamTime>,
}

impl Session {
	/// `root_body` is the already-downloaded bytes that `playlist::parse`
	/// identified as a bare media playlist; fed straight into the loader so
	/// startup doesn't re-request the same URI a second time.
	fn single_variant(url: Uri, root_body: String, config: RuntimeConfig) -> anyhow::Result<Self> {
		let mut loader = Loader::new(config.max_load_retries, config.allow_delta_updates, config.allow_blocking_reload);
		loader.set_target_uri(url.clone(), url.clone());
		let _ = loader.start();

		let now = Instant::now();
		let pending_action = match loader.on_download_success(&root_body, now, now)? {
			LoaderStep::Success { next, .. } => next,
			LoaderStep::Retrying(action) => action,
			LoaderStep::Failed => anyhow::bail!("initial playlist at {url} failed to load"),
		};

		Ok(Self {
			base_uri: url,
			controller: None,
			loader,
			pending_action,
			walker: None,
			timemap: TimeMapRegistry::new(),
			keys: HashMap::new(),
			last_stream_time: None,
		})
	}

	fn from_master(url: Uri, master: playlist::MasterPlaylist, config: RuntimeConfig) -> anyhow::Result<Self> {
		if master.variants.is_empty() {
			anyhow::bail!("master playlist at {url} has no variants");
		}
		let master = Arc::new(master);
		let controller = VariantController::new(master, &config);
		let variant_uri = controller.current_variant().uri.clone();

		let mut loader = Loader::new(config.max_load_retries, config.allow_delta_updates, config.allow_blocking_reload);
		loader.set_target_uri(url.clone(), variant_uri.clone());
		let pending_action = loader.start();

		Ok(Self {
			base_uri: url,
			controller: Some(controller),
			loader,
			pending_action,
			walker: None,
			timemap: TimeMapRegistry::new(),
			keys: HashMap::new(),
			last_stream_time: None,
		})
	}

	async fn run(&mut self, client: &Client, max_segments: Option<u64>) -> anyhow::Result<()> {
		let mut processed = 0u64;

		loop {
			let action = std::mem::replace(&mut self.pending_action, LoaderAction::None);
			let (playlist, next) = drive_loader(client, &mut self.loader, action).await?;
			self.pending_action = next;

			// Re-seeking by stream time (rather than trusting the old segment
			// index) keeps the cursor correct across both an ordinary sliding
			// live window and a variant switch to a differently-indexed
			// playlist.
			let mut walker = SegmentWalker::new(playlist.clone());
			match self.last_stream_time {
				Some(ts) => {
					if walker.seek(ts, hls_core::stream::SeekFlags::default()).is_none() {
						walker.starting_segment();
					}
				}
				None => {
					walker.starting_segment();
				}
			}
			self.walker = Some(walker);

			loop {
				let walker = self.walker.as_mut().expect("walker initialized above");
				let Some(position) = walker.position() else { break };
				// Cloned so the loop body is free to borrow `self` mutably
				// (key cache, time-map registry) without fighting the
				// borrow held by `walker`.
				let segment = walker.playlist().segments[position.segment_idx].clone();

				let (fetch_uri, offset, size, duration) = match position.part_idx {
					Some(idx) => {
						let part = &segment.partial_segments[idx];
						(part.uri.clone(), part.offset, part.size, part.duration)
					}
					None => (segment.uri.clone(), segment.offset, segment.size, segment.duration),
				};

				let download_start = Instant::now();
				let range = if offset != 0 || size.is_some() { Some((offset, size)) } else { None };
				let bytes = fetch_bytes(client, &fetch_uri, range).await?;
				let download_elapsed = download_start.elapsed();
				let measured_bps = bitrate_bps(bytes.len(), download_elapsed);

				let cipher_key = match &segment.key {
					Some(key) if key.method == hls_core::playlist::KeyMethod::Aes128 => {
						let key_uri = key.uri.clone().context("AES-128 key missing URI")?;
						Some((self.fetch_key(client, &key_uri).await?, key.iv))
					}
					_ => None,
				};

				let mut processor = FragmentProcessor::new(cipher_key.as_ref().map(|(k, iv)| (k, iv)));
				processor.push(&bytes)?;
				let ProcessOutcome::Done { kind, timestamp, payload } = processor.finish()?;

				self.reconcile_time(position.part_idx.is_none(), &segment, duration, timestamp.as_ref());

				info!(
					sequence = segment.sequence,
					part = ?position.part_idx,
					bytes = payload.len(),
					?kind,
					stream_time = ?segment.stream_time,
					"fragment ready"
				);

				self.last_stream_time = Some(segment.stream_time);
				processed += 1;
				if max_segments.is_some_and(|max| processed >= max) {
					return Ok(());
				}

				if position.part_idx.is_none() {
					if let Some(controller) = &mut self.controller {
						if let Some(decision) = controller.select_for_bandwidth(measured_bps, 1.0, true) {
							info!(new_bandwidth = controller.current_variant().bandwidth, "switching variant for bandwidth");
							let new_uri = controller.current_variant().uri.clone();
							self.loader.set_target_uri(self.base_uri.clone(), new_uri);
							self.pending_action = self.loader.start();
							let _ = decision;
							break;
						}
					}
				}

				let walker = self.walker.as_mut().expect("walker initialized above");
				match walker.advance(true) {
					AdvanceOutcome::Advanced => continue,
					AdvanceOutcome::Pending => break,
					AdvanceOutcome::Eos => return Ok(()),
				}
			}

			if !matches!(self.pending_action, LoaderAction::SubmitDownload(_)) && !self.walker.as_ref().unwrap().playlist().is_live() {
				return Ok(());
			}
		}
	}

	async fn fetch_key(&mut self, client: &Client, uri: &Uri) -> anyhow::Result<[u8; 16]> {
		if let Some(key) = self.keys.get(uri) {
			return Ok(*key);
		}
		let bytes = fetch_bytes(client, uri, None).await?;
		let key: [u8; 16] = bytes
			.as_slice()
			.try_into()
			.map_err(|_| anyhow::anyhow!("AES-128 key at {uri} was not 16 bytes"))?;
		self.keys.insert(uri.clone(), key);
		Ok(key)
	}

	fn reconcile_time(&mut self, is_whole_segment: bool, segment: &MediaSegment, interval: Duration, timestamp: Option<&FragmentTimestamp>) {
		let dsn = segment.discont_sequence;
		let Some(ts) = timestamp else { return };
		let Some(internal_nanos) = self.timemap.resolve_internal_nanos(dsn, ts) else { return };

		if segment.discont || self.timemap.get(dsn).is_none() {
			self.timemap
				.seed_or_overwrite(dsn, segment.stream_time, internal_nanos, segment.datetime, true, segment.discont);
			return;
		}

		if !is_whole_segment {
			return; // drift reconciliation only runs at segment boundaries
		}

		let walker = self.walker.as_ref().expect("walker initialized before reconciliation");
		match self.timemap.reconcile(walker, dsn, segment.stream_time, internal_nanos, interval, false) {
			Reconciliation::NoOp => {}
			Reconciliation::Adjusted { stream_time } => debug!(?stream_time, "absorbed internal clock drift"),
			Reconciliation::Resync { position } => warn!(?position, "internal clock drift forced a resync"),
			Reconciliation::Discontinuity { stream_time } => warn!(?stream_time, "internal clock drift exceeded relocation, marking discontinuous"),
		}
	}
}

fn bitrate_bps(bytes: usize, elapsed: Duration) -> u64 {
	let secs = elapsed.as_secs_f64().max(0.001);
	((bytes as f64 * 8.0) / secs) as u64
}
