//! Playlist loader (C2): a sans-IO state machine per playlist URI.
//!
//! The loader never touches a socket or a clock itself. Each call returns a
//! [`LoaderAction`] describing what the caller (the scheduler, via a
//! [`crate::download::Downloader`]/[`crate::download::Clock`] pair) should
//! do next; results are fed back in through `on_download_success` /
//! `on_download_error` / `on_timer_fired`. This keeps the state machine
//! trivially unit-testable without mock I/O.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::download::DownloadRequest;
use crate::error::{Error, Result};
use crate::playlist::{self, MediaPlaylist};
use crate::uri::{self, Uri};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderState {
	Stopped,
	Starting,
	Loading,
	Waiting,
}

/// What the caller should do in response to a loader call.
#[derive(Debug, Clone)]
pub enum LoaderAction {
	None,
	SubmitDownload(DownloadRequest),
	ScheduleTimer(Duration),
	CancelDownload,
	CancelTimer,
}

/// The outcome of feeding a completed download back into the loader.
pub enum LoaderStep {
	/// A new current playlist was published; `next` says what to do now.
	Success { playlist: Arc<MediaPlaylist>, next: LoaderAction },
	/// The error counter is still under threshold; retry is scheduled.
	Retrying(LoaderAction),
	/// Retries exhausted; the caller should fail this URI over to a
	/// fallback or declare the variant failed (spec.md §7).
	Failed,
}

pub struct Loader {
	state: LoaderState,
	base_uri: Option<Uri>,
	target_uri: Option<Uri>,
	current: Option<Arc<MediaPlaylist>>,
	error_count: u32,
	max_retries: u32,
	allow_delta: bool,
	allow_blocking: bool,
	last_request_time: Option<Instant>,
	/// Set after a delta request whose merge failed, to force one retry
	/// without the skip directive.
	suppress_delta_once: bool,
}

impl Loader {
	pub fn new(max_retries: u32, allow_delta: bool, allow_blocking: bool) -> Self {
		Self {
			state: LoaderState::Stopped,
			base_uri: None,
			target_uri: None,
			current: None,
			error_count: 0,
			max_retries,
			allow_delta,
			allow_blocking,
			last_request_time: None,
			suppress_delta_once: false,
		}
	}

	pub fn state(&self) -> LoaderState {
		self.state
	}

	pub fn current(&self) -> Option<&Arc<MediaPlaylist>> {
		self.current.as_ref()
	}

	pub fn set_target_uri(&mut self, base: Uri, target: Uri) {
		let changed = self.target_uri.as_ref() != Some(&target);
		self.base_uri = Some(base);
		self.target_uri = Some(target);
		if changed {
			self.current = None;
			self.error_count = 0;
		}
	}

	pub fn start(&mut self) -> LoaderAction {
		if self.target_uri.is_none() {
			self.state = LoaderState::Starting;
			return LoaderAction::None;
		}
		self.state = LoaderState::Loading;
		LoaderAction::SubmitDownload(self.build_request())
	}

	pub fn stop(&mut self) -> LoaderAction {
		let was_active = !matches!(self.state, LoaderState::Stopped);
		self.state = LoaderState::Stopped;
		if was_active {
			LoaderAction::CancelDownload
		} else {
			LoaderAction::None
		}
	}

	fn build_request(&mut self) -> DownloadRequest {
		let mut uri = self.target_uri.clone().expect("target set before request");

		if let Some(current) = &self.current {
			if self.allow_delta && !self.suppress_delta_once {
				if let Some(boundary) = current.skip_boundary {
					let age = current
						.request_time
						.map(|t| t.elapsed())
						.unwrap_or(Duration::ZERO);
					if age <= boundary / 2 {
						uri = uri::with_skip_directive(&uri, current.can_skip_dateranges);
					}
				}
			}
			self.suppress_delta_once = false;

			if self.allow_blocking && current.can_block_reload {
				if let Some(last) = current.segments.last() {
					let (msn, part) = if last.partial_only {
						(last.sequence, Some(last.partial_segments.len() as u64))
					} else {
						(last.sequence + 1, None)
					};
					uri = uri::with_blocking_directive(&uri, msn, part);
				}
			}
		}

		DownloadRequest::playlist(uri)
	}

	/// Feed a completed (and already UTF-8-validated) playlist download back
	/// into the loader.
	pub fn on_download_success(&mut self, body: &str, request_time: Instant, now: Instant) -> Result<LoaderStep> {
		if matches!(self.state, LoaderState::Stopped) {
			return Ok(LoaderStep::Retrying(LoaderAction::None));
		}

		let uri = self.target_uri.clone().expect("request implies a target");
		let base = self.base_uri.clone().unwrap_or_else(|| uri.clone());

		let parsed = playlist::media::parse_media(body, &uri, Some(&base));
		let mut new_playlist = match parsed {
			Ok(p) => p,
			Err(err) => return self.fail_or_retry(err),
		};

		if let Some(prev) = &self.current {
			if new_playlist.skipped_segments > 0 {
				if !merge_delta(prev, &mut new_playlist) {
					tracing::warn!(%uri, "delta merge failed, retrying without skip directive");
					self.suppress_delta_once = true;
					self.state = LoaderState::Loading;
					return Ok(LoaderStep::Retrying(LoaderAction::SubmitDownload(self.build_request())));
				}
			}
			new_playlist.reloaded = playlists_byte_identical(prev, &new_playlist);
		}

		new_playlist.request_time = Some(request_time);
		self.error_count = 0;
		self.last_request_time = Some(request_time);

		let published = Arc::new(new_playlist);
		self.current = Some(published.clone());

		let next = if published.is_live() {
			if self.allow_blocking && published.can_block_reload {
				self.state = LoaderState::Loading;
				LoaderAction::SubmitDownload(self.build_request())
			} else {
				self.state = LoaderState::Waiting;
				LoaderAction::ScheduleTimer(self.reload_interval(&published, now))
			}
		} else {
			self.state = LoaderState::Starting;
			LoaderAction::None
		};

		Ok(LoaderStep::Success { playlist: published, next })
	}

	pub fn on_download_error(&mut self) -> LoaderStep {
		self.fail_or_retry_after_error()
	}

	pub fn on_timer_fired(&mut self) -> LoaderAction {
		if matches!(self.state, LoaderState::Stopped) {
			return LoaderAction::None;
		}
		self.state = LoaderState::Loading;
		LoaderAction::SubmitDownload(self.build_request())
	}

	fn fail_or_retry(&mut self, err: Error) -> Result<LoaderStep> {
		self.error_count += 1;
		if self.error_count >= self.max_retries {
			return Err(err);
		}
		self.state = LoaderState::Loading;
		Ok(LoaderStep::Retrying(LoaderAction::ScheduleTimer(Duration::from_millis(100))))
	}

	fn fail_or_retry_after_error(&mut self) -> LoaderStep {
		self.error_count += 1;
		if self.error_count >= self.max_retries {
			LoaderStep::Failed
		} else {
			self.state = LoaderState::Loading;
			LoaderStep::Retrying(LoaderAction::ScheduleTimer(Duration::from_millis(100)))
		}
	}

	/// Reload interval (spec.md §4.2): last partial's target, else last
	/// segment's duration, else the playlist target duration; halved on a
	/// byte-identical reload; reduced by the in-flight request's own age.
	fn reload_interval(&self, playlist: &MediaPlaylist, now: Instant) -> Duration {
		let base = playlist
			.last_segment()
			.and_then(|s| s.partial_segments.last())
			.map(|p| p.duration)
			.or_else(|| playlist.last_segment().map(|s| s.duration))
			.unwrap_or(playlist.target_duration);

		let base = if playlist.reloaded {
			let half_target = playlist.target_duration / 2;
			let half_part = playlist.partial_target_duration.map(|d| d / 2);
			match half_part {
				Some(p) => base.min(half_target).max(p.min(half_target)),
				None => base.min(half_target),
			}
		} else {
			base
		};

		let age = self.last_request_time.map(|t| now.saturating_duration_since(t)).unwrap_or(Duration::ZERO);
		base.saturating_sub(age)
	}
}

/// Compare two playlists' segment identity streams for the loader's
/// `reloaded` flag: true when the new refresh carried no new information.
fn playlists_byte_identical(prev: &MediaPlaylist, new: &MediaPlaylist) -> bool {
	prev.media_sequence == new.media_sequence
		&& prev.segments.len() == new.segments.len()
		&& prev
			.segments
			.iter()
			.zip(new.segments.iter())
			.all(|(a, b)| a.uri == b.uri && a.offset == b.offset && a.size == b.size && a.partial_segments.len() == b.partial_segments.len())
}

/// Splice up to `new.skipped_segments` segments from `prev` onto the front
/// of `new` (spec.md §4.1's EXT-X-SKIP handling, §4.2's delta-merge rule,
/// §8 scenario 4). Returns `false` if the anchor segment cannot be found.
fn merge_delta(prev: &MediaPlaylist, new: &mut MediaPlaylist) -> bool {
	let Some(first_new) = new.segments.first() else { return false };
	let Some(anchor_idx) = prev.segments.iter().position(|s| {
		s.uri == first_new.uri && s.sequence == first_new.sequence && s.discont_sequence == first_new.discont_sequence
	}) else {
		return false;
	};

	let k = new.skipped_segments as usize;
	if anchor_idx < k {
		return false;
	}

	let mut merged: Vec<_> = prev.segments[anchor_idx - k..anchor_idx].to_vec();
	merged.append(&mut new.segments);
	new.segments = merged;
	new.media_sequence = new.media_sequence.saturating_sub(new.skipped_segments);
	true
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::playlist::media::parse_media;

	fn uri(s: &str) -> Uri {
		Uri::parse(s).unwrap()
	}

	#[test]
	fn start_without_target_stays_idle() {
		let mut loader = Loader::new(3, true, true);
		assert!(matches!(loader.start(), LoaderAction::None));
		assert_eq!(loader.state(), LoaderState::Starting);
	}

	#[test]
	fn start_with_target_submits_download() {
		let mut loader = Loader::new(3, true, true);
		loader.set_target_uri(uri("https://cdn.example/"), uri("https://cdn.example/low.m3u8"));
		match loader.start() {
			LoaderAction::SubmitDownload(req) => assert_eq!(req.uri.as_str(), "https://cdn.example/low.m3u8"),
			other => panic!("unexpected action: {other:?}"),
		}
	}

	#[test]
	fn vod_playlist_goes_to_starting_with_no_reload() {
		let mut loader = Loader::new(3, true, true);
		let target = uri("https://cdn.example/low.m3u8");
		loader.set_target_uri(target.clone(), target.clone());
		loader.start();

		let body = "#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXTINF:4.0,\nseg.ts\n#EXT-X-ENDLIST\n";
		let now = Instant::now();
		match loader.on_download_success(body, now, now).unwrap() {
			LoaderStep::Success { next, .. } => assert!(matches!(next, LoaderAction::None)),
			_ => panic!("expected success"),
		}
		assert_eq!(loader.state(), LoaderState::Starting);
	}

	#[test]
	fn live_playlist_without_blocking_reload_schedules_timer() {
		let mut loader = Loader::new(3, true, false);
		let target = uri("https://cdn.example/live.m3u8");
		loader.set_target_uri(target.clone(), target.clone());
		loader.start();

		let body = "#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXTINF:4.0,\nseg.ts\n";
		let now = Instant::now();
		match loader.on_download_success(body, now, now).unwrap() {
			LoaderStep::Success { next, .. } => assert!(matches!(next, LoaderAction::ScheduleTimer(_))),
			_ => panic!("expected success"),
		}
		assert_eq!(loader.state(), LoaderState::Waiting);
	}

	#[test]
	fn repeated_errors_exceed_threshold() {
		let mut loader = Loader::new(2, true, true);
		loader.set_target_uri(uri("https://cdn.example/"), uri("https://cdn.example/low.m3u8"));
		loader.start();
		assert!(matches!(loader.on_download_error(), LoaderStep::Retrying(_)));
		assert!(matches!(loader.on_download_error(), LoaderStep::Failed));
	}

	#[test]
	fn delta_merge_splices_skipped_segments() {
		let reference_body = "#EXTM3U\n#EXT-X-TARGETDURATION:1\n#EXT-X-MEDIA-SEQUENCE:100\n".to_string()
			+ &(100..110).map(|n| format!("#EXTINF:1.0,\nsn{n}.ts\n")).collect::<String>();
		let reference = parse_media(&reference_body, &uri("https://cdn.example/live.m3u8"), None).unwrap();

		let delta_body = "#EXTM3U\n#EXT-X-TARGETDURATION:1\n#EXT-X-MEDIA-SEQUENCE:100\n#EXT-X-SKIP:SKIPPED-SEGMENTS=5\n"
			.to_string()
			+ &(105..111).map(|n| format!("#EXTINF:1.0,\nsn{n}.ts\n")).collect::<String>();
		let mut delta = parse_media(&delta_body, &uri("https://cdn.example/live.m3u8"), None).unwrap();

		assert!(merge_delta(&reference, &mut delta));
		assert_eq!(delta.segments.len(), 11);
		assert_eq!(delta.segments[0].sequence, 100);
		assert_eq!(delta.segments.last().unwrap().sequence, 110);
	}
}
