//! The external-collaborator boundary (spec.md §5, §6).
//!
//! The core never performs I/O or owns a clock; it is driven by an
//! enclosing scheduler that calls into it and receives callbacks back out.
//! These two traits are that seam. A real binary (see `hls-cli`) implements
//! them over an async HTTP client and `tokio::time`; tests implement them
//! in-memory.

use std::time::{Duration, Instant};

use crate::error::Result;
use crate::uri::Uri;

/// An opaque handle to an in-flight download, usable only to cancel it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestHandle(pub u64);

/// An opaque handle to a pending delayed call, usable only to cancel it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(pub u64);

/// A byte-range request for a playlist or a fragment (spec.md §6).
#[derive(Debug, Clone)]
pub struct DownloadRequest {
	pub uri: Uri,
	pub referer: Option<Uri>,
	/// Ask the server to bypass any cache (used for blocking-reload and
	/// delta-update playlist requests, which must never be served stale).
	pub cache_refresh: bool,
	/// Byte range `(offset, size)`; `size = None` means "to EOF".
	pub range: Option<(u64, Option<u64>)>,
}

impl DownloadRequest {
	pub fn playlist(uri: Uri) -> Self {
		Self {
			uri,
			referer: None,
			cache_refresh: false,
			range: None,
		}
	}

	pub fn segment(uri: Uri, offset: u64, size: Option<u64>) -> Self {
		Self {
			uri,
			referer: None,
			cache_refresh: false,
			range: Some((offset, size)),
		}
	}
}

/// The result of a completed download (spec.md §6).
#[derive(Debug, Clone)]
pub struct DownloadResponse {
	pub data: Vec<u8>,
	pub redirect_uri: Option<Uri>,
	pub redirect_permanent: bool,
	pub status_code: u16,
	pub download_start_time: Instant,
	pub download_age: Duration,
}

/// A single delivered chunk of a streamed (as opposed to whole-body)
/// download; fragment downloads are consumed incrementally so decryption
/// and typefind can run before the whole segment has arrived.
#[derive(Debug, Clone)]
pub struct DownloadChunk {
	pub data: Vec<u8>,
	pub is_last: bool,
}

pub type DownloadCallback = Box<dyn FnOnce(Result<DownloadResponse>)>;
pub type ChunkCallback = Box<dyn FnMut(Result<DownloadChunk>)>;
pub type TimerCallback = Box<dyn FnOnce()>;

/// The download helper, supplied by the enclosing demuxer framework.
///
/// Every method posts work and returns immediately; completion is always
/// signalled by invoking the supplied callback from scheduler context
/// (spec.md §5's "no blocking I/O inside scheduler-task code").
pub trait Downloader {
	/// Submit a whole-body download (used for playlists).
	fn submit_download(&mut self, request: DownloadRequest, on_complete: DownloadCallback) -> RequestHandle;

	/// Submit a streamed download (used for fragments, so the processor can
	/// decrypt/typefind before the whole segment is in hand).
	fn submit_streamed(&mut self, request: DownloadRequest, on_chunk: ChunkCallback) -> RequestHandle;

	/// Cancel an in-flight request. The next callback for `handle`, if any
	/// is already queued, must be treated as a no-op by the caller.
	fn cancel(&mut self, handle: RequestHandle);
}

/// The scheduler's clock and timer facility.
pub trait Clock {
	fn now(&self) -> Instant;

	fn schedule_call_delayed(&mut self, delay: Duration, callback: TimerCallback) -> TimerHandle;

	fn cancel_timer(&mut self, handle: TimerHandle);
}
