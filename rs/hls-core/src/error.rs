//! The crate-wide error taxonomy (spec.md §7).

use crate::uri::Uri;

/// Errors produced by the HLS core.
///
/// Variants map 1:1 onto the error kinds of §7: most are recoverable locally
/// (the loader retries, the walker re-seeks, the controller falls back to
/// another variant); [`Error::is_fatal`] tells the caller which ones must
/// propagate all the way up to the application.
#[derive(Debug, thiserror::Error)]
pub enum Error {
	/// `#EXTM3U` missing, conflicting master/media markers, or a playlist
	/// with zero segments after parsing.
	#[error("manifest malformed: {0}")]
	ManifestMalformed(String),

	/// A playlist refresh failed at the HTTP layer or failed to parse, after
	/// exhausting retries and fallback URIs.
	#[error("playlist load failed for {uri}: {reason}")]
	PlaylistLoadFailed { uri: Uri, reason: String },

	/// AES-128 decryption could not proceed: missing key, bad IV, or no
	/// cipher backend compiled in.
	#[error("decryption failed: {0}")]
	DecryptionFailed(String),

	/// Typefind failed after the 2 MiB probe budget, or the detected
	/// container has no parser kind, or a kind-specific probe errored.
	#[error("content unparseable: {0}")]
	ContentUnparseable(String),

	/// Manifest updates no longer align with the playback position and
	/// automatic recovery (§4.5) could not relocate the walker.
	#[error("lost sync on {uri}")]
	LostSync { uri: Uri },

	/// No alternative variant remains after all known variants have failed.
	#[error("no variant remains playable")]
	NoVariantRemains,

	/// `stop()` was observed; never surfaced to the application.
	#[error("cancelled")]
	Cancelled,

	#[error("invalid uri: {0}")]
	Uri(#[from] url::ParseError),

	#[error("io error: {0}")]
	Io(#[from] std::io::Error),

	#[error("mp4 error: {0}")]
	Mp4(#[from] mp4_atom::Error),
}

impl Error {
	/// True for the two error kinds §7 says must surface to the application:
	/// `ManifestMalformed` and "no variant remains".
	pub fn is_fatal(&self) -> bool {
		matches!(self, Error::ManifestMalformed(_) | Error::NoVariantRemains)
	}
}

pub type Result<T> = std::result::Result<T, Error>;
