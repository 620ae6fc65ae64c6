//! Fragment processing orchestration: decrypt, typefind, then extract the
//! fragment's internal timestamp (spec.md §4.4's Acquire -> Decrypt ->
//! Typefind -> Extract-time -> Forward-payload pipeline).
//!
//! Like the loader and walker, this is sans-IO: the caller streams ciphertext
//! (or plaintext, if unencrypted) in via [`FragmentProcessor::push`] and
//! collects the decoded result from [`FragmentProcessor::finish`]. No
//! downloads, no clocks.

use super::decrypt::Decryptor;
use super::typefind::{self, ParserKind, PROBE_BUDGET};
use super::{id3, isobmff, ts, webvtt};
use crate::error::{Error, Result};

/// The internal timestamp recovered from a fragment, still expressed in its
/// native clock -- the time-mapping layer resolves it against stream time.
#[derive(Debug, Clone)]
pub enum FragmentTimestamp {
	/// 90 kHz ticks from the first PES packet with a PTS/DTS, not yet
	/// unwrapped against any prior reference.
	MpegTs(u64),
	/// 90 kHz ticks (masked to 33 bits) from an Apple `PRIV` ID3 frame.
	Id3(u64),
	/// Nanoseconds, already converted from the owning trak's timescale.
	IsoBmff(u64),
	WebVtt(webvtt::ParsedVtt),
}

#[derive(Debug)]
pub enum ProcessOutcome {
	Done {
		payload: Vec<u8>,
		kind: ParserKind,
		timestamp: Option<FragmentTimestamp>,
	},
}

pub struct FragmentProcessor {
	decryptor: Option<Decryptor>,
	buffer: Vec<u8>,
	kind: Option<ParserKind>,
}

impl FragmentProcessor {
	pub fn new(cipher: Option<(&[u8; 16], &[u8; 16])>) -> Self {
		Self {
			decryptor: cipher.map(|(key, iv)| Decryptor::new(key, iv)),
			buffer: Vec::new(),
			kind: None,
		}
	}

	/// Feed the next chunk of downloaded bytes. Decrypts eagerly; typefind
	/// runs incrementally so an unrecognised container is caught as soon as
	/// the probe budget is exhausted, rather than waiting for end-of-fragment.
	pub fn push(&mut self, data: &[u8]) -> Result<()> {
		let plain = match self.decryptor.as_mut() {
			Some(d) => d.push(data),
			None => data.to_vec(),
		};
		self.buffer.extend(plain);

		if self.kind.is_none() {
			let window_len = self.buffer.len().min(PROBE_BUDGET);
			self.kind = typefind::probe(&self.buffer[..window_len]);
			if self.kind.is_none() && self.buffer.len() >= PROBE_BUDGET {
				return Err(Error::ContentUnparseable("no container recognised within the probe budget".into()));
			}
		}

		Ok(())
	}

	/// Consume the remaining ciphertext tail (unpadding it if encrypted),
	/// then run type-specific timestamp extraction over the full payload.
	pub fn finish(mut self) -> Result<ProcessOutcome> {
		if let Some(decryptor) = self.decryptor.take() {
			self.buffer.extend(decryptor.finish()?);
		}

		let kind = match self.kind {
			Some(kind) => kind,
			None => {
				let window_len = self.buffer.len().min(PROBE_BUDGET);
				typefind::probe(&self.buffer[..window_len])
					.ok_or_else(|| Error::ContentUnparseable("no container recognised in a short fragment".into()))?
			}
		};

		let timestamp = match kind {
			ParserKind::MpegTs => ts::find_first_timestamp(&self.buffer).map(FragmentTimestamp::MpegTs),
			ParserKind::Id3 => id3::find_transport_stream_timestamp(&self.buffer).map(FragmentTimestamp::Id3),
			ParserKind::IsoBmff => isobmff::find_earliest_decode_time(&self.buffer)?.map(FragmentTimestamp::IsoBmff),
			ParserKind::WebVtt => {
				let text = std::str::from_utf8(&self.buffer)
					.map_err(|_| Error::ContentUnparseable("WebVTT payload was not valid UTF-8".into()))?;
				Some(FragmentTimestamp::WebVtt(webvtt::parse(text)))
			}
		};

		Ok(ProcessOutcome::Done {
			payload: self.buffer,
			kind,
			timestamp,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn unencrypted_mpegts_like_buffer_without_pat_yields_no_timestamp() {
		let mut buf = vec![0u8; 188 * 5];
		for i in 0..5 {
			buf[i * 188] = 0x47;
		}
		let mut proc = FragmentProcessor::new(None);
		proc.push(&buf).unwrap();
		let ProcessOutcome::Done { kind, timestamp, payload } = proc.finish().unwrap();
		assert_eq!(kind, ParserKind::MpegTs);
		assert!(timestamp.is_none());
		assert_eq!(payload.len(), buf.len());
	}

	#[test]
	fn unrecognised_container_is_content_unparseable() {
		let mut proc = FragmentProcessor::new(None);
		let result = proc.push(&vec![0xAAu8; PROBE_BUDGET]);
		assert!(result.is_err());
	}

	#[test]
	fn webvtt_payload_round_trips_cues() {
		let body = b"WEBVTT\n\nX-TIMESTAMP-MAP=MPEGTS:900000,LOCAL:00:00:00.000\n\n00:00:01.000 --> 00:00:02.000\nHi\n";
		let mut proc = FragmentProcessor::new(None);
		proc.push(body).unwrap();
		let ProcessOutcome::Done { kind, timestamp, .. } = proc.finish().unwrap();
		assert_eq!(kind, ParserKind::WebVtt);
		match timestamp {
			Some(FragmentTimestamp::WebVtt(parsed)) => {
				assert_eq!(parsed.cues.len(), 1);
				assert!(parsed.timestamp_map.is_some());
			}
			other => panic!("expected WebVTT timestamp, got {other:?}"),
		}
	}

	#[test]
	fn encrypted_payload_is_decrypted_before_typefind() {
		use aes::cipher::block_padding::Pkcs7;
		use aes::cipher::{BlockEncryptMut, KeyIvInit};

		let key = [0x11u8; 16];
		let iv = [0x22u8; 16];
		let mut plaintext = b"WEBVTT\n\n00:00:00.000 --> 00:00:01.000\nok\n".to_vec();
		plaintext.resize(plaintext.len() + 16, 0); // pad out well past the VTT header

		type Enc = cbc::Encryptor<aes::Aes128>;
		let enc = Enc::new(&key.into(), &iv.into());
		let ciphertext = enc.encrypt_padded_vec_mut::<Pkcs7>(&plaintext);

		let mut proc = FragmentProcessor::new(Some((&key, &iv)));
		proc.push(&ciphertext).unwrap();
		let ProcessOutcome::Done { kind, .. } = proc.finish().unwrap();
		assert_eq!(kind, ParserKind::WebVtt);
	}
}
