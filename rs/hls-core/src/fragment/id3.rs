//! ID3v2 tag scan for Apple's transport-stream timestamp `PRIV` frame.
//!
//! HLS fMP4/WebVTT fragments can open with a bare ID3v2 tag that carries
//! `com.apple.streaming.transportStreamTimestamp` -- an 8-byte big-endian
//! 33-bit MPEG-TS clock value establishing the fragment's internal time
//! origin independent of any contained PES stream (spec.md §4.4 step 3).

const PRIV_OWNER: &str = "com.apple.streaming.transportStreamTimestamp";

/// Parse the leading ID3v2 tag in `buf` and return the transport-stream
/// timestamp carried in its `PRIV` frame, if any, in 90 kHz ticks.
pub fn find_transport_stream_timestamp(buf: &[u8]) -> Option<u64> {
	if buf.len() < 10 || &buf[0..3] != b"ID3" {
		return None;
	}

	let tag_size = synchsafe(&buf[6..10]);
	let flags = buf[5];
	let has_extended_header = flags & 0x40 != 0;

	let mut pos = 10;
	if has_extended_header {
		if buf.len() < pos + 4 {
			return None;
		}
		let ext_size = synchsafe(&buf[pos..pos + 4]) as usize;
		pos += ext_size.max(4);
	}

	let tag_end = (10 + tag_size as usize).min(buf.len());

	while pos + 10 <= tag_end {
		let frame_id = &buf[pos..pos + 4];
		if frame_id == [0, 0, 0, 0] {
			break; // padding
		}
		let frame_size = u32::from_be_bytes(buf[pos + 4..pos + 8].try_into().ok()?) as usize;
		let frame_start = pos + 10;
		let frame_end = frame_start.checked_add(frame_size)?;
		if frame_end > tag_end || frame_end > buf.len() {
			break;
		}

		if frame_id == b"PRIV" {
			if let Some(ts) = parse_priv_frame(&buf[frame_start..frame_end]) {
				return Some(ts);
			}
		}

		pos = frame_end;
	}

	None
}

fn parse_priv_frame(data: &[u8]) -> Option<u64> {
	let nul = data.iter().position(|&b| b == 0)?;
	let owner = std::str::from_utf8(&data[..nul]).ok()?;
	if owner != PRIV_OWNER {
		return None;
	}
	let payload = &data[nul + 1..];
	if payload.len() < 8 {
		return None;
	}
	let raw = u64::from_be_bytes(payload[0..8].try_into().ok()?);
	Some(raw & ((1u64 << 33) - 1))
}

fn synchsafe(bytes: &[u8]) -> u32 {
	((bytes[0] as u32 & 0x7f) << 21) | ((bytes[1] as u32 & 0x7f) << 14) | ((bytes[2] as u32 & 0x7f) << 7) | (bytes[3] as u32 & 0x7f)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn priv_tag(owner: &str, payload: &[u8]) -> Vec<u8> {
		let mut frame_body = owner.as_bytes().to_vec();
		frame_body.push(0);
		frame_body.extend_from_slice(payload);

		let mut frame = b"PRIV".to_vec();
		frame.extend_from_slice(&(frame_body.len() as u32).to_be_bytes());
		frame.extend_from_slice(&[0, 0]); // frame flags
		frame.extend_from_slice(&frame_body);

		let tag_size = frame.len() as u32;
		let mut tag = b"ID3".to_vec();
		tag.extend_from_slice(&[0x04, 0x00, 0x00]); // version + flags
		tag.extend_from_slice(&to_synchsafe(tag_size));
		tag.extend_from_slice(&frame);
		tag
	}

	fn to_synchsafe(mut n: u32) -> [u8; 4] {
		let mut out = [0u8; 4];
		for i in (0..4).rev() {
			out[i] = (n & 0x7f) as u8;
			n >>= 7;
		}
		out
	}

	#[test]
	fn extracts_apple_transport_stream_timestamp() {
		let ts: u64 = 5_400_000;
		let tag = priv_tag(PRIV_OWNER, &ts.to_be_bytes());
		assert_eq!(find_transport_stream_timestamp(&tag), Some(ts));
	}

	#[test]
	fn ignores_unrelated_priv_owner() {
		let tag = priv_tag("com.example.other", &[0u8; 8]);
		assert_eq!(find_transport_stream_timestamp(&tag), None);
	}

	#[test]
	fn masks_to_33_bits() {
		let ts: u64 = (1u64 << 33) + 42;
		let tag = priv_tag(PRIV_OWNER, &ts.to_be_bytes());
		assert_eq!(find_transport_stream_timestamp(&tag), Some(42));
	}

	#[test]
	fn non_id3_buffer_is_none() {
		assert_eq!(find_transport_stream_timestamp(b"not an id3 tag at all"), None);
	}
}
