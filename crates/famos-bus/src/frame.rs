//! Wire framing for WAL records: `u32 len LE | u32 crc32 LE | bytes`.
//!
//! Records are never rewritten. A torn tail (partial frame or checksum
//! mismatch at end of file) is truncated during recovery; a checksum
//! mismatch anywhere earlier is corruption and surfaces as an error.

use std::io::{Read, Write};

/// Maximum accepted frame body, matching the envelope payload cap with
/// headroom for envelope metadata.
pub(crate) const MAX_FRAME_LEN: u32 = 2 * 1024 * 1024;

/// Append one framed record, returning the bytes written.
pub(crate) fn write_frame<W: Write>(w: &mut W, body: &[u8]) -> std::io::Result<u64> {
    let len = body.len() as u32;
    let crc = crc32fast::hash(body);
    w.write_all(&len.to_le_bytes())?;
    w.write_all(&crc.to_le_bytes())?;
    w.write_all(body)?;
    Ok(8 + body.len() as u64)
}

/// Result of pulling one frame off a reader.
pub(crate) enum ReadFrame {
    /// A complete, checksum-valid frame.
    Ok(Vec<u8>),
    /// Clean end of file on a frame boundary.
    Eof,
    /// Incomplete or checksum-invalid data at the current position.
    Torn,
}

/// Read one framed record.
pub(crate) fn read_frame<R: Read>(r: &mut R) -> std::io::Result<ReadFrame> {
    let mut header = [0u8; 8];
    match read_exact_or_eof(r, &mut header)? {
        FillResult::Eof => return Ok(ReadFrame::Eof),
        FillResult::Partial => return Ok(ReadFrame::Torn),
        FillResult::Full => {}
    }
    let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if len > MAX_FRAME_LEN {
        return Ok(ReadFrame::Torn);
    }
    let mut body = vec![0u8; len as usize];
    match read_exact_or_eof(r, &mut body)? {
        FillResult::Full => {}
        _ => return Ok(ReadFrame::Torn),
    }
    if crc32fast::hash(&body) != crc {
        return Ok(ReadFrame::Torn);
    }
    Ok(ReadFrame::Ok(body))
}

enum FillResult {
    Full,
    Partial,
    Eof,
}

fn read_exact_or_eof<R: Read>(r: &mut R, buf: &mut [u8]) -> std::io::Result<FillResult> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..])? {
            0 if filled == 0 => return Ok(FillResult::Eof),
            0 => return Ok(FillResult::Partial),
            n => filled += n,
        }
    }
    Ok(FillResult::Full)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn frames_round_trip() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"alpha").unwrap();
        write_frame(&mut buf, b"beta").unwrap();

        let mut cursor = Cursor::new(buf);
        assert!(matches!(read_frame(&mut cursor).unwrap(), ReadFrame::Ok(b) if b == b"alpha"));
        assert!(matches!(read_frame(&mut cursor).unwrap(), ReadFrame::Ok(b) if b == b"beta"));
        assert!(matches!(read_frame(&mut cursor).unwrap(), ReadFrame::Eof));
    }

    #[test]
    fn torn_tail_is_detected() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"alpha").unwrap();
        write_frame(&mut buf, b"beta").unwrap();
        buf.truncate(buf.len() - 2);

        let mut cursor = Cursor::new(buf);
        assert!(matches!(read_frame(&mut cursor).unwrap(), ReadFrame::Ok(_)));
        assert!(matches!(read_frame(&mut cursor).unwrap(), ReadFrame::Torn));
    }

    #[test]
    fn bit_flip_fails_checksum() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"alpha").unwrap();
        let last = buf.len() - 1;
        buf[last] ^= 0x01;

        let mut cursor = Cursor::new(buf);
        assert!(matches!(read_frame(&mut cursor).unwrap(), ReadFrame::Torn));
    }
}
