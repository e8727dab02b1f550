//! Stateless frame packers/parsers bundled with the core.
//!
//! These are pure functions over byte slices with no connection to the
//! reactor -- the hard part of this crate is the endpoint that drives
//! them, not the wire format. They exist here because the parse callback
//! signature (`[crate::tcp::ParseFn]`) is defined against exactly this
//! shape: consume a prefix, report how much you consumed, write the
//! framed payload to the output slice.
//!
//! Returns, for every parser: `0` means "not enough data yet", a
//! positive number is bytes consumed from the head of `input`, and `-1`
//! means the output slice was too small to hold the payload (the out-len
//! is also set to `-1` in that case, matching the C original).

/// Pack `payload` as `u16` big-endian length prefix followed by the bytes.
/// Returns `None` if `pack_data` is too small or `payload` exceeds
/// `u16::MAX`.
pub fn pack16(payload: &[u8], out: &mut [u8]) -> Option<usize> {
    if payload.len() > u16::MAX as usize {
        return None;
    }
    let total = payload.len() + 2;
    if out.len() < total {
        return None;
    }
    out[..2].copy_from_slice(&(payload.len() as u16).to_be_bytes());
    out[2..total].copy_from_slice(payload);
    Some(total)
}

/// Parse a `pack16`-framed message from the head of `input`.
///
/// `out` receives the payload. Returns `0` if `input` doesn't yet hold a
/// complete frame, `-1` if `out` is too small for the payload, otherwise
/// the number of bytes consumed from `input`.
pub fn parse16(input: &[u8], out: &mut [u8]) -> i64 {
    if input.len() <= 2 {
        return 0;
    }
    let len = u16::from_be_bytes([input[0], input[1]]) as usize;
    if len + 2 > input.len() {
        return 0;
    }
    if len > out.len() {
        return -1;
    }
    out[..len].copy_from_slice(&input[2..2 + len]);
    (len + 2) as i64
}

/// Pack `payload` as a `u32` big-endian length prefix followed by the bytes.
pub fn pack32(payload: &[u8], out: &mut [u8]) -> Option<usize> {
    if payload.len() > u32::MAX as usize {
        return None;
    }
    let total = payload.len() + 4;
    if out.len() < total {
        return None;
    }
    out[..4].copy_from_slice(&(payload.len() as u32).to_be_bytes());
    out[4..total].copy_from_slice(payload);
    Some(total)
}

/// Parse a `pack32`-framed message from the head of `input`.
pub fn parse32(input: &[u8], out: &mut [u8]) -> i64 {
    if input.len() <= 4 {
        return 0;
    }
    let len = u32::from_be_bytes([input[0], input[1], input[2], input[3]]) as usize;
    if len.checked_add(4).map(|n| n > input.len()).unwrap_or(true) {
        return 0;
    }
    if len > out.len() {
        return -1;
    }
    out[..len].copy_from_slice(&input[4..4 + len]);
    (len + 4) as i64
}

/// Pack `payload` as a newline-terminated text line. A trailing `\n` (or
/// `\0`) already present in `payload` is not duplicated.
pub fn pack_text(payload: &[u8], out: &mut [u8]) -> Option<usize> {
    let needs_newline = !matches!(payload.last(), Some(b'\n') | Some(b'\0'));
    let total = payload.len() + if needs_newline { 1 } else { 0 };
    if out.len() < total {
        return None;
    }
    out[..payload.len()].copy_from_slice(payload);
    if needs_newline {
        out[payload.len()] = b'\n';
    }
    Some(total)
}

/// Parse a text line from the head of `input`.
///
/// `\r` bytes are rewritten to `\0` in place; the line is terminated by
/// `\n` or `\0` (and `out` is left null-terminated, i.e. the byte that
/// ended the line is written as `\0`, matching the C parser). Returns `0`
/// if no terminator has arrived yet.
pub fn parse_text(input: &[u8], out: &mut [u8]) -> i64 {
    for (i, &b) in input.iter().enumerate() {
        if i >= out.len() {
            return -1;
        }
        match b {
            b'\n' | b'\0' => {
                out[i] = b'\0';
                return (i + 1) as i64;
            }
            b'\r' => out[i] = b'\0',
            other => out[i] = other,
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack16_roundtrip() {
        let payload = b"hello world";
        let mut packed = [0u8; 32];
        let n = pack16(payload, &mut packed).unwrap();

        let mut parsed = [0u8; 32];
        let consumed = parse16(&packed[..n], &mut parsed);
        assert_eq!(consumed, n as i64);
        assert_eq!(&parsed[..payload.len()], payload);
    }

    #[test]
    fn parse16_needs_more_data() {
        let mut out = [0u8; 8];
        assert_eq!(parse16(&[0, 5, b'a', b'b'], &mut out), 0);
    }

    #[test]
    fn parse16_output_too_small_reports_negative_one() {
        let mut packed = [0u8; 16];
        let n = pack16(b"abcdef", &mut packed).unwrap();
        let mut out = [0u8; 2];
        assert_eq!(parse16(&packed[..n], &mut out), -1);
    }

    #[test]
    fn pack32_roundtrip() {
        let payload = vec![7u8; 300];
        let mut packed = vec![0u8; 400];
        let n = pack32(&payload, &mut packed).unwrap();
        let mut parsed = vec![0u8; 400];
        let consumed = parse32(&packed[..n], &mut parsed);
        assert_eq!(consumed, n as i64);
        assert_eq!(&parsed[..payload.len()], &payload[..]);
    }

    #[test]
    fn text_strips_trailing_cr_and_null_terminates() {
        let mut packed = [0u8; 32];
        let n = pack_text(b"hello\r\n", &mut packed).unwrap();
        assert_eq!(&packed[..n], b"hello\r\n");

        let mut parsed = [0u8; 32];
        let consumed = parse_text(&packed[..n], &mut parsed);
        assert_eq!(consumed, 6); // "hello\r" consumed up to and including \n
        assert_eq!(&parsed[..5], b"hello");
        assert_eq!(parsed[5], b'\0'); // \r rewritten
    }

    #[test]
    fn text_adds_newline_when_absent() {
        let mut packed = [0u8; 32];
        let n = pack_text(b"hi", &mut packed).unwrap();
        assert_eq!(&packed[..n], b"hi\n");
    }

    #[test]
    fn text_incomplete_without_terminator() {
        let mut out = [0u8; 8];
        assert_eq!(parse_text(b"no newline yet", &mut out), 0);
    }
}
