//! `Range` / `Content-Range` parsing for the disk protocol.
//!
//! Only the single-range forms are accepted:
//!
//! - `Range: bytes=<begin>-<end>` on `GET`
//! - `Content-Range: bytes <begin>-<end>/<total>` on `PUT` (`total` may be `*`)
//!
//! Both bounds are inclusive. Suffix and open-ended ranges are rejected.

use http::{HeaderValue, StatusCode};

/// Upper bound on the bytes returned by a single `GET`.
pub const MAX_READ_BYTES: u64 = 128 * 1024 * 1024;

/// An inclusive byte range (`start..=end`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Length of this range in bytes.
    pub fn len(self) -> u64 {
        // `end` is inclusive.
        debug_assert!(self.start <= self.end);
        self.end - self.start + 1
    }

    pub fn is_empty(self) -> bool {
        self.start > self.end
    }

    /// Shorten the range so it covers at most `max_len` bytes.
    pub fn clamp_len(self, max_len: u64) -> Self {
        if self.len() <= max_len {
            return self;
        }
        Self {
            start: self.start,
            end: self.start + max_len - 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RangeError {
    #[error("missing {0} header")]
    Missing(&'static str),
    #[error("malformed {0} header")]
    Malformed(&'static str),
    #[error("range {start}-{end} is not satisfiable for {capacity} bytes")]
    Unsatisfiable { start: u64, end: u64, capacity: u64 },
}

impl RangeError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Missing(_) => StatusCode::BAD_REQUEST,
            Self::Malformed(_) | Self::Unsatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
        }
    }
}

/// Parse a `GET` `Range` header against a device of `capacity` bytes.
pub fn parse_range(value: Option<&HeaderValue>, capacity: u64) -> Result<ByteRange, RangeError> {
    const NAME: &str = "Range";
    let value = value.ok_or(RangeError::Missing(NAME))?;
    let value = value.to_str().map_err(|_| RangeError::Malformed(NAME))?;

    let (unit, spec) = value
        .trim()
        .split_once('=')
        .ok_or(RangeError::Malformed(NAME))?;
    if !unit.trim().eq_ignore_ascii_case("bytes") {
        return Err(RangeError::Malformed(NAME));
    }
    let (start, end) = parse_bounds(spec).ok_or(RangeError::Malformed(NAME))?;
    validate(start, end, capacity, NAME)
}

/// Parse a `PUT` `Content-Range` header against a device of `capacity` bytes.
///
/// The complete-length field is checked for syntax only.
pub fn parse_content_range(
    value: Option<&HeaderValue>,
    capacity: u64,
) -> Result<ByteRange, RangeError> {
    const NAME: &str = "Content-Range";
    let value = value.ok_or(RangeError::Missing(NAME))?;
    let value = value.to_str().map_err(|_| RangeError::Malformed(NAME))?;

    let (unit, rest) = value
        .trim()
        .split_once(' ')
        .ok_or(RangeError::Malformed(NAME))?;
    if !unit.eq_ignore_ascii_case("bytes") {
        return Err(RangeError::Malformed(NAME));
    }
    let (spec, total) = rest.split_once('/').ok_or(RangeError::Malformed(NAME))?;
    let total = total.trim();
    if total != "*" && parse_u64(total).is_none() {
        return Err(RangeError::Malformed(NAME));
    }
    let (start, end) = parse_bounds(spec).ok_or(RangeError::Malformed(NAME))?;
    validate(start, end, capacity, NAME)
}

fn parse_bounds(spec: &str) -> Option<(u64, u64)> {
    let (start, end) = spec.trim().split_once('-')?;
    Some((parse_u64(start)?, parse_u64(end)?))
}

fn parse_u64(s: &str) -> Option<u64> {
    let s = s.trim();
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

fn validate(
    start: u64,
    end: u64,
    capacity: u64,
    name: &'static str,
) -> Result<ByteRange, RangeError> {
    if start > end {
        return Err(RangeError::Malformed(name));
    }
    // Ranges that run past the end of the device are allowed and read short.
    if end - start >= capacity {
        return Err(RangeError::Unsatisfiable {
            start,
            end,
            capacity,
        });
    }
    Ok(ByteRange { start, end })
}

#[cfg(test)]
mod tests {
    use super::*;

    const CAP: u64 = 10_485_760;

    fn range(s: &str) -> Result<ByteRange, RangeError> {
        parse_range(Some(&HeaderValue::from_str(s).unwrap()), CAP)
    }

    fn content_range(s: &str) -> Result<ByteRange, RangeError> {
        parse_content_range(Some(&HeaderValue::from_str(s).unwrap()), CAP)
    }

    #[test]
    fn missing_headers_are_bad_requests() {
        assert_eq!(
            parse_range(None, CAP).unwrap_err().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            parse_content_range(None, CAP).unwrap_err().status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn parses_inclusive_ranges() {
        assert_eq!(
            range("bytes=0-1048575").unwrap(),
            ByteRange {
                start: 0,
                end: 1_048_575
            }
        );
        assert_eq!(range(" bytes = 5-5 ").unwrap().len(), 1);
        assert_eq!(
            content_range("bytes 100-199/10485760").unwrap(),
            ByteRange {
                start: 100,
                end: 199
            }
        );
        assert_eq!(content_range("bytes 0-0/*").unwrap().len(), 1);
    }

    #[test]
    fn rejects_malformed_values_with_416() {
        for value in [
            "bytes=",
            "bytes=1",
            "bytes=-5",
            "bytes=5-",
            "bytes=a-b",
            "bytes=+1-2",
            "bytes=0-1,4-5",
            "items=0-1",
            "bytes=9-3",
        ] {
            let err = range(value).unwrap_err();
            assert_eq!(err.status(), StatusCode::RANGE_NOT_SATISFIABLE, "{value}");
        }
        for value in [
            "bytes 0-1",
            "bytes=0-1/10",
            "bytes 0-1/abc",
            "items 0-1/10",
            "bytes 3-2/10",
        ] {
            let err = content_range(value).unwrap_err();
            assert_eq!(err.status(), StatusCode::RANGE_NOT_SATISFIABLE, "{value}");
        }
    }

    #[test]
    fn rejects_ranges_wider_than_capacity() {
        assert!(matches!(
            range("bytes=0-10485760"),
            Err(RangeError::Unsatisfiable { .. })
        ));
        assert!(matches!(
            content_range("bytes 5-10485765/10485760"),
            Err(RangeError::Unsatisfiable { .. })
        ));
        assert!(range("bytes=0-10485759").is_ok());
        assert!(parse_range(Some(&HeaderValue::from_static("bytes=0-0")), 0).is_err());
    }

    #[test]
    fn ranges_past_the_end_are_accepted() {
        assert_eq!(
            range("bytes=10485759-10485765").unwrap(),
            ByteRange {
                start: 10_485_759,
                end: 10_485_765
            }
        );
        assert!(range("bytes=10485760-10485760").is_ok());
        assert!(content_range("bytes 10485760-10485763/10485760").is_ok());
    }

    #[test]
    fn clamps_to_read_ceiling() {
        let r = ByteRange {
            start: 10,
            end: 10 + 2 * MAX_READ_BYTES,
        };
        let clamped = r.clamp_len(MAX_READ_BYTES);
        assert_eq!(clamped.start, 10);
        assert_eq!(clamped.len(), MAX_READ_BYTES);

        let small = ByteRange { start: 0, end: 99 };
        assert_eq!(small.clamp_len(MAX_READ_BYTES), small);
    }

    #[test]
    fn large_offsets_round_trip_without_truncation() {
        let value = HeaderValue::from_static("bytes=4294967296-4294967400");
        let r = parse_range(Some(&value), 5_000_000_000).unwrap();
        assert_eq!(r.start, 4_294_967_296);
        assert_eq!(r.len(), 105);
    }
}
