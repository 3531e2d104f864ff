//! Request body decoding for `PUT`: plain `Content-Range`-sized bodies and
//! `Transfer-Encoding: chunked`.

use std::io;

use bytes::Bytes;
use http::header::TRANSFER_ENCODING;
use http::HeaderMap;
use tokio::io::{AsyncBufRead, AsyncReadExt};

use super::{read_line, Line};

/// Longest accepted chunk-size or trailer line.
const MAX_CHUNK_LINE: usize = 4096;

/// Initial buffer reservation; larger bodies grow as data actually arrives.
const INITIAL_BODY_CAPACITY: u64 = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("body ended after {received} of {expected} bytes")]
    Truncated { expected: u64, received: u64 },
    #[error("chunked body carried {actual} bytes but the range declares {expected}")]
    LengthMismatch { expected: u64, actual: u64 },
    #[error("unsupported transfer-encoding {0:?}")]
    UnsupportedEncoding(String),
    #[error("malformed chunk framing")]
    InvalidChunk,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Read a request body that must carry exactly `expected` bytes.
pub async fn read_body<R>(
    reader: &mut R,
    headers: &HeaderMap,
    expected: u64,
) -> Result<Bytes, TransferError>
where
    R: AsyncBufRead + Unpin,
{
    match headers.get(TRANSFER_ENCODING) {
        None => read_plain(reader, expected).await,
        Some(value) => {
            let encoding = String::from_utf8_lossy(value.as_bytes()).trim().to_string();
            if encoding.eq_ignore_ascii_case("chunked") {
                read_chunked(reader, expected).await
            } else {
                Err(TransferError::UnsupportedEncoding(encoding))
            }
        }
    }
}

async fn read_plain<R>(reader: &mut R, expected: u64) -> Result<Bytes, TransferError>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::with_capacity(expected.min(INITIAL_BODY_CAPACITY) as usize);
    (&mut *reader).take(expected).read_to_end(&mut buf).await?;
    let received = buf.len() as u64;
    if received < expected {
        return Err(TransferError::Truncated { expected, received });
    }
    Ok(Bytes::from(buf))
}

async fn read_chunked<R>(reader: &mut R, expected: u64) -> Result<Bytes, TransferError>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::with_capacity(expected.min(INITIAL_BODY_CAPACITY) as usize);
    loop {
        let received = buf.len() as u64;
        let line = match read_line(reader, MAX_CHUNK_LINE).await {
            Ok(Line::Line(line)) => line,
            Ok(Line::Eof) => return Err(TransferError::Truncated { expected, received }),
            Ok(Line::TooLong) => return Err(TransferError::InvalidChunk),
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(TransferError::Truncated { expected, received })
            }
            Err(err) => return Err(err.into()),
        };

        let size = parse_chunk_size(&line).ok_or(TransferError::InvalidChunk)?;
        if size == 0 {
            skip_trailers(reader).await?;
            break;
        }

        // Stop early instead of buffering a body that can never match.
        let actual = received.saturating_add(size);
        if actual > expected {
            return Err(TransferError::LengthMismatch { expected, actual });
        }

        let n = (&mut *reader).take(size).read_to_end(&mut buf).await? as u64;
        if n < size {
            return Err(TransferError::Truncated {
                expected,
                received: buf.len() as u64,
            });
        }

        match read_line(reader, 0).await {
            Ok(Line::Line(_)) => {}
            Ok(Line::TooLong) => return Err(TransferError::InvalidChunk),
            Ok(Line::Eof) | Err(_) => {
                return Err(TransferError::Truncated {
                    expected,
                    received: buf.len() as u64,
                })
            }
        }
    }

    let actual = buf.len() as u64;
    if actual != expected {
        return Err(TransferError::LengthMismatch { expected, actual });
    }
    Ok(Bytes::from(buf))
}

/// Parse `<hex-size>[;extensions]`.
fn parse_chunk_size(line: &[u8]) -> Option<u64> {
    let line = std::str::from_utf8(line).ok()?;
    let size = line.split(';').next()?.trim();
    if size.is_empty() || !size.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u64::from_str_radix(size, 16).ok()
}

async fn skip_trailers<R>(reader: &mut R) -> Result<(), TransferError>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        match read_line(reader, MAX_CHUNK_LINE).await {
            Ok(Line::Line(line)) if line.is_empty() => return Ok(()),
            Ok(Line::Line(_)) => continue,
            // A client that closes right after the last chunk still sent a complete body.
            Ok(Line::Eof) => return Ok(()),
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Ok(Line::TooLong) => return Err(TransferError::InvalidChunk),
            Err(err) => return Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn chunked() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers
    }

    async fn decode(
        input: &[u8],
        headers: &HeaderMap,
        expected: u64,
    ) -> Result<Bytes, TransferError> {
        let mut reader = input;
        read_body(&mut reader, headers, expected).await
    }

    #[tokio::test]
    async fn plain_body_of_declared_length() {
        let body = decode(b"hello world", &HeaderMap::new(), 5).await.unwrap();
        assert_eq!(&body[..], b"hello");
    }

    #[tokio::test]
    async fn plain_body_too_short_is_truncated() {
        let err = decode(b"abc", &HeaderMap::new(), 10).await.unwrap_err();
        assert!(matches!(
            err,
            TransferError::Truncated {
                expected: 10,
                received: 3
            }
        ));
    }

    #[tokio::test]
    async fn chunked_body_is_concatenated() {
        let input = b"4\r\nWiki\r\n5;name=val\r\npedia\r\nE\r\n in\r\n\r\nchunks.\r\n0\r\nX-Trailer: 1\r\n\r\n";
        let body = decode(input, &chunked(), 23).await.unwrap();
        assert_eq!(&body[..], b"Wikipedia in\r\n\r\nchunks.");
    }

    #[tokio::test]
    async fn chunked_length_mismatch_is_rejected() {
        let short = decode(b"3\r\nabc\r\n0\r\n\r\n", &chunked(), 4).await.unwrap_err();
        assert!(matches!(
            short,
            TransferError::LengthMismatch {
                expected: 4,
                actual: 3
            }
        ));

        let long = decode(b"5\r\nabcde\r\n0\r\n\r\n", &chunked(), 4).await.unwrap_err();
        assert!(matches!(long, TransferError::LengthMismatch { .. }));
    }

    #[tokio::test]
    async fn chunked_framing_errors() {
        assert!(matches!(
            decode(b"zz\r\nabc\r\n0\r\n\r\n", &chunked(), 3).await,
            Err(TransferError::InvalidChunk)
        ));
        assert!(matches!(
            decode(b"3\r\nabcXY0\r\n\r\n", &chunked(), 3).await,
            Err(TransferError::InvalidChunk)
        ));
        assert!(matches!(
            decode(b"8\r\nabc", &chunked(), 8).await,
            Err(TransferError::Truncated { .. })
        ));
        assert!(matches!(
            decode(b"3\r\nabc\r\n", &chunked(), 3).await,
            Err(TransferError::Truncated { .. })
        ));
    }

    #[tokio::test]
    async fn other_transfer_encodings_are_refused() {
        let mut headers = HeaderMap::new();
        headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("gzip, chunked"));
        assert!(matches!(
            decode(b"", &headers, 1).await,
            Err(TransferError::UnsupportedEncoding(_))
        ));
    }
}
