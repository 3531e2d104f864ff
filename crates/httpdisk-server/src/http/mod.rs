//! Minimal HTTP/1.1 framing for the disk protocol.
//!
//! The server handles exactly one request per connection, so there is no keep-alive or
//! pipelining support here.

pub mod body;
pub mod range;
pub mod request;
pub mod response;

use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

pub(crate) enum Line {
    Line(Vec<u8>),
    Eof,
    TooLong,
}

/// Read one line terminated by `\n` (an optional preceding `\r` is stripped), consuming at most
/// `limit` bytes of payload plus the terminator.
///
/// A line cut short by end of stream is reported as `UnexpectedEof`.
pub(crate) async fn read_line<R>(reader: &mut R, limit: usize) -> io::Result<Line>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    // +2 leaves room for the CRLF terminator.
    let n = (&mut *reader)
        .take(limit as u64 + 2)
        .read_until(b'\n', &mut buf)
        .await?;
    if n == 0 {
        return Ok(Line::Eof);
    }
    if buf.last() != Some(&b'\n') {
        if buf.len() >= limit {
            return Ok(Line::TooLong);
        }
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "stream ended mid-line",
        ));
    }
    buf.pop();
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    if buf.len() > limit {
        return Ok(Line::TooLong);
    }
    Ok(Line::Line(buf))
}
