use std::io;

use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version};
use tokio::io::AsyncBufRead;

use super::{read_line, Line};

/// Upper bound on the request line plus headers.
pub const MAX_HEAD_BYTES: usize = 64 * 1024;

#[derive(Debug)]
pub struct RequestHead {
    pub method: Method,
    pub target: String,
    pub version: Version,
    pub headers: HeaderMap,
}

#[derive(Debug, thiserror::Error)]
pub enum HeadError {
    #[error("connection closed before a request was sent")]
    Closed,
    #[error("request head exceeds {MAX_HEAD_BYTES} bytes")]
    TooLarge,
    #[error("malformed request line")]
    BadRequestLine,
    #[error("malformed header line")]
    BadHeader,
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl HeadError {
    /// Status to answer with, or `None` when there is nobody left to answer.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Closed | Self::Io(_) => None,
            Self::TooLarge => Some(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE),
            Self::BadRequestLine | Self::BadHeader => Some(StatusCode::BAD_REQUEST),
        }
    }
}

/// Read the request line and headers, leaving the reader positioned at the body.
pub async fn read_head<R>(reader: &mut R) -> Result<RequestHead, HeadError>
where
    R: AsyncBufRead + Unpin,
{
    let mut budget = MAX_HEAD_BYTES;

    // Tolerate stray CRLFs ahead of the request line.
    let request_line = loop {
        match next_line(reader, &mut budget).await? {
            None => return Err(HeadError::Closed),
            Some(line) if line.is_empty() => continue,
            Some(line) => break line,
        }
    };
    let (method, target, version) = parse_request_line(&request_line)?;

    let mut headers = HeaderMap::new();
    loop {
        let line = next_line(reader, &mut budget)
            .await?
            .ok_or(HeadError::BadHeader)?;
        if line.is_empty() {
            break;
        }
        let (name, value) = parse_header_line(&line)?;
        headers.append(name, value);
    }

    Ok(RequestHead {
        method,
        target,
        version,
        headers,
    })
}

async fn next_line<R>(reader: &mut R, budget: &mut usize) -> Result<Option<Vec<u8>>, HeadError>
where
    R: AsyncBufRead + Unpin,
{
    match read_line(reader, *budget).await {
        Ok(Line::Line(line)) => {
            *budget = budget.saturating_sub(line.len() + 2);
            Ok(Some(line))
        }
        Ok(Line::Eof) => Ok(None),
        Ok(Line::TooLong) => Err(HeadError::TooLarge),
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn parse_request_line(line: &[u8]) -> Result<(Method, String, Version), HeadError> {
    let line = std::str::from_utf8(line).map_err(|_| HeadError::BadRequestLine)?;
    let mut parts = line.split(' ');
    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(HeadError::BadRequestLine);
    };

    let method = Method::from_bytes(method.as_bytes()).map_err(|_| HeadError::BadRequestLine)?;
    if target.is_empty() {
        return Err(HeadError::BadRequestLine);
    }
    let version = match version {
        "HTTP/1.1" => Version::HTTP_11,
        "HTTP/1.0" => Version::HTTP_10,
        _ => return Err(HeadError::BadRequestLine),
    };
    Ok((method, target.to_string(), version))
}

fn parse_header_line(line: &[u8]) -> Result<(HeaderName, HeaderValue), HeadError> {
    // Obsolete line folding is not supported.
    if matches!(line.first(), Some(b' ' | b'\t')) {
        return Err(HeadError::BadHeader);
    }
    let colon = line
        .iter()
        .position(|&b| b == b':')
        .ok_or(HeadError::BadHeader)?;
    let name = HeaderName::from_bytes(&line[..colon]).map_err(|_| HeadError::BadHeader)?;
    let value = line[colon + 1..].trim_ascii();
    let value = HeaderValue::from_bytes(value).map_err(|_| HeadError::BadHeader)?;
    Ok((name, value))
}
