//! Incremental parser for the CGI header block a backend writes to stdout.
//!
//! The block is a run of `Name: value` lines (LF or CRLF terminated) closed by one empty
//! line; every byte after that line is response body. There is no length prefix, so the
//! parser keeps the unconsumed bytes in a single `BytesMut`, advances over each complete
//! line, and remembers how far it has already searched so a partial line is never
//! rescanned from the start. Reads may split lines, and the terminator, anywhere.

use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use bytes::{Buf, Bytes, BytesMut};
use memchr::memchr;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::config::HeaderPolicy;
use crate::errors::GatewayError;

/// CGI pseudo-header that sets the HTTP status instead of being forwarded.
const STATUS_HEADER: &str = "status";

/// Headers collected from the CGI block, ready to become the HTTP response head.
#[derive(Debug, Clone, PartialEq)]
pub struct CgiHeaders {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

impl Default for CgiHeaders {
    fn default() -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
        }
    }
}

/// Result of scanning the bytes buffered so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseProgress {
    /// No complete line is pending; feed more bytes.
    NeedMore,
    /// The empty terminator line was consumed.
    Complete,
    /// A line without a colon ended the block early; nothing of it was applied.
    Malformed(String),
}

/// Outcome of reading a header block from a stream.
#[derive(Debug)]
pub enum HeaderOutcome {
    /// Terminator found; `body_prefix` holds body bytes that arrived with the headers.
    Complete {
        headers: CgiHeaders,
        body_prefix: Bytes,
    },
    /// Stream ended or a line was malformed before the terminator (permissive policy).
    /// The response carries the headers seen so far and no body.
    Truncated { headers: CgiHeaders },
}

#[derive(Debug, Default)]
pub struct CgiHeaderParser {
    buffer: BytesMut,
    /// Prefix of `buffer` already known to contain no `\n`.
    searched: usize,
    headers: CgiHeaders,
    /// Header lines that had a colon but could not become an HTTP header.
    skipped: Vec<String>,
    complete: bool,
}

impl CgiHeaderParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Append `chunk` and scan it.
    pub fn push(&mut self, chunk: &[u8]) -> ParseProgress {
        self.buffer.extend_from_slice(chunk);
        self.scan()
    }

    /// Consume every complete line currently buffered.
    pub fn scan(&mut self) -> ParseProgress {
        if self.complete {
            return ParseProgress::Complete;
        }
        loop {
            let Some(offset) = memchr(b'\n', &self.buffer[self.searched..]) else {
                self.searched = self.buffer.len();
                return ParseProgress::NeedMore;
            };
            let end = self.searched + offset;
            let line = trim_cr(&self.buffer[..end]);

            if line.is_empty() {
                self.buffer.advance(end + 1);
                self.searched = 0;
                self.complete = true;
                return ParseProgress::Complete;
            }

            match apply_line(&mut self.headers, line) {
                Ok(LineOutcome::Applied) => {}
                Ok(LineOutcome::Skipped(reason)) => {
                    tracing::warn!("Skipped CGI header: {}", reason);
                    self.skipped.push(reason);
                }
                Err(reason) => return ParseProgress::Malformed(reason),
            }
            self.buffer.advance(end + 1);
            self.searched = 0;
        }
    }

    pub fn headers(&self) -> &CgiHeaders {
        &self.headers
    }

    /// Reasons for every header line dropped so far.
    pub fn skipped(&self) -> &[String] {
        &self.skipped
    }

    /// Split into the parsed headers and the bytes following the terminator.
    ///
    /// Before completion the buffered bytes are an unfinished header line, not body,
    /// so they are dropped.
    pub fn into_parts(self) -> (CgiHeaders, Bytes) {
        let body = if self.complete {
            self.buffer.freeze()
        } else {
            Bytes::new()
        };
        (self.headers, body)
    }

    /// Read from `reader` until the header block ends, then hand back whatever body
    /// bytes were read along with it.
    pub async fn read_from<R>(
        mut self,
        reader: &mut R,
        policy: HeaderPolicy,
        read_size: usize,
    ) -> Result<HeaderOutcome, GatewayError>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let progress = self.scan();
            if policy == HeaderPolicy::Strict {
                if let Some(reason) = self.skipped.first() {
                    return Err(GatewayError::malformed_headers(reason.clone()));
                }
            }
            match progress {
                ParseProgress::Complete => {
                    let (headers, body_prefix) = self.into_parts();
                    return Ok(HeaderOutcome::Complete {
                        headers,
                        body_prefix,
                    });
                }
                ParseProgress::Malformed(reason) => {
                    return self.truncate(policy, reason);
                }
                ParseProgress::NeedMore => {}
            }

            self.buffer.reserve(read_size);
            if reader.read_buf(&mut self.buffer).await? == 0 {
                return self.truncate(
                    policy,
                    "backend output ended before the header terminator".into(),
                );
            }
        }
    }

    fn truncate(
        self,
        policy: HeaderPolicy,
        reason: String,
    ) -> Result<HeaderOutcome, GatewayError> {
        match policy {
            HeaderPolicy::Strict => Err(GatewayError::malformed_headers(reason)),
            HeaderPolicy::Permissive => {
                tracing::warn!("Stopped parsing CGI headers: {}", reason);
                Ok(HeaderOutcome::Truncated {
                    headers: self.headers,
                })
            }
        }
    }
}

fn trim_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

enum LineOutcome {
    Applied,
    /// The line is a header, but its name, value or status is not representable.
    Skipped(String),
}

/// Split at the first `:` and record the header, overwriting an earlier value.
///
/// Only a line without a colon is an error; it ends the header block.
fn apply_line(headers: &mut CgiHeaders, line: &[u8]) -> Result<LineOutcome, String> {
    let Some(colon) = memchr(b':', line) else {
        return Err(format!(
            "header line without a colon: {:?}",
            String::from_utf8_lossy(line)
        ));
    };
    let name = line[..colon].trim_ascii();
    let value = line[colon + 1..].trim_ascii();

    if name.eq_ignore_ascii_case(STATUS_HEADER.as_bytes()) {
        return Ok(match parse_status(value) {
            Ok(status) => {
                headers.status = status;
                LineOutcome::Applied
            }
            Err(reason) => LineOutcome::Skipped(reason),
        });
    }

    let Ok(header_name) = HeaderName::from_bytes(name) else {
        return Ok(LineOutcome::Skipped(format!(
            "invalid header name {:?}",
            String::from_utf8_lossy(name)
        )));
    };
    let Ok(header_value) = HeaderValue::from_bytes(value) else {
        return Ok(LineOutcome::Skipped(format!("invalid value for header {header_name}")));
    };
    headers.headers.insert(header_name, header_value);
    Ok(LineOutcome::Applied)
}

/// `Status: 404 Not Found` carries the code in its first token.
fn parse_status(value: &[u8]) -> Result<StatusCode, String> {
    let code = value.split(|b| *b == b' ').next().unwrap_or_default();
    StatusCode::from_bytes(code)
        .map_err(|_| format!("invalid CGI status {:?}", String::from_utf8_lossy(value)))
}
