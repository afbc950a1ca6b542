//! Sinks for the point stream: inline protocol on stdout, or HTTP POST to a
//! local ingestion endpoint. Writes are fire-and-forget; a failed POST is
//! logged and never retried.

use crate::{format_line, Point};
use std::io::{self, Write};
use std::time::Duration;

/// Maximum number of lines joined into a single HTTP POST body.
const HTTP_CHUNK_LINES: usize = 1000;
/// Per-request timeout for sink posts.
const HTTP_POST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("failed to write to stdout: {0}")]
    Io(#[from] io::Error),

    #[error("failed to build http client: {0}")]
    Http(#[from] reqwest::Error),
}

/// Which sink the agent writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    Stdout,
    Http,
}

/// A configured sink. Cheap to share behind an `Arc`; the HTTP client pools
/// its connections internally.
pub struct Output {
    kind: OutputKind,
    addr: String,
    client: Option<reqwest::blocking::Client>,
}

impl Output {
    pub fn new(kind: OutputKind, addr: impl Into<String>) -> Result<Output, SinkError> {
        let client = match kind {
            OutputKind::Stdout => None,
            OutputKind::Http => Some(
                reqwest::blocking::Client::builder()
                    .timeout(HTTP_POST_TIMEOUT)
                    .build()?,
            ),
        };
        Ok(Output {
            kind,
            addr: addr.into(),
            client,
        })
    }

    /// Writes every point of the stream. Points from a single caller are
    /// emitted contiguously; interleaving between concurrent callers is
    /// whatever the OS gives us.
    pub fn emit<I>(&self, points: I) -> Result<(), SinkError>
    where
        I: IntoIterator<Item = Point>,
    {
        match self.kind {
            OutputKind::Stdout => self.emit_stdout(points),
            OutputKind::Http => {
                self.emit_http(points);
                Ok(())
            }
        }
    }

    fn emit_stdout<I>(&self, points: I) -> Result<(), SinkError>
    where
        I: IntoIterator<Item = Point>,
    {
        let stdout = io::stdout();
        let mut out = stdout.lock();
        for point in points {
            writeln!(out, "{}", format_line(&point))?;
        }
        out.flush()?;
        Ok(())
    }

    fn emit_http<I>(&self, points: I)
    where
        I: IntoIterator<Item = Point>,
    {
        let client = match &self.client {
            Some(client) => client,
            None => return,
        };
        let mut chunk = Vec::with_capacity(HTTP_CHUNK_LINES);
        for point in points {
            chunk.push(format_line(&point));
            if chunk.len() == HTTP_CHUNK_LINES {
                post_chunk(client, &self.addr, &chunk);
                chunk.clear();
            }
        }
        if !chunk.is_empty() {
            post_chunk(client, &self.addr, &chunk);
        }
    }
}

fn post_chunk(client: &reqwest::blocking::Client, addr: &str, lines: &[String]) {
    let body = lines.join("\n");
    match client.post(addr).body(body).send() {
        Ok(response) => {
            let status = response.status().as_u16();
            if !matches!(status, 200 | 201 | 204) {
                tracing::warn!(addr, status, "sink rejected datapoint chunk");
            }
        }
        Err(error) => {
            tracing::warn!(addr, %error, "failed to post datapoint chunk");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn stdout_output_needs_no_client() {
        let out = Output::new(OutputKind::Stdout, "").unwrap();
        assert!(out.client.is_none());
        out.emit(Vec::new()).unwrap();
    }
}
