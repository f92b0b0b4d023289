//! SAM v3 bridge protocol: newline-terminated commands, one reply line
//! each, `TOPIC KIND KEY=VALUE ...`.
//!
//! Lines are read one byte at a time. After `STREAM CONNECT` the same
//! socket carries application data, so buffering past the newline would
//! swallow the peer's first bytes.

use std::collections::HashMap;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::TransportError;

pub(crate) const SAM_VERSION: &str = "3.1";

const MAX_LINE: usize = 64 * 1024;

/// Reads one `\n`-terminated line, without the terminator.
pub(crate) async fn read_line<R>(reader: &mut R) -> Result<String, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut line = Vec::new();
    loop {
        let byte = reader.read_u8().await?;
        if byte == b'\n' {
            break;
        }
        if line.len() >= MAX_LINE {
            return Err(TransportError::Protocol("SAM line too long".to_string()));
        }
        line.push(byte);
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    String::from_utf8(line).map_err(|_| TransportError::Protocol("SAM line is not utf-8".to_string()))
}

/// A parsed SAM reply line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SamReply {
    pub topic: String,
    pub kind: String,
    values: HashMap<String, String>,
}

impl SamReply {
    pub(crate) fn parse(line: &str) -> Result<Self, TransportError> {
        let mut tokens = tokenize(line).into_iter();
        let topic = tokens
            .next()
            .ok_or_else(|| TransportError::Protocol("empty SAM reply".to_string()))?;
        let kind = tokens
            .next()
            .ok_or_else(|| TransportError::Protocol(format!("truncated SAM reply '{}'", line)))?;

        let values = tokens
            .filter_map(|token| {
                token
                    .split_once('=')
                    .map(|(k, v)| (k.to_string(), v.to_string()))
            })
            .collect();

        Ok(Self { topic, kind, values })
    }

    pub(crate) fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Fails unless the reply carries `RESULT=OK`.
    pub(crate) fn ensure_ok(&self) -> Result<(), TransportError> {
        match self.get("RESULT") {
            Some("OK") => Ok(()),
            result => Err(TransportError::Protocol(format!(
                "{} {} failed: {} {}",
                self.topic,
                self.kind,
                result.unwrap_or("no result"),
                self.get("MESSAGE").unwrap_or("")
            ))),
        }
    }
}

/// Splits on whitespace, keeping double-quoted runs together and
/// stripping the quotes.
fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for c in line.chars() {
        match c {
            '"' => in_quotes = !in_quotes,
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Sends one command line and reads its reply.
pub(crate) async fn command(stream: &mut TcpStream, line: &str) -> Result<SamReply, TransportError> {
    stream.write_all(line.as_bytes()).await?;
    stream.write_all(b"\n").await?;
    stream.flush().await?;
    SamReply::parse(&read_line(stream).await?)
}

/// Opens a bridge connection and completes the version handshake.
pub(crate) async fn hello(sam_addr: &str) -> Result<TcpStream, TransportError> {
    let mut stream = TcpStream::connect(sam_addr)
        .await
        .map_err(|e| TransportError::connection(sam_addr, format!("SAM bridge: {}", e)))?;
    let reply = command(
        &mut stream,
        &format!("HELLO VERSION MIN={} MAX={}", SAM_VERSION, SAM_VERSION),
    )
    .await?;
    if reply.topic != "HELLO" || reply.kind != "REPLY" {
        return Err(TransportError::Protocol(format!(
            "unexpected SAM greeting {} {}",
            reply.topic, reply.kind
        )));
    }
    reply.ensure_ok()?;
    Ok(stream)
}
