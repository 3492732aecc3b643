use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use clap::{Parser, Subcommand};
use envelopes::{
    DEFAULT_MAX_INBOUND_BYTES, Envelope, LENGTH_PREFIX_BYTES, MAX_OUTBOUND_BYTES, Outcome, PING, Request, Response,
    VERSION,
};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("failed to start host {path}: {source}")]
    Spawn { path: String, source: io::Error },
    #[error("host stdio failed: {0}")]
    Io(#[from] io::Error),
    #[error("envelope codec failed: {0}")]
    Codec(#[from] envelopes::CodecError),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("timed out waiting for host response")]
    Timeout,
    #[error("host closed its output before responding")]
    HostClosed,
    #[error("host returned error for {command}: {message}")]
    HostError { command: String, message: String },
    #[error("host returned a malformed reader list")]
    MalformedReaders,
}

#[derive(Parser, Debug)]
#[command(name = "webcard-cli", about = "Drive a webcard native messaging host over stdio")]
struct Cli {
    /// Path of the native host executable.
    #[arg(long, env = "WEBCARD_HOST_BIN", default_value = "webcard-host")]
    host: PathBuf,

    #[arg(long, env = "WEBCARD_TIMEOUT_MS", default_value_t = 5_000)]
    timeout_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    ListReaders,
    Ping,
    Version,
}

impl Command {
    fn request(self) -> Request {
        match self {
            Self::ListReaders => Request::list_readers(),
            Self::Ping => Request::new(PING),
            Self::Version => Request::new(VERSION),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    let cli = Cli::parse();
    let request = cli.command.request();
    let response = round_trip(&cli.host, &request, Duration::from_millis(cli.timeout_ms)).await?;
    for line in render(cli.command, &request, response)? {
        println!("{line}");
    }
    Ok(())
}

/// Spawn the host, send one request, and wait for its response.
async fn round_trip(host: &Path, request: &Request, timeout: Duration) -> Result<Response, CliError> {
    let mut child = tokio::process::Command::new(host)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| CliError::Spawn { path: host.display().to_string(), source })?;
    let mut stdin = child.stdin.take().ok_or(CliError::HostClosed)?;
    let mut stdout = child.stdout.take().ok_or(CliError::HostClosed)?;

    let payload = envelopes::encode_envelope_bytes(&Envelope::Request(request.clone()))?;
    stdin
        .write_all(&envelopes::frame_message(&payload, DEFAULT_MAX_INBOUND_BYTES)?)
        .await?;
    stdin.flush().await?;

    let response = wait_for_response(&mut stdout, &request.id, timeout).await;

    // Closing stdin is how the browser tells a host to exit.
    drop(stdin);
    let _ = tokio::time::timeout(Duration::from_secs(1), child.wait()).await;
    response
}

/// Read responses until one answers `request_id`. Id-less replies are accepted.
async fn wait_for_response<R>(output: &mut R, request_id: &str, timeout: Duration) -> Result<Response, CliError>
where
    R: AsyncRead + Unpin,
{
    let fut = async {
        loop {
            let response = recv_next(output).await?;
            match response.id.as_deref() {
                Some(id) if id != request_id => {}
                _ => return Ok(response),
            }
        }
    };

    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| CliError::Timeout)?
}

async fn recv_next<R>(output: &mut R) -> Result<Response, CliError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LENGTH_PREFIX_BYTES];
    output.read_exact(&mut prefix).await.map_err(|error| {
        if error.kind() == io::ErrorKind::UnexpectedEof {
            CliError::HostClosed
        } else {
            CliError::Io(error)
        }
    })?;
    let len = envelopes::frame_len(prefix, MAX_OUTBOUND_BYTES)?;
    let mut payload = vec![0u8; len];
    output.read_exact(&mut payload).await?;

    let value: Value = serde_json::from_slice(&payload)?;
    Ok(envelopes::decode_response(&value)?)
}

/// Lines to print for a successful exchange.
fn render(command: Command, request: &Request, response: Response) -> Result<Vec<String>, CliError> {
    let data = match response.outcome {
        Outcome::Success(data) => data,
        Outcome::Error(message) => {
            return Err(CliError::HostError { command: request.command.clone(), message });
        }
    };

    match (command, data) {
        (Command::ListReaders, data) => {
            let readers: Vec<String> = serde_json::from_value(data).map_err(|_| CliError::MalformedReaders)?;
            if readers.is_empty() {
                Ok(vec!["No readers found".to_owned()])
            } else {
                Ok(readers)
            }
        }
        (_, Value::String(text)) => Ok(vec![text]),
        (_, other) => Ok(vec![serde_json::to_string_pretty(&other)?]),
    }
}

#[cfg(test)]
#[path = "main_test.rs"]
mod tests;
