//! Protocol client
//!
//! Speaks the request-sequence protocol to a running server. Used by the
//! operator commands that ask a live server to load a model.

use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// Send one request sequence (header + payload, terminator appended) and
/// return whatever the server writes back before closing
pub async fn send_sequence(addr: &str, messages: &[Value]) -> Result<Vec<u8>> {
    let mut stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("Failed to connect to Bao server at {}", addr))?;

    let terminator = json!({"final": true});
    let mut body = String::new();
    for message in messages.iter().chain(std::iter::once(&terminator)) {
        body.push_str(&serde_json::to_string(message)?);
        body.push('\n');
    }

    stream.write_all(body.as_bytes()).await?;
    stream.shutdown().await?;

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await?;
    debug!("Received {} response bytes from {}", response.len(), addr);
    Ok(response)
}

/// Ask the server to load (and gate) the model saved at `path`
pub async fn send_model_load(addr: &str, path: &Path) -> Result<()> {
    let path = path.to_str().context("Model path is not valid UTF-8")?;
    send_sequence(addr, &[json!({"type": "load model"}), json!({"path": path})]).await?;
    Ok(())
}
