//! Protocol server
//!
//! TCP front end for the PostgreSQL extension. Every connection carries one
//! request sequence; the server answers selection and prediction requests
//! with a single native-endian binary value and closes the connection.

pub mod framing;
pub mod request;

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::serving::{BaoModel, LoadOutcome};
use crate::storage::ExperienceStore;

pub use framing::LineBuffer;
pub use request::{MessageType, Request, RequestAssembler};

const READ_CHUNK: usize = 1024;

/// Shared server state
#[derive(Clone)]
pub struct ServerState {
    pub model: Arc<BaoModel>,
    pub store: ExperienceStore,
}

impl ServerState {
    pub fn new(store: ExperienceStore) -> Self {
        Self {
            model: Arc::new(BaoModel::new(store.clone())),
            store,
        }
    }
}

pub struct ProtocolServer {
    listener: TcpListener,
    state: ServerState,
}

impl ProtocolServer {
    pub async fn bind(addr: &str, state: ServerState) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;
        Ok(Self { listener, state })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn state(&self) -> &ServerState {
        &self.state
    }

    /// Accept connections forever, one task per connection
    pub async fn run(self) -> Result<()> {
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    continue;
                }
            };

            let state = self.state.clone();
            tokio::spawn(async move {
                debug!("Connection from {}", peer);
                if let Err(e) = handle_connection(stream, &state).await {
                    warn!("Connection from {} aborted: {:#}", peer, e);
                }
            });
        }
    }
}

/// Read one request sequence, dispatch it and close the connection
pub async fn handle_connection(mut stream: TcpStream, state: &ServerState) -> Result<()> {
    let mut lines = LineBuffer::new();
    let mut assembler = RequestAssembler::new();
    let mut chunk = [0u8; READ_CHUNK];

    let request = 'read: loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            if lines.pending() > 0 {
                debug!("Connection closed with {} unterminated bytes", lines.pending());
            }
            return Ok(());
        }
        lines.extend(&chunk[..n]);

        while let Some(message) = lines.next_message() {
            if let Some(request) = assembler.push(message?)? {
                break 'read request;
            }
        }
    };

    if let Some(response) = dispatch(request, state).await? {
        stream.write_all(&response).await?;
    }
    stream.shutdown().await?;
    Ok(())
}

/// Run a request; returns the bytes to send back, if any
pub async fn dispatch(request: Request, state: &ServerState) -> Result<Option<Vec<u8>>> {
    match request {
        Request::Query { arms, buffers } => {
            let selected = state.model.select_plan(arms, &buffers).await?;
            Ok(Some(selected.to_ne_bytes().to_vec()))
        }
        Request::Predict { plan, buffers } => {
            let prediction = state.model.predict(plan, &buffers).await?;
            Ok(Some(prediction.to_ne_bytes().to_vec()))
        }
        Request::Reward { plan, buffers, observation } => {
            let plan = plan.with_buffers(&buffers);
            state.store.record_reward(&plan, observation.reward, observation.pid).await?;
            Ok(None)
        }
        Request::LoadModel { path } => {
            match state.model.load_model(&path).await {
                Ok(LoadOutcome::Accepted) => info!("Serving model from {}", path.display()),
                Ok(LoadOutcome::Rejected) => info!("Kept current model, rejected {}", path.display()),
                Err(e) => error!("Failed to load model from {}: {:#}", path.display(), e),
            }
            Ok(None)
        }
    }
}

/// Start the protocol server from configuration and run until Ctrl+C
pub async fn start(config: &Config) -> Result<()> {
    let store = ExperienceStore::open(&config.storage.database_path)
        .await
        .with_context(|| format!("Failed to open experience store {}", config.storage.database_path.display()))?;
    let state = ServerState::new(store);

    if config.models.default_path.exists() {
        info!("Loading existing model from {}", config.models.default_path.display());
        match state.model.load_model(&config.models.default_path).await {
            Ok(outcome) => debug!("Startup model load: {:?}", outcome),
            Err(e) => error!("Failed to load existing model: {:#}", e),
        }
    }

    let server = ProtocolServer::bind(&config.server.address(), state).await?;
    info!("Listening on {}", server.local_addr()?);

    tokio::select! {
        result = server.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            Ok(())
        }
    }
}
