//! Database session seam
//!
//! The experiment runner only needs to run statements and read single values
//! on one long-lived session. [`PgConnector`] provides that over
//! `tokio-postgres`; tests script their own sessions.

use async_trait::async_trait;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, NoTls, SimpleQueryMessage};
use tracing::{debug, warn};

use crate::error::SessionError;

/// One live database session with mutable session-level settings
#[async_trait]
pub trait DatabaseSession: Send {
    /// Run a statement, discarding any rows it returns
    async fn execute(&mut self, sql: &str) -> Result<(), SessionError>;

    /// First column of the first row, if any
    async fn query_scalar(&mut self, sql: &str) -> Result<Option<String>, SessionError>;
}

/// Opens database sessions
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn DatabaseSession>, SessionError>;
}

/// PostgreSQL connector using a libpq-style connection string
#[derive(Debug, Clone)]
pub struct PgConnector {
    connect_string: String,
}

impl PgConnector {
    pub fn new(connect_string: impl Into<String>) -> Self {
        Self {
            connect_string: connect_string.into(),
        }
    }
}

#[async_trait]
impl SessionConnector for PgConnector {
    async fn connect(&self) -> Result<Box<dyn DatabaseSession>, SessionError> {
        let (client, connection) = tokio_postgres::connect(&self.connect_string, NoTls)
            .await
            .map_err(classify)?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!("PostgreSQL connection closed with error: {}", e);
            }
        });

        debug!("Opened PostgreSQL session");
        Ok(Box::new(PgSession { client }))
    }
}

pub struct PgSession {
    client: Client,
}

#[async_trait]
impl DatabaseSession for PgSession {
    async fn execute(&mut self, sql: &str) -> Result<(), SessionError> {
        self.client.simple_query(sql).await.map_err(classify)?;
        Ok(())
    }

    async fn query_scalar(&mut self, sql: &str) -> Result<Option<String>, SessionError> {
        let messages = self.client.simple_query(sql).await.map_err(classify)?;
        for message in messages {
            if let SimpleQueryMessage::Row(row) = message {
                return Ok(row.get(0).map(str::to_string));
            }
        }
        Ok(None)
    }
}

/// Map a driver error onto the cases the runner distinguishes
fn classify(error: tokio_postgres::Error) -> SessionError {
    let message = error.as_db_error()
        .map(|db| db.message().to_string())
        .unwrap_or_else(|| error.to_string());

    match error.code() {
        Some(code) if *code == SqlState::QUERY_CANCELED => SessionError::Canceled(message),
        Some(code) if *code == SqlState::ADMIN_SHUTDOWN || *code == SqlState::CRASH_SHUTDOWN => {
            SessionError::Connection(message)
        }
        // class 08: connection exception
        Some(code) if code.code().starts_with("08") => SessionError::Connection(message),
        Some(_) if !error.is_closed() => SessionError::Query(message),
        _ => SessionError::Connection(message),
    }
}
