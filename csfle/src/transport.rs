//! Collaborator channels supplied by the embedding driver.
//!
//! The engine never opens database connections itself. Commands go through
//! a [`CommandRunner`]; KMS traffic goes over streams opened by a
//! [`StreamConnector`].

use std::io;

use async_trait::async_trait;
use bson::Document;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Boxed error returned by collaborator implementations.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Runs a database command and returns the raw reply.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs `command` against database `db`.
    ///
    /// # Errors
    ///
    /// Returns an error if the command could not be delivered or no reply
    /// was received. Server-side failures are reported in the reply's `ok`
    /// field instead.
    async fn run_command(&self, db: &str, command: Document) -> Result<Document, BoxError>;
}

/// A bidirectional byte stream to a KMS endpoint.
pub trait KmsStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> KmsStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Opens streams to KMS endpoints.
///
/// TLS is the connector's concern; the engine only speaks HTTP over
/// whatever stream it gets back.
#[async_trait]
pub trait StreamConnector: Send + Sync {
    /// Connects to `endpoint` (`host:port`).
    ///
    /// # Errors
    ///
    /// Returns the I/O error of a failed connection attempt.
    async fn connect(&self, endpoint: &str) -> io::Result<Box<dyn KmsStream>>;
}

/// Plain TCP connector.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl StreamConnector for TcpConnector {
    async fn connect(&self, endpoint: &str) -> io::Result<Box<dyn KmsStream>> {
        let stream = TcpStream::connect(endpoint).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// Appends the HTTPS port when `endpoint` has none.
#[must_use]
pub fn with_default_port(endpoint: &str) -> String {
    if endpoint.contains(':') {
        endpoint.to_string()
    } else {
        format!("{endpoint}:443")
    }
}
