//! Schema lookup and the markings service client.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bson::{doc, Bson, Document};

use crate::error::Error;
use crate::key_vault::{reply_error, reply_ok, split_namespace};
use crate::pool::RunnerPool;

/// Returns the namespace a command targets: `<db>.<first field value>`.
///
/// Returns `None` when the first field's value is not a string; such
/// commands (e.g. `{ ping: 1 }`) carry no collection and are never encrypted.
#[must_use]
pub fn namespace_of(db: &str, command: &Document) -> Option<String> {
    match command.iter().next() {
        Some((_, Bson::String(coll))) => Some(format!("{db}.{coll}")),
        _ => None,
    }
}

/// Namespace → JSON schema, configured once and read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct SchemaMap {
    schemas: HashMap<String, Document>,
}

impl SchemaMap {
    /// Creates a schema map.
    #[must_use]
    pub const fn new(schemas: HashMap<String, Document>) -> Self {
        Self { schemas }
    }

    /// Returns the schema for an exact namespace match.
    #[must_use]
    pub fn schema_for(&self, namespace: &str) -> Option<&Document> {
        self.schemas.get(namespace)
    }

    /// Returns the number of configured namespaces.
    #[must_use]
    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    /// Returns true if no schema is configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}

impl FromIterator<(String, Document)> for SchemaMap {
    fn from_iter<I: IntoIterator<Item = (String, Document)>>(iter: I) -> Self {
        Self { schemas: iter.into_iter().collect() }
    }
}

/// Finds the schema for a namespace: the local map first, then the
/// collection's `$jsonSchema` validator if a collection-info channel is set.
#[derive(Debug, Clone)]
pub struct SchemaResolver {
    local: SchemaMap,
    collinfo: Option<Arc<RunnerPool>>,
    timeout: Duration,
}

impl SchemaResolver {
    /// Creates a resolver.
    #[must_use]
    pub const fn new(local: SchemaMap, collinfo: Option<Arc<RunnerPool>>, timeout: Duration) -> Self {
        Self { local, collinfo, timeout }
    }

    /// Returns the configured schema map.
    #[must_use]
    pub const fn local(&self) -> &SchemaMap {
        &self.local
    }

    /// Resolves the schema for `namespace`. `None` means "do not encrypt".
    ///
    /// # Errors
    ///
    /// Returns `Error::CollectionInfoFailed` if the remote lookup fails.
    pub async fn resolve(&self, namespace: &str) -> Result<Option<Document>, Error> {
        if let Some(schema) = self.local.schema_for(namespace) {
            return Ok(Some(schema.clone()));
        }
        let Some(pool) = &self.collinfo else {
            return Ok(None);
        };

        let (db, coll) = split_namespace(namespace)?;
        let command = doc! { "listCollections": 1, "filter": { "name": coll } };
        let runner = pool.checkout()?;
        let reply = tokio::time::timeout(self.timeout, runner.run_command(db, command))
            .await
            .map_err(|_| {
                Error::CollectionInfoFailed(format!("no reply within {}ms", self.timeout.as_millis()))
            })?
            .map_err(|e| Error::CollectionInfoFailed(e.to_string()))?;

        if !reply_ok(&reply) {
            return Err(Error::CollectionInfoFailed(reply_error(&reply)));
        }

        let schema = reply
            .get_document("cursor")
            .and_then(|cursor| cursor.get_array("firstBatch"))
            .ok()
            .and_then(|batch| batch.first())
            .and_then(Bson::as_document)
            .and_then(|info| info.get_document("options").ok())
            .and_then(|options| options.get_document("validator").ok())
            .and_then(|validator| validator.get_document("$jsonSchema").ok())
            .cloned();

        tracing::debug!(%namespace, found = schema.is_some(), "remote schema lookup");
        Ok(schema)
    }
}

/// Client of the markings service.
#[derive(Debug, Clone)]
pub struct MarkingsClient {
    pool: Arc<RunnerPool>,
    timeout: Duration,
}

impl MarkingsClient {
    /// Database the markings service is addressed through.
    pub const DATABASE: &'static str = "admin";

    /// Creates a markings client.
    #[must_use]
    pub const fn new(pool: Arc<RunnerPool>, timeout: Duration) -> Self {
        Self { pool, timeout }
    }

    /// Asks the markings service to annotate `command` under `schema`.
    ///
    /// # Errors
    ///
    /// Returns `Error::MarkingsServiceFailed` if the service is unreachable,
    /// times out, replies with `ok != 1`, or omits `data[0]`.
    pub async fn mark(&self, command: &Document, schema: &Document) -> Result<Document, Error> {
        let request = doc! {
            "markFields": 1,
            "data": [command.clone()],
            "schema": schema.clone(),
        };

        let runner = self.pool.checkout()?;
        let reply = tokio::time::timeout(self.timeout, runner.run_command(Self::DATABASE, request))
            .await
            .map_err(|_| {
                Error::MarkingsServiceFailed(format!("no reply within {}ms", self.timeout.as_millis()))
            })?
            .map_err(|e| Error::MarkingsServiceFailed(e.to_string()))?;

        if !reply_ok(&reply) {
            return Err(Error::MarkingsServiceFailed(reply_error(&reply)));
        }

        match reply.get_array("data").ok().and_then(|data| data.first()) {
            Some(Bson::Document(marked)) => Ok(marked.clone()),
            _ => Err(Error::MarkingsServiceFailed("reply has no data[0] document".to_string())),
        }
    }
}
