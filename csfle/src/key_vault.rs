//! Key vault client: finds and stores data key documents.

use std::sync::Arc;
use std::time::Duration;

use bson::{doc, Bson, Document, Uuid};

use crate::data_key::{uuid_binary, DataKey, KeyRef};
use crate::error::Error;
use crate::pool::RunnerPool;

/// Most `getMore` round trips one lookup may take.
pub const MAX_GET_MORE: usize = 32;

/// Splits `"db.coll"` into its database and collection names.
///
/// # Errors
///
/// Returns `Error::ConfigurationError` if either part is empty.
pub fn split_namespace(namespace: &str) -> Result<(&str, &str), Error> {
    match namespace.split_once('.') {
        Some((db, coll)) if !db.is_empty() && !coll.is_empty() => Ok((db, coll)),
        _ => Err(Error::ConfigurationError(format!(
            "invalid namespace '{namespace}', expected '<db>.<collection>'"
        ))),
    }
}

/// Returns true if a reply reports `ok: 1`.
pub(crate) fn reply_ok(reply: &Document) -> bool {
    match reply.get("ok") {
        Some(Bson::Double(v)) => (*v - 1.0).abs() < f64::EPSILON,
        Some(Bson::Int32(v)) => *v == 1,
        Some(Bson::Int64(v)) => *v == 1,
        Some(Bson::Boolean(v)) => *v,
        _ => false,
    }
}

/// Returns the server's error message from a failed reply.
pub(crate) fn reply_error(reply: &Document) -> String {
    reply.get_str("errmsg").map_or_else(|_| "command failed".to_string(), str::to_string)
}

/// Reads the key vault collection over the command channel.
#[derive(Debug, Clone)]
pub struct KeyVault {
    pool: Arc<RunnerPool>,
    db: String,
    coll: String,
    timeout: Duration,
}

impl KeyVault {
    /// Creates a key vault client.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConfigurationError` if `namespace` is not `db.coll`.
    pub fn new(pool: Arc<RunnerPool>, namespace: &str, timeout: Duration) -> Result<Self, Error> {
        let (db, coll) = split_namespace(namespace)?;
        Ok(Self { pool, db: db.to_string(), coll: coll.to_string(), timeout })
    }

    /// Returns the key vault namespace.
    #[must_use]
    pub fn namespace(&self) -> String {
        format!("{}.{}", self.db, self.coll)
    }

    /// Finds one data key by id or by alternate name.
    ///
    /// Exactly one of `id` and `alt_name` must be given.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidArgument` unless exactly one selector is given
    /// - `Error::KeyNotFound` if no document matches
    /// - `Error::KeyVaultQueryFailed` if the query fails or times out
    pub async fn find_by_id_or_alt_name(&self, id: Option<Uuid>, alt_name: Option<&str>) -> Result<DataKey, Error> {
        let key_ref = KeyRef::from_options(id, alt_name)?;
        let filter = match &key_ref {
            KeyRef::Id(id) => doc! { "_id": uuid_binary(*id) },
            KeyRef::AltName(name) => doc! { "keyAltNames": name.as_str() },
        };

        let docs = self.find(filter, 1).await?;
        let first = docs.first().ok_or_else(|| Error::KeyNotFound(key_ref.to_string()))?;
        DataKey::from_document(first)
    }

    /// Finds the data keys for a set of references with one query.
    ///
    /// # Errors
    ///
    /// Returns `Error::KeyNotFound` naming the first reference no document
    /// satisfies, and `Error::KeyVaultQueryFailed` if the query fails.
    pub async fn find_many(&self, refs: &[KeyRef]) -> Result<Vec<DataKey>, Error> {
        if refs.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<Bson> = refs
            .iter()
            .filter_map(|r| match r {
                KeyRef::Id(id) => Some(Bson::Binary(uuid_binary(*id))),
                KeyRef::AltName(_) => None,
            })
            .collect();
        let names: Vec<Bson> = refs
            .iter()
            .filter_map(|r| match r {
                KeyRef::AltName(name) => Some(Bson::String(name.clone())),
                KeyRef::Id(_) => None,
            })
            .collect();

        let filter = doc! {
            "$or": [
                { "_id": { "$in": ids } },
                { "keyAltNames": { "$in": names } },
            ]
        };

        let keys = self
            .find(filter, refs.len())
            .await?
            .iter()
            .map(DataKey::from_document)
            .collect::<Result<Vec<_>, _>>()?;

        if let Some(missing) = refs.iter().find(|r| !keys.iter().any(|k| k.matches(r))) {
            return Err(Error::KeyNotFound(missing.to_string()));
        }

        tracing::debug!(requested = refs.len(), found = keys.len(), "key vault lookup complete");
        Ok(keys)
    }

    /// Inserts a data key with majority write concern.
    ///
    /// # Errors
    ///
    /// Returns `Error::KeyVaultQueryFailed` if the insert fails, reports
    /// write errors, or times out.
    pub async fn insert(&self, key: &DataKey) -> Result<(), Error> {
        let command = doc! {
            "insert": self.coll.as_str(),
            "documents": [key.to_document()],
            "writeConcern": { "w": "majority", "wtimeout": 1000 },
        };

        let reply = self.run(command).await?;
        if !reply_ok(&reply) {
            return Err(Error::KeyVaultQueryFailed(reply_error(&reply)));
        }
        if let Ok(errors) = reply.get_array("writeErrors") {
            if let Some(Bson::Document(first)) = errors.first() {
                return Err(Error::KeyVaultQueryFailed(reply_error(first)));
            }
        }
        if let Ok(concern) = reply.get_document("writeConcernError") {
            return Err(Error::KeyVaultQueryFailed(reply_error(concern)));
        }

        tracing::info!(key_id = %key.id(), provider = key.master_key().provider(), "data key inserted");
        Ok(())
    }

    /// Runs `filter` and drains the cursor until it is exhausted or holds
    /// `wanted` documents.
    async fn find(&self, filter: Document, wanted: usize) -> Result<Vec<Document>, Error> {
        let command = doc! {
            "find": self.coll.as_str(),
            "filter": filter,
            "readConcern": { "level": "majority" },
        };

        let mut reply = self.run(command).await?;
        let mut docs = Vec::new();
        let mut get_more = 0;
        loop {
            if !reply_ok(&reply) {
                return Err(Error::KeyVaultQueryFailed(reply_error(&reply)));
            }
            let cursor = reply
                .get_document("cursor")
                .map_err(|_| Error::KeyVaultQueryFailed("reply has no cursor".to_string()))?;
            let batch = cursor
                .get_array("firstBatch")
                .or_else(|_| cursor.get_array("nextBatch"))
                .map_err(|_| Error::KeyVaultQueryFailed("cursor has no batch".to_string()))?;
            for item in batch {
                match item {
                    Bson::Document(d) => docs.push(d.clone()),
                    _ => return Err(Error::KeyVaultQueryFailed("batch holds a non-document".to_string())),
                }
            }

            let cursor_id = cursor.get_i64("id").unwrap_or(0);
            if cursor_id == 0 {
                return Ok(docs);
            }
            if docs.len() >= wanted {
                self.kill_cursor(cursor_id).await;
                return Ok(docs);
            }
            if get_more == MAX_GET_MORE {
                self.kill_cursor(cursor_id).await;
                return Err(Error::KeyVaultQueryFailed(format!(
                    "cursor still open after {MAX_GET_MORE} getMore batches"
                )));
            }
            get_more += 1;
            reply = self.run(doc! { "getMore": cursor_id, "collection": self.coll.as_str() }).await?;
        }
    }

    async fn kill_cursor(&self, cursor_id: i64) {
        let command = doc! { "killCursors": self.coll.as_str(), "cursors": [cursor_id] };
        if let Err(error) = self.run(command).await {
            tracing::debug!(%error, cursor_id, "killCursors failed");
        }
    }

    async fn run(&self, command: Document) -> Result<Document, Error> {
        let runner = self.pool.checkout()?;
        tokio::time::timeout(self.timeout, runner.run_command(&self.db, command))
            .await
            .map_err(|_| {
                Error::KeyVaultQueryFailed(format!("no reply within {}ms", self.timeout.as_millis()))
            })?
            .map_err(|e| Error::KeyVaultQueryFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_key::MasterKey;
    use crate::transport::{BoxError, CommandRunner};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Answers `find` from a fixed set of documents, honouring the filters
    /// this client sends.
    struct FakeVault {
        keys: Vec<Document>,
        commands: Mutex<Vec<Document>>,
    }

    fn matches_filter(key: &Document, filter: &Document) -> bool {
        if let Ok(clauses) = filter.get_array("$or") {
            return clauses.iter().any(|c| c.as_document().is_some_and(|c| matches_filter(key, c)));
        }
        filter.iter().all(|(field, cond)| {
            let candidates: Vec<Bson> = match key.get(field) {
                Some(Bson::Array(values)) => values.clone(),
                Some(value) => vec![value.clone()],
                None => Vec::new(),
            };
            match cond {
                Bson::Document(op) if op.contains_key("$in") => op
                    .get_array("$in")
                    .is_ok_and(|wanted| candidates.iter().any(|c| wanted.contains(c))),
                other => candidates.contains(other),
            }
        })
    }

    #[async_trait]
    impl CommandRunner for FakeVault {
        async fn run_command(&self, _db: &str, command: Document) -> Result<Document, BoxError> {
            self.commands.lock().unwrap().push(command.clone());
            if command.contains_key("insert") {
                return Ok(doc! { "ok": 1, "n": 1 });
            }
            let filter = command.get_document("filter")?;
            let batch: Vec<Bson> = self
                .keys
                .iter()
                .filter(|k| matches_filter(k, filter))
                .cloned()
                .map(Bson::Document)
                .collect();
            Ok(doc! { "ok": 1.0, "cursor": { "id": 0_i64, "ns": "keyvault.datakeys", "firstBatch": batch } })
        }
    }

    fn vault_with(keys: &[DataKey]) -> (KeyVault, Arc<FakeVault>) {
        let fake = Arc::new(FakeVault {
            keys: keys.iter().map(DataKey::to_document).collect(),
            commands: Mutex::new(Vec::new()),
        });
        let runner: Arc<dyn CommandRunner> = fake.clone();
        let vault = KeyVault::new(Arc::new(RunnerPool::single(runner)), "keyvault.datakeys", Duration::from_secs(1))
            .unwrap();
        (vault, fake)
    }

    #[test]
    fn test_split_namespace() {
        assert_eq!(split_namespace("keyvault.datakeys").unwrap(), ("keyvault", "datakeys"));
        assert_eq!(split_namespace("a.b.c").unwrap(), ("a", "b.c"));
        assert!(matches!(split_namespace("keyvault"), Err(Error::ConfigurationError(_))));
        assert!(matches!(split_namespace(".datakeys"), Err(Error::ConfigurationError(_))));
    }

    #[tokio::test]
    async fn test_find_by_id_and_alt_name() {
        let key = DataKey::new(Uuid::new(), vec![1; 60], MasterKey::Local, vec!["patients".to_string()]);
        let (vault, fake) = vault_with(&[key.clone()]);

        assert_eq!(vault.find_by_id_or_alt_name(Some(key.id()), None).await.unwrap().id(), key.id());
        assert_eq!(vault.find_by_id_or_alt_name(None, Some("patients")).await.unwrap().id(), key.id());

        let command = fake.commands.lock().unwrap()[0].clone();
        assert_eq!(command.get_str("find").unwrap(), "datakeys");
        assert_eq!(command.get_document("readConcern").unwrap().get_str("level").unwrap(), "majority");
    }

    #[tokio::test]
    async fn test_find_errors() {
        let (vault, _) = vault_with(&[]);
        assert!(matches!(vault.find_by_id_or_alt_name(None, Some("nope")).await, Err(Error::KeyNotFound(_))));
        assert!(matches!(vault.find_by_id_or_alt_name(None, None).await, Err(Error::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_find_many_requires_every_reference() {
        let a = DataKey::new(Uuid::new(), vec![1; 60], MasterKey::Local, vec!["a".to_string()]);
        let b = DataKey::new(Uuid::new(), vec![2; 60], MasterKey::Local, Vec::new());
        let (vault, fake) = vault_with(&[a.clone(), b.clone()]);

        let found = vault
            .find_many(&[KeyRef::AltName("a".to_string()), KeyRef::Id(b.id())])
            .await
            .unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(fake.commands.lock().unwrap().len(), 1);

        let err = vault
            .find_many(&[KeyRef::Id(a.id()), KeyRef::AltName("missing".to_string())])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::KeyNotFound(ref msg) if msg.contains("missing")));
    }

    #[tokio::test]
    async fn test_insert_uses_majority_write_concern() {
        let (vault, fake) = vault_with(&[]);
        let key = DataKey::new(Uuid::new(), vec![1; 60], MasterKey::Local, Vec::new());
        vault.insert(&key).await.unwrap();

        let command = fake.commands.lock().unwrap()[0].clone();
        assert_eq!(command.get_str("insert").unwrap(), "datakeys");
        assert_eq!(command.get_document("writeConcern").unwrap().get_str("w").unwrap(), "majority");
    }

    struct FailingRunner(Document);

    #[async_trait]
    impl CommandRunner for FailingRunner {
        async fn run_command(&self, _db: &str, _command: Document) -> Result<Document, BoxError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_server_errors_surface() {
        let runner: Arc<dyn CommandRunner> = Arc::new(FailingRunner(doc! {
            "ok": 1,
            "n": 0,
            "writeErrors": [{ "index": 0, "code": 11000, "errmsg": "E11000 duplicate key error" }],
        }));
        let vault = KeyVault::new(Arc::new(RunnerPool::single(runner)), "keyvault.datakeys", Duration::from_secs(1))
            .unwrap();
        let key = DataKey::new(Uuid::new(), vec![1; 60], MasterKey::Local, Vec::new());
        let err = vault.insert(&key).await.unwrap_err();
        assert!(matches!(err, Error::KeyVaultQueryFailed(ref msg) if msg.contains("E11000")));

        let runner: Arc<dyn CommandRunner> =
            Arc::new(FailingRunner(doc! { "ok": 0, "errmsg": "not authorized on keyvault" }));
        let vault = KeyVault::new(Arc::new(RunnerPool::single(runner)), "keyvault.datakeys", Duration::from_secs(1))
            .unwrap();
        assert!(matches!(
            vault.find_by_id_or_alt_name(Some(Uuid::new()), None).await,
            Err(Error::KeyVaultQueryFailed(_))
        ));
    }

    struct SlowRunner;

    #[async_trait]
    impl CommandRunner for SlowRunner {
        async fn run_command(&self, _db: &str, _command: Document) -> Result<Document, BoxError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(doc! { "ok": 1 })
        }
    }

    /// A cursor that never reports exhaustion.
    struct EndlessCursor {
        first_batch: Vec<Bson>,
        commands: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CommandRunner for EndlessCursor {
        async fn run_command(&self, _db: &str, command: Document) -> Result<Document, BoxError> {
            let name = command.keys().next().cloned().unwrap_or_default();
            self.commands.lock().unwrap().push(name.clone());
            match name.as_str() {
                "find" => Ok(doc! { "ok": 1, "cursor": { "id": 42_i64, "firstBatch": self.first_batch.clone() } }),
                "getMore" => Ok(doc! { "ok": 1, "cursor": { "id": 42_i64, "nextBatch": [] } }),
                _ => Ok(doc! { "ok": 1 }),
            }
        }
    }

    fn endless_vault(first_batch: Vec<Bson>) -> (KeyVault, Arc<EndlessCursor>) {
        let fake = Arc::new(EndlessCursor { first_batch, commands: Mutex::new(Vec::new()) });
        let runner: Arc<dyn CommandRunner> = fake.clone();
        let vault = KeyVault::new(Arc::new(RunnerPool::single(runner)), "keyvault.datakeys", Duration::from_secs(1))
            .unwrap();
        (vault, fake)
    }

    #[tokio::test]
    async fn test_endless_cursor_is_bounded() {
        let (vault, fake) = endless_vault(Vec::new());
        let err = vault.find_by_id_or_alt_name(Some(Uuid::new()), None).await.unwrap_err();
        assert!(matches!(err, Error::KeyVaultQueryFailed(ref msg) if msg.contains("getMore")));

        let commands = fake.commands.lock().unwrap().clone();
        assert_eq!(commands.iter().filter(|c| *c == "getMore").count(), MAX_GET_MORE);
        assert_eq!(commands.last().map(String::as_str), Some("killCursors"));
    }

    #[tokio::test]
    async fn test_open_cursor_stops_once_keys_are_found() {
        let key = DataKey::new(Uuid::new(), vec![1; 60], MasterKey::Local, vec!["patients".to_string()]);
        let (vault, fake) = endless_vault(vec![Bson::Document(key.to_document())]);

        let found = vault.find_many(&[KeyRef::Id(key.id())]).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(*fake.commands.lock().unwrap(), ["find", "killCursors"]);
    }

    #[tokio::test]
    async fn test_timeout() {
        let runner: Arc<dyn CommandRunner> = Arc::new(SlowRunner);
        let vault =
            KeyVault::new(Arc::new(RunnerPool::single(runner)), "keyvault.datakeys", Duration::from_millis(20))
                .unwrap();
        assert!(matches!(
            vault.find_by_id_or_alt_name(Some(Uuid::new()), None).await,
            Err(Error::KeyVaultQueryFailed(_))
        ));
    }
}
