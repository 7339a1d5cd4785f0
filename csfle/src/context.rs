//! Per-call state for the auto-encryption state machine.

use std::fmt;

use bson::{Bson, Document};

use crate::data_key::{Algorithm, DataKey, KeyRef};
use crate::error::Error;
use crate::keyring::KeyRing;

/// What a context was created to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Encrypt the marked fields of an outgoing command.
    AutoEncrypt,
    /// Decrypt every envelope in a reply.
    AutoDecrypt,
    /// Encrypt one value under a chosen key.
    ExplicitEncrypt {
        /// Key to encrypt under.
        key_ref: KeyRef,
        /// IV strategy.
        algorithm: Algorithm,
    },
    /// Decrypt one envelope value.
    ExplicitDecrypt,
}

/// State machine states. `Done` and `Error` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Nothing has run yet.
    Init,
    /// Waiting for the namespace's schema.
    NeedSchema,
    /// Waiting for the markings service to annotate the command.
    NeedMarkings,
    /// Waiting for the key vault to return the referenced data keys.
    NeedKeyLookup,
    /// Waiting for the remote KMS to unwrap data keys.
    NeedKms,
    /// All keys resolved; the transform can run.
    Ready,
    /// The result is available.
    Done,
    /// The operation failed.
    Error,
}

impl State {
    /// Returns true for `Done` and `Error`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::NeedSchema => "need-schema",
            Self::NeedMarkings => "need-markings",
            Self::NeedKeyLookup => "need-key-lookup",
            Self::NeedKms => "need-kms",
            Self::Ready => "ready",
            Self::Done => "done",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// One auto-encryption, auto-decryption or explicit operation.
///
/// A context is created per call and never shared. Unwrapped keys live in its
/// key ring and are zeroized when the context finishes or is dropped.
///
/// # Example
///
/// ```
/// use bson::doc;
/// use csfle::context::{AutoEncryptionContext, State};
///
/// let ctx = AutoEncryptionContext::encrypt("test", doc! { "find": "patients" });
/// assert_eq!(ctx.state(), State::Init);
/// assert_eq!(ctx.namespace(), Some("test.patients"));
/// ```
pub struct AutoEncryptionContext {
    operation: Operation,
    state: State,
    history: Vec<State>,
    db: String,
    namespace: Option<String>,
    pub(crate) pending: Document,
    pub(crate) schema: Option<Document>,
    pub(crate) key_refs: Vec<KeyRef>,
    pub(crate) remote_keys: Vec<DataKey>,
    pub(crate) keys: KeyRing,
    result: Option<Document>,
    error: Option<Error>,
}

impl AutoEncryptionContext {
    fn with_operation(operation: Operation, db: String, namespace: Option<String>, pending: Document) -> Self {
        Self {
            operation,
            state: State::Init,
            history: vec![State::Init],
            db,
            namespace,
            pending,
            schema: None,
            key_refs: Vec::new(),
            remote_keys: Vec::new(),
            keys: KeyRing::new(),
            result: None,
            error: None,
        }
    }

    /// Creates a context that encrypts `command` sent to `db`.
    #[must_use]
    pub fn encrypt(db: impl Into<String>, command: Document) -> Self {
        let db = db.into();
        let namespace = crate::schema::namespace_of(&db, &command);
        Self::with_operation(Operation::AutoEncrypt, db, namespace, command)
    }

    /// Creates a context that decrypts `reply` received from `db`.
    #[must_use]
    pub fn decrypt(db: impl Into<String>, reply: Document) -> Self {
        Self::with_operation(Operation::AutoDecrypt, db.into(), None, reply)
    }

    /// Creates a context that encrypts a single value.
    #[must_use]
    pub fn explicit_encrypt(value: Bson, key_ref: KeyRef, algorithm: Algorithm) -> Self {
        let mut pending = Document::new();
        pending.insert("v", value);
        Self::with_operation(
            Operation::ExplicitEncrypt { key_ref, algorithm },
            String::new(),
            None,
            pending,
        )
    }

    /// Creates a context that decrypts a single envelope value.
    #[must_use]
    pub fn explicit_decrypt(value: Bson) -> Self {
        let mut pending = Document::new();
        pending.insert("v", value);
        Self::with_operation(Operation::ExplicitDecrypt, String::new(), None, pending)
    }

    /// Returns the operation.
    #[must_use]
    pub const fn operation(&self) -> &Operation {
        &self.operation
    }

    /// Returns the current state.
    #[must_use]
    pub const fn state(&self) -> State {
        self.state
    }

    /// Returns every state entered so far, starting with `Init`.
    #[must_use]
    pub fn history(&self) -> &[State] {
        &self.history
    }

    /// Returns the target database.
    #[must_use]
    pub fn db(&self) -> &str {
        &self.db
    }

    /// Returns the target namespace, if the command names a collection.
    #[must_use]
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// Returns the document being worked on.
    #[must_use]
    pub const fn pending(&self) -> &Document {
        &self.pending
    }

    /// Returns the key references collected for this operation.
    #[must_use]
    pub fn key_refs(&self) -> &[KeyRef] {
        &self.key_refs
    }

    /// Returns the error a failed context carries.
    #[must_use]
    pub const fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    pub(crate) fn advance(&mut self, next: State) {
        tracing::debug!(from = %self.state, to = %next, "state transition");
        self.state = next;
        self.history.push(next);
    }

    /// Finishes with `output`, dropping every resolved key.
    pub(crate) fn finish(&mut self, output: Document) {
        self.keys.clear();
        self.remote_keys.clear();
        self.result = Some(output);
        self.advance(State::Done);
    }

    /// Fails the context. Any partial output is discarded.
    pub(crate) fn fail(&mut self, error: Error) {
        self.keys.clear();
        self.remote_keys.clear();
        self.result = None;
        self.error = Some(error);
        self.advance(State::Error);
    }

    /// Consumes a terminal context and returns its output or error.
    ///
    /// # Errors
    ///
    /// Returns the error that moved the context into `Error`, or
    /// `Error::InvalidArgument` if the context is not terminal.
    pub fn into_result(mut self) -> Result<Document, Error> {
        if let Some(error) = self.error.take() {
            return Err(error);
        }
        match (self.state, self.result.take()) {
            (State::Done, Some(output)) => Ok(output),
            (state, _) => Err(Error::InvalidArgument(format!("context is not finished (state {state})"))),
        }
    }
}

impl fmt::Debug for AutoEncryptionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AutoEncryptionContext")
            .field("operation", &self.operation)
            .field("state", &self.state)
            .field("namespace", &self.namespace)
            .field("key_refs", &self.key_refs.len())
            .field("resolved_keys", &self.keys.len())
            .finish_non_exhaustive()
    }
}
