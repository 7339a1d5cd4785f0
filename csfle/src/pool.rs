//! Checkout pool for collaborator clients.
//!
//! A checkout is an RAII guard: the client goes back to the pool when the
//! guard drops, on success and error paths alike.

use std::ops::Deref;
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::Error;
use crate::transport::CommandRunner;

type Factory<T> = Box<dyn Fn() -> Result<T, Error> + Send + Sync>;

/// Pool of command channels.
pub type RunnerPool = Pool<Arc<dyn CommandRunner>>;

/// A bounded pool of reusable clients.
pub struct Pool<T> {
    idle: Mutex<Vec<T>>,
    factory: Factory<T>,
    max_idle: usize,
}

impl<T: Send> Pool<T> {
    /// Creates a pool that builds clients on demand and keeps at most
    /// `max_idle` of them between checkouts.
    #[must_use]
    pub fn new(max_idle: usize, factory: impl Fn() -> Result<T, Error> + Send + Sync + 'static) -> Self {
        Self { idle: Mutex::new(Vec::new()), factory: Box::new(factory), max_idle }
    }

    /// Creates a pool of one shared client.
    #[must_use]
    pub fn single(client: T) -> Self
    where
        T: Clone + Sync + 'static,
    {
        Self {
            idle: Mutex::new(vec![client.clone()]),
            factory: Box::new(move || Ok(client.clone())),
            max_idle: 1,
        }
    }

    /// Checks a client out, creating one if none is idle.
    ///
    /// # Errors
    ///
    /// Propagates the factory's error.
    pub fn checkout(&self) -> Result<Checkout<'_, T>, Error> {
        let reused = self.lock().pop();
        let client = match reused {
            Some(client) => client,
            None => (self.factory)()?,
        };
        Ok(Checkout { pool: self, client: Some(client) })
    }

    /// Returns the number of idle clients.
    #[must_use]
    pub fn idle_count(&self) -> usize {
        self.lock().len()
    }

    /// Drops every idle client.
    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<T>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn give_back(&self, client: T) {
        let mut idle = self.lock();
        if idle.len() < self.max_idle {
            idle.push(client);
        }
    }
}

impl<T> std::fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool").field("max_idle", &self.max_idle).finish_non_exhaustive()
    }
}

/// A client checked out of a [`Pool`].
pub struct Checkout<'a, T: Send> {
    pool: &'a Pool<T>,
    client: Option<T>,
}

impl<T: Send> Deref for Checkout<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Only `Drop` takes the client out.
        match &self.client {
            Some(client) => client,
            None => unreachable!("checkout used after release"),
        }
    }
}

impl<T: Send> Drop for Checkout<'_, T> {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            self.pool.give_back(client);
        }
    }
}
