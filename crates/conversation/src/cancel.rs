//! Last-request-wins cancellation keyed by logical scope.
//!
//! Each scope owns a generation counter. Beginning a unit bumps the counter, which
//! cancels every token minted for an earlier generation; a token is live only while
//! its generation is still the scope's current one.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::watch;

/// Logical kind of cancellable work. Units of the same kind supersede each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CancelScope {
    Send,
    TermLookup,
}

#[derive(Debug)]
struct ScopeEntry {
    generation: watch::Sender<u64>,
    active: Option<u64>,
}

impl ScopeEntry {
    fn new() -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            generation,
            active: None,
        }
    }

    fn bump(&mut self) -> u64 {
        self.generation.send_modify(|generation| *generation += 1);
        *self.generation.borrow()
    }
}

#[derive(Debug, Default)]
pub struct CancellationCoordinator {
    scopes: Mutex<HashMap<CancelScope, ScopeEntry>>,
}

impl CancellationCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new unit, cancelling the previous unit of the same scope.
    pub fn begin(&self, scope: CancelScope) -> CancelToken {
        let mut scopes = self.scopes.lock();
        let entry = scopes.entry(scope).or_insert_with(ScopeEntry::new);

        if let Some(previous) = entry.active {
            tracing::debug!(?scope, previous, "superseding in-flight unit");
        }

        let generation = entry.bump();
        entry.active = Some(generation);

        CancelToken {
            scope,
            generation,
            current: entry.generation.subscribe(),
        }
    }

    /// Cancels the in-flight unit of `scope`. Returns false when nothing was in flight.
    pub fn cancel(&self, scope: CancelScope) -> bool {
        let mut scopes = self.scopes.lock();
        let Some(entry) = scopes.get_mut(&scope) else {
            return false;
        };
        let Some(active) = entry.active.take() else {
            return false;
        };

        entry.bump();
        tracing::debug!(?scope, generation = active, "cancelled in-flight unit");
        true
    }

    /// Marks the unit behind `token` as finished if it is still the current one.
    pub fn release(&self, token: &CancelToken) {
        let mut scopes = self.scopes.lock();
        if let Some(entry) = scopes.get_mut(&token.scope)
            && entry.active == Some(token.generation)
        {
            entry.active = None;
        }
    }

    pub fn is_active(&self, scope: CancelScope) -> bool {
        self.scopes
            .lock()
            .get(&scope)
            .is_some_and(|entry| entry.active.is_some())
    }
}

/// Handle passed into every suspension point of one unit of work.
#[derive(Debug, Clone)]
pub struct CancelToken {
    scope: CancelScope,
    generation: u64,
    current: watch::Receiver<u64>,
}

impl CancelToken {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_cancelled(&self) -> bool {
        *self.current.borrow() != self.generation
    }

    /// Resolves once the token no longer matches its scope's generation.
    pub async fn cancelled(&self) {
        let generation = self.generation;
        let mut current = self.current.clone();
        // A closed channel means the coordinator is gone; nothing can be live anymore.
        let _ = current.wait_for(|value| *value != generation).await;
    }
}

/// Releases a token exactly once when dropped, whichever way the unit ended.
pub struct ScopeLease<'a> {
    coordinator: &'a CancellationCoordinator,
    token: CancelToken,
}

impl<'a> ScopeLease<'a> {
    pub fn new(coordinator: &'a CancellationCoordinator, token: CancelToken) -> Self {
        Self { coordinator, token }
    }

    pub fn token(&self) -> &CancelToken {
        &self.token
    }
}

impl Drop for ScopeLease<'_> {
    fn drop(&mut self) {
        self.coordinator.release(&self.token);
    }
}
