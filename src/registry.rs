//! Handler registry.
//!
//! Maps a command type name to an invoker: a function value of signature
//! `(scope, body) -> future`. Async handlers are registered directly;
//! blocking handlers are wrapped once at registration with `spawn_blocking`,
//! so resolution never has to branch on handler kind. The first registration
//! for a type name wins; later ones are ignored.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::warn;

use crate::scope::CommandScope;
use crate::store::StoreError;

/// Failure raised by a handler (or by the save on its behalf).
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Business-rule violation; recorded and replied, never retried.
    #[error("domain rule violated: {0}")]
    Domain(String),

    /// Version conflict on a shared aggregate; retried iff the command
    /// carries `need_retry`.
    #[error("optimistic concurrency conflict: {0}")]
    Concurrency(String),

    /// Infrastructure or unexpected failure.
    #[error("{0}")]
    System(String),
}

impl From<StoreError> for HandlerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Concurrency(msg) => Self::Concurrency(msg),
            other => Self::System(other.to_string()),
        }
    }
}

pub type HandlerResult = Result<(), HandlerError>;

/// A command handler. One handler per command type; the command arrives
/// deserialized from the payload body.
#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    type Command: DeserializeOwned + Send + 'static;

    async fn handle(&self, scope: &CommandScope, command: Self::Command) -> HandlerResult;
}

/// Type-erased invoker produced at registration.
pub type HandlerFn =
    Arc<dyn Fn(Arc<CommandScope>, serde_json::Value) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// How the handler was registered; kept for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    Async,
    Blocking,
}

#[derive(Clone)]
pub struct Registration {
    pub kind: HandlerKind,
    pub invoke: HandlerFn,
}

/// Command type name → invoker.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<String, Registration>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an async handler for `type_name`.
    pub fn register<H>(&self, type_name: impl Into<String>, handler: H)
    where
        H: CommandHandler,
    {
        let handler = Arc::new(handler);
        let invoke: HandlerFn = Arc::new(move |scope, body| {
            let handler = handler.clone();
            Box::pin(async move {
                let command: H::Command = serde_json::from_value(body)
                    .map_err(|e| HandlerError::System(format!("malformed command body: {}", e)))?;
                handler.handle(&scope, command).await
            })
        });
        self.insert(type_name.into(), HandlerKind::Async, invoke);
    }

    /// Registers a blocking handler for `type_name`. The function runs on the
    /// blocking pool; the wrapping happens here, once, so the pipeline sees
    /// the same invoker shape as for async handlers.
    pub fn register_blocking<C, F>(&self, type_name: impl Into<String>, handler: F)
    where
        C: DeserializeOwned + Send + 'static,
        F: Fn(Arc<CommandScope>, C) -> HandlerResult + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        let invoke: HandlerFn = Arc::new(move |scope, body| {
            let handler = handler.clone();
            Box::pin(async move {
                let command: C = serde_json::from_value(body)
                    .map_err(|e| HandlerError::System(format!("malformed command body: {}", e)))?;
                match tokio::task::spawn_blocking(move || handler(scope, command)).await {
                    Ok(result) => result,
                    Err(e) => Err(HandlerError::System(format!(
                        "blocking handler panicked or was cancelled: {}",
                        e
                    ))),
                }
            })
        });
        self.insert(type_name.into(), HandlerKind::Blocking, invoke);
    }

    fn insert(&self, type_name: String, kind: HandlerKind, invoke: HandlerFn) {
        use dashmap::mapref::entry::Entry;
        match self.handlers.entry(type_name) {
            Entry::Vacant(entry) => {
                entry.insert(Registration { kind, invoke });
            }
            Entry::Occupied(entry) => {
                warn!(
                    command_type = %entry.key(),
                    "duplicate handler registration ignored; first registration wins"
                );
            }
        }
    }

    /// Deterministic lookup by command type name.
    pub fn resolve(&self, type_name: &str) -> Option<Registration> {
        self.handlers
            .get(type_name)
            .map(|registration| registration.value().clone())
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
