//! Handler Registry: maps job names to the async callbacks that run them.
//!
//! Owned by a scheduler instance (not process-global), so independent
//! schedulers can coexist in one process.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;

use jobwarden_core::error::{Result, WardenError};

/// Future returned by a handler invocation.
pub type HandlerFuture = BoxFuture<'static, anyhow::Result<()>>;

/// A registered job body: payload in, success or error out.
pub type Handler = Arc<dyn Fn(serde_json::Value) -> HandlerFuture + Send + Sync>;

/// Registry of job handlers keyed by job name.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Handler>,
}

impl HandlerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. A name can only be registered once.
    pub fn register<F, Fut>(&mut self, name: &str, handler: F) -> Result<()>
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if self.handlers.contains_key(name) {
            return Err(WardenError::DuplicateHandler(name.to_string()));
        }
        let handler: Handler = Arc::new(move |payload| handler(payload).boxed());
        self.handlers.insert(name.to_string(), handler);
        tracing::info!("🧩 Registered handler: {}", name);
        Ok(())
    }

    /// Get a handler by job name.
    pub fn get(&self, name: &str) -> Option<Handler> {
        self.handlers.get(name).cloned()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = HandlerRegistry::new();
        registry.register("echo", |_| async { Ok(()) }).unwrap();
        let err = registry.register("echo", |_| async { Ok(()) }).unwrap_err();
        assert!(matches!(err, WardenError::DuplicateHandler(name) if name == "echo"));
        assert_eq!(registry.names(), vec!["echo"]);
    }

    #[tokio::test]
    async fn test_get_and_invoke() {
        let mut registry = HandlerRegistry::new();
        registry
            .register("check", |payload| async move {
                anyhow::ensure!(payload["ok"] == true, "not ok: {payload}");
                Ok(())
            })
            .unwrap();
        registry.register("alpha", |_| async { Ok(()) }).unwrap();

        assert_eq!(registry.names(), vec!["alpha", "check"]);
        assert!(registry.get("missing").is_none());

        let handler = registry.get("check").unwrap();
        assert!(handler(serde_json::json!({"ok": true})).await.is_ok());
        let err = handler(serde_json::json!({"ok": false})).await.unwrap_err();
        assert!(err.to_string().contains("not ok"));
    }
}
