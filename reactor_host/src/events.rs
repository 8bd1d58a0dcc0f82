//! Named-event notification bus.
//!
//! Handlers receive the emitted positional payload. Awaited handlers run
//! concurrently and are joined before `emit` returns; fire-and-forget handlers
//! are spawned and never observed. A failing or panicking handler is logged
//! and does not affect the emitter or the other handlers.

use dashmap::DashMap;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, warn};
use uuid::Uuid;

pub type ListenerId = Uuid;

type AsyncHandler = Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
type BlockingHandler = Arc<dyn Fn(Vec<Value>) -> anyhow::Result<()> + Send + Sync>;

#[derive(Clone)]
pub enum EventHandler {
    Async(AsyncHandler),
    /// Runs on the blocking pool so it cannot stall the scheduler.
    Blocking(BlockingHandler),
}

impl EventHandler {
    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        EventHandler::Async(Arc::new(move |args| Box::pin(f(args))))
    }

    pub fn blocking<F>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        EventHandler::Blocking(Arc::new(f))
    }

    async fn call(self, args: Vec<Value>) -> anyhow::Result<()> {
        match self {
            EventHandler::Async(f) => AssertUnwindSafe(async move { f(args).await })
                .catch_unwind()
                .await
                .map_err(|panic| anyhow::anyhow!("handler panicked: {}", panic_message(&*panic)))?,
            EventHandler::Blocking(f) => tokio::task::spawn_blocking(move || f(args))
                .await
                .map_err(|e| anyhow::anyhow!("blocking handler panicked: {}", e))?,
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        *msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "non-string panic payload"
    }
}

#[derive(Clone)]
struct Listener {
    id: ListenerId,
    handler: EventHandler,
    fire_and_forget: bool,
}

#[derive(Default)]
pub struct EventBus {
    listeners: DashMap<String, Vec<Listener>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("events", &self.listeners.len())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, event: &str, handler: EventHandler, fire_and_forget: bool) -> ListenerId {
        let id = Uuid::new_v4();
        self.listeners
            .entry(event.to_string())
            .or_default()
            .push(Listener {
                id,
                handler,
                fire_and_forget,
            });
        debug!(event, %id, fire_and_forget, "Registered listener");
        id
    }

    /// Remove a listener; returns whether it was registered.
    pub fn off(&self, event: &str, id: ListenerId) -> bool {
        let removed = self
            .listeners
            .get_mut(event)
            .map(|mut list| {
                let before = list.len();
                list.retain(|l| l.id != id);
                list.len() < before
            })
            .unwrap_or(false);
        if !removed {
            warn!(event, %id, "Listener not found");
        }
        removed
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners.get(event).map(|l| l.len()).unwrap_or(0)
    }

    pub async fn emit(&self, event: &str, args: Vec<Value>) {
        // Snapshot so handlers may (un)register listeners without deadlocking.
        let listeners = match self.listeners.get(event) {
            Some(list) if !list.is_empty() => list.clone(),
            _ => return,
        };

        let mut awaited = Vec::new();
        for Listener { id, handler, fire_and_forget } in listeners {
            let call = handler.call(args.clone());
            if fire_and_forget {
                let event = event.to_string();
                tokio::spawn(async move {
                    if let Err(e) = call.await {
                        error!(event = %event, %id, "Error in listener: {}", e);
                    }
                });
            } else {
                awaited.push(async move { (id, call.await) });
            }
        }

        for (id, result) in join_all(awaited).await {
            if let Err(e) = result {
                error!(event, %id, "Error in listener: {}", e);
            }
        }
    }
}
