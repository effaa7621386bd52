//! Typed event bus: synchronous fan-out of lifecycle and step events to
//! observers (CLIs, loggers, telemetry).
//!
//! Delivery is in subscription-registration order for a given event kind.
//! The bus has no queue and no backpressure; a slow synchronous handler
//! blocks the publisher for as long as it runs. Asynchronous handlers are
//! spawned on the current tokio runtime and never awaited.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// Every event the runtime publishes, serialized as its wire string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "state:changed")]
    StateChanged,
    #[serde(rename = "agent:initialized")]
    AgentInitialized,
    #[serde(rename = "agent:destroyed")]
    AgentDestroyed,
    #[serde(rename = "agent:error")]
    AgentError,
    #[serde(rename = "chat:started")]
    ChatStarted,
    #[serde(rename = "chat:completed")]
    ChatCompleted,
    #[serde(rename = "execution:started")]
    ExecutionStarted,
    #[serde(rename = "execution:completed")]
    ExecutionCompleted,
    #[serde(rename = "execution:failed")]
    ExecutionFailed,
    #[serde(rename = "thinking:started")]
    ThinkingStarted,
    #[serde(rename = "thinking:step")]
    ThinkingStep,
    #[serde(rename = "thinking:reflection")]
    ThinkingReflection,
    #[serde(rename = "thinking:completed")]
    ThinkingCompleted,
    #[serde(rename = "thinking:aborted")]
    ThinkingAborted,
    #[serde(rename = "thinking:error")]
    ThinkingError,
    #[serde(rename = "tool:completed")]
    ToolCompleted,
    #[serde(rename = "tool:failed")]
    ToolFailed,
    #[serde(rename = "skill:completed")]
    SkillCompleted,
    #[serde(rename = "skill:failed")]
    SkillFailed,
    #[serde(rename = "plan:created")]
    PlanCreated,
    #[serde(rename = "plan:step:started")]
    PlanStepStarted,
    #[serde(rename = "plan:step:completed")]
    PlanStepCompleted,
    #[serde(rename = "plan:step:failed")]
    PlanStepFailed,
    #[serde(rename = "plan:adjusted")]
    PlanAdjusted,
    #[serde(rename = "plan:completed")]
    PlanCompleted,
}

impl EventKind {
    pub const ALL: [EventKind; 25] = [
        Self::StateChanged,
        Self::AgentInitialized,
        Self::AgentDestroyed,
        Self::AgentError,
        Self::ChatStarted,
        Self::ChatCompleted,
        Self::ExecutionStarted,
        Self::ExecutionCompleted,
        Self::ExecutionFailed,
        Self::ThinkingStarted,
        Self::ThinkingStep,
        Self::ThinkingReflection,
        Self::ThinkingCompleted,
        Self::ThinkingAborted,
        Self::ThinkingError,
        Self::ToolCompleted,
        Self::ToolFailed,
        Self::SkillCompleted,
        Self::SkillFailed,
        Self::PlanCreated,
        Self::PlanStepStarted,
        Self::PlanStepCompleted,
        Self::PlanStepFailed,
        Self::PlanAdjusted,
        Self::PlanCompleted,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::StateChanged => "state:changed",
            Self::AgentInitialized => "agent:initialized",
            Self::AgentDestroyed => "agent:destroyed",
            Self::AgentError => "agent:error",
            Self::ChatStarted => "chat:started",
            Self::ChatCompleted => "chat:completed",
            Self::ExecutionStarted => "execution:started",
            Self::ExecutionCompleted => "execution:completed",
            Self::ExecutionFailed => "execution:failed",
            Self::ThinkingStarted => "thinking:started",
            Self::ThinkingStep => "thinking:step",
            Self::ThinkingReflection => "thinking:reflection",
            Self::ThinkingCompleted => "thinking:completed",
            Self::ThinkingAborted => "thinking:aborted",
            Self::ThinkingError => "thinking:error",
            Self::ToolCompleted => "tool:completed",
            Self::ToolFailed => "tool:failed",
            Self::SkillCompleted => "skill:completed",
            Self::SkillFailed => "skill:failed",
            Self::PlanCreated => "plan:created",
            Self::PlanStepStarted => "plan:step:started",
            Self::PlanStepCompleted => "plan:step:completed",
            Self::PlanStepFailed => "plan:step:failed",
            Self::PlanAdjusted => "plan:adjusted",
            Self::PlanCompleted => "plan:completed",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who an event is about.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMetadata {
    pub agent_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
}

impl EventMetadata {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            ..Self::default()
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_execution(mut self, execution_id: impl Into<String>) -> Self {
        self.execution_id = Some(execution_id.into());
        self
    }
}

/// The event wire shape. Never mutated after publish.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnifiedEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,

    /// Epoch milliseconds
    pub timestamp: i64,

    pub payload: serde_json::Value,

    pub metadata: EventMetadata,
}

pub type EventFilter = Arc<dyn Fn(&UnifiedEvent) -> bool + Send + Sync>;

type SyncHandler = Arc<dyn Fn(&UnifiedEvent) + Send + Sync>;
type AsyncHandler = Arc<dyn Fn(Arc<UnifiedEvent>) -> BoxFuture<'static, Result<(), String>> + Send + Sync>;

#[derive(Clone)]
enum Callback {
    Sync(SyncHandler),
    Async(AsyncHandler),
}

#[derive(Clone)]
struct Entry {
    id: u64,
    callback: Callback,
    filter: Option<EventFilter>,
    once: bool,
}

#[derive(Default)]
struct Inner {
    handlers: Mutex<HashMap<EventKind, Vec<Entry>>>,
    next_id: AtomicU64,
    published: AtomicU64,
    delivered: AtomicU64,
    failures: AtomicU64,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, HashMap<EventKind, Vec<Entry>>> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove(&self, id: u64, kinds: &[EventKind]) {
        let mut handlers = self.lock();
        for kind in kinds {
            if let Some(entries) = handlers.get_mut(kind) {
                entries.retain(|e| e.id != id);
            }
        }
    }
}

/// Returned by every subscribe call; `unsubscribe` releases the handler.
///
/// Dropping the handle does not unsubscribe.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    kinds: Vec<EventKind>,
    bus: Weak<Inner>,
}

impl Subscription {
    pub fn unsubscribe(&self) {
        if let Some(inner) = self.bus.upgrade() {
            inner.remove(self.id, &self.kinds);
        }
    }
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus").finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EventBusStats {
    /// Live subscriptions, counted once per kind they cover
    pub subscriptions: usize,
    pub handlers_by_kind: BTreeMap<String, usize>,
    pub events_published: u64,
    pub deliveries: u64,
    pub handler_failures: u64,
}

/// Publish/subscribe hub. Clones share one handler registry.
#[derive(Clone, Default, Debug)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `handler` to every kind in `kinds`.
    pub fn subscribe<F>(&self, kinds: &[EventKind], handler: F) -> Subscription
    where
        F: Fn(&UnifiedEvent) + Send + Sync + 'static,
    {
        self.register(kinds, Callback::Sync(Arc::new(handler)), None, false)
    }

    /// Like [`subscribe`](Self::subscribe), but `filter` gates each delivery.
    pub fn subscribe_filtered<F, P>(&self, kinds: &[EventKind], handler: F, filter: P) -> Subscription
    where
        F: Fn(&UnifiedEvent) + Send + Sync + 'static,
        P: Fn(&UnifiedEvent) -> bool + Send + Sync + 'static,
    {
        self.register(kinds, Callback::Sync(Arc::new(handler)), Some(Arc::new(filter)), false)
    }

    /// Subscribe a handler whose work is asynchronous. The bus spawns the
    /// returned future and does not wait for it; an `Err` is logged and
    /// counted as a handler failure.
    pub fn subscribe_async<F, Fut>(&self, kinds: &[EventKind], handler: F) -> Subscription
    where
        F: Fn(Arc<UnifiedEvent>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), String>> + Send + 'static,
    {
        let handler: AsyncHandler = Arc::new(move |event| Box::pin(handler(event)));
        self.register(kinds, Callback::Async(handler), None, false)
    }

    /// Deliver at most one matching event of `kind`, then release.
    pub fn once<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&UnifiedEvent) + Send + Sync + 'static,
    {
        self.register(&[kind], Callback::Sync(Arc::new(handler)), None, true)
    }

    pub fn once_filtered<F, P>(&self, kind: EventKind, handler: F, filter: P) -> Subscription
    where
        F: Fn(&UnifiedEvent) + Send + Sync + 'static,
        P: Fn(&UnifiedEvent) -> bool + Send + Sync + 'static,
    {
        self.register(&[kind], Callback::Sync(Arc::new(handler)), Some(Arc::new(filter)), true)
    }

    fn register(
        &self,
        kinds: &[EventKind],
        callback: Callback,
        filter: Option<EventFilter>,
        once: bool,
    ) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mut kinds = kinds.to_vec();
        kinds.sort();
        kinds.dedup();

        let mut handlers = self.inner.lock();
        for kind in &kinds {
            handlers.entry(*kind).or_default().push(Entry {
                id,
                callback: callback.clone(),
                filter: filter.clone(),
                once,
            });
        }

        Subscription {
            id,
            kinds,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Build an event and fan it out. Returns how many handlers ran.
    ///
    /// Handlers run on the caller's thread after the registry lock is
    /// released, so a handler may subscribe or publish without deadlock.
    pub fn publish(&self, kind: EventKind, payload: serde_json::Value, metadata: EventMetadata) -> usize {
        let event = Arc::new(UnifiedEvent {
            kind,
            timestamp: chrono::Utc::now().timestamp_millis(),
            payload,
            metadata,
        });
        self.inner.published.fetch_add(1, Ordering::Relaxed);

        let snapshot = self.inner.lock().get(&kind).cloned().unwrap_or_default();

        let mut invoked = 0;
        for entry in snapshot {
            if let Some(filter) = &entry.filter
                && !filter(event.as_ref())
            {
                continue;
            }

            if entry.once && !self.claim_once(kind, entry.id) {
                continue;
            }

            self.deliver(&entry.callback, &event);
            invoked += 1;
        }

        self.inner.delivered.fetch_add(invoked as u64, Ordering::Relaxed);
        invoked
    }

    /// Remove a `once` entry; false if another publish already took it.
    fn claim_once(&self, kind: EventKind, id: u64) -> bool {
        let mut handlers = self.inner.lock();
        let Some(entries) = handlers.get_mut(&kind) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|e| e.id != id);
        entries.len() < before
    }

    fn deliver(&self, callback: &Callback, event: &Arc<UnifiedEvent>) {
        match callback {
            Callback::Sync(handler) => {
                if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| handler(event.as_ref()))) {
                    self.inner.failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        event = %event.kind,
                        panic = %crate::error::panic_message(panic.as_ref()),
                        "Event handler panicked"
                    );
                }
            }
            Callback::Async(handler) => {
                let fut = handler(Arc::clone(event));
                let inner = Arc::clone(&self.inner);
                let kind = event.kind;
                match tokio::runtime::Handle::try_current() {
                    Ok(runtime) => {
                        runtime.spawn(async move {
                            if let Err(e) = fut.await {
                                inner.failures.fetch_add(1, Ordering::Relaxed);
                                tracing::warn!(event = %kind, error = %e, "Async event handler failed");
                            }
                        });
                    }
                    Err(_) => {
                        inner.failures.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(event = %kind, "No tokio runtime; async event handler dropped");
                    }
                }
            }
        }
    }

    /// Drop every subscription.
    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    pub fn stats(&self) -> EventBusStats {
        let handlers = self.inner.lock();
        let handlers_by_kind: BTreeMap<String, usize> = handlers
            .iter()
            .filter(|(_, entries)| !entries.is_empty())
            .map(|(kind, entries)| (kind.as_str().to_string(), entries.len()))
            .collect();

        EventBusStats {
            subscriptions: handlers_by_kind.values().sum(),
            handlers_by_kind,
            events_published: self.inner.published.load(Ordering::Relaxed),
            deliveries: self.inner.delivered.load(Ordering::Relaxed),
            handler_failures: self.inner.failures.load(Ordering::Relaxed),
        }
    }
}
