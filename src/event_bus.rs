// Copyright 2025 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Typed publish/subscribe event bus (§4.1 / §6).
//!
//! Two subscription surfaces are offered over the same dispatch table:
//! closure-based `on`/`once`/`on_namespace` (the form the distilled spec
//! describes) and an async broadcast [`Stream`] (`subscribe_stream`) for
//! hosts that would rather poll than register a callback.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::model::{CapacityEntry, Feature, FeatureId};
use crate::scenario::ScenarioId;

/// Closed set of event identifiers. Each variant's [`Display`] renders
/// `"namespace.name"`; [`EventBus::on_namespace`] matches on the
/// `namespace` portion, preserving the "prefix before a separator"
/// semantics from §4.1 without a stringly-typed key.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum EventKind {
    FeatureUpdated,
    CapacityUpdated,
    FeatureSelected,
    ScenarioActivated,
    AppReady,
}

impl EventKind {
    /// All event kinds, used by tests and by `on_namespace` callers that
    /// want to enumerate what a namespace covers.
    pub const ALL: [EventKind; 5] = [
        EventKind::FeatureUpdated,
        EventKind::CapacityUpdated,
        EventKind::FeatureSelected,
        EventKind::ScenarioActivated,
        EventKind::AppReady,
    ];

    fn namespace(self) -> &'static str {
        match self {
            EventKind::FeatureUpdated | EventKind::CapacityUpdated | EventKind::FeatureSelected => {
                "feature"
            }
            EventKind::ScenarioActivated => "scenario",
            EventKind::AppReady => "app",
        }
    }

    fn name(self) -> &'static str {
        match self {
            EventKind::FeatureUpdated => "updated",
            EventKind::CapacityUpdated => "capacity_updated",
            EventKind::FeatureSelected => "selected",
            EventKind::ScenarioActivated => "activated",
            EventKind::AppReady => "ready",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.namespace(), self.name())
    }
}

/// `FeatureEvents.UPDATED` payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FeatureUpdated {
    pub ids: Vec<FeatureId>,
}

/// `FeatureEvents.CAPACITY_UPDATED` payload.
#[derive(Clone, Debug, PartialEq)]
pub struct CapacityUpdated {
    pub feature_id: FeatureId,
    pub capacity: Vec<CapacityEntry>,
}

/// `ScenarioEvents.ACTIVATED` payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScenarioActivated {
    pub scenario_id: ScenarioId,
}

/// The union of every payload shape an [`EventKind`] can carry.
#[derive(Clone, Debug, PartialEq)]
pub enum EventPayload {
    FeatureUpdated(FeatureUpdated),
    CapacityUpdated(CapacityUpdated),
    /// Opaque pass-through to the details view (§6): the core does not
    /// interpret a selected feature, it only forwards it.
    FeatureSelected(Feature),
    ScenarioActivated(ScenarioActivated),
    AppReady,
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::FeatureUpdated(_) => EventKind::FeatureUpdated,
            EventPayload::CapacityUpdated(_) => EventKind::CapacityUpdated,
            EventPayload::FeatureSelected(_) => EventKind::FeatureSelected,
            EventPayload::ScenarioActivated(_) => EventKind::ScenarioActivated,
            EventPayload::AppReady => EventKind::AppReady,
        }
    }

    /// Extract the `FeatureUpdated` payload, or `None` for any other kind.
    /// Convenience for subscribers registered via `on_namespace("feature",
    /// ...)`, which see every feature-namespace payload and must narrow it
    /// themselves.
    pub fn as_feature_updated(&self) -> Option<&FeatureUpdated> {
        as_variant::as_variant!(self, EventPayload::FeatureUpdated)
    }

    /// Extract the `CapacityUpdated` payload, or `None` for any other kind.
    pub fn as_capacity_updated(&self) -> Option<&CapacityUpdated> {
        as_variant::as_variant!(self, EventPayload::CapacityUpdated)
    }
}

/// Opaque handle returned by `on`/`once`/`on_namespace`; pass to
/// [`EventBus::off`] to remove the handler early.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct HandlerId(u64);

/// A single recorded `{timestamp, event, payload}` entry in the optional
/// history ring buffer.
#[derive(Clone, Debug)]
pub struct HistoryEntry {
    pub sequence: u64,
    pub event: EventKind,
    pub payload: EventPayload,
}

enum Callback {
    Multi(Arc<dyn Fn(&EventPayload) + Send + Sync>),
    Once(Mutex<Option<Box<dyn FnOnce(&EventPayload) + Send>>>),
}

struct Entry {
    id: u64,
    callback: Callback,
}

#[derive(Default)]
struct Registry {
    exact: HashMap<EventKind, Vec<Entry>>,
    namespace: Vec<(String, Entry)>,
    history: Option<VecDeque<HistoryEntry>>,
    history_limit: usize,
}

/// The event bus. Cheap to clone (all state lives behind `Arc`); components
/// share one instance rather than reaching for a process-wide singleton
/// (see §4.1's note that "a container-managed instance is equivalent").
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<Registry>>,
    next_id: Arc<AtomicU64>,
    sequence: Arc<AtomicU64>,
    stream_tx: broadcast::Sender<HistoryEntry>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (stream_tx, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Mutex::new(Registry::default())),
            next_id: Arc::new(AtomicU64::new(0)),
            sequence: Arc::new(AtomicU64::new(0)),
            stream_tx,
        }
    }

    fn alloc_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Subscribe to an exact event kind.
    pub fn on(
        &self,
        kind: EventKind,
        handler: impl Fn(&EventPayload) + Send + Sync + 'static,
    ) -> HandlerId {
        let id = self.alloc_id();
        let mut registry = self.inner.lock().expect("event bus poisoned");
        registry.exact.entry(kind).or_default().push(Entry {
            id,
            callback: Callback::Multi(Arc::new(handler)),
        });
        HandlerId(id)
    }

    /// Subscribe to an exact event kind; the handler fires at most once and
    /// is then automatically removed.
    pub fn once(
        &self,
        kind: EventKind,
        handler: impl FnOnce(&EventPayload) + Send + 'static,
    ) -> HandlerId {
        let id = self.alloc_id();
        let mut registry = self.inner.lock().expect("event bus poisoned");
        registry.exact.entry(kind).or_default().push(Entry {
            id,
            callback: Callback::Once(Mutex::new(Some(Box::new(handler)))),
        });
        HandlerId(id)
    }

    /// Subscribe to every event whose identifier shares namespace `ns`
    /// (e.g. `"feature"` matches `FeatureUpdated`, `CapacityUpdated`, and
    /// `FeatureSelected`).
    pub fn on_namespace(
        &self,
        ns: impl Into<String>,
        handler: impl Fn(&EventPayload) + Send + Sync + 'static,
    ) -> HandlerId {
        let id = self.alloc_id();
        let mut registry = self.inner.lock().expect("event bus poisoned");
        registry.namespace.push((
            ns.into(),
            Entry {
                id,
                callback: Callback::Multi(Arc::new(handler)),
            },
        ));
        HandlerId(id)
    }

    /// Remove a previously registered handler, whether exact or namespace.
    pub fn off(&self, id: HandlerId) {
        let mut registry = self.inner.lock().expect("event bus poisoned");
        for entries in registry.exact.values_mut() {
            entries.retain(|e| e.id != id.0);
        }
        registry.namespace.retain(|(_, e)| e.id != id.0);
    }

    /// Emit an event: invoke every exact-match handler, then every
    /// namespace handler, isolating panics from one handler from the rest
    /// (§4.1). Also records history (if enabled) and publishes onto the
    /// broadcast stream for `subscribe_stream` consumers.
    pub fn emit(&self, payload: EventPayload) {
        let kind = payload.kind();

        // Snapshot handlers while holding the lock, then release it before
        // invoking anything: a handler that calls back into the bus (to
        // subscribe, unsubscribe, or emit another event) must not deadlock.
        let (exact_snapshot, namespace_snapshot, once_ids) = {
            let registry = self.inner.lock().expect("event bus poisoned");
            let exact: Vec<_> = registry
                .exact
                .get(&kind)
                .map(|entries| entries.iter().map(snapshot_callback).collect())
                .unwrap_or_default();
            let namespace: Vec<_> = registry
                .namespace
                .iter()
                .filter(|(ns, _)| ns.as_str() == kind.namespace())
                .map(|(_, entry)| snapshot_callback(entry))
                .collect();
            let once_ids: Vec<u64> = registry
                .exact
                .get(&kind)
                .into_iter()
                .flatten()
                .filter(|e| matches!(e.callback, Callback::Once(_)))
                .map(|e| e.id)
                .collect();
            (exact, namespace, once_ids)
        };

        for invoke in exact_snapshot.into_iter().chain(namespace_snapshot) {
            let payload_ref = &payload;
            let result = panic::catch_unwind(AssertUnwindSafe(|| invoke(payload_ref)));
            if let Err(panic) = result {
                tracing::error!(event = %kind, ?panic, "event bus handler panicked");
            }
        }

        if !once_ids.is_empty() {
            let mut registry = self.inner.lock().expect("event bus poisoned");
            if let Some(entries) = registry.exact.get_mut(&kind) {
                entries.retain(|e| !once_ids.contains(&e.id));
            }
        }

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let history_entry = HistoryEntry {
            sequence,
            event: kind,
            payload: payload.clone(),
        };

        {
            let mut registry = self.inner.lock().expect("event bus poisoned");
            if let Some(history) = registry.history.as_mut() {
                history.push_back(history_entry.clone());
                while history.len() > registry.history_limit {
                    history.pop_front();
                }
            }
        }

        // No receivers is not an error: nobody asked for the stream view.
        let _ = self.stream_tx.send(history_entry);
    }

    /// Enable the bounded event-history ring buffer (§4.1, §6
    /// `LOG_EVENT_HISTORY`). Replaces any existing history.
    pub fn enable_history_logging(&self, limit: usize) {
        let mut registry = self.inner.lock().expect("event bus poisoned");
        registry.history_limit = limit;
        registry.history = Some(VecDeque::with_capacity(limit.min(1024)));
    }

    pub fn disable_history_logging(&self) {
        let mut registry = self.inner.lock().expect("event bus poisoned");
        registry.history = None;
    }

    pub fn event_history(&self) -> Vec<HistoryEntry> {
        let registry = self.inner.lock().expect("event bus poisoned");
        registry
            .history
            .as_ref()
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// An async stream of every emitted event, independent of the
    /// closure-based subscribers above. Lagged consumers see a gap (dropped
    /// events) rather than blocking emitters, matching the teacher's
    /// `broadcast`-backed `CanonicalDelta` subscription.
    pub fn subscribe_stream(&self) -> BroadcastStream<HistoryEntry> {
        BroadcastStream::new(self.stream_tx.subscribe())
    }

    /// The process-wide singleton permitted by §4.1 ("to let test code that
    /// reimports modules observe the same bus"). Most hosts should
    /// construct their own `EventBus` and hand clones of it to the
    /// overlay/constraint engines explicitly; this exists for call sites
    /// that have no natural place to thread one through.
    pub fn global() -> &'static EventBus {
        static GLOBAL: once_cell::sync::Lazy<EventBus> = once_cell::sync::Lazy::new(EventBus::new);
        &GLOBAL
    }
}

fn snapshot_callback(entry: &Entry) -> Box<dyn FnOnce(&EventPayload) + '_> {
    match &entry.callback {
        Callback::Multi(handler) => {
            let handler = Arc::clone(handler);
            Box::new(move |payload: &EventPayload| handler(payload))
        }
        Callback::Once(slot) => {
            let taken = slot.lock().expect("once handler poisoned").take();
            Box::new(move |payload: &EventPayload| {
                if let Some(handler) = taken {
                    handler(payload);
                }
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn feature_updated(ids: &[&str]) -> EventPayload {
        EventPayload::FeatureUpdated(FeatureUpdated {
            ids: ids.iter().map(|s| FeatureId::new(*s)).collect(),
        })
    }

    #[test]
    fn exact_subscriber_receives_matching_events_only() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = Arc::clone(&seen);
        bus.on(EventKind::FeatureUpdated, move |_| {
            seen2.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(feature_updated(&["a"]));
        bus.emit(EventPayload::AppReady);

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn once_fires_a_single_time() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = Arc::clone(&seen);
        bus.once(EventKind::FeatureUpdated, move |_| {
            seen2.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(feature_updated(&["a"]));
        bus.emit(feature_updated(&["b"]));

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn namespace_subscriber_covers_all_kinds_in_namespace() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = Arc::clone(&seen);
        bus.on_namespace("feature", move |_| {
            seen2.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(feature_updated(&["a"]));
        bus.emit(EventPayload::CapacityUpdated(CapacityUpdated {
            feature_id: FeatureId::new("a"),
            capacity: vec![],
        }));
        bus.emit(EventPayload::ScenarioActivated(ScenarioActivated {
            scenario_id: ScenarioId::new("s1"),
        }));

        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn off_removes_handler() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = Arc::clone(&seen);
        let id = bus.on(EventKind::FeatureUpdated, move |_| {
            seen2.fetch_add(1, Ordering::SeqCst);
        });
        bus.off(id);

        bus.emit(feature_updated(&["a"]));

        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn panicking_handler_does_not_block_others() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = Arc::clone(&seen);
        bus.on(EventKind::FeatureUpdated, |_| panic!("boom"));
        bus.on(EventKind::FeatureUpdated, move |_| {
            seen2.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(feature_updated(&["a"]));

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn history_ring_buffer_is_bounded_and_off_by_default() {
        let bus = EventBus::new();
        bus.emit(feature_updated(&["a"]));
        assert!(bus.event_history().is_empty());

        bus.enable_history_logging(2);
        bus.emit(feature_updated(&["b"]));
        bus.emit(feature_updated(&["c"]));
        bus.emit(feature_updated(&["d"]));

        let history = bus.event_history();
        assert_eq!(history.len(), 2);
        assert_eq!(
            history[0].payload,
            feature_updated(&["c"])
        );
    }

    #[test]
    fn payload_narrowing_helpers_match_only_their_own_kind() {
        let updated = feature_updated(&["a"]);
        assert_eq!(updated.as_feature_updated().unwrap().ids, vec![FeatureId::new("a")]);
        assert!(updated.as_capacity_updated().is_none());

        let capacity = EventPayload::CapacityUpdated(CapacityUpdated {
            feature_id: FeatureId::new("a"),
            capacity: vec![],
        });
        assert!(capacity.as_feature_updated().is_none());
        assert_eq!(capacity.as_capacity_updated().unwrap().feature_id, FeatureId::new("a"));
    }

    #[test]
    fn global_singleton_is_shared_across_call_sites() {
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = Arc::clone(&seen);
        EventBus::global().on(EventKind::AppReady, move |_| {
            seen2.fetch_add(1, Ordering::SeqCst);
        });

        EventBus::global().emit(EventPayload::AppReady);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn subscribe_stream_sees_emitted_events() {
        use futures_util::StreamExt;

        let bus = EventBus::new();
        let mut stream = bus.subscribe_stream();
        bus.emit(EventPayload::AppReady);

        let received = stream.next().await.unwrap().unwrap();
        assert_eq!(received.event, EventKind::AppReady);
    }
}
