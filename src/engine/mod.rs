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

//! The write path (§4.6): batched date updates, optimistic pre-apply
//! (Phase A), and an idle-batched, coalescing deferred pass (Phase B) that
//! enforces epic/child containment. See [`mutator`] for the non-queued
//! single-field write and revert.
//!
//! Scheduling follows the AMBIENT note in SPEC_FULL §4.6: there is no
//! browser idle callback in a server process, so the deferred pass always
//! runs on a short `tokio::time::sleep` timer. What's load-bearing is the
//! at-most-one-pass-per-batch guarantee, implemented here with a single
//! `AtomicBool` flag plus `tokio::spawn`, not the particular clock source.

pub mod mutator;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use indexmap::{IndexMap, IndexSet};

use crate::baseline::BaselineStore;
use crate::config::EngineFlags;
use crate::event_bus::{EventBus, EventPayload, FeatureUpdated};
use crate::model::{Feature, FeatureId};
use crate::scenario::{Override, ScenarioManager};

/// The timer fallback delay when no idle mechanism is available (§4.6,
/// "Fall back to a short timer (≈ 50 ms)").
const DEFERRED_PASS_DELAY: Duration = Duration::from_millis(50);

/// One requested date change, as it arrives at the public API boundary:
/// `start`/`end` are still ISO strings here; [`ConstraintEngine`] parses
/// them to [`NaiveDate`] immediately and drops anything that doesn't parse,
/// the same way an unknown id is dropped (§4.6, §7).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DateUpdate {
    pub id: FeatureId,
    pub start: String,
    pub end: String,
    /// Marks a queued child update as a derived shift from an epic move
    /// rather than an explicit user edit (glossary: `fromEpicMove`).
    pub from_epic_move: bool,
}

impl DateUpdate {
    pub fn new(id: impl Into<FeatureId>, start: &str, end: &str) -> Self {
        Self { id: id.into(), start: start.to_string(), end: end.to_string(), from_epic_move: false }
    }
}

#[derive(Clone, Debug)]
struct ParsedUpdate {
    id: FeatureId,
    start: NaiveDate,
    end: NaiveDate,
    from_epic_move: bool,
}

/// Invoked once Phase B's pass for a given batch has run, with whatever ids
/// that pass actually wrote (possibly empty). Isolated the same way event
/// bus handlers are: a panicking callback never prevents sibling callbacks
/// from running.
pub type UpdateCallback = Box<dyn FnOnce(&[FeatureId]) + Send>;

#[derive(Default)]
struct EngineState {
    queue: Vec<ParsedUpdate>,
    callbacks: Vec<UpdateCallback>,
    /// §9 "Priors map lifetime": the epic start recorded at the moment of
    /// its optimistic write, consumed by the first queued pass that
    /// reconciles that epic. Lives here (not locally in a function) because
    /// it must survive from Phase A of one call to Phase B of a later one.
    prior_epic_start: HashMap<FeatureId, NaiveDate>,
}

struct Inner {
    baseline: Arc<BaselineStore>,
    scenarios: Arc<ScenarioManager>,
    events: EventBus,
    flags: EngineFlags,
    state: tokio::sync::Mutex<EngineState>,
    pass_scheduled: AtomicBool,
}

/// The constraint & update engine (§4.6). Cheap to clone, all state lives
/// behind `Arc`, so a host can hand clones to request handlers without
/// wrapping it itself.
#[derive(Clone)]
pub struct ConstraintEngine(Arc<Inner>);

impl ConstraintEngine {
    /// Wires the event bus's history ring buffer per `flags.log_event_history`
    /// (§6 `LOG_EVENT_HISTORY`). The `history-always-on` feature forces it on
    /// with a fixed bound regardless of what the host configured, for a
    /// binary that always wants a debug log.
    pub fn new(baseline: Arc<BaselineStore>, scenarios: Arc<ScenarioManager>, events: EventBus, flags: EngineFlags) -> Self {
        #[cfg(feature = "history-always-on")]
        events.enable_history_logging(flags.log_event_history.unwrap_or(500));
        #[cfg(not(feature = "history-always-on"))]
        if let Some(limit) = flags.log_event_history {
            events.enable_history_logging(limit);
        }

        Self(Arc::new(Inner {
            baseline,
            scenarios,
            events,
            flags,
            state: tokio::sync::Mutex::new(EngineState::default()),
            pass_scheduled: AtomicBool::new(false),
        }))
    }

    /// §4.6 entry point. Runs Phase A synchronously, enqueues the batch for
    /// Phase B, and returns the count of ids Phase A actually wrote. `0` if
    /// there is no active, editable scenario, not an error (§7
    /// `SCENARIO_INACTIVE`).
    pub async fn update_feature_dates(&self, updates: Vec<DateUpdate>, on_complete: Option<UpdateCallback>) -> usize {
        if !self.0.scenarios.is_active_scenario_editable() {
            return 0;
        }

        let parsed = self.parse_updates(updates);
        if parsed.is_empty() && on_complete.is_none() {
            return 0;
        }

        let mut state = self.0.state.lock().await;
        let applied_ids = self.apply_phase_a(&parsed, &mut state.prior_epic_start);
        state.queue.extend(parsed);
        if let Some(cb) = on_complete {
            state.callbacks.push(cb);
        }
        drop(state);

        if !applied_ids.is_empty() {
            self.0.events.emit(EventPayload::FeatureUpdated(FeatureUpdated { ids: applied_ids.clone() }));
        }

        // §6 `USE_QUEUED_FEATURE_SERVICE`: the immediate-write variant skips
        // the idle-batched defer and reconciles synchronously in the same
        // call, still going through the identical Phase B containment math.
        if self.0.flags.use_queued_feature_service {
            self.schedule();
        } else {
            self.run_deferred_pass().await;
        }
        applied_ids.len()
    }

    /// Drives the deferred pass synchronously and immediately, for hosts
    /// not running inside a long-lived Tokio runtime (tests, CLI batch
    /// tools) per SPEC_FULL §4.6's "Runtime requirement".
    pub async fn flush_pending(&self) {
        self.run_deferred_pass().await;
    }

    fn parse_updates(&self, updates: Vec<DateUpdate>) -> Vec<ParsedUpdate> {
        updates
            .into_iter()
            .filter_map(|u| {
                let start = NaiveDate::parse_from_str(&u.start, "%Y-%m-%d").ok();
                let end = NaiveDate::parse_from_str(&u.end, "%Y-%m-%d").ok();
                match (start, end) {
                    (Some(start), Some(end)) => {
                        Some(ParsedUpdate { id: u.id, start, end, from_epic_move: u.from_epic_move })
                    }
                    _ => {
                        if self.0.flags.service_instrumentation {
                            tracing::warn!(id = %u.id, start = %u.start, end = %u.end, "dropping update with unparseable date");
                        }
                        None
                    }
                }
            })
            .collect()
    }

    /// Phase A (§4.6): optimistic pre-apply. Mutates the active scenario's
    /// overrides directly and returns the ids actually written.
    fn apply_phase_a(&self, updates: &[ParsedUpdate], priors: &mut HashMap<FeatureId, NaiveDate>) -> Vec<FeatureId> {
        let Some(active) = self.0.scenarios.active_scenario() else {
            return Vec::new();
        };
        if active.id.is_baseline() {
            return Vec::new();
        }
        let mut overrides = active.overrides.clone();
        let mut applied = Vec::new();

        for update in updates {
            let Some(base) = self.0.baseline.get_feature_by_id(&update.id) else {
                continue;
            };

            let existing_explicit = overrides
                .get(&update.id)
                .is_some_and(|o| o.has_explicit_date_diff(base.start, base.end));
            if update.from_epic_move && existing_explicit {
                if self.0.flags.service_instrumentation {
                    tracing::debug!(id = %update.id, "skipping epic-move write over explicit child override");
                }
                continue;
            }

            if base.is_epic() {
                // §9 "Priors map lifetime": record the value as it stood right
                // before this optimistic write, for Phase B to consume the
                // first time it reconciles this epic. Overwrites any stale,
                // not-yet-consumed entry from an earlier unreconciled batch.
                let prior_start = overrides.get(&update.id).and_then(|o| o.start).unwrap_or(base.start);
                priors.insert(update.id.clone(), prior_start);
                let delta = update.start.signed_duration_since(prior_start);

                let children = self.0.baseline.children_of(&update.id);
                let mut min_start = update.start;
                let mut max_end = update.end;
                for child_id in &children {
                    let Some(child_base) = self.0.baseline.get_feature_by_id(child_id) else {
                        continue;
                    };
                    let child_existing = overrides.get(child_id).cloned();
                    let child_explicit = child_existing
                        .as_ref()
                        .is_some_and(|o| o.has_explicit_date_diff(child_base.start, child_base.end));

                    let (child_start, child_end) = if child_explicit {
                        let o = child_existing.expect("explicit implies present");
                        (o.start.unwrap_or(child_base.start), o.end.unwrap_or(child_base.end))
                    } else {
                        let start = child_base.start + delta;
                        let end = child_base.end + delta;
                        overrides.insert(
                            child_id.clone(),
                            Override { start: Some(start), end: Some(end), capacity: child_existing.and_then(|o| o.capacity) },
                        );
                        applied.push(child_id.clone());
                        (start, end)
                    };
                    min_start = min_start.min(child_start);
                    max_end = max_end.max(child_end);
                }

                let existing_epic = overrides.get(&update.id).cloned();
                overrides.insert(
                    update.id.clone(),
                    Override { start: Some(min_start), end: Some(max_end), capacity: existing_epic.and_then(|o| o.capacity) },
                );
                applied.push(update.id.clone());
            } else {
                let existing = overrides.get(&update.id).cloned();
                overrides.insert(
                    update.id.clone(),
                    Override { start: Some(update.start), end: Some(update.end), capacity: existing.and_then(|o| o.capacity) },
                );
                applied.push(update.id.clone());
                self.grow_parent_epic(&mut overrides, &base, update.start, update.end, &mut applied);
            }
        }

        self.0.scenarios.replace_active_overrides(overrides);
        dedupe_preserve_order(applied)
    }

    /// Shared by Phase A and Phase B: grow (never shrink) a feature's parent
    /// epic override so it keeps covering the feature's new dates.
    fn grow_parent_epic(
        &self,
        overrides: &mut IndexMap<FeatureId, Override>,
        feature: &Feature,
        new_start: NaiveDate,
        new_end: NaiveDate,
        applied: &mut Vec<FeatureId>,
    ) {
        let Some(parent_id) = &feature.parent_epic else {
            return;
        };
        let Some(parent_base) = self.0.baseline.get_feature_by_id(parent_id) else {
            return;
        };
        let existing = overrides.get(parent_id).cloned();
        let mut start = existing.as_ref().and_then(|o| o.start).unwrap_or(parent_base.start);
        let mut end = existing.as_ref().and_then(|o| o.end).unwrap_or(parent_base.end);
        let mut grew = false;
        if new_start < start {
            start = new_start;
            grew = true;
        }
        if new_end > end {
            end = new_end;
            grew = true;
        }
        if grew {
            overrides.insert(parent_id.clone(), Override { start: Some(start), end: Some(end), capacity: existing.and_then(|o| o.capacity) });
            applied.push(parent_id.clone());
        }
    }

    /// Idempotent: guarantees exactly one deferred pass runs after the
    /// current synchronous call, coalescing concurrent calls into it
    /// (§4.6, §8 "Coalescing").
    fn schedule(&self) {
        if self.0.pass_scheduled.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err() {
            return;
        }
        let engine = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(DEFERRED_PASS_DELAY).await;
            engine.run_deferred_pass().await;
        });
    }

    /// Phase B (§4.6): drains the queue and callback queue, reconciles
    /// epic/child containment, emits one `UPDATED` event for the whole
    /// pass, then invokes pending callbacks.
    async fn run_deferred_pass(&self) {
        let mut state = self.0.state.lock().await;
        self.0.pass_scheduled.store(false, Ordering::SeqCst);
        let updates = std::mem::take(&mut state.queue);
        let callbacks = std::mem::take(&mut state.callbacks);

        let applied_ids = if updates.is_empty() {
            Vec::new()
        } else {
            self.reconcile(updates, &mut state.prior_epic_start)
        };
        drop(state);

        if !applied_ids.is_empty() {
            self.0.events.emit(EventPayload::FeatureUpdated(FeatureUpdated { ids: applied_ids.clone() }));
        }
        self.dispatch_callbacks(callbacks, applied_ids);
    }

    fn dispatch_callbacks(&self, callbacks: Vec<UpdateCallback>, applied_ids: Vec<FeatureId>) {
        for callback in callbacks {
            let ids = applied_ids.clone();
            tokio::spawn(async move {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback(&ids)));
                if let Err(panic) = result {
                    tracing::error!(?panic, "update callback panicked");
                }
            });
        }
    }

    /// The queued reconciliation pass's core: coalesces multi-writes per id
    /// (last write wins), processes features before epics so a feature's
    /// growth is visible to its parent's containment check, then walks
    /// every affected epic, whether directly queued or only touched
    /// because a child grew, enforcing `epic.start <= min(children.start)`
    /// and `epic.end >= max(children.end)`.
    fn reconcile(&self, updates: Vec<ParsedUpdate>, priors: &mut HashMap<FeatureId, NaiveDate>) -> Vec<FeatureId> {
        let Some(active) = self.0.scenarios.active_scenario() else {
            return Vec::new();
        };
        if active.id.is_baseline() {
            return Vec::new();
        }
        let mut overrides = active.overrides.clone();

        let mut last_by_id: IndexMap<FeatureId, ParsedUpdate> = IndexMap::new();
        for update in updates {
            last_by_id.insert(update.id.clone(), update);
        }

        let mut feature_ids = Vec::new();
        let mut epic_ids: IndexSet<FeatureId> = IndexSet::new();
        for id in last_by_id.keys() {
            let Some(base) = self.0.baseline.get_feature_by_id(id) else {
                continue;
            };
            if base.is_epic() {
                epic_ids.insert(id.clone());
            } else {
                feature_ids.push(id.clone());
            }
        }

        let mut applied = Vec::new();

        for id in &feature_ids {
            let update = &last_by_id[id];
            let Some(base) = self.0.baseline.get_feature_by_id(id) else {
                continue;
            };
            let existing_explicit =
                overrides.get(id).is_some_and(|o| o.has_explicit_date_diff(base.start, base.end));
            if update.from_epic_move && existing_explicit {
                continue;
            }

            let existing = overrides.get(id).cloned();
            overrides.insert(
                id.clone(),
                Override { start: Some(update.start), end: Some(update.end), capacity: existing.and_then(|o| o.capacity) },
            );
            applied.push(id.clone());

            if let Some(parent_id) = &base.parent_epic {
                self.grow_parent_epic(&mut overrides, &base, update.start, update.end, &mut applied);
                epic_ids.insert(parent_id.clone());
            }
        }

        for epic_id in epic_ids {
            let Some(base) = self.0.baseline.get_feature_by_id(&epic_id) else {
                continue;
            };
            let queued = last_by_id.get(&epic_id);
            let children = self.0.baseline.children_of(&epic_id);

            let delta = queued.map(|update| {
                let prior_start = priors.remove(&epic_id).unwrap_or_else(|| {
                    overrides.get(&epic_id).and_then(|o| o.start).unwrap_or(base.start)
                });
                update.start.signed_duration_since(prior_start)
            });

            let mut min_child_start: Option<NaiveDate> = None;
            let mut max_child_end: Option<NaiveDate> = None;

            for child_id in &children {
                let Some(child_base) = self.0.baseline.get_feature_by_id(child_id) else {
                    continue;
                };
                let existing = overrides.get(child_id).cloned();
                let explicit =
                    existing.as_ref().is_some_and(|o| o.has_explicit_date_diff(child_base.start, child_base.end));

                if explicit {
                    let o = existing.expect("explicit implies present");
                    let start = o.start.unwrap_or(child_base.start);
                    let end = o.end.unwrap_or(child_base.end);
                    widen_bounds(start, end, &mut min_child_start, &mut max_child_end);
                } else if let Some(delta) = delta.filter(|d| *d != chrono::Duration::zero()) {
                    let start = child_base.start + delta;
                    let end = child_base.end + delta;
                    overrides.insert(
                        child_id.clone(),
                        Override { start: Some(start), end: Some(end), capacity: existing.and_then(|o| o.capacity) },
                    );
                    applied.push(child_id.clone());
                    widen_bounds(start, end, &mut min_child_start, &mut max_child_end);
                } else {
                    let start = existing.as_ref().and_then(|o| o.start).unwrap_or(child_base.start);
                    let end = existing.as_ref().and_then(|o| o.end).unwrap_or(child_base.end);
                    widen_bounds(start, end, &mut min_child_start, &mut max_child_end);
                }
            }

            let existing_epic = overrides.get(&epic_id).cloned();
            let (start, end) = match queued {
                Some(update) => {
                    let start = min_child_start.map_or(update.start, |m| update.start.min(m));
                    let end = max_child_end.map_or(update.end, |m| update.end.max(m));
                    (start, end)
                }
                None => {
                    let candidate_start = existing_epic.as_ref().and_then(|o| o.start).unwrap_or(base.start);
                    let candidate_end = existing_epic.as_ref().and_then(|o| o.end).unwrap_or(base.end);
                    let mut start = base.start.min(candidate_start);
                    let mut end = base.end.max(candidate_end);
                    if let Some(m) = min_child_start {
                        start = start.min(m);
                    }
                    if let Some(m) = max_child_end {
                        end = end.max(m);
                    }
                    (start, end)
                }
            };

            let unchanged = existing_epic.as_ref().is_some_and(|o| o.start == Some(start) && o.end == Some(end));
            if !unchanged {
                overrides.insert(
                    epic_id.clone(),
                    Override { start: Some(start), end: Some(end), capacity: existing_epic.and_then(|o| o.capacity) },
                );
                applied.push(epic_id.clone());
            }
        }

        self.0.scenarios.replace_active_overrides(overrides);
        dedupe_preserve_order(applied)
    }
}

fn dedupe_preserve_order(ids: Vec<FeatureId>) -> Vec<FeatureId> {
    itertools::Itertools::unique(ids.into_iter()).collect()
}

/// Widen a running `[min_start, max_end]` bound to also cover `(start, end)`.
fn widen_bounds(start: NaiveDate, end: NaiveDate, min_start: &mut Option<NaiveDate>, max_end: &mut Option<NaiveDate>) {
    *min_start = Some(min_start.map_or(start, |m| m.min(start)));
    *max_end = Some(max_end.map_or(end, |m| m.max(end)));
}
