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

//! Scenario storage (§3, §4.4): the set of scenarios, the active pointer,
//! and each scenario's `featureId -> Override` map.

use std::fmt;
use std::sync::{Arc, RwLock};

use chrono::NaiveDate;
use eyeball::{SharedObservable, Subscriber};
use indexmap::IndexMap;

use crate::error::ScenarioError;
use crate::event_bus::{EventBus, EventPayload, ScenarioActivated};
use crate::model::{CapacityEntry, FeatureId};

/// Identifier for a [`Scenario`]. `ScenarioId::BASELINE` is the reserved,
/// always-present sentinel with empty overrides (§3).
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct ScenarioId(Arc<str>);

impl ScenarioId {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_baseline(&self) -> bool {
        self.0.as_ref() == Self::BASELINE_NAME
    }

    const BASELINE_NAME: &'static str = "baseline";

    pub fn baseline() -> Self {
        Self::new(Self::BASELINE_NAME)
    }
}

impl fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Partial patch `{ start?, end?, capacity? }` (§3). Presence of a field
/// means "this field replaces the baseline value".
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Override {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
    pub capacity: Option<Vec<CapacityEntry>>,
}

impl Override {
    pub fn dates(start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
            capacity: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.start.is_none() && self.end.is_none() && self.capacity.is_none()
    }

    /// §4.6's narrow notion of "explicit": only the date fields are
    /// considered, since this is what Phase A/B's containment math checks
    /// before deciding whether to shift a child or leave it alone. Distinct
    /// from the general `scenarioOverride` existence flag in §3/`overlay`.
    pub fn has_explicit_date_diff(&self, base_start: NaiveDate, base_end: NaiveDate) -> bool {
        self.start.is_some_and(|s| s != base_start) || self.end.is_some_and(|e| e != base_end)
    }
}

/// A named container of overrides, one of which is active at a time.
#[derive(Clone, Debug)]
pub struct Scenario {
    pub id: ScenarioId,
    pub name: String,
    pub overrides: IndexMap<FeatureId, Override>,
    pub is_changed: bool,
}

impl Scenario {
    fn baseline() -> Self {
        Self {
            id: ScenarioId::baseline(),
            name: "Baseline".to_string(),
            overrides: IndexMap::new(),
            is_changed: false,
        }
    }
}

/// A read-only snapshot of the active scenario, handed to the overlay and
/// constraint engines. Cloning is cheap for the id/name/flag but deep for
/// `overrides`; callers that only need to read should prefer borrowing via
/// [`ScenarioManager::with_active`] where possible.
pub type ScenarioSnapshot = Scenario;

/// Implemented by anything that can answer "what's the active scenario
/// right now", satisfying §6's "either a callable ... or an object
/// exposing `getActiveScenario()`" with a single Rust idiom.
pub trait ActiveScenarioProvider: Send + Sync {
    fn active_scenario(&self) -> Option<ScenarioSnapshot>;
}

/// Owns every [`Scenario`] (including the baseline sentinel) and the active
/// pointer. The one mutable resource every write-path component shares.
pub struct ScenarioManager {
    state: RwLock<ManagerState>,
    events: EventBus,
    next_scenario_seq: std::sync::atomic::AtomicU64,
    /// Mirrors `state.active` for subscribers that want the current value
    /// replayed on first poll rather than only future `ScenarioEvents.
    /// ACTIVATED` transitions (e.g. a view that mounts after activation
    /// already happened and still needs to know what's active).
    active_signal: SharedObservable<Option<ScenarioId>>,
}

struct ManagerState {
    scenarios: IndexMap<ScenarioId, Scenario>,
    active: Option<ScenarioId>,
}

impl ScenarioManager {
    pub fn new(events: EventBus) -> Self {
        let mut scenarios = IndexMap::new();
        let baseline = Scenario::baseline();
        scenarios.insert(baseline.id.clone(), baseline);
        Self {
            state: RwLock::new(ManagerState {
                scenarios,
                active: None,
            }),
            events,
            next_scenario_seq: std::sync::atomic::AtomicU64::new(0),
            active_signal: SharedObservable::new(None),
        }
    }

    /// Subscribe to changes of the active scenario id, as an alternative to
    /// `ScenarioEvents.ACTIVATED` on the event bus for a host that prefers
    /// polling an async `Stream` over registering a callback.
    pub fn subscribe_active_scenario(&self) -> Subscriber<Option<ScenarioId>> {
        self.active_signal.subscribe()
    }

    /// §4.4: `null` when no editable scenario is active, or the `baseline`
    /// sentinel: this crate returns `None` for "no editable scenario
    /// active" and a baseline-id `Scenario` only if a caller explicitly
    /// activates it.
    pub fn active_scenario(&self) -> Option<Scenario> {
        let state = self.state.read().expect("scenario manager poisoned");
        let id = state.active.as_ref()?;
        state.scenarios.get(id).cloned()
    }

    pub fn is_active_scenario_editable(&self) -> bool {
        self.active_scenario()
            .is_some_and(|scenario| !scenario.id.is_baseline())
    }

    pub fn scenarios(&self) -> Vec<Scenario> {
        let state = self.state.read().expect("scenario manager poisoned");
        state.scenarios.values().cloned().collect()
    }

    /// Deep-copies `source`'s overrides into a freshly-id'd, unchanged
    /// scenario.
    pub fn clone_scenario(
        &self,
        source: &ScenarioId,
        name: impl Into<String>,
    ) -> Result<Scenario, ScenarioError> {
        let mut state = self.state.write().expect("scenario manager poisoned");
        let overrides = state
            .scenarios
            .get(source)
            .ok_or_else(|| ScenarioError::NotFound(source.clone()))?
            .overrides
            .clone();

        let seq = self.next_scenario_seq.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let new_id = ScenarioId::new(format!("scenario-{seq}"));
        let scenario = Scenario {
            id: new_id.clone(),
            name: name.into(),
            overrides,
            is_changed: false,
        };
        state.scenarios.insert(new_id, scenario.clone());
        Ok(scenario)
    }

    pub fn activate_scenario(&self, id: &ScenarioId) -> Result<(), ScenarioError> {
        {
            let mut state = self.state.write().expect("scenario manager poisoned");
            if !state.scenarios.contains_key(id) {
                return Err(ScenarioError::NotFound(id.clone()));
            }
            state.active = Some(id.clone());
        }
        self.active_signal.set(Some(id.clone()));
        self.events.emit(EventPayload::ScenarioActivated(ScenarioActivated {
            scenario_id: id.clone(),
        }));
        Ok(())
    }

    pub fn rename_scenario(&self, id: &ScenarioId, name: impl Into<String>) -> Result<(), ScenarioError> {
        if id.is_baseline() {
            return Err(ScenarioError::BaselineImmutable);
        }
        let mut state = self.state.write().expect("scenario manager poisoned");
        let scenario = state
            .scenarios
            .get_mut(id)
            .ok_or_else(|| ScenarioError::NotFound(id.clone()))?;
        scenario.name = name.into();
        Ok(())
    }

    pub fn delete_scenario(&self, id: &ScenarioId) -> Result<(), ScenarioError> {
        if id.is_baseline() {
            return Err(ScenarioError::BaselineImmutable);
        }
        let mut state = self.state.write().expect("scenario manager poisoned");
        if !state.scenarios.contains_key(id) {
            return Err(ScenarioError::NotFound(id.clone()));
        }
        state.scenarios.shift_remove(id);
        if state.active.as_ref() == Some(id) {
            state.active = None;
            self.active_signal.set(None);
        }
        Ok(())
    }

    /// Convenience used by some callers (§4.4): set a date override on the
    /// active scenario directly, bypassing the constraint engine. No
    /// containment propagation happens here.
    pub fn set_scenario_override(&self, feature_id: FeatureId, start: NaiveDate, end: NaiveDate) -> bool {
        let mut state = self.state.write().expect("scenario manager poisoned");
        let Some(active_id) = state.active.clone() else {
            return false;
        };
        let Some(scenario) = state.scenarios.get_mut(&active_id) else {
            return false;
        };
        if scenario.id.is_baseline() {
            return false;
        }
        scenario
            .overrides
            .insert(feature_id, Override::dates(start, end));
        scenario.is_changed = true;
        true
    }

    /// Replace the active scenario's overrides wholesale; used internally
    /// by the constraint engine after it computes a reconciled map. Returns
    /// `false` without writing anything if there is no active, editable
    /// scenario.
    pub(crate) fn replace_active_overrides(
        &self,
        new_overrides: IndexMap<FeatureId, Override>,
    ) -> bool {
        let mut state = self.state.write().expect("scenario manager poisoned");
        let Some(active_id) = state.active.clone() else {
            return false;
        };
        let Some(scenario) = state.scenarios.get_mut(&active_id) else {
            return false;
        };
        if scenario.id.is_baseline() {
            return false;
        }
        scenario.overrides = new_overrides;
        scenario.is_changed = true;
        true
    }

    /// Apply `patch` to the active scenario's override record for
    /// `feature_id`, creating an empty one first if none exists. Used by
    /// the single-field mutator (§4.6): a direct, non-queued write with no
    /// containment propagation. Returns `false` without writing anything if
    /// there is no active, editable scenario.
    pub(crate) fn patch_override(&self, feature_id: &FeatureId, patch: impl FnOnce(&mut Override)) -> bool {
        let mut state = self.state.write().expect("scenario manager poisoned");
        let Some(active_id) = state.active.clone() else {
            return false;
        };
        let Some(scenario) = state.scenarios.get_mut(&active_id) else {
            return false;
        };
        if scenario.id.is_baseline() {
            return false;
        }
        patch(scenario.overrides.entry(feature_id.clone()).or_default());
        scenario.is_changed = true;
        true
    }

    /// Remove a feature's override from the active scenario. Returns
    /// `true` if an override existed and was removed (§4.6 Revert).
    pub fn revert_feature(&self, feature_id: &FeatureId) -> bool {
        let mut state = self.state.write().expect("scenario manager poisoned");
        let Some(active_id) = state.active.clone() else {
            return false;
        };
        let Some(scenario) = state.scenarios.get_mut(&active_id) else {
            return false;
        };
        if scenario.overrides.shift_remove(feature_id).is_some() {
            scenario.is_changed = true;
            true
        } else {
            false
        }
    }
}

impl ActiveScenarioProvider for ScenarioManager {
    fn active_scenario(&self) -> Option<ScenarioSnapshot> {
        ScenarioManager::active_scenario(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> ScenarioManager {
        ScenarioManager::new(EventBus::new())
    }

    #[test]
    fn no_active_scenario_by_default() {
        let mgr = manager();
        assert!(mgr.active_scenario().is_none());
    }

    #[test]
    fn clone_activate_rename_delete_roundtrip() {
        let mgr = manager();
        let cloned = mgr.clone_scenario(&ScenarioId::baseline(), "Q1 plan").unwrap();
        assert!(!cloned.is_changed);

        mgr.activate_scenario(&cloned.id).unwrap();
        assert_eq!(mgr.active_scenario().unwrap().id, cloned.id);

        mgr.rename_scenario(&cloned.id, "Q1 plan v2").unwrap();
        assert_eq!(mgr.active_scenario().unwrap().name, "Q1 plan v2");

        mgr.delete_scenario(&cloned.id).unwrap();
        assert!(mgr.active_scenario().is_none());
    }

    #[test]
    fn baseline_cannot_be_renamed_or_deleted() {
        let mgr = manager();
        assert_matches::assert_matches!(
            mgr.rename_scenario(&ScenarioId::baseline(), "x"),
            Err(ScenarioError::BaselineImmutable)
        );
        assert_matches::assert_matches!(
            mgr.delete_scenario(&ScenarioId::baseline()),
            Err(ScenarioError::BaselineImmutable)
        );
    }

    #[tokio::test]
    async fn active_scenario_signal_emits_on_activate_and_delete() {
        use futures_util::StreamExt;

        let mgr = manager();
        let cloned = mgr.clone_scenario(&ScenarioId::baseline(), "plan").unwrap();

        let mut subscriber = mgr.subscribe_active_scenario();
        mgr.activate_scenario(&cloned.id).unwrap();
        assert_eq!(subscriber.next().await, Some(Some(cloned.id.clone())));

        mgr.delete_scenario(&cloned.id).unwrap();
        assert_eq!(subscriber.next().await, Some(None));
    }

    #[test]
    fn writes_to_unknown_scenario_fail() {
        let mgr = manager();
        assert_eq!(
            mgr.activate_scenario(&ScenarioId::new("nope")),
            Err(ScenarioError::NotFound(ScenarioId::new("nope")))
        );
    }

    #[test]
    fn set_scenario_override_requires_active_non_baseline_scenario() {
        let mgr = manager();
        let today = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        assert!(!mgr.set_scenario_override(FeatureId::new("f1"), today, today));

        let cloned = mgr.clone_scenario(&ScenarioId::baseline(), "plan").unwrap();
        mgr.activate_scenario(&cloned.id).unwrap();
        assert!(mgr.set_scenario_override(FeatureId::new("f1"), today, today));
        assert!(mgr.active_scenario().unwrap().is_changed);
    }

    #[test]
    fn revert_feature_removes_override() {
        let mgr = manager();
        let cloned = mgr.clone_scenario(&ScenarioId::baseline(), "plan").unwrap();
        mgr.activate_scenario(&cloned.id).unwrap();
        let today = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        mgr.set_scenario_override(FeatureId::new("f1"), today, today);

        assert!(mgr.revert_feature(&FeatureId::new("f1")));
        assert!(!mgr.active_scenario().unwrap().overrides.contains_key(&FeatureId::new("f1")));
        assert!(!mgr.revert_feature(&FeatureId::new("f1")));
    }
}
