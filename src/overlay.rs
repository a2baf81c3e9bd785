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

//! The read path (§4.5): merges baseline features with the active
//! scenario's overrides into value snapshots. Pure, never writes to the
//! baseline or to a scenario's overrides, and emits no events.

use bitflags::bitflags;
use chrono::NaiveDate;

use crate::baseline::BaselineStore;
use crate::model::{CapacityEntry, Feature, FeatureId, FeatureType};
use crate::scenario::{ActiveScenarioProvider, Override};

bitflags! {
    /// Which override fields diverge from baseline. A bitset rather than a
    /// `Vec<String>` so callers match exhaustively instead of string-comparing.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct ChangedFields: u8 {
        const START    = 0b001;
        const END      = 0b010;
        const CAPACITY = 0b100;
    }
}

/// A baseline feature with its active scenario's override merged in.
/// A value snapshot: consumers must not rely on it aliasing baseline or
/// override storage.
#[derive(Clone, Debug, PartialEq)]
pub struct EffectiveFeature {
    pub id: FeatureId,
    pub r#type: FeatureType,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub parent_epic: Option<FeatureId>,
    pub project: String,
    pub title: String,
    pub state: String,
    pub capacity: Option<Vec<CapacityEntry>>,
    /// `true` iff an override record exists for this id, even one that
    /// happens to equal baseline (§4.5: "scenarioOverride = true iff an
    /// override record exists... even if it happens to equal baseline").
    pub scenario_override: bool,
    pub changed_fields: ChangedFields,
}

impl EffectiveFeature {
    pub fn dirty(&self) -> bool {
        !self.changed_fields.is_empty()
    }

    fn merge(base: &Feature, over: Option<&Override>) -> Self {
        let start = over.and_then(|o| o.start).unwrap_or(base.start);
        let end = over.and_then(|o| o.end).unwrap_or(base.end);
        let capacity = over
            .and_then(|o| o.capacity.clone())
            .or_else(|| base.capacity.clone());

        let mut changed = ChangedFields::empty();
        if let Some(o) = over {
            if o.start.is_some_and(|s| s != base.start) {
                changed |= ChangedFields::START;
            }
            if o.end.is_some_and(|e| e != base.end) {
                changed |= ChangedFields::END;
            }
            if let Some(ref c) = o.capacity {
                if Some(c) != base.capacity.as_ref() {
                    changed |= ChangedFields::CAPACITY;
                }
            }
        }

        Self {
            id: base.id.clone(),
            r#type: base.r#type,
            start,
            end,
            parent_epic: base.parent_epic.clone(),
            project: base.project.clone(),
            title: base.title.clone(),
            state: base.state.clone(),
            capacity,
            scenario_override: over.is_some(),
            changed_fields: changed,
        }
    }
}

/// Borrows a [`BaselineStore`] and an [`ActiveScenarioProvider`]; neither is
/// owned, so the same baseline/provider pair can back several overlays
/// (e.g. one per request) without cloning the feature set.
pub struct OverlayEngine<'a> {
    baseline: &'a BaselineStore,
    scenario_provider: &'a dyn ActiveScenarioProvider,
}

impl<'a> OverlayEngine<'a> {
    pub fn new(baseline: &'a BaselineStore, scenario_provider: &'a dyn ActiveScenarioProvider) -> Self {
        Self { baseline, scenario_provider }
    }

    pub fn get_effective_features(&self) -> Vec<EffectiveFeature> {
        let active = self.scenario_provider.active_scenario();
        self.baseline
            .get_features()
            .iter()
            .map(|base| {
                let over = active.as_ref().and_then(|s| s.overrides.get(&base.id));
                EffectiveFeature::merge(base, over)
            })
            .collect()
    }

    pub fn get_effective_feature_by_id(&self, id: &FeatureId) -> Option<EffectiveFeature> {
        let base = self.baseline.get_feature_by_id(id)?;
        let active = self.scenario_provider.active_scenario();
        let over = active.as_ref().and_then(|s| s.overrides.get(id));
        Some(EffectiveFeature::merge(&base, over))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::EventBus;
    use crate::scenario::ScenarioManager;
    use chrono::NaiveDate;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn feature(id: &str, start: &str, end: &str) -> Feature {
        Feature {
            id: FeatureId::new(id),
            r#type: FeatureType::Feature,
            start: d(start),
            end: d(end),
            parent_epic: None,
            project: String::new(),
            title: String::new(),
            state: String::new(),
            capacity: None,
            relations: Vec::new(),
        }
    }

    #[test]
    fn no_active_scenario_yields_baseline_values() {
        let baseline = BaselineStore::new(vec![feature("f1", "2025-01-01", "2025-01-05")]);
        let mgr = ScenarioManager::new(EventBus::new());
        let overlay = OverlayEngine::new(&baseline, &mgr);

        let effective = overlay.get_effective_feature_by_id(&FeatureId::new("f1")).unwrap();
        assert_eq!(effective.start, d("2025-01-01"));
        assert!(!effective.scenario_override);
        assert!(!effective.dirty());
    }

    #[test]
    fn override_changes_are_reflected_and_flagged() {
        let baseline = BaselineStore::new(vec![feature("f1", "2025-01-01", "2025-01-05")]);
        let mgr = ScenarioManager::new(EventBus::new());
        let cloned = mgr.clone_scenario(&crate::scenario::ScenarioId::baseline(), "plan").unwrap();
        mgr.activate_scenario(&cloned.id).unwrap();
        mgr.set_scenario_override(FeatureId::new("f1"), d("2025-01-02"), d("2025-01-06"));

        let overlay = OverlayEngine::new(&baseline, &mgr);
        let effective = overlay.get_effective_feature_by_id(&FeatureId::new("f1")).unwrap();
        assert_eq!(effective.start, d("2025-01-02"));
        assert_eq!(effective.end, d("2025-01-06"));
        assert!(effective.scenario_override);
        assert_eq!(
            effective.changed_fields,
            ChangedFields::START | ChangedFields::END
        );
    }

    #[test]
    fn read_is_pure_and_repeatable() {
        let baseline = BaselineStore::new(vec![feature("f1", "2025-01-01", "2025-01-05")]);
        let mgr = ScenarioManager::new(EventBus::new());
        let overlay = OverlayEngine::new(&baseline, &mgr);
        let first = overlay.get_effective_features();
        let second = overlay.get_effective_features();
        assert_eq!(first, second);
    }
}
