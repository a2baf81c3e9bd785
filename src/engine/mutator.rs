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

//! Single-field mutator and revert (§4.6 "Capacity / single-field updates",
//! §4.6 "Revert"). Both are direct, non-queued writes against the active
//! scenario: no parent-epic propagation, no child shifting. Reserved for
//! point edits (a capacity table cell, a details-panel field) that never
//! touch containment.

use std::str::FromStr;

use chrono::NaiveDate;

use crate::error::InvalidField;
use crate::event_bus::{CapacityUpdated, EventBus, EventPayload, FeatureUpdated};
use crate::model::{CapacityEntry, FeatureId};
use crate::scenario::ScenarioManager;

/// The three fields `update_feature_field` is allowed to touch (§4.6:
/// "field ∈ {start, end, capacity}; other fields are refused").
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UpdatableField {
    Start,
    End,
    Capacity,
}

impl FromStr for UpdatableField {
    type Err = InvalidField;

    /// Validates an untrusted field name, e.g. one deserialized from a host
    /// request, before a caller constructs a [`FieldUpdate`].
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(Self::Start),
            "end" => Ok(Self::End),
            "capacity" => Ok(Self::Capacity),
            other => Err(InvalidField(other.to_string())),
        }
    }
}

/// A single-field write, already typed so `update_feature_field` cannot be
/// called with a value that doesn't match its field.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldUpdate {
    Start(NaiveDate),
    End(NaiveDate),
    Capacity(Vec<CapacityEntry>),
}

impl FieldUpdate {
    pub fn field(&self) -> UpdatableField {
        match self {
            FieldUpdate::Start(_) => UpdatableField::Start,
            FieldUpdate::End(_) => UpdatableField::End,
            FieldUpdate::Capacity(_) => UpdatableField::Capacity,
        }
    }
}

/// Borrows the scenario manager and event bus the same way [`crate::overlay::OverlayEngine`]
/// borrows its collaborators; stateless beyond that, so a host can build one
/// per request or keep one alongside its `ConstraintEngine`.
pub struct FeatureMutator<'a> {
    scenarios: &'a ScenarioManager,
    events: &'a EventBus,
}

impl<'a> FeatureMutator<'a> {
    pub fn new(scenarios: &'a ScenarioManager, events: &'a EventBus) -> Self {
        Self { scenarios, events }
    }

    /// `FEATURE_NOT_FOUND`/`SCENARIO_INACTIVE` (§7) both surface here as
    /// `false` rather than an error, matching the spec's silent write path.
    pub fn update_feature_field(&self, id: &FeatureId, update: FieldUpdate) -> bool {
        let wrote = match &update {
            FieldUpdate::Start(date) => self.scenarios.patch_override(id, |o| o.start = Some(*date)),
            FieldUpdate::End(date) => self.scenarios.patch_override(id, |o| o.end = Some(*date)),
            FieldUpdate::Capacity(capacity) => {
                let capacity = capacity.clone();
                self.scenarios.patch_override(id, move |o| o.capacity = Some(capacity))
            }
        };
        if !wrote {
            return false;
        }

        self.events.emit(EventPayload::FeatureUpdated(FeatureUpdated { ids: vec![id.clone()] }));
        if let FieldUpdate::Capacity(capacity) = update {
            self.events.emit(EventPayload::CapacityUpdated(CapacityUpdated {
                feature_id: id.clone(),
                capacity,
            }));
        }
        true
    }

    /// §4.6 Revert: drop the active scenario's override for `id`, if any.
    pub fn revert_feature(&self, id: &FeatureId) -> bool {
        let reverted = self.scenarios.revert_feature(id);
        if reverted {
            self.events.emit(EventPayload::FeatureUpdated(FeatureUpdated { ids: vec![id.clone()] }));
        }
        reverted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::baseline::BaselineStore;
    use crate::model::{Feature, FeatureType};
    use crate::overlay::OverlayEngine;
    use crate::scenario::ScenarioId;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn feature(id: &str) -> Feature {
        Feature {
            id: FeatureId::new(id),
            r#type: FeatureType::Feature,
            start: d("2025-01-01"),
            end: d("2025-01-05"),
            parent_epic: None,
            project: String::new(),
            title: String::new(),
            state: String::new(),
            capacity: None,
            relations: Vec::new(),
        }
    }

    fn active_manager() -> ScenarioManager {
        let mgr = ScenarioManager::new(EventBus::new());
        let cloned = mgr.clone_scenario(&ScenarioId::baseline(), "plan").unwrap();
        mgr.activate_scenario(&cloned.id).unwrap();
        mgr
    }

    #[test]
    fn field_update_requires_active_scenario() {
        let mgr = ScenarioManager::new(EventBus::new());
        let events = EventBus::new();
        let mutator = FeatureMutator::new(&mgr, &events);
        assert!(!mutator.update_feature_field(&FeatureId::new("f1"), FieldUpdate::Start(d("2025-01-02"))));
    }

    #[test]
    fn capacity_update_emits_both_events() {
        let mgr = active_manager();
        let events = EventBus::new();
        let mutator = FeatureMutator::new(&mgr, &events);

        let updated = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let captured = updated.clone();
        events.on(crate::event_bus::EventKind::FeatureUpdated, move |payload| {
            if let EventPayload::FeatureUpdated(e) = payload {
                captured.lock().unwrap().push(e.ids.clone());
            }
        });
        let capacity_seen = std::sync::Arc::new(std::sync::Mutex::new(None));
        let captured_capacity = capacity_seen.clone();
        events.on(crate::event_bus::EventKind::CapacityUpdated, move |payload| {
            if let EventPayload::CapacityUpdated(e) = payload {
                *captured_capacity.lock().unwrap() = Some(e.clone());
            }
        });

        let capacity = vec![CapacityEntry { team: "t".into(), capacity: 50.0 }];
        assert!(mutator.update_feature_field(&FeatureId::new("f2"), FieldUpdate::Capacity(capacity.clone())));

        assert_eq!(updated.lock().unwrap().len(), 1);
        let seen = capacity_seen.lock().unwrap().clone().unwrap();
        assert_eq!(seen.feature_id, FeatureId::new("f2"));
        assert_eq!(seen.capacity, capacity);

        let active = mgr.active_scenario().unwrap();
        assert_eq!(active.overrides.get(&FeatureId::new("f2")).unwrap().capacity, Some(capacity));
    }

    #[test]
    fn revert_is_inverse_of_a_fresh_override() {
        let baseline = BaselineStore::new(vec![feature("f1")]);
        let mgr = active_manager();
        let events = EventBus::new();
        let mutator = FeatureMutator::new(&mgr, &events);

        mutator.update_feature_field(&FeatureId::new("f1"), FieldUpdate::Start(d("2025-01-02")));
        assert!(mutator.revert_feature(&FeatureId::new("f1")));
        assert!(!mgr.active_scenario().unwrap().overrides.contains_key(&FeatureId::new("f1")));

        // idempotent read sanity: overlay now reports pure baseline again.
        let overlay = OverlayEngine::new(&baseline, &mgr);
        let effective = overlay.get_effective_feature_by_id(&FeatureId::new("f1")).unwrap();
        assert!(!effective.scenario_override);
    }

    #[test]
    fn invalid_field_name_is_rejected() {
        assert_eq!(UpdatableField::from_str("title"), Err(InvalidField("title".to_string())));
        assert_eq!(UpdatableField::from_str("capacity"), Ok(UpdatableField::Capacity));
    }
}
