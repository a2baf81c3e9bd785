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

//! Immutable baseline feature storage (§3, §4.1). Loaded once per session
//! (or replaced wholesale by a host re-sync); every other module treats it
//! as read-only.

use std::sync::RwLock;

use indexmap::IndexMap;

use crate::children_index::ChildrenIndex;
use crate::model::{Feature, FeatureId};

/// The baseline feature set plus its derived children index, kept in sync
/// under a single lock so readers never observe one without the other.
pub struct BaselineStore {
    inner: RwLock<Inner>,
}

struct Inner {
    features: IndexMap<FeatureId, Feature>,
    children: ChildrenIndex,
}

impl BaselineStore {
    pub fn new(features: Vec<Feature>) -> Self {
        Self {
            inner: RwLock::new(Self::build(features)),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    fn build(features: Vec<Feature>) -> Inner {
        let children = ChildrenIndex::from_baseline(&features);
        let features = features.into_iter().map(|f| (f.id.clone(), f)).collect();
        Inner { features, children }
    }

    /// Full ordered snapshot, in baseline load order.
    pub fn get_features(&self) -> Vec<Feature> {
        let inner = self.inner.read().expect("baseline store poisoned");
        inner.features.values().cloned().collect()
    }

    pub fn get_feature_by_id(&self, id: &FeatureId) -> Option<Feature> {
        let inner = self.inner.read().expect("baseline store poisoned");
        inner.features.get(id).cloned()
    }

    pub fn contains(&self, id: &FeatureId) -> bool {
        let inner = self.inner.read().expect("baseline store poisoned");
        inner.features.contains_key(id)
    }

    /// Replace the whole baseline and rebuild the children index from it.
    pub fn set_features(&self, features: Vec<Feature>) {
        let mut inner = self.inner.write().expect("baseline store poisoned");
        *inner = Self::build(features);
    }

    pub fn children_of(&self, epic_id: &FeatureId) -> Vec<FeatureId> {
        let inner = self.inner.read().expect("baseline store poisoned");
        inner.children_of(epic_id).to_vec()
    }

    pub fn has_children(&self, epic_id: &FeatureId) -> bool {
        let inner = self.inner.read().expect("baseline store poisoned");
        inner.children.has_children(epic_id)
    }
}

impl Inner {
    fn children_of(&self, epic_id: &FeatureId) -> &[FeatureId] {
        self.children.children_of(epic_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FeatureType;
    use chrono::NaiveDate;

    fn feature(id: &str, parent: Option<&str>) -> Feature {
        let d = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        Feature {
            id: FeatureId::new(id),
            r#type: FeatureType::Feature,
            start: d,
            end: d,
            parent_epic: parent.map(FeatureId::new),
            project: String::new(),
            title: String::new(),
            state: String::new(),
            capacity: None,
            relations: Vec::new(),
        }
    }

    #[test]
    fn get_by_id_and_children_index_track_replacement() {
        let store = BaselineStore::new(vec![feature("epic-1", None), feature("f1", Some("epic-1"))]);
        assert!(store.get_feature_by_id(&FeatureId::new("f1")).is_some());
        assert_eq!(store.children_of(&FeatureId::new("epic-1")), vec![FeatureId::new("f1")]);

        store.set_features(vec![feature("epic-1", None)]);
        assert!(store.get_feature_by_id(&FeatureId::new("f1")).is_none());
        assert!(store.children_of(&FeatureId::new("epic-1")).is_empty());
    }
}
