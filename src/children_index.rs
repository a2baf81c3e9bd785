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

//! Derived index: epic id -> ordered list of its direct children (§3).
//!
//! Rebuilt whenever the baseline feature set changes; never mutated in
//! place, so there is no risk of it drifting from the baseline it was
//! built from.

use std::collections::HashMap;

use crate::model::{Feature, FeatureId};

#[derive(Clone, Debug, Default)]
pub struct ChildrenIndex {
    children: HashMap<FeatureId, Vec<FeatureId>>,
}

impl ChildrenIndex {
    pub fn from_baseline(features: &[Feature]) -> Self {
        let mut children: HashMap<FeatureId, Vec<FeatureId>> = HashMap::new();
        for feature in features {
            if let Some(epic) = &feature.parent_epic {
                children.entry(epic.clone()).or_default().push(feature.id.clone());
            }
        }
        Self { children }
    }

    pub fn children_of(&self, epic_id: &FeatureId) -> &[FeatureId] {
        self.children.get(epic_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn has_children(&self, epic_id: &FeatureId) -> bool {
        self.children.get(epic_id).is_some_and(|c| !c.is_empty())
    }
}
