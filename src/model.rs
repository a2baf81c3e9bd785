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

//! Baseline data model: [`Feature`], its id, and the pass-through relation
//! shapes the renderer cares about but the engine does not.

use std::fmt;
use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Stable identifier for a [`Feature`]. Cheap to clone (interned `Arc<str>`)
/// since ids are copied into override maps, children indices, and event
/// payloads constantly.
#[derive(Clone, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureId(Arc<str>);

impl FeatureId {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for FeatureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FeatureId({:?})", self.0)
    }
}

impl fmt::Display for FeatureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FeatureId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for FeatureId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// Discriminates an epic from a leaf feature. The engine dispatches on this
/// tag rather than through virtual methods (see DESIGN.md, "Polymorphic
/// dispatch").
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeatureType {
    Epic,
    Feature,
}

/// A single team's capacity allocation on a feature.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CapacityEntry {
    pub team: String,
    pub capacity: f64,
}

/// One entry of the `relations` field baseline records carry. The core only
/// ever reads [`Feature::parent_epic`]; everything else in here is opaque
/// pass-through for the renderer. See DESIGN.md for why this is a
/// discriminated variant rather than a serde-untagged blob.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Relation {
    Simple(String),
    Numeric(i64),
    Typed { r#type: RelationKind, target: String },
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RelationKind {
    Parent,
    Successor,
    Related,
    Other(String),
}

impl Serialize for RelationKind {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(match self {
            RelationKind::Parent => "Parent",
            RelationKind::Successor => "Successor",
            RelationKind::Related => "Related",
            RelationKind::Other(other) => other,
        })
    }
}

impl<'de> Deserialize<'de> for RelationKind {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(match raw.as_str() {
            "Parent" => RelationKind::Parent,
            "Successor" => RelationKind::Successor,
            "Related" => RelationKind::Related,
            _ => RelationKind::Other(raw),
        })
    }
}

/// A baseline feature (or epic). Never mutated after load; see
/// [`crate::baseline::BaselineStore`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub id: FeatureId,
    pub r#type: FeatureType,
    pub start: NaiveDate,
    pub end: NaiveDate,
    #[serde(default)]
    pub parent_epic: Option<FeatureId>,
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub capacity: Option<Vec<CapacityEntry>>,
    #[serde(default)]
    pub relations: Vec<Relation>,
}

impl Feature {
    pub fn is_epic(&self) -> bool {
        matches!(self.r#type, FeatureType::Epic)
    }
}
