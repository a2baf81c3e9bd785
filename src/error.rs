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

//! Error types for the handful of seams in this crate that can actually
//! fail. The hot write path (`update_feature_dates`, `update_feature_field`,
//! `revert_feature`) never returns these; per spec §7 it reports failure
//! through booleans/counts instead. These types exist for the boundaries
//! that parse untrusted input outside that path: scenario management and
//! single-date parsing.

use crate::scenario::ScenarioId;

/// Failure parsing a single ISO `YYYY-MM-DD` calendar-day string.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid calendar date {value:?}")]
pub struct InvalidDateFormat {
    pub value: String,
}

/// Failures from [`crate::scenario::ScenarioManager`] operations.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ScenarioError {
    #[error("no scenario with id {0:?}")]
    NotFound(ScenarioId),
    #[error("the baseline scenario is immutable")]
    BaselineImmutable,
}

/// Failure constructing an [`crate::engine::mutator::UpdatableField`] from an
/// untrusted field name, e.g. one deserialized from a host request.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{0:?} is not an updatable field (expected start, end, or capacity)")]
pub struct InvalidField(pub String);
