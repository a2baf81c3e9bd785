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

//! Scenario overlay and hierarchical constraint engine for a timeline
//! planning tool built on Epics and Features.
//!
//! A host embeds this crate the way it would embed `matrix-sdk-ui`: it owns
//! a [`baseline::BaselineStore`], a [`scenario::ScenarioManager`], and an
//! [`event_bus::EventBus`], wires a [`overlay::OverlayEngine`] over the
//! first two for reads, and a [`engine::ConstraintEngine`] over all three
//! for writes. None of these types reach for a process-wide singleton;
//! the host constructs one of each per planning session and clones the
//! cheap, `Arc`-backed handles (`EventBus`, `BaselineStore` behind `Arc`,
//! `ConstraintEngine`) out to whichever request handlers need them.
//!
//! ```
//! use std::sync::Arc;
//! use scenario_engine::{
//!     baseline::BaselineStore,
//!     config::EngineFlags,
//!     engine::ConstraintEngine,
//!     event_bus::EventBus,
//!     overlay::OverlayEngine,
//!     scenario::ScenarioManager,
//! };
//!
//! let events = EventBus::new();
//! let baseline = Arc::new(BaselineStore::empty());
//! let scenarios = Arc::new(ScenarioManager::new(events.clone()));
//! let overlay = OverlayEngine::new(&baseline, &*scenarios);
//! let _engine = ConstraintEngine::new(baseline.clone(), scenarios.clone(), events, EngineFlags::default());
//! assert!(overlay.get_effective_features().is_empty());
//! ```

pub mod baseline;
pub mod children_index;
pub mod config;
pub mod engine;
pub mod error;
pub mod event_bus;
pub mod model;
pub mod overlay;
pub mod scenario;

pub use baseline::BaselineStore;
pub use children_index::ChildrenIndex;
pub use config::EngineFlags;
pub use engine::mutator::{FeatureMutator, FieldUpdate, UpdatableField};
pub use engine::{ConstraintEngine, DateUpdate, UpdateCallback};
pub use error::{InvalidDateFormat, InvalidField, ScenarioError};
pub use event_bus::{EventBus, EventKind, EventPayload};
pub use model::{CapacityEntry, Feature, FeatureId, FeatureType, Relation, RelationKind};
pub use overlay::{ChangedFields, EffectiveFeature, OverlayEngine};
pub use scenario::{ActiveScenarioProvider, Override, Scenario, ScenarioId, ScenarioManager, ScenarioSnapshot};
