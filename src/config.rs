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

//! Process-wide configuration flags (§6). A Rust host loads this the way it
//! would any other `serde`-backed config: from TOML, JSON, env, or just
//! `EngineFlags::default()`.

use serde::{Deserialize, Serialize};

/// Recognized configuration flags.
///
/// | Flag | Effect |
/// |---|---|
/// | `use_queued_feature_service` | selects the queued (Phase A/B) variant over an immediate-write variant |
/// | `service_instrumentation` | logs skipped/overridden optimistic writes at `debug` level |
/// | `log_event_history` | bounds the event bus's history ring buffer; `None` disables it |
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineFlags {
    pub use_queued_feature_service: bool,
    pub service_instrumentation: bool,
    pub log_event_history: Option<usize>,
}

impl Default for EngineFlags {
    fn default() -> Self {
        Self {
            use_queued_feature_service: true,
            service_instrumentation: false,
            log_event_history: None,
        }
    }
}

impl EngineFlags {
    /// Parse flags from a TOML document, e.g. loaded from a host's config
    /// file. Unrecognized keys are rejected by `toml`'s default strictness.
    pub fn from_toml_str(input: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(input)
    }

    /// Serialize flags back to TOML, e.g. for a host writing out defaults.
    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string(self)
    }

    /// Parse flags from a JSON document, e.g. a host's `/config` endpoint
    /// response rather than a file on disk.
    pub fn from_json_str(input: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(input)
    }

    /// Serialize flags to JSON, the shape a host's admin API would return.
    pub fn to_json_string(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let flags = EngineFlags::default();
        assert!(flags.use_queued_feature_service);
        assert!(!flags.service_instrumentation);
        assert_eq!(flags.log_event_history, None);
    }

    #[test]
    fn parses_flat_config() {
        let flags = EngineFlags::from_toml_str(
            "use_queued_feature_service = true\nservice_instrumentation = true\nlog_event_history = 200\n",
        )
        .unwrap();
        assert!(flags.service_instrumentation);
        assert_eq!(flags.log_event_history, Some(200));
    }

    #[test]
    fn rejects_unknown_flag() {
        assert!(EngineFlags::from_toml_str("not_a_flag = true\n").is_err());
    }

    #[test]
    fn round_trips_through_toml() {
        let mut flags = EngineFlags::default();
        flags.service_instrumentation = true;
        flags.log_event_history = Some(64);
        let serialized = flags.to_toml_string().unwrap();
        let parsed = EngineFlags::from_toml_str(&serialized).unwrap();
        assert_eq!(flags, parsed);
    }

    #[test]
    fn round_trips_through_json() {
        let mut flags = EngineFlags::default();
        flags.use_queued_feature_service = false;
        flags.log_event_history = Some(500);
        let serialized = flags.to_json_string().unwrap();
        let parsed = EngineFlags::from_json_str(&serialized).unwrap();
        assert_eq!(flags, parsed);
    }

    /// A host loading flags from an actual file on disk, not just a string
    /// already in memory.
    #[test]
    fn round_trips_through_a_config_file() -> anyhow::Result<()> {
        let mut flags = EngineFlags::default();
        flags.service_instrumentation = true;
        flags.log_event_history = Some(128);

        let file = tempfile::NamedTempFile::new()?;
        std::fs::write(file.path(), flags.to_toml_string()?)?;

        let loaded = EngineFlags::from_toml_str(&std::fs::read_to_string(file.path())?)?;
        assert_eq!(flags, loaded);
        Ok(())
    }
}
