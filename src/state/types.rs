//! Persisted per-dataset state.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::version::Version;

/// One dataset's entry in `state.json`.
///
/// `last_update` is the ISO-8601 form of the last committed version, or an
/// empty string when nothing has been committed (including after the store
/// healed a malformed file). Every other key is auxiliary data owned by the
/// collaborators and carried across commits untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(default)]
    pub last_update: String,
    #[serde(flatten)]
    pub aux: Map<String, Value>,
}

impl PersistedState {
    /// The stored version, if one is recorded and parses.
    pub fn last_version(&self) -> Option<Version> {
        if self.last_update.is_empty() {
            return None;
        }
        match Version::parse(&self.last_update) {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!(last_update = %self.last_update, "Ignoring stored version: {}", e);
                None
            }
        }
    }

    /// The state to commit after processing `version`: `aux` merged over the
    /// auxiliary keys of `previous`.
    pub fn advance(
        previous: Option<&PersistedState>,
        version: Version,
        aux: Map<String, Value>,
    ) -> Self {
        let mut merged = previous.map(|p| p.aux.clone()).unwrap_or_default();
        for (k, v) in aux {
            // `last_update` is owned by the store, never by collaborators.
            if k != "last_update" {
                merged.insert(k, v);
            }
        }
        Self {
            last_update: version.to_iso8601(),
            aux: merged,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_aux_keys_round_trip() {
        let raw = json!({"last_update": "2024-03-07T12:00:00", "normals": {"03": 41.5}});
        let state: PersistedState = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(state.last_update, "2024-03-07T12:00:00");
        assert_eq!(state.aux["normals"], json!({"03": 41.5}));
        assert_eq!(serde_json::to_value(&state).unwrap(), raw);
    }

    #[test]
    fn test_last_version_empty_and_garbage() {
        assert_eq!(PersistedState::default().last_version(), None);
        let bad = PersistedState {
            last_update: "yesterday".into(),
            aux: Map::new(),
        };
        assert_eq!(bad.last_version(), None);
    }

    #[test]
    fn test_advance_merges_aux() {
        let prev: PersistedState = serde_json::from_value(
            json!({"last_update": "2024-02-01T00:00:00", "normals": {"02": 1}, "keep": true}),
        )
        .unwrap();
        let mut aux = Map::new();
        aux.insert("normals".into(), json!({"02": 1, "03": 2}));
        aux.insert("last_update".into(), json!("ignored"));
        let v = Version::from_ymd_h(2024, 3, 1, 0).unwrap();

        let next = PersistedState::advance(Some(&prev), v, aux);
        assert_eq!(next.last_update, "2024-03-01T00:00:00");
        assert_eq!(next.aux["normals"], json!({"02": 1, "03": 2}));
        assert_eq!(next.aux["keep"], json!(true));
        assert!(!next.aux.contains_key("last_update"));
    }
}
