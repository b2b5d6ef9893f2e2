//! Request shapes the API layer accepts.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ResourceLimits;

/// Caller-supplied adjustments on top of a template.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoomOverrides {
    /// Environment values; every key must be recognized by the template.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Resource limits replacing the template defaults field by field.
    #[serde(default)]
    pub resources: ResourceLimits,
}

/// Body of `POST /api/rooms`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateRoomRequest {
    pub name: String,
    pub template: String,
    #[serde(default)]
    pub overrides: RoomOverrides,
}

impl CreateRoomRequest {
    /// A request without overrides.
    pub fn new(name: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            template: template.into(),
            overrides: RoomOverrides::default(),
        }
    }

    /// Sets one environment override.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.overrides.env.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_are_optional() {
        let req: CreateRoomRequest =
            serde_json::from_str(r#"{"name":"alice","template":"browser"}"#).unwrap();
        assert_eq!(req.name, "alice");
        assert!(req.overrides.env.is_empty());
        assert!(req.overrides.resources.memory_mb.is_none());
    }

    #[test]
    fn test_overrides_parse() {
        let req: CreateRoomRequest = serde_json::from_str(
            r#"{
                "name": "alice",
                "template": "browser",
                "overrides": { "env": { "PASSWORD": "s3cret" }, "resources": { "memory_mb": 512 } }
            }"#,
        )
        .unwrap();
        assert_eq!(req.overrides.env["PASSWORD"], "s3cret");
        assert_eq!(req.overrides.resources.memory_mb, Some(512));
    }
}
