//! Preview app definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Source blobs submitted by a creator
///
/// The contents are opaque: they are stored and handed to the renderer,
/// never inspected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppSource {
    #[serde(default)]
    pub html: String,
    #[serde(default)]
    pub css: String,
    #[serde(default)]
    pub js: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_code: Option<String>,
}

impl AppSource {
    /// Total size of all blobs in bytes
    pub fn payload_len(&self) -> usize {
        self.html.len()
            + self.css.len()
            + self.js.len()
            + self.backend_code.as_ref().map_or(0, |code| code.len())
    }
}

/// Immutable definition of a preview app
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppDefinition {
    pub app_id: String,
    pub user_id: String,
    #[serde(flatten)]
    pub source: AppSource,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl AppDefinition {
    /// Build a definition with a fresh id that expires `ttl` from `now`
    pub fn new(user_id: &str, source: AppSource, now: DateTime<Utc>, ttl: Duration) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(36_500));
        Self {
            app_id: uuid::Uuid::new_v4().simple().to_string(),
            user_id: user_id.to_string(),
            source,
            created_at: now,
            expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> AppSource {
        AppSource {
            html: "<h1>hi</h1>".to_string(),
            css: "h1 { color: red }".to_string(),
            js: "console.log(1)".to_string(),
            backend_code: None,
        }
    }

    #[test]
    fn test_new_definition_expiry() {
        let now = Utc::now();
        let def = AppDefinition::new("user-1", source(), now, Duration::from_secs(60));

        assert_eq!(def.user_id, "user-1");
        assert_eq!(def.app_id.len(), 32);
        assert_eq!(def.expires_at - def.created_at, chrono::Duration::seconds(60));
        assert!(!def.is_expired(now));
        assert!(def.is_expired(now + chrono::Duration::seconds(60)));
    }

    #[test]
    fn test_unique_ids() {
        let now = Utc::now();
        let a = AppDefinition::new("u", source(), now, Duration::from_secs(1));
        let b = AppDefinition::new("u", source(), now, Duration::from_secs(1));
        assert_ne!(a.app_id, b.app_id);
    }

    #[test]
    fn test_payload_len() {
        let mut src = source();
        let base = src.payload_len();
        src.backend_code = Some("abcd".to_string());
        assert_eq!(src.payload_len(), base + 4);
    }

    #[test]
    fn test_json_shape() {
        let now = Utc::now();
        let mut src = source();
        src.backend_code = Some("require('http')".to_string());
        let def = AppDefinition::new("u", src, now, Duration::from_secs(1));

        let json = serde_json::to_value(&def).unwrap();
        assert!(json.get("appId").is_some());
        assert!(json.get("backendCode").is_some());
        assert!(json.get("html").is_some());

        let parsed: AppDefinition = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, def);
    }
}
