//! Namespace identity and raw configuration types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Namespace used when none is named explicitly.
pub const DEFAULT_NAMESPACE: &str = "application";

/// Cluster used when none is configured.
pub const DEFAULT_CLUSTER: &str = "default";

/// `(appid, cluster)`: selects the client group (one HTTP client and one
/// long-poll loop) that serves a namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientKey {
    pub appid: String,
    pub cluster: String,
}

impl ClientKey {
    pub fn new(appid: impl Into<String>, cluster: impl Into<String>) -> Self {
        Self {
            appid: appid.into(),
            cluster: cluster.into(),
        }
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.appid, self.cluster)
    }
}

/// Uniquely identifies one remote configuration document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NamespaceIdentity {
    pub appid: String,
    pub cluster: String,
    pub namespace: String,
    /// Gray-release label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl NamespaceIdentity {
    pub fn new(
        appid: impl Into<String>,
        cluster: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            appid: appid.into(),
            cluster: cluster.into(),
            namespace: namespace.into(),
            label: None,
        }
    }

    /// Identity within an existing client group.
    pub fn in_group(key: &ClientKey, namespace: impl Into<String>) -> Self {
        Self::new(key.appid.clone(), key.cluster.clone(), namespace)
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn client_key(&self) -> ClientKey {
        ClientKey::new(self.appid.clone(), self.cluster.clone())
    }
}

impl fmt::Display for NamespaceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.appid, self.cluster, self.namespace)?;
        if let Some(label) = &self.label {
            write!(f, "@{}", label)?;
        }
        Ok(())
    }
}

/// One fetched release of a namespace, before assembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawConfig {
    pub identity: NamespaceIdentity,
    /// Opaque version token, echoed back on the next conditional fetch
    pub release_key: String,
    /// Flat entries in the order the service returned them
    pub entries: Vec<(String, String)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_display() {
        let id = NamespaceIdentity::new("SampleApp", "default", "application");
        assert_eq!(id.to_string(), "SampleApp/default/application");
        assert_eq!(
            id.with_label("gray").to_string(),
            "SampleApp/default/application@gray"
        );
    }

    #[test]
    fn test_label_is_part_of_identity() {
        let plain = NamespaceIdentity::new("app", "default", "db");
        let labelled = plain.clone().with_label("canary");
        assert_ne!(plain, labelled);
        assert_eq!(plain.client_key(), labelled.client_key());
    }

    #[test]
    fn test_identity_serde_omits_missing_label() {
        let id = NamespaceIdentity::new("app", "default", "db");
        let json = serde_json::to_value(&id).unwrap();
        assert!(json.get("label").is_none());
        let back: NamespaceIdentity = serde_json::from_value(json).unwrap();
        assert_eq!(back, id);
    }
}
