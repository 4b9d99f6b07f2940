//! Configuration service client
//!
//! Provides an abstraction for the two endpoints the sync engine needs: the
//! conditional namespace fetch and the notification long poll.

use crate::config::{ClientConfig, FetchPolicy, PollPolicy};
use crate::error::{Result, SyncError};
use crate::identity::{ClientKey, NamespaceIdentity, RawConfig};
use crate::signing::sign_request;
use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::time::Duration;

/// Notification id sent for a namespace that has not been notified yet.
pub const INITIAL_NOTIFICATION_ID: i64 = -1;

/// Per-release message ids the service attaches to a notification; echoed on
/// the following fetch so the service can skip stale caches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationMessages {
    #[serde(default)]
    pub details: BTreeMap<String, i64>,
}

impl NotificationMessages {
    /// Merge in `other`, keeping the highest id per key.
    pub fn merge(&mut self, other: &NotificationMessages) {
        for (key, id) in &other.details {
            let current = self.details.entry(key.clone()).or_insert(*id);
            if *id > *current {
                *current = *id;
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.details.is_empty()
    }
}

/// One namespace in a long-poll request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRecord {
    pub namespace_name: String,
    pub notification_id: i64,
}

/// One changed namespace in a long-poll response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationUpdate {
    pub namespace_name: String,
    pub notification_id: i64,
    #[serde(default)]
    pub messages: Option<NotificationMessages>,
}

/// Result of a conditional fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// A release newer than the one we sent
    Modified(RawConfig),
    /// HTTP 304: the release key we sent is current
    NotModified,
}

/// Result of one long poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Changed(Vec<NotificationUpdate>),
    /// HTTP 304: the hold timeout elapsed without a change
    Unchanged,
}

/// Client for one `(appid, cluster)` group on the configuration service
#[async_trait]
pub trait ApolloClient: Debug + Send + Sync {
    fn client_key(&self) -> &ClientKey;

    /// Fetch a namespace, conditional on `release_key` when given.
    async fn fetch_config(
        &self,
        namespace: &str,
        label: Option<&str>,
        release_key: Option<&str>,
        messages: Option<&NotificationMessages>,
    ) -> Result<FetchOutcome>;

    /// Long-poll for changes to any of `notifications`.
    async fn poll_notifications(&self, notifications: &[NotificationRecord])
        -> Result<PollOutcome>;
}

/// Body of a 200 from `/configs/...`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigResponse {
    #[allow(dead_code)] // Echoed back by the service; identity comes from the request
    app_id: String,
    #[allow(dead_code)]
    cluster: String,
    #[allow(dead_code)]
    namespace_name: String,
    #[serde(default)]
    configurations: IndexMap<String, serde_json::Value>,
    release_key: String,
}

/// Values are documented as strings; anything else is kept as its JSON text.
fn value_text(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s,
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn flatten(configurations: IndexMap<String, serde_json::Value>) -> Vec<(String, String)> {
    configurations
        .into_iter()
        .map(|(key, value)| (key, value_text(value)))
        .collect()
}

/// HTTP-based client
#[derive(Debug)]
pub struct HttpApolloClient {
    config: ClientConfig,
    key: ClientKey,
    http: reqwest::Client,
    fetch_timeout: Duration,
    poll_timeout: Duration,
}

impl HttpApolloClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        Self::with_policies(config, &FetchPolicy::default(), &PollPolicy::default())
    }

    pub fn with_policies(
        config: ClientConfig,
        fetch: &FetchPolicy,
        poll: &PollPolicy,
    ) -> Result<Self> {
        config.validate()?;
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| SyncError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            key: config.client_key(),
            config,
            http,
            fetch_timeout: fetch.request_timeout(),
            poll_timeout: poll.request_timeout(),
        })
    }

    fn url(&self, endpoint: &str, namespace: &str) -> String {
        format!(
            "{}/{}/{}/{}/{}",
            self.config.base_url(),
            endpoint,
            urlencoding::encode(&self.config.appid),
            urlencoding::encode(&self.config.cluster),
            urlencoding::encode(namespace)
        )
    }

    /// Build, sign and send a request.
    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let mut request = builder
            .build()
            .map_err(|e| SyncError::Config(format!("Invalid request: {}", e)))?;
        if let Some(secret) = &self.config.secret_key {
            sign_request(&mut request, &self.config.appid, secret)?;
        }
        tracing::debug!(url = %request.url(), "sending request");
        Ok(self.http.execute(request).await?)
    }

    /// Read a namespace through the service's cache-backed endpoint.
    ///
    /// Cheaper for the service than [`fetch_config`](ApolloClient::fetch_config)
    /// but may lag a release by up to a second and carries no release key.
    pub async fn cached_config(&self, namespace: &str) -> Result<Vec<(String, String)>> {
        let url = self.url("configfiles/json", namespace);
        let resp = self
            .send(self.http.get(&url).timeout(self.fetch_timeout))
            .await?;

        match resp.status().as_u16() {
            200 => {
                let body = resp.bytes().await?;
                let configurations: IndexMap<String, serde_json::Value> =
                    serde_json::from_slice(&body)?;
                Ok(flatten(configurations))
            }
            status => Err(SyncError::Http { status, url }),
        }
    }
}

#[async_trait]
impl ApolloClient for HttpApolloClient {
    fn client_key(&self) -> &ClientKey {
        &self.key
    }

    async fn fetch_config(
        &self,
        namespace: &str,
        label: Option<&str>,
        release_key: Option<&str>,
        messages: Option<&NotificationMessages>,
    ) -> Result<FetchOutcome> {
        let url = self.url("configs", namespace);

        let mut query: Vec<(&str, String)> = Vec::new();
        if let Some(release_key) = release_key {
            query.push(("releaseKey", release_key.to_string()));
        }
        if let Some(messages) = messages.filter(|m| !m.is_empty()) {
            query.push(("messages", serde_json::to_string(messages)?));
        }
        if let Some(label) = label {
            query.push(("label", label.to_string()));
        }

        let resp = self
            .send(
                self.http
                    .get(&url)
                    .query(&query)
                    .timeout(self.fetch_timeout),
            )
            .await?;

        match resp.status().as_u16() {
            200 => {
                let body = resp.bytes().await?;
                let parsed: ConfigResponse = serde_json::from_slice(&body)?;
                let mut identity = NamespaceIdentity::in_group(&self.key, namespace);
                identity.label = label.map(str::to_string);
                Ok(FetchOutcome::Modified(RawConfig {
                    identity,
                    release_key: parsed.release_key,
                    entries: flatten(parsed.configurations),
                }))
            }
            304 => Ok(FetchOutcome::NotModified),
            status => Err(SyncError::Http { status, url }),
        }
    }

    async fn poll_notifications(
        &self,
        notifications: &[NotificationRecord],
    ) -> Result<PollOutcome> {
        let url = format!("{}/notifications/v2", self.config.base_url());
        let query = [
            ("appId", self.config.appid.clone()),
            ("cluster", self.config.cluster.clone()),
            ("notifications", serde_json::to_string(notifications)?),
        ];

        let resp = self
            .send(self.http.get(&url).query(&query).timeout(self.poll_timeout))
            .await?;

        match resp.status().as_u16() {
            200 => {
                let body = resp.bytes().await?;
                let updates: Vec<NotificationUpdate> = serde_json::from_slice(&body)?;
                Ok(PollOutcome::Changed(updates))
            }
            304 => Ok(PollOutcome::Unchanged),
            status => Err(SyncError::Http { status, url }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header_exists, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> HttpApolloClient {
        HttpApolloClient::new(ClientConfig::new(server.uri(), "SampleApp")).unwrap()
    }

    #[test]
    fn test_notification_serde_matches_wire_format() {
        let records = vec![NotificationRecord {
            namespace_name: "application".to_string(),
            notification_id: INITIAL_NOTIFICATION_ID,
        }];
        assert_eq!(
            serde_json::to_string(&records).unwrap(),
            r#"[{"namespaceName":"application","notificationId":-1}]"#
        );

        let json = r#"[{
            "namespaceName": "application",
            "notificationId": 101,
            "messages": {"details": {"SampleApp+default+application": 101}}
        }]"#;
        let updates: Vec<NotificationUpdate> = serde_json::from_str(json).unwrap();
        assert_eq!(updates[0].notification_id, 101);
        assert_eq!(
            updates[0].messages.as_ref().unwrap().details["SampleApp+default+application"],
            101
        );
    }

    #[test]
    fn test_messages_merge_keeps_highest() {
        let mut a = NotificationMessages::default();
        a.details.insert("k1".to_string(), 5);
        a.details.insert("k2".to_string(), 9);
        let mut b = NotificationMessages::default();
        b.details.insert("k1".to_string(), 7);
        b.details.insert("k2".to_string(), 3);
        b.details.insert("k3".to_string(), 1);

        a.merge(&b);
        assert_eq!(a.details["k1"], 7);
        assert_eq!(a.details["k2"], 9);
        assert_eq!(a.details["k3"], 1);
    }

    #[tokio::test]
    async fn test_fetch_config_keeps_entry_order() {
        let server = MockServer::start().await;
        let body = r#"{
            "appId": "SampleApp",
            "cluster": "default",
            "namespaceName": "application",
            "configurations": {"zeta": "1", "alpha": "2", "a.bb[0]": "3", "port": 8080},
            "releaseKey": "20240101-abc"
        }"#;
        Mock::given(method("GET"))
            .and(path("/configs/SampleApp/default/application"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/json"))
            .mount(&server)
            .await;

        let outcome = client(&server)
            .fetch_config("application", None, None, None)
            .await
            .unwrap();

        let FetchOutcome::Modified(raw) = outcome else {
            panic!("expected Modified, got {:?}", outcome);
        };
        assert_eq!(raw.release_key, "20240101-abc");
        assert_eq!(
            raw.identity,
            NamespaceIdentity::new("SampleApp", "default", "application")
        );
        let keys: Vec<_> = raw.entries.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["zeta", "alpha", "a.bb[0]", "port"]);
        assert_eq!(raw.entries[3].1, "8080");
    }

    #[tokio::test]
    async fn test_fetch_config_sends_release_key_and_label() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/configs/SampleApp/default/db"))
            .and(query_param("releaseKey", "rk-1"))
            .and(query_param("label", "canary"))
            .respond_with(ResponseTemplate::new(304))
            .expect(1)
            .mount(&server)
            .await;

        let outcome = client(&server)
            .fetch_config("db", Some("canary"), Some("rk-1"), None)
            .await
            .unwrap();
        assert_eq!(outcome, FetchOutcome::NotModified);
    }

    #[tokio::test]
    async fn test_fetch_config_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = client(&server)
            .fetch_config("missing", None, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Http { status: 404, .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_fetch_config_bad_body_is_json_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let err = client(&server)
            .fetch_config("application", None, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Json(_)));
    }

    #[tokio::test]
    async fn test_signed_requests_carry_auth_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/configs/SampleApp/default/application"))
            .and(header_exists("Authorization"))
            .and(header_exists("Timestamp"))
            .respond_with(ResponseTemplate::new(304))
            .expect(1)
            .mount(&server)
            .await;

        let config = ClientConfig::new(server.uri(), "SampleApp").with_secret("secret");
        let client = HttpApolloClient::new(config).unwrap();
        let outcome = client
            .fetch_config("application", None, None, None)
            .await
            .unwrap();
        assert_eq!(outcome, FetchOutcome::NotModified);
    }

    #[tokio::test]
    async fn test_poll_notifications() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/notifications/v2"))
            .and(query_param("appId", "SampleApp"))
            .and(query_param("cluster", "default"))
            .and(query_param(
                "notifications",
                r#"[{"namespaceName":"application","notificationId":-1}]"#,
            ))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                r#"[{"namespaceName":"application","notificationId":7}]"#,
                "application/json",
            ))
            .mount(&server)
            .await;

        let outcome = client(&server)
            .poll_notifications(&[NotificationRecord {
                namespace_name: "application".to_string(),
                notification_id: INITIAL_NOTIFICATION_ID,
            }])
            .await
            .unwrap();

        let PollOutcome::Changed(updates) = outcome else {
            panic!("expected Changed, got {:?}", outcome);
        };
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].notification_id, 7);
    }

    #[tokio::test]
    async fn test_poll_not_modified() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/notifications/v2"))
            .respond_with(ResponseTemplate::new(304))
            .mount(&server)
            .await;

        let outcome = client(&server).poll_notifications(&[]).await.unwrap();
        assert_eq!(outcome, PollOutcome::Unchanged);
    }

    #[tokio::test]
    async fn test_cached_config() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/configfiles/json/SampleApp/default/application"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(r#"{"b": "1", "a": "2"}"#, "application/json"),
            )
            .mount(&server)
            .await;

        let entries = client(&server).cached_config("application").await.unwrap();
        assert_eq!(
            entries,
            vec![
                ("b".to_string(), "1".to_string()),
                ("a".to_string(), "2".to_string())
            ]
        );
    }
}
