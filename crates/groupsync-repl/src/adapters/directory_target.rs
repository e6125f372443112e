//! Group target over a REST directory service.
//!
//! Groups are addressed by key `name@domain`. Endpoints used, relative to
//! the configured base URL:
//!
//! - `GET    /groups/{key}`: group metadata, 404 when absent
//! - `GET    /groups/{key}/members[?pageToken=..]`: one page of members
//! - `POST   /groups`: create, 409 when it already exists
//! - `PATCH  /groups/{key}`: update the description
//! - `PATCH  /groups/{key}/settings`: apply default settings
//! - `POST   /groups/{key}/members`, `PATCH|DELETE /groups/{key}/members/{user}`
//!
//! Every call is admitted by the shared [`RateLimiter`] in chunks of at most
//! `batch_size` concurrent requests.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;
use groupsync_core::{Difference, Group, GroupSet, Role};
use reqwest::{Method, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::DirectoryTargetConfig;
use crate::error::SyncError;
use crate::ratelimit::RateLimiter;
use crate::state::TargetStore;
use crate::target::GroupTarget;

/// WAL set of group keys created but not yet configured.
pub const GROUPS_NEEDING_SETTINGS: &str = "GROUPS_NEEDING_SETTINGS";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Deserialize)]
struct RemoteGroup {
    email: String,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct RemoteMember {
    email: String,
    role: String,
}

#[derive(Debug, Default, Deserialize)]
struct MemberPage {
    #[serde(default)]
    members: Vec<RemoteMember>,
    #[serde(rename = "nextPageToken", default)]
    next_page_token: Option<String>,
}

/// A [`GroupTarget`] backed by a REST directory API.
pub struct DirectoryTarget {
    id: String,
    base_url: String,
    domain: String,
    token: String,
    batch_size: usize,
    group_description: Option<String>,
    limiter: Arc<RateLimiter>,
    client: reqwest::Client,
}

impl DirectoryTarget {
    /// Build from configuration with an explicit bearer token.
    pub fn new(config: &DirectoryTargetConfig, token: String, limiter: Arc<RateLimiter>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            id: config.id.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            domain: config.domain.clone(),
            token,
            batch_size: config.batch_size.max(1),
            group_description: config.group_description.clone(),
            limiter,
            client,
        }
    }

    /// Build from configuration, reading the token from `token_env`.
    pub fn from_config(
        config: &DirectoryTargetConfig,
        limiter: Arc<RateLimiter>,
    ) -> Result<Self, SyncError> {
        let token = std::env::var(&config.token_env).map_err(|_| SyncError::Config {
            msg: format!("environment variable {} is not set", config.token_env),
        })?;
        Ok(Self::new(config, token, limiter))
    }

    /// `name@domain`.
    pub fn group_key(&self, name: &str) -> String {
        format!("{}@{}", name, self.domain)
    }

    /// Base URL extended by `segments`, each one percent-encoded.
    fn url(&self, segments: &[&str]) -> Result<Url, SyncError> {
        let invalid = |reason: String| SyncError::Config {
            msg: format!("invalid base_url {}: {}", self.base_url, reason),
        };
        let mut url = Url::parse(&self.base_url).map_err(|e| invalid(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| invalid("cannot carry a path".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn call(
        &self,
        method: Method,
        segments: &[&str],
        query: Option<(&str, &str)>,
        body: Option<serde_json::Value>,
    ) -> Result<reqwest::Response, SyncError> {
        let mut request = self
            .client
            .request(method, self.url(segments)?)
            .bearer_auth(&self.token);
        if let Some(pair) = query {
            request = request.query(&[pair]);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.send().await?;
        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::FORBIDDEN {
            self.limiter.rate_limit_hit();
        }
        Ok(response)
    }

    /// Run `op` over `items` in rate-limited chunks of at most `batch_size`
    /// concurrent calls. Results come back in input order.
    pub async fn execute_batched<T, F, Fut, R>(&self, items: Vec<T>, op: F) -> Result<Vec<R>, SyncError>
    where
        F: Fn(T) -> Fut,
        Fut: Future<Output = R>,
    {
        let mut results = Vec::with_capacity(items.len());
        let mut items = items.into_iter().peekable();
        while items.peek().is_some() {
            let chunk: Vec<T> = items.by_ref().take(self.batch_size).collect();
            self.limiter.want_queries(chunk.len() as u64).await?;

            let start = Instant::now();
            let size = chunk.len();
            results.extend(join_all(chunk.into_iter().map(&op)).await);
            info!(
                target_id = %self.id,
                size,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "batch finished"
            );
        }
        Ok(results)
    }

    async fn fetch_group(&self, name: String) -> Result<Option<Group>, SyncError> {
        let key = self.group_key(&name);
        let response = self.call(Method::GET, &["groups", key.as_str()], None, None).await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => {
                let remote: RemoteGroup = response.json().await?;
                let remote_name = remote
                    .email
                    .split('@')
                    .next()
                    .unwrap_or_default()
                    .to_lowercase();
                Ok(Some(Group::new(remote_name, remote.description)))
            }
            s => Err(remote_error(s, response, &format!("looking up group {}", name)).await),
        }
    }

    async fn fetch_member_page(
        &self,
        name: String,
        page_token: Option<String>,
    ) -> (String, Result<Option<MemberPage>, SyncError>) {
        let key = self.group_key(&name);
        let query = page_token.as_deref().map(|token| ("pageToken", token));
        let result: Result<Option<MemberPage>, SyncError> = match self
            .call(Method::GET, &["groups", key.as_str(), "members"], query, None)
            .await
        {
            Ok(response) => match response.status() {
                StatusCode::NOT_FOUND => Ok(None),
                s if s.is_success() => response.json::<MemberPage>().await.map(Some).map_err(Into::into),
                s => Err(remote_error(s, response, &format!("listing members of {}", name)).await),
            },
            Err(e) => Err(e),
        };
        (name, result)
    }

    async fn create_group(&self, group: &Group) -> Result<(), SyncError> {
        info!(target_id = %self.id, group = %group.name(), "creating group");
        let body = json!({
            "email": self.group_key(group.name()),
            "name": group.description(),
            "description": group.description(),
        });
        let response = self.call(Method::POST, &["groups"], None, Some(body)).await?;
        match response.status() {
            StatusCode::CONFLICT => {
                info!(target_id = %self.id, group = %group.name(), "group already exists");
                Ok(())
            }
            s if s.is_success() => Ok(()),
            s => Err(remote_error(s, response, &format!("creating group {}", group.name())).await),
        }
    }

    /// Settings applied to every created group. The description is only
    /// overridden when one is configured.
    fn default_settings(&self) -> serde_json::Value {
        let mut settings = json!({
            "whoCanPostMessage": "ALL_MEMBERS_CAN_POST",
            "allowExternalMembers": "true",
            "whoCanJoin": "INVITED_CAN_JOIN",
            "isArchived": "true",
            "whoCanViewMembership": "ALL_MANAGERS_CAN_VIEW",
            "whoCanContactOwner": "ALL_MANAGERS_CAN_CONTACT",
        });
        if let Some(description) = &self.group_description {
            settings["description"] = json!(description);
        }
        settings
    }

    async fn configure_group(&self, key: String) -> (String, bool) {
        match self
            .call(Method::PATCH, &["groups", key.as_str(), "settings"], None, Some(self.default_settings()))
            .await
        {
            Ok(response) if response.status().is_success() => {
                info!(target_id = %self.id, group = %key, "configured group");
                (key, true)
            }
            Ok(response) => {
                warn!(target_id = %self.id, group = %key, status = %response.status(), "failed to configure group");
                (key, false)
            }
            Err(e) => {
                warn!(target_id = %self.id, group = %key, error = %e, "failed to configure group");
                (key, false)
            }
        }
    }

    async fn apply_one(&self, diff: Difference) -> Option<Difference> {
        let key = self.group_key(diff.group_name());
        let (method, segments, body): (Method, Vec<&str>, _) = match &diff {
            Difference::MetadataChange { group } => (
                Method::PATCH,
                vec!["groups", key.as_str()],
                Some(json!({ "description": group.description })),
            ),
            Difference::MemberAdd { user_id, role, .. } => (
                Method::POST,
                vec!["groups", key.as_str(), "members"],
                Some(json!({ "email": user_id, "role": role.as_str() })),
            ),
            Difference::MemberRoleChange { user_id, role, .. } => (
                Method::PATCH,
                vec!["groups", key.as_str(), "members", user_id.as_str()],
                Some(json!({ "email": user_id, "role": role.as_str() })),
            ),
            Difference::MemberDrop { user_id, .. } => (
                Method::DELETE,
                vec!["groups", key.as_str(), "members", user_id.as_str()],
                None,
            ),
        };

        let status = match self.call(method, &segments, None, body).await {
            Ok(response) => response.status(),
            Err(e) => {
                warn!(target_id = %self.id, diff = %diff, error = %e, "failed to apply diff");
                return None;
            }
        };

        let applied = status.is_success()
            || (status == StatusCode::CONFLICT && matches!(diff, Difference::MemberAdd { .. }))
            || (status == StatusCode::NOT_FOUND && matches!(diff, Difference::MemberDrop { .. }));
        if applied {
            debug!(target_id = %self.id, diff = %diff, status = %status, "applied diff");
            Some(diff)
        } else {
            warn!(target_id = %self.id, diff = %diff, status = %status, "failed to apply diff");
            None
        }
    }
}

async fn remote_error(status: StatusCode, response: reqwest::Response, context: &str) -> SyncError {
    let body = response.text().await.unwrap_or_default();
    SyncError::remote(Some(status.as_u16()), format!("{}: {}", context, body))
}

#[async_trait]
impl GroupTarget for DirectoryTarget {
    fn id(&self) -> &str {
        &self.id
    }

    async fn fetch_groups_for_names(&self, names: &[String]) -> Result<GroupSet, SyncError> {
        info!(target_id = %self.id, count = names.len(), "fetching group metadata");
        let found = self
            .execute_batched(names.to_vec(), |name| self.fetch_group(name))
            .await?;

        let mut result = GroupSet::new();
        for group in found {
            if let Some(group) = group? {
                result.get_or_insert(group);
            }
        }

        info!(target_id = %self.id, count = result.len(), "fetching group memberships");
        // Each group may need several pages; keep issuing rounds until every
        // group has reached its last page.
        let mut pending: HashMap<String, Option<String>> =
            result.names().into_iter().map(|name| (name, None)).collect();
        while !pending.is_empty() {
            let work: Vec<(String, Option<String>)> = pending.drain().collect();
            let pages = self
                .execute_batched(work, |(name, token)| self.fetch_member_page(name, token))
                .await?;

            for (name, page) in pages {
                let Some(page) = page? else {
                    continue;
                };
                let group = result.get_mut(&name)?;
                for member in page.members {
                    match member.role.parse::<Role>() {
                        Ok(role) => {
                            group.add_member(member.email.to_lowercase(), role);
                        }
                        Err(e) => warn!(target_id = %self.id, group = %name, error = %e, "skipping remote member"),
                    }
                }
                if let Some(token) = page.next_page_token.filter(|t| !t.is_empty()) {
                    pending.insert(name, Some(token));
                }
            }
        }

        Ok(result)
    }

    async fn create_new_groups(
        &self,
        groups: &[Group],
        store: &dyn TargetStore,
    ) -> Result<(), SyncError> {
        let mut needing_settings = store.read_set(&self.id, GROUPS_NEEDING_SETTINGS)?;
        if !groups.is_empty() {
            needing_settings.extend(groups.iter().map(|g| self.group_key(g.name())));
            store.write_set(&self.id, GROUPS_NEEDING_SETTINGS, &needing_settings)?;

            let created = self
                .execute_batched(groups.iter().collect(), |g| self.create_group(g))
                .await?;
            for result in created {
                result?;
            }
        }

        if needing_settings.is_empty() {
            return Ok(());
        }

        let outcomes = self
            .execute_batched(needing_settings.into_iter().collect(), |key| self.configure_group(key))
            .await?;
        let failed: BTreeSet<String> = outcomes
            .into_iter()
            .filter(|(_, ok)| !ok)
            .map(|(key, _)| key)
            .collect();
        if !failed.is_empty() {
            return Err(SyncError::remote(
                None,
                format!(
                    "failed to configure {} groups, will retry: {}",
                    failed.len(),
                    failed.into_iter().collect::<Vec<_>>().join(", ")
                ),
            ));
        }

        store.clear_set(&self.id, GROUPS_NEEDING_SETTINGS)?;
        Ok(())
    }

    async fn apply_diffs(
        &self,
        diffs: &[Difference],
        _store: &dyn TargetStore,
    ) -> Result<Vec<Difference>, SyncError> {
        let (metadata, membership): (Vec<Difference>, Vec<Difference>) = diffs
            .iter()
            .cloned()
            .partition(|d| matches!(d, Difference::MetadataChange { .. }));

        let mut applied = Vec::with_capacity(diffs.len());
        for batch in [metadata, membership] {
            let results = self.execute_batched(batch, |d| self.apply_one(d)).await?;
            applied.extend(results.into_iter().flatten());
        }
        info!(
            target_id = %self.id,
            applied = applied.len(),
            total = diffs.len(),
            "applied diffs"
        );
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> DirectoryTargetConfig {
        DirectoryTargetConfig {
            id: "dir".to_string(),
            base_url: "http://localhost:1/api/".to_string(),
            domain: "groups.example.edu".to_string(),
            credential: "svc@example.edu".to_string(),
            token_env: "GROUPSYNC_DIRECTORY_TARGET_TEST_UNSET".to_string(),
            batch_size: 2,
            group_description: None,
            queries_per_timestep: 10,
            timestep_ms: 1000,
        }
    }

    #[test]
    fn test_group_key_and_url() {
        let target = DirectoryTarget::new(&config(), "t".to_string(), Arc::new(RateLimiter::new(10, 1000)));
        assert_eq!(target.group_key("g1"), "g1@groups.example.edu");
        assert_eq!(
            target.url(&["groups"]).unwrap().as_str(),
            "http://localhost:1/api/groups"
        );
        assert_eq!(
            target
                .url(&["groups", "g1@groups.example.edu", "members", "a/b@example.edu"])
                .unwrap()
                .path(),
            "/api/groups/g1@groups.example.edu/members/a%2Fb@example.edu"
        );
    }

    #[test]
    fn test_settings_keep_description_unless_configured() {
        let limiter = Arc::new(RateLimiter::new(10, 1000));
        let target = DirectoryTarget::new(&config(), "t".to_string(), Arc::clone(&limiter));
        assert!(target.default_settings().get("description").is_none());

        let mut with_description = config();
        with_description.group_description = Some("auto-created group".to_string());
        let target = DirectoryTarget::new(&with_description, "t".to_string(), limiter);
        assert_eq!(target.default_settings()["description"], "auto-created group");
        assert_eq!(target.default_settings()["whoCanJoin"], "INVITED_CAN_JOIN");
    }

    #[test]
    fn test_from_config_requires_token() {
        let result = DirectoryTarget::from_config(&config(), Arc::new(RateLimiter::new(10, 1000)));
        assert!(matches!(result, Err(SyncError::Config { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_batched_chunks_through_limiter() {
        let limiter = Arc::new(RateLimiter::new(10, 1000));
        let target = DirectoryTarget::new(&config(), "t".to_string(), Arc::clone(&limiter));

        let results = target
            .execute_batched((1..=5).collect(), |n: u32| async move { n * 10 })
            .await
            .unwrap();

        assert_eq!(results, vec![10, 20, 30, 40, 50]);
        assert_eq!(limiter.queries_in_window().await, 5);
    }
}
