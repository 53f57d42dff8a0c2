//! REST client for a Cloud-Identity-style group directory
//!
//! Endpoints used (relative to the base URL):
//!
//! | Operation     | Request                                                   |
//! |---------------|-----------------------------------------------------------|
//! | resolve group | `GET  /v1/groups:lookup?groupKey.id={email}`              |
//! | list members  | `GET  /v1/{group}/memberships?pageSize=&pageToken=`       |
//! | add member    | `POST /v1/{group}/memberships`                            |
//! | find member   | `GET  /v1/{group}/memberships:lookup?memberKey.id={email}`|
//! | remove member | `DELETE /v1/{membership}`                                 |
//!
//! Every request waits on a governor rate limiter, and 429, 5xx and
//! transport failures are retried with exponential backoff.

use async_trait::async_trait;
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use reqwest::{Client, Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::num::NonZeroU32;
use std::time::Duration;
use tracing::{debug, info};

use super::{DirectoryClient, DirectoryResult, RemoveOutcome};
use crate::config::DirectoryConfig;
use crate::error::DirectoryError;
use crate::models::{GroupEmail, GroupName, MemberEmail, MembershipInfo, MembershipName};
use crate::utils::retry::{with_retry_if, RetryConfig};

const DEFAULT_PAGE_SIZE: u32 = 200;

#[derive(Debug, Deserialize)]
struct NamedResource {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListMembershipsResponse {
    #[serde(default)]
    memberships: Vec<Membership>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Membership {
    name: String,
    preferred_member_key: Option<EntityKey>,
}

#[derive(Debug, Deserialize)]
struct EntityKey {
    id: String,
}

#[derive(Debug, Deserialize)]
struct Operation {
    response: Option<NamedResource>,
}

/// HTTP implementation of [`DirectoryClient`]
pub struct HttpDirectoryClient {
    /// HTTP client with configured timeout and compression
    client: Client,

    /// Rate limiter to control request frequency
    rate_limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,

    /// Backoff for transient failures
    retry: RetryConfig,

    /// API root, without trailing slash
    base_url: String,

    /// Bearer token, if the directory requires one
    token: Option<String>,

    /// Page size for membership listing
    page_size: u32,
}

impl HttpDirectoryClient {
    /// Create a client from configuration
    ///
    /// # Errors
    ///
    /// Returns `DirectoryError::InvalidUrl` for a bad base URL, or
    /// `DirectoryError::Http` if the HTTP client cannot be created.
    pub fn new(config: &DirectoryConfig) -> DirectoryResult<Self> {
        let mut client = Self::with_options(
            &config.base_url,
            config.requests_per_second,
            Duration::from_secs(config.request_timeout_secs),
            &config.user_agent,
        )?;
        client.token = config.token.clone();
        client.retry = RetryConfig::new(config.max_retries);
        client.page_size = config.page_size;
        Ok(client)
    }

    /// Create a client against a custom base URL (mock servers in tests)
    pub fn with_base_url(base_url: &str, requests_per_second: u32) -> DirectoryResult<Self> {
        Self::with_options(
            base_url,
            requests_per_second,
            Duration::from_secs(30),
            concat!("roster-sync/", env!("CARGO_PKG_VERSION")),
        )
    }

    fn with_options(
        base_url: &str,
        requests_per_second: u32,
        timeout: Duration,
        user_agent: &str,
    ) -> DirectoryResult<Self> {
        let parsed =
            url::Url::parse(base_url).map_err(|e| DirectoryError::InvalidUrl(format!("{base_url}: {e}")))?;
        if parsed.cannot_be_a_base() {
            return Err(DirectoryError::InvalidUrl(base_url.to_string()));
        }

        let client = Client::builder()
            .timeout(timeout)
            .gzip(true)
            .user_agent(user_agent)
            .build()?;

        let rate = NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN);
        let rate_limiter = RateLimiter::direct(Quota::per_second(rate));

        Ok(Self {
            client,
            rate_limiter,
            retry: RetryConfig::default(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token: None,
            page_size: DEFAULT_PAGE_SIZE,
        })
    }

    /// Set the bearer token
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Override the transient-failure retry policy
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Override the listing page size
    #[must_use]
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Send one request, mapping non-success statuses to errors
    async fn send_once(
        &self,
        method: &Method,
        url: &str,
        query: &[(&str, String)],
        body: Option<&serde_json::Value>,
    ) -> DirectoryResult<Response> {
        self.rate_limiter.until_ready().await;

        let mut request = self.client.request(method.clone(), url).query(query);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();

        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(DirectoryError::RateLimit);
        }
        if status.is_server_error() {
            return Err(DirectoryError::ServerError(status.as_u16()));
        }

        let body = response.text().await.unwrap_or_default();
        Err(DirectoryError::Rejected {
            status: status.as_u16(),
            body,
        })
    }

    /// Send with retry of transient failures
    async fn send(
        &self,
        method: Method,
        url: &str,
        query: &[(&str, String)],
        body: Option<&serde_json::Value>,
    ) -> DirectoryResult<Response> {
        with_retry_if(
            &self.retry,
            || self.send_once(&method, url, query, body),
            DirectoryError::is_recoverable,
        )
        .await
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> DirectoryResult<T> {
        let response = self.send(Method::GET, url, query, None).await?;
        Ok(response.json::<T>().await?)
    }

    /// Look up the relationship name of one member, `None` on 404
    async fn find_membership(
        &self,
        group: &GroupName,
        member: &MemberEmail,
    ) -> DirectoryResult<Option<MembershipName>> {
        let url = self.url(&format!("{group}/memberships:lookup"));
        let query = [("memberKey.id", member.to_string())];

        match self.get_json::<NamedResource>(&url, &query).await {
            Ok(found) => Ok(found.name.filter(|n| !n.is_empty()).map(MembershipName::new)),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn is_not_found(err: &DirectoryError) -> bool {
    matches!(err, DirectoryError::Rejected { status: 404, .. })
}

#[async_trait]
impl DirectoryClient for HttpDirectoryClient {
    async fn resolve_group(&self, group: &GroupEmail) -> DirectoryResult<Option<GroupName>> {
        let url = self.url("groups:lookup");
        let query = [("groupKey.id", group.to_string())];

        match self.get_json::<NamedResource>(&url, &query).await {
            Ok(found) => {
                let name = found.name.filter(|n| !n.is_empty()).map(GroupName::new);
                if let Some(name) = &name {
                    debug!(group = %group, name = %name, "Resolved group");
                }
                Ok(name)
            }
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list_members(&self, group: &GroupName) -> DirectoryResult<Vec<MembershipInfo>> {
        let url = self.url(&format!("{group}/memberships"));
        let mut members = Vec::new();
        let mut page_token: Option<String> = None;
        let mut pages = 0u32;

        loop {
            let mut query = vec![("pageSize", self.page_size.to_string())];
            if let Some(token) = &page_token {
                query.push(("pageToken", token.clone()));
            }

            let page: ListMembershipsResponse = self.get_json(&url, &query).await?;
            pages += 1;

            // Memberships without a member key (e.g. service principals) are not addressable by email
            members.extend(page.memberships.into_iter().filter_map(|m| {
                m.preferred_member_key.map(|key| MembershipInfo {
                    name: MembershipName::new(m.name),
                    email: MemberEmail::new(key.id),
                })
            }));

            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }

        debug!(group = %group, members = members.len(), pages = pages, "Listed group members");
        Ok(members)
    }

    async fn add_member(
        &self,
        group: &GroupName,
        member: &MemberEmail,
    ) -> DirectoryResult<MembershipInfo> {
        let url = self.url(&format!("{group}/memberships"));
        let body = serde_json::json!({
            "preferredMemberKey": { "id": member.as_str() },
            "roles": [{ "name": "MEMBER" }],
        });

        let response = self.send(Method::POST, &url, &[], Some(&body)).await?;
        let operation: Operation = response.json().await?;

        let name = operation
            .response
            .and_then(|r| r.name)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| {
                DirectoryError::MalformedResponse(format!(
                    "create membership for {member} returned no membership name"
                ))
            })?;

        info!(group = %group, member = %member, membership = %name, "Membership created");
        Ok(MembershipInfo {
            name: MembershipName::new(name),
            email: member.clone(),
        })
    }

    async fn remove_member(
        &self,
        group: &GroupName,
        member: &MemberEmail,
    ) -> DirectoryResult<RemoveOutcome> {
        let Some(membership) = self.find_membership(group, member).await? else {
            debug!(group = %group, member = %member, "Member already absent");
            return Ok(RemoveOutcome::AlreadyAbsent);
        };

        let url = self.url(membership.as_str());
        match self.send(Method::DELETE, &url, &[], None).await {
            Ok(_) => {
                info!(group = %group, member = %member, membership = %membership, "Membership deleted");
                Ok(RemoveOutcome::Removed)
            }
            // Deleted between lookup and delete
            Err(e) if is_not_found(&e) => Ok(RemoveOutcome::AlreadyAbsent),
            Err(e) => Err(e),
        }
    }
}
