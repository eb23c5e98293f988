use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;

use super::executor::{CandidateSource, RepoBundle, RepoSource};
use super::models::{Candidate, EntityKey, check_credential_ref};
use crate::errors::JobError;

const USER_AGENT: &str = "repowatch";
const PER_PAGE: usize = 100;

/// A GitHub repository (subset of fields we care about).
#[derive(Debug, Deserialize)]
pub struct GitHubRepo {
    pub name: String,
    pub description: Option<String>,
    pub default_branch: Option<String>,
    pub language: Option<String>,
    #[serde(default)]
    pub stargazers_count: u64,
    #[serde(default)]
    pub fork: bool,
    #[serde(default)]
    pub archived: bool,
    pub homepage: Option<String>,
    #[serde(default)]
    pub topics: Vec<String>,
    pub pushed_at: Option<String>,
}

/// Map a non-success GitHub response onto the job error taxonomy.
///
/// 429, and 403 with an exhausted rate limit, are throttling. Other 401/403
/// and 404 responses mean the credential cannot see the repository.
pub fn classify_status(status: u16, rate_limit_remaining: Option<u64>, message: &str) -> JobError {
    let detail = format!("GitHub returned {}: {}", status, message);
    match status {
        429 => JobError::RateLimited(detail),
        403 if rate_limit_remaining == Some(0)
            || message.to_lowercase().contains("rate limit") =>
        {
            JobError::RateLimited(detail)
        }
        401 | 403 | 404 => JobError::AccessDenied(detail),
        _ => JobError::Generic(detail),
    }
}

/// GitHub error bodies are `{"message": ...}`; fall back to the raw text.
fn error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string())
}

/// REST client implementing both [`RepoSource`] and [`CandidateSource`].
///
/// A job's `credential_ref` names the `REPOWATCH_TOKEN_*` environment variable
/// holding its token; without one the client falls back to the configured
/// `default_token_env`. Requests go out unauthenticated when no token is set.
pub struct GitHubClient {
    http: reqwest::Client,
    api_url: String,
    default_token_env: String,
}

impl GitHubClient {
    pub fn new(api_url: &str, default_token_env: &str) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .context("Failed to build GitHub HTTP client")?;
        Ok(Self {
            http,
            api_url: api_url.trim_end_matches('/').to_string(),
            default_token_env: default_token_env.to_string(),
        })
    }

    fn token(&self, credential_ref: Option<&str>) -> Result<Option<String>, JobError> {
        let var = match credential_ref {
            Some(var) => {
                check_credential_ref(var).map_err(JobError::AccessDenied)?;
                var
            }
            None => self.default_token_env.as_str(),
        };
        Ok(std::env::var(var).ok().filter(|t| !t.trim().is_empty()))
    }

    fn get(&self, path: &str, token: Option<&str>) -> reqwest::RequestBuilder {
        let req = self
            .http
            .get(format!("{}{}", self.api_url, path))
            .header("Accept", "application/vnd.github+json");
        match token {
            Some(token) => req.header("Authorization", format!("Bearer {}", token)),
            None => req,
        }
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response, JobError> {
        let resp = req
            .send()
            .await
            .map_err(|e| JobError::Generic(format!("GitHub request failed: {}", e)))?;
        Self::check(resp).await
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, JobError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let remaining = resp
            .headers()
            .get("x-ratelimit-remaining")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let body = resp.text().await.unwrap_or_default();
        Err(classify_status(status.as_u16(), remaining, &error_message(&body)))
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, token: Option<&str>) -> Result<T, JobError> {
        self.send(self.get(path, token))
            .await?
            .json::<T>()
            .await
            .map_err(|e| JobError::Generic(format!("Failed to parse GitHub response: {}", e)))
    }

    /// Raw README text, or `None` when the repository has none.
    async fn readme(&self, key: &EntityKey, token: Option<&str>) -> Result<Option<String>, JobError> {
        let path = format!("/repos/{}/{}/readme", key.namespace(), key.name());
        let req = self
            .get(&path, token)
            .header("Accept", "application/vnd.github.raw+json");
        let resp = req
            .send()
            .await
            .map_err(|e| JobError::Generic(format!("GitHub request failed: {}", e)))?;
        // The repository itself was readable, so a 404 here only means "no README".
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Self::check(resp)
            .await?
            .text()
            .await
            .map(Some)
            .map_err(|e| JobError::Generic(format!("Failed to read README: {}", e)))
    }
}

#[async_trait]
impl RepoSource for GitHubClient {
    async fn fetch_bundle(
        &self,
        key: &EntityKey,
        credential_ref: Option<&str>,
    ) -> Result<RepoBundle, JobError> {
        let token = self.token(credential_ref)?;
        let repo: GitHubRepo = self
            .get_json(&format!("/repos/{}/{}", key.namespace(), key.name()), token.as_deref())
            .await?;
        let readme = self.readme(key, token.as_deref()).await?;
        Ok(RepoBundle {
            key: key.clone(),
            description: repo.description,
            default_branch: repo.default_branch,
            language: repo.language,
            stars: repo.stargazers_count,
            fork: repo.fork,
            archived: repo.archived,
            homepage: repo.homepage.filter(|h| !h.is_empty()),
            topics: repo.topics,
            readme,
            pushed_at: repo.pushed_at,
        })
    }
}

#[async_trait]
impl CandidateSource for GitHubClient {
    /// Every repository owned by `owner`, paginating through all pages.
    async fn list_candidates(
        &self,
        owner: &str,
        credential_ref: Option<&str>,
    ) -> Result<Vec<Candidate>, JobError> {
        let token = self.token(credential_ref)?;
        let mut candidates = Vec::new();
        let mut page = 1u32;
        loop {
            let req = self.get(&format!("/users/{}/repos", owner), token.as_deref()).query(&[
                ("type", "owner"),
                ("per_page", PER_PAGE.to_string().as_str()),
                ("page", page.to_string().as_str()),
            ]);
            let repos: Vec<GitHubRepo> = self
                .send(req)
                .await?
                .json()
                .await
                .map_err(|e| JobError::Generic(format!("Failed to parse repos response: {}", e)))?;
            let count = repos.len();
            candidates.extend(
                repos
                    .into_iter()
                    .map(|r| Candidate::new(EntityKey::new(owner, &r.name), r.fork)),
            );
            if count < PER_PAGE {
                break;
            }
            page += 1;
        }
        Ok(candidates)
    }
}
