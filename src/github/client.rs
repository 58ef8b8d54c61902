//! Thin REST client over the GitHub endpoints the scheduler needs.

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::{Client, Method, Response};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;

use crate::config::GitHubConfig;
use crate::error::{Result, RetriggerError};

const USER_AGENT: &str = concat!("retrigger/", env!("CARGO_PKG_VERSION"));
const PER_PAGE: usize = 100;

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub login: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Repository {
    pub full_name: String,
    #[serde(default)]
    pub fork: bool,
    #[serde(default)]
    pub has_issues: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Issue {
    pub number: u64,
    /// Present only when the issue is really a pull request
    #[serde(default)]
    pub pull_request: Option<serde_json::Value>,
    #[serde(default)]
    pub assignees: Vec<User>,
}

impl Issue {
    pub fn is_pull_request(&self) -> bool {
        self.pull_request.is_some()
    }

    pub fn is_assigned_to(&self, login: &str) -> bool {
        self.assignees.iter().any(|a| a.login == login)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Comment {
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub user: Option<User>,
    pub created_at: DateTime<Utc>,
}

impl Comment {
    pub fn is_from(&self, login: &str) -> bool {
        self.user.as_ref().is_some_and(|u| u.login == login)
    }

    pub fn text(&self) -> &str {
        self.body.as_deref().unwrap_or("")
    }
}

/// Authenticated GitHub API client
pub struct GitHubClient {
    http: Client,
    api_url: String,
    token: String,
}

impl GitHubClient {
    pub fn new(config: &GitHubConfig, token: String) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| RetriggerError::GitHub(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    /// Non-fork repositories owned by the authenticated user with issues enabled.
    pub async fn owned_repos(&self) -> Result<Vec<Repository>> {
        let repos: Vec<Repository> = self.get_paged("/user/repos?affiliation=owner").await?;
        Ok(repos.into_iter().filter(|r| !r.fork && r.has_issues).collect())
    }

    /// Open issues of a repository, pull requests excluded.
    pub async fn open_issues(&self, repo: &str) -> Result<Vec<Issue>> {
        let issues: Vec<Issue> = self.get_paged(&format!("/repos/{}/issues?state=open", repo)).await?;
        Ok(issues.into_iter().filter(|i| !i.is_pull_request()).collect())
    }

    pub async fn issue(&self, repo: &str, number: u64) -> Result<Issue> {
        let response = self
            .send(Method::GET, &format!("/repos/{}/issues/{}", repo, number), None)
            .await?;
        Ok(response.json().await?)
    }

    /// All comments on an issue, oldest first.
    pub async fn issue_comments(&self, repo: &str, number: u64) -> Result<Vec<Comment>> {
        self.get_paged(&format!("/repos/{}/issues/{}/comments", repo, number))
            .await
    }

    pub async fn add_assignee(&self, repo: &str, number: u64, login: &str) -> Result<()> {
        let path = format!("/repos/{}/issues/{}/assignees", repo, number);
        self.send(Method::POST, &path, Some(json!({ "assignees": [login] })))
            .await?;
        Ok(())
    }

    pub async fn remove_assignee(&self, repo: &str, number: u64, login: &str) -> Result<()> {
        let path = format!("/repos/{}/issues/{}/assignees", repo, number);
        self.send(Method::DELETE, &path, Some(json!({ "assignees": [login] })))
            .await?;
        Ok(())
    }

    async fn get_paged<T: DeserializeOwned>(&self, path: &str) -> Result<Vec<T>> {
        let separator = if path.contains('?') { '&' } else { '?' };
        let mut all = Vec::new();
        let mut page = 1;

        loop {
            let paged = format!("{}{}per_page={}&page={}", path, separator, PER_PAGE, page);
            let batch: Vec<T> = self.send(Method::GET, &paged, None).await?.json().await?;
            let done = batch.len() < PER_PAGE;
            all.extend(batch);
            if done {
                break;
            }
            page += 1;
        }

        Ok(all)
    }

    async fn send(&self, method: Method, path: &str, body: Option<serde_json::Value>) -> Result<Response> {
        let url = format!("{}{}", self.api_url, path);
        log::debug!("GitHub {} {}", method, url);

        let mut request = self
            .http
            .request(method.clone(), &url)
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28");
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            return Err(RetriggerError::GitHub(format!(
                "{} {} returned {}: {}",
                method,
                path,
                status.as_u16(),
                error_body.chars().take(200).collect::<String>()
            )));
        }

        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_deserialize_skips_missing_fields() {
        let issue: Issue = serde_json::from_str(r#"{"number": 7}"#).unwrap();
        assert_eq!(issue.number, 7);
        assert!(!issue.is_pull_request());
        assert!(!issue.is_assigned_to("octocat"));

        let pr: Issue = serde_json::from_str(
            r#"{"number": 8, "pull_request": {"url": "x"}, "assignees": [{"login": "octocat"}]}"#,
        )
        .unwrap();
        assert!(pr.is_pull_request());
        assert!(pr.is_assigned_to("octocat"));
    }

    #[test]
    fn test_comment_deserialize() {
        let comment: Comment = serde_json::from_str(
            r#"{"body": "hello", "user": {"login": "traycerai[bot]"}, "created_at": "2025-01-02T03:04:05Z"}"#,
        )
        .unwrap();
        assert!(comment.is_from("traycerai[bot]"));
        assert_eq!(comment.text(), "hello");
        assert_eq!(comment.created_at.to_rfc3339(), "2025-01-02T03:04:05+00:00");

        let ghost: Comment = serde_json::from_str(r#"{"body": null, "user": null, "created_at": "2025-01-02T03:04:05Z"}"#)
            .unwrap();
        assert!(!ghost.is_from("traycerai[bot]"));
        assert_eq!(ghost.text(), "");
    }

    #[test]
    fn test_client_trims_api_url() {
        let config = GitHubConfig {
            api_url: "https://github.example.com/api/v3/".to_string(),
            ..GitHubConfig::default()
        };
        let client = GitHubClient::new(&config, "token".to_string()).unwrap();
        assert_eq!(client.api_url, "https://github.example.com/api/v3");
    }
}
