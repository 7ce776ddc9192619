//! GitHub REST client for tracked repositories.
//!
//! A repository's activity is the most recently updated issue or pull request.
//! When that item has a comment thread, the newest comment supplies the author
//! and preview instead of the original post.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;

use linkwatch_common::types::{ResourceKind, ResourceRef};

use crate::{Activity, ActivitySource, CheckError};

pub const DEFAULT_API_URL: &str = "https://api.github.com";

/// GitHub caps `per_page` at 100.
const COMMENTS_PER_PAGE: u64 = 100;

#[derive(Debug, Deserialize)]
struct Issue {
    number: u64,
    title: Option<String>,
    body: Option<String>,
    updated_at: Option<DateTime<Utc>>,
    user: Option<User>,
    #[serde(default)]
    comments: u64,
}

#[derive(Debug, Deserialize)]
struct Comment {
    body: Option<String>,
    user: Option<User>,
}

#[derive(Debug, Deserialize)]
struct User {
    login: Option<String>,
}

/// Build activity from the latest issue, preferring its newest comment for the preview.
fn issue_activity(issue: Issue, latest_comment: Option<Comment>) -> Option<Activity> {
    let updated_at = issue.updated_at?;
    let mut author = issue.user.and_then(|u| u.login);
    let mut body = issue.body;

    if let Some(comment) = latest_comment {
        if let Some(comment_body) = comment.body {
            body = Some(comment_body);
        }
        if let Some(login) = comment.user.and_then(|u| u.login) {
            author = Some(login);
        }
    }

    Some(Activity {
        updated_at,
        title: issue.title,
        author,
        body,
    })
}

/// Page holding the newest comment when comments are listed oldest-first.
fn last_comment_page(comment_count: u64) -> u64 {
    comment_count.div_ceil(COMMENTS_PER_PAGE).max(1)
}

/// Client for the issues and issue-comments endpoints.
pub struct GitHubClient {
    client: Client,
    api_url: String,
    token: Option<String>,
}

impl GitHubClient {
    pub fn new(client: Client, token: Option<String>) -> Self {
        Self {
            client,
            api_url: DEFAULT_API_URL.to_string(),
            token,
        }
    }

    /// Point the client at a different API root (used by tests and GitHub Enterprise).
    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    fn request(&self, url: &str) -> RequestBuilder {
        let mut request = self
            .client
            .get(url)
            .header(ACCEPT, "application/vnd.github+json");
        if let Some(token) = &self.token {
            request = request.header(AUTHORIZATION, format!("token {}", token));
        }
        request
    }

    fn issues_url(&self, owner: &str, repo: &str) -> String {
        format!(
            "{}/repos/{}/{}/issues",
            self.api_url.trim_end_matches('/'),
            owner,
            repo
        )
    }

    async fn get_latest_issue(&self, owner: &str, repo: &str) -> Result<Option<Issue>, CheckError> {
        let url = self.issues_url(owner, repo);
        let response = self
            .request(&url)
            .query(&[
                ("state", "all"),
                ("sort", "updated"),
                ("direction", "desc"),
                ("per_page", "1"),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(CheckError::Status {
                status: status.as_u16(),
                url,
            });
        }

        let issues: Vec<Issue> = response.json().await?;
        Ok(issues.into_iter().next())
    }

    async fn get_latest_comment(
        &self,
        owner: &str,
        repo: &str,
        issue: &Issue,
    ) -> Result<Option<Comment>, CheckError> {
        let url = format!("{}/{}/comments", self.issues_url(owner, repo), issue.number);
        let page = last_comment_page(issue.comments).to_string();
        let per_page = COMMENTS_PER_PAGE.to_string();

        let response = self
            .request(&url)
            .query(&[("per_page", per_page.as_str()), ("page", page.as_str())])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(CheckError::Status {
                status: status.as_u16(),
                url,
            });
        }

        let comments: Vec<Comment> = response.json().await?;
        Ok(comments.into_iter().last())
    }
}

#[async_trait]
impl ActivitySource for GitHubClient {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Repository
    }

    async fn fetch_latest_activity(
        &self,
        resource: &ResourceRef,
    ) -> Result<Option<Activity>, CheckError> {
        let ResourceRef::Repository { owner, name } = resource else {
            return Err(CheckError::KindMismatch {
                url: resource.to_string(),
                registered: ResourceKind::Repository,
                actual: resource.kind(),
            });
        };

        let Some(issue) = self.get_latest_issue(owner, name).await? else {
            tracing::warn!(repo = %resource, "No issues or pull requests found");
            return Ok(None);
        };

        let latest_comment = if issue.comments > 0 {
            match self.get_latest_comment(owner, name, &issue).await {
                Ok(comment) => comment,
                Err(e) => {
                    tracing::warn!(
                        repo = %resource,
                        issue = issue.number,
                        error = %e,
                        "Failed to fetch comments, using the original post"
                    );
                    None
                }
            }
        } else {
            None
        };

        let activity = issue_activity(issue, latest_comment);
        if activity.is_none() {
            tracing::warn!(repo = %resource, "Latest issue has no updated_at");
        }
        Ok(activity)
    }

    fn name(&self) -> &'static str {
        "GitHub"
    }
}
