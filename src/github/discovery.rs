//! Discovery of rate-limited issues across the user's repositories.

use async_trait::async_trait;

use crate::collab::{Discovery, DiscoveryBatch, IssueDiscoverySource};
use crate::error::Result;
use crate::github::{BotSignal, GitHubClient, latest_bot_signal};
use crate::store::ItemKey;

pub struct GitHubDiscovery {
    client: GitHubClient,
    bot_login: String,
}

impl GitHubDiscovery {
    pub fn new(client: GitHubClient, bot_login: String) -> Self {
        Self { client, bot_login }
    }

    /// Fails only when the issue list is unreadable; a single issue's failure is recorded and skipped.
    async fn scan_repo(&self, repo: &str, batch: &mut DiscoveryBatch) -> Result<()> {
        for issue in self.client.open_issues(repo).await? {
            let key = ItemKey::new(repo, issue.number);
            match self.client.issue_comments(repo, issue.number).await {
                Ok(comments) => record_signal(batch, key, latest_bot_signal(&comments, &self.bot_login)),
                Err(e) => {
                    log::warn!("Error checking comments on {}: {}", key, e);
                    batch.failures.push(format!("Error checking comments on {}: {}", key, e));
                }
            }
        }
        Ok(())
    }
}

fn record_signal(batch: &mut DiscoveryBatch, key: ItemKey, signal: BotSignal) {
    match signal {
        BotSignal::Throttled { seconds, at } => batch.found.push(Discovery {
            key,
            throttle_secs: seconds,
            observed_at: at,
        }),
        BotSignal::Answered => batch.resolved.push(key),
        BotSignal::Silent => {}
    }
}

#[async_trait]
impl IssueDiscoverySource for GitHubDiscovery {
    /// Listing repositories must succeed; a failing repository is reported and skipped.
    async fn discover(&self) -> Result<DiscoveryBatch> {
        let repos = self.client.owned_repos().await?;
        log::info!("Scanning {} repositories", repos.len());

        let mut batch = DiscoveryBatch::default();
        for repo in &repos {
            if let Err(e) = self.scan_repo(&repo.full_name, &mut batch).await {
                log::warn!("Error scanning repo {}: {}", repo.full_name, e);
                batch
                    .failures
                    .push(format!("Error scanning repo {}: {}", repo.full_name, e));
            }
        }

        log::info!(
            "Scan found {} throttled and {} answered issues ({} repo failures)",
            batch.found.len(),
            batch.resolved.len(),
            batch.failures.len()
        );
        Ok(batch)
    }
}
