//! Retrigger by toggling the issue's assignment.

use std::time::Duration;

use async_trait::async_trait;

use crate::collab::{TriggerAction, TriggerResponse};
use crate::config::GitHubConfig;
use crate::error::Result;
use crate::github::{BotSignal, GitHubClient, latest_bot_signal};
use crate::store::ItemKey;

pub struct GitHubTrigger {
    client: GitHubClient,
    username: String,
    bot_login: String,
    settle_delay: Duration,
    reassign_pause: Duration,
}

impl GitHubTrigger {
    pub fn new(client: GitHubClient, username: String, config: &GitHubConfig) -> Self {
        Self {
            client,
            username,
            bot_login: config.bot_login.clone(),
            settle_delay: Duration::from_millis(config.settle_delay_ms),
            reassign_pause: Duration::from_millis(config.reassign_pause_ms),
        }
    }

    /// Unassign and reassign when already assigned, otherwise just assign.
    async fn toggle_assignment(&self, key: &ItemKey) -> Result<()> {
        let issue = self.client.issue(&key.namespace, key.identifier).await?;

        if issue.is_assigned_to(&self.username) {
            log::debug!("Reassigning {} to {}", key, self.username);
            self.client
                .remove_assignee(&key.namespace, key.identifier, &self.username)
                .await?;
            tokio::time::sleep(self.reassign_pause).await;
        } else {
            log::debug!("Assigning {} to {}", key, self.username);
        }

        self.client
            .add_assignee(&key.namespace, key.identifier, &self.username)
            .await
    }

    async fn toggle_and_read(&self, key: &ItemKey) -> Result<BotSignal> {
        self.toggle_assignment(key).await?;
        tokio::time::sleep(self.settle_delay).await;

        let comments = self.client.issue_comments(&key.namespace, key.identifier).await?;
        Ok(latest_bot_signal(&comments, &self.bot_login))
    }
}

/// Map the bot's latest comment after a retrigger onto a trigger response.
pub(crate) fn response_for(signal: BotSignal, bot_login: &str) -> TriggerResponse {
    match signal {
        BotSignal::Throttled { seconds, .. } => TriggerResponse::StillThrottled {
            throttle_secs: seconds,
        },
        BotSignal::Answered => TriggerResponse::Accepted,
        BotSignal::Silent => TriggerResponse::Unrecognized {
            detail: format!("no comment from {} after retrigger", bot_login),
        },
    }
}

#[async_trait]
impl TriggerAction for GitHubTrigger {
    async fn trigger(&self, key: &ItemKey) -> TriggerResponse {
        match self.toggle_and_read(key).await {
            Ok(signal) => response_for(signal, &self.bot_login),
            Err(e) => TriggerResponse::TransientError {
                detail: format!("GitHub API error on {}: {}", key, e),
            },
        }
    }
}
