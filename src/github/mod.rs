//! GitHub backend for discovery and retriggering.
//!
//! The downstream analyzer is a bot that comments on issues. When it is out of
//! capacity it posts `Rate limit exceeded. Please try after N seconds.`; toggling
//! the issue's assignment makes it try again.

mod client;
mod discovery;
mod trigger;

use chrono::{DateTime, Utc};

pub use client::{Comment, GitHubClient, Issue, Repository, User};
pub use discovery::GitHubDiscovery;
pub use trigger::GitHubTrigger;

const THROTTLE_PREFIX: [&str; 6] = ["Rate", "limit", "exceeded.", "Please", "try", "after"];

/// Extract the wait from a rate-limit notice. Any run of whitespace may separate the words.
pub fn parse_throttle_seconds(text: &str) -> Option<u64> {
    let words: Vec<&str> = text.split_whitespace().collect();
    let needed = THROTTLE_PREFIX.len() + 2;

    words.windows(needed).find_map(|w| {
        if w[..THROTTLE_PREFIX.len()] != THROTTLE_PREFIX || !w[needed - 1].starts_with("seconds.") {
            return None;
        }
        let digits = w[THROTTLE_PREFIX.len()];
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()
    })
}

/// What the bot's most recent comment says about an issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BotSignal {
    Throttled { seconds: u64, at: DateTime<Utc> },
    /// The bot posted something other than a rate-limit notice
    Answered,
    Silent,
}

/// Classify the latest comment by `bot_login`. Comments are expected oldest first.
pub fn latest_bot_signal(comments: &[Comment], bot_login: &str) -> BotSignal {
    match comments.iter().rev().find(|c| c.is_from(bot_login)) {
        None => BotSignal::Silent,
        Some(comment) => match parse_throttle_seconds(comment.text()) {
            Some(seconds) => BotSignal::Throttled {
                seconds,
                at: comment.created_at,
            },
            None => BotSignal::Answered,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const BOT: &str = "traycerai[bot]";

    fn comment(login: &str, body: &str, secs: i64) -> Comment {
        Comment {
            body: Some(body.to_string()),
            user: Some(User {
                login: login.to_string(),
            }),
            created_at: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
        }
    }

    #[test]
    fn test_parse_plain_message() {
        assert_eq!(
            parse_throttle_seconds("Rate limit exceeded. Please try after 1234 seconds."),
            Some(1234)
        );
    }

    #[test]
    fn test_parse_blockquote_and_extra_whitespace() {
        let body = "> [!WARNING]\n> Rate limit exceeded.  Please try after\t600 seconds.\n\nThanks";
        assert_eq!(parse_throttle_seconds(body), Some(600));

        let wrapped = "Rate limit exceeded.\nPlease try after 42 seconds.";
        assert_eq!(parse_throttle_seconds(wrapped), Some(42));
    }

    #[test]
    fn test_parse_rejects_other_text() {
        assert_eq!(parse_throttle_seconds("Analysis complete."), None);
        assert_eq!(parse_throttle_seconds("Rate limit exceeded. Please try after soon seconds."), None);
        assert_eq!(parse_throttle_seconds("Rate limit exceeded. Please try after -5 seconds."), None);
        assert_eq!(parse_throttle_seconds("Rate limit exceeded. Please try after 5 minutes."), None);
        assert_eq!(parse_throttle_seconds(""), None);
    }

    #[test]
    fn test_latest_bot_signal_uses_newest_bot_comment() {
        let comments = vec![
            comment(BOT, "Rate limit exceeded. Please try after 600 seconds.", 0),
            comment("octocat", "any news?", 10),
            comment(BOT, "Here is the plan for this issue", 20),
            comment("octocat", "Rate limit exceeded. Please try after 1 seconds.", 30),
        ];
        assert_eq!(latest_bot_signal(&comments, BOT), BotSignal::Answered);

        let comments = vec![
            comment(BOT, "Here is the plan", 0),
            comment(BOT, "Rate limit exceeded. Please try after 900 seconds.", 50),
        ];
        assert_eq!(
            latest_bot_signal(&comments, BOT),
            BotSignal::Throttled {
                seconds: 900,
                at: Utc.timestamp_opt(1_700_000_050, 0).unwrap()
            }
        );
    }

    #[test]
    fn test_latest_bot_signal_silent() {
        let comments = vec![comment("octocat", "hello", 0)];
        assert_eq!(latest_bot_signal(&comments, BOT), BotSignal::Silent);
        assert_eq!(latest_bot_signal(&[], BOT), BotSignal::Silent);
    }
}
