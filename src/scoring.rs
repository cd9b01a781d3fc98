use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::error::{retry_once, PipelineError};
use crate::models::{
    ActivityEvent, EngagementScore, EventType, ItemError, ScoreBreakdown, ScoringRun,
    SignalContribution,
};
use crate::store::ActivityStore;

pub const MAX_SCORE: f64 = 100.0;

/// Count at which a signal stops adding to the score, and its weight at saturation.
#[derive(Debug, Clone, Copy)]
pub struct SignalWeight {
    pub saturation: f64,
    pub weight: f64,
}

pub const LOGINS: SignalWeight = SignalWeight {
    saturation: 20.0,
    weight: 45.0,
};
pub const CONTENT: SignalWeight = SignalWeight {
    saturation: 25.0,
    weight: 35.0,
};
pub const PURCHASES: SignalWeight = SignalWeight {
    saturation: 5.0,
    weight: 45.0,
};
pub const CHAT_MESSAGES: SignalWeight = SignalWeight {
    saturation: 50.0,
    weight: 25.0,
};

pub fn cutoff(now: DateTime<Utc>, lookback_days: i64) -> DateTime<Utc> {
    now - Duration::days(lookback_days.max(1))
}

fn contribution(count: u32, signal: SignalWeight) -> SignalContribution {
    let normalized = (count as f64 / signal.saturation).min(1.0);
    SignalContribution {
        count,
        contribution: round2(normalized * signal.weight),
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Scores one user's events inside `[now - lookback_days, now]`.
///
/// Pure: the same event set and `now` always give the same score, whatever
/// order the events arrive in.
pub fn score_events(
    user_id: &str,
    events: &[ActivityEvent],
    now: DateTime<Utc>,
    lookback_days: i64,
) -> Result<EngagementScore, PipelineError> {
    let since = cutoff(now, lookback_days);
    let (mut logins, mut content, mut purchases, mut chats) = (0u32, 0u32, 0u32, 0u32);
    let mut amounts = Vec::new();
    let mut considered = 0usize;

    for event in events {
        if event.user_id != user_id {
            return Err(PipelineError::input(
                user_id,
                format!("event {} belongs to user {}", event.id, event.user_id),
            ));
        }
        if event.occurred_at < since || event.occurred_at > now {
            continue;
        }

        considered += 1;
        match event.event_type {
            EventType::Login => logins += 1,
            EventType::ContentGeneration | EventType::FeedPost => content += 1,
            EventType::ChatMessage => chats += 1,
            EventType::Purchase => {
                let amount = event.amount.unwrap_or(0.0);
                if !amount.is_finite() || amount < 0.0 {
                    return Err(PipelineError::input(
                        user_id,
                        format!("purchase {} has invalid amount {amount}", event.id),
                    ));
                }
                purchases += 1;
                amounts.push(amount);
            }
        }
    }

    amounts.sort_by(|a, b| a.total_cmp(b));
    let breakdown = ScoreBreakdown {
        logins: contribution(logins, LOGINS),
        content: contribution(content, CONTENT),
        purchases: contribution(purchases, PURCHASES),
        chat_messages: contribution(chats, CHAT_MESSAGES),
        total_spent: round2(amounts.iter().sum()),
        events_considered: considered,
    };

    let raw = breakdown.logins.contribution
        + breakdown.content.contribution
        + breakdown.purchases.contribution
        + breakdown.chat_messages.contribution;

    Ok(EngagementScore {
        user_id: user_id.to_string(),
        value: round2(raw.clamp(0.0, MAX_SCORE)),
        computed_at: now,
        breakdown,
    })
}

/// Scores every user (or just `only_user`) and upserts the results.
///
/// A failure for one user is recorded in the returned run and the batch
/// carries on; only an unreachable user listing aborts.
pub async fn run_scoring(
    store: &dyn ActivityStore,
    config: &PipelineConfig,
    only_user: Option<&str>,
    now: DateTime<Utc>,
) -> Result<ScoringRun, PipelineError> {
    let mut users = retry_once("list_users", config.retry_backoff, || store.list_users()).await?;

    if let Some(user_id) = only_user {
        users.retain(|user| user.id == user_id);
        if users.is_empty() {
            return Err(PipelineError::UnknownUser(user_id.to_string()));
        }
    }
    users.sort_by(|a, b| a.id.cmp(&b.id));

    let since = cutoff(now, config.lookback_days);
    let mut run = ScoringRun::default();

    for user in &users {
        let outcome = async {
            let events = retry_once("read_events", config.retry_backoff, || {
                store.read_events(&user.id, since)
            })
            .await?;
            let score = score_events(&user.id, &events, now, config.lookback_days)?;
            retry_once("upsert_score", config.retry_backoff, || store.upsert_score(&score)).await?;
            Ok::<_, PipelineError>(score)
        }
        .await;

        match outcome {
            Ok(score) => {
                debug!(user_id = %user.id, score = score.value, "scored user");
                run.scored += 1;
                run.scores.push(score);
            }
            Err(err) => {
                warn!(user_id = %user.id, error = %err, "skipping user during scoring");
                run.failed += 1;
                run.errors.push(ItemError {
                    user_id: user.id.clone(),
                    message: err.to_string(),
                });
            }
        }
    }

    info!(scored = run.scored, failed = run.failed, "scoring run complete");
    Ok(run)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EventType::*;
    use crate::store::fixtures::{event, now, spread, user};
    use crate::store::memory::MemoryStore;

    fn config() -> PipelineConfig {
        PipelineConfig {
            retry_backoff: std::time::Duration::from_millis(1),
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn no_events_scores_zero() {
        let score = score_events("a", &[], now(), 30).unwrap();
        assert_eq!(score.value, 0.0);
        assert_eq!(score.breakdown.events_considered, 0);
    }

    #[test]
    fn logins_and_purchases_score_near_top() {
        let mut events = spread("b", Login, 50, 30);
        events.extend(spread("b", Purchase, 10, 30));
        let score = score_events("b", &events, now(), 30).unwrap();
        assert!(score.value >= 85.0, "got {}", score.value);
        assert!(score.value <= MAX_SCORE);
        assert_eq!(score.breakdown.logins.count, 50);
        assert_eq!(score.breakdown.purchases.count, 10);
        assert_eq!(score.breakdown.total_spent, 290.0);
    }

    #[test]
    fn heavy_activity_is_clamped() {
        let mut events = spread("c", Login, 200, 30);
        events.extend(spread("c", ContentGeneration, 200, 30));
        events.extend(spread("c", Purchase, 200, 30));
        events.extend(spread("c", ChatMessage, 200, 30));
        let score = score_events("c", &events, now(), 30).unwrap();
        assert_eq!(score.value, MAX_SCORE);
    }

    #[test]
    fn order_does_not_change_score() {
        let mut events = spread("d", Login, 7, 20);
        events.extend(spread("d", FeedPost, 4, 10));
        events.extend(spread("d", Purchase, 3, 25));
        let forward = score_events("d", &events, now(), 30).unwrap();
        events.reverse();
        let backward = score_events("d", &events, now(), 30).unwrap();
        assert_eq!(forward, backward);
    }

    #[test]
    fn ignores_events_outside_window() {
        let events = vec![event("e", Login, 2), event("e", Login, 90)];
        let score = score_events("e", &events, now(), 30).unwrap();
        assert_eq!(score.breakdown.logins.count, 1);
        assert_eq!(score.breakdown.events_considered, 1);
    }

    #[test]
    fn negative_purchase_is_input_error() {
        let mut bad = event("f", Purchase, 1);
        bad.amount = Some(-5.0);
        let err = score_events("f", &[bad], now(), 30).unwrap_err();
        assert!(matches!(err, PipelineError::Input { .. }));
    }

    #[test]
    fn cutoff_respects_lookback() {
        assert_eq!(cutoff(now(), 14), now() - Duration::days(14));
        assert_eq!(cutoff(now(), 0), now() - Duration::days(1));
    }

    #[tokio::test]
    async fn batch_continues_past_broken_user() {
        let users = vec![user("a", "free", 40), user("b", "pro", 90), user("c", "free", 10)];
        let mut events = spread("b", Login, 50, 30);
        events.extend(spread("c", ChatMessage, 10, 5));
        let store = MemoryStore::new(users, events).with_broken_user("a");

        let run = run_scoring(&store, &config(), None, now()).await.unwrap();
        assert_eq!(run.scored, 2);
        assert_eq!(run.failed, 1);
        assert_eq!(run.errors[0].user_id, "a");
        assert!(store.stored_score("a").is_none());
        assert!(store.stored_score("b").is_some());
        let ids: Vec<&str> = run.scores.iter().map(|s| s.user_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn rescoring_without_new_events_is_idempotent() {
        let users = vec![user("a", "free", 40), user("b", "pro", 90)];
        let mut events = spread("b", Login, 50, 30);
        events.extend(spread("b", Purchase, 10, 30));
        let store = MemoryStore::new(users, events);

        let first = run_scoring(&store, &config(), None, now()).await.unwrap();
        let stored_first = store.stored_score("b").unwrap();
        let second = run_scoring(&store, &config(), None, now()).await.unwrap();

        assert_eq!(first.scores, second.scores);
        assert_eq!(stored_first, store.stored_score("b").unwrap());
        assert_eq!(store.stored_score("a").unwrap().value, 0.0);
    }

    #[tokio::test]
    async fn single_user_mode() {
        let store = MemoryStore::new(vec![user("a", "free", 1), user("b", "free", 1)], vec![]);
        let run = run_scoring(&store, &config(), Some("b"), now()).await.unwrap();
        assert_eq!(run.scored, 1);
        assert_eq!(run.scores[0].user_id, "b");

        let err = run_scoring(&store, &config(), Some("zed"), now()).await.unwrap_err();
        assert!(matches!(err, PipelineError::UnknownUser(_)));
    }

    #[tokio::test]
    async fn unreachable_store_fails_whole_run() {
        let store = MemoryStore::offline();
        let err = run_scoring(&store, &config(), None, now()).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(store.list_calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }
}
