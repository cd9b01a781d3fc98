use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::PipelineError;
use crate::models::{ActivityEvent, EngagementScore, User};

/// Persistence boundary for users, their activity and computed scores.
#[async_trait]
pub trait ActivityStore: Send + Sync {
    async fn list_users(&self) -> Result<Vec<User>, PipelineError>;

    /// Events for one user that occurred at or after `since`.
    async fn read_events(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ActivityEvent>, PipelineError>;

    /// Most recent activity at or before `until`, however old.
    async fn latest_activity_at(
        &self,
        user_id: &str,
        until: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, PipelineError>;

    /// Insert or replace the score keyed by `score.user_id`.
    async fn upsert_score(&self, score: &EngagementScore) -> Result<(), PipelineError>;

    async fn list_scores(&self) -> Result<Vec<EngagementScore>, PipelineError>;
}

#[cfg(test)]
pub mod memory {
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;

    /// In-memory store used as a test fixture.
    #[derive(Default)]
    pub struct MemoryStore {
        users: Vec<User>,
        events: Vec<ActivityEvent>,
        scores: Mutex<HashMap<String, EngagementScore>>,
        broken_users: HashSet<String>,
        pub offline: bool,
        pub list_calls: AtomicUsize,
        pub upsert_calls: AtomicUsize,
    }

    impl MemoryStore {
        pub fn new(users: Vec<User>, events: Vec<ActivityEvent>) -> Self {
            Self {
                users,
                events,
                ..Default::default()
            }
        }

        /// Marks a user whose event rows cannot be read.
        pub fn with_broken_user(mut self, user_id: &str) -> Self {
            self.broken_users.insert(user_id.to_string());
            self
        }

        pub fn offline() -> Self {
            Self {
                offline: true,
                ..Default::default()
            }
        }

        pub fn with_scores(self, scores: Vec<EngagementScore>) -> Self {
            {
                let mut map = self.scores.lock().unwrap();
                for score in scores {
                    map.insert(score.user_id.clone(), score);
                }
            }
            self
        }

        pub fn stored_score(&self, user_id: &str) -> Option<EngagementScore> {
            self.scores.lock().unwrap().get(user_id).cloned()
        }
    }

    #[async_trait]
    impl ActivityStore for MemoryStore {
        async fn list_users(&self) -> Result<Vec<User>, PipelineError> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            if self.offline {
                return Err(PipelineError::unavailable("activity store", "connection refused"));
            }
            Ok(self.users.clone())
        }

        async fn read_events(
            &self,
            user_id: &str,
            since: DateTime<Utc>,
        ) -> Result<Vec<ActivityEvent>, PipelineError> {
            if self.broken_users.contains(user_id) {
                return Err(PipelineError::input(user_id, "unknown event type 'teleport'"));
            }
            Ok(self
                .events
                .iter()
                .filter(|event| event.user_id == user_id && event.occurred_at >= since)
                .cloned()
                .collect())
        }

        async fn latest_activity_at(
            &self,
            user_id: &str,
            until: DateTime<Utc>,
        ) -> Result<Option<DateTime<Utc>>, PipelineError> {
            let from_events = self
                .events
                .iter()
                .filter(|event| event.user_id == user_id && event.occurred_at <= until)
                .map(|event| event.occurred_at);
            let from_user = self
                .users
                .iter()
                .filter(|user| user.id == user_id)
                .filter_map(|user| user.last_active_at)
                .filter(|at| *at <= until);
            Ok(from_events.chain(from_user).max())
        }

        async fn upsert_score(&self, score: &EngagementScore) -> Result<(), PipelineError> {
            self.upsert_calls.fetch_add(1, Ordering::SeqCst);
            self.scores
                .lock()
                .unwrap()
                .insert(score.user_id.clone(), score.clone());
            Ok(())
        }

        async fn list_scores(&self) -> Result<Vec<EngagementScore>, PipelineError> {
            if self.offline {
                return Err(PipelineError::unavailable("activity store", "connection refused"));
            }
            let mut scores: Vec<EngagementScore> =
                self.scores.lock().unwrap().values().cloned().collect();
            scores.sort_by(|a, b| a.user_id.cmp(&b.user_id));
            Ok(scores)
        }
    }
}
