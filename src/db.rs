use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::PipelineError;
use crate::models::{ActivityEvent, EngagementScore, EventType, ScoreBreakdown, User};
use crate::store::ActivityStore;

const STORE: &str = "activity store";

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Postgres-backed [`ActivityStore`].
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn unavailable(err: sqlx::Error) -> PipelineError {
    PipelineError::unavailable(STORE, err)
}

fn bad_user_row(err: sqlx::Error) -> PipelineError {
    PipelineError::malformed("engagement.users", err)
}

fn bad_score_row(err: sqlx::Error) -> PipelineError {
    PipelineError::malformed("engagement.engagement_scores", err)
}

#[async_trait]
impl ActivityStore for PgStore {
    async fn list_users(&self) -> Result<Vec<User>, PipelineError> {
        let rows = sqlx::query(
            "SELECT id, email, plan, signup_at, last_active_at FROM engagement.users ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;

        let mut users = Vec::with_capacity(rows.len());
        for row in rows {
            users.push(User {
                id: row.try_get("id").map_err(bad_user_row)?,
                email: row.try_get("email").map_err(bad_user_row)?,
                plan: row.try_get("plan").map_err(bad_user_row)?,
                signup_at: row.try_get("signup_at").map_err(bad_user_row)?,
                last_active_at: row.try_get("last_active_at").map_err(bad_user_row)?,
            });
        }
        Ok(users)
    }

    async fn read_events(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ActivityEvent>, PipelineError> {
        let rows = sqlx::query(
            r#"
            SELECT id, event_type, occurred_at, amount
            FROM engagement.activity_events
            WHERE user_id = $1 AND occurred_at >= $2
            ORDER BY occurred_at, id
            "#,
        )
        .bind(user_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let id: Uuid = row
                .try_get("id")
                .map_err(|err| PipelineError::input(user_id, err.to_string()))?;
            let raw_type: String = row
                .try_get("event_type")
                .map_err(|err| PipelineError::input(user_id, err.to_string()))?;
            let event_type = raw_type
                .parse::<EventType>()
                .map_err(|reason| PipelineError::input(user_id, format!("event {id}: {reason}")))?;

            events.push(ActivityEvent {
                id,
                user_id: user_id.to_string(),
                event_type,
                occurred_at: row
                    .try_get("occurred_at")
                    .map_err(|err| PipelineError::input(user_id, err.to_string()))?,
                amount: row
                    .try_get("amount")
                    .map_err(|err| PipelineError::input(user_id, err.to_string()))?,
            });
        }
        Ok(events)
    }

    async fn latest_activity_at(
        &self,
        user_id: &str,
        until: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, PipelineError> {
        let row = sqlx::query(
            r#"
            SELECT GREATEST(
                (SELECT MAX(occurred_at)
                 FROM engagement.activity_events
                 WHERE user_id = $1 AND occurred_at <= $2),
                (SELECT last_active_at
                 FROM engagement.users
                 WHERE id = $1 AND last_active_at <= $2)
            ) AS latest
            "#,
        )
        .bind(user_id)
        .bind(until)
        .fetch_one(&self.pool)
        .await
        .map_err(unavailable)?;

        row.try_get("latest")
            .map_err(|err| PipelineError::input(user_id, err.to_string()))
    }

    async fn upsert_score(&self, score: &EngagementScore) -> Result<(), PipelineError> {
        sqlx::query(
            r#"
            INSERT INTO engagement.engagement_scores (user_id, score, breakdown, computed_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (user_id) DO UPDATE
            SET score = EXCLUDED.score,
                breakdown = EXCLUDED.breakdown,
                computed_at = EXCLUDED.computed_at
            "#,
        )
        .bind(&score.user_id)
        .bind(score.value)
        .bind(Json(&score.breakdown))
        .bind(score.computed_at)
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;
        Ok(())
    }

    async fn list_scores(&self) -> Result<Vec<EngagementScore>, PipelineError> {
        let rows = sqlx::query(
            r#"
            SELECT user_id, score, breakdown, computed_at
            FROM engagement.engagement_scores
            ORDER BY user_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;

        let mut scores = Vec::with_capacity(rows.len());
        for row in rows {
            let breakdown: Json<ScoreBreakdown> =
                row.try_get("breakdown").map_err(bad_score_row)?;
            scores.push(EngagementScore {
                user_id: row.try_get("user_id").map_err(bad_score_row)?,
                value: row.try_get("score").map_err(bad_score_row)?,
                computed_at: row.try_get("computed_at").map_err(bad_score_row)?,
                breakdown: breakdown.0,
            });
        }
        Ok(scores)
    }
}

async fn upsert_user(
    pool: &PgPool,
    id: &str,
    email: &str,
    plan: &str,
    signup_at: DateTime<Utc>,
) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO engagement.users (id, email, plan, signup_at)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (id) DO UPDATE
        SET email = EXCLUDED.email, plan = EXCLUDED.plan
        "#,
    )
    .bind(id)
    .bind(email)
    .bind(plan)
    .bind(signup_at)
    .execute(pool)
    .await
    .with_context(|| format!("failed to upsert user {id}"))?;
    Ok(())
}

/// Inserts one event and bumps the user's `last_active_at`.
/// Returns false for a duplicate `source_key`.
async fn insert_event(
    pool: &PgPool,
    user_id: &str,
    event_type: EventType,
    occurred_at: DateTime<Utc>,
    amount: Option<f64>,
    source_key: &str,
) -> anyhow::Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO engagement.activity_events
        (id, user_id, event_type, occurred_at, amount, source_key)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (source_key) DO NOTHING
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(user_id)
    .bind(event_type.as_str())
    .bind(occurred_at)
    .bind(amount)
    .bind(source_key)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Ok(false);
    }

    sqlx::query(
        r#"
        UPDATE engagement.users
        SET last_active_at = GREATEST(COALESCE(last_active_at, $2), $2)
        WHERE id = $1
        "#,
    )
    .bind(user_id)
    .bind(occurred_at)
    .execute(pool)
    .await?;

    Ok(true)
}

/// Demo accounts with activity relative to now: steady, fading, dormant,
/// a free-plan power user, and a fresh signup.
pub async fn seed(pool: &PgPool) -> anyhow::Result<usize> {
    let now = Utc::now();
    let users = [
        ("usr_ava", "ava.chen@example.com", "pro", 220),
        ("usr_marco", "marco.ruiz@example.com", "starter", 140),
        ("usr_priya", "priya.nair@example.com", "free", 90),
        ("usr_jonah", "jonah.blake@example.com", "free", 60),
        ("usr_lena", "lena.ortiz@example.com", "free", 2),
    ];

    for (id, email, plan, signup_days_ago) in users {
        upsert_user(pool, id, email, plan, now - Duration::days(signup_days_ago)).await?;
    }

    // (user, event type, how many, first day ago, spacing in days, amount)
    let plan: [(&str, EventType, i64, i64, i64, Option<f64>); 12] = [
        ("usr_ava", EventType::Login, 28, 0, 1, None),
        ("usr_ava", EventType::ContentGeneration, 20, 0, 1, None),
        ("usr_ava", EventType::Purchase, 3, 2, 9, Some(49.0)),
        ("usr_ava", EventType::ChatMessage, 30, 0, 1, None),
        ("usr_marco", EventType::Login, 7, 8, 1, None),
        ("usr_marco", EventType::FeedPost, 5, 8, 1, None),
        ("usr_marco", EventType::Login, 1, 3, 1, None),
        ("usr_priya", EventType::Login, 1, 25, 1, None),
        ("usr_jonah", EventType::Login, 24, 0, 1, None),
        ("usr_jonah", EventType::ContentGeneration, 25, 0, 1, None),
        ("usr_jonah", EventType::ChatMessage, 40, 0, 0, None),
        ("usr_lena", EventType::Login, 2, 0, 1, None),
    ];

    let mut inserted = 0usize;
    for (user_id, event_type, count, first_day, spacing, amount) in plan {
        for i in 0..count {
            let days_ago = first_day + i * spacing;
            let occurred_at = now - Duration::days(days_ago) - Duration::minutes(10 + i);
            let source_key = format!("seed-{user_id}-{event_type}-{first_day}-{i}");
            if insert_event(pool, user_id, event_type, occurred_at, amount, &source_key).await? {
                inserted += 1;
            }
        }
    }

    Ok(inserted)
}

pub async fn import_csv(pool: &PgPool, csv_path: &std::path::Path) -> anyhow::Result<usize> {
    #[derive(serde::Deserialize)]
    struct CsvRow {
        user_id: String,
        email: String,
        plan: Option<String>,
        signup_at: DateTime<Utc>,
        event_type: String,
        occurred_at: DateTime<Utc>,
        amount: Option<f64>,
        source_key: Option<String>,
    }

    let mut reader = csv::Reader::from_path(csv_path)
        .with_context(|| format!("failed to open {}", csv_path.display()))?;
    let mut inserted = 0usize;

    for (line, result) in reader.deserialize::<CsvRow>().enumerate() {
        let row = result.with_context(|| format!("malformed CSV row {}", line + 2))?;
        let event_type = row
            .event_type
            .parse::<EventType>()
            .map_err(anyhow::Error::msg)
            .with_context(|| format!("CSV row {}", line + 2))?;

        upsert_user(
            pool,
            &row.user_id,
            &row.email,
            row.plan.as_deref().unwrap_or("free"),
            row.signup_at,
        )
        .await?;

        let source_key = row
            .source_key
            .unwrap_or_else(|| format!("import-{}", Uuid::new_v4()));

        if insert_event(
            pool,
            &row.user_id,
            event_type,
            row.occurred_at,
            row.amount,
            &source_key,
        )
        .await?
        {
            inserted += 1;
        }
    }

    Ok(inserted)
}
