use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    pub plan: String,
    pub signup_at: DateTime<Utc>,
    pub last_active_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Login,
    ContentGeneration,
    Purchase,
    ChatMessage,
    FeedPost,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Login => "login",
            EventType::ContentGeneration => "content_generation",
            EventType::Purchase => "purchase",
            EventType::ChatMessage => "chat_message",
            EventType::FeedPost => "feed_post",
        }
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "login" => Ok(EventType::Login),
            "content_generation" | "generation" => Ok(EventType::ContentGeneration),
            "purchase" => Ok(EventType::Purchase),
            "chat_message" => Ok(EventType::ChatMessage),
            "feed_post" => Ok(EventType::FeedPost),
            other => Err(format!("unknown event type '{other}'")),
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single recorded user action. Append-only; never mutated once stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub id: Uuid,
    pub user_id: String,
    pub event_type: EventType,
    pub occurred_at: DateTime<Utc>,
    pub amount: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalContribution {
    pub count: u32,
    pub contribution: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub logins: SignalContribution,
    pub content: SignalContribution,
    pub purchases: SignalContribution,
    pub chat_messages: SignalContribution,
    pub total_spent: f64,
    pub events_considered: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngagementScore {
    pub user_id: String,
    pub value: f64,
    pub computed_at: DateTime<Utc>,
    pub breakdown: ScoreBreakdown,
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemError {
    pub user_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ScoringRun {
    pub scored: usize,
    pub failed: usize,
    pub errors: Vec<ItemError>,
    pub scores: Vec<EngagementScore>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TrendBasis {
    NeverActive,
    Inactive { days: i64 },
    DecliningFrequency { recent: usize, prior: usize },
    Steady { recent: usize, prior: usize },
}

impl fmt::Display for TrendBasis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrendBasis::NeverActive => write!(f, "no recorded activity"),
            TrendBasis::Inactive { days } => write!(f, "no activity in {days} days"),
            TrendBasis::DecliningFrequency { recent, prior } => {
                write!(f, "declining frequency ({recent} events vs {prior} prior)")
            }
            TrendBasis::Steady { recent, prior } => {
                write!(f, "steady ({recent} events vs {prior} prior)")
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DropoffSignal {
    pub user_id: String,
    pub email: String,
    pub risk: RiskLevel,
    pub basis: TrendBasis,
    pub last_active_at: Option<DateTime<Utc>>,
    pub recent_events: usize,
    pub prior_events: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DropoffScan {
    pub signals: Vec<DropoffSignal>,
    pub errors: Vec<ItemError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TopUser {
    pub rank: usize,
    pub user_id: String,
    pub email: String,
    pub plan: String,
    pub score: f64,
    pub signup_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct Recommendation {
    pub severity: Severity,
    pub message: String,
    pub action: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Scoring,
    Dropoff,
    TopEngaged,
    Narrative,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageError {
    pub stage: Stage,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NarrativeSource {
    Generated,
    Fallback,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "section", rename_all = "snake_case")]
pub enum BriefSection {
    TopUsers { users: Vec<TopUser> },
    DropoffSignals { signals: Vec<DropoffSignal> },
    Recommendations { items: Vec<Recommendation> },
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoringSummary {
    pub scored: usize,
    pub failed: usize,
}

/// Generated fresh per request; never mutated afterwards.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutiveBrief {
    pub generated_at: DateTime<Utc>,
    pub lookback_days: i64,
    pub total_users: usize,
    pub scoring: ScoringSummary,
    pub sections: Vec<BriefSection>,
    pub narrative: String,
    pub narrative_source: NarrativeSource,
    pub errors: Vec<StageError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpsellCandidate {
    pub user_id: String,
    pub email: String,
    pub plan: String,
    pub score: f64,
    pub suggested_plan: String,
}
