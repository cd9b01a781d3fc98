use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::json;
use tracing::debug;

use crate::config::NarrativeConfig;
use crate::error::PipelineError;
use crate::models::{DropoffSignal, Recommendation, RiskLevel, TopUser};

const SERVICE: &str = "narrative service";

/// Structured brief data handed to the text generator.
#[derive(Debug, Clone, Serialize)]
pub struct NarrativeInput {
    pub lookback_days: i64,
    pub total_users: usize,
    pub scored: usize,
    pub failed: usize,
    pub high_risk: usize,
    pub medium_risk: usize,
    pub low_risk: usize,
    pub top_users: Vec<TopUser>,
    pub at_risk: Vec<DropoffSignal>,
    pub recommendations: Vec<Recommendation>,
}

impl NarrativeInput {
    pub fn new(
        lookback_days: i64,
        total_users: usize,
        scored: usize,
        failed: usize,
        top: &[TopUser],
        dropoff: &[DropoffSignal],
        recommendations: &[Recommendation],
    ) -> Self {
        let count = |level: RiskLevel| dropoff.iter().filter(|s| s.risk == level).count();
        Self {
            lookback_days,
            total_users,
            scored,
            failed,
            high_risk: count(RiskLevel::High),
            medium_risk: count(RiskLevel::Medium),
            low_risk: count(RiskLevel::Low),
            top_users: top.iter().take(5).cloned().collect(),
            at_risk: dropoff
                .iter()
                .filter(|s| s.risk != RiskLevel::Low)
                .take(5)
                .cloned()
                .collect(),
            recommendations: recommendations.to_vec(),
        }
    }
}

/// Text-generation capability used for the brief's prose summary.
#[async_trait]
pub trait NarrativeService: Send + Sync {
    fn name(&self) -> &str;

    async fn generate_narrative(&self, input: &NarrativeInput) -> Result<String, PipelineError>;
}

/// OpenAI-compatible chat completions backend.
pub struct OpenAiNarrative {
    config: NarrativeConfig,
    client: Client,
}

impl OpenAiNarrative {
    pub fn new(config: NarrativeConfig) -> Self {
        Self {
            config,
            client: Client::new(),
        }
    }
}

#[async_trait]
impl NarrativeService for OpenAiNarrative {
    fn name(&self) -> &str {
        "openai"
    }

    async fn generate_narrative(&self, input: &NarrativeInput) -> Result<String, PipelineError> {
        let payload = serde_json::to_string_pretty(input)
            .map_err(|err| PipelineError::unavailable(SERVICE, err))?;

        let response = self
            .client
            .post(format!("{}/chat/completions", self.config.api_base.trim_end_matches('/')))
            .bearer_auth(&self.config.api_key)
            .json(&json!({
                "model": self.config.model,
                "max_tokens": 600,
                "temperature": 0.3,
                "messages": [
                    { "role": "system", "content": SYSTEM_PROMPT },
                    { "role": "user", "content": payload },
                ],
            }))
            .send()
            .await
            .map_err(|err| PipelineError::unavailable(SERVICE, err))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::unavailable(SERVICE, format!("HTTP {status}")));
        }

        let data = response
            .json::<serde_json::Value>()
            .await
            .map_err(|err| PipelineError::unavailable(SERVICE, err))?;

        let text = data["choices"][0]["message"]["content"]
            .as_str()
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .ok_or_else(|| PipelineError::unavailable(SERVICE, "response had no message content"))?;

        debug!(model = %self.config.model, chars = text.len(), "narrative generated");
        Ok(text.to_string())
    }
}

const SYSTEM_PROMPT: &str = "You are an analyst writing the opening of an executive brief \
about user engagement on a content platform. Using only the JSON provided, write three short \
paragraphs: overall engagement health, who is at risk of dropping off and why, and the most \
important next actions. Cite numbers. No headings, no bullet points, no markdown.";

/// Deterministic stand-in narrative used whenever generation fails or is disabled.
pub fn fallback_narrative(input: &NarrativeInput) -> String {
    let mut text = format!(
        "Over the last {} days, {} of {} users were scored",
        input.lookback_days, input.scored, input.total_users
    );
    if input.failed > 0 {
        text.push_str(&format!(" ({} could not be scored)", input.failed));
    }
    text.push_str(&format!(
        ". Dropoff risk: {} high, {} medium, {} low.",
        input.high_risk, input.medium_risk, input.low_risk
    ));

    if let Some(leader) = input.top_users.first() {
        text.push_str(&format!(
            " The most engaged user is {} with a score of {:.1}.",
            leader.email, leader.score
        ));
    }
    if let Some(first) = input.recommendations.first() {
        text.push_str(&format!(" Top recommendation: {}.", first.action));
    }
    text
}
