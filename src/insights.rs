use chrono::{DateTime, Utc};

use crate::config::PipelineConfig;
use crate::dropoff::detect_dropoff;
use crate::error::{retry_once, PipelineError};
use crate::models::{DropoffSignal, EngagementScore, Recommendation, RiskLevel, Severity, TopUser};
use crate::ranking::top_engaged;
use crate::store::ActivityStore;

pub const HIGH_RISK_SHARE: f64 = 0.20;
pub const AT_RISK_SHARE: f64 = 0.40;
pub const LOW_MEAN_SCORE: f64 = 30.0;

#[derive(Debug, Clone, Copy)]
pub struct InsightInput<'a> {
    pub scores: &'a [EngagementScore],
    pub scoring_errors: usize,
    pub dropoff: &'a [DropoffSignal],
    pub top: &'a [TopUser],
}

fn percent(share: f64) -> String {
    format!("{:.0}%", share * 100.0)
}

pub fn summarize(input: InsightInput<'_>) -> Vec<Recommendation> {
    let mut recs = Vec::new();

    let assessed = input.dropoff.len();
    if assessed > 0 {
        let high = input.dropoff.iter().filter(|s| s.risk == RiskLevel::High).count();
        let medium = input.dropoff.iter().filter(|s| s.risk == RiskLevel::Medium).count();
        let high_share = high as f64 / assessed as f64;
        let at_risk_share = (high + medium) as f64 / assessed as f64;

        if high_share > HIGH_RISK_SHARE {
            recs.push(Recommendation {
                severity: Severity::Critical,
                message: format!(
                    "{} of {} users ({}) are at high dropoff risk",
                    high,
                    assessed,
                    percent(high_share)
                ),
                action: "launch a re-engagement campaign for high-risk users".into(),
            });
        }

        if at_risk_share > AT_RISK_SHARE {
            recs.push(Recommendation {
                severity: Severity::Warning,
                message: format!(
                    "{} of users show medium or high dropoff risk",
                    percent(at_risk_share)
                ),
                action: "start a nurture email sequence for medium-risk users".into(),
            });
        }
    }

    if !input.scores.is_empty() {
        let mean = input.scores.iter().map(|s| s.value).sum::<f64>() / input.scores.len() as f64;
        if mean < LOW_MEAN_SCORE {
            recs.push(Recommendation {
                severity: Severity::Warning,
                message: format!("average engagement score is {mean:.1}"),
                action: "review onboarding and first-week content generation prompts".into(),
            });
        }
    }

    if input.scoring_errors > 0 {
        recs.push(Recommendation {
            severity: Severity::Warning,
            message: format!("{} users could not be scored", input.scoring_errors),
            action: "inspect malformed activity records for the listed users".into(),
        });
    }

    let free_top = input.top.iter().filter(|t| t.plan.eq_ignore_ascii_case("free")).count();
    if free_top > 0 {
        recs.push(Recommendation {
            severity: Severity::Info,
            message: format!("{free_top} of the most engaged users are on the free plan"),
            action: "run the upsell sweep and reach out with a plan upgrade".into(),
        });
    }

    if input.scores.is_empty() {
        recs.push(Recommendation {
            severity: Severity::Info,
            message: "no engagement scores have been computed yet".into(),
            action: "run engagement scoring before reviewing recommendations".into(),
        });
    }

    if recs.is_empty() {
        recs.push(Recommendation {
            severity: Severity::Info,
            message: "engagement is healthy across the user base".into(),
            action: "no action needed".into(),
        });
    }

    recs.sort_by(|a, b| b.severity.cmp(&a.severity));
    recs
}

/// Recommendations over the persisted scores, without rescoring.
pub async fn recommend(
    store: &dyn ActivityStore,
    config: &PipelineConfig,
    now: DateTime<Utc>,
) -> Result<Vec<Recommendation>, PipelineError> {
    let scores = retry_once("list_scores", config.retry_backoff, || store.list_scores()).await?;
    let scan = detect_dropoff(store, config, now).await?;
    let top = top_engaged(store, config, config.top_k).await?;

    Ok(summarize(InsightInput {
        scores: &scores,
        scoring_errors: 0,
        dropoff: &scan.signals,
        top: &top,
    }))
}
