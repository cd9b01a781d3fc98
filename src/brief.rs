use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::dropoff::detect_dropoff;
use crate::error::{retry_once, with_timeout, PipelineError};
use crate::insights::{summarize, InsightInput};
use crate::models::{
    BriefSection, DropoffScan, ExecutiveBrief, NarrativeSource, ScoringRun, ScoringSummary, Stage,
    StageError,
};
use crate::narrative::{fallback_narrative, NarrativeInput, NarrativeService};
use crate::ranking::top_engaged;
use crate::scoring::run_scoring;
use crate::store::ActivityStore;

/// Runs scoring, dropoff detection, top-user selection and insights, then
/// asks `narrator` for prose.
///
/// Stage failures land in `errors` and later stages work with what is
/// left. Only an unreachable user listing fails the whole brief.
pub async fn generate_brief(
    store: &dyn ActivityStore,
    narrator: Option<&dyn NarrativeService>,
    config: &PipelineConfig,
    now: DateTime<Utc>,
) -> Result<ExecutiveBrief, PipelineError> {
    let users = retry_once("list_users", config.retry_backoff, || store.list_users()).await?;
    let mut errors = Vec::new();

    let run = match run_scoring(store, config, None, now).await {
        Ok(run) => run,
        Err(err) => {
            errors.push(stage_error(Stage::Scoring, &err));
            ScoringRun::default()
        }
    };
    if run.failed > 0 {
        errors.push(StageError {
            stage: Stage::Scoring,
            message: format!("{} users could not be scored", run.failed),
        });
    }

    let scan = match detect_dropoff(store, config, now).await {
        Ok(scan) => scan,
        Err(err) => {
            errors.push(stage_error(Stage::Dropoff, &err));
            DropoffScan::default()
        }
    };
    if !scan.errors.is_empty() {
        errors.push(StageError {
            stage: Stage::Dropoff,
            message: format!("{} users skipped in dropoff scan", scan.errors.len()),
        });
    }

    let top = match top_engaged(store, config, config.top_k).await {
        Ok(top) => top,
        Err(err) => {
            errors.push(stage_error(Stage::TopEngaged, &err));
            Vec::new()
        }
    };

    let recommendations = summarize(InsightInput {
        scores: &run.scores,
        scoring_errors: run.failed,
        dropoff: &scan.signals,
        top: &top,
    });

    let narrative_input = NarrativeInput::new(
        config.lookback_days,
        users.len(),
        run.scored,
        run.failed,
        &top,
        &scan.signals,
        &recommendations,
    );

    let (narrative, narrative_source) = match narrator {
        Some(service) => {
            let generated = retry_once("generate_narrative", config.retry_backoff, || {
                with_timeout(
                    "narrative service",
                    config.narrative_timeout,
                    service.generate_narrative(&narrative_input),
                )
            })
            .await;
            match generated {
                Ok(text) => (text, NarrativeSource::Generated),
                Err(err) => {
                    warn!(service = service.name(), error = %err, "using fallback narrative");
                    errors.push(stage_error(Stage::Narrative, &err));
                    (fallback_narrative(&narrative_input), NarrativeSource::Fallback)
                }
            }
        }
        None => (fallback_narrative(&narrative_input), NarrativeSource::Fallback),
    };

    info!(
        users = users.len(),
        stage_errors = errors.len(),
        narrative = ?narrative_source,
        "executive brief generated"
    );

    Ok(ExecutiveBrief {
        generated_at: now,
        lookback_days: config.lookback_days,
        total_users: users.len(),
        scoring: ScoringSummary {
            scored: run.scored,
            failed: run.failed,
        },
        sections: vec![
            BriefSection::TopUsers { users: top },
            BriefSection::DropoffSignals {
                signals: scan.signals,
            },
            BriefSection::Recommendations {
                items: recommendations,
            },
        ],
        narrative,
        narrative_source,
        errors,
    })
}

fn stage_error(stage: Stage, err: &PipelineError) -> StageError {
    StageError {
        stage,
        message: err.to_string(),
    }
}
