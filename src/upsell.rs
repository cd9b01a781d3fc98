use std::collections::HashMap;

use tracing::info;

use crate::config::PipelineConfig;
use crate::error::{retry_once, PipelineError};
use crate::models::{EngagementScore, UpsellCandidate, User};
use crate::store::ActivityStore;

/// Plan a user on `plan` would be offered next, if any.
pub fn next_plan(plan: &str) -> Option<&'static str> {
    match plan.to_ascii_lowercase().as_str() {
        "free" => Some("starter"),
        "starter" => Some("pro"),
        _ => None,
    }
}

/// Engaged users on an entry plan who have not bought anything in the window.
pub fn find_candidates(
    scores: &[EngagementScore],
    users: &[User],
    min_score: f64,
) -> Vec<UpsellCandidate> {
    let by_id: HashMap<&str, &User> = users.iter().map(|u| (u.id.as_str(), u)).collect();

    let mut matches: Vec<(&User, &EngagementScore, &'static str)> = scores
        .iter()
        .filter(|score| score.value >= min_score && score.breakdown.purchases.count == 0)
        .filter_map(|score| {
            let user = by_id.get(score.user_id.as_str())?;
            next_plan(&user.plan).map(|next| (*user, score, next))
        })
        .collect();

    matches.sort_by(|(a_user, a_score, _), (b_user, b_score, _)| {
        b_score
            .value
            .total_cmp(&a_score.value)
            .then(a_user.signup_at.cmp(&b_user.signup_at))
            .then(a_user.id.cmp(&b_user.id))
    });

    matches
        .into_iter()
        .map(|(user, score, next)| UpsellCandidate {
            user_id: user.id.clone(),
            email: user.email.clone(),
            plan: user.plan.clone(),
            score: score.value,
            suggested_plan: next.to_string(),
        })
        .collect()
}

pub async fn run_upsell_sweep(
    store: &dyn ActivityStore,
    config: &PipelineConfig,
) -> Result<Vec<UpsellCandidate>, PipelineError> {
    let scores = retry_once("list_scores", config.retry_backoff, || store.list_scores()).await?;
    let users = retry_once("list_users", config.retry_backoff, || store.list_users()).await?;
    let candidates = find_candidates(&scores, &users, config.upsell_min_score);
    info!(candidates = candidates.len(), "upsell sweep complete");
    Ok(candidates)
}
