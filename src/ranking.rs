use std::collections::HashMap;

use crate::config::PipelineConfig;
use crate::error::{retry_once, PipelineError};
use crate::models::{EngagementScore, TopUser, User};
use crate::store::ActivityStore;

/// Top `k` scored users, highest score first, earlier signup winning ties.
///
/// Scores whose user no longer exists are dropped.
pub fn select_top(scores: &[EngagementScore], users: &[User], k: usize) -> Vec<TopUser> {
    let by_id: HashMap<&str, &User> = users.iter().map(|u| (u.id.as_str(), u)).collect();

    let mut ranked: Vec<(&EngagementScore, &User)> = scores
        .iter()
        .filter_map(|score| by_id.get(score.user_id.as_str()).map(|user| (score, *user)))
        .collect();

    ranked.sort_by(|(a_score, a_user), (b_score, b_user)| {
        b_score
            .value
            .total_cmp(&a_score.value)
            .then(a_user.signup_at.cmp(&b_user.signup_at))
            .then(a_user.id.cmp(&b_user.id))
    });

    ranked
        .into_iter()
        .take(k)
        .enumerate()
        .map(|(index, (score, user))| TopUser {
            rank: index + 1,
            user_id: user.id.clone(),
            email: user.email.clone(),
            plan: user.plan.clone(),
            score: score.value,
            signup_at: user.signup_at,
        })
        .collect()
}

pub async fn top_engaged(
    store: &dyn ActivityStore,
    config: &PipelineConfig,
    k: usize,
) -> Result<Vec<TopUser>, PipelineError> {
    let scores = retry_once("list_scores", config.retry_backoff, || store.list_scores()).await?;
    if scores.is_empty() {
        return Ok(Vec::new());
    }
    let users = retry_once("list_users", config.retry_backoff, || store.list_users()).await?;
    Ok(select_top(&scores, &users, k))
}
