use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::error::{retry_once, PipelineError};
use crate::models::{
    ActivityEvent, DropoffScan, DropoffSignal, ItemError, RiskLevel, TrendBasis, User,
};
use crate::store::ActivityStore;

pub const HIGH_RISK_INACTIVE_DAYS: i64 = 14;
pub const MEDIUM_RISK_INACTIVE_DAYS: i64 = 7;
/// Prior-window activity needed before a drop in frequency counts as a decline.
pub const DECLINE_MIN_PRIOR_EVENTS: usize = 4;

/// Risk from inactivity and the recent-vs-prior event trend.
///
/// For fixed `recent`/`prior`, risk never decreases as `days_inactive` grows.
pub fn classify(
    days_inactive: Option<i64>,
    recent: usize,
    prior: usize,
    lookback_days: i64,
) -> (RiskLevel, TrendBasis) {
    let Some(days) = days_inactive else {
        return (RiskLevel::High, TrendBasis::NeverActive);
    };

    if days >= HIGH_RISK_INACTIVE_DAYS || days >= lookback_days {
        (RiskLevel::High, TrendBasis::Inactive { days })
    } else if days >= MEDIUM_RISK_INACTIVE_DAYS {
        (RiskLevel::Medium, TrendBasis::Inactive { days })
    } else if prior >= DECLINE_MIN_PRIOR_EVENTS && recent * 2 < prior {
        (RiskLevel::Medium, TrendBasis::DecliningFrequency { recent, prior })
    } else {
        (RiskLevel::Low, TrendBasis::Steady { recent, prior })
    }
}

/// `earlier_activity` is the latest activity known from outside `events`,
/// such as an event older than the scan window.
pub fn assess(
    user: &User,
    events: &[ActivityEvent],
    earlier_activity: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    config: &PipelineConfig,
) -> DropoffSignal {
    let trend = Duration::days(config.trend_days.max(1));
    let recent_start = now - trend;
    let prior_start = recent_start - trend;

    let past: Vec<&ActivityEvent> = events.iter().filter(|e| e.occurred_at <= now).collect();
    let last_active_at = past
        .iter()
        .map(|e| e.occurred_at)
        .chain(user.last_active_at)
        .chain(earlier_activity)
        .filter(|at| *at <= now)
        .max();

    let recent = past.iter().filter(|e| e.occurred_at > recent_start).count();
    let prior = past
        .iter()
        .filter(|e| e.occurred_at > prior_start && e.occurred_at <= recent_start)
        .count();

    let days_inactive = last_active_at.map(|at| (now - at).num_days().max(0));
    let (risk, basis) = classify(days_inactive, recent, prior, config.lookback_days);

    DropoffSignal {
        user_id: user.id.clone(),
        email: user.email.clone(),
        risk,
        basis,
        last_active_at,
        recent_events: recent,
        prior_events: prior,
    }
}

/// Highest risk first; within a level, the longest-quiet user first.
pub fn sort_signals(signals: &mut [DropoffSignal]) {
    signals.sort_by(|a, b| {
        b.risk
            .cmp(&a.risk)
            .then(a.last_active_at.cmp(&b.last_active_at))
            .then(a.user_id.cmp(&b.user_id))
    });
}

async fn scan_user(
    store: &dyn ActivityStore,
    user: &User,
    since: DateTime<Utc>,
    now: DateTime<Utc>,
    config: &PipelineConfig,
) -> Result<DropoffSignal, PipelineError> {
    let events = retry_once("read_events", config.retry_backoff, || {
        store.read_events(&user.id, since)
    })
    .await?;

    // Nothing inside the window: look further back so long-dormant users
    // still order by how long they have been quiet.
    let earlier = if events.is_empty() {
        retry_once("latest_activity_at", config.retry_backoff, || {
            store.latest_activity_at(&user.id, now)
        })
        .await?
    } else {
        None
    };

    Ok(assess(user, &events, earlier, now, config))
}

/// Read-only pass over every user.
pub async fn detect_dropoff(
    store: &dyn ActivityStore,
    config: &PipelineConfig,
    now: DateTime<Utc>,
) -> Result<DropoffScan, PipelineError> {
    let users = retry_once("list_users", config.retry_backoff, || store.list_users()).await?;
    let window = config.lookback_days.max(config.trend_days * 2);
    let since = now - Duration::days(window.max(1));
    let mut scan = DropoffScan::default();

    for user in &users {
        match scan_user(store, user, since, now, config).await {
            Ok(signal) => scan.signals.push(signal),
            Err(err) => {
                warn!(user_id = %user.id, error = %err, "skipping user during dropoff scan");
                scan.errors.push(ItemError {
                    user_id: user.id.clone(),
                    message: err.to_string(),
                });
            }
        }
    }

    sort_signals(&mut scan.signals);
    let high = scan.signals.iter().filter(|s| s.risk == RiskLevel::High).count();
    info!(users = users.len(), high_risk = high, "dropoff scan complete");
    Ok(scan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EventType::*;
    use crate::store::fixtures::{event, now, spread, user};
    use crate::store::memory::MemoryStore;

    #[test]
    fn user_without_events_is_high_risk() {
        let signal = assess(&user("a", "free", 60), &[], None, now(), &PipelineConfig::default());
        assert_eq!(signal.risk, RiskLevel::High);
        assert_eq!(signal.basis, TrendBasis::NeverActive);
    }

    #[test]
    fn steady_daily_user_is_low_risk() {
        let mut events = spread("b", Login, 50, 30);
        events.extend(spread("b", Purchase, 10, 30));
        let signal = assess(
            &user("b", "pro", 90),
            &events,
            None,
            now(),
            &PipelineConfig::default(),
        );
        assert_eq!(signal.risk, RiskLevel::Low);
    }

    #[test]
    fn halved_frequency_is_medium() {
        let mut events: Vec<_> = (8..14).map(|d| event("c", Login, d)).collect();
        events.push(event("c", Login, 1));
        let signal = assess(
            &user("c", "free", 60),
            &events,
            None,
            now(),
            &PipelineConfig::default(),
        );
        assert_eq!(signal.risk, RiskLevel::Medium);
        assert_eq!(
            signal.basis,
            TrendBasis::DecliningFrequency { recent: 1, prior: 6 }
        );
    }

    #[test]
    fn last_active_timestamp_counts_as_activity() {
        let mut u = user("d", "free", 60);
        u.last_active_at = Some(now() - Duration::days(2));
        let signal = assess(&u, &[], None, now(), &PipelineConfig::default());
        assert_eq!(signal.risk, RiskLevel::Low);
    }

    #[test]
    fn risk_is_monotonic_in_inactivity() {
        for (recent, prior) in [(0, 0), (1, 6), (5, 5), (0, 10)] {
            let mut previous = RiskLevel::Low;
            for days in 0..60 {
                let (risk, _) = classify(Some(days), recent, prior, 30);
                assert!(risk >= previous, "days {days} recent {recent} prior {prior}");
                previous = risk;
            }
            let (never, _) = classify(None, recent, prior, 30);
            assert!(never >= previous);
        }
    }

    #[test]
    fn short_lookback_tightens_high_threshold() {
        let (risk, _) = classify(Some(5), 0, 0, 5);
        assert_eq!(risk, RiskLevel::High);
    }

    #[tokio::test]
    async fn signals_sorted_by_risk_then_least_recent() {
        let users = vec![
            user("steady", "pro", 90),
            user("quiet20", "free", 90),
            user("never", "free", 90),
            user("quiet40", "free", 90),
            user("quiet9", "free", 90),
        ];
        let mut events = spread("steady", Login, 30, 30);
        events.push(event("quiet20", Login, 20));
        events.push(event("quiet40", Login, 40));
        events.push(event("quiet9", Login, 9));
        let store = MemoryStore::new(users, events);

        let scan = detect_dropoff(&store, &PipelineConfig::default(), now())
            .await
            .unwrap();
        let order: Vec<&str> = scan.signals.iter().map(|s| s.user_id.as_str()).collect();
        assert_eq!(order, vec!["never", "quiet40", "quiet20", "quiet9", "steady"]);
        assert_eq!(scan.signals[0].basis, TrendBasis::NeverActive);
        assert_eq!(scan.signals[1].basis, TrendBasis::Inactive { days: 40 });
        assert_eq!(scan.signals[3].risk, RiskLevel::Medium);
        assert!(scan.errors.is_empty());
    }

    #[tokio::test]
    async fn activity_before_window_still_orders_by_quiet_time() {
        let users = vec![user("aaa", "free", 120), user("zzz", "free", 120)];
        let events = vec![event("aaa", Login, 35), event("zzz", Login, 60)];
        let store = MemoryStore::new(users, events);

        let scan = detect_dropoff(&store, &PipelineConfig::default(), now())
            .await
            .unwrap();
        let order: Vec<&str> = scan.signals.iter().map(|s| s.user_id.as_str()).collect();
        assert_eq!(order, vec!["zzz", "aaa"]);
        assert_eq!(scan.signals[0].basis, TrendBasis::Inactive { days: 60 });
        assert_eq!(scan.signals[1].basis, TrendBasis::Inactive { days: 35 });
        assert!(scan.signals.iter().all(|s| s.last_active_at.is_some()));
        assert!(scan.signals.iter().all(|s| s.risk == RiskLevel::High));
    }

    #[test]
    fn earlier_activity_replaces_never_active() {
        let earlier = Some(now() - Duration::days(50));
        let signal = assess(
            &user("e", "free", 90),
            &[],
            earlier,
            now(),
            &PipelineConfig::default(),
        );
        assert_eq!(signal.basis, TrendBasis::Inactive { days: 50 });
        assert_eq!(signal.last_active_at, earlier);
    }
}
