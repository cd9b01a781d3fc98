use std::fmt::Write;

use crate::models::{BriefSection, ExecutiveBrief, NarrativeSource, RiskLevel};

pub fn render_markdown(brief: &ExecutiveBrief) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Executive Engagement Brief");
    let _ = writeln!(
        output,
        "Generated {} for {} users (activity over the last {} days)",
        brief.generated_at.format("%Y-%m-%d %H:%M UTC"),
        brief.total_users,
        brief.lookback_days
    );
    let _ = writeln!(
        output,
        "Scored {} users, {} failed.",
        brief.scoring.scored, brief.scoring.failed
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Summary");
    let _ = writeln!(output, "{}", brief.narrative);
    if brief.narrative_source == NarrativeSource::Fallback {
        let _ = writeln!(output);
        let _ = writeln!(output, "_Automated summary; narrative generation was unavailable._");
    }

    for section in &brief.sections {
        let _ = writeln!(output);
        match section {
            BriefSection::TopUsers { users } => {
                let _ = writeln!(output, "## Most Engaged Users");
                if users.is_empty() {
                    let _ = writeln!(output, "No engagement scores recorded yet.");
                }
                for user in users {
                    let _ = writeln!(
                        output,
                        "{}. {} ({}) score {:.2}, joined {}",
                        user.rank,
                        user.email,
                        user.plan,
                        user.score,
                        user.signup_at.date_naive()
                    );
                }
            }
            BriefSection::DropoffSignals { signals } => {
                let _ = writeln!(output, "## Dropoff Risk");
                let at_risk: Vec<_> = signals
                    .iter()
                    .filter(|s| s.risk != RiskLevel::Low)
                    .collect();
                if at_risk.is_empty() {
                    let _ = writeln!(output, "No users at elevated dropoff risk.");
                }
                for signal in at_risk.iter().take(15) {
                    let _ = writeln!(
                        output,
                        "- [{}] {}: {}",
                        signal.risk, signal.email, signal.basis
                    );
                }
                if at_risk.len() > 15 {
                    let _ = writeln!(output, "- ...and {} more", at_risk.len() - 15);
                }
            }
            BriefSection::Recommendations { items } => {
                let _ = writeln!(output, "## Recommendations");
                for item in items {
                    let severity = format!("{:?}", item.severity).to_uppercase();
                    let _ = writeln!(
                        output,
                        "- **{}** {}: {}",
                        severity, item.message, item.action
                    );
                }
            }
        }
    }

    if !brief.errors.is_empty() {
        let _ = writeln!(output);
        let _ = writeln!(output, "## Pipeline Errors");
        for error in &brief.errors {
            let _ = writeln!(output, "- {:?}: {}", error.stage, error.message);
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        DropoffSignal, Recommendation, RiskLevel, ScoringSummary, Severity, Stage, StageError,
        TopUser, TrendBasis,
    };
    use crate::store::fixtures::now;

    fn brief() -> ExecutiveBrief {
        ExecutiveBrief {
            generated_at: now(),
            lookback_days: 30,
            total_users: 2,
            scoring: ScoringSummary { scored: 2, failed: 0 },
            sections: vec![
                BriefSection::TopUsers {
                    users: vec![TopUser {
                        rank: 1,
                        user_id: "b".into(),
                        email: "b@example.com".into(),
                        plan: "pro".into(),
                        score: 90.0,
                        signup_at: now(),
                    }],
                },
                BriefSection::DropoffSignals {
                    signals: vec![DropoffSignal {
                        user_id: "a".into(),
                        email: "a@example.com".into(),
                        risk: RiskLevel::High,
                        basis: TrendBasis::Inactive { days: 21 },
                        last_active_at: None,
                        recent_events: 0,
                        prior_events: 0,
                    }],
                },
                BriefSection::Recommendations {
                    items: vec![Recommendation {
                        severity: Severity::Critical,
                        message: "1 of 2 users (50%) are at high dropoff risk".into(),
                        action: "launch a re-engagement campaign for high-risk users".into(),
                    }],
                },
            ],
            narrative: "Engagement is mixed.".into(),
            narrative_source: NarrativeSource::Fallback,
            errors: vec![StageError {
                stage: Stage::Narrative,
                message: "narrative service timed out after 20000ms".into(),
            }],
        }
    }

    #[test]
    fn renders_every_section_in_order() {
        let text = render_markdown(&brief());
        let top = text.find("## Most Engaged Users").unwrap();
        let risk = text.find("## Dropoff Risk").unwrap();
        let recs = text.find("## Recommendations").unwrap();
        assert!(top < risk && risk < recs);
        assert!(text.contains("1. b@example.com (pro) score 90.00"));
        assert!(text.contains("- [high] a@example.com: no activity in 21 days"));
        assert!(text.contains("**CRITICAL**"));
        assert!(text.contains("narrative generation was unavailable"));
        assert!(text.contains("Narrative: narrative service timed out"));
    }
}
