//! Knowledge guardrail: cross-document consistency of canonical state.
//!
//! Run before prompt construction. Any violation skips the iteration rather
//! than letting the generator reason over contradictory context.

use crate::core::promotion::PromotionLedger;
use crate::core::types::{Champion, IterationId, Watermarks};

/// In-memory view of the canonical documents.
#[derive(Debug, Clone, Copy)]
pub struct StateSnapshot<'a> {
    pub iteration_counter: IterationId,
    pub champion_score: Option<f64>,
    pub champion: &'a Champion,
    pub watermarks: &'a Watermarks,
    pub ledger: &'a PromotionLedger,
    pub last_logged_id: Option<IterationId>,
}

/// Returns human-readable violations; empty means consistent.
pub fn check_consistency(snapshot: &StateSnapshot<'_>) -> Vec<String> {
    let mut violations = Vec::new();
    let champion = snapshot.champion;

    match (snapshot.champion_score, champion.effective_score) {
        (Some(scalar), Some(doc)) if scalar != doc => violations.push(format!(
            "champion_score scalar {scalar} disagrees with champion.json effective_score {doc}"
        )),
        (Some(scalar), None) => violations.push(format!(
            "champion_score scalar {scalar} set but champion.json has no score"
        )),
        (None, Some(doc)) => violations.push(format!(
            "champion.json effective_score {doc} set but champion_score scalar is empty"
        )),
        _ => {}
    }

    for (label, value) in [
        ("champion effective_score", champion.effective_score),
        ("champion raw_score", champion.raw_score),
        ("best effective watermark", snapshot.watermarks.best_effective_score),
        ("best raw watermark", snapshot.watermarks.best_raw_score),
    ] {
        if value.is_some_and(|score| !score.is_finite()) {
            violations.push(format!("{label} is not finite"));
        }
    }

    if let Some(promoted_at) = champion.promoted_at_iteration {
        if promoted_at > snapshot.iteration_counter {
            violations.push(format!(
                "champion promoted at iteration {promoted_at} beyond counter {}",
                snapshot.iteration_counter
            ));
        }
        match champion
            .candidate_ref
            .as_deref()
            .and_then(|hash| snapshot.ledger.entries.get(hash).map(|entry| (hash, entry)))
        {
            Some((hash, entry)) if entry.promoted_at_iteration != Some(promoted_at) => {
                violations.push(format!(
                    "ledger entry {hash} promoted_at {:?} disagrees with champion ({promoted_at})",
                    entry.promoted_at_iteration
                ));
            }
            Some(_) => {}
            None => violations.push(format!(
                "champion promoted at iteration {promoted_at} has no ledger entry"
            )),
        }
    }

    for (hash, entry) in &snapshot.ledger.entries {
        let mut seen = std::collections::BTreeSet::new();
        for confirmation in &entry.confirmations {
            if !seen.insert(confirmation.iteration) {
                violations.push(format!(
                    "ledger entry {hash} confirms iteration {} twice",
                    confirmation.iteration
                ));
            }
            if confirmation.iteration > snapshot.iteration_counter {
                violations.push(format!(
                    "ledger entry {hash} confirmation at {} beyond counter {}",
                    confirmation.iteration, snapshot.iteration_counter
                ));
            }
            if !confirmation.effective_score.is_finite() {
                violations.push(format!("ledger entry {hash} has a non-finite score"));
            }
        }
        let best = entry
            .confirmations
            .iter()
            .map(|confirmation| confirmation.effective_score)
            .fold(None, |acc: Option<f64>, score| {
                Some(acc.map_or(score, |a| a.max(score)))
            });
        if best != entry.best_effective_score {
            violations.push(format!(
                "ledger entry {hash} best_effective_score {:?} != max confirmation {best:?}",
                entry.best_effective_score
            ));
        }
    }

    if let Some(last) = snapshot.last_logged_id.filter(|&last| last > snapshot.iteration_counter) {
        violations.push(format!(
            "iteration log reaches {last} beyond counter {}",
            snapshot.iteration_counter
        ));
    }

    violations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::promotion::{Confirmation, LedgerEntry};

    fn consistent() -> (Champion, Watermarks, PromotionLedger) {
        let champion = Champion {
            effective_score: Some(485.0),
            raw_score: Some(486.0),
            candidate_ref: Some("h".to_string()),
            promoted_at_iteration: Some(4),
        };
        let mut ledger = PromotionLedger::default();
        ledger.entries.insert(
            "h".to_string(),
            LedgerEntry {
                confirmations: vec![Confirmation {
                    iteration: 4,
                    effective_score: 485.0,
                }],
                best_effective_score: Some(485.0),
                promoted_at_iteration: Some(4),
            },
        );
        (champion, Watermarks::default(), ledger)
    }

    #[test]
    fn consistent_state_has_no_violations() {
        let (champion, watermarks, ledger) = consistent();
        let snapshot = StateSnapshot {
            iteration_counter: 5,
            champion_score: Some(485.0),
            champion: &champion,
            watermarks: &watermarks,
            ledger: &ledger,
            last_logged_id: Some(5),
        };
        assert!(check_consistency(&snapshot).is_empty());
    }

    #[test]
    fn baseline_champion_without_ledger_is_consistent() {
        let champion = Champion {
            effective_score: Some(100.0),
            ..Champion::default()
        };
        let snapshot = StateSnapshot {
            iteration_counter: 0,
            champion_score: Some(100.0),
            champion: &champion,
            watermarks: &Watermarks::default(),
            ledger: &PromotionLedger::default(),
            last_logged_id: None,
        };
        assert!(check_consistency(&snapshot).is_empty());
    }

    #[test]
    fn detects_scalar_mismatch_and_log_overrun() {
        let (champion, watermarks, ledger) = consistent();
        let snapshot = StateSnapshot {
            iteration_counter: 5,
            champion_score: Some(480.0),
            champion: &champion,
            watermarks: &watermarks,
            ledger: &ledger,
            last_logged_id: Some(7),
        };
        let violations = check_consistency(&snapshot);
        assert_eq!(violations.len(), 2, "{violations:?}");
    }

    #[test]
    fn detects_non_finite_effective_watermark() {
        let (champion, mut watermarks, ledger) = consistent();
        watermarks.best_effective_score = Some(f64::INFINITY);
        let snapshot = StateSnapshot {
            iteration_counter: 5,
            champion_score: Some(485.0),
            champion: &champion,
            watermarks: &watermarks,
            ledger: &ledger,
            last_logged_id: Some(5),
        };
        assert_eq!(
            check_consistency(&snapshot),
            vec!["best effective watermark is not finite".to_string()]
        );
    }

    #[test]
    fn detects_ledger_best_drift() {
        let (champion, watermarks, mut ledger) = consistent();
        if let Some(entry) = ledger.entries.get_mut("h") {
            entry.best_effective_score = Some(999.0);
        }
        let snapshot = StateSnapshot {
            iteration_counter: 5,
            champion_score: Some(485.0),
            champion: &champion,
            watermarks: &watermarks,
            ledger: &ledger,
            last_logged_id: None,
        };
        let violations = check_consistency(&snapshot);
        assert_eq!(violations.len(), 1);
        assert!(violations[0].contains("best_effective_score"));
    }
}
