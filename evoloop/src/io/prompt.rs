//! Prompt builder for the generation collaborator.
//!
//! The template marks each section `required` or `droppable`; when the
//! rendered prompt exceeds the byte budget, droppable sections go first and
//! the last remaining section is truncated as a final resort.

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::core::types::{Champion, IterationId, IterationRecord, Plan, Watermarks};

const GENERATE_TEMPLATE: &str = include_str!("prompts/generate.md");

/// Drop order when over budget.
const DROP_ORDER: [&str; 3] = ["history", "opportunities", "source"];

/// One opportunity's statistics as shown to the generator.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct OpportunityLine {
    pub id: String,
    pub score: f64,
    pub ewma_delta: f64,
    pub ewma_count: u64,
    pub conformance: Option<f64>,
}

/// All inputs needed to build a generation prompt.
#[derive(Debug, Clone)]
pub struct PromptInputs {
    pub iteration: IterationId,
    pub plan: Plan,
    pub opportunity_description: Option<String>,
    pub champion: Champion,
    pub watermarks: Watermarks,
    /// Source of the current champion, when it is stored.
    pub champion_source: Option<String>,
    pub opportunities: Vec<OpportunityLine>,
    pub history: Vec<IterationRecord>,
}

#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    content: String,
}

/// Parse sections using `<!-- section:KEY required|droppable -->` markers.
fn parse_sections(rendered: &str) -> Result<Vec<ParsedSection>> {
    let marker = Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->")
        .context("compile section marker")?;
    let spans: Vec<(usize, usize, String, bool)> = marker
        .captures_iter(rendered)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let key = caps.get(1)?.as_str().to_string();
            let required = caps.get(2)?.as_str() == "required";
            Some((whole.start(), whole.end(), key, required))
        })
        .collect();

    let mut sections = Vec::new();
    for (i, (_, content_start, key, required)) in spans.iter().enumerate() {
        let end = spans
            .get(i + 1)
            .map_or(rendered.len(), |(next_start, ..)| *next_start);
        let content = rendered[*content_start..end].trim().to_string();
        if !content.is_empty() || *required {
            sections.push(ParsedSection {
                key: key.clone(),
                required: *required,
                content,
            });
        }
    }
    Ok(sections)
}

fn apply_budget_to_sections(sections: &mut Vec<ParsedSection>, budget: usize) {
    let total_len = |secs: &[ParsedSection]| -> usize {
        secs.iter().map(|s| s.content.len() + 2).sum::<usize>().saturating_sub(2)
    };

    for key in DROP_ORDER {
        if total_len(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped section for budget"
            );
            sections.remove(idx);
        }
    }

    let total = total_len(sections);
    if total <= budget {
        return;
    }
    let Some(last) = sections.last_mut() else {
        return;
    };
    let allowed = last.content.len().saturating_sub(total - budget);
    let before_len = last.content.len();
    if allowed > 12 {
        truncate_at_char_boundary(&mut last.content, allowed - 12);
        last.content.push_str("\n[truncated]");
    } else {
        truncate_at_char_boundary(&mut last.content, allowed);
    }
    debug!(
        section = last.key,
        before_len,
        after_len = last.content.len(),
        "truncated section for budget"
    );
}

fn truncate_at_char_boundary(text: &mut String, max: usize) {
    let mut cut = max.min(text.len());
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
}

/// Builds a prompt within a byte budget.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Self {
        Self { budget_bytes }
    }

    pub fn build(&self, input: &PromptInputs) -> Result<String> {
        let mut env = Environment::new();
        env.add_template("generate", GENERATE_TEMPLATE)
            .context("load generate template")?;
        let rendered = env
            .get_template("generate")?
            .render(context! {
                iteration => input.iteration,
                plan => &input.plan,
                opportunity_description => input
                    .opportunity_description
                    .as_deref()
                    .map(str::trim)
                    .filter(|s| !s.is_empty()),
                champion => &input.champion,
                watermarks => &input.watermarks,
                champion_source => input
                    .champion_source
                    .as_deref()
                    .map(str::trim)
                    .filter(|s| !s.is_empty()),
                opportunities => &input.opportunities,
                history => &input.history,
            })
            .context("render generate template")?;

        let mut sections = parse_sections(&rendered)?;
        apply_budget_to_sections(&mut sections, self.budget_bytes);
        Ok(sections
            .iter()
            .map(|s| s.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{IterationStatus, PlanMode};

    fn inputs() -> PromptInputs {
        PromptInputs {
            iteration: 7,
            plan: Plan {
                opportunity_id: Some("fee_curve/convex".to_string()),
                family_class: Some("fee_curve".to_string()),
                subfamily: Some("convex".to_string()),
                mode: PlanMode::Explore,
                execute_this_iteration: true,
                rationale: "stall override".to_string(),
            },
            opportunity_description: Some("steeper fees".to_string()),
            champion: Champion {
                effective_score: Some(480.0),
                raw_score: Some(481.0),
                candidate_ref: Some("abc".to_string()),
                promoted_at_iteration: Some(3),
            },
            watermarks: Watermarks::default(),
            champion_source: Some("fn fee() {}".to_string()),
            opportunities: vec![OpportunityLine {
                id: "fee_curve/convex".to_string(),
                score: 1.5,
                ewma_delta: -0.2,
                ewma_count: 4,
                conformance: Some(0.75),
            }],
            history: (1..=6)
                .map(|id| IterationRecord {
                    id,
                    status: IterationStatus::Completed,
                    started_at: "2026-01-01T00:00:00Z".to_string(),
                    finished_at: None,
                    duration_ms: None,
                    opportunity_id: Some("fee_curve/convex".to_string()),
                    candidate_ref: None,
                    result_ref: None,
                    effective_score: Some(470.0 + id as f64),
                    promoted: false,
                    error: None,
                })
                .collect(),
        }
    }

    /// Verifies sections render in a stable order with the plan bound.
    #[test]
    fn prompt_ordering_is_stable() {
        let content = PromptBuilder::new(20_000).build(&inputs()).expect("build");
        let positions: Vec<usize> = [
            "### Generation Contract",
            "### Plan",
            "### Champion\n",
            "### Champion Source",
            "### Opportunity Statistics",
            "### Recent Iterations",
        ]
        .iter()
        .map(|header| content.find(header).unwrap_or_else(|| panic!("missing {header}")))
        .collect();
        assert!(positions.windows(2).all(|pair| pair[0] < pair[1]));
        assert!(content.contains("\"subfamily\": \"convex\""));
        assert!(content.contains("480"));
    }

    /// Verifies a tight budget drops history before opportunity statistics.
    #[test]
    fn budget_drops_history_first() {
        let full = PromptBuilder::new(20_000).build(&inputs()).expect("build");
        let history_pos = full.find("### Recent Iterations").expect("history");
        let budget = history_pos;
        let content = PromptBuilder::new(budget).build(&inputs()).expect("build");
        assert!(!content.contains("### Recent Iterations"));
        assert!(content.contains("### Generation Contract"));
        assert!(content.len() <= budget);
    }

    #[test]
    fn free_form_plan_renders_without_opportunity() {
        let mut input = inputs();
        input.plan = Plan {
            opportunity_id: None,
            family_class: None,
            subfamily: None,
            mode: PlanMode::Exploit,
            execute_this_iteration: false,
            rationale: "no opportunities configured".to_string(),
        };
        input.opportunities.clear();
        input.history.clear();
        input.champion = Champion::default();
        let content = PromptBuilder::new(20_000).build(&input).expect("build");
        assert!(content.contains("choose the modification freely"));
        assert!(content.contains("No champion yet"));
        assert!(!content.contains("### Opportunity Statistics"));
    }
}
