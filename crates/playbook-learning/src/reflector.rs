//! Reflection: turning an execution trace into candidate insights.
//!
//! Depth is chosen by the controller. Shallow and medium are deterministic;
//! deep asks the generative service and degrades to medium on any failure.
//! Nothing here writes to the store.

use playbook_core::config::ReflectionConfig;
use playbook_core::{BulletKind, ExecutionTrace, Insight, ReflectionDepth};
use playbook_llm::{generate_bounded, Generator};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEEP_STEP_LIMIT: usize = 10;

pub struct Reflector {
    generator: Option<Arc<dyn Generator>>,
    config: ReflectionConfig,
    cancel: Option<CancellationToken>,
}

impl Reflector {
    pub fn new(generator: Option<Arc<dyn Generator>>, config: ReflectionConfig) -> Self {
        Self { generator, config, cancel: None }
    }

    /// Abort in-flight deep reflection when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn has_generator(&self) -> bool {
        self.generator.is_some()
    }

    pub async fn reflect(&self, trace: &ExecutionTrace, depth: ReflectionDepth) -> Vec<Insight> {
        let insights = match depth {
            ReflectionDepth::None => Vec::new(),
            ReflectionDepth::Shallow => self.shallow(trace),
            ReflectionDepth::Medium => self.medium(trace),
            ReflectionDepth::Deep => self.deep(trace).await,
        };
        debug!(trace = %trace.trace_id, depth = %depth, insights = insights.len(), "reflected");
        insights
    }

    /// Did it work, and was that expected. At most one insight.
    pub fn shallow(&self, trace: &ExecutionTrace) -> Vec<Insight> {
        let task = excerpt(&trace.task, self.config.task_excerpt_chars);
        let insight = if !trace.success {
            let error = trace.error.as_deref().unwrap_or("unknown error");
            Some(
                Insight::new(format!("Task failed: {error}"), BulletKind::Pitfall, 0.5)
                    .with_evidence(format!("task:{task}"))
                    .with_tags(&["failure", "needs-investigation"]),
            )
        } else if trace.expected_success == Some(false) {
            Some(
                Insight::new(
                    format!("Task expected to fail succeeded anyway: {task}"),
                    BulletKind::Pattern,
                    0.55,
                )
                .with_evidence(format!("task:{task}"))
                .with_tags(&["success", "unexpected"]),
            )
        } else if !trace.bullets_used.is_empty() {
            let mut insight = Insight::new(
                format!("Existing playbook guidance was sufficient for: {task}"),
                BulletKind::Strategy,
                0.6,
            )
            .with_tags(&["success", "routine"]);
            for id in &trace.bullets_used {
                insight = insight.with_evidence(format!("bullet:{id}"));
            }
            Some(insight)
        } else {
            None
        };
        insight.into_iter().collect()
    }

    /// Failed-step pitfalls, per-tool rules and pitfalls, with attribution
    /// to the bullets that were consulted.
    pub fn medium(&self, trace: &ExecutionTrace) -> Vec<Insight> {
        let mut insights = Vec::new();

        for (i, step) in trace.failed_steps().take(2) {
            let mut insight = Insight::new(format!("Step failed: {}", step.description), BulletKind::Pitfall, 0.65)
                .with_evidence(format!("step:{i}"))
                .with_tags(&["step-failure", trace.group.as_str()]);
            if let Some(error) = &step.error {
                insight = insight.with_evidence(format!("error:{error}"));
            }
            insights.push(insight);
        }

        // Per tool: any failure outweighs successes.
        let mut tools: BTreeMap<&str, bool> = BTreeMap::new();
        for result in &trace.tool_results {
            let ok = tools.entry(result.name.as_str()).or_insert(true);
            *ok &= result.success;
        }
        for (&tool, _) in tools.iter().filter(|(_, ok)| !**ok) {
            insights.push(
                Insight::new(
                    format!("Tool '{tool}' failed; validate its inputs or use a different approach"),
                    BulletKind::Pitfall,
                    0.6,
                )
                .with_evidence(format!("tool:{tool}"))
                .with_tags(&[tool, "tool-usage", "failure"]),
            );
        }
        for (&tool, _) in tools.iter().filter(|(_, ok)| **ok) {
            insights.push(
                Insight::new(format!("Tool '{tool}' works for tasks like: {}", excerpt(&trace.task, 60)), BulletKind::ToolRule, 0.7)
                    .with_evidence(format!("tool:{tool}"))
                    .with_tags(&[tool, "tool-usage", "success"]),
            );
        }

        insights.truncate(self.config.medium_max_insights);
        for insight in &mut insights {
            for id in &trace.bullets_used {
                insight.evidence.push(format!("bullet:{id}"));
            }
        }
        insights
    }

    async fn deep(&self, trace: &ExecutionTrace) -> Vec<Insight> {
        let Some(generator) = &self.generator else {
            warn!("Deep reflection requested without a generator, falling back to medium");
            return self.medium(trace);
        };

        let prompt = build_prompt(trace);
        let timeout = Duration::from_secs(self.config.generation_timeout_secs.max(1));
        let response = match generate_bounded(generator.as_ref(), &prompt, timeout, self.cancel.as_ref()).await {
            Ok(text) => text,
            Err(e) => {
                warn!("Deep reflection failed ({}), falling back to medium", e);
                return self.medium(trace);
            }
        };

        let mut insights = parse_insights(&response, trace);
        if insights.is_empty() {
            warn!("Deep reflection parsed no insights, falling back to medium");
            return self.medium(trace);
        }

        let cross_step = cross_step_pattern(trace);
        let room = self.config.deep_max_insights.saturating_sub(usize::from(cross_step.is_some()));
        insights.truncate(room.max(1));
        insights.extend(cross_step);
        info!(trace = %trace.trace_id, insights = insights.len(), generator = generator.name(), "deep reflection");
        insights
    }
}

/// Several failed steps sharing one tool is a pattern worth keeping.
fn cross_step_pattern(trace: &ExecutionTrace) -> Option<Insight> {
    let mut by_tool: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (i, step) in trace.failed_steps() {
        if let Some(tool) = &step.tool {
            by_tool.entry(tool.as_str()).or_default().push(i);
        }
    }
    let (tool, steps) = by_tool.into_iter().filter(|(_, s)| s.len() >= 2).max_by_key(|(_, s)| s.len())?;
    let mut insight = Insight::new(
        format!("Tool '{tool}' failed in {} separate steps; check its preconditions before relying on it", steps.len()),
        BulletKind::Pattern,
        0.7,
    )
    .with_tags(&[tool, "repeated-failure"]);
    for i in steps {
        insight = insight.with_evidence(format!("step:{i}"));
    }
    Some(insight)
}

fn build_prompt(trace: &ExecutionTrace) -> String {
    let steps: Vec<String> = trace
        .steps
        .iter()
        .take(DEEP_STEP_LIMIT)
        .enumerate()
        .map(|(i, s)| {
            let status = if s.success { "ok" } else { "FAILED" };
            let tool = s.tool.as_deref().map(|t| format!(" [{t}]")).unwrap_or_default();
            let error = s.error.as_deref().map(|e| format!(" ({e})")).unwrap_or_default();
            format!("{}. {}{} - {}{}", i + 1, s.description, tool, status, error)
        })
        .collect();
    let tools: Vec<String> = trace
        .tool_results
        .iter()
        .map(|t| format!("{} ({})", t.name, if t.success { "ok" } else { "failed" }))
        .collect();
    let expected = match trace.expected_success {
        Some(true) => "success",
        Some(false) => "failure",
        None => "unknown",
    };

    format!(
        "Analyze this execution trace and extract actionable insights.\n\n\
         TASK: {task}\n\
         OUTCOME: {outcome} (expected {expected})\n\
         {error}\
         AGENT CONFIDENCE: {confidence:.2}\n\n\
         STEPS:\n{steps}\n\n\
         TOOLS: {tools}\n\
         BULLETS CONSULTED: {bullets}\n\n\
         Extract 2-5 insights: strategies that worked, pitfalls to avoid, patterns, \
         tool-specific rules, edge cases.\n\n\
         Format each insight as a block and separate blocks with a line containing only ---\n\
         TYPE: one of strategy, heuristic, pitfall, checklist, tool_rule, template, example, pattern, concept, question\n\
         TEXT: concise, actionable description\n\
         CONFIDENCE: 0.0-1.0\n\
         EVIDENCE: step numbers or observations supporting it\n\
         TAGS: comma-separated tags\n\
         PRIORITY: low, medium or high\n",
        task = trace.task,
        outcome = if trace.success { "SUCCESS" } else { "FAILURE" },
        error = trace.error.as_deref().map(|e| format!("ERROR: {e}\n")).unwrap_or_default(),
        confidence = trace.confidence,
        steps = if steps.is_empty() { "(none recorded)".to_string() } else { steps.join("\n") },
        tools = if tools.is_empty() { "none".to_string() } else { tools.join(", ") },
        bullets = trace.bullets_used.len(),
    )
}

/// Parse `---`-separated TYPE/TEXT/CONFIDENCE/EVIDENCE/TAGS blocks. Blocks
/// without TEXT are skipped; an unknown TYPE becomes a heuristic.
pub fn parse_insights(response: &str, trace: &ExecutionTrace) -> Vec<Insight> {
    let mut insights = Vec::new();
    for block in response.split("---") {
        let mut fields: BTreeMap<String, String> = BTreeMap::new();
        for line in block.lines() {
            if let Some((key, value)) = line.split_once(':') {
                let key = key.trim().trim_start_matches(['-', '*', ' ']).to_ascii_lowercase();
                fields.insert(key, value.trim().to_string());
            }
        }
        let Some(text) = fields.get("text").filter(|t| !t.is_empty()) else { continue };

        let kind = fields.get("type").and_then(|t| t.parse().ok()).unwrap_or(BulletKind::Heuristic);
        let confidence = fields
            .get("confidence")
            .and_then(|c| c.parse::<f64>().ok())
            .filter(|c| c.is_finite())
            .unwrap_or(0.7);
        let mut insight = Insight::new(text.clone(), kind, confidence);
        insight.evidence.push(
            fields
                .get("evidence")
                .cloned()
                .unwrap_or_else(|| format!("trace:{}", trace.trace_id)),
        );
        insight.tags = match fields.get("tags") {
            Some(tags) => tags.split(',').map(|t| t.trim().to_lowercase()).filter(|t| !t.is_empty()).collect(),
            None => vec![trace.group.as_str().to_string()],
        };
        if let Some(priority) = fields.get("priority") {
            insight.tags.push(format!("priority-{}", priority.trim().to_lowercase()));
        }
        insights.push(insight);
    }
    insights
}

fn excerpt(text: &str, max: usize) -> String {
    let trimmed = text.trim();
    match trimmed.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}
