//! Core types for Playbook

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Ownership/visibility partition for bullets.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Group {
    Left,
    Right,
    Shared,
    Staging,
}

impl Group {
    pub const ALL: [Group; 4] = [Group::Left, Group::Right, Group::Shared, Group::Staging];

    /// Groups that own agent-produced knowledge (assignment targets).
    pub const AGENTS: [Group; 2] = [Group::Left, Group::Right];

    pub fn as_str(self) -> &'static str {
        match self {
            Group::Left => "left",
            Group::Right => "right",
            Group::Shared => "shared",
            Group::Staging => "staging",
        }
    }

    pub fn is_agent(self) -> bool {
        matches!(self, Group::Left | Group::Right)
    }

    pub fn other(self) -> Option<Group> {
        match self {
            Group::Left => Some(Group::Right),
            Group::Right => Some(Group::Left),
            _ => None,
        }
    }
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Group {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "left" => Ok(Group::Left),
            "right" => Ok(Group::Right),
            "shared" => Ok(Group::Shared),
            "staging" => Ok(Group::Staging),
            other => Err(format!("unknown group: {other}")),
        }
    }
}

/// Categorical tag on a bullet. Metadata only, never used for routing.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BulletKind {
    Strategy,
    Heuristic,
    Pitfall,
    Checklist,
    ToolRule,
    Template,
    Example,
    Pattern,
    Concept,
    Question,
}

impl BulletKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BulletKind::Strategy => "strategy",
            BulletKind::Heuristic => "heuristic",
            BulletKind::Pitfall => "pitfall",
            BulletKind::Checklist => "checklist",
            BulletKind::ToolRule => "tool_rule",
            BulletKind::Template => "template",
            BulletKind::Example => "example",
            BulletKind::Pattern => "pattern",
            BulletKind::Concept => "concept",
            BulletKind::Question => "question",
        }
    }
}

impl fmt::Display for BulletKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BulletKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "strategy" => Ok(BulletKind::Strategy),
            "heuristic" => Ok(BulletKind::Heuristic),
            "pitfall" | "edge_case" => Ok(BulletKind::Pitfall),
            "checklist" | "checklist_step" => Ok(BulletKind::Checklist),
            "tool_rule" => Ok(BulletKind::ToolRule),
            "template" => Ok(BulletKind::Template),
            "example" => Ok(BulletKind::Example),
            "pattern" => Ok(BulletKind::Pattern),
            "concept" => Ok(BulletKind::Concept),
            "question" => Ok(BulletKind::Question),
            other => Err(format!("unknown bullet kind: {other}")),
        }
    }
}

/// Lifecycle state.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BulletStatus {
    Staged,
    Quarantined,
    Active,
    Deprecated,
}

impl BulletStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BulletStatus::Staged => "staged",
            BulletStatus::Quarantined => "quarantined",
            BulletStatus::Active => "active",
            BulletStatus::Deprecated => "deprecated",
        }
    }

    /// Edges of the lifecycle state machine reachable through a plain status update.
    /// Count thresholds for QUARANTINED -> ACTIVE are checked by the store.
    pub fn can_transition_to(self, next: BulletStatus) -> bool {
        use BulletStatus::*;
        matches!(
            (self, next),
            (Staged, Quarantined)
                | (Quarantined, Active)
                | (Staged, Deprecated)
                | (Quarantined, Deprecated)
                | (Active, Deprecated)
        )
    }
}

impl fmt::Display for BulletStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BulletStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "staged" => Ok(BulletStatus::Staged),
            "quarantined" => Ok(BulletStatus::Quarantined),
            "active" => Ok(BulletStatus::Active),
            "deprecated" => Ok(BulletStatus::Deprecated),
            other => Err(format!("unknown status: {other}")),
        }
    }
}

/// Who is creating a bullet. Only bootstrap callers may skip staging.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Privilege {
    Normal,
    Bootstrap,
}

/// The atomic knowledge unit.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Bullet {
    pub id: String,
    pub text: String,
    pub group: Group,
    pub kind: BulletKind,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub confidence: f64,
    #[serde(default)]
    pub helpful_count: u32,
    #[serde(default)]
    pub harmful_count: u32,
    pub status: BulletStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Bullet {
    pub fn new(
        text: impl Into<String>,
        group: Group,
        kind: BulletKind,
        tags: impl IntoIterator<Item = String>,
        confidence: f64,
        status: BulletStatus,
    ) -> Self {
        Self {
            id: Self::generate_id(),
            text: text.into(),
            group,
            kind,
            tags: tags.into_iter().map(|t| t.trim().to_lowercase()).filter(|t| !t.is_empty()).collect(),
            confidence: confidence.clamp(0.0, 1.0),
            helpful_count: 0,
            harmful_count: 0,
            status,
            created_at: Utc::now(),
            last_used_at: None,
            source_trace_id: None,
            metadata: serde_json::Map::new(),
        }
    }

    /// `pb_{millis}_{uuid8}`. Ids outlive group moves, so they carry no group.
    pub fn generate_id() -> String {
        let uuid = uuid::Uuid::new_v4().simple().to_string();
        format!("pb_{}_{}", Utc::now().timestamp_millis(), &uuid[..8])
    }

    /// Id of the shared copy made when this bullet is promoted.
    pub fn shared_id(origin_id: &str) -> String {
        format!("shared__{origin_id}")
    }

    pub fn uses(&self) -> u32 {
        self.helpful_count + self.harmful_count
    }

    /// Ranking score: confidence nudged by outcome history.
    pub fn score(&self) -> f64 {
        self.confidence + 0.05 * self.helpful_count as f64 - 0.1 * self.harmful_count as f64
    }

    pub fn helpful_ratio(&self) -> f64 {
        let uses = self.uses();
        if uses == 0 {
            0.0
        } else {
            self.helpful_count as f64 / uses as f64
        }
    }

    pub fn age_days(&self, now: DateTime<Utc>) -> i64 {
        (now - self.created_at).num_days()
    }

    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }

    pub fn set_meta(&mut self, key: &str, value: impl Into<serde_json::Value>) {
        self.metadata.insert(key.to_string(), value.into());
    }

    pub fn has_any_tag(&self, tags: &[String]) -> bool {
        tags.iter().any(|t| self.tags.contains(&t.to_lowercase()))
    }
}

/// One step of an execution as reported by the agent layer.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StepOutcome {
    pub description: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-tool result from the tool-execution layer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolResult {
    pub name: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// Read-only record of a single task execution.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionTrace {
    pub trace_id: String,
    pub task: String,
    pub group: Group,
    #[serde(default)]
    pub steps: Vec<StepOutcome>,
    #[serde(default)]
    pub bullets_used: Vec<String>,
    pub success: bool,
    #[serde(default)]
    pub expected_success: Option<bool>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub tool_results: Vec<ToolResult>,
    #[serde(default = "default_trace_confidence")]
    pub confidence: f64,
}

fn default_trace_confidence() -> f64 {
    0.5
}

impl ExecutionTrace {
    pub fn new(task: impl Into<String>, group: Group, success: bool) -> Self {
        Self {
            trace_id: format!("trace_{}", uuid::Uuid::new_v4().simple()),
            task: task.into(),
            group,
            steps: Vec::new(),
            bullets_used: Vec::new(),
            success,
            expected_success: None,
            error: None,
            tool_results: Vec::new(),
            confidence: default_trace_confidence(),
        }
    }

    pub fn failed_steps(&self) -> impl Iterator<Item = (usize, &StepOutcome)> {
        self.steps.iter().enumerate().filter(|(_, s)| !s.success)
    }

    pub fn failed_tools(&self) -> impl Iterator<Item = &ToolResult> {
        self.tool_results.iter().filter(|t| !t.success)
    }
}

/// Candidate knowledge produced by reflection. Never persisted directly.
#[derive(Clone, Debug, PartialEq)]
pub struct Insight {
    pub text: String,
    pub kind: BulletKind,
    pub confidence: f64,
    pub evidence: Vec<String>,
    pub tags: Vec<String>,
}

impl Insight {
    pub fn new(text: impl Into<String>, kind: BulletKind, confidence: f64) -> Self {
        Self {
            text: text.into(),
            kind,
            confidence: confidence.clamp(0.0, 1.0),
            evidence: Vec::new(),
            tags: Vec::new(),
        }
    }

    pub fn with_evidence(mut self, evidence: impl Into<String>) -> Self {
        self.evidence.push(evidence.into());
        self
    }

    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.tags.extend(tags.iter().map(|t| t.to_string()));
        self
    }
}

/// How much analysis a trace receives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReflectionDepth {
    None,
    Shallow,
    Medium,
    Deep,
}

impl ReflectionDepth {
    /// Pure mapping from pressure to depth: <0.2 none, <0.5 shallow, <0.8 medium, else deep.
    pub fn for_pressure(pressure: f64) -> Self {
        if pressure >= 0.8 {
            ReflectionDepth::Deep
        } else if pressure >= 0.5 {
            ReflectionDepth::Medium
        } else if pressure >= 0.2 {
            ReflectionDepth::Shallow
        } else {
            ReflectionDepth::None
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReflectionDepth::None => "none",
            ReflectionDepth::Shallow => "shallow",
            ReflectionDepth::Medium => "medium",
            ReflectionDepth::Deep => "deep",
        }
    }
}

impl fmt::Display for ReflectionDepth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bullet_id_is_group_neutral() {
        let b = Bullet::new("text", Group::Left, BulletKind::Heuristic, vec![], 0.5, BulletStatus::Staged);
        assert!(b.id.starts_with("pb_"));
        assert!(!b.id.contains("left"));
        assert_eq!(b.id.split('_').count(), 3);
        let other = Bullet::new("text", Group::Left, BulletKind::Heuristic, vec![], 0.5, BulletStatus::Staged);
        assert_ne!(b.id, other.id);
    }

    #[test]
    fn tags_are_normalized_and_deduplicated() {
        let b = Bullet::new(
            "text",
            Group::Right,
            BulletKind::Pattern,
            vec!["Alpha".into(), "alpha ".into(), "".into()],
            0.5,
            BulletStatus::Staged,
        );
        assert_eq!(b.tags.len(), 1);
        assert!(b.tags.contains("alpha"));
    }

    #[test]
    fn score_rewards_helpful_and_penalizes_harmful() {
        let mut b = Bullet::new("t", Group::Left, BulletKind::Heuristic, vec![], 0.5, BulletStatus::Active);
        b.helpful_count = 4;
        b.harmful_count = 1;
        assert!((b.score() - 0.6).abs() < 1e-9);
    }

    #[test]
    fn staged_cannot_jump_to_active() {
        assert!(!BulletStatus::Staged.can_transition_to(BulletStatus::Active));
        assert!(BulletStatus::Staged.can_transition_to(BulletStatus::Quarantined));
        assert!(!BulletStatus::Deprecated.can_transition_to(BulletStatus::Active));
    }

    #[test]
    fn depth_mapping_boundaries() {
        assert_eq!(ReflectionDepth::for_pressure(0.19), ReflectionDepth::None);
        assert_eq!(ReflectionDepth::for_pressure(0.2), ReflectionDepth::Shallow);
        assert_eq!(ReflectionDepth::for_pressure(0.5), ReflectionDepth::Medium);
        assert_eq!(ReflectionDepth::for_pressure(0.79), ReflectionDepth::Medium);
        assert_eq!(ReflectionDepth::for_pressure(0.8), ReflectionDepth::Deep);
    }

    #[test]
    fn kind_parses_source_aliases() {
        assert_eq!("edge_case".parse::<BulletKind>().unwrap(), BulletKind::Pitfall);
        assert_eq!("tool-rule".parse::<BulletKind>().unwrap(), BulletKind::ToolRule);
        assert!("nonsense".parse::<BulletKind>().is_err());
    }

    #[test]
    fn trace_deserializes_with_defaults() {
        let json = r#"{"trace_id":"t1","task":"do it","group":"left","success":false}"#;
        let trace: ExecutionTrace = serde_json::from_str(json).unwrap();
        assert_eq!(trace.confidence, 0.5);
        assert!(trace.steps.is_empty());
        assert!(trace.expected_success.is_none());
    }
}
