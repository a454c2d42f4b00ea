use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::AgentError;

/// Note value marking a user-initiated stop (distinct from a failure).
pub const CANCELLED_NOTE: &str = "stopped_by_user";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepType {
    LaunchApp,
    Tap,
    InputText,
    ScrollTo,
    WaitText,
    AssertText,
    Check,
    Slide,
    WaitOtp,
    Back,
    Sleep,
    Label,
    Goto,
    IfVisible,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::LaunchApp => "LAUNCH_APP",
            StepType::Tap => "TAP",
            StepType::InputText => "INPUT_TEXT",
            StepType::ScrollTo => "SCROLL_TO",
            StepType::WaitText => "WAIT_TEXT",
            StepType::AssertText => "ASSERT_TEXT",
            StepType::Check => "CHECK",
            StepType::Slide => "SLIDE",
            StepType::WaitOtp => "WAIT_OTP",
            StepType::Back => "BACK",
            StepType::Sleep => "SLEEP",
            StepType::Label => "LABEL",
            StepType::Goto => "GOTO",
            StepType::IfVisible => "IF_VISIBLE",
        }
    }
}

/// One instruction in an ActionPlan. Indices are 1-based and kept
/// contiguous by `ActionPlan::sanitize`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub index: u32,
    #[serde(rename = "type")]
    pub step_type: StepType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub meta: HashMap<String, String>,
}

impl Step {
    pub fn new(step_type: StepType, target: Option<&str>, value: Option<&str>) -> Self {
        Self {
            index: 0,
            step_type,
            target: target.map(|s| s.to_string()),
            value: value.map(|s| s.to_string()),
            meta: HashMap::new(),
        }
    }

    pub fn with_meta(mut self, key: &str, value: &str) -> Self {
        self.meta.insert(key.to_string(), value.to_string());
        self
    }

    /// Target hint, or "" when the step has none.
    pub fn hint(&self) -> &str {
        self.target.as_deref().unwrap_or("")
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.meta.get(key).map(|s| s.as_str())
    }

    fn same_instruction(&self, other: &Step) -> bool {
        self.step_type == other.step_type
            && self.target == other.target
            && self.value == other.value
    }
}

/// Strategy tag for a re-findable element expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocatorStrategy {
    /// Resource identifier.
    Id,
    /// Accessibility description.
    Desc,
    /// Exact visible text.
    Text,
    /// Case-insensitive visible text.
    TextCi,
    /// Structural path expression (ancestor/child walk).
    Path,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Locator {
    pub strategy: LocatorStrategy,
    pub value: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alternates: Vec<String>,
}

impl Locator {
    pub fn new(strategy: LocatorStrategy, value: &str) -> Self {
        Self { strategy, value: value.to_string(), alternates: Vec::new() }
    }
}

/// Result of executing one step. `next_pc` carries explicit jumps; the
/// engine never skips lines implicitly.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub ok: bool,
    pub locator: Option<Locator>,
    pub notes: Option<String>,
    pub advance: bool,
    pub next_pc: Option<usize>,
}

impl StepOutcome {
    pub fn success() -> Self {
        Self { ok: true, locator: None, notes: None, advance: true, next_pc: None }
    }

    pub fn success_with(locator: Option<Locator>, notes: Option<String>) -> Self {
        Self { ok: true, locator, notes, advance: true, next_pc: None }
    }

    pub fn jump(pc: usize) -> Self {
        Self { ok: true, locator: None, notes: None, advance: true, next_pc: Some(pc) }
    }

    pub fn failure(notes: &str) -> Self {
        Self {
            ok: false,
            locator: None,
            notes: Some(notes.to_string()),
            advance: false,
            next_pc: None,
        }
    }

    pub fn cancelled() -> Self {
        Self {
            ok: false,
            locator: None,
            notes: Some(CANCELLED_NOTE.to_string()),
            advance: false,
            next_pc: None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.notes.as_deref() == Some(CANCELLED_NOTE)
    }
}

/// Audit record of one executed cycle, synthetic jump/branch steps included.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub step_index: u32,
    pub action: StepType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locator: Option<Locator>,
    pub ui_dump_path: String,
    pub screenshot_path: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub at: DateTime<Utc>,
}

/// An ordered, named automation script. Immutable during execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionPlan {
    pub title: String,
    #[serde(default)]
    pub app: String,
    pub steps: Vec<Step>,
}

impl ActionPlan {
    pub fn new(title: &str, app: &str, steps: Vec<Step>) -> Self {
        let mut plan = Self { title: title.to_string(), app: app.to_string(), steps };
        plan.sanitize();
        plan
    }

    /// App identifier: the explicit field, else the first LAUNCH_APP target.
    pub fn effective_app(&self) -> String {
        if !self.app.is_empty() {
            return self.app.clone();
        }
        self.steps
            .iter()
            .find(|s| s.step_type == StepType::LaunchApp)
            .and_then(|s| s.target.clone())
            .unwrap_or_else(|| "unknown".to_string())
    }

    /// Drop consecutive duplicate instructions, then reindex to 1..N.
    pub fn sanitize(&mut self) {
        self.steps.dedup_by(|b, a| a.same_instruction(b));
        self.reindex();
    }

    pub fn reindex(&mut self) {
        for (i, step) in self.steps.iter_mut().enumerate() {
            step.index = (i + 1) as u32;
        }
    }

    pub fn label_index(&self, name: &str) -> Option<usize> {
        self.steps
            .iter()
            .position(|s| s.step_type == StepType::Label && s.hint() == name)
    }

    /// Structural validation. Violations are configuration errors: fatal,
    /// surfaced before the first cycle, never retried.
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.steps.is_empty() {
            return Err(AgentError::Config("plan has no steps".into()));
        }
        for step in &self.steps {
            match step.step_type {
                StepType::Goto => {
                    let label = step.target.as_deref().ok_or_else(|| {
                        AgentError::Config(format!("step {}: GOTO without target label", step.index))
                    })?;
                    if self.label_index(label).is_none() {
                        return Err(AgentError::Config(format!(
                            "step {}: GOTO target label '{}' not found",
                            step.index, label
                        )));
                    }
                }
                StepType::IfVisible => {
                    if step.target.is_none() {
                        return Err(AgentError::Config(format!(
                            "step {}: IF_VISIBLE without query text",
                            step.index
                        )));
                    }
                    for branch in ["then", "else"] {
                        let label = step.meta(branch).ok_or_else(|| {
                            AgentError::Config(format!(
                                "step {}: IF_VISIBLE missing '{}' branch",
                                step.index, branch
                            ))
                        })?;
                        if self.label_index(label).is_none() {
                            return Err(AgentError::Config(format!(
                                "step {}: IF_VISIBLE branch label '{}' not found",
                                step.index, label
                            )));
                        }
                    }
                }
                StepType::InputText => {
                    if step.value.is_none() {
                        return Err(AgentError::Config(format!(
                            "step {}: INPUT_TEXT without value",
                            step.index
                        )));
                    }
                    if step.target.is_none() {
                        return Err(AgentError::Config(format!(
                            "step {}: INPUT_TEXT without target field",
                            step.index
                        )));
                    }
                }
                StepType::LaunchApp
                | StepType::Tap
                | StepType::ScrollTo
                | StepType::WaitText
                | StepType::AssertText
                | StepType::Check
                | StepType::Slide
                | StepType::Label => {
                    if step.target.is_none() {
                        return Err(AgentError::Config(format!(
                            "step {}: {} without target",
                            step.index,
                            step.step_type.as_str()
                        )));
                    }
                }
                StepType::WaitOtp | StepType::Back | StepType::Sleep => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tap(target: &str) -> Step {
        Step::new(StepType::Tap, Some(target), None)
    }

    #[test]
    fn test_sanitize_reindexes_contiguously() {
        let mut plan = ActionPlan {
            title: "t".into(),
            app: "com.example".into(),
            steps: vec![tap("A"), tap("A"), tap("B"), tap("C"), tap("C")],
        };
        plan.sanitize();
        let indices: Vec<u32> = plan.steps.iter().map(|s| s.index).collect();
        assert_eq!(indices, vec![1, 2, 3]);
        let targets: Vec<&str> = plan.steps.iter().map(|s| s.hint()).collect();
        assert_eq!(targets, vec!["A", "B", "C"]);
    }

    #[test]
    fn test_validate_accepts_well_formed_plan() {
        let plan = ActionPlan::new(
            "login",
            "com.example",
            vec![
                Step::new(StepType::LaunchApp, Some("com.example"), None),
                Step::new(StepType::InputText, Some("username"), Some("alice")),
                tap("LOGIN"),
                Step::new(StepType::WaitText, Some("Home"), None),
            ],
        );
        assert!(plan.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_missing_goto_label() {
        let plan = ActionPlan::new("t", "a", vec![Step::new(StepType::Goto, Some("NOPE"), None)]);
        let err = plan.validate().unwrap_err();
        assert!(matches!(err, AgentError::Config(_)));
        assert!(err.to_string().contains("NOPE"));
    }

    #[test]
    fn test_validate_rejects_if_visible_without_branches() {
        let plan = ActionPlan::new(
            "t",
            "a",
            vec![
                Step::new(StepType::IfVisible, Some("Offer"), None).with_meta("then", "T"),
                Step::new(StepType::Label, Some("T"), None),
            ],
        );
        assert!(plan.validate().is_err());
    }

    #[test]
    fn test_effective_app_falls_back_to_launch_step() {
        let plan = ActionPlan::new(
            "t",
            "",
            vec![Step::new(StepType::LaunchApp, Some("com.bank.app"), None)],
        );
        assert_eq!(plan.effective_app(), "com.bank.app");
    }
}
