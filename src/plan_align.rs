use tracing::debug;

use crate::flow_graph::canonical_hint;
use crate::schema::{ActionPlan, Step, StepType};

const GAP: i32 = -2;

fn norm_hint(step: &Step) -> String {
    canonical_hint(step.step_type, step.hint())
}

/// Harmless navigation: steps safe to inherit from the learned graph or to
/// let the graph re-target.
fn is_harmless_nav(step: &Step) -> bool {
    matches!(
        step.step_type,
        StepType::Tap | StepType::ScrollTo | StepType::Back | StepType::Label | StepType::LaunchApp
    )
}

fn is_login_like(step: &Step) -> bool {
    if step.step_type != StepType::Tap {
        return false;
    }
    let hint = step.hint().to_lowercase();
    ["login", "log in", "sign", "submit", "continue", "next", "confirm"]
        .iter()
        .any(|k| hint.contains(k))
}

/// Substitution score for aligning a user step against a graph step.
/// A user INPUT_TEXT against a graph TAP counts as a type match: learned
/// graphs frequently represent credential fields as taps.
fn substitution(user: &Step, graph: &Step) -> i32 {
    if user.step_type == graph.step_type && norm_hint(user) == norm_hint(graph) {
        return 2;
    }
    if user.step_type == graph.step_type {
        return 1;
    }
    if user.step_type == StepType::InputText && graph.step_type == StepType::Tap {
        return 1;
    }
    -1
}

/// Merge an inferred (graph) plan into a user-authored plan via global
/// sequence alignment. An empty inferred plan passes the user plan through
/// untouched apart from the idempotent critical-input check.
pub fn align(user: &ActionPlan, inferred: Option<&ActionPlan>) -> ActionPlan {
    let graph_steps: &[Step] = inferred.map(|p| p.steps.as_slice()).unwrap_or(&[]);
    if graph_steps.is_empty() {
        let mut merged = user.steps.clone();
        ensure_critical_inputs(&user.steps, &mut merged);
        return reindexed(user, merged);
    }

    let g = graph_steps;
    let u = &user.steps;

    // Needleman–Wunsch table: rows over graph steps, columns over user steps.
    let mut dp = vec![vec![0i32; u.len() + 1]; g.len() + 1];
    for i in 1..=g.len() {
        dp[i][0] = dp[i - 1][0] + GAP;
    }
    for j in 1..=u.len() {
        dp[0][j] = dp[0][j - 1] + GAP;
    }
    for i in 1..=g.len() {
        for j in 1..=u.len() {
            let diag = dp[i - 1][j - 1] + substitution(&u[j - 1], &g[i - 1]);
            let up = dp[i - 1][j] + GAP;
            let left = dp[i][j - 1] + GAP;
            dp[i][j] = diag.max(up).max(left);
        }
    }

    // Backtrace from the bottom-right cell.
    let mut merged_rev: Vec<Step> = Vec::new();
    let (mut i, mut j) = (g.len(), u.len());
    while i > 0 || j > 0 {
        if i > 0 && j > 0 && dp[i][j] == dp[i - 1][j - 1] + substitution(&u[j - 1], &g[i - 1]) {
            let user_step = &u[j - 1];
            let graph_step = &g[i - 1];
            let score = substitution(user_step, graph_step);
            // Prefer the user's step; let the graph re-target only a
            // harmless navigation continuation.
            let mut step = user_step.clone();
            if score >= 1
                && is_harmless_nav(user_step)
                && !graph_step.hint().is_empty()
                && norm_hint(user_step) != norm_hint(graph_step)
            {
                debug!(
                    "🔀 [Align] graph hint '{}' overrides '{}'",
                    graph_step.hint(),
                    user_step.hint()
                );
                step.target = graph_step.target.clone();
            }
            merged_rev.push(step);
            i -= 1;
            j -= 1;
        } else if i > 0 && (j == 0 || dp[i][j] == dp[i - 1][j] + GAP) {
            // Graph-only step: keep it only when it is harmless navigation.
            let graph_step = &g[i - 1];
            if is_harmless_nav(graph_step) {
                merged_rev.push(graph_step.clone());
            }
            i -= 1;
        } else {
            // User-only step: always kept verbatim.
            merged_rev.push(u[j - 1].clone());
            j -= 1;
        }
    }
    merged_rev.reverse();
    let mut merged = merged_rev;

    ensure_critical_inputs(&user.steps, &mut merged);
    reindexed(user, merged)
}

/// Guarantee no user INPUT_TEXT was silently dropped: force-insert any
/// missing ones immediately before the first login-like tap, else the
/// first tap, else the start. Idempotent when nothing is missing.
fn ensure_critical_inputs(user_steps: &[Step], merged: &mut Vec<Step>) {
    let missing: Vec<Step> = user_steps
        .iter()
        .filter(|s| s.step_type == StepType::InputText)
        .filter(|s| {
            !merged
                .iter()
                .any(|m| m.step_type == StepType::InputText && norm_hint(m) == norm_hint(s))
        })
        .cloned()
        .collect();
    if missing.is_empty() {
        return;
    }

    let anchor = merged
        .iter()
        .position(is_login_like)
        .or_else(|| merged.iter().position(|s| s.step_type == StepType::Tap))
        .unwrap_or(0);
    for (offset, step) in missing.into_iter().enumerate() {
        merged.insert(anchor + offset, step);
    }
}

fn reindexed(user: &ActionPlan, steps: Vec<Step>) -> ActionPlan {
    ActionPlan::new(&user.title, &user.app, steps)
}
