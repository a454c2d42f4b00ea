use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::AgentError;
use crate::schema::{ActionPlan, Step, StepType};

/// Learned transition model for one (app, flow-id): token occurrence
/// counts, weighted transitions, and a completed-run counter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowGraph {
    pub nodes: HashMap<String, u32>,
    /// from-token → (to-token → traversal weight).
    pub edges: HashMap<String, HashMap<String, u32>>,
    pub runs: u32,
}

/// Fold a hint into its canonical form: synonym groups first, else a
/// normalized, length-capped slug.
pub fn canonical_hint(step_type: StepType, hint: &str) -> String {
    let lower = hint.to_lowercase();
    if lower.contains("otp") || lower.contains("one-time") || lower.contains("one time") {
        return "otp".to_string();
    }
    if lower.contains("pass") {
        return "password".to_string();
    }
    if lower.contains("user") || lower.contains("email") || lower.contains("login-id") || lower.contains("login id") {
        return "username".to_string();
    }
    if step_type == StepType::Slide && lower.contains("confirm") {
        return "confirm".to_string();
    }
    let slug: String = lower
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect();
    let slug = slug.trim_matches('_').to_string();
    slug.chars().take(24).collect()
}

/// Canonical token for one executed step: `TYPE:canonicalHint`.
pub fn canonical_token(step: &Step) -> String {
    format!("{}:{}", step.step_type.as_str(), canonical_hint(step.step_type, step.hint()))
}

/// One JSON snapshot file per (app, flow-id), rewritten after each
/// completed run.
pub struct FlowStore {
    dir: PathBuf,
}

impl FlowStore {
    pub fn open(dir: &Path) -> Result<Self, AgentError> {
        fs::create_dir_all(dir)?;
        Ok(Self { dir: dir.to_path_buf() })
    }

    fn file_for(&self, app: &str, flow: &str) -> PathBuf {
        let slug = |s: &str| -> String {
            s.chars().map(|c| if c.is_alphanumeric() { c } else { '_' }).collect()
        };
        self.dir.join(format!("{}__{}.json", slug(app), slug(flow)))
    }

    pub fn load(&self, app: &str, flow: &str) -> FlowGraph {
        let path = self.file_for(app, flow);
        if !path.exists() {
            return FlowGraph::default();
        }
        match fs::read_to_string(&path).map_err(AgentError::from).and_then(|raw| {
            serde_json::from_str(&raw).map_err(AgentError::from)
        }) {
            Ok(graph) => graph,
            Err(e) => {
                warn!("⚠️ [FlowGraph] snapshot unreadable, starting fresh: {}", e);
                FlowGraph::default()
            }
        }
    }

    pub fn save(&self, app: &str, flow: &str, graph: &FlowGraph) {
        let path = self.file_for(app, flow);
        match serde_json::to_string_pretty(graph) {
            Ok(json) => {
                if let Err(e) = fs::write(&path, json) {
                    warn!("⚠️ [FlowGraph] save failed: {}", e);
                }
            }
            Err(e) => warn!("⚠️ [FlowGraph] serialize failed: {}", e),
        }
    }
}

/// In-run recorder: feeds each executed step into the graph and persists a
/// snapshot when the run completes.
pub struct FlowRecorder {
    store: FlowStore,
    app: String,
    flow: String,
    graph: FlowGraph,
    prev: Option<String>,
}

impl FlowRecorder {
    pub fn new(store: FlowStore, app: &str, flow: &str) -> Self {
        let graph = store.load(app, flow);
        Self { store, app: app.to_string(), flow: flow.to_string(), graph, prev: None }
    }

    /// Record one executed step and the transition that led to it.
    /// Control-flow steps carry no screen semantics and are not recorded.
    pub fn observe(&mut self, step: &Step) {
        if matches!(step.step_type, StepType::Label | StepType::Goto | StepType::IfVisible) {
            return;
        }
        let token = canonical_token(step);
        *self.graph.nodes.entry(token.clone()).or_insert(0) += 1;
        if let Some(prev) = &self.prev {
            *self
                .graph
                .edges
                .entry(prev.clone())
                .or_default()
                .entry(token.clone())
                .or_insert(0) += 1;
        }
        self.prev = Some(token);
    }

    /// Close out the run and persist the graph snapshot.
    pub fn finish(&mut self) {
        self.graph.runs += 1;
        self.prev = None;
        self.store.save(&self.app, &self.flow, &self.graph);
        info!(
            "🕸️ [FlowGraph] persisted {} nodes / {} transitions for {}/{}",
            self.graph.nodes.len(),
            self.graph.edges.values().map(|m| m.len()).sum::<usize>(),
            self.app,
            self.flow
        );
    }
}

fn token_set(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let inter = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    inter / union
}

/// Infer a candidate plan for a bare goal: pick the assertion node closest
/// to the goal, BFS from the roots following highest-weight edges first,
/// then render the recovered path as steps.
pub fn infer_plan(graph: &FlowGraph, app: &str, goal: &str) -> Option<ActionPlan> {
    let goal_tokens = token_set(goal);

    let mut asserts: Vec<(String, String, f64)> = graph
        .nodes
        .keys()
        .filter_map(|tok| tok.strip_prefix("ASSERT_TEXT:").map(|text| (tok.clone(), text.to_string())))
        .map(|(tok, text)| {
            let score = jaccard(&goal_tokens, &token_set(&text));
            (tok, text, score)
        })
        .filter(|(_, _, score)| *score > 0.0)
        .collect();
    asserts.sort_by(|a, b| {
        b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal).then_with(|| a.0.cmp(&b.0))
    });
    let (target, target_text, _) = asserts.into_iter().next()?;

    // Roots: zero in-degree, else every node.
    let mut indegree: HashMap<&str, u32> = graph.nodes.keys().map(|k| (k.as_str(), 0)).collect();
    for outs in graph.edges.values() {
        for to in outs.keys() {
            *indegree.entry(to.as_str()).or_insert(0) += 1;
        }
    }
    let mut roots: Vec<String> = graph
        .nodes
        .keys()
        .filter(|k| indegree.get(k.as_str()).copied().unwrap_or(0) == 0)
        .cloned()
        .collect();
    if roots.is_empty() {
        roots = graph.nodes.keys().cloned().collect();
    }
    roots.sort_by(|a, b| {
        graph
            .nodes
            .get(b)
            .cmp(&graph.nodes.get(a))
            .then_with(|| a.cmp(b))
    });

    // BFS with predecessor pointers, heaviest edges expanded first.
    let mut visited: HashSet<String> = roots.iter().cloned().collect();
    let mut pred: HashMap<String, String> = HashMap::new();
    let mut queue: VecDeque<String> = roots.into_iter().collect();
    while let Some(current) = queue.pop_front() {
        if current == target {
            break;
        }
        let Some(outs) = graph.edges.get(&current) else { continue };
        let mut ordered: Vec<(&String, &u32)> = outs.iter().collect();
        ordered.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        for (next, _) in ordered {
            if visited.insert(next.clone()) {
                pred.insert(next.clone(), current.clone());
                queue.push_back(next.clone());
            }
        }
    }
    if !visited.contains(&target) {
        return None;
    }

    // Walk predecessors back to a root, then reverse.
    let mut path = vec![target.clone()];
    while let Some(prev) = pred.get(path.last().unwrap()) {
        path.push(prev.clone());
    }
    path.reverse();

    let mut steps = Vec::new();
    for token in &path {
        let Some((kind, hint)) = token.split_once(':') else { continue };
        match kind {
            "TAP" => steps.push(Step::new(StepType::Tap, Some(hint), None)),
            "WAIT_TEXT" => steps.push(Step::new(StepType::WaitText, Some(hint), None)),
            "INPUT_TEXT" => steps.push(Step::new(StepType::InputText, Some(hint), Some(""))),
            _ => {}
        }
    }
    steps.push(Step::new(StepType::AssertText, Some(&target_text), None));

    let plan = ActionPlan::new(&format!("inferred: {}", goal), app, steps);
    info!("🧭 [FlowGraph] inferred {} steps toward '{}'", plan.steps.len(), target_text);
    Some(plan)
}
