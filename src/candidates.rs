use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::HashSet;

use crate::ui_tree::{Rect, UiTree};

static STOP_WORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "the", "and", "for", "with", "from", "into", "onto", "then", "click", "tap", "press",
        "open", "goto", "button", "icon", "field", "menu", "item", "page", "screen", "option",
    ]
    .into_iter()
    .collect()
});

/// Significant words of a hint: ≥3 letters, lowercased, stop-words removed.
pub fn significant_tokens(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    text.split(|c: char| !c.is_alphanumeric())
        .map(|w| w.to_lowercase())
        .filter(|w| w.len() >= 3 && !STOP_WORDS.contains(w.as_str()))
        .filter(|w| seen.insert(w.clone()))
        .collect()
}

/// Coarse role of a clickable candidate, derived from container hints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    BottomNav,
    Tab,
    Button,
    Chip,
    ListItem,
    DialogButton,
    Other,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::BottomNav => "bottom_nav",
            Role::Tab => "tab",
            Role::Button => "button",
            Role::Chip => "chip",
            Role::ListItem => "list_item",
            Role::DialogButton => "dialog_button",
            Role::Other => "other",
        }
    }
}

/// One scored clickable candidate for a hint.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// The node whose text/description matched.
    pub node: usize,
    /// Its nearest clickable ancestor (possibly the node itself).
    pub clickable: usize,
    pub label: String,
    pub role: Role,
    pub score: u32,
}

const SCORE_FLOOR: u32 = 40;

fn score_label(label: &str, hint: &str, hint_tokens: &[String]) -> u32 {
    let label_lc = label.to_lowercase();
    let hint_lc = hint.to_lowercase();
    if label_lc == hint_lc {
        return 100;
    }
    if !hint_lc.is_empty() && label_lc.contains(&hint_lc) {
        return 85;
    }
    let label_tokens: HashSet<String> = significant_tokens(label).into_iter().collect();
    if hint_tokens.is_empty() || label_tokens.is_empty() {
        return 0;
    }
    let overlap = hint_tokens.iter().filter(|t| label_tokens.contains(*t)).count();
    if overlap == 0 {
        return 0;
    }
    if overlap == hint_tokens.len() {
        return 75;
    }
    45 + 5 * overlap as u32
}

fn classify_role(tree: &UiTree, clickable: usize) -> Role {
    let mut chain = vec![clickable];
    chain.extend(tree.ancestors(clickable));

    let mut in_list = false;
    let mut in_dialog = false;
    for idx in &chain {
        let node = match tree.get(*idx) {
            Some(n) => n,
            None => continue,
        };
        let id = node.id.to_lowercase();
        let class = node.class.to_lowercase();
        if id.contains("bottom_nav") || class.contains("bottomnavigation") {
            return Role::BottomNav;
        }
        if id.contains("tab") || class.contains("tablayout") || class.contains("tabitem") {
            return Role::Tab;
        }
        if class.contains("chip") {
            return Role::Chip;
        }
        if class.contains("recycler") || class.contains("listview") {
            in_list = true;
        }
        if id.contains("dialog") || class.contains("dialog") || class.contains("alert") {
            in_dialog = true;
        }
    }

    let self_class = tree.get(clickable).map(|n| n.class.to_lowercase()).unwrap_or_default();
    if in_dialog && self_class.contains("button") {
        return Role::DialogButton;
    }
    if self_class.contains("button") {
        return Role::Button;
    }
    if in_list {
        return Role::ListItem;
    }
    Role::Other
}

/// Collect and rank clickable candidates for a hint against the tree.
/// Ties keep discovery (document) order.
pub fn extract(tree: &UiTree, hint: &str) -> Vec<Candidate> {
    let hint_tokens = significant_tokens(hint);
    let hint_lc = hint.to_lowercase();

    let mut seen_clickables = HashSet::new();
    let mut out = Vec::new();

    for (idx, node) in tree.iter() {
        let label = node.label();
        if label.is_empty() {
            continue;
        }
        let label_lc = label.to_lowercase();
        let matched = label_lc == hint_lc
            || label_lc.contains(&hint_lc) && !hint_lc.is_empty()
            || hint_tokens.iter().any(|t| label_lc.contains(t.as_str()));
        if !matched {
            continue;
        }
        let score = score_label(label, hint, &hint_tokens);
        if score < SCORE_FLOOR {
            continue;
        }
        let clickable = tree.nearest_clickable(idx);
        if !seen_clickables.insert(clickable) {
            continue;
        }
        out.push(Candidate {
            node: idx,
            clickable,
            label: label.to_string(),
            role: classify_role(tree, clickable),
            score,
        });
    }

    out.sort_by_key(|c| std::cmp::Reverse(c.score));
    out
}

/// Re-rank candidates by distance to a section header anchor instead of by
/// text score; used while a section scope is active.
pub fn rank_by_anchor(candidates: &mut [Candidate], tree: &UiTree, anchor: &Rect) {
    candidates.sort_by(|a, b| {
        let da = distance_to_anchor(tree, a, anchor);
        let db = distance_to_anchor(tree, b, anchor);
        da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
    });
}

fn distance_to_anchor(tree: &UiTree, candidate: &Candidate, anchor: &Rect) -> f64 {
    tree.get(candidate.clickable)
        .map(|n| n.bounds.center_distance(anchor))
        .unwrap_or(f64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tree_with_labels(labels: &[(&str, i32)]) -> UiTree {
        let children: Vec<_> = labels
            .iter()
            .map(|(label, y)| {
                json!({
                    "class": "Button",
                    "clickable": true,
                    "text": label,
                    "bounds": {"x": 0, "y": y, "w": 200, "h": 50}
                })
            })
            .collect();
        let doc = json!({"class": "FrameLayout", "children": children});
        UiTree::parse(&doc.to_string()).unwrap()
    }

    #[test]
    fn test_exact_match_scores_100_and_is_deterministic() {
        let tree = tree_with_labels(&[("Transfer money", 0), ("LOGIN", 100)]);
        for _ in 0..3 {
            let candidates = extract(&tree, "LOGIN");
            assert_eq!(candidates[0].label, "LOGIN");
            assert_eq!(candidates[0].score, 100);
        }
    }

    #[test]
    fn test_scoring_tiers() {
        let tree = tree_with_labels(&[
            ("Pay now instantly", 0),   // contains hint
            ("Now pay later fees", 50), // hint tokens subset of label tokens
        ]);
        let candidates = extract(&tree, "pay now");
        assert_eq!(candidates[0].score, 85);
        assert_eq!(candidates[1].score, 75);
    }

    #[test]
    fn test_partial_overlap_and_floor() {
        let tree = tree_with_labels(&[("send international wire", 0), ("Settings", 50)]);
        let candidates = extract(&tree, "send domestic transfer");
        // one token overlap ("send") → 45 + 5
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].score, 50);
    }

    #[test]
    fn test_significant_tokens_filter() {
        let tokens = significant_tokens("Tap the LOGIN button to continue");
        assert_eq!(tokens, vec!["login", "continue"]);
    }

    #[test]
    fn test_role_classification_from_containers() {
        let doc = json!({
            "class": "FrameLayout",
            "children": [{
                "class": "BottomNavigationView",
                "children": [{
                    "class": "TextView",
                    "clickable": true,
                    "text": "Home",
                    "bounds": {"x": 0, "y": 1800, "w": 100, "h": 80}
                }]
            }]
        });
        let tree = UiTree::parse(&doc.to_string()).unwrap();
        let candidates = extract(&tree, "Home");
        assert_eq!(candidates[0].role, Role::BottomNav);
    }

    #[test]
    fn test_rank_by_anchor_overrides_text_order() {
        let tree = tree_with_labels(&[("Account", 10), ("Account", 900)]);
        let mut candidates = extract(&tree, "Account");
        let anchor = Rect { x: 0, y: 880, w: 200, h: 30 };
        rank_by_anchor(&mut candidates, &tree, &anchor);
        let first = tree.get(candidates[0].clickable).unwrap();
        assert_eq!(first.bounds.y, 900);
    }
}
