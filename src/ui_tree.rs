use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::AgentError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

impl Rect {
    pub fn center(&self) -> (i32, i32) {
        (self.x + self.w / 2, self.y + self.h / 2)
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.x && x < self.x + self.w && y >= self.y && y < self.y + self.h
    }

    pub fn area(&self) -> i64 {
        self.w as i64 * self.h as i64
    }

    pub fn is_empty(&self) -> bool {
        self.w <= 0 || self.h <= 0
    }

    pub fn center_distance(&self, other: &Rect) -> f64 {
        let (ax, ay) = self.center();
        let (bx, by) = other.center();
        (((ax - bx) as f64).powi(2) + ((ay - by) as f64).powi(2)).sqrt()
    }
}

/// Wire shape of one node in the driver's UI snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RawNode {
    #[serde(default)]
    id: String,
    #[serde(default)]
    class: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    desc: String,
    #[serde(default)]
    clickable: bool,
    #[serde(default)]
    checkable: bool,
    #[serde(default)]
    checked: bool,
    #[serde(default)]
    bounds: Rect,
    #[serde(default)]
    children: Vec<RawNode>,
}

/// One attributed node, flattened into the tree arena.
#[derive(Debug, Clone, Default)]
pub struct UiNode {
    pub id: String,
    pub class: String,
    pub text: String,
    pub desc: String,
    pub clickable: bool,
    pub checkable: bool,
    pub checked: bool,
    pub bounds: Rect,
    pub parent: Option<usize>,
}

impl UiNode {
    /// Visible label: text, else accessibility description.
    pub fn label(&self) -> &str {
        if !self.text.is_empty() {
            &self.text
        } else {
            &self.desc
        }
    }
}

/// A parsed UI snapshot: nodes in depth-first order with parent links.
#[derive(Debug, Clone, Default)]
pub struct UiTree {
    nodes: Vec<UiNode>,
}

impl UiTree {
    /// Parse the driver's JSON snapshot text.
    pub fn parse(text: &str) -> Result<Self, AgentError> {
        let root: RawNode = serde_json::from_str(text)?;
        let mut tree = UiTree::default();
        tree.flatten(&root, None);
        Ok(tree)
    }

    fn flatten(&mut self, raw: &RawNode, parent: Option<usize>) {
        let idx = self.nodes.len();
        self.nodes.push(UiNode {
            id: raw.id.clone(),
            class: raw.class.clone(),
            text: raw.text.clone(),
            desc: raw.desc.clone(),
            clickable: raw.clickable,
            checkable: raw.checkable,
            checked: raw.checked,
            bounds: raw.bounds,
            parent,
        });
        for child in &raw.children {
            self.flatten(child, Some(idx));
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&UiNode> {
        self.nodes.get(idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &UiNode)> {
        self.nodes.iter().enumerate()
    }

    /// Ancestor indices from the node's parent up to the root.
    pub fn ancestors(&self, idx: usize) -> Vec<usize> {
        let mut out = Vec::new();
        let mut cur = self.nodes.get(idx).and_then(|n| n.parent);
        while let Some(p) = cur {
            out.push(p);
            cur = self.nodes[p].parent;
        }
        out
    }

    /// The node itself if clickable, else its nearest clickable ancestor,
    /// else the node itself.
    pub fn nearest_clickable(&self, idx: usize) -> usize {
        if self.nodes.get(idx).map(|n| n.clickable).unwrap_or(false) {
            return idx;
        }
        for p in self.ancestors(idx) {
            if self.nodes[p].clickable {
                return p;
            }
        }
        idx
    }

    pub fn find<F: Fn(&UiNode) -> bool>(&self, pred: F) -> Vec<usize> {
        self.iter().filter(|(_, n)| pred(n)).map(|(i, _)| i).collect()
    }

    /// Smallest clickable node containing the point; falls back to the
    /// smallest node of any kind.
    pub fn node_at_point(&self, x: i32, y: i32) -> Option<usize> {
        let hit = |clickable_only: bool| {
            self.iter()
                .filter(|(_, n)| {
                    (!clickable_only || n.clickable)
                        && !n.bounds.is_empty()
                        && n.bounds.contains(x, y)
                })
                .min_by_key(|(_, n)| n.bounds.area())
                .map(|(i, _)| i)
        };
        hit(true).or_else(|| hit(false))
    }

    /// True when the query appears (case-insensitive) in any node text or
    /// description.
    pub fn contains_text(&self, query: &str) -> bool {
        let q = query.to_lowercase();
        self.nodes
            .iter()
            .any(|n| n.text.to_lowercase().contains(&q) || n.desc.to_lowercase().contains(&q))
    }

    /// Stable fingerprint of the on-screen state.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for n in &self.nodes {
            hasher.update(n.id.as_bytes());
            hasher.update(n.class.as_bytes());
            hasher.update(n.text.as_bytes());
            hasher.update(n.desc.as_bytes());
            hasher.update(format!("{},{},{},{}", n.bounds.x, n.bounds.y, n.bounds.w, n.bounds.h));
        }
        hex::encode(hasher.finalize())[..16].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    pub fn sample_tree() -> UiTree {
        let doc = json!({
            "class": "FrameLayout",
            "bounds": {"x": 0, "y": 0, "w": 1080, "h": 1920},
            "children": [
                {
                    "class": "LinearLayout",
                    "clickable": true,
                    "id": "com.example:id/login_row",
                    "bounds": {"x": 0, "y": 100, "w": 1080, "h": 200},
                    "children": [
                        {
                            "class": "TextView",
                            "text": "LOGIN",
                            "bounds": {"x": 40, "y": 150, "w": 400, "h": 100}
                        }
                    ]
                },
                {
                    "class": "Switch",
                    "id": "com.example:id/remember_me",
                    "checkable": true,
                    "checked": true,
                    "clickable": true,
                    "bounds": {"x": 0, "y": 400, "w": 200, "h": 100}
                }
            ]
        });
        UiTree::parse(&doc.to_string()).unwrap()
    }

    #[test]
    fn test_parse_and_parent_links() {
        let tree = sample_tree();
        assert_eq!(tree.len(), 4);
        let text_idx = tree.find(|n| n.text == "LOGIN")[0];
        assert_eq!(tree.get(text_idx).unwrap().parent, Some(1));
    }

    #[test]
    fn test_nearest_clickable_walks_up() {
        let tree = sample_tree();
        let text_idx = tree.find(|n| n.text == "LOGIN")[0];
        let clickable = tree.nearest_clickable(text_idx);
        assert_eq!(tree.get(clickable).unwrap().id, "com.example:id/login_row");
    }

    #[test]
    fn test_node_at_point_prefers_smallest_clickable() {
        let tree = sample_tree();
        let idx = tree.node_at_point(100, 180).unwrap();
        assert_eq!(tree.get(idx).unwrap().id, "com.example:id/login_row");
    }

    #[test]
    fn test_fingerprint_tracks_content() {
        let tree = sample_tree();
        let fp1 = tree.fingerprint();
        let doc = json!({"class": "FrameLayout", "text": "changed"});
        let other = UiTree::parse(&doc.to_string()).unwrap();
        assert_ne!(fp1, other.fingerprint());
        assert_eq!(fp1, sample_tree().fingerprint());
    }

    #[test]
    fn test_contains_text_case_insensitive() {
        let tree = sample_tree();
        assert!(tree.contains_text("login"));
        assert!(!tree.contains_text("logout"));
    }
}
