use crate::ui_tree::{Rect, UiTree};

/// Transient "which part of the screen" scope with a step-count lifetime.
#[derive(Debug, Clone)]
pub struct SectionScope {
    pub name: String,
    ttl: u32,
    /// The step that set the scope does not consume lifetime.
    fresh: bool,
}

#[derive(Debug, Default)]
pub struct ScopeState {
    current: Option<SectionScope>,
}

impl ScopeState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Activate a scope for the next `ttl` steps.
    pub fn set(&mut self, name: &str, ttl: u32) {
        if ttl == 0 {
            self.current = None;
            return;
        }
        self.current = Some(SectionScope { name: name.to_string(), ttl, fresh: true });
    }

    pub fn active(&self) -> Option<&str> {
        self.current.as_ref().map(|s| s.name.as_str())
    }

    /// Consume one step of lifetime; clears the scope when it expires.
    pub fn tick(&mut self) {
        if let Some(scope) = &mut self.current {
            if scope.fresh {
                scope.fresh = false;
                return;
            }
            scope.ttl -= 1;
            if scope.ttl == 0 {
                self.current = None;
            }
        }
    }
}

/// A detected screen section: the header anchor and the region it governs.
#[derive(Debug, Clone)]
pub struct SectionRegion {
    pub anchor: Rect,
    pub region: Rect,
}

/// Pull a leading section qualifier out of a hint ("from savings" →
/// section "from", hint "savings").
pub fn infer_section(hint: &str) -> Option<(String, String)> {
    let trimmed = hint.trim_start();
    for prefix in ["from", "to"] {
        if trimmed.len() > prefix.len()
            && trimmed.is_char_boundary(prefix.len())
            && trimmed[..prefix.len()].eq_ignore_ascii_case(prefix)
            && trimmed[prefix.len()..].starts_with(' ')
        {
            let rest = trimmed[prefix.len()..].trim();
            if !rest.is_empty() {
                return Some((prefix.to_string(), rest.to_string()));
            }
        }
    }
    None
}

/// Locate the section's header anchor and derive the region it governs.
/// Layout axis (stacked rows vs side-by-side columns) is chosen from the
/// nearest peer header's position.
pub fn detect_section(tree: &UiTree, name: &str, screen: Rect) -> Option<SectionRegion> {
    let name_lc = name.to_lowercase();
    let (anchor_idx, anchor_node) = tree.iter().find(|(_, n)| {
        let label = n.label().trim().to_lowercase();
        !label.is_empty()
            && (label == name_lc
                || (label.starts_with(&name_lc) && label.len() <= name_lc.len() + 12))
    })?;
    let anchor = anchor_node.bounds;
    let anchor_class = anchor_node.class.clone();

    // Peer headers share the anchor's widget class.
    let peer = tree
        .iter()
        .filter(|(i, n)| {
            *i != anchor_idx
                && n.class == anchor_class
                && !n.label().trim().is_empty()
                && n.label().trim().to_lowercase() != name_lc
        })
        .map(|(_, n)| n.bounds)
        .min_by(|a, b| {
            a.center_distance(&anchor)
                .partial_cmp(&b.center_distance(&anchor))
                .unwrap_or(std::cmp::Ordering::Equal)
        });

    let region = match peer {
        None => Rect {
            x: screen.x,
            y: anchor.y,
            w: screen.w,
            h: screen.y + screen.h - anchor.y,
        },
        Some(peer) => {
            let (acx, acy) = anchor.center();
            let (pcx, pcy) = peer.center();
            let horizontal = (pcy - acy).abs() <= (pcx - acx).abs();
            if horizontal {
                // Side-by-side columns: the section owns its column.
                if pcx > acx {
                    Rect { x: screen.x, y: screen.y, w: peer.x - screen.x, h: screen.h }
                } else {
                    Rect {
                        x: anchor.x,
                        y: screen.y,
                        w: screen.x + screen.w - anchor.x,
                        h: screen.h,
                    }
                }
            } else {
                // Stacked rows: from this header down to the next one.
                if pcy > acy {
                    Rect { x: screen.x, y: anchor.y, w: screen.w, h: peer.y - anchor.y }
                } else {
                    Rect {
                        x: screen.x,
                        y: anchor.y,
                        w: screen.w,
                        h: screen.y + screen.h - anchor.y,
                    }
                }
            }
        }
    };

    Some(SectionRegion { anchor, region })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scope_ttl_is_exact() {
        let mut scope = ScopeState::new();
        scope.set("from", 3);
        scope.tick(); // the step that set the scope does not consume TTL
        for _ in 0..3 {
            assert_eq!(scope.active(), Some("from"));
            scope.tick();
        }
        assert_eq!(scope.active(), None);
    }

    #[test]
    fn test_scope_tick_without_scope_is_noop() {
        let mut scope = ScopeState::new();
        scope.tick();
        assert_eq!(scope.active(), None);
    }

    #[test]
    fn test_infer_section_from_hint() {
        let (section, rest) = infer_section("from Savings account").unwrap();
        assert_eq!(section, "from");
        assert_eq!(rest, "Savings account");
        assert!(infer_section("LOGIN").is_none());
    }

    fn header(text: &str, x: i32, y: i32) -> serde_json::Value {
        json!({
            "class": "TextView",
            "text": text,
            "bounds": {"x": x, "y": y, "w": 200, "h": 40}
        })
    }

    #[test]
    fn test_detect_vertical_sections() {
        let doc = json!({
            "class": "FrameLayout",
            "bounds": {"x": 0, "y": 0, "w": 1080, "h": 1920},
            "children": [header("From", 40, 200), header("To", 40, 900)]
        });
        let tree = UiTree::parse(&doc.to_string()).unwrap();
        let screen = Rect { x: 0, y: 0, w: 1080, h: 1920 };
        let section = detect_section(&tree, "from", screen).unwrap();
        // "From" owns the rows between the two headers.
        assert_eq!(section.region.y, 200);
        assert_eq!(section.region.h, 700);
        assert_eq!(section.region.w, 1080);
    }

    #[test]
    fn test_detect_horizontal_sections() {
        let doc = json!({
            "class": "FrameLayout",
            "bounds": {"x": 0, "y": 0, "w": 1080, "h": 1920},
            "children": [header("From", 40, 200), header("To", 600, 200)]
        });
        let tree = UiTree::parse(&doc.to_string()).unwrap();
        let screen = Rect { x: 0, y: 0, w: 1080, h: 1920 };
        let section = detect_section(&tree, "from", screen).unwrap();
        // "From" owns the left column, up to the "To" header.
        assert_eq!(section.region.x, 0);
        assert_eq!(section.region.w, 600);
        assert_eq!(section.region.h, 1920);
    }

    #[test]
    fn test_detect_section_absent() {
        let doc = json!({"class": "FrameLayout"});
        let tree = UiTree::parse(&doc.to_string()).unwrap();
        let screen = Rect { x: 0, y: 0, w: 1080, h: 1920 };
        assert!(detect_section(&tree, "from", screen).is_none());
    }
}
