use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::candidates::{self, Candidate};
use crate::config::AgentConfig;
use crate::driver::{DeviceDriver, ElementHandle, ScrollDirection};
use crate::error::AgentError;
use crate::llm_gateway::{CandidateSummary, LlmClient};
use crate::retry_logic::{is_cancelled, sleep_cancellable, CancelFlag};
use crate::schema::{Locator, LocatorStrategy};
use crate::section::{self, ScopeState, SectionRegion};
use crate::selector_memory::{is_generic, Operation, SelectorMemory};
use crate::ui_tree::{Rect, UiTree};
use crate::vision::{crop_to_region, DetectOptions, VisionCache, VisionService};

const DEFAULT_SECTION_TTL: u32 = 3;
const STABILIZE_ATTEMPTS: usize = 3;

/// Outcome of one resolution pass.
#[derive(Debug, Clone)]
pub enum Resolved {
    /// A live element plus the stable locator that re-finds it, and the
    /// screen it was resolved on (for reinforcement keying).
    Element {
        element: ElementHandle,
        locator: Locator,
        screen: String,
        via: &'static str,
    },
    /// A human completed the step during the manual-fallback window.
    Manual,
}

/// Multi-strategy locator resolution: memory → DOM token search → scoped
/// search → vision → manual fallback, short-circuiting on first success.
/// Strategies return options and chain by explicit fallthrough.
pub struct Resolver {
    driver: Arc<dyn DeviceDriver>,
    vision: Arc<dyn VisionService>,
    memory: Arc<SelectorMemory>,
    llm: Option<Arc<LlmClient>>,
    vision_cache: VisionCache,
    scope: Mutex<ScopeState>,
    app: String,
    config: AgentConfig,
    cancel: CancelFlag,
}

impl Resolver {
    pub fn new(
        driver: Arc<dyn DeviceDriver>,
        vision: Arc<dyn VisionService>,
        memory: Arc<SelectorMemory>,
        llm: Option<Arc<LlmClient>>,
        app: &str,
        config: AgentConfig,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            driver,
            vision,
            memory,
            llm,
            vision_cache: VisionCache::default(),
            scope: Mutex::new(ScopeState::new()),
            app: app.to_string(),
            config,
            cancel,
        }
    }

    fn scope_lock(&self) -> std::sync::MutexGuard<'_, ScopeState> {
        match self.scope.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Advance the section-scope lifetime; called by the engine once per
    /// executed step.
    pub fn tick_scope(&self) {
        self.scope_lock().tick();
    }

    /// Reinforce or decay the memory entry behind a resolution.
    pub fn reinforce(&self, op: Operation, hint: &str, screen: &str, locator: &Locator, success: bool) {
        if success {
            self.memory.record_success(&self.app, screen, op, hint, locator);
        } else {
            self.memory.record_failure(&self.app, screen, op, hint, locator);
        }
    }

    /// Resolve a hint to an actionable element. Returns None when every
    /// strategy, including the manual window, came up empty.
    pub async fn resolve(
        &self,
        op: Operation,
        hint: &str,
        declared_section: Option<&str>,
    ) -> Result<Option<Resolved>, AgentError> {
        let screen = self.driver.current_screen().await.unwrap_or_default();

        // 1. Selector memory, best score first.
        if let Some(resolved) = self.try_memory(op, hint, &screen).await? {
            return Ok(Some(resolved));
        }

        let tree = self.snapshot().await?;

        // Section scope: declared on the step, inferred from the hint, or
        // still active from a previous step.
        let (section_name, effective_hint) = self.establish_scope(hint, declared_section);
        let region = section_name
            .as_deref()
            .and_then(|name| section::detect_section(&tree, name, self.screen_bounds(&tree)));

        // 2./3. Token search over the tree, section-scoped when active.
        if let Some(resolved) = self
            .try_dom(op, &effective_hint, &screen, &tree, region.as_ref())
            .await?
        {
            return Ok(Some(resolved));
        }

        // 4. Vision-assisted search; failures degrade silently.
        match self
            .try_vision(&effective_hint, &screen, &tree, section_name.as_deref(), region.as_ref())
            .await
        {
            Ok(Some(resolved)) => return Ok(Some(resolved)),
            Ok(None) => {}
            Err(e) => warn!("⚠️ [Resolver] vision degraded: {}", e),
        }

        // 5. Manual fallback: wait for a human to move the screen. Only
        // mutating operations qualify; a changed screen proves nothing for
        // an assertion or a scroll.
        if matches!(op, Operation::Tap | Operation::Input | Operation::Toggle) {
            return self.manual_fallback(&tree).await;
        }
        Ok(None)
    }

    fn establish_scope(&self, hint: &str, declared: Option<&str>) -> (Option<String>, String) {
        let mut scope = self.scope_lock();
        if let Some(name) = declared {
            scope.set(name, DEFAULT_SECTION_TTL);
            return (Some(name.to_string()), hint.to_string());
        }
        if let Some((name, rest)) = section::infer_section(hint) {
            scope.set(&name, DEFAULT_SECTION_TTL);
            return (Some(name), rest);
        }
        (scope.active().map(|s| s.to_string()), hint.to_string())
    }

    fn screen_bounds(&self, tree: &UiTree) -> Rect {
        tree.get(0)
            .map(|n| n.bounds)
            .filter(|b| !b.is_empty())
            .unwrap_or(Rect { x: 0, y: 0, w: 1080, h: 1920 })
    }

    async fn snapshot(&self) -> Result<UiTree, AgentError> {
        let raw = self.driver.ui_snapshot().await?;
        UiTree::parse(&raw)
    }

    // ---- strategy 1: memory ------------------------------------------------

    async fn try_memory(
        &self,
        op: Operation,
        hint: &str,
        screen: &str,
    ) -> Result<Option<Resolved>, AgentError> {
        let remembered = self.memory.lookup(&self.app, screen, op, hint);
        for locator in remembered {
            if is_cancelled(&self.cancel) {
                return Ok(None);
            }
            match self.find_with_scrolls(&locator).await? {
                Some(element) => {
                    info!("🧲 [Resolver] memory hit for '{}' via {:?}", hint, locator.strategy);
                    return Ok(Some(Resolved::Element {
                        element,
                        locator,
                        screen: screen.to_string(),
                        via: "memory",
                    }));
                }
                None => {
                    // Remembered selector no longer resolves; let it decay.
                    self.memory.record_failure(&self.app, screen, op, hint, &locator);
                }
            }
        }
        Ok(None)
    }

    /// Find an element, scrolling down a few times when it is not yet on
    /// screen.
    async fn find_with_scrolls(&self, locator: &Locator) -> Result<Option<ElementHandle>, AgentError> {
        if let Some(el) = self.driver.find_element(locator).await? {
            return Ok(Some(el));
        }
        let mut scrolled = 0;
        for _ in 0..self.config.visibility_scrolls {
            if is_cancelled(&self.cancel) {
                break;
            }
            self.driver.scroll(ScrollDirection::Down).await?;
            scrolled += 1;
            sleep(Duration::from_millis(300)).await;
            if let Some(el) = self.driver.find_element(locator).await? {
                return Ok(Some(el));
            }
        }
        // Restore the viewport so the next strategy sees the original screen.
        for _ in 0..scrolled {
            self.driver.scroll(ScrollDirection::Up).await?;
        }
        Ok(None)
    }

    // ---- strategies 2+3: DOM token search, optionally section-scoped ------

    async fn try_dom(
        &self,
        _op: Operation,
        hint: &str,
        screen: &str,
        tree: &UiTree,
        region: Option<&SectionRegion>,
    ) -> Result<Option<Resolved>, AgentError> {
        let mut found = candidates::extract(tree, hint);
        if let Some(section) = region {
            found.retain(|c| {
                tree.get(c.clickable)
                    .map(|n| {
                        let (cx, cy) = n.bounds.center();
                        section.region.contains(cx, cy)
                    })
                    .unwrap_or(false)
            });
            candidates::rank_by_anchor(&mut found, tree, &section.anchor);
        }
        if found.is_empty() {
            return Ok(None);
        }

        let pick = self.break_ties(hint, tree, &found).await;
        let ordered: Vec<&Candidate> = match pick {
            Some(idx) => std::iter::once(&found[idx])
                .chain(found.iter().enumerate().filter(|(i, _)| *i != idx).map(|(_, c)| c))
                .collect(),
            None => found.iter().collect(),
        };

        for candidate in ordered.into_iter().take(STABILIZE_ATTEMPTS) {
            if let Some((element, locator)) = self.stabilize(tree, candidate).await? {
                debug!(
                    "🎯 [Resolver] '{}' → {:?}='{}' (score {}, role {})",
                    hint,
                    locator.strategy,
                    locator.value,
                    candidate.score,
                    candidate.role.as_str()
                );
                return Ok(Some(Resolved::Element {
                    element,
                    locator,
                    screen: screen.to_string(),
                    via: "dom",
                }));
            }
        }
        Ok(None)
    }

    /// When the top candidates tie, ask the language model to pick; silence
    /// or failure keeps the original order.
    async fn break_ties(&self, hint: &str, tree: &UiTree, found: &[Candidate]) -> Option<usize> {
        if found.len() < 2 || found[0].score != found[1].score {
            return None;
        }
        let llm = self.llm.as_ref()?;
        let summaries: Vec<CandidateSummary> = found
            .iter()
            .take(5)
            .enumerate()
            .map(|(i, c)| CandidateSummary {
                id: i.to_string(),
                label: c.label.clone(),
                role: c.role.as_str().to_string(),
            })
            .collect();
        let context = format!("{} candidates on screen", tree.len());
        match llm.disambiguate(hint, &summaries, &context).await {
            Ok(Some(id)) => id.parse().ok(),
            Ok(None) => None,
            Err(e) => {
                warn!("⚠️ [Resolver] disambiguation degraded: {}", e);
                None
            }
        }
    }

    // ---- stable expression generation --------------------------------------

    /// Convert a tree candidate into a re-findable expression. Expressions
    /// are generated in priority order and the first one that re-locates to
    /// the same live element wins; generic expressions are skipped so an
    /// index-fragile locator is never trusted or persisted.
    async fn stabilize(
        &self,
        tree: &UiTree,
        candidate: &Candidate,
    ) -> Result<Option<(ElementHandle, Locator)>, AgentError> {
        let node = match tree.get(candidate.clickable) {
            Some(n) => n,
            None => return Ok(None),
        };
        let reference = ElementHandle {
            handle: String::new(),
            id: node.id.clone(),
            class: node.class.clone(),
            text: node.text.clone(),
            desc: node.desc.clone(),
            checkable: node.checkable,
            checked: node.checked,
            bounds: node.bounds,
        };
        let label = tree.get(candidate.node).map(|n| n.label().to_string()).unwrap_or_default();

        let mut exprs: Vec<Locator> = Vec::new();
        if !node.id.is_empty() {
            exprs.push(Locator::new(LocatorStrategy::Id, &node.id));
        }
        if !node.desc.is_empty() {
            exprs.push(Locator::new(LocatorStrategy::Desc, &node.desc));
        }
        if !node.text.is_empty() {
            exprs.push(Locator::new(LocatorStrategy::Text, &node.text));
            exprs.push(Locator::new(LocatorStrategy::TextCi, &node.text.to_lowercase()));
        }
        if !label.is_empty() {
            exprs.push(Locator::new(LocatorStrategy::Path, &format!("near-text:{}", label)));
        }

        let exprs: Vec<Locator> =
            exprs.into_iter().filter(|l| !is_generic(l.strategy, &l.value)).collect();
        for (i, locator) in exprs.iter().enumerate() {
            if let Some(element) = self.driver.find_element(locator).await? {
                if element.same_element(&reference) {
                    let mut chosen = locator.clone();
                    // The remaining expressions survive as fallbacks.
                    chosen.alternates =
                        exprs.iter().skip(i + 1).map(|l| l.value.clone()).collect();
                    return Ok(Some((element, chosen)));
                }
            }
        }
        Ok(None)
    }

    // ---- strategy 4: vision -------------------------------------------------

    async fn try_vision(
        &self,
        hint: &str,
        screen: &str,
        tree: &UiTree,
        section_name: Option<&str>,
        region: Option<&SectionRegion>,
    ) -> Result<Option<Resolved>, AgentError> {
        let fingerprint = tree.fingerprint();
        let section_key = section_name.unwrap_or("");

        let result = match self.vision_cache.get(&fingerprint, section_key) {
            Some(cached) => cached,
            None => {
                let shot = self.driver.screenshot().await?;
                let bytes = match region {
                    Some(r) => crop_to_region(&shot, &r.region),
                    None => shot,
                };
                let detected = self
                    .vision
                    .detect(&bytes, &DetectOptions { query: Some(hint.to_string()) })
                    .await?;
                self.vision_cache.put(&fingerprint, section_key, detected.clone());
                detected
            }
        };

        let tokens = candidates::significant_tokens(hint);
        let hint_lc = hint.to_lowercase();
        let best = result
            .elements
            .iter()
            .filter(|d| {
                let text = d.text.to_lowercase();
                !text.is_empty()
                    && (text == hint_lc
                        || text.contains(&hint_lc)
                        || tokens.iter().any(|t| text.contains(t.as_str())))
            })
            .max_by(|a, b| a.score.partial_cmp(&b.score).unwrap_or(std::cmp::Ordering::Equal));

        let detection = match best {
            Some(d) => d,
            None => return Ok(None),
        };

        // Map the detection center back to full-screen coordinates when the
        // shot was section-cropped, then intersect with the tree.
        let (mut cx, mut cy) = detection.bounds().center();
        if let Some(r) = region {
            cx += r.region.x;
            cy += r.region.y;
        }
        let node_idx = match tree.node_at_point(cx, cy) {
            Some(idx) => idx,
            None => return Ok(None),
        };
        let clickable = tree.nearest_clickable(node_idx);
        let candidate = Candidate {
            node: node_idx,
            clickable,
            label: detection.text.clone(),
            role: crate::candidates::Role::Other,
            score: (detection.score * 100.0) as u32,
        };
        if let Some((element, locator)) = self.stabilize(tree, &candidate).await? {
            info!("👁️ [Resolver] vision located '{}' at ({}, {})", hint, cx, cy);
            return Ok(Some(Resolved::Element {
                element,
                locator,
                screen: screen.to_string(),
                via: "vision",
            }));
        }
        Ok(None)
    }

    // ---- strategy 5: manual fallback ---------------------------------------

    /// Surface "action required" and poll the UI-state fingerprint for a
    /// bounded window; a changed screen counts as the human having completed
    /// the action.
    async fn manual_fallback(&self, tree: &UiTree) -> Result<Option<Resolved>, AgentError> {
        info!(
            "✋ [Resolver] action required: waiting up to {}ms for manual completion",
            self.config.manual_window_ms
        );
        let initial = tree.fingerprint();
        let mut waited = 0u64;
        while waited < self.config.manual_window_ms {
            if !sleep_cancellable(500, &self.cancel).await {
                return Ok(None);
            }
            waited += 500;
            let current = match self.snapshot().await {
                Ok(t) => t.fingerprint(),
                Err(_) => continue,
            };
            if current != initial {
                info!("✅ [Resolver] screen changed during manual window");
                return Ok(Some(Resolved::Manual));
            }
        }
        Ok(None)
    }

    // ---- visibility probe (IF_VISIBLE / waits) ------------------------------

    /// Poll for the query text, in short slices, up to `timeout_ms`.
    pub async fn probe_visible(&self, query: &str, timeout_ms: u64) -> Result<bool, AgentError> {
        let mut waited = 0u64;
        loop {
            if is_cancelled(&self.cancel) {
                return Ok(false);
            }
            if let Ok(tree) = self.snapshot().await {
                if tree.contains_text(query) {
                    return Ok(true);
                }
            }
            if waited >= timeout_ms {
                return Ok(false);
            }
            if !sleep_cancellable(300, &self.cancel).await {
                return Ok(false);
            }
            waited += 300;
        }
    }
}
