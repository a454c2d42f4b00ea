use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use tracing::info;

use crate::config::AgentConfig;
use crate::driver::{DeviceDriver, ElementHandle, ScrollDirection};
use crate::error::AgentError;
use crate::resolver::{Resolved, Resolver};
use crate::retry_logic::{is_cancelled, sleep_cancellable, with_retry, CancelFlag};
use crate::schema::{ActionPlan, Step, StepOutcome};
use crate::selector_memory::Operation;
use crate::ui_tree::UiTree;

/// Everything a handler needs, passed explicitly per run. No ambient state.
pub struct RunContext {
    pub driver: Arc<dyn DeviceDriver>,
    pub resolver: Arc<Resolver>,
    pub config: AgentConfig,
    pub cancel: CancelFlag,
}

/// What to do with a resolved element.
enum ElementAction {
    Click,
    Input(String),
    Toggle(bool),
    Slide,
}

async fn perform(
    ctx: &RunContext,
    element: &ElementHandle,
    action: &ElementAction,
) -> Result<Option<String>, AgentError> {
    match action {
        ElementAction::Click => {
            ctx.driver.click(element).await?;
            Ok(None)
        }
        ElementAction::Input(value) => {
            ctx.driver.clear(element).await?;
            ctx.driver.type_text(element, value).await?;
            Ok(None)
        }
        ElementAction::Toggle(desired) => {
            if !element.checkable {
                return Err(AgentError::Execution(format!(
                    "'{}' is not a checkable element",
                    element.id
                )));
            }
            if element.checked == *desired {
                // Idempotent: the switch is already where we want it.
                Ok(Some("already in desired state".to_string()))
            } else {
                ctx.driver.click(element).await?;
                Ok(None)
            }
        }
        ElementAction::Slide => {
            let b = element.bounds;
            let (_, cy) = b.center();
            ctx.driver.swipe((b.x + 10, cy), (b.x + b.w - 10, cy), 400).await?;
            Ok(None)
        }
    }
}

/// Resolve → act → reinforce, inside the handler retry budget. A failed
/// action decays the memory entry before the retry re-resolves.
async fn resolve_and_act(
    ctx: &RunContext,
    op: Operation,
    hint: &str,
    section: Option<&str>,
    action: ElementAction,
) -> Result<StepOutcome, AgentError> {
    let action = &action;
    with_retry(hint, ctx.config.step_retries, ctx.config.retry_delay_ms, &ctx.cancel, || async move {
        match ctx.resolver.resolve(op, hint, section).await? {
            None => Err(AgentError::Execution(format!("could not resolve '{}'", hint))),
            Some(Resolved::Manual) => {
                Ok(StepOutcome::success_with(None, Some("completed manually".to_string())))
            }
            Some(Resolved::Element { element, locator, screen, via }) => {
                match perform(ctx, &element, action).await {
                    Ok(notes) => {
                        ctx.resolver.reinforce(op, hint, &screen, &locator, true);
                        let notes = notes.or_else(|| Some(format!("via {}", via)));
                        Ok(StepOutcome::success_with(Some(locator), notes))
                    }
                    Err(e) => {
                        ctx.resolver.reinforce(op, hint, &screen, &locator, false);
                        Err(e)
                    }
                }
            }
        }
    })
    .await
}

pub async fn handle_launch(ctx: &RunContext, step: &Step) -> Result<StepOutcome, AgentError> {
    let package = step.hint().to_string();
    with_retry("launch", ctx.config.step_retries, ctx.config.retry_delay_ms, &ctx.cancel, || {
        let package = package.clone();
        async move { ctx.driver.launch_app(&package).await }
    })
    .await?;
    // Let the first screen settle.
    sleep_cancellable(1000, &ctx.cancel).await;
    Ok(StepOutcome::success())
}

pub async fn handle_tap(ctx: &RunContext, step: &Step) -> Result<StepOutcome, AgentError> {
    resolve_and_act(ctx, Operation::Tap, step.hint(), step.meta("section"), ElementAction::Click).await
}

pub async fn handle_input(ctx: &RunContext, step: &Step) -> Result<StepOutcome, AgentError> {
    let value = step
        .value
        .clone()
        .ok_or_else(|| AgentError::Config(format!("step {}: INPUT_TEXT without value", step.index)))?;
    resolve_and_act(
        ctx,
        Operation::Input,
        step.hint(),
        step.meta("section"),
        ElementAction::Input(value),
    )
    .await
}

pub async fn handle_check(ctx: &RunContext, step: &Step) -> Result<StepOutcome, AgentError> {
    let desired = !matches!(step.value.as_deref(), Some("off"));
    resolve_and_act(
        ctx,
        Operation::Toggle,
        step.hint(),
        step.meta("section"),
        ElementAction::Toggle(desired),
    )
    .await
}

pub async fn handle_slide(ctx: &RunContext, step: &Step) -> Result<StepOutcome, AgentError> {
    resolve_and_act(ctx, Operation::Tap, step.hint(), step.meta("section"), ElementAction::Slide).await
}

const SCROLL_TO_ATTEMPTS: u64 = 8;

pub async fn handle_scroll_to(ctx: &RunContext, step: &Step) -> Result<StepOutcome, AgentError> {
    let hint = step.hint();
    for _ in 0..SCROLL_TO_ATTEMPTS {
        if is_cancelled(&ctx.cancel) {
            return Ok(StepOutcome::cancelled());
        }
        let raw = ctx.driver.ui_snapshot().await?;
        if UiTree::parse(&raw)?.contains_text(hint) {
            return Ok(StepOutcome::success());
        }
        ctx.driver.scroll(ScrollDirection::Down).await?;
        if !sleep_cancellable(300, &ctx.cancel).await {
            return Ok(StepOutcome::cancelled());
        }
    }
    // Last resort: the full resolution chain (memory may know a better way).
    match ctx.resolver.resolve(Operation::Scroll, hint, step.meta("section")).await? {
        Some(_) => Ok(StepOutcome::success()),
        None => Ok(StepOutcome::failure(&format!("'{}' not reachable by scrolling", hint))),
    }
}

pub async fn handle_wait_text(ctx: &RunContext, step: &Step) -> Result<StepOutcome, AgentError> {
    let timeout = step
        .value
        .as_deref()
        .and_then(|v| v.parse().ok())
        .unwrap_or(ctx.config.wait_timeout_ms);
    wait_for_text(ctx, step.hint(), timeout).await
}

pub async fn handle_assert_text(ctx: &RunContext, step: &Step) -> Result<StepOutcome, AgentError> {
    // Assertions get a short grace window, not the full wait budget.
    wait_for_text(ctx, step.hint(), 1500).await
}

async fn wait_for_text(ctx: &RunContext, text: &str, timeout_ms: u64) -> Result<StepOutcome, AgentError> {
    if ctx.resolver.probe_visible(text, timeout_ms).await? {
        return Ok(StepOutcome::success());
    }
    if is_cancelled(&ctx.cancel) {
        return Ok(StepOutcome::cancelled());
    }
    // The plain text probe missed; give the full resolution chain one shot
    // (memory or vision may still find the element).
    if let Some(Resolved::Element { locator, .. }) =
        ctx.resolver.resolve(Operation::Assert, text, None).await?
    {
        return Ok(StepOutcome::success_with(Some(locator), None));
    }
    Ok(StepOutcome::failure(&format!("text '{}' not visible within {}ms", text, timeout_ms)))
}

static OTP_CODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{4,8}$").unwrap());

/// Wait until a one-time code lands in an editable field, either auto-filled
/// or typed by a human.
pub async fn handle_wait_otp(ctx: &RunContext, step: &Step) -> Result<StepOutcome, AgentError> {
    let timeout = step
        .value
        .as_deref()
        .and_then(|v| v.parse().ok())
        .unwrap_or(ctx.config.wait_timeout_ms);
    info!("📟 [Agent] waiting up to {}ms for a one-time code", timeout);
    let mut waited = 0u64;
    loop {
        if is_cancelled(&ctx.cancel) {
            return Ok(StepOutcome::cancelled());
        }
        let raw = ctx.driver.ui_snapshot().await?;
        let tree = UiTree::parse(&raw)?;
        let filled = tree.iter().any(|(_, n)| {
            n.class.to_lowercase().contains("edit") && OTP_CODE.is_match(n.text.trim())
        });
        if filled {
            return Ok(StepOutcome::success_with(None, Some("otp entered".to_string())));
        }
        if waited >= timeout {
            return Ok(StepOutcome::failure("no one-time code appeared"));
        }
        if !sleep_cancellable(500, &ctx.cancel).await {
            return Ok(StepOutcome::cancelled());
        }
        waited += 500;
    }
}

pub async fn handle_back(ctx: &RunContext, _step: &Step) -> Result<StepOutcome, AgentError> {
    with_retry("back", ctx.config.step_retries, ctx.config.retry_delay_ms, &ctx.cancel, || async move {
        ctx.driver.navigate_back().await
    })
    .await?;
    Ok(StepOutcome::success())
}

pub async fn handle_sleep(ctx: &RunContext, step: &Step) -> Result<StepOutcome, AgentError> {
    let ms = step.value.as_deref().and_then(|v| v.parse().ok()).unwrap_or(1000);
    if !sleep_cancellable(ms, &ctx.cancel).await {
        return Ok(StepOutcome::cancelled());
    }
    Ok(StepOutcome::success())
}

pub fn handle_label(_step: &Step) -> StepOutcome {
    // Labels are successful no-ops; they only exist as jump targets.
    StepOutcome::success()
}

pub fn handle_goto(plan: &ActionPlan, step: &Step) -> Result<StepOutcome, AgentError> {
    let label = step
        .target
        .as_deref()
        .ok_or_else(|| AgentError::Config(format!("step {}: GOTO without target", step.index)))?;
    let pc = plan.label_index(label).ok_or_else(|| {
        AgentError::Config(format!("step {}: GOTO target label '{}' not found", step.index, label))
    })?;
    Ok(StepOutcome::jump(pc))
}

pub async fn handle_if_visible(
    ctx: &RunContext,
    plan: &ActionPlan,
    step: &Step,
) -> Result<StepOutcome, AgentError> {
    let query = step
        .target
        .as_deref()
        .ok_or_else(|| AgentError::Config(format!("step {}: IF_VISIBLE without query", step.index)))?;
    let visible = ctx.resolver.probe_visible(query, ctx.config.if_visible_timeout_ms).await?;
    if is_cancelled(&ctx.cancel) {
        return Ok(StepOutcome::cancelled());
    }
    let branch = if visible { "then" } else { "else" };
    let label = step.meta(branch).ok_or_else(|| {
        AgentError::Config(format!("step {}: IF_VISIBLE missing '{}' branch", step.index, branch))
    })?;
    let pc = plan.label_index(label).ok_or_else(|| {
        AgentError::Config(format!("step {}: IF_VISIBLE label '{}' not found", step.index, label))
    })?;
    let mut outcome = StepOutcome::jump(pc);
    outcome.notes = Some(format!("'{}' {} → {}", query, if visible { "visible" } else { "absent" }, label));
    Ok(outcome)
}
