use tracing::warn;

use crate::error::AgentError;
use crate::handlers::{self, RunContext};
use crate::retry_logic::is_cancelled;
use crate::schema::{ActionPlan, Step, StepOutcome, StepType};

/// Route one step to its handler and normalize the result: handler errors
/// become failed outcomes (with the error as the note), except fatal
/// configuration errors, which propagate and abort the run.
pub async fn dispatch(
    ctx: &RunContext,
    plan: &ActionPlan,
    step: &Step,
) -> Result<StepOutcome, AgentError> {
    if is_cancelled(&ctx.cancel) {
        return Ok(StepOutcome::cancelled());
    }

    let result = match step.step_type {
        StepType::LaunchApp => handlers::handle_launch(ctx, step).await,
        StepType::Tap => handlers::handle_tap(ctx, step).await,
        StepType::InputText => handlers::handle_input(ctx, step).await,
        StepType::ScrollTo => handlers::handle_scroll_to(ctx, step).await,
        StepType::WaitText => handlers::handle_wait_text(ctx, step).await,
        StepType::AssertText => handlers::handle_assert_text(ctx, step).await,
        StepType::Check => handlers::handle_check(ctx, step).await,
        StepType::Slide => handlers::handle_slide(ctx, step).await,
        StepType::WaitOtp => handlers::handle_wait_otp(ctx, step).await,
        StepType::Back => handlers::handle_back(ctx, step).await,
        StepType::Sleep => handlers::handle_sleep(ctx, step).await,
        StepType::Label => Ok(handlers::handle_label(step)),
        StepType::Goto => handlers::handle_goto(plan, step),
        StepType::IfVisible => handlers::handle_if_visible(ctx, plan, step).await,
    };

    match result {
        Ok(outcome) => Ok(outcome),
        Err(e) if e.is_fatal() => Err(e),
        Err(e) => {
            if is_cancelled(&ctx.cancel) {
                return Ok(StepOutcome::cancelled());
            }
            warn!("❌ [Agent] step {} ({}) failed: {}", step.index, step.step_type.as_str(), e);
            Ok(StepOutcome::failure(&e.to_string()))
        }
    }
}
