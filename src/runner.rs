use chrono::Utc;
use std::sync::Arc;
use tracing::{error, info};

use crate::artifacts::{RunArtifacts, RunReport};
use crate::config::AgentConfig;
use crate::dispatcher;
use crate::driver::DeviceDriver;
use crate::error::AgentError;
use crate::flow_graph::FlowRecorder;
use crate::handlers::RunContext;
use crate::resolver::Resolver;
use crate::retry_logic::{is_cancelled, CancelFlag};
use crate::schema::{ActionPlan, Snapshot, StepOutcome};

/// Program-counter interpreter over an ActionPlan. One worker advances the
/// counter and performs every external call; cancellation is polled each
/// cycle; session teardown runs exactly once on any exit path.
pub struct AgentRunner {
    ctx: RunContext,
    recorder: FlowRecorder,
}

impl AgentRunner {
    pub fn new(
        driver: Arc<dyn DeviceDriver>,
        resolver: Arc<Resolver>,
        recorder: FlowRecorder,
        config: AgentConfig,
        cancel: CancelFlag,
    ) -> Self {
        Self { ctx: RunContext { driver, resolver, config, cancel }, recorder }
    }

    pub async fn run(&mut self, plan: &ActionPlan) -> Result<RunReport, AgentError> {
        plan.validate()?;

        let run_id = uuid::Uuid::new_v4().to_string();
        let artifacts = RunArtifacts::create(&self.ctx.config.artifacts_dir, &run_id)?;
        info!(
            "🤖 [Agent] run {} · '{}' ({} steps) · artifacts at {}",
            run_id,
            plan.title,
            plan.steps.len(),
            artifacts.dir().display()
        );

        self.ctx.driver.start_session().await?;
        let mut snapshots = Vec::new();
        let result = self.run_inner(plan, &artifacts, &mut snapshots).await;

        // Guaranteed teardown, regardless of how the run ended.
        if let Err(e) = self.ctx.driver.stop_session().await {
            error!("⚠️ [Agent] session teardown failed: {}", e);
        }
        self.recorder.finish();

        let (ok, stopped) = result?;
        let steps_ok = snapshots.iter().filter(|s| s.ok).count();
        let report = RunReport {
            run_id,
            plan_title: plan.title.clone(),
            app: plan.effective_app(),
            ok,
            stopped_by_user: stopped,
            steps_total: snapshots.len(),
            steps_ok,
            snapshots,
        };
        artifacts.write_report(&report);
        if stopped {
            info!("🛑 [Agent] stopped by user after {} steps", report.steps_total);
        } else if ok {
            info!("✅ [Agent] run complete: {}/{} steps ok", steps_ok, report.steps_total);
        } else {
            info!("❌ [Agent] run failed: {}/{} steps ok", steps_ok, report.steps_total);
        }
        Ok(report)
    }

    async fn run_inner(
        &mut self,
        plan: &ActionPlan,
        artifacts: &RunArtifacts,
        snapshots: &mut Vec<Snapshot>,
    ) -> Result<(bool, bool), AgentError> {
        let mut pc: usize = 0;
        let mut cycles: u64 = 0;

        while pc < plan.steps.len() {
            let step = &plan.steps[pc];

            if is_cancelled(&self.ctx.cancel) {
                snapshots.push(self.snapshot_for(step, &StepOutcome::cancelled(), artifacts).await);
                return Ok((false, true));
            }

            cycles += 1;
            if cycles > self.ctx.config.max_cycles {
                let outcome = StepOutcome::failure(&format!(
                    "cycle budget of {} exhausted (likely a GOTO loop)",
                    self.ctx.config.max_cycles
                ));
                snapshots.push(self.snapshot_for(step, &outcome, artifacts).await);
                return Ok((false, false));
            }

            info!("▶️ [Agent] step {} · {} '{}'", step.index, step.step_type.as_str(), step.hint());
            let outcome = dispatcher::dispatch(&self.ctx, plan, step).await?;

            // One Snapshot per cycle, synthetic jump/branch steps included.
            snapshots.push(self.snapshot_for(step, &outcome, artifacts).await);

            if outcome.ok {
                self.recorder.observe(step);
            }
            self.ctx.resolver.tick_scope();

            if !outcome.ok {
                return Ok((false, outcome.is_cancelled()));
            }
            pc = match outcome.next_pc {
                Some(target) => target,
                None if outcome.advance => pc + 1,
                None => pc,
            };
        }
        Ok((true, false))
    }

    /// Record the step's audit trail: UI dump + screenshot are best-effort,
    /// an unreadable screen never fails the step that produced it.
    async fn snapshot_for(
        &self,
        step: &crate::schema::Step,
        outcome: &StepOutcome,
        artifacts: &RunArtifacts,
    ) -> Snapshot {
        let ui_dump = self.ctx.driver.ui_snapshot().await.unwrap_or_default();
        let screenshot = self.ctx.driver.screenshot().await.unwrap_or_default();
        let (ui_dump_path, screenshot_path) = artifacts.record_step(step.index, &ui_dump, &screenshot);
        Snapshot {
            step_index: step.index,
            action: step.step_type,
            hint: step.target.clone(),
            locator: outcome.locator.clone(),
            ui_dump_path,
            screenshot_path,
            ok: outcome.ok,
            notes: outcome.notes.clone(),
            at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake_device::{FakeDriver, FakeVision};
    use crate::flow_graph::FlowStore;
    use crate::retry_logic::new_cancel_flag;
    use crate::schema::{Step, StepType, CANCELLED_NOTE};
    use crate::selector_memory::SelectorMemory;
    use std::sync::atomic::Ordering;
    use tempfile::tempdir;

    struct Harness {
        driver: Arc<FakeDriver>,
        cancel: CancelFlag,
        runner: AgentRunner,
        _dir: tempfile::TempDir,
    }

    fn harness(driver: FakeDriver) -> Harness {
        let dir = tempdir().unwrap();
        let driver = Arc::new(driver);
        let cancel = new_cancel_flag();
        let config = AgentConfig {
            driver_url: String::new(),
            vision_url: String::new(),
            step_retries: 1,
            retry_delay_ms: 1,
            if_visible_timeout_ms: 300,
            manual_window_ms: 600,
            wait_timeout_ms: 2000,
            max_cycles: 50,
            visibility_scrolls: 1,
            store_dir: dir.path().join("store"),
            artifacts_dir: dir.path().join("runs"),
        };
        let memory = Arc::new(SelectorMemory::in_memory());
        let resolver = Arc::new(Resolver::new(
            driver.clone(),
            Arc::new(FakeVision::default()),
            memory,
            None,
            "com.example",
            config.clone(),
            cancel.clone(),
        ));
        let store = FlowStore::open(&dir.path().join("flows")).unwrap();
        let recorder = FlowRecorder::new(store, "com.example", "default");
        let runner =
            AgentRunner::new(driver.clone(), resolver, recorder, config, cancel.clone());
        Harness { driver, cancel, runner, _dir: dir }
    }

    fn login_plan() -> ActionPlan {
        ActionPlan::new(
            "login",
            "com.example",
            vec![
                Step::new(StepType::LaunchApp, Some("com.example"), None),
                Step::new(StepType::InputText, Some("username"), Some("alice")),
                Step::new(StepType::InputText, Some("password"), Some("secret")),
                Step::new(StepType::Tap, Some("LOGIN"), None),
                Step::new(StepType::WaitText, Some("Home"), None),
            ],
        )
    }

    #[tokio::test]
    async fn test_login_scenario_runs_linearly() {
        let mut h = harness(FakeDriver::login_screen());
        let report = h.runner.run(&login_plan()).await.unwrap();

        assert!(report.ok);
        assert!(!report.stopped_by_user);
        assert_eq!(report.steps_total, 5);
        assert_eq!(report.steps_ok, 5);
        let indices: Vec<u32> = report.snapshots.iter().map(|s| s.step_index).collect();
        assert_eq!(indices, vec![1, 2, 3, 4, 5]);
        assert!(report.snapshots.iter().all(|s| s.ok));

        // Both credentials were typed and the button clicked.
        assert_eq!(h.driver.typed.lock().unwrap().len(), 2);
        assert!(h.driver.clicks.lock().unwrap().contains(&"LOGIN".to_string()));
        // Teardown ran exactly once.
        assert_eq!(h.driver.session_stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_check_is_idempotent() {
        // The switch starts checked: asking for "on" must not click.
        let mut h = harness(FakeDriver::login_screen());
        let plan = ActionPlan::new(
            "check-on",
            "com.example",
            vec![Step::new(StepType::Check, Some("Remember me"), Some("on"))],
        );
        let report = h.runner.run(&plan).await.unwrap();
        assert!(report.ok);
        assert_eq!(h.driver.click_count(), 0);

        // Asking for "off" flips it with exactly one click.
        let plan = ActionPlan::new(
            "check-off",
            "com.example",
            vec![Step::new(StepType::Check, Some("Remember me"), Some("off"))],
        );
        let report = h.runner.run(&plan).await.unwrap();
        assert!(report.ok);
        assert_eq!(h.driver.click_count(), 1);
    }

    fn branch_plan() -> ActionPlan {
        ActionPlan::new(
            "branch",
            "com.example",
            vec![
                Step::new(StepType::IfVisible, Some("Offer"), None)
                    .with_meta("then", "T")
                    .with_meta("else", "F"),
                Step::new(StepType::Label, Some("T"), None),
                Step::new(StepType::Sleep, None, Some("10")),
                Step::new(StepType::Goto, Some("DONE"), None),
                Step::new(StepType::Label, Some("F"), None),
                Step::new(StepType::Sleep, None, Some("10")),
                Step::new(StepType::Label, Some("DONE"), None),
            ],
        )
    }

    #[tokio::test]
    async fn test_if_visible_takes_exactly_one_branch() {
        // "Offer" is absent on the login screen → else branch only.
        let mut h = harness(FakeDriver::login_screen());
        let report = h.runner.run(&branch_plan()).await.unwrap();
        assert!(report.ok);
        let indices: Vec<u32> = report.snapshots.iter().map(|s| s.step_index).collect();
        assert!(indices.contains(&6), "else-branch step must run: {:?}", indices);
        assert!(!indices.contains(&3), "then-branch step must not run: {:?}", indices);
        assert_eq!(indices, vec![1, 5, 6, 7]);
    }

    #[tokio::test]
    async fn test_if_visible_then_branch_when_text_present() {
        let offer = serde_json::json!({
            "class": "FrameLayout",
            "bounds": {"x": 0, "y": 0, "w": 1080, "h": 1920},
            "children": [
                {"class": "TextView", "text": "Offer", "bounds": {"x": 0, "y": 0, "w": 200, "h": 50}}
            ]
        });
        let mut screens = std::collections::HashMap::new();
        screens.insert("OfferScreen".to_string(), offer);
        let mut h = harness(FakeDriver::new("OfferScreen", screens));
        let report = h.runner.run(&branch_plan()).await.unwrap();
        assert!(report.ok);
        let indices: Vec<u32> = report.snapshots.iter().map(|s| s.step_index).collect();
        assert_eq!(indices, vec![1, 2, 3, 4, 7]);
    }

    #[tokio::test]
    async fn test_cancellation_is_a_clean_stop() {
        let mut h = harness(FakeDriver::login_screen());
        h.cancel.store(true, Ordering::Relaxed);
        let report = h.runner.run(&login_plan()).await.unwrap();
        assert!(!report.ok);
        assert!(report.stopped_by_user);
        assert_eq!(report.snapshots.len(), 1);
        assert_eq!(report.snapshots[0].notes.as_deref(), Some(CANCELLED_NOTE));
        // Teardown still ran.
        assert_eq!(h.driver.session_stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_goto_label_is_fatal() {
        let mut h = harness(FakeDriver::login_screen());
        let plan = ActionPlan::new(
            "bad",
            "com.example",
            vec![Step::new(StepType::Goto, Some("NOWHERE"), None)],
        );
        let err = h.runner.run(&plan).await.unwrap_err();
        assert!(matches!(err, AgentError::Config(_)));
    }

    #[tokio::test]
    async fn test_goto_loop_hits_cycle_guard() {
        let mut h = harness(FakeDriver::login_screen());
        let plan = ActionPlan::new(
            "loop",
            "com.example",
            vec![
                Step::new(StepType::Label, Some("L"), None),
                Step::new(StepType::Goto, Some("L"), None),
            ],
        );
        let report = h.runner.run(&plan).await.unwrap();
        assert!(!report.ok);
        assert!(!report.stopped_by_user);
        let last = report.snapshots.last().unwrap();
        assert!(last.notes.as_deref().unwrap_or("").contains("cycle budget"));
    }

    #[tokio::test]
    async fn test_failing_step_is_last_recorded() {
        let mut h = harness(FakeDriver::login_screen());
        let plan = ActionPlan::new(
            "fail",
            "com.example",
            vec![
                Step::new(StepType::AssertText, Some("LOGIN"), None),
                Step::new(StepType::AssertText, Some("Definitely absent"), None),
                Step::new(StepType::AssertText, Some("LOGIN"), None),
            ],
        );
        let report = h.runner.run(&plan).await.unwrap();
        assert!(!report.ok);
        assert_eq!(report.steps_total, 2);
        assert_eq!(report.snapshots.last().unwrap().step_index, 2);
        assert!(!report.snapshots.last().unwrap().ok);
    }
}
