mod artifacts;
mod candidates;
mod config;
mod dispatcher;
mod driver;
mod error;
#[cfg(test)]
mod fake_device;
mod flow_graph;
mod handlers;
mod llm_gateway;
mod plan_align;
mod preview;
mod resolver;
mod retry_logic;
mod runner;
mod schema;
mod section;
mod selector_memory;
mod ui_tree;
mod vision;

use anyhow::{Context, Result};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::AgentConfig;
use crate::driver::DriverClient;
use crate::flow_graph::{FlowRecorder, FlowStore};
use crate::llm_gateway::LlmClient;
use crate::resolver::Resolver;
use crate::runner::AgentRunner;
use crate::schema::ActionPlan;
use crate::selector_memory::SelectorMemory;
use crate::vision::VisionClient;

struct CliArgs {
    plan_path: Option<String>,
    goal: Option<String>,
    flow: String,
    preview: bool,
    no_learn: bool,
}

fn parse_args() -> Result<CliArgs> {
    let mut args = CliArgs {
        plan_path: None,
        goal: None,
        flow: "default".to_string(),
        preview: false,
        no_learn: false,
    };
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--goal" => args.goal = it.next(),
            "--flow" => args.flow = it.next().unwrap_or_else(|| "default".to_string()),
            "--preview" => args.preview = true,
            "--no-learn" => args.no_learn = true,
            "--help" | "-h" => {
                println!("Usage: mobile_app_agent [plan.json] [--goal \"...\"] [--flow name] [--preview] [--no-learn]");
                std::process::exit(0);
            }
            other => args.plan_path = Some(other.to_string()),
        }
    }
    Ok(args)
}

async fn load_plan(args: &CliArgs) -> Result<ActionPlan> {
    if let Some(path) = &args.plan_path {
        let raw = std::fs::read_to_string(path).context(format!("cannot read plan {}", path))?;
        let mut plan: ActionPlan = serde_json::from_str(&raw).context("plan is not valid JSON")?;
        plan.sanitize();
        return Ok(plan);
    }
    if let Some(goal) = &args.goal {
        info!("🧠 [Agent] parsing goal through the language model");
        let llm = LlmClient::new().context("a goal without a plan file needs the LLM gateway")?;
        return Ok(llm.parse_intent(goal).await?);
    }
    anyhow::bail!("nothing to do: pass a plan file or --goal \"...\"");
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("🤖 Mobile App Agent");
    println!("--------------------------------------------------");

    let args = parse_args()?;
    let config = AgentConfig::load();

    let user_plan = load_plan(&args).await?;
    let app = user_plan.effective_app();

    // Merge the learned flow graph into the plan before executing.
    let flow_store = FlowStore::open(&config.store_dir.join("flows"))?;
    let plan = if args.no_learn {
        user_plan
    } else {
        let graph = flow_store.load(&app, &args.flow);
        let goal = args.goal.clone().unwrap_or_else(|| user_plan.title.clone());
        let inferred = flow_graph::infer_plan(&graph, &app, &goal);
        plan_align::align(&user_plan, inferred.as_ref())
    };
    plan.validate()?;

    let driver: Arc<dyn driver::DeviceDriver> = Arc::new(DriverClient::new(&config.driver_url)?);
    let vision: Arc<dyn vision::VisionService> = Arc::new(VisionClient::new(&config.vision_url)?);
    let memory = Arc::new(SelectorMemory::open(&config.store_dir)?);
    let llm = match LlmClient::new() {
        Ok(client) => Some(Arc::new(client)),
        Err(e) => {
            warn!("⚠️ [Agent] LLM gateway unavailable, ties stay unbroken: {}", e);
            None
        }
    };

    let cancel = retry_logic::new_cancel_flag();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                println!("\n🛑 Stop requested; finishing the current slice...");
                cancel.store(true, Ordering::Relaxed);
            }
        });
    }

    let preview_stop = retry_logic::new_cancel_flag();
    let preview_task = if args.preview {
        Some(preview::spawn_preview(
            driver.clone(),
            config.artifacts_dir.join("preview"),
            preview_stop.clone(),
        ))
    } else {
        None
    };

    let resolver = Arc::new(Resolver::new(
        driver.clone(),
        vision,
        memory,
        llm,
        &app,
        config.clone(),
        cancel.clone(),
    ));
    let recorder = FlowRecorder::new(flow_store, &app, &args.flow);
    let mut runner = AgentRunner::new(driver, resolver, recorder, config, cancel);

    let report = runner.run(&plan).await?;

    preview_stop.store(true, Ordering::Relaxed);
    if let Some(task) = preview_task {
        let _ = task.await;
    }

    println!("--------------------------------------------------");
    for snap in &report.snapshots {
        let mark = if snap.ok { "✅" } else { "❌" };
        println!(
            "{} step {:>2} {:<11} {:<24} {}",
            mark,
            snap.step_index,
            snap.action.as_str(),
            snap.hint.as_deref().unwrap_or("-"),
            snap.notes.as_deref().unwrap_or("")
        );
    }
    println!(
        "{} '{}' · {}/{} steps ok",
        if report.ok { "✅" } else if report.stopped_by_user { "🛑" } else { "❌" },
        report.plan_title,
        report.steps_ok,
        report.steps_total
    );

    if !report.ok && !report.stopped_by_user {
        std::process::exit(1);
    }
    Ok(())
}
