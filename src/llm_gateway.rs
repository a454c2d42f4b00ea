use anyhow::Result;
use reqwest::Client;
use serde_json::{json, Value};
use std::env;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

use crate::error::AgentError;
use crate::schema::ActionPlan;

/// Summary of one candidate offered to the disambiguation oracle.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CandidateSummary {
    pub id: String,
    pub label: String,
    pub role: String,
}

/// Language-model service client. Used upstream to produce an ActionPlan
/// from free text and to break candidate ties; never required for engine
/// correctness.
#[derive(Clone)]
pub struct LlmClient {
    client: Client,
    api_key: String,
    model: String,
}

impl LlmClient {
    pub fn new() -> Result<Self, AgentError> {
        dotenv::dotenv().ok();
        let api_key = env::var("OPENAI_API_KEY")
            .map_err(|_| AgentError::Llm("OPENAI_API_KEY not set in .env".into()))?;
        let client = Client::builder()
            .no_proxy()
            .timeout(Duration::from_secs(120))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| AgentError::Llm(format!("client build failed: {}", e)))?;
        Ok(Self {
            client,
            api_key,
            model: env::var("AGENT_LLM_MODEL").unwrap_or_else(|_| "gpt-4o".to_string()),
        })
    }

    async fn post_with_retry(&self, body: &Value) -> Result<Value, AgentError> {
        let url = "https://api.openai.com/v1/chat/completions";
        let max_retries = 3;
        let mut attempt = 0;
        let mut backoff = Duration::from_secs(1);

        loop {
            attempt += 1;
            let sent = self
                .client
                .post(url)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(body)
                .send()
                .await;
            match sent {
                Ok(resp) => {
                    let status = resp.status();
                    let retryable = status.is_server_error()
                        || status == reqwest::StatusCode::TOO_MANY_REQUESTS;
                    if !retryable {
                        if !status.is_success() {
                            return Err(AgentError::Llm(format!("API error: {}", status)));
                        }
                        return resp
                            .json()
                            .await
                            .map_err(|e| AgentError::Llm(format!("bad response: {}", e)));
                    }
                    if attempt > max_retries {
                        return Err(AgentError::Llm(format!("API error after retries: {}", status)));
                    }
                }
                Err(e) => {
                    if attempt > max_retries {
                        return Err(AgentError::Llm(format!("max retries exceeded: {}", e)));
                    }
                    warn!("⚠️ [LLM] network error (attempt {}/{}): {}", attempt, max_retries, e);
                }
            }
            sleep(backoff).await;
            backoff *= 2;
        }
    }

    async fn chat(&self, system: &str, user: &str) -> Result<String, AgentError> {
        let body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
            "temperature": 0.0,
        });
        let value = self.post_with_retry(&body).await?;
        value["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| AgentError::Llm("empty completion".into()))
    }

    /// Parse a free-text goal into an ActionPlan.
    pub async fn parse_intent(&self, text: &str) -> Result<ActionPlan, AgentError> {
        let system = r#"You translate a mobile-automation request into a JSON plan.
Respond ONLY with JSON of this shape:
{"title": "...", "app": "<package or empty>", "steps": [
  {"index": 1, "type": "LAUNCH_APP", "target": "com.example.app"},
  {"index": 2, "type": "INPUT_TEXT", "target": "username", "value": "..."},
  {"index": 3, "type": "TAP", "target": "LOGIN"},
  {"index": 4, "type": "WAIT_TEXT", "target": "Home"}
]}
Valid types: LAUNCH_APP, TAP, INPUT_TEXT, SCROLL_TO, WAIT_TEXT, ASSERT_TEXT,
CHECK, SLIDE, WAIT_OTP, BACK, SLEEP, LABEL, GOTO, IF_VISIBLE."#;
        let raw = self.chat(system, text).await?;
        let json_text = extract_json(&raw)
            .ok_or_else(|| AgentError::Llm(format!("no JSON in completion: {:.120}", raw)))?;
        let mut plan: ActionPlan = serde_json::from_str(&json_text)?;
        plan.sanitize();
        Ok(plan)
    }

    /// Pick one candidate id for an ambiguous instruction, or None.
    pub async fn disambiguate(
        &self,
        instruction: &str,
        candidates: &[CandidateSummary],
        context: &str,
    ) -> Result<Option<String>, AgentError> {
        if candidates.is_empty() {
            return Ok(None);
        }
        let system = "You pick which UI element an instruction refers to. \
Reply ONLY with the candidate id, or NONE if no candidate fits.";
        let user = format!(
            "Instruction: '{}'\nScreen context: {}\nCandidates:\n{}",
            instruction,
            context,
            serde_json::to_string_pretty(candidates)?
        );
        let raw = self.chat(system, &user).await?;
        let answer = raw.trim().trim_matches('"').to_string();
        if answer.is_empty() || answer.eq_ignore_ascii_case("none") {
            return Ok(None);
        }
        Ok(candidates.iter().find(|c| c.id == answer).map(|c| c.id.clone()))
    }
}

/// Pull the first JSON object out of a completion that may be fenced or
/// wrapped in prose.
fn extract_json(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.starts_with('{') {
        return Some(trimmed.to_string());
    }
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end > start {
        Some(raw[start..=end].to_string())
    } else {
        None
    }
}
