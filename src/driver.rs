use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

use crate::error::AgentError;
use crate::schema::{Locator, LocatorStrategy};
use crate::ui_tree::Rect;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollDirection {
    Up,
    Down,
}

impl ScrollDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScrollDirection::Up => "up",
            ScrollDirection::Down => "down",
        }
    }
}

/// A live reference to one on-screen element, as returned by the driver.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ElementHandle {
    #[serde(default)]
    pub handle: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub class: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub desc: String,
    #[serde(default)]
    pub checkable: bool,
    #[serde(default)]
    pub checked: bool,
    #[serde(default)]
    pub bounds: Rect,
}

impl ElementHandle {
    /// Identity check: native handle when both sides carry one, else the
    /// id+class+text+description tuple.
    pub fn same_element(&self, other: &ElementHandle) -> bool {
        if !self.handle.is_empty() && !other.handle.is_empty() {
            return self.handle == other.handle;
        }
        self.id == other.id
            && self.class == other.class
            && self.text == other.text
            && self.desc == other.desc
    }
}

/// The narrow remote-control surface the engine depends on. The real
/// implementation talks HTTP/JSON to an automation server; tests inject an
/// in-memory fake.
#[async_trait]
pub trait DeviceDriver: Send + Sync {
    async fn start_session(&self) -> Result<(), AgentError>;
    async fn stop_session(&self) -> Result<(), AgentError>;
    async fn find_element(&self, locator: &Locator) -> Result<Option<ElementHandle>, AgentError>;
    async fn click(&self, element: &ElementHandle) -> Result<(), AgentError>;
    async fn clear(&self, element: &ElementHandle) -> Result<(), AgentError>;
    async fn type_text(&self, element: &ElementHandle, text: &str) -> Result<(), AgentError>;
    async fn current_screen(&self) -> Result<String, AgentError>;
    async fn ui_snapshot(&self) -> Result<String, AgentError>;
    async fn screenshot(&self) -> Result<Vec<u8>, AgentError>;
    async fn navigate_back(&self) -> Result<(), AgentError>;
    async fn launch_app(&self, package: &str) -> Result<(), AgentError>;
    async fn scroll(&self, direction: ScrollDirection) -> Result<(), AgentError>;
    async fn swipe(
        &self,
        from: (i32, i32),
        to: (i32, i32),
        duration_ms: u64,
    ) -> Result<(), AgentError>;
}

/// HTTP client for the device automation server.
pub struct DriverClient {
    client: Client,
    base_url: String,
}

impl DriverClient {
    pub fn new(base_url: &str) -> Result<Self, AgentError> {
        let client = Client::builder()
            .no_proxy()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| AgentError::Driver(format!("client build failed: {}", e)))?;
        Ok(Self { client, base_url: base_url.trim_end_matches('/').to_string() })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn request_error(path: &str, e: reqwest::Error) -> AgentError {
        if e.is_timeout() {
            AgentError::Timeout(format!("{}: {}", path, e))
        } else {
            AgentError::Driver(format!("{} failed: {}", path, e))
        }
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value, AgentError> {
        let resp = self
            .client
            .post(self.url(path))
            .json(&body)
            .send()
            .await
            .map_err(|e| Self::request_error(path, e))?;
        let status = resp.status();
        let value: Value = resp
            .json()
            .await
            .map_err(|e| AgentError::Driver(format!("POST {}: bad response: {}", path, e)))?;
        if !status.is_success() {
            let msg = value
                .get("error")
                .and_then(|e| e.as_str())
                .unwrap_or("unknown driver error");
            return Err(AgentError::Driver(format!("POST {}: {} ({})", path, msg, status)));
        }
        Ok(value)
    }

    async fn get(&self, path: &str) -> Result<Value, AgentError> {
        let resp = self
            .client
            .get(self.url(path))
            .send()
            .await
            .map_err(|e| Self::request_error(path, e))?;
        if !resp.status().is_success() {
            return Err(AgentError::Driver(format!("GET {}: {}", path, resp.status())));
        }
        resp.json()
            .await
            .map_err(|e| AgentError::Driver(format!("GET {}: bad response: {}", path, e)))
    }

    fn strategy_tag(strategy: LocatorStrategy) -> &'static str {
        match strategy {
            LocatorStrategy::Id => "id",
            LocatorStrategy::Desc => "desc",
            LocatorStrategy::Text => "text",
            LocatorStrategy::TextCi => "text_ci",
            LocatorStrategy::Path => "path",
        }
    }
}

#[async_trait]
impl DeviceDriver for DriverClient {
    async fn start_session(&self) -> Result<(), AgentError> {
        self.post("/session", json!({})).await.map(|_| ())
    }

    async fn stop_session(&self) -> Result<(), AgentError> {
        let resp = self
            .client
            .delete(self.url("/session"))
            .send()
            .await
            .map_err(|e| AgentError::Driver(format!("DELETE /session failed: {}", e)))?;
        if !resp.status().is_success() {
            return Err(AgentError::Driver(format!("DELETE /session: {}", resp.status())));
        }
        Ok(())
    }

    async fn find_element(&self, locator: &Locator) -> Result<Option<ElementHandle>, AgentError> {
        let body = json!({
            "strategy": Self::strategy_tag(locator.strategy),
            "value": locator.value,
        });
        let value = self.post("/element/find", body).await?;
        if !value.get("found").and_then(|f| f.as_bool()).unwrap_or(false) {
            return Ok(None);
        }
        let element = value
            .get("element")
            .cloned()
            .ok_or_else(|| AgentError::Driver("find: missing element payload".into()))?;
        let handle: ElementHandle = serde_json::from_value(element)?;
        Ok(Some(handle))
    }

    async fn click(&self, element: &ElementHandle) -> Result<(), AgentError> {
        self.post(&format!("/element/{}/click", element.handle), json!({})).await.map(|_| ())
    }

    async fn clear(&self, element: &ElementHandle) -> Result<(), AgentError> {
        self.post(&format!("/element/{}/clear", element.handle), json!({})).await.map(|_| ())
    }

    async fn type_text(&self, element: &ElementHandle, text: &str) -> Result<(), AgentError> {
        self.post(&format!("/element/{}/type", element.handle), json!({ "text": text }))
            .await
            .map(|_| ())
    }

    async fn current_screen(&self) -> Result<String, AgentError> {
        let value = self.get("/screen").await?;
        Ok(value.get("id").and_then(|v| v.as_str()).unwrap_or("").to_string())
    }

    async fn ui_snapshot(&self) -> Result<String, AgentError> {
        let value = self.get("/source").await?;
        let tree = value
            .get("tree")
            .ok_or_else(|| AgentError::Driver("source: missing tree".into()))?;
        Ok(tree.to_string())
    }

    async fn screenshot(&self) -> Result<Vec<u8>, AgentError> {
        let value = self.get("/screenshot").await?;
        let data = value
            .get("data")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AgentError::Driver("screenshot: missing data".into()))?;
        general_purpose::STANDARD
            .decode(data)
            .map_err(|e| AgentError::Driver(format!("screenshot: bad base64: {}", e)))
    }

    async fn navigate_back(&self) -> Result<(), AgentError> {
        self.post("/back", json!({})).await.map(|_| ())
    }

    async fn launch_app(&self, package: &str) -> Result<(), AgentError> {
        self.post("/app/launch", json!({ "package": package })).await.map(|_| ())
    }

    async fn scroll(&self, direction: ScrollDirection) -> Result<(), AgentError> {
        self.post("/scroll", json!({ "direction": direction.as_str() })).await.map(|_| ())
    }

    async fn swipe(
        &self,
        from: (i32, i32),
        to: (i32, i32),
        duration_ms: u64,
    ) -> Result<(), AgentError> {
        let body = json!({
            "x1": from.0, "y1": from.1,
            "x2": to.0, "y2": to.1,
            "duration_ms": duration_ms,
        });
        self.post("/swipe", body).await.map(|_| ())
    }
}
