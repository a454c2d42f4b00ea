//! In-memory DeviceDriver / VisionService fakes for tests: scripted
//! screens, click/type logs, and label-driven screen transitions.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use crate::driver::{DeviceDriver, ElementHandle, ScrollDirection};
use crate::error::AgentError;
use crate::schema::{Locator, LocatorStrategy};
use crate::ui_tree::UiTree;
use crate::vision::{DetectOptions, VisionResult, VisionService};

pub struct FakeDriver {
    screens: Mutex<HashMap<String, Value>>,
    current: Mutex<String>,
    start: String,
    /// "screen|label" → next screen id.
    transitions: Mutex<HashMap<String, String>>,
    pub clicks: Mutex<Vec<String>>,
    pub typed: Mutex<Vec<(String, String)>>,
    pub session_starts: AtomicU32,
    pub session_stops: AtomicU32,
}

impl FakeDriver {
    pub fn new(start: &str, screens: HashMap<String, Value>) -> Self {
        Self {
            screens: Mutex::new(screens),
            current: Mutex::new(start.to_string()),
            start: start.to_string(),
            transitions: Mutex::new(HashMap::new()),
            clicks: Mutex::new(Vec::new()),
            typed: Mutex::new(Vec::new()),
            session_starts: AtomicU32::new(0),
            session_stops: AtomicU32::new(0),
        }
    }

    /// A login screen with username/password fields, a LOGIN button that
    /// navigates to a Home screen, and a pre-checked "Remember me" switch.
    pub fn login_screen() -> Self {
        let login = json!({
            "class": "FrameLayout",
            "bounds": {"x": 0, "y": 0, "w": 1080, "h": 1920},
            "children": [
                {
                    "class": "EditText",
                    "id": "com.example:id/user_input",
                    "text": "username",
                    "clickable": true,
                    "bounds": {"x": 40, "y": 200, "w": 1000, "h": 120}
                },
                {
                    "class": "EditText",
                    "id": "com.example:id/pass_input",
                    "text": "password",
                    "clickable": true,
                    "bounds": {"x": 40, "y": 360, "w": 1000, "h": 120}
                },
                {
                    "class": "Button",
                    "id": "com.example:id/login_btn",
                    "text": "LOGIN",
                    "clickable": true,
                    "bounds": {"x": 40, "y": 540, "w": 1000, "h": 140}
                },
                {
                    "class": "Switch",
                    "id": "com.example:id/remember_me",
                    "desc": "Remember me",
                    "clickable": true,
                    "checkable": true,
                    "checked": true,
                    "bounds": {"x": 40, "y": 720, "w": 300, "h": 100}
                }
            ]
        });
        let home = json!({
            "class": "FrameLayout",
            "bounds": {"x": 0, "y": 0, "w": 1080, "h": 1920},
            "children": [
                {
                    "class": "TextView",
                    "text": "Home",
                    "bounds": {"x": 40, "y": 100, "w": 400, "h": 80}
                }
            ]
        });
        let mut screens = HashMap::new();
        screens.insert("LoginScreen".to_string(), login);
        screens.insert("HomeScreen".to_string(), home);
        let driver = Self::new("LoginScreen", screens);
        driver.add_transition("LoginScreen", "LOGIN", "HomeScreen");
        driver
    }

    pub fn add_transition(&self, screen: &str, label: &str, next: &str) {
        self.transitions
            .lock()
            .unwrap()
            .insert(format!("{}|{}", screen, label), next.to_string());
    }

    pub fn click_count(&self) -> usize {
        self.clicks.lock().unwrap().len()
    }

    fn current_tree(&self) -> Result<(String, UiTree), AgentError> {
        let screen = self.current.lock().unwrap().clone();
        let screens = self.screens.lock().unwrap();
        let doc = screens
            .get(&screen)
            .ok_or_else(|| AgentError::Driver(format!("no such screen: {}", screen)))?;
        Ok((screen.clone(), UiTree::parse(&doc.to_string())?))
    }

    fn handle_for(screen: &str, idx: usize, tree: &UiTree) -> ElementHandle {
        let node = tree.get(idx).cloned().unwrap_or_default();
        ElementHandle {
            handle: format!("fake:{}:{}", screen, idx),
            id: node.id,
            class: node.class,
            text: node.text,
            desc: node.desc,
            checkable: node.checkable,
            checked: node.checked,
            bounds: node.bounds,
        }
    }

    fn toggle_checked(value: &mut Value, id: &str) {
        if value.get("id").and_then(|v| v.as_str()) == Some(id) {
            let checked = value.get("checked").and_then(|v| v.as_bool()).unwrap_or(false);
            value["checked"] = Value::Bool(!checked);
            return;
        }
        if let Some(children) = value.get_mut("children").and_then(|c| c.as_array_mut()) {
            for child in children {
                Self::toggle_checked(child, id);
            }
        }
    }
}

#[async_trait]
impl DeviceDriver for FakeDriver {
    async fn start_session(&self) -> Result<(), AgentError> {
        self.session_starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_session(&self) -> Result<(), AgentError> {
        self.session_stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn find_element(&self, locator: &Locator) -> Result<Option<ElementHandle>, AgentError> {
        let (screen, tree) = self.current_tree()?;
        let found = match locator.strategy {
            LocatorStrategy::Id => tree.find(|n| n.id == locator.value),
            LocatorStrategy::Desc => tree.find(|n| n.desc == locator.value),
            LocatorStrategy::Text => tree.find(|n| n.text == locator.value),
            LocatorStrategy::TextCi => tree.find(|n| n.text.to_lowercase() == locator.value),
            LocatorStrategy::Path => match locator.value.strip_prefix("near-text:") {
                Some(label) => tree
                    .find(|n| n.text == label || n.desc == label)
                    .into_iter()
                    .map(|i| tree.nearest_clickable(i))
                    .collect(),
                None => Vec::new(),
            },
        };
        Ok(found.first().map(|&idx| Self::handle_for(&screen, idx, &tree)))
    }

    async fn click(&self, element: &ElementHandle) -> Result<(), AgentError> {
        let label = if !element.text.is_empty() {
            element.text.clone()
        } else if !element.desc.is_empty() {
            element.desc.clone()
        } else {
            element.id.clone()
        };
        self.clicks.lock().unwrap().push(label.clone());

        if element.checkable {
            let screen = self.current.lock().unwrap().clone();
            if let Some(doc) = self.screens.lock().unwrap().get_mut(&screen) {
                Self::toggle_checked(doc, &element.id);
            }
            return Ok(());
        }

        let screen = self.current.lock().unwrap().clone();
        let next = self.transitions.lock().unwrap().get(&format!("{}|{}", screen, label)).cloned();
        if let Some(next) = next {
            *self.current.lock().unwrap() = next;
        }
        Ok(())
    }

    async fn clear(&self, _element: &ElementHandle) -> Result<(), AgentError> {
        Ok(())
    }

    async fn type_text(&self, element: &ElementHandle, text: &str) -> Result<(), AgentError> {
        self.typed.lock().unwrap().push((element.id.clone(), text.to_string()));
        Ok(())
    }

    async fn current_screen(&self) -> Result<String, AgentError> {
        Ok(self.current.lock().unwrap().clone())
    }

    async fn ui_snapshot(&self) -> Result<String, AgentError> {
        let screen = self.current.lock().unwrap().clone();
        let screens = self.screens.lock().unwrap();
        screens
            .get(&screen)
            .map(|doc| doc.to_string())
            .ok_or_else(|| AgentError::Driver(format!("no such screen: {}", screen)))
    }

    async fn screenshot(&self) -> Result<Vec<u8>, AgentError> {
        Ok(vec![0u8; 16])
    }

    async fn navigate_back(&self) -> Result<(), AgentError> {
        *self.current.lock().unwrap() = self.start.clone();
        Ok(())
    }

    async fn launch_app(&self, _package: &str) -> Result<(), AgentError> {
        *self.current.lock().unwrap() = self.start.clone();
        Ok(())
    }

    async fn scroll(&self, _direction: ScrollDirection) -> Result<(), AgentError> {
        Ok(())
    }

    async fn swipe(
        &self,
        _from: (i32, i32),
        _to: (i32, i32),
        _duration_ms: u64,
    ) -> Result<(), AgentError> {
        Ok(())
    }
}

/// Vision fake: returns a preset result, or nothing.
#[derive(Default)]
pub struct FakeVision {
    pub result: Option<VisionResult>,
    pub calls: AtomicU32,
}

#[async_trait]
impl VisionService for FakeVision {
    async fn detect(&self, _image: &[u8], _options: &DetectOptions) -> Result<VisionResult, AgentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.result {
            Some(result) => Ok(result.clone()),
            None => Ok(VisionResult::default()),
        }
    }
}
