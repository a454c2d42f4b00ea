use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Mutex;
use std::time::Duration;

use crate::error::AgentError;
use crate::ui_tree::Rect;

/// One detected box from the vision service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VisionElement {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub text: String,
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
    #[serde(default)]
    pub score: f32,
}

impl VisionElement {
    pub fn bounds(&self) -> Rect {
        Rect { x: self.x, y: self.y, w: self.w, h: self.h }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VisionResult {
    #[serde(rename = "imageWidth", default)]
    pub image_width: u32,
    #[serde(rename = "imageHeight", default)]
    pub image_height: u32,
    #[serde(default)]
    pub elements: Vec<VisionElement>,
}

#[derive(Debug, Clone, Default)]
pub struct DetectOptions {
    /// Free-text hint forwarded to the detector.
    pub query: Option<String>,
}

/// External detector turning a screenshot into labeled bounding boxes.
/// Best-effort: failures degrade to DOM-only resolution.
#[async_trait]
pub trait VisionService: Send + Sync {
    async fn detect(&self, image: &[u8], options: &DetectOptions) -> Result<VisionResult, AgentError>;
}

pub struct VisionClient {
    client: Client,
    base_url: String,
}

impl VisionClient {
    pub fn new(base_url: &str) -> Result<Self, AgentError> {
        let client = Client::builder()
            .no_proxy()
            .timeout(Duration::from_secs(20))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| AgentError::Vision(format!("client build failed: {}", e)))?;
        Ok(Self { client, base_url: base_url.trim_end_matches('/').to_string() })
    }
}

#[async_trait]
impl VisionService for VisionClient {
    async fn detect(&self, image: &[u8], options: &DetectOptions) -> Result<VisionResult, AgentError> {
        let body = json!({
            "image": general_purpose::STANDARD.encode(image),
            "query": options.query,
        });
        let resp = self
            .client
            .post(format!("{}/detect", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| AgentError::Vision(format!("detect failed: {}", e)))?;
        if !resp.status().is_success() {
            return Err(AgentError::Vision(format!("detect: {}", resp.status())));
        }
        resp.json::<VisionResult>()
            .await
            .map_err(|e| AgentError::Vision(format!("detect: bad response: {}", e)))
    }
}

/// Detection cache keyed by (UI-state fingerprint, active section), so an
/// unchanged screen never triggers a second external call.
#[derive(Default)]
pub struct VisionCache {
    entries: Mutex<HashMap<(String, String), VisionResult>>,
}

impl VisionCache {
    pub fn get(&self, fingerprint: &str, section: &str) -> Option<VisionResult> {
        self.entries
            .lock()
            .ok()?
            .get(&(fingerprint.to_string(), section.to_string()))
            .cloned()
    }

    pub fn put(&self, fingerprint: &str, section: &str, result: VisionResult) {
        if let Ok(mut map) = self.entries.lock() {
            map.insert((fingerprint.to_string(), section.to_string()), result);
        }
    }
}

/// Crop a PNG/JPEG screenshot to the section region before detection.
/// Returns the original bytes when the crop fails or is degenerate.
pub fn crop_to_region(image_bytes: &[u8], region: &Rect) -> Vec<u8> {
    if region.is_empty() {
        return image_bytes.to_vec();
    }
    let img = match image::load_from_memory(image_bytes) {
        Ok(img) => img,
        Err(_) => return image_bytes.to_vec(),
    };
    let (iw, ih) = (img.width() as i32, img.height() as i32);
    let x = region.x.clamp(0, iw.saturating_sub(1));
    let y = region.y.clamp(0, ih.saturating_sub(1));
    let w = region.w.min(iw - x);
    let h = region.h.min(ih - y);
    if w <= 0 || h <= 0 {
        return image_bytes.to_vec();
    }
    let cropped = img.crop_imm(x as u32, y as u32, w as u32, h as u32);
    let mut buffer = Cursor::new(Vec::new());
    match cropped.write_to(&mut buffer, image::ImageOutputFormat::Png) {
        Ok(_) => buffer.into_inner(),
        Err(_) => image_bytes.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_hit_and_miss_by_section() {
        let cache = VisionCache::default();
        let result = VisionResult {
            image_width: 100,
            image_height: 200,
            elements: vec![VisionElement { text: "OK".into(), x: 1, y: 2, w: 3, h: 4, ..Default::default() }],
        };
        cache.put("fp1", "from", result);
        assert!(cache.get("fp1", "from").is_some());
        assert!(cache.get("fp1", "to").is_none());
        assert!(cache.get("fp2", "from").is_none());
    }

    #[test]
    fn test_crop_degrades_to_original_on_bad_input() {
        let bytes = vec![1, 2, 3];
        let out = crop_to_region(&bytes, &Rect { x: 0, y: 0, w: 10, h: 10 });
        assert_eq!(out, bytes);
    }

    #[test]
    fn test_detection_deserializes_service_shape() {
        let raw = r#"{"imageWidth":1080,"imageHeight":1920,
            "elements":[{"id":"e1","type":"button","text":"LOGIN","x":10,"y":20,"w":100,"h":40,"score":0.92}]}"#;
        let result: VisionResult = serde_json::from_str(raw).unwrap();
        assert_eq!(result.elements.len(), 1);
        assert_eq!(result.elements[0].kind, "button");
        assert_eq!(result.elements[0].bounds().center(), (60, 40));
    }
}
