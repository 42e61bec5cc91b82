//! Remote inference service backend.
//!
//! - `POST {base}/detect` with the JPEG frame, answering
//!   `{"boxes":[{"x1":..,"y1":..,"x2":..,"y2":..,"confidence":..}]}`
//! - `POST {base}/recognize` with the JPEG plate crop, answering either
//!   `{"characters":[{"class_id":12,"x":40.5}]}`, `{"characters":[{"char":"C","x":40.5}]}`
//!   or `{"text":"AB1234C"}`

use anyhow::{anyhow, Context, Result};
use image::RgbImage;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;

use crate::detect::backend::{PlateDetector, PlateRecognizer};
use crate::detect::result::{CharDetection, DetectionBox, Recognition};
use crate::frame::{encode_jpeg, Frame};
use crate::plate::char_for_class;

#[derive(Deserialize)]
struct DetectResponse {
    #[serde(default)]
    boxes: Vec<RawBox>,
}

#[derive(Deserialize)]
struct RawBox {
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    #[serde(default = "full_confidence")]
    confidence: f32,
}

fn full_confidence() -> f32 {
    1.0
}

#[derive(Deserialize)]
struct RecognizeResponse {
    characters: Option<Vec<RawChar>>,
    text: Option<String>,
}

#[derive(Deserialize)]
struct RawChar {
    class_id: Option<u32>,
    #[serde(rename = "char")]
    character: Option<String>,
    x: f32,
}

/// Shared HTTP plumbing for both inference calls.
#[derive(Clone)]
pub struct InferenceClient {
    agent: ureq::Agent,
    base_url: String,
}

impl InferenceClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let parsed = url::Url::parse(base_url).context("parse detector url")?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(anyhow!("detector url must be http(s): {}", base_url));
        }
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Ok(Self {
            agent,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn post_jpeg<T: DeserializeOwned>(&self, path: &str, image: &RgbImage) -> Result<T> {
        let body = encode_jpeg(image)?;
        let url = format!("{}{}", self.base_url, path);
        self.agent
            .post(&url)
            .set("Content-Type", "image/jpeg")
            .send_bytes(&body)
            .with_context(|| format!("POST {}", url))?
            .into_json::<T>()
            .with_context(|| format!("decode response from {}", url))
    }
}

pub struct HttpDetector {
    client: InferenceClient,
}

impl HttpDetector {
    pub fn new(client: InferenceClient) -> Self {
        Self { client }
    }
}

impl PlateDetector for HttpDetector {
    fn name(&self) -> &'static str {
        "http"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<DetectionBox>> {
        let response: DetectResponse = self.client.post_jpeg("/detect", frame.image())?;
        Ok(response
            .boxes
            .into_iter()
            .map(|b| DetectionBox::new(b.x1, b.y1, b.x2, b.y2, b.confidence))
            .collect())
    }
}

pub struct HttpRecognizer {
    client: InferenceClient,
}

impl HttpRecognizer {
    pub fn new(client: InferenceClient) -> Self {
        Self { client }
    }
}

impl PlateRecognizer for HttpRecognizer {
    fn name(&self) -> &'static str {
        "http"
    }

    fn recognize(&mut self, plate: &RgbImage) -> Result<Recognition> {
        let response: RecognizeResponse = self.client.post_jpeg("/recognize", plate)?;
        into_recognition(response)
    }
}

fn into_recognition(response: RecognizeResponse) -> Result<Recognition> {
    if let Some(characters) = response.characters {
        let characters = characters
            .into_iter()
            .filter_map(|raw| {
                let character = match (raw.class_id, raw.character.as_deref()) {
                    (Some(class_id), _) => char_for_class(class_id),
                    (None, Some(text)) => text.chars().next(),
                    (None, None) => None,
                };
                if character.is_none() {
                    log::debug!("HttpRecognizer: dropping unknown character at x={}", raw.x);
                }
                character.map(|character| CharDetection {
                    character,
                    x: raw.x,
                })
            })
            .collect();
        return Ok(Recognition::Characters(characters));
    }
    match response.text {
        Some(text) => Ok(Recognition::Text(text)),
        None => Err(anyhow!("recognize response has neither characters nor text")),
    }
}
