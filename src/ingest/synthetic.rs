//! Synthetic frame source (`stub://`).
//!
//! Produces a moving test pattern at a fixed rate. Used by tests, dry runs, and the
//! stub detector backend. Query parameters override the defaults:
//! `stub://gate?width=320&height=240&fps=5`.

use anyhow::{anyhow, Context, Result};
use std::time::Instant;
use url::Url;

use super::{frame_interval, SourceDescriptor, StreamBackend};
use crate::frame::Frame;

const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_FPS: u32 = 10;

#[derive(Clone, Debug)]
pub struct SyntheticConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            fps: DEFAULT_FPS,
        }
    }
}

pub struct SyntheticBackend {
    source_id: String,
    config: SyntheticConfig,
    frame_count: u64,
    /// Simulated scene state, bumped every 50 frames.
    scene_state: u8,
    last_frame_at: Option<Instant>,
}

impl SyntheticBackend {
    pub fn new(source_id: &str, config: SyntheticConfig) -> Result<Self> {
        if config.width == 0 || config.height == 0 {
            return Err(anyhow!("synthetic source needs non-zero dimensions"));
        }
        log::info!(
            "SyntheticBackend: connected to {} ({}x{} @ {} fps)",
            source_id,
            config.width,
            config.height,
            config.fps
        );
        Ok(Self {
            source_id: source_id.to_string(),
            config,
            frame_count: 0,
            scene_state: 0,
            last_frame_at: None,
        })
    }

    pub fn from_descriptor(descriptor: &SourceDescriptor) -> Result<Self> {
        let url = Url::parse(&descriptor.location).context("parse stub url")?;
        let mut config = SyntheticConfig::default();
        for (key, value) in url.query_pairs() {
            let parsed: u32 = value
                .parse()
                .map_err(|_| anyhow!("stub parameter '{}' must be an integer", key))?;
            match key.as_ref() {
                "width" => config.width = parsed,
                "height" => config.height = parsed,
                "fps" => config.fps = parsed,
                other => log::warn!("SyntheticBackend: ignoring unknown parameter '{}'", other),
            }
        }
        Self::new(&descriptor.id, config)
    }

    fn pace(&mut self) {
        let interval = frame_interval(self.config.fps);
        if let Some(last) = self.last_frame_at {
            let elapsed = last.elapsed();
            if elapsed < interval {
                std::thread::sleep(interval - elapsed);
            }
        }
        self.last_frame_at = Some(Instant::now());
    }

    fn generate_pixels(&mut self) -> Vec<u8> {
        let pixel_count = (self.config.width as usize) * (self.config.height as usize) * 3;
        if self.frame_count % 50 == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }
        let mut pixels = vec![0u8; pixel_count];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 + self.frame_count + self.scene_state as u64) % 256) as u8;
        }
        pixels
    }
}

impl StreamBackend for SyntheticBackend {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    fn read_frame(&mut self) -> Result<Frame> {
        self.pace();
        self.frame_count += 1;
        let pixels = self.generate_pixels();
        Frame::from_rgb(
            pixels,
            self.config.width,
            self.config.height,
            &self.source_id,
        )
    }
}
