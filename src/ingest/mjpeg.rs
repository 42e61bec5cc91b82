//! HTTP frame source.
//!
//! Cameras that expose `http(s)://` endpoints either stream MJPEG
//! (`multipart/x-mixed-replace`) or serve a single JPEG per request. Both are
//! decoded in memory into RGB frames.
//!
//! Snapshot endpoints are polled at most `fps` times per second (default 10).
//! The rate is set in the URL fragment, which is never sent to the camera:
//! `http://10.0.0.3/snapshot.jpg#fps=5`.

use anyhow::{anyhow, Context, Result};
use image::GenericImageView;
use std::io::Read;
use std::time::{Duration, Instant};
use url::Url;

use super::{frame_interval, SourceDescriptor, StreamBackend};
use crate::frame::Frame;

const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;
const READ_TIMEOUT: Duration = Duration::from_secs(15);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_SNAPSHOT_FPS: u32 = 10;

pub struct HttpStreamBackend {
    source_id: String,
    url: String,
    agent: ureq::Agent,
    stream: HttpStream,
    pacer: FramePacer,
}

enum HttpStream {
    Mjpeg(MjpegStream),
    SingleJpeg,
}

impl HttpStreamBackend {
    pub fn connect(descriptor: &SourceDescriptor) -> Result<Self> {
        let (url, snapshot_fps) = split_snapshot_rate(&descriptor.location)?;
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(CONNECT_TIMEOUT)
            .timeout_read(READ_TIMEOUT)
            .build();
        let response = agent
            .get(&url)
            .call()
            .with_context(|| format!("connect to http stream {}", descriptor.redacted()))?;
        let content_type = response.header("Content-Type").unwrap_or("").to_lowercase();
        let stream = if content_type.contains("multipart") {
            HttpStream::Mjpeg(MjpegStream::new(response.into_reader()))
        } else {
            HttpStream::SingleJpeg
        };
        match &stream {
            HttpStream::Mjpeg(_) => log::info!(
                "HttpStreamBackend: connected to {} (mjpeg)",
                descriptor.redacted()
            ),
            HttpStream::SingleJpeg => log::info!(
                "HttpStreamBackend: connected to {} (snapshot, up to {} fps)",
                descriptor.redacted(),
                snapshot_fps
            ),
        }
        let mut pacer = FramePacer::new(snapshot_fps);
        // The initial request above counts as the first fetch.
        pacer.mark();
        Ok(Self {
            source_id: descriptor.id.clone(),
            url,
            agent,
            stream,
            pacer,
        })
    }
}

impl StreamBackend for HttpStreamBackend {
    fn name(&self) -> &'static str {
        "http"
    }

    fn read_frame(&mut self) -> Result<Frame> {
        let jpeg_bytes = match &mut self.stream {
            HttpStream::Mjpeg(stream) => stream.read_next_jpeg()?,
            HttpStream::SingleJpeg => {
                self.pacer.wait();
                fetch_single_jpeg(&self.agent, &self.url)?
            }
        };
        let (pixels, width, height) = decode_jpeg(&jpeg_bytes)?;
        Frame::from_rgb(pixels, width, height, &self.source_id)
    }

    fn release(&mut self) {
        // Dropping the reader closes the connection.
        self.stream = HttpStream::SingleJpeg;
    }
}

/// Spaces successive snapshot requests at least `min_interval` apart.
struct FramePacer {
    min_interval: Duration,
    last: Option<Instant>,
}

impl FramePacer {
    fn new(target_fps: u32) -> Self {
        Self {
            min_interval: frame_interval(target_fps),
            last: None,
        }
    }

    fn mark(&mut self) {
        self.last = Some(Instant::now());
    }

    /// Sleep out the rest of the interval since the previous fetch.
    fn wait(&mut self) {
        if let Some(last) = self.last {
            let elapsed = last.elapsed();
            if elapsed < self.min_interval {
                std::thread::sleep(self.min_interval - elapsed);
            }
        }
        self.mark();
    }
}

/// Strip the `#fps=N` fragment. Returns the request URL and the snapshot rate.
fn split_snapshot_rate(location: &str) -> Result<(String, u32)> {
    let mut url = Url::parse(location).context("parse http source url")?;
    let mut fps = DEFAULT_SNAPSHOT_FPS;
    if let Some(fragment) = url.fragment() {
        for pair in fragment.split('&').filter(|p| !p.is_empty()) {
            match pair.split_once('=') {
                Some(("fps", value)) => {
                    fps = value
                        .parse()
                        .map_err(|_| anyhow!("snapshot fps must be an integer, got '{}'", value))?;
                }
                _ => log::warn!("HttpStreamBackend: ignoring fragment parameter '{}'", pair),
            }
        }
    }
    url.set_fragment(None);
    Ok((url.to_string(), fps))
}

struct MjpegStream {
    reader: Box<dyn Read + Send + Sync>,
    buffer: Vec<u8>,
}

impl MjpegStream {
    fn new(reader: Box<dyn Read + Send + Sync>) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(64 * 1024),
        }
    }

    fn read_next_jpeg(&mut self) -> Result<Vec<u8>> {
        let mut chunk = vec![0u8; 8192];
        loop {
            if let Some((start, end)) = find_jpeg_bounds(&self.buffer) {
                let frame = self.buffer[start..end].to_vec();
                self.buffer.drain(..end);
                return Ok(frame);
            }

            let read = self.reader.read(&mut chunk).context("read mjpeg chunk")?;
            if read == 0 {
                return Err(anyhow!("mjpeg stream ended"));
            }
            self.buffer.extend_from_slice(&chunk[..read]);

            if self.buffer.len() > MAX_JPEG_BYTES * 2 {
                let keep = 2.min(self.buffer.len());
                let drain_len = self.buffer.len() - keep;
                self.buffer.drain(..drain_len);
            }
        }
    }
}

fn fetch_single_jpeg(agent: &ureq::Agent, url: &str) -> Result<Vec<u8>> {
    let response = agent.get(url).call().context("fetch jpeg snapshot")?;
    let mut bytes = Vec::new();
    response
        .into_reader()
        .take(MAX_JPEG_BYTES as u64)
        .read_to_end(&mut bytes)
        .context("read jpeg snapshot")?;
    if bytes.is_empty() {
        return Err(anyhow!("empty jpeg snapshot"));
    }
    Ok(bytes)
}

pub(crate) fn decode_jpeg(bytes: &[u8]) -> Result<(Vec<u8>, u32, u32)> {
    let image = image::load_from_memory(bytes).context("decode jpeg")?;
    let (width, height) = image.dimensions();
    let rgb = image.into_rgb8();
    Ok((rgb.into_raw(), width, height))
}

/// Locate the first complete SOI..EOI span in `buffer`.
fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer.windows(2).position(|w| w == [0xFF, 0xD8])?;
    let end = buffer[start + 2..]
        .windows(2)
        .position(|w| w == [0xFF, 0xD9])?;
    Some((start, start + 2 + end + 2))
}
