//! Frame ingestion.
//!
//! This module provides the sources that feed the orchestrator:
//! - RTSP streams (IP cameras, feature: rtsp-gstreamer)
//! - HTTP MJPEG / JPEG snapshot endpoints
//! - Local capture devices (feature: ingest-v4l2)
//! - Synthetic `stub://` sources (testing, dry runs)
//!
//! Every backend implements `StreamBackend`: a blocking "give me the next decoded
//! frame" call. `FrameSource` wraps a backend in a capture thread with the
//! reconnection policy and the single-slot hand-off buffer.

use anyhow::{anyhow, Context, Result};
use std::time::Duration;
use url::Url;

use crate::frame::Frame;

pub mod mjpeg;
#[cfg(feature = "rtsp-gstreamer")]
pub mod rtsp;
pub mod source;
pub mod synthetic;
#[cfg(feature = "ingest-v4l2")]
pub mod v4l2;

pub use mjpeg::HttpStreamBackend;
pub use source::{FrameSource, ReconnectPolicy, SourceStats, StreamState};
pub use synthetic::SyntheticBackend;

/// Where a source reads from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceKind {
    Synthetic,
    Rtsp,
    Http,
    Device(u32),
}

/// Transport preference for one connection attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transport {
    /// Reliable interleaved transport (RTSP over TCP).
    Tcp,
    /// Whatever the backend negotiates by default.
    Default,
}

/// Parsed source address plus a stable id used in logs and tracker keys.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceDescriptor {
    pub id: String,
    pub location: String,
    pub kind: SourceKind,
}

impl SourceDescriptor {
    /// Parse a configured source string.
    ///
    /// Accepted forms: `stub://name`, `rtsp://...`, `http(s)://...`, a bare device
    /// index (`0`), or a device node (`/dev/video0`).
    pub fn parse(id: &str, location: &str) -> Result<Self> {
        let location = location.trim();
        if location.is_empty() {
            return Err(anyhow!("source '{}' has an empty location", id));
        }
        if let Ok(index) = location.parse::<u32>() {
            return Ok(Self::new(id, location, SourceKind::Device(index)));
        }
        if let Some(index) = location.strip_prefix("/dev/video") {
            let index: u32 = index
                .parse()
                .map_err(|_| anyhow!("unsupported device node '{}'", location))?;
            return Ok(Self::new(id, location, SourceKind::Device(index)));
        }
        let url = Url::parse(location).with_context(|| format!("parse source url for '{}'", id))?;
        let kind = match url.scheme() {
            "stub" => SourceKind::Synthetic,
            "rtsp" | "rtsps" => SourceKind::Rtsp,
            "http" | "https" => SourceKind::Http,
            other => {
                return Err(anyhow!(
                    "unsupported source scheme '{}' for '{}'; expected stub, rtsp, or http(s)",
                    other,
                    id
                ))
            }
        };
        Ok(Self::new(id, location, kind))
    }

    fn new(id: &str, location: &str, kind: SourceKind) -> Self {
        Self {
            id: id.to_string(),
            location: location.to_string(),
            kind,
        }
    }

    /// Transports to try, in order, for one initialisation attempt.
    pub fn transports(&self) -> &'static [Transport] {
        match self.kind {
            SourceKind::Rtsp => &[Transport::Tcp, Transport::Default],
            _ => &[Transport::Default],
        }
    }

    /// Location with credentials stripped, safe for logs.
    pub fn redacted(&self) -> String {
        redact_location(&self.location)
    }
}

/// Minimum spacing between frames for a target rate. Zero fps means unpaced.
pub(crate) fn frame_interval(target_fps: u32) -> Duration {
    if target_fps == 0 {
        Duration::from_millis(0)
    } else {
        Duration::from_millis((1000 / target_fps).max(1) as u64)
    }
}

pub fn redact_location(location: &str) -> String {
    match Url::parse(location) {
        Ok(mut url) if !url.username().is_empty() || url.password().is_some() => {
            let _ = url.set_username("");
            let _ = url.set_password(None);
            url.to_string()
        }
        _ => location.to_string(),
    }
}

/// A connected stream that yields decoded frames.
///
/// `read_frame` may block on the underlying transport; it runs on the capture
/// thread only. An undecodable or empty frame is returned as an error, the same
/// as a transport failure.
pub trait StreamBackend: Send {
    fn name(&self) -> &'static str;

    fn read_frame(&mut self) -> Result<Frame>;

    /// Release the underlying device or connection. Called once before drop.
    fn release(&mut self) {}
}

/// Opens backends for a descriptor. Swappable so capture behaviour can be tested
/// without network streams.
pub trait BackendOpener: Send + Sync {
    fn open(
        &self,
        descriptor: &SourceDescriptor,
        transport: Transport,
    ) -> Result<Box<dyn StreamBackend>>;
}

/// Opener for the backends compiled into this build.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultOpener;

impl BackendOpener for DefaultOpener {
    fn open(
        &self,
        descriptor: &SourceDescriptor,
        transport: Transport,
    ) -> Result<Box<dyn StreamBackend>> {
        match &descriptor.kind {
            SourceKind::Synthetic => Ok(Box::new(SyntheticBackend::from_descriptor(descriptor)?)),
            SourceKind::Http => Ok(Box::new(HttpStreamBackend::connect(descriptor)?)),
            SourceKind::Rtsp => {
                #[cfg(feature = "rtsp-gstreamer")]
                {
                    Ok(Box::new(rtsp::GstreamerRtspBackend::connect(
                        descriptor, transport,
                    )?))
                }
                #[cfg(not(feature = "rtsp-gstreamer"))]
                {
                    let _ = transport;
                    Err(anyhow!("RTSP requires the rtsp-gstreamer feature"))
                }
            }
            SourceKind::Device(index) => {
                #[cfg(feature = "ingest-v4l2")]
                {
                    let _ = transport;
                    Ok(Box::new(v4l2::V4l2Backend::connect(descriptor, *index)?))
                }
                #[cfg(not(feature = "ingest-v4l2"))]
                {
                    let _ = (transport, index);
                    Err(anyhow!("local capture devices require the ingest-v4l2 feature"))
                }
            }
        }
    }
}
