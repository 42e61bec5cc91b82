//! RTSP frame source backed by GStreamer.
//!
//! Pipeline: `rtspsrc ! decodebin ! videoconvert ! appsink` with a one-buffer,
//! drop-oldest appsink so the decoder never queues stale frames. The TCP transport
//! attempt pins `rtspsrc` to interleaved TCP; the default attempt lets it negotiate.

use anyhow::{anyhow, Context, Result};
use std::time::Duration;

use super::{SourceDescriptor, StreamBackend, Transport};
use crate::frame::Frame;

const PULL_TIMEOUT: Duration = Duration::from_secs(15);

pub struct GstreamerRtspBackend {
    source_id: String,
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
}

impl GstreamerRtspBackend {
    pub fn connect(descriptor: &SourceDescriptor, transport: Transport) -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;

        let protocols = match transport {
            Transport::Tcp => " protocols=tcp",
            Transport::Default => "",
        };
        let pipeline_description = format!(
            "rtspsrc location={}{} latency=0 ! decodebin ! videoconvert ! video/x-raw,format=RGB ! \
             appsink name=appsink sync=false max-buffers=1 drop=true",
            descriptor.location, protocols
        );
        let pipeline = gstreamer::parse::launch(&pipeline_description)
            .context("build RTSP pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("RTSP pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow!("appsink element has unexpected type"))?;

        let caps = gstreamer::Caps::builder("video/x-raw")
            .field("format", "RGB")
            .build();
        appsink.set_caps(Some(&caps));
        appsink.set_max_buffers(1);
        appsink.set_drop(true);
        appsink.set_sync(false);

        pipeline
            .set_state(gstreamer::State::Playing)
            .context("set RTSP pipeline to Playing")?;
        log::info!(
            "GstreamerRtspBackend: opened {} (transport={:?})",
            descriptor.redacted(),
            transport
        );

        Ok(Self {
            source_id: descriptor.id.clone(),
            pipeline,
            appsink,
        })
    }

    fn check_bus(&self) -> Result<()> {
        let Some(bus) = self.pipeline.bus() else {
            return Ok(());
        };
        while let Some(message) = bus.timed_pop(gstreamer::ClockTime::ZERO) {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    return Err(anyhow!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    ));
                }
                MessageView::Eos(..) => return Err(anyhow!("gstreamer reached EOS")),
                _ => {}
            }
        }
        Ok(())
    }
}

impl StreamBackend for GstreamerRtspBackend {
    fn name(&self) -> &'static str {
        "gstreamer-rtsp"
    }

    fn read_frame(&mut self) -> Result<Frame> {
        self.check_bus()?;
        let timeout = gstreamer::ClockTime::from_mseconds(PULL_TIMEOUT.as_millis() as u64);
        let sample = self
            .appsink
            .try_pull_sample(timeout)
            .ok_or_else(|| anyhow!("RTSP stream stalled"))?;
        let (pixels, width, height) = sample_to_pixels(&sample)?;
        Frame::from_rgb(pixels, width, height, &self.source_id)
    }

    fn release(&mut self) {
        if let Err(err) = self.pipeline.set_state(gstreamer::State::Null) {
            log::warn!(
                "GstreamerRtspBackend: failed to stop pipeline for {}: {}",
                self.source_id,
                err
            );
        }
    }
}

fn sample_to_pixels(sample: &gstreamer::Sample) -> Result<(Vec<u8>, u32, u32)> {
    let buffer = sample.buffer().context("RTSP sample missing buffer")?;
    let caps = sample.caps().context("RTSP sample missing caps")?;
    let info =
        gstreamer_video::VideoInfo::from_caps(caps).context("parse RTSP caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map RTSP buffer")?;
    let data = map.as_slice();

    if stride == row_bytes {
        let pixels = data
            .get(..row_bytes * height as usize)
            .context("RTSP buffer shorter than frame")?
            .to_vec();
        return Ok((pixels, width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("RTSP buffer row is out of bounds")?,
        );
    }

    Ok((pixels, width, height))
}
