//! Local capture device source (V4L2).
//!
//! Opens `/dev/video{N}`, asks for RGB24 at the device's current resolution, and
//! captures through a memory-mapped buffer stream.

use anyhow::{anyhow, Context, Result};
use ouroboros::self_referencing;

use super::{SourceDescriptor, StreamBackend};
use crate::frame::Frame;

const STREAM_BUFFERS: u32 = 4;

pub struct V4l2Backend {
    source_id: String,
    device_path: String,
    state: Option<DeviceState>,
    width: u32,
    height: u32,
}

#[self_referencing]
struct DeviceState {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

impl V4l2Backend {
    pub fn connect(descriptor: &SourceDescriptor, index: u32) -> Result<Self> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let device_path = format!("/dev/video{}", index);
        let mut device = v4l::Device::with_path(&device_path)
            .with_context(|| format!("open v4l2 device {}", device_path))?;
        let mut format = device.format().context("read v4l2 format")?;
        format.fourcc = v4l::FourCC::new(b"RGB3");
        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!(
                    "V4l2Backend: failed to set RGB3 on {}: {}",
                    device_path,
                    err
                );
                device
                    .format()
                    .context("read v4l2 format after set failure")?
            }
        };
        if format.fourcc != v4l::FourCC::new(b"RGB3") {
            return Err(anyhow!(
                "v4l2 device {} does not deliver RGB24 (got {})",
                device_path,
                format.fourcc
            ));
        }

        let state = DeviceStateBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, STREAM_BUFFERS)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()?;

        log::info!(
            "V4l2Backend: connected to {} ({}x{})",
            device_path,
            format.width,
            format.height
        );
        Ok(Self {
            source_id: descriptor.id.clone(),
            device_path,
            state: Some(state),
            width: format.width,
            height: format.height,
        })
    }
}

impl StreamBackend for V4l2Backend {
    fn name(&self) -> &'static str {
        "v4l2"
    }

    fn read_frame(&mut self) -> Result<Frame> {
        use v4l::io::traits::CaptureStream;

        let state = self.state.as_mut().context("v4l2 device released")?;
        let pixels = state
            .with_mut(|fields| fields.stream.next().map(|(buf, _meta)| buf.to_vec()))
            .with_context(|| format!("capture v4l2 frame from {}", self.device_path))?;
        let expected = (self.width as usize) * (self.height as usize) * 3;
        if pixels.len() < expected {
            return Err(anyhow!(
                "short v4l2 frame from {}: {} of {} bytes",
                self.device_path,
                pixels.len(),
                expected
            ));
        }
        let mut pixels = pixels;
        pixels.truncate(expected);
        Frame::from_rgb(pixels, self.width, self.height, &self.source_id)
    }

    fn release(&mut self) {
        self.state = None;
    }
}
