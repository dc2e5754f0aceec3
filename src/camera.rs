//! Camera frame source.
//!
//! Provides `FrameSource` implementations for local V4L2 devices and a
//! synthetic source selected by a `stub://` device path. The synthetic
//! source keeps the service runnable and testable without hardware.

use image::RgbImage;
use ouroboros::self_referencing;

use crate::config::CameraConfig;
use crate::error::CameraError;

/// A single captured frame, RGB, frame-pixel coordinates.
pub struct Frame {
    pub image: RgbImage,
}

impl Frame {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// Source of visual frames. Capture is blocking; the loop runs it on the
/// blocking pool.
pub trait FrameSource: Send {
    /// Open the device. Called once at startup; failure is fatal to the
    /// session.
    fn acquire(&mut self) -> Result<(), CameraError>;

    /// Capture the current frame.
    fn current_frame(&mut self) -> Result<Frame, CameraError>;
}

/// Build a frame source from config. `stub://` paths select the synthetic
/// source.
pub fn open(config: &CameraConfig) -> Box<dyn FrameSource> {
    if config.device.starts_with("stub://") {
        Box::new(SyntheticCamera::new(config.clone()))
    } else {
        Box::new(V4l2Camera::new(config.clone()))
    }
}

// ----------------------------------------------------------------------------
// Synthetic source (stub://)
// ----------------------------------------------------------------------------

/// Synthetic camera producing gradient frames with a slowly moving block,
/// enough structure for the overlay renderer to draw something visible.
pub struct SyntheticCamera {
    config: CameraConfig,
    frame_count: u64,
}

impl SyntheticCamera {
    pub fn new(config: CameraConfig) -> Self {
        Self {
            config,
            frame_count: 0,
        }
    }
}

impl FrameSource for SyntheticCamera {
    fn acquire(&mut self) -> Result<(), CameraError> {
        tracing::info!("Camera connected: {} (synthetic)", self.config.device);
        Ok(())
    }

    fn current_frame(&mut self) -> Result<Frame, CameraError> {
        self.frame_count += 1;
        let (w, h) = (self.config.width, self.config.height);
        let shift = (self.frame_count * 4) as u32;

        let image = RgbImage::from_fn(w, h, |x, y| {
            let in_block = x.wrapping_sub(shift) % w < w / 8 && y > h / 4 && y < h / 2;
            if in_block {
                image::Rgb([220, 220, 220])
            } else {
                image::Rgb([(x % 256) as u8, (y % 256) as u8, 64])
            }
        });

        Ok(Frame { image })
    }
}

// ----------------------------------------------------------------------------
// V4L2 device source
// ----------------------------------------------------------------------------

pub struct V4l2Camera {
    config: CameraConfig,
    state: Option<DeviceState>,
    active_width: u32,
    active_height: u32,
    fourcc: [u8; 4],
}

#[self_referencing]
struct DeviceState {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

impl V4l2Camera {
    pub fn new(config: CameraConfig) -> Self {
        Self {
            active_width: config.width,
            active_height: config.height,
            config,
            state: None,
            fourcc: *b"RGB3",
        }
    }
}

impl FrameSource for V4l2Camera {
    fn acquire(&mut self) -> Result<(), CameraError> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let mut device = v4l::Device::with_path(&self.config.device).map_err(|e| {
            if e.kind() == std::io::ErrorKind::PermissionDenied {
                CameraError::AccessDenied(format!("{}: {e}", self.config.device))
            } else {
                CameraError::DeviceUnavailable(format!("{}: {e}", self.config.device))
            }
        })?;

        let mut format = device
            .format()
            .map_err(|e| CameraError::DeviceUnavailable(format!("read format: {e}")))?;
        format.width = self.config.width;
        format.height = self.config.height;
        format.fourcc = v4l::FourCC::new(b"RGB3");

        // Not every device offers RGB3; fall back to whatever it negotiates
        // and convert at capture time.
        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(e) => {
                tracing::warn!("Failed to set format on {}: {e}", self.config.device);
                device
                    .format()
                    .map_err(|e| CameraError::DeviceUnavailable(format!("read format: {e}")))?
            }
        };

        self.active_width = format.width;
        self.active_height = format.height;
        self.fourcc = format.fourcc.repr;

        let state = DeviceStateBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
                    .map_err(|e| CameraError::DeviceUnavailable(format!("buffer stream: {e}")))
            },
        }
        .try_build()?;
        self.state = Some(state);

        tracing::info!(
            "Camera connected: {} ({}x{}, {})",
            self.config.device,
            self.active_width,
            self.active_height,
            String::from_utf8_lossy(&self.fourcc),
        );
        Ok(())
    }

    fn current_frame(&mut self) -> Result<Frame, CameraError> {
        use v4l::io::traits::CaptureStream;

        let state = self
            .state
            .as_mut()
            .ok_or_else(|| CameraError::DeviceUnavailable("device not acquired".into()))?;

        let (buf, _meta) = state
            .with_mut(|fields| fields.stream.next())
            .map_err(|e| CameraError::DeviceUnavailable(format!("capture: {e}")))?;

        let image = match &self.fourcc {
            b"RGB3" => RgbImage::from_raw(self.active_width, self.active_height, buf.to_vec())
                .ok_or_else(|| {
                    CameraError::DeviceUnavailable("frame buffer shorter than expected".into())
                })?,
            b"MJPG" | b"JPEG" => image::load_from_memory(buf)
                .map_err(|e| CameraError::DeviceUnavailable(format!("decode frame: {e}")))?
                .to_rgb8(),
            other => {
                return Err(CameraError::DeviceUnavailable(format!(
                    "unsupported pixel format {}",
                    String::from_utf8_lossy(other)
                )))
            }
        };

        Ok(Frame { image })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stub_config() -> CameraConfig {
        CameraConfig {
            device: "stub://test".to_string(),
            width: 320,
            height: 240,
        }
    }

    #[test]
    fn synthetic_camera_produces_frames() {
        let mut camera = SyntheticCamera::new(stub_config());
        camera.acquire().unwrap();

        let frame = camera.current_frame().unwrap();
        assert_eq!(frame.width(), 320);
        assert_eq!(frame.height(), 240);
    }

    #[test]
    fn synthetic_frames_change_over_time() {
        let mut camera = SyntheticCamera::new(stub_config());
        camera.acquire().unwrap();

        let first = camera.current_frame().unwrap();
        let second = camera.current_frame().unwrap();
        assert_ne!(first.image.as_raw(), second.image.as_raw());
    }

    #[test]
    fn stub_device_selects_synthetic_source() {
        let mut source = open(&stub_config());
        assert!(source.acquire().is_ok());
    }
}
