//! Framebuffer capture
//!
//! Two consumers read the frame back: the pause blur, which freezes a
//! blurred copy of the world behind menus, and the screenshot writer,
//! which encodes a PNG on a background thread so the frame loop never
//! waits on disk.

use std::path::PathBuf;
use std::sync::mpsc::Sender;
use std::thread::JoinHandle;

use image::RgbaImage;
use log::{debug, error};

use crate::core::EngineEvent;
use crate::device::{Device, TextureFilter, TextureHandle, TextureParams};

/// 7x7 Gaussian kernel (sigma ~1) used for the pause blur.
const GAUSS_7X7: [[f32; 7]; 7] = [
    [0.000_000_67, 0.000_022_92, 0.000_191_17, 0.000_387_71, 0.000_191_17, 0.000_022_92, 0.000_000_67],
    [0.000_022_92, 0.000_786_34, 0.006_559_65, 0.013_303_73, 0.006_559_65, 0.000_786_33, 0.000_022_92],
    [0.000_191_17, 0.006_559_65, 0.054_721_57, 0.110_981_64, 0.054_721_57, 0.006_559_65, 0.000_191_17],
    [0.000_387_71, 0.013_303_73, 0.110_981_64, 0.225_083_52, 0.110_981_64, 0.013_303_73, 0.000_387_71],
    [0.000_191_17, 0.006_559_65, 0.054_721_57, 0.110_981_64, 0.054_721_57, 0.006_559_65, 0.000_191_17],
    [0.000_022_92, 0.000_786_33, 0.006_559_65, 0.013_303_73, 0.006_559_65, 0.000_786_33, 0.000_022_92],
    [0.000_000_67, 0.000_022_92, 0.000_191_17, 0.000_387_71, 0.000_191_17, 0.000_022_92, 0.000_000_67],
];

/// Quarter-size box downsample, averaging each 4x4 block.
fn downsample4(image: &RgbaImage) -> RgbaImage {
    let new_width = image.width() / 4;
    let new_height = image.height() / 4;

    RgbaImage::from_fn(new_width, new_height, |x, y| {
        let mut sum = [0.0f32; 4];
        for j in 0..4 {
            for i in 0..4 {
                let pixel = image.get_pixel(4 * x + i, 4 * y + j);
                for (k, acc) in sum.iter_mut().enumerate() {
                    *acc += f32::from(pixel[k]);
                }
            }
        }
        image::Rgba(sum.map(|c| (c / 16.0) as u8))
    })
}

/// 7x7 Gaussian blur with clamped edges.
fn gaussian_blur(image: &RgbaImage) -> RgbaImage {
    let width = image.width() as i32;
    let height = image.height() as i32;

    RgbaImage::from_fn(image.width(), image.height(), |x, y| {
        let mut sum = [0.0f32; 4];
        for j in -3i32..=3 {
            for i in -3i32..=3 {
                let xp = (x as i32 + i).clamp(0, width - 1) as u32;
                let yp = (y as i32 + j).clamp(0, height - 1) as u32;
                let weight = GAUSS_7X7[(i + 3) as usize][(j + 3) as usize];
                let pixel = image.get_pixel(xp, yp);
                for (k, acc) in sum.iter_mut().enumerate() {
                    *acc += weight * f32::from(pixel[k]);
                }
            }
        }
        image::Rgba(sum.map(|c| c.clamp(0.0, 255.0) as u8))
    })
}

/// Blurred frozen frame shown behind the interface while paused.
#[derive(Default)]
pub struct PauseBlur {
    texture: Option<TextureHandle>,
    pending: bool,
    captured: bool,
}

impl PauseBlur {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask for a capture at the end of the current frame.
    pub fn request(&mut self) {
        self.pending = true;
        self.captured = false;
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.pending
    }

    /// Whether a captured texture is ready to draw.
    #[must_use]
    pub fn is_captured(&self) -> bool {
        self.captured
    }

    #[must_use]
    pub fn texture(&self) -> Option<TextureHandle> {
        self.texture
    }

    /// Read the frame back, blur it and upload the pause texture.
    /// Returns false when the device cannot read pixels.
    pub fn capture(&mut self, device: &mut dyn Device) -> bool {
        self.pending = false;

        let Some(frame) = device.read_framebuffer() else {
            return false;
        };

        if let Some(old) = self.texture.take() {
            device.destroy_texture(old);
        }

        let blurred = gaussian_blur(&downsample4(&frame));
        let params = TextureParams {
            filter: TextureFilter::Bilinear,
            mipmap: false,
            repeat: false,
        };
        match device.create_texture(&blurred, &params, "pause-blur") {
            Some(texture) => {
                self.texture = Some(texture);
                self.captured = true;
                true
            }
            None => false,
        }
    }

    /// Drop the captured texture, forcing a fresh capture on the next
    /// pause.
    pub fn invalidate(&mut self, device: &mut dyn Device) {
        if let Some(texture) = self.texture.take() {
            device.destroy_texture(texture);
        }
        self.captured = false;
        self.pending = false;
    }
}

/// Encode the current frame as PNG on a background thread.
///
/// Completion is posted as [`EngineEvent::ScreenshotWritten`]; the
/// returned handle may be dropped to detach the thread.
pub fn write_screenshot(
    device: &mut dyn Device,
    path: PathBuf,
    events: Sender<EngineEvent>,
) -> Option<JoinHandle<()>> {
    let frame = device.read_framebuffer()?;

    Some(std::thread::spawn(move || {
        let ok = match frame.save(&path) {
            Ok(()) => {
                debug!("Screenshot saved to {}", path.display());
                true
            }
            Err(err) => {
                error!("Couldn't save screenshot: {err}");
                false
            }
        };
        events.send(EngineEvent::ScreenshotWritten { path, ok }).ok();
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::EventQueue;
    use crate::device::NullDevice;
    use image::Rgba;

    #[test]
    fn test_kernel_is_normalized() {
        let sum: f32 = GAUSS_7X7.iter().flatten().sum();
        assert!((sum - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_downsample_size() {
        let image = RgbaImage::new(64, 32);
        let small = downsample4(&image);
        assert_eq!(small.dimensions(), (16, 8));
    }

    #[test]
    fn test_downsample_averages_blocks() {
        let mut image = RgbaImage::from_pixel(8, 8, Rgba([0, 0, 0, 255]));
        // One white 4x4 block in an otherwise black image.
        for y in 0..4 {
            for x in 0..4 {
                image.put_pixel(x, y, Rgba([255, 255, 255, 255]));
            }
        }
        let small = downsample4(&image);
        assert_eq!(small.get_pixel(0, 0), &Rgba([255, 255, 255, 255]));
        assert_eq!(small.get_pixel(1, 0), &Rgba([0, 0, 0, 255]));
    }

    #[test]
    fn test_blur_preserves_flat_color() {
        let image = RgbaImage::from_pixel(16, 16, Rgba([200, 100, 50, 255]));
        let blurred = gaussian_blur(&image);
        let pixel = blurred.get_pixel(8, 8);
        // Kernel weights sum to one, so a flat image stays flat modulo
        // integer truncation.
        assert!((i32::from(pixel[0]) - 200).abs() <= 1);
        assert!((i32::from(pixel[1]) - 100).abs() <= 1);
        assert!((i32::from(pixel[2]) - 50).abs() <= 1);
    }

    #[test]
    fn test_pause_blur_capture() {
        let mut device = NullDevice::new(64, 64);
        device.begin_frame([0.5, 0.5, 0.5, 1.0]);

        let mut blur = PauseBlur::new();
        blur.request();
        assert!(blur.is_pending());

        assert!(blur.capture(&mut device));
        assert!(blur.is_captured());
        assert!(!blur.is_pending());
        assert!(blur.texture().is_some());

        blur.invalidate(&mut device);
        assert!(!blur.is_captured());
        assert!(blur.texture().is_none());
        assert_eq!(device.live_textures(), 0);
    }

    #[test]
    fn test_screenshot_posts_event() {
        let mut device = NullDevice::new(8, 8);
        device.begin_frame([0.0, 0.0, 0.0, 1.0]);

        let queue = EventQueue::new();
        let path = std::env::temp_dir().join("strata-screenshot-test.png");

        let handle = write_screenshot(&mut device, path.clone(), queue.sender()).unwrap();
        handle.join().unwrap();

        let events = queue.drain();
        assert_eq!(events.len(), 1);
        match &events[0] {
            EngineEvent::ScreenshotWritten { path: written, ok } => {
                assert!(*ok);
                assert_eq!(written, &path);
            }
            other => panic!("unexpected event {other:?}"),
        }
        std::fs::remove_file(&path).ok();
    }
}
