// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use canonical_error::{CanonicalError, failed_precondition_error,
                      invalid_argument_error, unavailable_error};
use image::ImageReader;
use log::{debug, info};

use cedar_goto_elements::camera_trait::{CapturedImage, ConfigureStatus,
                                        DeviceHandle, ExposureRequest,
                                        ImagingDevice};
use cedar_goto_elements::errors::DeviceError;

const IMAGE_EXTENSIONS: [&str; 6] = ["png", "jpg", "jpeg", "tif", "tiff", "bmp"];

// Camera stand-in that replays previously recorded frames from a directory,
// in file name order, wrapping around at the end. Useful for exercising a
// solver against real sky images without hardware.
pub struct ImageFileCamera {
    dir: PathBuf,
    files: Vec<PathBuf>,
    next_file: usize,
    frame_id: u64,
    exposure_duration: Duration,
    connected: bool,
}

impl ImageFileCamera {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        ImageFileCamera {
            dir: dir.into(),
            files: vec![],
            next_file: 0,
            frame_id: 0,
            exposure_duration: Duration::ZERO,
            connected: false,
        }
    }

    fn list_images(dir: &Path) -> Result<Vec<PathBuf>, CanonicalError> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                return Err(unavailable_error(
                    format!("Cannot read {:?}: {:?}", dir, e).as_str()));
            }
        };
        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| IMAGE_EXTENSIONS.contains(
                        &ext.to_ascii_lowercase().as_str()))
            })
            .collect();
        if files.is_empty() {
            return Err(invalid_argument_error(
                format!("No image files in {:?}", dir).as_str()));
        }
        files.sort();
        Ok(files)
    }

    fn load(path: &Path) -> Result<image::DynamicImage, CanonicalError> {
        let reader = match ImageReader::open(path) {
            Ok(reader) => reader,
            Err(e) => {
                return Err(unavailable_error(
                    format!("Cannot open {:?}: {:?}", path, e).as_str()));
            }
        };
        match reader.decode() {
            Ok(image) => Ok(image),
            Err(e) => Err(unavailable_error(
                format!("Cannot decode {:?}: {:?}", path, e).as_str())),
        }
    }
}

#[async_trait]
impl ImagingDevice for ImageFileCamera {
    async fn connect(&mut self) -> Result<DeviceHandle, DeviceError> {
        self.files = Self::list_images(&self.dir)?;
        self.next_file = 0;
        self.connected = true;
        info!("Replaying {} image(s) from {:?}", self.files.len(), self.dir);
        Ok(DeviceHandle{name: "image-files".to_string(),
                        description: format!("{}", self.dir.display())})
    }

    async fn configure(&mut self, request: &ExposureRequest)
                       -> Result<ConfigureStatus, DeviceError> {
        if !self.connected {
            return Err(DeviceError::NotConnected);
        }
        self.exposure_duration = request.exposure_duration;
        if request.gain.is_some() {
            return Ok(ConfigureStatus::PartiallyApplied{
                unsupported: vec!["gain".to_string()]});
        }
        Ok(ConfigureStatus::Applied)
    }

    async fn capture(&mut self) -> Result<CapturedImage, DeviceError> {
        if !self.connected {
            return Err(failed_precondition_error("Camera not connected").into());
        }
        let start = SystemTime::now();
        tokio::time::sleep(self.exposure_duration).await;

        let path = self.files[self.next_file].clone();
        self.next_file = (self.next_file + 1) % self.files.len();
        let image = match tokio::task::spawn_blocking(move || Self::load(&path)).await {
            Ok(result) => result?,
            Err(e) => return Err(DeviceError::HardwareFault(format!("{:?}", e))),
        };
        self.frame_id += 1;
        debug!("Frame {} from image file", self.frame_id);
        Ok(CapturedImage {
            image,
            frame_id: self.frame_id,
            // Mid-exposure.
            timestamp: start + self.exposure_duration / 2,
            exposure: self.exposure_duration,
        })
    }

    async fn disconnect(&mut self) -> Result<(), DeviceError> {
        self.connected = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use image::GrayImage;

    use super::*;

    fn write_images(dir: &Path) {
        GrayImage::new(8, 6).save(dir.join("b.png")).unwrap();
        GrayImage::new(4, 3).save(dir.join("a.png")).unwrap();
        std::fs::write(dir.join("notes.txt"), "not an image").unwrap();
    }

    #[tokio::test]
    async fn test_replay_in_order() {
        let dir = tempfile::tempdir().unwrap();
        write_images(dir.path());
        let mut camera = ImageFileCamera::new(dir.path());
        camera.connect().await.unwrap();
        let status = camera.configure(&ExposureRequest{
            exposure_duration: Duration::from_millis(1), gain: None}).await;
        assert_eq!(status, Ok(ConfigureStatus::Applied));

        let first = camera.capture().await.unwrap();
        let second = camera.capture().await.unwrap();
        let third = camera.capture().await.unwrap();
        assert_eq!((first.width(), first.height()), (4, 3));
        assert_eq!((second.width(), second.height()), (8, 6));
        assert_eq!((third.width(), third.height()), (4, 3));
        assert_eq!(third.frame_id, 3);
        camera.disconnect().await.unwrap();
        assert_eq!(camera.capture().await.unwrap_err(), DeviceError::NotConnected);
    }

    #[tokio::test]
    async fn test_gain_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        write_images(dir.path());
        let mut camera = ImageFileCamera::new(dir.path());
        camera.connect().await.unwrap();
        let status = camera.configure(&ExposureRequest{
            exposure_duration: Duration::from_millis(1), gain: Some(100)}).await;
        assert_eq!(status, Ok(ConfigureStatus::PartiallyApplied{
            unsupported: vec!["gain".to_string()]}));
    }

    #[tokio::test]
    async fn test_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut camera = ImageFileCamera::new(dir.path());
        assert!(matches!(camera.connect().await, Err(DeviceError::Rejected(_))));
        let mut missing = ImageFileCamera::new(dir.path().join("missing"));
        assert!(matches!(missing.connect().await, Err(DeviceError::HardwareFault(_))));
    }
}
