// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use image::DynamicImage;

use crate::errors::DeviceError;

// Returned by connect(). Identifies the device for logging.
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceHandle {
    pub name: String,
    pub description: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExposureRequest {
    pub exposure_duration: Duration,
    // None leaves the camera's gain as is.
    pub gain: Option<i32>,
}

// Outcome of ImagingDevice::configure(). Parameters the device cannot set are
// reported rather than failing the whole operation.
#[derive(Clone, Debug, PartialEq)]
pub enum ConfigureStatus {
    Applied,
    PartiallyApplied { unsupported: Vec<String> },
}

// One exposure. The correction loop owns it for a single iteration.
#[derive(Clone, Debug)]
pub struct CapturedImage {
    pub image: DynamicImage,

    // Increments for each capture from a given device.
    pub frame_id: u64,

    // Mid-exposure time.
    pub timestamp: SystemTime,

    pub exposure: Duration,
}

impl CapturedImage {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

// Contract a camera must satisfy, whatever drives it underneath (vendor SDK,
// instrument control protocol, files, simulator).
#[async_trait]
pub trait ImagingDevice: Send {
    async fn connect(&mut self) -> Result<DeviceHandle, DeviceError>;

    async fn configure(&mut self, request: &ExposureRequest)
                       -> Result<ConfigureStatus, DeviceError>;

    // Starts an exposure and returns once the image has been read out.
    async fn capture(&mut self) -> Result<CapturedImage, DeviceError>;

    async fn disconnect(&mut self) -> Result<(), DeviceError>;
}
