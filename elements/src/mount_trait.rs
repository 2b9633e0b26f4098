// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::time::Duration;

use async_trait::async_trait;

use crate::camera_trait::DeviceHandle;
use crate::coords::HorizontalPosition;
use crate::errors::DeviceError;

// Contract an alt/az mount must satisfy.
#[async_trait]
pub trait PointingDevice: Send {
    async fn connect(&mut self) -> Result<DeviceHandle, DeviceError>;

    // Commands a slew and returns once the mount has settled at `target`.
    // If `settle_timeout` elapses first the mount is stopped and Timeout is
    // returned; the mount is never left moving when this returns.
    async fn slew_to(&mut self, target: &HorizontalPosition,
                     settle_timeout: Duration) -> Result<(), DeviceError>;

    // Where the mount believes it is pointing.
    async fn current_position(&mut self)
                              -> Result<HorizontalPosition, DeviceError>;

    async fn disconnect(&mut self) -> Result<(), DeviceError>;
}
