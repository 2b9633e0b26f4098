// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fmt;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use log::{error, info, warn};

use cedar_goto_elements::camera_trait::ImagingDevice;
use cedar_goto_elements::errors::{DeviceError, SessionError, Stage};
use cedar_goto_elements::mount_trait::PointingDevice;
use cedar_goto_elements::solver_trait::PlateSolver;

use crate::correction_loop::{CancelToken, CorrectionSession, SessionOutcome,
                             SessionParams};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceKind {
    Camera,
    Mount,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Camera => f.write_str("camera"),
            DeviceKind::Mount => f.write_str("mount"),
        }
    }
}

#[derive(Debug)]
pub struct SessionReport {
    pub outcome: SessionOutcome,

    // Failures while disconnecting. These are reported alongside the outcome
    // and never replace it.
    pub cleanup_faults: Vec<(DeviceKind, DeviceError)>,
}

/// Connects both devices, runs a correction session, and disconnects every
/// device that was connected. Disconnect is attempted exactly once per
/// connected device whatever the outcome, including cancellation and faults
/// raised from inside the loop.
pub async fn run_session(camera: &mut dyn ImagingDevice,
                         mount: &mut dyn PointingDevice,
                         solver: &dyn PlateSolver,
                         params: &SessionParams,
                         cancel: CancelToken) -> SessionReport {
    let camera_handle = match camera.connect().await {
        Ok(handle) => handle,
        Err(e) => {
            error!("Could not connect camera: {}", e);
            return SessionReport{outcome: connect_failure(e),
                                 cleanup_faults: vec![]};
        }
    };
    info!("Connected camera {} ({})", camera_handle.name, camera_handle.description);

    let mount_handle = match mount.connect().await {
        Ok(handle) => handle,
        Err(e) => {
            error!("Could not connect mount: {}", e);
            let mut cleanup_faults = vec![];
            if let Err(disconnect_error) = camera.disconnect().await {
                warn!("Camera disconnect failed: {}", disconnect_error);
                cleanup_faults.push((DeviceKind::Camera, disconnect_error));
            }
            return SessionReport{outcome: connect_failure(e), cleanup_faults};
        }
    };
    info!("Connected mount {} ({})", mount_handle.name, mount_handle.description);

    let session = CorrectionSession::new(params, &mut *camera, &mut *mount,
                                         solver, cancel);
    let progress = session.progress();
    let outcome = match AssertUnwindSafe(session.run()).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!("Correction loop panicked: {}", message);
            SessionOutcome::Aborted{reason: SessionError::Panicked(message),
                                    iterations: progress.iterations(),
                                    last_error: progress.last_error()}
        }
    };

    // The loop has returned, so no device operation is in flight.
    let (camera_result, mount_result) =
        futures::join!(camera.disconnect(), mount.disconnect());
    let mut cleanup_faults = vec![];
    for (kind, result) in [(DeviceKind::Camera, camera_result),
                           (DeviceKind::Mount, mount_result)] {
        match result {
            Ok(()) => info!("Disconnected {}", kind),
            Err(e) => {
                warn!("{} disconnect failed: {}", kind, e);
                cleanup_faults.push((kind, e));
            }
        }
    }
    SessionReport{outcome, cleanup_faults}
}

fn connect_failure(error: DeviceError) -> SessionOutcome {
    SessionOutcome::Aborted {
        reason: SessionError::Device{stage: Stage::Connect, error},
        iterations: 0,
        last_error: None,
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
