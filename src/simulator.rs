// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Simulated camera, mount and plate solver that share one model of the sky.
//!
//! The mount has a systematic pointing error: where it really points is its
//! reported position plus a fixed altitude/azimuth offset. The camera records
//! the true pointing for every frame it "exposes", and the solver reports that
//! true pointing back as an equatorial position. This closes the loop the same
//! way real hardware does, and lets tests inject faults and inspect the order
//! of device operations.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use image::{DynamicImage, GrayImage};
use log::debug;
use rand::Rng;
use tokio::time::sleep;

use cedar_goto_elements::astro_util::{to_equatorial, to_horizontal};
use cedar_goto_elements::camera_trait::{CapturedImage, ConfigureStatus,
                                        DeviceHandle, ExposureRequest,
                                        ImagingDevice};
use cedar_goto_elements::coords::{Epoch, EquatorialPosition,
                                  HorizontalPosition, ObserverFrame};
use cedar_goto_elements::errors::{DeviceError, DomainError, SolveError};
use cedar_goto_elements::mount_trait::PointingDevice;
use cedar_goto_elements::solver_trait::{PlateSolver, SolveResult};

// How long a hung capture blocks. Far longer than any capture deadline.
const HUNG_CAPTURE: Duration = Duration::from_secs(24 * 3600);

#[derive(Clone, Debug, PartialEq)]
pub enum SimEvent {
    CameraConnected,
    CameraConfigured,
    ExposureStarted(u64),
    ExposureFinished(u64),
    CameraDisconnected,
    MountConnected,
    SlewStarted(HorizontalPosition),
    SlewFinished,
    PositionRead,
    MountDisconnected,
}

struct SkyState {
    // Where the mount believes it points. For a tracking mount this is only
    // the position at the end of the last slew.
    reported: HorizontalPosition,
    // Sky position a tracking mount follows.
    tracked: Option<EquatorialPosition>,
    // True pointing minus reported pointing, degrees.
    alt_error: f64,
    az_error: f64,
    // Frame id -> true pointing and mid-exposure time.
    exposures: HashMap<u64, (HorizontalPosition, SystemTime)>,
    events: Vec<SimEvent>,
    // Device operations currently underway, across camera and mount.
    in_flight: u32,
    overlap_detected: bool,
}

pub struct SimulatedSky {
    observer: ObserverFrame,
    state: Mutex<SkyState>,
}

impl SimulatedSky {
    pub fn new(observer: ObserverFrame, start: HorizontalPosition) -> Arc<Self> {
        Arc::new(SimulatedSky {
            observer,
            state: Mutex::new(SkyState {
                reported: start,
                tracked: None,
                alt_error: 0.0,
                az_error: 0.0,
                exposures: HashMap::new(),
                events: vec![],
                in_flight: 0,
                overlap_detected: false,
            }),
        })
    }

    // Sky whose mount tracks sidereal motion, starting out following `start`.
    pub fn tracking(observer: ObserverFrame, start: EquatorialPosition)
                    -> Result<Arc<Self>, DomainError> {
        let sky = Self::new(observer, to_horizontal(&start, &observer)?);
        sky.state.lock().unwrap().tracked = Some(start);
        Ok(sky)
    }

    pub fn observer(&self) -> ObserverFrame {
        self.observer
    }

    pub fn set_pointing_error(&self, alt_error: f64, az_error: f64) {
        let mut state = self.state.lock().unwrap();
        state.alt_error = alt_error;
        state.az_error = az_error;
    }

    pub fn reported_position(&self) -> HorizontalPosition {
        let state = self.state.lock().unwrap();
        self.reported_at(&state, SystemTime::now())
    }

    pub fn true_position(&self) -> HorizontalPosition {
        let state = self.state.lock().unwrap();
        self.true_at(&state, SystemTime::now())
    }

    fn reported_at(&self, state: &SkyState, time: SystemTime) -> HorizontalPosition {
        match &state.tracked {
            None => state.reported,
            Some(tracked) => to_horizontal(tracked, &self.observer.at(time))
                .unwrap_or(state.reported),
        }
    }

    fn true_at(&self, state: &SkyState, time: SystemTime) -> HorizontalPosition {
        let reported = self.reported_at(state, time);
        HorizontalPosition::new(
            (reported.altitude() + state.alt_error).clamp(-90.0, 90.0),
            reported.azimuth() + state.az_error)
    }

    fn arrive(&self, position: HorizontalPosition) {
        let mut state = self.state.lock().unwrap();
        state.reported = position;
        if state.tracked.is_some() {
            state.tracked = to_equatorial(&position,
                                          &self.observer.at(SystemTime::now()),
                                          Epoch::J2000).ok();
        }
    }

    pub fn events(&self) -> Vec<SimEvent> {
        self.state.lock().unwrap().events.clone()
    }

    pub fn count(&self, event: &SimEvent) -> usize {
        self.state.lock().unwrap().events.iter().filter(|e| *e == event).count()
    }

    // Index of the first occurrence of `event`.
    pub fn position_of(&self, event: &SimEvent) -> Option<usize> {
        self.state.lock().unwrap().events.iter().position(|e| e == event)
    }

    // True if a capture and a slew (or two of either) were ever in progress
    // at the same time.
    pub fn overlap_detected(&self) -> bool {
        self.state.lock().unwrap().overlap_detected
    }

    fn record(&self, event: SimEvent) {
        self.state.lock().unwrap().events.push(event);
    }

    // Marks a device operation as underway until the returned guard drops.
    fn begin(self: &Arc<Self>, event: SimEvent, end_event: SimEvent) -> OperationGuard {
        let mut state = self.state.lock().unwrap();
        if state.in_flight > 0 {
            state.overlap_detected = true;
        }
        state.in_flight += 1;
        state.events.push(event);
        OperationGuard{sky: self.clone(), end_event: Some(end_event)}
    }

    fn record_exposure(&self, frame_id: u64, timestamp: SystemTime) {
        let mut state = self.state.lock().unwrap();
        let pointing = self.true_at(&state, timestamp);
        state.exposures.insert(frame_id, (pointing, timestamp));
    }

    fn take_exposure(&self, frame_id: u64) -> Option<(HorizontalPosition, SystemTime)> {
        self.state.lock().unwrap().exposures.remove(&frame_id)
    }
}

// Ends an in-flight operation, also when its future is dropped part way.
struct OperationGuard {
    sky: Arc<SimulatedSky>,
    end_event: Option<SimEvent>,
}

impl OperationGuard {
    // Finished without the normal end event, e.g. because of an injected
    // fault.
    fn abandon(mut self) {
        self.end_event = None;
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        let mut state = self.sky.state.lock().unwrap();
        state.in_flight -= 1;
        if let Some(event) = self.end_event.take() {
            state.events.push(event);
        }
    }
}

#[derive(Clone, Debug)]
pub enum CaptureFault {
    Fail(DeviceError),
    // Never completes.
    Hang,
}

pub struct SimulatedCamera {
    sky: Arc<SimulatedSky>,
    width: u32,
    height: u32,
    supports_gain: bool,
    connected: bool,
    frame_id: u64,
    exposure_duration: Duration,
    // Frames are stamped this much earlier than they really were taken, as
    // if readout and transfer took that long.
    frame_lag: Duration,

    // Consumed by successive captures; an empty queue means success.
    capture_faults: VecDeque<CaptureFault>,
    connect_fault: Option<DeviceError>,
    disconnect_fault: Option<DeviceError>,
}

impl SimulatedCamera {
    pub fn new(sky: Arc<SimulatedSky>) -> Self {
        SimulatedCamera {
            sky,
            width: 64,
            height: 48,
            supports_gain: true,
            connected: false,
            frame_id: 0,
            exposure_duration: Duration::ZERO,
            frame_lag: Duration::ZERO,
            capture_faults: VecDeque::new(),
            connect_fault: None,
            disconnect_fault: None,
        }
    }

    pub fn without_gain(mut self) -> Self {
        self.supports_gain = false;
        self
    }

    pub fn with_frame_lag(mut self, frame_lag: Duration) -> Self {
        self.frame_lag = frame_lag;
        self
    }

    pub fn with_capture_faults(mut self, faults: Vec<CaptureFault>) -> Self {
        self.capture_faults = faults.into();
        self
    }

    pub fn with_connect_fault(mut self, fault: DeviceError) -> Self {
        self.connect_fault = Some(fault);
        self
    }

    pub fn with_disconnect_fault(mut self, fault: DeviceError) -> Self {
        self.disconnect_fault = Some(fault);
        self
    }
}

#[async_trait]
impl ImagingDevice for SimulatedCamera {
    async fn connect(&mut self) -> Result<DeviceHandle, DeviceError> {
        if let Some(fault) = self.connect_fault.take() {
            return Err(fault);
        }
        self.connected = true;
        self.sky.record(SimEvent::CameraConnected);
        Ok(DeviceHandle{name: "sim-camera".to_string(),
                        description: format!("Simulated {}x{} camera",
                                             self.width, self.height)})
    }

    async fn configure(&mut self, request: &ExposureRequest)
                       -> Result<ConfigureStatus, DeviceError> {
        if !self.connected {
            return Err(DeviceError::NotConnected);
        }
        self.exposure_duration = request.exposure_duration;
        self.sky.record(SimEvent::CameraConfigured);
        if request.gain.is_some() && !self.supports_gain {
            return Ok(ConfigureStatus::PartiallyApplied{
                unsupported: vec!["gain".to_string()]});
        }
        Ok(ConfigureStatus::Applied)
    }

    async fn capture(&mut self) -> Result<CapturedImage, DeviceError> {
        if !self.connected {
            return Err(DeviceError::NotConnected);
        }
        self.frame_id += 1;
        let frame_id = self.frame_id;
        let guard = self.sky.begin(SimEvent::ExposureStarted(frame_id),
                                   SimEvent::ExposureFinished(frame_id));
        let start = SystemTime::now();
        match self.capture_faults.pop_front() {
            Some(CaptureFault::Hang) => {
                sleep(HUNG_CAPTURE).await;
                guard.abandon();
                return Err(DeviceError::Timeout);
            }
            Some(CaptureFault::Fail(e)) => {
                guard.abandon();
                return Err(e);
            }
            None => (),
        }
        sleep(self.exposure_duration).await;
        let mid_exposure = start + self.exposure_duration / 2;
        let timestamp = mid_exposure.checked_sub(self.frame_lag).unwrap_or(mid_exposure);
        self.sky.record_exposure(frame_id, timestamp);
        drop(guard);
        Ok(CapturedImage {
            image: DynamicImage::ImageLuma8(GrayImage::new(self.width, self.height)),
            frame_id,
            timestamp,
            exposure: self.exposure_duration,
        })
    }

    async fn disconnect(&mut self) -> Result<(), DeviceError> {
        self.connected = false;
        self.sky.record(SimEvent::CameraDisconnected);
        match self.disconnect_fault.take() {
            Some(fault) => Err(fault),
            None => Ok(()),
        }
    }
}

// Invoked when a slew starts.
pub struct Callback(Box<dyn Fn() + Send + Sync>);

pub struct SimulatedMount {
    sky: Arc<SimulatedSky>,
    connected: bool,
    slew_duration: Duration,
    // Random error (degrees, each axis) added to where a slew ends up.
    slew_jitter: f64,

    slew_faults: VecDeque<DeviceError>,
    readback_faults: VecDeque<DeviceError>,
    connect_fault: Option<DeviceError>,
    disconnect_fault: Option<DeviceError>,
    on_slew: Option<Callback>,
}

impl SimulatedMount {
    pub fn new(sky: Arc<SimulatedSky>) -> Self {
        SimulatedMount {
            sky,
            connected: false,
            slew_duration: Duration::from_secs(2),
            slew_jitter: 0.0,
            slew_faults: VecDeque::new(),
            readback_faults: VecDeque::new(),
            connect_fault: None,
            disconnect_fault: None,
            on_slew: None,
        }
    }

    pub fn with_slew_duration(mut self, slew_duration: Duration) -> Self {
        self.slew_duration = slew_duration;
        self
    }

    pub fn with_slew_jitter(mut self, degrees: f64) -> Self {
        self.slew_jitter = degrees.abs();
        self
    }

    pub fn with_slew_faults(mut self, faults: Vec<DeviceError>) -> Self {
        self.slew_faults = faults.into();
        self
    }

    pub fn with_readback_faults(mut self, faults: Vec<DeviceError>) -> Self {
        self.readback_faults = faults.into();
        self
    }

    pub fn with_connect_fault(mut self, fault: DeviceError) -> Self {
        self.connect_fault = Some(fault);
        self
    }

    pub fn with_disconnect_fault(mut self, fault: DeviceError) -> Self {
        self.disconnect_fault = Some(fault);
        self
    }

    pub fn on_slew(mut self, callback: Box<dyn Fn() + Send + Sync>) -> Self {
        self.on_slew = Some(Callback(callback));
        self
    }

    fn jitter(&self) -> f64 {
        if self.slew_jitter == 0.0 {
            return 0.0;
        }
        rand::thread_rng().gen_range(-self.slew_jitter..=self.slew_jitter)
    }
}

#[async_trait]
impl PointingDevice for SimulatedMount {
    async fn connect(&mut self) -> Result<DeviceHandle, DeviceError> {
        if let Some(fault) = self.connect_fault.take() {
            return Err(fault);
        }
        self.connected = true;
        self.sky.record(SimEvent::MountConnected);
        Ok(DeviceHandle{name: "sim-mount".to_string(),
                        description: "Simulated alt-az mount".to_string()})
    }

    async fn slew_to(&mut self, target: &HorizontalPosition,
                     _settle_timeout: Duration) -> Result<(), DeviceError> {
        if !self.connected {
            return Err(DeviceError::NotConnected);
        }
        let guard = self.sky.begin(SimEvent::SlewStarted(*target),
                                   SimEvent::SlewFinished);
        if let Some(ref cb) = self.on_slew {
            cb.0();
        }
        sleep(self.slew_duration).await;
        if let Some(fault) = self.slew_faults.pop_front() {
            guard.abandon();
            return Err(fault);
        }
        let arrived = HorizontalPosition::new(target.altitude() + self.jitter(),
                                              target.azimuth() + self.jitter());
        debug!("Simulated mount arrived at {}", arrived);
        self.sky.arrive(arrived);
        drop(guard);
        Ok(())
    }

    async fn current_position(&mut self) -> Result<HorizontalPosition, DeviceError> {
        if !self.connected {
            return Err(DeviceError::NotConnected);
        }
        self.sky.record(SimEvent::PositionRead);
        if let Some(fault) = self.readback_faults.pop_front() {
            return Err(fault);
        }
        Ok(self.sky.reported_position())
    }

    async fn disconnect(&mut self) -> Result<(), DeviceError> {
        self.connected = false;
        self.sky.record(SimEvent::MountDisconnected);
        match self.disconnect_fault.take() {
            Some(fault) => Err(fault),
            None => Ok(()),
        }
    }
}

#[derive(Clone, Debug)]
pub enum SolverBehavior {
    // Report where the camera really pointed.
    TrueSky,
    // Always report this position.
    Fixed(EquatorialPosition),
    Fail(SolveError),
}

pub struct SimulatedSolver {
    sky: Arc<SimulatedSky>,
    behavior: SolverBehavior,
    // Results returned, in order, before falling back to `behavior`.
    scripted: Mutex<VecDeque<SolveResult>>,
    solve_duration: Duration,
    calls: AtomicU32,
}

impl SimulatedSolver {
    pub fn new(sky: Arc<SimulatedSky>, behavior: SolverBehavior) -> Self {
        SimulatedSolver {
            sky,
            behavior,
            scripted: Mutex::new(VecDeque::new()),
            solve_duration: Duration::from_millis(500),
            calls: AtomicU32::new(0),
        }
    }

    pub fn with_script(self, results: Vec<SolveResult>) -> Self {
        *self.scripted.lock().unwrap() = results.into();
        self
    }

    pub fn with_solve_duration(mut self, solve_duration: Duration) -> Self {
        self.solve_duration = solve_duration;
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl PlateSolver for SimulatedSolver {
    async fn solve(&self, image: &CapturedImage, timeout: Duration) -> SolveResult {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let exposure = self.sky.take_exposure(image.frame_id);
        if self.solve_duration > timeout {
            sleep(timeout).await;
            return SolveResult::failed(SolveError::Timeout);
        }
        sleep(self.solve_duration).await;

        let scripted = self.scripted.lock().unwrap().pop_front();
        if let Some(result) = scripted {
            return result;
        }
        match &self.behavior {
            SolverBehavior::Fixed(position) => {
                SolveResult::Solved{position: *position, confidence: 1.0}
            }
            SolverBehavior::Fail(reason) => SolveResult::failed(reason.clone()),
            SolverBehavior::TrueSky => {
                let Some((pointing, timestamp)) = exposure else {
                    return SolveResult::failed(SolveError::NoMatch);
                };
                match to_equatorial(&pointing, &self.sky.observer().at(timestamp),
                                    Epoch::J2000) {
                    Ok(position) => SolveResult::Solved{position, confidence: 1.0},
                    Err(e) => SolveResult::failed(
                        SolveError::MalformedResult(e.to_string())),
                }
            }
        }
    }

    fn name(&self) -> &str {
        "simulated"
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use cedar_goto_elements::astro_util::{horizontal_separation, to_horizontal};

    use super::*;

    fn sky() -> Arc<SimulatedSky> {
        let observer = ObserverFrame::new(40.0, -105.0, 1600.0, SystemTime::now());
        SimulatedSky::new(observer, HorizontalPosition::new(50.0, 180.0))
    }

    #[tokio::test(start_paused = true)]
    async fn test_solver_reports_true_pointing() {
        let sky = sky();
        sky.set_pointing_error(0.5, -1.0);
        let mut camera = SimulatedCamera::new(sky.clone());
        let solver = SimulatedSolver::new(sky.clone(), SolverBehavior::TrueSky);
        camera.connect().await.unwrap();
        camera.configure(&ExposureRequest{exposure_duration: Duration::from_secs(1),
                                          gain: None}).await.unwrap();
        let image = camera.capture().await.unwrap();
        let SolveResult::Solved{position, ..} =
            solver.solve(&image, Duration::from_secs(10)).await else {
            panic!("expected a solution");
        };
        let hz = to_horizontal(&position, &sky.observer().at(image.timestamp)).unwrap();
        assert_abs_diff_eq!(hz.altitude(), 50.5, epsilon = 1e-6);
        assert_abs_diff_eq!(hz.azimuth(), 179.0, epsilon = 1e-6);

        // The exposure record is consumed.
        assert_eq!(solver.solve(&image, Duration::from_secs(10)).await,
                   SolveResult::failed(SolveError::NoMatch));
    }

    #[tokio::test(start_paused = true)]
    async fn test_mount_slew_and_error_model() {
        let sky = sky();
        sky.set_pointing_error(1.0, 0.0);
        let mut mount = SimulatedMount::new(sky.clone());
        mount.connect().await.unwrap();
        let target = HorizontalPosition::new(30.0, 90.0);
        mount.slew_to(&target, Duration::from_secs(60)).await.unwrap();
        assert_eq!(mount.current_position().await.unwrap(), target);
        let actual = sky.true_position();
        assert_abs_diff_eq!(actual.altitude(), 31.0, epsilon = 1e-9);
        assert_abs_diff_eq!(
            horizontal_separation(&target, &actual), 1.0, epsilon = 1e-9);
        assert_eq!(sky.events()[1..], [SimEvent::SlewStarted(target),
                                       SimEvent::SlewFinished,
                                       SimEvent::PositionRead]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tracking_mount_follows_sky() {
        let observer = ObserverFrame::new(40.0, -105.0, 1600.0, SystemTime::now());
        let star = EquatorialPosition::new(83.8, -5.4, Epoch::J2000);
        let sky = SimulatedSky::tracking(observer, star).unwrap();
        let now = SystemTime::now();
        let later = now + Duration::from_secs(600);
        {
            let state = sky.state.lock().unwrap();
            let early = sky.reported_at(&state, now);
            let late = sky.reported_at(&state, later);
            // Ten minutes of sidereal motion.
            assert!(horizontal_separation(&early, &late) > 2.0);
            let expected = to_horizontal(&star, &observer.at(later)).unwrap();
            assert_abs_diff_eq!(horizontal_separation(&late, &expected), 0.0,
                                epsilon = 1e-9);
        }

        // After a slew the mount follows whatever it arrived at.
        let mut mount = SimulatedMount::new(sky.clone());
        mount.connect().await.unwrap();
        let target = HorizontalPosition::new(30.0, 150.0);
        mount.slew_to(&target, Duration::from_secs(60)).await.unwrap();
        let reported = mount.current_position().await.unwrap();
        assert!(horizontal_separation(&reported, &target) < 0.01);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_capture_is_cleaned_up() {
        let sky = sky();
        let mut camera = SimulatedCamera::new(sky.clone())
            .with_capture_faults(vec![CaptureFault::Hang]);
        camera.connect().await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), camera.capture()).await;
        assert!(result.is_err());
        // The abandoned exposure no longer counts as in flight.
        let mut mount = SimulatedMount::new(sky.clone());
        mount.connect().await.unwrap();
        mount.slew_to(&HorizontalPosition::new(10.0, 10.0), Duration::from_secs(60))
            .await.unwrap();
        assert!(!sky.overlap_detected());
    }
}
