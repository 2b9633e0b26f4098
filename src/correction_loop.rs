// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, SystemTime};

use log::{debug, info, warn};
use tokio::time::{sleep, timeout};

use cedar_goto_elements::astro_util::{pointing_error, precess, to_horizontal};
use cedar_goto_elements::camera_trait::{CapturedImage, ConfigureStatus,
                                        ExposureRequest, ImagingDevice};
use cedar_goto_elements::coords::{EquatorialPosition, HorizontalPosition,
                                  ObserverFrame, PointingError};
use cedar_goto_elements::errors::{DeviceError, SessionError, SolveError, Stage};
use cedar_goto_elements::mount_trait::PointingDevice;
use cedar_goto_elements::solver_trait::{PlateSolver, SolveResult};

// Extra time granted to a solver beyond the timeout it was handed, before we
// stop waiting for it ourselves.
const SOLVE_GRACE: Duration = Duration::from_secs(5);

// Set by whoever wants the session to stop (e.g. a control-c handler). The
// loop looks at it before each state transition; operations already in flight
// run to completion.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        CancelToken(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

// Iteration count and last pointing error, as published by a running
// session. Readable after the session future is gone, e.g. when it panicked.
#[derive(Debug, Default)]
pub struct LoopProgress {
    iterations: AtomicU32,
    last_error: Mutex<Option<PointingError>>,
}

impl LoopProgress {
    pub fn iterations(&self) -> u32 {
        self.iterations.load(Ordering::Relaxed)
    }

    pub fn last_error(&self) -> Option<PointingError> {
        *self.last_error.lock().unwrap()
    }
}

// Retry, timeout and convergence policy. Immutable for a session.
#[derive(Clone, Debug)]
pub struct LoopParams {
    // Converged once target and solved position are this close (degrees).
    pub tolerance_deg: f64,

    // Capture/solve/evaluate cycles allowed before giving up.
    pub max_iterations: u32,

    // Consecutive solve failures allowed before giving up.
    pub max_solve_failures: u32,

    // Retries after a capture timeout, per iteration.
    pub max_capture_retries: u32,

    // Retries after a slew timeout, per correction.
    pub max_slew_retries: u32,

    // Solutions reporting less confidence than this count as failures.
    pub min_confidence: f64,

    // A capture must finish within exposure duration plus this margin.
    pub capture_timeout_margin: Duration,

    pub solve_timeout: Duration,
    pub slew_timeout: Duration,

    // Pause before retrying a timed out operation.
    pub retry_backoff: Duration,

    // Pause after a slew so vibrations damp out before the next exposure.
    pub settle_time: Duration,

    // Slew to the target's computed position before the first capture.
    pub initial_goto: bool,
}

impl Default for LoopParams {
    fn default() -> Self {
        LoopParams {
            tolerance_deg: 0.1,
            max_iterations: 10,
            max_solve_failures: 3,
            max_capture_retries: 3,
            max_slew_retries: 3,
            min_confidence: 0.0,
            capture_timeout_margin: Duration::from_secs(30),
            solve_timeout: Duration::from_secs(60),
            slew_timeout: Duration::from_secs(120),
            retry_backoff: Duration::from_secs(1),
            settle_time: Duration::from_secs(1),
            initial_goto: false,
        }
    }
}

// Everything a session needs besides the devices and the solver.
#[derive(Clone, Debug)]
pub struct SessionParams {
    pub target: EquatorialPosition,
    // Site; the timestamp is replaced with the relevant instant as the loop
    // runs.
    pub observer: ObserverFrame,
    pub exposure: ExposureRequest,
    pub loop_params: LoopParams,
}

// What the caller gets back. Exactly one per session.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionOutcome {
    Converged {
        // Solved position of the final frame, in the target's epoch.
        final_position: EquatorialPosition,
        iterations: u32,
    },
    Aborted {
        reason: SessionError,
        iterations: u32,
        last_error: Option<PointingError>,
    },
}

impl SessionOutcome {
    pub fn iterations(&self) -> u32 {
        match self {
            SessionOutcome::Converged{iterations, ..} => *iterations,
            SessionOutcome::Aborted{iterations, ..} => *iterations,
        }
    }

    pub fn is_converged(&self) -> bool {
        matches!(self, SessionOutcome::Converged{..})
    }
}

impl fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionOutcome::Converged{final_position, iterations} => {
                write!(f, "converged at {} after {} iteration(s)",
                       final_position, iterations)
            }
            SessionOutcome::Aborted{reason, iterations, last_error} => {
                write!(f, "aborted after {} iteration(s): {}", iterations, reason)?;
                if let Some(e) = last_error {
                    write!(f, "; last pointing error {}", e)?;
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug)]
pub enum LoopState {
    Idle,
    Capturing,
    // The frame lives here until it has been solved, then is dropped.
    Solving(CapturedImage),
    Evaluating {
        // When the solved frame was exposed.
        timestamp: SystemTime,
        solved: EquatorialPosition,
    },
    Correcting {
        command: HorizontalPosition,
    },
    Converged(EquatorialPosition),
    Aborted(SessionError),
}

impl LoopState {
    pub fn name(&self) -> &'static str {
        match self {
            LoopState::Idle => "Idle",
            LoopState::Capturing => "Capturing",
            LoopState::Solving(_) => "Solving",
            LoopState::Evaluating{..} => "Evaluating",
            LoopState::Correcting{..} => "Correcting",
            LoopState::Converged(_) => "Converged",
            LoopState::Aborted(_) => "Aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LoopState::Converged(_) | LoopState::Aborted(_))
    }
}

fn device_failure(stage: Stage, error: DeviceError) -> SessionError {
    SessionError::Device{stage, error}
}

// Drives the mount toward the target: capture, solve, compare, correct,
// repeat. Device connections belong to the caller (see session.rs); we only
// borrow them, one operation at a time.
pub struct CorrectionSession<'a> {
    target: EquatorialPosition,
    observer: ObserverFrame,
    exposure: ExposureRequest,
    params: LoopParams,

    camera: &'a mut dyn ImagingDevice,
    mount: &'a mut dyn PointingDevice,
    solver: &'a dyn PlateSolver,

    cancel: CancelToken,

    state: LoopState,

    // Number of capture/solve cycles started. Capture retries after a timeout
    // do not count.
    iterations: u32,

    // Reset whenever a solve succeeds.
    consecutive_solve_failures: u32,

    last_error: Option<PointingError>,

    progress: Arc<LoopProgress>,
}

impl<'a> CorrectionSession<'a> {
    pub fn new(params: &SessionParams,
               camera: &'a mut dyn ImagingDevice,
               mount: &'a mut dyn PointingDevice,
               solver: &'a dyn PlateSolver,
               cancel: CancelToken) -> Self {
        CorrectionSession {
            target: params.target,
            observer: params.observer,
            exposure: params.exposure.clone(),
            params: params.loop_params.clone(),
            camera,
            mount,
            solver,
            cancel,
            state: LoopState::Idle,
            iterations: 0,
            consecutive_solve_failures: 0,
            last_error: None,
            progress: Arc::new(LoopProgress::default()),
        }
    }

    // Handle onto this session's progress that stays valid after run().
    pub fn progress(&self) -> Arc<LoopProgress> {
        self.progress.clone()
    }

    pub fn state(&self) -> &LoopState {
        &self.state
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    pub fn last_error(&self) -> Option<PointingError> {
        self.last_error
    }

    // Runs the state machine to a terminal state.
    pub async fn run(mut self) -> SessionOutcome {
        info!("Correcting pointing toward {} using solver {}",
              self.target, self.solver.name());
        while !self.state.is_terminal() {
            let next = if self.cancel.is_cancelled() {
                LoopState::Aborted(SessionError::Cancelled)
            } else {
                let state = std::mem::replace(&mut self.state, LoopState::Idle);
                self.step(state).await
            };
            self.transition(next);
        }
        let outcome = match std::mem::replace(&mut self.state, LoopState::Idle) {
            LoopState::Converged(final_position) => SessionOutcome::Converged {
                final_position,
                iterations: self.iterations,
            },
            LoopState::Aborted(reason) => SessionOutcome::Aborted {
                reason,
                iterations: self.iterations,
                last_error: self.last_error,
            },
            _ => unreachable!("loop exits only in a terminal state"),
        };
        info!("Session {}", outcome);
        outcome
    }

    fn transition(&mut self, next: LoopState) {
        // Capturing -> Capturing is a solve failure going around again.
        debug!("{} -> {}", self.state.name(), next.name());
        if let LoopState::Aborted(reason) = &next {
            warn!("Aborting after {} iteration(s): {}", self.iterations, reason);
        }
        self.state = next;
    }

    async fn step(&mut self, state: LoopState) -> LoopState {
        let next = match state {
            LoopState::Idle => self.start().await,
            LoopState::Capturing => self.capture().await,
            LoopState::Solving(image) => self.solve(image).await,
            LoopState::Evaluating{timestamp, solved} => {
                self.evaluate(timestamp, solved).await
            }
            LoopState::Correcting{command} => self.correct(command).await,
            terminal => Ok(terminal),
        };
        next.unwrap_or_else(LoopState::Aborted)
    }

    async fn start(&mut self) -> Result<LoopState, SessionError> {
        match self.camera.configure(&self.exposure).await {
            Ok(ConfigureStatus::Applied) => (),
            Ok(ConfigureStatus::PartiallyApplied{unsupported}) => {
                warn!("Camera ignored unsupported setting(s) {:?}", unsupported);
            }
            Err(e) => return Err(device_failure(Stage::Configure, e)),
        }
        // Validates the target before any hardware moves.
        let target_now =
            to_horizontal(&self.target, &self.observer.at(SystemTime::now()))?;
        if self.params.initial_goto {
            info!("Initial goto to {}", target_now);
            return Ok(LoopState::Correcting{command: target_now});
        }
        Ok(LoopState::Capturing)
    }

    async fn capture(&mut self) -> Result<LoopState, SessionError> {
        self.iterations += 1;
        self.progress.iterations.store(self.iterations, Ordering::Relaxed);
        let deadline =
            self.exposure.exposure_duration + self.params.capture_timeout_margin;
        let mut retries = 0;
        loop {
            let result = match timeout(deadline, self.camera.capture()).await {
                Ok(result) => result,
                Err(_) => Err(DeviceError::Timeout),
            };
            match result {
                Ok(image) => {
                    debug!("Iteration {}: captured frame {} ({}x{})",
                           self.iterations, image.frame_id,
                           image.width(), image.height());
                    return Ok(LoopState::Solving(image));
                }
                Err(e) if e.is_transient()
                    && retries < self.params.max_capture_retries => {
                    retries += 1;
                    warn!("Capture timed out, retry {}/{}",
                          retries, self.params.max_capture_retries);
                    self.backoff().await?;
                }
                Err(e) => return Err(device_failure(Stage::Capture, e)),
            }
        }
    }

    async fn solve(&mut self, image: CapturedImage)
                   -> Result<LoopState, SessionError> {
        let solve_timeout = self.params.solve_timeout;
        let result = match timeout(solve_timeout + SOLVE_GRACE,
                                   self.solver.solve(&image, solve_timeout)).await {
            Ok(result) => result,
            Err(_) => SolveResult::failed(SolveError::Timeout),
        };
        match result {
            SolveResult::Solved{position, confidence}
                if confidence >= self.params.min_confidence =>
            {
                self.consecutive_solve_failures = 0;
                info!("Iteration {}: solved {} (confidence {:.2})",
                      self.iterations, position, confidence);
                Ok(LoopState::Evaluating{timestamp: image.timestamp,
                                         solved: position})
            }
            SolveResult::Solved{confidence, ..} => {
                warn!("Solution confidence {:.2} below {:.2}",
                      confidence, self.params.min_confidence);
                self.solve_failed()
            }
            SolveResult::Failed{reason} => {
                warn!("Iteration {}: solve failed: {}", self.iterations, reason);
                self.solve_failed()
            }
        }
    }

    fn solve_failed(&mut self) -> Result<LoopState, SessionError> {
        self.consecutive_solve_failures += 1;
        if self.consecutive_solve_failures >= self.params.max_solve_failures {
            return Err(SessionError::SolveExhausted);
        }
        if self.iterations >= self.params.max_iterations {
            return Err(SessionError::IterationExhausted);
        }
        Ok(LoopState::Capturing)
    }

    async fn evaluate(&mut self, timestamp: SystemTime,
                      solved: EquatorialPosition)
                      -> Result<LoopState, SessionError> {
        let frame = self.observer.at(timestamp);
        let solved = precess(&solved, self.target.epoch(), &timestamp);
        let solved_hz = to_horizontal(&solved, &frame)?;
        let target_hz = to_horizontal(&self.target, &frame)?;
        let error = pointing_error(&target_hz, &solved_hz);
        self.last_error = Some(error);
        *self.progress.last_error.lock().unwrap() = Some(error);
        info!("Iteration {}: pointing at {}, error {}",
              self.iterations, solved_hz, error);

        if error.separation <= self.params.tolerance_deg {
            return Ok(LoopState::Converged(solved));
        }

        // How far the mount's own idea of its position is from the truth.
        // Re-measured every iteration so corrections never accumulate. The
        // readback, the solved position and the target must all be taken at
        // the same instant; a tracking mount has moved since the exposure.
        let readback = self.mount.current_position().await;
        let now_frame = self.observer.at(SystemTime::now());
        let (d_alt, d_az) = match readback {
            Ok(reported) => {
                let solved_now = to_horizontal(&solved, &now_frame)?;
                let mount_error = pointing_error(&reported, &solved_now);
                (mount_error.d_alt, mount_error.d_az)
            }
            Err(DeviceError::Timeout) => {
                warn!("Mount position readback timed out; commanding target \
                       without mount offset");
                (0.0, 0.0)
            }
            Err(e) => return Err(device_failure(Stage::Readback, e)),
        };
        let target_now = to_horizontal(&self.target, &now_frame)?;
        Ok(LoopState::Correcting{command: offset_position(&target_now, d_alt, d_az)})
    }

    async fn correct(&mut self, command: HorizontalPosition)
                     -> Result<LoopState, SessionError> {
        if self.iterations >= self.params.max_iterations {
            return Err(SessionError::IterationExhausted);
        }
        info!("Slewing to {}", command);
        let mut retries = 0;
        loop {
            match self.mount.slew_to(&command, self.params.slew_timeout).await {
                Ok(()) => break,
                Err(e) if e.is_transient()
                    && retries < self.params.max_slew_retries => {
                    retries += 1;
                    warn!("Slew timed out, retry {}/{}",
                          retries, self.params.max_slew_retries);
                    self.backoff().await?;
                }
                Err(e) => return Err(device_failure(Stage::Slew, e)),
            }
        }
        if !self.params.settle_time.is_zero() {
            sleep(self.params.settle_time).await;
        }
        Ok(LoopState::Capturing)
    }

    // Waits before a retry. A cancellation that arrived meanwhile wins over
    // the retry.
    async fn backoff(&self) -> Result<(), SessionError> {
        if !self.params.retry_backoff.is_zero() {
            sleep(self.params.retry_backoff).await;
        }
        if self.cancel.is_cancelled() {
            return Err(SessionError::Cancelled);
        }
        Ok(())
    }
}

// `base` moved by the given altitude/azimuth deltas (degrees). Altitude is
// clamped to the valid range.
fn offset_position(base: &HorizontalPosition, d_alt: f64, d_az: f64)
                   -> HorizontalPosition {
    HorizontalPosition::new((base.altitude() + d_alt).clamp(-90.0, 90.0),
                            base.azimuth() + d_az)
}
