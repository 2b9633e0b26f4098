// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::io::Cursor;
use std::time::Duration;

use async_trait::async_trait;
use canonical_error::{CanonicalError, internal_error, invalid_argument_error};
use image::ImageFormat;
use log::{debug, info, warn};
use reqwest::multipart;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep, timeout_at};

use cedar_goto_elements::camera_trait::CapturedImage;
use cedar_goto_elements::coords::{Epoch, EquatorialPosition};
use cedar_goto_elements::errors::SolveError;
use cedar_goto_elements::solver_trait::{PlateSolver, SolveResult};

pub const NOVA_BASE_URL: &str = "https://nova.astrometry.net";

// Per HTTP request; the overall solve deadline is enforced separately.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobStatus {
    Processing,
    Success,
    Failure,
}

// Field center of a solved job, J2000 degrees.
#[derive(Clone, Copy, Debug, PartialEq, Deserialize)]
pub struct Calibration {
    pub ra: f64,
    pub dec: f64,
    // Field radius, degrees.
    #[serde(default)]
    pub radius: f64,
    // Arcseconds per pixel.
    #[serde(default)]
    pub pixscale: f64,
}

// The subset of the astrometry.net web API that a solve needs. Separated from
// NovaSolver so the polling logic can be exercised without a network.
#[async_trait]
pub trait NovaApi: Send + Sync {
    // Returns a session key.
    async fn login(&self) -> Result<String, SolveError>;

    // Returns the submission id.
    async fn upload(&self, session: &str, png: Vec<u8>) -> Result<u64, SolveError>;

    // Jobs created for a submission so far; empty while still queued.
    async fn submission_jobs(&self, submission_id: u64) -> Result<Vec<u64>, SolveError>;

    async fn job_status(&self, job_id: u64) -> Result<JobStatus, SolveError>;

    async fn calibration(&self, job_id: u64) -> Result<Calibration, SolveError>;
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    status: String,
    session: Option<String>,
    #[serde(default)]
    errormessage: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    status: String,
    subid: Option<u64>,
    #[serde(default)]
    errormessage: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SubmissionResponse {
    jobs: Option<Vec<Option<u64>>>,
}

#[derive(Debug, Deserialize)]
struct JobStatusResponse {
    status: Option<String>,
}

fn request_error(e: reqwest::Error) -> SolveError {
    if e.is_decode() {
        SolveError::MalformedResult(e.to_string())
    } else if e.is_timeout() {
        SolveError::Timeout
    } else {
        SolveError::Unavailable(e.to_string())
    }
}

// NovaApi over HTTP, for nova.astrometry.net or a self-hosted instance.
pub struct HttpNovaApi {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpNovaApi {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self, CanonicalError> {
        if api_key.is_empty() {
            return Err(invalid_argument_error("An API key is required"));
        }
        let client = match reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build() {
            Ok(client) => client,
            Err(e) => {
                return Err(internal_error(
                    format!("Cannot create HTTP client: {:?}", e).as_str()));
            }
        };
        Ok(HttpNovaApi{client,
                       base_url: base_url.trim_end_matches('/').to_string(),
                       api_key: api_key.to_string()})
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, path: &str)
                                                    -> Result<T, SolveError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.client.get(&url).send().await.map_err(request_error)?;
        let response = response.error_for_status().map_err(request_error)?;
        response.json::<T>().await.map_err(request_error)
    }
}

#[async_trait]
impl NovaApi for HttpNovaApi {
    async fn login(&self) -> Result<String, SolveError> {
        let request_json = serde_json::json!({"apikey": self.api_key});
        let response = self.client.post(format!("{}/api/login", self.base_url))
            .form(&[("request-json", request_json.to_string())])
            .send().await.map_err(request_error)?;
        let login: LoginResponse = response.json().await.map_err(request_error)?;
        if login.status != "success" {
            return Err(SolveError::Unavailable(format!(
                "login failed: {}",
                login.errormessage.unwrap_or_else(|| "unknown error".to_string()))));
        }
        login.session.ok_or_else(|| SolveError::MalformedResult(
            "login response lacks session".to_string()))
    }

    async fn upload(&self, session: &str, png: Vec<u8>) -> Result<u64, SolveError> {
        let request_json = serde_json::json!({
            "session": session,
            "publicly_visible": "n",
            "allow_modifications": "d",
            "allow_commercial_use": "n",
        });
        let part = multipart::Part::bytes(png)
            .file_name("frame.png")
            .mime_str("image/png")
            .map_err(request_error)?;
        let form = multipart::Form::new()
            .text("request-json", request_json.to_string())
            .part("file", part);
        let response = self.client.post(format!("{}/api/upload", self.base_url))
            .multipart(form)
            .send().await.map_err(request_error)?;
        let upload: UploadResponse = response.json().await.map_err(request_error)?;
        if upload.status != "success" {
            return Err(SolveError::Unavailable(format!(
                "upload failed: {}",
                upload.errormessage.unwrap_or_else(|| "unknown error".to_string()))));
        }
        upload.subid.ok_or_else(|| SolveError::MalformedResult(
            "upload response lacks subid".to_string()))
    }

    async fn submission_jobs(&self, submission_id: u64) -> Result<Vec<u64>, SolveError> {
        let submission: SubmissionResponse =
            self.get_json(&format!("/api/submissions/{}", submission_id)).await?;
        Ok(submission.jobs.unwrap_or_default().into_iter().flatten().collect())
    }

    async fn job_status(&self, job_id: u64) -> Result<JobStatus, SolveError> {
        let status: JobStatusResponse =
            self.get_json(&format!("/api/jobs/{}", job_id)).await?;
        Ok(match status.status.as_deref() {
            Some("success") => JobStatus::Success,
            Some("failure") => JobStatus::Failure,
            _ => JobStatus::Processing,
        })
    }

    async fn calibration(&self, job_id: u64) -> Result<Calibration, SolveError> {
        self.get_json(&format!("/api/jobs/{}/calibration", job_id)).await
    }
}

// Plate solves by submitting frames to an astrometry.net web service and
// polling at a fixed interval until the job finishes or the deadline passes.
pub struct NovaSolver<A: NovaApi = HttpNovaApi> {
    api: A,
    poll_interval: Duration,
    // Obtained on first use; dropped when an upload fails so the next solve
    // logs in again.
    session: Mutex<Option<String>>,
}

impl<A: NovaApi> NovaSolver<A> {
    pub fn new(api: A, poll_interval: Duration) -> Self {
        NovaSolver{api, poll_interval, session: Mutex::new(None)}
    }

    async fn session_key(&self) -> Result<String, SolveError> {
        let mut session = self.session.lock().await;
        if let Some(key) = session.as_ref() {
            return Ok(key.clone());
        }
        let key = self.api.login().await?;
        info!("Logged in to astrometry.net");
        *session = Some(key.clone());
        Ok(key)
    }

    async fn submit(&self, png: Vec<u8>) -> Result<u64, SolveError> {
        let session = self.session_key().await?;
        match self.api.upload(&session, png).await {
            Ok(submission_id) => Ok(submission_id),
            Err(e) => {
                *self.session.lock().await = None;
                Err(e)
            }
        }
    }

    async fn run_solve(&self, image: &CapturedImage)
                       -> Result<EquatorialPosition, SolveError> {
        let mut png = Vec::new();
        if let Err(e) = image.image.write_to(&mut Cursor::new(&mut png),
                                             ImageFormat::Png) {
            return Err(SolveError::Unavailable(format!("PNG encoding: {}", e)));
        }
        let submission_id = self.submit(png).await?;
        debug!("Frame {} is submission {}", image.frame_id, submission_id);

        // A failed poll counts as still processing; only the caller's
        // deadline ends the wait.
        loop {
            match self.poll_jobs(submission_id).await {
                Ok(Some((job_id, JobStatus::Success))) => {
                    let cal = self.api.calibration(job_id).await?;
                    debug!("Job {} solved: {:?}", job_id, cal);
                    return Ok(EquatorialPosition::new(cal.ra, cal.dec,
                                                      Epoch::J2000));
                }
                Ok(Some((_, JobStatus::Failure))) => return Err(SolveError::NoMatch),
                Ok(_) => (),
                Err(e) => {
                    warn!("Polling submission {} failed: {}", submission_id, e);
                }
            }
            sleep(self.poll_interval).await;
        }
    }

    // Returns the first job of the submission that is no longer processing.
    async fn poll_jobs(&self, submission_id: u64)
                       -> Result<Option<(u64, JobStatus)>, SolveError> {
        for job_id in self.api.submission_jobs(submission_id).await? {
            let status = self.api.job_status(job_id).await?;
            if status != JobStatus::Processing {
                return Ok(Some((job_id, status)));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl<A: NovaApi> PlateSolver for NovaSolver<A> {
    async fn solve(&self, image: &CapturedImage, timeout: Duration) -> SolveResult {
        let deadline = Instant::now() + timeout;
        match timeout_at(deadline, self.run_solve(image)).await {
            Ok(Ok(position)) => SolveResult::Solved{position, confidence: 1.0},
            Ok(Err(reason)) => SolveResult::failed(reason),
            Err(_) => {
                warn!("astrometry.net did not finish within {:?}", timeout);
                SolveResult::failed(SolveError::Timeout)
            }
        }
    }

    fn name(&self) -> &str {
        "astrometry.net"
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::SystemTime;

    use image::{DynamicImage, GrayImage};

    use super::*;

    // Answers job status queries from a script; the last entry repeats.
    struct ScriptedApi {
        login_ok: bool,
        statuses: std::sync::Mutex<VecDeque<JobStatus>>,
        // Number of initial status polls that fail.
        flaky_polls: u32,
        calibration_ok: bool,
        logins: AtomicU32,
        status_polls: AtomicU32,
    }

    impl ScriptedApi {
        fn new(statuses: &[JobStatus]) -> Self {
            ScriptedApi {
                login_ok: true,
                statuses: std::sync::Mutex::new(statuses.iter().copied().collect()),
                flaky_polls: 0,
                calibration_ok: true,
                logins: AtomicU32::new(0),
                status_polls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl NovaApi for ScriptedApi {
        async fn login(&self) -> Result<String, SolveError> {
            self.logins.fetch_add(1, Ordering::Relaxed);
            if self.login_ok {
                Ok("session-key".to_string())
            } else {
                Err(SolveError::Unavailable("bad api key".to_string()))
            }
        }
        async fn upload(&self, session: &str, png: Vec<u8>) -> Result<u64, SolveError> {
            assert_eq!(session, "session-key");
            assert_eq!(&png[1..4], b"PNG");
            Ok(42)
        }
        async fn submission_jobs(&self, submission_id: u64) -> Result<Vec<u64>, SolveError> {
            assert_eq!(submission_id, 42);
            Ok(vec![7])
        }
        async fn job_status(&self, job_id: u64) -> Result<JobStatus, SolveError> {
            assert_eq!(job_id, 7);
            let polls = self.status_polls.fetch_add(1, Ordering::Relaxed);
            if polls < self.flaky_polls {
                return Err(SolveError::Unavailable("HTTP 502".to_string()));
            }
            let mut statuses = self.statuses.lock().unwrap();
            if statuses.len() > 1 {
                Ok(statuses.pop_front().unwrap())
            } else {
                Ok(statuses[0])
            }
        }
        async fn calibration(&self, _job_id: u64) -> Result<Calibration, SolveError> {
            if !self.calibration_ok {
                return Err(SolveError::MalformedResult("no calibration".to_string()));
            }
            Ok(Calibration{ra: 83.82, dec: -5.39, radius: 0.9, pixscale: 3.1})
        }
    }

    fn frame() -> CapturedImage {
        CapturedImage {
            image: DynamicImage::ImageLuma8(GrayImage::new(20, 10)),
            frame_id: 1,
            timestamp: SystemTime::now(),
            exposure: Duration::from_secs(1),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_solved_after_polling() {
        use JobStatus::*;
        let solver = NovaSolver::new(
            ScriptedApi::new(&[Processing, Processing, Success]),
            Duration::from_secs(5));
        let result = solver.solve(&frame(), Duration::from_secs(60)).await;
        assert_eq!(result, SolveResult::Solved{
            position: EquatorialPosition::new(83.82, -5.39, Epoch::J2000),
            confidence: 1.0});
        assert_eq!(solver.api.status_polls.load(Ordering::Relaxed), 3);

        // Session key is reused.
        solver.solve(&frame(), Duration::from_secs(60)).await;
        assert_eq!(solver.api.logins.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_failure() {
        let solver = NovaSolver::new(ScriptedApi::new(&[JobStatus::Failure]),
                                     Duration::from_secs(5));
        assert_eq!(solver.solve(&frame(), Duration::from_secs(60)).await,
                   SolveResult::failed(SolveError::NoMatch));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_while_processing() {
        let solver = NovaSolver::new(ScriptedApi::new(&[JobStatus::Processing]),
                                     Duration::from_secs(7));
        let start = Instant::now();
        assert_eq!(solver.solve(&frame(), Duration::from_secs(30)).await,
                   SolveResult::failed(SolveError::Timeout));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(30));
        assert!(elapsed < Duration::from_secs(31));
        // Polls at 0, 7, 14, 21 and 28 seconds, then the deadline hits.
        assert_eq!(solver.api.status_polls.load(Ordering::Relaxed), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_errors_are_retried() {
        use JobStatus::*;
        let mut api = ScriptedApi::new(&[Processing, Success]);
        api.flaky_polls = 2;
        let solver = NovaSolver::new(api, Duration::from_secs(5));
        let result = solver.solve(&frame(), Duration::from_secs(60)).await;
        assert_eq!(result, SolveResult::Solved{
            position: EquatorialPosition::new(83.82, -5.39, Epoch::J2000),
            confidence: 1.0});
        assert_eq!(solver.api.status_polls.load(Ordering::Relaxed), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_errors_until_deadline() {
        let mut api = ScriptedApi::new(&[JobStatus::Success]);
        api.flaky_polls = u32::MAX;
        let solver = NovaSolver::new(api, Duration::from_secs(7));
        let start = Instant::now();
        assert_eq!(solver.solve(&frame(), Duration::from_secs(30)).await,
                   SolveResult::failed(SolveError::Timeout));
        assert!(start.elapsed() >= Duration::from_secs(30));
        assert_eq!(solver.api.status_polls.load(Ordering::Relaxed), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_calibration_failure() {
        let mut api = ScriptedApi::new(&[JobStatus::Success]);
        api.calibration_ok = false;
        let solver = NovaSolver::new(api, Duration::from_secs(5));
        assert!(matches!(solver.solve(&frame(), Duration::from_secs(60)).await,
                         SolveResult::Failed{reason: SolveError::MalformedResult(_)}));
        assert_eq!(solver.api.status_polls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_login_failure() {
        let mut api = ScriptedApi::new(&[JobStatus::Success]);
        api.login_ok = false;
        let solver = NovaSolver::new(api, Duration::from_secs(5));
        assert!(matches!(solver.solve(&frame(), Duration::from_secs(60)).await,
                         SolveResult::Failed{reason: SolveError::Unavailable(_)}));
    }

    #[test]
    fn test_http_api_requires_key() {
        assert!(HttpNovaApi::new(NOVA_BASE_URL, "").is_err());
        let api = HttpNovaApi::new("http://localhost:8080/", "key").unwrap();
        assert_eq!(api.base_url, "http://localhost:8080");
    }
}
