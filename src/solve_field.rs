// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use canonical_error::{CanonicalError, failed_precondition_error};
use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};

use cedar_goto_elements::camera_trait::CapturedImage;
use cedar_goto_elements::coords::{Epoch, EquatorialPosition};
use cedar_goto_elements::errors::SolveError;
use cedar_goto_elements::solver_trait::{PlateSolver, SolveResult};

const FITS_CARD_LEN: usize = 80;

// Plate solves with a locally installed astrometry.net `solve-field`. Each
// frame is written as a PNG into `work_dir`; the solution is read back from
// the .wcs file solve-field leaves next to it.
pub struct SolveFieldSolver {
    program: PathBuf,
    // Arguments placed before solve-field's own, for running through a
    // wrapper (e.g. `ssh host solve-field`).
    prefix_args: Vec<OsString>,
    work_dir: PathBuf,
    // Field width bounds (degrees) passed as a scale hint.
    scale_hint: Option<(f64, f64)>,
}

impl SolveFieldSolver {
    pub fn new(program: impl Into<PathBuf>, work_dir: impl Into<PathBuf>)
               -> Result<Self, CanonicalError> {
        let work_dir = work_dir.into();
        if let Err(e) = std::fs::create_dir_all(&work_dir) {
            return Err(failed_precondition_error(
                format!("Cannot create work dir {:?}: {:?}", work_dir, e).as_str()));
        }
        Ok(SolveFieldSolver{program: program.into(), prefix_args: vec![],
                            work_dir, scale_hint: None})
    }

    pub fn with_prefix_args<I, S>(mut self, args: I) -> Self
    where I: IntoIterator<Item = S>, S: Into<OsString> {
        self.prefix_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_scale_hint(mut self, low_deg: f64, high_deg: f64) -> Self {
        self.scale_hint = Some((low_deg, high_deg));
        self
    }

    fn make_child(&self, image_path: &Path, cpu_limit: Duration)
                  -> Result<Child, SolveError> {
        let mut command = Command::new(&self.program);
        command.args(&self.prefix_args)
            .arg("--overwrite")
            .arg("--no-plots")
            .arg("--crpix-center")
            .arg("--cpulimit").arg(cpu_limit.as_secs().max(1).to_string())
            .arg("--dir").arg(&self.work_dir);
        if let Some((low, high)) = self.scale_hint {
            command.args(["--scale-units", "degwidth"])
                .arg("--scale-low").arg(low.to_string())
                .arg("--scale-high").arg(high.to_string());
        }
        command.arg(image_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        match command.spawn() {
            Err(e) => Err(SolveError::Unavailable(
                format!("cannot run {:?}: {}", self.program, e))),
            Ok(mut child) => {
                if let Some(stdout) = child.stdout.take() {
                    Self::spawn_output_worker(stdout, false);
                }
                if let Some(stderr) = child.stderr.take() {
                    Self::spawn_output_worker(stderr, true);
                }
                Ok(child)
            }
        }
    }

    // Forwards the child's output to our log until EOF.
    fn spawn_output_worker<R>(output: R, is_stderr: bool)
    where R: AsyncRead + Unpin + Send + 'static {
        tokio::spawn(async move {
            let mut lines = BufReader::new(output).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if is_stderr {
                    warn!("solve-field: {}", line);
                } else {
                    debug!("solve-field: {}", line);
                }
            }
        });
    }

    // Removes the frame image and everything solve-field derived from it
    // (.axy, .corr, .match, .rdls, .solved, .new, -indx.xyls, .wcs ...).
    async fn remove_frame_files(&self, stem: &str) {
        let mut entries = match tokio::fs::read_dir(&self.work_dir).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Cannot list {:?}: {}", self.work_dir, e);
                return;
            }
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let belongs = name.strip_prefix(stem)
                .is_some_and(|rest| rest.starts_with('.') || rest.starts_with('-'));
            if !belongs {
                continue;
            }
            if let Err(e) = tokio::fs::remove_file(entry.path()).await {
                warn!("Cannot remove {:?}: {}", entry.path(), e);
            }
        }
    }

    async fn run_solve(&self, image: &CapturedImage, timeout: Duration)
                       -> Result<EquatorialPosition, SolveError> {
        let stem = format!("frame_{:06}", image.frame_id);
        // A stale solution must not be mistaken for this frame's.
        self.remove_frame_files(&stem).await;
        let result = self.solve_frame(image, &stem, timeout).await;
        self.remove_frame_files(&stem).await;
        result
    }

    async fn solve_frame(&self, image: &CapturedImage, stem: &str,
                         timeout: Duration)
                         -> Result<EquatorialPosition, SolveError> {
        let image_path = self.work_dir.join(format!("{}.png", stem));
        let wcs_path = image_path.with_extension("wcs");
        let pixels = image.image.clone();
        let save_path = image_path.clone();
        match tokio::task::spawn_blocking(move || pixels.save(&save_path)).await {
            Ok(Ok(())) => (),
            Ok(Err(e)) => {
                return Err(SolveError::Unavailable(
                    format!("cannot write {:?}: {}", image_path, e)));
            }
            Err(e) => return Err(SolveError::Unavailable(format!("{:?}", e))),
        }

        let mut child = self.make_child(&image_path, timeout)?;
        let status = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                return Err(SolveError::Unavailable(format!("wait error: {}", e)));
            }
            Err(_) => {
                if let Err(e) = child.kill().await {
                    warn!("Could not kill solve-field: {}", e);
                }
                return Err(SolveError::Timeout);
            }
        };
        if !status.success() {
            warn!("solve-field exited with {}", status);
        }

        // solve-field exits normally when it finds no solution; the missing
        // .wcs file is what tells us.
        let header = match tokio::fs::read(&wcs_path).await {
            Ok(header) => header,
            Err(_) => return Err(SolveError::NoMatch),
        };
        parse_wcs_center(&header)
    }
}

#[async_trait]
impl PlateSolver for SolveFieldSolver {
    async fn solve(&self, image: &CapturedImage, timeout: Duration) -> SolveResult {
        match self.run_solve(image, timeout).await {
            Ok(position) => {
                info!("solve-field solved frame {}: {}", image.frame_id, position);
                // solve-field only writes a .wcs once its verification odds
                // pass, and reports no score of its own.
                SolveResult::Solved{position, confidence: 1.0}
            }
            Err(reason) => SolveResult::failed(reason),
        }
    }

    fn name(&self) -> &str {
        "solve-field"
    }
}

// Reads the reference point (CRVAL1/CRVAL2) from a FITS WCS header. With
// --crpix-center the reference point is the image center.
pub fn parse_wcs_center(header: &[u8]) -> Result<EquatorialPosition, SolveError> {
    let mut ra = None;
    let mut dec = None;
    let mut equinox = None;
    for card in header.chunks(FITS_CARD_LEN) {
        let card = String::from_utf8_lossy(card);
        let keyword = card.get(..8).unwrap_or(card.as_ref()).trim();
        if keyword == "END" {
            break;
        }
        if card.get(8..10) != Some("= ") {
            continue;
        }
        let value = card[10..].split('/').next().unwrap_or("").trim();
        match keyword {
            "CRVAL1" => ra = Some(parse_fits_number(keyword, value)?),
            "CRVAL2" => dec = Some(parse_fits_number(keyword, value)?),
            "EQUINOX" => equinox = Some(parse_fits_number(keyword, value)?),
            _ => (),
        }
    }
    let (Some(ra), Some(dec)) = (ra, dec) else {
        return Err(SolveError::MalformedResult(
            "WCS header lacks CRVAL1/CRVAL2".to_string()));
    };
    let epoch = match equinox {
        None => Epoch::J2000,
        Some(year) if (year - 2000.0).abs() < 1e-6 => Epoch::J2000,
        Some(year) => Epoch::Julian(year),
    };
    Ok(EquatorialPosition::new(ra, dec, epoch))
}

fn parse_fits_number(keyword: &str, value: &str) -> Result<f64, SolveError> {
    // FITS permits Fortran style 'D' exponents.
    value.replace('D', "E").parse::<f64>().map_err(|_| {
        SolveError::MalformedResult(format!("bad {} value {:?}", keyword, value))
    })
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use approx::assert_abs_diff_eq;
    use image::{DynamicImage, GrayImage};

    use super::*;

    fn header(cards: &[&str]) -> Vec<u8> {
        let mut bytes = Vec::new();
        for card in cards {
            bytes.extend(format!("{:<80}", card).into_bytes());
        }
        bytes
    }

    fn frame(frame_id: u64) -> CapturedImage {
        CapturedImage {
            image: DynamicImage::ImageLuma8(GrayImage::new(16, 12)),
            frame_id,
            timestamp: SystemTime::now(),
            exposure: Duration::from_millis(100),
        }
    }

    #[test]
    fn test_parse_wcs_center() {
        let bytes = header(&[
            "SIMPLE  =                    T / Standard FITS file",
            "EQUINOX =               2000.0 / Equatorial coordinates definition (yr)",
            "CRVAL1  =        83.8220833333 / RA  of reference point",
            "CRVAL2  =   -5.39111111111D+00 / DEC of reference point",
            "END",
            "CRVAL1  =                  1.0",
        ]);
        let center = parse_wcs_center(&bytes).unwrap();
        assert_abs_diff_eq!(center.ra(), 83.8220833333, epsilon = 1e-9);
        assert_abs_diff_eq!(center.dec(), -5.39111111111, epsilon = 1e-9);
        assert_eq!(center.epoch(), Epoch::J2000);
    }

    #[test]
    fn test_parse_wcs_other_equinox() {
        let bytes = header(&[
            "EQUINOX =               2024.5",
            "CRVAL1  =                 10.0",
            "CRVAL2  =                 20.0",
            "END",
        ]);
        assert_eq!(parse_wcs_center(&bytes).unwrap().epoch(),
                   Epoch::Julian(2024.5));
    }

    #[test]
    fn test_parse_wcs_malformed() {
        let missing = header(&["CRVAL1  =                 10.0", "END"]);
        assert!(matches!(parse_wcs_center(&missing),
                         Err(SolveError::MalformedResult(_))));
        let garbage = header(&["CRVAL1  =                 ten",
                               "CRVAL2  =                 20.0", "END"]);
        assert!(matches!(parse_wcs_center(&garbage),
                         Err(SolveError::MalformedResult(_))));
    }

    // Stand-in for solve-field: writes a fixed .wcs next to the image (the
    // last argument).
    const SOLVING_SCRIPT: &str = r#"
for last in "$@"; do :; done
out="${last%.png}.wcs"
printf '%-80s' "EQUINOX =               2000.0" > "$out"
printf '%-80s' "CRVAL1  =                 45.5" >> "$out"
printf '%-80s' "CRVAL2  =                -12.25" >> "$out"
printf '%-80s' "END" >> "$out"
touch "${last%.png}.axy" "${last%.png}.solved" "${last%.png}-indx.xyls"
echo "Field 1: solved"
"#;

    // Names of the files left in the work dir.
    fn leftovers(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir.join("work")).unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }

    fn script_solver(dir: &Path, script: &str) -> SolveFieldSolver {
        let script_path = dir.join("fake_solve_field.sh");
        std::fs::write(&script_path, script).unwrap();
        SolveFieldSolver::new("sh", dir.join("work")).unwrap()
            .with_prefix_args([script_path])
    }

    #[tokio::test]
    async fn test_solve_with_fake_solve_field() {
        let dir = tempfile::tempdir().unwrap();
        let solver = script_solver(dir.path(), SOLVING_SCRIPT);
        match solver.solve(&frame(7), Duration::from_secs(10)).await {
            SolveResult::Solved{position, confidence} => {
                assert_abs_diff_eq!(position.ra(), 45.5, epsilon = 1e-9);
                assert_abs_diff_eq!(position.dec(), -12.25, epsilon = 1e-9);
                assert_eq!(confidence, 1.0);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(leftovers(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_unrelated_files_survive_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let solver = script_solver(dir.path(), SOLVING_SCRIPT);
        let work = dir.path().join("work");
        std::fs::write(work.join("frame_0000070.axy"), "other frame").unwrap();
        std::fs::write(work.join("notes.txt"), "keep").unwrap();
        // Stale output of an earlier session with the same frame id.
        std::fs::write(work.join("frame_000007.wcs"), "stale").unwrap();
        assert!(matches!(solver.solve(&frame(7), Duration::from_secs(10)).await,
                         SolveResult::Solved{..}));
        assert_eq!(leftovers(dir.path()), vec!["frame_0000070.axy", "notes.txt"]);
    }

    #[tokio::test]
    async fn test_no_solution() {
        let dir = tempfile::tempdir().unwrap();
        let solver = script_solver(
            dir.path(),
            "for last in \"$@\"; do :; done\ntouch \"${last%.png}.axy\"\necho 'Did not solve'\n");
        assert_eq!(solver.solve(&frame(1), Duration::from_secs(10)).await,
                   SolveResult::failed(SolveError::NoMatch));
        assert!(leftovers(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_solve_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let solver = script_solver(dir.path(), "sleep 30\n");
        assert_eq!(solver.solve(&frame(2), Duration::from_millis(300)).await,
                   SolveResult::failed(SolveError::Timeout));
        assert!(leftovers(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_missing_program() {
        let dir = tempfile::tempdir().unwrap();
        let solver = SolveFieldSolver::new(dir.path().join("no-such-solver"),
                                           dir.path().join("work")).unwrap();
        assert!(matches!(solver.solve(&frame(3), Duration::from_secs(1)).await,
                         SolveResult::Failed{reason: SolveError::Unavailable(_)}));
    }
}
