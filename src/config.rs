// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use astro::angle::{deg_frm_dms, deg_frm_hms};
use canonical_error::{CanonicalError, invalid_argument_error};

use cedar_goto_elements::solver_trait::PlateSolver;

use crate::nova::{HttpNovaApi, NovaSolver};
use crate::simulator::{SimulatedSky, SimulatedSolver, SolverBehavior};
use crate::solve_field::SolveFieldSolver;

// Which plate solver a session uses. Chosen once, before the session starts.
#[derive(Clone, Debug)]
pub enum SolverConfig {
    Local {
        solve_field: PathBuf,
        work_dir: PathBuf,
        // Field width bounds, degrees.
        scale_hint: Option<(f64, f64)>,
    },
    Remote {
        base_url: String,
        api_key: String,
        poll_interval: Duration,
    },
    Simulated,
}

pub fn build_solver(config: &SolverConfig, sky: Option<Arc<SimulatedSky>>)
                    -> Result<Box<dyn PlateSolver>, CanonicalError> {
    match config {
        SolverConfig::Local{solve_field, work_dir, scale_hint} => {
            let mut solver = SolveFieldSolver::new(solve_field, work_dir)?;
            if let Some((low, high)) = scale_hint {
                solver = solver.with_scale_hint(*low, *high);
            }
            Ok(Box::new(solver))
        }
        SolverConfig::Remote{base_url, api_key, poll_interval} => {
            let api = HttpNovaApi::new(base_url, api_key)?;
            Ok(Box::new(NovaSolver::new(api, *poll_interval)))
        }
        SolverConfig::Simulated => {
            let Some(sky) = sky else {
                return Err(invalid_argument_error(
                    "The simulated solver requires the simulated camera and mount"));
            };
            Ok(Box::new(SimulatedSolver::new(sky, SolverBehavior::TrueSky)))
        }
    }
}

fn parse_number(s: &str, what: &str) -> Result<f64, CanonicalError> {
    match s.trim().parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(invalid_argument_error(
            format!("Invalid {} component {:?}", what, s).as_str())),
    }
}

// Splits "05:35:17.3", "5h35m17.3s" or "-5d23m28s" into sign and up to three
// fields. Returns None when the string has no separators (plain decimal).
fn split_sexagesimal(s: &str) -> Option<(bool, Vec<&str>)> {
    let s = s.trim();
    let (negative, body) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let is_separator = |c: char| matches!(c, ':' | 'h' | 'm' | 's' | 'd' | '\'' | '"' | '°' | ' ');
    if !body.contains(is_separator) {
        return None;
    }
    let fields = body.split(is_separator).filter(|f| !f.is_empty()).collect();
    Some((negative, fields))
}

fn sexagesimal_fields(fields: &[&str], what: &str)
                      -> Result<(i64, i64, f64), CanonicalError> {
    if fields.is_empty() || fields.len() > 3 {
        return Err(invalid_argument_error(
            format!("Expected 1 to 3 {} fields, got {:?}", what, fields).as_str()));
    }
    let whole = parse_number(fields[0], what)?;
    let minutes = match fields.get(1) {
        Some(m) => parse_number(m, what)?,
        None => 0.0,
    };
    let seconds = match fields.get(2) {
        Some(s) => parse_number(s, what)?,
        None => 0.0,
    };
    if whole.fract() != 0.0 || minutes.fract() != 0.0 || !(0.0..60.0).contains(&minutes)
        || !(0.0..60.0).contains(&seconds) {
        return Err(invalid_argument_error(
            format!("Invalid {} {:?}", what, fields).as_str()));
    }
    Ok((whole as i64, minutes as i64, seconds))
}

/// Right ascension in degrees from either decimal degrees ("83.822") or
/// hours/minutes/seconds ("5h35m17.3s", "05:35:17.3").
pub fn parse_ra(s: &str) -> Result<f64, CanonicalError> {
    let ra = match split_sexagesimal(s) {
        None => parse_number(s, "right ascension")?,
        Some((true, _)) => {
            return Err(invalid_argument_error("Right ascension cannot be negative"));
        }
        Some((false, fields)) => {
            let (h, m, sec) = sexagesimal_fields(&fields, "right ascension")?;
            if h >= 24 {
                return Err(invalid_argument_error(
                    format!("Right ascension hours {} out of range", h).as_str()));
            }
            deg_frm_hms(h, m, sec)
        }
    };
    if !(0.0..360.0).contains(&ra) {
        return Err(invalid_argument_error(
            format!("Right ascension {} outside 0..360", ra).as_str()));
    }
    Ok(ra)
}

/// Declination in degrees from either decimal degrees ("-5.391") or
/// degrees/minutes/seconds ("-05:23:28", "-5d23m28s").
pub fn parse_dec(s: &str) -> Result<f64, CanonicalError> {
    let dec = match split_sexagesimal(s) {
        None => parse_number(s, "declination")?,
        Some((negative, fields)) => {
            let (d, m, sec) = sexagesimal_fields(&fields, "declination")?;
            let dec = deg_frm_dms(d, m, sec);
            if negative { -dec } else { dec }
        }
    };
    if dec.abs() > 90.0 {
        return Err(invalid_argument_error(
            format!("Declination {} outside -90..90", dec).as_str()));
    }
    Ok(dec)
}
