// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fmt;
use std::time::SystemTime;

use astro::angle::{deg_frm_dms, deg_frm_hms};

use crate::astro_util::normalize_degrees;

// Reference equinox of an equatorial position.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Epoch {
    J2000,
    // Julian epoch, e.g. 2024.5.
    Julian(f64),
    // Equinox of the date at which the position is used. Mounts and LX200
    // style protocols usually work in this frame ("JNow").
    OfDate,
}

impl Epoch {
    // Julian epoch year, resolving OfDate against `time`.
    pub fn julian_year(&self, time: &SystemTime) -> f64 {
        match self {
            Epoch::J2000 => 2000.0,
            Epoch::Julian(year) => *year,
            Epoch::OfDate => crate::astro_util::julian_year(time),
        }
    }
}

// Sky-fixed position. Immutable once built.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EquatorialPosition {
    // Degrees, 0..360.
    ra: f64,
    // Degrees, -90..90.
    dec: f64,
    epoch: Epoch,
}

impl EquatorialPosition {
    // RA is wrapped into 0..360. Declination is not validated here; the
    // transforms reject out of range values.
    pub fn new(ra: f64, dec: f64, epoch: Epoch) -> Self {
        EquatorialPosition{ra: normalize_degrees(ra), dec, epoch}
    }

    // RA in hours/minutes/seconds, Dec in degrees/minutes/seconds. A negative
    // declination near zero is expressed with `dec_negative`, since -0
    // degrees cannot carry the sign.
    pub fn from_sexagesimal(ra_h: i64, ra_m: i64, ra_s: f64,
                            dec_d: i64, dec_m: i64, dec_s: f64,
                            dec_negative: bool, epoch: Epoch) -> Self {
        let ra = deg_frm_hms(ra_h, ra_m, ra_s);
        let dec = deg_frm_dms(dec_d.abs(), dec_m, dec_s);
        let negative = dec_negative || dec_d < 0;
        Self::new(ra, if negative { -dec } else { dec }, epoch)
    }

    pub fn ra(&self) -> f64 { self.ra }
    pub fn dec(&self) -> f64 { self.dec }
    pub fn epoch(&self) -> Epoch { self.epoch }
}

impl fmt::Display for EquatorialPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RA {:.4}° Dec {:+.4}° ({:?})", self.ra, self.dec, self.epoch)
    }
}

// Observer-local position, the mount's native command frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HorizontalPosition {
    // Degrees above the horizon, -90..90.
    altitude: f64,
    // Degrees clockwise from north, 0..360.
    azimuth: f64,
}

impl HorizontalPosition {
    pub fn new(altitude: f64, azimuth: f64) -> Self {
        HorizontalPosition{altitude, azimuth: normalize_degrees(azimuth)}
    }

    pub fn altitude(&self) -> f64 { self.altitude }
    pub fn azimuth(&self) -> f64 { self.azimuth }
}

impl fmt::Display for HorizontalPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Alt {:+.4}° Az {:.4}°", self.altitude, self.azimuth)
    }
}

// Where and when the sky is observed from. Supplied by configuration.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ObserverFrame {
    // Degrees, positive north.
    pub latitude: f64,
    // Degrees, positive east.
    pub longitude: f64,
    // Meters above sea level. Carried for adapters; refraction is not modeled.
    pub elevation: f64,
    pub timestamp: SystemTime,
}

impl ObserverFrame {
    pub fn new(latitude: f64, longitude: f64, elevation: f64,
               timestamp: SystemTime) -> Self {
        ObserverFrame{latitude, longitude, elevation, timestamp}
    }

    // Same site, different instant.
    pub fn at(&self, timestamp: SystemTime) -> Self {
        ObserverFrame{timestamp, ..*self}
    }
}

// Difference between where we want to point and where we actually point,
// expressed in the mount's horizontal frame.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PointingError {
    // Target minus solved altitude, degrees.
    pub d_alt: f64,
    // Target minus solved azimuth, degrees, wrapped into -180..180.
    pub d_az: f64,
    // Great-circle distance between target and solved position, degrees.
    pub separation: f64,
}

impl fmt::Display for PointingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.4}° (dAlt {:+.4}°, dAz {:+.4}°)",
               self.separation, self.d_alt, self.d_az)
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;

    #[test]
    fn test_sexagesimal() {
        // M42.
        let m42 = EquatorialPosition::from_sexagesimal(
            5, 35, 17.3, -5, 23, 28.0, true, Epoch::J2000);
        assert_abs_diff_eq!(m42.ra(), 83.822083, epsilon = 1e-5);
        assert_abs_diff_eq!(m42.dec(), -5.391111, epsilon = 1e-5);

        // Negative declination with zero degrees.
        let p = EquatorialPosition::from_sexagesimal(
            0, 0, 0.0, 0, 30, 0.0, true, Epoch::J2000);
        assert_abs_diff_eq!(p.dec(), -0.5, epsilon = 1e-9);
    }

    #[test]
    fn test_wrapping() {
        let p = EquatorialPosition::new(-10.0, 20.0, Epoch::J2000);
        assert_abs_diff_eq!(p.ra(), 350.0, epsilon = 1e-9);
        let h = HorizontalPosition::new(30.0, 725.0);
        assert_abs_diff_eq!(h.azimuth(), 5.0, epsilon = 1e-9);
    }
}
