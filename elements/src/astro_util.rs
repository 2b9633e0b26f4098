// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::{f64::consts::PI, time::SystemTime};

use astro::{
    angle::limit_to_two_PI,
    time::{julian_day, mn_sidr, CalType, Date},
};
use chrono::{DateTime, Datelike, Timelike, Utc};

use crate::coords::{EquatorialPosition, Epoch, HorizontalPosition,
                    ObserverFrame, PointingError};
use crate::errors::DomainError;

extern crate nalgebra as na;

const J2000_JD: f64 = 2451545.0;

/// Wraps degrees into 0..360. Never returns 360.
pub fn normalize_degrees(deg: f64) -> f64 {
    let wrapped = deg.rem_euclid(360.0);
    // rem_euclid() of a tiny negative value rounds up to 360.
    if wrapped >= 360.0 { 0.0 } else { wrapped }
}

/// Wraps degrees into -180..180.
pub fn wrap_degrees_180(deg: f64) -> f64 {
    let wrapped = normalize_degrees(deg);
    if wrapped > 180.0 { wrapped - 360.0 } else { wrapped }
}

/// Convert ra/dec (radians) to x/y/z on unit sphere.
pub fn to_unit_vector(ra: f64, dec: f64) -> na::Vector3<f64> {
    na::Vector3::new(ra.cos() * dec.cos(), ra.sin() * dec.cos(), dec.sin())
}

/// Convert x/y/z on unit sphere to ra/dec (radians). Returned ra is 0..2PI.
/// Uses atan2 for both angles so precision holds near the poles.
pub fn from_unit_vector(v: &na::Vector3<f64>) -> (f64, f64) {
    let dec = v.z.atan2(v.x.hypot(v.y));
    let mut ra = v.y.atan2(v.x);
    if ra < 0.0 {
        ra += 2.0 * PI;
    }
    (ra, dec)
}

/// Returns the separation, in radians, between the given celestial coordinates
/// (in radians). Vincenty's formula; well conditioned for both tiny and
/// near-antipodal separations.
pub fn angular_separation(
    p0_ra: f64,
    p0_dec: f64,
    p1_ra: f64,
    p1_dec: f64,
) -> f64 {
    let d_ra = p1_ra - p0_ra;
    let (sin0, cos0) = p0_dec.sin_cos();
    let (sin1, cos1) = p1_dec.sin_cos();
    let (sin_d, cos_d) = d_ra.sin_cos();
    let y1 = cos1 * sin_d;
    let y2 = cos0 * sin1 - sin0 * cos1 * cos_d;
    let x = sin0 * sin1 + cos0 * cos1 * cos_d;
    y1.hypot(y2).atan2(x)
}

/// Great-circle distance (degrees) between two horizontal positions.
pub fn horizontal_separation(a: &HorizontalPosition,
                             b: &HorizontalPosition) -> f64 {
    angular_separation(a.azimuth().to_radians(), a.altitude().to_radians(),
                       b.azimuth().to_radians(), b.altitude().to_radians())
        .to_degrees()
}

/// Pointing error of `solved` relative to `target`.
pub fn pointing_error(target: &HorizontalPosition,
                      solved: &HorizontalPosition) -> PointingError {
    PointingError {
        d_alt: target.altitude() - solved.altitude(),
        d_az: wrap_degrees_180(target.azimuth() - solved.azimuth()),
        separation: horizontal_separation(target, solved),
    }
}

/// Julian day, including the fraction of the day, of the given time.
pub fn julian_day_from_system_time(time: &SystemTime) -> f64 {
    let dt_utc = DateTime::<Utc>::from(*time);
    julian_day_at_midnight(&dt_utc) + utc_hours(&dt_utc) / 24.0
}

/// Julian epoch year (e.g. 2024.37) of the given time.
pub fn julian_year(time: &SystemTime) -> f64 {
    2000.0 + (julian_day_from_system_time(time) - J2000_JD) / 365.25
}

fn julian_day_at_midnight(dt_utc: &DateTime<Utc>) -> f64 {
    let date = Date {
        year: dt_utc.year() as i16,
        month: dt_utc.month() as u8,
        decimal_day: dt_utc.day() as f64,
        cal_type: CalType::Gregorian,
    };
    julian_day(&date)
}

fn utc_hours(dt_utc: &DateTime<Utc>) -> f64 {
    (dt_utc.num_seconds_from_midnight() as f64
     + dt_utc.nanosecond() as f64 * 1e-9) / 3600.0
}

/// Greenwich mean sidereal time, radians 0..2PI.
pub fn greenwich_mean_sidereal_time(time: &SystemTime) -> f64 {
    let dt_utc = DateTime::<Utc>::from(*time);
    let jd = julian_day_at_midnight(&dt_utc);
    let gmst_hours =
        mn_sidr(jd).to_degrees() / 15.0 + utc_hours(&dt_utc) * 1.00273790935;

    limit_to_two_PI((gmst_hours * 15.0).to_radians())
}

/// Local mean sidereal time, radians 0..2PI. `long` is radians, positive east.
pub fn local_sidereal_time(time: &SystemTime, long: f64) -> f64 {
    limit_to_two_PI(greenwich_mean_sidereal_time(time) + long)
}

// Rotates hour angle/declination unit vectors into the horizon frame used by
// Meeus (azimuth measured westward from south).
fn horizon_rotation(lat: f64) -> na::Matrix3<f64> {
    let (s, c) = lat.sin_cos();
    na::Matrix3::new(s, 0.0, -c,
                     0.0, 1.0, 0.0,
                     c, 0.0, s)
}

/// Returns (alt, az, ha) in radians. Returned azimuth is clockwise from north,
/// 0..2PI. Returned hour angle is -PI..PI.
/// ra: right ascension (equinox of date) in radians.
/// dec: declination in radians.
/// lat: observer latitude in radians.
/// long: observer longitude in radians.
pub fn alt_az_from_equatorial(
    ra: f64,
    dec: f64,
    lat: f64,
    long: f64,
    time: &SystemTime,
) -> (/* alt */ f64, /* az */ f64, /* ha */ f64) {
    // Note that astro::coords::hr_angl_frm_observer_long() has a bug.
    // Fortunately the correct relation is trivial.
    let hour_angle = local_sidereal_time(time, long) - ra;

    let h = horizon_rotation(lat) * to_unit_vector(hour_angle, dec);
    let alt = h.z.atan2(h.x.hypot(h.y));
    let meeus_az = h.y.atan2(h.x);
    let az = limit_to_two_PI(meeus_az + PI);
    let mut ha = limit_to_two_PI(hour_angle);
    if ha > PI {
        ha -= 2.0 * PI;
    }

    (alt, az, ha)
}

/// Returns (ra, dec) in radians, equinox of date. Returned ra is 0..2PI.
/// alt: elevation in radians
/// az: radians, clockwise from north
/// lat: observer latitude in radians.
/// long: observer longitude in radians.
pub fn equatorial_from_alt_az(
    alt: f64,
    az: f64,
    lat: f64,
    long: f64,
    time: &SystemTime,
) -> (f64, f64) {
    let meeus_az = az - PI;
    let h = na::Vector3::new(alt.cos() * meeus_az.cos(),
                             alt.cos() * meeus_az.sin(),
                             alt.sin());
    let v = horizon_rotation(lat).transpose() * h;
    let (hour_angle, dec) = from_unit_vector(&v);
    let ra = limit_to_two_PI(local_sidereal_time(time, long) - hour_angle);

    (ra, dec)
}

/// IAU 1976 precession matrix taking J2000 unit vectors to the mean equinox
/// of `julian_year`.
pub fn precession_matrix(julian_year: f64) -> na::Matrix3<f64> {
    let t = (julian_year - 2000.0) / 100.0;
    let arcsec = |a: f64| (a / 3600.0).to_radians();
    let zeta = arcsec(2306.2181 * t + 0.30188 * t * t + 0.017998 * t * t * t);
    let z = arcsec(2306.2181 * t + 1.09468 * t * t + 0.018203 * t * t * t);
    let theta = arcsec(2004.3109 * t - 0.42665 * t * t - 0.041833 * t * t * t);

    let (sin_zeta, cos_zeta) = zeta.sin_cos();
    let (sin_z, cos_z) = z.sin_cos();
    let (sin_theta, cos_theta) = theta.sin_cos();
    na::Matrix3::new(
        cos_zeta * cos_theta * cos_z - sin_zeta * sin_z,
        -sin_zeta * cos_theta * cos_z - cos_zeta * sin_z,
        -sin_theta * cos_z,
        cos_zeta * cos_theta * sin_z + sin_zeta * cos_z,
        -sin_zeta * cos_theta * sin_z + cos_zeta * cos_z,
        -sin_theta * sin_z,
        cos_zeta * sin_theta,
        -sin_zeta * sin_theta,
        cos_theta)
}

/// Re-expresses `position` in the equinox `to`. OfDate epochs are resolved
/// against `time`. Going through J2000 with the transpose keeps A -> B -> A
/// exact to rounding.
pub fn precess(position: &EquatorialPosition, to: Epoch,
               time: &SystemTime) -> EquatorialPosition {
    let from_year = position.epoch().julian_year(time);
    let to_year = to.julian_year(time);
    if from_year == to_year {
        return EquatorialPosition::new(position.ra(), position.dec(), to);
    }
    let v = to_unit_vector(position.ra().to_radians(),
                           position.dec().to_radians());
    let j2000 = precession_matrix(from_year).transpose() * v;
    let (ra, dec) = from_unit_vector(&(precession_matrix(to_year) * j2000));
    EquatorialPosition::new(ra.to_degrees(), dec.to_degrees(), to)
}

fn check_observer(frame: &ObserverFrame) -> Result<(), DomainError> {
    if !frame.latitude.is_finite() {
        return Err(DomainError::NotFinite("latitude"));
    }
    if !frame.longitude.is_finite() {
        return Err(DomainError::NotFinite("longitude"));
    }
    if frame.latitude.abs() > 90.0 {
        return Err(DomainError::Latitude(frame.latitude));
    }
    Ok(())
}

/// Converts a sky position to the observer's horizontal frame at
/// `frame.timestamp`. Valid for every sky position, circumpolar or not.
pub fn to_horizontal(position: &EquatorialPosition, frame: &ObserverFrame)
                     -> Result<HorizontalPosition, DomainError> {
    check_observer(frame)?;
    if !position.ra().is_finite() {
        return Err(DomainError::NotFinite("right ascension"));
    }
    if !position.dec().is_finite() {
        return Err(DomainError::NotFinite("declination"));
    }
    if position.dec().abs() > 90.0 {
        return Err(DomainError::Declination(position.dec()));
    }
    let of_date = precess(position, Epoch::OfDate, &frame.timestamp);
    let (alt, az, _ha) = alt_az_from_equatorial(
        of_date.ra().to_radians(), of_date.dec().to_radians(),
        frame.latitude.to_radians(), frame.longitude.to_radians(),
        &frame.timestamp);
    Ok(HorizontalPosition::new(alt.to_degrees(), az.to_degrees()))
}

/// Inverse of to_horizontal(). The result is expressed in `epoch`.
pub fn to_equatorial(position: &HorizontalPosition, frame: &ObserverFrame,
                     epoch: Epoch)
                     -> Result<EquatorialPosition, DomainError> {
    check_observer(frame)?;
    if !position.altitude().is_finite() {
        return Err(DomainError::NotFinite("altitude"));
    }
    if !position.azimuth().is_finite() {
        return Err(DomainError::NotFinite("azimuth"));
    }
    if position.altitude().abs() > 90.0 {
        return Err(DomainError::Altitude(position.altitude()));
    }
    let (ra, dec) = equatorial_from_alt_az(
        position.altitude().to_radians(), position.azimuth().to_radians(),
        frame.latitude.to_radians(), frame.longitude.to_radians(),
        &frame.timestamp);
    let of_date = EquatorialPosition::new(
        ra.to_degrees(), dec.to_degrees(), Epoch::OfDate);
    Ok(precess(&of_date, epoch, &frame.timestamp))
}

#[cfg(test)]
mod tests {
    extern crate approx;
    use std::time::Duration;

    use approx::assert_abs_diff_eq;
    use astro::angle::{deg_frm_dms, deg_frm_hms};
    use astro::coords::{alt_frm_eq, az_frm_eq};
    use chrono::{FixedOffset, TimeZone};

    use super::*;

    fn mizar_time() -> SystemTime {
        let dt = FixedOffset::west_opt(8 * 3600)
            .unwrap()
            .with_ymd_and_hms(2024, 3, 7, 23, 56, 0)
            .unwrap();
        SystemTime::UNIX_EPOCH
            .checked_add(Duration::from_secs_f64(
                dt.timestamp_millis() as f64 / 1000.0,
            ))
            .unwrap()
    }

    #[test]
    fn test_normalize_degrees() {
        assert_eq!(normalize_degrees(0.0), 0.0);
        assert_eq!(normalize_degrees(360.0), 0.0);
        assert_eq!(normalize_degrees(-1e-17), 0.0);
        assert_abs_diff_eq!(normalize_degrees(-90.0), 270.0);
        assert_abs_diff_eq!(normalize_degrees(725.5), 5.5);
        assert_abs_diff_eq!(wrap_degrees_180(359.0), -1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(wrap_degrees_180(181.0), -179.0, epsilon = 1e-12);
        assert_abs_diff_eq!(wrap_degrees_180(-10.0), -10.0, epsilon = 1e-12);
    }

    #[test]
    fn test_angular_separation() {
        let p0_ra = PI;
        let p0_dec = 0.0;

        let p1_ra = PI + 1.0;
        let p1_dec = 1.0;

        let sep = angular_separation(p0_ra, p0_dec, p1_ra, p1_dec);
        assert_abs_diff_eq!(sep, 1.27, epsilon = 0.01);

        // Compute it a different way.
        let v0 = to_unit_vector(p0_ra, p0_dec);
        let v1 = to_unit_vector(p1_ra, p1_dec);
        assert_abs_diff_eq!(sep, v0.angle(&v1), epsilon = 1e-12);

        // Tiny separations stay accurate.
        let tiny = angular_separation(1.0, 0.5, 1.0, 0.5 + 1e-10);
        assert_abs_diff_eq!(tiny, 1e-10, epsilon = 1e-15);
    }

    #[test]
    fn test_alt_az_equatorial_conversion() {
        let mizar_ra = deg_frm_hms(13, 23, 55.5).to_radians();
        let mizar_dec = deg_frm_dms(54, 55, 31.3).to_radians();
        let time = mizar_time();

        let lat = 37_f64.to_radians();
        let long = -122_f64.to_radians();

        let (alt, az, ha) =
            alt_az_from_equatorial(mizar_ra, mizar_dec, lat, long, &time);

        // Expected values obtained from SkySafari.
        assert_abs_diff_eq!(
            alt,
            deg_frm_dms(58, 52, 14.3).to_radians(),
            epsilon = 0.01
        );
        assert_abs_diff_eq!(
            az,
            deg_frm_dms(42, 59, 36.7).to_radians(),
            epsilon = 0.01
        );
        assert_abs_diff_eq!(
            ha,
            -deg_frm_hms(2, 29, 50.9).to_radians(),
            epsilon = 0.01
        );

        // Agrees with Meeus' closed forms.
        assert_abs_diff_eq!(alt, alt_frm_eq(ha, mizar_dec, lat), epsilon = 1e-9);
        assert_abs_diff_eq!(az, limit_to_two_PI(az_frm_eq(ha, mizar_dec, lat) + PI),
                            epsilon = 1e-9);

        // Now go the other way.
        let (ra, dec) = equatorial_from_alt_az(alt, az, lat, long, &time);
        assert_abs_diff_eq!(ra, mizar_ra, epsilon = 1e-9);
        assert_abs_diff_eq!(dec, mizar_dec, epsilon = 1e-9);
    }

    #[test]
    fn test_round_trip_grid() {
        let time = mizar_time();
        for lat in [-90.0, -66.0, -33.0, 0.0, 37.0, 64.5, 89.9, 90.0] {
            for long in [-179.5, -122.0, 0.0, 45.0, 180.0] {
                let frame = ObserverFrame::new(lat, long, 0.0, time);
                for dec_step in -18..=18 {
                    let dec = dec_step as f64 * 5.0;
                    for ra_step in 0..24 {
                        let ra = ra_step as f64 * 15.0 + 0.37;
                        for epoch in [Epoch::OfDate, Epoch::J2000,
                                      Epoch::Julian(2030.0)] {
                            let e = EquatorialPosition::new(ra, dec, epoch);
                            let h = to_horizontal(&e, &frame).unwrap();
                            assert!(h.azimuth() >= 0.0 && h.azimuth() < 360.0);
                            assert!(h.altitude().abs() <= 90.0);
                            let back = to_equatorial(&h, &frame, epoch).unwrap();
                            assert_eq!(back.epoch(), epoch);
                            let sep = angular_separation(
                                e.ra().to_radians(), e.dec().to_radians(),
                                back.ra().to_radians(), back.dec().to_radians())
                                .to_degrees();
                            assert!(sep < 1e-6,
                                    "lat {} long {} ra {} dec {}: {}",
                                    lat, long, ra, dec, sep);
                            if dec.abs() <= 80.0 {
                                assert_abs_diff_eq!(
                                    wrap_degrees_180(back.ra() - e.ra()), 0.0,
                                    epsilon = 1e-6);
                                assert_abs_diff_eq!(back.dec(), e.dec(),
                                                    epsilon = 1e-6);
                            }
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_azimuth_wraps_near_north() {
        // A star just east and just west of the meridian below the pole
        // straddles azimuth 0.
        let frame = ObserverFrame::new(50.0, 0.0, 0.0, mizar_time());
        let lst = local_sidereal_time(&frame.timestamp, 0.0).to_degrees();
        let east = EquatorialPosition::new(lst + 180.0 - 0.5, 60.0, Epoch::OfDate);
        let west = EquatorialPosition::new(lst + 180.0 + 0.5, 60.0, Epoch::OfDate);
        let h_east = to_horizontal(&east, &frame).unwrap();
        let h_west = to_horizontal(&west, &frame).unwrap();
        for h in [h_east, h_west] {
            assert!(h.azimuth() >= 0.0 && h.azimuth() < 360.0);
            assert!(h.azimuth() < 1.0 || h.azimuth() > 359.0);
        }
        // No discontinuity artifact in the error computation.
        let err = pointing_error(&h_east, &h_west);
        assert!(err.d_az.abs() < 2.0);
        assert!(err.separation < 1.0);
    }

    #[test]
    fn test_domain_errors() {
        let frame = ObserverFrame::new(37.0, -122.0, 0.0, mizar_time());
        let bad_dec = EquatorialPosition::new(10.0, 90.5, Epoch::J2000);
        assert_eq!(to_horizontal(&bad_dec, &frame),
                   Err(DomainError::Declination(90.5)));
        let nan_dec = EquatorialPosition::new(10.0, f64::NAN, Epoch::J2000);
        assert!(to_horizontal(&nan_dec, &frame).is_err());
        let bad_alt = HorizontalPosition::new(-91.0, 10.0);
        assert_eq!(to_equatorial(&bad_alt, &frame, Epoch::J2000),
                   Err(DomainError::Altitude(-91.0)));
        let bad_frame = ObserverFrame::new(95.0, 0.0, 0.0, mizar_time());
        let ok = EquatorialPosition::new(10.0, 10.0, Epoch::J2000);
        assert_eq!(to_horizontal(&ok, &bad_frame),
                   Err(DomainError::Latitude(95.0)));

        // The celestial pole is a valid input.
        let pole = EquatorialPosition::new(0.0, 90.0, Epoch::OfDate);
        let h = to_horizontal(&pole, &frame).unwrap();
        assert_abs_diff_eq!(h.altitude(), 37.0, epsilon = 1e-9);
        assert!(h.azimuth() < 1e-6 || h.azimuth() > 360.0 - 1e-6);
    }

    #[test]
    fn test_precession() {
        let time = mizar_time();
        let p = EquatorialPosition::new(0.0, 0.0, Epoch::J2000);
        let p2050 = precess(&p, Epoch::Julian(2050.0), &time);
        // About 46"/yr in RA and 20"/yr in Dec at the equinox.
        assert_abs_diff_eq!(p2050.ra(), 0.6406, epsilon = 0.005);
        assert_abs_diff_eq!(p2050.dec(), 0.2784, epsilon = 0.005);

        let back = precess(&p2050, Epoch::J2000, &time);
        assert_abs_diff_eq!(wrap_degrees_180(back.ra()), 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(back.dec(), 0.0, epsilon = 1e-9);

        let same = precess(&p, Epoch::J2000, &time);
        assert_eq!(same, p);
    }

    #[test]
    fn test_julian_year() {
        let dt = Utc.with_ymd_and_hms(2000, 1, 1, 12, 0, 0).unwrap();
        let time = SystemTime::from(dt);
        assert_abs_diff_eq!(julian_day_from_system_time(&time), J2000_JD,
                            epsilon = 1e-6);
        assert_abs_diff_eq!(julian_year(&time), 2000.0, epsilon = 1e-9);
    }
}  // mod tests.
