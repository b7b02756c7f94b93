//! Equatorial sky coordinates and angular separations.
//!
//! Angles are stored in radians. Separations expose arcsecond accessors
//! because every drift quantity downstream is expressed in arcseconds.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt;
use std::ops::Sub;

/// Arcseconds in one degree
pub const ARCSEC_PER_DEGREE: f64 = 3600.0;

/// Arcseconds in one radian
pub const ARCSEC_PER_RADIAN: f64 = 180.0 * 3600.0 / PI;

/// Convert an angle in radians to arcseconds
pub fn radians_to_arcsec(radians: f64) -> f64 {
    radians * ARCSEC_PER_RADIAN
}

/// Convert an angle in arcseconds to radians
pub fn arcsec_to_radians(arcsec: f64) -> f64 {
    arcsec / ARCSEC_PER_RADIAN
}

/// Wrap an angle into the half-open interval (-π, π]
fn wrap_signed(angle: f64) -> f64 {
    let wrapped = angle.rem_euclid(2.0 * PI);
    if wrapped > PI {
        wrapped - 2.0 * PI
    } else {
        wrapped
    }
}

/// Equatorial coordinates (right ascension, declination)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Equatorial {
    /// Right ascension in radians
    pub ra: f64,
    /// Declination in radians
    pub dec: f64,
}

impl Equatorial {
    /// Create coordinates from radians
    pub fn new(ra: f64, dec: f64) -> Self {
        Self { ra, dec }
    }

    /// Create coordinates from right ascension and declination in degrees
    pub fn from_degrees(ra_deg: f64, dec_deg: f64) -> Self {
        Self::new(ra_deg.to_radians(), dec_deg.to_radians())
    }

    /// Create coordinates from right ascension in hours and declination in degrees
    pub fn from_hours_degrees(ra_hours: f64, dec_deg: f64) -> Self {
        Self::from_degrees(ra_hours * 15.0, dec_deg)
    }

    /// Right ascension in degrees
    pub fn ra_degrees(&self) -> f64 {
        self.ra.to_degrees()
    }

    /// Right ascension in hours
    pub fn ra_hours(&self) -> f64 {
        self.ra.to_degrees() / 15.0
    }

    /// Declination in degrees
    pub fn dec_degrees(&self) -> f64 {
        self.dec.to_degrees()
    }

    /// True when both components are finite numbers
    pub fn is_finite(&self) -> bool {
        self.ra.is_finite() && self.dec.is_finite()
    }

    /// Great-circle distance to another position in radians (haversine form)
    pub fn angular_distance(&self, other: &Equatorial) -> f64 {
        let d_dec = other.dec - self.dec;
        let d_ra = other.ra - self.ra;
        let a = (d_dec / 2.0).sin().powi(2)
            + self.dec.cos() * other.dec.cos() * (d_ra / 2.0).sin().powi(2);
        2.0 * a.sqrt().min(1.0).asin()
    }

    /// Offset these coordinates by arcseconds of RA angle and Dec angle.
    ///
    /// The RA offset is applied to the RA coordinate directly (not scaled by
    /// cos(dec)), matching the convention of [`Separation::ra_arcsec`].
    pub fn offset_arcsec(&self, d_ra_arcsec: f64, d_dec_arcsec: f64) -> Equatorial {
        Equatorial::new(
            (self.ra + arcsec_to_radians(d_ra_arcsec)).rem_euclid(2.0 * PI),
            self.dec + arcsec_to_radians(d_dec_arcsec),
        )
    }
}

impl fmt::Display for Equatorial {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "RA {:.5}h Dec {:+.5}°",
            self.ra_hours(),
            self.dec_degrees()
        )
    }
}

/// Difference between two equatorial positions
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Separation {
    /// Difference in right ascension in radians, wrapped to (-π, π]
    pub ra: f64,
    /// Difference in declination in radians
    pub dec: f64,
    /// Great-circle distance in radians
    pub distance: f64,
}

impl Separation {
    /// RA component in arcseconds of RA angle
    pub fn ra_arcsec(&self) -> f64 {
        radians_to_arcsec(self.ra)
    }

    /// Dec component in arcseconds
    pub fn dec_arcsec(&self) -> f64 {
        radians_to_arcsec(self.dec)
    }

    /// Great-circle distance in arcseconds
    pub fn distance_arcsec(&self) -> f64 {
        radians_to_arcsec(self.distance)
    }
}

impl Sub for Equatorial {
    type Output = Separation;

    /// `a - b` is the separation travelled going from `b` to `a`
    fn sub(self, rhs: Equatorial) -> Separation {
        Separation {
            ra: wrap_signed(self.ra - rhs.ra),
            dec: self.dec - rhs.dec,
            distance: rhs.angular_distance(&self),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_separation_of_identical_points_is_zero() {
        let p = Equatorial::from_degrees(83.8, -5.4);
        let sep = p - p;
        assert_eq!(sep.ra, 0.0);
        assert_eq!(sep.dec, 0.0);
        assert_eq!(sep.distance, 0.0);
    }

    #[test]
    fn test_ra_offset_on_equator_matches_distance() {
        let base = Equatorial::from_degrees(120.0, 0.0);
        let moved = base.offset_arcsec(2.0, 0.0);
        let sep = moved - base;
        assert_relative_eq!(sep.ra_arcsec(), 2.0, epsilon = 1e-6);
        assert_relative_eq!(sep.distance_arcsec(), 2.0, epsilon = 1e-6);
        assert_relative_eq!(sep.dec_arcsec(), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_ra_distance_shrinks_with_declination() {
        let base = Equatorial::from_degrees(10.0, 60.0);
        let moved = base.offset_arcsec(10.0, 0.0);
        let sep = moved - base;
        assert_relative_eq!(sep.ra_arcsec(), 10.0, epsilon = 1e-6);
        // cos(60°) = 0.5
        assert_relative_eq!(sep.distance_arcsec(), 5.0, epsilon = 1e-4);
    }

    #[test]
    fn test_ra_difference_wraps_across_zero() {
        let before = Equatorial::from_degrees(359.9995, 0.0);
        let after = Equatorial::from_degrees(0.0005, 0.0);
        let sep = after - before;
        assert_relative_eq!(sep.ra_arcsec(), 3.6, epsilon = 1e-6);
        assert!(sep.ra > 0.0);
    }

    #[test]
    fn test_dec_offset() {
        let base = Equatorial::from_hours_degrees(5.5, 20.0);
        let moved = base.offset_arcsec(0.0, -3.0);
        let sep = moved - base;
        assert_relative_eq!(sep.dec_arcsec(), -3.0, epsilon = 1e-6);
        assert_relative_eq!(sep.distance_arcsec(), 3.0, epsilon = 1e-6);
    }

    #[test]
    fn test_hours_round_trip() {
        let p = Equatorial::from_hours_degrees(6.0, 45.0);
        assert_relative_eq!(p.ra_hours(), 6.0, epsilon = 1e-12);
        assert_relative_eq!(p.ra_degrees(), 90.0, epsilon = 1e-12);
        assert_relative_eq!(p.dec_degrees(), 45.0, epsilon = 1e-12);
    }

    #[test]
    fn test_non_finite_detection() {
        assert!(Equatorial::from_degrees(1.0, 2.0).is_finite());
        assert!(!Equatorial::new(f64::NAN, 0.0).is_finite());
    }
}
