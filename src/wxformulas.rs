//! Derived weather quantities in US customary units.
//!
//! Pure functions over outdoor temperature (°F), relative humidity (%),
//! and wind speed (mph). Every translated record is enriched with these.

/// Dew point in °F from temperature and relative humidity.
pub fn dewpoint_f(t_f: f64, rh: f64) -> Option<f64> {
    if rh <= 0.0 || rh > 100.0 {
        return None;
    }
    let t_c = (t_f - 32.0) * 5.0 / 9.0;
    let gamma = 17.27 * t_c / (237.7 + t_c) + (rh / 100.0).ln();
    if (17.27 - gamma).abs() < f64::EPSILON {
        return None;
    }
    let dp_c = 237.7 * gamma / (17.27 - gamma);
    Some(dp_c * 9.0 / 5.0 + 32.0)
}

/// Wind chill in °F per the 2001 NWS formula. Defined only below 50 °F
/// with wind above 3 mph; otherwise the air temperature is returned.
pub fn windchill_f(t_f: f64, wind_mph: f64) -> f64 {
    if t_f >= 50.0 || wind_mph <= 3.0 {
        return t_f;
    }
    35.74 + 0.6215 * t_f + (0.4275 * t_f - 35.75) * wind_mph.powf(0.16)
}

/// Heat index in °F per the NWS Rothfusz regression. Defined only at or
/// above 80 °F and 40 % humidity; otherwise the air temperature is
/// returned. Never less than the air temperature.
pub fn heatindex_f(t_f: f64, rh: f64) -> f64 {
    if t_f < 80.0 || rh < 40.0 {
        return t_f;
    }
    let hi = -42.379 + 2.049_015_23 * t_f + 10.143_331_27 * rh
        - 0.224_755_41 * t_f * rh
        - 6.837_83e-3 * t_f * t_f
        - 5.481_717e-2 * rh * rh
        + 1.228_74e-3 * t_f * t_f * rh
        + 8.528_2e-4 * t_f * rh * rh
        - 1.99e-6 * t_f * t_f * rh * rh;
    hi.max(t_f)
}
