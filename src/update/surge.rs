//! maxUnavailable / maxSurge parsing for rolling updates

use super::UpdateError;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use std::fmt;
use std::str::FromStr;

/// Default for both parameters when the request leaves them out
pub const DEFAULT_SURGE_PERCENT: i32 = 25;

/// Highest relative maxUnavailable the API server accepts
pub const MAX_UNAVAILABLE_PERCENT: i32 = 100;

/// A pod count, either absolute ("3") or relative to the replica count ("25%")
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurgeValue {
    Absolute(i32),
    Percent(i32),
}

impl SurgeValue {
    pub fn is_zero(&self) -> bool {
        matches!(self, SurgeValue::Absolute(0) | SurgeValue::Percent(0))
    }

    /// Zero is written as "0%" so an explicit zero survives as a percentage
    pub fn to_int_or_string(&self) -> IntOrString {
        match self {
            SurgeValue::Absolute(0) | SurgeValue::Percent(0) => IntOrString::String("0%".to_string()),
            SurgeValue::Absolute(n) => IntOrString::Int(*n),
            SurgeValue::Percent(p) => IntOrString::String(format!("{}%", p)),
        }
    }
}

impl fmt::Display for SurgeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SurgeValue::Absolute(n) => write!(f, "{}", n),
            SurgeValue::Percent(p) => write!(f, "{}%", p),
        }
    }
}

impl FromStr for SurgeValue {
    type Err = String;

    /// Percentages and absolute values must be non-negative
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        if let Some(percent_str) = value.strip_suffix('%') {
            match percent_str.parse::<i32>() {
                Ok(percent) if percent >= 0 => Ok(SurgeValue::Percent(percent)),
                _ => Err(format!("{:?} is not a non-negative percentage", value)),
            }
        } else {
            match value.parse::<i32>() {
                Ok(abs) if abs >= 0 => Ok(SurgeValue::Absolute(abs)),
                _ => Err(format!("{:?} is not a non-negative number", value)),
            }
        }
    }
}

/// Validated rolling-update parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollingParameters {
    pub max_unavailable: SurgeValue,
    pub max_surge: SurgeValue,
}

impl Default for RollingParameters {
    fn default() -> Self {
        Self {
            max_unavailable: SurgeValue::Percent(DEFAULT_SURGE_PERCENT),
            max_surge: SurgeValue::Percent(DEFAULT_SURGE_PERCENT),
        }
    }
}

impl RollingParameters {
    /// Parse request values; empty or missing values take the 25% default
    ///
    /// Both resolving to zero is rejected: such a deployment could never roll.
    /// maxUnavailable is capped at 100%; maxSurge may exceed it.
    pub fn resolve(
        max_unavailable: Option<&str>,
        max_surge: Option<&str>,
    ) -> Result<Self, UpdateError> {
        let max_unavailable = parse_field("MaxUnavailable", max_unavailable)?;
        let max_surge = parse_field("MaxSurge", max_surge)?;

        if let Some(SurgeValue::Percent(p)) = max_unavailable {
            if p > MAX_UNAVAILABLE_PERCENT {
                return Err(UpdateError::Validation(format!(
                    "MaxUnavailable must be a number or a percentage: \"{}%\" is not a percentage between 0% and 100%",
                    p
                )));
            }
        }

        if matches!((max_unavailable, max_surge), (Some(u), Some(s)) if u.is_zero() && s.is_zero()) {
            return Err(UpdateError::Validation(
                "MaxSurge cannot be 0 if MaxUnavailable is 0 or vice versa".to_string(),
            ));
        }

        let defaults = Self::default();
        Ok(Self {
            max_unavailable: max_unavailable.unwrap_or(defaults.max_unavailable),
            max_surge: max_surge.unwrap_or(defaults.max_surge),
        })
    }
}

fn parse_field(field: &str, value: Option<&str>) -> Result<Option<SurgeValue>, UpdateError> {
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(v) => v.parse::<SurgeValue>().map(Some).map_err(|e| {
            UpdateError::Validation(format!("{} must be a number or a percentage: {}", field, e))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_surge_values() {
        assert_eq!("25%".parse::<SurgeValue>(), Ok(SurgeValue::Percent(25)));
        assert_eq!("0%".parse::<SurgeValue>(), Ok(SurgeValue::Percent(0)));
        assert_eq!("100%".parse::<SurgeValue>(), Ok(SurgeValue::Percent(100)));
        assert_eq!("5".parse::<SurgeValue>(), Ok(SurgeValue::Absolute(5)));
        assert_eq!(" 2 ".parse::<SurgeValue>(), Ok(SurgeValue::Absolute(2)));
    }

    #[test]
    fn test_parse_surge_rejects_invalid() {
        for bad in ["-1", "-5%", "abc", "%", "1.5", "ten%"] {
            assert!(bad.parse::<SurgeValue>().is_err(), "{} should be rejected", bad);
        }
    }

    #[test]
    fn test_resolve_defaults_to_25_percent() {
        let params = RollingParameters::resolve(None, None).unwrap();
        assert_eq!(params, RollingParameters::default());

        let params = RollingParameters::resolve(Some(""), Some("  ")).unwrap();
        assert_eq!(params.max_unavailable, SurgeValue::Percent(25));
        assert_eq!(params.max_surge, SurgeValue::Percent(25));
    }

    #[test]
    fn test_resolve_keeps_explicit_zero() {
        let params = RollingParameters::resolve(Some("10%"), Some("0")).unwrap();

        assert_eq!(
            params.max_unavailable.to_int_or_string(),
            IntOrString::String("10%".to_string())
        );
        assert_eq!(
            params.max_surge.to_int_or_string(),
            IntOrString::String("0%".to_string())
        );
    }

    #[test]
    fn test_resolve_rejects_both_zero() {
        for (u, s) in [("0", "0"), ("0%", "0"), ("0", "0%"), ("0%", "0%")] {
            let err = RollingParameters::resolve(Some(u), Some(s)).unwrap_err();
            assert!(err.to_string().contains("cannot be 0"), "{}/{}", u, s);
        }
    }

    #[test]
    fn test_resolve_one_zero_other_default() {
        let params = RollingParameters::resolve(Some("0"), None).unwrap();
        assert!(params.max_unavailable.is_zero());
        assert_eq!(params.max_surge, SurgeValue::Percent(25));
    }

    #[test]
    fn test_resolve_names_bad_field() {
        let err = RollingParameters::resolve(None, Some("lots")).unwrap_err();
        assert!(err.to_string().starts_with("MaxSurge must be a number or a percentage"));
    }

    #[test]
    fn test_resolve_allows_surge_above_100_percent() {
        let params = RollingParameters::resolve(Some("25%"), Some("150%")).unwrap();
        assert_eq!(params.max_surge, SurgeValue::Percent(150));
        assert_eq!(
            params.max_surge.to_int_or_string(),
            IntOrString::String("150%".to_string())
        );
    }

    #[test]
    fn test_resolve_caps_max_unavailable_at_100_percent() {
        assert!(RollingParameters::resolve(Some("100%"), None).is_ok());

        let err = RollingParameters::resolve(Some("150%"), Some("25%")).unwrap_err();
        assert!(matches!(err, UpdateError::Validation(_)));
        assert!(err.to_string().starts_with("MaxUnavailable must be a number or a percentage"));
        assert!(err.to_string().contains("between 0% and 100%"));
    }

    #[test]
    fn test_absolute_values_serialize_as_int() {
        assert_eq!(SurgeValue::Absolute(2).to_int_or_string(), IntOrString::Int(2));
    }
}
