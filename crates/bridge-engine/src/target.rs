//! Where a write lands.
//!
//! Profiles and device lines name targets as prefixed strings. They are parsed
//! once into [`Target`] and matched on from then on.

use crate::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Target {
    /// A simulator value or command. `XP:`, `CMD:` or no prefix.
    Simulator(String),
    /// A locally held variable. `VAR:`.
    Variable(String),
    /// A universal hardware key. `ID:` or `KEY:`.
    HardwareKey(String),
}

const SIMULATOR_PREFIXES: [&str; 2] = ["XP:", "CMD:"];
const VARIABLE_PREFIXES: [&str; 1] = ["VAR:"];
const KEY_PREFIXES: [&str; 2] = ["ID:", "KEY:"];

fn strip_any<'a>(raw: &'a str, prefixes: &[&str]) -> Option<&'a str> {
    prefixes.iter().find_map(|p| {
        raw.get(..p.len())
            .filter(|head| head.eq_ignore_ascii_case(p))
            .map(|_| &raw[p.len()..])
    })
}

impl Target {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let target = if let Some(name) = strip_any(raw, &VARIABLE_PREFIXES) {
            Target::Variable(name.trim().to_string())
        } else if let Some(key) = strip_any(raw, &KEY_PREFIXES) {
            Target::HardwareKey(key.trim().to_ascii_uppercase())
        } else if let Some(name) = strip_any(raw, &SIMULATOR_PREFIXES) {
            Target::Simulator(name.trim().to_string())
        } else {
            Target::Simulator(raw.to_string())
        };
        if target.name().is_empty() {
            return Err(BridgeError::InvalidTarget(raw.to_string()));
        }
        Ok(target)
    }

    /// The bare name without any prefix.
    pub fn name(&self) -> &str {
        match self {
            Target::Simulator(n) | Target::Variable(n) | Target::HardwareKey(n) => n,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Simulator(n) => f.write_str(n),
            Target::Variable(n) => write!(f, "VAR:{n}"),
            Target::HardwareKey(k) => write!(f, "KEY:{k}"),
        }
    }
}

impl FromStr for Target {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        Target::parse(s)
    }
}

impl TryFrom<String> for Target {
    type Error = BridgeError;

    fn try_from(value: String) -> Result<Self> {
        Target::parse(&value)
    }
}

impl From<Target> for String {
    fn from(value: Target) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixes_pick_the_variant() {
        assert_eq!(
            Target::parse("XP:sim/cockpit/autopilot/heading").unwrap(),
            Target::Simulator("sim/cockpit/autopilot/heading".into())
        );
        assert_eq!(
            Target::parse("CMD:sim/lights/landing_lights_toggle").unwrap(),
            Target::Simulator("sim/lights/landing_lights_toggle".into())
        );
        assert_eq!(
            Target::parse("VAR:gear_warning").unwrap(),
            Target::Variable("gear_warning".into())
        );
        assert_eq!(Target::parse("id:led1").unwrap(), Target::HardwareKey("LED1".into()));
        assert_eq!(Target::parse("KEY:HDG").unwrap(), Target::HardwareKey("HDG".into()));
        assert_eq!(
            Target::parse("sim/flightmodel/position/elevation").unwrap(),
            Target::Simulator("sim/flightmodel/position/elevation".into())
        );
    }

    #[test]
    fn empty_names_are_rejected() {
        assert!(Target::parse("").is_err());
        assert!(Target::parse("VAR:").is_err());
        assert!(Target::parse("KEY:  ").is_err());
    }

    #[test]
    fn serde_uses_the_prefixed_form() {
        let json = serde_json::to_string(&Target::Variable("x".into())).unwrap();
        assert_eq!(json, "\"VAR:x\"");
        let back: Target = serde_json::from_str("\"KEY:gear\"").unwrap();
        assert_eq!(back, Target::HardwareKey("GEAR".into()));
        assert!(serde_json::from_str::<Target>("\"\"").is_err());
    }
}
