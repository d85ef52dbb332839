use anyhow::Context;
use bridge_engine::BridgeProfile;
use std::fs;
use std::path::Path;

/// Read a profile from YAML or JSON, chosen by extension (YAML otherwise).
pub fn load_profile_file(path: impl AsRef<Path>) -> anyhow::Result<BridgeProfile> {
    let path = path.as_ref();
    let raw =
        fs::read_to_string(path).with_context(|| format!("reading profile: {}", path.display()))?;
    let profile: BridgeProfile = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(&raw)
            .with_context(|| format!("parsing json: {}", path.display()))?,
        _ => serde_yaml::from_str(&raw)
            .with_context(|| format!("parsing yaml: {}", path.display()))?,
    };
    profile
        .validate()
        .with_context(|| format!("validating profile: {}", path.display()))?;
    Ok(profile)
}

/// Write a profile next to where it will be loaded from, in the format its extension names.
pub fn save_profile_file(path: impl AsRef<Path>, profile: &BridgeProfile) -> anyhow::Result<()> {
    let path = path.as_ref();
    let text = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::to_string_pretty(profile)?,
        _ => serde_yaml::to_string(profile)?,
    };
    fs::write(path, text).with_context(|| format!("writing profile: {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_engine::InputAction;

    const YAML: &str = r#"
name: overhead
sim:
  host: 192.168.1.20
devices:
  - port: /dev/ttyACM0
    baud_rate: 57600
mappings:
  - key: GEAR
    source: sim/cockpit/switches/gear_handle_status
inputs:
  - input_key: ENC1
    action: increment
    target: sim/cockpit/autopilot/heading_mag
    min: 0
    max: 360
    wrap: true
logic:
  - name: gear_unsafe
    logic_gate: xor
    conditions:
      - dataref: sim/gear/deploy
        operator: "=="
        value: 1
"#;

    #[test]
    fn yaml_profile_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("overhead.yaml");
        fs::write(&path, YAML).unwrap();
        let profile = load_profile_file(&path).unwrap();
        assert_eq!(profile.sim.host, "192.168.1.20");
        assert_eq!(profile.devices[0].baud_rate, Some(57_600));
        assert_eq!(profile.inputs[0].action, InputAction::Increment);
        assert!(profile.inputs[0].wrap);
        assert_eq!(profile.logic.len(), 1);
    }

    #[test]
    fn json_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = dir.path().join("p.yml");
        fs::write(&yaml, YAML).unwrap();
        let profile = load_profile_file(&yaml).unwrap();

        let json = dir.path().join("p.json");
        save_profile_file(&json, &profile).unwrap();
        let again = load_profile_file(&json).unwrap();
        assert_eq!(again.mappings, profile.mappings);
        assert_eq!(again.inputs, profile.inputs);
    }

    #[test]
    fn invalid_profiles_name_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.yaml");
        fs::write(&path, "mappings:\n  - key: A\n    source: x\n  - key: a\n    source: y\n").unwrap();
        let err = load_profile_file(&path).unwrap_err();
        assert!(format!("{err:#}").contains("bad.yaml"));
    }
}
