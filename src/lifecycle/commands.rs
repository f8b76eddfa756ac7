//! Rendering of configured SCPI command templates.

use crate::calibration::CalibrationMetadata;
use crate::config::CommandConfig;
use crate::error::{VnaError, VnaResult};
use std::collections::HashMap;
use strfmt::strfmt;

/// Render the sweep-setup templates for `calibration`.
///
/// Available placeholders: `{start_hz}`, `{stop_hz}`, `{num_points}`.
pub fn render_sweep_setup(
    commands: &CommandConfig,
    calibration: &CalibrationMetadata,
) -> VnaResult<Vec<String>> {
    let vars: HashMap<String, String> = HashMap::from([
        (
            "start_hz".to_string(),
            calibration.start_frequency_hz.to_string(),
        ),
        (
            "stop_hz".to_string(),
            calibration.stop_frequency_hz.to_string(),
        ),
        ("num_points".to_string(), calibration.num_points.to_string()),
    ]);

    commands
        .sweep_setup
        .iter()
        .map(|template| {
            strfmt(template, &vars).map_err(|e| {
                VnaError::Configuration(format!("Bad command template '{}': {}", template, e))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_default_templates() {
        let commands = CommandConfig::default();
        let cal = CalibrationMetadata::new(100_000, 6_000_000_000, 401);

        let rendered = render_sweep_setup(&commands, &cal).unwrap();
        assert_eq!(
            rendered,
            vec![
                "SENS:FREQ:STAR 100000",
                "SENS:FREQ:STOP 6000000000",
                "SENS:SWE:POIN 401",
            ]
        );
    }

    #[test]
    fn unknown_placeholder_is_a_configuration_error() {
        let commands = CommandConfig {
            sweep_setup: vec!["SENS:BAND {ifbw}".into()],
            ..CommandConfig::default()
        };
        let cal = CalibrationMetadata::new(1, 2, 2);
        assert!(matches!(
            render_sweep_setup(&commands, &cal),
            Err(VnaError::Configuration(_))
        ));
    }
}
