use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::health::ConditionThresholds;
use crate::images::ImageVector;
use crate::resources::shoots::PURPOSE_TESTING;
use crate::telemetry::LogFormat;
use crate::{Error, Result};

/// Process configuration, from flags or the environment
#[derive(Clone, Debug, clap::Parser)]
#[command(name = "gardenlet", version, about)]
pub struct Config {
    /// Name of the Seed this gardenlet is responsible for
    #[arg(long, env = "SEED_NAME")]
    pub seed_name: String,

    /// Namespace holding the seed's own system components
    #[arg(long, env = "GARDEN_NAMESPACE", default_value = "garden")]
    pub garden_namespace: String,

    /// How often healthy objects are reconciled again, e.g. `1m` or `30s`
    #[arg(long, env = "SYNC_PERIOD", default_value = "1m", value_parser = parse_duration)]
    pub sync_period: Duration,

    /// How often the seed care checks run
    #[arg(long, env = "CARE_SYNC_PERIOD", default_value = "30s", value_parser = parse_duration)]
    pub care_sync_period: Duration,

    #[arg(long, env = "LOGGING_ENABLED", default_value_t = true, action = clap::ArgAction::Set)]
    pub logging_enabled: bool,

    #[arg(long, env = "VALI_ENABLED", default_value_t = true, action = clap::ArgAction::Set)]
    pub vali_enabled: bool,

    /// Shoot purposes for which node logs are shipped to the control plane Vali
    #[arg(long, env = "SHOOT_NODE_LOGGING_PURPOSES", value_delimiter = ',')]
    pub shoot_node_logging_purposes: Vec<String>,

    /// Size of the garden Vali volume
    #[arg(long, env = "GARDEN_VALI_STORAGE", default_value = "100Gi", value_parser = parse_quantity)]
    pub garden_vali_storage: Quantity,

    /// Per condition type, how long a failing check may report `Progressing`, e.g.
    /// `SeedSystemComponentsHealthy=1m`
    #[arg(long = "condition-threshold", env = "CONDITION_THRESHOLDS", value_delimiter = ',', value_parser = parse_threshold)]
    pub condition_thresholds: Vec<(String, Duration)>,

    /// YAML file with images overriding the built-in image vector
    #[arg(long, env = "IMAGEVECTOR_OVERWRITE")]
    pub image_vector: Option<PathBuf>,

    /// Whether ingress gateways accept the proxy protocol for SNI passthrough
    #[arg(long, env = "SNI_ENABLED", default_value_t = false, action = clap::ArgAction::Set)]
    pub sni_enabled: bool,

    /// The seed also hosts the garden; istiod is then managed by the garden
    #[arg(long, env = "SEED_IS_GARDEN", default_value_t = false, action = clap::ArgAction::Set)]
    pub seed_is_garden: bool,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Compact)]
    pub log_format: LogFormat,
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration".into());
    }
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| format!("missing unit in duration {s:?}"))?;
    let (value, unit) = s.split_at(split);
    if value.is_empty() {
        return Err(format!("missing value in duration {s:?}"));
    }
    let value: u64 = value
        .parse()
        .map_err(|_| format!("invalid duration {s:?}"))?;
    let factor = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        _ => return Err(format!("unknown unit {unit:?} in duration {s:?}")),
    };
    let secs = value
        .checked_mul(factor)
        .ok_or_else(|| format!("duration {s:?} is out of range"))?;
    Ok(Duration::from_secs(secs))
}

fn parse_quantity(s: &str) -> Result<Quantity, String> {
    use crate::utils::quantity::QuantityExt;
    let quantity = Quantity(s.trim().into());
    quantity.to_bytes().map_err(|e| e.to_string())?;
    Ok(quantity)
}

fn parse_threshold(s: &str) -> Result<(String, Duration), String> {
    let (r#type, duration) = s
        .split_once('=')
        .ok_or_else(|| format!("expected <ConditionType>=<duration>, got {s:?}"))?;
    Ok((r#type.trim().to_string(), parse_duration(duration)?))
}

impl Config {
    pub fn condition_thresholds(&self) -> ConditionThresholds {
        self.condition_thresholds.iter().cloned().collect()
    }

    pub fn load_image_vector(&self) -> Result<ImageVector> {
        let builtin = ImageVector::builtin()?;
        match &self.image_vector {
            Some(path) => Ok(builtin.overwritten_by(ImageVector::from_file(path)?)),
            None => Ok(builtin),
        }
    }

    /// Control plane logging is off for testing shoots and when logging is disabled
    pub fn shoot_control_plane_logging_enabled(&self, purpose: &str) -> bool {
        self.logging_enabled && purpose != PURPOSE_TESTING
    }

    pub fn shoot_node_logging_enabled(&self, purpose: &str) -> bool {
        self.shoot_control_plane_logging_enabled(purpose)
            && self.vali_enabled
            && self.shoot_node_logging_purposes.iter().any(|p| p == purpose)
    }

    pub fn validate(&self) -> Result<()> {
        if self.seed_name.is_empty() {
            return Err(Error::InvalidConfig("seed name must not be empty".into()));
        }
        Ok(())
    }
}

impl FromStr for Config {
    type Err = Error;

    /// Parses a whitespace separated argument line, mostly useful in tests
    fn from_str(args: &str) -> Result<Self> {
        use clap::Parser;
        Config::try_parse_from(std::iter::once("gardenlet").chain(args.split_whitespace()))
            .map_err(|e| Error::InvalidConfig(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config: Config = "--seed-name local".parse().unwrap();
        assert_eq!(config.garden_namespace, "garden");
        assert_eq!(config.sync_period, Duration::from_secs(60));
        assert!(config.logging_enabled);
        assert!(config.vali_enabled);
        assert_eq!(config.garden_vali_storage, Quantity("100Gi".into()));
        assert!(config.condition_thresholds().is_empty());
    }

    #[test]
    fn thresholds_and_purposes() {
        let config: Config = "--seed-name local \
            --condition-threshold SeedSystemComponentsHealthy=1m,Other=30s \
            --shoot-node-logging-purposes development,evaluation"
            .parse()
            .unwrap();
        let thresholds = config.condition_thresholds();
        assert_eq!(
            thresholds["SeedSystemComponentsHealthy"],
            Duration::from_secs(60)
        );
        assert_eq!(thresholds["Other"], Duration::from_secs(30));
        assert!(config.shoot_node_logging_enabled("development"));
        assert!(!config.shoot_node_logging_enabled("production"));
    }

    #[test]
    fn logging_is_disabled_for_testing_shoots() {
        let config: Config = "--seed-name local --shoot-node-logging-purposes testing"
            .parse()
            .unwrap();
        assert!(config.shoot_control_plane_logging_enabled("evaluation"));
        assert!(!config.shoot_control_plane_logging_enabled("testing"));
        assert!(!config.shoot_node_logging_enabled("testing"));

        let config: Config = "--seed-name local --logging-enabled false".parse().unwrap();
        assert!(!config.shoot_control_plane_logging_enabled("evaluation"));
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!("--seed-name local --sync-period 5x".parse::<Config>().is_err());
        assert!("--seed-name local --garden-vali-storage lots"
            .parse::<Config>()
            .is_err());
        assert!("--seed-name local --condition-threshold nope"
            .parse::<Config>()
            .is_err());
    }

    #[test]
    fn durations_need_value_and_unit() {
        assert_eq!(parse_duration("90s"), Ok(Duration::from_secs(90)));
        assert_eq!(parse_duration(" 2h "), Ok(Duration::from_secs(7200)));
        assert_eq!(parse_duration("30"), Err("missing unit in duration \"30\"".into()));
        assert_eq!(parse_duration(""), Err("empty duration".into()));
        assert_eq!(parse_duration("m"), Err("missing value in duration \"m\"".into()));
        assert!(parse_duration("1.5m").is_err());
        assert!("--seed-name local --care-sync-period 30".parse::<Config>().is_err());
    }

    #[test]
    fn overflowing_durations_are_rejected() {
        let max = u64::MAX;
        assert_eq!(parse_duration(&format!("{max}s")), Ok(Duration::from_secs(max)));
        assert_eq!(
            parse_duration(&format!("{max}m")),
            Err(format!("duration \"{max}m\" is out of range"))
        );
        assert!(parse_duration(&format!("{}h", max / 60)).is_err());
        assert!(parse_duration("99999999999999999999999s").is_err());
    }
}
