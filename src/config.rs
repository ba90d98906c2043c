//! Configuration: YAML file over defaults, CLI overrides on top.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::events::Hierarchy;
use crate::line::SimSettings;
use crate::microstops;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read { path: String, source: std::io::Error },
    #[error("failed to parse config file {path}: {source}")]
    Parse { path: String, source: serde_yaml::Error },
    #[error("speed_factor must be > 0, got {0}")]
    BadSpeedFactor(f64),
    #[error("tick_interval_ms must be > 0")]
    BadTickInterval,
    #[error("unknown microstop code in microstop.rates: {0}")]
    UnknownMicrostopCode(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub simulator: SimulatorCfg,
    pub modbus: ModbusCfg,
    pub enterprise: EnterpriseCfg,
    pub production: ProductionCfg,
    pub microstop: MicrostopCfg,
    pub breakdowns: BreakdownsCfg,
    pub logging: LoggingCfg,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimulatorCfg {
    pub instance_id: String,
    pub speed_factor: f64,
    pub tick_interval_ms: u64,
    /// Fixed seed keeps replays reproducible; omit for the default.
    pub rng_seed: Option<u64>,
}

impl Default for SimulatorCfg {
    fn default() -> Self {
        Self {
            instance_id: "sim01".to_string(),
            speed_factor: 60.0,
            tick_interval_ms: 100,
            rng_seed: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModbusCfg {
    pub host: String,
    pub port: u16,
    pub unit_id: u8,
    pub request_timeout_s: u64,
}

impl Default for ModbusCfg {
    fn default() -> Self {
        Self { host: "0.0.0.0".to_string(), port: 502, unit_id: 1, request_timeout_s: 30 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EnterpriseCfg {
    pub name: String,
    pub site: String,
    pub area: String,
    pub line: String,
}

impl Default for EnterpriseCfg {
    fn default() -> Self {
        Self {
            name: "Aerogen".to_string(),
            site: "Shannon".to_string(),
            area: "Bottling".to_string(),
            line: "Line01".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProductionCfg {
    pub base_reject_probability: f64,
    pub label_stock_initial_pct: f64,
    pub label_stock_depletion_per_1000: f64,
    /// Share of GOOD bottles that emit a BottleCompleted record.
    pub good_bottle_sample_rate: f64,
}

impl Default for ProductionCfg {
    fn default() -> Self {
        Self {
            base_reject_probability: 0.005,
            label_stock_initial_pct: 95.0,
            label_stock_depletion_per_1000: 3.0,
            good_bottle_sample_rate: 0.02,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MicrostopCfg {
    pub mean_interval_s: f64,
    /// Per-code selection weight overrides, e.g. `MS02: 25.0`.
    pub rates: BTreeMap<String, f64>,
}

impl Default for MicrostopCfg {
    fn default() -> Self {
        Self { mean_interval_s: 480.0, rates: BTreeMap::new() }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BreakdownsCfg {
    /// Honour breakdown injections planned in the schedule.
    pub planned: bool,
    pub minor_mean_interval_s: f64,
    pub starved_mean_interval_s: f64,
    pub blocked_mean_interval_s: f64,
}

impl Default for BreakdownsCfg {
    fn default() -> Self {
        Self {
            planned: true,
            minor_mean_interval_s: 7_200.0,
            starved_mean_interval_s: 14_400.0,
            blocked_mean_interval_s: 14_400.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingCfg {
    pub level: String,
    pub transactions_file: String,
    pub console: bool,
}

impl Default for LoggingCfg {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            transactions_file: "logs/transactions.jsonl".to_string(),
            console: true,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            simulator: SimulatorCfg::default(),
            modbus: ModbusCfg::default(),
            enterprise: EnterpriseCfg::default(),
            production: ProductionCfg::default(),
            microstop: MicrostopCfg::default(),
            breakdowns: BreakdownsCfg::default(),
            logging: LoggingCfg::default(),
        }
    }
}

impl Config {
    /// Load from a YAML file. A missing file at the default path falls back
    /// to defaults; an explicitly requested path must exist.
    pub fn load(path: &Path, explicit: bool) -> Result<Self, ConfigError> {
        if !path.exists() {
            if explicit {
                return Err(ConfigError::Read {
                    path: path.display().to_string(),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
                });
            }
            let cfg = Self::default();
            cfg.validate()?;
            return Ok(cfg);
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.display().to_string(), source })?;
        let cfg: Config = serde_yaml::from_str(&raw)
            .map_err(|source| ConfigError::Parse { path: path.display().to_string(), source })?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.simulator.speed_factor > 0.0) {
            return Err(ConfigError::BadSpeedFactor(self.simulator.speed_factor));
        }
        if self.simulator.tick_interval_ms == 0 {
            return Err(ConfigError::BadTickInterval);
        }
        for code in self.microstop.rates.keys() {
            if !microstops::MICROSTOPS.iter().any(|m| m.code.as_str() == code) {
                return Err(ConfigError::UnknownMicrostopCode(code.clone()));
            }
        }
        Ok(())
    }

    pub fn hierarchy(&self) -> Hierarchy {
        Hierarchy {
            enterprise: self.enterprise.name.clone(),
            site: self.enterprise.site.clone(),
            area: self.enterprise.area.clone(),
            line: self.enterprise.line.clone(),
            actor_id: self.simulator.instance_id.clone(),
        }
    }

    pub fn sim_settings(&self) -> SimSettings {
        let mut weights = microstops::default_weights();
        for (slot, ms) in weights.iter_mut().zip(microstops::MICROSTOPS) {
            if let Some(w) = self.microstop.rates.get(ms.code.as_str()) {
                *slot = *w;
            }
        }
        SimSettings {
            tick_interval: Duration::from_millis(self.simulator.tick_interval_ms),
            speed_factor: self.simulator.speed_factor,
            microstop_mean_interval_s: self.microstop.mean_interval_s,
            microstop_weights: weights,
            minor_stop_mean_interval_s: self.breakdowns.minor_mean_interval_s,
            starved_mean_interval_s: self.breakdowns.starved_mean_interval_s,
            blocked_mean_interval_s: self.breakdowns.blocked_mean_interval_s,
            planned_breakdowns: self.breakdowns.planned,
            base_reject_probability: self.production.base_reject_probability,
            label_stock_initial_pct: self.production.label_stock_initial_pct,
            label_stock_depletion_per_1000: self.production.label_stock_depletion_per_1000,
            good_bottle_sample_rate: self.production.good_bottle_sample_rate,
            rng_seed: self.simulator.rng_seed.unwrap_or(0x1234_5678_9ABC_DEF0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = Config::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.modbus.port, 502);
        assert_eq!(cfg.simulator.tick_interval_ms, 100);
        assert_eq!(cfg.logging.transactions_file, "logs/transactions.jsonl");
    }

    #[test]
    fn yaml_overrides_merge_over_defaults() {
        let yaml = r#"
simulator:
  speed_factor: 600.0
  rng_seed: 42
modbus:
  port: 5020
microstop:
  mean_interval_s: 120.0
  rates:
    MS02: 30.0
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.simulator.speed_factor, 600.0);
        assert_eq!(cfg.modbus.port, 5020);
        // Untouched sections keep defaults.
        assert_eq!(cfg.enterprise.line, "Line01");

        let settings = cfg.sim_settings();
        assert_eq!(settings.rng_seed, 42);
        assert_eq!(settings.microstop_weights[1], 30.0);
        assert_eq!(settings.microstop_weights[0], 12.0);
    }

    #[test]
    fn bad_speed_factor_is_rejected() {
        let mut cfg = Config::default();
        cfg.simulator.speed_factor = 0.0;
        assert!(matches!(cfg.validate(), Err(ConfigError::BadSpeedFactor(_))));
        cfg.simulator.speed_factor = -3.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn unknown_microstop_rate_is_rejected() {
        let mut cfg = Config::default();
        cfg.microstop.rates.insert("MS99".to_string(), 5.0);
        assert!(matches!(cfg.validate(), Err(ConfigError::UnknownMicrostopCode(_))));
    }

    #[test]
    fn explicit_missing_path_is_fatal() {
        let err = Config::load(Path::new("/nonexistent/linesim.yaml"), true);
        assert!(matches!(err, Err(ConfigError::Read { .. })));

        let fallback = Config::load(Path::new("/nonexistent/linesim.yaml"), false).unwrap();
        assert_eq!(fallback.modbus.port, 502);
    }
}
