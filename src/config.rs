use crate::dispatcher::DEFAULT_WORKERS;
use crate::error::ConfigError;
use crate::event::Event;
use crate::timing::{TimeFormats, TimePattern};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Dispatcher worker threads
    pub workers: usize,
    /// Formats for absolute times in schedule patterns
    pub time: TimeFormats,
    /// Agent configurations, keyed by agent name
    pub agents: BTreeMap<String, AgentConfig>,
    /// Schedules added at startup
    pub schedules: Vec<ScheduleConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub enabled: bool,
    /// Agent-specific settings, passed through untouched
    pub settings: toml::Table,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub id: String,
    pub when: TimePattern,
    pub event: Event,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            time: TimeFormats::default(),
            agents: BTreeMap::new(),
            schedules: Vec::new(),
        }
    }
}

impl Config {
    /// `~/.mastercontrol/config.toml`
    pub fn default_path() -> PathBuf {
        let home_dir = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        home_dir.join(".mastercontrol").join("config.toml")
    }

    /// Load configuration from `path` (or the default path).
    ///
    /// A missing file is not an error: the defaults are used.
    pub fn load(path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let config_path = path.unwrap_or_else(Self::default_path);
        if !config_path.exists() {
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(&config_path).map_err(|source| ConfigError::Read {
            path: config_path.display().to_string(),
            source,
        })?;
        Self::parse(&content).map_err(|source| ConfigError::Parse {
            path: config_path.display().to_string(),
            source,
        })
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Names of the enabled agents, sorted.
    pub fn enabled_agents(&self) -> Vec<&str> {
        self.agents
            .iter()
            .filter(|(_, agent)| agent.enabled)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;

    const SAMPLE: &str = r#"
workers = 4

[time]
date_format = "%d/%m/%Y"

[agents.console]
enabled = true
settings = { user = "operator" }

[agents.xmpp]
enabled = false

[[schedules]]
id = "Nightly heal"
when = { hourlist = [3], recurring = true }
event = { id = "openzwave", body = "healNetwork" }

[[schedules]]
id = "Porch light"
when = { monthnames = ["march", "april", "may"], hourlist = [20], minutelist = [30], recurring = true }

[schedules.event]
id = "openzwave"
body = "setValue"
data = { node = "RGB Light - Porch", name = "Level", value = 50 }
"#;

    #[test]
    fn test_parse_sample() {
        let config = Config::parse(SAMPLE).unwrap();
        assert_eq!(config.workers, 4);
        assert_eq!(config.time.date_format, "%d/%m/%Y");
        assert_eq!(config.time.time_format, "%H:%M");
        assert_eq!(config.enabled_agents(), ["console"]);
        assert_eq!(
            config.agents["console"].settings.get("user").and_then(|v| v.as_str()),
            Some("operator")
        );

        assert_eq!(config.schedules.len(), 2);
        let heal = &config.schedules[0];
        assert_eq!(heal.when.hourlist, Some(vec![3]));
        assert!(heal.when.recurring);
        assert_eq!(heal.event.kind(), EventKind::Message);
        assert_eq!(heal.event.body_str(), Some("healNetwork"));

        let porch = &config.schedules[1];
        assert_eq!(porch.event.data()["value"], 50);
    }

    #[test]
    fn test_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.workers, DEFAULT_WORKERS);
        assert!(config.enabled_agents().is_empty());
    }

    #[test]
    fn test_bad_event_kind_rejected() {
        let bad = r#"
[[schedules]]
id = "x"
when = { minutes = 1 }
event = { id = "y", kind = "broadcast" }
"#;
        assert!(Config::parse(bad).is_err());
    }
}
