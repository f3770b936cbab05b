use serde::{Deserialize, Serialize};

///
/// Config
///
/// Flat runtime configuration. Loading this from a file is the caller's
/// concern; the runtime only consumes the deserialized form. `paths` is
/// carried for the external codegen tool and never read here.
///

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub aws: AwsSection,
    pub db: DbSection,
    #[serde(default)]
    pub tenancy: TenancySection,
    #[serde(default)]
    pub batch_context: BatchContextSection,
    #[serde(default)]
    pub paths: PathsSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl Config {
    /// Minimal configuration against one table, everything else default.
    #[must_use]
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            aws: AwsSection::default(),
            db: DbSection {
                table_name: table_name.into(),
            },
            tenancy: TenancySection::default(),
            batch_context: BatchContextSection::default(),
            paths: PathsSection::default(),
            logging: LoggingSection::default(),
        }
    }

    #[must_use]
    pub fn with_tenancy(mut self, enabled: bool) -> Self {
        self.tenancy.enabled = enabled;
        self
    }

    #[must_use]
    pub fn with_require_batch_context(mut self, required: bool) -> Self {
        self.batch_context.require_batch_context = required;
        self
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct AwsSection {
    #[serde(default)]
    pub region: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DbSection {
    pub table_name: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct TenancySection {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct BatchContextSection {
    #[serde(default)]
    pub require_batch_context: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct PathsSection {
    #[serde(default)]
    pub models_dir: Option<String>,
    #[serde(default)]
    pub models_definition_path: Option<String>,
    #[serde(default)]
    pub fields_dir: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_deserializes_with_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"db": {"table_name": "main"}}"#).unwrap();

        assert_eq!(config.db.table_name, "main");
        assert!(!config.tenancy.enabled);
        assert!(!config.batch_context.require_batch_context);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.aws.region, None);
    }

    #[test]
    fn full_config_round_trips() {
        let config = Config::new("main")
            .with_tenancy(true)
            .with_require_batch_context(true);

        let text = serde_json::to_string(&config).unwrap();
        let back: Config = serde_json::from_str(&text).unwrap();

        assert!(back.tenancy.enabled);
        assert!(back.batch_context.require_batch_context);
    }
}
