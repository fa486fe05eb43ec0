//! Process configuration, built once at startup and passed down explicitly.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use sdp_storage::{
    BackoffPolicy, Credentials, FeedEndpoint, HttpClientConfig, PaginationStyle, DEFAULT_PAGE_SIZE,
};
use sdp_transform::{Denylist, SummaryColumns};
use serde::Deserialize;

pub const DEFAULT_SETTINGS_FILE: &str = "pipeline.yaml";

/// Optional deployment tweaks read from YAML.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineSettings {
    pub site_column: Option<String>,
    pub enumerator_column: Option<String>,
    pub extra_denylist: Vec<String>,
}

impl PipelineSettings {
    pub fn from_yaml(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text).context("parsing pipeline settings yaml")
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn summary_columns(&self) -> SummaryColumns {
        let defaults = SummaryColumns::default();
        SummaryColumns {
            site: self.site_column.clone().unwrap_or(defaults.site),
            enumerator: self.enumerator_column.clone().unwrap_or(defaults.enumerator),
        }
    }

    pub fn denylist(&self) -> Denylist {
        Denylist::default().with_extra(&self.extra_denylist)
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub endpoint: FeedEndpoint,
    pub credentials: Credentials,
    pub data_dir: PathBuf,
    pub http_timeout_secs: u64,
    pub page_size: usize,
    pub max_age_hours: u64,
    pub max_retries: usize,
    pub pagination: PaginationStyle,
    pub scheduler_enabled: bool,
    pub refresh_cron: String,
    pub web_port: u16,
    pub settings: PipelineSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            endpoint: FeedEndpoint {
                base_url: "https://central.example.org".to_string(),
                project_id: "your-project-id".to_string(),
                form_id: "your-form-id".to_string(),
            },
            credentials: Credentials::new("your-username", "your-api-key"),
            data_dir: PathBuf::from("./data"),
            http_timeout_secs: 60,
            page_size: DEFAULT_PAGE_SIZE,
            max_age_hours: 24,
            max_retries: 0,
            pagination: PaginationStyle::OData,
            scheduler_enabled: false,
            refresh_cron: "0 0 */6 * * *".to_string(),
            web_port: 8000,
            settings: PipelineSettings::default(),
        }
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim(), "1" | "true" | "TRUE" | "True" | "yes")
}

fn parse_number<T: std::str::FromStr>(name: &str, value: Option<String>, default: T) -> Result<T> {
    match value {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("{name} must be a number, got {raw:?}")),
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset keys take their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let text = |key: &str, default: String| lookup(key).unwrap_or(default);

        let pagination = match lookup("SDP_PAGINATION") {
            None => defaults.pagination,
            Some(raw) => PaginationStyle::parse(&raw).with_context(|| {
                format!("SDP_PAGINATION must be `odata` or `limit-offset`, got {raw:?}")
            })?,
        };

        let page_size = parse_number("SDP_PAGE_SIZE", lookup("SDP_PAGE_SIZE"), defaults.page_size)?;
        if page_size == 0 {
            bail!("SDP_PAGE_SIZE must be at least 1");
        }

        let settings = match lookup("SDP_SETTINGS") {
            Some(path) => PipelineSettings::from_path(Path::new(&path))?,
            None if Path::new(DEFAULT_SETTINGS_FILE).is_file() => {
                PipelineSettings::from_path(Path::new(DEFAULT_SETTINGS_FILE))?
            }
            None => PipelineSettings::default(),
        };

        Ok(Self {
            endpoint: FeedEndpoint {
                base_url: text("SDP_API_BASE_URL", defaults.endpoint.base_url),
                project_id: text("SDP_PROJECT_ID", defaults.endpoint.project_id),
                form_id: text("SDP_FORM_ID", defaults.endpoint.form_id),
            },
            credentials: Credentials::new(
                text("SDP_API_USERNAME", defaults.credentials.username.clone()),
                text("SDP_API_KEY", defaults.credentials.api_key().to_string()),
            ),
            data_dir: lookup("SDP_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            http_timeout_secs: parse_number(
                "SDP_HTTP_TIMEOUT_SECS",
                lookup("SDP_HTTP_TIMEOUT_SECS"),
                defaults.http_timeout_secs,
            )?,
            page_size,
            max_age_hours: parse_number(
                "SDP_MAX_AGE_HOURS",
                lookup("SDP_MAX_AGE_HOURS"),
                defaults.max_age_hours,
            )?,
            max_retries: parse_number(
                "SDP_MAX_RETRIES",
                lookup("SDP_MAX_RETRIES"),
                defaults.max_retries,
            )?,
            pagination,
            scheduler_enabled: lookup("SDP_SCHEDULER_ENABLED")
                .map(|v| parse_flag(&v))
                .unwrap_or(defaults.scheduler_enabled),
            refresh_cron: text("SDP_REFRESH_CRON", defaults.refresh_cron),
            web_port: parse_number("SDP_WEB_PORT", lookup("SDP_WEB_PORT"), defaults.web_port)?,
            settings,
        })
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(format!("sdp/{}", env!("CARGO_PKG_VERSION"))),
            backoff: BackoffPolicy {
                max_retries: self.max_retries,
                ..BackoffPolicy::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = AppConfig::from_lookup(lookup(&[("SDP_SETTINGS", "/nonexistent/none.yaml")]));
        assert!(config.is_err());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.yaml");
        std::fs::write(&path, "{}\n").unwrap();
        let config =
            AppConfig::from_lookup(lookup(&[("SDP_SETTINGS", path.to_str().unwrap())])).unwrap();
        assert_eq!(config.page_size, 2000);
        assert_eq!(config.max_retries, 0);
        assert_eq!(config.max_age_hours, 24);
        assert_eq!(config.pagination, PaginationStyle::OData);
        assert_eq!(config.data_dir, PathBuf::from("./data"));
        assert!(!config.scheduler_enabled);
        assert_eq!(
            config.endpoint.submissions_url(),
            "https://central.example.org/v1/projects/your-project-id/forms/your-form-id.svc/Submissions"
        );
    }

    #[test]
    fn env_values_override_defaults() {
        let config = AppConfig::from_lookup(lookup(&[
            ("SDP_API_BASE_URL", "https://odk.example.net/"),
            ("SDP_PROJECT_ID", "7"),
            ("SDP_FORM_ID", "tree_survey"),
            ("SDP_API_USERNAME", "enumerator-bot"),
            ("SDP_API_KEY", "s3cret-key"),
            ("SDP_PAGE_SIZE", "500"),
            ("SDP_MAX_RETRIES", "3"),
            ("SDP_PAGINATION", "limit-offset"),
            ("SDP_SCHEDULER_ENABLED", "true"),
            ("SDP_WEB_PORT", "9100"),
            ("SDP_SETTINGS", "/dev/null"),
        ]))
        .unwrap();
        assert_eq!(config.page_size, 500);
        assert_eq!(config.pagination, PaginationStyle::LimitOffset);
        assert!(config.scheduler_enabled);
        assert_eq!(config.web_port, 9100);
        assert_eq!(config.http_client_config().backoff.max_retries, 3);
        assert_eq!(
            config.endpoint.submissions_url(),
            "https://odk.example.net/v1/projects/7/forms/tree_survey.svc/Submissions"
        );
        assert!(!format!("{config:?}").contains("s3cret-key"));
    }

    #[test]
    fn bad_numbers_and_styles_are_rejected() {
        assert!(AppConfig::from_lookup(lookup(&[
            ("SDP_SETTINGS", "/dev/null"),
            ("SDP_PAGE_SIZE", "lots"),
        ]))
        .is_err());
        assert!(AppConfig::from_lookup(lookup(&[
            ("SDP_SETTINGS", "/dev/null"),
            ("SDP_PAGE_SIZE", "0"),
        ]))
        .is_err());
        assert!(AppConfig::from_lookup(lookup(&[
            ("SDP_SETTINGS", "/dev/null"),
            ("SDP_PAGINATION", "cursor"),
        ]))
        .is_err());
    }

    #[test]
    fn yaml_settings_customize_columns_and_denylist() {
        let settings = PipelineSettings::from_yaml(
            "site_column: grp_location/kebele\nextra_denylist:\n  - gps\n  - household_head\n",
        )
        .unwrap();
        let columns = settings.summary_columns();
        assert_eq!(columns.site, "grp_location/kebele");
        assert_eq!(columns.enumerator, "enumerator");
        let denylist = settings.denylist();
        assert!(denylist.is_denied("grp/GPS"));
        assert!(denylist.is_denied("respondent_name"));
        assert!(!denylist.is_denied("site"));
    }

    #[test]
    fn unknown_settings_keys_fail() {
        assert!(PipelineSettings::from_yaml("site_colum: typo\n").is_err());
    }
}
