use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use serde_json as json;

use crate::flow::step::Flow;
use crate::identity::IdentityConfig;

pub const CONFIG_FILE: &str = ".ux-test.json";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid JSON in {path}: {source}")]
    Parse {
        path: PathBuf,
        source: json::Error,
    },
    #[error("{path}: {message}")]
    Invalid { path: PathBuf, message: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
pub enum Framework {
    #[serde(rename = "vite")]
    Vite,
    #[serde(rename = "nextjs")]
    NextJs,
    #[serde(rename = "browser-sync")]
    BrowserSync,
    #[serde(rename = "static")]
    Static,
}

impl Framework {
    /// Output fragments a dev server of this kind prints once it serves.
    pub fn readiness_markers(framework: Option<Framework>) -> &'static [&'static str] {
        match framework {
            None | Some(Framework::Vite) => &["Local:", "VITE", "ready in"],
            Some(Framework::NextJs) => {
                &["Ready in", "✓ Ready", "started server"]
            }
            Some(Framework::BrowserSync) => &["Serving files from", "Local:"],
            Some(Framework::Static) => &[],
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct A11yRules {
    #[serde(default)]
    pub disable: Vec<String>,
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Timeouts {
    pub navigation: u64,
    pub network_idle: u64,
    pub settle: u64,
    pub breakpoint_settle: u64,
    pub selector: u64,
    pub server_startup: u64,
    pub server_poll: u64,
    pub probe: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            navigation: 15_000,
            network_idle: 5_000,
            settle: 500,
            breakpoint_settle: 300,
            selector: 10_000,
            server_startup: 30_000,
            server_poll: 500,
            probe: 2_000,
        }
    }
}

impl Timeouts {
    pub fn navigation(&self) -> Duration {
        Duration::from_millis(self.navigation)
    }

    pub fn network_idle(&self) -> Duration {
        Duration::from_millis(self.network_idle)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle)
    }

    pub fn breakpoint_settle(&self) -> Duration {
        Duration::from_millis(self.breakpoint_settle)
    }

    pub fn selector(&self) -> Duration {
        Duration::from_millis(self.selector)
    }

    pub fn server_startup(&self) -> Duration {
        Duration::from_millis(self.server_startup)
    }

    pub fn server_poll(&self) -> Duration {
        Duration::from_millis(self.server_poll)
    }

    pub fn probe(&self) -> Duration {
        Duration::from_millis(self.probe)
    }
}

fn default_breakpoints() -> Vec<u32> {
    vec![375, 768, 1024, 1440]
}

fn default_threshold() -> f64 {
    0.1
}

fn default_true() -> bool {
    true
}

fn default_viewport_height() -> u32 {
    720
}

/// Settings for one project, read from its `.ux-test.json`.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectConfig {
    #[serde(skip)]
    pub dir: PathBuf,
    pub port: u16,
    #[serde(default)]
    pub routes: Option<Vec<String>>,
    #[serde(default)]
    pub skip_routes: Vec<String>,
    #[serde(default)]
    pub flows: Vec<Flow>,
    #[serde(default)]
    pub start_command: Option<String>,
    #[serde(default, rename = "type")]
    pub framework: Option<Framework>,
    #[serde(default = "default_breakpoints")]
    pub breakpoints: Vec<u32>,
    #[serde(default = "default_threshold")]
    pub visual_threshold: f64,
    #[serde(default = "default_true")]
    pub visual: bool,
    #[serde(default = "default_true")]
    pub a11y: bool,
    #[serde(default)]
    pub a11y_rules: Option<A11yRules>,
    #[serde(default, alias = "supabase")]
    pub identity: Option<IdentityConfig>,
    #[serde(default)]
    pub axe_script: Option<PathBuf>,
    #[serde(default = "default_viewport_height")]
    pub viewport_height: u32,
    #[serde(default)]
    pub timeouts: Timeouts,
}

impl ProjectConfig {
    pub fn origin(&self) -> String {
        format!("http://localhost:{}", self.port)
    }

    pub fn name(&self) -> String {
        self.dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.dir.display().to_string())
    }

    pub fn parse(path: &Path, source: &str) -> Result<Self, ConfigError> {
        let raw: json::Value =
            json::from_str(source).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        validate_raw(path, &raw)?;
        let config: ProjectConfig =
            json::from_value(raw).map_err(|error| ConfigError::Invalid {
                path: path.to_path_buf(),
                message: error.to_string(),
            })?;
        Ok(config)
    }
}

fn invalid(path: &Path, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        path: path.to_path_buf(),
        message: message.into(),
    }
}

// Checks that need the raw JSON so the messages can name the key.
fn validate_raw(path: &Path, raw: &json::Value) -> Result<(), ConfigError> {
    let object = raw
        .as_object()
        .ok_or_else(|| invalid(path, "configuration must be a JSON object"))?;

    match object.get("port").and_then(json::Value::as_u64) {
        Some(port) if (1..=65535).contains(&port) => {}
        _ => {
            return Err(invalid(
                path,
                "\"port\" is required and must be a number between 1 and 65535",
            ));
        }
    }

    if let Some(breakpoints) = object.get("breakpoints") {
        let valid = breakpoints.as_array().is_some_and(|values| {
            values.iter().all(|value| {
                value
                    .as_u64()
                    .is_some_and(|width| width > 0 && width <= u32::MAX as u64)
            })
        });
        if !valid {
            return Err(invalid(
                path,
                "\"breakpoints\" must be an array of positive integers",
            ));
        }
    }

    if let Some(threshold) = object.get("visualThreshold") {
        let valid = threshold
            .as_f64()
            .is_some_and(|value| (0.0..=100.0).contains(&value));
        if !valid {
            return Err(invalid(
                path,
                "\"visualThreshold\" must be a number between 0 and 100 (percentage of allowed pixel diff)",
            ));
        }
    }

    for key in ["a11y", "visual"] {
        if let Some(value) = object.get(key) {
            if !value.is_boolean() {
                return Err(invalid(path, format!("\"{}\" must be a boolean", key)));
            }
        }
    }

    if let Some(rules) = object.get("a11yRules").filter(|v| !v.is_null()) {
        let rules = rules
            .as_object()
            .ok_or_else(|| invalid(path, "\"a11yRules\" must be an object"))?;
        let unknown: Vec<&str> = rules
            .keys()
            .map(String::as_str)
            .filter(|key| !["disable", "include", "exclude"].contains(key))
            .collect();
        if !unknown.is_empty() {
            return Err(invalid(
                path,
                format!("\"a11yRules\" has unknown keys: {}", unknown.join(", ")),
            ));
        }
        for (key, value) in rules {
            let valid = value
                .as_array()
                .is_some_and(|values| values.iter().all(json::Value::is_string));
            if !valid {
                return Err(invalid(
                    path,
                    format!("\"a11yRules.{}\" must be an array of strings", key),
                ));
            }
        }
    }

    Ok(())
}

/// Loads `<dir>/.ux-test.json`. A project without one yields `Ok(None)`.
pub fn load_config(dir: &Path) -> Result<Option<ProjectConfig>, ConfigError> {
    let path = dir.join(CONFIG_FILE);
    let source = match std::fs::read_to_string(&path) {
        Ok(source) => source,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            return Ok(None);
        }
        Err(source) => return Err(ConfigError::Read { path, source }),
    };
    let mut config = ProjectConfig::parse(&path, &source)?;
    config.dir = dir.to_path_buf();
    Ok(Some(config))
}

pub fn config_exists(dir: &Path) -> bool {
    dir.join(CONFIG_FILE).is_file()
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalConfig {
    #[serde(default)]
    pub scan_dirs: Vec<PathBuf>,
}

/// Reads `~/.ux-test.json`. Missing or malformed files count as absent.
pub fn load_global_config() -> Option<GlobalConfig> {
    let home = std::env::var_os("HOME")?;
    let path = Path::new(&home).join(CONFIG_FILE);
    let source = std::fs::read_to_string(&path).ok()?;
    match json::from_str(&source) {
        Ok(config) => Some(config),
        Err(error) => {
            log::warn!("ignoring {}: {}", path.display(), error);
            None
        }
    }
}

/// Matches a route against `skipRoutes` patterns: exact paths, `prefix/*`
/// and `*` wildcards.
pub fn should_skip_route(route: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|pattern| {
        if pattern.ends_with("/*") {
            return route.starts_with(&pattern[..pattern.len() - 1]);
        }
        if pattern.contains('*') {
            let source = pattern
                .split('*')
                .map(regex::escape)
                .collect::<Vec<_>>()
                .join(".*");
            return Regex::new(&format!("^{}$", source))
                .map(|regex| regex.is_match(route))
                .unwrap_or(false);
        }
        route == pattern
    })
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use tempfile::TempDir;

    use super::*;
    use crate::identity::StorageType;

    fn parse(source: &str) -> Result<ProjectConfig, ConfigError> {
        ProjectConfig::parse(Path::new("/app/.ux-test.json"), source)
    }

    #[test]
    fn test_defaults() {
        let config = parse(r#"{ "port": 5173 }"#).unwrap();
        assert_eq!(config.origin(), "http://localhost:5173");
        assert_eq!(config.breakpoints, vec![375, 768, 1024, 1440]);
        assert_eq!(config.visual_threshold, 0.1);
        assert!(config.visual);
        assert!(config.a11y);
        assert_eq!(config.routes, None);
        assert_eq!(config.viewport_height, 720);
        assert_eq!(config.timeouts, Timeouts::default());
        assert_eq!(config.timeouts.navigation(), Duration::from_secs(15));
    }

    #[test]
    fn test_full_config() {
        let config = parse(indoc! {r#"
            {
              "port": 3000,
              "type": "nextjs",
              "startCommand": "npm run dev",
              "routes": ["/", "/about"],
              "skipRoutes": ["/admin/*"],
              "breakpoints": [320, 1280],
              "visualThreshold": 2.5,
              "a11yRules": { "disable": ["color-contrast"] },
              "supabase": {
                "url": "http://localhost:54321",
                "serviceRoleKey": "service",
                "anonKey": "anon",
                "storageKey": "sb-auth",
                "storageType": "cookie"
              },
              "timeouts": { "navigation": 5000 },
              "flows": [
                { "name": "home", "steps": [{ "action": "goto", "url": "/" }] }
              ]
            }
        "#})
        .unwrap();
        assert_eq!(config.framework, Some(Framework::NextJs));
        assert_eq!(config.breakpoints, vec![320, 1280]);
        assert_eq!(
            config.a11y_rules.unwrap().disable,
            vec!["color-contrast".to_string()]
        );
        let identity = config.identity.unwrap();
        assert_eq!(identity.storage_type, StorageType::Cookie);
        assert_eq!(config.timeouts.navigation, 5000);
        assert_eq!(config.timeouts.selector, 10_000);
        assert_eq!(config.flows.len(), 1);
    }

    #[test]
    fn test_port_is_required() {
        let error = parse(r#"{ "routes": ["/"] }"#).unwrap_err();
        assert!(matches!(error, ConfigError::Invalid { .. }));
        assert!(error.to_string().contains("\"port\" is required"));
    }

    #[test]
    fn test_rejects_bad_breakpoints() {
        let error = parse(r#"{ "port": 1, "breakpoints": [375, 0] }"#).unwrap_err();
        assert!(error.to_string().contains("positive integers"));
        let error = parse(r#"{ "port": 1, "breakpoints": [1.5] }"#).unwrap_err();
        assert!(error.to_string().contains("positive integers"));
    }

    #[test]
    fn test_rejects_threshold_out_of_range() {
        let error = parse(r#"{ "port": 1, "visualThreshold": 101 }"#).unwrap_err();
        assert!(error.to_string().contains("\"visualThreshold\""));
    }

    #[test]
    fn test_rejects_unknown_a11y_rule_keys() {
        let error = parse(r#"{ "port": 1, "a11yRules": { "only": [] } }"#)
            .unwrap_err();
        assert_eq!(
            error.to_string(),
            "/app/.ux-test.json: \"a11yRules\" has unknown keys: only"
        );
        let error = parse(r#"{ "port": 1, "a11yRules": { "include": [1] } }"#)
            .unwrap_err();
        assert!(error.to_string().contains("\"a11yRules.include\""));
    }

    #[test]
    fn test_rejects_invalid_json() {
        let error = parse("{ port: 1 }").unwrap_err();
        assert!(matches!(error, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_missing_file_is_none() {
        let dir = TempDir::new().unwrap();
        assert!(load_config(dir.path()).unwrap().is_none());
        assert!(!config_exists(dir.path()));
    }

    #[test]
    fn test_load_sets_project_dir() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), r#"{ "port": 8080 }"#)
            .unwrap();
        let config = load_config(dir.path()).unwrap().unwrap();
        assert_eq!(config.dir, dir.path());
        assert_eq!(config.port, 8080);
    }

    #[test]
    fn test_readiness_markers() {
        assert_eq!(
            Framework::readiness_markers(None),
            &["Local:", "VITE", "ready in"]
        );
        assert!(Framework::readiness_markers(Some(Framework::Static)).is_empty());
    }

    #[test]
    fn test_should_skip_route() {
        let patterns = vec![
            "/admin/*".to_string(),
            "/exact".to_string(),
            "/blog-*-draft".to_string(),
        ];
        assert!(should_skip_route("/admin/users", &patterns));
        assert!(should_skip_route("/admin/", &patterns));
        assert!(!should_skip_route("/admin", &patterns));
        assert!(should_skip_route("/exact", &patterns));
        assert!(!should_skip_route("/exact/more", &patterns));
        assert!(should_skip_route("/blog-2024-draft", &patterns));
        assert!(!should_skip_route("/blog-2024", &patterns));
        assert!(!should_skip_route("/", &[]));
    }

    #[test]
    fn test_skip_pattern_escapes_regex_characters() {
        let patterns = vec!["/a.b*".to_string()];
        assert!(should_skip_route("/a.bc", &patterns));
        assert!(!should_skip_route("/axbc", &patterns));
    }
}
