// src/model/site.rs

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::model::Descriptor;
use crate::validation::{self, ValidationError};

static PHP_VERSION: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9]\.[0-9]$").unwrap());
static PYTHON_VERSION: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9]\.[0-9]{1,2}$").unwrap());
static NODE_VERSION: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9]{1,2}$").unwrap());

/// Language runtime serving a site
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Runtime {
    /// `php-X.Y`
    Php(String),

    /// `nodejs-N`
    NodeJs(u32),

    /// `python-X.Y`
    Python(String),

    /// `static`
    Static,
}

impl Runtime {
    /// PHP version when this is a PHP runtime
    pub fn php_version(&self) -> Option<&str> {
        match self {
            Runtime::Php(version) => Some(version.as_str()),
            _ => None,
        }
    }

    pub fn is_php(&self) -> bool {
        matches!(self, Runtime::Php(_))
    }
}

impl fmt::Display for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Runtime::Php(version) => write!(f, "php-{}", version),
            Runtime::NodeJs(version) => write!(f, "nodejs-{}", version),
            Runtime::Python(version) => write!(f, "python-{}", version),
            Runtime::Static => f.write_str("static"),
        }
    }
}

impl FromStr for Runtime {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "static" {
            return Ok(Runtime::Static);
        }
        if let Some(version) = s.strip_prefix("php-") {
            if PHP_VERSION.is_match(version) {
                return Ok(Runtime::Php(version.to_string()));
            }
        } else if let Some(version) = s.strip_prefix("nodejs-") {
            if NODE_VERSION.is_match(version) {
                if let Ok(major) = version.parse() {
                    return Ok(Runtime::NodeJs(major));
                }
            }
        } else if let Some(version) = s.strip_prefix("python-") {
            if PYTHON_VERSION.is_match(version) {
                return Ok(Runtime::Python(version.to_string()));
            }
        }
        Err(format!("unsupported runtime '{}'", s))
    }
}

impl Serialize for Runtime {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Runtime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// PHP-FPM tuning values
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhpSettings {
    pub max_execution_time: u32,
    pub memory_limit: String,
    pub post_max_size: String,
    pub upload_max_filesize: String,
    pub max_input_vars: u32,
    pub display_errors: bool,
}

impl Default for PhpSettings {
    fn default() -> Self {
        Self {
            max_execution_time: 300,
            memory_limit: "256M".to_string(),
            post_max_size: "64M".to_string(),
            upload_max_filesize: "64M".to_string(),
            max_input_vars: 5000,
            display_errors: false,
        }
    }
}

/// Node.js application settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    pub port: u16,
    pub startup_file: String,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            port: 3000,
            startup_file: "app.js".to_string(),
        }
    }
}

/// Python (WSGI/ASGI) application settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PythonSettings {
    pub port: u16,
    pub app_module: String,
}

impl Default for PythonSettings {
    fn default() -> Self {
        Self {
            port: 8000,
            app_module: "app:application".to_string(),
        }
    }
}

/// Runtime-specific settings block, tagged by runtime family
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RuntimeSettings {
    Php(PhpSettings),
    Node(NodeSettings),
    Python(PythonSettings),
}

impl RuntimeSettings {
    /// Whether this block belongs to the given runtime
    pub fn matches(&self, runtime: &Runtime) -> bool {
        matches!(
            (self, runtime),
            (RuntimeSettings::Php(_), Runtime::Php(_))
                | (RuntimeSettings::Node(_), Runtime::NodeJs(_))
                | (RuntimeSettings::Python(_), Runtime::Python(_))
        )
    }
}

/// HTTP redirect rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Redirect {
    pub source: String,
    pub target: String,
    #[serde(default = "default_redirect_code")]
    pub code: u16,
    #[serde(default)]
    pub regex: bool,
    #[serde(default)]
    pub wildcard: bool,
}

fn default_redirect_code() -> u16 {
    301
}

fn default_document_root() -> String {
    "public_html".to_string()
}

/// Site descriptor (`web/<domain>/site.json`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Site {
    pub domain: String,
    pub runtime: Runtime,
    #[serde(default)]
    pub ssl: bool,
    #[serde(default)]
    pub ssl_redirect: bool,
    #[serde(default = "default_document_root")]
    pub document_root: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub redirects: Vec<Redirect>,
    #[serde(default)]
    pub error_pages: BTreeMap<u16, String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<RuntimeSettings>,
}

impl Site {
    /// Minimal site with defaults for everything but domain and runtime
    pub fn new(domain: impl Into<String>, runtime: Runtime) -> Self {
        Self {
            domain: domain.into(),
            runtime,
            ssl: false,
            ssl_redirect: false,
            document_root: default_document_root(),
            aliases: Vec::new(),
            redirects: Vec::new(),
            error_pages: BTreeMap::new(),
            headers: BTreeMap::new(),
            settings: None,
        }
    }

    /// PHP settings, falling back to defaults when the block is absent
    pub fn php_settings(&self) -> PhpSettings {
        match &self.settings {
            Some(RuntimeSettings::Php(settings)) => settings.clone(),
            _ => PhpSettings::default(),
        }
    }

    pub fn node_settings(&self) -> NodeSettings {
        match &self.settings {
            Some(RuntimeSettings::Node(settings)) => settings.clone(),
            _ => NodeSettings::default(),
        }
    }

    pub fn python_settings(&self) -> PythonSettings {
        match &self.settings {
            Some(RuntimeSettings::Python(settings)) => settings.clone(),
            _ => PythonSettings::default(),
        }
    }
}

impl Descriptor for Site {
    const KIND: &'static str = "site";

    fn validate(&self) -> Result<(), ValidationError> {
        validation::validate_site(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_parses_and_prints() {
        for raw in ["php-8.2", "nodejs-20", "python-3.11", "static"] {
            let runtime: Runtime = raw.parse().unwrap();
            assert_eq!(runtime.to_string(), raw);
        }
        assert!("php-8".parse::<Runtime>().is_err());
        assert!("ruby-3.2".parse::<Runtime>().is_err());
    }

    #[test]
    fn site_json_uses_runtime_string_and_tagged_settings() {
        let mut site = Site::new("acme.test", Runtime::Php("8.2".to_string()));
        site.settings = Some(RuntimeSettings::Php(PhpSettings::default()));
        let json = serde_json::to_value(&site).unwrap();
        assert_eq!(json["runtime"], "php-8.2");
        assert_eq!(json["settings"]["kind"], "php");
        let back: Site = serde_json::from_value(json).unwrap();
        assert_eq!(back, site);
    }

    #[test]
    fn absent_settings_yield_defaults() {
        let site = Site::new("acme.test", Runtime::NodeJs(20));
        assert_eq!(site.node_settings().port, 3000);
        assert_eq!(site.php_settings().memory_limit, "256M");
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let site: Site = serde_json::from_str(
            r#"{"domain":"acme.test","runtime":"static","legacy_flag":true}"#,
        )
        .unwrap();
        assert_eq!(site.document_root, "public_html");
    }
}
