use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;

use http::{HeaderName, HeaderValue};
use ipnetwork::IpNetwork;
use log::{debug, trace};
use once_cell::sync::Lazy;
use pingora::server::configuration::{Opt, ServerConf};
use pingora_error::{Error, ErrorType::*, OrErr, Result};
use regex::Regex;
use serde::{de, Deserialize, Deserializer, Serialize};
use serde_yaml::{Mapping, Value as YamlValue};
use validator::{Validate, ValidationError};

static ENDPOINT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(?:(?:\d{1,3}\.){3}\d{1,3}|\[[0-9a-f:]+\]|[a-z0-9.-]+):\d{1,5}$").unwrap()
});

#[derive(Default, Debug, Deserialize, Validate)]
pub struct Config {
    #[serde(default)]
    pub pingora: ServerConf,

    #[validate(length(min = 1))]
    #[validate(nested)]
    pub listeners: Vec<Listener>,

    #[validate(nested)]
    #[serde(default)]
    pub health_check: HealthCheck,
    #[serde(default)]
    pub round_robin: RoundRobin,
    /// Peers whose `X-Forwarded-For` / `X-Real-IP` headers are believed.
    /// Every other client is identified by its socket address.
    #[serde(default)]
    pub trusted_proxies: Vec<IpNetwork>,
    pub log: Option<Log>,
    pub status: Option<Status>,
    pub prometheus: Option<Prometheus>,

    #[validate(nested)]
    #[serde(default)]
    pub hosts: Vec<HostEntry>,
    #[validate(nested)]
    #[serde(default)]
    pub paths: Vec<PathEntry>,
}

// Config file load and validation
impl Config {
    pub fn load_from_yaml<P>(path: P) -> Result<Self>
    where
        P: AsRef<std::path::Path> + std::fmt::Display,
    {
        let conf_str = fs::read_to_string(&path).or_err_with(ReadError, || {
            format!("Unable to read conf file from {path}")
        })?;
        debug!("Conf file read from {path}");
        Self::from_yaml(&conf_str)
    }

    // config file load entry point
    pub fn load_yaml_with_opt_override(opt: &Opt) -> Result<Self> {
        if let Some(path) = &opt.conf {
            let mut conf = Self::load_from_yaml(path)?;
            conf.merge_with_opt(opt);
            Ok(conf)
        } else {
            Error::e_explain(ReadError, "No path specified")
        }
    }

    pub fn from_yaml(conf_str: &str) -> Result<Self> {
        trace!("Read conf file: {conf_str}");
        let conf: Config = serde_yaml::from_str(conf_str).or_err_with(ReadError, || {
            format!("Unable to parse yaml conf {conf_str}")
        })?;

        trace!("Loaded conf: {conf:?}");

        conf.validate()
            .or_err_with(FileReadError, || "Conf file valid failed")?;

        Ok(conf)
    }

    pub fn merge_with_opt(&mut self, opt: &Opt) {
        if opt.daemon {
            self.pingora.daemon = true;
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, Validate)]
pub struct Listener {
    pub address: SocketAddr,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Log {
    pub path: String,
    #[serde(default = "Log::default_level")]
    pub level: String,
}

impl Log {
    fn default_level() -> String {
        "info".to_string()
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct Status {
    pub address: SocketAddr,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Prometheus {
    pub address: SocketAddr,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct RoundRobin {
    /// File the round-robin cursor is persisted to. In-memory only when unset.
    pub state_file: Option<PathBuf>,
}

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthCheckMode {
    /// Check on a timer from a background service.
    #[default]
    Background,
    /// Check every backend before each routing decision.
    Request,
}

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckType {
    #[default]
    Tcp,
    Http,
}

#[derive(Clone, Debug, Deserialize, Validate)]
pub struct HealthCheck {
    #[serde(default)]
    pub mode: HealthCheckMode,
    #[serde(default)]
    pub r#type: CheckType,
    #[serde(default = "HealthCheck::default_interval")]
    #[validate(range(min = 1))]
    pub interval: u64,
    #[serde(default = "HealthCheck::default_timeout")]
    #[validate(range(min = 1))]
    pub timeout: u64,
    #[serde(default = "HealthCheck::default_http_path")]
    pub http_path: String,
    #[serde(default = "HealthCheck::default_http_statuses")]
    pub http_statuses: Vec<u16>,
    pub host: Option<String>,
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self {
            mode: HealthCheckMode::default(),
            r#type: CheckType::default(),
            interval: Self::default_interval(),
            timeout: Self::default_timeout(),
            http_path: Self::default_http_path(),
            http_statuses: Self::default_http_statuses(),
            host: None,
        }
    }
}

impl HealthCheck {
    fn default_interval() -> u64 {
        1
    }

    fn default_timeout() -> u64 {
        1
    }

    fn default_http_path() -> String {
        "/healthcheck".to_string()
    }

    fn default_http_statuses() -> Vec<u16> {
        vec![200]
    }
}

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    #[default]
    Random,
    Least,
    Weight,
    Round,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Random => "random",
            Algorithm::Least => "least",
            Algorithm::Weight => "weight",
            Algorithm::Round => "round",
        }
    }
}

#[derive(Clone, Debug, Deserialize, Validate)]
pub struct HostEntry {
    pub host: String,
    #[validate(length(min = 1), custom(function = "validate_servers"))]
    pub servers: Vec<String>,
    #[serde(default)]
    pub algo: Algorithm,
    #[serde(default)]
    #[validate(custom(function = "HostEntry::validate_weights"))]
    pub weights: Vec<f64>,

    pub firewall_rules: Option<FirewallRules>,
    #[validate(custom(function = "HostEntry::validate_header_rules"))]
    pub header_rules: Option<FacetRules>,
    pub param_rules: Option<FacetRules>,
    pub post_data_rules: Option<FacetRules>,
    pub cookie_rules: Option<FacetRules>,
    pub rewrite_rules: Option<RewriteRules>,
}

impl HostEntry {
    fn validate_weights(weights: &[f64]) -> Result<(), ValidationError> {
        if let Some(weight) = weights.iter().find(|w| !w.is_finite() || **w < 0.0) {
            let mut err = ValidationError::new("invalid_weight");
            err.add_param("weight".into(), weight);
            return Err(err);
        }
        Ok(())
    }

    // added headers are inserted into the upstream request as-is
    fn validate_header_rules(rules: &FacetRules) -> Result<(), ValidationError> {
        for (name, value) in &rules.add {
            if HeaderName::from_bytes(name.as_bytes()).is_err() {
                let mut err = ValidationError::new("invalid_header_name");
                err.add_param("name".into(), name);
                return Err(err);
            }
            if HeaderValue::from_str(value).is_err() {
                let mut err = ValidationError::new("invalid_header_value");
                err.add_param("name".into(), name);
                return Err(err);
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize, Validate)]
pub struct PathEntry {
    #[validate(custom(function = "PathEntry::validate_path"))]
    pub path: String,
    #[validate(length(min = 1), custom(function = "validate_servers"))]
    pub servers: Vec<String>,
}

impl PathEntry {
    fn validate_path(path: &str) -> Result<(), ValidationError> {
        if path.starts_with('/') {
            Ok(())
        } else {
            Err(ValidationError::new("path_must_start_with_slash"))
        }
    }
}

fn validate_servers(servers: &[String]) -> Result<(), ValidationError> {
    for server in servers {
        if !ENDPOINT_RE.is_match(server) {
            let mut err = ValidationError::new("invalid_server_endpoint");
            err.add_param("server".into(), server);
            return Err(err);
        }
    }
    Ok(())
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct FirewallRules {
    #[serde(default)]
    pub ip_reject: Vec<String>,
    #[serde(default)]
    pub path_reject: Vec<String>,
    #[serde(default, deserialize_with = "ordered_list_map")]
    pub header_reject: Vec<(String, Vec<String>)>,
}

/// `add` pairs are merged into the facet, then `remove` keys are deleted.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct FacetRules {
    #[serde(default, deserialize_with = "ordered_string_map")]
    pub add: Vec<(String, String)>,
    #[serde(default, deserialize_with = "key_set")]
    pub remove: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct RewriteRules {
    #[serde(default, deserialize_with = "ordered_string_map")]
    pub replace: Vec<(String, String)>,
}

fn scalar_to_string(value: YamlValue) -> Option<String> {
    match value {
        YamlValue::String(s) => Some(s),
        YamlValue::Number(n) => Some(n.to_string()),
        YamlValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

// serde_yaml keeps mapping keys in document order, which rewrite rules depend on.
fn ordered_string_map<'de, D>(deserializer: D) -> Result<Vec<(String, String)>, D::Error>
where
    D: Deserializer<'de>,
{
    Mapping::deserialize(deserializer)?
        .into_iter()
        .map(|(k, v)| {
            let key = scalar_to_string(k).ok_or_else(|| de::Error::custom("non-scalar key"))?;
            let value = scalar_to_string(v)
                .ok_or_else(|| de::Error::custom(format!("non-scalar value for key {key}")))?;
            Ok((key, value))
        })
        .collect()
}

fn ordered_list_map<'de, D>(deserializer: D) -> Result<Vec<(String, Vec<String>)>, D::Error>
where
    D: Deserializer<'de>,
{
    Mapping::deserialize(deserializer)?
        .into_iter()
        .map(|(k, v)| {
            let key = scalar_to_string(k).ok_or_else(|| de::Error::custom("non-scalar key"))?;
            let values = match v {
                YamlValue::Sequence(seq) => seq
                    .into_iter()
                    .map(|item| {
                        scalar_to_string(item).ok_or_else(|| {
                            de::Error::custom(format!("non-scalar value for key {key}"))
                        })
                    })
                    .collect::<Result<Vec<_>, D::Error>>()?,
                other => vec![scalar_to_string(other).ok_or_else(|| {
                    de::Error::custom(format!("non-scalar value for key {key}"))
                })?],
            };
            Ok((key, values))
        })
        .collect()
}

// `remove` is written as a mapping in most configs (only its keys matter),
// a plain list of names is accepted as well.
fn key_set<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawKeys {
        Map(Mapping),
        List(Vec<YamlValue>),
    }

    let keys = match RawKeys::deserialize(deserializer)? {
        RawKeys::Map(map) => map.into_iter().map(|(k, _)| k).collect::<Vec<_>>(),
        RawKeys::List(list) => list,
    };

    keys.into_iter()
        .map(|k| scalar_to_string(k).ok_or_else(|| de::Error::custom("non-scalar key")))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn init_log() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn assert_invalid(conf_str: &str) {
        match Config::from_yaml(conf_str) {
            Ok(_) => panic!("Expected error, but got a valid config"),
            Err(e) => eprintln!("Error: {:?}", e),
        }
    }

    #[test]
    fn test_load_file() {
        init_log();
        let conf_str = r#"
---
pingora:
  version: 1
  client_bind_to_ipv4:
      - 1.2.3.4
  client_bind_to_ipv6: []

listeners:
  - address: 0.0.0.0:8080

round_robin:
  state_file: /tmp/pingroute-last.json

hosts:
  - host: www.anthrax.com
    servers:
      - localhost:8081
      - localhost:8082
    algo: weight
    weights: [1, 2]
    firewall_rules:
      ip_reject:
        - 10.192.0.1
      path_reject:
        - /messages
      header_reject:
        User-Agent:
          - Malicious App
    header_rules:
      add:
        MyCustomHeader: Test
      remove:
        Host: www.anthrax.com
    cookie_rules:
      add:
        ThrashCookie: Rock on!
      remove:
        RemoveCookie: Remove
    rewrite_rules:
      replace:
        v1: v2
  - host: www.metallica.com
    servers:
      - localhost:9081

paths:
  - path: /anthrax
    servers:
      - localhost:8081
      - localhost:8082
        "#;
        let conf = Config::from_yaml(conf_str).unwrap();
        assert_eq!(1, conf.pingora.version);
        assert_eq!(1, conf.listeners.len());
        assert_eq!(2, conf.hosts.len());
        assert_eq!(1, conf.paths.len());

        let anthrax = &conf.hosts[0];
        assert_eq!(Algorithm::Weight, anthrax.algo);
        assert_eq!(vec![1.0, 2.0], anthrax.weights);
        assert_eq!(Algorithm::Random, conf.hosts[1].algo);

        let firewall = anthrax.firewall_rules.as_ref().unwrap();
        assert_eq!(vec!["10.192.0.1"], firewall.ip_reject);
        assert_eq!(
            vec![("User-Agent".to_string(), vec!["Malicious App".to_string()])],
            firewall.header_reject
        );

        let header_rules = anthrax.header_rules.as_ref().unwrap();
        assert_eq!(
            vec![("MyCustomHeader".to_string(), "Test".to_string())],
            header_rules.add
        );
        assert_eq!(vec!["Host"], header_rules.remove);
        assert_eq!(
            "Rock on!",
            anthrax.cookie_rules.as_ref().unwrap().add[0].1.as_str()
        );
        assert_eq!(
            Some(PathBuf::from("/tmp/pingroute-last.json")),
            conf.round_robin.state_file
        );
        assert_eq!(HealthCheckMode::Background, conf.health_check.mode);
        assert!(conf.trusted_proxies.is_empty());
    }

    #[test]
    fn test_trusted_proxies() {
        init_log();
        let conf_str = r#"
listeners:
  - address: 0.0.0.0:8080
trusted_proxies:
  - 127.0.0.1
  - 10.0.0.0/8
        "#;
        let conf = Config::from_yaml(conf_str).unwrap();
        assert_eq!(2, conf.trusted_proxies.len());
        assert!(conf.trusted_proxies[1].contains("10.192.0.1".parse().unwrap()));

        assert_invalid(
            r#"
listeners:
  - address: 0.0.0.0:8080
trusted_proxies: [not-an-ip]
            "#,
        );
    }

    #[test]
    fn test_valid_header_rules() {
        init_log();
        assert_invalid(
            r#"
listeners:
  - address: 0.0.0.0:8080
hosts:
  - host: www.anthrax.com
    servers: [localhost:8081]
    header_rules:
      add:
        "Bad Header": Test
            "#,
        );
        assert_invalid(
            r#"
listeners:
  - address: 0.0.0.0:8080
hosts:
  - host: www.anthrax.com
    servers: [localhost:8081]
    header_rules:
      add:
        X-Multi: "line\nbreak"
            "#,
        );
    }

    #[test]
    fn test_rewrite_rules_keep_document_order() {
        init_log();
        let conf_str = r#"
listeners:
  - address: 0.0.0.0:8080
hosts:
  - host: www.anthrax.com
    servers: [localhost:8081]
    rewrite_rules:
      replace:
        zeta: one
        alpha: two
        v1: 3
        "#;
        let conf = Config::from_yaml(conf_str).unwrap();
        let replace = &conf.hosts[0].rewrite_rules.as_ref().unwrap().replace;
        let keys: Vec<&str> = replace.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(vec!["zeta", "alpha", "v1"], keys);
        assert_eq!("3", replace[2].1);
    }

    #[test]
    fn test_remove_accepts_list() {
        init_log();
        let conf_str = r#"
listeners:
  - address: 0.0.0.0:8080
hosts:
  - host: www.anthrax.com
    servers: [localhost:8081]
    param_rules:
      remove: [RemoveMe, Other]
        "#;
        let conf = Config::from_yaml(conf_str).unwrap();
        let rules = conf.hosts[0].param_rules.as_ref().unwrap();
        assert!(rules.add.is_empty());
        assert_eq!(vec!["RemoveMe", "Other"], rules.remove);
    }

    #[test]
    fn test_health_check_section() {
        init_log();
        let conf_str = r#"
listeners:
  - address: 0.0.0.0:8080
health_check:
  mode: request
  type: http
  timeout: 3
        "#;
        let conf = Config::from_yaml(conf_str).unwrap();
        assert_eq!(HealthCheckMode::Request, conf.health_check.mode);
        assert_eq!(CheckType::Http, conf.health_check.r#type);
        assert_eq!(3, conf.health_check.timeout);
        assert_eq!(1, conf.health_check.interval);
        assert_eq!("/healthcheck", conf.health_check.http_path);
    }

    #[test]
    fn test_load_from_yaml_file() {
        init_log();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "listeners:\n  - address: 127.0.0.1:8080\npaths:\n  - path: /slayer\n    servers: [localhost:7081]"
        )
        .unwrap();

        let path = file.path().display().to_string();
        let conf = Config::load_from_yaml(&path).unwrap();
        assert_eq!("/slayer", conf.paths[0].path);
    }

    #[test]
    fn test_valid_listeners_length() {
        init_log();
        assert_invalid(
            r#"
listeners: []
hosts:
  - host: www.anthrax.com
    servers: [localhost:8081]
            "#,
        );
    }

    #[test]
    fn test_valid_servers_length() {
        init_log();
        assert_invalid(
            r#"
listeners:
  - address: 0.0.0.0:8080
hosts:
  - host: www.anthrax.com
    servers: []
            "#,
        );
    }

    #[test]
    fn test_valid_server_endpoint() {
        init_log();
        assert_invalid(
            r#"
listeners:
  - address: 0.0.0.0:8080
paths:
  - path: /anthrax
    servers: ["http://localhost:8081/"]
            "#,
        );
    }

    #[test]
    fn test_valid_path_prefix() {
        init_log();
        assert_invalid(
            r#"
listeners:
  - address: 0.0.0.0:8080
paths:
  - path: anthrax
    servers: [localhost:8081]
            "#,
        );
    }

    #[test]
    fn test_valid_weights() {
        init_log();
        assert_invalid(
            r#"
listeners:
  - address: 0.0.0.0:8080
hosts:
  - host: www.anthrax.com
    servers: [localhost:8081, localhost:8082]
    algo: weight
    weights: [1, -2]
            "#,
        );
    }

    #[test]
    fn test_unknown_algorithm() {
        init_log();
        assert_invalid(
            r#"
listeners:
  - address: 0.0.0.0:8080
hosts:
  - host: www.anthrax.com
    servers: [localhost:8081]
    algo: fastest
            "#,
        );
    }
}
