//! Configuration loading.
//!
//! TOML is the sole config source.  Deserialization is two-stage: raw
//! structs where every field is optional, validated into checked types with
//! defaults applied.  Path entries whose key begins with `~` are regex
//! templates matched when no literal entry fits.
//!
//! Name resolution order: literal match first, then regex entries in
//! lexical order of their keys, first match wins.  Lexical order stands in
//! for "configuration order" so resolution is deterministic across reloads
//! regardless of how the TOML parser orders tables.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ipnet::IpNet;
use regex::Regex;
use serde::Deserialize;

use mtx_protocol::validate_path_name;

const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_READER_QUEUE: usize = 512;
const DEFAULT_ON_DEMAND_START_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_ON_DEMAND_CLOSE_AFTER: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Validated config types
// ---------------------------------------------------------------------------

/// Top-level daemon configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Conf {
    /// `ws://` ingress listen address.
    pub listen: String,
    pub tls: Option<TlsConf>,
    /// Read deadline for sessions outside the play state.
    pub read_timeout: Duration,
    /// Per-reader frame queue capacity; overflow drops the reader.
    pub reader_queue_size: usize,
    /// Literal entries followed by regex entries, each group in lexical
    /// key order.
    pub paths: Vec<PathEntry>,
}

/// `wss://` ingress with hot-reloaded certificate.
#[derive(Debug, Clone, PartialEq)]
pub struct TlsConf {
    pub listen: String,
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// One `[paths.X]` entry.  `name` is the raw key, including the `~` prefix
/// for regex templates.
#[derive(Debug, Clone)]
pub struct PathEntry {
    pub name: String,
    /// Compiled from `name[1..]` for regex templates, `None` for literals.
    pub regex: Option<Regex>,
    pub conf: PathConf,
}

impl PathEntry {
    pub fn is_regex(&self) -> bool {
        self.regex.is_some()
    }

    pub fn matches(&self, path_name: &str) -> bool {
        match &self.regex {
            Some(re) => re.is_match(path_name),
            None => self.name == path_name,
        }
    }
}

impl PartialEq for PathEntry {
    fn eq(&self, other: &Self) -> bool {
        // the regex is a pure function of the name
        self.name == other.name && self.conf == other.conf
    }
}

/// Where a path's stream comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfSource {
    /// Accept a local publisher session.
    Publisher,
    /// Pull from a remote relay (`ws://` / `wss://` URL).
    External(String),
    /// Answer describes with a redirect to `source_redirect`.
    Redirect,
}

/// Resolved per-path policy.
#[derive(Debug, Clone, PartialEq)]
pub struct PathConf {
    pub source: ConfSource,
    pub source_on_demand: bool,
    pub source_on_demand_start_timeout: Duration,
    pub source_on_demand_close_after: Duration,
    pub source_redirect: Option<String>,
    /// Redirect destination served to readers while no one is publishing.
    /// Absolute URL or `/path` fragment resolved against the requestor.
    pub fallback: Option<String>,
    /// Reject a second publisher instead of displacing the current one.
    pub disable_publisher_override: bool,

    pub publish_user: Option<String>,
    pub publish_pass: Option<String>,
    pub publish_ips: Vec<IpNet>,
    pub read_user: Option<String>,
    pub read_pass: Option<String>,
    pub read_ips: Vec<IpNet>,

    pub run_on_init: Option<String>,
    pub run_on_init_restart: bool,
    pub run_on_demand: Option<String>,
    pub run_on_demand_restart: bool,
    pub run_on_demand_start_timeout: Duration,
    pub run_on_demand_close_after: Duration,
    pub run_on_publish: Option<String>,
    pub run_on_publish_restart: bool,
    pub run_on_read: Option<String>,
    pub run_on_read_restart: bool,
}

impl Default for PathConf {
    fn default() -> Self {
        PathConf {
            source: ConfSource::Publisher,
            source_on_demand: false,
            source_on_demand_start_timeout: DEFAULT_ON_DEMAND_START_TIMEOUT,
            source_on_demand_close_after: DEFAULT_ON_DEMAND_CLOSE_AFTER,
            source_redirect: None,
            fallback: None,
            disable_publisher_override: false,
            publish_user: None,
            publish_pass: None,
            publish_ips: Vec::new(),
            read_user: None,
            read_pass: None,
            read_ips: Vec::new(),
            run_on_init: None,
            run_on_init_restart: false,
            run_on_demand: None,
            run_on_demand_restart: false,
            run_on_demand_start_timeout: DEFAULT_ON_DEMAND_START_TIMEOUT,
            run_on_demand_close_after: DEFAULT_ON_DEMAND_CLOSE_AFTER,
            run_on_read: None,
            run_on_read_restart: false,
            run_on_publish: None,
            run_on_publish_restart: false,
        }
    }
}

impl PathConf {
    pub fn has_external_source(&self) -> bool {
        matches!(self.source, ConfSource::External(_))
    }

    pub fn is_redirect(&self) -> bool {
        matches!(self.source, ConfSource::Redirect)
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConf {
    listen: Option<String>,
    tls_listen: Option<String>,
    tls_cert: Option<PathBuf>,
    tls_key: Option<PathBuf>,
    #[serde(default, with = "humantime_serde::option")]
    read_timeout: Option<Duration>,
    reader_queue_size: Option<usize>,
    #[serde(default)]
    paths: toml::Table,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPathConf {
    source: Option<String>,
    source_on_demand: Option<bool>,
    #[serde(default, with = "humantime_serde::option")]
    source_on_demand_start_timeout: Option<Duration>,
    #[serde(default, with = "humantime_serde::option")]
    source_on_demand_close_after: Option<Duration>,
    source_redirect: Option<String>,
    fallback: Option<String>,
    disable_publisher_override: Option<bool>,
    publish_user: Option<String>,
    publish_pass: Option<String>,
    publish_ips: Option<Vec<String>>,
    read_user: Option<String>,
    read_pass: Option<String>,
    read_ips: Option<Vec<String>>,
    run_on_init: Option<String>,
    run_on_init_restart: Option<bool>,
    run_on_demand: Option<String>,
    run_on_demand_restart: Option<bool>,
    #[serde(default, with = "humantime_serde::option")]
    run_on_demand_start_timeout: Option<Duration>,
    #[serde(default, with = "humantime_serde::option")]
    run_on_demand_close_after: Option<Duration>,
    run_on_publish: Option<String>,
    run_on_publish_restart: Option<bool>,
    run_on_read: Option<String>,
    run_on_read_restart: Option<bool>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfError {
    #[error("reading config file '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("parse error: {0}")]
    Parse(String),
    #[error("missing required field: {0}")]
    MissingField(String),
    #[error("path entry '{entry}': {reason}")]
    BadPathEntry { entry: String, reason: String },
    #[error("regex entry '{regex}' aliases literal entry '{literal}'")]
    RegexAliasesLiteral { regex: String, literal: String },
    #[error("tls_listen requires both tls_cert and tls_key")]
    IncompleteTls,
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

pub fn load_from_path(path: &Path) -> Result<Conf, ConfError> {
    let toml_str = std::fs::read_to_string(path).map_err(|e| ConfError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    load_from_str(&toml_str)
}

pub fn load_from_str(toml_str: &str) -> Result<Conf, ConfError> {
    let raw: RawConf = toml::from_str(toml_str).map_err(|e| ConfError::Parse(e.to_string()))?;

    let listen = raw
        .listen
        .ok_or_else(|| ConfError::MissingField("listen".to_owned()))?;

    let tls = match (raw.tls_listen, raw.tls_cert, raw.tls_key) {
        (None, _, _) => None,
        (Some(listen), Some(cert), Some(key)) => Some(TlsConf { listen, cert, key }),
        _ => return Err(ConfError::IncompleteTls),
    };

    let mut literals = Vec::new();
    let mut regexes = Vec::new();
    for (key, value) in raw.paths {
        let raw_path: RawPathConf = value
            .try_into()
            .map_err(|e| ConfError::BadPathEntry {
                entry: key.clone(),
                reason: e.to_string(),
            })?;
        let entry = validate_path_entry(&key, raw_path)?;
        if entry.is_regex() {
            regexes.push(entry);
        } else {
            literals.push(entry);
        }
    }
    literals.sort_by(|a, b| a.name.cmp(&b.name));
    regexes.sort_by(|a, b| a.name.cmp(&b.name));

    let literal_names: HashSet<&str> = literals.iter().map(|e| e.name.as_str()).collect();
    for entry in &regexes {
        if let Some(re) = &entry.regex
            && let Some(name) = literal_names.iter().find(|n| re.is_match(n))
        {
            return Err(ConfError::RegexAliasesLiteral {
                regex: entry.name.clone(),
                literal: (*name).to_owned(),
            });
        }
    }

    let mut paths = literals;
    paths.extend(regexes);

    Ok(Conf {
        listen,
        tls,
        read_timeout: raw.read_timeout.unwrap_or(DEFAULT_READ_TIMEOUT),
        reader_queue_size: raw.reader_queue_size.unwrap_or(DEFAULT_READER_QUEUE),
        paths,
    })
}

fn bad(entry: &str, reason: impl Into<String>) -> ConfError {
    ConfError::BadPathEntry {
        entry: entry.to_owned(),
        reason: reason.into(),
    }
}

fn validate_path_entry(key: &str, raw: RawPathConf) -> Result<PathEntry, ConfError> {
    let regex = if let Some(pattern) = key.strip_prefix('~') {
        Some(Regex::new(pattern).map_err(|e| bad(key, format!("invalid regex: {e}")))?)
    } else {
        validate_path_name(key).map_err(|e| bad(key, e.to_string()))?;
        None
    };

    let source = match raw.source.as_deref() {
        None | Some("publisher") => ConfSource::Publisher,
        Some("redirect") => ConfSource::Redirect,
        Some(url) if url.starts_with("ws://") || url.starts_with("wss://") => {
            ConfSource::External(url.to_owned())
        }
        Some(other) => {
            return Err(bad(
                key,
                format!("source must be 'publisher', 'redirect' or a ws(s):// URL, got '{other}'"),
            ));
        }
    };

    match &source {
        ConfSource::Redirect => {
            if raw.source_redirect.is_none() {
                return Err(bad(key, "source = 'redirect' requires source_redirect"));
            }
        }
        ConfSource::Publisher => {
            if raw.source_on_demand == Some(true) {
                return Err(bad(key, "source_on_demand requires an external source URL"));
            }
        }
        ConfSource::External(_) => {}
    }
    if raw.source_redirect.is_some() && !matches!(source, ConfSource::Redirect) {
        return Err(bad(key, "source_redirect requires source = 'redirect'"));
    }

    if let Some(fb) = &raw.fallback
        && !(fb.starts_with("ws://") || fb.starts_with("wss://") || fb.starts_with('/'))
    {
        return Err(bad(
            key,
            "fallback must be a ws(s):// URL or an absolute /path",
        ));
    }

    let publish_ips = parse_ip_ranges(key, "publish_ips", raw.publish_ips)?;
    let read_ips = parse_ip_ranges(key, "read_ips", raw.read_ips)?;

    let defaults = PathConf::default();
    let conf = PathConf {
        source,
        source_on_demand: raw.source_on_demand.unwrap_or(false),
        source_on_demand_start_timeout: raw
            .source_on_demand_start_timeout
            .unwrap_or(defaults.source_on_demand_start_timeout),
        source_on_demand_close_after: raw
            .source_on_demand_close_after
            .unwrap_or(defaults.source_on_demand_close_after),
        source_redirect: raw.source_redirect,
        fallback: raw.fallback,
        disable_publisher_override: raw.disable_publisher_override.unwrap_or(false),
        publish_user: raw.publish_user,
        publish_pass: raw.publish_pass,
        publish_ips,
        read_user: raw.read_user,
        read_pass: raw.read_pass,
        read_ips,
        run_on_init: raw.run_on_init,
        run_on_init_restart: raw.run_on_init_restart.unwrap_or(false),
        run_on_demand: raw.run_on_demand,
        run_on_demand_restart: raw.run_on_demand_restart.unwrap_or(false),
        run_on_demand_start_timeout: raw
            .run_on_demand_start_timeout
            .unwrap_or(defaults.run_on_demand_start_timeout),
        run_on_demand_close_after: raw
            .run_on_demand_close_after
            .unwrap_or(defaults.run_on_demand_close_after),
        run_on_publish: raw.run_on_publish,
        run_on_publish_restart: raw.run_on_publish_restart.unwrap_or(false),
        run_on_read: raw.run_on_read,
        run_on_read_restart: raw.run_on_read_restart.unwrap_or(false),
    };

    Ok(PathEntry {
        name: key.to_owned(),
        regex,
        conf,
    })
}

fn parse_ip_ranges(
    entry: &str,
    field: &str,
    raw: Option<Vec<String>>,
) -> Result<Vec<IpNet>, ConfError> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    raw.iter()
        .map(|s| {
            // accept both "10.0.0.0/8" and a bare "10.1.2.3"
            s.parse::<IpNet>().or_else(|_| {
                s.parse::<std::net::IpAddr>()
                    .map(IpNet::from)
                    .map_err(|_| bad(entry, format!("{field}: invalid IP range '{s}'")))
            })
        })
        .collect()
}

impl Conf {
    /// Literal match first, then regex entries in lexical key order.
    pub fn resolve(&self, path_name: &str) -> Option<&PathEntry> {
        self.paths
            .iter()
            .find(|e| !e.is_regex() && e.matches(path_name))
            .or_else(|| {
                self.paths
                    .iter()
                    .find(|e| e.is_regex() && e.matches(path_name))
            })
    }

    pub fn entry(&self, conf_name: &str) -> Option<&PathEntry> {
        self.paths.iter().find(|e| e.name == conf_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal(paths: &str) -> String {
        format!("listen = \"127.0.0.1:8554\"\n{paths}")
    }

    #[test]
    fn defaults_are_applied() {
        let conf = load_from_str(&minimal("[paths.cam1]\n")).unwrap();
        assert_eq!(conf.read_timeout, Duration::from_secs(30));
        assert_eq!(conf.reader_queue_size, 512);
        let entry = conf.resolve("cam1").unwrap();
        assert_eq!(entry.conf.source, ConfSource::Publisher);
        assert_eq!(
            entry.conf.source_on_demand_close_after,
            Duration::from_secs(10)
        );
        assert!(!entry.is_regex());
    }

    #[test]
    fn missing_listen_is_rejected() {
        let err = load_from_str("[paths.cam1]\n").unwrap_err();
        assert!(matches!(err, ConfError::MissingField(f) if f == "listen"));
    }

    #[test]
    fn durations_parse_humantime() {
        let conf = load_from_str(&minimal(
            "[paths.p]\nsource = \"ws://up:8554/s\"\nsource_on_demand = true\nsource_on_demand_close_after = \"2m 30s\"\n",
        ))
        .unwrap();
        let entry = conf.resolve("p").unwrap();
        assert_eq!(
            entry.conf.source_on_demand_close_after,
            Duration::from_secs(150)
        );
    }

    #[test]
    fn source_variants() {
        let conf = load_from_str(&minimal(
            "[paths.a]\n[paths.b]\nsource = \"ws://up:8554/x\"\n[paths.c]\nsource = \"redirect\"\nsource_redirect = \"ws://other:8554/y\"\n",
        ))
        .unwrap();
        assert_eq!(conf.resolve("a").unwrap().conf.source, ConfSource::Publisher);
        assert!(conf.resolve("b").unwrap().conf.has_external_source());
        assert!(conf.resolve("c").unwrap().conf.is_redirect());
    }

    #[test]
    fn bad_source_is_rejected() {
        let err = load_from_str(&minimal("[paths.a]\nsource = \"rtsp://up/s\"\n")).unwrap_err();
        assert!(matches!(err, ConfError::BadPathEntry { .. }));
    }

    #[test]
    fn redirect_requires_target() {
        let err = load_from_str(&minimal("[paths.a]\nsource = \"redirect\"\n")).unwrap_err();
        assert!(matches!(err, ConfError::BadPathEntry { .. }));
    }

    #[test]
    fn on_demand_requires_external_source() {
        let err = load_from_str(&minimal("[paths.a]\nsource_on_demand = true\n")).unwrap_err();
        assert!(matches!(err, ConfError::BadPathEntry { .. }));
    }

    #[test]
    fn regex_entries_match_when_no_literal_does() {
        let conf = load_from_str(&minimal(
            "[paths.\"~^live/.*$\"]\n[paths.\"live/special\"]\nfallback = \"/alt\"\n",
        ))
        .unwrap();
        let hit = conf.resolve("live/special").unwrap();
        assert!(!hit.is_regex(), "literal match must win");
        let hit = conf.resolve("live/other").unwrap();
        assert!(hit.is_regex());
        assert!(conf.resolve("vod/other").is_none());
    }

    #[test]
    fn regex_scan_is_lexical_first_match() {
        let conf = load_from_str(&minimal(
            "[paths.\"~^z/.*$\"]\nfallback = \"/z\"\n[paths.\"~^.*$\"]\nfallback = \"/all\"\n",
        ))
        .unwrap();
        // "~^.*$" sorts before "~^z/.*$" and matches everything
        let hit = conf.resolve("z/cam").unwrap();
        assert_eq!(hit.conf.fallback.as_deref(), Some("/all"));
    }

    #[test]
    fn regex_aliasing_literal_is_rejected() {
        let err = load_from_str(&minimal("[paths.cam1]\n[paths.\"~^cam.*$\"]\n")).unwrap_err();
        assert!(matches!(err, ConfError::RegexAliasesLiteral { .. }));
    }

    #[test]
    fn invalid_regex_is_rejected() {
        let err = load_from_str(&minimal("[paths.\"~^(live$\"]\n")).unwrap_err();
        assert!(matches!(err, ConfError::BadPathEntry { .. }));
    }

    #[test]
    fn ip_ranges_parse_cidr_and_bare() {
        let conf = load_from_str(&minimal(
            "[paths.a]\npublish_ips = [\"10.0.0.0/8\", \"192.168.1.7\"]\n",
        ))
        .unwrap();
        let ips = &conf.resolve("a").unwrap().conf.publish_ips;
        assert_eq!(ips.len(), 2);
        assert!(ips[0].contains(&"10.1.2.3".parse::<std::net::IpAddr>().unwrap()));
        assert!(ips[1].contains(&"192.168.1.7".parse::<std::net::IpAddr>().unwrap()));
    }

    #[test]
    fn incomplete_tls_is_rejected() {
        let err =
            load_from_str("listen = \"127.0.0.1:8554\"\ntls_listen = \"127.0.0.1:8555\"\n")
                .unwrap_err();
        assert!(matches!(err, ConfError::IncompleteTls));
    }

    #[test]
    fn changed_entries_compare_unequal_for_reload_diff() {
        let a = load_from_str(&minimal("[paths.cam1]\n")).unwrap();
        let b = load_from_str(&minimal("[paths.cam1]\nfallback = \"/alt\"\n")).unwrap();
        assert_ne!(a.resolve("cam1").unwrap(), b.resolve("cam1").unwrap());
        let c = load_from_str(&minimal("[paths.cam1]\n")).unwrap();
        assert_eq!(a.resolve("cam1").unwrap(), c.resolve("cam1").unwrap());
    }
}
