// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! CLI parsing, INI-shaped config-file parsing, and the merged
//! [`GatewayConfig`] handed to the dispatcher.

use std::path::{Path, PathBuf};

use clap::Parser;
use thiserror::Error;

use crate::registry::ServiceEntry;

const DEFAULT_MAX_CLIENTS: usize = 5;
const DEFAULT_MAX_LISTEN_SOCKETS: usize = 16;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path}:{line}: {message}")]
    Parse {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Quiet,
    Error,
    Info,
    Debug,
}

impl LogLevel {
    pub fn to_filter(self) -> &'static str {
        match self {
            LogLevel::Quiet => "off",
            LogLevel::Error => "error",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindEndpoint {
    /// `None` means "any address" (config `*` or CLI `port` with no host).
    pub host: Option<String>,
    pub port: u16,
}

/// Command-line flags. Mirrors the historic `getopt_long` surface:
/// `-v/-q/-d/-D/-U/-m/-l/-c`.
#[derive(Parser, Debug)]
#[command(name = "mcastgw")]
#[command(about = "Multicast RTP/UDP to unicast HTTP gateway")]
#[command(version)]
pub struct Args {
    /// Increase log verbosity (repeatable).
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Silence all but fatal log output.
    #[arg(short = 'q', long = "quiet", conflicts_with = "verbose")]
    pub quiet: bool,

    /// Detach from the controlling terminal (Unix only).
    #[arg(short = 'd', long = "daemon", conflicts_with = "nodaemon")]
    pub daemon: bool,

    /// Stay in the foreground (default).
    #[arg(short = 'D', long = "nodaemon")]
    pub nodaemon: bool,

    /// Disable the dynamic UDPxy-style URL grammar.
    #[arg(short = 'U', long = "noudpxy")]
    pub noudpxy: bool,

    /// Maximum concurrent streaming clients.
    #[arg(short = 'm', long = "maxclients")]
    pub maxclients: Option<usize>,

    /// Add a bind endpoint `[addr:]port`. Repeatable.
    #[arg(short = 'l', long = "listen")]
    pub listen: Vec<String>,

    /// Load a config file instead of the default.
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,
}

/// The fully merged configuration handed to the dispatcher.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_endpoints: Vec<BindEndpoint>,
    pub registry_entries: Vec<ServiceEntry>,
    pub verbosity: LogLevel,
    pub daemonise: bool,
    pub udpxy_enabled: bool,
    pub max_clients: usize,
    pub hostname: Option<String>,
    pub max_listen_sockets: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_endpoints: Vec::new(),
            registry_entries: Vec::new(),
            verbosity: LogLevel::Info,
            daemonise: false,
            udpxy_enabled: true,
            max_clients: DEFAULT_MAX_CLIENTS,
            hostname: None,
            max_listen_sockets: DEFAULT_MAX_LISTEN_SOCKETS,
        }
    }
}

impl GatewayConfig {
    /// Build the final configuration: start from defaults, fold in the
    /// config file named by `-c` (if any), then apply CLI flags on top so
    /// they win field-by-field. Re-specifying `-c` is handled by the
    /// caller resetting to `GatewayConfig::default()` before calling this
    /// again, matching the historic reload-on-`-c` behaviour.
    pub fn from_args(args: &Args) -> Result<Self, ConfigError> {
        let mut cfg = match &args.config {
            Some(path) => Self::from_file(path)?,
            None => GatewayConfig::default(),
        };

        cfg.apply_cli(args)?;

        if cfg.bind_endpoints.is_empty() {
            cfg.bind_endpoints.push(BindEndpoint { host: None, port: 8888 });
        }

        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_cli(&mut self, args: &Args) -> Result<(), ConfigError> {
        if args.quiet {
            self.verbosity = LogLevel::Quiet;
        } else if args.verbose >= 2 {
            self.verbosity = LogLevel::Debug;
        } else if args.verbose == 1 {
            self.verbosity = LogLevel::Info;
        }

        if args.daemon {
            self.daemonise = true;
        }
        if args.nodaemon {
            self.daemonise = false;
        }
        if args.noudpxy {
            self.udpxy_enabled = false;
        }
        if let Some(m) = args.maxclients {
            if m < 1 {
                return Err(ConfigError::Invalid("maxclients must be >= 1".into()));
            }
            self.max_clients = m;
        }
        for spec in &args.listen {
            self.bind_endpoints.push(parse_listen_flag(spec)?);
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_clients < 1 {
            return Err(ConfigError::Invalid("maxclients must be >= 1".into()));
        }
        if self.max_listen_sockets < 1 {
            return Err(ConfigError::Invalid("max_listen_sockets must be >= 1".into()));
        }
        if self.bind_endpoints.len() > self.max_listen_sockets {
            return Err(ConfigError::Invalid(format!(
                "{} bind endpoints exceeds max_listen_sockets={}",
                self.bind_endpoints.len(),
                self.max_listen_sockets
            )));
        }
        Ok(())
    }

    /// Parse the INI-shaped config file: `[bind]`, `[services]`, and
    /// `[global]` sections. Not TOML — the first two sections are
    /// positional-field lines, not key/value pairs.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut cfg = GatewayConfig::default();
        let mut section = Section::None;

        for (idx, raw_line) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = strip_comment(raw_line).trim();
            if line.is_empty() {
                continue;
            }

            if let Some(name) = line.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
                section = Section::from_name(name).ok_or_else(|| ConfigError::Parse {
                    path: path.to_path_buf(),
                    line: line_no,
                    message: format!("unknown section [{name}]"),
                })?;
                continue;
            }

            match section {
                Section::None => {
                    return Err(ConfigError::Parse {
                        path: path.to_path_buf(),
                        line: line_no,
                        message: "entry outside any section".into(),
                    })
                }
                Section::Bind => cfg.bind_endpoints.push(parse_bind_line(line, path, line_no)?),
                Section::Services => cfg.registry_entries.push(parse_services_line(line, path, line_no)?),
                Section::Global => apply_global_line(&mut cfg, line, path, line_no)?,
            }
        }

        Ok(cfg)
    }
}

#[derive(Debug, Clone, Copy)]
enum Section {
    None,
    Bind,
    Services,
    Global,
}

impl Section {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "bind" => Some(Section::Bind),
            "services" => Some(Section::Services),
            "global" => Some(Section::Global),
            _ => None,
        }
    }
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(idx) => &line[..idx],
        None => line,
    }
}

/// `HOST PORT`, where `HOST` of `*` means any address.
fn parse_bind_line(line: &str, path: &Path, line_no: usize) -> Result<BindEndpoint, ConfigError> {
    let mut fields = line.split_whitespace();
    let host = fields.next().ok_or_else(|| parse_err(path, line_no, "missing host"))?;
    let port_str = fields.next().ok_or_else(|| parse_err(path, line_no, "missing port"))?;
    let port: u16 = port_str
        .parse()
        .map_err(|_| parse_err(path, line_no, "invalid port"))?;

    Ok(BindEndpoint {
        host: if host == "*" { None } else { Some(host.to_string()) },
        port,
    })
}

/// `NAME TYPE ADDR PORT`, where `ADDR` may be `source[:sport]@group` for
/// source-specific multicast.
fn parse_services_line(line: &str, path: &Path, line_no: usize) -> Result<ServiceEntry, ConfigError> {
    let mut fields = line.split_whitespace();
    let name = fields.next().ok_or_else(|| parse_err(path, line_no, "missing service name"))?;
    let ty = fields.next().ok_or_else(|| parse_err(path, line_no, "missing service type"))?;
    let addr = fields.next().ok_or_else(|| parse_err(path, line_no, "missing address"))?;
    let port_str = fields.next().ok_or_else(|| parse_err(path, line_no, "missing port"))?;
    let port: u16 = port_str
        .parse()
        .map_err(|_| parse_err(path, line_no, "invalid port"))?;

    let (source_host, source_port, group_host) = match addr.split_once('@') {
        Some((source_part, group)) => {
            let (shost, sport) = match source_part.split_once(':') {
                Some((h, p)) => (
                    h.to_string(),
                    Some(p.parse().map_err(|_| parse_err(path, line_no, "invalid source port"))?),
                ),
                None => (source_part.to_string(), None),
            };
            (Some(shost), sport, group.to_string())
        }
        None => (None, None, addr.to_string()),
    };

    Ok(ServiceEntry {
        url_path: name.to_string(),
        framing_token: ty.to_string(),
        group_host,
        group_port: port,
        source_host,
        source_port,
    })
}

fn apply_global_line(cfg: &mut GatewayConfig, line: &str, path: &Path, line_no: usize) -> Result<(), ConfigError> {
    let (key, value) = line
        .split_once('=')
        .ok_or_else(|| parse_err(path, line_no, "expected KEY = VALUE"))?;
    let key = key.trim();
    let value = value.trim();

    match key {
        "verbosity" => {
            let level: u8 = value.parse().map_err(|_| parse_err(path, line_no, "invalid verbosity"))?;
            cfg.verbosity = match level {
                0 => LogLevel::Error,
                1 => LogLevel::Info,
                _ => LogLevel::Debug,
            };
        }
        "daemonise" | "daemonize" => cfg.daemonise = parse_bool(value, path, line_no)?,
        "maxclients" => {
            let n: usize = value.parse().map_err(|_| parse_err(path, line_no, "invalid maxclients"))?;
            if n < 1 {
                return Err(parse_err(path, line_no, "maxclients must be >= 1"));
            }
            cfg.max_clients = n;
        }
        "udpxy" => cfg.udpxy_enabled = parse_bool(value, path, line_no)?,
        "hostname" => cfg.hostname = Some(value.to_string()),
        "max_listen_sockets" => {
            let n: usize = value
                .parse()
                .map_err(|_| parse_err(path, line_no, "invalid max_listen_sockets"))?;
            if n < 1 {
                return Err(parse_err(path, line_no, "max_listen_sockets must be >= 1"));
            }
            cfg.max_listen_sockets = n;
        }
        other => return Err(parse_err(path, line_no, &format!("unknown key '{other}'"))),
    }
    Ok(())
}

fn parse_bool(value: &str, path: &Path, line_no: usize) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "on" | "true" | "yes" | "1" => Ok(true),
        "off" | "false" | "no" | "0" => Ok(false),
        _ => Err(parse_err(path, line_no, "expected on/off/true/false/yes/no/1/0")),
    }
}

fn parse_err(path: &Path, line: usize, message: &str) -> ConfigError {
    ConfigError::Parse {
        path: path.to_path_buf(),
        line,
        message: message.to_string(),
    }
}

/// Parse a `-l/--listen` flag value: `[addr:]port`, with bracketed IPv6
/// literals.
fn parse_listen_flag(spec: &str) -> Result<BindEndpoint, ConfigError> {
    if let Some(rest) = spec.strip_prefix('[') {
        let end = rest
            .find(']')
            .ok_or_else(|| ConfigError::Invalid(format!("unterminated bracket in --listen {spec}")))?;
        let host = &rest[..end];
        let after = &rest[end + 1..];
        let port_str = after
            .strip_prefix(':')
            .ok_or_else(|| ConfigError::Invalid(format!("missing port in --listen {spec}")))?;
        let port: u16 = port_str
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("invalid port in --listen {spec}")))?;
        return Ok(BindEndpoint {
            host: Some(host.to_string()),
            port,
        });
    }

    match spec.rsplit_once(':') {
        Some((host, port_str)) => {
            let port: u16 = port_str
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("invalid port in --listen {spec}")))?;
            Ok(BindEndpoint {
                host: Some(host.to_string()),
                port,
            })
        }
        None => {
            let port: u16 = spec
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("invalid --listen value {spec}")))?;
            Ok(BindEndpoint { host: None, port })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(contents: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f
    }

    #[test]
    fn parses_bind_and_services_and_global() {
        let f = write_temp(
            "[bind]\n* 8888\nlocalhost 8889\n\n[services]\nch5 MRTP 239.1.1.1 5000\nch6 MUDP src@239.1.1.2 6000\n\n[global]\nmaxclients = 10\nudpxy = off\n",
        );
        let cfg = GatewayConfig::from_file(f.path()).unwrap();
        assert_eq!(cfg.bind_endpoints.len(), 2);
        assert_eq!(cfg.bind_endpoints[0].host, None);
        assert_eq!(cfg.registry_entries.len(), 2);
        assert_eq!(cfg.registry_entries[1].source_host.as_deref(), Some("src"));
        assert_eq!(cfg.max_clients, 10);
        assert!(!cfg.udpxy_enabled);
    }

    #[test]
    fn rejects_unknown_section() {
        let f = write_temp("[bogus]\nfoo bar\n");
        assert!(GatewayConfig::from_file(f.path()).is_err());
    }

    #[test]
    fn rejects_unknown_global_key() {
        let f = write_temp("[global]\nfrobnicate = yes\n");
        assert!(GatewayConfig::from_file(f.path()).is_err());
    }

    #[test]
    fn comments_and_blank_lines_are_ignored() {
        let f = write_temp("# a comment\n\n[bind]\n* 8888 # trailing comment\n");
        let cfg = GatewayConfig::from_file(f.path()).unwrap();
        assert_eq!(cfg.bind_endpoints[0].port, 8888);
    }

    #[test]
    fn listen_flag_parses_plain_and_bracketed() {
        let a = parse_listen_flag("8080").unwrap();
        assert_eq!(a.host, None);
        assert_eq!(a.port, 8080);

        let b = parse_listen_flag("0.0.0.0:8080").unwrap();
        assert_eq!(b.host.as_deref(), Some("0.0.0.0"));

        let c = parse_listen_flag("[::1]:8080").unwrap();
        assert_eq!(c.host.as_deref(), Some("::1"));
        assert_eq!(c.port, 8080);
    }

    #[test]
    fn maxclients_below_one_is_rejected_in_file() {
        let f = write_temp("[global]\nmaxclients = 0\n");
        assert!(GatewayConfig::from_file(f.path()).is_err());
    }
}
