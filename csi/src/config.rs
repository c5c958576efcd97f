//! Command line and environment configuration of the plugin.

use std::{fmt, net::SocketAddr, path::PathBuf, str::FromStr};

use clap::{App, Arg, ArgMatches};
use snafu::Snafu;
use upcloud::Label;
use url::Url;

use crate::service::ServiceError;

pub const DEFAULT_DRIVER_NAME: &str = "storage.csi.upcloud.com";
pub const DEFAULT_HEALTH_ADDRESS: &str = "tcp://127.0.0.1:13071";
pub const DEFAULT_FS_TYPES: &str = "ext3,ext4,xfs";
pub const DEFAULT_MAX_VOLUMES_PER_NODE: &str = "7";

#[derive(Debug, Snafu)]
#[snafu(visibility = "pub")]
pub enum ConfigError {
    #[snafu(display("Invalid value '{}' for --{}: {}", value, flag, reason))]
    InvalidFlag {
        flag: &'static str,
        value: String,
        reason: String,
    },
    #[snafu(display(
        "Invalid mode '{}', expected one of controller, node, monolith",
        mode
    ))]
    InvalidMode { mode: String },
    #[snafu(display("API credentials are required in {} mode", mode))]
    MissingCredentials { mode: Mode },
    #[snafu(display("Failed to read the hostname of this node: {}", source))]
    Hostname { source: nix::Error },
    #[snafu(display("Failed to create API client: {}", source))]
    ApiClient { source: upcloud::Error },
    #[snafu(display("Failed to verify API credentials: {}", source))]
    Account { source: upcloud::Error },
    #[snafu(display(
        "Zone is not configured and can not be resolved for {}: {}",
        hostname,
        reason
    ))]
    ZoneUnresolved { hostname: String, reason: String },
    #[snafu(display("Failed to resolve server {}: {}", hostname, source))]
    ServerLookup {
        hostname: String,
        source: ServiceError,
    },
    #[snafu(display("Failed to listen on {}: {}", endpoint, source))]
    Listen {
        endpoint: String,
        source: std::io::Error,
    },
    #[snafu(display("Failed to bind health endpoint {}: {}", address, source))]
    HealthListen {
        address: SocketAddr,
        source: hyper::Error,
    },
    #[snafu(display("Failed to install signal handler: {}", source))]
    Signal { source: std::io::Error },
    #[snafu(display("gRPC server failed: {}", source))]
    Serve { source: tonic::transport::Error },
}

/// Which services the plugin binds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Controller,
    Node,
    Monolith,
}

impl Mode {
    pub fn has_controller(self) -> bool {
        matches!(self, Mode::Controller | Mode::Monolith)
    }

    pub fn has_node(self) -> bool {
        matches!(self, Mode::Node | Mode::Monolith)
    }
}

impl FromStr for Mode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "controller" => Ok(Mode::Controller),
            "node" => Ok(Mode::Node),
            "monolith" => Ok(Mode::Monolith),
            _ => Err(ConfigError::InvalidMode {
                mode: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Mode::Controller => "controller",
            Mode::Node => "node",
            Mode::Monolith => "monolith",
        })
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Unix socket the CSI services listen on.
    pub endpoint: PathBuf,
    /// Address of the health endpoint.
    pub address: SocketAddr,
    pub node_host: String,
    pub zone: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub driver_name: String,
    pub mode: Mode,
    /// Directive for the tracing filter.
    pub log_level: &'static str,
    /// Applied to every created or cloned storage.
    pub labels: Vec<Label>,
    /// Filesystems the node is allowed to create.
    pub fs_types: Vec<String>,
    pub max_volumes_per_node: i64,
    pub api_url: String,
}

pub fn app() -> App<'static, 'static> {
    App::new("upcloud-csi")
        .version(env!("CARGO_PKG_VERSION"))
        .about("CSI plugin for UpCloud block storage")
        .arg(
            Arg::with_name("endpoint")
                .long("endpoint")
                .value_name("PATH")
                .env("CSI_ENDPOINT")
                .help("CSI socket path (default /var/lib/kubelet/plugins/<driver-name>/csi.sock)"),
        )
        .arg(
            Arg::with_name("address")
                .long("address")
                .value_name("URL")
                .default_value(DEFAULT_HEALTH_ADDRESS)
                .help("Health endpoint address"),
        )
        .arg(
            Arg::with_name("nodehost")
                .long("nodehost")
                .value_name("HOSTNAME")
                .env("NODE_HOST")
                .help("Hostname of the server this instance runs on"),
        )
        .arg(
            Arg::with_name("zone")
                .long("zone")
                .value_name("ZONE")
                .help("Zone of the volumes, resolved from the node when not set"),
        )
        .arg(
            Arg::with_name("username")
                .long("username")
                .value_name("USERNAME")
                .env("UPCLOUD_USERNAME")
                .hide_env_values(true)
                .help("API username"),
        )
        .arg(
            Arg::with_name("password")
                .long("password")
                .value_name("PASSWORD")
                .env("UPCLOUD_PASSWORD")
                .hide_env_values(true)
                .help("API password"),
        )
        .arg(
            Arg::with_name("driver-name")
                .long("driver-name")
                .value_name("NAME")
                .default_value(DEFAULT_DRIVER_NAME)
                .help("Name the plugin registers under"),
        )
        .arg(
            Arg::with_name("mode")
                .long("mode")
                .value_name("MODE")
                .default_value("monolith")
                .help("controller, node or monolith"),
        )
        .arg(
            Arg::with_name("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .default_value("info")
                .help("panic, fatal, error, warn, info, debug or trace"),
        )
        .arg(
            Arg::with_name("label")
                .long("label")
                .value_name("KEY=VALUE")
                .env("STORAGE_LABELS")
                .multiple(true)
                .number_of_values(1)
                .help("Label applied to created storages, may be repeated"),
        )
        .arg(
            Arg::with_name("fs-types")
                .long("fs-types")
                .value_name("LIST")
                .default_value(DEFAULT_FS_TYPES)
                .help("Filesystems the node is allowed to create"),
        )
        .arg(
            Arg::with_name("max-volumes-per-node")
                .long("max-volumes-per-node")
                .value_name("NUMBER")
                .default_value(DEFAULT_MAX_VOLUMES_PER_NODE)
                .help("Number of storage devices a server may hold"),
        )
        .arg(
            Arg::with_name("api-url")
                .long("api-url")
                .value_name("URL")
                .default_value(upcloud::DEFAULT_API_URL)
                .help("API endpoint"),
        )
}

/// Split comma separated values, dropping empty entries.
fn split_list<'a>(
    values: impl Iterator<Item = &'a str> + 'a,
) -> impl Iterator<Item = &'a str> + 'a {
    values
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Parse `key=value` labels, one per value; the value may itself contain
/// `=` or `,`.
pub fn parse_labels<'a>(
    values: impl Iterator<Item = &'a str> + 'a,
) -> Result<Vec<Label>, ConfigError> {
    values
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|entry| match entry.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok(Label::new(key, value)),
            _ => Err(ConfigError::InvalidFlag {
                flag: "label",
                value: entry.to_string(),
                reason: "expected key=value".into(),
            }),
        })
        .collect()
}

/// Map a log level onto a tracing filter directive.
pub fn log_directive(level: &str) -> Result<&'static str, ConfigError> {
    match level.to_ascii_lowercase().as_str() {
        "panic" | "fatal" | "error" => Ok("error"),
        "warn" | "warning" => Ok("warn"),
        "info" => Ok("info"),
        "debug" => Ok("debug"),
        "trace" => Ok("trace"),
        _ => Err(ConfigError::InvalidFlag {
            flag: "log-level",
            value: level.to_string(),
            reason: "unknown level".into(),
        }),
    }
}

/// Parse `tcp://host:port`.
pub fn parse_address(address: &str) -> Result<SocketAddr, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidFlag {
        flag: "address",
        value: address.to_string(),
        reason,
    };
    let url = Url::parse(address).map_err(|e| invalid(e.to_string()))?;
    if url.scheme() != "tcp" {
        return Err(invalid(format!("unsupported scheme {}", url.scheme())));
    }
    if url.port().is_none() {
        return Err(invalid("port is missing".into()));
    }
    url.socket_addrs(|| None)
        .map_err(|e| invalid(e.to_string()))?
        .into_iter()
        .next()
        .ok_or_else(|| invalid("address does not resolve".into()))
}

fn default_endpoint(driver_name: &str) -> PathBuf {
    PathBuf::from(format!("/var/lib/kubelet/plugins/{}/csi.sock", driver_name))
}

fn hostname() -> Result<String, ConfigError> {
    let mut buffer = [0u8; 256];
    let name = nix::unistd::gethostname(&mut buffer)
        .map_err(|source| ConfigError::Hostname {
            source,
        })?;
    Ok(name.to_string_lossy().into_owned())
}

fn non_empty(matches: &ArgMatches, name: &str) -> Option<String> {
    matches
        .value_of(name)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
}

impl Config {
    pub fn from_matches(matches: &ArgMatches) -> Result<Self, ConfigError> {
        let driver_name = non_empty(matches, "driver-name")
            .unwrap_or_else(|| DEFAULT_DRIVER_NAME.to_string());

        let endpoint = match non_empty(matches, "endpoint") {
            Some(endpoint) => PathBuf::from(
                endpoint
                    .strip_prefix("unix://")
                    .or_else(|| endpoint.strip_prefix("unix:"))
                    .unwrap_or(&endpoint),
            ),
            None => default_endpoint(&driver_name),
        };

        let address = parse_address(
            matches.value_of("address").unwrap_or(DEFAULT_HEALTH_ADDRESS),
        )?;

        let mode = matches.value_of("mode").unwrap_or("monolith").parse()?;

        let log_level =
            log_directive(matches.value_of("log-level").unwrap_or("info"))?;

        let label_values = matches.values_of("label").into_iter().flatten();
        // only STORAGE_LABELS holds a comma separated list, flag values are
        // taken whole
        let labels = if matches.occurrences_of("label") == 0 {
            parse_labels(split_list(label_values))?
        } else {
            parse_labels(label_values)?
        };

        let fs_types: Vec<String> = split_list(
            matches.values_of("fs-types").into_iter().flatten(),
        )
        .map(String::from)
        .collect();
        if fs_types.is_empty() {
            return Err(ConfigError::InvalidFlag {
                flag: "fs-types",
                value: String::new(),
                reason: "at least one filesystem is required".into(),
            });
        }

        let max = matches
            .value_of("max-volumes-per-node")
            .unwrap_or(DEFAULT_MAX_VOLUMES_PER_NODE);
        let max_volumes_per_node = match max.parse::<i64>() {
            Ok(n) if n > 0 => n,
            _ => {
                return Err(ConfigError::InvalidFlag {
                    flag: "max-volumes-per-node",
                    value: max.to_string(),
                    reason: "expected a positive number".into(),
                })
            }
        };

        let node_host = match non_empty(matches, "nodehost") {
            Some(host) => host,
            None => hostname()?,
        };

        Ok(Self {
            endpoint,
            address,
            node_host,
            zone: non_empty(matches, "zone"),
            username: non_empty(matches, "username"),
            password: non_empty(matches, "password"),
            driver_name,
            mode,
            log_level,
            labels,
            fs_types,
            max_volumes_per_node,
            api_url: non_empty(matches, "api-url")
                .unwrap_or_else(|| upcloud::DEFAULT_API_URL.to_string()),
        })
    }

    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => {
                Some((username.as_str(), password.as_str()))
            }
            _ => None,
        }
    }
}
