// MIT License
//
// Copyright (c) 2019-2021 Tobias Pfeiffer
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

use {
	crate::{error::{Error, Result}, wire::{Compressor, SUPPORTED_COMPRESSORS}},
	bson::{doc, Bson, Document},
	std::{collections::HashMap, fmt, path::PathBuf, str::FromStr, time::Duration},
	log::warn,
	thiserror::Error as ThisError
};

#[cfg(feature = "tls")]
use {crate::utils::Opaque, std::sync::Arc};

pub const DEFAULT_MONGO_PORT:               u16      = 27017;
pub const DEFAULT_CONNECT_TIMEOUT:          Duration = Duration::from_secs(10);
pub const DEFAULT_MIN_POOL_SIZE:            usize    = 0;
pub const DEFAULT_MAX_POOL_SIZE:            usize    = 100;
pub const DEFAULT_MAINTENANCE_INTERVAL:     Duration = Duration::from_secs(10);
pub const DEFAULT_LOCAL_THRESHOLD:          Duration = Duration::from_millis(15);
pub const DEFAULT_SERVER_SELECTION_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_HEARTBEAT_FREQUENCY:      Duration = Duration::from_secs(10);
pub const MIN_HEARTBEAT_FREQUENCY:          Duration = Duration::from_millis(500);
/// Secondaries write a no-op at least this often, which bounds the precision of staleness estimates.
pub const IDLE_WRITE_PERIOD:                Duration = Duration::from_secs(10);
pub const SMALLEST_MAX_STALENESS:           Duration = Duration::from_secs(90);

/// The address of a server, either `host:port` or the path of a Unix domain socket.
///
/// Host names are normalized to lowercase, so two spellings of the same host compare equal.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum ServerAddress {
	Tcp { host: String, port: u16 },
	Unix { path: PathBuf }
}

impl ServerAddress {
	pub fn tcp(host: &str, port: u16) -> Self {
		Self::Tcp { host: host.to_ascii_lowercase(), port }
	}
	
	pub fn host(&self) -> Option<&str> {
		match self {
			Self::Tcp { host, .. } => Some(host),
			Self::Unix { .. }      => None
		}
	}
}

impl Default for ServerAddress {
	fn default() -> Self {
		Self::tcp("localhost", DEFAULT_MONGO_PORT)
	}
}

impl FromStr for ServerAddress {
	type Err = Error;
	
	fn from_str(s: &str) -> Result<Self> {
		let invalid = || Error::from(ClientOptionsParseError::InvalidValue { key: "host", value: s.to_string() });
		let decoded = s.trim().replace("%2F", "/").replace("%2f", "/");
		
		if decoded.is_empty() {
			return Err(invalid());
		}
		
		if decoded.ends_with(".sock") {
			return Ok(Self::Unix { path: PathBuf::from(decoded) });
		}
		
		let (host, port) = if let Some(rest) = decoded.strip_prefix('[') {
			let end = rest.find(']').ok_or_else(invalid)?;
			let port = &rest[end + 1..];
			let port = match port.strip_prefix(':') {
				Some(port) => Some(port),
				None if port.is_empty() => None,
				None => return Err(invalid())
			};
			(&rest[..end], port)
		} else {
			match decoded.find(':') {
				Some(i) if decoded[i + 1..].contains(':') => return Err(invalid()),
				Some(i) => (&decoded[..i], Some(&decoded[i + 1..])),
				None    => (decoded.as_str(), None)
			}
		};
		
		let port = match port {
			None       => DEFAULT_MONGO_PORT,
			Some(port) => match port.parse::<u16>() {
				Ok(port) if port != 0 => port,
				_ => return Err(invalid())
			}
		};
		
		if host.is_empty() {
			return Err(invalid());
		}
		
		Ok(Self::tcp(host, port))
	}
}

impl fmt::Display for ServerAddress {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			Self::Tcp { host, port } if host.contains(':') => write!(f, "[{}]:{}", host, port),
			Self::Tcp { host, port } => write!(f, "{}:{}", host, port),
			Self::Unix { path }      => write!(f, "{}", path.display())
		}
	}
}

/// see https://github.com/mongodb/specifications/blob/master/source/connection-string/connection-string-spec.rst,
/// https://github.com/mongodb/specifications/blob/master/source/uri-options/uri-options.rst
#[derive(Debug, Clone)]
pub struct ClientOptions {
	pub hosts:                   Vec<ServerAddress>,
	pub app_name:                Option<String>,
	pub compressors:             Option<Vec<Compressor>>,
	pub connect_timeout:         Duration,
	/// Read/write timeout for operation traffic. `None` waits forever.
	pub socket_timeout:          Option<Duration>,
	pub replica_set:             Option<String>,
	/// `Some(true)` talks to exactly one server and never discovers others.
	pub direct_connection:       Option<bool>,
	pub retry_reads:             bool,
	pub retry_writes:            bool,
	/// Client-side deadline applied to every operation.
	pub timeout:                 Option<Duration>,
	pub server_selection_config: ServerSelectionConfig,
	pub pool_options:            ConnectionPoolOptions,
	pub read_preference:         ReadPreference,
	#[cfg(feature = "tls")]
	pub tls_options:             Option<TlsOptions>,
	/// Takes precedence over `tls_options` when set.
	#[cfg(feature = "tls")]
	pub tls_config:              Option<Opaque<Arc<rustls::ClientConfig>>>
}

#[derive(Debug, Clone, Eq, PartialEq, ThisError)]
pub enum ClientOptionsParseError {
	#[error("connection strings must start with `mongodb://`")]
	InvalidScheme,
	#[error("unknown option `{0}`")]
	InvalidKey(String),
	#[error("invalid value `{value}` for option `{key}`")]
	InvalidValue { key: &'static str, value: String },
	#[error("{0}")]
	Invalid(String)
}

impl From<(&'static str, &str)> for ClientOptionsParseError {
	fn from((key, value): (&'static str, &str)) -> Self {
		Self::InvalidValue { key, value: value.to_string() }
	}
}

impl ClientOptions {
	/// Options for a single seed, used mostly by tests and tools.
	pub fn with_hosts(hosts: Vec<ServerAddress>) -> Self {
		Self { hosts, ..Self::default() }
	}
	
	pub fn is_direct(&self) -> bool {
		self.direct_connection == Some(true)
	}
	
	/// Rejects option combinations that can never work.
	pub fn validate(&self) -> Result<()> {
		let invalid = |msg: &str| Err(Error::from(ClientOptionsParseError::Invalid(msg.to_string())));
		let pool = &self.pool_options;
		let selection = &self.server_selection_config;
		
		if self.hosts.is_empty() {
			return invalid("at least one host is required");
		}
		
		if self.is_direct() && self.hosts.len() > 1 {
			return invalid("directConnection=true requires exactly one host");
		}
		
		if pool.max_pool_size != 0 && pool.min_pool_size > pool.max_pool_size {
			return invalid("minPoolSize must not exceed maxPoolSize");
		}
		
		if selection.heartbeat_frequency < selection.min_heartbeat_frequency {
			return invalid("heartbeatFrequencyMS must not be shorter than the minimum heartbeat frequency");
		}
		
		self.read_preference.validate(selection.heartbeat_frequency)
	}
}

impl Default for ClientOptions {
	fn default() -> Self {
		Self {
			hosts:                   Vec::new(),
			app_name:                None,
			compressors:             None,
			connect_timeout:         DEFAULT_CONNECT_TIMEOUT,
			socket_timeout:          None,
			replica_set:             None,
			direct_connection:       None,
			retry_reads:             true,
			retry_writes:            true,
			timeout:                 None,
			server_selection_config: ServerSelectionConfig::default(),
			pool_options:            ConnectionPoolOptions::default(),
			read_preference:         ReadPreference::default(),
			#[cfg(feature = "tls")]
			tls_options:             None,
			#[cfg(feature = "tls")]
			tls_config:              None
		}
	}
}

fn parse<T: FromStr>(key: &'static str, value: &str) -> std::result::Result<T, ClientOptionsParseError> {
	value.parse().map_err(|_| ClientOptionsParseError::from((key, value)))
}

fn parse_bool(key: &'static str, value: &str) -> std::result::Result<bool, ClientOptionsParseError> {
	match value {
		"true"  => Ok(true),
		"false" => Ok(false),
		_       => Err(ClientOptionsParseError::from((key, value)))
	}
}

fn parse_ms(key: &'static str, value: &str) -> std::result::Result<Duration, ClientOptionsParseError> {
	parse::<u64>(key, value).map(Duration::from_millis)
}

impl FromStr for ClientOptions {
	type Err = Error;
	
	fn from_str(mut s: &str) -> Result<Self> {
		let mut self_ = Self::default();
		
		s = s.strip_prefix("mongodb://").ok_or(ClientOptionsParseError::InvalidScheme)?;
		
		let end = s.find(|c: char| c == '/' || c == '?').unwrap_or_else(|| s.len());
		let mut authority = &s[..end];
		if let Some(i) = authority.rfind('@') {
			warn!("ignoring credentials in the connection string");
			authority = &authority[i + 1..];
		}
		
		self_.hosts = authority.split(',')
			.map(ServerAddress::from_str)
			.collect::<Result<_>>()?;
		
		s = &s[end..];
		let query = match s.find('?') {
			Some(i) => &s[i + 1..],
			None    => return Ok(self_)
		};
		
		query.split('&').filter(|s| !s.is_empty()).map(|s| {
			let i = s.find('=').unwrap_or_else(|| s.len());
			(&s[..i], s.get(i + 1..).unwrap_or_default())
		}).try_for_each(|(key, value)| Ok::<_, ClientOptionsParseError>(match key.to_ascii_lowercase().as_str() {
			"appname"                  => self_.app_name = Some(value.to_string()),
			"compressors"              => self_.compressors = Some(value.split(',')
				.map(|s| parse::<Compressor>("compressors", s))
				.filter(|c| match c {
					Ok(c) => SUPPORTED_COMPRESSORS.contains(c),
					Err(_) => true
				})
				.collect::<std::result::Result<_, _>>()?),
			"connecttimeoutms"         => self_.connect_timeout = parse_ms("connectTimeoutMS", value)?,
			"sockettimeoutms"          => self_.socket_timeout = Some(parse_ms("socketTimeoutMS", value)?)
				.filter(|t| *t != Duration::from_millis(0)),
			"directconnection"         => self_.direct_connection = Some(parse_bool("directConnection", value)?),
			"heartbeatfrequencyms"     => self_.server_selection_config.heartbeat_frequency =
				parse_ms("heartbeatFrequencyMS", value)?,
			"localthresholdms"         => self_.server_selection_config.local_threshold =
				parse_ms("localThresholdMS", value)?,
			"serverselectiontimeoutms" => self_.server_selection_config.server_selection_timeout =
				parse_ms("serverSelectionTimeoutMS", value)?,
			"servermonitoringmode"     => self_.server_selection_config.server_monitoring_mode =
				parse("serverMonitoringMode", value)?,
			"maxidletimems"            => self_.pool_options.max_idle_time = Some(parse_ms("maxIdleTimeMS", value)?)
				.filter(|t| *t != Duration::from_millis(0)),
			"maxpoolsize"              => self_.pool_options.max_pool_size = parse("maxPoolSize", value)?,
			"minpoolsize"              => self_.pool_options.min_pool_size = parse("minPoolSize", value)?,
			"waitqueuetimeoutms"       => self_.pool_options.wait_queue_timeout = Some(parse_ms("waitQueueTimeoutMS", value)?)
				.filter(|t| *t != Duration::from_millis(0)),
			"timeoutms"                => self_.timeout = Some(parse_ms("timeoutMS", value)?)
				.filter(|t| *t != Duration::from_millis(0)),
			"maxstalenessseconds"      => self_.read_preference.max_staleness = match parse::<i64>("maxStalenessSeconds", value)? {
				-1 => None,
				v if v < 0 => return Err(ClientOptionsParseError::from(("maxStalenessSeconds", value))),
				v => Some(Duration::from_secs(v as u64))
			},
			"readpreference"           => self_.read_preference.mode = parse("readPreference", value)?,
			"readpreferencetags"       => self_.read_preference.tag_sets.push(value.split(',')
				.filter(|s| !s.is_empty())
				.map(|s| {
					let i = s.find(':').ok_or_else(|| ClientOptionsParseError::from(("readPreferenceTags", value)))?;
					Ok((s[..i].to_string(), s[i + 1..].to_string()))
				})
				.collect::<std::result::Result<_, ClientOptionsParseError>>()?),
			"replicaset"               => self_.replica_set = Some(value.to_string()),
			"retryreads"               => self_.retry_reads = parse_bool("retryReads", value)?,
			"retrywrites"              => self_.retry_writes = parse_bool("retryWrites", value)?,
			#[cfg(feature = "tls")]
			"tls" | "ssl"              => if parse_bool("tls", value)? {
				self_.tls_options.get_or_insert_with(TlsOptions::default);
			} else {
				self_.tls_options = None;
			},
			#[cfg(feature = "tls")]
			"tlscafile"                => self_.tls_options
				.get_or_insert_with(TlsOptions::default).ca_file = Some(PathBuf::from(value)),
			#[cfg(feature = "tls")]
			"tlscertificatekeyfile"    => self_.tls_options
				.get_or_insert_with(TlsOptions::default).certificate_key_file = Some(PathBuf::from(value)),
			_                          => return Err(ClientOptionsParseError::InvalidKey(key.to_string()))
		}))?;
		
		Ok(self_)
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ConnectionPoolOptions {
	/// `0` means unbounded.
	pub max_pool_size:        usize,
	pub min_pool_size:        usize,
	pub max_idle_time:        Option<Duration>,
	pub wait_queue_timeout:   Option<Duration>,
	/// How often the background maintenance prunes idle connections and fills up to `min_pool_size`.
	pub maintenance_interval: Duration
}

impl Default for ConnectionPoolOptions {
	fn default() -> Self {
		Self {
			max_pool_size:        DEFAULT_MAX_POOL_SIZE,
			min_pool_size:        DEFAULT_MIN_POOL_SIZE,
			max_idle_time:        None,
			wait_queue_timeout:   None,
			maintenance_interval: DEFAULT_MAINTENANCE_INTERVAL
		}
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ServerSelectionConfig {
	pub local_threshold:          Duration,
	pub server_selection_timeout: Duration,
	pub heartbeat_frequency:      Duration,
	pub min_heartbeat_frequency:  Duration,
	pub server_monitoring_mode:   ServerMonitoringMode
}

impl Default for ServerSelectionConfig {
	fn default() -> Self {
		Self {
			local_threshold:          DEFAULT_LOCAL_THRESHOLD,
			server_selection_timeout: DEFAULT_SERVER_SELECTION_TIMEOUT,
			heartbeat_frequency:      DEFAULT_HEARTBEAT_FREQUENCY,
			min_heartbeat_frequency:  MIN_HEARTBEAT_FREQUENCY,
			server_monitoring_mode:   ServerMonitoringMode::Auto
		}
	}
}

/// Whether monitors may use awaitable hellos once a server reports a topology version.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ServerMonitoringMode {
	Auto,
	Stream,
	Poll
}

impl ServerMonitoringMode {
	pub fn allows_streaming(self) -> bool {
		self != Self::Poll
	}
}

impl FromStr for ServerMonitoringMode {
	type Err = ();
	
	fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
		Ok(match s {
			"auto"   => Self::Auto,
			"stream" => Self::Stream,
			"poll"   => Self::Poll,
			_ => return Err(())
		})
	}
}

/// A set of tags a server must all carry to match.
pub type TagSet = HashMap<String, String>;

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ReadPreference {
	pub mode:          ReadPreferenceMode,
	pub max_staleness: Option<Duration>,
	/// Tried in order; the first set that matches any eligible server wins.
	pub tag_sets:      Vec<TagSet>
}

impl ReadPreference {
	pub fn new(mode: ReadPreferenceMode) -> Self {
		Self { mode, max_staleness: None, tag_sets: Vec::new() }
	}
	
	pub fn primary() -> Self {
		Self::new(ReadPreferenceMode::Primary)
	}
	
	pub fn with_tag_sets(mut self, tag_sets: Vec<TagSet>) -> Self {
		self.tag_sets = tag_sets;
		self
	}
	
	pub fn with_max_staleness(mut self, max_staleness: Duration) -> Self {
		self.max_staleness = Some(max_staleness);
		self
	}
	
	pub fn validate(&self, heartbeat_frequency: Duration) -> Result<()> {
		let invalid = |msg: String| Err(Error::from(ClientOptionsParseError::Invalid(msg)));
		
		if self.mode == ReadPreferenceMode::Primary {
			if self.max_staleness.is_some() {
				return invalid("maxStalenessSeconds cannot be combined with mode primary".to_string());
			}
			
			if self.tag_sets.iter().any(|set| !set.is_empty()) {
				return invalid("tag sets cannot be combined with mode primary".to_string());
			}
		}
		
		if let Some(max_staleness) = self.max_staleness {
			let smallest = SMALLEST_MAX_STALENESS.max(heartbeat_frequency + IDLE_WRITE_PERIOD);
			if max_staleness < smallest {
				return invalid(format!("maxStalenessSeconds must be at least {}s", smallest.as_secs()));
			}
		}
		
		Ok(())
	}
	
	/// The `$readPreference` document sent to mongos.
	pub fn to_document(&self) -> Document {
		let mut doc = doc! { "mode": self.mode.as_str() };
		
		if !self.tag_sets.is_empty() {
			doc.insert("tags", self.tag_sets.iter()
				.map(|set| Bson::Document(set.iter()
					.map(|(k, v)| (k.clone(), Bson::String(v.clone())))
					.collect()))
				.collect::<Vec<_>>());
		}
		
		if let Some(max_staleness) = self.max_staleness {
			doc.insert("maxStalenessSeconds", max_staleness.as_secs() as i64);
		}
		
		doc
	}
}

impl Default for ReadPreference {
	fn default() -> Self {
		Self::primary()
	}
}

#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub enum ReadPreferenceMode {
	Primary,
	PrimaryPreferred,
	Secondary,
	SecondaryPreferred,
	Nearest
}

impl ReadPreferenceMode {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Primary            => "primary",
			Self::PrimaryPreferred   => "primaryPreferred",
			Self::Secondary          => "secondary",
			Self::SecondaryPreferred => "secondaryPreferred",
			Self::Nearest            => "nearest"
		}
	}
}

impl FromStr for ReadPreferenceMode {
	type Err = ();
	
	fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
		Ok(match s {
			"primary"            => Self::Primary,
			"primaryPreferred"   => Self::PrimaryPreferred,
			"secondary"          => Self::Secondary,
			"secondaryPreferred" => Self::SecondaryPreferred,
			"nearest"            => Self::Nearest,
			_ => return Err(())
		})
	}
}

#[cfg(feature = "tls")]
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct TlsOptions {
	pub ca_file:              Option<PathBuf>,
	/// A PEM file holding the client certificate chain and its PKCS#8 private key.
	pub certificate_key_file: Option<PathBuf>
}
