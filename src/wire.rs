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

//! The transport seam.
//!
//! Everything above this module talks to servers through [`Connector`] and [`Connection`], which
//! lets the discovery and pooling logic run against scripted transports in tests.
//!
//! see https://github.com/mongodb/specifications/blob/master/source/message/OP_MSG.rst,
//! https://github.com/mongodb/specifications/blob/master/source/compression/OP_COMPRESSED.rst

#![allow(clippy::float_cmp)]

use {
	crate::{
		common::{ClientOptions, ServerAddress},
		description::{ServerType, TopologyVersion},
		error::{number, CommandError, Error, Result}
	},
	bson::{oid::ObjectId, DateTime, Document},
	serde::{Deserialize, Serialize},
	std::{
		collections::HashMap,
		io::{self, Read, Write},
		net::{TcpStream, ToSocketAddrs},
		sync::atomic::{AtomicI32, Ordering},
		time::Duration
	},
	log::trace
};

#[cfg(feature = "tls")]
use std::sync::Arc;
#[cfg(unix)]
use std::os::unix::net::UnixStream;

pub const DRIVER_NAME:      &str = "mongo-sdam";
pub const MIN_WIRE_VERSION: i32  = 6;
pub const MAX_WIRE_VERSION: i32  = 21;
#[cfg(feature = "compress")]
pub const SUPPORTED_COMPRESSORS: &[Compressor] = &[Compressor::Zstd];
#[cfg(not(feature = "compress"))]
pub const SUPPORTED_COMPRESSORS: &[Compressor] = &[];

const HEADER_LEN:             usize = 16;
const COMPRESSION_HEADER_LEN: usize = 9;
const MAX_MESSAGE_LEN:        usize = 48_000_000;
const CHECKSUM_PRESENT:       u32   = 1;

static REQUEST_ID: AtomicI32 = AtomicI32::new(1);

pub fn next_request_id() -> i32 {
	REQUEST_ID.fetch_add(1, Ordering::SeqCst)
}

/// Opens connections to servers.
///
/// `connect` establishes the transport and performs the initial handshake, so a returned
/// connection is ready for commands.
pub trait Connector: Send + Sync + 'static {
	type Connection: Connection;
	
	fn connect(&self, address: &ServerAddress, options: &ConnectOptions) -> Result<Self::Connection>;
}

/// An established, handshaken connection to one server.
pub trait Connection: Send + 'static {
	/// Sends a hello and waits up to `timeout` for the reply.
	fn hello(&mut self, command: &HelloCommand, timeout: Option<Duration>) -> Result<HelloReply>;
	
	/// Runs a command. Replies with `ok: 0` or a write concern error are returned as errors.
	fn run_command(&mut self, command: &Document, timeout: Option<Duration>) -> Result<Document>;
	
	/// `true` once a network error left the connection in an unknown state.
	fn is_broken(&self) -> bool;
}

/// Transport settings shared by monitors and pools.
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
	pub connect_timeout: Duration,
	pub socket_timeout:  Option<Duration>,
	pub app_name:        Option<String>,
	pub compressors:     Vec<Compressor>,
	#[cfg(feature = "tls")]
	pub tls_config:      Option<crate::utils::Opaque<Arc<rustls::ClientConfig>>>
}

impl ConnectOptions {
	pub fn new(options: &ClientOptions) -> Result<Self> {
		Ok(Self {
			connect_timeout: options.connect_timeout,
			socket_timeout:  options.socket_timeout,
			app_name:        options.app_name.clone(),
			compressors:     options.compressors.clone().unwrap_or_default(),
			#[cfg(feature = "tls")]
			tls_config:      match (&options.tls_config, &options.tls_options) {
				(Some(config), _)        => Some(config.clone()),
				(None, Some(tls))        => Some(crate::utils::Opaque(tls_config(tls)?)),
				(None, None)             => None
			}
		})
	}
}

#[cfg(feature = "tls")]
fn tls_config(options: &crate::common::TlsOptions) -> Result<Arc<rustls::ClientConfig>> {
	use {crate::common::ClientOptionsParseError, rustls::internal::pemfile, std::{fs::File, io::BufReader}};
	
	let invalid = |key: &'static str, path: &std::path::Path| Error::from(ClientOptionsParseError::InvalidValue {
		key,
		value: path.display().to_string()
	});
	let mut config = rustls::ClientConfig::new();
	
	if let Some(ca_file) = &options.ca_file {
		config.root_store.add_pem_file(&mut BufReader::new(File::open(ca_file)?))
			.map_err(|_| invalid("tlsCAFile", ca_file))?;
	}
	
	if let Some(key_file) = &options.certificate_key_file {
		let certs = pemfile::certs(&mut BufReader::new(File::open(key_file)?))
			.map_err(|_| invalid("tlsCertificateKeyFile", key_file))?;
		let mut keys = pemfile::pkcs8_private_keys(&mut BufReader::new(File::open(key_file)?))
			.map_err(|_| invalid("tlsCertificateKeyFile", key_file))?;
		
		if keys.is_empty() {
			return Err(invalid("tlsCertificateKeyFile", key_file));
		}
		
		config.set_single_client_cert(certs, keys.remove(0));
	}
	
	Ok(Arc::new(config))
}

#[repr(i32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum OpCode {
	Compressed = 2012,
	Msg        = 2013
}

impl OpCode {
	fn from_i32(v: i32) -> Result<Self> {
		match v {
			2012 => Ok(Self::Compressed),
			2013 => Ok(Self::Msg),
			v    => Err(Error::InvalidReply(format!("unexpected op code {}", v)))
		}
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Header {
	pub message_length: u32,
	pub request_id:     i32,
	pub response_to:    i32,
	pub op_code:        OpCode
}

impl Header {
	fn read(reader: &mut impl Read) -> Result<Self> {
		let mut buf = [0u8; HEADER_LEN];
		reader.read_exact(&mut buf)?;
		Ok(Self {
			message_length: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
			request_id:     i32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
			response_to:    i32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
			op_code:        OpCode::from_i32(i32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]))?
		})
	}
	
	fn copy_to_slice(self, slice: &mut [u8]) {
		slice[0..4].copy_from_slice(&self.message_length.to_le_bytes());
		slice[4..8].copy_from_slice(&self.request_id.to_le_bytes());
		slice[8..12].copy_from_slice(&self.response_to.to_le_bytes());
		slice[12..16].copy_from_slice(&(self.op_code as i32).to_le_bytes());
	}
}

struct CompressionHeader {
	original_opcode:   OpCode,
	uncompressed_size: u32,
	compressor_id:     Compressor
}

impl CompressionHeader {
	fn from_slice(buf: &[u8]) -> Result<Self> {
		Ok(Self {
			original_opcode:   OpCode::from_i32(i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]))?,
			uncompressed_size: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
			compressor_id:     match buf[8] {
				0 => Compressor::Noop,
				1 => Compressor::Snappy,
				2 => Compressor::Zlib,
				3 => Compressor::Zstd,
				v => return Err(Error::InvalidReply(format!("unknown compressor id {}", v)))
			}
		})
	}
	
	fn copy_to_slice(self, slice: &mut [u8]) {
		slice[0..4].copy_from_slice(&(self.original_opcode as i32).to_le_bytes());
		slice[4..8].copy_from_slice(&self.uncompressed_size.to_le_bytes());
		slice[8] = self.compressor_id as u8;
	}
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Compressor {
	Noop   = 0,
	Snappy = 1,
	Zlib   = 2,
	Zstd   = 3
}

impl std::str::FromStr for Compressor {
	type Err = ();
	
	fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
		Ok(match s {
			"noop"   => Self::Noop,
			"snappy" => Self::Snappy,
			"zlib"   => Self::Zlib,
			"zstd"   => Self::Zstd,
			_ => return Err(())
		})
	}
}

impl Serialize for Compressor {
	fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> where
		S: serde::Serializer {
		serializer.serialize_str(match self {
			Self::Noop   => "noop",
			Self::Snappy => "snappy",
			Self::Zlib   => "zlib",
			Self::Zstd   => "zstd"
		})
	}
}

impl<'de> Deserialize<'de> for Compressor {
	fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error> where
		D: serde::Deserializer<'de> {
		Ok(String::deserialize(deserializer)?.parse().unwrap_or(Self::Noop))
	}
}

/// The monitoring and handshake command.
///
/// see https://github.com/mongodb/specifications/blob/master/source/mongodb-handshake/handshake.rst
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloCommand {
	pub is_master:         i32,
	pub hello_ok:          bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub client:            Option<ClientMetadata>,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub compression:       Vec<Compressor>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub topology_version:  Option<TopologyVersion>,
	#[serde(rename = "maxAwaitTimeMS", skip_serializing_if = "Option::is_none")]
	pub max_await_time_ms: Option<i64>,
	#[serde(rename = "$db")]
	pub db:                String
}

impl HelloCommand {
	/// A plain check, answered immediately.
	pub fn check() -> Self {
		Self {
			is_master:         1,
			hello_ok:          true,
			client:            None,
			compression:       Vec::new(),
			topology_version:  None,
			max_await_time_ms: None,
			db:                "admin".to_string()
		}
	}
	
	/// The first command on a new connection.
	pub fn handshake(options: &ConnectOptions) -> Self {
		Self {
			client:      Some(ClientMetadata::new(options.app_name.as_deref())),
			compression: options.compressors.clone(),
			..Self::check()
		}
	}
	
	/// Answered once the server's topology version moves past `topology_version` or after `max_await`.
	pub fn awaitable(topology_version: TopologyVersion, max_await: Duration) -> Self {
		Self {
			topology_version:  Some(topology_version),
			max_await_time_ms: Some(max_await.as_millis() as i64),
			..Self::check()
		}
	}
	
	pub fn is_awaitable(&self) -> bool {
		self.max_await_time_ms.is_some()
	}
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientMetadata {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub application: Option<ApplicationMetadata>,
	pub driver:      DriverMetadata,
	pub os:          OsMetadata
}

impl ClientMetadata {
	pub fn new(app_name: Option<&str>) -> Self {
		Self {
			application: app_name.map(|name| ApplicationMetadata { name: name.to_string() }),
			driver:      DriverMetadata {
				name:    DRIVER_NAME.to_string(),
				version: env!("CARGO_PKG_VERSION").to_string()
			},
			os:          OsMetadata {
				r#type:       std::env::consts::OS.to_string(),
				architecture: std::env::consts::ARCH.to_string()
			}
		}
	}
}

#[derive(Debug, Clone, Serialize)]
pub struct ApplicationMetadata {
	pub name: String
}

#[derive(Debug, Clone, Serialize)]
pub struct DriverMetadata {
	pub name:    String,
	pub version: String
}

#[derive(Debug, Clone, Serialize)]
pub struct OsMetadata {
	#[serde(rename = "type")]
	pub r#type:       String,
	pub architecture: String
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HelloReply {
	pub ok:                              f64,
	pub is_writable_primary:             Option<bool>,
	#[serde(rename = "ismaster")]
	pub is_master:                       Option<bool>,
	pub min_wire_version:                Option<i32>,
	pub max_wire_version:                Option<i32>,
	pub logical_session_timeout_minutes: Option<i64>,
	pub topology_version:                Option<TopologyVersion>,
	pub compression:                     Option<Vec<Compressor>>,
	// sharded instances
	pub msg:                             Option<String>,
	// replica sets
	pub set_name:                        Option<String>,
	pub set_version:                     Option<i32>,
	pub election_id:                     Option<ObjectId>,
	pub secondary:                       Option<bool>,
	pub arbiter_only:                    Option<bool>,
	pub passive:                         Option<bool>,
	pub hidden:                          Option<bool>,
	#[serde(rename = "isreplicaset")]
	pub is_replica_set:                  Option<bool>,
	pub hosts:                           Option<Vec<String>>,
	pub passives:                        Option<Vec<String>>,
	pub arbiters:                        Option<Vec<String>>,
	pub primary:                         Option<String>,
	pub me:                              Option<String>,
	pub tags:                            Option<HashMap<String, String>>,
	pub last_write:                      Option<LastWrite>,
	// errors
	pub errmsg:                          Option<String>,
	pub code:                            Option<i32>,
	pub code_name:                       Option<String>
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastWrite {
	pub last_write_date: DateTime
}

impl HelloReply {
	pub fn is_ok(&self) -> bool {
		self.ok == 1.0
	}
	
	fn is_primary(&self) -> bool {
		self.is_writable_primary.or(self.is_master) == Some(true)
	}
	
	pub fn server_type(&self) -> ServerType {
		let flag = |v: Option<bool>| v == Some(true);
		
		if !self.is_ok() {
			ServerType::Unknown
		} else if self.msg.as_deref() == Some("isdbgrid") {
			ServerType::Mongos
		} else if self.set_name.is_some() {
			if self.is_primary() {
				ServerType::RSPrimary
			} else if flag(self.hidden) {
				ServerType::RSOther
			} else if flag(self.secondary) {
				ServerType::RSSecondary
			} else if flag(self.arbiter_only) {
				ServerType::RSArbiter
			} else {
				ServerType::RSOther
			}
		} else if flag(self.is_replica_set) {
			ServerType::RSGhost
		} else {
			ServerType::Standalone
		}
	}
	
	/// Turns an `ok: 0` reply into an error.
	pub fn into_result(self) -> Result<Self> {
		if self.is_ok() {
			Ok(self)
		} else {
			Err(Error::Command(CommandError {
				code:      self.code.unwrap_or(0).into(),
				code_name: self.code_name,
				message:   self.errmsg.unwrap_or_default(),
				labels:    Vec::new()
			}))
		}
	}
}

/// Splits a raw command reply into success, command error or write concern error.
pub fn check_reply(reply: Document) -> Result<Document> {
	if number(&reply, "ok") != Some(1.0) {
		return Err(Error::Command(CommandError::from_document(&reply, &reply)));
	}
	
	if let Ok(error) = reply.get_document("writeConcernError") {
		return Err(Error::WriteConcern(CommandError::from_document(error, &reply)));
	}
	
	Ok(reply)
}

pub trait Wire: Read + Write + Sized {
	/// Sends a command as an OP_MSG with a single body section.
	fn send(&mut self, request_id: i32, compression: Option<Compressor>, doc: &Document) -> Result<()> {
		let mut buf = vec![0u8; HEADER_LEN + 5];  // flag bits, payload type
		doc.to_writer(&mut buf)?;
		
		match compression {
			None => {
				Header {
					message_length: buf.len() as u32,
					request_id,
					response_to:    0,
					op_code:        OpCode::Msg
				}.copy_to_slice(&mut buf[..HEADER_LEN]);
				
				self.write_all(&buf)?;
			}
			Some(comp) => {
				let body = &buf[HEADER_LEN..];
				let mut buf0 = vec![0u8; HEADER_LEN + COMPRESSION_HEADER_LEN];
				
				match comp {
					Compressor::Noop => buf0.write_all(body)?,
					#[cfg(feature = "compress")]
					Compressor::Zstd => {
						let mut encoder = zstd::Encoder::new(&mut buf0, 0)?;
						encoder.write_all(body)?;
						encoder.finish()?;
					}
					compressor => return Err(Error::Codec(format!("unsupported compressor: {:?}", compressor)))
				}
				
				Header {
					message_length: buf0.len() as u32,
					request_id,
					response_to:    0,
					op_code:        OpCode::Compressed
				}.copy_to_slice(&mut buf0[..HEADER_LEN]);
				
				CompressionHeader {
					original_opcode:   OpCode::Msg,
					uncompressed_size: body.len() as u32,
					compressor_id:     comp
				}.copy_to_slice(&mut buf0[HEADER_LEN..HEADER_LEN + COMPRESSION_HEADER_LEN]);
				
				self.write_all(&buf0)?;
			}
		}
		
		Ok(())
	}
	
	/// Receives the reply to `request_id`.
	fn recv(&mut self, request_id: i32) -> Result<Document> {
		let header = Header::read(self)?;
		let len = (header.message_length as usize).checked_sub(HEADER_LEN)
			.filter(|len| *len <= MAX_MESSAGE_LEN)
			.ok_or_else(|| Error::InvalidReply(format!("invalid message length {}", header.message_length)))?;
		
		let mut buf = vec![0u8; len];
		self.read_exact(&mut buf)?;
		
		if header.response_to != request_id {
			return Err(Error::InvalidReply(format!(
				"expected a response to {}, got one to {}", request_id, header.response_to)));
		}
		
		if header.op_code == OpCode::Compressed {
			if buf.len() < COMPRESSION_HEADER_LEN {
				return Err(Error::InvalidReply("truncated compression header".to_string()));
			}
			
			let data = CompressionHeader::from_slice(&buf)?;
			let compressed = &buf[COMPRESSION_HEADER_LEN..];
			
			if data.original_opcode != OpCode::Msg {
				return Err(Error::InvalidReply("compressed message is not an OP_MSG".to_string()));
			}
			
			buf = match data.compressor_id {
				Compressor::Noop => compressed.to_vec(),
				#[cfg(feature = "compress")]
				Compressor::Zstd => zstd::stream::decode_all(compressed)?,
				compressor => return Err(Error::InvalidReply(format!("unsupported compressor: {:?}", compressor)))
			};
			
			if buf.len() != data.uncompressed_size as usize {
				return Err(Error::InvalidReply("uncompressed size mismatch".to_string()));
			}
		}
		
		if buf.len() < 5 {
			return Err(Error::InvalidReply("truncated message".to_string()));
		}
		
		let flag_bits = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
		let end = if flag_bits & CHECKSUM_PRESENT != 0 { buf.len().saturating_sub(4) } else { buf.len() };
		
		if buf[4] != 0 {
			return Err(Error::InvalidReply(format!("unexpected payload type {}", buf[4])));
		}
		
		Document::from_reader(&buf[5..end.max(5)]).map_err(|e| Error::InvalidReply(e.to_string()))
	}
	
	fn send_recv(&mut self, compression: Option<Compressor>, doc: &Document) -> Result<Document> {
		let request_id = next_request_id();
		self.send(request_id, compression, doc)?;
		self.recv(request_id)
	}
}

impl<T: Read + Write> Wire for T {}

#[allow(clippy::large_enum_variant)]
pub enum Stream {
	Tcp(TcpStream),
	#[cfg(feature = "tls")]
	Tls(Box<rustls::StreamOwned<rustls::ClientSession, TcpStream>>),
	#[cfg(unix)]
	Unix(UnixStream)
}

impl std::fmt::Debug for Stream {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		f.write_str(match self {
			Self::Tcp(..)  => "Stream::Tcp(...)",
			#[cfg(feature = "tls")]
			Self::Tls(..)  => "Stream::Tls(...)",
			#[cfg(unix)]
			Self::Unix(..) => "Stream::Unix(...)"
		})
	}
}

impl Stream {
	/// Connects to a server, trying every resolved address in turn.
	pub fn connect(address: &ServerAddress, options: &ConnectOptions) -> Result<Self> {
		let (host, port) = match address {
			ServerAddress::Tcp { host, port } => (host.as_str(), *port),
			#[cfg(unix)]
			ServerAddress::Unix { path } => return Ok(Self::Unix(UnixStream::connect(path)?)),
			#[cfg(not(unix))]
			ServerAddress::Unix { .. } => return Err(Error::network(
				io::ErrorKind::Unsupported, "unix domain sockets are not supported on this platform"))
		};
		
		let mut last_error = None;
		let mut tcp = None;
		for addr in (host, port).to_socket_addrs()? {
			match TcpStream::connect_timeout(&addr, options.connect_timeout) {
				Ok(stream) => {
					tcp = Some(stream);
					break;
				}
				Err(e) => last_error = Some(e)
			}
		}
		
		let tcp = match (tcp, last_error) {
			(Some(tcp), _)     => tcp,
			(None, Some(e))    => return Err(e.into()),
			(None, None)       => return Err(Error::network(
				io::ErrorKind::NotFound, format!("{} did not resolve to any address", host)))
		};
		tcp.set_nodelay(true)?;
		
		#[cfg(feature = "tls")]
		{
			if let Some(config) = &options.tls_config {
				let dns_name = webpki::DNSNameRef::try_from_ascii_str(host)
					.map_err(|_| Error::network(io::ErrorKind::InvalidInput, format!("invalid DNS name `{}`", host)))?;
				return Ok(Self::Tls(Box::new(rustls::StreamOwned::new(
					rustls::ClientSession::new(config, dns_name), tcp))));
			}
		}
		
		Ok(Self::Tcp(tcp))
	}
	
	pub fn set_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
		match self {
			Self::Tcp(stream) => {
				stream.set_read_timeout(timeout)?;
				stream.set_write_timeout(timeout)?;
			}
			#[cfg(feature = "tls")]
			Self::Tls(stream) => {
				stream.sock.set_read_timeout(timeout)?;
				stream.sock.set_write_timeout(timeout)?;
			}
			#[cfg(unix)]
			Self::Unix(stream) => {
				stream.set_read_timeout(timeout)?;
				stream.set_write_timeout(timeout)?;
			}
		}
		Ok(())
	}
}

impl Read for Stream {
	fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
		match self {
			Self::Tcp(stream)  => stream.read(buf),
			#[cfg(feature = "tls")]
			Self::Tls(stream)  => stream.read(buf),
			#[cfg(unix)]
			Self::Unix(stream) => stream.read(buf)
		}
	}
}

impl Write for Stream {
	fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
		match self {
			Self::Tcp(stream)  => stream.write(buf),
			#[cfg(feature = "tls")]
			Self::Tls(stream)  => stream.write(buf),
			#[cfg(unix)]
			Self::Unix(stream) => stream.write(buf)
		}
	}
	
	fn flush(&mut self) -> io::Result<()> {
		match self {
			Self::Tcp(stream)  => stream.flush(),
			#[cfg(feature = "tls")]
			Self::Tls(stream)  => stream.flush(),
			#[cfg(unix)]
			Self::Unix(stream) => stream.flush()
		}
	}
}

/// Connects over TCP, TLS or Unix domain sockets.
#[derive(Debug, Copy, Clone, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
	type Connection = TcpConnection;
	
	fn connect(&self, address: &ServerAddress, options: &ConnectOptions) -> Result<TcpConnection> {
		let mut connection = TcpConnection {
			address:        address.clone(),
			stream:         Stream::connect(address, options)?,
			compressor:     None,
			socket_timeout: options.socket_timeout,
			broken:         false
		};
		
		let reply = connection.hello(&HelloCommand::handshake(options), Some(options.connect_timeout))?;
		connection.compressor = reply.compression.iter()
			.flatten()
			.find(|c| options.compressors.contains(*c) && SUPPORTED_COMPRESSORS.contains(*c))
			.copied();
		
		trace!("connected to {} (compressor: {:?})", address, connection.compressor);
		Ok(connection)
	}
}

#[derive(Debug)]
pub struct TcpConnection {
	address:        ServerAddress,
	stream:         Stream,
	compressor:     Option<Compressor>,
	socket_timeout: Option<Duration>,
	broken:         bool
}

impl TcpConnection {
	pub fn address(&self) -> &ServerAddress {
		&self.address
	}
	
	fn round_trip(&mut self, doc: &Document, compression: Option<Compressor>, timeout: Option<Duration>) -> Result<Document> {
		let result = self.stream.set_timeout(crate::utils::shortest(timeout, self.socket_timeout))
			.and_then(|_| self.stream.send_recv(compression, doc));
		
		if let Err(Error::Network(_)) | Err(Error::InvalidReply(_)) = &result {
			self.broken = true;
		}
		
		result
	}
}

impl Connection for TcpConnection {
	fn hello(&mut self, command: &HelloCommand, timeout: Option<Duration>) -> Result<HelloReply> {
		let timeout = match command.max_await_time_ms {
			Some(ms) => timeout.map(|t| t + Duration::from_millis(ms as u64)),
			None     => timeout
		};
		// hellos are never compressed
		let reply = self.round_trip(&bson::to_document(command)?, None, timeout)?;
		bson::from_document::<HelloReply>(reply)?.into_result()
	}
	
	fn run_command(&mut self, command: &Document, timeout: Option<Duration>) -> Result<Document> {
		check_reply(self.round_trip(command, self.compressor, timeout)?)
	}
	
	fn is_broken(&self) -> bool {
		self.broken
	}
}
