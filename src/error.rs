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

//! Errors and their classification.
//!
//! Every failure that leaves this crate is an [`Error`]. The retry and discovery logic only ever
//! looks at an error through the classification methods below, never at the variant directly.

use {
	crate::common::{ClientOptionsParseError, ServerAddress},
	bson::{Bson, Document},
	std::{fmt, io, sync::{Arc, PoisonError}},
	thiserror::Error as ThisError
};

pub const RETRYABLE_WRITE_ERROR:       &str = "RetryableWriteError";
pub const TRANSIENT_TRANSACTION_ERROR: &str = "TransientTransactionError";

/// Servers before 4.4 do not attach `RetryableWriteError` labels themselves.
const RETRYABLE_WRITE_LABEL_WIRE_VERSION: i32 = 9;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, ThisError)]
pub enum Error {
	#[error("invalid client options: {0}")]
	InvalidOptions(ClientOptionsParseError),
	#[error("a lock was poisoned")]
	Sync,
	#[error("network error: {0}")]
	Network(Arc<io::Error>),
	#[error("invalid reply: {0}")]
	InvalidReply(String),
	#[error("bson codec error: {0}")]
	Codec(String),
	#[error("command failed: {0}")]
	Command(CommandError),
	#[error("write concern failed: {0}")]
	WriteConcern(CommandError),
	#[error("timed out waiting for a connection to {address}")]
	PoolTimeout { address: ServerAddress },
	#[error("the connection pool for {address} is closed")]
	PoolClosed { address: ServerAddress },
	#[error("server selection timed out: {message}")]
	ServerSelectionTimeout { message: String },
	#[error("incompatible topology: {0}")]
	IncompatibleTopology(String),
	#[error("the operation exceeded its time limit")]
	Timeout,
	#[error("the client was closed")]
	Closed,
	#[error("retry failed; first attempt: {first}; second attempt: {second}")]
	RetryFailed { first: Box<Attempt>, second: Box<Attempt> }
}

/// The coarse failure taxonomy callers can branch on.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum FailureClass {
	/// The server could not be reached or the connection broke.
	Connectivity,
	/// The server answered with an error.
	ServerRejection,
	/// A pool, selection or operation deadline ran out.
	Exhaustion,
	/// Invalid usage or configuration.
	Client
}

/// One attempt of a retried operation.
#[derive(Debug, Clone)]
pub struct Attempt {
	pub address: Option<ServerAddress>,
	pub error:   Error
}

impl fmt::Display for Attempt {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match &self.address {
			Some(address) => write!(f, "{} (on {})", self.error, address),
			None          => write!(f, "{} (no server selected)", self.error)
		}
	}
}

impl Error {
	pub fn network(kind: io::ErrorKind, message: impl Into<String>) -> Self {
		Self::Network(Arc::new(io::Error::new(kind, message.into())))
	}
	
	pub fn failure_class(&self) -> FailureClass {
		match self {
			Self::Network(_) | Self::InvalidReply(_)  => FailureClass::Connectivity,
			Self::Command(_) | Self::WriteConcern(_)  => FailureClass::ServerRejection,
			Self::PoolTimeout { .. }
			| Self::ServerSelectionTimeout { .. }
			| Self::Timeout                           => FailureClass::Exhaustion,
			Self::RetryFailed { second, .. }          => second.error.failure_class(),
			_                                         => FailureClass::Client
		}
	}
	
	pub fn is_network_error(&self) -> bool {
		matches!(self, Self::Network(_))
	}
	
	pub fn is_network_timeout(&self) -> bool {
		matches!(self, Self::Network(e) if e.kind() == io::ErrorKind::TimedOut || e.kind() == io::ErrorKind::WouldBlock)
	}
	
	pub fn command_error(&self) -> Option<&CommandError> {
		match self {
			Self::Command(e) | Self::WriteConcern(e) => Some(e),
			Self::RetryFailed { second, .. }         => second.error.command_error(),
			_                                        => None
		}
	}
	
	pub fn code(&self) -> Option<ErrorCode> {
		self.command_error().map(|e| e.code)
	}
	
	pub fn contains_label(&self, label: &str) -> bool {
		self.command_error().map_or(false, |e| e.labels.iter().any(|l| l == label))
	}
	
	/// The server is no longer (or not yet) the primary.
	pub fn is_not_primary(&self) -> bool {
		self.code().map_or(false, ErrorCode::is_not_primary)
	}
	
	/// The server is in the middle of a state transition or shutting down.
	pub fn is_recovering(&self) -> bool {
		self.code().map_or(false, ErrorCode::is_recovering)
	}
	
	pub fn is_state_change_error(&self) -> bool {
		self.is_not_primary() || self.is_recovering()
	}
	
	pub fn is_shutting_down(&self) -> bool {
		matches!(self.code(), Some(ErrorCode::InterruptedAtShutdown) | Some(ErrorCode::ShutdownInProgress))
	}
	
	/// Deadline and capacity exhaustion is never retried.
	fn is_exhaustion(&self) -> bool {
		self.failure_class() == FailureClass::Exhaustion
	}
	
	pub fn is_read_retryable(&self) -> bool {
		match self {
			_ if self.is_exhaustion()       => false,
			Self::Network(_)                => true,
			Self::PoolClosed { .. }         => true,
			Self::Command(e)                => e.code.is_retryable(),
			_                               => false
		}
	}
	
	/// `max_wire_version` is that of the server the write failed on.
	pub fn is_write_retryable(&self, max_wire_version: i32) -> bool {
		match self {
			_ if self.is_exhaustion()       => false,
			Self::Network(_)                => true,
			Self::PoolClosed { .. }         => true,
			Self::Command(e) | Self::WriteConcern(e) => e.has_label(RETRYABLE_WRITE_ERROR)
				|| (max_wire_version < RETRYABLE_WRITE_LABEL_WIRE_VERSION && e.code.is_retryable()),
			_                               => false
		}
	}
}

impl From<ClientOptionsParseError> for Error {
	fn from(e: ClientOptionsParseError) -> Self {
		Self::InvalidOptions(e)
	}
}

impl From<io::Error> for Error {
	fn from(e: io::Error) -> Self {
		Self::Network(Arc::new(e))
	}
}

impl<T> From<PoisonError<T>> for Error {
	fn from(_: PoisonError<T>) -> Self {
		Self::Sync
	}
}

impl From<bson::ser::Error> for Error {
	fn from(e: bson::ser::Error) -> Self {
		Self::Codec(e.to_string())
	}
}

impl From<bson::de::Error> for Error {
	fn from(e: bson::de::Error) -> Self {
		Self::Codec(e.to_string())
	}
}

/// An error reply (`ok: 0`) or a write concern error returned by the server.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandError {
	pub code:      ErrorCode,
	pub code_name: Option<String>,
	pub message:   String,
	pub labels:    Vec<String>
}

impl CommandError {
	pub fn new(code: impl Into<ErrorCode>, message: impl Into<String>) -> Self {
		Self { code: code.into(), code_name: None, message: message.into(), labels: Vec::new() }
	}
	
	pub fn with_label(mut self, label: impl Into<String>) -> Self {
		self.labels.push(label.into());
		self
	}
	
	pub fn has_label(&self, label: &str) -> bool {
		self.labels.iter().any(|l| l == label)
	}
	
	/// Reads `code`, `codeName`, `errmsg` from `doc` and the labels from `labels`.
	pub(crate) fn from_document(doc: &Document, labels: &Document) -> Self {
		Self {
			code:      ErrorCode::from(number(doc, "code").unwrap_or(0.0) as i32),
			code_name: doc.get_str("codeName").ok().map(str::to_string),
			message:   doc.get_str("errmsg").unwrap_or_default().to_string(),
			labels:    labels.get_array("errorLabels")
				.map(|labels| labels.iter().filter_map(Bson::as_str).map(str::to_string).collect())
				.unwrap_or_default()
		}
	}
}

impl fmt::Display for CommandError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match &self.code_name {
			Some(name) => write!(f, "{} ({} {})", self.message, self.code.code(), name),
			None       => write!(f, "{} ({:?})", self.message, self.code)
		}
	}
}

/// Reads a numeric field regardless of its BSON number type.
pub(crate) fn number(doc: &Document, key: &str) -> Option<f64> {
	match doc.get(key)? {
		Bson::Double(v) => Some(*v),
		Bson::Int32(v)  => Some(f64::from(*v)),
		Bson::Int64(v)  => Some(*v as f64),
		_               => None
	}
}

macro_rules! error_codes {
	($($name:ident = $code:literal),* $(,)?) => {
		/// Server error codes this crate reacts to. Anything else is kept as `Other`.
		#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
		pub enum ErrorCode {
			$($name,)*
			Other(i32)
		}
		
		impl ErrorCode {
			pub fn code(self) -> i32 {
				match self {
					$(Self::$name => $code,)*
					Self::Other(code) => code
				}
			}
		}
		
		impl From<i32> for ErrorCode {
			fn from(v: i32) -> Self {
				match v {
					$($code => Self::$name,)*
					v => Self::Other(v)
				}
			}
		}
	};
}

error_codes! {
	HostUnreachable                   = 6,
	HostNotFound                      = 7,
	Unauthorized                      = 13,
	IllegalOperation                  = 20,
	MaxTimeMSExpired                  = 50,
	WriteConcernFailed                = 64,
	NetworkTimeout                    = 89,
	ShutdownInProgress                = 91,
	UnsatisfiableWriteConcern         = 100,
	ReadConcernMajorityNotAvailableYet= 134,
	PrimarySteppedDown                = 189,
	ExceededTimeLimit                 = 262,
	SocketException                   = 9001,
	LegacyNotPrimary                  = 10058,
	NotWritablePrimary                = 10107,
	InterruptedAtShutdown             = 11600,
	InterruptedDueToReplStateChange   = 11602,
	NotPrimaryNoSecondaryOk           = 13435,
	NotPrimaryOrSecondary             = 13436,
}

impl ErrorCode {
	pub fn is_not_primary(self) -> bool {
		matches!(self, Self::NotWritablePrimary | Self::NotPrimaryNoSecondaryOk | Self::LegacyNotPrimary)
	}
	
	pub fn is_recovering(self) -> bool {
		matches!(self, Self::InterruptedAtShutdown | Self::InterruptedDueToReplStateChange
			| Self::NotPrimaryOrSecondary | Self::PrimarySteppedDown | Self::ShutdownInProgress)
	}
	
	/// Codes that indicate a transient condition on the server.
	pub fn is_retryable(self) -> bool {
		matches!(self, Self::HostUnreachable | Self::HostNotFound | Self::NetworkTimeout
			| Self::ShutdownInProgress | Self::PrimarySteppedDown | Self::ExceededTimeLimit
			| Self::SocketException | Self::NotWritablePrimary | Self::InterruptedAtShutdown
			| Self::InterruptedDueToReplStateChange | Self::NotPrimaryNoSecondaryOk
			| Self::NotPrimaryOrSecondary | Self::ReadConcernMajorityNotAvailableYet)
	}
}
