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

//! Runs operations with at most one retry.
//!
//! see https://github.com/mongodb/specifications/blob/master/source/retryable-writes/retryable-writes.rst,
//! https://github.com/mongodb/specifications/blob/master/source/retryable-reads/retryable-reads.rst

use {
	crate::{
		apm::Event,
		cluster::Cluster,
		common::{ClientOptions, ReadPreference, ReadPreferenceMode, ServerAddress},
		description::ServerDescription,
		error::{Attempt, Error, Result},
		utils::{deadline_after, remaining},
		wire::{Connection, Connector}
	},
	bson::Document,
	std::{
		sync::atomic::{AtomicI64, AtomicU64, Ordering},
		time::{Duration, Instant}
	},
	log::{debug, warn}
};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Retryability {
	None,
	Read,
	Write
}

impl Retryability {
	fn with_options(self, options: &ClientOptions) -> Self {
		match self {
			Self::Read if !options.retry_reads   => Self::None,
			Self::Write if !options.retry_writes => Self::None,
			other                                => other
		}
	}
	
	fn can_retry(self, error: &Error, max_wire_version: i32) -> bool {
		match self {
			Self::None  => false,
			Self::Read  => error.is_read_retryable(),
			Self::Write => error.is_write_retryable(max_wire_version)
		}
	}
}

/// What an operation knows about the attempt it runs in.
#[derive(Debug)]
pub struct ExecutionContext<'a> {
	pub address:     &'a ServerAddress,
	pub description: &'a ServerDescription,
	/// Set for retryable writes, the same for both attempts.
	pub txn_number:  Option<i64>,
	/// `1` or `2`.
	pub attempt:     u32,
	pub deadline:    Option<Instant>
}

impl ExecutionContext<'_> {
	/// The time left for I/O, `None` without a deadline.
	pub fn remaining(&self) -> Option<Duration> {
		self.deadline.map(remaining)
	}
}

pub trait Operation {
	type Output;
	
	/// The command name, used in events.
	fn name(&self) -> &str;
	
	fn database(&self) -> &str {
		"admin"
	}
	
	/// `None` for writes, which always go to a primary.
	fn read_preference(&self) -> Option<&ReadPreference> {
		None
	}
	
	fn retryability(&self) -> Retryability {
		Retryability::None
	}
	
	fn execute<T: Connection>(&mut self, connection: &mut T, context: &ExecutionContext<'_>) -> Result<Self::Output>;
}

struct Failure {
	address:   Option<ServerAddress>,
	error:     Error,
	retryable: bool
}

impl Failure {
	fn new(address: ServerAddress, error: Error, retryable: bool) -> Self {
		Self { address: Some(address), error, retryable }
	}
	
	fn fatal(address: Option<ServerAddress>, error: Error) -> Self {
		Self { address, error, retryable: false }
	}
	
	fn into_attempt(self) -> Attempt {
		Attempt { address: self.address, error: self.error }
	}
}

/// Selects a server, checks out a connection and runs operations, retrying once where allowed.
#[derive(Debug)]
pub struct RetryableExecutor<C: Connector> {
	cluster:      Cluster<C>,
	operation_id: AtomicU64,
	request_id:   AtomicU64,
	txn_number:   AtomicI64
}

impl<C: Connector> RetryableExecutor<C> {
	pub fn new(cluster: Cluster<C>) -> Self {
		Self {
			cluster,
			operation_id: AtomicU64::new(1),
			request_id:   AtomicU64::new(1),
			txn_number:   AtomicI64::new(1)
		}
	}
	
	pub fn cluster(&self) -> &Cluster<C> {
		&self.cluster
	}
	
	pub fn execute<O: Operation>(&self, operation: &mut O) -> Result<O::Output> {
		let options = self.cluster.options();
		let deadline = deadline_after(options.timeout);
		let operation_id = self.operation_id.fetch_add(1, Ordering::SeqCst);
		let retryability = operation.retryability().with_options(options);
		let mut txn_number = None;
		
		let first = match self.attempt(operation, retryability, &mut txn_number, deadline, &[], operation_id, 1) {
			Ok(output) => return Ok(output),
			Err(failure) if expired(deadline) && failure.error.is_network_timeout() => return Err(Error::Timeout),
			Err(failure) if expired(deadline) => return Err(failure.error),
			Err(failure) if failure.retryable => failure,
			Err(failure) => return Err(failure.error)
		};
		
		debug!("retrying {} after: {}", operation.name(), first.error);
		
		// the retry avoids the mongos that just failed, if it can
		let deprioritized = first.address.iter().cloned().collect::<Vec<_>>();
		match self.attempt(operation, retryability, &mut txn_number, deadline, &deprioritized, operation_id, 2) {
			Ok(output) => Ok(output),
			Err(second) => Err(Error::RetryFailed {
				first:  Box::new(first.into_attempt()),
				second: Box::new(second.into_attempt())
			})
		}
	}
	
	#[allow(clippy::too_many_arguments)]
	fn attempt<O: Operation>(
		&self,
		operation:     &mut O,
		retryability:  Retryability,
		txn_number:    &mut Option<i64>,
		deadline:      Option<Instant>,
		deprioritized: &[ServerAddress],
		operation_id:  u64,
		attempt:       u32
	) -> std::result::Result<O::Output, Failure> {
		let (server, description) = self.cluster
			.select_server(operation.read_preference(), deadline, deprioritized)
			.map_err(|e| Failure::fatal(None, e))?;
		let address = server.address.clone();
		
		let retryability = match retryability {
			Retryability::Write if !description.supports_retryable_writes() => match txn_number {
				// the write already went out with a transaction number and must not be replayed without it
				Some(_) => return Err(Failure::fatal(Some(address.clone()), Error::IncompatibleTopology(
					format!("{} does not support retryable writes", address)))),
				None    => Retryability::None
			},
			retryability => retryability
		};
		
		if retryability == Retryability::Write && txn_number.is_none() {
			*txn_number = Some(self.txn_number.fetch_add(1, Ordering::SeqCst));
		}
		
		// not even the fastest round trip fits into the remaining budget
		if let Some(deadline) = deadline {
			let budget = remaining(deadline);
			if budget == Duration::default() || budget < description.min_round_trip_time.unwrap_or_default() {
				return Err(Failure::fatal(Some(address), Error::Timeout));
			}
		}
		
		let mut connection = match server.pool.checkout(deadline) {
			Ok(connection) => connection,
			Err(error) => {
				if let Err(e) = self.cluster.handle_application_error(&address, &error, server.pool.generation()) {
					warn!("failed to handle error on {}: {}", address, e);
				}
				
				let retryable = retryability.can_retry(&error, description.max_wire_version);
				return Err(Failure::new(address, error, retryable));
			}
		};
		
		let context = ExecutionContext {
			address:     &address,
			description: &description,
			txn_number:  *txn_number,
			attempt,
			deadline
		};
		
		let events = self.cluster.events();
		let request_id = self.request_id.fetch_add(1, Ordering::SeqCst);
		let connection_id = connection.id();
		events.emit_with(|| Event::CommandStarted {
			address:       address.clone(),
			command_name:  operation.name().to_string(),
			database_name: operation.database().to_string(),
			request_id,
			operation_id,
			connection_id
		});
		
		let start = Instant::now();
		let result = operation.execute(&mut connection, &context);
		let duration = start.elapsed();
		
		match result {
			Ok(output) => {
				events.emit_with(|| Event::CommandSucceeded {
					address:      address.clone(),
					command_name: operation.name().to_string(),
					duration,
					request_id,
					operation_id,
					connection_id
				});
				Ok(output)
			}
			Err(error) => {
				events.emit_with(|| Event::CommandFailed {
					address:      address.clone(),
					command_name: operation.name().to_string(),
					failure:      error.clone(),
					duration,
					request_id,
					operation_id,
					connection_id
				});
				
				if error.is_network_error() {
					connection.mark_broken();
				}
				
				let generation = connection.generation();
				drop(connection);
				
				// running out of the operation's own budget says nothing about the server
				let cancelled = error.is_network_timeout() && expired(deadline);
				if !cancelled {
					if let Err(e) = self.cluster.handle_application_error(&address, &error, generation) {
						warn!("failed to handle error on {}: {}", address, e);
					}
				}
				
				let retryable = retryability.can_retry(&error, description.max_wire_version);
				Err(Failure::new(address, error, retryable))
			}
		}
	}
}

fn expired(deadline: Option<Instant>) -> bool {
	deadline.map_or(false, |deadline| remaining(deadline) == Duration::default())
}

/// Runs a single command document.
#[derive(Debug, Clone)]
pub struct RunCommand {
	pub database:        String,
	pub command:         Document,
	pub read_preference: Option<ReadPreference>,
	pub retryability:    Retryability,
	/// Attached to retryable writes together with the transaction number.
	pub session_id:      Option<Document>
}

impl RunCommand {
	pub fn new(database: impl Into<String>, command: Document) -> Self {
		Self {
			database:        database.into(),
			command,
			read_preference: None,
			retryability:    Retryability::None,
			session_id:      None
		}
	}
	
	pub fn read(mut self, read_preference: ReadPreference) -> Self {
		self.read_preference = Some(read_preference);
		self.retryability = Retryability::Read;
		self
	}
	
	pub fn retryable_write(mut self, session_id: Document) -> Self {
		self.read_preference = None;
		self.retryability = Retryability::Write;
		self.session_id = Some(session_id);
		self
	}
}

impl Operation for RunCommand {
	type Output = Document;
	
	fn name(&self) -> &str {
		self.command.keys().next().map_or("", String::as_str)
	}
	
	fn database(&self) -> &str {
		&self.database
	}
	
	fn read_preference(&self) -> Option<&ReadPreference> {
		self.read_preference.as_ref()
	}
	
	fn retryability(&self) -> Retryability {
		self.retryability
	}
	
	fn execute<T: Connection>(&mut self, connection: &mut T, context: &ExecutionContext<'_>) -> Result<Document> {
		let mut command = self.command.clone();
		command.insert("$db", self.database.clone());
		
		if let (Some(txn_number), Some(session_id)) = (context.txn_number, &self.session_id) {
			command.insert("lsid", session_id.clone());
			command.insert("txnNumber", txn_number);
		}
		
		if let Some(read_preference) = &self.read_preference {
			if read_preference.mode != ReadPreferenceMode::Primary {
				command.insert("$readPreference", read_preference.to_document());
			}
		}
		
		connection.run_command(&command, context.remaining())
	}
}

#[cfg(test)]
mod tests {
	use {
		super::*,
		crate::{
			apm::EventSink,
			error::{CommandError, ErrorCode, FailureClass, RETRYABLE_WRITE_ERROR},
			test_util::*,
			wire::HelloReply
		},
		bson::{doc, oid::ObjectId}
	};
	
	const HOSTS: [&str; 2] = ["a:27017", "b:27017"];
	
	fn elected(reply: HelloReply, election: u8) -> HelloReply {
		let mut bytes = [0u8; 12];
		bytes[11] = election;
		HelloReply { set_version: Some(1), election_id: Some(ObjectId::from_bytes(bytes)), ..reply }
	}
	
	fn setup(events: EventSink) -> (MockConnector, RetryableExecutor<MockConnector>) {
		setup_with(options(&HOSTS), events)
	}
	
	fn setup_with(options: ClientOptions, events: EventSink) -> (MockConnector, RetryableExecutor<MockConnector>) {
		let connector = MockConnector::new();
		connector.set_hello("a:27017", elected(primary("rs", &HOSTS, "a:27017"), 1));
		connector.set_hello("b:27017", secondary("rs", &HOSTS, "b:27017"));
		let cluster = Cluster::new(options, connector.clone(), events).unwrap();
		(connector, RetryableExecutor::new(cluster))
	}
	
	fn insert() -> RunCommand {
		RunCommand::new("test", doc! { "insert": "coll", "documents": [{ "x": 1 }] })
			.retryable_write(doc! { "id": 1 })
	}
	
	/// Fails over from `a` to `b` in the middle of its first attempt.
	struct FailoverInsert {
		connector:   MockConnector,
		new_primary: HelloReply,
		attempts:    Vec<(ServerAddress, Option<i64>, u32)>
	}
	
	impl FailoverInsert {
		fn new(connector: &MockConnector) -> Self {
			Self::to(connector, elected(primary("rs", &HOSTS, "b:27017"), 2))
		}
		
		fn to(connector: &MockConnector, new_primary: HelloReply) -> Self {
			Self { connector: connector.clone(), new_primary, attempts: Vec::new() }
		}
	}
	
	impl Operation for FailoverInsert {
		type Output = Document;
		
		fn name(&self) -> &str {
			"insert"
		}
		
		fn retryability(&self) -> Retryability {
			Retryability::Write
		}
		
		fn execute<T: Connection>(&mut self, connection: &mut T, context: &ExecutionContext<'_>) -> Result<Document> {
			self.attempts.push((context.address.clone(), context.txn_number, context.attempt));
			
			if context.attempt == 1 {
				self.connector.set_down("a:27017");
				self.connector.set_hello("b:27017", self.new_primary.clone());
			}
			
			connection.run_command(&doc! { "insert": "coll" }, context.remaining())
		}
	}
	
	#[test]
	fn test_write_retried_on_new_primary() {
		let events = EventRecorder::new();
		let (connector, executor) = setup(events.sink());
		let mut operation = FailoverInsert::new(&connector);
		
		let reply = executor.execute(&mut operation).unwrap();
		assert_eq!(reply, doc! { "ok": 1.0 });
		
		let attempts = &operation.attempts;
		assert_eq!(attempts.len(), 2);
		assert_eq!(attempts[0].0.to_string(), "a:27017");
		assert_eq!(attempts[1].0.to_string(), "b:27017");
		assert!(attempts[0].1.is_some());
		assert_eq!(attempts[0].1, attempts[1].1);
		assert_eq!((attempts[0].2, attempts[1].2), (1, 2));
		
		assert_eq!(events.count("CommandFailed"), 1);
		assert_eq!(events.count("CommandSucceeded"), 1);
		executor.cluster().close().unwrap();
	}
	
	#[test]
	fn test_run_command_attaches_session() {
		let (connector, executor) = setup(EventSink::default());
		executor.execute(&mut insert()).unwrap();
		executor.execute(&mut insert()).unwrap();
		
		let commands = connector.commands("a:27017");
		assert_eq!(commands.len(), 2);
		assert_eq!(commands[0].get_str("$db").unwrap(), "test");
		assert_eq!(commands[0].get_document("lsid").unwrap(), &doc! { "id": 1 });
		assert_ne!(commands[0].get_i64("txnNumber").unwrap(), commands[1].get_i64("txnNumber").unwrap());
		executor.cluster().close().unwrap();
	}
	
	#[test]
	fn test_second_failure_reports_both_attempts() {
		let (connector, executor) = setup(EventSink::default());
		connector.push_command_result("a:27017", Err(network_error()));
		connector.push_command_result("a:27017", Err(network_error()));
		
		let error = executor.execute(&mut insert()).unwrap_err();
		match &error {
			Error::RetryFailed { first, second } => {
				assert!(first.error.is_network_error());
				assert!(second.error.is_network_error());
				assert_eq!(first.address.as_ref().map(ToString::to_string).as_deref(), Some("a:27017"));
			}
			other => panic!("unexpected error: {:?}", other)
		}
		assert_eq!(error.failure_class(), FailureClass::Connectivity);
		
		let sent = connector.commands("a:27017");
		assert_eq!(sent.len(), 2);
		assert_eq!(sent[0].get_i64("txnNumber").unwrap(), sent[1].get_i64("txnNumber").unwrap());
		executor.cluster().close().unwrap();
	}
	
	#[test]
	fn test_non_retryable_errors_are_returned() {
		let (connector, executor) = setup(EventSink::default());
		connector.push_command_result("a:27017", Err(Error::Command(CommandError::new(2, "bad value"))));
		
		let error = executor.execute(&mut insert()).unwrap_err();
		assert_eq!(error.code(), Some(ErrorCode::Other(2)));
		assert_eq!(connector.commands("a:27017").len(), 1);
		executor.cluster().close().unwrap();
	}
	
	#[test]
	fn test_labelled_errors_are_retried() {
		let (connector, executor) = setup(EventSink::default());
		let error = CommandError::new(ErrorCode::NotWritablePrimary, "not primary").with_label(RETRYABLE_WRITE_ERROR);
		connector.push_command_result("a:27017", Err(Error::Command(error)));
		
		assert!(executor.execute(&mut insert()).is_ok());
		assert_eq!(connector.commands("a:27017").len(), 2);
		executor.cluster().close().unwrap();
	}
	
	#[test]
	fn test_retry_disabled() {
		let mut options = options(&HOSTS);
		options.retry_writes = false;
		let (connector, executor) = setup_with(options, EventSink::default());
		connector.push_command_result("a:27017", Err(network_error()));
		
		assert!(executor.execute(&mut insert()).unwrap_err().is_network_error());
		let commands = connector.commands("a:27017");
		assert_eq!(commands.len(), 1);
		assert!(!commands[0].contains_key("txnNumber"));
		executor.cluster().close().unwrap();
	}
	
	#[test]
	fn test_reads_are_retried() {
		let (connector, executor) = setup(EventSink::default());
		connector.push_command_result("b:27017", Err(network_error()));
		
		let mut find = RunCommand::new("test", doc! { "find": "coll" })
			.read(ReadPreference::new(ReadPreferenceMode::Secondary));
		assert!(executor.execute(&mut find).is_ok());
		
		let commands = connector.commands("b:27017");
		assert_eq!(commands.len(), 2);
		assert_eq!(commands[0].get_document("$readPreference").unwrap(), &doc! { "mode": "secondary" });
		executor.cluster().close().unwrap();
	}
	
	#[test]
	fn test_exhausted_deadline_is_not_retried() {
		let mut options = options(&HOSTS);
		options.timeout = Some(Duration::from_nanos(1));
		let (connector, executor) = setup_with(options, EventSink::default());
		
		assert!(matches!(executor.execute(&mut insert()), Err(Error::Timeout)));
		assert!(connector.commands("a:27017").is_empty());
		executor.cluster().close().unwrap();
	}
	
	#[test]
	fn test_command_events() {
		let events = EventRecorder::new();
		let (_connector, executor) = setup(events.sink());
		executor.execute(&mut RunCommand::new("admin", doc! { "ping": 1 })).unwrap();
		
		let started = events.events().into_iter().find_map(|e| match e {
			Event::CommandStarted { command_name, database_name, operation_id, .. } =>
				Some((command_name, database_name, operation_id)),
			_ => None
		});
		assert_eq!(started, Some(("ping".to_string(), "admin".to_string(), 1)));
		assert_eq!(events.count("CommandSucceeded"), 1);
		executor.cluster().close().unwrap();
	}
	
	#[test]
	fn test_write_not_replayed_without_txn_number() {
		let (connector, executor) = setup(EventSink::default());
		let no_sessions = HelloReply {
			logical_session_timeout_minutes: None,
			..elected(primary("rs", &HOSTS, "b:27017"), 2)
		};
		let mut operation = FailoverInsert::to(&connector, no_sessions);
		
		match executor.execute(&mut operation).unwrap_err() {
			Error::RetryFailed { first, second } => {
				assert!(first.error.is_network_error());
				assert!(matches!(second.error, Error::IncompatibleTopology(_)));
				assert_eq!(second.address.as_ref().map(ToString::to_string).as_deref(), Some("b:27017"));
			}
			other => panic!("unexpected error: {:?}", other)
		}
		
		assert_eq!(operation.attempts.len(), 1);
		assert!(operation.attempts[0].1.is_some());
		assert!(connector.commands("b:27017").is_empty());
		executor.cluster().close().unwrap();
	}
	
	/// Runs until its deadline and then times out on the socket.
	struct DeadlineInsert {
		attempts: u32
	}
	
	impl Operation for DeadlineInsert {
		type Output = Document;
		
		fn name(&self) -> &str {
			"insert"
		}
		
		fn retryability(&self) -> Retryability {
			Retryability::Write
		}
		
		fn execute<T: Connection>(&mut self, _connection: &mut T, context: &ExecutionContext<'_>) -> Result<Document> {
			self.attempts += 1;
			if let Some(remaining) = context.remaining() {
				std::thread::sleep(remaining + Duration::from_millis(1));
			}
			Err(Error::network(std::io::ErrorKind::TimedOut, "read timed out"))
		}
	}
	
	#[test]
	fn test_expired_operation_is_not_retried() {
		let mut options = options(&HOSTS);
		options.timeout = Some(Duration::from_millis(500));
		let (_connector, executor) = setup_with(options, EventSink::default());
		let mut operation = DeadlineInsert { attempts: 0 };
		
		assert!(matches!(executor.execute(&mut operation), Err(Error::Timeout)));
		assert_eq!(operation.attempts, 1);
		
		// the server stays usable
		let a = executor.cluster().server(&"a:27017".parse().unwrap()).unwrap();
		assert_eq!(a.pool.generation(), 0);
		executor.cluster().close().unwrap();
	}
}
