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

//! Topology discovery, server selection, connection pooling and retryable
//! command execution for MongoDB deployments.

#![warn(clippy::all)]
#![forbid(unsafe_code)]

use {
	bson::{doc, Document, Binary, spec::BinarySubtype},
	std::sync::Arc,
	log::warn
};

pub use self::{
	apm::{Event, EventHandler, EventSink},
	cluster::{Cluster, Server},
	common::*,
	description::{ServerDescription, ServerType, TopologyVersion},
	error::{Attempt, CommandError, Error, ErrorCode, FailureClass, Result},
	executor::{ExecutionContext, Operation, Retryability, RetryableExecutor, RunCommand},
	monitor::{MonitorHandle, RttEstimator},
	pool::{ConnectionPool, PooledConnection},
	topology::{TopologyDescription, TopologyType},
	wire::{Connection, Connector, ConnectOptions, TcpConnection, TcpConnector, DRIVER_NAME}
};

pub mod apm;
pub mod cluster;
pub mod common;
pub mod description;
pub mod error;
pub mod executor;
pub mod monitor;
pub mod pool;
pub mod selection;
pub mod topology;
pub mod utils;
pub mod wire;
#[cfg(test)]
mod test_util;

/// Owns a cluster and runs commands against it.
#[derive(Debug)]
pub struct Client<C: Connector = TcpConnector> {
	executor:   RetryableExecutor<C>,
	session_id: Document
}

impl Client {
	pub fn new(options: ClientOptions) -> Result<Self> {
		Self::with_connector(options, TcpConnector, None)
	}
	
	pub fn with_uri_str(uri: &str) -> Result<Self> {
		Self::new(uri.parse()?)
	}
}

impl<C: Connector> Client<C> {
	pub fn with_connector(options: ClientOptions, connector: C, handler: Option<Arc<dyn EventHandler>>) -> Result<Self> {
		let cluster = Cluster::new(options, connector, EventSink::new(handler))?;
		Ok(Self {
			executor:   RetryableExecutor::new(cluster),
			session_id: doc! { "id": Binary { subtype: BinarySubtype::Uuid, bytes: random_uuid().to_vec() } }
		})
	}
	
	pub fn options(&self) -> &ClientOptions {
		self.executor.cluster().options()
	}
	
	pub fn cluster(&self) -> &Cluster<C> {
		self.executor.cluster()
	}
	
	/// The latest topology snapshot.
	pub fn topology(&self) -> Result<Arc<TopologyDescription>> {
		self.executor.cluster().description()
	}
	
	pub fn execute<O: Operation>(&self, operation: &mut O) -> Result<O::Output> {
		self.executor.execute(operation)
	}
	
	/// Runs `command` on `db`. Without a read preference the command is a write and goes to the primary.
	pub fn run_command(
		&self,
		db:        &str,
		command:   Document,
		read:      Option<&ReadPreference>,
		retryable: bool
	) -> Result<Document> {
		let mut operation = RunCommand::new(db, command);
		
		match read {
			Some(read) => {
				operation = operation.read(read.clone());
				if !retryable {
					operation.retryability = Retryability::None;
				}
			}
			None if retryable => operation = operation.retryable_write(self.session_id.clone()),
			None => ()
		}
		
		self.execute(&mut operation)
	}
	
	/// Runs a retryable read with the read preference from the client options.
	pub fn run_read(&self, db: &str, command: Document) -> Result<Document> {
		let read = self.options().read_preference.clone();
		self.execute(&mut RunCommand::new(db, command).read(read))
	}
	
	/// Selects a server the way an operation would, without running anything.
	pub fn select_server(&self, read: Option<&ReadPreference>) -> Result<ServerDescription> {
		let cluster = self.executor.cluster();
		cluster.select_server(read, utils::deadline_after(cluster.options().timeout), &[])
			.map(|(_, description)| description)
	}
	
	pub fn close(&self) -> Result<()> {
		self.executor.cluster().close()
	}
}

impl<C: Connector> Drop for Client<C> {
	fn drop(&mut self) {
		if let Err(e) = self.close() {
			warn!("failed to close client: {}", e);
		}
	}
}

/// A random (version 4) UUID.
fn random_uuid() -> [u8; 16] {
	let mut bytes = rand::random::<[u8; 16]>();
	bytes[6] = (bytes[6] & 0x0f) | 0x40;
	bytes[8] = (bytes[8] & 0x3f) | 0x80;
	bytes
}

#[cfg(test)]
mod tests {
	use {super::*, crate::test_util::*};
	
	fn client(events: &EventRecorder) -> (MockConnector, Client<MockConnector>) {
		let connector = MockConnector::new();
		connector.set_hello("a:27017", primary("rs", &["a:27017"], "a:27017"));
		let client = Client::with_connector(options(&["a:27017"]), connector.clone(), Some(events.handler())).unwrap();
		(connector, client)
	}
	
	#[test]
	fn test_run_command() {
		let events = EventRecorder::new();
		let (connector, client) = client(&events);
		
		let reply = client.run_command("test", doc! { "insert": "coll" }, None, true).unwrap();
		assert_eq!(reply.get_f64("ok").unwrap(), 1.0);
		
		let read = ReadPreference::new(ReadPreferenceMode::PrimaryPreferred);
		client.run_command("test", doc! { "find": "coll" }, Some(&read), true).unwrap();
		
		let commands = connector.commands("a:27017");
		assert_eq!(commands.len(), 2);
		match commands[0].get_document("lsid").unwrap().get("id") {
			Some(bson::Bson::Binary(binary)) => {
				assert_eq!(binary.subtype, BinarySubtype::Uuid);
				assert_eq!(binary.bytes.len(), 16);
			}
			other => panic!("unexpected session id: {:?}", other)
		}
		assert!(commands[0].contains_key("txnNumber"));
		assert!(!commands[1].contains_key("lsid"));
		assert_eq!(commands[1].get_document("$readPreference").unwrap(), &doc! { "mode": "primaryPreferred" });
		
		assert_eq!(events.count("CommandSucceeded"), 2);
	}
	
	#[test]
	fn test_read_uses_configured_read_preference() {
		let connector = MockConnector::new();
		let hosts = ["a:27017", "b:27017"];
		connector.set_hello("a:27017", primary("rs", &hosts, "a:27017"));
		connector.set_hello("b:27017", secondary("rs", &hosts, "b:27017"));
		
		let mut options = "mongodb://a:27017,b:27017/?replicaSet=rs&readPreference=secondary"
			.parse::<ClientOptions>().unwrap();
		options.server_selection_config = self::options(&hosts).server_selection_config;
		let client = Client::with_connector(options, connector.clone(), None).unwrap();
		
		client.run_read("test", doc! { "find": "coll" }).unwrap();
		assert!(connector.commands("a:27017").is_empty());
		let commands = connector.commands("b:27017");
		assert_eq!(commands.len(), 1);
		assert_eq!(commands[0].get_document("$readPreference").unwrap(), &doc! { "mode": "secondary" });
	}
	
	#[test]
	fn test_select_server_and_topology() {
		let events = EventRecorder::new();
		let (_connector, client) = client(&events);
		
		let server = client.select_server(None).unwrap();
		assert_eq!(server.r#type, ServerType::RSPrimary);
		
		let topology = client.topology().unwrap();
		assert_eq!(topology.r#type, TopologyType::ReplicaSetWithPrimary);
		assert_eq!(topology.set_name.as_deref(), Some("rs"));
	}
	
	#[test]
	fn test_drop_closes_cluster() {
		let events = EventRecorder::new();
		let (_connector, client) = client(&events);
		client.select_server(None).unwrap();
		
		drop(client);
		assert_eq!(events.count("TopologyClosed"), 1);
		assert!(events.count("ServerClosed") >= 1);
	}
	
	#[test]
	fn test_random_uuid() {
		let uuid = random_uuid();
		assert_eq!(uuid[6] >> 4, 4);
		assert_eq!(uuid[8] >> 6, 2);
		assert_ne!(random_uuid(), uuid);
	}
	
	#[test]
	fn test_invalid_uri() {
		assert!(matches!(Client::with_uri_str("http://localhost"), Err(Error::InvalidOptions(_))));
	}
}
