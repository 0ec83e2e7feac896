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

//! A scripted in-memory deployment for tests.

use {
	crate::{
		apm::{Event, EventHandler, EventSink},
		common::{ClientOptions, ServerAddress, ServerMonitoringMode},
		error::{Error, Result},
		wire::{Connection, ConnectOptions, Connector, HelloCommand, HelloReply}
	},
	bson::{doc, Document},
	std::{
		collections::{HashMap, VecDeque},
		io,
		sync::{Arc, Mutex},
		time::{Duration, Instant}
	}
};

#[derive(Debug, Default)]
struct MockServer {
	/// `None` while the server is down.
	hello:           Option<HelloReply>,
	/// Bumped whenever the server goes down, which breaks all open connections.
	epoch:           u64,
	command_results: VecDeque<Result<Document>>,
	commands:        Vec<Document>,
	hellos:          Vec<HelloCommand>,
	connects:        usize,
	/// The socket timeout of every connection opened, in order.
	socket_timeouts: Vec<Option<Duration>>
}

/// Connects to servers that exist only in memory.
#[derive(Debug, Clone, Default)]
pub struct MockConnector(Arc<Mutex<HashMap<ServerAddress, MockServer>>>);

impl MockConnector {
	pub fn new() -> Self {
		Self::default()
	}
	
	fn with_server<T>(&self, address: &str, f: impl FnOnce(&mut MockServer) -> T) -> T {
		let address = address.parse::<ServerAddress>().unwrap();
		f(self.0.lock().unwrap().entry(address).or_default())
	}
	
	/// Brings the server up (if it was down) and sets what it answers to hellos.
	pub fn set_hello(&self, address: &str, reply: HelloReply) {
		self.with_server(address, |server| server.hello = Some(reply));
	}
	
	pub fn set_down(&self, address: &str) {
		self.with_server(address, |server| {
			server.hello = None;
			server.epoch += 1;
		});
	}
	
	/// Queues the result of the next command. Without queued results commands answer `ok: 1`.
	pub fn push_command_result(&self, address: &str, result: Result<Document>) {
		self.with_server(address, |server| server.command_results.push_back(result));
	}
	
	pub fn commands(&self, address: &str) -> Vec<Document> {
		self.with_server(address, |server| server.commands.clone())
	}
	
	pub fn hellos(&self, address: &str) -> Vec<HelloCommand> {
		self.with_server(address, |server| server.hellos.clone())
	}
	
	pub fn hello_count(&self, address: &str) -> usize {
		self.with_server(address, |server| server.hellos.len())
	}
	
	pub fn connect_count(&self, address: &str) -> usize {
		self.with_server(address, |server| server.connects)
	}
	
	pub fn socket_timeouts(&self, address: &str) -> Vec<Option<Duration>> {
		self.with_server(address, |server| server.socket_timeouts.clone())
	}
}

impl Connector for MockConnector {
	type Connection = MockConnection;
	
	fn connect(&self, address: &ServerAddress, options: &ConnectOptions) -> Result<MockConnection> {
		let mut servers = self.0.lock()?;
		let server = servers.entry(address.clone()).or_default();
		server.connects += 1;
		server.socket_timeouts.push(options.socket_timeout);
		
		match server.hello {
			Some(_) => Ok(MockConnection {
				address:        address.clone(),
				servers:        self.0.clone(),
				epoch:          server.epoch,
				socket_timeout: options.socket_timeout,
				broken:         false
			}),
			None => Err(network_error())
		}
	}
}

#[derive(Debug)]
pub struct MockConnection {
	address:        ServerAddress,
	servers:        Arc<Mutex<HashMap<ServerAddress, MockServer>>>,
	epoch:          u64,
	socket_timeout: Option<Duration>,
	broken:         bool
}

impl Connection for MockConnection {
	fn hello(&mut self, command: &HelloCommand, _timeout: Option<Duration>) -> Result<HelloReply> {
		let mut servers = self.servers.lock()?;
		let server = servers.entry(self.address.clone()).or_default();
		server.hellos.push(command.clone());
		
		// a quiet server holds awaitable hellos for the full await time
		if let (Some(max_await), Some(socket_timeout)) = (command.max_await_time_ms, self.socket_timeout) {
			if Duration::from_millis(max_await as u64) > socket_timeout {
				self.broken = true;
				return Err(Error::network(io::ErrorKind::TimedOut, "read timed out"));
			}
		}
		
		match &server.hello {
			Some(reply) if server.epoch == self.epoch => reply.clone().into_result(),
			_ => {
				self.broken = true;
				Err(network_error())
			}
		}
	}
	
	fn run_command(&mut self, command: &Document, _timeout: Option<Duration>) -> Result<Document> {
		let mut servers = self.servers.lock()?;
		let server = servers.entry(self.address.clone()).or_default();
		server.commands.push(command.clone());
		
		if server.hello.is_none() || server.epoch != self.epoch {
			self.broken = true;
			return Err(network_error());
		}
		
		let result = server.command_results.pop_front().unwrap_or_else(|| Ok(doc! { "ok": 1.0 }));
		if matches!(&result, Err(e) if e.is_network_error()) {
			self.broken = true;
		}
		result
	}
	
	fn is_broken(&self) -> bool {
		self.broken
	}
}

pub fn network_error() -> Error {
	Error::network(io::ErrorKind::ConnectionReset, "connection reset by mock server")
}

fn strings(hosts: &[&str]) -> Option<Vec<String>> {
	Some(hosts.iter().map(|h| h.to_string()).collect())
}

pub fn standalone() -> HelloReply {
	HelloReply {
		ok:                              1.0,
		is_writable_primary:             Some(true),
		min_wire_version:                Some(0),
		max_wire_version:                Some(17),
		logical_session_timeout_minutes: Some(30),
		..HelloReply::default()
	}
}

pub fn mongos() -> HelloReply {
	HelloReply {
		msg: Some("isdbgrid".to_string()),
		..standalone()
	}
}

pub fn primary(set_name: &str, hosts: &[&str], me: &str) -> HelloReply {
	HelloReply {
		set_name: Some(set_name.to_string()),
		hosts:    strings(hosts),
		me:       Some(me.to_string()),
		..standalone()
	}
}

pub fn secondary(set_name: &str, hosts: &[&str], me: &str) -> HelloReply {
	HelloReply {
		is_writable_primary: Some(false),
		secondary:           Some(true),
		..primary(set_name, hosts, me)
	}
}

/// Options with short intervals so background threads make progress quickly.
pub fn options(hosts: &[&str]) -> ClientOptions {
	let mut options = ClientOptions::with_hosts(hosts.iter().map(|h| h.parse().unwrap()).collect());
	let selection = &mut options.server_selection_config;
	selection.heartbeat_frequency = Duration::from_millis(50);
	selection.min_heartbeat_frequency = Duration::from_millis(5);
	selection.server_selection_timeout = Duration::from_millis(1000);
	selection.server_monitoring_mode = ServerMonitoringMode::Poll;
	options
}

/// Records every event it sees.
#[derive(Debug, Clone, Default)]
pub struct EventRecorder(Arc<Mutex<Vec<Event>>>);

impl EventRecorder {
	pub fn new() -> Self {
		Self::default()
	}
	
	pub fn handler(&self) -> Arc<dyn EventHandler> {
		let events = self.0.clone();
		Arc::new(move |event: &Event| events.lock().unwrap().push(event.clone()))
	}
	
	pub fn sink(&self) -> EventSink {
		EventSink::new(Some(self.handler()))
	}
	
	pub fn events(&self) -> Vec<Event> {
		self.0.lock().unwrap().clone()
	}
	
	pub fn names(&self) -> Vec<&'static str> {
		self.0.lock().unwrap().iter().map(Event::name).collect()
	}
	
	pub fn count(&self, name: &str) -> usize {
		self.names().iter().filter(|n| **n == name).count()
	}
}

/// Polls `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
	let deadline = Instant::now() + timeout;
	while Instant::now() < deadline {
		if condition() {
			return true;
		}
		std::thread::sleep(Duration::from_millis(2));
	}
	condition()
}
