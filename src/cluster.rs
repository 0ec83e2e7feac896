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

//! The owner of all monitors and pools, and the only writer of the topology description.

use {
	crate::{
		apm::{Event, EventSink},
		common::{ClientOptions, ReadPreference, ServerAddress},
		description::ServerDescription,
		error::{Error, Result},
		monitor::{CheckSink, Monitor, MonitorHandle},
		pool::ConnectionPool,
		selection,
		topology::TopologyDescription,
		utils::earliest,
		wire::{ConnectOptions, Connector}
	},
	std::{
		collections::HashMap,
		sync::{Arc, Condvar, Mutex, Weak},
		time::Instant
	},
	log::{debug, info, warn}
};

/// A tracked server: its pool and its monitor.
pub struct Server<C: Connector> {
	pub address: ServerAddress,
	pub pool:    ConnectionPool<C>,
	monitor:     MonitorHandle,
	events:      EventSink
}

impl<C: Connector> Server<C> {
	pub fn request_check(&self) {
		self.monitor.request_check();
	}
	
	fn close(&self) {
		self.monitor.close();
		if let Err(e) = self.pool.close() {
			warn!("failed to close pool for {}: {}", self.address, e);
		}
		self.events.emit_with(|| Event::ServerClosed { address: self.address.clone() });
	}
}

impl<C: Connector> std::fmt::Debug for Server<C> {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		f.debug_struct("Server")
			.field("address", &self.address)
			.field("pool", &self.pool)
			.field("monitor", &self.monitor)
			.finish()
	}
}

impl<C: Connector> Drop for Server<C> {
	fn drop(&mut self) {
		self.monitor.close();
		if let Err(e) = self.pool.close() {
			warn!("failed to close pool for {}: {}", self.address, e);
		}
	}
}

struct ClusterState<C: Connector> {
	description: Arc<TopologyDescription>,
	servers:     HashMap<ServerAddress, Arc<Server<C>>>,
	/// Bumped on every published description.
	version:     u64,
	closed:      bool
}

struct ClusterShared<C: Connector> {
	options:          ClientOptions,
	connector:        Arc<C>,
	connect:          Arc<ConnectOptions>,
	/// Like `connect`, without the socket timeout.
	monitor_connect:  Arc<ConnectOptions>,
	events:           EventSink,
	state:            Mutex<ClusterState<C>>,
	topology_changed: Condvar
}

/// Discovers and tracks a deployment.
pub struct Cluster<C: Connector>(Arc<ClusterShared<C>>);

impl<C: Connector> Clone for Cluster<C> {
	fn clone(&self) -> Self {
		Self(self.0.clone())
	}
}

impl<C: Connector> std::fmt::Debug for Cluster<C> {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		f.debug_tuple("Cluster")
			.field(&self.description().ok())
			.finish()
	}
}

/// Feeds monitor checks back into the cluster without keeping it alive.
struct Updater<C: Connector>(Weak<ClusterShared<C>>);

impl<C: Connector> CheckSink for Updater<C> {
	fn publish(&self, description: ServerDescription) -> bool {
		match self.0.upgrade() {
			Some(shared) => match Cluster(shared).apply(description, false) {
				Ok(tracked) => tracked,
				Err(e) => {
					warn!("failed to apply server description: {}", e);
					false
				}
			},
			None => false
		}
	}
}

impl<C: Connector> Cluster<C> {
	/// Starts monitoring all seeds.
	pub fn new(options: ClientOptions, connector: C, events: EventSink) -> Result<Self> {
		options.validate()?;
		
		let connect = ConnectOptions::new(&options)?;
		// heartbeats are bounded by the connect timeout plus the await time
		let monitor_connect = Arc::new(ConnectOptions { socket_timeout: None, ..connect.clone() });
		let connect = Arc::new(connect);
		let description = Arc::new(TopologyDescription::new(&options));
		let cluster = Self(Arc::new(ClusterShared {
			connector: Arc::new(connector),
			connect,
			monitor_connect,
			events,
			state:            Mutex::new(ClusterState {
				description: description.clone(),
				servers:     HashMap::new(),
				version:     0,
				closed:      false
			}),
			topology_changed: Condvar::new(),
			options
		}));
		
		info!("opening topology {:?} with seeds {:?}", description.r#type, cluster.0.options.hosts);
		cluster.0.events.emit(Event::TopologyOpening);
		cluster.0.events.emit_with(|| Event::TopologyDescriptionChanged {
			previous: Arc::new(TopologyDescription::default()),
			new:      description.clone()
		});
		
		for address in description.servers.keys() {
			cluster.add_server(address)?;
		}
		
		Ok(cluster)
	}
	
	pub fn options(&self) -> &ClientOptions {
		&self.0.options
	}
	
	pub(crate) fn events(&self) -> &EventSink {
		&self.0.events
	}
	
	/// The latest published description.
	pub fn description(&self) -> Result<Arc<TopologyDescription>> {
		Ok(self.0.state.lock()?.description.clone())
	}
	
	pub fn server(&self, address: &ServerAddress) -> Option<Arc<Server<C>>> {
		self.0.state.lock().ok()?.servers.get(address).cloned()
	}
	
	/// Starts a pool and a monitor, unless the address is no longer tracked or already has them.
	fn add_server(&self, address: &ServerAddress) -> Result<()> {
		let shared = &self.0;
		shared.events.emit_with(|| Event::ServerOpening { address: address.clone() });
		
		let server = Arc::new(Server {
			address: address.clone(),
			pool:    ConnectionPool::new(
				address.clone(),
				shared.connector.clone(),
				shared.options.pool_options,
				shared.connect.clone(),
				shared.events.clone()
			)?,
			monitor: Monitor::start(
				address.clone(),
				shared.connector.clone(),
				shared.monitor_connect.clone(),
				shared.options.server_selection_config,
				Box::new(Updater(Arc::downgrade(shared))),
				shared.events.clone()
			)?,
			events:  shared.events.clone()
		});
		
		let rejected = {
			let mut state = shared.state.lock()?;
			if state.closed || !state.description.servers.contains_key(address) || state.servers.contains_key(address) {
				Some(server)
			} else {
				state.servers.insert(address.clone(), server);
				None
			}
		};
		
		if let Some(server) = rejected {
			server.close();
		}
		
		Ok(())
	}
	
	/// Folds an observation into the topology and publishes the result. Returns whether the
	/// server is still tracked.
	///
	/// Pools are cleared if `clear_pool` is set or the observation failed with a network error.
	pub(crate) fn apply(&self, description: ServerDescription, clear_pool: bool) -> Result<bool> {
		let shared = &self.0;
		let address = description.address.clone();
		let clear_pool = clear_pool || description.error.as_ref().map_or(false, Error::is_network_error);
		
		let (previous, current, added, removed, pool) = {
			let mut state = shared.state.lock()?;
			if state.closed || !state.description.servers.contains_key(&address) {
				return Ok(false);
			}
			
			let previous = state.description.clone();
			let mut next = (*previous).clone();
			let change = next.update(description);
			let current = Arc::new(next);
			
			let removed = change.removed.iter()
				.filter_map(|address| state.servers.remove(address))
				.collect::<Vec<_>>();
			
			if let Some(server) = change.possible_primary.as_ref().and_then(|a| state.servers.get(a)) {
				server.request_check();
			}
			
			let pool = state.servers.get(&address)
				.filter(|_| clear_pool)
				.map(|server| server.pool.clone());
			
			state.description = current.clone();
			state.version += 1;
			shared.topology_changed.notify_all();
			(previous, current, change.added, removed, pool)
		};
		
		// the lock is released, everything below may call into event handlers
		
		if let Some(diff) = previous.diff(&current) {
			for (old, new) in diff.changed {
				debug!("{} changed from {:?} to {:?}", new.address, old.r#type, new.r#type);
				shared.events.emit_with(|| Event::ServerDescriptionChanged {
					address:  new.address.clone(),
					previous: Box::new(old.clone()),
					new:      Box::new(new.clone())
				});
			}
			
			shared.events.emit_with(|| Event::TopologyDescriptionChanged {
				previous: previous.clone(),
				new:      current.clone()
			});
		}
		
		if let Some(pool) = pool {
			pool.clear()?;
		}
		
		for server in removed {
			info!("{} was removed from the topology", server.address);
			server.close();
		}
		
		for address in &added {
			self.add_server(address)?;
		}
		
		Ok(current.servers.contains_key(&address))
	}
	
	/// Reacts to an error an operation ran into on a connection of the given pool generation.
	pub fn handle_application_error(&self, address: &ServerAddress, error: &Error, generation: u32) -> Result<()> {
		let server = match self.server(address) {
			Some(server) => server,
			None => return Ok(())
		};
		
		if generation < server.pool.generation() {
			debug!("ignoring error from an outdated connection to {}: {}", address, error);
			return Ok(());
		}
		
		if error.is_network_error() {
			self.apply(ServerDescription::from_error(address.clone(), error.clone()), true)?;
		} else if error.is_state_change_error() {
			self.apply(ServerDescription::from_error(address.clone(), error.clone()), error.is_shutting_down())?;
			server.request_check();
		}
		
		Ok(())
	}
	
	/// Waits until a suitable server is known. `None` as read preference selects for a write.
	///
	/// Fails with `ServerSelectionTimeout` after the server selection timeout or with `Timeout`
	/// if `deadline` passes first.
	pub fn select_server(
		&self,
		read_preference: Option<&ReadPreference>,
		deadline:        Option<Instant>,
		deprioritized:   &[ServerAddress]
	) -> Result<(Arc<Server<C>>, ServerDescription)> {
		let config = &self.0.options.server_selection_config;
		let selection_deadline = Instant::now() + config.server_selection_timeout;
		let wait_until = earliest(deadline, Some(selection_deadline)).unwrap_or(selection_deadline);
		
		loop {
			let (description, version) = {
				let state = self.0.state.lock()?;
				if state.closed {
					return Err(Error::Closed);
				}
				(state.description.clone(), state.version)
			};
			
			if let Some(selected) = selection::select(&description, read_preference, config, deprioritized)? {
				if let Some(server) = self.server(&selected.address) {
					return Ok((server, selected.clone()));
				}
			}
			
			let mut state = self.0.state.lock()?;
			for server in state.servers.values() {
				server.request_check();
			}
			
			while state.version == version && !state.closed {
				let now = Instant::now();
				if now >= wait_until {
					return Err(if wait_until < selection_deadline {
						Error::Timeout
					} else {
						Error::ServerSelectionTimeout {
							message: format!("no {} server available, topology is {}",
								read_preference.map_or("writable", |r| r.mode.as_str()),
								description.summary())
						}
					});
				}
				
				state = self.0.topology_changed.wait_timeout(state, wait_until - now)?.0;
			}
		}
	}
	
	/// Stops all monitors and closes all pools. Idempotent.
	pub fn close(&self) -> Result<()> {
		let servers = {
			let mut state = self.0.state.lock()?;
			if state.closed {
				return Ok(());
			}
			
			state.closed = true;
			state.servers.drain().map(|(_, server)| server).collect::<Vec<_>>()
		};
		
		self.0.topology_changed.notify_all();
		for server in servers {
			server.close();
		}
		
		info!("topology closed");
		self.0.events.emit(Event::TopologyClosed);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use {
		super::*,
		crate::{
			common::{ReadPreferenceMode, ServerMonitoringMode},
			description::{ServerType, TopologyVersion},
			error::{CommandError, ErrorCode},
			test_util::*,
			topology::TopologyType,
			wire::HelloReply
		},
		bson::oid::ObjectId,
		std::time::Duration
	};
	
	const HOSTS: [&str; 3] = ["a:27017", "b:27017", "c:27017"];
	
	fn ms(n: u64) -> Duration {
		Duration::from_millis(n)
	}
	
	fn address(s: &str) -> ServerAddress {
		s.parse().unwrap()
	}
	
	fn elected(reply: HelloReply, election: u8) -> HelloReply {
		let mut bytes = [0u8; 12];
		bytes[11] = election;
		HelloReply { set_version: Some(1), election_id: Some(ObjectId::from_bytes(bytes)), ..reply }
	}
	
	fn replica_set(connector: &MockConnector) {
		connector.set_hello("a:27017", elected(primary("rs", &HOSTS, "a:27017"), 1));
		connector.set_hello("b:27017", secondary("rs", &HOSTS, "b:27017"));
		connector.set_hello("c:27017", secondary("rs", &HOSTS, "c:27017"));
	}
	
	fn server_type(cluster: &Cluster<MockConnector>, host: &str) -> Option<ServerType> {
		cluster.description().unwrap().server(&address(host)).map(|s| s.r#type)
	}
	
	fn discovered(cluster: &Cluster<MockConnector>) -> bool {
		let description = cluster.description().unwrap();
		description.r#type == TopologyType::ReplicaSetWithPrimary
			&& description.servers.values().filter(|s| s.r#type == ServerType::RSSecondary).count() == 2
	}
	
	#[test]
	fn test_discovery_and_failover() {
		let connector = MockConnector::new();
		replica_set(&connector);
		let events = EventRecorder::new();
		let mut options = options(&["a:27017"]);
		options.server_selection_config.server_selection_timeout = ms(300);
		let cluster = Cluster::new(options, connector.clone(), events.sink()).unwrap();
		
		assert!(wait_until(ms(2000), || discovered(&cluster)));
		assert!(cluster.server(&address("c:27017")).is_some());
		assert_eq!(events.count("ServerOpening"), 3);
		
		let (server, description) = cluster.select_server(None, None, &[]).unwrap();
		assert_eq!(server.address, address("a:27017"));
		assert_eq!(description.r#type, ServerType::RSPrimary);
		
		connector.set_down("a:27017");
		assert!(wait_until(ms(2000), || server_type(&cluster, "a:27017") == Some(ServerType::Unknown)));
		assert_eq!(cluster.description().unwrap().r#type, TopologyType::ReplicaSetNoPrimary);
		assert!(matches!(cluster.select_server(None, None, &[]), Err(Error::ServerSelectionTimeout { .. })));
		
		// reads still work
		let secondary = ReadPreference::new(ReadPreferenceMode::Secondary);
		assert!(cluster.select_server(Some(&secondary), None, &[]).is_ok());
		
		connector.set_hello("b:27017", elected(primary("rs", &HOSTS, "b:27017"), 2));
		let (server, _) = cluster.select_server(None, None, &[]).unwrap();
		assert_eq!(server.address, address("b:27017"));
		
		cluster.close().unwrap();
	}
	
	#[test]
	fn test_selection_honors_deadline() {
		let connector = MockConnector::new();
		connector.set_down("a:27017");
		let cluster = Cluster::new(options(&["a:27017"]), connector, EventSink::default()).unwrap();
		
		let started = Instant::now();
		let result = cluster.select_server(None, Some(Instant::now() + ms(50)), &[]);
		assert!(matches!(result, Err(Error::Timeout)));
		assert!(started.elapsed() < ms(900));
		cluster.close().unwrap();
	}
	
	#[test]
	fn test_network_error_clears_pool() {
		let connector = MockConnector::new();
		replica_set(&connector);
		let events = EventRecorder::new();
		let cluster = Cluster::new(options(&HOSTS), connector.clone(), events.sink()).unwrap();
		assert!(wait_until(ms(2000), || discovered(&cluster)));
		
		let server = cluster.server(&address("a:27017")).unwrap();
		let generation = server.pool.generation();
		
		cluster.handle_application_error(&server.address, &network_error(), generation).unwrap();
		assert_eq!(server.pool.generation(), generation + 1);
		
		// a second report from the old generation is ignored
		cluster.handle_application_error(&server.address, &network_error(), generation).unwrap();
		assert_eq!(server.pool.generation(), generation + 1);
		assert_eq!(events.count("PoolCleared"), 1);
		
		// the next heartbeat brings it back
		assert!(wait_until(ms(2000), || server_type(&cluster, "a:27017") == Some(ServerType::RSPrimary)));
		cluster.close().unwrap();
	}
	
	#[test]
	fn test_state_change_error_keeps_pool() {
		let connector = MockConnector::new();
		replica_set(&connector);
		let cluster = Cluster::new(options(&HOSTS), connector.clone(), EventSink::default()).unwrap();
		assert!(wait_until(ms(2000), || discovered(&cluster)));
		
		let server = cluster.server(&address("a:27017")).unwrap();
		let checks = connector.hello_count("a:27017");
		let error = Error::Command(CommandError::new(ErrorCode::NotWritablePrimary, "not primary"));
		cluster.handle_application_error(&server.address, &error, server.pool.generation()).unwrap();
		
		assert_eq!(server.pool.generation(), 0);
		assert!(wait_until(ms(2000), || connector.hello_count("a:27017") > checks));
		
		let shutdown = Error::Command(CommandError::new(ErrorCode::ShutdownInProgress, "shutting down"));
		cluster.handle_application_error(&server.address, &shutdown, server.pool.generation()).unwrap();
		assert_eq!(server.pool.generation(), 1);
		cluster.close().unwrap();
	}
	
	#[test]
	fn test_removed_members_are_closed() {
		let connector = MockConnector::new();
		replica_set(&connector);
		let events = EventRecorder::new();
		let cluster = Cluster::new(options(&HOSTS), connector.clone(), events.sink()).unwrap();
		assert!(wait_until(ms(2000), || discovered(&cluster)));
		
		let c = cluster.server(&address("c:27017")).unwrap();
		let hosts = ["a:27017", "b:27017"];
		connector.set_hello("a:27017", elected(primary("rs", &hosts, "a:27017"), 1));
		connector.set_hello("b:27017", secondary("rs", &hosts, "b:27017"));
		
		assert!(wait_until(ms(2000), || cluster.server(&address("c:27017")).is_none()));
		assert!(c.pool.is_closed());
		assert!(events.events().iter().any(|e| matches!(e, Event::ServerClosed { address } if address.to_string() == "c:27017")));
		cluster.close().unwrap();
	}
	
	#[test]
	fn test_close() {
		let connector = MockConnector::new();
		connector.set_hello("a:27017", standalone());
		let events = EventRecorder::new();
		let cluster = Cluster::new(options(&["a:27017"]), connector, events.sink()).unwrap();
		let server = cluster.server(&address("a:27017")).unwrap();
		
		cluster.close().unwrap();
		cluster.close().unwrap();
		assert!(matches!(cluster.select_server(None, None, &[]), Err(Error::Closed)));
		assert!(server.pool.is_closed());
		assert_eq!(events.count("TopologyClosed"), 1);
		assert_eq!(events.names().first(), Some(&"TopologyOpening"));
	}
	
	#[test]
	fn test_awaited_hellos_ignore_socket_timeout() {
		let connector = MockConnector::new();
		let mut reply = primary("rs", &["a:27017"], "a:27017");
		reply.topology_version = Some(TopologyVersion { process_id: ObjectId::new(), counter: 1 });
		connector.set_hello("a:27017", reply);
		
		let mut options = options(&["a:27017"]);
		options.socket_timeout = Some(ms(10));
		options.server_selection_config.server_monitoring_mode = ServerMonitoringMode::Stream;
		let events = EventRecorder::new();
		let cluster = Cluster::new(options, connector.clone(), events.sink()).unwrap();
		
		let (server, _) = cluster.select_server(None, None, &[]).unwrap();
		assert!(wait_until(ms(2000), || connector.hellos("a:27017").iter().filter(|h| h.is_awaitable()).count() >= 3));
		assert_eq!(events.count("ServerHeartbeatFailed"), 0);
		assert_eq!(server.pool.generation(), 0);
		
		// operation connections still get the socket timeout
		drop(server.pool.checkout(None).unwrap());
		let timeouts = connector.socket_timeouts("a:27017");
		assert!(timeouts.contains(&None));
		assert!(timeouts.contains(&Some(ms(10))));
		cluster.close().unwrap();
	}
}
