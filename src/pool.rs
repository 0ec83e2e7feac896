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

//! Connection pooling.
//!
//! see https://github.com/mongodb/specifications/blob/master/source/connection-monitoring-and-pooling/connection-monitoring-and-pooling.rst

use {
	crate::{
		apm::{ConnectionCheckOutFailedReason, ConnectionClosedReason, Event, EventSink},
		common::{ConnectionPoolOptions, ServerAddress},
		error::{Error, Result},
		utils::{deadline_after, earliest, remaining},
		wire::{Connection, ConnectOptions, Connector, HelloCommand, HelloReply}
	},
	bson::Document,
	std::{
		sync::{Arc, Condvar, Mutex, Weak},
		time::{Duration, Instant}
	},
	log::{debug, info, trace, warn}
};

struct IdleConnection<T> {
	connection: T,
	id:         u32,
	generation: u32,
	since:      Instant
}

struct PoolState<T> {
	generation: u32,
	/// Most recently returned last.
	idle:       Vec<IdleConnection<T>>,
	/// Idle, checked out and currently connecting.
	total:      usize,
	next_id:    u32,
	closed:     bool
}

impl<T> PoolState<T> {
	fn next_id(&mut self) -> u32 {
		self.next_id += 1;
		self.next_id
	}
}

struct PoolInner<C: Connector> {
	address:   ServerAddress,
	connector: Arc<C>,
	options:   ConnectionPoolOptions,
	connect:   Arc<ConnectOptions>,
	events:    EventSink,
	state:     Mutex<PoolState<C::Connection>>,
	available: Condvar
}

enum Checkout<T> {
	Idle(IdleConnection<T>),
	New { id: u32, generation: u32 }
}

/// The connections to one server.
pub struct ConnectionPool<C: Connector>(Arc<PoolInner<C>>);

impl<C: Connector> Clone for ConnectionPool<C> {
	fn clone(&self) -> Self {
		Self(self.0.clone())
	}
}

impl<C: Connector> std::fmt::Debug for ConnectionPool<C> {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		f.debug_struct("ConnectionPool")
			.field("address", &self.0.address)
			.field("generation", &self.generation())
			.field("total", &self.total_connections())
			.field("idle", &self.idle_connections())
			.finish()
	}
}

impl<C: Connector> ConnectionPool<C> {
	pub fn new(
		address:   ServerAddress,
		connector: Arc<C>,
		options:   ConnectionPoolOptions,
		connect:   Arc<ConnectOptions>,
		events:    EventSink
	) -> Result<Self> {
		let inner = Arc::new(PoolInner {
			address,
			connector,
			options,
			connect,
			events,
			state:     Mutex::new(PoolState {
				generation: 0,
				idle:       Vec::with_capacity(options.min_pool_size),
				total:      0,
				next_id:    0,
				closed:     false
			}),
			available: Condvar::new()
		});
		
		let weak = Arc::downgrade(&inner);
		std::thread::Builder::new()
			.name(format!("pool-{}", inner.address))
			.spawn(move || maintain(weak, options.maintenance_interval))?;
		
		info!("pool for {} created", inner.address);
		inner.events.emit_with(|| Event::PoolCreated { address: inner.address.clone() });
		Ok(Self(inner))
	}
	
	pub fn address(&self) -> &ServerAddress {
		&self.0.address
	}
	
	/// Hands out an idle connection or opens a new one, waiting for a free slot until `deadline`
	/// or the wait queue timeout, whichever comes first.
	pub fn checkout(&self, deadline: Option<Instant>) -> Result<PooledConnection<C>> {
		let inner = &self.0;
		let address = &inner.address;
		inner.events.emit_with(|| Event::ConnectionCheckOutStarted { address: address.clone() });
		
		let deadline = earliest(deadline, deadline_after(inner.options.wait_queue_timeout));
		let max_pool_size = inner.options.max_pool_size;
		let mut discarded = Vec::new();
		let mut state = inner.state.lock()?;
		
		let checkout = loop {
			if state.closed {
				break Err(Error::PoolClosed { address: address.clone() });
			}
			
			if let Some(idle) = state.idle.pop() {
				let reason = if idle.generation != state.generation {
					Some(ConnectionClosedReason::Stale)
				} else if inner.options.max_idle_time.map_or(false, |max| idle.since.elapsed() >= max) {
					Some(ConnectionClosedReason::Idle)
				} else if idle.connection.is_broken() {
					Some(ConnectionClosedReason::Error)
				} else {
					None
				};
				
				match reason {
					None => break Ok(Checkout::Idle(idle)),
					Some(reason) => {
						state.total -= 1;
						discarded.push((idle, reason));
						continue;
					}
				}
			}
			
			if max_pool_size == 0 || state.total < max_pool_size {
				state.total += 1;
				break Ok(Checkout::New { id: state.next_id(), generation: state.generation });
			}
			
			state = match deadline {
				Some(deadline) => {
					let timeout = remaining(deadline);
					if timeout == Duration::default() {
						break Err(Error::PoolTimeout { address: address.clone() });
					}
					inner.available.wait_timeout(state, timeout)?.0
				}
				None => inner.available.wait(state)?
			};
		};
		
		drop(state);
		inner.close_all(discarded);
		
		match checkout {
			Ok(Checkout::Idle(idle)) => {
				trace!("checked out connection {} to {}", idle.id, address);
				inner.events.emit_with(|| Event::ConnectionCheckedOut { address: address.clone(), connection_id: idle.id });
				Ok(PooledConnection::new(inner.clone(), idle.connection, idle.id, idle.generation))
			}
			Ok(Checkout::New { id, generation }) => {
				inner.events.emit_with(|| Event::ConnectionCreated { address: address.clone(), connection_id: id });
				
				match inner.connector.connect(address, &inner.connect) {
					Ok(connection) => {
						trace!("opened connection {} to {}", id, address);
						inner.events.emit_with(|| Event::ConnectionReady { address: address.clone(), connection_id: id });
						inner.events.emit_with(|| Event::ConnectionCheckedOut { address: address.clone(), connection_id: id });
						Ok(PooledConnection::new(inner.clone(), connection, id, generation))
					}
					Err(e) => {
						inner.release_slot();
						inner.events.emit_with(|| Event::ConnectionClosed {
							address:       address.clone(),
							connection_id: id,
							reason:        ConnectionClosedReason::Error
						});
						inner.events.emit_with(|| Event::ConnectionCheckOutFailed {
							address: address.clone(),
							reason:  ConnectionCheckOutFailedReason::ConnectionError
						});
						Err(e)
					}
				}
			}
			Err(e) => {
				let reason = match e {
					Error::PoolClosed { .. } => ConnectionCheckOutFailedReason::PoolClosed,
					_                        => ConnectionCheckOutFailedReason::Timeout
				};
				inner.events.emit_with(|| Event::ConnectionCheckOutFailed { address: address.clone(), reason });
				Err(e)
			}
		}
	}
	
	/// Invalidates all connections: idle ones are closed now, checked out ones when they are
	/// returned.
	pub fn clear(&self) -> Result<()> {
		let inner = &self.0;
		let (generation, idle) = {
			let mut state = inner.state.lock()?;
			state.generation += 1;
			let idle = std::mem::take(&mut state.idle);
			state.total -= idle.len();
			(state.generation, idle)
		};
		
		inner.available.notify_all();
		debug!("pool for {} cleared, now at generation {}", inner.address, generation);
		inner.events.emit_with(|| Event::PoolCleared { address: inner.address.clone(), generation });
		inner.close_all(idle.into_iter().map(|c| (c, ConnectionClosedReason::Stale)).collect());
		Ok(())
	}
	
	/// Closes all idle connections and fails all further checkouts. Idempotent.
	pub fn close(&self) -> Result<()> {
		let inner = &self.0;
		let idle = {
			let mut state = inner.state.lock()?;
			if state.closed {
				return Ok(());
			}
			
			state.closed = true;
			let idle = std::mem::take(&mut state.idle);
			state.total -= idle.len();
			idle
		};
		
		inner.available.notify_all();
		inner.close_all(idle.into_iter().map(|c| (c, ConnectionClosedReason::PoolClosed)).collect());
		info!("pool for {} closed", inner.address);
		inner.events.emit_with(|| Event::PoolClosed { address: inner.address.clone() });
		Ok(())
	}
	
	pub fn generation(&self) -> u32 {
		self.0.state.lock().map_or(0, |state| state.generation)
	}
	
	pub fn total_connections(&self) -> usize {
		self.0.state.lock().map_or(0, |state| state.total)
	}
	
	pub fn idle_connections(&self) -> usize {
		self.0.state.lock().map_or(0, |state| state.idle.len())
	}
	
	pub fn is_closed(&self) -> bool {
		self.0.state.lock().map_or(true, |state| state.closed)
	}
}

impl<C: Connector> PoolInner<C> {
	fn release_slot(&self) {
		if let Ok(mut state) = self.state.lock() {
			state.total -= 1;
		}
		self.available.notify_one();
	}
	
	/// Drops the connections and reports them closed. Never called with the state locked.
	fn close_all(&self, connections: Vec<(IdleConnection<C::Connection>, ConnectionClosedReason)>) {
		for (idle, reason) in connections {
			let id = idle.id;
			trace!("closing connection {} to {} ({:?})", id, self.address, reason);
			drop(idle.connection);
			self.events.emit_with(|| Event::ConnectionClosed {
				address:       self.address.clone(),
				connection_id: id,
				reason
			});
		}
	}
	
	fn check_in(&self, connection: C::Connection, id: u32, generation: u32, broken: bool) {
		self.events.emit_with(|| Event::ConnectionCheckedIn { address: self.address.clone(), connection_id: id });
		
		let idle = IdleConnection { connection, id, generation, since: Instant::now() };
		let discarded = match self.state.lock() {
			Ok(mut state) => {
				let reason = if state.closed {
					Some(ConnectionClosedReason::PoolClosed)
				} else if generation != state.generation {
					Some(ConnectionClosedReason::Stale)
				} else if broken || idle.connection.is_broken() {
					Some(ConnectionClosedReason::Error)
				} else {
					None
				};
				
				match reason {
					None => {
						state.idle.push(idle);
						None
					}
					Some(reason) => {
						state.total -= 1;
						Some((idle, reason))
					}
				}
			}
			Err(_) => Some((idle, ConnectionClosedReason::Error))
		};
		
		self.available.notify_one();
		self.close_all(discarded.into_iter().collect());
	}
	
	/// Prunes idle connections and opens new ones up to the minimum pool size.
	fn maintain(&self) -> Result<()> {
		let (expired, pending) = {
			let mut state = self.state.lock()?;
			if state.closed {
				return Ok(());
			}
			
			let expired = match self.options.max_idle_time {
				Some(max_idle_time) => {
					let (expired, idle) = std::mem::take(&mut state.idle).into_iter()
						.partition::<Vec<_>, _>(|c| c.since.elapsed() >= max_idle_time);
					state.idle = idle;
					state.total -= expired.len();
					expired
				}
				None => Vec::new()
			};
			
			let mut missing = self.options.min_pool_size.saturating_sub(state.total);
			if self.options.max_pool_size != 0 {
				missing = missing.min(self.options.max_pool_size.saturating_sub(state.total));
			}
			
			state.total += missing;
			let generation = state.generation;
			let pending = (0..missing).map(|_| (state.next_id(), generation)).collect::<Vec<_>>();
			(expired, pending)
		};
		
		self.close_all(expired.into_iter().map(|c| (c, ConnectionClosedReason::Idle)).collect());
		
		let mut pending = pending.into_iter();
		while let Some((id, generation)) = pending.next() {
			self.events.emit_with(|| Event::ConnectionCreated { address: self.address.clone(), connection_id: id });
			
			match self.connector.connect(&self.address, &self.connect) {
				Ok(connection) => {
					self.events.emit_with(|| Event::ConnectionReady { address: self.address.clone(), connection_id: id });
					self.check_in_new(connection, id, generation);
				}
				Err(e) => {
					warn!("failed to open connection to {}: {}", self.address, e);
					self.release_slot();
					self.events.emit_with(|| Event::ConnectionClosed {
						address:       self.address.clone(),
						connection_id: id,
						reason:        ConnectionClosedReason::Error
					});
					
					for _ in pending.by_ref() {
						self.release_slot();
					}
					break;
				}
			}
		}
		
		Ok(())
	}
	
	/// Like `check_in`, but for connections nobody has checked out yet.
	fn check_in_new(&self, connection: C::Connection, id: u32, generation: u32) {
		let idle = IdleConnection { connection, id, generation, since: Instant::now() };
		let discarded = match self.state.lock() {
			Ok(mut state) if !state.closed && state.generation == generation => {
				state.idle.push(idle);
				None
			}
			Ok(mut state) => {
				state.total -= 1;
				Some((idle, ConnectionClosedReason::Stale))
			}
			Err(_) => Some((idle, ConnectionClosedReason::Error))
		};
		
		self.available.notify_one();
		self.close_all(discarded.into_iter().collect());
	}
}

/// Runs until the pool is closed or dropped.
fn maintain<C: Connector>(pool: Weak<PoolInner<C>>, interval: Duration) {
	loop {
		match pool.upgrade() {
			Some(pool) if !pool.state.lock().map_or(true, |state| state.closed) => if let Err(e) = pool.maintain() {
				warn!("maintenance of pool for {} failed: {}", pool.address, e);
			},
			_ => break
		}
		
		std::thread::sleep(interval);
	}
}

/// A checked out connection, returned to its pool when dropped.
pub struct PooledConnection<C: Connector> {
	connection: Option<C::Connection>,
	id:         u32,
	generation: u32,
	broken:     bool,
	pool:       Arc<PoolInner<C>>
}

impl<C: Connector> PooledConnection<C> {
	fn new(pool: Arc<PoolInner<C>>, connection: C::Connection, id: u32, generation: u32) -> Self {
		Self { connection: Some(connection), id, generation, broken: false, pool }
	}
	
	pub fn id(&self) -> u32 {
		self.id
	}
	
	/// The pool generation the connection was created in.
	pub fn generation(&self) -> u32 {
		self.generation
	}
	
	pub fn address(&self) -> &ServerAddress {
		&self.pool.address
	}
	
	/// The connection will be closed instead of returned to the pool.
	pub fn mark_broken(&mut self) {
		self.broken = true;
	}
	
	fn connection(&mut self) -> Result<&mut C::Connection> {
		self.connection.as_mut().ok_or(Error::Closed)
	}
}

impl<C: Connector> Connection for PooledConnection<C> {
	fn hello(&mut self, command: &HelloCommand, timeout: Option<Duration>) -> Result<HelloReply> {
		self.connection()?.hello(command, timeout)
	}
	
	fn run_command(&mut self, command: &Document, timeout: Option<Duration>) -> Result<Document> {
		self.connection()?.run_command(command, timeout)
	}
	
	fn is_broken(&self) -> bool {
		self.broken || self.connection.as_ref().map_or(true, Connection::is_broken)
	}
}

impl<C: Connector> std::fmt::Debug for PooledConnection<C> {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		f.debug_struct("PooledConnection")
			.field("address", &self.pool.address)
			.field("id", &self.id)
			.field("generation", &self.generation)
			.field("broken", &self.broken)
			.finish()
	}
}

impl<C: Connector> Drop for PooledConnection<C> {
	fn drop(&mut self) {
		if let Some(connection) = self.connection.take() {
			self.pool.check_in(connection, self.id, self.generation, self.broken);
		}
	}
}

#[cfg(test)]
mod tests {
	use {super::*, crate::test_util::*, bson::doc};
	
	fn ms(n: u64) -> Duration {
		Duration::from_millis(n)
	}
	
	fn pool_with(connector: &MockConnector, options: ConnectionPoolOptions, events: EventSink) -> ConnectionPool<MockConnector> {
		ConnectionPool::new(
			"a:27017".parse().unwrap(),
			Arc::new(connector.clone()),
			options,
			Arc::new(ConnectOptions::default()),
			events
		).unwrap()
	}
	
	fn up() -> MockConnector {
		let connector = MockConnector::new();
		connector.set_hello("a:27017", standalone());
		connector
	}
	
	#[test]
	fn test_checkout_reuses_idle_connections() {
		let connector = up();
		let pool = pool_with(&connector, ConnectionPoolOptions::default(), EventSink::default());
		
		let mut first = pool.checkout(None).unwrap();
		let second = pool.checkout(None).unwrap();
		assert_eq!((first.id(), second.id()), (1, 2));
		assert_eq!(first.run_command(&doc! { "ping": 1 }, None).unwrap(), doc! { "ok": 1.0 });
		assert_eq!(pool.total_connections(), 2);
		
		drop(second);
		drop(first);
		assert_eq!(pool.idle_connections(), 2);
		
		// last in, first out
		assert_eq!(pool.checkout(None).unwrap().id(), 1);
		assert_eq!(connector.connect_count("a:27017"), 2);
	}
	
	#[test]
	fn test_wait_queue_timeout() {
		let connector = up();
		let options = ConnectionPoolOptions {
			max_pool_size:      1,
			wait_queue_timeout: Some(ms(50)),
			..ConnectionPoolOptions::default()
		};
		let events = EventRecorder::new();
		let pool = pool_with(&connector, options, events.sink());
		
		let held = pool.checkout(None).unwrap();
		let started = Instant::now();
		assert!(matches!(pool.checkout(None), Err(Error::PoolTimeout { .. })));
		assert!(started.elapsed() >= ms(50));
		assert!(events.events().iter().any(|e| matches!(e, Event::ConnectionCheckOutFailed {
			reason: ConnectionCheckOutFailedReason::Timeout, .. })));
		
		drop(held);
	}
	
	#[test]
	fn test_release_wakes_waiter() {
		let connector = up();
		let options = ConnectionPoolOptions { max_pool_size: 1, ..ConnectionPoolOptions::default() };
		let pool = pool_with(&connector, options, EventSink::default());
		
		let held = pool.checkout(None).unwrap();
		let waiter = {
			let pool = pool.clone();
			std::thread::spawn(move || pool.checkout(Some(Instant::now() + ms(2000))).map(|c| c.id()))
		};
		std::thread::sleep(ms(20));
		drop(held);
		assert_eq!(waiter.join().unwrap().unwrap(), 1);
	}
	
	#[test]
	fn test_clear_invalidates_connections() {
		let connector = up();
		let events = EventRecorder::new();
		let pool = pool_with(&connector, ConnectionPoolOptions::default(), events.sink());
		
		let idle = pool.checkout(None).unwrap();
		let held = pool.checkout(None).unwrap();
		drop(idle);
		
		pool.clear().unwrap();
		assert_eq!(pool.generation(), 1);
		assert_eq!(pool.idle_connections(), 0);
		assert_eq!(pool.total_connections(), 1);
		
		drop(held);
		assert_eq!(pool.total_connections(), 0);
		
		let fresh = pool.checkout(None).unwrap();
		assert_eq!(fresh.generation(), 1);
		assert_eq!(fresh.id(), 3);
		
		let stale = events.events().iter().filter(|e| matches!(e, Event::ConnectionClosed {
			reason: ConnectionClosedReason::Stale, .. })).count();
		assert_eq!(stale, 2);
		assert_eq!(events.count("PoolCleared"), 1);
	}
	
	#[test]
	fn test_broken_connections_are_closed() {
		let connector = up();
		let pool = pool_with(&connector, ConnectionPoolOptions::default(), EventSink::default());
		
		let mut marked = pool.checkout(None).unwrap();
		marked.mark_broken();
		drop(marked);
		assert_eq!(pool.total_connections(), 0);
		
		let mut failed = pool.checkout(None).unwrap();
		connector.push_command_result("a:27017", Err(network_error()));
		assert!(failed.run_command(&doc! { "ping": 1 }, None).is_err());
		assert!(failed.is_broken());
		drop(failed);
		assert_eq!(pool.total_connections(), 0);
	}
	
	#[test]
	fn test_close() {
		let connector = up();
		let events = EventRecorder::new();
		let pool = pool_with(&connector, ConnectionPoolOptions::default(), events.sink());
		
		let held = pool.checkout(None).unwrap();
		pool.close().unwrap();
		pool.close().unwrap();
		assert!(pool.is_closed());
		assert!(matches!(pool.checkout(None), Err(Error::PoolClosed { .. })));
		
		drop(held);
		assert_eq!(pool.total_connections(), 0);
		assert_eq!(events.count("PoolClosed"), 1);
		assert!(events.events().iter().any(|e| matches!(e, Event::ConnectionClosed {
			reason: ConnectionClosedReason::PoolClosed, .. })));
	}
	
	#[test]
	fn test_connect_failure() {
		let connector = MockConnector::new();
		connector.set_down("a:27017");
		let events = EventRecorder::new();
		let pool = pool_with(&connector, ConnectionPoolOptions::default(), events.sink());
		
		assert!(pool.checkout(None).unwrap_err().is_network_error());
		assert_eq!(pool.total_connections(), 0);
		assert!(events.events().iter().any(|e| matches!(e, Event::ConnectionCheckOutFailed {
			reason: ConnectionCheckOutFailedReason::ConnectionError, .. })));
	}
	
	#[test]
	fn test_maintenance() {
		let connector = up();
		let options = ConnectionPoolOptions {
			min_pool_size:        2,
			max_idle_time:        Some(ms(30)),
			maintenance_interval: ms(5),
			..ConnectionPoolOptions::default()
		};
		let events = EventRecorder::new();
		let pool = pool_with(&connector, options, events.sink());
		
		assert!(wait_until(ms(1000), || pool.idle_connections() == 2));
		
		// idle connections expire and are replaced
		assert!(wait_until(ms(1000), || events.events().iter().any(|e| matches!(e, Event::ConnectionClosed {
			reason: ConnectionClosedReason::Idle, .. }))));
		assert!(wait_until(ms(1000), || pool.total_connections() == 2));
		assert!(connector.connect_count("a:27017") > 2);
		pool.close().unwrap();
	}
}
