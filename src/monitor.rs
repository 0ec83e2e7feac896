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

//! Server monitoring.
//!
//! see https://github.com/mongodb/specifications/blob/master/source/server-discovery-and-monitoring/server-monitoring.rst

use {
	crate::{
		apm::{Event, EventSink},
		common::{ServerAddress, ServerSelectionConfig},
		description::{ServerDescription, TopologyVersion},
		error::Result,
		wire::{Connection, ConnectOptions, Connector, HelloCommand, HelloReply}
	},
	std::{
		collections::VecDeque,
		sync::{Arc, Condvar, Mutex},
		time::{Duration, Instant}
	},
	log::{debug, info, warn}
};

const RTT_ALPHA:   f64 = 0.2;
const RTT_SAMPLES: usize = 10;

/// Smooths round trip time samples.
#[derive(Debug, Clone, Default)]
pub struct RttEstimator {
	average: Option<Duration>,
	samples: VecDeque<Duration>
}

impl RttEstimator {
	pub fn new() -> Self {
		Self::default()
	}
	
	pub fn add_sample(&mut self, sample: Duration) {
		self.average = Some(match self.average {
			None          => sample,
			Some(average) => Duration::from_nanos((RTT_ALPHA * sample.as_nanos() as f64
				+ (1.0 - RTT_ALPHA) * average.as_nanos() as f64).round() as u64)
		});
		
		if self.samples.len() == RTT_SAMPLES {
			self.samples.pop_front();
		}
		self.samples.push_back(sample);
	}
	
	/// Exponentially weighted moving average, `None` before the first sample.
	pub fn average(&self) -> Option<Duration> {
		self.average
	}
	
	/// The smallest of the recent samples, zero until there are at least two.
	pub fn minimum(&self) -> Duration {
		if self.samples.len() < 2 {
			return Duration::default();
		}
		
		self.samples.iter().min().copied().unwrap_or_default()
	}
	
	pub fn reset(&mut self) {
		self.average = None;
		self.samples.clear();
	}
	
	/// Runs `f` and records how long it took, if it succeeded.
	pub fn measure<T>(&mut self, f: impl FnOnce() -> Result<T>) -> Result<T> {
		let start = Instant::now();
		let value = f()?;
		self.add_sample(start.elapsed());
		Ok(value)
	}
}

/// Receives the outcome of every check.
pub(crate) trait CheckSink: Send + Sync + 'static {
	/// Returns `false` once the server is no longer of interest, which stops the monitor.
	fn publish(&self, description: ServerDescription) -> bool;
}

#[derive(Debug, Default)]
struct MonitorState {
	check_requested: bool,
	streaming:       bool,
	closed:          bool
}

#[derive(Debug)]
struct MonitorShared {
	address: ServerAddress,
	state:   Mutex<MonitorState>,
	condvar: Condvar,
	rtt:     Mutex<RttEstimator>
}

impl MonitorShared {
	fn is_closed(&self) -> Result<bool> {
		Ok(self.state.lock()?.closed)
	}
	
	fn close(&self) {
		if let Ok(mut state) = self.state.lock() {
			state.closed = true;
		}
		self.condvar.notify_all();
	}
	
	fn add_rtt_sample(&self, sample: Duration) {
		if let Ok(mut rtt) = self.rtt.lock() {
			rtt.add_sample(sample);
		}
	}
	
	fn rtt(&self) -> (Option<Duration>, Option<Duration>) {
		match self.rtt.lock() {
			Ok(rtt) => (rtt.average(), Some(rtt.minimum())),
			Err(_)  => (None, None)
		}
	}
}

/// Controls a running monitor. Dropping the handle stops the monitor; it never waits for the
/// thread to finish.
#[derive(Debug)]
pub struct MonitorHandle(Arc<MonitorShared>);

impl MonitorHandle {
	/// Asks for a check as soon as the minimum heartbeat frequency allows.
	pub fn request_check(&self) {
		if let Ok(mut state) = self.0.state.lock() {
			state.check_requested = true;
		}
		self.0.condvar.notify_all();
	}
	
	pub fn close(&self) {
		self.0.close();
	}
	
	pub fn is_closed(&self) -> bool {
		self.0.is_closed().unwrap_or(true)
	}
	
	pub fn is_streaming(&self) -> bool {
		self.0.state.lock().map_or(false, |state| state.streaming)
	}
	
	pub fn round_trip_time(&self) -> Option<Duration> {
		self.0.rtt().0
	}
}

impl Drop for MonitorHandle {
	fn drop(&mut self) {
		self.close();
	}
}

/// Checks one server on a dedicated connection and reports what it finds.
pub(crate) struct Monitor<C: Connector> {
	shared:           Arc<MonitorShared>,
	connector:        Arc<C>,
	options:          Arc<ConnectOptions>,
	config:           ServerSelectionConfig,
	sink:             Box<dyn CheckSink>,
	events:           EventSink,
	connection:       Option<C::Connection>,
	topology_version: Option<TopologyVersion>
}

impl<C: Connector> Monitor<C> {
	pub(crate) fn start(
		address:   ServerAddress,
		connector: Arc<C>,
		options:   Arc<ConnectOptions>,
		config:    ServerSelectionConfig,
		sink:      Box<dyn CheckSink>,
		events:    EventSink
	) -> Result<MonitorHandle> {
		let shared = Arc::new(MonitorShared {
			address,
			state:   Mutex::new(MonitorState::default()),
			condvar: Condvar::new(),
			rtt:     Mutex::new(RttEstimator::new())
		});
		
		let monitor = Self {
			shared: shared.clone(),
			connector,
			options,
			config,
			sink,
			events,
			connection:       None,
			topology_version: None
		};
		
		std::thread::Builder::new()
			.name(format!("monitor-{}", shared.address))
			.spawn(move || monitor.run())?;
		
		Ok(MonitorHandle(shared))
	}
	
	fn run(mut self) {
		info!("monitor for {} started", self.shared.address);
		
		if let Err(e) = self.run_inner() {
			warn!("monitor for {} died: {}", self.shared.address, e);
		}
		
		// also stops the pinger
		self.shared.close();
		info!("monitor for {} stopped", self.shared.address);
	}
	
	fn run_inner(&mut self) -> Result<()> {
		let mut pinger_started = false;
		
		while !self.shared.is_closed()? {
			let started = Instant::now();
			let description = self.check();
			
			let streaming = self.is_streaming();
			self.shared.state.lock()?.streaming = streaming;
			
			if streaming && !pinger_started {
				RttPinger::start(self.shared.clone(), self.connector.clone(), self.options.clone(),
					self.config.heartbeat_frequency)?;
				pinger_started = true;
			}
			
			if !self.sink.publish(description) || !self.wait(streaming, started)? {
				break;
			}
		}
		
		Ok(())
	}
	
	/// The next check can be an awaitable hello.
	fn is_streaming(&self) -> bool {
		self.config.server_monitoring_mode.allows_streaming()
			&& self.connection.is_some()
			&& self.topology_version.is_some()
	}
	
	fn check(&mut self) -> ServerDescription {
		let address = self.shared.address.clone();
		let awaited = self.is_streaming();
		self.events.emit_with(|| Event::ServerHeartbeatStarted { address: address.clone(), awaited });
		
		let start = Instant::now();
		let result = self.hello(awaited);
		let duration = start.elapsed();
		
		match result {
			Ok(reply) => {
				self.topology_version = reply.topology_version.clone();
				self.events.emit_with(|| Event::ServerHeartbeatSucceeded { address: address.clone(), duration, awaited });
				
				let (average, minimum) = self.shared.rtt();
				ServerDescription::from_reply(address, reply, average, minimum)
			}
			Err(error) => {
				warn!("heartbeat to {} failed: {}", address, error);
				self.connection = None;
				self.topology_version = None;
				self.events.emit_with(|| Event::ServerHeartbeatFailed {
					address: address.clone(),
					failure: error.clone(),
					duration,
					awaited
				});
				
				ServerDescription::from_error(address, error)
			}
		}
	}
	
	fn hello(&mut self, awaited: bool) -> Result<HelloReply> {
		let mut connection = match self.connection.take() {
			Some(connection) => connection,
			None => self.connector.connect(&self.shared.address, &self.options)?
		};
		
		let command = match &self.topology_version {
			Some(topology_version) if awaited => HelloCommand::awaitable(
				topology_version.clone(), self.config.heartbeat_frequency),
			_ => HelloCommand::check()
		};
		
		let start = Instant::now();
		let reply = connection.hello(&command, Some(self.options.connect_timeout))?;
		
		// an awaited reply says nothing about the round trip time
		if !awaited {
			self.shared.add_rtt_sample(start.elapsed());
		}
		
		self.connection = Some(connection);
		Ok(reply)
	}
	
	/// Waits for the next check, returns `false` if the monitor was closed meanwhile.
	///
	/// Streaming monitors go again right away (the server holds the reply), but not sooner than
	/// the minimum heartbeat frequency. Polling monitors wait for the heartbeat frequency, or for
	/// the minimum heartbeat frequency if a check was requested.
	fn wait(&self, streaming: bool, last_check: Instant) -> Result<bool> {
		let ServerSelectionConfig { heartbeat_frequency, min_heartbeat_frequency, .. } = self.config;
		let mut state = self.shared.state.lock()?;
		
		loop {
			if state.closed {
				return Ok(false);
			}
			
			let elapsed = last_check.elapsed();
			let wait_for = if streaming {
				state.check_requested = false;
				min_heartbeat_frequency
			} else if state.check_requested {
				min_heartbeat_frequency
			} else {
				heartbeat_frequency
			};
			
			if elapsed >= wait_for {
				state.check_requested = false;
				return Ok(true);
			}
			
			state = self.shared.condvar.wait_timeout(state, wait_for - elapsed)?.0;
		}
	}
}

/// Measures round trip times on a separate connection while the monitor is busy with awaitable
/// hellos.
struct RttPinger<C: Connector> {
	shared:              Arc<MonitorShared>,
	connector:           Arc<C>,
	options:             Arc<ConnectOptions>,
	heartbeat_frequency: Duration,
	connection:          Option<C::Connection>
}

impl<C: Connector> RttPinger<C> {
	fn start(
		shared:              Arc<MonitorShared>,
		connector:           Arc<C>,
		options:             Arc<ConnectOptions>,
		heartbeat_frequency: Duration
	) -> Result<()> {
		let name = format!("rtt-{}", shared.address);
		let pinger = Self { shared, connector, options, heartbeat_frequency, connection: None };
		std::thread::Builder::new()
			.name(name)
			.spawn(move || pinger.run())?;
		Ok(())
	}
	
	fn run(mut self) {
		if let Err(e) = self.run_inner() {
			warn!("rtt pinger for {} died: {}", self.shared.address, e);
		}
	}
	
	fn run_inner(&mut self) -> Result<()> {
		let mut state = self.shared.state.lock()?;
		
		while !state.closed {
			if state.streaming {
				drop(state);
				self.ping();
				state = self.shared.state.lock()?;
			}
			
			if state.closed {
				break;
			}
			
			state = self.shared.condvar.wait_timeout(state, self.heartbeat_frequency)?.0;
		}
		
		Ok(())
	}
	
	fn ping(&mut self) {
		let result = match self.connection.take() {
			Some(connection) => Ok(connection),
			None => self.connector.connect(&self.shared.address, &self.options)
		}.and_then(|mut connection| {
			let start = Instant::now();
			connection.hello(&HelloCommand::check(), Some(self.options.connect_timeout))?;
			Ok((connection, start.elapsed()))
		});
		
		match result {
			Ok((connection, rtt)) => {
				self.shared.add_rtt_sample(rtt);
				self.connection = Some(connection);
			}
			// the monitor reports failures, the next ping reconnects
			Err(e) => debug!("rtt ping to {} failed: {}", self.shared.address, e)
		}
	}
}
