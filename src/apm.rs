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

//! Monitoring events.
//!
//! see https://github.com/mongodb/specifications/blob/master/source/server-discovery-and-monitoring/server-discovery-and-monitoring-logging-and-monitoring.rst,
//! https://github.com/mongodb/specifications/blob/master/source/connection-monitoring-and-pooling/connection-monitoring-and-pooling.rst

use {
	crate::{common::ServerAddress, description::ServerDescription, error::Error, topology::TopologyDescription},
	std::{fmt, sync::Arc, time::Duration}
};

/// Receives every event of one client.
///
/// Handlers are called synchronously on the thread that caused the event, never while the
/// topology lock is held.
pub trait EventHandler: Send + Sync {
	fn handle(&self, event: &Event);
}

impl<F: Fn(&Event) + Send + Sync> EventHandler for F {
	fn handle(&self, event: &Event) {
		self(event)
	}
}

#[derive(Clone, Default)]
pub struct EventSink(Option<Arc<dyn EventHandler>>);

impl EventSink {
	pub fn new(handler: Option<Arc<dyn EventHandler>>) -> Self {
		Self(handler)
	}
	
	pub fn is_enabled(&self) -> bool {
		self.0.is_some()
	}
	
	pub fn emit(&self, event: Event) {
		if let Some(handler) = &self.0 {
			handler.handle(&event);
		}
	}
	
	/// Only builds the event if someone listens.
	pub fn emit_with(&self, event: impl FnOnce() -> Event) {
		if let Some(handler) = &self.0 {
			handler.handle(&event());
		}
	}
}

impl fmt::Debug for EventSink {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.write_str(if self.is_enabled() { "EventSink(..)" } else { "EventSink(None)" })
	}
}

#[derive(Debug, Clone)]
pub enum Event {
	TopologyOpening,
	TopologyClosed,
	TopologyDescriptionChanged {
		previous: Arc<TopologyDescription>,
		new:      Arc<TopologyDescription>
	},
	ServerOpening {
		address: ServerAddress
	},
	ServerClosed {
		address: ServerAddress
	},
	ServerDescriptionChanged {
		address:  ServerAddress,
		previous: Box<ServerDescription>,
		new:      Box<ServerDescription>
	},
	ServerHeartbeatStarted {
		address: ServerAddress,
		awaited: bool
	},
	ServerHeartbeatSucceeded {
		address:  ServerAddress,
		duration: Duration,
		awaited:  bool
	},
	ServerHeartbeatFailed {
		address:  ServerAddress,
		duration: Duration,
		failure:  Error,
		awaited:  bool
	},
	CommandStarted {
		address:       ServerAddress,
		command_name:  String,
		database_name: String,
		request_id:    u64,
		operation_id:  u64,
		connection_id: u32
	},
	CommandSucceeded {
		address:       ServerAddress,
		command_name:  String,
		duration:      Duration,
		request_id:    u64,
		operation_id:  u64,
		connection_id: u32
	},
	CommandFailed {
		address:       ServerAddress,
		command_name:  String,
		duration:      Duration,
		failure:       Error,
		request_id:    u64,
		operation_id:  u64,
		connection_id: u32
	},
	PoolCreated {
		address: ServerAddress
	},
	PoolCleared {
		address:    ServerAddress,
		generation: u32
	},
	PoolClosed {
		address: ServerAddress
	},
	ConnectionCreated {
		address:       ServerAddress,
		connection_id: u32
	},
	ConnectionReady {
		address:       ServerAddress,
		connection_id: u32
	},
	ConnectionClosed {
		address:       ServerAddress,
		connection_id: u32,
		reason:        ConnectionClosedReason
	},
	ConnectionCheckOutStarted {
		address: ServerAddress
	},
	ConnectionCheckOutFailed {
		address: ServerAddress,
		reason:  ConnectionCheckOutFailedReason
	},
	ConnectionCheckedOut {
		address:       ServerAddress,
		connection_id: u32
	},
	ConnectionCheckedIn {
		address:       ServerAddress,
		connection_id: u32
	}
}

impl Event {
	pub fn name(&self) -> &'static str {
		match self {
			Self::TopologyOpening                 => "TopologyOpening",
			Self::TopologyClosed                  => "TopologyClosed",
			Self::TopologyDescriptionChanged { .. } => "TopologyDescriptionChanged",
			Self::ServerOpening { .. }            => "ServerOpening",
			Self::ServerClosed { .. }             => "ServerClosed",
			Self::ServerDescriptionChanged { .. } => "ServerDescriptionChanged",
			Self::ServerHeartbeatStarted { .. }   => "ServerHeartbeatStarted",
			Self::ServerHeartbeatSucceeded { .. } => "ServerHeartbeatSucceeded",
			Self::ServerHeartbeatFailed { .. }    => "ServerHeartbeatFailed",
			Self::CommandStarted { .. }           => "CommandStarted",
			Self::CommandSucceeded { .. }         => "CommandSucceeded",
			Self::CommandFailed { .. }            => "CommandFailed",
			Self::PoolCreated { .. }              => "PoolCreated",
			Self::PoolCleared { .. }              => "PoolCleared",
			Self::PoolClosed { .. }               => "PoolClosed",
			Self::ConnectionCreated { .. }        => "ConnectionCreated",
			Self::ConnectionReady { .. }          => "ConnectionReady",
			Self::ConnectionClosed { .. }         => "ConnectionClosed",
			Self::ConnectionCheckOutStarted { .. }=> "ConnectionCheckOutStarted",
			Self::ConnectionCheckOutFailed { .. } => "ConnectionCheckOutFailed",
			Self::ConnectionCheckedOut { .. }     => "ConnectionCheckedOut",
			Self::ConnectionCheckedIn { .. }      => "ConnectionCheckedIn"
		}
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionCheckOutFailedReason {
	PoolClosed,
	Timeout,
	ConnectionError
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionClosedReason {
	/// The pool was cleared since the connection was created.
	Stale,
	Idle,
	Error,
	PoolClosed
}
