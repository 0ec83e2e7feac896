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
	crate::{common::ServerAddress, error::Error, wire::{HelloReply, MAX_WIRE_VERSION, MIN_WIRE_VERSION}},
	bson::oid::ObjectId,
	serde::{Deserialize, Serialize},
	std::{collections::{BTreeSet, HashMap}, time::{Duration, SystemTime}}
};

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ServerType {
	Standalone,
	Mongos,
	/// Named as primary by another member but not yet checked.
	PossiblePrimary,
	RSPrimary,
	RSSecondary,
	RSArbiter,
	RSOther,
	RSGhost,
	Unknown
}

impl ServerType {
	/// Servers that can answer reads or writes.
	pub fn is_data_bearing(self) -> bool {
		matches!(self, Self::Standalone | Self::Mongos | Self::RSPrimary | Self::RSSecondary)
	}
	
	pub fn is_available(self) -> bool {
		!matches!(self, Self::Unknown | Self::PossiblePrimary)
	}
	
	pub fn is_replica_set_member(self) -> bool {
		matches!(self, Self::RSPrimary | Self::RSSecondary | Self::RSArbiter | Self::RSOther
			| Self::RSGhost | Self::PossiblePrimary)
	}
}

impl Default for ServerType {
	fn default() -> Self {
		ServerType::Unknown
	}
}

/// Orders replies from the same server process.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologyVersion {
	pub process_id: ObjectId,
	pub counter:    i64
}

impl TopologyVersion {
	/// `true` if `self` was produced by the same process before `current`.
	pub fn is_older_than(&self, current: &TopologyVersion) -> bool {
		self.process_id == current.process_id && self.counter < current.counter
	}
}

/// An immutable snapshot of what is known about one server.
///
/// A new description replaces the old one on every heartbeat and every error reported by an
/// operation, descriptions are never modified in place.
#[derive(Debug, Clone)]
pub struct ServerDescription {
	pub address:                         ServerAddress,
	pub r#type:                          ServerType,
	pub set_name:                        Option<String>,
	pub set_version:                     Option<i32>,
	pub election_id:                     Option<ObjectId>,
	pub primary:                         Option<ServerAddress>,
	pub me:                              Option<ServerAddress>,
	pub hosts:                           BTreeSet<ServerAddress>,
	pub passives:                        BTreeSet<ServerAddress>,
	pub arbiters:                        BTreeSet<ServerAddress>,
	pub tags:                            HashMap<String, String>,
	pub min_wire_version:                i32,
	pub max_wire_version:                i32,
	pub logical_session_timeout_minutes: Option<i64>,
	pub topology_version:                Option<TopologyVersion>,
	pub last_write_date:                 Option<SystemTime>,
	pub last_update_time:                Option<SystemTime>,
	pub round_trip_time:                 Option<Duration>,
	pub min_round_trip_time:             Option<Duration>,
	pub error:                           Option<Error>
}

impl ServerDescription {
	/// A server that has not been checked yet.
	pub fn new(address: ServerAddress) -> Self {
		Self {
			address,
			r#type:                          ServerType::Unknown,
			set_name:                        None,
			set_version:                     None,
			election_id:                     None,
			primary:                         None,
			me:                              None,
			hosts:                           BTreeSet::new(),
			passives:                        BTreeSet::new(),
			arbiters:                        BTreeSet::new(),
			tags:                            HashMap::new(),
			min_wire_version:                0,
			max_wire_version:                0,
			logical_session_timeout_minutes: None,
			topology_version:                None,
			last_write_date:                 None,
			last_update_time:                None,
			round_trip_time:                 None,
			min_round_trip_time:             None,
			error:                           None
		}
	}
	
	/// A failed check or operation.
	pub fn from_error(address: ServerAddress, error: Error) -> Self {
		Self {
			last_update_time: Some(SystemTime::now()),
			error:            Some(error),
			..Self::new(address)
		}
	}
	
	pub fn from_reply(
		address:             ServerAddress,
		reply:               HelloReply,
		round_trip_time:     Option<Duration>,
		min_round_trip_time: Option<Duration>
	) -> Self {
		fn addresses(hosts: Option<Vec<String>>) -> BTreeSet<ServerAddress> {
			hosts.unwrap_or_default().iter().filter_map(|host| host.parse().ok()).collect()
		}
		
		Self {
			r#type:                          reply.server_type(),
			set_name:                        reply.set_name,
			set_version:                     reply.set_version,
			election_id:                     reply.election_id,
			primary:                         reply.primary.and_then(|host| host.parse().ok()),
			me:                              reply.me.and_then(|host| host.parse().ok()),
			hosts:                           addresses(reply.hosts),
			passives:                        addresses(reply.passives),
			arbiters:                        addresses(reply.arbiters),
			tags:                            reply.tags.unwrap_or_default(),
			min_wire_version:                reply.min_wire_version.unwrap_or(0),
			max_wire_version:                reply.max_wire_version.unwrap_or(0),
			logical_session_timeout_minutes: reply.logical_session_timeout_minutes,
			topology_version:                reply.topology_version,
			last_write_date:                 reply.last_write.map(|w| w.last_write_date.to_system_time()),
			last_update_time:                Some(SystemTime::now()),
			round_trip_time,
			min_round_trip_time,
			..Self::new(address)
		}
	}
	
	pub fn is_available(&self) -> bool {
		self.r#type.is_available()
	}
	
	/// `hosts ∪ passives ∪ arbiters`
	pub fn known_hosts(&self) -> BTreeSet<ServerAddress> {
		self.hosts.iter()
			.chain(&self.passives)
			.chain(&self.arbiters)
			.cloned()
			.collect()
	}
	
	/// The server reports a `me` that differs from the address it is monitored under.
	pub fn invalid_me(&self) -> bool {
		matches!(&self.me, Some(me) if *me != self.address)
	}
	
	/// Describes why this driver cannot talk to the server, if it cannot.
	pub fn compatibility_error(&self) -> Option<String> {
		if !self.is_available() {
			None
		} else if self.min_wire_version > MAX_WIRE_VERSION {
			Some(format!(
				"server at {} requires wire version {}, but this driver only supports up to {}",
				self.address, self.min_wire_version, MAX_WIRE_VERSION))
		} else if self.max_wire_version < MIN_WIRE_VERSION {
			Some(format!(
				"server at {} reports wire version {}, but this driver requires at least {}",
				self.address, self.max_wire_version, MIN_WIRE_VERSION))
		} else {
			None
		}
	}
	
	/// Retryable writes need sessions, which standalone servers do not offer.
	pub fn supports_retryable_writes(&self) -> bool {
		self.logical_session_timeout_minutes.is_some() && self.r#type != ServerType::Standalone
	}
	
	pub fn matches_tags(&self, tag_set: &HashMap<String, String>) -> bool {
		tag_set.iter().all(|(k, v)| self.tags.get(k) == Some(v))
	}
}

/// Round trip times and timestamps change on every heartbeat and are not significant.
impl PartialEq for ServerDescription {
	fn eq(&self, other: &Self) -> bool {
		self.address == other.address
			&& self.r#type == other.r#type
			&& self.set_name == other.set_name
			&& self.set_version == other.set_version
			&& self.election_id == other.election_id
			&& self.primary == other.primary
			&& self.me == other.me
			&& self.hosts == other.hosts
			&& self.passives == other.passives
			&& self.arbiters == other.arbiters
			&& self.tags == other.tags
			&& self.min_wire_version == other.min_wire_version
			&& self.max_wire_version == other.max_wire_version
			&& self.logical_session_timeout_minutes == other.logical_session_timeout_minutes
			&& self.topology_version == other.topology_version
			&& self.error.as_ref().map(ToString::to_string) == other.error.as_ref().map(ToString::to_string)
	}
}

#[cfg(test)]
mod tests {
	use {super::*, crate::test_util::{mongos, primary, secondary}};
	
	fn address(s: &str) -> ServerAddress {
		s.parse().unwrap()
	}
	
	#[test]
	fn test_from_reply() {
		let mut reply = primary("rs0", &["A:27017", "b:27017"], "a:27017");
		reply.passives = Some(vec!["c:27017".to_string()]);
		reply.set_version = Some(3);
		
		let desc = ServerDescription::from_reply(address("a:27017"), reply, Some(Duration::from_millis(5)), None);
		assert_eq!(desc.r#type, ServerType::RSPrimary);
		assert_eq!(desc.set_name.as_deref(), Some("rs0"));
		assert_eq!(desc.set_version, Some(3));
		assert!(!desc.invalid_me());
		assert!(desc.hosts.contains(&address("a:27017")));
		assert_eq!(desc.known_hosts().len(), 3);
		assert!(desc.last_update_time.is_some());
		assert_eq!(desc.round_trip_time, Some(Duration::from_millis(5)));
		assert!(desc.compatibility_error().is_none());
	}
	
	#[test]
	fn test_invalid_me() {
		let reply = secondary("rs0", &["a:27017", "b:27017"], "b:27017");
		let desc = ServerDescription::from_reply(address("a:27017"), reply, None, None);
		assert!(desc.invalid_me());
	}
	
	#[test]
	fn test_compatibility() {
		let mut reply = mongos();
		reply.min_wire_version = Some(MAX_WIRE_VERSION + 1);
		reply.max_wire_version = Some(MAX_WIRE_VERSION + 2);
		let desc = ServerDescription::from_reply(address("a:27017"), reply, None, None);
		assert!(desc.compatibility_error().unwrap().contains("a:27017"));
		
		let mut reply = mongos();
		reply.max_wire_version = Some(MIN_WIRE_VERSION - 1);
		let desc = ServerDescription::from_reply(address("a:27017"), reply, None, None);
		assert!(desc.compatibility_error().is_some());
		
		let unknown = ServerDescription::new(address("a:27017"));
		assert!(unknown.compatibility_error().is_none());
	}
	
	#[test]
	fn test_equality_ignores_round_trip_time() {
		let a = ServerDescription::from_reply(address("a:27017"), mongos(), Some(Duration::from_millis(1)), None);
		let mut b = a.clone();
		b.round_trip_time = Some(Duration::from_millis(90));
		b.last_update_time = Some(SystemTime::now());
		assert_eq!(a, b);
		b.r#type = ServerType::Unknown;
		assert_ne!(a, b);
	}
	
	#[test]
	fn test_topology_version_order() {
		let process_id = ObjectId::new();
		let older = TopologyVersion { process_id, counter: 1 };
		let newer = TopologyVersion { process_id, counter: 2 };
		let other = TopologyVersion { process_id: ObjectId::new(), counter: 0 };
		assert!(older.is_older_than(&newer));
		assert!(!newer.is_older_than(&older));
		assert!(!other.is_older_than(&newer));
	}
}
