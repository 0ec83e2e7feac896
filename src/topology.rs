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

//! The topology description and the rules that fold server observations into it.
//!
//! see https://github.com/mongodb/specifications/blob/master/source/server-discovery-and-monitoring/server-discovery-and-monitoring.rst

use {
	crate::{
		common::{ClientOptions, ServerAddress},
		description::{ServerDescription, ServerType},
		error::Error
	},
	bson::oid::ObjectId,
	std::collections::{BTreeMap, BTreeSet, HashMap},
	log::debug
};

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum TopologyType {
	Single,
	ReplicaSetNoPrimary,
	ReplicaSetWithPrimary,
	Sharded,
	Unknown
}

impl TopologyType {
	pub fn is_replica_set(self) -> bool {
		matches!(self, Self::ReplicaSetNoPrimary | Self::ReplicaSetWithPrimary)
	}
}

impl Default for TopologyType {
	fn default() -> Self {
		Self::Unknown
	}
}

/// see https://github.com/mongodb/specifications/blob/master/source/server-discovery-and-monitoring/server-discovery-and-monitoring.rst#topologydescription
#[derive(Debug, Clone)]
pub struct TopologyDescription {
	pub r#type:                          TopologyType,
	pub servers:                         HashMap<ServerAddress, ServerDescription>,
	pub set_name:                        Option<String>,
	pub max_set_version:                 Option<i32>,
	pub max_election_id:                 Option<ObjectId>,
	pub logical_session_timeout_minutes: Option<i64>,
	/// The first recorded incompatibility, if any member is incompatible.
	pub compatibility_error:             Option<String>,
	incompatible:                        BTreeMap<ServerAddress, String>,
	expected_set_name:                   Option<String>,
	single_seed:                         bool
}

/// How an update changed the set of tracked servers.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct MembershipChange {
	pub added:            Vec<ServerAddress>,
	pub removed:          Vec<ServerAddress>,
	/// A server that was just marked `PossiblePrimary` and should be checked right away.
	pub possible_primary: Option<ServerAddress>
}

#[derive(Debug)]
pub struct TopologyDiff<'a> {
	pub added:   Vec<&'a ServerAddress>,
	pub removed: Vec<&'a ServerAddress>,
	/// `(old, new)` for servers present in both with differing descriptions.
	pub changed: Vec<(&'a ServerDescription, &'a ServerDescription)>
}

impl TopologyDescription {
	pub fn new(options: &ClientOptions) -> Self {
		let r#type = if options.is_direct() {
			TopologyType::Single
		} else if options.replica_set.is_some() {
			TopologyType::ReplicaSetNoPrimary
		} else {
			TopologyType::Unknown
		};
		
		Self {
			r#type,
			servers:                         options.hosts.iter()
				.map(|address| (address.clone(), ServerDescription::new(address.clone())))
				.collect(),
			set_name:                        options.replica_set.clone(),
			max_set_version:                 None,
			max_election_id:                 None,
			logical_session_timeout_minutes: None,
			compatibility_error:             None,
			incompatible:                    BTreeMap::new(),
			expected_set_name:               options.replica_set.clone(),
			single_seed:                     options.hosts.len() == 1
		}
	}
	
	pub fn is_compatible(&self) -> bool {
		self.compatibility_error.is_none()
	}
	
	pub fn server(&self, address: &ServerAddress) -> Option<&ServerDescription> {
		self.servers.get(address)
	}
	
	pub fn primary(&self) -> Option<&ServerDescription> {
		self.servers.values().find(|s| s.r#type == ServerType::RSPrimary)
	}
	
	/// Folds one observation into the description.
	///
	/// Observations for untracked servers and observations older than the tracked one (by
	/// topology version) are ignored.
	pub fn update(&mut self, mut description: ServerDescription) -> MembershipChange {
		let mut change = MembershipChange::default();
		let before = self.servers.keys().cloned().collect::<BTreeSet<_>>();
		
		match self.servers.get(&description.address) {
			None => return change,
			Some(current) => if let (Some(current), Some(new)) = (&current.topology_version, &description.topology_version) {
				if new.is_older_than(current) {
					debug!("ignoring stale observation of {}", description.address);
					return change;
				}
			}
		}
		
		if self.r#type == TopologyType::Single && description.is_available() {
			if let Some(expected) = &self.expected_set_name {
				if description.set_name.as_ref() != Some(expected) {
					let error = Error::InvalidReply(format!(
						"server is in replica set {:?}, expected {:?}", description.set_name, expected));
					description = ServerDescription::from_error(description.address.clone(), error);
				}
			}
		}
		
		let address = description.address.clone();
		self.servers.insert(address.clone(), description.clone());
		
		match (self.r#type, description.r#type) {
			// no-op
			(TopologyType::Single, _)
			| (_, ServerType::PossiblePrimary)
			| (TopologyType::Unknown, ServerType::Unknown)
			| (TopologyType::Unknown, ServerType::RSGhost)
			| (TopologyType::Sharded, ServerType::Unknown)
			| (TopologyType::Sharded, ServerType::Mongos)
			| (TopologyType::ReplicaSetNoPrimary, ServerType::Unknown)
			| (TopologyType::ReplicaSetNoPrimary, ServerType::RSGhost)
			| (TopologyType::ReplicaSetWithPrimary, ServerType::Unknown)
			| (TopologyType::ReplicaSetWithPrimary, ServerType::RSGhost) => (),
			// remove
			(TopologyType::Sharded, _) => {
				self.servers.remove(&address);
			}
			// update topology type
			(TopologyType::Unknown, ServerType::Standalone) => if self.single_seed {
				self.r#type = TopologyType::Single;
			} else {
				self.servers.remove(&address);
			},
			(TopologyType::Unknown, ServerType::Mongos) => self.r#type = TopologyType::Sharded,
			(TopologyType::ReplicaSetNoPrimary, ServerType::Standalone)
			| (TopologyType::ReplicaSetNoPrimary, ServerType::Mongos)
			| (TopologyType::ReplicaSetWithPrimary, ServerType::Standalone)
			| (TopologyType::ReplicaSetWithPrimary, ServerType::Mongos) =>
				self.update_rs_with_non_member(&description),
			// replica set members
			(_, ServerType::RSPrimary) => self.update_rs_from_primary(&description),
			(_, ServerType::RSSecondary)
			| (_, ServerType::RSArbiter)
			| (_, ServerType::RSOther) => self.update_rs_from_member(&description, &mut change)
		}
		
		if self.r#type.is_replica_set() {
			self.update_replica_set_type();
		}
		
		self.update_compatibility(&address);
		self.update_logical_session_timeout();
		
		let after = self.servers.keys().cloned().collect::<BTreeSet<_>>();
		change.added = after.difference(&before).cloned().collect();
		change.removed = before.difference(&after).cloned().collect();
		change
	}
	
	/// A standalone or mongos showed up in a replica set topology. A lone seed is taken at its
	/// word, anything else is dropped.
	fn update_rs_with_non_member(&mut self, description: &ServerDescription) {
		if self.single_seed && self.servers.len() == 1 && self.expected_set_name.is_none() {
			self.r#type = match description.r#type {
				ServerType::Mongos => TopologyType::Sharded,
				_                  => TopologyType::Single
			};
		} else {
			self.servers.remove(&description.address);
		}
	}
	
	/// Adopts the set name if none is known yet, otherwise removes members of other sets.
	fn check_set_name(&mut self, description: &ServerDescription) -> bool {
		if self.set_name.is_none() {
			self.set_name = description.set_name.clone();
		}
		
		if self.set_name == description.set_name {
			true
		} else {
			debug!("removing {}: set name {:?} does not match {:?}",
				description.address, description.set_name, self.set_name);
			self.servers.remove(&description.address);
			false
		}
	}
	
	fn update_rs_from_primary(&mut self, description: &ServerDescription) {
		if self.r#type == TopologyType::Unknown {
			self.r#type = TopologyType::ReplicaSetNoPrimary;
		}
		
		if !self.check_set_name(description) {
			return;
		}
		
		// stale primary protection
		
		if let (Some(set_version), Some(election_id)) = (description.set_version, description.election_id) {
			if let (Some(max_set_version), Some(max_election_id)) = (self.max_set_version, self.max_election_id) {
				if (max_set_version, max_election_id) > (set_version, election_id) {
					debug!("{} claims to be primary with ({}, {}), but ({}, {}) was already seen",
						description.address, set_version, election_id, max_set_version, max_election_id);
					self.servers.insert(description.address.clone(), ServerDescription {
						r#type: ServerType::RSOther,
						..description.clone()
					});
					return;
				}
			}
			
			self.max_election_id = Some(election_id);
		}
		
		if let Some(set_version) = description.set_version {
			if self.max_set_version.map_or(true, |max| set_version > max) {
				self.max_set_version = Some(set_version);
			}
		}
		
		// the election result always wins, any other primary is outdated
		
		let demoted = self.servers.iter()
			.filter(|(address, server)| **address != description.address && server.r#type == ServerType::RSPrimary)
			.map(|(address, _)| address.clone())
			.collect::<Vec<_>>();
		
		for address in demoted {
			debug!("demoting {}, {} is the new primary", address, description.address);
			self.servers.insert(address.clone(), ServerDescription::new(address));
		}
		
		self.sync_membership(description);
	}
	
	fn update_rs_from_member(&mut self, description: &ServerDescription, change: &mut MembershipChange) {
		if self.r#type == TopologyType::Unknown {
			self.r#type = TopologyType::ReplicaSetNoPrimary;
		}
		
		if !self.check_set_name(description) {
			return;
		}
		
		if description.invalid_me() {
			debug!("removing {}: it reports itself as {:?}", description.address, description.me);
			self.servers.remove(&description.address);
			return;
		}
		
		self.sync_membership(description);
		
		if let Some(primary) = &description.primary {
			if self.servers.get(primary).map_or(false, |s| s.r#type == ServerType::Unknown) {
				self.servers.insert(primary.clone(), ServerDescription {
					r#type: ServerType::PossiblePrimary,
					..ServerDescription::new(primary.clone())
				});
				change.possible_primary = Some(primary.clone());
			}
		}
	}
	
	/// The member's view of the set becomes the tracked membership.
	fn sync_membership(&mut self, description: &ServerDescription) {
		let hosts = description.known_hosts();
		
		// members that are still starting up report no hosts at all
		if hosts.is_empty() {
			return;
		}
		
		self.servers.retain(|address, _| hosts.contains(address));
		
		for host in hosts {
			self.servers.entry(host.clone()).or_insert_with(|| ServerDescription::new(host));
		}
	}
	
	fn update_replica_set_type(&mut self) {
		let primaries = self.servers.values()
			.filter(|s| s.r#type == ServerType::RSPrimary)
			.count();
		
		debug_assert!(primaries <= 1, "more than one primary in {:?}", self);
		
		let r#type = if primaries > 0 {
			TopologyType::ReplicaSetWithPrimary
		} else if self.servers.values().any(|s| s.r#type.is_replica_set_member()) {
			TopologyType::ReplicaSetNoPrimary
		} else if self.expected_set_name.is_none() && self.servers.values().all(|s| s.r#type == ServerType::Unknown) {
			TopologyType::Unknown
		} else {
			TopologyType::ReplicaSetNoPrimary
		};
		
		if r#type != self.r#type {
			debug!("topology type changed from {:?} to {:?}", self.r#type, r#type);
			self.r#type = r#type;
		}
	}
	
	/// Incompatibility records survive Unknown observations and are cleared by a compatible
	/// observation or by removal of the server.
	fn update_compatibility(&mut self, address: &ServerAddress) {
		match self.servers.get(address) {
			Some(server) if server.is_available() => match server.compatibility_error() {
				Some(error) => { self.incompatible.insert(address.clone(), error); }
				None        => { self.incompatible.remove(address); }
			},
			Some(_) => (),
			None    => { self.incompatible.remove(address); }
		}
		
		let servers = &self.servers;
		self.incompatible.retain(|address, _| servers.contains_key(address));
		self.compatibility_error = self.incompatible.values().next().cloned();
	}
	
	/// The minimum over all data-bearing servers, unknown if any of them does not report one.
	fn update_logical_session_timeout(&mut self) {
		let mut data_bearing = self.servers.values()
			.filter(|s| s.r#type.is_data_bearing())
			.peekable();
		
		self.logical_session_timeout_minutes = match data_bearing.peek() {
			None    => None,
			Some(_) => data_bearing.try_fold(i64::MAX, |min, server| server.logical_session_timeout_minutes
				.map(|timeout| min.min(timeout)))
		};
	}
	
	/// Compares two descriptions, `None` if they are equal.
	pub fn diff<'a>(&'a self, new: &'a TopologyDescription) -> Option<TopologyDiff<'a>> {
		if self == new {
			return None;
		}
		
		Some(TopologyDiff {
			added:   new.servers.keys().filter(|a| !self.servers.contains_key(a)).collect(),
			removed: self.servers.keys().filter(|a| !new.servers.contains_key(a)).collect(),
			changed: self.servers.iter()
				.filter_map(|(address, old)| new.servers.get(address)
					.filter(|new| *new != old)
					.map(|new| (old, new)))
				.collect()
		})
	}
	
	/// A one-line rendering of the topology for error messages.
	pub fn summary(&self) -> String {
		let mut servers = self.servers.values().collect::<Vec<_>>();
		servers.sort_by(|a, b| a.address.cmp(&b.address));
		
		let servers = servers.iter()
			.map(|s| match &s.error {
				Some(error) => format!("{} ({:?}: {})", s.address, s.r#type, error),
				None        => format!("{} ({:?})", s.address, s.r#type)
			})
			.collect::<Vec<_>>();
		
		format!("{:?} [{}]", self.r#type, servers.join(", "))
	}
}

impl Default for TopologyDescription {
	fn default() -> Self {
		Self::new(&ClientOptions::default())
	}
}

impl PartialEq for TopologyDescription {
	fn eq(&self, other: &Self) -> bool {
		self.r#type == other.r#type
			&& self.servers == other.servers
			&& self.set_name == other.set_name
			&& self.max_set_version == other.max_set_version
			&& self.max_election_id == other.max_election_id
			&& self.logical_session_timeout_minutes == other.logical_session_timeout_minutes
			&& self.compatibility_error == other.compatibility_error
	}
}
