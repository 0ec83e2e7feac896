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

//! Picks the server an operation runs on.
//!
//! see https://github.com/mongodb/specifications/blob/master/source/server-selection/server-selection.rst

use {
	crate::{
		common::{ReadPreference, ReadPreferenceMode, ServerAddress, ServerSelectionConfig, TagSet},
		description::{ServerDescription, ServerType},
		error::{Error, Result},
		topology::{TopologyDescription, TopologyType}
	},
	rand::seq::SliceRandom,
	std::time::{Duration, SystemTime}
};

/// Selects a server from one topology snapshot. `None` as read preference selects for a write.
///
/// Returns `Ok(None)` if no server is suitable right now and an error if none ever will be.
/// `deprioritized` servers are only chosen on sharded topologies and only if nothing else is
/// available.
pub fn select<'a>(
	topology:        &'a TopologyDescription,
	read_preference: Option<&ReadPreference>,
	config:          &ServerSelectionConfig,
	deprioritized:   &[ServerAddress]
) -> Result<Option<&'a ServerDescription>> {
	if let Some(error) = &topology.compatibility_error {
		return Err(Error::IncompatibleTopology(error.clone()));
	}
	
	let suitable = suitable_servers(topology, read_preference, config.heartbeat_frequency, deprioritized);
	let window = in_latency_window(suitable, config.local_threshold);
	Ok(window.choose(&mut rand::thread_rng()).copied())
}

/// All servers that may serve the operation, before the latency window is applied.
pub fn suitable_servers<'a>(
	topology:            &'a TopologyDescription,
	read_preference:     Option<&ReadPreference>,
	heartbeat_frequency: Duration,
	deprioritized:       &[ServerAddress]
) -> Vec<&'a ServerDescription> {
	match topology.r#type {
		TopologyType::Unknown => Vec::new(),
		TopologyType::Single  => topology.servers.values()
			.filter(|server| server.is_available())
			.collect(),
		TopologyType::Sharded => {
			let mongos = of_type(topology, ServerType::Mongos);
			let preferred = mongos.iter()
				.copied()
				.filter(|server| !deprioritized.contains(&server.address))
				.collect::<Vec<_>>();
			
			if preferred.is_empty() { mongos } else { preferred }
		}
		TopologyType::ReplicaSetNoPrimary | TopologyType::ReplicaSetWithPrimary => {
			let read_pref = match read_preference {
				Some(read_pref) => read_pref,
				None => return of_type(topology, ServerType::RSPrimary)
			};
			
			let primary = || of_type(topology, ServerType::RSPrimary);
			let secondaries = || eligible(topology, of_type(topology, ServerType::RSSecondary), read_pref, heartbeat_frequency);
			
			match read_pref.mode {
				ReadPreferenceMode::Primary            => primary(),
				ReadPreferenceMode::PrimaryPreferred   => non_empty(primary())
					.unwrap_or_else(secondaries),
				ReadPreferenceMode::Secondary          => secondaries(),
				ReadPreferenceMode::SecondaryPreferred => non_empty(secondaries())
					.unwrap_or_else(primary),
				ReadPreferenceMode::Nearest            => {
					let mut servers = primary();
					servers.extend(of_type(topology, ServerType::RSSecondary));
					eligible(topology, servers, read_pref, heartbeat_frequency)
				}
			}
		}
	}
}

fn of_type(topology: &TopologyDescription, r#type: ServerType) -> Vec<&ServerDescription> {
	topology.servers.values()
		.filter(|server| server.r#type == r#type)
		.collect()
}

fn non_empty<T>(v: Vec<T>) -> Option<Vec<T>> {
	if v.is_empty() { None } else { Some(v) }
}

fn eligible<'a>(
	topology:            &'a TopologyDescription,
	servers:             Vec<&'a ServerDescription>,
	read_pref:           &ReadPreference,
	heartbeat_frequency: Duration
) -> Vec<&'a ServerDescription> {
	let servers = match read_pref.max_staleness {
		Some(max_staleness) => servers.into_iter()
			.filter(|server| staleness(topology, server, heartbeat_frequency) <= max_staleness)
			.collect(),
		None => servers
	};
	
	matching_tag_sets(servers, &read_pref.tag_sets)
}

/// Estimates how far a secondary lags behind (max staleness).
fn staleness(topology: &TopologyDescription, server: &ServerDescription, heartbeat_frequency: Duration) -> Duration {
	if server.r#type != ServerType::RSSecondary {
		return Duration::default();
	}
	
	let since = |later: SystemTime, earlier: SystemTime| later.duration_since(earlier).unwrap_or_default();
	
	let lag = match topology.primary() {
		Some(primary) => match (server.last_update_time, server.last_write_date, primary.last_update_time, primary.last_write_date) {
			(Some(s_lut), Some(s_lwd), Some(p_lut), Some(p_lwd)) => since(s_lut, s_lwd)
				.checked_sub(since(p_lut, p_lwd))
				.unwrap_or_default(),
			(Some(s_lut), _, Some(p_lut), _) => since(p_lut, s_lut),
			_ => Duration::default()
		},
		None => {
			let freshest = topology.servers.values()
				.filter(|s| s.r#type == ServerType::RSSecondary)
				.filter_map(|s| s.last_write_date)
				.max();
			
			match (freshest, server.last_write_date) {
				(Some(freshest), Some(lwd)) => since(freshest, lwd),
				_ => Duration::default()
			}
		}
	};
	
	lag + heartbeat_frequency
}

/// The servers matching the first tag set that matches any of them.
fn matching_tag_sets<'a>(servers: Vec<&'a ServerDescription>, tag_sets: &[TagSet]) -> Vec<&'a ServerDescription> {
	if tag_sets.is_empty() {
		return servers;
	}
	
	tag_sets.iter()
		.map(|tag_set| servers.iter()
			.copied()
			.filter(|server| server.matches_tags(tag_set))
			.collect::<Vec<_>>())
		.find(|matched| !matched.is_empty())
		.unwrap_or_default()
}

/// Keeps the servers within `local_threshold` of the fastest one.
pub fn in_latency_window(servers: Vec<&ServerDescription>, local_threshold: Duration) -> Vec<&ServerDescription> {
	let rtt = |server: &ServerDescription| server.round_trip_time.unwrap_or_default();
	
	let fastest = match servers.iter().map(|server| rtt(*server)).min() {
		Some(fastest) => fastest,
		None => return servers
	};
	
	servers.into_iter()
		.filter(|server| rtt(*server) <= fastest + local_threshold)
		.collect()
}
