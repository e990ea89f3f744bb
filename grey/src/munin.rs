//! Output for running `greyctl` as a munin plugin.

use std::str::FromStr;

use thiserror::Error;

use crate::stats::{ListStats, Stats};

/// The graphs the plugin can draw
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Graph {
	Greylist,
	Whitelist,
	Overview,
	ClientNames,
}

impl FromStr for Graph {
	type Err = UnknownGraph;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"greylist" => Ok(Self::Greylist),
			"whitelist" => Ok(Self::Whitelist),
			"overview" => Ok(Self::Overview),
			"client_names" => Ok(Self::ClientNames),
			_ => Err(UnknownGraph(s.into())),
		}
	}
}

impl Graph {
	/// Works out the graph from the name the plugin was linked as, which
	/// munin wants to look like `greylisting_<graph>`
	pub fn from_program_name(name: &str) -> Result<Self, UnknownGraph> {
		match name.split_once('_') {
			Some(("greylisting", graph)) => graph.parse(),
			_ => Err(UnknownGraph(name.into())),
		}
	}

	/// The answer to `munin-run <plugin> config`
	pub fn config(&self) -> String {
		match self {
			Graph::Greylist => list_config("greylist"),
			Graph::Whitelist => list_config("whitelist"),
			Graph::Overview => String::from(
				"graph_title Greylisting stats\n\
				graph_vlabel Entries\n\
				graph_category mail\n\
				graph_info Statistics about different components of the greylisting system\n\
				graph_order greylist whitelist\n\
				greylist.label greylist\n\
				greylist.draw LINE2\n\
				greylist.info Amount of entries in the greylist\n\
				whitelist.label whitelist\n\
				whitelist.draw LINE2\n\
				whitelist.info Amount of entries in the whitelist\n",
			),
			Graph::ClientNames => String::from(
				"graph_title Distinct client names\n\
				graph_vlabel Names\n\
				graph_category mail\n\
				graph_info Distinct client names in the greylisting component\n\
				graph_order clientnames\n\
				clientnames.label clientnames\n\
				clientnames.draw LINE2\n\
				clientnames.info Distinct client names in the greylisting component\n",
			),
		}
	}

	/// The values for one munin run
	pub fn data(&self, stats: &Stats) -> String {
		match self {
			Graph::Greylist => list_data(&stats.greylist),
			Graph::Whitelist => list_data(&stats.whitelist),
			Graph::Overview => format!(
				"greylist {}\nwhitelist {}\n",
				stats.greylist.total, stats.whitelist.total
			),
			Graph::ClientNames => format!("clientnames {}\n", stats.distinct_client_names),
		}
	}
}

fn list_config(list: &str) -> String {
	format!(
		"graph_title {list} contents\n\
		graph_vlabel Entries\n\
		graph_category mail\n\
		graph_info Statistics about the activity of the {list}\n\
		graph_order active inactive total\n\
		active.label active\n\
		active.draw AREA\n\
		active.info Recently used entries in the {list}\n\
		inactive.label inactive\n\
		inactive.draw STACK\n\
		inactive.info Stale entries in the {list}\n\
		total.label Total entries\n\
		total.draw LINE2\n\
		total.info Total entries in the {list}\n"
	)
}

fn list_data(list: &ListStats) -> String {
	format!(
		"active {}\ninactive {}\ntotal {}\n",
		list.active,
		list.inactive(),
		list.total
	)
}

#[derive(Clone, Debug, Error, PartialEq)]
#[error("unknown graph type: {0}")]
pub struct UnknownGraph(pub String);
