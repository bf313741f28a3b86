//! Live channel state of a run.
//!
//! Holds one [`Channel`] per state key and internal trigger, restored from a
//! checkpoint and written back into the next one. Versions live next to the
//! channels; [`apply_writes`](super::algo::apply_writes) decides when they move.

use super::{branch_channel, is_reserved_channel, INPUT, TASKS};
use crate::error::{GraphError, Result};
use crate::graph::Graph;
use crate::send::Send;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use superstep_checkpoint::{
    Channel, ChannelVersion, ChannelVersions, Checkpoint, LastValueChannel,
    NamedBarrierValueChannel, TopicChannel,
};
use tracing::warn;

#[derive(Clone)]
pub(crate) struct ChannelStore {
    channels: BTreeMap<String, Box<dyn Channel>>,
    versions: ChannelVersions,
}

impl ChannelStore {
    /// Empty channels for every declared key and internal trigger
    pub fn new(graph: &Graph) -> Self {
        let mut channels: BTreeMap<String, Box<dyn Channel>> = graph
            .channels
            .iter()
            .map(|(name, policy)| (name.clone(), policy.channel()))
            .collect();

        channels.insert(INPUT.to_string(), Box::new(LastValueChannel::new()));
        channels.insert(TASKS.to_string(), Box::new(TopicChannel::new()));
        for node in graph.nodes.keys() {
            channels.insert(branch_channel(node), Box::new(LastValueChannel::new()));
        }
        for join in &graph.joins {
            channels.insert(
                join.channel.clone(),
                Box::new(NamedBarrierValueChannel::new(join.sources.iter().cloned())),
            );
        }

        Self {
            channels,
            versions: ChannelVersions::new(),
        }
    }

    /// Restore channel values and versions from a checkpoint
    pub fn from_checkpoint(graph: &Graph, checkpoint: &Checkpoint) -> Result<Self> {
        let mut store = Self::new(graph);
        for (name, value) in &checkpoint.channel_values {
            if !store.channels.contains_key(name) && is_reserved_channel(name) {
                warn!(channel = %name, "Dropping checkpointed channel unknown to this graph");
                continue;
            }
            ensure_in(&mut store.channels, name)?.from_checkpoint(value.clone())?;
        }
        store.versions = checkpoint.channel_versions.clone();
        Ok(store)
    }

    pub fn version(&self, name: &str) -> ChannelVersion {
        self.versions
            .get(name)
            .copied()
            .unwrap_or(ChannelVersion::ZERO)
    }

    pub fn versions(&self) -> &ChannelVersions {
        &self.versions
    }

    pub fn is_available(&self, name: &str) -> bool {
        self.channels
            .get(name)
            .map(|channel| channel.is_available())
            .unwrap_or(false)
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.channels.get(name).and_then(|channel| channel.get().ok())
    }

    /// State object of every available user channel
    pub fn state(&self) -> Value {
        state_of(&self.channels)
    }

    /// Pending `Send` packets in emission order
    pub fn sends(&self) -> Result<Vec<Send>> {
        match self.get(TASKS) {
            Some(Value::Array(packets)) => packets
                .into_iter()
                .map(|packet| serde_json::from_value(packet).map_err(GraphError::from))
                .collect(),
            _ => Ok(Vec::new()),
        }
    }

    /// Notify a channel that its subscriber ran; true when it changed
    pub fn consume(&mut self, name: &str) -> bool {
        self.channels
            .get_mut(name)
            .map(|channel| channel.consume())
            .unwrap_or(false)
    }

    /// Apply one superstep's writes in the given order; returns changed channels
    pub fn update(&mut self, writes: Vec<(String, Value)>) -> Result<BTreeSet<String>> {
        update_channels(&mut self.channels, writes)
    }

    /// Move every channel in `changed` to its next version
    pub fn bump(&mut self, changed: &BTreeSet<String>) {
        for name in changed {
            let next = self.version(name).next();
            self.versions.insert(name.clone(), next);
        }
    }

    /// State as it would look after `writes`, leaving this store untouched
    pub fn preview(&self, writes: &[(String, Value)]) -> Result<Value> {
        let mut channels: BTreeMap<String, Box<dyn Channel>> = self
            .channels
            .iter()
            .filter(|(name, _)| !is_reserved_channel(name))
            .map(|(name, channel)| (name.clone(), channel.clone()))
            .collect();
        let user_writes = writes
            .iter()
            .filter(|(channel, _)| !is_reserved_channel(channel))
            .cloned()
            .collect();
        update_channels(&mut channels, user_writes)?;
        Ok(state_of(&channels))
    }

    /// Serializable values of every non-empty channel
    pub fn values(&self) -> HashMap<String, Value> {
        self.channels
            .iter()
            .filter_map(|(name, channel)| channel.checkpoint().map(|v| (name.clone(), v)))
            .collect()
    }
}

/// Channel by name, creating overwrite channels for unknown state keys
fn ensure_in<'a>(
    channels: &'a mut BTreeMap<String, Box<dyn Channel>>,
    name: &str,
) -> Result<&'a mut Box<dyn Channel>> {
    if !channels.contains_key(name) {
        if is_reserved_channel(name) {
            return Err(GraphError::InvalidUpdate(format!(
                "Unknown internal channel '{}'",
                name
            )));
        }
        channels.insert(name.to_string(), Box::new(LastValueChannel::new()));
    }
    channels
        .get_mut(name)
        .ok_or_else(|| GraphError::InvalidUpdate(format!("Unknown channel '{}'", name)))
}

/// Group writes per channel, keeping their order, and update each channel once
fn update_channels(
    channels: &mut BTreeMap<String, Box<dyn Channel>>,
    writes: Vec<(String, Value)>,
) -> Result<BTreeSet<String>> {
    let mut grouped: BTreeMap<String, Vec<Value>> = BTreeMap::new();
    for (channel, value) in writes {
        grouped.entry(channel).or_default().push(value);
    }

    let mut changed = BTreeSet::new();
    for (name, values) in grouped {
        let channel = ensure_in(channels, &name)?;
        if channel.update(values)? {
            changed.insert(name);
        }
    }
    Ok(changed)
}

fn state_of(channels: &BTreeMap<String, Box<dyn Channel>>) -> Value {
    let state: Map<String, Value> = channels
        .iter()
        .filter(|(name, _)| !is_reserved_channel(name))
        .filter_map(|(name, channel)| channel.get().ok().map(|v| (name.clone(), v)))
        .collect();
    Value::Object(state)
}
