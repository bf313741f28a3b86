//! Core scheduling functions.
//!
//! - Task preparation from channel versions
//! - Write collection and routing for finished tasks
//! - Write application with deterministic ordering and version bumps

use super::channel_store::ChannelStore;
use super::types::{PregelTask, TaskPath};
use super::{branch_channel, is_reserved_channel, INPUT, INTERRUPT_SEEN, TASKS};
use crate::error::{GraphError, Result};
use crate::graph::{Graph, NodeOutput, END, START};
use crate::send::Send;
use serde_json::{json, Map, Value};
use std::collections::{BTreeSet, HashMap};
use superstep_checkpoint::{ChannelVersion, ChannelVersions};
use uuid::Uuid;

/// Deterministic task id.
///
/// The same checkpoint, namespace, step and path always yield the same id,
/// which is what lets a resumed superstep find its pending writes again.
pub(crate) fn task_id(checkpoint_id: &str, ns: &str, step: i64, path: &TaskPath, node: &str) -> String {
    let name = format!("{checkpoint_id}|{ns}|{step}|{path}|{node}");
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
}

fn seen_version(
    versions_seen: &HashMap<String, ChannelVersions>,
    node: &str,
    channel: &str,
) -> ChannelVersion {
    versions_seen
        .get(node)
        .and_then(|seen| seen.get(channel))
        .copied()
        .unwrap_or(ChannelVersion::ZERO)
}

/// Trigger channels of a node: its branch channel and the joins into it
pub(crate) fn node_triggers(graph: &Graph, node: &str) -> Vec<String> {
    if node == START {
        return vec![INPUT.to_string()];
    }
    std::iter::once(branch_channel(node))
        .chain(graph.joins_into(node).map(|join| join.channel.clone()))
        .collect()
}

/// Compute the tasks of the next superstep.
///
/// ```text
/// pull task  ⇐  some trigger t of node N is available
///               and version(t) > versions_seen[N][t]
/// push task  ⇐  one per Send packet in __tasks__
/// ```
///
/// Tasks come back sorted by [`TaskPath`].
pub(crate) fn prepare_next_tasks(
    graph: &Graph,
    channels: &ChannelStore,
    versions_seen: &HashMap<String, ChannelVersions>,
    checkpoint_id: &str,
    ns: &str,
    step: i64,
) -> Result<Vec<PregelTask>> {
    let mut tasks = Vec::new();
    let state = channels.state();

    let candidates = std::iter::once(START).chain(graph.nodes.keys().map(String::as_str));
    for node in candidates {
        let triggers: Vec<String> = node_triggers(graph, node)
            .into_iter()
            .filter(|channel| {
                channels.is_available(channel)
                    && channels.version(channel) > seen_version(versions_seen, node, channel)
            })
            .collect();
        if triggers.is_empty() {
            continue;
        }

        let path = TaskPath::Pull(node.to_string());
        let input = if node == START {
            channels.get(INPUT).unwrap_or(Value::Null)
        } else {
            state.clone()
        };
        tasks.push(PregelTask {
            id: task_id(checkpoint_id, ns, step, &path, node),
            name: node.to_string(),
            path,
            input,
            triggers,
        });
    }

    for (index, send) in channels.sends()?.into_iter().enumerate() {
        if !graph.is_node(&send.node) {
            return Err(GraphError::InvalidUpdate(format!(
                "Send to unknown node '{}'",
                send.node
            )));
        }
        let path = TaskPath::Push(index);
        tasks.push(PregelTask {
            id: task_id(checkpoint_id, ns, step, &path, &send.node),
            name: send.node,
            path,
            input: send.arg,
            triggers: Vec::new(),
        });
    }

    tasks.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(tasks)
}

/// Writes that route control out of `node` after it produced `user_writes`.
///
/// Static edges, routers (evaluated over the state with `user_writes`
/// applied), `goto` targets and join edges become trigger writes; `Send`
/// packets go to the task topic.
pub(crate) fn routing_writes(
    graph: &Graph,
    channels: &ChannelStore,
    node: &str,
    user_writes: &[(String, Value)],
    goto: &[String],
    sends: &[Send],
) -> Result<Vec<(String, Value)>> {
    let mut targets: Vec<String> = graph.static_targets(node).to_vec();
    let mut sends = sends.to_vec();

    let branches = graph.branches_of(node);
    if !branches.is_empty() {
        let state = channels.preview(user_writes)?;
        for branch in branches {
            let (routed, routed_sends) = branch.route(node, &state)?;
            targets.extend(routed);
            sends.extend(routed_sends);
        }
    }
    targets.extend(goto.iter().cloned());

    let mut writes = Vec::new();
    let mut triggered = BTreeSet::new();
    for target in targets {
        if target == END {
            continue;
        }
        if !graph.is_node(&target) {
            return Err(GraphError::InvalidUpdate(format!(
                "'{}' routed to unknown node '{}'",
                node, target
            )));
        }
        if triggered.insert(target.clone()) {
            writes.push((branch_channel(&target), json!(node)));
        }
    }
    for join in graph.joins_from(node) {
        writes.push((join.channel.clone(), json!(node)));
    }
    for send in sends {
        if !graph.is_target(&send.node) || send.node == END {
            return Err(GraphError::InvalidUpdate(format!(
                "'{}' sent to unknown node '{}'",
                node, send.node
            )));
        }
        writes.push((TASKS.to_string(), serde_json::to_value(&send)?));
    }
    Ok(writes)
}

/// Split an update object into channel writes, rejecting engine channels
pub(crate) fn update_writes(node: &str, update: Value) -> Result<Vec<(String, Value)>> {
    match update {
        Value::Null => Ok(Vec::new()),
        Value::Object(map) => map
            .into_iter()
            .map(|(channel, value)| {
                if is_reserved_channel(&channel) {
                    Err(GraphError::InvalidUpdate(format!(
                        "'{}' cannot write reserved channel '{}'",
                        node, channel
                    )))
                } else {
                    Ok((channel, value))
                }
            })
            .collect(),
        other => Err(GraphError::InvalidUpdate(format!(
            "'{}' returned {}, expected an object of channel writes",
            node,
            value_kind(&other)
        ))),
    }
}

/// All writes of a completed node task
pub(crate) fn task_writes(
    graph: &Graph,
    channels: &ChannelStore,
    task: &PregelTask,
    output: NodeOutput,
) -> Result<Vec<(String, Value)>> {
    let mut writes = update_writes(&task.name, output.update)?;
    let routing = routing_writes(
        graph,
        channels,
        &task.name,
        &writes,
        &output.goto,
        &output.sends,
    )?;
    writes.extend(routing);
    Ok(writes)
}

/// Writes of the entry task: every input field, then the entry edges
pub(crate) fn input_writes(
    graph: &Graph,
    channels: &ChannelStore,
    input: &Value,
) -> Result<Vec<(String, Value)>> {
    if !input.is_object() {
        return Err(GraphError::InvalidUpdate(format!(
            "Input must be an object, got {}",
            value_kind(input)
        )));
    }
    let mut writes = update_writes(START, input.clone())?;
    let routing = routing_writes(graph, channels, START, &writes, &[], &[])?;
    writes.extend(routing);
    Ok(writes)
}

/// Object of the state-channel writes, as recorded in checkpoint metadata
pub(crate) fn user_update(writes: &[(String, Value)]) -> Value {
    let mut update = Map::new();
    for (channel, value) in writes.iter().filter(|(c, _)| !is_reserved_channel(c)) {
        update.insert(channel.clone(), value.clone());
    }
    if update.is_empty() {
        Value::Null
    } else {
        Value::Object(update)
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Fold a superstep's writes into the channels.
///
/// `writes[i]` belongs to `tasks[i]`; tasks are in path order.
///
/// 1. Pull tasks record the trigger versions they ran on in `versions_seen`
/// 2. Triggers (and the task topic, if push tasks ran) are consumed
/// 3. Writes are grouped per channel in task order and applied
/// 4. Every channel changed by 2 or 3 moves to its next version once
///
/// Returns the changed channels.
pub(crate) fn apply_writes(
    channels: &mut ChannelStore,
    versions_seen: &mut HashMap<String, ChannelVersions>,
    tasks: &[PregelTask],
    writes: Vec<Vec<(String, Value)>>,
) -> Result<BTreeSet<String>> {
    for task in tasks.iter().filter(|t| !t.is_push()) {
        let seen = versions_seen.entry(task.name.clone()).or_default();
        for trigger in &task.triggers {
            seen.insert(trigger.clone(), channels.version(trigger));
        }
    }

    let mut changed = BTreeSet::new();
    for task in tasks.iter().filter(|t| !t.is_push()) {
        for trigger in &task.triggers {
            if channels.consume(trigger) {
                changed.insert(trigger.clone());
            }
        }
    }
    if tasks.iter().any(PregelTask::is_push) && channels.consume(TASKS) {
        changed.insert(TASKS.to_string());
    }

    changed.extend(channels.update(writes.into_iter().flatten().collect())?);
    channels.bump(&changed);
    Ok(changed)
}

/// Tasks that hit a static breakpoint.
///
/// A breakpoint only fires when some channel moved since the last interrupt
/// check, so resuming from it does not pause again on the same tasks.
pub(crate) fn should_interrupt<'a>(
    channels: &ChannelStore,
    versions_seen: &HashMap<String, ChannelVersions>,
    nodes: &[String],
    tasks: &'a [PregelTask],
) -> Vec<&'a PregelTask> {
    if nodes.is_empty() {
        return Vec::new();
    }
    let any_updated = channels
        .versions()
        .iter()
        .any(|(channel, version)| *version > seen_version(versions_seen, INTERRUPT_SEEN, channel));
    if !any_updated {
        return Vec::new();
    }
    tasks
        .iter()
        .filter(|task| nodes.iter().any(|n| n == &task.name))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{ChannelPolicy, StateGraph};
    use crate::CompiledGraph;
    use proptest::prelude::*;

    fn linear_graph() -> CompiledGraph {
        let mut graph = StateGraph::new();
        graph.add_channel("bar", ChannelPolicy::append());
        graph.add_node("node_a", |_s, _c| async move {
            Ok(NodeOutput::update(json!({"foo": "a", "bar": ["a"]})))
        });
        graph.add_node("node_b", |_s, _c| async move {
            Ok(NodeOutput::update(json!({"foo": "b", "bar": ["b"]})))
        });
        graph
            .add_edge(START, "node_a")
            .add_edge("node_a", "node_b")
            .add_edge("node_b", END);
        graph.compile().unwrap()
    }

    fn start(compiled: &CompiledGraph, input: Value) -> (ChannelStore, HashMap<String, ChannelVersions>) {
        let graph = compiled.graph();
        let mut channels = ChannelStore::new(graph);
        let changed = channels
            .update(vec![(INPUT.to_string(), input)])
            .unwrap();
        channels.bump(&changed);
        (channels, HashMap::new())
    }

    #[test]
    fn test_task_ids_are_deterministic() {
        let path = TaskPath::Pull("a".into());
        assert_eq!(task_id("cp", "", 0, &path, "a"), task_id("cp", "", 0, &path, "a"));
        assert_ne!(task_id("cp", "", 0, &path, "a"), task_id("cp", "", 1, &path, "a"));
    }

    #[test]
    fn test_input_triggers_start_then_edges() {
        let compiled = linear_graph();
        let graph = compiled.graph();
        let (mut channels, mut seen) = start(&compiled, json!({"foo": ""}));

        let tasks = prepare_next_tasks(graph, &channels, &seen, "cp0", "", -1).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].name, START);

        let writes = input_writes(graph, &channels, &tasks[0].input).unwrap();
        assert!(writes.contains(&(branch_channel("node_a"), json!(START))));
        apply_writes(&mut channels, &mut seen, &tasks, vec![writes]).unwrap();

        let tasks = prepare_next_tasks(graph, &channels, &seen, "cp1", "", 0).unwrap();
        assert_eq!(tasks.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(), vec!["node_a"]);
        assert_eq!(tasks[0].input, json!({"foo": ""}));
    }

    #[test]
    fn test_apply_writes_bumps_each_channel_once() {
        let compiled = linear_graph();
        let graph = compiled.graph();
        let (mut channels, mut seen) = start(&compiled, json!({}));
        let tasks = prepare_next_tasks(graph, &channels, &seen, "cp", "", -1).unwrap();

        let before = channels.version("bar");
        let changed = apply_writes(
            &mut channels,
            &mut seen,
            &tasks,
            vec![vec![
                ("bar".to_string(), json!(["x"])),
                ("bar".to_string(), json!(["y"])),
            ]],
        )
        .unwrap();

        assert!(changed.contains("bar"));
        assert_eq!(channels.version("bar"), before.next());
        assert_eq!(channels.get("bar"), Some(json!(["x", "y"])));
        assert_eq!(seen[START][INPUT], channels.version(INPUT));
    }

    #[test]
    fn test_unknown_keys_become_overwrite_channels() {
        let compiled = linear_graph();
        let (mut channels, _) = start(&compiled, json!({}));
        channels
            .update(vec![
                ("extra".to_string(), json!(1)),
                ("extra".to_string(), json!(2)),
            ])
            .unwrap();
        assert_eq!(channels.get("extra"), Some(json!(2)));
    }

    #[test]
    fn test_update_writes_rejects_reserved_and_non_objects() {
        assert!(update_writes("n", json!({"__tasks__": []})).is_err());
        assert!(update_writes("n", json!({"branch:to:x": "n"})).is_err());
        assert!(update_writes("n", json!([1, 2])).is_err());
        assert!(update_writes("n", Value::Null).unwrap().is_empty());
    }

    #[test]
    fn test_join_waits_for_every_source() {
        let mut graph = StateGraph::new();
        for name in ["a", "b", "c"] {
            graph.add_node(name, |_s, _c| async move { Ok(NodeOutput::empty()) });
        }
        graph
            .add_edge(START, "a")
            .add_edge(START, "b")
            .add_join_edge(["a", "b"], "c");
        let compiled = graph.compile().unwrap();
        let graph = compiled.graph();
        let (mut channels, mut seen) = start(&compiled, json!({}));

        let a = PregelTask {
            id: "a".into(),
            name: "a".into(),
            path: TaskPath::Pull("a".into()),
            input: json!({}),
            triggers: vec![],
        };
        let a_writes = routing_writes(graph, &channels, "a", &[], &[], &[]).unwrap();
        apply_writes(&mut channels, &mut seen, &[a.clone()], vec![a_writes]).unwrap();
        let tasks = prepare_next_tasks(graph, &channels, &seen, "cp", "", 1).unwrap();
        assert!(tasks.iter().all(|t| t.name != "c"));

        let b_writes = routing_writes(graph, &channels, "b", &[], &[], &[]).unwrap();
        apply_writes(&mut channels, &mut seen, &[a], vec![b_writes]).unwrap();
        let tasks = prepare_next_tasks(graph, &channels, &seen, "cp", "", 2).unwrap();
        assert!(tasks.iter().any(|t| t.name == "c"));
    }

    #[test]
    fn test_routing_rejects_unknown_goto() {
        let compiled = linear_graph();
        let (channels, _) = start(&compiled, json!({}));
        let result = routing_writes(
            compiled.graph(),
            &channels,
            "node_a",
            &[],
            &["nowhere".to_string()],
            &[],
        );
        assert!(matches!(result, Err(GraphError::InvalidUpdate(_))));
    }

    proptest! {
        #[test]
        fn prop_versions_never_decrease(
            batches in proptest::collection::vec(
                proptest::collection::vec((0usize..3, 0i64..5), 0..4),
                1..8,
            )
        ) {
            let compiled = linear_graph();
            let (mut channels, mut seen) = start(&compiled, json!({}));
            let names = ["foo", "bar", "baz"];

            for batch in batches {
                let before = channels.versions().clone();
                let writes = batch
                    .into_iter()
                    .map(|(i, v)| (names[i].to_string(), json!([v])))
                    .collect();
                apply_writes(&mut channels, &mut seen, &[], vec![writes]).unwrap();
                for (channel, version) in before {
                    prop_assert!(channels.version(&channel) >= version);
                }
            }
        }
    }
}
