//! Superstep execution engine
//!
//! Execution is divided into **supersteps**. Every superstep reads the channel
//! state of one checkpoint, runs all runnable tasks concurrently, and folds
//! their writes into the next checkpoint in deterministic task order.
//!
//! ```text
//!  checkpoint(step n)
//!        │ prepare_next_tasks: trigger versions > versions_seen
//!        ▼
//!  ┌───────────────┐   each finished task ──► put_writes (pending)
//!  │ run tasks ∥   │
//!  └───────────────┘
//!        │ all completed?        interrupted / failed
//!        ▼                       └──► stop; pending writes stay for resume
//!  apply_writes: seen ← triggers, consume, update channels, bump versions
//!        │
//!        ▼
//!  checkpoint(step n+1), parent = checkpoint(step n)
//! ```
//!
//! # Internal channels
//!
//! | Channel | Type | Purpose |
//! |---------|------|---------|
//! | `__start__` | last value | run input, triggers the entry edges |
//! | `branch:to:<node>` | last value | written by edges, routers and `goto` to trigger `<node>` |
//! | `join:<a>+<b>:<node>` | named barrier | fires `<node>` once every source wrote |
//! | `__tasks__` | topic | `Send` packets, one push task each |
//!
//! Node outputs may not write any of these directly.

pub(crate) mod algo;
pub(crate) mod channel_store;
pub(crate) mod loop_impl;
pub(crate) mod types;

/// Channel holding the run input
pub const INPUT: &str = "__start__";
/// Topic of pending [`Send`](crate::Send) packets
pub const TASKS: &str = "__tasks__";
/// `versions_seen` entry marking what the last interrupt check observed
pub const INTERRUPT_SEEN: &str = "__interrupt__";

const BRANCH_PREFIX: &str = "branch:to:";
const JOIN_PREFIX: &str = "join:";

/// Trigger channel of a node
pub fn branch_channel(node: &str) -> String {
    format!("{BRANCH_PREFIX}{node}")
}

/// Barrier channel of a join edge; `sources` must be sorted
pub fn join_channel(sources: &[String], target: &str) -> String {
    format!("{JOIN_PREFIX}{}:{target}", sources.join("+"))
}

/// Whether a channel name belongs to the engine
pub fn is_reserved_channel(name: &str) -> bool {
    name.starts_with("__") || name.starts_with(BRANCH_PREFIX) || name.starts_with(JOIN_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_channels() {
        assert!(is_reserved_channel(INPUT));
        assert!(is_reserved_channel(TASKS));
        assert!(is_reserved_channel(&branch_channel("a")));
        assert!(is_reserved_channel(&join_channel(&["a".into(), "b".into()], "c")));
        assert!(!is_reserved_channel("messages"));
    }

    #[test]
    fn test_join_channel_name() {
        assert_eq!(
            join_channel(&["a".into(), "b".into()], "c"),
            "join:a+b:c"
        );
    }
}
