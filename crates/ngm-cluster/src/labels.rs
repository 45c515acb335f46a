//! Node label and annotation keys used to mark drain selections.

use serde::{Deserialize, Serialize};

/// Keys written to and read from cluster nodes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NodeLabels {
    /// Label carrying the owning node group id.
    pub node_group: String,
    /// Label carrying the id of the task that selected the node.
    pub task: String,
    /// Label carrying the drain tier, `"<hours>h"`.
    pub drain_delay: String,
    /// Annotation carrying the RFC 3339 drain deadline.
    pub drain_deadline: String,
}

impl Default for NodeLabels {
    fn default() -> Self {
        Self {
            node_group: "ngm.io/node-group".to_string(),
            task: "ngm.io/scale-down-task".to_string(),
            drain_delay: "ngm.io/drain-delay".to_string(),
            drain_deadline: "ngm.io/drain-deadline".to_string(),
        }
    }
}
