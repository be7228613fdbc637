//! Workflow hierarchy
//!
//! Hierarchical workflows delegate steps to child workflows. The links live
//! in the persisted records (`parent` on the child, `children` on the
//! parent); this module rebuilds the tree from a snapshot of those records
//! for the UI and for cascading cancellation.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::model::WorkflowState;
use crate::protocol::{WorkflowId, WorkflowStatus};

#[derive(Debug, Clone)]
struct HierarchyNode {
    name: String,
    status: WorkflowStatus,
    progress: f64,
    parent: Option<WorkflowId>,
    children: Vec<WorkflowId>,
}

/// Serializable view of a workflow and its descendants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTree {
    pub workflow_id: WorkflowId,
    pub name: String,
    pub status: WorkflowStatus,
    pub progress: f64,
    pub children: Vec<WorkflowTree>,
}

/// Parent/child index over a set of workflows
#[derive(Debug, Default)]
pub struct WorkflowHierarchy {
    nodes: HashMap<WorkflowId, HierarchyNode>,
}

impl WorkflowHierarchy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_workflows<'a>(workflows: impl IntoIterator<Item = &'a WorkflowState>) -> Self {
        let mut hierarchy = Self::new();
        for workflow in workflows {
            hierarchy.add(workflow);
        }
        hierarchy
    }

    /// Index a workflow. Links are taken from both sides, so records may be
    /// added in any order.
    pub fn add(&mut self, workflow: &WorkflowState) {
        let parent = workflow.parent.map(|p| p.workflow_id);
        let node = self.nodes.entry(workflow.id).or_insert_with(|| HierarchyNode {
            name: String::new(),
            status: workflow.status,
            progress: 0.0,
            parent: None,
            children: Vec::new(),
        });
        node.name = workflow.name().to_string();
        node.status = workflow.status;
        node.progress = workflow.progress;
        node.parent = parent.or(node.parent);
        for child in &workflow.children {
            if !node.children.contains(child) {
                node.children.push(*child);
            }
        }

        if let Some(parent_id) = parent {
            if let Some(parent) = self.nodes.get_mut(&parent_id) {
                if !parent.children.contains(&workflow.id) {
                    parent.children.push(workflow.id);
                }
            }
        }
        for child in &workflow.children {
            if let Some(node) = self.nodes.get_mut(child) {
                node.parent = Some(workflow.id);
            }
        }
    }

    pub fn contains(&self, id: &WorkflowId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn parent(&self, id: &WorkflowId) -> Option<WorkflowId> {
        self.nodes.get(id).and_then(|n| n.parent)
    }

    pub fn children(&self, id: &WorkflowId) -> Vec<WorkflowId> {
        self.nodes.get(id).map(|n| n.children.clone()).unwrap_or_default()
    }

    /// Every workflow below `id`, nearest first.
    pub fn descendants(&self, id: &WorkflowId) -> Vec<WorkflowId> {
        let mut out = Vec::new();
        let mut queue: VecDeque<WorkflowId> = self.children(id).into();
        while let Some(next) = queue.pop_front() {
            if out.contains(&next) {
                continue;
            }
            out.push(next);
            queue.extend(self.children(&next));
        }
        out
    }

    /// The top-level workflow `id` belongs to.
    pub fn root_of(&self, id: &WorkflowId) -> WorkflowId {
        let mut current = *id;
        let mut hops = 0;
        while let Some(parent) = self.parent(&current) {
            current = parent;
            hops += 1;
            if hops > self.nodes.len() {
                break;
            }
        }
        current
    }

    /// Levels of delegation above `id`; 0 for a top-level workflow.
    pub fn depth(&self, id: &WorkflowId) -> usize {
        let mut depth = 0;
        let mut current = *id;
        while let Some(parent) = self.parent(&current) {
            current = parent;
            depth += 1;
            if depth > self.nodes.len() {
                break;
            }
        }
        depth
    }

    /// Workflows without a known parent.
    pub fn roots(&self) -> Vec<WorkflowId> {
        let mut roots: Vec<WorkflowId> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.parent.is_none())
            .map(|(id, _)| *id)
            .collect();
        roots.sort();
        roots
    }

    pub fn to_tree(&self, id: &WorkflowId) -> Option<WorkflowTree> {
        self.build_tree_node(id, 0)
    }

    fn build_tree_node(&self, id: &WorkflowId, level: usize) -> Option<WorkflowTree> {
        let node = self.nodes.get(id)?;
        let children = if level > self.nodes.len() {
            Vec::new()
        } else {
            node.children
                .iter()
                .filter_map(|child| self.build_tree_node(child, level + 1))
                .collect()
        };
        Some(WorkflowTree {
            workflow_id: *id,
            name: node.name.clone(),
            status: node.status,
            progress: node.progress,
            children,
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ParentLink, StepDefinition, WorkflowDefinition};
    use crate::protocol::{TaskId, TopologyKind};
    use serde_json::Value;

    fn workflow(name: &str) -> WorkflowState {
        let definition =
            WorkflowDefinition::new(name, TopologyKind::Hierarchical).step(StepDefinition::task("a", "x"));
        WorkflowState::new(definition, Value::Null)
    }

    fn child_of(parent: &mut WorkflowState, name: &str) -> WorkflowState {
        let child = workflow(name).with_parent(ParentLink {
            workflow_id: parent.id,
            task_id: TaskId::new(),
        });
        parent.children.push(child.id);
        child
    }

    /// root -> (lead -> worker), side
    fn family() -> (WorkflowState, WorkflowState, WorkflowState, WorkflowState) {
        let mut root = workflow("root");
        let mut lead = child_of(&mut root, "lead");
        let side = child_of(&mut root, "side");
        let worker = child_of(&mut lead, "worker");
        (root, lead, side, worker)
    }

    #[test]
    fn test_empty() {
        let hierarchy = WorkflowHierarchy::new();
        assert!(hierarchy.is_empty());
        assert!(hierarchy.roots().is_empty());
        assert!(hierarchy.to_tree(&WorkflowId::new()).is_none());
    }

    #[test]
    fn test_links_and_depth() {
        let (root, lead, side, worker) = family();
        let hierarchy = WorkflowHierarchy::from_workflows([&root, &lead, &side, &worker]);

        assert_eq!(hierarchy.len(), 4);
        assert_eq!(hierarchy.roots(), vec![root.id]);
        assert_eq!(hierarchy.parent(&worker.id), Some(lead.id));
        assert_eq!(hierarchy.children(&root.id), vec![lead.id, side.id]);
        assert_eq!(hierarchy.depth(&root.id), 0);
        assert_eq!(hierarchy.depth(&worker.id), 2);
        assert_eq!(hierarchy.root_of(&worker.id), root.id);
    }

    #[test]
    fn test_order_of_insertion_does_not_matter() {
        let (root, lead, side, worker) = family();
        let hierarchy = WorkflowHierarchy::from_workflows([&worker, &side, &lead, &root]);
        assert_eq!(hierarchy.parent(&lead.id), Some(root.id));
        assert_eq!(hierarchy.descendants(&root.id).len(), 3);
    }

    #[test]
    fn test_descendants_nearest_first() {
        let (root, lead, side, worker) = family();
        let hierarchy = WorkflowHierarchy::from_workflows([&root, &lead, &side, &worker]);
        assert_eq!(hierarchy.descendants(&root.id), vec![lead.id, side.id, worker.id]);
        assert_eq!(hierarchy.descendants(&lead.id), vec![worker.id]);
        assert!(hierarchy.descendants(&side.id).is_empty());
    }

    #[test]
    fn test_to_tree() {
        let (root, lead, side, worker) = family();
        let hierarchy = WorkflowHierarchy::from_workflows([&root, &lead, &side, &worker]);

        let tree = hierarchy.to_tree(&root.id).unwrap();
        assert_eq!(tree.name, "root");
        assert_eq!(tree.children.len(), 2);
        assert_eq!(tree.children[0].name, "lead");
        assert_eq!(tree.children[0].children[0].workflow_id, worker.id);
        assert_eq!(tree.children[1].status, WorkflowStatus::Created);
    }

    #[test]
    fn test_unknown_child_is_skipped_in_tree() {
        let mut root = workflow("root");
        root.children.push(WorkflowId::new());
        let hierarchy = WorkflowHierarchy::from_workflows([&root]);

        assert_eq!(hierarchy.children(&root.id).len(), 1);
        assert!(hierarchy.to_tree(&root.id).unwrap().children.is_empty());
    }
}
