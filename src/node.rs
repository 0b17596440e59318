// Scene graph nodes
//
// Transforms with parent/child links, stored in an arena and addressed
// by index. Links are ids, never owning pointers, so cycles cannot form
// through ownership and detach is a constant-time id fixup. The
// invariant maintained throughout: a child's parent always lists the
// child in its children vector.

use cgmath::{Matrix4, Quaternion, SquareMatrix, Vector3};

use crate::util::{IdPool, IndexMap};
use crate::{Result, StratusError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub u32);

pub struct Node {
    n_translation: Vector3<f32>,
    n_rotation: Quaternion<f32>,
    n_scale: Vector3<f32>,
    n_parent: Option<NodeId>,
    n_children: Vec<NodeId>,
    /// World matrix from the last propagation pass
    n_world: Matrix4<f32>,
}

impl Node {
    fn new() -> Self {
        Self {
            n_translation: Vector3::new(0.0, 0.0, 0.0),
            n_rotation: Quaternion::new(1.0, 0.0, 0.0, 0.0),
            n_scale: Vector3::new(1.0, 1.0, 1.0),
            n_parent: None,
            n_children: Vec::new(),
            n_world: Matrix4::identity(),
        }
    }

    pub fn local_matrix(&self) -> Matrix4<f32> {
        Matrix4::from_translation(self.n_translation)
            * Matrix4::from(self.n_rotation)
            * Matrix4::from_nonuniform_scale(self.n_scale.x, self.n_scale.y, self.n_scale.z)
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.n_parent
    }

    pub fn children(&self) -> &[NodeId] {
        &self.n_children
    }
}

pub struct NodeArena {
    na_nodes: IndexMap<Node>,
    na_ids: IdPool,
}

impl NodeArena {
    pub fn new() -> Self {
        Self {
            na_nodes: IndexMap::new(),
            na_ids: IdPool::new(),
        }
    }

    pub fn make_node(&mut self) -> NodeId {
        let id = self.na_ids.generate();
        self.na_nodes.insert(id, Node::new());
        NodeId(id)
    }

    /// Remove a node. Children are detached, not destroyed.
    pub fn destroy_node(&mut self, id: NodeId) {
        let children = match self.na_nodes.get(id.0) {
            Some(node) => node.n_children.clone(),
            None => return,
        };
        for child in children {
            let _ = self.detach(child);
        }
        let _ = self.detach(id);

        self.na_nodes.remove(id.0);
        self.na_ids.free(id.0);
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.na_nodes.get(id.0)
    }

    pub fn set_translation(&mut self, id: NodeId, t: Vector3<f32>) {
        if let Some(node) = self.na_nodes.get_mut(id.0) {
            node.n_translation = t;
        }
    }

    pub fn set_rotation(&mut self, id: NodeId, r: Quaternion<f32>) {
        if let Some(node) = self.na_nodes.get_mut(id.0) {
            node.n_rotation = r;
        }
    }

    pub fn set_scale(&mut self, id: NodeId, s: Vector3<f32>) {
        if let Some(node) = self.na_nodes.get_mut(id.0) {
            node.n_scale = s;
        }
    }

    /// Make `child` a child of `parent`. A node has at most one parent;
    /// attaching an already attached node reparents it.
    pub fn attach(&mut self, parent: NodeId, child: NodeId) -> Result<()> {
        if parent == child
            || !self.na_nodes.contains(parent.0)
            || !self.na_nodes.contains(child.0)
        {
            return Err(StratusError::VALIDATION_FAILED);
        }
        // Re-rooting a node under its own descendant would cycle
        let mut cursor = Some(parent);
        while let Some(id) = cursor {
            if id == child {
                return Err(StratusError::VALIDATION_FAILED);
            }
            cursor = self.na_nodes.get(id.0).and_then(|n| n.n_parent);
        }

        self.detach(child)?;

        self.na_nodes.get_mut(child.0).unwrap().n_parent = Some(parent);
        self.na_nodes
            .get_mut(parent.0)
            .unwrap()
            .n_children
            .push(child);
        Ok(())
    }

    /// Unlink `child` from its parent, if it has one.
    pub fn detach(&mut self, child: NodeId) -> Result<()> {
        let parent = match self.na_nodes.get(child.0) {
            Some(node) => node.n_parent,
            None => return Err(StratusError::VALIDATION_FAILED),
        };

        if let Some(parent) = parent {
            self.na_nodes.get_mut(child.0).unwrap().n_parent = None;
            let siblings = &mut self.na_nodes.get_mut(parent.0).unwrap().n_children;
            siblings.retain(|&c| c != child);
        }
        Ok(())
    }

    /// Recompute world matrices for every node, roots first.
    pub fn update_world_matrices(&mut self) {
        let roots: Vec<NodeId> = self
            .na_nodes
            .iter()
            .filter(|(_, n)| n.n_parent.is_none())
            .map(|(id, _)| NodeId(id))
            .collect();

        for root in roots {
            self.propagate(root, Matrix4::identity());
        }
    }

    fn propagate(&mut self, id: NodeId, parent_world: Matrix4<f32>) {
        let (world, children) = {
            let node = match self.na_nodes.get_mut(id.0) {
                Some(n) => n,
                None => return,
            };
            node.n_world = parent_world * node.local_matrix();
            (node.n_world, node.n_children.clone())
        };

        for child in children {
            self.propagate(child, world);
        }
    }

    pub fn world_matrix(&self, id: NodeId) -> Matrix4<f32> {
        self.na_nodes
            .get(id.0)
            .map(|n| n.n_world)
            .unwrap_or_else(Matrix4::identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attach_maintains_child_list_invariant() {
        let mut arena = NodeArena::new();
        let parent = arena.make_node();
        let child = arena.make_node();

        arena.attach(parent, child).unwrap();
        assert_eq!(arena.get(child).unwrap().parent(), Some(parent));
        assert!(arena.get(parent).unwrap().children().contains(&child));

        arena.detach(child).unwrap();
        assert_eq!(arena.get(child).unwrap().parent(), None);
        assert!(!arena.get(parent).unwrap().children().contains(&child));
    }

    #[test]
    fn reparenting_moves_between_child_lists() {
        let mut arena = NodeArena::new();
        let a = arena.make_node();
        let b = arena.make_node();
        let child = arena.make_node();

        arena.attach(a, child).unwrap();
        arena.attach(b, child).unwrap();

        assert!(!arena.get(a).unwrap().children().contains(&child));
        assert!(arena.get(b).unwrap().children().contains(&child));
        assert_eq!(arena.get(child).unwrap().parent(), Some(b));
    }

    #[test]
    fn attach_rejects_cycles() {
        let mut arena = NodeArena::new();
        let a = arena.make_node();
        let b = arena.make_node();
        let c = arena.make_node();
        arena.attach(a, b).unwrap();
        arena.attach(b, c).unwrap();

        assert_eq!(arena.attach(c, a), Err(StratusError::VALIDATION_FAILED));
        assert_eq!(arena.attach(a, a), Err(StratusError::VALIDATION_FAILED));
    }

    #[test]
    fn world_matrices_compose_down_the_tree() {
        let mut arena = NodeArena::new();
        let parent = arena.make_node();
        let child = arena.make_node();
        arena.attach(parent, child).unwrap();

        arena.set_translation(parent, Vector3::new(1.0, 0.0, 0.0));
        arena.set_translation(child, Vector3::new(0.0, 2.0, 0.0));
        arena.update_world_matrices();

        let world = arena.world_matrix(child);
        assert!((world.w.x - 1.0).abs() < 1e-6);
        assert!((world.w.y - 2.0).abs() < 1e-6);
        assert!(world.w.z.abs() < 1e-6);
    }

    #[test]
    fn destroy_detaches_children() {
        let mut arena = NodeArena::new();
        let parent = arena.make_node();
        let child = arena.make_node();
        arena.attach(parent, child).unwrap();

        arena.destroy_node(parent);
        assert!(arena.get(parent).is_none());
        assert_eq!(arena.get(child).unwrap().parent(), None);
    }
}
