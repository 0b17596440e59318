// The render graph
//
// A partial order over render stages. Each stage owns an
// insertion-ordered list of render passes. Stages are placed relative
// to one another with first/before/after; inserting is O(1) because
// only the constraint is recorded. Iteration materializes the implied
// order once and caches it until the next mutation: the topological
// order of the constraints, with ties broken by the order in which
// stages were first mentioned.

use std::collections::HashMap;

use crate::{Result, StratusError};

/// Identifies one render stage. Values are chosen by the application.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct StageId(pub u32);

/// Identifies one render pass inside a `RenderPassStore`.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct PassId(pub u32);

struct StageInfo {
    si_id: StageId,
    si_passes: Vec<PassId>,
}

pub struct RenderGraph {
    /// Stages in the order they were first mentioned
    rg_stages: Vec<StageInfo>,
    rg_index: HashMap<StageId, usize>,
    /// Ordering constraints (earlier, later), by insertion index
    rg_edges: Vec<(usize, usize)>,
    /// The stage that precedes all others, if declared
    rg_head: Option<usize>,
    /// Cached iteration order, invalidated on mutation
    rg_order: Option<Vec<usize>>,
}

impl RenderGraph {
    pub fn new() -> Self {
        Self {
            rg_stages: Vec::new(),
            rg_index: HashMap::new(),
            rg_edges: Vec::new(),
            rg_head: None,
            rg_order: None,
        }
    }

    fn intern(&mut self, stage: StageId) -> usize {
        if let Some(&idx) = self.rg_index.get(&stage) {
            return idx;
        }
        let idx = self.rg_stages.len();
        self.rg_stages.push(StageInfo {
            si_id: stage,
            si_passes: Vec::new(),
        });
        self.rg_index.insert(stage, idx);
        idx
    }

    /// Declare `stage` as the head of the graph. It precedes every
    /// other stage.
    pub fn first(&mut self, stage: StageId) {
        let idx = self.intern(stage);
        self.rg_head = Some(idx);
        self.rg_order = None;
    }

    /// Insert `new_stage` so that it executes before `next`.
    pub fn before(&mut self, next: StageId, new_stage: StageId) -> Result<()> {
        if !self.rg_index.contains_key(&next) {
            return Err(StratusError::VALIDATION_FAILED);
        }
        let new_idx = self.intern(new_stage);
        let next_idx = self.rg_index[&next];
        self.rg_edges.push((new_idx, next_idx));
        self.rg_order = None;
        Ok(())
    }

    /// Insert `new_stage` so that it executes after `prev`.
    pub fn after(&mut self, prev: StageId, new_stage: StageId) -> Result<()> {
        if !self.rg_index.contains_key(&prev) {
            return Err(StratusError::VALIDATION_FAILED);
        }
        let new_idx = self.intern(new_stage);
        let prev_idx = self.rg_index[&prev];
        self.rg_edges.push((prev_idx, new_idx));
        self.rg_order = None;
        Ok(())
    }

    pub fn contains(&self, stage: StageId) -> bool {
        self.rg_index.contains_key(&stage)
    }

    /// Append a pass to a stage's list.
    pub fn add_pass(&mut self, stage: StageId, pass: PassId) -> Result<()> {
        let idx = *self
            .rg_index
            .get(&stage)
            .ok_or(StratusError::VALIDATION_FAILED)?;
        self.rg_stages[idx].si_passes.push(pass);
        Ok(())
    }

    pub fn remove_pass(&mut self, stage: StageId, pass: PassId) -> Result<()> {
        let idx = *self
            .rg_index
            .get(&stage)
            .ok_or(StratusError::VALIDATION_FAILED)?;
        self.rg_stages[idx].si_passes.retain(|&p| p != pass);
        Ok(())
    }

    pub fn passes(&self, stage: StageId) -> &[PassId] {
        match self.rg_index.get(&stage) {
            Some(&idx) => &self.rg_stages[idx].si_passes,
            None => &[],
        }
    }

    fn resolve_order(&mut self) -> Result<()> {
        if self.rg_order.is_some() {
            return Ok(());
        }

        let n = self.rg_stages.len();
        let mut indegree = vec![0usize; n];
        let mut succs: Vec<Vec<usize>> = vec![Vec::new(); n];
        for &(earlier, later) in self.rg_edges.iter() {
            succs[earlier].push(later);
            indegree[later] += 1;
        }
        // The head precedes everything that has no other predecessor
        // forcing it later anyway
        if let Some(head) = self.rg_head {
            for i in 0..n {
                if i != head && indegree[i] == 0 {
                    succs[head].push(i);
                }
            }
            for &later in succs[head].iter() {
                if indegree[later] == 0 {
                    indegree[later] = 1;
                }
            }
        }

        let mut emitted = vec![false; n];
        let mut order = Vec::with_capacity(n);
        for _ in 0..n {
            // Lowest insertion index among the ready stages. This is
            // what makes ties deterministic.
            let next = (0..n).find(|&i| !emitted[i] && indegree[i] == 0);
            let next = match next {
                Some(i) => i,
                // Everything left is waiting on something: a cycle
                None => return Err(StratusError::VALIDATION_FAILED),
            };

            emitted[next] = true;
            order.push(next);
            for &later in succs[next].iter() {
                indegree[later] -= 1;
            }
        }

        self.rg_order = Some(order);
        Ok(())
    }

    /// The stage iteration order implied by the first/before/after
    /// calls so far.
    pub fn stage_order(&mut self) -> Result<Vec<StageId>> {
        self.resolve_order()?;
        Ok(self
            .rg_order
            .as_ref()
            .unwrap()
            .iter()
            .map(|&i| self.rg_stages[i].si_id)
            .collect())
    }

    /// Visit every stage in order, with its pass list.
    pub fn for_each_stage<F>(&mut self, mut func: F) -> Result<()>
    where
        F: FnMut(StageId, &[PassId]),
    {
        self.resolve_order()?;
        let order = self.rg_order.as_ref().unwrap();
        for &idx in order.iter() {
            let info = &self.rg_stages[idx];
            func(info.si_id, &info.si_passes);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: StageId = StageId(0);
    const B: StageId = StageId(1);
    const C: StageId = StageId(2);
    const D: StageId = StageId(3);

    #[test]
    fn relative_insertion_order() {
        let mut graph = RenderGraph::new();
        graph.first(A);
        graph.after(A, B).unwrap();
        graph.before(B, C).unwrap();
        graph.after(C, D).unwrap();

        assert_eq!(graph.stage_order().unwrap(), vec![A, C, B, D]);
    }

    #[test]
    fn simple_chain() {
        let mut graph = RenderGraph::new();
        graph.first(A);
        graph.after(A, B).unwrap();
        graph.after(B, C).unwrap();

        assert_eq!(graph.stage_order().unwrap(), vec![A, B, C]);
        assert!(graph.contains(B));
        assert!(!graph.contains(D));
    }

    #[test]
    fn before_the_head_still_runs_after_it() {
        // first() pins its stage ahead of everything, so a stage
        // inserted "before B" lands between the head and B
        let mut graph = RenderGraph::new();
        graph.first(A);
        graph.after(A, B).unwrap();
        graph.before(B, C).unwrap();

        assert_eq!(graph.stage_order().unwrap(), vec![A, C, B]);
    }

    #[test]
    fn unknown_anchor_is_rejected() {
        let mut graph = RenderGraph::new();
        graph.first(A);
        assert_eq!(graph.after(B, C), Err(StratusError::VALIDATION_FAILED));
        assert_eq!(graph.before(B, C), Err(StratusError::VALIDATION_FAILED));
    }

    #[test]
    fn cycle_is_reported() {
        let mut graph = RenderGraph::new();
        graph.first(A);
        graph.after(A, B).unwrap();
        graph.after(B, C).unwrap();
        graph.before(B, C).unwrap(); // C < B and B < C

        assert_eq!(graph.stage_order(), Err(StratusError::VALIDATION_FAILED));
    }

    #[test]
    fn passes_keep_insertion_order() {
        let mut graph = RenderGraph::new();
        graph.first(A);
        graph.add_pass(A, PassId(10)).unwrap();
        graph.add_pass(A, PassId(4)).unwrap();
        graph.add_pass(A, PassId(7)).unwrap();

        assert_eq!(graph.passes(A), &[PassId(10), PassId(4), PassId(7)]);

        graph.remove_pass(A, PassId(4)).unwrap();
        assert_eq!(graph.passes(A), &[PassId(10), PassId(7)]);

        assert_eq!(
            graph.add_pass(D, PassId(0)),
            Err(StratusError::VALIDATION_FAILED)
        );
    }

    #[test]
    fn order_is_recomputed_after_mutation() {
        let mut graph = RenderGraph::new();
        graph.first(A);
        graph.after(A, B).unwrap();
        assert_eq!(graph.stage_order().unwrap(), vec![A, B]);

        graph.before(B, C).unwrap();
        assert_eq!(graph.stage_order().unwrap(), vec![A, C, B]);
    }
}
