// The render graph
//
// A directed acyclic graph of passes, kept in submission order. The
// graph walks a strict state ladder: EMPTY < INVALID < VALIDATED <
// WARMED < BUILT. A structural edit drops it to INVALID, and the
// next warmup/build purges (destructs every pass) before analyzing
// again.

extern crate utils;
use crate::pass::Pass;
use crate::renderer::RendererShared;
use crate::swapchain::RecreateFlags;
use crate::{Result, StratusError};
use utils::log;

use std::sync::{Arc, Weak};

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum GraphState {
    Empty,
    /// Needs to purge.
    Invalid,
    Validated,
    Warmed,
    Built,
}

pub(crate) struct Graph {
    /// Sink passes (tree roots in reverse).
    sinks: Vec<Arc<Pass>>,
    /// All passes, in submission order.
    passes: Vec<Arc<Pass>>,

    state: GraphState,
}

impl Graph {
    pub(crate) fn new() -> Self {
        Self {
            sinks: Vec::new(),
            passes: Vec::new(),
            // No graph is a valid graph.
            state: GraphState::Built,
        }
    }

    pub(crate) fn state(&self) -> GraphState {
        self.state
    }

    pub(crate) fn num_sinks(&self) -> usize {
        self.sinks.len()
    }

    pub(crate) fn sink(&self, index: usize) -> Option<Arc<Pass>> {
        self.sinks.get(index).cloned()
    }

    pub(crate) fn passes(&self) -> &[Arc<Pass>] {
        &self.passes
    }

    /// Promptly purge (destruct) all passes, leaving the graph empty.
    fn purge(&mut self) {
        for pass in self.passes.iter() {
            pass.destruct();
        }

        self.state = GraphState::Empty;
    }

    /// Analyze the render graph to set all passes up for correct
    /// builds. VALIDATED is a stable state, analysis does not need to
    /// run again until the graph is invalidated.
    fn analyze(&mut self) -> bool {
        // TODO: analyze the graph for e.g. pass merging

        self.state = GraphState::Validated;
        true
    }

    /// Add a pass to the graph, linked below the given parents.
    pub(crate) fn add_pass(
        &mut self,
        shared: Weak<RendererShared>,
        parents: &[Arc<Pass>],
    ) -> Result<Arc<Pass>> {
        // Every parent must be of this graph.
        for parent in parents.iter() {
            if !self.passes.iter().any(|p| Arc::ptr_eq(p, parent)) {
                log::error!("Could not add a new pass to a renderer's graph.");
                return Err(StratusError::INVALID);
            }
        }

        let level = parents
            .iter()
            .map(|p| p.level() + 1)
            .max()
            .unwrap_or(0);

        let weak_parents: Vec<Weak<Pass>> = parents.iter().map(Arc::downgrade).collect();
        let pass = Arc::new(Pass::new(shared, level, weak_parents));

        // Add the new pass as a sink, as it has no 'children' yet.
        self.sinks.push(pass.clone());

        // Find the right place to insert the new pass at, we pre-sort
        // on level, this essentially makes it such that every pass is
        // submitted as early as possible. Note that within a level,
        // the adding order is preserved. Backwards linear search is
        // probably in-line with the adding order :p
        let mut loc = self.passes.len();
        while loc > 0 {
            if self.passes[loc - 1].level() <= pass.level() {
                break;
            }
            loc -= 1;
        }
        self.passes.insert(loc, pass.clone());

        // Loop through all sinks, remove if it's now a parent.
        // Skip the last element, as we just added that.
        let last = self.sinks.len() - 1;
        let mut t = last;
        while t > 0 {
            t -= 1;
            if parents.iter().any(|p| Arc::ptr_eq(p, &self.sinks[t])) {
                self.sinks.remove(t);
            }
        }

        // We added a pass, we need to re-analyze because we may have
        // new parent/child links.
        if self.state != GraphState::Empty {
            self.state = if self.passes.len() > 1 {
                GraphState::Invalid
            } else {
                // If the first pass, no need to purge.
                GraphState::Empty
            };
        }

        Ok(pass)
    }

    /// Build the backend render passes if not present yet. Can be
    /// used for pipeline warmups.
    pub(crate) fn warmup(&mut self) -> Result<()> {
        // Already done.
        if self.state >= GraphState::Warmed {
            return Ok(());
        }

        // With the same logic as building; we purge all things first.
        if self.state == GraphState::Invalid {
            self.purge();
        }

        // If not valid yet, analyze the graph.
        if self.state < GraphState::Validated && !self.analyze() {
            return Err(StratusError::INVALID);
        }

        // And then make sure all passes are warmed up!
        let mut failed = 0usize;
        for pass in self.passes.iter() {
            // No need to worry about destructing, state remains
            // 'validated'.
            failed += pass.warmup().is_err() as usize;
        }

        if failed > 0 {
            log::error!(
                "Failed to warmup {} pass(es) of the renderer's graph.",
                failed
            );
            return Err(StratusError::INCOMPLETE);
        }

        // Not completely built, but it can be invalidated.
        self.state = GraphState::Warmed;
        Ok(())
    }

    /// (Re)build the render graph and all its resources. Resolves to
    /// a no-op if everything is already built.
    pub(crate) fn build(&mut self) -> Result<()> {
        // Already done.
        if self.state == GraphState::Built {
            return Ok(());
        }

        // When the graph is not valid, it needs to be entirely
        // rebuilt; optimizations such as merging passes may change,
        // we want to capture these changes.
        if self.state == GraphState::Invalid {
            self.purge();
        }

        if self.state < GraphState::Validated && !self.analyze() {
            return Err(StratusError::INVALID);
        }

        let mut failed = 0usize;
        for (i, pass) in self.passes.iter().enumerate() {
            // The pass itself logs errors. No need to worry about
            // destructing, state remains 'validated'.
            failed += pass.build(RecreateFlags::empty()).is_err() as usize;

            // At this point we also sneakedly set the order of all
            // passes so the recorders know what's up.
            pass.set_order(i as u32);
        }

        if failed > 0 {
            log::error!(
                "Failed to build {} pass(es) of the renderer's graph.",
                failed
            );
            return Err(StratusError::INCOMPLETE);
        }

        self.state = GraphState::Built;
        Ok(())
    }

    /// (Re)build resources dependent on the attachment at `index`,
    /// suitable for on-swapchain-recreate.
    pub(crate) fn rebuild(&mut self, index: usize, flags: RecreateFlags) {
        // Nothing to rebuild if nothing is built.
        if self.state < GraphState::Warmed {
            return;
        }

        // Rebuild every pass that writes to the attachment as a
        // window back-buffer or consumes it in any other way.
        let mut failed = 0usize;
        for pass in self.passes.iter() {
            let uses = pass.p_build.read().unwrap().backing == Some(index)
                || pass.consumes_attachment(index);
            if uses {
                // If we fail, just ignore and signal we're not built.
                // Will be tried again in build.
                failed += pass.build(flags).is_err() as usize;
            }
        }

        if failed > 0 {
            log::error!(
                "Failed to rebuild {} pass(es) of the renderer's graph.",
                failed
            );

            // The graph is not invalid, but incomplete.
            self.state = GraphState::Validated;
        }
    }

    /// Destruct everything that depends on the attachment at `index`.
    /// Must be called before detaching it.
    pub(crate) fn destruct(&mut self, index: usize) {
        for pass in self.passes.iter() {
            let uses = pass.p_build.read().unwrap().backing == Some(index)
                || pass.consumes_attachment(index);
            if uses {
                pass.destruct();

                // The graph is incomplete now.
                if self.state >= GraphState::Warmed {
                    self.state = GraphState::Validated;
                }
            }
        }
    }

    /// Invalidate the graph, forcing a purge and re-analysis on the
    /// next warmup/build.
    pub(crate) fn invalidate(&mut self) {
        if self.state != GraphState::Empty {
            self.state = GraphState::Invalid;
        }
    }

    /// Destroy all passes.
    ///
    /// We want to make sure we do not destroy any pass before all
    /// passes that reference it are destroyed. Luckily, all parents
    /// of a pass will be to its left due to submission order, which
    /// is always honored. So we destroy 'em all in reverse order :)
    pub(crate) fn clear(&mut self) {
        while let Some(pass) = self.passes.pop() {
            debug_assert!(
                !self.passes.iter().any(|p| p.is_parent(&pass)),
                "destroying a pass that is still someone's parent"
            );
            pass.destruct();
        }
        self.sinks.clear();

        self.state = GraphState::Built;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Passes only upgrade their renderer back-reference when they
    // touch vulkan, so structural tests run on a dangling one.
    fn mk_shared() -> Weak<RendererShared> {
        Weak::new()
    }

    #[test]
    fn linear_chain_orders_and_sinks() {
        let shared = mk_shared();
        let mut graph = Graph::new();

        let a = graph.add_pass(shared.clone(), &[]).unwrap();
        let b = graph.add_pass(shared.clone(), &[a.clone()]).unwrap();
        let c = graph.add_pass(shared.clone(), &[b.clone()]).unwrap();

        assert_eq!(graph.num_sinks(), 1);
        assert!(Arc::ptr_eq(&graph.sink(0).unwrap(), &c));

        assert_eq!(a.level(), 0);
        assert_eq!(b.level(), 1);
        assert_eq!(c.level(), 2);

        // Topological order: every parent sits left of its children
        // at a strictly smaller level.
        let passes = graph.passes();
        for (i, pass) in passes.iter().enumerate() {
            for parent in passes.iter().take(i) {
                assert!(parent.level() <= pass.level());
            }
        }
    }

    #[test]
    fn diamond_preserves_insertion_order_within_levels() {
        let shared = mk_shared();
        let mut graph = Graph::new();

        let a = graph.add_pass(shared.clone(), &[]).unwrap();
        let b = graph.add_pass(shared.clone(), &[a.clone()]).unwrap();
        let c = graph.add_pass(shared.clone(), &[a.clone()]).unwrap();
        let d = graph.add_pass(shared.clone(), &[b.clone(), c.clone()]).unwrap();

        let passes = graph.passes();
        assert_eq!(passes.len(), 4);
        assert!(Arc::ptr_eq(&passes[0], &a));
        assert!(Arc::ptr_eq(&passes[1], &b));
        assert!(Arc::ptr_eq(&passes[2], &c));
        assert!(Arc::ptr_eq(&passes[3], &d));

        assert_eq!(graph.num_sinks(), 1);
        assert!(Arc::ptr_eq(&graph.sink(0).unwrap(), &d));
    }

    #[test]
    fn sinks_are_the_childless_passes() {
        let shared = mk_shared();
        let mut graph = Graph::new();

        let a = graph.add_pass(shared.clone(), &[]).unwrap();
        let _b = graph.add_pass(shared.clone(), &[a.clone()]).unwrap();
        let _c = graph.add_pass(shared.clone(), &[a.clone()]).unwrap();

        // b and c have no children, a does.
        assert_eq!(graph.num_sinks(), 2);
        let passes = graph.passes();
        for sink_i in 0..graph.num_sinks() {
            let sink = graph.sink(sink_i).unwrap();
            assert!(!passes.iter().any(|p| p.is_parent(&sink)));
        }
    }

    #[test]
    fn state_ladder() {
        let shared = mk_shared();
        let mut graph = Graph::new();

        // No graph is a valid graph.
        assert_eq!(graph.state(), GraphState::Built);

        // The first pass leaves the graph merely empty, and with
        // nothing analyzed yet further edits have nothing to purge.
        let a = graph.add_pass(shared.clone(), &[]).unwrap();
        assert_eq!(graph.state(), GraphState::Empty);
        let _b = graph.add_pass(shared.clone(), &[a.clone()]).unwrap();
        assert_eq!(graph.state(), GraphState::Empty);

        // Analysis moves past empty even when the device-side warmup
        // fails (these passes have no renderer behind them).
        graph.warmup().ok();
        assert_eq!(graph.state(), GraphState::Validated);
        graph.invalidate();
        assert_eq!(graph.state(), GraphState::Invalid);

        let _c = graph.add_pass(shared.clone(), &[a.clone()]).unwrap();
        assert_eq!(graph.state(), GraphState::Invalid);

        graph.clear();
        assert_eq!(graph.state(), GraphState::Built);
    }

    #[test]
    fn foreign_parents_are_rejected() {
        let shared = mk_shared();
        let mut graph_a = Graph::new();
        let mut graph_b = Graph::new();

        let a = graph_a.add_pass(shared.clone(), &[]).unwrap();
        assert!(graph_b.add_pass(shared.clone(), &[a]).is_err());
        assert_eq!(graph_b.num_sinks(), 0);
    }
}
