use std::sync::Arc;

use floorplan_core::{AliasTable, EntityState};
use floorplan_queue::UpdateReceiver;
use metrics::counter;
use tracing::{debug, error, info};

use crate::{Renderer, VisualClass};

/// Result of applying a single record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied(VisualClass),
    /// No element for this entity; nothing was touched.
    Missing,
    /// At least one renderer call failed.
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplierStats {
    pub applied: u64,
    pub missing: u64,
    pub failed: u64,
}

/// Consumes entity states and tags renderer elements with the matching class.
pub struct Applier {
    renderer: Arc<dyn Renderer>,
    aliases: Arc<AliasTable>,
    stats: ApplierStats,
}

impl Applier {
    pub fn new(renderer: Arc<dyn Renderer>, aliases: Arc<AliasTable>) -> Self {
        Self { renderer, aliases, stats: ApplierStats::default() }
    }

    pub fn stats(&self) -> ApplierStats { self.stats }

    /// Remove all state classes from the element, then add the one for `state`.
    ///
    /// Safe to repeat: the last applied record decides the final class.
    pub fn apply(&mut self, state: &EntityState) -> ApplyOutcome {
        let outcome = self.apply_inner(state);
        match outcome {
            ApplyOutcome::Applied(_) => {
                self.stats.applied += 1;
                counter!("floorplan_applied_total", 1u64);
            }
            ApplyOutcome::Missing => self.stats.missing += 1,
            ApplyOutcome::Failed => {
                self.stats.failed += 1;
                counter!("floorplan_render_errors_total", 1u64);
            }
        }
        outcome
    }

    fn apply_inner(&self, state: &EntityState) -> ApplyOutcome {
        let element_id = self.aliases.resolve(state.id());
        let element = match self.renderer.find(element_id) {
            Ok(Some(el)) => el,
            Ok(None) => {
                debug!(entity = %state.id(), element = %element_id, "no element for entity");
                return ApplyOutcome::Missing;
            }
            Err(e) => {
                error!(entity = %state.id(), element = %element_id, error = %e, "could not find object");
                return ApplyOutcome::Failed;
            }
        };

        let class = VisualClass::from(state.value());
        let mut ok = true;
        if let Err(e) = self.renderer.remove_classes(&element, &VisualClass::all_names()) {
            error!(entity = %state.id(), element = %element.selector(), error = %e, "could not update state");
            ok = false;
        }
        if let Err(e) = self.renderer.add_class(&element, class.as_str()) {
            error!(entity = %state.id(), element = %element.selector(), error = %e, "could not update state");
            ok = false;
        }
        if ok {
            debug!(entity = %state.id(), element = %element.selector(), class = class.as_str(), "state applied");
            ApplyOutcome::Applied(class)
        } else {
            ApplyOutcome::Failed
        }
    }

    /// Drain the queue until its owner closes it. Returns the final counters.
    pub async fn run(mut self, mut rx: UpdateReceiver) -> ApplierStats {
        info!("applier started");
        while let Some(state) = rx.recv().await {
            self.apply(&state);
        }
        info!(applied = self.stats.applied, missing = self.stats.missing, failed = self.stats.failed, "applier stopped");
        self.stats
    }
}
