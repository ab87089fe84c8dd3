//! Compensation stack for workflows that span several aggregates.
//!
//! Each completed step pushes the action that undoes it. If a later step fails the
//! workflow calls [`Compensations::compensate`], which runs the undo actions newest
//! first. A failing undo action is logged and does not stop the remaining ones.

use tracing::{debug, warn};

type Undo<'a, E> = Box<dyn FnOnce() -> Result<(), E> + 'a>;

pub struct Compensations<'a, E> {
    workflow: &'static str,
    steps: Vec<(&'static str, Undo<'a, E>)>,
}

impl<'a, E: core::fmt::Display> Compensations<'a, E> {
    pub fn new(workflow: &'static str) -> Self {
        Self {
            workflow,
            steps: Vec::new(),
        }
    }

    pub fn push(&mut self, label: &'static str, undo: impl FnOnce() -> Result<(), E> + 'a) {
        self.steps.push((label, Box::new(undo)));
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// The workflow succeeded; drop every undo action.
    pub fn commit(self) {
        debug!(workflow = self.workflow, steps = self.steps.len(), "workflow committed");
    }

    /// Undo completed steps, newest first. Returns the labels whose undo failed.
    pub fn compensate(self) -> Vec<&'static str> {
        let workflow = self.workflow;
        let mut failed = Vec::new();
        for (label, undo) in self.steps.into_iter().rev() {
            match undo() {
                Ok(()) => debug!(workflow, step = label, "step compensated"),
                Err(error) => {
                    warn!(workflow, step = label, error = %error, "compensation failed");
                    failed.push(label);
                }
            }
        }
        failed
    }
}
