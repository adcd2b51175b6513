use std::sync::Arc;

use tracing::{debug, warn};

use crate::context::Context;
use crate::step::{Step, StepOutcome, CANONICAL_ORDER};

#[derive(Debug, thiserror::Error)]
pub enum PipelineBuildError {
    #[error("step order mismatch: expected {expected:?}, got {got:?}")]
    OrderMismatch {
        expected: &'static [&'static str],
        got: Vec<&'static str>,
    },
}

/// Executes the fixed, ordered pipeline, stopping at the first terminal
/// response produced before upstream dispatch (spec.md §4.1).
///
/// Generalizes the teacher's `PluginPipeline`: instead of a priority-sorted
/// set of plugins per lifecycle phase, this runner iterates one fixed
/// `Vec<Arc<dyn Step>>` built once at startup, since spec.md's pipeline has
/// no per-deployment plugin configuration — the step list itself is the
/// configuration.
pub struct PipelineRunner {
    steps: Vec<Arc<dyn Step>>,
    upstream_dispatch_index: usize,
}

impl PipelineRunner {
    /// Builds a runner from steps supplied in canonical order. Returns an
    /// error if the caller's step names don't match [`CANONICAL_ORDER`] —
    /// this pipeline has no notion of optional or reordered steps.
    pub fn build(steps: Vec<Arc<dyn Step>>) -> Result<Self, PipelineBuildError> {
        let got: Vec<&'static str> = steps.iter().map(|s| s.name()).collect();
        if got.as_slice() != CANONICAL_ORDER {
            return Err(PipelineBuildError::OrderMismatch {
                expected: CANONICAL_ORDER,
                got,
            });
        }
        let upstream_dispatch_index = CANONICAL_ORDER
            .iter()
            .position(|n| *n == "upstream-dispatch")
            .expect("canonical order always contains upstream-dispatch");
        Ok(Self {
            steps,
            upstream_dispatch_index,
        })
    }

    /// Runs the full pipeline over one request context, returning the
    /// context with `terminal_response` populated. A terminal produced by a
    /// step before `upstream-dispatch` short-circuits the remaining tail
    /// (cache-write, analytics never run); a terminal produced at or after
    /// `upstream-dispatch` lets the tail continue so cache-write/analytics
    /// still see the response (spec.md §4.1).
    pub async fn run(&self, ctx: Context) -> Context {
        self.run_with_cancellation(ctx, None).await
    }

    /// Like [`Self::run`], but races each step against `cancel` turning
    /// `true` (spec.md §5). A cancellation mid-step drops that step's future
    /// — an in-flight `reqwest` call is aborted rather than awaited to
    /// completion — sets `ctx.cancelled`, and breaks out of the loop, so the
    /// existing short-circuit-before-upstream-dispatch logic already skips
    /// cache-write/analytics on its own.
    pub async fn run_with_cancellation(
        &self,
        mut ctx: Context,
        mut cancel: Option<tokio::sync::watch::Receiver<bool>>,
    ) -> Context {
        for (index, step) in self.steps.iter().enumerate() {
            if let Some(cancel) = cancel.as_ref() {
                if *cancel.borrow() {
                    ctx.cancelled = true;
                }
            }
            if ctx.cancelled {
                debug!("pipeline cancelled before step {}", step.name());
                break;
            }

            debug!(step = step.name(), "executing pipeline step");
            let outcome = match cancel.as_mut() {
                Some(cancel) => {
                    tokio::select! {
                        outcome = step.run(&mut ctx) => outcome,
                        _ = cancel.changed() => {
                            debug!(step = step.name(), "pipeline cancelled mid-step");
                            ctx.cancelled = true;
                            break;
                        }
                    }
                }
                None => step.run(&mut ctx).await,
            };

            match outcome {
                StepOutcome::Continue => {}
                StepOutcome::Terminal(response) => {
                    debug!(step = step.name(), status = response.status, "step produced terminal response");
                    ctx.terminal_response = Some(response);
                }
            }

            if ctx.terminal_response.is_some() && index < self.upstream_dispatch_index {
                warn_skipped_tail(step.name());
                break;
            }
        }
        ctx
    }
}

fn warn_skipped_tail(at_step: &str) {
    debug!(step = at_step, "terminal response before upstream-dispatch; skipping cache-write/analytics");
}
