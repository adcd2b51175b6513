use async_trait::async_trait;

use crate::context::{Context, TerminalResponse};

/// The outcome of running one step (spec.md §4.1, §9 — "a slice of `Step
/// func(Ctx) Ctx`", not a subclass hierarchy).
pub enum StepOutcome {
    Continue,
    Terminal(TerminalResponse),
}

/// One stage of the request pipeline. Steps must be idempotent with respect
/// to the fields they themselves produce (spec.md §4.1).
#[async_trait]
pub trait Step: Send + Sync {
    /// Stable identifier used for the pipeline's canonical ordering and for
    /// tracing spans. Must be unique within a [`crate::runner::PipelineRunner`].
    fn name(&self) -> &'static str;

    async fn run(&self, ctx: &mut Context) -> StepOutcome;
}

/// Canonical step order (spec.md §2, §4.1). `PipelineRunner::build` asserts
/// the supplied steps match this sequence by name.
pub const CANONICAL_ORDER: &[&str] = &[
    "auth-resolve",
    "inspect-tool-call",
    "rate-limit",
    "cache-read",
    "forward-prepare",
    "payment-gate",
    "upstream-dispatch",
    "cache-write",
    "analytics",
];
