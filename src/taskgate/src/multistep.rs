//! Multi-step pipelines: one gate per stage.
//!
//! A [`MultiStepGate`] holds a fixed-length sequence of independent
//! [`Gate`]s so each logical stage of a pipeline gets its own concurrency
//! cap. The coordinator imposes no ordering between steps — the user
//! callable receives the gates and acquires them in whatever order it
//! chooses.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::join_all;

use crate::gate::Gate;
use crate::options::GateOptions;

/// The step gates handed to every callable run through a
/// [`MultiStepGate`].
pub type StepGates = Arc<[Gate]>;

/// A policy-free composition of N independent gates.
///
/// Cloning produces another handle to the same step gates.
#[derive(Clone)]
pub struct MultiStepGate {
    steps: StepGates,
}

impl MultiStepGate {
    /// Build one gate per entry of `step_concurrencies`. Each value is
    /// coerced exactly like [`GateOptions::concurrency`]. The number of
    /// steps is fixed for the lifetime of the coordinator.
    pub fn new(step_concurrencies: &[f64]) -> Self {
        let steps: Vec<Gate> = step_concurrencies
            .iter()
            .map(|&limit| Gate::with_options(GateOptions::new().concurrency(limit)))
            .collect();
        Self {
            steps: steps.into(),
        }
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Direct access to one step's gate, e.g. to subscribe to its events.
    pub fn step(&self, index: usize) -> Option<&Gate> {
        self.steps.get(index)
    }

    /// Invoke `task` with the step gates.
    pub async fn run<T, F, Fut>(&self, task: F) -> T
    where
        F: FnOnce(StepGates) -> Fut,
        Fut: Future<Output = T>,
    {
        task(Arc::clone(&self.steps)).await
    }

    /// Invoke several callables concurrently. Results come back in
    /// submission order.
    pub async fn run_many<T, F, Fut>(&self, tasks: impl IntoIterator<Item = F>) -> Vec<T>
    where
        F: FnOnce(StepGates) -> Fut,
        Fut: Future<Output = T>,
    {
        join_all(tasks.into_iter().map(|task| self.run(task))).await
    }

    /// Invoke `task` once per argument value, concurrently.
    pub async fn run_for_each_args<A, T, F, Fut>(
        &self,
        args: impl IntoIterator<Item = A>,
        task: F,
    ) -> Vec<T>
    where
        F: Fn(StepGates, A) -> Fut,
        Fut: Future<Output = T>,
    {
        let task = &task;
        join_all(
            args.into_iter()
                .map(move |arg| task(Arc::clone(&self.steps), arg)),
        )
        .await
    }

    /// Invoke `task` once per entity, concurrently.
    pub async fn run_for_each<E, T, F, Fut>(
        &self,
        entities: impl IntoIterator<Item = E>,
        task: F,
    ) -> Vec<T>
    where
        F: Fn(StepGates, E) -> Fut,
        Fut: Future<Output = T>,
    {
        self.run_for_each_args(entities, task).await
    }

    /// Force-release every permit on every step gate.
    pub fn release_all(&self) {
        for gate in self.steps.iter() {
            gate.release_acquired();
        }
    }

    /// `true` when step `index` exists and is at capacity; `false` for an
    /// out-of-range index.
    pub fn is_step_lock_limit_reached(&self, index: usize) -> bool {
        match self.steps.get(index) {
            Some(gate) => !gate.is_available(),
            None => false,
        }
    }
}

impl fmt::Debug for MultiStepGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiStepGate")
            .field("steps", &self.steps.len())
            .finish()
    }
}
