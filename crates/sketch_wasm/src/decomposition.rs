//! Constraint graph decomposition entry points and the stepped runner.

use crate::shared::{from_js, js_error, to_js};
use serde::{Deserialize, Serialize};
use sketch_core::graph::{
    self, ArticulationPair, ConstraintGraph, DecomposeError, MAX_DECOMPOSITION_STEPS,
};
use wasm_bindgen::prelude::*;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecomposeResponse {
    pub graph: ConstraintGraph,
    /// False when the step cap stopped the loop with pairs left.
    pub complete: bool,
    pub steps: usize,
}

pub fn handle_decompose(graph: &ConstraintGraph, max_steps: usize) -> anyhow::Result<DecomposeResponse> {
    match graph::decompose_with_limit(graph, max_steps) {
        Ok(decomposition) => Ok(DecomposeResponse {
            graph: decomposition.graph,
            complete: true,
            steps: decomposition.steps,
        }),
        Err(DecomposeError::Incomplete { steps, graph }) => Ok(DecomposeResponse {
            graph,
            complete: false,
            steps,
        }),
        Err(err) => Err(anyhow::Error::new(err).context("Decomposition failed")),
    }
}

#[wasm_bindgen]
pub fn decompose(graph: JsValue) -> Result<JsValue, JsValue> {
    console_error_panic_hook::set_once();

    let graph: ConstraintGraph = from_js(graph, "constraint graph")?;
    let response =
        handle_decompose(&graph, MAX_DECOMPOSITION_STEPS).map_err(|e| js_error(format!("{:#}", e)))?;
    to_js(&response)
}

/// Splits at the first articulation pair only.
#[wasm_bindgen]
pub fn decompose_step(graph: JsValue) -> Result<JsValue, JsValue> {
    console_error_panic_hook::set_once();

    let graph: ConstraintGraph = from_js(graph, "constraint graph")?;
    let next = graph::split_first_articulation_pair(&graph)
        .map_err(|e| js_error(format!("Decomposition step failed: {}", e)))?;
    to_js(&next)
}

#[wasm_bindgen]
pub fn articulation_pairs(graph: JsValue) -> Result<JsValue, JsValue> {
    console_error_panic_hook::set_once();

    let graph: ConstraintGraph = from_js(graph, "constraint graph")?;
    to_js(&graph::articulation_pairs(&graph))
}

/// Progress payload for the stepped decomposition.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DecompositionProgress {
    done: bool,
    steps: usize,
    max_steps: usize,
    remaining_pairs: usize,
}

struct DecompositionState {
    graph: ConstraintGraph,
    pairs: Vec<ArticulationPair>,
    steps: usize,
    max_steps: usize,
    done: bool,
}

impl DecompositionState {
    fn new(graph: ConstraintGraph, max_steps: usize) -> Self {
        let pairs = graph::articulation_pairs(&graph);
        let done = pairs.is_empty();
        Self {
            graph,
            pairs,
            steps: 0,
            max_steps,
            done,
        }
    }

    fn progress(&self) -> DecompositionProgress {
        DecompositionProgress {
            done: self.done,
            steps: self.steps,
            max_steps: self.max_steps,
            remaining_pairs: self.pairs.len(),
        }
    }
}

/// Runs up to `batch_size` splits. Hitting the step cap with pairs left is
/// an error, matching the one-shot `decompose`.
fn advance_decomposition(state: &mut DecompositionState, batch_size: usize) -> anyhow::Result<()> {
    for _ in 0..batch_size {
        let Some(pair) = state.pairs.first() else {
            state.done = true;
            break;
        };
        if state.steps >= state.max_steps {
            anyhow::bail!(
                "Decomposition did not finish in {} steps ({} articulation pairs left).",
                state.max_steps,
                state.pairs.len()
            );
        }

        state.graph = graph::split_at_articulation_pair(&state.graph, pair)?;
        state.steps += 1;
        state.pairs = graph::articulation_pairs(&state.graph);
    }

    if state.pairs.is_empty() {
        state.done = true;
    }
    Ok(())
}

#[wasm_bindgen]
pub struct WasmDecompositionRunner {
    state: Option<DecompositionState>,
}

#[wasm_bindgen]
impl WasmDecompositionRunner {
    #[wasm_bindgen(constructor)]
    pub fn new(graph: JsValue, max_steps: u32) -> Result<WasmDecompositionRunner, JsValue> {
        console_error_panic_hook::set_once();

        if max_steps == 0 {
            return Err(js_error("max_steps must be positive."));
        }
        let graph: ConstraintGraph = from_js(graph, "constraint graph")?;

        Ok(WasmDecompositionRunner {
            state: Some(DecompositionState::new(graph, max_steps as usize)),
        })
    }

    pub fn is_done(&self) -> bool {
        self.state.as_ref().map_or(true, |state| state.done)
    }

    pub fn run_steps(&mut self, batch_size: u32) -> Result<JsValue, JsValue> {
        let state = self
            .state
            .as_mut()
            .ok_or_else(|| js_error("Runner not initialized"))?;

        advance_decomposition(state, batch_size as usize).map_err(|e| js_error(format!("{:#}", e)))?;
        to_js(&state.progress())
    }

    pub fn get_progress(&self) -> Result<JsValue, JsValue> {
        let state = self
            .state
            .as_ref()
            .ok_or_else(|| js_error("Runner not initialized"))?;
        to_js(&state.progress())
    }

    pub fn get_result(&self) -> Result<JsValue, JsValue> {
        let state = self
            .state
            .as_ref()
            .ok_or_else(|| js_error("Runner not initialized"))?;

        to_js(&DecomposeResponse {
            graph: state.graph.clone(),
            complete: state.done,
            steps: state.steps,
        })
    }
}
