//! Solve requests posted by the sketch editor.

use crate::shared::{from_js, js_error, to_js};
use anyhow::Context;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use sketch_core::constraints::{equations_for, Constraint};
use sketch_core::relaxation::{self, SolveOptions};
use wasm_bindgen::prelude::*;

/// Worker message: `{ constraintEqs, variables, forwardSub }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SolveRequest {
    pub constraint_eqs: Vec<String>,
    pub variables: IndexMap<String, f64>,
    #[serde(default)]
    pub forward_sub: Option<SolveOptions>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SolveResponse {
    pub satisfied: Vec<bool>,
    pub new_vars: IndexMap<String, f64>,
}

pub fn handle_solve(request: &SolveRequest) -> anyhow::Result<SolveResponse> {
    let options = request.forward_sub.clone().unwrap_or_default();
    let solution = relaxation::solve_system(&request.constraint_eqs, &request.variables, &options)
        .with_context(|| {
            format!(
                "Failed to solve {} constraint equations",
                request.constraint_eqs.len()
            )
        })?;

    Ok(SolveResponse {
        satisfied: solution.satisfied,
        new_vars: solution.variables,
    })
}

pub fn handle_build_equations(constraints: &[Constraint]) -> anyhow::Result<Vec<String>> {
    equations_for(constraints).context("Failed to build constraint equations")
}

#[wasm_bindgen]
pub fn solve_system(request: JsValue) -> Result<JsValue, JsValue> {
    console_error_panic_hook::set_once();

    let request: SolveRequest = from_js(request, "solve request")?;
    let response = handle_solve(&request).map_err(|e| js_error(format!("{:#}", e)))?;
    to_js(&response)
}

/// Expands constraint descriptions into equation strings.
#[wasm_bindgen]
pub fn build_equations(constraints: JsValue) -> Result<JsValue, JsValue> {
    console_error_panic_hook::set_once();

    let constraints: Vec<Constraint> = from_js(constraints, "constraints")?;
    let equations = handle_build_equations(&constraints).map_err(|e| js_error(format!("{:#}", e)))?;
    to_js(&equations)
}
