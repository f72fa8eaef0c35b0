//! WASM bindings for the sketch constraint engine.
//!
//! Only plain data crosses the boundary: requests and replies are
//! (de)serialized with `serde-wasm-bindgen`, maps become plain objects and
//! failures become JS `Error` values.
mod shared;

pub mod decomposition;
pub mod solver;

pub use decomposition::{
    articulation_pairs, decompose, decompose_step, handle_decompose, DecomposeResponse,
    WasmDecompositionRunner,
};
pub use solver::{build_equations, handle_solve, solve_system, SolveRequest, SolveResponse};
