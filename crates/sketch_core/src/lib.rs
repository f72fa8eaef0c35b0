//! The `sketch_core` crate is the numerical engine behind the sketch
//! constraint solver. Constraints arrive as plain equation strings over
//! named variables and leave as a new assignment plus one satisfaction flag
//! per equation.
//!
//! Key components:
//! - **Equation Engine**: parser, bytecode compiler and stack VM evaluating equations over dual numbers.
//! - **Autodiff**: `Value` sum type (plain number or dual number) and its closed operation set.
//! - **Solvers**: dense LU (`linalg`), Levenberg-Marquardt and the relaxation driver that drops unsatisfiable equations.
//! - **Graph**: articulation points and pairs, and decomposition of constraint graphs into rigid clusters.
pub mod autodiff;
pub mod constraints;
pub mod equation_engine;
pub mod graph;
pub mod levenberg_marquardt;
pub mod linalg;
pub mod relaxation;
pub mod traits;

pub use equation_engine::{evaluate, parse};
pub use graph::{decompose, ConstraintGraph};
pub use levenberg_marquardt::{LmSettings, SolveError};
pub use relaxation::{solve_system, Assignment, SolveOptions, Substitution, SystemSolution};
