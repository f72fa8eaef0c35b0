//! Best-effort solving of possibly over-constrained equation sets.
//!
//! `solve_system` runs Levenberg-Marquardt on the whole set; when some
//! equations stay unsatisfied, the first of them is dropped and the rest is
//! solved again from the partial solution. Recursion depth is bounded by the
//! number of equations.

use crate::equation_engine::{parse, CompiledEquation, Compiler, EquationSystem, Expr};
use crate::levenberg_marquardt::{self, LmSettings, SolveError};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Variable name to value; insertion order fixes the partial-derivative order.
pub type Assignment = IndexMap<String, f64>;

/// What a forward-substituted variable is replaced with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Substitution {
    Value(f64),
    Variable(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SolveOptions {
    pub forward_subs: IndexMap<String, Substitution>,
    pub epsilon: f64,
    pub max_steps: Option<usize>,
}

impl Default for SolveOptions {
    fn default() -> Self {
        Self {
            forward_subs: IndexMap::new(),
            epsilon: 1e-5,
            max_steps: None,
        }
    }
}

impl SolveOptions {
    pub fn lm_settings(&self) -> LmSettings {
        LmSettings {
            epsilon: self.epsilon,
            max_steps: self.max_steps,
            ..LmSettings::default()
        }
    }

    /// An equation counts as satisfied when its squared residual is below this.
    pub fn satisfaction_threshold(&self) -> f64 {
        self.epsilon.sqrt()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemSolution {
    /// One flag per input equation, in input order.
    pub satisfied: Vec<bool>,
    pub variables: Assignment,
}

/// Solves `equations` (each must evaluate to zero) starting from `variables`.
///
/// Equations that fail to parse or reference unknown variables are caller
/// errors and returned as `Err`. A failing Levenberg-Marquardt run is not:
/// the input values are kept and the affected equations come back
/// unsatisfied.
pub fn solve_system<S: AsRef<str>>(
    equations: &[S],
    variables: &Assignment,
    options: &SolveOptions,
) -> Result<SystemSolution, SolveError> {
    let settings = options.lm_settings();
    settings.validate()?;

    if equations.is_empty() {
        return Ok(SystemSolution {
            satisfied: Vec::new(),
            variables: variables.clone(),
        });
    }

    let var_names: Vec<String> = variables.keys().cloned().collect();
    let compiler = Compiler::new(&var_names);
    let compiled = equations
        .iter()
        .map(|text| -> Result<CompiledEquation, SolveError> {
            let expr = substitute(&parse(text.as_ref())?, &options.forward_subs);
            Ok(compiler.compile(&expr)?)
        })
        .collect::<Result<Vec<_>, SolveError>>()?;

    let start: Vec<f64> = variables.values().copied().collect();
    let (satisfied, values) = relax(compiled, &var_names, start, options)?;

    let mut solved: Assignment = var_names.into_iter().zip(values).collect();
    write_back(&mut solved, &options.forward_subs);
    Ok(SystemSolution {
        satisfied,
        variables: solved,
    })
}

fn relax(
    equations: Vec<CompiledEquation>,
    var_names: &[String],
    values: Vec<f64>,
    options: &SolveOptions,
) -> Result<(Vec<bool>, Vec<f64>), SolveError> {
    if equations.is_empty() {
        return Ok((Vec::new(), values));
    }

    let system = EquationSystem::new(var_names.to_vec(), equations);
    let solved = match levenberg_marquardt::solve(&system, &values, options.lm_settings()) {
        Ok(result) => result.state,
        Err(err) => {
            warn!(error = %err, "levenberg-marquardt failed, keeping input variables");
            values
        }
    };

    let threshold = options.satisfaction_threshold();
    let satisfied: Vec<bool> = (0..system.equations.len())
        .map(|i| {
            system
                .evaluate_equation(i, &solved)
                .map(|d| d.val * d.val < threshold)
                .unwrap_or(false)
        })
        .collect();

    let Some(dropped) = satisfied.iter().position(|ok| !ok) else {
        return Ok((satisfied, solved));
    };

    debug!(index = dropped, remaining = satisfied.len() - 1, "dropping unsatisfied equation");
    let mut remaining = system.equations;
    remaining.remove(dropped);
    let (mut flags, values) = relax(remaining, var_names, solved, options)?;
    flags.insert(dropped, false);
    Ok((flags, values))
}

/// Follows substitution chains (`a -> b`, `b -> 3`) to the final replacement.
fn resolve<'a>(
    name: &str,
    subs: &'a IndexMap<String, Substitution>,
) -> Option<&'a Substitution> {
    let mut current = lookup(name, subs)?;
    // A chain can visit each entry at most once; anything longer is a cycle.
    for _ in 0..subs.len() {
        match current {
            Substitution::Variable(next) => match lookup(next, subs) {
                Some(sub) => current = sub,
                None => break,
            },
            Substitution::Value(_) => break,
        }
    }
    Some(current)
}

fn lookup<'a>(name: &str, subs: &'a IndexMap<String, Substitution>) -> Option<&'a Substitution> {
    subs.iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, sub)| sub)
}

/// Rewrites substituted symbols in the tree.
fn substitute(expr: &Expr, subs: &IndexMap<String, Substitution>) -> Expr {
    if subs.is_empty() {
        return expr.clone();
    }
    expr.rewrite_symbols(&|name| {
        resolve(name, subs).map(|sub| match sub {
            Substitution::Value(v) => Expr::Number(*v),
            Substitution::Variable(target) => Expr::Symbol(target.to_lowercase()),
        })
    })
}

/// Gives every substituted variable its substituted value.
fn write_back(variables: &mut Assignment, subs: &IndexMap<String, Substitution>) {
    for name in subs.keys() {
        let value = match resolve(name, subs) {
            Some(Substitution::Value(v)) => Some(*v),
            Some(Substitution::Variable(target)) => variables
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(target))
                .map(|(_, v)| *v),
            None => None,
        };
        let Some(value) = value else { continue };

        match variables
            .iter_mut()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
        {
            Some((_, slot)) => *slot = value,
            None => {
                variables.insert(name.clone(), value);
            }
        }
    }
}
