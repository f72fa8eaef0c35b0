//! Equation builders for common sketch constraints.
//!
//! Point `p` contributes the variables `p_x` and `p_y`. Every builder emits
//! residual equations that vanish when the constraint holds.

use crate::relaxation::Assignment;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConstraintError {
    #[error("Constraint parameter must be finite, got {0}")]
    NonFinite(f64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Constraint {
    Distance {
        a: String,
        b: String,
        distance: f64,
    },
    /// Unsigned distance from `point` to the infinite line through
    /// `line_start` and `line_end`.
    PointOnLine {
        point: String,
        line_start: String,
        line_end: String,
        distance: f64,
    },
    EqualLength {
        a0: String,
        a1: String,
        b0: String,
        b1: String,
    },
    Parallel {
        a0: String,
        a1: String,
        b0: String,
        b1: String,
    },
    Coincident {
        a: String,
        b: String,
    },
    Horizontal {
        a: String,
        b: String,
    },
    Vertical {
        a: String,
        b: String,
    },
    Fix {
        point: String,
        x: f64,
        y: f64,
    },
}

/// Renders a number so the equation parser accepts it.
fn literal(value: f64) -> Result<String, ConstraintError> {
    if !value.is_finite() {
        return Err(ConstraintError::NonFinite(value));
    }
    // `abs` also turns -0.0 into a plain `0`.
    if value < 0.0 {
        Ok(format!("neg({})", value.abs()))
    } else {
        Ok(format!("{}", value.abs()))
    }
}

fn length(p0: &str, p1: &str) -> String {
    format!("sqrt(({p1}_x-{p0}_x)^2+({p1}_y-{p0}_y)^2)")
}

impl Constraint {
    pub fn distance(a: impl Into<String>, b: impl Into<String>, distance: f64) -> Self {
        Constraint::Distance {
            a: a.into(),
            b: b.into(),
            distance,
        }
    }

    pub fn equations(&self) -> Result<Vec<String>, ConstraintError> {
        let equations = match self {
            Constraint::Distance { a, b, distance } => {
                vec![format!("{} - {}", literal(*distance)?, length(a, b))]
            }
            Constraint::PointOnLine {
                point: p,
                line_start: l0,
                line_end: l1,
                distance,
            } => vec![format!(
                "sqrt((({l1}_y-{l0}_y)*{p}_x - ({l1}_x-{l0}_x)*{p}_y + {l1}_x*{l0}_y - {l1}_y*{l0}_x)^2) / {} - {}",
                length(l0, l1),
                literal(*distance)?
            )],
            Constraint::EqualLength { a0, a1, b0, b1 } => {
                vec![format!("{} - {}", length(b0, b1), length(a0, a1))]
            }
            Constraint::Parallel { a0, a1, b0, b1 } => vec![format!(
                "({a0}_x - {a1}_x)*({b1}_y-{b0}_y) + ({a1}_y-{a0}_y)*({b1}_x-{b0}_x)"
            )],
            Constraint::Coincident { a, b } => {
                vec![format!("{a}_x - {b}_x"), format!("{a}_y - {b}_y")]
            }
            Constraint::Horizontal { a, b } => vec![format!("{a}_y - {b}_y")],
            Constraint::Vertical { a, b } => vec![format!("{a}_x - {b}_x")],
            Constraint::Fix { point, x, y } => vec![
                format!("{} - {point}_x", literal(*x)?),
                format!("{} - {point}_y", literal(*y)?),
            ],
        };
        Ok(equations)
    }
}

/// All equations of `constraints`, in order.
pub fn equations_for(constraints: &[Constraint]) -> Result<Vec<String>, ConstraintError> {
    let mut equations = Vec::new();
    for constraint in constraints {
        equations.extend(constraint.equations()?);
    }
    Ok(equations)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub id: String,
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(id: impl Into<String>, x: f64, y: f64) -> Self {
        Self { id: id.into(), x, y }
    }
}

pub fn assignment_from_points(points: &[Point]) -> Assignment {
    let mut assignment = Assignment::with_capacity(points.len() * 2);
    for point in points {
        assignment.insert(format!("{}_x", point.id), point.x);
        assignment.insert(format!("{}_y", point.id), point.y);
    }
    assignment
}

/// Groups `{id}_x` / `{id}_y` entries back into points, in first-seen order.
/// Other keys are skipped; a missing coordinate reads as zero.
pub fn points_from_assignment(assignment: &Assignment) -> Vec<Point> {
    let mut coords: IndexMap<&str, (Option<f64>, Option<f64>)> = IndexMap::new();
    for (key, &value) in assignment {
        let Some((id, axis)) = key.rsplit_once('_') else {
            continue;
        };
        match axis {
            "x" => coords.entry(id).or_default().0 = Some(value),
            "y" => coords.entry(id).or_default().1 = Some(value),
            _ => {}
        }
    }

    coords
        .into_iter()
        .map(|(id, (x, y))| Point::new(id, x.unwrap_or(0.0), y.unwrap_or(0.0)))
        .collect()
}
