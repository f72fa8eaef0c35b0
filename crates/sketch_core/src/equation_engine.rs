use crate::autodiff::{self, AutodiffError, Dual, Value};
use crate::traits::ResidualSystem;
use indexmap::IndexMap;
use nalgebra::{DMatrix, DVector};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

pub mod parser;

pub use parser::{parse, SyntaxError};

// --- AST ---

/// Binary operators, grouped by precedence `[+ -] < [* /] < [^]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

impl BinaryOp {
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            '+' => Some(Self::Add),
            '-' => Some(Self::Sub),
            '*' => Some(Self::Mul),
            '/' => Some(Self::Div),
            '^' => Some(Self::Pow),
            _ => None,
        }
    }

    pub fn symbol(self) -> char {
        match self {
            Self::Add => '+',
            Self::Sub => '-',
            Self::Mul => '*',
            Self::Div => '/',
            Self::Pow => '^',
        }
    }

    pub fn precedence(self) -> u8 {
        match self {
            Self::Add | Self::Sub => 1,
            Self::Mul | Self::Div => 2,
            Self::Pow => 3,
        }
    }
}

/// Abstract Syntax Tree nodes for expressions.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Symbol(String),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

impl Expr {
    /// Returns a copy of the tree where every symbol for which `replace`
    /// yields an expression is swapped for that expression.
    pub fn rewrite_symbols<F>(&self, replace: &F) -> Expr
    where
        F: Fn(&str) -> Option<Expr>,
    {
        match self {
            Expr::Number(n) => Expr::Number(*n),
            Expr::Symbol(name) => replace(name).unwrap_or_else(|| Expr::Symbol(name.clone())),
            Expr::Binary(op, left, right) => Expr::Binary(
                *op,
                Box::new(left.rewrite_symbols(replace)),
                Box::new(right.rewrite_symbols(replace)),
            ),
            Expr::Call(name, args) => Expr::Call(
                name.clone(),
                args.iter().map(|arg| arg.rewrite_symbols(replace)).collect(),
            ),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Number(n) => write!(f, "{n}"),
            Expr::Symbol(name) => write!(f, "{name}"),
            Expr::Binary(op, left, right) => write!(f, "({left} {} {right})", op.symbol()),
            Expr::Call(name, args) => {
                write!(f, "{name}(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ")")
            }
        }
    }
}

// --- Bytecode ---

/// Built-in single-argument functions callable from equations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Exp,
    Sqrt,
    Log,
    Neg,
}

impl Function {
    pub fn from_name(name: &str) -> Option<Self> {
        let function = match name {
            "sin" => Self::Sin,
            "cos" => Self::Cos,
            "tan" => Self::Tan,
            "asin" => Self::Asin,
            "acos" => Self::Acos,
            "atan" => Self::Atan,
            "exp" => Self::Exp,
            "sqrt" => Self::Sqrt,
            "log" => Self::Log,
            "neg" => Self::Neg,
            _ => return None,
        };
        Some(function)
    }

    pub fn arity(self) -> usize {
        1
    }

    fn apply(self, x: Value) -> Value {
        match self {
            Self::Sin => autodiff::sin(x),
            Self::Cos => autodiff::cos(x),
            Self::Tan => autodiff::tan(x),
            Self::Asin => autodiff::asin(x),
            Self::Acos => autodiff::acos(x),
            Self::Atan => autodiff::atan(x),
            Self::Exp => autodiff::exp(x),
            Self::Sqrt => autodiff::sqrt(x),
            Self::Log => autodiff::log(x),
            Self::Neg => autodiff::neg(x),
        }
    }
}

/// OpCodes for the Stack-based Virtual Machine.
/// The VM operates on a stack of `Value`s (plain numbers or duals).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpCode {
    /// Pushes a constant as a plain number.
    LoadConst(f64),
    /// Pushes a variable (by index) seeded as a one-hot dual.
    LoadVar(usize),
    /// Pops top two values (b, a), pushes (a + b).
    Add,
    /// Pops top two values (b, a), pushes (a - b).
    Sub,
    /// Pops top two values (b, a), pushes (a * b).
    Mul,
    /// Pops top two values (b, a), pushes (a / b).
    Div,
    /// Pops top two values (b, a), pushes (a ^ b).
    Pow,
    /// Pops top value (a), pushes f(a).
    Call(Function),
}

/// Represents a compiled sequence of operations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bytecode {
    pub ops: Vec<OpCode>,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompileError {
    #[error("Unknown variable: {0}")]
    UnknownVariable(String),
    #[error("Unknown function: {0}")]
    UnknownFunction(String),
    #[error("Function {name} expects {expected} argument(s), got {found}")]
    Arity {
        name: String,
        expected: usize,
        found: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    #[error(transparent)]
    Autodiff(#[from] AutodiffError),
    #[error("Expected {expected} variable value(s), got {found}")]
    ArgumentCount { expected: usize, found: usize },
    #[error("Malformed bytecode: stack underflow")]
    MalformedBytecode,
}

/// Anything that can go wrong between equation text and its value.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EquationError {
    #[error(transparent)]
    Syntax(#[from] SyntaxError),
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Eval(#[from] EvalError),
}

/// Stack-based Virtual Machine for evaluating equations.
///
/// `values` holds one scalar per session variable. Each `LoadVar` builds a
/// fresh one-hot dual of length `values.len()`, so seeding happens per leaf
/// reference rather than once up front.
pub struct VM;

impl VM {
    pub fn execute(
        bytecode: &Bytecode,
        values: &[f64],
        stack: &mut Vec<Value>,
    ) -> Result<Value, EvalError> {
        stack.clear();
        let len = values.len();

        for op in &bytecode.ops {
            match op {
                OpCode::LoadConst(val) => stack.push(Value::Number(*val)),
                OpCode::LoadVar(idx) => {
                    let val = values.get(*idx).copied().ok_or(EvalError::ArgumentCount {
                        expected: idx + 1,
                        found: len,
                    })?;
                    stack.push(Value::Dual(Dual::variable(val, *idx, len)));
                }
                OpCode::Add => {
                    let (a, b) = pop_pair(stack)?;
                    stack.push(autodiff::add(a, b));
                }
                OpCode::Sub => {
                    let (a, b) = pop_pair(stack)?;
                    stack.push(autodiff::sub(a, b));
                }
                OpCode::Mul => {
                    let (a, b) = pop_pair(stack)?;
                    stack.push(autodiff::mul(a, b));
                }
                OpCode::Div => {
                    let (a, b) = pop_pair(stack)?;
                    stack.push(autodiff::div(a, b));
                }
                OpCode::Pow => {
                    let (a, b) = pop_pair(stack)?;
                    stack.push(autodiff::power(a, b)?);
                }
                OpCode::Call(function) => {
                    let a = stack.pop().ok_or(EvalError::MalformedBytecode)?;
                    stack.push(function.apply(a));
                }
            }
        }

        stack.pop().ok_or(EvalError::MalformedBytecode)
    }
}

fn pop_pair(stack: &mut Vec<Value>) -> Result<(Value, Value), EvalError> {
    let b = stack.pop().ok_or(EvalError::MalformedBytecode)?;
    let a = stack.pop().ok_or(EvalError::MalformedBytecode)?;
    Ok((a, b))
}

// --- Compiler ---

/// Compiles an AST (`Expr`) into `Bytecode`.
/// Resolves variable names to indices in the session ordering.
pub struct Compiler {
    pub var_map: HashMap<String, usize>,
    pub var_count: usize,
}

impl Compiler {
    /// Symbols are case-folded by the parser, so names are matched in
    /// lowercase. When two names fold to the same key the first one wins.
    pub fn new(var_names: &[String]) -> Self {
        let mut var_map = HashMap::new();
        for (i, name) in var_names.iter().enumerate() {
            var_map.entry(name.to_lowercase()).or_insert(i);
        }
        Self {
            var_map,
            var_count: var_names.len(),
        }
    }

    pub fn compile(&self, expr: &Expr) -> Result<CompiledEquation, CompileError> {
        let mut ops = Vec::new();
        self.compile_recursive(expr, &mut ops)?;
        Ok(CompiledEquation {
            bytecode: Bytecode { ops },
            var_count: self.var_count,
        })
    }

    fn compile_recursive(&self, expr: &Expr, ops: &mut Vec<OpCode>) -> Result<(), CompileError> {
        match expr {
            Expr::Number(n) => ops.push(OpCode::LoadConst(*n)),
            Expr::Symbol(name) => {
                let idx = self
                    .var_map
                    .get(name)
                    .ok_or_else(|| CompileError::UnknownVariable(name.clone()))?;
                ops.push(OpCode::LoadVar(*idx));
            }
            Expr::Binary(op, left, right) => {
                self.compile_recursive(left, ops)?;
                self.compile_recursive(right, ops)?;
                ops.push(match op {
                    BinaryOp::Add => OpCode::Add,
                    BinaryOp::Sub => OpCode::Sub,
                    BinaryOp::Mul => OpCode::Mul,
                    BinaryOp::Div => OpCode::Div,
                    BinaryOp::Pow => OpCode::Pow,
                });
            }
            Expr::Call(name, args) => {
                let function = Function::from_name(name)
                    .ok_or_else(|| CompileError::UnknownFunction(name.clone()))?;
                if args.len() != function.arity() {
                    return Err(CompileError::Arity {
                        name: name.clone(),
                        expected: function.arity(),
                        found: args.len(),
                    });
                }
                for arg in args {
                    self.compile_recursive(arg, ops)?;
                }
                ops.push(OpCode::Call(function));
            }
        }
        Ok(())
    }
}

/// Bytecode bound to the number of variables it was compiled against.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledEquation {
    pub bytecode: Bytecode,
    pub var_count: usize,
}

impl CompiledEquation {
    pub fn eval(&self, values: &[f64]) -> Result<Dual, EvalError> {
        let mut stack = Vec::with_capacity(16);
        self.eval_with_stack(values, &mut stack)
    }

    /// Like `eval`, reusing a caller-owned stack buffer.
    pub fn eval_with_stack(
        &self,
        values: &[f64],
        stack: &mut Vec<Value>,
    ) -> Result<Dual, EvalError> {
        if values.len() != self.var_count {
            return Err(EvalError::ArgumentCount {
                expected: self.var_count,
                found: values.len(),
            });
        }
        let value = VM::execute(&self.bytecode, values, stack)?;
        Ok(value.into_dual(self.var_count))
    }
}

/// `compile(variableNamesInOrder, ast)`.
pub fn compile(var_names: &[String], expr: &Expr) -> Result<CompiledEquation, CompileError> {
    Compiler::new(var_names).compile(expr)
}

/// Parses, compiles against the assignment's key order and evaluates in one go.
pub fn evaluate(equation: &str, assignment: &IndexMap<String, f64>) -> Result<Dual, EquationError> {
    let expr = parse(equation)?;
    let var_names: Vec<String> = assignment.keys().cloned().collect();
    let values: Vec<f64> = assignment.values().copied().collect();
    let compiled = compile(&var_names, &expr)?;
    Ok(compiled.eval(&values)?)
}

// --- EquationSystem ---

/// A set of residual equations compiled against one variable ordering.
pub struct EquationSystem {
    pub equations: Vec<CompiledEquation>,
    pub var_names: Vec<String>,
    // Interior mutability for VM stack to avoid allocation per evaluation.
    stack: RefCell<Vec<Value>>,
}

impl EquationSystem {
    pub fn new(var_names: Vec<String>, equations: Vec<CompiledEquation>) -> Self {
        Self {
            equations,
            var_names,
            stack: RefCell::new(Vec::with_capacity(64)),
        }
    }

    pub fn from_exprs(var_names: Vec<String>, exprs: &[Expr]) -> Result<Self, CompileError> {
        let compiler = Compiler::new(&var_names);
        let equations = exprs
            .iter()
            .map(|expr| compiler.compile(expr))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(var_names, equations))
    }

    pub fn evaluate_equation(&self, index: usize, values: &[f64]) -> Result<Dual, EvalError> {
        let mut stack = self.stack.borrow_mut();
        match self.equations.get(index) {
            Some(equation) => equation.eval_with_stack(values, &mut stack),
            None => Err(EvalError::MalformedBytecode),
        }
    }

    pub fn residuals(&self, values: &[f64]) -> Result<Vec<f64>, EvalError> {
        let mut stack = self.stack.borrow_mut();
        self.equations
            .iter()
            .map(|eq| eq.eval_with_stack(values, &mut stack).map(|d| d.val))
            .collect()
    }
}

impl ResidualSystem for EquationSystem {
    fn variable_count(&self) -> usize {
        self.var_names.len()
    }

    fn residual_count(&self) -> usize {
        self.equations.len()
    }

    fn linearize(
        &self,
        x: &[f64],
        residuals: &mut DVector<f64>,
        jacobian: &mut DMatrix<f64>,
    ) -> Result<(), EvalError> {
        let mut stack = self.stack.borrow_mut();
        for (i, eq) in self.equations.iter().enumerate() {
            let dual = eq.eval_with_stack(x, &mut stack)?;
            residuals[i] = dual.val;
            for (j, d) in dual.partials.iter().enumerate() {
                jacobian[(i, j)] = *d;
            }
        }
        Ok(())
    }
}
