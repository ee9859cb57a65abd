//! Normalized statement form consumed by the compiler driver.
//!
//! Front-ends lower their surface syntax into this shape: per-function
//! statement lists where every assignment binds a constant, a variable
//! reference, or a single call, and every return names bound variables.

/// A whole program: one function definition per declared function.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub functions: Vec<FunctionDef>,
}

/// One function: declared parameter names plus a statement body.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDef {
    pub name: String,
    pub params: Vec<String>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    /// `a, b = value`
    Assign { targets: Vec<String>, value: Value },
    /// `return a, b`
    Return { values: Vec<String> },
}

/// Right-hand side of an assignment.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Const(f64),
    Var(String),
    Call(CallExpr),
}

/// An opcode or user-function invocation with ordered arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct CallExpr {
    pub callee: String,
    pub args: Vec<Arg>,
}

impl CallExpr {
    pub fn new(callee: impl Into<String>, args: Vec<Arg>) -> Self {
        Self {
            callee: callee.into(),
            args,
        }
    }
}

/// A call argument: a bound name or an inline constant.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Var(String),
    Const(f64),
}
