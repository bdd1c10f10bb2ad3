//! Expression AST produced by the parser and consumed by the compiler.

/// Literal values.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    /// Numeric literal kept as written.
    Number(String),
    Str(String),
    Bool(bool),
    Null,
}

/// Arithmetic operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl BinaryOp {
    pub fn as_sql(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
        }
    }
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    NotEq,
    Lt,
    LtE,
    Gt,
    GtE,
    Is,
    IsNot,
    In,
    NotIn,
}

impl CompareOp {
    pub fn as_sql(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::NotEq => "<>",
            CompareOp::Lt => "<",
            CompareOp::LtE => "<=",
            CompareOp::Gt => ">",
            CompareOp::GtE => ">=",
            CompareOp::Is => "IS",
            CompareOp::IsNot => "IS NOT",
            CompareOp::In => "IN",
            CompareOp::NotIn => "NOT IN",
        }
    }
}

/// Boolean connectives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
}

impl LogicalOp {
    pub fn as_sql(&self) -> &'static str {
        match self {
            LogicalOp::And => "AND",
            LogicalOp::Or => "OR",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Pos,
    Not,
}

/// Expression node.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Dotted attribute path, `publisher.name`.
    Path(Vec<String>),
    Literal(Literal),
    /// `{name}` context placeholder.
    Placeholder(String),
    /// `*` as in `count(*)`.
    Star,
    Call {
        name: String,
        args: Vec<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Compare {
        op: CompareOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// n-ary `and` / `or`, folded left to right.
    Logical {
        op: LogicalOp,
        operands: Vec<Expr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Tuple(Vec<Expr>),
    List(Vec<Expr>),
}

impl Expr {
    pub fn path(segments: &[&str]) -> Self {
        Expr::Path(segments.iter().map(|s| s.to_string()).collect())
    }

    pub fn number(n: impl Into<String>) -> Self {
        Expr::Literal(Literal::Number(n.into()))
    }

    pub fn string(s: impl Into<String>) -> Self {
        Expr::Literal(Literal::Str(s.into()))
    }

    /// String literal payload, if this is one.
    pub fn as_str_literal(&self) -> Option<&str> {
        match self {
            Expr::Literal(Literal::Str(s)) => Some(s),
            _ => None,
        }
    }
}

/// One output column: expression source plus its alias.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSource {
    pub expression: String,
    pub alias: String,
}

/// One ORDER BY term.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderTerm {
    pub expr: Expr,
    pub descending: bool,
}
