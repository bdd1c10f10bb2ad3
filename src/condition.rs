//! Composable filter conditions with context-aware pruning.
//!
//! ```
//! use djaq::condition::B;
//! use djaq::value::Context;
//!
//! let cond = B::new("name == {name}") & B::new("pages > 100");
//! assert_eq!(cond.render(&Context::new()), "(pages > 100)");
//! ```

use std::fmt;
use std::ops::{BitAnd, BitOr};

use crate::placeholder;
use crate::value::Context;

/// A filter expression tree. Values are persistent: combining never
/// mutates an operand.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Leaf(String),
    And(Vec<Condition>),
    Or(Vec<Condition>),
}

/// Short alias used in filter-building code.
pub type B = Condition;

impl Condition {
    pub fn new(expression: impl Into<String>) -> Self {
        Condition::Leaf(expression.into())
    }

    /// Conjunction of `self` and `other`, flattening nested conjunctions.
    pub fn and_(self, other: impl Into<Condition>) -> Self {
        match (self, other.into()) {
            (Condition::And(mut left), Condition::And(right)) => {
                left.extend(right);
                Condition::And(left)
            }
            (Condition::And(mut left), right) => {
                left.push(right);
                Condition::And(left)
            }
            (left, right) => Condition::And(vec![left, right]),
        }
    }

    /// Disjunction of `self` and `other`, flattening nested disjunctions.
    pub fn or_(self, other: impl Into<Condition>) -> Self {
        match (self, other.into()) {
            (Condition::Or(mut left), Condition::Or(right)) => {
                left.extend(right);
                Condition::Or(left)
            }
            (Condition::Or(mut left), right) => {
                left.push(right);
                Condition::Or(left)
            }
            (left, right) => Condition::Or(vec![left, right]),
        }
    }

    fn is_composite(&self) -> bool {
        !matches!(self, Condition::Leaf(_))
    }

    /// Render against `context`, dropping leaves whose placeholders have no
    /// usable value. An empty string means nothing survived.
    pub fn render(&self, context: &Context) -> String {
        match self {
            Condition::Leaf(expr) => {
                let supplied = placeholder::names(expr)
                    .iter()
                    .all(|name| context.get(*name).map(|v| v.is_present()).unwrap_or(false));
                if supplied { expr.clone() } else { String::new() }
            }
            Condition::And(children) => render_children(children, "and", context),
            Condition::Or(children) => render_children(children, "or", context),
        }
    }
}

fn render_children(children: &[Condition], conjunction: &str, context: &Context) -> String {
    let survivors: Vec<(&Condition, String)> = children
        .iter()
        .map(|c| (c, c.render(context)))
        .filter(|(_, s)| !s.is_empty())
        .collect();

    match survivors.as_slice() {
        [] => String::new(),
        [(child, rendered)] if child.is_composite() => rendered.clone(),
        _ => {
            let parts: Vec<&str> = survivors.iter().map(|(_, s)| s.as_str()).collect();
            format!("({})", parts.join(&format!(" {} ", conjunction)))
        }
    }
}

impl fmt::Display for Condition {
    /// Unpruned rendering, every leaf kept.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (children, conjunction) = match self {
            Condition::Leaf(expr) => return write!(f, "{}", expr),
            Condition::And(children) => (children, " and "),
            Condition::Or(children) => (children, " or "),
        };
        let parts: Vec<String> = children.iter().map(|c| c.to_string()).collect();
        write!(f, "({})", parts.join(conjunction))
    }
}

impl From<&str> for Condition {
    fn from(s: &str) -> Self {
        Condition::new(s)
    }
}

impl From<String> for Condition {
    fn from(s: String) -> Self {
        Condition::Leaf(s)
    }
}

impl BitAnd for Condition {
    type Output = Condition;

    fn bitand(self, rhs: Condition) -> Condition {
        self.and_(rhs)
    }
}

impl BitOr for Condition {
    type Output = Condition;

    fn bitor(self, rhs: Condition) -> Condition {
        self.or_(rhs)
    }
}

/// Conjunction of two conditions.
pub fn and_(a: impl Into<Condition>, b: impl Into<Condition>) -> Condition {
    a.into().and_(b)
}

/// Disjunction of two conditions.
pub fn or_(a: impl Into<Condition>, b: impl Into<Condition>) -> Condition {
    a.into().or_(b)
}
