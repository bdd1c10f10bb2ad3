//! Builtin function table and the function whitelist.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::OnceLock;

use crate::dialect::Dialect;
use crate::error::{DjaqError, DjaqResult};

/// Plain SQL functions callable without being builtins.
pub const DEFAULT_FUNCTIONS: &[&str] = &[
    "abs", "coalesce", "lower", "upper", "length", "round", "nullif", "trim", "substr", "replace",
    "avg", "count", "max", "min", "sum", "group_concat", "total", "stddev", "variance",
    "array_agg", "string_agg",
];

/// Functions with their own SQL rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Iif,
    Like,
    Ilike,
    Contains,
    Regex,
    Concat,
    Today,
    Cast,
    PointX,
    PointY,
    IndexChoice,
    CountDistinct,
    SumIf,
}

impl Builtin {
    /// Look up a builtin by name, case-insensitively.
    pub fn lookup(name: &str) -> Option<Builtin> {
        let builtin = match name.to_ascii_uppercase().as_str() {
            "IIF" => Builtin::Iif,
            "LIKE" => Builtin::Like,
            "ILIKE" => Builtin::Ilike,
            "CONTAINS" => Builtin::Contains,
            "REGEX" => Builtin::Regex,
            "CONCAT" => Builtin::Concat,
            "TODAY" => Builtin::Today,
            "CAST" => Builtin::Cast,
            "POINTX" => Builtin::PointX,
            "POINTY" => Builtin::PointY,
            "INDEX_CHOICE0" => Builtin::IndexChoice,
            "COUNTDISTINCT" => Builtin::CountDistinct,
            "SUMIF" => Builtin::SumIf,
            _ => return None,
        };
        Some(builtin)
    }

    /// Builtins that aggregate rows.
    pub fn is_aggregate(&self) -> bool {
        matches!(self, Builtin::CountDistinct | Builtin::SumIf)
    }

    fn arity(&self) -> (usize, Option<usize>) {
        match self {
            Builtin::Today => (0, Some(0)),
            Builtin::PointX | Builtin::PointY | Builtin::CountDistinct => (1, Some(1)),
            Builtin::Like | Builtin::Ilike | Builtin::Contains | Builtin::Regex | Builtin::Cast => {
                (2, Some(2))
            }
            Builtin::Iif | Builtin::SumIf => (3, Some(3)),
            Builtin::Concat => (1, None),
            Builtin::IndexChoice => (2, None),
        }
    }

    /// Render with already compiled argument fragments.
    pub fn render(&self, name: &str, args: &[String], dialect: Dialect) -> DjaqResult<String> {
        let (min, max) = self.arity();
        if args.len() < min || max.map(|m| args.len() > m).unwrap_or(false) {
            return Err(DjaqError::InvalidExpression(format!(
                "{}() takes {} argument(s), got {}",
                name,
                match max {
                    Some(m) if m == min => min.to_string(),
                    Some(m) => format!("{} to {}", min, m),
                    None => format!("at least {}", min),
                },
                args.len()
            )));
        }

        let sql = match self {
            Builtin::Iif => format!("CASE WHEN {} THEN {} ELSE {} END", args[0], args[1], args[2]),
            Builtin::Like => format!("{} LIKE {}", args[0], args[1]),
            Builtin::Ilike => format!("{} {} {}", args[0], dialect.ilike(), args[1]),
            Builtin::Contains => {
                format!("{} {} '%' || {} || '%'", args[0], dialect.ilike(), args[1])
            }
            Builtin::Regex => format!("{} {} {}", args[0], dialect.regex_match(), args[1]),
            Builtin::Concat => args.join(" || "),
            Builtin::Today => "CURRENT_DATE".to_string(),
            Builtin::Cast => format!("CAST({} AS {})", args[0], cast_type(&args[1])?),
            Builtin::PointX => format!("ST_X({})", args[0]),
            Builtin::PointY => format!("ST_Y({})", args[0]),
            Builtin::IndexChoice => {
                let arms: Vec<String> = args[1..]
                    .iter()
                    .enumerate()
                    .map(|(i, a)| format!("WHEN {} THEN {}", i, a))
                    .collect();
                format!("CASE {} {} END", args[0], arms.join(" "))
            }
            Builtin::CountDistinct => format!("COUNT(DISTINCT {})", args[0]),
            Builtin::SumIf => {
                format!("SUM(CASE WHEN {} THEN {} ELSE {} END)", args[0], args[1], args[2])
            }
        };
        Ok(sql)
    }
}

/// Validate the quoted type argument of CAST and return it bare.
fn cast_type(arg: &str) -> DjaqResult<String> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        Regex::new(r"^'([A-Za-z][A-Za-z0-9_ ]*(\(\d+(,\s*\d+)?\))?)'$").expect("cast type pattern")
    });
    pattern
        .captures(arg)
        .map(|c| c[1].to_string())
        .ok_or_else(|| DjaqError::InvalidExpression(format!("invalid CAST type {}", arg)))
}

/// Lower-cased names of plain SQL functions that may be emitted as written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FunctionWhitelist(BTreeSet<String>);

impl Default for FunctionWhitelist {
    fn default() -> Self {
        Self::new(DEFAULT_FUNCTIONS.iter().copied())
    }
}

impl FunctionWhitelist {
    pub fn new<S: AsRef<str>>(names: impl IntoIterator<Item = S>) -> Self {
        Self(names.into_iter().map(|n| n.as_ref().to_lowercase()).collect())
    }

    /// Builder: allow one more function.
    pub fn with(mut self, name: &str) -> Self {
        self.0.insert(name.to_lowercase());
        self
    }

    pub fn extend<S: AsRef<str>>(&mut self, names: impl IntoIterator<Item = S>) {
        self.0.extend(names.into_iter().map(|n| n.as_ref().to_lowercase()));
    }

    pub fn allows(&self, name: &str) -> bool {
        self.0.contains(&name.to_lowercase())
    }
}
