//! SQL dialect specifics.

use serde::{Deserialize, Serialize};

/// Date parts accepted after a date or datetime field, `pubdate.year`.
pub const DATE_PARTS: &[&str] = &[
    "year", "month", "day", "hour", "minute", "second", "week", "dow", "doy", "quarter",
];

const GENERIC_AGGREGATES: &[&str] = &["avg", "count", "max", "min", "sum"];
const SQLITE_AGGREGATES: &[&str] = &["avg", "count", "max", "min", "sum", "group_concat", "total"];
const POSTGRES_AGGREGATES: &[&str] = &[
    "avg",
    "count",
    "max",
    "min",
    "sum",
    "stddev",
    "variance",
    "array_agg",
    "string_agg",
];

/// SQL dialect for generated statements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// PostgreSQL: `$1` parameters (default)
    #[default]
    Postgres,
    /// SQLite: `?1` parameters
    Sqlite,
    /// Anything else: `?` parameters, ANSI functions
    Generic,
}

impl Dialect {
    /// Infer the dialect from a connection URL.
    pub fn from_url(url: &str) -> Option<Self> {
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            Some(Dialect::Postgres)
        } else if url.starts_with("sqlite:") {
            Some(Dialect::Sqlite)
        } else {
            None
        }
    }

    /// Bind marker for the 1-based parameter `index`.
    pub fn placeholder(&self, index: usize) -> String {
        match self {
            Dialect::Postgres => format!("${}", index),
            Dialect::Sqlite => format!("?{}", index),
            Dialect::Generic => "?".to_string(),
        }
    }

    pub fn aggregate_functions(&self) -> &'static [&'static str] {
        match self {
            Dialect::Postgres => POSTGRES_AGGREGATES,
            Dialect::Sqlite => SQLITE_AGGREGATES,
            Dialect::Generic => GENERIC_AGGREGATES,
        }
    }

    /// Case-insensitive check against this dialect's aggregate functions.
    pub fn is_aggregate(&self, name: &str) -> bool {
        let name = name.to_ascii_lowercase();
        self.aggregate_functions().contains(&name.as_str())
    }

    /// Date part extraction over `column`, or `None` for an unknown part.
    pub fn date_part(&self, part: &str, column: &str) -> Option<String> {
        let part = part.to_ascii_lowercase();
        if !DATE_PARTS.contains(&part.as_str()) {
            return None;
        }
        let sql = match self {
            Dialect::Postgres => format!("date_part('{}', {})", part, column),
            Dialect::Sqlite => {
                let format = match part.as_str() {
                    "year" => "%Y",
                    "month" | "quarter" => "%m",
                    "day" => "%d",
                    "hour" => "%H",
                    "minute" => "%M",
                    "second" => "%S",
                    "week" => "%W",
                    "dow" => "%w",
                    _ => "%j",
                };
                let extracted = format!("CAST(strftime('{}', {}) AS INTEGER)", format, column);
                if part == "quarter" {
                    format!("(({} + 2) / 3)", extracted)
                } else {
                    extracted
                }
            }
            Dialect::Generic => format!("EXTRACT({} FROM {})", part.to_uppercase(), column),
        };
        Some(sql)
    }

    /// Case-insensitive LIKE operator.
    pub fn ilike(&self) -> &'static str {
        match self {
            Dialect::Postgres => "ILIKE",
            _ => "LIKE",
        }
    }

    /// Regular expression match operator.
    pub fn regex_match(&self) -> &'static str {
        match self {
            Dialect::Postgres => "~",
            _ => "REGEXP",
        }
    }
}
