//! Join relations: one participating table instance per compiled query.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::dialect::Dialect;
use crate::schema::Model;

/// Index of a relation within one compilation; 0 is the master.
pub type RelationId = usize;

/// SQL join type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinType {
    #[default]
    Left,
    Right,
    Inner,
}

impl JoinType {
    pub fn as_sql(&self) -> &'static str {
        match self {
            JoinType::Left => "LEFT JOIN",
            JoinType::Right => "RIGHT JOIN",
            JoinType::Inner => "INNER JOIN",
        }
    }
}

/// Double-quote an identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Fully qualified `"relation"."column"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnRef {
    pub relation: String,
    pub column: String,
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", quote_ident(&self.relation), quote_ident(&self.column))
    }
}

/// How a joined relation attaches to the relation that introduced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Linkage {
    /// FK column on the parent, key column on the joined relation.
    Forward { from: ColumnRef, to: ColumnRef },
    /// Key column on the parent, FK column on the joined relation.
    Reverse { from: ColumnRef, to: ColumnRef },
    /// One hop of a many-to-many bridge through a link table.
    Bridge { from: ColumnRef, to: ColumnRef },
}

impl Linkage {
    pub fn condition(&self) -> String {
        match self {
            Linkage::Forward { from, to }
            | Linkage::Reverse { from, to }
            | Linkage::Bridge { from, to } => format!("{} = {}", from, to),
        }
    }
}

/// A SELECT column fragment as captured during the walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnExpr {
    pub sql: String,
    /// Whether the fragment touched at least one field.
    pub references_field: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderFragment {
    pub sql: String,
    pub descending: bool,
}

impl fmt::Display for OrderFragment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.sql, if self.descending { "DESC" } else { "ASC" })
    }
}

/// One table instance in a compiled query.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinRelation {
    /// Model label; `None` for many-to-many link tables.
    pub model: Option<String>,
    pub table: String,
    pub alias: Option<String>,
    /// Attribute path from the master, `publisher.owner`; empty for the master.
    pub path: String,
    pub join_type: JoinType,
    pub linkage: Option<Linkage>,
    pub select: Vec<String>,
    pub column_expressions: Vec<ColumnExpr>,
    pub where_clause: String,
    pub order_by: Vec<OrderFragment>,
    pub group_by: bool,
}

impl JoinRelation {
    /// The FROM relation.
    pub fn master(model: &Model, alias: Option<String>) -> Self {
        Self::new(Some(model.label()), &model.table, alias, String::new(), JoinType::Left, None)
    }

    pub fn new(
        model: Option<String>,
        table: &str,
        alias: Option<String>,
        path: String,
        join_type: JoinType,
        linkage: Option<Linkage>,
    ) -> Self {
        Self {
            model,
            table: table.to_string(),
            alias,
            path,
            join_type,
            linkage,
            select: Vec::new(),
            column_expressions: Vec::new(),
            where_clause: String::new(),
            order_by: Vec::new(),
            group_by: false,
        }
    }

    /// Name other fragments use to refer to this relation.
    pub fn reference(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.table)
    }

    pub fn column(&self, column: &str) -> ColumnRef {
        ColumnRef {
            relation: self.reference().to_string(),
            column: column.to_string(),
        }
    }

    /// `"table"` or `"table" AS "alias"`.
    pub fn table_clause(&self) -> String {
        match &self.alias {
            Some(alias) => format!("{} AS {}", quote_ident(&self.table), quote_ident(alias)),
            None => quote_ident(&self.table),
        }
    }

    /// `LEFT JOIN "table" ON (...)`, or `None` for the master.
    pub fn join_clause(&self) -> Option<String> {
        self.linkage.as_ref().map(|linkage| {
            format!(
                "{} {} ON ({})",
                self.join_type.as_sql(),
                self.table_clause(),
                linkage.condition()
            )
        })
    }

    /// Non-aggregate column fragments that referenced a field, deduplicated.
    pub fn group_by_columns(&self, dialect: Dialect) -> Vec<String> {
        let mut columns: Vec<String> = Vec::new();
        for expr in &self.column_expressions {
            if expr.references_field
                && !is_aggregate_expression(&expr.sql, dialect)
                && !columns.contains(&expr.sql)
            {
                columns.push(expr.sql.clone());
            }
        }
        columns
    }
}

/// Whether the outermost function of `sql`, leading parens stripped, is an
/// aggregate of `dialect`.
pub fn is_aggregate_expression(sql: &str, dialect: Dialect) -> bool {
    let stripped = sql.trim_start_matches(|c: char| c == '(' || c.is_whitespace());
    match stripped.split_once('(') {
        Some((name, _)) => dialect.is_aggregate(name.trim()),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Field, Model};

    fn book() -> Model {
        Model::new("books", "Book", "books_book").field(Field::pk("id"))
    }

    #[test]
    fn test_master_reference_and_alias() {
        let master = JoinRelation::master(&book(), None);
        assert_eq!(master.reference(), "books_book");
        assert_eq!(master.column("name").to_string(), r#""books_book"."name""#);
        assert!(master.join_clause().is_none());

        let aliased = JoinRelation::master(&book(), Some("sq1".into()));
        assert_eq!(aliased.table_clause(), r#""books_book" AS "sq1""#);
        assert_eq!(aliased.column("id").to_string(), r#""sq1"."id""#);
    }

    #[test]
    fn test_join_clause() {
        let master = JoinRelation::master(&book(), None);
        let publisher = JoinRelation::new(
            Some("books.Publisher".into()),
            "books_publisher",
            None,
            "publisher".into(),
            JoinType::Inner,
            Some(Linkage::Forward {
                from: master.column("publisher_id"),
                to: ColumnRef {
                    relation: "books_publisher".into(),
                    column: "id".into(),
                },
            }),
        );
        assert_eq!(
            publisher.join_clause().unwrap(),
            r#"INNER JOIN "books_publisher" ON ("books_book"."publisher_id" = "books_publisher"."id")"#
        );
    }

    #[test]
    fn test_aggregate_detection() {
        let pg = Dialect::Postgres;
        assert!(is_aggregate_expression(r#"avg("books_book"."price")"#, pg));
        assert!(is_aggregate_expression(r#"((COUNT(DISTINCT "t"."id")))"#, pg));
        assert!(!is_aggregate_expression(r#""books_book"."name""#, pg));
        assert!(!is_aggregate_expression(r#"lower("books_book"."name")"#, pg));
        assert!(!is_aggregate_expression(r#"("t"."a" * 2)"#, pg));
    }

    #[test]
    fn test_group_by_columns() {
        let mut master = JoinRelation::master(&book(), None);
        for (sql, references_field) in [
            (r#""books_book"."name""#, true),
            (r#"avg("books_book"."price")"#, true),
            ("{discount}", false),
            (r#""books_book"."name""#, true),
        ] {
            master.column_expressions.push(ColumnExpr {
                sql: sql.to_string(),
                references_field,
            });
        }
        assert_eq!(
            master.group_by_columns(Dialect::Postgres),
            vec![r#""books_book"."name""#.to_string()]
        );
    }
}
