//! # Djaq — query expressions compiled to SQL
//!
//! Djaq turns a compact column/filter/ordering expression over a described
//! schema into one SQL SELECT, joining related tables as attribute paths
//! reach them and grouping automatically when aggregates appear.
//!
//! ## Quick Example
//!
//! ```rust,ignore
//! use djaq::prelude::*;
//!
//! let schema = Schema::from_file(Path::new("schema.json"))?;
//! let db = DjaqDB::connect("postgres://localhost/bookshop", schema)?;
//!
//! let mut query = db
//!     .query("Book", "publisher.name, avg(price) as avg_price")?
//!     .filter("pages > {min}")
//!     .context(context([("min", 100)]));
//!
//! query.sql()?;
//! // => SELECT "books_publisher"."name" AS "publisher_name",
//! //    avg("books_book"."price") AS "avg_price" FROM "books_book"
//! //    LEFT JOIN "books_publisher" ON (...) WHERE "books_book"."pages" > $1
//! //    GROUP BY "books_publisher"."name"
//! ```
//!
//! ## Expressions
//!
//! | Form                  | Meaning                                  |
//! |-----------------------|------------------------------------------|
//! | `publisher.owner.name`| attribute path, joins as needed          |
//! | `{name}`              | placeholder bound from the context       |
//! | `name == 'B*'`        | glob, compiled to `LIKE 'B%'`            |
//! | `pubdate.year`        | date part of a date field                |
//! | `'@name'`             | named sub-query, list or SQL             |
//! | `subquery('M', 'c')`  | nested query, `outer.x` correlates       |
//! | `-name`               | descending in order-by                   |

pub mod ast;
pub mod compiler;
pub mod condition;
pub mod config;
pub mod cursor;
pub mod dialect;
pub mod engine;
pub mod error;
pub mod functions;
pub mod parser;
pub mod placeholder;
pub mod query;
pub mod registry;
pub mod relation;
pub mod schema;
pub mod value;

pub mod prelude {
    pub use crate::compiler::{CompileOptions, Compiled, SelectStatement};
    pub use crate::condition::{B, Condition, and_, or_};
    pub use crate::config::Settings;
    pub use crate::cursor::{Executor, Record, ResultSet, RowSource};
    pub use crate::dialect::Dialect;
    pub use crate::engine::{DjaqDB, SqlxExecutor};
    pub use crate::error::*;
    pub use crate::functions::FunctionWhitelist;
    pub use crate::query::{ContextValidator, DjaqQuery, QueryDef};
    pub use crate::registry::{NamedSource, Registry};
    pub use crate::relation::JoinType;
    pub use crate::schema::{Schema, Whitelist};
    pub use crate::value::{Context, DjaqValue, context};
}

/// Compile one SELECT without a database handle.
///
/// # Example
///
/// ```
/// use djaq::prelude::*;
///
/// let schema = Schema::from_json(r#"{"models": [{
///     "namespace": "books", "name": "Book", "table": "books_book",
///     "fields": [
///         {"name": "id", "type": "auto", "primary_key": true},
///         {"name": "name", "type": "char"}
///     ]
/// }]}"#).unwrap();
///
/// let compiled = djaq::compile(
///     &schema,
///     &CompileOptions::default(),
///     "Book",
///     &SelectStatement::new("name").filter("id == 1"),
///     &Context::new(),
/// ).unwrap();
/// assert_eq!(
///     compiled.sql,
///     r#"SELECT "books_book"."name" AS "name" FROM "books_book" WHERE "books_book"."id" = 1"#
/// );
/// ```
pub fn compile(
    schema: &schema::Schema,
    options: &compiler::CompileOptions,
    model: &str,
    statement: &compiler::SelectStatement,
    context: &value::Context,
) -> error::DjaqResult<compiler::Compiled> {
    compiler::compile(schema, options, model, statement, context)
}
