//! Query facade.
//!
//! [`DjaqQuery`] accumulates the parts of one query, compiles them once on
//! demand and hands the result to the database handle's executor. Compiled
//! SQL stays cached until a builder call changes the query; the executed
//! cursor stays until [`DjaqQuery::rewind`] or [`DjaqQuery::context`].
//!
//! ```rust,ignore
//! let mut query = db
//!     .query("Book", "name, publisher.name as publisher")?
//!     .filter(B::new("price > {min}") & B::new("name == {name}"))
//!     .order_by("-price")
//!     .context(context([("min", 10)]));
//!
//! for record in query.dicts()? {
//!     println!("{}", json_line(&record)?);
//! }
//! ```

use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::compiler::{Compiled, Compiler, SelectStatement};
use crate::condition::Condition;
use crate::cursor::{Cursor, Executor, Record, ResultSet, csv_line, json_line};
use crate::engine::DjaqDB;
use crate::error::{DjaqError, DjaqResult};
use crate::registry::{NamedSource, Registry};
use crate::relation::JoinType;
use crate::value::{Context, DjaqValue, context};

/// Context key that carries the primary key for [`DjaqQuery::get`].
const PK_PARAMETER: &str = "djaq_pk";

/// Checks or rewrites each context value before it is used.
pub trait ContextValidator: Send + Sync {
    fn validate(&self, name: &str, value: DjaqValue) -> DjaqResult<DjaqValue>;
}

impl<F> ContextValidator for F
where
    F: Fn(&str, DjaqValue) -> DjaqResult<DjaqValue> + Send + Sync,
{
    fn validate(&self, name: &str, value: DjaqValue) -> DjaqResult<DjaqValue> {
        self(name, value)
    }
}

/// Column or order-by source: one expression string or a list of them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Source(pub String);

impl From<&str> for Source {
    fn from(s: &str) -> Self {
        Source(s.to_string())
    }
}

impl From<String> for Source {
    fn from(s: String) -> Self {
        Source(s)
    }
}

impl From<&[&str]> for Source {
    fn from(items: &[&str]) -> Self {
        Source(items.join(", "))
    }
}

impl<const N: usize> From<[&str; N]> for Source {
    fn from(items: [&str; N]) -> Self {
        Source(items.join(", "))
    }
}

impl From<Vec<&str>> for Source {
    fn from(items: Vec<&str>) -> Self {
        Source(items.join(", "))
    }
}

impl From<Vec<String>> for Source {
    fn from(items: Vec<String>) -> Self {
        Source(items.join(", "))
    }
}

/// Everything needed to compile one query, detached from any database.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryDef {
    /// Model name, qualified or not.
    pub model: String,
    pub select: String,
    pub conditions: Option<Condition>,
    pub order_by: Option<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub distinct: bool,
    pub context: Context,
    pub join_types: HashMap<String, JoinType>,
}

impl QueryDef {
    pub fn new(model: impl Into<String>, select: impl Into<Source>) -> Self {
        Self {
            model: model.into(),
            select: select.into().0,
            ..Default::default()
        }
    }

    /// AND another condition onto the filter.
    pub fn filter(mut self, condition: impl Into<Condition>) -> Self {
        self.conditions = Some(match self.conditions.take() {
            Some(existing) => existing.and_(condition),
            None => condition.into(),
        });
        self
    }

    pub fn order_by(mut self, order_by: impl Into<Source>) -> Self {
        self.order_by = Some(order_by.into().0);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    /// Merge `context` in; later values win.
    pub fn context(mut self, context: Context) -> Self {
        self.context.extend(context);
        self
    }

    pub fn join_type(mut self, path: &str, join_type: JoinType) -> Self {
        self.join_types.insert(path.to_string(), join_type);
        self
    }

    /// The statement with conditions rendered against `context`.
    pub fn statement(&self, context: &Context) -> SelectStatement {
        let filter = self
            .conditions
            .as_ref()
            .map(|c| c.render(context))
            .filter(|f| !f.is_empty());
        SelectStatement {
            select: self.select.clone(),
            filter,
            order_by: self.order_by.clone(),
            limit: self.limit,
            offset: self.offset,
            distinct: self.distinct,
        }
    }
}

/// Fluent, stateful query bound to a [`DjaqDB`].
pub struct DjaqQuery {
    db: DjaqDB,
    def: QueryDef,
    registry: Registry,
    validator: Option<Arc<dyn ContextValidator>>,
    compiled: Option<Compiled>,
    cursor: Option<Cursor>,
}

impl DjaqQuery {
    pub fn new(db: DjaqDB, def: QueryDef) -> Self {
        Self {
            db,
            def,
            registry: Registry::default(),
            validator: None,
            compiled: None,
            cursor: None,
        }
    }

    pub fn definition(&self) -> &QueryDef {
        &self.def
    }

    fn invalidate(mut self) -> Self {
        self.compiled = None;
        self.cursor = None;
        self
    }

    /// AND a filter condition onto the query.
    pub fn filter(mut self, condition: impl Into<Condition>) -> Self {
        self.def = self.def.filter(condition);
        self.invalidate()
    }

    pub fn order_by(mut self, order_by: impl Into<Source>) -> Self {
        self.def = self.def.order_by(order_by);
        self.invalidate()
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.def = self.def.limit(limit);
        self.invalidate()
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.def = self.def.offset(offset);
        self.invalidate()
    }

    pub fn distinct(mut self) -> Self {
        self.def = self.def.distinct();
        self.invalidate()
    }

    /// Merge context values. The next fetch recompiles and re-executes.
    pub fn context(mut self, context: Context) -> Self {
        self.def = self.def.context(context);
        self.invalidate()
    }

    /// Override the join type used for an attribute path.
    pub fn join_type(mut self, path: &str, join_type: JoinType) -> Self {
        self.def = self.def.join_type(path, join_type);
        self.invalidate()
    }

    /// Make every entry of `registry` available as `'@name'`.
    pub fn names(mut self, registry: Registry) -> Self {
        self.registry.merge(registry);
        self.invalidate()
    }

    pub fn register(mut self, name: &str, source: NamedSource) -> Self {
        self.registry.insert(name, source);
        self.invalidate()
    }

    pub fn validator(mut self, validator: impl ContextValidator + 'static) -> Self {
        self.validator = Some(Arc::new(validator));
        self.invalidate()
    }

    /// Drop the executed cursor; compiled SQL is kept.
    pub fn rewind(&mut self) -> &mut Self {
        self.cursor = None;
        self
    }

    fn validated_context(&self) -> DjaqResult<Context> {
        let Some(validator) = &self.validator else {
            return Ok(self.def.context.clone());
        };
        self.def
            .context
            .iter()
            .map(|(name, value)| Ok((name.clone(), validator.validate(name, value.clone())?)))
            .collect()
    }

    fn build(&self) -> DjaqResult<Compiled> {
        let schema = self.db.schema();
        let options = self.db.options();
        let context = self.validated_context()?;
        let model = schema.resolve_model(&self.def.model, options.whitelist.as_ref())?;
        let statement = self.def.statement(&context);

        let compiled = Compiler::new(schema, options, &self.registry, &context, model)
            .join_types(&self.def.join_types)
            .compile(&statement)?;
        debug!(
            model = %model.label(),
            sql = %compiled.sql,
            parameters = compiled.parameters.len(),
            "compiled query"
        );
        Ok(compiled)
    }

    /// Compile, or return the cached compilation.
    pub fn compile(&mut self) -> DjaqResult<&Compiled> {
        let compiled = match self.compiled.take() {
            Some(compiled) => compiled,
            None => self.build()?,
        };
        Ok(self.compiled.insert(compiled))
    }

    /// Compiled SQL text, without executing.
    pub fn sql(&mut self) -> DjaqResult<String> {
        Ok(self.compile()?.sql.clone())
    }

    fn executor(&self) -> DjaqResult<Arc<dyn Executor>> {
        self.db
            .executor()
            .cloned()
            .ok_or_else(|| DjaqError::Connection("no database configured".to_string()))
    }

    /// The executed cursor, executing on first use.
    pub fn cursor(&mut self) -> DjaqResult<&mut Cursor> {
        let cursor = match self.cursor.take() {
            Some(cursor) => cursor,
            None => {
                let executor = self.executor()?;
                let compiled = self.compile()?;
                let source = executor.execute(&compiled.sql, &compiled.parameters)?;
                Cursor::new(source, compiled.aliases())
            }
        };
        Ok(self.cursor.insert(cursor))
    }

    /// Next row as a tuple.
    pub fn next_row(&mut self) -> DjaqResult<Option<Vec<DjaqValue>>> {
        self.cursor()?.next_row()
    }

    /// Next row keyed by column alias.
    pub fn next_record(&mut self) -> DjaqResult<Option<Record>> {
        self.cursor()?.next_record()
    }

    /// Number of rows the query yields, via `SELECT COUNT(*)`.
    pub fn count(&mut self) -> DjaqResult<i64> {
        let executor = self.executor()?;
        let compiled = self.compile()?;
        let mut source = executor.execute(&compiled.count_sql(), &compiled.parameters)?;
        source
            .fetch()?
            .and_then(|row| row.first().and_then(DjaqValue::as_i64))
            .ok_or_else(|| DjaqError::Execution("count returned no value".to_string()))
    }

    /// First column of the first row. Always reads from the start.
    pub fn value(&mut self) -> DjaqResult<Option<DjaqValue>> {
        self.rewind();
        Ok(self
            .next_row()?
            .and_then(|row| row.into_iter().next()))
    }

    /// Remaining rows as tuples.
    pub fn tuples(&mut self) -> DjaqResult<Vec<Vec<DjaqValue>>> {
        self.cursor()?.collect_rows()
    }

    /// Remaining rows flattened into one list of values.
    pub fn scalars(&mut self) -> DjaqResult<Vec<DjaqValue>> {
        Ok(self.tuples()?.into_iter().flatten().collect())
    }

    /// Remaining rows keyed by column alias.
    pub fn dicts(&mut self) -> DjaqResult<Vec<Record>> {
        let mut records = Vec::new();
        while let Some(record) = self.next_record()? {
            records.push(record);
        }
        Ok(records)
    }

    /// Remaining rows deserialized into `T` by column alias.
    pub fn objs<T: DeserializeOwned>(&mut self) -> DjaqResult<Vec<T>> {
        self.dicts()?
            .iter()
            .map(|record| {
                serde_json::from_value(record.to_json()).map_err(|e| DjaqError::Decode(e.to_string()))
            })
            .collect()
    }

    /// Remaining rows passed through `f`.
    pub fn map<T, F>(&mut self, f: F) -> DjaqResult<Vec<T>>
    where
        F: FnMut(Record) -> T,
    {
        Ok(self.dicts()?.into_iter().map(f).collect())
    }

    /// Remaining rows as CSV lines.
    pub fn csv(&mut self) -> DjaqResult<Vec<String>> {
        self.tuples()?.iter().map(|row| csv_line(row)).collect()
    }

    /// Remaining rows as JSON object lines.
    pub fn json(&mut self) -> DjaqResult<Vec<String>> {
        self.dicts()?.iter().map(json_line).collect()
    }

    /// The record whose primary key is `pk`, through this query's columns
    /// and filter. This query's own cursor is left alone.
    pub fn get(&self, pk: impl Into<DjaqValue>) -> DjaqResult<Option<Record>> {
        let pk = pk.into();
        if !pk.is_present() {
            return Ok(None);
        }

        let mut def = self
            .def
            .clone()
            .filter(format!("pk == {{{}}}", PK_PARAMETER))
            .context(context([(PK_PARAMETER, pk)]))
            .limit(1);
        def.offset = None;

        let mut lookup = DjaqQuery {
            db: self.db.clone(),
            def,
            registry: self.registry.clone(),
            validator: self.validator.clone(),
            compiled: None,
            cursor: None,
        };
        lookup.next_record()
    }

    /// Remaining rows in a rewindable set.
    pub fn fetch_all(&mut self) -> DjaqResult<ResultSet> {
        ResultSet::from_cursor(self.cursor()?)
    }
}
