//! Expression compiler.
//!
//! Turns a column list, an optional filter and an optional ordering into a
//! single SELECT statement. Attribute paths grow a graph of
//! [`JoinRelation`]s as they are resolved; an aggregate call marks the
//! query for GROUP BY, which is settled once the walk is over.
//!
//! Compilation happens in two steps. [`Compiler::compile_template`] emits
//! SQL that still carries `{name}` tokens, and [`Template::bind`] rewrites
//! those tokens into the dialect's bind markers and collects the ordered
//! parameter list.

use std::collections::HashMap;
use tracing::{debug, trace};

use crate::ast::*;
use crate::dialect::Dialect;
use crate::error::{DjaqError, DjaqResult};
use crate::functions::{Builtin, FunctionWhitelist};
use crate::parser::{parse_columns, parse_expression, parse_order_by};
use crate::placeholder;
use crate::registry::{NamedSource, Registry};
use crate::relation::{
    ColumnExpr, ColumnRef, JoinRelation, JoinType, Linkage, OrderFragment, RelationId, quote_ident,
};
use crate::schema::{Field, Model, Relation, Schema, Whitelist};
use crate::value::{Context, DjaqValue};

/// Placeholder prefix for values spliced in from sub-queries.
const SPLICE_PREFIX: &str = "__djaq";
/// Deepest allowed chain of nested or named sub-queries.
const MAX_DEPTH: usize = 8;
/// Select, filter and order-by fragments all live on the FROM relation.
const MASTER: RelationId = 0;

/// Compiler configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompileOptions {
    pub dialect: Dialect,
    pub whitelist: Option<Whitelist>,
    pub functions: FunctionWhitelist,
    /// Inline string literals that hold a full `SELECT ...` statement.
    pub trust_literal_sql: bool,
}

impl CompileOptions {
    pub fn dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = dialect;
        self
    }

    pub fn whitelist(mut self, whitelist: Whitelist) -> Self {
        self.whitelist = Some(whitelist);
        self
    }

    pub fn functions(mut self, functions: FunctionWhitelist) -> Self {
        self.functions = functions;
        self
    }

    pub fn trust_literal_sql(mut self, trust: bool) -> Self {
        self.trust_literal_sql = trust;
        self
    }
}

/// Sources of one SELECT.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectStatement {
    pub select: String,
    pub filter: Option<String>,
    pub order_by: Option<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub distinct: bool,
}

impl SelectStatement {
    pub fn new(select: impl Into<String>) -> Self {
        Self {
            select: select.into(),
            ..Default::default()
        }
    }

    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn order_by(mut self, order_by: impl Into<String>) -> Self {
        self.order_by = Some(order_by.into());
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
}

/// Final SQL with bind markers, its parameters and the column alias table.
#[derive(Debug, Clone, PartialEq)]
pub struct Compiled {
    pub sql: String,
    pub parameters: Vec<DjaqValue>,
    /// Output columns in SELECT order.
    pub columns: Vec<ColumnSource>,
    /// Number of relations, master included.
    pub relations: usize,
}

impl Compiled {
    pub fn aliases(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.alias.clone()).collect()
    }

    /// The statement wrapped in `SELECT COUNT(*)`.
    pub fn count_sql(&self) -> String {
        format!("SELECT COUNT(*) FROM ({}) c", self.sql)
    }
}

/// SQL whose `{name}` tokens are still unbound.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    pub sql: String,
    /// Values referenced by `{__djaqN}` tokens.
    pub spliced: Vec<DjaqValue>,
    pub columns: Vec<ColumnSource>,
    pub relations: usize,
}

impl Template {
    /// Replace each token with bind markers, in order of appearance.
    ///
    /// Lists expand to one marker per element, `($1, $2)`; an empty list
    /// becomes `(NULL)`.
    pub fn bind(self, dialect: Dialect, context: &Context) -> DjaqResult<Compiled> {
        let mut parameters = Vec::new();
        let spliced = self.spliced;

        let sql = placeholder::rewrite(&self.sql, |name| {
            let value = match spliced_index(name) {
                Some(index) => spliced.get(index).cloned(),
                None => context.get(name).cloned(),
            }
            .ok_or_else(|| DjaqError::MissingParameter(name.to_string()))?;
            Ok(push_parameter(&mut parameters, dialect, value))
        })?;

        Ok(Compiled {
            sql,
            parameters,
            columns: self.columns,
            relations: self.relations,
        })
    }
}

fn push_parameter(parameters: &mut Vec<DjaqValue>, dialect: Dialect, value: DjaqValue) -> String {
    match value {
        DjaqValue::List(items) if items.is_empty() => "(NULL)".to_string(),
        DjaqValue::List(items) => {
            let markers: Vec<String> = items
                .into_iter()
                .map(|item| {
                    parameters.push(item);
                    dialect.placeholder(parameters.len())
                })
                .collect();
            format!("({})", markers.join(", "))
        }
        value => {
            parameters.push(value);
            dialect.placeholder(parameters.len())
        }
    }
}

fn splice_token(index: usize) -> String {
    format!("{{{}{}}}", SPLICE_PREFIX, index)
}

fn spliced_index(name: &str) -> Option<usize> {
    name.strip_prefix(SPLICE_PREFIX)?.parse().ok()
}

/// Single-quote a string literal.
pub fn quote_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

fn is_literal_select(text: &str) -> bool {
    let text = text.trim_start();
    text.get(..6)
        .is_some_and(|head| head.eq_ignore_ascii_case("select"))
        && text[6..].starts_with(char::is_whitespace)
}

fn column_of(field: &Field) -> &str {
    field.column_name().unwrap_or(&field.name)
}

/// The enclosing query of a correlated sub-query.
struct OuterScope<'a> {
    model: &'a Model,
    reference: String,
}

/// Compilation state for one SELECT.
pub struct Compiler<'a> {
    schema: &'a Schema,
    options: &'a CompileOptions,
    registry: &'a Registry,
    context: &'a Context,
    model: &'a Model,
    join_types: HashMap<String, JoinType>,
    relations: Vec<JoinRelation>,
    /// An aggregate call was seen; GROUP BY is settled after the walk.
    aggregated: bool,
    /// Table names and aliases already bound by enclosing queries.
    enclosing: Vec<String>,
    spliced: Vec<DjaqValue>,
    field_refs: usize,
    outer: Option<OuterScope<'a>>,
    depth: usize,
}

/// Compile `statement` against `model` with an empty registry.
pub fn compile(
    schema: &Schema,
    options: &CompileOptions,
    model: &str,
    statement: &SelectStatement,
    context: &Context,
) -> DjaqResult<Compiled> {
    let registry = Registry::default();
    let model = schema.resolve_model(model, options.whitelist.as_ref())?;
    Compiler::new(schema, options, &registry, context, model).compile(statement)
}

impl<'a> Compiler<'a> {
    pub fn new(
        schema: &'a Schema,
        options: &'a CompileOptions,
        registry: &'a Registry,
        context: &'a Context,
        model: &'a Model,
    ) -> Self {
        Self {
            schema,
            options,
            registry,
            context,
            model,
            join_types: HashMap::new(),
            relations: vec![JoinRelation::master(model, None)],
            aggregated: false,
            enclosing: Vec::new(),
            spliced: Vec::new(),
            field_refs: 0,
            outer: None,
            depth: 0,
        }
    }

    /// Override join types per attribute path, `"publisher" => Inner`.
    pub fn join_types(mut self, join_types: &HashMap<String, JoinType>) -> Self {
        self.join_types = join_types.clone();
        self
    }

    /// Compile and bind.
    pub fn compile(self, statement: &SelectStatement) -> DjaqResult<Compiled> {
        let dialect = self.options.dialect;
        let context = self.context;
        self.compile_template(statement)?.bind(dialect, context)
    }

    /// Compile to SQL with unbound `{name}` tokens.
    pub fn compile_template(mut self, statement: &SelectStatement) -> DjaqResult<Template> {
        let columns = parse_columns(&self.expand_select(&statement.select))?;
        if columns.is_empty() {
            return Err(DjaqError::InvalidExpression("empty column list".to_string()));
        }

        for column in &columns {
            let expr = parse_expression(&column.expression)?;
            let refs_before = self.field_refs;
            let sql = self.compile_node(&expr)?;
            let references_field = self.field_refs > refs_before;
            let relation = &mut self.relations[MASTER];
            relation
                .select
                .push(format!("{} AS {}", sql, quote_ident(&column.alias)));
            relation.column_expressions.push(ColumnExpr {
                sql,
                references_field,
            });
        }

        if let Some(filter) = statement.filter.as_deref().filter(|f| !f.trim().is_empty()) {
            let expr = parse_expression(filter)?;
            let sql = self.compile_node(&expr)?;
            self.relations[MASTER].where_clause = sql;
        }

        if let Some(order_by) = statement.order_by.as_deref() {
            for term in parse_order_by(order_by)? {
                let sql = self.compile_node(&term.expr)?;
                self.relations[MASTER].order_by.push(OrderFragment {
                    sql,
                    descending: term.descending,
                });
            }
        }

        self.relations[MASTER].group_by = self.aggregated;

        let sql = self.assemble(statement);
        debug!(sql = %sql, relations = self.relations.len(), depth = self.depth, "compiled template");

        Ok(Template {
            sql,
            spliced: self.spliced,
            columns,
            relations: self.relations.len(),
        })
    }

    /// `*` or nothing means every concrete field of the model.
    fn expand_select(&self, select: &str) -> String {
        match select.trim() {
            "" | "*" => self
                .model
                .concrete_fields()
                .map(|f| f.name.as_str())
                .collect::<Vec<_>>()
                .join(", "),
            other => other.to_string(),
        }
    }

    fn assemble(&self, statement: &SelectStatement) -> String {
        let select: Vec<&str> = self
            .relations
            .iter()
            .flat_map(|r| r.select.iter().map(String::as_str))
            .collect();
        let mut sql = format!(
            "SELECT {}{} FROM {}",
            if statement.distinct { "DISTINCT " } else { "" },
            select.join(", "),
            self.relations[0].table_clause()
        );

        for join in self.relations[1..].iter().filter_map(JoinRelation::join_clause) {
            sql.push(' ');
            sql.push_str(&join);
        }

        let conditions: Vec<&str> = self
            .relations
            .iter()
            .map(|r| r.where_clause.as_str())
            .filter(|w| !w.is_empty())
            .collect();
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }

        let mut group_by: Vec<String> = Vec::new();
        for relation in self.relations.iter().filter(|r| r.group_by) {
            for column in relation.group_by_columns(self.options.dialect) {
                if !group_by.contains(&column) {
                    group_by.push(column);
                }
            }
        }
        if !group_by.is_empty() {
            sql.push_str(" GROUP BY ");
            sql.push_str(&group_by.join(", "));
        }

        let order_by: Vec<String> = self
            .relations
            .iter()
            .flat_map(|r| r.order_by.iter().map(|o| o.to_string()))
            .collect();
        if !order_by.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&order_by.join(", "));
        }

        if let Some(limit) = statement.limit.filter(|n| *n > 0) {
            sql.push_str(&format!(" LIMIT {}", limit));
        }
        if let Some(offset) = statement.offset.filter(|n| *n > 0) {
            sql.push_str(&format!(" OFFSET {}", offset));
        }
        sql
    }

    /// Compile one node to a SQL fragment.
    fn compile_node(&mut self, expr: &Expr) -> DjaqResult<String> {
        match expr {
            Expr::Path(segments) => self.resolve_path(segments),
            Expr::Literal(literal) => self.compile_literal(literal),
            Expr::Placeholder(name) => Ok(format!("{{{}}}", name)),
            Expr::Star => Ok("*".to_string()),
            Expr::Call { name, args } => self.compile_call(name, args),
            Expr::Binary { op, left, right } => {
                let left = self.compile_node(left)?;
                let right = self.compile_node(right)?;
                Ok(format!("({} {} {})", left, op.as_sql(), right))
            }
            Expr::Compare { op, left, right } => self.compile_compare(*op, left, right),
            Expr::Logical { op, operands } => {
                let parts = self.compile_all(operands)?;
                Ok(format!("({})", parts.join(&format!(" {} ", op.as_sql()))))
            }
            Expr::Unary { op, operand } => {
                let inner = self.compile_node(operand)?;
                Ok(match op {
                    UnaryOp::Not => format!("NOT {}", inner),
                    UnaryOp::Neg if inner.starts_with('-') => format!("-({})", inner),
                    UnaryOp::Neg => format!("-{}", inner),
                    UnaryOp::Pos => inner,
                })
            }
            Expr::Tuple(items) | Expr::List(items) => {
                if items.is_empty() {
                    return Ok("(NULL)".to_string());
                }
                Ok(format!("({})", self.compile_all(items)?.join(", ")))
            }
        }
    }

    fn compile_all(&mut self, exprs: &[Expr]) -> DjaqResult<Vec<String>> {
        exprs.iter().map(|e| self.compile_node(e)).collect()
    }

    fn compile_literal(&mut self, literal: &Literal) -> DjaqResult<String> {
        match literal {
            Literal::Number(n) => Ok(n.clone()),
            Literal::Bool(true) => Ok("TRUE".to_string()),
            Literal::Bool(false) => Ok("FALSE".to_string()),
            Literal::Null => Ok("NULL".to_string()),
            Literal::Str(text) => {
                if let Some(name) = text.strip_prefix('@') {
                    self.resolve_named(name)
                } else if is_literal_select(text) {
                    if self.options.trust_literal_sql {
                        Ok(format!("({})", text.trim()))
                    } else {
                        Err(DjaqError::UntrustedSql(text.clone()))
                    }
                } else {
                    Ok(quote_literal(text))
                }
            }
        }
    }

    fn compile_compare(&mut self, op: CompareOp, left: &Expr, right: &Expr) -> DjaqResult<String> {
        let left_sql = self.compile_node(left)?;

        // 'B*' after == / != is a LIKE pattern
        if let Some(text) = right.as_str_literal() {
            let glob = text.contains('*') && !text.starts_with('@') && !is_literal_select(text);
            if glob && matches!(op, CompareOp::Eq | CompareOp::NotEq) {
                let like = if op == CompareOp::Eq { "LIKE" } else { "NOT LIKE" };
                return Ok(format!("{} {} {}", left_sql, like, quote_literal(&text.replace('*', "%"))));
            }
        }

        if matches!(right, Expr::Literal(Literal::Null)) {
            match op {
                CompareOp::Eq | CompareOp::Is => return Ok(format!("{} IS NULL", left_sql)),
                CompareOp::NotEq | CompareOp::IsNot => {
                    return Ok(format!("{} IS NOT NULL", left_sql));
                }
                _ => {}
            }
        }

        let right_sql = self.compile_node(right)?;
        Ok(format!("{} {} {}", left_sql, op.as_sql(), right_sql))
    }

    fn compile_call(&mut self, name: &str, args: &[Expr]) -> DjaqResult<String> {
        if name.eq_ignore_ascii_case("subquery") {
            return self.compile_subquery(args);
        }

        let builtin = Builtin::lookup(name);
        if builtin.is_none() && !self.options.functions.allows(name) {
            return Err(DjaqError::UnknownFunction(name.to_string()));
        }

        let compiled = self.compile_all(args)?;

        let aggregate =
            builtin.map(|b| b.is_aggregate()).unwrap_or(false) || self.options.dialect.is_aggregate(name);
        self.aggregated |= aggregate;

        match builtin {
            Some(builtin) => builtin.render(name, &compiled, self.options.dialect),
            None => Ok(format!("{}({})", name, compiled.join(", "))),
        }
    }

    /// `subquery('Model', 'columns'[, 'filter'])`, correlated through `outer.field`.
    fn compile_subquery(&mut self, args: &[Expr]) -> DjaqResult<String> {
        let sources: Option<Vec<&str>> = args.iter().map(Expr::as_str_literal).collect();
        let (model_name, select, filter) = match sources.as_deref() {
            Some([model, select]) => (*model, *select, None),
            Some([model, select, filter]) => (*model, *select, Some(filter.to_string())),
            _ => {
                return Err(DjaqError::InvalidExpression(
                    "subquery() takes a model, a column list and an optional filter, as strings"
                        .to_string(),
                ));
            }
        };

        let schema = self.schema;
        let model = schema.resolve_model(model_name, self.options.whitelist.as_ref())?;
        let outer = OuterScope {
            model: self.model,
            reference: self.relations[0].reference().to_string(),
        };
        let statement = SelectStatement {
            select: select.to_string(),
            filter,
            ..Default::default()
        };
        let template = self
            .nested(model, Some(outer), self.context)?
            .compile_template(&statement)?;
        Ok(format!("({})", self.splice(template, None)?))
    }

    /// Resolve `'@name'` through the registry.
    fn resolve_named(&mut self, name: &str) -> DjaqResult<String> {
        let registry = self.registry;
        let source = registry
            .get(name)
            .ok_or_else(|| DjaqError::SubqueryResolution(format!("no source named '{}'", name)))?;

        match source {
            NamedSource::Query(definition) => {
                let schema = self.schema;
                let model = schema.resolve_model(&definition.model, self.options.whitelist.as_ref())?;
                let statement = definition.statement(&definition.context);
                let template = self
                    .nested(model, None, &definition.context)?
                    .join_types(&definition.join_types)
                    .compile_template(&statement)?;
                Ok(format!("({})", self.splice(template, Some(&definition.context))?))
            }
            NamedSource::Values(values) => {
                self.spliced.push(DjaqValue::List(values.clone()));
                Ok(splice_token(self.spliced.len() - 1))
            }
            NamedSource::Sql { sql, context } => {
                let template = Template {
                    sql: sql.clone(),
                    spliced: Vec::new(),
                    columns: Vec::new(),
                    relations: 0,
                };
                Ok(format!("({})", self.splice(template, Some(context))?))
            }
        }
    }

    /// Child compiler for a sub-query, one level deeper.
    fn nested(
        &self,
        model: &'a Model,
        outer: Option<OuterScope<'a>>,
        context: &'a Context,
    ) -> DjaqResult<Compiler<'a>> {
        let depth = self.depth + 1;
        if depth > MAX_DEPTH {
            return Err(DjaqError::SubqueryResolution(format!(
                "sub-queries nested deeper than {}",
                MAX_DEPTH
            )));
        }
        let alias = outer.as_ref().map(|_| format!("sq{}", depth));
        let mut compiler = Compiler::new(self.schema, self.options, self.registry, context, model);
        compiler.relations = vec![JoinRelation::master(model, alias)];
        compiler.outer = outer;
        compiler.depth = depth;
        compiler.enclosing = self.enclosing.clone();
        for relation in &self.relations {
            compiler.enclosing.push(relation.table.clone());
            compiler.enclosing.push(relation.reference().to_string());
        }
        Ok(compiler)
    }

    /// Move a sub-query's values into this compilation and renumber its
    /// tokens. With `own_context`, its context placeholders are captured as
    /// values too; otherwise they stay for the shared context.
    fn splice(&mut self, template: Template, own_context: Option<&Context>) -> DjaqResult<String> {
        let offset = self.spliced.len();
        let spliced = &mut self.spliced;
        spliced.extend(template.spliced);

        placeholder::rewrite(&template.sql, |name| {
            if let Some(index) = spliced_index(name) {
                return Ok(splice_token(offset + index));
            }
            match own_context {
                Some(context) => {
                    let value = context
                        .get(name)
                        .cloned()
                        .ok_or_else(|| DjaqError::MissingParameter(name.to_string()))?;
                    spliced.push(value);
                    Ok(splice_token(spliced.len() - 1))
                }
                None => Ok(format!("{{{}}}", name)),
            }
        })
    }

    fn model_of(&self, id: RelationId) -> DjaqResult<&'a Model> {
        let schema = self.schema;
        self.relations[id]
            .model
            .as_deref()
            .and_then(|label| schema.get(label))
            .ok_or_else(|| {
                DjaqError::InvalidExpression(format!(
                    "relation '{}' has no model",
                    self.relations[id].table
                ))
            })
    }

    /// Resolve a dotted path to a column fragment, joining as needed.
    fn resolve_path(&mut self, segments: &[String]) -> DjaqResult<String> {
        self.field_refs += 1;

        if let (Some(outer), [head, field]) = (&self.outer, segments) {
            if head == "outer" {
                let column = self
                    .schema
                    .resolve_field(outer.model, field)?
                    .column_name()
                    .ok_or_else(|| DjaqError::field_not_found(outer.model.label(), field.as_str()))?;
                return Ok(ColumnRef {
                    relation: outer.reference.clone(),
                    column: column.to_string(),
                }
                .to_string());
            }
        }

        let segments = self.strip_model_prefix(segments)?;
        let Some((last, prefix)) = segments.split_last() else {
            return Err(DjaqError::InvalidExpression("empty attribute path".to_string()));
        };

        let Some((owner_name, owner_path)) = prefix.split_last() else {
            return self.terminal(0, last);
        };

        let schema = self.schema;
        let owner = self.resolve_relation(owner_path)?;
        let owner_model = self.model_of(owner)?;
        let field = schema.resolve_field(owner_model, owner_name)?;
        if field.relation.is_none() {
            return self.date_part(owner, owner_model, field, last);
        }
        let joined = self.join_field(owner, owner_model, field)?;
        self.terminal(joined, last)
    }

    /// Drop a leading reference to the queried model, `Book.name`.
    fn strip_model_prefix<'s>(&self, segments: &'s [String]) -> DjaqResult<&'s [String]> {
        let [head, rest @ ..] = segments else {
            return Ok(segments);
        };
        if rest.is_empty() || self.model.get_field(head).is_some() {
            return Ok(segments);
        }
        if *head == self.model.name || *head == self.model.label() {
            return Ok(rest);
        }
        if head.starts_with(|c: char| c.is_ascii_uppercase()) {
            let other = self
                .schema
                .resolve_model(head, self.options.whitelist.as_ref())?;
            return Err(DjaqError::InvalidExpression(format!(
                "model '{}' is not the queried model '{}'",
                other.label(),
                self.model.label()
            )));
        }
        Ok(segments)
    }

    /// Relation reached by following every segment from the master.
    fn resolve_relation(&mut self, segments: &[String]) -> DjaqResult<RelationId> {
        let Some((last, prefix)) = segments.split_last() else {
            return Ok(0);
        };
        let parent = self.resolve_relation(prefix)?;
        let schema = self.schema;
        let model = self.model_of(parent)?;
        let field = schema.resolve_field(model, last)?;
        if field.relation.is_none() {
            return Err(DjaqError::field_not_found(model.label(), segments.join(".")));
        }
        self.join_field(parent, model, field)
    }

    /// Column fragment for `name` on relation `id`.
    fn terminal(&mut self, id: RelationId, name: &str) -> DjaqResult<String> {
        let schema = self.schema;
        let options = self.options;
        let whitelist = options.whitelist.as_ref();
        let model = self.model_of(id)?;
        let field = match (name, model.get_field(name), model.pk()) {
            ("pk", None, Some(pk)) => pk,
            _ => schema.resolve_field(model, name)?,
        };

        match &field.relation {
            None | Some(Relation::ForeignKey { .. }) => {
                Ok(self.relations[id].column(column_of(field)).to_string())
            }
            Some(Relation::Reverse { from, field: fk_name }) => {
                let source = schema.resolve_model(from, whitelist)?;
                let fk = schema.resolve_field(source, fk_name)?;
                let joined = self.join_field(id, model, field)?;
                Ok(self.relations[joined].column(column_of(fk)).to_string())
            }
            Some(Relation::ManyToMany { to, .. }) => {
                let target = schema.resolve_model(to, whitelist)?;
                let joined = self.join_field(id, model, field)?;
                Ok(self.relations[joined].column(target.pk_column()).to_string())
            }
        }
    }

    fn date_part(
        &self,
        owner: RelationId,
        model: &Model,
        field: &Field,
        part: &str,
    ) -> DjaqResult<String> {
        let attribute = || DjaqError::field_not_found(model.label(), format!("{}.{}", field.name, part));
        if !field.field_type.is_date_like() {
            return Err(attribute());
        }
        let column = self.relations[owner].column(column_of(field)).to_string();
        self.options
            .dialect
            .date_part(part, &column)
            .ok_or_else(attribute)
    }

    fn find_relation(&self, path: &str) -> Option<RelationId> {
        self.relations.iter().position(|r| r.path == path)
    }

    /// Alias for a new relation on `table`, needed once the table is taken
    /// here or by an enclosing query.
    fn alias_for(&self, table: &str, path: &str) -> Option<String> {
        let taken = self.relations.iter().any(|r| r.table == table)
            || self.enclosing.iter().any(|name| name == table);
        if !taken {
            return None;
        }
        let alias = path.replace(|c: char| !c.is_alphanumeric() && c != '_', "__");
        Some(match self.depth {
            0 => alias,
            depth => format!("sq{}_{}", depth, alias),
        })
    }

    fn push_relation(&mut self, relation: JoinRelation) -> RelationId {
        trace!(
            table = %relation.table,
            path = %relation.path,
            join = relation.join_type.as_sql(),
            "join relation added"
        );
        self.relations.push(relation);
        self.relations.len() - 1
    }

    /// Relation for relation-field `field` of `parent`, joined on first use.
    fn join_field(
        &mut self,
        parent: RelationId,
        parent_model: &Model,
        field: &Field,
    ) -> DjaqResult<RelationId> {
        let parent_path = &self.relations[parent].path;
        let path = if parent_path.is_empty() {
            field.name.clone()
        } else {
            format!("{}.{}", parent_path, field.name)
        };
        if let Some(id) = self.find_relation(&path) {
            return Ok(id);
        }

        let schema = self.schema;
        let options = self.options;
        let whitelist = options.whitelist.as_ref();
        let join_type = self.join_types.get(&path).copied().unwrap_or_default();

        match &field.relation {
            Some(Relation::ForeignKey { to, to_field, .. }) => {
                let target = schema.resolve_model(to, whitelist)?;
                let target_column = match to_field {
                    Some(name) => column_of(schema.resolve_field(target, name)?),
                    None => target.pk_column(),
                };
                let from = self.relations[parent].column(column_of(field));
                let alias = self.alias_for(&target.table, &path);
                let mut relation =
                    JoinRelation::new(Some(target.label()), &target.table, alias, path, join_type, None);
                relation.linkage = Some(Linkage::Forward {
                    from,
                    to: relation.column(target_column),
                });
                Ok(self.push_relation(relation))
            }
            Some(Relation::Reverse { from, field: fk_name }) => {
                let source = schema.resolve_model(from, whitelist)?;
                let fk = schema.resolve_field(source, fk_name)?;
                let key_column = match &fk.relation {
                    Some(Relation::ForeignKey {
                        to_field: Some(name),
                        ..
                    }) => column_of(schema.resolve_field(parent_model, name)?),
                    _ => parent_model.pk_column(),
                };
                let from = self.relations[parent].column(key_column);
                let alias = self.alias_for(&source.table, &path);
                let mut relation =
                    JoinRelation::new(Some(source.label()), &source.table, alias, path, join_type, None);
                relation.linkage = Some(Linkage::Reverse {
                    from,
                    to: relation.column(column_of(fk)),
                });
                Ok(self.push_relation(relation))
            }
            Some(Relation::ManyToMany {
                to,
                through,
                source_column,
                target_column,
                ..
            }) => {
                let target = schema.resolve_model(to, whitelist)?;

                let link_path = format!("{}.{}", path, through);
                let link_alias = self.alias_for(through, &link_path);
                let from = self.relations[parent].column(parent_model.pk_column());
                let mut link = JoinRelation::new(None, through, link_alias, link_path, join_type, None);
                link.linkage = Some(Linkage::Bridge {
                    from,
                    to: link.column(source_column),
                });
                let link_id = self.push_relation(link);

                let from = self.relations[link_id].column(target_column);
                let alias = self.alias_for(&target.table, &path);
                let mut relation =
                    JoinRelation::new(Some(target.label()), &target.table, alias, path, join_type, None);
                relation.linkage = Some(Linkage::Bridge {
                    from,
                    to: relation.column(target.pk_column()),
                });
                Ok(self.push_relation(relation))
            }
            None => Err(DjaqError::field_not_found(parent_model.label(), path)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::QueryDef;
    use crate::value::context;
    use pretty_assertions::assert_eq;

    fn bookshop() -> Schema {
        Schema::from_json(include_str!("../tests/fixtures/bookshop.json")).unwrap()
    }

    fn compile_with(
        options: &CompileOptions,
        model: &str,
        statement: SelectStatement,
        ctx: &Context,
    ) -> DjaqResult<Compiled> {
        compile(&bookshop(), options, model, &statement, ctx)
    }

    fn sql(model: &str, statement: SelectStatement) -> String {
        compile_with(&CompileOptions::default(), model, statement, &Context::new())
            .unwrap()
            .sql
    }

    #[test]
    fn test_single_table() {
        let compiled = compile_with(
            &CompileOptions::default(),
            "Book",
            SelectStatement::new("id, name"),
            &Context::new(),
        )
        .unwrap();
        assert_eq!(
            compiled.sql,
            r#"SELECT "books_book"."id" AS "id", "books_book"."name" AS "name" FROM "books_book""#
        );
        assert_eq!(compiled.relations, 1);
        assert_eq!(compiled.aliases(), vec!["id", "name"]);
        assert!(compiled.parameters.is_empty());
    }

    #[test]
    fn test_foreign_key_join() {
        assert_eq!(
            sql("Book", SelectStatement::new("name, publisher.name as publisher")),
            concat!(
                r#"SELECT "books_book"."name" AS "name", "books_publisher"."name" AS "publisher" "#,
                r#"FROM "books_book" LEFT JOIN "books_publisher" "#,
                r#"ON ("books_book"."publisher_id" = "books_publisher"."id")"#
            )
        );
    }

    #[test]
    fn test_many_to_many_two_joins() {
        let compiled = compile_with(
            &CompileOptions::default(),
            "Book",
            SelectStatement::new("name, authors.name"),
            &Context::new(),
        )
        .unwrap();
        assert_eq!(compiled.relations, 3);
        assert_eq!(
            compiled.sql,
            concat!(
                r#"SELECT "books_book"."name" AS "name", "books_author"."name" AS "authors_name" "#,
                r#"FROM "books_book" "#,
                r#"LEFT JOIN "books_book_authors" ON ("books_book"."id" = "books_book_authors"."book_id") "#,
                r#"LEFT JOIN "books_author" ON ("books_book_authors"."author_id" = "books_author"."id")"#
            )
        );
    }

    #[test]
    fn test_nested_path() {
        assert_eq!(
            sql("Book", SelectStatement::new("publisher.owner.name")),
            concat!(
                r#"SELECT "books_author"."name" AS "publisher_owner_name" FROM "books_book" "#,
                r#"LEFT JOIN "books_publisher" ON ("books_book"."publisher_id" = "books_publisher"."id") "#,
                r#"LEFT JOIN "books_author" ON ("books_publisher"."owner_id" = "books_author"."id")"#
            )
        );
    }

    #[test]
    fn test_relation_reused_per_path() {
        let compiled = compile_with(
            &CompileOptions::default(),
            "Book",
            SelectStatement::new("publisher.name, publisher.id").filter("publisher.name == 'x'"),
            &Context::new(),
        )
        .unwrap();
        assert_eq!(compiled.relations, 2);
    }

    #[test]
    fn test_same_table_twice_gets_alias() {
        assert_eq!(
            sql("Book", SelectStatement::new("publisher.name as p, alt_publisher.name as a")),
            concat!(
                r#"SELECT "books_publisher"."name" AS "p", "alt_publisher"."name" AS "a" "#,
                r#"FROM "books_book" "#,
                r#"LEFT JOIN "books_publisher" ON ("books_book"."publisher_id" = "books_publisher"."id") "#,
                r#"LEFT JOIN "books_publisher" AS "alt_publisher" "#,
                r#"ON ("books_book"."alt_publisher_id" = "alt_publisher"."id")"#
            )
        );
    }

    #[test]
    fn test_group_by_inferred() {
        assert_eq!(
            sql(
                "Book",
                SelectStatement::new("publisher.name, avg(price) as avg_price").filter("pages > 10")
            ),
            concat!(
                r#"SELECT "books_publisher"."name" AS "publisher_name", "#,
                r#"avg("books_book"."price") AS "avg_price" "#,
                r#"FROM "books_book" "#,
                r#"LEFT JOIN "books_publisher" ON ("books_book"."publisher_id" = "books_publisher"."id") "#,
                r#"WHERE "books_book"."pages" > 10 "#,
                r#"GROUP BY "books_publisher"."name""#
            )
        );
    }

    #[test]
    fn test_aggregate_only_has_no_group_by() {
        assert_eq!(
            sql("Book", SelectStatement::new("avg(price)")),
            r#"SELECT avg("books_book"."price") AS "avgprice" FROM "books_book""#
        );
    }

    #[test]
    fn test_builtin_inside_aggregate() {
        assert_eq!(
            sql(
                "Book",
                SelectStatement::new("name, sum(iif(rating >= 3, rating, 0)) as above")
            ),
            concat!(
                r#"SELECT "books_book"."name" AS "name", "#,
                r#"sum(CASE WHEN "books_book"."rating" >= 3 THEN "books_book"."rating" ELSE 0 END) AS "above" "#,
                r#"FROM "books_book" GROUP BY "books_book"."name""#
            )
        );
    }

    #[test]
    fn test_reverse_relation() {
        assert_eq!(
            sql("Publisher", SelectStatement::new("name, count(book) as num_books")),
            concat!(
                r#"SELECT "books_publisher"."name" AS "name", "#,
                r#"count("books_book"."publisher_id") AS "num_books" "#,
                r#"FROM "books_publisher" "#,
                r#"LEFT JOIN "books_book" ON ("books_publisher"."id" = "books_book"."publisher_id") "#,
                r#"GROUP BY "books_publisher"."name""#
            )
        );
    }

    #[test]
    fn test_one_to_one_reverse() {
        assert_eq!(
            sql("User", SelectStatement::new("username, profile.company")),
            concat!(
                r#"SELECT "auth_user"."username" AS "username", "#,
                r#""books_profile"."company" AS "profile_company" FROM "auth_user" "#,
                r#"LEFT JOIN "books_profile" ON ("auth_user"."id" = "books_profile"."user_id")"#
            )
        );
    }

    #[test]
    fn test_where_in_list_parameter() {
        let ctx = context([("ids", vec![1, 2, 3])]);
        let compiled = compile_with(
            &CompileOptions::default(),
            "Book",
            SelectStatement::new("id, name").filter("id in {ids}"),
            &ctx,
        )
        .unwrap();
        assert_eq!(
            compiled.sql,
            r#"SELECT "books_book"."id" AS "id", "books_book"."name" AS "name" FROM "books_book" WHERE "books_book"."id" IN ($1, $2, $3)"#
        );
        assert_eq!(
            compiled.parameters,
            vec![DjaqValue::Int(1), DjaqValue::Int(2), DjaqValue::Int(3)]
        );
    }

    #[test]
    fn test_select_placeholders_bind_in_order() {
        let ctx = context([("discount", 0.2)]);
        let compiled = compile_with(
            &CompileOptions::default().dialect(Dialect::Sqlite),
            "Book",
            SelectStatement::new("name, {discount} as discount, price * {discount} as discount_price"),
            &ctx,
        )
        .unwrap();
        assert_eq!(
            compiled.sql,
            concat!(
                r#"SELECT "books_book"."name" AS "name", ?1 AS "discount", "#,
                r#"("books_book"."price" * ?2) AS "discount_price" FROM "books_book""#
            )
        );
        assert_eq!(compiled.parameters, vec![DjaqValue::Float(0.2), DjaqValue::Float(0.2)]);
    }

    #[test]
    fn test_missing_parameter() {
        let err = compile_with(
            &CompileOptions::default(),
            "Book",
            SelectStatement::new("{nope} as x"),
            &Context::new(),
        )
        .unwrap_err();
        assert!(matches!(err, DjaqError::MissingParameter(name) if name == "nope"));
    }

    #[test]
    fn test_glob_and_null_comparisons() {
        assert_eq!(
            sql(
                "Book",
                SelectStatement::new("id").filter("name == 'B*' and alt_publisher == None")
            ),
            concat!(
                r#"SELECT "books_book"."id" AS "id" FROM "books_book" "#,
                r#"WHERE ("books_book"."name" LIKE 'B%' AND "books_book"."alt_publisher_id" IS NULL)"#
            )
        );
        assert_eq!(
            sql("Book", SelectStatement::new("id").filter("name != 'B*'")),
            r#"SELECT "books_book"."id" AS "id" FROM "books_book" WHERE "books_book"."name" NOT LIKE 'B%'"#
        );
    }

    #[test]
    fn test_boolean_grouping_and_not() {
        assert_eq!(
            sql(
                "Book",
                SelectStatement::new("id").filter("(id == 1 or id == 2) and not in_print")
            ),
            concat!(
                r#"SELECT "books_book"."id" AS "id" FROM "books_book" WHERE "#,
                r#"(("books_book"."id" = 1 OR "books_book"."id" = 2) AND NOT "books_book"."in_print")"#
            )
        );
    }

    #[test]
    fn test_order_limit_offset_distinct() {
        assert_eq!(
            sql(
                "Book",
                SelectStatement::new("name")
                    .order_by("-name, publisher, -id")
                    .limit(4)
                    .offset(7)
                    .distinct()
            ),
            concat!(
                r#"SELECT DISTINCT "books_book"."name" AS "name" FROM "books_book" "#,
                r#"ORDER BY "books_book"."name" DESC, "books_book"."publisher_id" ASC, "books_book"."id" DESC "#,
                r#"LIMIT 4 OFFSET 7"#
            )
        );
        assert_eq!(
            sql("Book", SelectStatement::new("name").limit(0).offset(0)),
            r#"SELECT "books_book"."name" AS "name" FROM "books_book""#
        );
    }

    #[test]
    fn test_date_parts() {
        assert_eq!(
            sql("Book", SelectStatement::new("pubdate").filter("pubdate.year < 2022")),
            concat!(
                r#"SELECT "books_book"."pubdate" AS "pubdate" FROM "books_book" "#,
                r#"WHERE date_part('year', "books_book"."pubdate") < 2022"#
            )
        );
        let err = compile_with(
            &CompileOptions::default(),
            "Book",
            SelectStatement::new("name.year"),
            &Context::new(),
        )
        .unwrap_err();
        assert!(matches!(err, DjaqError::FieldNotFound { .. }));
    }

    #[test]
    fn test_whitelist_checked_along_paths() {
        let options = CompileOptions::default().whitelist(Whitelist::new().allow("books", &["Book"]));
        let ok = compile_with(&options, "Book", SelectStatement::new("name"), &Context::new());
        assert!(ok.is_ok());
        for select in ["publisher.name", "Book.publisher.name", "authors.name"] {
            let err = compile_with(&options, "Book", SelectStatement::new(select), &Context::new())
                .unwrap_err();
            assert!(matches!(err, DjaqError::ModelNotFound(_)), "{}: {:?}", select, err);
        }
        // the bare FK column stays on Book
        assert!(compile_with(&options, "Book", SelectStatement::new("publisher"), &Context::new()).is_ok());
    }

    #[test]
    fn test_model_prefix() {
        assert_eq!(
            sql("Book", SelectStatement::new("Book.name")),
            r#"SELECT "books_book"."name" AS "book_name" FROM "books_book""#
        );
        let err = compile_with(
            &CompileOptions::default(),
            "Book",
            SelectStatement::new("Nope.name"),
            &Context::new(),
        )
        .unwrap_err();
        assert!(matches!(err, DjaqError::ModelNotFound(_)));
    }

    #[test]
    fn test_unknown_and_whitelisted_functions() {
        let err = compile_with(
            &CompileOptions::default(),
            "Book",
            SelectStatement::new("frobnicate(name)"),
            &Context::new(),
        )
        .unwrap_err();
        assert!(matches!(err, DjaqError::UnknownFunction(name) if name == "frobnicate"));

        let options =
            CompileOptions::default().functions(FunctionWhitelist::default().with("frobnicate"));
        let compiled = compile_with(&options, "Book", SelectStatement::new("frobnicate(name) as f"), &Context::new())
            .unwrap();
        assert_eq!(
            compiled.sql,
            r#"SELECT frobnicate("books_book"."name") AS "f" FROM "books_book""#
        );
    }

    #[test]
    fn test_literal_sql_gate() {
        let statement = SelectStatement::new("id").filter("id in 'SELECT id FROM books_book'");
        let err = compile_with(&CompileOptions::default(), "Book", statement.clone(), &Context::new())
            .unwrap_err();
        assert!(matches!(err, DjaqError::UntrustedSql(_)));

        let options = CompileOptions::default().trust_literal_sql(true);
        let compiled = compile_with(&options, "Book", statement, &Context::new()).unwrap();
        assert_eq!(
            compiled.sql,
            r#"SELECT "books_book"."id" AS "id" FROM "books_book" WHERE "books_book"."id" IN (SELECT id FROM books_book)"#
        );

        // any whitespace after the keyword counts
        let multiline = SelectStatement::new("id").filter("id in 'select\n\tid FROM books_book'");
        let err = compile_with(&CompileOptions::default(), "Book", multiline, &Context::new())
            .unwrap_err();
        assert!(matches!(err, DjaqError::UntrustedSql(_)));

        assert_eq!(
            sql("Book", SelectStatement::new("id").filter("name == 'selected'")),
            r#"SELECT "books_book"."id" AS "id" FROM "books_book" WHERE "books_book"."name" = 'selected'"#
        );
    }

    #[test]
    fn test_named_query_splices_its_parameters() {
        let schema = bookshop();
        let options = CompileOptions::default();
        let sub = QueryDef::new("Book", "id")
            .filter("name == {n}")
            .context(context([("n", "B")]));
        let registry = Registry::new().query("sub", sub);
        let ctx = context([("min", 10)]);
        let model = schema.resolve_model("Book", None).unwrap();
        let compiled = Compiler::new(&schema, &options, &registry, &ctx, model)
            .compile(&SelectStatement::new("name").filter("pages > {min} and id in '@sub'"))
            .unwrap();
        assert_eq!(
            compiled.sql,
            concat!(
                r#"SELECT "books_book"."name" AS "name" FROM "books_book" "#,
                r#"WHERE ("books_book"."pages" > $1 AND "books_book"."id" IN "#,
                r#"(SELECT "books_book"."id" AS "id" FROM "books_book" WHERE "books_book"."name" = $2))"#
            )
        );
        assert_eq!(compiled.parameters, vec![DjaqValue::Int(10), DjaqValue::from("B")]);
    }

    #[test]
    fn test_named_values_and_sql() {
        let schema = bookshop();
        let options = CompileOptions::default();
        let registry = Registry::new()
            .values("ids", [4, 5])
            .sql("cheap", "SELECT id FROM books_book WHERE price < {max}", context([("max", 10)]));
        let ctx = Context::new();
        let model = schema.resolve_model("Book", None).unwrap();
        let compiled = Compiler::new(&schema, &options, &registry, &ctx, model)
            .compile(&SelectStatement::new("id").filter("id in '@ids' or id in '@cheap'"))
            .unwrap();
        assert_eq!(
            compiled.sql,
            concat!(
                r#"SELECT "books_book"."id" AS "id" FROM "books_book" "#,
                r#"WHERE ("books_book"."id" IN ($1, $2) OR "books_book"."id" IN "#,
                r#"(SELECT id FROM books_book WHERE price < $3))"#
            )
        );
        assert_eq!(
            compiled.parameters,
            vec![DjaqValue::Int(4), DjaqValue::Int(5), DjaqValue::Int(10)]
        );
    }

    #[test]
    fn test_unknown_named_source() {
        let err = compile_with(
            &CompileOptions::default(),
            "Book",
            SelectStatement::new("id").filter("id in '@nope'"),
            &Context::new(),
        )
        .unwrap_err();
        assert!(matches!(err, DjaqError::SubqueryResolution(_)));
    }

    #[test]
    fn test_self_referencing_named_query_is_bounded() {
        let schema = bookshop();
        let options = CompileOptions::default();
        let registry = Registry::new().query("loop", QueryDef::new("Book", "id").filter("id in '@loop'"));
        let ctx = Context::new();
        let model = schema.resolve_model("Book", None).unwrap();
        let err = Compiler::new(&schema, &options, &registry, &ctx, model)
            .compile(&SelectStatement::new("id").filter("id in '@loop'"))
            .unwrap_err();
        assert!(matches!(err, DjaqError::SubqueryResolution(_)));
    }

    #[test]
    fn test_correlated_subquery() {
        assert_eq!(
            sql(
                "Publisher",
                SelectStatement::new(
                    "name, subquery('Book', 'count(id)', 'publisher == outer.id') as books"
                )
            ),
            concat!(
                r#"SELECT "books_publisher"."name" AS "name", "#,
                r#"(SELECT count("sq1"."id") AS "countid" FROM "books_book" AS "sq1" "#,
                r#"WHERE "sq1"."publisher_id" = "books_publisher"."id") AS "books" "#,
                r#"FROM "books_publisher""#
            )
        );
    }

    #[test]
    fn test_correlated_subquery_joining_outer_table() {
        assert_eq!(
            sql(
                "Publisher",
                SelectStatement::new(
                    "name, subquery('Book', 'count(id)', 'publisher.name == outer.name') as n"
                )
            ),
            concat!(
                r#"SELECT "books_publisher"."name" AS "name", "#,
                r#"(SELECT count("sq1"."id") AS "countid" FROM "books_book" AS "sq1" "#,
                r#"LEFT JOIN "books_publisher" AS "sq1_publisher" "#,
                r#"ON ("sq1"."publisher_id" = "sq1_publisher"."id") "#,
                r#"WHERE "sq1_publisher"."name" = "books_publisher"."name") AS "n" "#,
                r#"FROM "books_publisher""#
            )
        );
    }

    #[test]
    fn test_join_type_override() {
        let schema = bookshop();
        let options = CompileOptions::default();
        let registry = Registry::new();
        let ctx = Context::new();
        let model = schema.resolve_model("Book", None).unwrap();
        let join_types = HashMap::from([("publisher".to_string(), JoinType::Inner)]);
        let compiled = Compiler::new(&schema, &options, &registry, &ctx, model)
            .join_types(&join_types)
            .compile(&SelectStatement::new("publisher.name"))
            .unwrap();
        assert!(compiled.sql.contains(r#"INNER JOIN "books_publisher""#));
    }

    #[test]
    fn test_sqlite_dialect_functions() {
        let options = CompileOptions::default().dialect(Dialect::Sqlite);
        let ctx = context([("p", "b")]);
        let compiled = compile_with(
            &options,
            "Book",
            SelectStatement::new("id").filter("contains(name, {p})"),
            &ctx,
        )
        .unwrap();
        assert_eq!(
            compiled.sql,
            r#"SELECT "books_book"."id" AS "id" FROM "books_book" WHERE "books_book"."name" LIKE '%' || ?1 || '%'"#
        );
    }

    #[test]
    fn test_empty_list_binds_null() {
        let ctx = context([("ids", DjaqValue::List(vec![]))]);
        let compiled = compile_with(
            &CompileOptions::default(),
            "Book",
            SelectStatement::new("id").filter("id in {ids}"),
            &ctx,
        )
        .unwrap();
        assert!(compiled.sql.ends_with(r#"WHERE "books_book"."id" IN (NULL)"#));
        assert!(compiled.parameters.is_empty());
    }

    #[test]
    fn test_star_and_pk() {
        assert_eq!(
            sql("Author", SelectStatement::new("*")),
            concat!(
                r#"SELECT "books_author"."id" AS "id", "books_author"."name" AS "name", "#,
                r#""books_author"."age" AS "age" FROM "books_author""#
            )
        );
        assert_eq!(
            sql("Book", SelectStatement::new("pk").filter("publisher.pk == 1").order_by("pk")),
            concat!(
                r#"SELECT "books_book"."id" AS "pk" FROM "books_book" "#,
                r#"LEFT JOIN "books_publisher" ON ("books_book"."publisher_id" = "books_publisher"."id") "#,
                r#"WHERE "books_publisher"."id" = 1 ORDER BY "books_book"."id" ASC"#
            )
        );
    }

    #[test]
    fn test_unbalanced_columns() {
        let err = compile_with(
            &CompileOptions::default(),
            "Book",
            SelectStatement::new("count(id, name"),
            &Context::new(),
        )
        .unwrap_err();
        assert!(matches!(err, DjaqError::InvalidExpression(_)));
    }
}
