//! Named sources that expressions reference as `'@name'`.

use std::collections::HashMap;

use crate::query::{DjaqQuery, QueryDef};
use crate::value::{Context, DjaqValue};

/// What a `'@name'` reference resolves to.
#[derive(Debug, Clone)]
pub enum NamedSource {
    /// Another query, compiled inline as a sub-select with its own context.
    Query(QueryDef),
    /// In-memory values, bound as a parenthesised parameter list.
    Values(Vec<DjaqValue>),
    /// Caller-supplied SQL; `{name}` tokens are bound from `context`.
    Sql { sql: String, context: Context },
}

/// Name to source directory, scoped to whoever owns it.
///
/// Registering an existing name replaces the earlier entry.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    entries: HashMap<String, NamedSource>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `source` under `name`, returning the replaced entry.
    pub fn insert(&mut self, name: impl Into<String>, source: NamedSource) -> Option<NamedSource> {
        self.entries.insert(name.into(), source)
    }

    /// Register a snapshot of `query`'s definition.
    pub fn insert_query(&mut self, name: impl Into<String>, query: &DjaqQuery) {
        self.insert(name, NamedSource::Query(query.definition().clone()));
    }

    /// Builder: register a query definition.
    pub fn query(mut self, name: &str, definition: QueryDef) -> Self {
        self.insert(name, NamedSource::Query(definition));
        self
    }

    /// Builder: register a list of values.
    pub fn values<V: Into<DjaqValue>>(mut self, name: &str, values: impl IntoIterator<Item = V>) -> Self {
        self.insert(
            name,
            NamedSource::Values(values.into_iter().map(Into::into).collect()),
        );
        self
    }

    /// Builder: register caller-supplied SQL.
    pub fn sql(mut self, name: &str, sql: &str, context: Context) -> Self {
        self.insert(
            name,
            NamedSource::Sql {
                sql: sql.to_string(),
                context,
            },
        );
        self
    }

    pub fn get(&self, name: &str) -> Option<&NamedSource> {
        self.entries.get(name)
    }

    /// Copy every entry of `other` in, replacing clashes.
    pub fn merge(&mut self, other: Registry) {
        self.entries.extend(other.entries);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_writer_wins() {
        let mut registry = Registry::new().values("ids", [1, 2]);
        let old = registry.insert("ids", NamedSource::Values(vec![DjaqValue::Int(3)]));
        assert!(matches!(old, Some(NamedSource::Values(v)) if v.len() == 2));
        match registry.get("ids") {
            Some(NamedSource::Values(v)) => assert_eq!(v, &vec![DjaqValue::Int(3)]),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_merge() {
        let mut a = Registry::new().values("x", [1]);
        a.merge(Registry::new().sql("y", "SELECT 1", Context::new()));
        assert_eq!(a.len(), 2);
        assert!(a.get("y").is_some());
        assert!(a.get("z").is_none());
    }
}
