//! Schema descriptors and the model/field resolver.
//!
//! A [`Schema`] is built once from a list of [`Model`]s (usually loaded from
//! JSON or TOML) and is immutable afterwards. Building it qualifies every
//! relation target and adds the reverse side of each foreign key and
//! many-to-many field to the target model.
//!
//! # Example
//! ```
//! use djaq::schema::{Schema, Whitelist};
//!
//! let json = r#"{
//!     "models": [{
//!         "namespace": "books",
//!         "name": "Publisher",
//!         "table": "books_publisher",
//!         "fields": [
//!             { "name": "id", "type": "auto", "primary_key": true },
//!             { "name": "name", "type": "char" }
//!         ]
//!     }]
//! }"#;
//!
//! let schema = Schema::from_json(json).unwrap();
//! let whitelist = Whitelist::new().allow("books", &["Publisher"]);
//! let model = schema.resolve_model("Publisher", Some(&whitelist)).unwrap();
//! assert_eq!(model.table, "books_publisher");
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use strsim::levenshtein;
use tracing::debug;

use crate::error::{DjaqError, DjaqResult};

/// Column data type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Auto,
    Integer,
    Float,
    Decimal,
    Char,
    #[default]
    Text,
    Boolean,
    Date,
    #[serde(alias = "datetime")]
    DateTime,
    Time,
    Json,
    Uuid,
    Geometry,
    ForeignKey,
    OneToOne,
    ManyToMany,
    Reverse,
}

impl FieldType {
    pub fn is_date_like(&self) -> bool {
        matches!(self, FieldType::Date | FieldType::DateTime)
    }
}

/// How a relation field links two models.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Relation {
    /// Column on this model pointing at `to_field` (default: pk) of `to`.
    ForeignKey {
        to: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to_field: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        related_name: Option<String>,
    },
    /// Bridge through a link table holding `source_column` (points at this
    /// model) and `target_column` (points at `to`).
    ManyToMany {
        to: String,
        through: String,
        source_column: String,
        target_column: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        related_name: Option<String>,
    },
    /// Foreign key `field` on model `from` that points back at this model.
    Reverse { from: String, field: String },
}

impl Relation {
    /// Qualified label of the model on the other side.
    pub fn target(&self) -> &str {
        match self {
            Relation::ForeignKey { to, .. } | Relation::ManyToMany { to, .. } => to,
            Relation::Reverse { from, .. } => from,
        }
    }
}

/// Field descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,
    #[serde(rename = "type", alias = "typ", default)]
    pub field_type: FieldType,
    #[serde(default)]
    pub nullable: bool,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relation: Option<Relation>,
    /// Generated by the schema for the reverse side of a relation.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub auto_created: bool,
}

impl Field {
    /// Create a plain column field.
    pub fn new(name: &str, field_type: FieldType) -> Self {
        Self {
            name: name.to_string(),
            column: None,
            field_type,
            nullable: false,
            unique: false,
            primary_key: false,
            default: None,
            relation: None,
            auto_created: false,
        }
    }

    /// Create an auto-increment primary key.
    pub fn pk(name: &str) -> Self {
        let mut field = Self::new(name, FieldType::Auto);
        field.primary_key = true;
        field.unique = true;
        field
    }

    /// Create a foreign key to `to`.
    pub fn foreign_key(name: &str, to: &str) -> Self {
        let mut field = Self::new(name, FieldType::ForeignKey);
        field.relation = Some(Relation::ForeignKey {
            to: to.to_string(),
            to_field: None,
            related_name: None,
        });
        field
    }

    /// Create a many-to-many field bridged by `through`.
    pub fn many_to_many(
        name: &str,
        to: &str,
        through: &str,
        source_column: &str,
        target_column: &str,
    ) -> Self {
        let mut field = Self::new(name, FieldType::ManyToMany);
        field.relation = Some(Relation::ManyToMany {
            to: to.to_string(),
            through: through.to_string(),
            source_column: source_column.to_string(),
            target_column: target_column.to_string(),
            related_name: None,
        });
        field
    }

    /// Builder: set the reverse accessor name for a relation field.
    pub fn related_name(mut self, name: &str) -> Self {
        match &mut self.relation {
            Some(Relation::ForeignKey { related_name, .. })
            | Some(Relation::ManyToMany { related_name, .. }) => {
                *related_name = Some(name.to_string())
            }
            _ => {}
        }
        self
    }

    /// Builder: mark nullable.
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// A field backed by a column of its own model's table.
    pub fn is_concrete(&self) -> bool {
        matches!(self.relation, None | Some(Relation::ForeignKey { .. }))
    }

    /// Column name for concrete fields.
    pub fn column_name(&self) -> Option<&str> {
        if self.is_concrete() {
            Some(self.column.as_deref().unwrap_or(&self.name))
        } else {
            None
        }
    }
}

/// Model (table) descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub namespace: String,
    pub name: String,
    pub table: String,
    #[serde(default)]
    pub fields: Vec<Field>,
}

impl Model {
    /// Create a model without fields.
    pub fn new(namespace: &str, name: &str, table: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            table: table.to_string(),
            fields: Vec::new(),
        }
    }

    /// Builder: add a field.
    pub fn field(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    /// Qualified `namespace.Name` label.
    pub fn label(&self) -> String {
        format!("{}.{}", self.namespace, self.name)
    }

    pub fn get_field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Primary key field: the flagged one, else a field named `id`.
    pub fn pk(&self) -> Option<&Field> {
        self.fields
            .iter()
            .find(|f| f.primary_key)
            .or_else(|| self.get_field("id"))
    }

    pub fn pk_column(&self) -> &str {
        self.pk().and_then(Field::column_name).unwrap_or("id")
    }

    /// Fields stored in this model's table, in declaration order.
    pub fn concrete_fields(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter().filter(|f| f.is_concrete())
    }
}

/// Allow-list of models by namespace.
///
/// An empty list admits every model of the namespace; a namespace that is
/// not listed admits nothing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Whitelist(BTreeMap<String, Vec<String>>);

impl Whitelist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: admit `models` of `namespace` (empty slice: all of them).
    pub fn allow(mut self, namespace: &str, models: &[&str]) -> Self {
        self.0.insert(
            namespace.to_string(),
            models.iter().map(|m| m.to_string()).collect(),
        );
        self
    }

    pub fn allows(&self, model: &Model) -> bool {
        match self.0.get(&model.namespace) {
            Some(names) => names.is_empty() || names.iter().any(|n| *n == model.name),
            None => false,
        }
    }
}

#[derive(Deserialize)]
struct SchemaFile {
    models: Vec<Model>,
}

/// Immutable registry of models keyed by `namespace.Name`.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    models: BTreeMap<String, Model>,
}

impl Schema {
    /// Build a schema, qualifying relation targets and adding reverse fields.
    pub fn new(models: Vec<Model>) -> DjaqResult<Self> {
        let mut schema = Schema::default();
        for model in models {
            let label = model.label();
            if schema.models.insert(label.clone(), model).is_some() {
                return Err(DjaqError::Schema(format!("duplicate model '{}'", label)));
            }
        }
        schema.qualify_relations()?;
        schema.add_reverse_fields()?;
        debug!(models = schema.models.len(), "schema loaded");
        Ok(schema)
    }

    /// Load a schema from a JSON document with a top level `models` array.
    pub fn from_json(json: &str) -> DjaqResult<Self> {
        let file: SchemaFile =
            serde_json::from_str(json).map_err(|e| DjaqError::Schema(e.to_string()))?;
        Self::new(file.models)
    }

    /// Load a schema from TOML (`[[models]]` tables).
    pub fn from_toml(text: &str) -> DjaqResult<Self> {
        let file: SchemaFile = toml::from_str(text).map_err(|e| DjaqError::Schema(e.to_string()))?;
        Self::new(file.models)
    }

    /// Load from a file; `.toml` files are TOML, anything else JSON.
    pub fn from_file(path: &Path) -> DjaqResult<Self> {
        let content = std::fs::read_to_string(path)?;
        if path.extension().map(|e| e == "toml").unwrap_or(false) {
            Self::from_toml(&content)
        } else {
            Self::from_json(&content)
        }
    }

    pub fn models(&self) -> impl Iterator<Item = &Model> {
        self.models.values()
    }

    /// Look up a model by exact label.
    pub fn get(&self, label: &str) -> Option<&Model> {
        self.models.get(label)
    }

    /// Locate a model by `Name` or `namespace.Name`, honouring `whitelist`.
    ///
    /// Unqualified names resolve to the first match in namespace order.
    pub fn resolve_model(&self, name: &str, whitelist: Option<&Whitelist>) -> DjaqResult<&Model> {
        let found = if name.contains('.') {
            self.models.get(name)
        } else {
            self.models.values().find(|m| m.name == name)
        };
        match found {
            Some(model) if whitelist.map(|w| w.allows(model)).unwrap_or(true) => Ok(model),
            _ => Err(DjaqError::ModelNotFound(name.to_string())),
        }
    }

    /// Locate a field of `model`.
    pub fn resolve_field<'m>(&self, model: &'m Model, name: &str) -> DjaqResult<&'m Field> {
        model.get_field(name).ok_or_else(|| DjaqError::FieldNotFound {
            model: model.label(),
            field: name.to_string(),
            suggestion: did_you_mean(name, model.fields.iter().map(|f| f.name.as_str())),
        })
    }

    /// Model on the other side of a relation field, honouring `whitelist`.
    pub fn related_model(&self, field: &Field, whitelist: Option<&Whitelist>) -> DjaqResult<&Model> {
        match &field.relation {
            Some(relation) => self.resolve_model(relation.target(), whitelist),
            None => Err(DjaqError::Schema(format!(
                "field '{}' is not a relation",
                field.name
            ))),
        }
    }

    /// Models visible through `whitelist`, for schema listings.
    pub fn describe(&self, whitelist: Option<&Whitelist>) -> Vec<&Model> {
        self.models
            .values()
            .filter(|m| whitelist.map(|w| w.allows(m)).unwrap_or(true))
            .collect()
    }

    /// JSON listing of the visible models keyed by label.
    pub fn describe_json(&self, whitelist: Option<&Whitelist>) -> serde_json::Value {
        let listing: BTreeMap<String, &Model> = self
            .describe(whitelist)
            .into_iter()
            .map(|m| (m.label(), m))
            .collect();
        serde_json::to_value(listing).unwrap_or(serde_json::Value::Null)
    }

    fn qualify(&self, namespace: &str, target: &str) -> DjaqResult<String> {
        if target.contains('.') {
            return match self.models.get(target) {
                Some(_) => Ok(target.to_string()),
                None => Err(DjaqError::Schema(format!("unknown relation target '{}'", target))),
            };
        }
        let local = format!("{}.{}", namespace, target);
        if self.models.contains_key(&local) {
            return Ok(local);
        }
        self.models
            .values()
            .find(|m| m.name == target)
            .map(Model::label)
            .ok_or_else(|| DjaqError::Schema(format!("unknown relation target '{}'", target)))
    }

    fn qualify_relations(&mut self) -> DjaqResult<()> {
        let labels: Vec<String> = self.models.keys().cloned().collect();
        for label in labels {
            let model = &self.models[&label];
            let mut targets = Vec::new();
            for field in &model.fields {
                let qualified = match &field.relation {
                    Some(relation) => Some(self.qualify(&model.namespace, relation.target())?),
                    None => None,
                };
                targets.push(qualified);
            }
            if let Some(model) = self.models.get_mut(&label) {
                for (field, target) in model.fields.iter_mut().zip(targets) {
                    if field.column.is_none() {
                        field.column = match field.relation {
                            None => Some(field.name.clone()),
                            Some(Relation::ForeignKey { .. }) => Some(format!("{}_id", field.name)),
                            _ => None,
                        };
                    }
                    match (&mut field.relation, target) {
                        (Some(Relation::ForeignKey { to, .. }), Some(t))
                        | (Some(Relation::ManyToMany { to, .. }), Some(t)) => *to = t,
                        (Some(Relation::Reverse { from, .. }), Some(t)) => *from = t,
                        _ => {}
                    }
                }
            }
        }
        Ok(())
    }

    fn add_reverse_fields(&mut self) -> DjaqResult<()> {
        let mut reverse: Vec<(String, Field)> = Vec::new();
        for model in self.models.values() {
            let default_name = model.name.to_lowercase();
            for field in model.fields.iter().filter(|f| !f.auto_created) {
                let generated = match &field.relation {
                    Some(Relation::ForeignKey { to, related_name, .. }) => {
                        let mut f = Field::new(
                            related_name.as_deref().unwrap_or(&default_name),
                            FieldType::Reverse,
                        );
                        f.relation = Some(Relation::Reverse {
                            from: model.label(),
                            field: field.name.clone(),
                        });
                        Some((to.clone(), f))
                    }
                    Some(Relation::ManyToMany {
                        to,
                        through,
                        source_column,
                        target_column,
                        related_name,
                    }) => {
                        let mut f = Field::new(
                            related_name.as_deref().unwrap_or(&default_name),
                            FieldType::ManyToMany,
                        );
                        f.relation = Some(Relation::ManyToMany {
                            to: model.label(),
                            through: through.clone(),
                            source_column: target_column.clone(),
                            target_column: source_column.clone(),
                            related_name: None,
                        });
                        Some((to.clone(), f))
                    }
                    _ => None,
                };
                if let Some((target, mut f)) = generated {
                    f.auto_created = true;
                    f.nullable = true;
                    reverse.push((target, f));
                }
            }
        }

        for (target, field) in reverse {
            let Some(model) = self.models.get_mut(&target) else {
                continue;
            };
            if model.get_field(&field.name).is_some() {
                return Err(DjaqError::Schema(format!(
                    "reverse accessor '{}' clashes with a field of '{}'; set related_name",
                    field.name, target
                )));
            }
            model.fields.push(field);
        }
        Ok(())
    }
}

/// Closest candidate within a small edit distance.
pub(crate) fn did_you_mean<'a>(
    input: &str,
    candidates: impl Iterator<Item = &'a str>,
) -> Option<String> {
    let threshold = match input.len() {
        0..=2 => 0,
        3..=5 => 2,
        _ => 3,
    };
    candidates
        .map(|c| (levenshtein(input, c), c))
        .filter(|(dist, _)| *dist <= threshold)
        .min_by_key(|(dist, _)| *dist)
        .map(|(_, c)| c.to_string())
}
