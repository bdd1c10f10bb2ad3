//! Settings loaded from `djaq.toml`.
//!
//! ```toml
//! database_url = "postgres://localhost/bookshop"
//! dialect = "postgres"
//! schema = "schema.json"
//! trust_literal_sql = false
//! functions = ["date_trunc"]
//!
//! [whitelist]
//! books = ["Book", "Publisher"]
//! auth = []
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::compiler::CompileOptions;
use crate::dialect::Dialect;
use crate::error::{DjaqError, DjaqResult};
use crate::functions::FunctionWhitelist;
use crate::schema::Whitelist;

/// Environment variable that overrides `database_url`.
pub const DATABASE_URL_ENV: &str = "DJAQ_DATABASE_URL";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub database_url: Option<String>,
    /// Defaults to whatever `database_url` implies, else postgres.
    pub dialect: Option<Dialect>,
    /// Schema descriptor, JSON or TOML.
    pub schema: Option<PathBuf>,
    pub trust_literal_sql: bool,
    pub whitelist: Option<Whitelist>,
    /// Functions allowed on top of the defaults.
    pub functions: Vec<String>,
}

impl Settings {
    pub fn from_toml(text: &str) -> DjaqResult<Self> {
        toml::from_str(text).map_err(|e| DjaqError::Config(e.to_string()))
    }

    pub fn from_file(path: &Path) -> DjaqResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// User-level config file, `<config dir>/djaq/config.toml`.
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("djaq").join("config.toml"))
    }

    /// Load settings from `path`, else `./djaq.toml`, else the user config
    /// file, else defaults. `DJAQ_DATABASE_URL` is applied last.
    ///
    /// An explicit `path` that cannot be read is an error.
    pub fn load(path: Option<&Path>) -> DjaqResult<Self> {
        let settings = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let candidates = [Some(PathBuf::from("djaq.toml")), Self::user_config_path()];
                match candidates.into_iter().flatten().find(|p| p.exists()) {
                    Some(found) => {
                        debug!(path = %found.display(), "loading settings");
                        Self::from_file(&found)?
                    }
                    None => Self::default(),
                }
            }
        };
        Ok(settings.override_database_url(std::env::var(DATABASE_URL_ENV).ok()))
    }

    /// Replace `database_url` when `url` is set and non-empty.
    pub fn override_database_url(mut self, url: Option<String>) -> Self {
        if let Some(url) = url.filter(|u| !u.is_empty()) {
            self.database_url = Some(url);
        }
        self
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
            .or_else(|| self.database_url.as_deref().and_then(Dialect::from_url))
            .unwrap_or_default()
    }

    pub fn compile_options(&self) -> CompileOptions {
        let mut functions = FunctionWhitelist::default();
        functions.extend(&self.functions);
        CompileOptions {
            dialect: self.dialect(),
            whitelist: self.whitelist.clone(),
            functions,
            trust_literal_sql: self.trust_literal_sql,
        }
    }
}
