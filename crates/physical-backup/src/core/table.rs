//! Table descriptors and engine classification.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::identifier::file_stem;
use crate::error::{BackupError, Result};

/// Storage engine family of a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Engine {
    /// File-per-table InnoDB: moved with DISCARD/IMPORT TABLESPACE.
    Transactional,
    /// MyISAM: moved by copying data and index files under a write lock.
    FlatFile,
}

impl Engine {
    /// Classify a catalog `ENGINE` value.
    pub fn from_catalog(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "innodb" => Some(Engine::Transactional),
            "myisam" => Some(Engine::FlatFile),
            _ => None,
        }
    }

    /// Extension of the primary data file.
    pub fn data_extension(self) -> &'static str {
        match self {
            Engine::Transactional => "ibd",
            Engine::FlatFile => "MYD",
        }
    }

    /// Extensions that must travel with a table.
    pub fn required_extensions(self) -> &'static [&'static str] {
        match self {
            Engine::Transactional => &["ibd", "cfg"],
            Engine::FlatFile => &["MYD", "MYI"],
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Engine::Transactional => write!(f, "InnoDB"),
            Engine::FlatFile => write!(f, "MyISAM"),
        }
    }
}

/// A table and the engine it was classified with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub name: String,
    pub engine: Engine,
}

impl TableDescriptor {
    pub fn new(name: impl Into<String>, engine: Engine) -> Self {
        Self {
            name: name.into(),
            engine,
        }
    }

    /// On-disk file name for one of this table's extensions.
    pub fn file_name(&self, extension: &str) -> Result<String> {
        Ok(format!("{}.{}", file_stem(&self.name)?, extension))
    }

    /// File names of every required sidecar file.
    pub fn required_files(&self) -> Result<Vec<(&'static str, String)>> {
        self.engine
            .required_extensions()
            .iter()
            .map(|ext| Ok((*ext, self.file_name(ext)?)))
            .collect()
    }
}

/// The classified table list of one database, captured once per run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableSet {
    tables: Vec<TableDescriptor>,
}

impl TableSet {
    /// Build from catalog rows of `(table_name, engine)`.
    ///
    /// Any engine other than InnoDB or MyISAM is rejected: its files cannot
    /// be transported and skipping it would silently lose the table.
    pub fn classify<I>(rows: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut tables = Vec::new();
        for (name, engine_name) in rows {
            let engine = Engine::from_catalog(&engine_name).ok_or_else(|| {
                BackupError::UnsupportedEngine {
                    table: name.clone(),
                    engine: engine_name.clone(),
                }
            })?;
            tables.push(TableDescriptor::new(name, engine));
        }
        Ok(Self { tables })
    }

    /// Build from the per-engine lists of a handoff record.
    pub fn from_lists(transactional: &[String], flat_file: &[String]) -> Self {
        let tables = transactional
            .iter()
            .map(|t| TableDescriptor::new(t.clone(), Engine::Transactional))
            .chain(
                flat_file
                    .iter()
                    .map(|t| TableDescriptor::new(t.clone(), Engine::FlatFile)),
            )
            .collect();
        Self { tables }
    }

    pub fn all(&self) -> &[TableDescriptor] {
        &self.tables
    }

    pub fn of_engine(&self, engine: Engine) -> Vec<&TableDescriptor> {
        self.tables.iter().filter(|t| t.engine == engine).collect()
    }

    pub fn transactional(&self) -> Vec<&TableDescriptor> {
        self.of_engine(Engine::Transactional)
    }

    pub fn flat_file(&self) -> Vec<&TableDescriptor> {
        self.of_engine(Engine::FlatFile)
    }

    pub fn names(&self) -> Vec<&str> {
        self.tables.iter().map(|t| t.name.as_str()).collect()
    }

    pub fn names_of(&self, engine: Engine) -> Vec<String> {
        self.of_engine(engine)
            .into_iter()
            .map(|t| t.name.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}
