//! # Schema Model
//!
//! Client-side table declarations. Synced rows are stored as JSON per table;
//! each declared table is exposed to the application as a typed view.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::{CoreError, CoreResult};
use crate::{INTERNAL_TABLE_PREFIX, MAX_COLUMNS};

/// SQLite storage class of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ColumnType {
    Text,
    Integer,
    Real,
}

impl ColumnType {
    pub fn sql(&self) -> &'static str {
        match self {
            ColumnType::Text => "TEXT",
            ColumnType::Integer => "INTEGER",
            ColumnType::Real => "REAL",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
}

impl Column {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Column {
            name: name.into(),
            column_type,
        }
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Text)
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Integer)
    }

    pub fn real(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Real)
    }
}

/// A table declaration. The `id` column is implicit (TEXT primary key).
///
/// ## Example
/// ```rust
/// use tide_core::schema::{Column, Table};
///
/// let assets = Table::new("assets")
///     .column(Column::text("description"))
///     .column(Column::integer("quantity"));
/// assert!(assets.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    pub name: String,
    pub columns: Vec<Column>,
    /// Writes stay local and are never queued for upload.
    #[serde(default)]
    pub local_only: bool,
    /// Inserts are queued for upload but no local row is kept.
    #[serde(default)]
    pub insert_only: bool,
    /// View name override. Defaults to the table name.
    #[serde(default)]
    pub view_name: Option<String>,
}

impl Table {
    pub fn new(name: impl Into<String>) -> Self {
        Table {
            name: name.into(),
            columns: Vec::new(),
            local_only: false,
            insert_only: false,
            view_name: None,
        }
    }

    pub fn column(mut self, column: Column) -> Self {
        self.columns.push(column);
        self
    }

    pub fn local_only(mut self) -> Self {
        self.local_only = true;
        self
    }

    pub fn insert_only(mut self) -> Self {
        self.insert_only = true;
        self
    }

    pub fn with_view_name(mut self, view: impl Into<String>) -> Self {
        self.view_name = Some(view.into());
        self
    }

    /// Name of the application-facing view.
    pub fn view(&self) -> &str {
        self.view_name.as_deref().unwrap_or(&self.name)
    }

    /// Name of the internal JSON backing table.
    ///
    /// Local-only tables use a separate prefix so synced data never lands in them.
    pub fn data_table(&self) -> String {
        if self.local_only {
            format!("{}data_local__{}", INTERNAL_TABLE_PREFIX, self.name)
        } else {
            format!("{}data__{}", INTERNAL_TABLE_PREFIX, self.name)
        }
    }

    pub fn validate(&self) -> CoreResult<()> {
        validate_identifier(&self.name)?;
        validate_identifier(self.view())?;

        if self.name.starts_with(INTERNAL_TABLE_PREFIX) {
            return Err(CoreError::ReservedPrefix(self.name.clone()));
        }
        if self.local_only && self.insert_only {
            return Err(CoreError::ConflictingOptions(self.name.clone()));
        }
        if self.columns.len() > MAX_COLUMNS {
            return Err(CoreError::TooManyColumns {
                table: self.name.clone(),
                count: self.columns.len(),
                max: MAX_COLUMNS,
            });
        }

        let mut seen = HashSet::new();
        for column in &self.columns {
            validate_identifier(&column.name)?;
            if column.name.eq_ignore_ascii_case("id") {
                return Err(CoreError::ReservedColumn(self.name.clone()));
            }
            if !seen.insert(column.name.to_ascii_lowercase()) {
                return Err(CoreError::DuplicateName(format!("{}.{}", self.name, column.name)));
            }
        }
        Ok(())
    }
}

/// The full set of client tables.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Schema {
    pub tables: Vec<Table>,
}

impl Schema {
    pub fn new(tables: Vec<Table>) -> Self {
        Schema { tables }
    }

    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn validate(&self) -> CoreResult<()> {
        let mut seen = HashSet::new();
        for table in &self.tables {
            table.validate()?;
            if !seen.insert(table.view().to_ascii_lowercase()) {
                return Err(CoreError::DuplicateName(table.view().to_string()));
            }
        }
        Ok(())
    }
}

fn validate_identifier(name: &str) -> CoreResult<()> {
    let mut chars = name.chars();
    let valid_start = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_');
    if valid_start && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err(CoreError::InvalidName(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_table() {
        let table = Table::new("assets")
            .column(Column::text("description"))
            .column(Column::real("price"));
        assert!(table.validate().is_ok());
        assert_eq!(table.data_table(), "ps_data__assets");
        assert_eq!(table.view(), "assets");
        assert_eq!(Table::new("drafts").local_only().data_table(), "ps_data_local__drafts");
    }

    #[test]
    fn test_rejects_id_column() {
        let table = Table::new("assets").column(Column::text("id"));
        assert_eq!(table.validate(), Err(CoreError::ReservedColumn("assets".into())));
    }

    #[test]
    fn test_rejects_too_many_columns() {
        let mut table = Table::new("wide");
        for i in 0..64 {
            table = table.column(Column::integer(format!("c{}", i)));
        }
        assert!(matches!(table.validate(), Err(CoreError::TooManyColumns { count: 64, .. })));
    }

    #[test]
    fn test_rejects_bad_names() {
        assert!(Table::new("bad name").validate().is_err());
        assert!(Table::new("1st").validate().is_err());
        assert!(Table::new("ps_crud").validate().is_err());
        assert!(Table::new("t").column(Column::text("a\"b")).validate().is_err());
    }

    #[test]
    fn test_schema_duplicate_views() {
        let schema = Schema::new(vec![Table::new("a"), Table::new("b").with_view_name("A")]);
        assert!(matches!(schema.validate(), Err(CoreError::DuplicateName(_))));
    }

    #[test]
    fn test_conflicting_options() {
        let table = Table::new("logs").local_only().insert_only();
        assert!(table.validate().is_err());
    }
}
