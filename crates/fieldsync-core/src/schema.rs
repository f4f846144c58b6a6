//! Replicated schema: the closed set of tables and columns that peers may
//! change through the sync protocol.
//!
//! Table and column names that reach SQL are always taken from these static
//! definitions, never from request data.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Storage kind of a replicated column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Integer,
    Real,
    Text,
    /// Stored as integer 0/1.
    Boolean,
}

impl ColumnKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Integer => "integer",
            Self::Real => "real",
            Self::Text => "text",
            Self::Boolean => "boolean",
        }
    }
}

/// A replicated, non-key column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: &'static str,
    pub kind: ColumnKind,
}

/// Shape of a table's `id` primary key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PkKind {
    Integer,
    Text,
}

/// A column referencing another table's `id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForeignKey {
    pub column: &'static str,
    pub references: Table,
}

const fn col(name: &'static str, kind: ColumnKind) -> ColumnDef {
    ColumnDef { name, kind }
}

const fn fk(column: &'static str, references: Table) -> ForeignKey {
    ForeignKey { column, references }
}

use ColumnKind::{Boolean, Integer, Real, Text};

const PROJECT_COLUMNS: &[ColumnDef] = &[
    col("name", Text),
    col("description", Text),
    col("status", Text),
    col("client_info", Text),
    col("due_date", Integer),
    col("priority", Text),
    col("created_at", Integer),
    col("updated_at", Integer),
];

const SITE_COLUMNS: &[ColumnDef] = &[
    col("project_id", Integer),
    col("name", Text),
    col("address", Text),
    col("latitude", Real),
    col("longitude", Real),
    col("notes", Text),
    col("created_at", Integer),
    col("updated_at", Integer),
];

const SURVEY_COLUMNS: &[ColumnDef] = &[
    col("site_id", Integer),
    col("template_id", Integer),
    col("title", Text),
    col("description", Text),
    col("status", Text),
    col("created_at", Integer),
    col("updated_at", Integer),
];

const SURVEY_RESPONSE_COLUMNS: &[ColumnDef] = &[
    col("survey_id", Integer),
    col("question_id", Integer),
    col("question", Text),
    col("answer", Text),
    col("response_type", Text),
    col("field_type", Text),
    col("latitude", Real),
    col("longitude", Real),
    col("created_at", Integer),
];

const SURVEY_TEMPLATE_COLUMNS: &[ColumnDef] = &[
    col("name", Text),
    col("description", Text),
    col("category", Text),
    col("is_default", Boolean),
    col("section_tags", Text),
    col("created_at", Integer),
    col("updated_at", Integer),
];

const TEMPLATE_FIELD_COLUMNS: &[ColumnDef] = &[
    col("template_id", Integer),
    col("field_type", Text),
    col("question", Text),
    col("description", Text),
    col("required", Boolean),
    col("options", Text),
    col("order_index", Integer),
    col("section", Text),
    col("section_weight", Integer),
    col("conditions", Text),
    col("photo_requirements", Text),
];

const PHOTO_COLUMNS: &[ColumnDef] = &[
    col("survey_id", Integer),
    col("site_id", Integer),
    col("question_id", Integer),
    col("cloud_url", Text),
    col("thumbnail_url", Text),
    col("upload_status", Text),
    col("retry_count", Integer),
    col("last_retry_at", Integer),
    col("latitude", Real),
    col("longitude", Real),
    col("description", Text),
    col("category", Text),
    col("section", Text),
    col("created_at", Integer),
    col("hash_algo", Text),
    col("hash_value", Text),
    col("size_bytes", Integer),
    col("file_path", Text),
    col("requirement_id", Text),
    col("fulfills_requirement", Boolean),
    col("tags", Text),
    col("corrupted", Boolean),
];

const SITE_FOREIGN_KEYS: &[ForeignKey] = &[fk("project_id", Table::Projects)];

const SURVEY_FOREIGN_KEYS: &[ForeignKey] = &[
    fk("site_id", Table::Sites),
    fk("template_id", Table::SurveyTemplate),
];

const SURVEY_RESPONSE_FOREIGN_KEYS: &[ForeignKey] = &[fk("survey_id", Table::Survey)];

const TEMPLATE_FIELD_FOREIGN_KEYS: &[ForeignKey] = &[fk("template_id", Table::SurveyTemplate)];

const PHOTO_FOREIGN_KEYS: &[ForeignKey] = &[
    fk("survey_id", Table::Survey),
    fk("site_id", Table::Sites),
    fk("question_id", Table::TemplateField),
];

/// Tables participating in replication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Projects,
    Sites,
    Survey,
    SurveyResponse,
    SurveyTemplate,
    TemplateField,
    Photo,
}

impl Table {
    pub const ALL: [Self; 7] = [
        Self::Projects,
        Self::Sites,
        Self::Survey,
        Self::SurveyResponse,
        Self::SurveyTemplate,
        Self::TemplateField,
        Self::Photo,
    ];

    /// SQL and wire name of the table.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Projects => "projects",
            Self::Sites => "sites",
            Self::Survey => "survey",
            Self::SurveyResponse => "survey_response",
            Self::SurveyTemplate => "survey_template",
            Self::TemplateField => "template_field",
            Self::Photo => "photo",
        }
    }

    pub const fn pk_kind(self) -> PkKind {
        match self {
            Self::Photo => PkKind::Text,
            _ => PkKind::Integer,
        }
    }

    pub const fn columns(self) -> &'static [ColumnDef] {
        match self {
            Self::Projects => PROJECT_COLUMNS,
            Self::Sites => SITE_COLUMNS,
            Self::Survey => SURVEY_COLUMNS,
            Self::SurveyResponse => SURVEY_RESPONSE_COLUMNS,
            Self::SurveyTemplate => SURVEY_TEMPLATE_COLUMNS,
            Self::TemplateField => TEMPLATE_FIELD_COLUMNS,
            Self::Photo => PHOTO_COLUMNS,
        }
    }

    /// Look up a replicated column. The `id` key is never a change column.
    pub fn column(self, name: &str) -> Option<&'static ColumnDef> {
        self.columns().iter().find(|column| column.name == name)
    }

    pub const fn foreign_keys(self) -> &'static [ForeignKey] {
        match self {
            Self::Projects | Self::SurveyTemplate => &[],
            Self::Sites => SITE_FOREIGN_KEYS,
            Self::Survey => SURVEY_FOREIGN_KEYS,
            Self::SurveyResponse => SURVEY_RESPONSE_FOREIGN_KEYS,
            Self::TemplateField => TEMPLATE_FIELD_FOREIGN_KEYS,
            Self::Photo => PHOTO_FOREIGN_KEYS,
        }
    }

    pub fn foreign_key(self, column: &str) -> Option<&'static ForeignKey> {
        self.foreign_keys()
            .iter()
            .find(|foreign_key| foreign_key.column == column)
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Table {
    type Err = UnknownTable;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|table| table.name() == s)
            .ok_or_else(|| UnknownTable(s.to_string()))
    }
}

/// Returned when a name is outside the replicated table set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown table `{0}`")]
pub struct UnknownTable(pub String);
