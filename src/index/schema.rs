//! Fixed document schema shared by every index opened by the gateway.

use tantivy::TantivyError;
use tantivy::schema::{FAST, Field, INDEXED, STORED, STRING, Schema, TEXT};

/// Unique document key supplied by the caller.
pub const ID: &str = "id";
/// `Metadata::author`.
pub const AUTHOR: &str = "author";
/// `Metadata::content_type`.
pub const CONTENT_TYPE: &str = "content_type";
/// `Metadata::title`.
pub const TITLE: &str = "title";
/// `Metadata::created`; indexed and fast for range queries, never stored.
pub const CREATED: &str = "created";
/// `Metadata::data` serialized as JSON; stored only.
pub const DATA: &str = "data";
/// Extracted plain text.
pub const TEXT_BODY: &str = "text";

/// Build the fixed document schema.
pub fn build_schema() -> Schema {
    let mut schema_builder = Schema::builder();
    schema_builder.add_text_field(ID, STRING | STORED);
    schema_builder.add_text_field(AUTHOR, TEXT | STORED);
    schema_builder.add_text_field(CONTENT_TYPE, TEXT | STORED);
    schema_builder.add_text_field(TITLE, TEXT | STORED);
    schema_builder.add_date_field(CREATED, INDEXED | FAST);
    schema_builder.add_text_field(DATA, STORED);
    schema_builder.add_text_field(TEXT_BODY, TEXT | STORED);
    schema_builder.build()
}

/// Resolved field handles for the document schema.
#[derive(Debug, Clone, Copy)]
pub struct DocumentFields {
    /// See [`ID`].
    pub id: Field,
    /// See [`AUTHOR`].
    pub author: Field,
    /// See [`CONTENT_TYPE`].
    pub content_type: Field,
    /// See [`TITLE`].
    pub title: Field,
    /// See [`CREATED`].
    pub created: Field,
    /// See [`DATA`].
    pub data: Field,
    /// See [`TEXT_BODY`].
    pub text: Field,
}

impl DocumentFields {
    /// Look every field up in `schema`, failing when an existing index predates one of them.
    pub fn resolve(schema: &Schema) -> Result<Self, TantivyError> {
        Ok(Self {
            id: schema.get_field(ID)?,
            author: schema.get_field(AUTHOR)?,
            content_type: schema.get_field(CONTENT_TYPE)?,
            title: schema.get_field(TITLE)?,
            created: schema.get_field(CREATED)?,
            data: schema.get_field(DATA)?,
            text: schema.get_field(TEXT_BODY)?,
        })
    }

    /// Fields searched by free-text queries when no field is named.
    pub fn default_search_fields(&self) -> Vec<Field> {
        vec![self.id, self.author, self.content_type, self.title, self.text]
    }
}
