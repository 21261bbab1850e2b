//! Identifier, relation and metadata rows of a resource.
//!
//! The three tables together hold every RDF statement about a resource.
//! The functions here read and write them for a single resource id and
//! work on any connection, including a pinned [`Snapshot`](crate::db::Snapshot).

use crate::error::CoreResult;
use crate::types::ResourceId;
use rusqlite::{params, Connection};

/// A literal metadata triple (the subject is the owning resource).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Triple {
    /// Predicate.
    pub property: String,
    /// Datatype of the value (e.g. `xsd:string`).
    pub kind: String,
    /// Language tag, empty if none.
    pub lang: String,
    /// Lexical value.
    pub value: String,
}

impl Triple {
    /// Creates a triple without language tag.
    pub fn new(property: impl Into<String>, kind: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            kind: kind.into(),
            lang: String::new(),
            value: value.into(),
        }
    }

    /// Sets the language tag.
    #[must_use]
    pub fn with_lang(mut self, lang: impl Into<String>) -> Self {
        self.lang = lang.into();
        self
    }
}

/// A stored metadata row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataRow {
    /// Internal row id.
    pub mid: i64,
    /// Owning resource.
    pub id: ResourceId,
    /// The statement.
    pub triple: Triple,
}

/// A stored relation row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationRow {
    /// Internal row id.
    pub mid: i64,
    /// Source resource.
    pub id: ResourceId,
    /// Target resource.
    pub target: ResourceId,
    /// Predicate.
    pub property: String,
}

/// A stored identifier row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentifierRow {
    /// The identifier (globally unique).
    pub identifier: String,
    /// Owning resource.
    pub id: ResourceId,
}

/// Every row attached to one resource.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceRows {
    /// Identifier rows.
    pub identifiers: Vec<IdentifierRow>,
    /// Outgoing relation rows.
    pub relations: Vec<RelationRow>,
    /// Metadata rows.
    pub metadata: Vec<MetadataRow>,
}

impl ResourceRows {
    /// Reads all rows of `id`.
    ///
    /// # Errors
    ///
    /// Returns an error if a query fails.
    pub fn load(conn: &Connection, id: ResourceId) -> CoreResult<Self> {
        Ok(Self {
            identifiers: identifiers(conn, id)?,
            relations: relations(conn, id)?,
            metadata: metadata(conn, id)?,
        })
    }

    /// Re-inserts the rows verbatim, internal row ids included.
    ///
    /// An identifier that has meanwhile been attached to another resource
    /// stays with that resource, and relations whose target no longer
    /// exists are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if an insert fails.
    pub fn insert(&self, conn: &Connection) -> CoreResult<()> {
        let mut ids =
            conn.prepare_cached("INSERT OR IGNORE INTO identifiers (ids, id) VALUES (?1, ?2)")?;
        for row in &self.identifiers {
            ids.execute(params![row.identifier, row.id])?;
        }
        let mut rels = conn.prepare_cached(
            "INSERT INTO relations (mid, id, target_id, property)
             SELECT ?1, ?2, ?3, ?4 WHERE EXISTS (SELECT 1 FROM resources WHERE id = ?3)",
        )?;
        for row in &self.relations {
            rels.execute(params![row.mid, row.id, row.target, row.property])?;
        }
        let mut meta = conn.prepare_cached(
            "INSERT INTO metadata (mid, id, property, type, lang, value)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?;
        for row in &self.metadata {
            let t = &row.triple;
            meta.execute(params![row.mid, row.id, t.property, t.kind, t.lang, t.value])?;
        }
        Ok(())
    }

    /// Returns the value of the first metadata triple with `property`.
    #[must_use]
    pub fn value_of(&self, property: &str) -> Option<&str> {
        self.metadata
            .iter()
            .find(|row| row.triple.property == property)
            .map(|row| row.triple.value.as_str())
    }
}

/// Deletes every identifier, outgoing relation and metadata row of `id`.
///
/// # Errors
///
/// Returns an error if a delete fails.
pub fn delete_all(conn: &Connection, id: ResourceId) -> CoreResult<()> {
    conn.execute("DELETE FROM identifiers WHERE id = ?1", [id])?;
    conn.execute("DELETE FROM relations WHERE id = ?1", [id])?;
    conn.execute("DELETE FROM metadata WHERE id = ?1", [id])?;
    Ok(())
}

/// Reads the identifier rows of `id`.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn identifiers(conn: &Connection, id: ResourceId) -> CoreResult<Vec<IdentifierRow>> {
    let mut stmt = conn.prepare_cached("SELECT ids, id FROM identifiers WHERE id = ?1 ORDER BY ids")?;
    let rows = stmt.query_map([id], |row| {
        Ok(IdentifierRow {
            identifier: row.get(0)?,
            id: row.get(1)?,
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Reads the outgoing relation rows of `id`.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn relations(conn: &Connection, id: ResourceId) -> CoreResult<Vec<RelationRow>> {
    let mut stmt = conn.prepare_cached(
        "SELECT mid, id, target_id, property FROM relations WHERE id = ?1 ORDER BY mid",
    )?;
    let rows = stmt.query_map([id], |row| {
        Ok(RelationRow {
            mid: row.get(0)?,
            id: row.get(1)?,
            target: row.get(2)?,
            property: row.get(3)?,
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Reads the metadata rows of `id`.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn metadata(conn: &Connection, id: ResourceId) -> CoreResult<Vec<MetadataRow>> {
    let mut stmt = conn.prepare_cached(
        "SELECT mid, id, property, type, lang, value FROM metadata WHERE id = ?1 ORDER BY mid",
    )?;
    let rows = stmt.query_map([id], |row| {
        Ok(MetadataRow {
            mid: row.get(0)?,
            id: row.get(1)?,
            triple: Triple {
                property: row.get(2)?,
                kind: row.get(3)?,
                lang: row.get(4)?,
                value: row.get(5)?,
            },
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}
