//! Errors raised by the mapper algebra.
//!
//! "Cannot resolve in memory" is not an error: resolution methods return
//! `Option::None` for that, and `Some(vec![])` for a valid empty result.

use joinery_model::{EntityName, SchemaError};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MapperError {
    /// A temp-join substitution was requested for an attribute that has no
    /// entry in the substitution map. Indicates a malformed relationship.
    #[error("no temp-join attribute mapped for `{attribute}`")]
    MissingTempJoinAttribute { attribute: String },

    #[error("mapper `{mapper}` navigates through mapped attributes and cannot be reversed")]
    IrreversibleMapper { mapper: String },

    #[error("as-of attribute `{entity}.{attribute}` is neither pinned by a join nor defaulted")]
    UnresolvableTemporalAttribute {
        entity: EntityName,
        attribute: String,
    },

    #[error("cannot combine `{left}` with `{right}` into one composite mapper")]
    IncompatibleComponents { left: String, right: String },

    #[error("a composite mapper needs at least one component")]
    EmptyComposite,

    #[error("cannot attach fetched rows through mapped left attribute of `{mapper}`")]
    AttachThroughMappedLeft { mapper: String },

    #[error("operation has no result entity")]
    UnknownEntity,

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("invalid mapper config: {0}")]
    Config(#[from] serde_json::Error),

    #[error("failed to read mapper config `{path}`: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T, E = MapperError> = std::result::Result<T, E>;
