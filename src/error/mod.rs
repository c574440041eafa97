use thiserror::Error;

/// Application-level errors
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("KPI error: {0}")]
    Kpi(#[from] KpiError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("Bulk load failed: {message}")]
    BulkLoad { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// KPI model and editing errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum KpiError {
    #[error("Malformed KPI tree: {reason}")]
    MalformedTree { reason: MalformedTreeReason },

    #[error("KPI node not found: {node_id}")]
    NodeNotFound { node_id: u32 },

    #[error("KPI node {node_id} cannot have children")]
    NotALogicalNode { node_id: u32 },

    #[error("KPI node {node_id} is not a placeholder")]
    NotAPlaceholder { node_id: u32 },

    #[error("Incomplete KPI tree: {} node(s) awaiting completion", .node_ids.len())]
    IncompleteTree { node_ids: Vec<u32> },

    #[error("Invalid atom node {node_id}: {message}")]
    InvalidAtom { node_id: u32, message: String },

    #[error("Unknown reference: {entity} {id}")]
    UnknownReference { entity: &'static str, id: u32 },

    #[error("KPI definition '{user_identifier}' has no id")]
    MissingDefinitionId { user_identifier: String },
}

/// Structural defects detected while building a tree from flat nodes
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedTreeReason {
    #[error("no root node")]
    NoRoot,

    #[error("multiple root nodes ({0:?})")]
    MultipleRoots(Vec<u32>),

    #[error("node {node_id} references missing parent {parent_id}")]
    DanglingParent { node_id: u32, parent_id: u32 },

    #[error("duplicate node id {0}")]
    DuplicateId(u32),

    #[error("atom node {0} has children")]
    AtomWithChildren(u32),

    #[error("cycle detected through node {0}")]
    Cycle(u32),

    #[error("tree deeper than {limit} levels")]
    TooDeep { limit: usize },
}

/// Storage layer errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database connection failed: {message}")]
    Connection { message: String },

    #[error("Query failed: {message}")]
    Query { message: String },

    #[error("KPI definition not found: {definition_id}")]
    DefinitionNotFound { definition_id: u32 },

    #[error("Corrupt KPI definition {definition_id}: {message}")]
    Corrupt { definition_id: u32, message: String },

    #[error("Migration failed: {message}")]
    Migration { message: String },

    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

/// Incremental stream errors
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("Malformed batch: {0}")]
    MalformedBatch(#[from] serde_json::Error),

    #[error("Batch line exceeds {limit} bytes")]
    LineTooLong { limit: usize },

    #[error("Stream closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for application errors
pub type AppResult<T> = Result<T, AppError>;

/// Result type alias for KPI model operations
pub type KpiResult<T> = Result<T, KpiError>;

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Result type alias for stream operations
pub type StreamResult<T> = Result<T, StreamError>;

impl KpiError {
    pub(crate) fn malformed(reason: MalformedTreeReason) -> Self {
        KpiError::MalformedTree { reason }
    }
}
