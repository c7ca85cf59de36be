use thiserror::Error;

/// Result type alias using GraphError
pub type Result<T> = std::result::Result<T, GraphError>;

// ========== Error Facility ==========

/// Canonical error kind taxonomy
///
/// Each kind maps to a stable error code that can be used for programmatic
/// error handling, testing, and log assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExErrorKind {
    // Schema
    NotFound,
    InvalidSchema,
    AlreadyInstalled,
    NotInstalled,

    // Validation
    InvalidInput,
    MissingField,
    InvalidRelationship,
    DuplicateLink,
    Faulted,

    // Consistency
    IdentityConflict,
    ChangeConflict,
    InvariantViolation,

    // Scheduling
    IllegalState,
    DependencyFailed,
    OperationFailed,

    // Integration/IO
    Persistence,
    Serialization,
    Config,

    // Internal
    Internal,
}

impl ExErrorKind {
    /// Get the stable error code for this kind
    pub fn code(&self) -> &'static str {
        match self {
            ExErrorKind::NotFound => "ERR_NOT_FOUND",
            ExErrorKind::InvalidSchema => "ERR_INVALID_SCHEMA",
            ExErrorKind::AlreadyInstalled => "ERR_ALREADY_INSTALLED",
            ExErrorKind::NotInstalled => "ERR_NOT_INSTALLED",
            ExErrorKind::InvalidInput => "ERR_INVALID_INPUT",
            ExErrorKind::MissingField => "ERR_MISSING_FIELD",
            ExErrorKind::InvalidRelationship => "ERR_INVALID_RELATIONSHIP",
            ExErrorKind::DuplicateLink => "ERR_DUPLICATE_LINK",
            ExErrorKind::Faulted => "ERR_FAULTED",
            ExErrorKind::IdentityConflict => "ERR_IDENTITY_CONFLICT",
            ExErrorKind::ChangeConflict => "ERR_CHANGE_CONFLICT",
            ExErrorKind::InvariantViolation => "ERR_INVARIANT_VIOLATION",
            ExErrorKind::IllegalState => "ERR_ILLEGAL_STATE",
            ExErrorKind::DependencyFailed => "ERR_DEPENDENCY_FAILED",
            ExErrorKind::OperationFailed => "ERR_OPERATION_FAILED",
            ExErrorKind::Persistence => "ERR_PERSISTENCE",
            ExErrorKind::Serialization => "ERR_SERIALIZATION",
            ExErrorKind::Config => "ERR_CONFIG",
            ExErrorKind::Internal => "ERR_INTERNAL",
        }
    }
}

/// Canonical structured error type
///
/// Carries a stable kind plus optional context for log events and external
/// reporting. Built from a [`GraphError`] via `From`.
#[derive(Debug, Clone)]
pub struct ExError {
    kind: ExErrorKind,
    op: Option<String>,
    entity_id: Option<String>,
    field: Option<String>,
    message: String,
}

impl ExError {
    /// Create a new error with the specified kind
    pub fn new(kind: ExErrorKind) -> Self {
        Self {
            kind,
            op: None,
            entity_id: None,
            field: None,
            message: String::new(),
        }
    }

    /// Add operation context
    pub fn with_op(mut self, op: impl Into<String>) -> Self {
        self.op = Some(op.into());
        self
    }

    /// Add entity ID context
    pub fn with_entity_id(mut self, id: impl Into<String>) -> Self {
        self.entity_id = Some(id.into());
        self
    }

    /// Add field context
    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    /// Add custom message
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Get the error kind
    pub fn kind(&self) -> ExErrorKind {
        self.kind
    }

    /// Get the stable error code
    pub fn code(&self) -> &'static str {
        self.kind.code()
    }

    pub fn op(&self) -> Option<&str> {
        self.op.as_deref()
    }

    pub fn entity_id(&self) -> Option<&str> {
        self.entity_id.as_deref()
    }

    pub fn field(&self) -> Option<&str> {
        self.field.as_deref()
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl std::fmt::Display for ExError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self.code())?;
        if let Some(op) = &self.op {
            write!(f, " in operation '{}'", op)?;
        }
        if !self.message.is_empty() {
            write!(f, ": {}", self.message)?;
        }
        if let Some(entity_id) = &self.entity_id {
            write!(f, " (entity_id: {})", entity_id)?;
        }
        if let Some(field) = &self.field {
            write!(f, " (field: {})", field)?;
        }
        Ok(())
    }
}

impl std::error::Error for ExError {}

// ========== End Error Facility ==========

/// Failure classes
///
/// Validation errors are recoverable and surfaced to the caller. Consistency
/// violations indicate a bug in the core or a collaborator and are not
/// recoverable by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Validation,
    Consistency,
    Operation,
    External,
}

/// Error taxonomy for graph operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    // ===== Schema Errors =====
    #[error("Collection not found: {collection}")]
    CollectionNotFound { collection: String },

    #[error("Mapping not found: {collection}.{mapping}")]
    MappingNotFound { collection: String, mapping: String },

    #[error("Field {field} is not declared on mapping {mapping}")]
    FieldNotFound { mapping: String, field: String },

    /// An install phase was entered a second time
    #[error("Mapping {mapping} has already completed install phase '{phase}'")]
    MappingAlreadyInstalled { mapping: String, phase: String },

    #[error("Mapping {mapping} cannot construct instances until fully installed")]
    MappingNotInstalled { mapping: String },

    #[error("Invalid schema for {mapping}: {reason}")]
    InvalidSchema { mapping: String, reason: String },

    // ===== Validation Errors =====
    /// A required field was absent (change registration, identity)
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    /// Wrong cardinality or shape for a relationship assignment
    #[error("Invalid value for relationship {field}: {reason}")]
    InvalidRelationshipValue { field: String, reason: String },

    #[error("Relationship {field} expects instances of {expected}, got {actual}")]
    WrongTargetMapping {
        field: String,
        expected: String,
        actual: String,
    },

    #[error("Relationship {field} already contains {local_id}")]
    DuplicateRelated { field: String, local_id: String },

    #[error("Splice on {field} out of bounds: index {index}, remove {remove_count}, length {len}")]
    SpliceOutOfBounds {
        field: String,
        index: usize,
        remove_count: usize,
        len: usize,
    },

    /// The related value has not been resolved yet
    #[error("Relationship {field} on {local_id} is a fault; resolve it first")]
    RelationshipFaulted { field: String, local_id: String },

    #[error("Instance not resident: {local_id}")]
    InstanceNotFound { local_id: String },

    #[error("Document not found in store: {local_id}")]
    DocumentNotFound { local_id: String },

    #[error("Invalid input: {reason}")]
    InvalidInput { reason: String },

    // ===== Consistency Violations =====
    /// Two distinct instances claimed the same cache slot
    #[error("Identity conflict on {slot}: already held by a different instance")]
    IdentityConflict { slot: String },

    /// A replayed change disagreed with the state it was applied to
    #[error("Change conflict on {local_id}.{field}: expected {expected}, found {actual}")]
    ChangeConflict {
        local_id: String,
        field: String,
        expected: String,
        actual: String,
    },

    #[error("Relationship {field} on {local_id} is out of sync: {reason}")]
    RelationshipDesync {
        local_id: String,
        field: String,
        reason: String,
    },

    // ===== Scheduling Errors =====
    #[error("Operation {operation} has already started")]
    OperationAlreadyStarted { operation: String },

    #[error("Operation {operation} did not run: dependency {dependency} failed or was cancelled")]
    DependencyFailed {
        operation: String,
        dependency: String,
    },

    #[error("Operation {operation} failed with {} error(s)", causes.len())]
    OperationFailed {
        operation: String,
        causes: Vec<GraphError>,
    },

    // ===== External Errors =====
    #[error("Store error: {message}")]
    Store { message: String },

    #[error("Serialization error: {message}")]
    Serialization { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl GraphError {
    /// Classify this error according to the failure taxonomy
    pub fn class(&self) -> ErrorClass {
        match self {
            GraphError::IdentityConflict { .. }
            | GraphError::ChangeConflict { .. }
            | GraphError::RelationshipDesync { .. }
            | GraphError::Internal { .. } => ErrorClass::Consistency,

            GraphError::OperationAlreadyStarted { .. }
            | GraphError::DependencyFailed { .. }
            | GraphError::OperationFailed { .. } => ErrorClass::Operation,

            GraphError::Store { .. }
            | GraphError::Serialization { .. }
            | GraphError::Config { .. } => ErrorClass::External,

            _ => ErrorClass::Validation,
        }
    }

    /// True for errors that indicate the graph or a collaborator is corrupt
    pub fn is_consistency_violation(&self) -> bool {
        self.class() == ErrorClass::Consistency
    }

    /// Convenience constructor for store adapters
    pub fn store(message: impl Into<String>) -> Self {
        GraphError::Store {
            message: message.into(),
        }
    }
}

impl From<GraphError> for ExError {
    fn from(err: GraphError) -> Self {
        let message = err.to_string();
        let ex = match &err {
            GraphError::CollectionNotFound { collection } => {
                ExError::new(ExErrorKind::NotFound).with_entity_id(collection)
            }
            GraphError::MappingNotFound { mapping, .. } => {
                ExError::new(ExErrorKind::NotFound).with_entity_id(mapping)
            }
            GraphError::FieldNotFound { mapping, field } => ExError::new(ExErrorKind::NotFound)
                .with_entity_id(mapping)
                .with_field(field),
            GraphError::MappingAlreadyInstalled { mapping, .. } => {
                ExError::new(ExErrorKind::AlreadyInstalled).with_entity_id(mapping)
            }
            GraphError::MappingNotInstalled { mapping } => {
                ExError::new(ExErrorKind::NotInstalled).with_entity_id(mapping)
            }
            GraphError::InvalidSchema { mapping, .. } => {
                ExError::new(ExErrorKind::InvalidSchema).with_entity_id(mapping)
            }
            GraphError::MissingField { field } => {
                ExError::new(ExErrorKind::MissingField).with_field(field)
            }
            GraphError::InvalidRelationshipValue { field, .. }
            | GraphError::WrongTargetMapping { field, .. }
            | GraphError::SpliceOutOfBounds { field, .. } => {
                ExError::new(ExErrorKind::InvalidRelationship).with_field(field)
            }
            GraphError::DuplicateRelated { field, local_id } => {
                ExError::new(ExErrorKind::DuplicateLink)
                    .with_entity_id(local_id)
                    .with_field(field)
            }
            GraphError::RelationshipFaulted { field, local_id } => {
                ExError::new(ExErrorKind::Faulted)
                    .with_entity_id(local_id)
                    .with_field(field)
            }
            GraphError::InstanceNotFound { local_id }
            | GraphError::DocumentNotFound { local_id } => {
                ExError::new(ExErrorKind::NotFound).with_entity_id(local_id)
            }
            GraphError::InvalidInput { .. } => ExError::new(ExErrorKind::InvalidInput),
            GraphError::IdentityConflict { slot } => {
                ExError::new(ExErrorKind::IdentityConflict).with_entity_id(slot)
            }
            GraphError::ChangeConflict {
                local_id, field, ..
            } => ExError::new(ExErrorKind::ChangeConflict)
                .with_entity_id(local_id)
                .with_field(field),
            GraphError::RelationshipDesync {
                local_id, field, ..
            } => ExError::new(ExErrorKind::InvariantViolation)
                .with_entity_id(local_id)
                .with_field(field),
            GraphError::OperationAlreadyStarted { operation } => {
                ExError::new(ExErrorKind::IllegalState).with_op(operation)
            }
            GraphError::DependencyFailed { operation, .. } => {
                ExError::new(ExErrorKind::DependencyFailed).with_op(operation)
            }
            GraphError::OperationFailed { operation, .. } => {
                ExError::new(ExErrorKind::OperationFailed).with_op(operation)
            }
            GraphError::Store { .. } => ExError::new(ExErrorKind::Persistence),
            GraphError::Serialization { .. } => ExError::new(ExErrorKind::Serialization),
            GraphError::Config { .. } => ExError::new(ExErrorKind::Config),
            GraphError::Internal { .. } => ExError::new(ExErrorKind::Internal),
        };
        ex.with_message(message)
    }
}

impl From<serde_json::Error> for GraphError {
    fn from(err: serde_json::Error) -> Self {
        GraphError::Serialization {
            message: err.to_string(),
        }
    }
}
