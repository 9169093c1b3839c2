pub mod catalog;
pub mod error;
pub mod models;
pub mod validate;
pub mod workflow;

pub use catalog::{ToolCatalog, ToolDefinition, ToolName, ToolSpec};
pub use error::{FieldViolation, ToolError, ToolErrorKind, ToolFailure};
pub use models::*;
pub use validate::{decode, parse_iso_date, parse_iso_datetime, validate_arguments};
pub use workflow::{
    CommitError, LegSnapshot, LegStage, PaymentAcknowledgement, StaySnapshot, StayStage,
    Transition, TurnToken, WorkflowSequencer, WorkflowSnapshot,
};
