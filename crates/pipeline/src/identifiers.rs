//! Newtype identifiers.
//!
//! Every concept with an identity is a distinct newtype wrapping a primitive,
//! so a step's ordinal [`StepIndex`] can never be confused with a branch
//! input index, and a [`StepId`] can never be confused with a
//! [`PipelineName`] even though both are strings underneath.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Macro for String-wrapped newtypes.
// Generates: struct, new() returning Option<Self>, as_str(), Display.
// ---------------------------------------------------------------------------
macro_rules! string_id {
    (
        $(#[$attr:meta])*
        $name:ident
    ) => {
        $(#[$attr])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            /// Creates a new identifier, returning `None` if the value is empty.
            pub fn new(value: impl Into<String>) -> Option<Self> {
                let v = value.into();
                if v.is_empty() { None } else { Some(Self(v)) }
            }

            /// Returns the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Identifiers: string-backed
// ---------------------------------------------------------------------------

string_id! {
    /// Human-readable identifier of a step, used by inspectors and reports.
    ///
    /// Not unique: several steps (and every branch's copy of a step) may share
    /// an id. Steps added without an explicit id are [`StepId::anonymous`].
    StepId
}

impl StepId {
    /// The id given to steps that were not named explicitly.
    pub const ANONYMOUS: &'static str = "Anonymous";

    /// Returns the id used for unnamed steps.
    pub fn anonymous() -> Self {
        Self(Self::ANONYMOUS.to_string())
    }

    /// Creates an id, falling back to [`StepId::anonymous`] for empty input.
    pub fn or_anonymous(value: impl Into<String>) -> Self {
        Self::new(value).unwrap_or_else(Self::anonymous)
    }
}

string_id! {
    /// Identifies a pipeline registered in a [`crate::PipelineRegistry`].
    PipelineName
}

// ---------------------------------------------------------------------------
// Identifiers: ordinal
// ---------------------------------------------------------------------------

/// Ordinal position of a step within its chain.
///
/// Assigned at insertion time (the number of steps already present) and never
/// changed afterwards, even when the step's factory is later wrapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StepIndex(usize);

impl StepIndex {
    /// Creates an index from its raw position.
    pub fn new(value: usize) -> Self {
        Self(value)
    }

    /// Returns the raw position.
    pub fn as_usize(self) -> usize {
        self.0
    }
}

impl std::fmt::Display for StepIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Identifiers: UUID-backed (internally generated)
// ---------------------------------------------------------------------------

/// Identifies a single root pipeline run.
///
/// Generated fresh for every [`crate::Pipeline::run`] call and inherited by
/// every branch context created during that run, so all activity from one run
/// can be correlated in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(Uuid);

impl RunId {
    /// Generates a new random run identifier.
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying [`Uuid`].
    pub fn as_uuid(self) -> Uuid {
        self.0
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
