//! Error handling for Ember

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Compiler error
///
/// Every variant is a user-facing diagnostic. The location lives on the
/// [`Diagnostic`](crate::utils::Diagnostic) that carries the error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    // ==================== Resolution Errors ====================
    #[error("undeclared identifier '{name}'")]
    UndeclaredIdentifier { name: String },

    #[error("duplicate definition of {name}")]
    DuplicateDefinition { name: String },

    #[error("redefinition of {name} shadows builtin")]
    ShadowsBuiltin { name: String },

    #[error("identifier '{name}' cannot reference itself in its own declaration")]
    SelfReference { name: String },

    #[error("identifier '{name}' cannot be accessed without an explicit receiver")]
    NeedsReceiver { name: String },

    #[error("attempt to access unexported identifier '{name}'")]
    Unexported { name: String },

    #[error("unknown module '{name}' in import list")]
    UnknownImport { name: String },

    // ==================== Context Errors ====================
    #[error("expression is not a type")]
    NotAType,

    #[error("expected expression, not type")]
    TypeInExpression,

    #[error("cannot use void value in expression")]
    VoidValue,

    #[error("expression must be addressable")]
    NotAddressable,

    #[error("left-hand side of assignment must be addressable")]
    AssignNotAddressable,

    #[error("left-hand side of assignment must be variable")]
    AssignNotVariable,

    #[error("left-hand side of assignment cannot be constant")]
    AssignConstant,

    // ==================== Type Errors ====================
    #[error("types '{expected}' and '{got}' in {context} are not compatible")]
    TypeMismatch {
        expected: String,
        got: String,
        context: String,
    },

    #[error("function was declared to return type '{expected}', not '{got}'")]
    ReturnMismatch { expected: String, got: String },

    #[error("function is supposed to return a value")]
    MissingReturnValue,

    #[error("{what} should not return a value")]
    UnexpectedReturnValue { what: String },

    #[error("invalid types '{left}' and '{right}' in {context} expression")]
    InvalidOperands {
        left: String,
        right: String,
        context: String,
    },

    #[error("type is recursive")]
    RecursiveType,

    #[error("struct must have a constructor")]
    MissingConstructor,

    #[error("invalid signature for magic method '{method}': {reason}")]
    MalformedMagic { method: String, reason: String },

    #[error("cannot call non-callable type '{ty}'")]
    NotCallable { ty: String },

    #[error("{what} expected {expected} argument(s), not {got}")]
    ArgCountMismatch {
        what: String,
        expected: usize,
        got: usize,
    },

    #[error("{what} expected argument of type '{expected}', not '{got}'")]
    ArgTypeMismatch {
        what: String,
        expected: String,
        got: String,
    },

    #[error("cannot call mutating method '{method}' on an immutable value")]
    ImmutableReceiver { method: String },

    #[error("ambiguous occurrence of '{name}'")]
    AmbiguousOverload { name: String },

    #[error("no overload of '{name}' available for the given arguments")]
    NoMatchingOverload { name: String },

    #[error("'{ty}' is not a generic struct")]
    NotGeneric { ty: String },

    #[error("'{ty}' expects {expected} type argument(s), not {got}")]
    GenericArity {
        ty: String,
        expected: usize,
        got: usize,
    },

    #[error("only pointers and structs with [] or &[] can be indexed, not '{ty}'")]
    NotIndexable { ty: String },

    #[error("only integral types can be indices, not '{ty}'")]
    InvalidIndex { ty: String },

    #[error("'{ty}' is not a struct")]
    NotAStruct { ty: String },

    #[error("expected pointer type, got '{ty}'")]
    NotAPointer { ty: String },

    #[error("method '{name}' can only be called")]
    MethodValue { name: String },

    #[error("undefined attribute '{name}'")]
    UndefinedAttribute { name: String },

    #[error("'{ty}' cannot be used as a condition")]
    InvalidCondition { ty: String },

    #[error("entry function '{name}' must take no arguments and return nothing or int")]
    InvalidEntrySignature { name: String },
}

impl Error {
    /// Stable diagnostic code, used by the structured report
    pub fn code(&self) -> &'static str {
        match self {
            Self::UndeclaredIdentifier { .. } => "E0001",
            Self::DuplicateDefinition { .. } => "E0002",
            Self::ShadowsBuiltin { .. } => "E0003",
            Self::SelfReference { .. } => "E0004",
            Self::NeedsReceiver { .. } => "E0005",
            Self::Unexported { .. } => "E0006",
            Self::UnknownImport { .. } => "E0007",
            Self::NotAType => "E0010",
            Self::TypeInExpression => "E0011",
            Self::VoidValue => "E0012",
            Self::NotAddressable => "E0013",
            Self::AssignNotAddressable => "E0014",
            Self::AssignNotVariable => "E0015",
            Self::AssignConstant => "E0016",
            Self::TypeMismatch { .. } => "E0020",
            Self::ReturnMismatch { .. } => "E0021",
            Self::MissingReturnValue => "E0022",
            Self::UnexpectedReturnValue { .. } => "E0023",
            Self::InvalidOperands { .. } => "E0024",
            Self::RecursiveType => "E0025",
            Self::MissingConstructor => "E0026",
            Self::MalformedMagic { .. } => "E0027",
            Self::NotCallable { .. } => "E0028",
            Self::ArgCountMismatch { .. } => "E0029",
            Self::ArgTypeMismatch { .. } => "E0030",
            Self::ImmutableReceiver { .. } => "E0031",
            Self::AmbiguousOverload { .. } => "E0032",
            Self::NoMatchingOverload { .. } => "E0033",
            Self::NotGeneric { .. } => "E0034",
            Self::GenericArity { .. } => "E0035",
            Self::NotIndexable { .. } => "E0036",
            Self::InvalidIndex { .. } => "E0037",
            Self::NotAStruct { .. } => "E0038",
            Self::NotAPointer { .. } => "E0039",
            Self::UndefinedAttribute { .. } => "E0040",
            Self::InvalidCondition { .. } => "E0041",
            Self::InvalidEntrySignature { .. } => "E0042",
            Self::MethodValue { .. } => "E0043",
        }
    }
}

/// Abort on a broken compiler invariant.
///
/// These are compiler bugs, not user errors: the process stops immediately
/// with the offending context in the message.
#[macro_export]
macro_rules! ice {
    ($($arg:tt)*) => {
        panic!("internal compiler error: {}", format_args!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_render_fields() {
        let err = Error::ArgCountMismatch {
            what: "constructor".to_string(),
            expected: 2,
            got: 1,
        };
        assert_eq!(err.to_string(), "constructor expected 2 argument(s), not 1");
        assert_eq!(err.code(), "E0029");
    }

    #[test]
    #[should_panic(expected = "internal compiler error: missing child 3")]
    fn test_ice_panics_with_context() {
        ice!("missing child {}", 3);
    }
}
