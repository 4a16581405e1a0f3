//! Overload selection
//!
//! Candidates are filtered by arity and argument types in at most two
//! rounds: a loose one where integer literals match any non-bool builtin,
//! then, only while more than one candidate survives, a strict one.

use crate::types::{TypeArena, TypeId};

/// One call argument as seen by overload selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgInfo {
    pub ty: TypeId,
    /// The argument is an integer literal node
    pub literal: bool,
}

/// Why a candidate was rejected
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mismatch {
    NotCallable,
    Arity { expected: usize, got: usize },
    Argument { index: usize, expected: String, got: String },
}

impl std::fmt::Display for Mismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mismatch::NotCallable => write!(f, "not callable"),
            Mismatch::Arity { expected, got } => {
                write!(f, "expected {} argument(s), not {}", expected, got)
            }
            Mismatch::Argument {
                index,
                expected,
                got,
            } => write!(
                f,
                "argument {} expected type '{}', not '{}'",
                index + 1,
                expected,
                got
            ),
        }
    }
}

/// Result of selecting among candidate signatures
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Exactly one candidate left after `rounds` rounds
    Unique { index: usize, rounds: u8 },
    NoMatch,
    /// Survivors after both rounds
    Ambiguous(Vec<usize>),
}

/// Check one signature (a function type) against the arguments
pub fn check(
    types: &TypeArena,
    signature: TypeId,
    args: &[ArgInfo],
    strict: bool,
) -> Result<(), Mismatch> {
    let Some((_, params)) = types.signature(signature) else {
        return Err(Mismatch::NotCallable);
    };
    if params.len() != args.len() {
        return Err(Mismatch::Arity {
            expected: params.len(),
            got: args.len(),
        });
    }
    for (index, (&p, a)) in params.iter().zip(args).enumerate() {
        if !types.matches(p, a.ty, a.literal, strict) {
            return Err(Mismatch::Argument {
                index,
                expected: types.display(p),
                got: types.display(a.ty),
            });
        }
    }
    Ok(())
}

/// Pick the candidate matching `args`
pub fn select(types: &TypeArena, signatures: &[TypeId], args: &[ArgInfo]) -> Outcome {
    let loose: Vec<usize> = (0..signatures.len())
        .filter(|&i| check(types, signatures[i], args, false).is_ok())
        .collect();
    match loose.len() {
        0 => return Outcome::NoMatch,
        1 => {
            return Outcome::Unique {
                index: loose[0],
                rounds: 1,
            }
        }
        _ => {}
    }

    let strict: Vec<usize> = loose
        .iter()
        .copied()
        .filter(|&i| check(types, signatures[i], args, true).is_ok())
        .collect();
    match strict.len() {
        1 => Outcome::Unique {
            index: strict[0],
            rounds: 2,
        },
        0 => Outcome::Ambiguous(loose),
        _ => Outcome::Ambiguous(strict),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Builtin;

    fn arg(ty: TypeId, literal: bool) -> ArgInfo {
        ArgInfo { ty, literal }
    }

    #[test]
    fn test_single_loose_match_skips_strict_round() {
        let mut types = TypeArena::new();
        let int = types.builtin(Builtin::Int);
        let bool_ = types.builtin(Builtin::Bool);
        let char_ = types.builtin(Builtin::Char);
        let ptr = types.pointer(false, char_);
        let sigs = [
            types.function(None, vec![ptr]),
            types.function(None, vec![bool_]),
            types.function(None, vec![int, int]),
        ];

        let outcome = select(&types, &sigs, &[arg(int, true)]);
        assert_eq!(outcome, Outcome::NoMatch);

        let outcome = select(&types, &sigs, &[arg(ptr, false)]);
        assert_eq!(outcome, Outcome::Unique { index: 0, rounds: 1 });
    }

    #[test]
    fn test_strict_round_breaks_literal_tie() {
        let mut types = TypeArena::new();
        let int = types.builtin(Builtin::Int);
        let byte = types.builtin(Builtin::Byte);
        let bool_ = types.builtin(Builtin::Bool);
        let sigs = [
            types.function(None, vec![byte]),
            types.function(None, vec![int]),
            types.function(None, vec![bool_]),
        ];

        let outcome = select(&types, &sigs, &[arg(int, true)]);
        assert_eq!(outcome, Outcome::Unique { index: 1, rounds: 2 });

        let outcome = select(&types, &sigs, &[arg(byte, false)]);
        assert_eq!(outcome, Outcome::Unique { index: 0, rounds: 1 });
    }

    #[test]
    fn test_ambiguous_when_strict_round_cannot_decide() {
        let mut types = TypeArena::new();
        let int = types.builtin(Builtin::Int);
        let byte = types.builtin(Builtin::Byte);
        let char_ = types.builtin(Builtin::Char);
        let sigs = [
            types.function(None, vec![byte]),
            types.function(None, vec![char_]),
        ];

        let outcome = select(&types, &sigs, &[arg(int, true)]);
        assert_eq!(outcome, Outcome::Ambiguous(vec![0, 1]));
    }

    #[test]
    fn test_mismatch_reasons() {
        let mut types = TypeArena::new();
        let int = types.builtin(Builtin::Int);
        let bool_ = types.builtin(Builtin::Bool);
        let sig = types.function(Some(int), vec![int]);

        assert_eq!(
            check(&types, sig, &[], false),
            Err(Mismatch::Arity {
                expected: 1,
                got: 0
            })
        );
        let err = check(&types, sig, &[arg(bool_, false)], false).unwrap_err();
        assert_eq!(err.to_string(), "argument 1 expected type 'int', not 'bool'");
        assert_eq!(check(&types, int, &[], false), Err(Mismatch::NotCallable));
    }
}
