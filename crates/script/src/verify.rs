//! The boundary to the external script execution engine.

use emberd_primitives::Transaction;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScriptError {
    EvalFalse,
    BadOpcode,
    SigInvalid,
    StackInvalid,
    VerifyFailed,
    Other(&'static str),
}

impl std::fmt::Display for ScriptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScriptError::EvalFalse => write!(f, "script evaluated to false"),
            ScriptError::BadOpcode => write!(f, "disabled or unknown opcode"),
            ScriptError::SigInvalid => write!(f, "signature check failed"),
            ScriptError::StackInvalid => write!(f, "invalid stack operation"),
            ScriptError::VerifyFailed => write!(f, "verify operation failed"),
            ScriptError::Other(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for ScriptError {}

/// Pure script verification, dispatched per input during block connect.
///
/// Implementations must be thread-safe; block validation fans checks out
/// across a worker pool.
pub trait ScriptVerifier: Send + Sync {
    fn verify(
        &self,
        script_sig: &[u8],
        script_pubkey: &[u8],
        amount: i64,
        script_flags: u32,
        tx: &Transaction,
        input_index: usize,
    ) -> Result<(), ScriptError>;
}

/// Verifier that accepts every script. Test harnesses and header-only
/// contexts use it in place of a real interpreter.
pub struct AcceptAllVerifier;

impl ScriptVerifier for AcceptAllVerifier {
    fn verify(
        &self,
        _script_sig: &[u8],
        _script_pubkey: &[u8],
        _amount: i64,
        _script_flags: u32,
        _tx: &Transaction,
        _input_index: usize,
    ) -> Result<(), ScriptError> {
        Ok(())
    }
}
