//! The block index, UTXO state and active-chain engine.

pub mod blockindex;
pub mod chain;
pub mod coins;
pub mod engine;
pub mod flatfiles;
pub mod genesis;
pub mod interfaces;
pub mod maxblocksize;
pub mod metrics;
pub mod undo;
pub mod validation;
pub mod versionbits;

pub use engine::{ActivationResult, ConsensusEngine, EngineOptions, FlushMode};
pub use validation::{InvalidReason, RejectCode, ValidationError};
