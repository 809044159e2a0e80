//! Metadata identities shared by the instruction model and the patch engine.
//!
//! Only the token type survives here: method targets, call operands and event constructors
//! are addressed by [`token::Token`].

/// Metadata tokens addressing methods, types and member references
pub mod token;
