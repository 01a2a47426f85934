pub mod assembler;
pub mod wire;

pub use assembler::{IdleTickOutcome, InitError, MetadataAssembler};
pub use wire::{expected_piece_length, UtMetadataMessage, WireError};
