/// Size of a single ut_metadata piece, and the chunk size metadata is split into
/// while it's being fetched from peers. Fixed by BEP 9.
pub const METADATA_PIECE_SIZE: u32 = 16384;

/// Same value, named the way callers that think in "chunks" rather than "pieces" expect.
pub const CHUNK_SIZE: u32 = METADATA_PIECE_SIZE;
