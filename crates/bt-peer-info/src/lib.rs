pub mod flags;
pub mod peer_info;
pub mod pex;
pub mod registry;
pub mod tri_state;

pub use peer_info::{FoundFrom, PeerInfo};
pub use registry::known_peer_count;
pub use tri_state::TriState;
