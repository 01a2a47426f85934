/// A boolean that additionally carries "we don't know yet", distinct from both
/// `Some(false)` being used for "known false" and the absence of information.
/// Plain `Option<bool>` expresses this already; this alias exists so call sites read
/// as domain vocabulary instead of raw optionals.
pub type TriState = Option<bool>;

pub const UNKNOWN: TriState = None;
