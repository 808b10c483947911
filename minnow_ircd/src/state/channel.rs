use std::collections::HashSet;

use minnow_proto::Uid;

/// A channel topic with its conflict-resolution timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topic {
    pub text: String,
    pub setter: String,
    pub ts: i64,
}

/// A channel. Every channel on this network carries the fixed modes `+ns`;
/// a channel with no members does not exist.
#[derive(Debug)]
pub struct Channel {
    /// Canonical (case-folded) name, beginning `#` or `&`.
    pub name: String,
    /// Seconds since the epoch at creation; lowered to the older side on
    /// SJOIN/JOIN conflicts.
    pub ts: i64,
    pub topic: Option<Topic>,
    pub members: HashSet<Uid>,
}

/// The only channel modes this server knows.
pub const CHANNEL_MODES: &str = "+ns";

impl Channel {
    pub fn new(name: String, ts: i64) -> Self {
        Self {
            name,
            ts,
            topic: None,
            members: HashSet::new(),
        }
    }
}
