//! The network model: users, servers, channels, and bans.
//!
//! All of these records are owned exclusively by the event-loop task.
//! Relationships are expressed by identifier (UID, SID, channel name) rather
//! than by reference, so cleanup deletes exactly one authoritative entry.

mod channel;
mod kline;
mod server;
mod user;

pub use channel::{Channel, Topic, CHANNEL_MODES};
pub use kline::{KLine, Pattern};
pub use server::Server;
pub use user::{User, UserModes};
