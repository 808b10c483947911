//! Events consumed by the event-loop task. Everything that happens to the
//! server arrives here, in order, and is applied serially.

use minnow_proto::Message;

use crate::connection::{ClientId, Connection};

/// A freshly established connection, not yet registered.
#[derive(Debug)]
pub struct NewClient {
    pub conn: Connection,
    /// Set when we dialed this connection ourselves: the name of the
    /// configured server link it is for.
    pub link: Option<String>,
}

#[derive(Debug)]
pub enum Event {
    /// Register a pre-registration client and start tracking it.
    NewClient(NewClient),
    /// A parsed message arrived on a connection.
    Message(ClientId, Message),
    /// A read or write task failed; clean the client up.
    DeadClient(ClientId),
    /// Once-per-second bookkeeping: pings, link attempts, flood control.
    Tick,
    /// SIGHUP: re-read the configuration.
    Rehash,
    /// Terminate: notify every connection and stop the loop.
    Shutdown,
}
