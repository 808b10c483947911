//! A TS6 IRC daemon.
//!
//! One event-loop task owns the whole network model; per-connection read and
//! write tasks, listeners, the once-per-second ticker, and the signal handler
//! all communicate with it through a single event queue. Federation with
//! peer servers uses SID/UID identifiers and timestamp-based conflict
//! resolution.

pub mod client;
pub mod config;
pub mod connection;
pub mod event;
pub mod ircd;
pub mod listener;
pub mod peer;
pub mod state;
pub mod throttle;
pub mod tls;
pub mod user;
pub mod utils;

pub use config::{Config, ConfigError};
pub use connection::{ClientId, Connection};
pub use event::{Event, NewClient};
pub use ircd::{Ircd, ServerError};
