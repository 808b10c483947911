//! Wire-protocol primitives shared by everything that speaks the protocol:
//! the line codec, RFC 1459 case-folding, identifier validation, and the
//! TS6 SID/UID types.

pub mod id;
pub mod message;
pub mod names;

pub use id::{ts6_id, IdError, Sid, Uid};
pub use message::{Message, MessageError, MAX_LINE_LEN};
pub use names::casefold;
