use std::collections::HashSet;

use minnow_proto::{Sid, Uid};

use crate::connection::ClientId;

/// The user modes this server tracks. `i` and `o` federate; `C` (connection
/// notices) is meaningful only for local operators.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UserModes {
    pub invisible: bool,
    pub oper: bool,
    pub conn_notices: bool,
}

impl UserModes {
    /// Parse a umode parameter as it appears in a UID message. The leading
    /// `+` is mandatory; unknown modes are ignored; only `i` and `o` are
    /// taken from the wire.
    pub fn parse(value: &str) -> Option<Self> {
        let rest = value.strip_prefix('+')?;
        let mut modes = Self::default();
        for c in rest.chars() {
            match c {
                'i' => modes.invisible = true,
                'o' => modes.oper = true,
                _ => {}
            }
        }
        Some(modes)
    }

    pub fn format(&self) -> String {
        let mut out = String::from("+");
        if self.conn_notices {
            out.push('C');
        }
        if self.invisible {
            out.push('i');
        }
        if self.oper {
            out.push('o');
        }
        out
    }
}

/// A user anywhere on the network, local or remote.
#[derive(Debug)]
pub struct User {
    pub uid: Uid,
    /// The nick as displayed; `nicks` is keyed by its case-folded form.
    pub nick: String,
    /// Seconds since the epoch at the nick's last change.
    pub nick_ts: i64,
    pub hops: u32,
    pub username: String,
    pub hostname: String,
    pub ip: String,
    pub realname: String,
    pub modes: UserModes,
    pub away: Option<String>,
    /// Canonical names of the channels the user is in.
    pub channels: HashSet<String>,
    /// The server the user is on.
    pub server: Sid,
    /// For a remote user, the directly-linked peer we route toward.
    pub closest: Option<ClientId>,
    /// For a local user, the LocalUser record's key.
    pub local_id: Option<ClientId>,
}

impl User {
    pub fn is_local(&self) -> bool {
        self.local_id.is_some()
    }

    pub fn is_oper(&self) -> bool {
        self.modes.oper
    }

    pub fn nickmask(&self) -> String {
        format!("{}!{}@{}", self.nick, self.username, self.hostname)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn umode_parse() {
        let modes = UserModes::parse("+io").unwrap();
        assert!(modes.invisible && modes.oper);
        assert_eq!(UserModes::parse("+iwx"), Some(UserModes { invisible: true, ..Default::default() }));
        assert_eq!(UserModes::parse("io"), None);
    }

    #[test]
    fn umode_format() {
        let modes = UserModes { invisible: true, oper: true, conn_notices: false };
        assert_eq!(modes.format(), "+io");
        assert_eq!(UserModes::default().format(), "+");
    }
}
