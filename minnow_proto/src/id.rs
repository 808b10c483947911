//! TS6 identifiers.
//!
//! A SID is three characters naming a server; a UID is nine characters
//! naming a user, and its first three characters are the SID of the server
//! the user is on. Both are globally unique across the live network.

use arrayvec::ArrayString;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("invalid SID: {0:?}")]
    InvalidSid(String),
    #[error("invalid UID: {0:?}")]
    InvalidUid(String),
}

/// The character set used for the locally-assigned portion of a UID.
const TS6_ALPHABET: &[u8; 36] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

fn is_id_char(c: char) -> bool {
    c.is_ascii_uppercase() || c.is_ascii_digit()
}

/// A 3-character server identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Sid(ArrayString<3>);

impl Sid {
    pub fn new(value: &str) -> Result<Self, IdError> {
        if value.len() != 3 || !value.chars().all(is_id_char) {
            return Err(IdError::InvalidSid(value.to_string()));
        }
        Ok(Self(ArrayString::from(value).expect("length checked")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A 9-character user identifier; the first three characters are the SID of
/// the originating server.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Uid(ArrayString<9>);

impl Uid {
    pub fn new(value: &str) -> Result<Self, IdError> {
        if value.len() != 9 || !value.chars().all(is_id_char) {
            return Err(IdError::InvalidUid(value.to_string()));
        }
        Ok(Self(ArrayString::from(value).expect("length checked")))
    }

    /// Mint a UID for a locally-connected user from the monotonic client
    /// counter.
    pub fn mint(sid: Sid, counter: u64) -> Self {
        let mut value = ArrayString::<9>::new();
        value.push_str(sid.as_str());
        value.push_str(&ts6_id(counter));
        Self(value)
    }

    pub fn sid(&self) -> Sid {
        Sid(ArrayString::from(&self.0[..3]).expect("UID starts with a SID"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Encode a counter as the 6-character local part of a UID: `AAAAAA`,
/// `AAAAAB`, ... with the rightmost position changing fastest.
pub fn ts6_id(counter: u64) -> ArrayString<6> {
    let mut buf = [b'A'; 6];
    let mut n = counter;
    for slot in buf.iter_mut().rev() {
        *slot = TS6_ALPHABET[(n % 36) as usize];
        n /= 36;
    }
    let s = std::str::from_utf8(&buf).expect("alphabet is ASCII");
    ArrayString::from(s).expect("fixed length")
}

macro_rules! impl_id_traits {
    ($ty:ident) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, concat!(stringify!($ty), "({})"), &self.0)
            }
        }

        impl FromStr for $ty {
            type Err = IdError;
            fn from_str(s: &str) -> Result<Self, IdError> {
                Self::new(s)
            }
        }

        impl TryFrom<&str> for $ty {
            type Error = IdError;
            fn try_from(s: &str) -> Result<Self, IdError> {
                Self::new(s)
            }
        }

        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.0)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                Self::new(&s).map_err(de::Error::custom)
            }
        }
    };
}

impl_id_traits!(Sid);
impl_id_traits!(Uid);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sid_shape() {
        assert!(Sid::new("8ZZ").is_ok());
        assert!(Sid::new("000").is_ok());
        assert!(Sid::new("2AA").is_ok());
        assert!(Sid::new("zz8").is_err());
        assert!(Sid::new("8Z").is_err());
        assert!(Sid::new("8ZZZ").is_err());
    }

    #[test]
    fn uid_shape() {
        let uid = Uid::new("8ZZAAAAAB").unwrap();
        assert_eq!(uid.sid(), Sid::new("8ZZ").unwrap());
        assert!(Uid::new("8ZZAAAA").is_err());
        assert!(Uid::new("8zzAAAAAB").is_err());
    }

    #[test]
    fn ts6_id_sequence() {
        assert_eq!(ts6_id(0).as_str(), "AAAAAA");
        assert_eq!(ts6_id(1).as_str(), "AAAAAB");
        assert_eq!(ts6_id(25).as_str(), "AAAAAZ");
        assert_eq!(ts6_id(26).as_str(), "AAAAA0");
        assert_eq!(ts6_id(35).as_str(), "AAAAA9");
        assert_eq!(ts6_id(36).as_str(), "AAAABA");
    }

    #[test]
    fn mint_uid() {
        let sid = Sid::new("1AA").unwrap();
        assert_eq!(Uid::mint(sid, 0).as_str(), "1AAAAAAAA");
        assert_eq!(Uid::mint(sid, 1).as_str(), "1AAAAAAAB");
    }
}
