//! The burst: our view of the network, dumped to a freshly linked peer.

use minnow_proto::{Message, MAX_LINE_LEN};

use crate::connection::ClientId;
use crate::ircd::Ircd;
use crate::state::{Channel, Server, CHANNEL_MODES};

impl Ircd {
    /// Send the whole world to a newly promoted peer: servers (hop count
    /// ascending, so every link-to reference precedes its dependents), then
    /// users, then channels.
    pub(crate) fn send_burst(&self, id: ClientId) {
        let Some(peer) = self.local_servers.get(&id) else {
            return;
        };
        let our_sid = self.config.ts6_sid;

        let mut servers: Vec<&Server> = self
            .servers
            .values()
            .filter(|server| server.sid != peer.sid)
            .collect();
        servers.sort_by_key(|server| server.hops);
        for server in servers {
            let linked_to = server.linked_to.unwrap_or(our_sid);
            peer.conn.send(&Message::with_source(
                linked_to.to_string(),
                "SID",
                vec![
                    server.name.clone(),
                    (server.hops + 1).to_string(),
                    server.sid.to_string(),
                    server.description.clone(),
                ],
            ));
            let capabs = server.capabs_string();
            if !capabs.is_empty() {
                peer.conn.send(&Message::with_source(
                    server.sid.to_string(),
                    "ENCAP",
                    vec!["*".to_string(), "GCAP".to_string(), capabs],
                ));
            }
        }

        for user in self.users.values() {
            peer.conn.send(&Message::with_source(
                user.server.to_string(),
                "UID",
                vec![
                    user.nick.clone(),
                    (user.hops + 1).to_string(),
                    user.nick_ts.to_string(),
                    user.modes.format(),
                    user.username.clone(),
                    user.hostname.clone(),
                    user.ip.clone(),
                    user.uid.to_string(),
                    user.realname.clone(),
                ],
            ));
            if let Some(away) = &user.away {
                peer.conn.send(&Message::with_source(
                    user.uid.to_string(),
                    "AWAY",
                    vec![away.clone()],
                ));
            }
        }

        let send_topics = peer.has_capab("TB");
        for channel in self.channels.values() {
            for frame in sjoin_frames(our_sid.as_str(), channel) {
                peer.conn.send(&frame);
            }
            if send_topics {
                if let Some(topic) = &channel.topic {
                    peer.conn.send(&Message::with_source(
                        our_sid.to_string(),
                        "TB",
                        vec![
                            channel.name.clone(),
                            topic.ts.to_string(),
                            topic.setter.clone(),
                            topic.text.clone(),
                        ],
                    ));
                }
            }
        }
    }
}

/// Pack a channel's member list into as few SJOIN frames as the line limit
/// permits. Each frame shares the channel header; members are appended until
/// the next would push the encoded line past the limit.
pub fn sjoin_frames(source: &str, channel: &Channel) -> Vec<Message> {
    let base = Message::with_source(
        source.to_string(),
        "SJOIN",
        vec![
            channel.ts.to_string(),
            channel.name.clone(),
            CHANNEL_MODES.to_string(),
            String::new(),
        ],
    );
    let base_len = match base.encode() {
        Ok(line) => line.len(),
        Err(_) => return Vec::new(),
    };

    let mut frames = Vec::new();
    let mut members = String::new();
    for uid in &channel.members {
        let uid = uid.as_str();
        if members.is_empty() {
            members.push_str(uid);
            continue;
        }
        if base_len + members.len() + 1 + uid.len() > MAX_LINE_LEN {
            let mut frame = base.clone();
            frame.params[3] = std::mem::take(&mut members);
            frames.push(frame);
            members.push_str(uid);
        } else {
            members.push(' ');
            members.push_str(uid);
        }
    }
    if !members.is_empty() {
        let mut frame = base.clone();
        frame.params[3] = members;
        frames.push(frame);
    }
    frames
}

#[cfg(test)]
mod tests {
    use super::*;
    use minnow_proto::{Sid, Uid};

    fn channel_with_members(count: u64) -> Channel {
        let mut channel = Channel::new("#big".to_string(), 500);
        let sid = Sid::new("9XX").unwrap();
        for n in 0..count {
            channel.members.insert(Uid::mint(sid, n));
        }
        channel
    }

    #[test]
    fn small_channel_fits_one_frame() {
        let channel = channel_with_members(3);
        let frames = sjoin_frames("1AA", &channel);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].params[0], "500");
        assert_eq!(frames[0].params[1], "#big");
        assert_eq!(frames[0].params[3].split_whitespace().count(), 3);
    }

    #[test]
    fn large_channel_splits_and_covers_every_member() {
        let channel = channel_with_members(200);
        let frames = sjoin_frames("1AA", &channel);
        assert!(frames.len() >= 5, "200 members cannot fit fewer frames");

        let mut seen = std::collections::HashSet::new();
        for frame in &frames {
            let encoded = frame.encode().unwrap();
            assert!(encoded.len() <= MAX_LINE_LEN);
            for uid in frame.params[3].split_whitespace() {
                assert!(seen.insert(uid.to_string()), "duplicate member {}", uid);
            }
        }
        assert_eq!(seen.len(), 200);
    }

    #[test]
    fn empty_channel_yields_nothing() {
        let channel = Channel::new("#empty".to_string(), 1);
        assert!(sjoin_frames("1AA", &channel).is_empty());
    }
}
