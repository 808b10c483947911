//! Handlers for every command a peer server may send.
//!
//! Each handler validates the source and parameters, mutates the network
//! model, notifies affected local users, and propagates to every local
//! server except the ingress. A malformed or unattributable message is
//! fatal to the link; a merely unroutable one is logged and dropped.

use std::collections::HashSet;

use minnow_proto::{casefold, names, Message, Sid, Uid};

use crate::connection::ClientId;
use crate::ircd::Ircd;
use crate::state::{Channel, KLine, Pattern, Server, Topic, UserModes, User};
use crate::utils::now;

fn source_sid(message: &Message) -> Option<Sid> {
    message.source.as_deref().and_then(|s| Sid::new(s).ok())
}

fn source_uid(message: &Message) -> Option<Uid> {
    message.source.as_deref().and_then(|s| Uid::new(s).ok())
}

impl Ircd {
    fn known_source_sid(&self, message: &Message) -> Option<Sid> {
        source_sid(message).filter(|sid| self.servers.contains_key(sid))
    }

    fn known_source_uid(&self, message: &Message) -> Option<Uid> {
        source_uid(message).filter(|uid| self.users.contains_key(uid))
    }

    // PING <origin-name> [dest-SID]
    pub(super) fn server_ping(&mut self, id: ClientId, message: Message) {
        if message.params.is_empty() {
            self.peer_numeric(
                id,
                "461",
                vec!["PING".to_string(), "Not enough parameters".to_string()],
            );
            return;
        }

        // The origin name parameter is ignored; the source is authoritative.
        let source = message.source.clone().unwrap_or_default();
        let Some(source_sid) = self.known_source_sid(&message) else {
            if let Some(peer) = self.local_servers.get(&id) {
                peer.conn.send(&Message::with_source(
                    self.config.ts6_sid.to_string(),
                    "402",
                    vec![source, "No such server".to_string()],
                ));
            }
            return;
        };

        let dest_sid = match message.params.get(1) {
            Some(raw) => match Sid::new(raw) {
                Ok(sid) => sid,
                Err(_) => {
                    if let Some(peer) = self.local_servers.get(&id) {
                        peer.conn.send(&Message::with_source(
                            self.config.ts6_sid.to_string(),
                            "402",
                            vec![raw.clone(), "No such server".to_string()],
                        ));
                    }
                    return;
                }
            },
            None => self.config.ts6_sid,
        };

        if dest_sid == self.config.ts6_sid {
            if let Some(peer) = self.local_servers.get(&id) {
                peer.conn.send(&Message::with_source(
                    self.config.ts6_sid.to_string(),
                    "PONG",
                    vec![self.config.server_name.clone(), source_sid.to_string()],
                ));
            }

            // The peer pings us at the end of its burst.
            let mut burst_over: Option<String> = None;
            if let Some(peer) = self.local_servers.get_mut(&id) {
                if peer.bursting && source_sid == peer.sid {
                    peer.got_ping = true;
                    if peer.got_pong {
                        peer.bursting = false;
                        burst_over = Some(peer.name.clone());
                    }
                }
            }
            if let Some(name) = burst_over {
                self.notice_opers(&format!("Burst with {} over.", name));
            }
            return;
        }

        if self.servers.contains_key(&dest_sid) {
            self.forward_to_server(dest_sid, &message);
        } else if let Some(peer) = self.local_servers.get(&id) {
            peer.conn.send(&Message::with_source(
                self.config.ts6_sid.to_string(),
                "402",
                vec![dest_sid.to_string(), "No such server".to_string()],
            ));
        }
    }

    // PONG <origin-name> <dest-SID>
    pub(super) fn server_pong(&mut self, id: ClientId, message: Message) {
        if message.params.len() < 2 {
            self.peer_numeric(
                id,
                "461",
                vec!["PONG".to_string(), "Not enough parameters".to_string()],
            );
            return;
        }
        if self.known_source_sid(&message).is_none() {
            self.terminate_peer(id, "Unknown source server (PONG)");
            return;
        }

        let Ok(dest_sid) = Sid::new(&message.params[1]) else {
            self.terminate_peer(id, "Unknown destination server (PONG)");
            return;
        };

        if dest_sid == self.config.ts6_sid {
            let mut burst_over: Option<String> = None;
            if let Some(peer) = self.local_servers.get_mut(&id) {
                peer.got_pong = true;
                if peer.bursting && peer.got_ping {
                    peer.bursting = false;
                    burst_over = Some(peer.name.clone());
                }
            }
            if let Some(name) = burst_over {
                self.notice_opers(&format!("Burst with {} over.", name));
            }
            return;
        }

        if self.servers.contains_key(&dest_sid) {
            self.forward_to_server(dest_sid, &message);
        } else {
            self.terminate_peer(id, "Unknown destination server (PONG)");
        }
    }

    // UID <nick> <hops> <nickTS> <umodes> <user> <host> <ip> <uid> <real>
    pub(super) fn server_uid(&mut self, id: ClientId, message: Message) {
        if message.params.len() < 9 {
            self.peer_numeric(
                id,
                "461",
                vec!["UID".to_string(), "Not enough parameters".to_string()],
            );
            return;
        }
        let Some(sid) = source_sid(&message) else {
            self.terminate_peer(id, "Invalid SID");
            return;
        };
        if !self.servers.contains_key(&sid) {
            self.terminate_peer(id, "Message from unknown server");
            return;
        }
        let Ok(uid) = Uid::new(&message.params[7]) else {
            self.terminate_peer(id, "Invalid UID");
            return;
        };
        // Duplicate delivery of a user we already know is a no-op.
        if self.users.contains_key(&uid) {
            return;
        }
        let Ok(nick_ts) = message.params[2].parse::<i64>() else {
            self.terminate_peer(id, "Invalid nick TS");
            return;
        };
        let nick = message.params[0].clone();
        if !names::is_valid_nick(self.config.max_nick_length, &nick) {
            self.terminate_peer(id, &format!("Invalid NICK! ({})", nick));
            return;
        }

        // Nick collision: the older timestamp wins; on a tie, both lose.
        if let Some(&collided_uid) = self.nicks.get(&casefold(&nick)) {
            let existing_ts = self
                .users
                .get(&collided_uid)
                .map(|u| u.nick_ts)
                .unwrap_or(i64::MAX);
            if nick_ts < existing_ts {
                self.issue_kill(None, collided_uid, "Nick collision, newer killed");
            } else if nick_ts == existing_ts {
                self.issue_kill(None, collided_uid, "Nick collision, both killed");
                self.issue_kill(None, uid, "Nick collision, both killed");
                return;
            } else {
                self.issue_kill(None, uid, "Nick collision, newer killed");
                return;
            }
        }

        let Ok(hops) = message.params[1].parse::<u32>() else {
            self.terminate_peer(id, "Invalid hop count");
            return;
        };
        let Some(modes) = UserModes::parse(&message.params[3]) else {
            self.terminate_peer(id, "Malformed umode");
            return;
        };
        let username = message.params[4].clone();
        if !names::is_valid_username(&username) {
            self.terminate_peer(id, "Invalid username");
            return;
        }
        let hostname = message.params[5].clone();
        let ip = message.params[6].clone();
        if !names::is_valid_realname(&message.params[8]) {
            self.terminate_peer(id, "Invalid real name");
            return;
        }
        let realname = message.params[8].clone();

        if modes.oper {
            self.opers.insert(uid);
        }
        self.nicks.insert(casefold(&nick), uid);
        self.users.insert(
            uid,
            User {
                uid,
                nick: nick.clone(),
                nick_ts,
                hops,
                username: username.clone(),
                hostname: hostname.clone(),
                ip: ip.clone(),
                realname: realname.clone(),
                modes,
                away: None,
                channels: HashSet::new(),
                server: sid,
                closest: Some(id),
                local_id: None,
            },
        );

        self.propagate(id, &message);

        let bursting = self
            .local_servers
            .get(&id)
            .map(|peer| peer.bursting)
            .unwrap_or(false);
        if !bursting {
            let server_name = self
                .servers
                .get(&sid)
                .map(|s| s.name.clone())
                .unwrap_or_default();
            self.notify_conn_opers(&format!(
                "CLICONN {} {} {} {} {} ({})",
                nick, username, hostname, ip, realname, server_name
            ));
        }
    }

    // NICK <nick> <nickTS>
    pub(super) fn server_nick(&mut self, id: ClientId, message: Message) {
        if message.params.len() < 2 {
            self.peer_numeric(
                id,
                "461",
                vec!["NICK".to_string(), "Not enough parameters".to_string()],
            );
            return;
        }
        let Some(uid) = self.known_source_uid(&message) else {
            self.terminate_peer(id, "Unknown user (NICK)");
            return;
        };
        let nick = message.params[0].clone();
        let Ok(nick_ts) = message.params[1].parse::<i64>() else {
            self.terminate_peer(id, "Invalid TS (NICK)");
            return;
        };

        if let Some(&collided_uid) = self.nicks.get(&casefold(&nick)) {
            if collided_uid != uid {
                let existing_ts = self
                    .users
                    .get(&collided_uid)
                    .map(|u| u.nick_ts)
                    .unwrap_or(i64::MAX);
                if nick_ts < existing_ts {
                    self.issue_kill(None, collided_uid, "Nick collision, newer killed");
                } else if nick_ts == existing_ts {
                    self.issue_kill(None, collided_uid, "Nick collision, both killed");
                    self.issue_kill(None, uid, "Nick collision, both killed");
                    return;
                } else {
                    self.issue_kill(None, uid, "Nick collision, newer killed");
                    return;
                }
            }
        }

        let (old_canonical, notify) = {
            let Some(user) = self.users.get(&uid) else {
                return;
            };
            (
                casefold(&user.nick),
                Message::with_source(user.nickmask(), "NICK", vec![nick.clone()]),
            )
        };

        // Tell sharers before the rename so the old nickmask is the source.
        self.inform_channel_sharers(uid, &notify, false);

        if self.nicks.get(&old_canonical) == Some(&uid) {
            self.nicks.remove(&old_canonical);
        }
        self.nicks.insert(casefold(&nick), uid);
        if let Some(user) = self.users.get_mut(&uid) {
            user.nick = nick;
            user.nick_ts = nick_ts;
        }

        self.propagate(id, &message);
    }

    // SID <name> <hops> <sid> <desc>
    pub(super) fn server_sid(&mut self, id: ClientId, message: Message) {
        if message.params.len() < 4 {
            self.peer_numeric(
                id,
                "461",
                vec!["SID".to_string(), "Not enough parameters".to_string()],
            );
            return;
        }
        let Some(origin) = self.known_source_sid(&message) else {
            let source = message.source.clone().unwrap_or_default();
            self.terminate_peer(id, &format!("Unknown origin (SID) {}", source));
            return;
        };
        let name = message.params[0].clone();
        let Ok(hops) = message.params[1].parse::<u32>() else {
            self.terminate_peer(id, "Invalid hop count");
            return;
        };
        let Ok(sid) = Sid::new(&message.params[2]) else {
            self.terminate_peer(id, "Invalid SID");
            return;
        };
        if sid == self.config.ts6_sid {
            self.terminate_peer(id, "SID collision");
            return;
        }
        // Duplicate delivery of a server we already know is a no-op.
        if self.servers.contains_key(&sid) {
            return;
        }

        self.servers.insert(
            sid,
            Server {
                sid,
                name: name.clone(),
                description: message.params[3].clone(),
                hops,
                linked_to: Some(origin),
                closest: Some(id),
                local_id: None,
                capabs: None,
            },
        );

        self.propagate(id, &message);

        let introducer = self
            .local_servers
            .get(&id)
            .map(|peer| peer.name.clone())
            .unwrap_or_default();
        self.notice_local_opers(&format!("{} is introducing server {}", introducer, name));
    }

    // SJOIN <chanTS> <name> <modes> [mode-params] :<prefixed-UIDs>
    pub(super) fn server_sjoin(&mut self, id: ClientId, message: Message) {
        if self.known_source_sid(&message).is_none() {
            self.terminate_peer(id, "Unknown server");
            return;
        }
        if message.params.len() < 4 {
            self.peer_numeric(
                id,
                "461",
                vec!["SJOIN".to_string(), "Not enough parameters".to_string()],
            );
            return;
        }
        let Ok(chan_ts) = message.params[0].parse::<i64>() else {
            self.terminate_peer(id, &format!("Invalid channel TS: {}", message.params[0]));
            return;
        };
        let canonical = casefold(&message.params[1]);

        let existed = self.channels.contains_key(&canonical);
        let channel = self
            .channels
            .entry(canonical.clone())
            .or_insert_with(|| Channel::new(canonical.clone(), chan_ts));
        // Clamp to the older timestamp.
        if chan_ts < channel.ts {
            channel.ts = chan_ts;
        }

        // With mode parameters present the member list moves along one.
        let member_list = if message.params.len() > 4 {
            message.params[4].clone()
        } else {
            message.params[3].clone()
        };

        let mut joined: Vec<Uid> = Vec::new();
        for raw in member_list.split_whitespace() {
            // Status prefixes are stripped; we do not track them.
            let raw = raw.trim_start_matches(&['@', '+'][..]);
            let member = Uid::new(raw).ok().filter(|u| self.users.contains_key(u));
            let Some(member_uid) = member else {
                // Likely lost to a concurrent collision kill; not fatal.
                tracing::info!(uid = raw, "SJOIN for unknown user, ignoring");
                continue;
            };
            let inserted = self
                .channels
                .get_mut(&canonical)
                .map(|channel| channel.members.insert(member_uid))
                .unwrap_or(false);
            if inserted {
                if let Some(user) = self.users.get_mut(&member_uid) {
                    user.channels.insert(canonical.clone());
                }
                joined.push(member_uid);
            }
        }

        if !existed
            && self
                .channels
                .get(&canonical)
                .is_some_and(|c| c.members.is_empty())
        {
            self.channels.remove(&canonical);
            return;
        }

        for member_uid in joined {
            let mask = self
                .users
                .get(&member_uid)
                .map(|u| u.nickmask())
                .unwrap_or_default();
            self.message_local_members(
                &canonical,
                &Message::with_source(mask, "JOIN", vec![canonical.clone()]),
            );
        }

        self.propagate(id, &message);
    }

    // TB <channel> <topicTS> [setter] <topic>
    pub(super) fn server_tb(&mut self, id: ClientId, message: Message) {
        if message.params.len() < 3 {
            self.peer_numeric(
                id,
                "461",
                vec!["TB".to_string(), "Not enough parameters".to_string()],
            );
            return;
        }
        let Some(source) = self.known_source_sid(&message) else {
            self.terminate_peer(id, "Unknown server (TB)");
            return;
        };
        let canonical = casefold(&message.params[0]);
        if !self.channels.contains_key(&canonical) {
            self.terminate_peer(id, "Unknown channel (TB)");
            return;
        }
        let Ok(topic_ts) = message.params[1].parse::<i64>() else {
            self.terminate_peer(id, "Invalid topic TS (TB)");
            return;
        };

        let server_name = self
            .servers
            .get(&source)
            .map(|s| s.name.clone())
            .unwrap_or_default();
        let (setter, text) = if message.params.len() >= 4 {
            (message.params[2].clone(), message.params[3].clone())
        } else {
            (server_name.clone(), message.params[2].clone())
        };

        let accept = match self.channels.get(&canonical).and_then(|c| c.topic.as_ref()) {
            Some(topic) if topic.text == text => return,
            Some(topic) => topic_ts < topic.ts,
            None => true,
        };
        if !accept {
            return;
        }

        if let Some(channel) = self.channels.get_mut(&canonical) {
            channel.topic = Some(Topic {
                text: text.clone(),
                setter,
                ts: topic_ts,
            });
        }

        self.message_local_members(
            &canonical,
            &Message::with_source(server_name, "TOPIC", vec![canonical.clone(), text]),
        );

        self.propagate(id, &message);
    }

    // JOIN <chanTS> <channel> +
    pub(super) fn server_join(&mut self, id: ClientId, message: Message) {
        if message.params.len() < 3 {
            self.peer_numeric(
                id,
                "461",
                vec!["JOIN".to_string(), "Not enough parameters".to_string()],
            );
            return;
        }
        let Some(uid) = self.known_source_uid(&message) else {
            self.terminate_peer(id, "Unknown UID (JOIN)");
            return;
        };
        let Ok(chan_ts) = message.params[0].parse::<i64>() else {
            self.terminate_peer(id, "Invalid TS (JOIN)");
            return;
        };
        let canonical = casefold(&message.params[1]);
        if !names::is_valid_channel_name(&canonical) {
            self.terminate_peer(id, "Invalid channel name");
            return;
        }

        let channel = self
            .channels
            .entry(canonical.clone())
            .or_insert_with(|| Channel::new(canonical.clone(), chan_ts));
        if chan_ts < channel.ts {
            channel.ts = chan_ts;
        }
        let inserted = channel.members.insert(uid);
        if let Some(user) = self.users.get_mut(&uid) {
            user.channels.insert(canonical.clone());
        }

        if inserted {
            let mask = self
                .users
                .get(&uid)
                .map(|u| u.nickmask())
                .unwrap_or_default();
            self.message_local_members(
                &canonical,
                &Message::with_source(mask, "JOIN", vec![canonical.clone()]),
            );
        }

        self.propagate(id, &message);
    }

    // PART <channel> [message]
    pub(super) fn server_part(&mut self, id: ClientId, message: Message) {
        if message.params.is_empty() {
            self.peer_numeric(
                id,
                "461",
                vec!["PART".to_string(), "Not enough parameters".to_string()],
            );
            return;
        }
        let Some(uid) = self.known_source_uid(&message) else {
            self.terminate_peer(id, "Unknown user (PART)");
            return;
        };
        let canonical = casefold(&message.params[0]);
        if !self.channels.contains_key(&canonical) {
            self.terminate_peer(id, "Unknown channel (PART)");
            return;
        }

        if let Some(user) = self.users.get_mut(&uid) {
            user.channels.remove(&canonical);
        }
        let emptied = match self.channels.get_mut(&canonical) {
            Some(channel) => {
                channel.members.remove(&uid);
                channel.members.is_empty()
            }
            None => false,
        };
        if emptied {
            self.channels.remove(&canonical);
        }

        let mask = self
            .users
            .get(&uid)
            .map(|u| u.nickmask())
            .unwrap_or_default();
        let mut params = vec![canonical.clone()];
        if let Some(text) = message.params.get(1) {
            if !text.is_empty() {
                params.push(text.clone());
            }
        }
        self.message_local_members(&canonical, &Message::with_source(mask, "PART", params));

        self.propagate(id, &message);
    }

    // QUIT [message]
    pub(super) fn server_quit(&mut self, id: ClientId, message: Message) {
        let Some(uid) = self.known_source_uid(&message) else {
            self.terminate_peer(id, "Unknown user (QUIT)");
            return;
        };
        let text = message.params.first().cloned().unwrap_or_default();
        self.quit_remote_user(uid, &text);
        self.propagate(id, &message);
    }

    // MODE <target> <changes> — channel modes are ignored wholesale; user
    // modes only ever change the user's own i/o flags.
    pub(super) fn server_mode(&mut self, id: ClientId, message: Message) {
        if message.params.len() < 2 {
            return;
        }
        let Some(uid) = self.known_source_uid(&message) else {
            self.terminate_peer(id, "Unknown prefix (MODE)");
            return;
        };
        let target = Uid::new(&message.params[0])
            .ok()
            .filter(|u| self.users.contains_key(u));
        let Some(target_uid) = target else {
            // A channel; nothing to track.
            return;
        };
        if target_uid != uid {
            self.terminate_peer(id, "Invalid MODE: User changing another's mode");
            return;
        }

        let mut became_oper = false;
        let mut lost_oper = false;
        if let Some(user) = self.users.get_mut(&uid) {
            let mut polarity = '+';
            for c in message.params[1].chars() {
                match c {
                    '+' | '-' => polarity = c,
                    'i' => user.modes.invisible = polarity == '+',
                    'o' => {
                        let on = polarity == '+';
                        if user.modes.oper != on {
                            user.modes.oper = on;
                            became_oper = on;
                            lost_oper = !on;
                        }
                    }
                    _ => {}
                }
            }
        }
        if became_oper {
            self.opers.insert(uid);
            let (nick, server_name) = self
                .users
                .get(&uid)
                .map(|u| {
                    (
                        u.nick.clone(),
                        self.servers
                            .get(&u.server)
                            .map(|s| s.name.clone())
                            .unwrap_or_else(|| self.config.server_name.clone()),
                    )
                })
                .unwrap_or_default();
            self.notice_local_opers(&format!("{}@{} became an operator.", nick, server_name));
        } else if lost_oper {
            self.opers.remove(&uid);
        }

        self.propagate(id, &message);
    }

    // TOPIC <channel> [topic] — a user-sourced topic change, trusted as-is.
    pub(super) fn server_topic(&mut self, id: ClientId, message: Message) {
        if message.params.is_empty() {
            self.peer_numeric(
                id,
                "461",
                vec!["TOPIC".to_string(), "Not enough parameters".to_string()],
            );
            return;
        }
        let Some(uid) = self.known_source_uid(&message) else {
            self.terminate_peer(id, "Unknown source user (TOPIC)");
            return;
        };
        let canonical = casefold(&message.params[0]);
        if !self.channels.contains_key(&canonical) {
            self.peer_numeric(
                id,
                "403",
                vec![canonical, "No such channel".to_string()],
            );
            return;
        }

        let mask = self
            .users
            .get(&uid)
            .map(|u| u.nickmask())
            .unwrap_or_default();
        let text = message.params.get(1).cloned().unwrap_or_default();
        if let Some(channel) = self.channels.get_mut(&canonical) {
            channel.topic = if text.is_empty() {
                None
            } else {
                Some(Topic {
                    text: text.clone(),
                    setter: mask.clone(),
                    ts: now(),
                })
            };
        }

        let mut params = vec![canonical.clone()];
        if !text.is_empty() {
            params.push(text);
        }
        self.message_local_members(&canonical, &Message::with_source(mask, "TOPIC", params));

        self.propagate(id, &message);
    }

    // SQUIT <target-SID> <comment>
    pub(super) fn server_squit(&mut self, id: ClientId, message: Message) {
        if message.params.len() < 2 {
            self.peer_numeric(
                id,
                "461",
                vec!["SQUIT".to_string(), "Not enough parameters".to_string()],
            );
            return;
        }
        let target = Sid::new(&message.params[0])
            .ok()
            .filter(|sid| self.servers.contains_key(sid));
        let Some(target_sid) = target else {
            self.terminate_peer(id, "Unknown server (SQUIT)");
            return;
        };

        // A direct link's departure reaches us as ERROR, never as SQUIT.
        if self
            .servers
            .get(&target_sid)
            .is_some_and(|server| server.is_local())
        {
            self.terminate_peer(id, "I won't SQUIT a local server");
            return;
        }

        let (target_name, upstream_name) = self
            .servers
            .get(&target_sid)
            .map(|server| {
                (
                    server.name.clone(),
                    server
                        .linked_to
                        .and_then(|sid| self.servers.get(&sid))
                        .map(|s| s.name.clone())
                        .unwrap_or_default(),
                )
            })
            .unwrap_or_default();

        self.server_split_cleanup(target_sid);

        self.propagate(id, &message);

        self.notice_local_opers(&format!(
            "Server {} delinked from {}: {}",
            target_name, upstream_name, message.params[1]
        ));
    }

    // KILL <UID> <reason> — reason carries "<path> (<text>)".
    pub(super) fn server_kill(&mut self, id: ClientId, message: Message) {
        if message.params.len() < 2 {
            self.peer_numeric(
                id,
                "461",
                vec!["KILL".to_string(), "Not enough parameters".to_string()],
            );
            return;
        }

        let source = self
            .known_source_uid(&message)
            .and_then(|uid| self.users.get(&uid))
            .map(|u| u.nick.clone())
            .or_else(|| {
                self.known_source_sid(&message)
                    .and_then(|sid| self.servers.get(&sid))
                    .map(|s| s.name.clone())
            })
            .unwrap_or_else(|| message.source.clone().unwrap_or_default());

        let target = Uid::new(&message.params[0])
            .ok()
            .filter(|uid| self.users.contains_key(uid));
        let Some(target_uid) = target else {
            self.notice_opers(&format!(
                "Received KILL for unknown user {}",
                message.params[0]
            ));
            return;
        };

        let path_and_reason = &message.params[1];
        let Some(space) = path_and_reason.find(' ') else {
            self.terminate_peer(id, "Malformed kill reason");
            return;
        };
        let path = path_and_reason[..space].to_string();
        let rest = &path_and_reason[space..];
        let reason = match (rest.find('('), rest.rfind(')')) {
            (Some(open), Some(close)) if open < close => rest[open + 1..close].to_string(),
            _ => {
                self.terminate_peer(id, "Malformed KILL reason");
                return;
            }
        };

        let target_nick = self
            .users
            .get(&target_uid)
            .map(|u| u.nick.clone())
            .unwrap_or_default();
        self.notice_local_opers(&format!(
            "Received KILL message for {}. From {} Path: {} ({})",
            target_nick, source, path, reason
        ));

        let quit_reason = format!("Killed ({} ({}))", source, reason);
        let target_local_id = self.users.get(&target_uid).and_then(|u| u.local_id);
        if let Some(local_id) = target_local_id {
            self.notice_opers(&format!("Killing local user {}", target_nick));
            // The KILL is already on its way everywhere; no QUIT.
            self.quit_local_user(local_id, &quit_reason, false);
        } else if self.users.contains_key(&target_uid) {
            self.quit_remote_user(target_uid, &quit_reason);
        }

        self.propagate(id, &message);
    }

    // ENCAP <dest-mask> <sub-command> [params...] — always propagated;
    // KLINE, UNKLINE and GCAP are also interpreted locally.
    pub(super) fn server_encap(&mut self, id: ClientId, message: Message) {
        if message.params.len() < 2 {
            self.peer_numeric(
                id,
                "461",
                vec!["ENCAP".to_string(), "Not enough parameters".to_string()],
            );
            return;
        }

        let sub_command = message.params[1].to_ascii_uppercase();
        let sub_params: Vec<String> = message.params[2..].to_vec();

        match sub_command.as_str() {
            "KLINE" => self.encap_kline(id, &message, &sub_params),
            "UNKLINE" => self.encap_unkline(id, &message, &sub_params),
            "GCAP" => self.encap_gcap(id, &message, &sub_params),
            _ => {}
        }

        self.propagate(id, &message);
    }

    /// The name a KLINE/UNKLINE is attributed to: the sending user's nick,
    /// or (defensively) a sending server's name.
    fn encap_source_name(&self, message: &Message) -> Option<String> {
        self.known_source_uid(message)
            .and_then(|uid| self.users.get(&uid))
            .map(|u| u.nick.clone())
            .or_else(|| {
                self.known_source_sid(message)
                    .and_then(|sid| self.servers.get(&sid))
                    .map(|s| s.name.clone())
            })
    }

    // KLINE <duration> <user-mask> <host-mask> [reason]; duration is
    // ignored, bans are runtime-permanent.
    fn encap_kline(&mut self, id: ClientId, message: &Message, params: &[String]) {
        if params.len() < 3 {
            self.peer_numeric(
                id,
                "461",
                vec!["KLINE".to_string(), "Not enough parameters".to_string()],
            );
            return;
        }
        let Some(source) = self.encap_source_name(message) else {
            tracing::info!("unknown source for KLINE command");
            return;
        };
        let reason = params
            .get(3)
            .cloned()
            .unwrap_or_else(|| "<No reason given>".to_string());
        self.add_and_apply_kline(
            KLine {
                user_mask: Pattern::new(params[1].clone()),
                host_mask: Pattern::new(params[2].clone()),
                reason,
            },
            &source,
        );
    }

    // UNKLINE <user-mask> <host-mask>
    fn encap_unkline(&mut self, id: ClientId, message: &Message, params: &[String]) {
        if params.len() < 2 {
            self.peer_numeric(
                id,
                "461",
                vec!["UNKLINE".to_string(), "Not enough parameters".to_string()],
            );
            return;
        }
        let Some(source) = self.encap_source_name(message) else {
            tracing::info!("unknown source for UNKLINE command");
            return;
        };
        self.remove_kline(&params[0], &params[1], &source);
    }

    // GCAP <space-separated-capabs> — a server's capability set, exactly
    // once, and it must include the protocol's mandatory pair.
    fn encap_gcap(&mut self, id: ClientId, message: &Message, params: &[String]) {
        let source = message.source.clone().unwrap_or_default();
        let Some(capabs_raw) = params.first() else {
            self.terminate_peer(id, &format!("GCAP from {} with no capabs", source));
            return;
        };
        let Some(sid) = self.known_source_sid(message) else {
            self.terminate_peer(id, &format!("Unknown server (GCAP): {}", source));
            return;
        };

        let capabs: HashSet<String> = capabs_raw
            .split_whitespace()
            .map(str::to_string)
            .collect();
        let server_name = self
            .servers
            .get(&sid)
            .map(|s| s.name.clone())
            .unwrap_or_default();
        if !capabs.contains("QS") {
            self.terminate_peer(id, &format!("{} is missing capab QS", server_name));
            return;
        }
        if !capabs.contains("ENCAP") {
            self.terminate_peer(id, &format!("{} is missing capab ENCAP", server_name));
            return;
        }
        if self
            .servers
            .get(&sid)
            .is_some_and(|s| s.capabs.is_some())
        {
            self.terminate_peer(id, &format!("Already received GCAP from {}!", server_name));
            return;
        }
        if let Some(server) = self.servers.get_mut(&sid) {
            server.capabs = Some(capabs);
        }
    }

    // PRIVMSG/NOTICE <target> <text>
    pub(super) fn server_privmsg(&mut self, id: ClientId, message: Message) {
        if message.params.is_empty() {
            self.peer_numeric(
                id,
                "411",
                vec![format!("No recipient given ({})", message.command)],
            );
            return;
        }
        if message.params.len() < 2 {
            self.peer_numeric(id, "412", vec!["No text to send".to_string()]);
            return;
        }

        // NOTICE may come from a server; anything else must be a user.
        let mut source_display = String::new();
        if message.command == "NOTICE" {
            if let Some(server) = self
                .known_source_sid(&message)
                .and_then(|sid| self.servers.get(&sid))
            {
                source_display = server.name.clone();
            }
        }
        if source_display.is_empty() {
            if let Some(user) = self
                .known_source_uid(&message)
                .and_then(|uid| self.users.get(&uid))
            {
                source_display = user.nickmask();
            }
        }
        if source_display.is_empty() {
            self.terminate_peer(id, &format!("Unknown source ({})", message.command));
            return;
        }

        let text = message.params[1].clone();

        // A UID target is a user; rewrite to nick for local delivery.
        if let Ok(target_uid) = Uid::new(&message.params[0]) {
            if let Some(target) = self.users.get(&target_uid) {
                if let Some(local_id) = target.local_id {
                    let deliver = Message::with_source(
                        source_display,
                        message.command.clone(),
                        vec![target.nick.clone(), text],
                    );
                    if let Some(local_user) = self.local_users.get(&local_id) {
                        local_user.conn.send(&deliver);
                    }
                } else {
                    self.send_toward_user(target_uid, &message);
                }
                return;
            }
            // An unknown UID falls through to channel handling, mirroring
            // the lenient target resolution of the reference protocol.
        }

        let canonical = casefold(&message.params[0]);
        let Some(channel) = self.channels.get(&canonical) else {
            tracing::info!(recipient = %message.params[0], "message to unknown target");
            return;
        };

        let deliver = Message::with_source(
            source_display,
            message.command.clone(),
            vec![message.params[0].clone(), text],
        );
        let mut forward_to: HashSet<ClientId> = HashSet::new();
        for member_uid in &channel.members {
            let Some(member) = self.users.get(member_uid) else {
                continue;
            };
            if let Some(local_id) = member.local_id {
                if let Some(local_user) = self.local_users.get(&local_id) {
                    local_user.conn.send(&deliver);
                }
            } else if let Some(closest) = member.closest {
                if closest != id {
                    forward_to.insert(closest);
                }
            }
        }
        for peer_id in forward_to {
            if let Some(peer) = self.local_servers.get(&peer_id) {
                peer.conn.send(&message);
            }
        }
    }

    // WALLOPS/OPERWALL <text>
    pub(super) fn server_wallops(&mut self, id: ClientId, message: Message) {
        if message.params.is_empty() {
            self.terminate_peer(id, "Invalid parameters (WALLOPS)");
            return;
        }

        let origin = self
            .known_source_uid(&message)
            .and_then(|uid| self.users.get(&uid))
            .map(|u| u.nickmask())
            .or_else(|| {
                self.known_source_sid(&message)
                    .and_then(|sid| self.servers.get(&sid))
                    .map(|s| s.name.clone())
            });
        let Some(origin) = origin else {
            self.terminate_peer(id, "Unknown origin (WALLOPS)");
            return;
        };

        let deliver =
            Message::with_source(origin, "WALLOPS", vec![message.params[0].clone()]);
        for oper_uid in &self.opers {
            if let Some(conn) = self.local_user_conn(*oper_uid) {
                conn.send(&deliver);
            }
        }

        self.propagate(id, &message);
    }

    // WHOIS <target-UID> <target-nick>
    pub(super) fn server_whois(&mut self, id: ClientId, message: Message) {
        if message.params.len() < 2 {
            self.peer_numeric(
                id,
                "461",
                vec!["WHOIS".to_string(), "Not enough parameters".to_string()],
            );
            return;
        }
        let Some(source_uid) = self.known_source_uid(&message) else {
            tracing::info!(source = ?message.source, "WHOIS from unknown user");
            return;
        };

        let target = Uid::new(&message.params[0])
            .ok()
            .filter(|uid| self.users.contains_key(uid));
        let Some(target_uid) = target else {
            let source_nick = self
                .users
                .get(&source_uid)
                .map(|u| u.nick.clone())
                .unwrap_or_default();
            self.send_toward_user(
                source_uid,
                &Message::with_source(
                    self.config.server_name.clone(),
                    "401",
                    vec![
                        source_nick,
                        message.params[0].clone(),
                        "No such nick/channel".to_string(),
                    ],
                ),
            );
            return;
        };

        let target_is_local = self
            .users
            .get(&target_uid)
            .is_some_and(|u| u.is_local());
        if target_is_local {
            let replies = self.create_whois_response(target_uid, source_uid, true);
            for reply in &replies {
                self.send_toward_user(source_uid, reply);
            }
        } else {
            self.send_toward_user(target_uid, &message);
        }
    }

    // A numeric in transit, e.g. a remote WHOIS reply on its way back.
    pub(super) fn server_numeric(&mut self, _id: ClientId, message: Message) {
        let Some(source_sid) = self.known_source_sid(&message) else {
            tracing::info!(source = ?message.source, "numeric from unknown server");
            return;
        };
        let Some(target_raw) = message.params.first() else {
            tracing::info!("numeric with no parameters");
            return;
        };
        let target = Uid::new(target_raw)
            .ok()
            .filter(|uid| self.users.contains_key(uid));
        let Some(target_uid) = target else {
            tracing::info!(numeric = %message.command, "numeric for unknown user");
            return;
        };

        let Some(user) = self.users.get(&target_uid) else {
            return;
        };
        if let Some(local_id) = user.local_id {
            let server_name = self
                .servers
                .get(&source_sid)
                .map(|s| s.name.clone())
                .unwrap_or_default();
            let mut params = vec![user.nick.clone()];
            params.extend(message.params[1..].iter().cloned());
            if let Some(local_user) = self.local_users.get(&local_id) {
                local_user.conn.send(&Message::with_source(
                    server_name,
                    message.command.clone(),
                    params,
                ));
            }
        } else {
            self.send_toward_user(target_uid, &message);
        }
    }

    // AWAY [message] — set or clear.
    pub(super) fn server_away(&mut self, id: ClientId, message: Message) {
        let Some(uid) = self.known_source_uid(&message) else {
            self.terminate_peer(id, "Unknown user (AWAY)");
            return;
        };
        let text = message.params.first().filter(|t| !t.is_empty()).cloned();
        if text.is_none() {
            // Clearing an unset away is a no-op and not worth propagating.
            if self.users.get(&uid).is_some_and(|u| u.away.is_none()) {
                return;
            }
        }
        if let Some(user) = self.users.get_mut(&uid) {
            user.away = text;
        }
        self.propagate(id, &message);
    }

    // INVITE <target-UID> <channel> [chanTS]
    pub(super) fn server_invite(&mut self, id: ClientId, message: Message) {
        if message.params.len() < 2 {
            self.peer_numeric(
                id,
                "461",
                vec!["INVITE".to_string(), "Not enough parameters".to_string()],
            );
            return;
        }
        let Some(source_uid) = self.known_source_uid(&message) else {
            self.terminate_peer(id, "Unknown source user (INVITE)");
            return;
        };
        let target = Uid::new(&message.params[0])
            .ok()
            .filter(|uid| self.users.contains_key(uid));
        let Some(target_uid) = target else {
            self.terminate_peer(id, "Unknown target user (INVITE)");
            return;
        };
        let canonical = casefold(&message.params[1]);
        let Some(channel) = self.channels.get(&canonical) else {
            self.terminate_peer(id, "Unknown channel (INVITE)");
            return;
        };
        let channel_ts = channel.ts;

        // The inviter's channel TS, when present, sits at parameter index 2.
        if let Some(raw_ts) = message.params.get(2) {
            let Ok(their_ts) = raw_ts.parse::<i64>() else {
                self.terminate_peer(id, &format!("Invalid channel TS: {}", raw_ts));
                return;
            };
            if their_ts > channel_ts {
                let (source_nick, target_nick) = (
                    self.users
                        .get(&source_uid)
                        .map(|u| u.nick.clone())
                        .unwrap_or_default(),
                    self.users
                        .get(&target_uid)
                        .map(|u| u.nick.clone())
                        .unwrap_or_default(),
                );
                self.notice_opers(&format!(
                    "INVITE from {} to {} for {} has newer TS",
                    source_nick, target_nick, canonical
                ));
                return;
            }
        }

        let target_user = self.users.get(&target_uid);
        let target_local = target_user.is_some_and(|u| u.is_local());
        if target_local {
            let target_nick = target_user.map(|u| u.nick.clone()).unwrap_or_default();
            let mask = self
                .users
                .get(&source_uid)
                .map(|u| u.nickmask())
                .unwrap_or_default();
            if let Some(conn) = self.local_user_conn(target_uid) {
                conn.send(&Message::with_source(
                    mask,
                    "INVITE",
                    vec![target_nick, canonical],
                ));
            }
        } else {
            self.send_toward_user(target_uid, &message);
        }
    }
}
