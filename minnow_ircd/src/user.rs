//! Registered local users and their command surface.
//!
//! Every inbound message from a local user passes through the flood gate
//! first; handling is charged against the token bucket after the handler
//! runs, so a registration-time burst counts against quota.

use std::collections::HashSet;

use minnow_proto::{casefold, names, Message, Uid};

use crate::connection::{ClientId, Connection};
use crate::ircd::Ircd;
use crate::state::{Channel, KLine, Pattern, Topic, CHANNEL_MODES};
use crate::throttle::{MessageThrottle, EXCESS_FLOOD_THRESHOLD};
use crate::utils::now;

/// A connection registered as a user.
#[derive(Debug)]
pub struct LocalUser {
    pub conn: Connection,
    pub uid: Uid,
    pub last_activity: i64,
    pub last_ping: i64,
    /// Last PRIVMSG/NOTICE, for WHOIS idle time.
    pub last_message: i64,
    pub signon: i64,
    pub throttle: MessageThrottle,
    pub flood_exempt: bool,
}

impl Ircd {
    /// Flood-control gate for inbound user messages: handle now if the
    /// bucket allows, defer otherwise, disconnect on excess.
    pub(crate) fn handle_user_event(&mut self, id: ClientId, message: Message) {
        let (has_token, uid, exempt) = match self.local_users.get(&id) {
            Some(local_user) => (
                local_user.throttle.has_token(),
                local_user.uid,
                local_user.flood_exempt,
            ),
            None => return,
        };

        if has_token {
            self.process_user_message(id, message);
            return;
        }

        let queued = match self.local_users.get_mut(&id) {
            Some(local_user) => local_user.throttle.defer(message),
            None => return,
        };
        let exempt = exempt || self.users.get(&uid).is_some_and(|u| u.is_oper());
        if queued >= EXCESS_FLOOD_THRESHOLD && !exempt {
            self.quit_local_user(id, "Excess flood", true);
        }
    }

    pub(crate) fn process_user_message(&mut self, id: ClientId, message: Message) {
        if let Some(local_user) = self.local_users.get_mut(&id) {
            local_user.last_activity = now();
        } else {
            return;
        }

        match message.command.as_str() {
            "PING" => self.user_ping(id, message),
            "PONG" => {}
            "NICK" => self.user_nick(id, message),
            "USER" => {
                self.numeric(id, "462", vec!["You may not reregister".to_string()]);
            }
            "JOIN" => self.user_join(id, message),
            "PART" => self.user_part(id, message),
            "PRIVMSG" | "NOTICE" => self.user_privmsg(id, message),
            "TOPIC" => self.user_topic(id, message),
            "AWAY" => self.user_away(id, message),
            "MODE" => self.user_mode(id, message),
            "OPER" => self.user_oper(id, message),
            "WHOIS" => self.user_whois(id, message),
            "INVITE" => self.user_invite(id, message),
            "KILL" => self.user_kill(id, message),
            "KLINE" => self.user_kline(id, message),
            "UNKLINE" => self.user_unkline(id, message),
            "WALLOPS" | "OPERWALL" => self.user_wallops(id, message),
            "MOTD" => self.send_motd(id),
            "REHASH" => self.user_rehash(id),
            "QUIT" => {
                let text = message.params.first().cloned().unwrap_or_default();
                self.quit_local_user(id, &format!("Quit: {}", text), true);
                return;
            }
            _ => {
                self.numeric(
                    id,
                    "421",
                    vec![message.command.clone(), "Unknown command".to_string()],
                );
            }
        }

        if let Some(local_user) = self.local_users.get_mut(&id) {
            local_user.throttle.consume();
        }
    }

    fn uid_of(&self, id: ClientId) -> Option<Uid> {
        self.local_users.get(&id).map(|lu| lu.uid)
    }

    fn is_oper_client(&self, id: ClientId) -> bool {
        self.uid_of(id).is_some_and(|uid| self.opers.contains(&uid))
    }

    /// Deliver a message to every local user sharing a channel with `uid`,
    /// each exactly once; `uid` itself is skipped unless `include_self`.
    pub(crate) fn inform_channel_sharers(
        &self,
        uid: Uid,
        message: &Message,
        include_self: bool,
    ) {
        let Some(user) = self.users.get(&uid) else {
            return;
        };
        if include_self {
            if let Some(conn) = self.local_user_conn(uid) {
                conn.send(message);
            }
        }
        let mut informed: HashSet<Uid> = HashSet::new();
        informed.insert(uid);
        for chan_name in &user.channels {
            let Some(channel) = self.channels.get(chan_name) else {
                continue;
            };
            for member_uid in &channel.members {
                if !informed.insert(*member_uid) {
                    continue;
                }
                if let Some(conn) = self.local_user_conn(*member_uid) {
                    conn.send(message);
                }
            }
        }
    }

    fn user_ping(&self, id: ClientId, message: Message) {
        let Some(local_user) = self.local_users.get(&id) else {
            return;
        };
        let token = message
            .params
            .first()
            .cloned()
            .unwrap_or_else(|| self.config.server_name.clone());
        local_user.conn.send(&Message::with_source(
            self.config.server_name.clone(),
            "PONG",
            vec![self.config.server_name.clone(), token],
        ));
    }

    fn user_nick(&mut self, id: ClientId, message: Message) {
        let Some(new_nick) = message.params.first().cloned() else {
            self.numeric(id, "431", vec!["No nickname given".to_string()]);
            return;
        };
        if !names::is_valid_nick(self.config.max_nick_length, &new_nick) {
            self.numeric(
                id,
                "432",
                vec![new_nick, "Erroneous nickname".to_string()],
            );
            return;
        }
        let Some(uid) = self.uid_of(id) else {
            return;
        };
        let canonical = casefold(&new_nick);
        if let Some(&holder) = self.nicks.get(&canonical) {
            if holder != uid {
                self.numeric(
                    id,
                    "433",
                    vec![new_nick, "Nickname is already in use".to_string()],
                );
                return;
            }
        }

        let (old_canonical, notify) = {
            let Some(user) = self.users.get(&uid) else {
                return;
            };
            if user.nick == new_nick {
                return;
            }
            (
                casefold(&user.nick),
                Message::with_source(user.nickmask(), "NICK", vec![new_nick.clone()]),
            )
        };

        // Sharers (and the renamer) see the change from the old nickmask.
        self.inform_channel_sharers(uid, &notify, true);

        let nick_ts = now();
        if self.nicks.get(&old_canonical) == Some(&uid) {
            self.nicks.remove(&old_canonical);
        }
        self.nicks.insert(canonical, uid);
        if let Some(user) = self.users.get_mut(&uid) {
            user.nick = new_nick.clone();
            user.nick_ts = nick_ts;
        }

        self.broadcast_to_peers(&Message::with_source(
            uid.to_string(),
            "NICK",
            vec![new_nick, nick_ts.to_string()],
        ));
    }

    fn user_join(&mut self, id: ClientId, message: Message) {
        let Some(raw_name) = message.params.first() else {
            self.numeric(
                id,
                "461",
                vec!["JOIN".to_string(), "Not enough parameters".to_string()],
            );
            return;
        };
        let canonical = casefold(raw_name);
        if !names::is_valid_channel_name(&canonical) {
            self.numeric(
                id,
                "403",
                vec![raw_name.clone(), "No such channel".to_string()],
            );
            return;
        }
        let Some(uid) = self.uid_of(id) else {
            return;
        };
        if self
            .users
            .get(&uid)
            .is_some_and(|u| u.channels.contains(&canonical))
        {
            return;
        }

        let created_ts = now();
        let created = !self.channels.contains_key(&canonical);
        let chan_ts = {
            let channel = self
                .channels
                .entry(canonical.clone())
                .or_insert_with(|| Channel::new(canonical.clone(), created_ts));
            channel.members.insert(uid);
            channel.ts
        };
        if let Some(user) = self.users.get_mut(&uid) {
            user.channels.insert(canonical.clone());
        }

        let mask = self
            .users
            .get(&uid)
            .map(|u| u.nickmask())
            .unwrap_or_default();
        self.message_local_members(
            &canonical,
            &Message::with_source(mask, "JOIN", vec![canonical.clone()]),
        );

        if let Some(topic) = self.channels.get(&canonical).and_then(|c| c.topic.clone()) {
            self.numeric(id, "332", vec![canonical.clone(), topic.text]);
            self.numeric(
                id,
                "333",
                vec![canonical.clone(), topic.setter, topic.ts.to_string()],
            );
        }
        let names = self
            .channels
            .get(&canonical)
            .map(|channel| {
                channel
                    .members
                    .iter()
                    .filter_map(|m| self.users.get(m))
                    .map(|u| u.nick.clone())
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .unwrap_or_default();
        self.numeric(id, "353", vec!["=".to_string(), canonical.clone(), names]);
        self.numeric(
            id,
            "366",
            vec![canonical.clone(), "End of /NAMES list".to_string()],
        );

        if created {
            self.broadcast_to_peers(&Message::with_source(
                self.config.ts6_sid.to_string(),
                "SJOIN",
                vec![
                    chan_ts.to_string(),
                    canonical,
                    CHANNEL_MODES.to_string(),
                    uid.to_string(),
                ],
            ));
        } else {
            self.broadcast_to_peers(&Message::with_source(
                uid.to_string(),
                "JOIN",
                vec![chan_ts.to_string(), canonical, "+".to_string()],
            ));
        }
    }

    fn user_part(&mut self, id: ClientId, message: Message) {
        let Some(raw_name) = message.params.first() else {
            self.numeric(
                id,
                "461",
                vec!["PART".to_string(), "Not enough parameters".to_string()],
            );
            return;
        };
        let canonical = casefold(raw_name);
        let Some(uid) = self.uid_of(id) else {
            return;
        };
        if !self.channels.contains_key(&canonical) {
            self.numeric(
                id,
                "403",
                vec![raw_name.clone(), "No such channel".to_string()],
            );
            return;
        }
        if !self
            .users
            .get(&uid)
            .is_some_and(|u| u.channels.contains(&canonical))
        {
            self.numeric(
                id,
                "442",
                vec![canonical, "You're not on that channel".to_string()],
            );
            return;
        }

        let part_text = message.params.get(1).cloned();
        let mask = self
            .users
            .get(&uid)
            .map(|u| u.nickmask())
            .unwrap_or_default();
        let mut params = vec![canonical.clone()];
        if let Some(text) = &part_text {
            params.push(text.clone());
        }
        self.message_local_members(&canonical, &Message::with_source(mask, "PART", params.clone()));

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

        self.broadcast_to_peers(&Message::with_source(uid.to_string(), "PART", params));
    }

    fn user_privmsg(&mut self, id: ClientId, message: Message) {
        if message.params.is_empty() {
            self.numeric(
                id,
                "411",
                vec![format!("No recipient given ({})", message.command)],
            );
            return;
        }
        if message.params.len() < 2 || message.params[1].is_empty() {
            self.numeric(id, "412", vec!["No text to send".to_string()]);
            return;
        }
        let Some(uid) = self.uid_of(id) else {
            return;
        };
        if let Some(local_user) = self.local_users.get_mut(&id) {
            local_user.last_message = now();
        }

        let target = message.params[0].clone();
        let text = message.params[1].clone();
        let mask = self
            .users
            .get(&uid)
            .map(|u| u.nickmask())
            .unwrap_or_default();

        if target.starts_with('#') || target.starts_with('&') {
            let canonical = casefold(&target);
            let Some(channel) = self.channels.get(&canonical) else {
                self.numeric(
                    id,
                    "401",
                    vec![target, "No such nick/channel".to_string()],
                );
                return;
            };
            if !channel.members.contains(&uid) {
                self.numeric(
                    id,
                    "404",
                    vec![canonical, "Cannot send to channel".to_string()],
                );
                return;
            }

            let deliver = Message::with_source(
                mask,
                message.command.clone(),
                vec![canonical.clone(), text.clone()],
            );
            let forward = Message::with_source(
                uid.to_string(),
                message.command.clone(),
                vec![canonical.clone(), text],
            );

            let mut to_peers: HashSet<ClientId> = HashSet::new();
            for member_uid in &channel.members {
                if *member_uid == uid {
                    continue;
                }
                let Some(member) = self.users.get(member_uid) else {
                    continue;
                };
                if let Some(local_id) = member.local_id {
                    if let Some(local_user) = self.local_users.get(&local_id) {
                        local_user.conn.send(&deliver);
                    }
                } else if let Some(closest) = member.closest {
                    to_peers.insert(closest);
                }
            }
            for peer_id in to_peers {
                if let Some(peer) = self.local_servers.get(&peer_id) {
                    peer.conn.send(&forward);
                }
            }
            return;
        }

        let Some(&target_uid) = self.nicks.get(&casefold(&target)) else {
            self.numeric(
                id,
                "401",
                vec![target, "No such nick/channel".to_string()],
            );
            return;
        };
        let Some(target_user) = self.users.get(&target_uid) else {
            return;
        };
        if message.command == "PRIVMSG" {
            if let Some(away) = &target_user.away {
                self.numeric(
                    id,
                    "301",
                    vec![target_user.nick.clone(), away.clone()],
                );
            }
        }
        let Some(target_user) = self.users.get(&target_uid) else {
            return;
        };
        if let Some(local_id) = target_user.local_id {
            if let Some(local_user) = self.local_users.get(&local_id) {
                local_user.conn.send(&Message::with_source(
                    mask,
                    message.command.clone(),
                    vec![target_user.nick.clone(), text],
                ));
            }
        } else {
            self.send_toward_user(
                target_uid,
                &Message::with_source(
                    uid.to_string(),
                    message.command.clone(),
                    vec![target_uid.to_string(), text],
                ),
            );
        }
    }

    fn user_topic(&mut self, id: ClientId, message: Message) {
        let Some(raw_name) = message.params.first() else {
            self.numeric(
                id,
                "461",
                vec!["TOPIC".to_string(), "Not enough parameters".to_string()],
            );
            return;
        };
        let canonical = casefold(raw_name);
        let Some(uid) = self.uid_of(id) else {
            return;
        };
        if !self.channels.contains_key(&canonical) {
            self.numeric(
                id,
                "403",
                vec![raw_name.clone(), "No such channel".to_string()],
            );
            return;
        }
        if !self
            .users
            .get(&uid)
            .is_some_and(|u| u.channels.contains(&canonical))
        {
            self.numeric(
                id,
                "442",
                vec![canonical, "You're not on that channel".to_string()],
            );
            return;
        }

        if message.params.len() < 2 {
            match self.channels.get(&canonical).and_then(|c| c.topic.clone()) {
                Some(topic) => {
                    self.numeric(id, "332", vec![canonical.clone(), topic.text]);
                    self.numeric(
                        id,
                        "333",
                        vec![canonical, topic.setter, topic.ts.to_string()],
                    );
                }
                None => {
                    self.numeric(id, "331", vec![canonical, "No topic is set".to_string()]);
                }
            }
            return;
        }

        let text = message.params[1].clone();
        let mask = self
            .users
            .get(&uid)
            .map(|u| u.nickmask())
            .unwrap_or_default();
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

        self.message_local_members(
            &canonical,
            &Message::with_source(mask, "TOPIC", vec![canonical.clone(), text.clone()]),
        );
        self.broadcast_to_peers(&Message::with_source(
            uid.to_string(),
            "TOPIC",
            vec![canonical, text],
        ));
    }

    fn user_away(&mut self, id: ClientId, message: Message) {
        let Some(uid) = self.uid_of(id) else {
            return;
        };
        let text = message.params.first().filter(|t| !t.is_empty()).cloned();
        if let Some(user) = self.users.get_mut(&uid) {
            user.away = text.clone();
        }
        match text {
            Some(text) => {
                self.numeric(
                    id,
                    "306",
                    vec!["You have been marked as being away".to_string()],
                );
                self.broadcast_to_peers(&Message::with_source(
                    uid.to_string(),
                    "AWAY",
                    vec![text],
                ));
            }
            None => {
                self.numeric(
                    id,
                    "305",
                    vec!["You are no longer marked as being away".to_string()],
                );
                self.broadcast_to_peers(&Message::with_source(uid.to_string(), "AWAY", vec![]));
            }
        }
    }

    fn user_mode(&mut self, id: ClientId, message: Message) {
        let Some(target) = message.params.first().cloned() else {
            self.numeric(
                id,
                "461",
                vec!["MODE".to_string(), "Not enough parameters".to_string()],
            );
            return;
        };
        let Some(uid) = self.uid_of(id) else {
            return;
        };

        if target.starts_with('#') || target.starts_with('&') {
            let canonical = casefold(&target);
            if !self.channels.contains_key(&canonical) {
                self.numeric(id, "403", vec![target, "No such channel".to_string()]);
                return;
            }
            if message.params.len() < 2 {
                self.numeric(id, "324", vec![canonical, CHANNEL_MODES.to_string()]);
            } else {
                // Channel modes are fixed on this network.
                self.numeric(
                    id,
                    "482",
                    vec![canonical, "You're not a channel operator".to_string()],
                );
            }
            return;
        }

        let own_nick = self.users.get(&uid).map(|u| u.nick.clone()).unwrap_or_default();
        if casefold(&target) != casefold(&own_nick) {
            self.numeric(
                id,
                "502",
                vec!["Can't change mode for other users".to_string()],
            );
            return;
        }

        if message.params.len() < 2 {
            let modes = self
                .users
                .get(&uid)
                .map(|u| u.modes.format())
                .unwrap_or_default();
            self.numeric(id, "221", vec![modes]);
            return;
        }

        let is_oper = self.opers.contains(&uid);
        let mut applied = String::new();
        let mut polarity = '+';
        let mut applied_polarity = ' ';
        {
            let Some(user) = self.users.get_mut(&uid) else {
                return;
            };
            for c in message.params[1].chars() {
                match c {
                    '+' | '-' => polarity = c,
                    'i' => {
                        let on = polarity == '+';
                        if user.modes.invisible != on {
                            user.modes.invisible = on;
                            if applied_polarity != polarity {
                                applied.push(polarity);
                                applied_polarity = polarity;
                            }
                            applied.push('i');
                        }
                    }
                    'o' => {
                        // +o only ever comes from OPER.
                        if polarity == '-' && user.modes.oper {
                            user.modes.oper = false;
                            if applied_polarity != polarity {
                                applied.push(polarity);
                                applied_polarity = polarity;
                            }
                            applied.push('o');
                        }
                    }
                    'C' => {
                        let on = polarity == '+';
                        if is_oper && user.modes.conn_notices != on {
                            user.modes.conn_notices = on;
                            if applied_polarity != polarity {
                                applied.push(polarity);
                                applied_polarity = polarity;
                            }
                            applied.push('C');
                        }
                    }
                    _ => {}
                }
            }
        }

        if applied.is_empty() {
            return;
        }
        if applied.contains('o') {
            self.opers.remove(&uid);
        }
        if let Some(conn) = self.local_user_conn(uid) {
            conn.send(&Message::with_source(
                own_nick.clone(),
                "MODE",
                vec![own_nick, applied.clone()],
            ));
        }
        self.broadcast_to_peers(&Message::with_source(
            uid.to_string(),
            "MODE",
            vec![uid.to_string(), applied],
        ));
    }

    fn user_oper(&mut self, id: ClientId, message: Message) {
        if message.params.len() < 2 {
            self.numeric(
                id,
                "461",
                vec!["OPER".to_string(), "Not enough parameters".to_string()],
            );
            return;
        }
        let Some(uid) = self.uid_of(id) else {
            return;
        };
        if self.config.opers.get(&message.params[0]) != Some(&message.params[1]) {
            self.numeric(id, "464", vec!["Password incorrect".to_string()]);
            return;
        }
        if self.opers.contains(&uid) {
            self.numeric(id, "381", vec!["You are now an IRC operator".to_string()]);
            return;
        }

        let nick = match self.users.get_mut(&uid) {
            Some(user) => {
                user.modes.oper = true;
                user.nick.clone()
            }
            None => return,
        };
        self.opers.insert(uid);

        self.numeric(id, "381", vec!["You are now an IRC operator".to_string()]);
        if let Some(conn) = self.local_user_conn(uid) {
            conn.send(&Message::with_source(
                nick.clone(),
                "MODE",
                vec![nick.clone(), "+o".to_string()],
            ));
        }
        self.broadcast_to_peers(&Message::with_source(
            uid.to_string(),
            "MODE",
            vec![uid.to_string(), "+o".to_string()],
        ));
        self.notice_opers(&format!("{} became an operator.", nick));
    }

    fn user_whois(&mut self, id: ClientId, message: Message) {
        let Some(target) = message.params.first().cloned() else {
            self.numeric(
                id,
                "461",
                vec!["WHOIS".to_string(), "Not enough parameters".to_string()],
            );
            return;
        };
        let Some(uid) = self.uid_of(id) else {
            return;
        };
        let Some(&target_uid) = self.nicks.get(&casefold(&target)) else {
            self.numeric(
                id,
                "401",
                vec![target.clone(), "No such nick/channel".to_string()],
            );
            self.numeric(id, "318", vec![target, "End of WHOIS list".to_string()]);
            return;
        };

        let target_is_local = self
            .users
            .get(&target_uid)
            .is_some_and(|u| u.is_local());
        if target_is_local {
            let replies = self.create_whois_response(target_uid, uid, false);
            if let Some(conn) = self.local_user_conn(uid) {
                for reply in &replies {
                    conn.send(reply);
                }
            }
        } else {
            self.send_toward_user(
                target_uid,
                &Message::with_source(
                    uid.to_string(),
                    "WHOIS",
                    vec![target_uid.to_string(), target],
                ),
            );
        }
    }

    fn user_invite(&mut self, id: ClientId, message: Message) {
        if message.params.len() < 2 {
            self.numeric(
                id,
                "461",
                vec!["INVITE".to_string(), "Not enough parameters".to_string()],
            );
            return;
        }
        let Some(uid) = self.uid_of(id) else {
            return;
        };
        let target = message.params[0].clone();
        let Some(&target_uid) = self.nicks.get(&casefold(&target)) else {
            self.numeric(
                id,
                "401",
                vec![target, "No such nick/channel".to_string()],
            );
            return;
        };
        let canonical = casefold(&message.params[1]);
        let Some(channel) = self.channels.get(&canonical) else {
            self.numeric(
                id,
                "403",
                vec![message.params[1].clone(), "No such channel".to_string()],
            );
            return;
        };
        if !channel.members.contains(&uid) {
            self.numeric(
                id,
                "442",
                vec![canonical, "You're not on that channel".to_string()],
            );
            return;
        }
        if channel.members.contains(&target_uid) {
            let target_nick = self
                .users
                .get(&target_uid)
                .map(|u| u.nick.clone())
                .unwrap_or(target);
            self.numeric(
                id,
                "443",
                vec![target_nick, canonical, "is already on channel".to_string()],
            );
            return;
        }
        let chan_ts = channel.ts;

        let target_nick = self
            .users
            .get(&target_uid)
            .map(|u| u.nick.clone())
            .unwrap_or_default();
        self.numeric(id, "341", vec![target_nick.clone(), canonical.clone()]);

        let target_is_local = self
            .users
            .get(&target_uid)
            .is_some_and(|u| u.is_local());
        if target_is_local {
            let mask = self
                .users
                .get(&uid)
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
            self.send_toward_user(
                target_uid,
                &Message::with_source(
                    uid.to_string(),
                    "INVITE",
                    vec![target_uid.to_string(), canonical, chan_ts.to_string()],
                ),
            );
        }
    }

    fn user_kill(&mut self, id: ClientId, message: Message) {
        if !self.is_oper_client(id) {
            self.numeric(id, "481", vec!["You're not an IRC operator".to_string()]);
            return;
        }
        let Some(target) = message.params.first().cloned() else {
            self.numeric(
                id,
                "461",
                vec!["KILL".to_string(), "Not enough parameters".to_string()],
            );
            return;
        };
        let Some(&target_uid) = self.nicks.get(&casefold(&target)) else {
            self.numeric(
                id,
                "401",
                vec![target, "No such nick/channel".to_string()],
            );
            return;
        };
        let reason = message
            .params
            .get(1)
            .cloned()
            .unwrap_or_else(|| "<No reason given>".to_string());
        let by = self.uid_of(id);
        self.issue_kill(by, target_uid, &reason);
    }

    fn user_kline(&mut self, id: ClientId, message: Message) {
        if !self.is_oper_client(id) {
            self.numeric(id, "481", vec!["You're not an IRC operator".to_string()]);
            return;
        }
        let Some(mask) = message.params.first() else {
            self.numeric(
                id,
                "461",
                vec!["KLINE".to_string(), "Not enough parameters".to_string()],
            );
            return;
        };
        let (user_mask, host_mask) = split_user_host(mask);
        let reason = message
            .params
            .get(1)
            .cloned()
            .unwrap_or_else(|| "<No reason given>".to_string());
        let Some(uid) = self.uid_of(id) else {
            return;
        };
        let nick = self
            .users
            .get(&uid)
            .map(|u| u.nick.clone())
            .unwrap_or_default();

        self.broadcast_to_peers(&Message::with_source(
            uid.to_string(),
            "ENCAP",
            vec![
                "*".to_string(),
                "KLINE".to_string(),
                "0".to_string(),
                user_mask.clone(),
                host_mask.clone(),
                reason.clone(),
            ],
        ));
        self.add_and_apply_kline(
            KLine {
                user_mask: Pattern::new(user_mask),
                host_mask: Pattern::new(host_mask),
                reason,
            },
            &nick,
        );
    }

    fn user_unkline(&mut self, id: ClientId, message: Message) {
        if !self.is_oper_client(id) {
            self.numeric(id, "481", vec!["You're not an IRC operator".to_string()]);
            return;
        }
        let Some(mask) = message.params.first() else {
            self.numeric(
                id,
                "461",
                vec!["UNKLINE".to_string(), "Not enough parameters".to_string()],
            );
            return;
        };
        let (user_mask, host_mask) = split_user_host(mask);
        let Some(uid) = self.uid_of(id) else {
            return;
        };
        let nick = self
            .users
            .get(&uid)
            .map(|u| u.nick.clone())
            .unwrap_or_default();

        self.broadcast_to_peers(&Message::with_source(
            uid.to_string(),
            "ENCAP",
            vec![
                "*".to_string(),
                "UNKLINE".to_string(),
                user_mask.clone(),
                host_mask.clone(),
            ],
        ));
        self.remove_kline(&user_mask, &host_mask, &nick);
    }

    fn user_wallops(&mut self, id: ClientId, message: Message) {
        if !self.is_oper_client(id) {
            self.numeric(id, "481", vec!["You're not an IRC operator".to_string()]);
            return;
        }
        let Some(text) = message.params.first().cloned() else {
            self.numeric(
                id,
                "461",
                vec![message.command.clone(), "Not enough parameters".to_string()],
            );
            return;
        };
        let Some(uid) = self.uid_of(id) else {
            return;
        };
        let mask = self
            .users
            .get(&uid)
            .map(|u| u.nickmask())
            .unwrap_or_default();

        let deliver = Message::with_source(mask, "WALLOPS", vec![text.clone()]);
        for oper_uid in &self.opers {
            if let Some(conn) = self.local_user_conn(*oper_uid) {
                conn.send(&deliver);
            }
        }
        self.broadcast_to_peers(&Message::with_source(
            uid.to_string(),
            "WALLOPS",
            vec![text],
        ));
    }

    fn user_rehash(&mut self, id: ClientId) {
        if !self.is_oper_client(id) {
            self.numeric(id, "481", vec!["You're not an IRC operator".to_string()]);
            return;
        }
        self.numeric(id, "382", vec!["minnow.conf".to_string(), "Rehashing".to_string()]);
        let by = self.uid_of(id);
        self.rehash(by);
    }
}

/// Split a `user@host` mask; a bare mask is a host mask.
fn split_user_host(mask: &str) -> (String, String) {
    match mask.split_once('@') {
        Some((user, host)) => (user.to_string(), host.to_string()),
        None => ("*".to_string(), mask.to_string()),
    }
}
