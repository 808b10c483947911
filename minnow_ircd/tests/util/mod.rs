//! Test fixture: an `Ircd` with in-memory connections, driven synchronously
//! through `handle_event` with no sockets anywhere.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::Ordering;

use tokio::sync::mpsc;

use minnow_proto::{casefold, Message, Sid, Uid};

use minnow_ircd::config::{Config, LinkConfig};
use minnow_ircd::connection::{ClientId, Connection};
use minnow_ircd::event::{Event, NewClient};
use minnow_ircd::Ircd;

pub const LINK_PASS: &str = "sekrit";

pub fn test_config(name: &str, sid: &str) -> Config {
    Config {
        server_name: name.to_string(),
        ts6_sid: Sid::new(sid).unwrap(),
        server_info: format!("{} test server", name),
        listen_host: "127.0.0.1".to_string(),
        listen_port: Some(6667),
        listen_port_tls: None,
        certificate_file: None,
        key_file: None,
        ping_time: 30,
        dead_time: 240,
        connect_attempt_time: 60,
        max_nick_length: 15,
        motd: None,
        opers: HashMap::from([("oper".to_string(), "operpass".to_string())]),
        servers: Vec::new(),
        user_configs: Vec::new(),
    }
}

pub struct Net {
    pub ircd: Ircd,
    outbound: HashMap<ClientId, mpsc::Receiver<String>>,
}

impl Net {
    pub fn new(name: &str, sid: &str) -> Self {
        Self {
            ircd: Ircd::new(test_config(name, sid), None).unwrap(),
            outbound: HashMap::new(),
        }
    }

    /// Attach a fresh in-memory connection; its outbound queue stays
    /// readable through [`Net::drain`].
    pub fn connect(&mut self) -> ClientId {
        let id = self.ircd.next_client_id().fetch_add(1, Ordering::Relaxed);
        let (conn, rx) = Connection::open(id, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), false);
        self.outbound.insert(id, rx.outbound);
        self.ircd
            .handle_event(Event::NewClient(NewClient { conn, link: None }));
        id
    }

    /// Feed one wire line to the event loop as if the connection read it.
    pub fn line(&mut self, id: ClientId, line: &str) {
        let message = Message::parse(line).expect("test fed an unparseable line");
        self.ircd.handle_event(Event::Message(id, message));
    }

    /// Everything queued for this connection since the last drain.
    pub fn drain(&mut self, id: ClientId) -> Vec<String> {
        let mut lines = Vec::new();
        if let Some(rx) = self.outbound.get_mut(&id) {
            while let Ok(line) = rx.try_recv() {
                lines.push(line.trim_end().to_string());
            }
        }
        lines
    }

    /// Register a local user and hand back its connection id and UID.
    pub fn add_user(&mut self, nick: &str) -> (ClientId, Uid) {
        let id = self.connect();
        self.line(id, &format!("NICK {}", nick));
        self.line(id, &format!("USER {} 0 * :{} Real", nick, nick));
        let uid = Uid::mint(self.ircd.config.ts6_sid, id);
        assert!(self.ircd.users.contains_key(&uid), "user failed to register");
        self.drain(id);
        (id, uid)
    }

    /// Link a peer server end-to-end: configure the link, run the inbound
    /// handshake, and discard the handshake and burst output.
    pub fn add_peer(&mut self, name: &str, sid: &str) -> ClientId {
        let id = self.add_peer_keep_output(name, sid);
        self.drain(id);
        id
    }

    /// Like [`Net::add_peer`] but leaves the handshake and burst queued so
    /// the test can inspect them.
    pub fn add_peer_keep_output(&mut self, name: &str, sid: &str) -> ClientId {
        self.allow_link(name);
        let id = self.connect();
        self.line(id, &format!("PASS {} TS 6 {}", LINK_PASS, sid));
        self.line(id, "CAPAB :QS ENCAP TB");
        self.line(id, &format!("SERVER {} 1 :{} description", name, name));
        self.line(id, &format!("SVINFO 6 6 0 :{}", epoch_now()));
        assert!(
            self.ircd.local_servers.contains_key(&id),
            "peer failed to register"
        );
        id
    }

    pub fn allow_link(&mut self, name: &str) {
        if self.ircd.config.find_link(name).is_none() {
            self.ircd.config.servers.push(LinkConfig {
                name: name.to_string(),
                hostname: "10.0.0.2".to_string(),
                port: 7000,
                pass: LINK_PASS.to_string(),
                tls: false,
            });
        }
    }

    pub fn tick(&mut self) {
        self.ircd.handle_event(Event::Tick);
    }
}

pub fn epoch_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

/// The universal invariants every reachable state must satisfy.
pub fn check_invariants(ircd: &Ircd) {
    for (client_id, local_server) in &ircd.local_servers {
        let server = ircd
            .servers
            .get(&local_server.sid)
            .expect("local server has a Server entry");
        assert_eq!(server.local_id, Some(*client_id));
    }
    for server in ircd.servers.values() {
        if let Some(local_id) = server.local_id {
            assert!(ircd.local_servers.contains_key(&local_id));
        }
    }

    for (client_id, local_user) in &ircd.local_users {
        let user = ircd
            .users
            .get(&local_user.uid)
            .expect("local user has a User entry");
        assert_eq!(user.local_id, Some(*client_id));
    }

    for (key, uid) in &ircd.nicks {
        let user = ircd.users.get(uid).expect("nick maps to a live user");
        assert_eq!(&casefold(&user.nick), key);
    }

    for user in ircd.users.values() {
        assert_eq!(ircd.nicks.get(&casefold(&user.nick)), Some(&user.uid));
        assert_eq!(ircd.opers.contains(&user.uid), user.modes.oper);
        for chan_name in &user.channels {
            let channel = ircd
                .channels
                .get(chan_name)
                .expect("membership names a live channel");
            assert!(channel.members.contains(&user.uid));
        }
    }

    for channel in ircd.channels.values() {
        assert!(!channel.members.is_empty(), "empty channel survived");
        for member in &channel.members {
            let user = ircd.users.get(member).expect("member is a live user");
            assert!(user.channels.contains(&channel.name));
        }
    }
}

/// Count the drained lines whose command matches.
pub fn count_command(lines: &[String], command: &str) -> usize {
    lines
        .iter()
        .filter_map(|line| Message::parse(line).ok())
        .filter(|m| m.command == command)
        .count()
}

/// The parsed messages among drained lines with the given command.
pub fn messages_with_command(lines: &[String], command: &str) -> Vec<Message> {
    lines
        .iter()
        .filter_map(|line| Message::parse(line).ok())
        .filter(|m| m.command == command)
        .collect()
}
