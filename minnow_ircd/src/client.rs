//! Pre-registration clients.
//!
//! A freshly accepted (or dialed) connection sits here until it proves
//! itself to be either an end-user (NICK + USER) or a peer server
//! (PASS + CAPAB + SERVER + SVINFO), then its id migrates to the
//! corresponding map. Anything that goes wrong before promotion closes the
//! connection.

use std::collections::HashSet;

use minnow_proto::{casefold, names, Message, Sid, Uid};

use crate::connection::{ClientId, Connection};
use crate::ircd::Ircd;
use crate::state::{Pattern, User, UserModes};
use crate::throttle::MessageThrottle;
use crate::user::LocalUser;
use crate::utils::now;

/// The contents of a PASS message on the server path.
#[derive(Debug)]
pub struct PrePass {
    pub password: String,
    pub sid: Sid,
}

/// The contents of a SERVER message, pending SVINFO.
#[derive(Debug)]
pub struct PreServer {
    pub name: String,
    pub description: String,
}

/// A connection that has not registered yet.
#[derive(Debug)]
pub struct LocalClient {
    pub conn: Connection,
    /// Epoch seconds at connection establishment; unregistered connections
    /// only get one ping window to finish registering.
    pub start: i64,
    /// Set when we dialed this connection for a configured link.
    pub link: Option<String>,
    /// Whether our own PASS/CAPAB/SERVER introduction has been sent.
    pub sent_intro: bool,

    pub pre_nick: Option<String>,
    /// Username and real name from USER.
    pub pre_user: Option<(String, String)>,

    pub pre_pass: Option<PrePass>,
    pub pre_capabs: HashSet<String>,
    pub pre_server: Option<PreServer>,
}

impl LocalClient {
    pub fn new(conn: Connection, link: Option<String>) -> Self {
        let sent_intro = link.is_some();
        Self {
            conn,
            start: now(),
            link,
            sent_intro,
            pre_nick: None,
            pre_user: None,
            pre_pass: None,
            pre_capabs: HashSet::new(),
            pre_server: None,
        }
    }
}

impl Ircd {
    pub(crate) fn handle_client_message(&mut self, id: ClientId, message: Message) {
        match message.command.as_str() {
            "NICK" => self.preclient_nick(id, message),
            "USER" => self.preclient_user(id, message),
            "PASS" => self.preclient_pass(id, message),
            "CAPAB" => self.preclient_capab(id, message),
            "SERVER" => self.preclient_server(id, message),
            "SVINFO" => self.preclient_svinfo(id, message),
            "PING" => self.preclient_ping(id, message),
            "QUIT" => self.quit_pre_client(id, "Client Quit"),
            "ERROR" => self.quit_pre_client(id, "Bye"),
            _ => {
                self.client_numeric(id, "451", vec!["You have not registered".to_string()]);
            }
        }
    }

    fn preclient_ping(&self, id: ClientId, message: Message) {
        let Some(client) = self.clients.get(&id) else {
            return;
        };
        let token = message
            .params
            .first()
            .cloned()
            .unwrap_or_else(|| self.config.server_name.clone());
        client.conn.send(&Message::with_source(
            self.config.server_name.clone(),
            "PONG",
            vec![self.config.server_name.clone(), token],
        ));
    }

    // User path

    fn preclient_nick(&mut self, id: ClientId, message: Message) {
        let Some(nick) = message.params.first().cloned() else {
            self.client_numeric(id, "431", vec!["No nickname given".to_string()]);
            return;
        };
        if !names::is_valid_nick(self.config.max_nick_length, &nick) {
            self.client_numeric(id, "432", vec![nick, "Erroneous nickname".to_string()]);
            return;
        }
        if self.nicks.contains_key(&casefold(&nick)) {
            self.client_numeric(id, "433", vec![nick, "Nickname is already in use".to_string()]);
            return;
        }
        if let Some(client) = self.clients.get_mut(&id) {
            client.pre_nick = Some(nick);
        }
        self.maybe_register_user(id);
    }

    fn preclient_user(&mut self, id: ClientId, message: Message) {
        if message.params.len() < 4 {
            self.client_numeric(
                id,
                "461",
                vec!["USER".to_string(), "Not enough parameters".to_string()],
            );
            return;
        }
        if self.clients.get(&id).is_some_and(|c| c.pre_user.is_some()) {
            self.client_numeric(id, "462", vec!["You may not reregister".to_string()]);
            return;
        }
        let username = message.params[0].clone();
        if !names::is_valid_username(&username) {
            self.quit_pre_client(id, "Invalid username");
            return;
        }
        let realname = message.params[3].clone();
        if !names::is_valid_realname(&realname) {
            self.quit_pre_client(id, "Invalid real name");
            return;
        }
        if let Some(client) = self.clients.get_mut(&id) {
            client.pre_user = Some((username, realname));
        }
        self.maybe_register_user(id);
    }

    fn maybe_register_user(&mut self, id: ClientId) {
        let ready = self
            .clients
            .get(&id)
            .is_some_and(|c| c.pre_nick.is_some() && c.pre_user.is_some());
        if ready {
            self.register_user(id);
        }
    }

    /// NICK and USER are both in: make a network-visible user out of this
    /// connection.
    fn register_user(&mut self, id: ClientId) {
        let Some(client) = self.clients.get(&id) else {
            return;
        };
        let nick = client.pre_nick.clone().expect("checked by caller");
        let (username, realname) = client.pre_user.clone().expect("checked by caller");
        let hostname = client.conn.remote_addr.to_string();
        let ip = hostname.clone();

        if let Some(kline) = self
            .klines
            .iter()
            .find(|k| k.matches(&username, &hostname))
        {
            let reason = format!("Connection closed: {}", kline.reason);
            self.quit_pre_client(id, &reason);
            return;
        }

        let client = self.clients.remove(&id).expect("probed above");
        let uid = Uid::mint(self.config.ts6_sid, id);
        let registered_at = now();

        let flood_exempt = self.config.user_configs.iter().any(|uc| {
            uc.flood_exempt
                && Pattern::new(uc.user_mask.clone()).matches(&username)
                && Pattern::new(uc.host_mask.clone()).matches(&hostname)
        });

        let user = User {
            uid,
            nick: nick.clone(),
            nick_ts: registered_at,
            hops: 0,
            username: username.clone(),
            hostname: hostname.clone(),
            ip: ip.clone(),
            realname: realname.clone(),
            modes: UserModes {
                invisible: true,
                ..Default::default()
            },
            away: None,
            channels: HashSet::new(),
            server: self.config.ts6_sid,
            closest: None,
            local_id: Some(id),
        };
        self.nicks.insert(casefold(&nick), uid);
        self.users.insert(uid, user);
        self.local_users.insert(
            id,
            LocalUser {
                conn: client.conn,
                uid,
                last_activity: registered_at,
                last_ping: registered_at,
                last_message: registered_at,
                signon: registered_at,
                throttle: MessageThrottle::new(),
                flood_exempt,
            },
        );

        tracing::info!(id, %uid, %nick, "user registered");

        // Welcome burst.
        self.numeric(
            id,
            "001",
            vec![format!(
                "Welcome to the Internet Relay Chat Network {}",
                nick
            )],
        );
        self.numeric(
            id,
            "002",
            vec![format!(
                "Your host is {}, running version minnow-{}",
                self.config.server_name,
                env!("CARGO_PKG_VERSION")
            )],
        );
        self.numeric(
            id,
            "003",
            vec![format!("This server was created {}", self.started)],
        );
        self.numeric(
            id,
            "004",
            vec![
                self.config.server_name.clone(),
                format!("minnow-{}", env!("CARGO_PKG_VERSION")),
                "Cio".to_string(),
                "ns".to_string(),
            ],
        );
        let invisible = self
            .users
            .values()
            .filter(|u| u.modes.invisible)
            .count();
        self.numeric(
            id,
            "251",
            vec![format!(
                "There are {} users and {} invisible on {} servers",
                self.users.len() - invisible,
                invisible,
                self.servers.len() + 1
            )],
        );
        self.send_motd(id);
        if let Some(local_user) = self.local_users.get(&id) {
            local_user.conn.send(&Message::with_source(
                nick.clone(),
                "MODE",
                vec![nick.clone(), "+i".to_string()],
            ));
        }

        // Introduce the user to the network.
        let uid_message = Message::with_source(
            self.config.ts6_sid.to_string(),
            "UID",
            vec![
                nick.clone(),
                "1".to_string(),
                registered_at.to_string(),
                "+i".to_string(),
                username.clone(),
                hostname.clone(),
                ip.clone(),
                uid.to_string(),
                realname.clone(),
            ],
        );
        self.broadcast_to_peers(&uid_message);
        let cliconn = Message::with_source(
            self.config.ts6_sid.to_string(),
            "CLICONN",
            vec![
                nick.clone(),
                username.clone(),
                hostname.clone(),
                ip.clone(),
                realname.clone(),
            ],
        );
        self.broadcast_to_peers(&cliconn);
        self.notify_conn_opers(&format!(
            "CLICONN {} {} {} {} {} ({})",
            nick, username, hostname, ip, realname, self.config.server_name
        ));
    }

    pub(crate) fn send_motd(&self, id: ClientId) {
        if self.motd.is_empty() {
            self.numeric(id, "422", vec!["MOTD File is missing".to_string()]);
            return;
        }
        self.numeric(
            id,
            "375",
            vec![format!("- {} Message of the day - ", self.config.server_name)],
        );
        for line in &self.motd {
            self.numeric(id, "372", vec![format!("- {}", line)]);
        }
        self.numeric(id, "376", vec!["End of /MOTD command.".to_string()]);
    }

    // Server path

    fn preclient_pass(&mut self, id: ClientId, message: Message) {
        let already = match self.clients.get(&id) {
            Some(client) => client.pre_pass.is_some() || client.pre_server.is_some(),
            None => return,
        };
        if already {
            self.quit_pre_client(id, "Protocol sequencing error (PASS)");
            return;
        }
        if message.params.len() < 4
            || !message.params[1].eq_ignore_ascii_case("TS")
            || message.params[2] != "6"
        {
            self.quit_pre_client(id, "Invalid PASS");
            return;
        }
        let Ok(sid) = Sid::new(&message.params[3]) else {
            self.quit_pre_client(id, "Invalid SID (PASS)");
            return;
        };
        if let Some(client) = self.clients.get_mut(&id) {
            client.pre_pass = Some(PrePass {
                password: message.params[0].clone(),
                sid,
            });
        }
    }

    fn preclient_capab(&mut self, id: ClientId, message: Message) {
        if message.params.is_empty() {
            self.client_numeric(
                id,
                "461",
                vec!["CAPAB".to_string(), "Not enough parameters".to_string()],
            );
            return;
        }
        if let Some(client) = self.clients.get_mut(&id) {
            for param in &message.params {
                for capab in param.split_whitespace() {
                    client.pre_capabs.insert(capab.to_string());
                }
            }
        }
    }

    fn preclient_server(&mut self, id: ClientId, message: Message) {
        if message.params.len() < 3 {
            self.quit_pre_client(id, "Invalid SERVER");
            return;
        }
        let name = message.params[0].clone();
        let description = message.params[2].clone();

        let (pre_pass, has_qs, has_encap, server_seen, sent_intro) = {
            let Some(client) = self.clients.get(&id) else {
                return;
            };
            (
                client
                    .pre_pass
                    .as_ref()
                    .map(|p| (p.password.clone(), p.sid)),
                client.pre_capabs.contains("QS"),
                client.pre_capabs.contains("ENCAP"),
                client.pre_server.is_some(),
                client.sent_intro,
            )
        };

        if server_seen {
            self.quit_pre_client(id, "Protocol sequencing error (SERVER)");
            return;
        }
        let Some((password, sid)) = pre_pass else {
            self.quit_pre_client(id, "PASS must precede SERVER");
            return;
        };
        if !names::is_valid_server_name(&name) {
            self.quit_pre_client(id, "Invalid server name");
            return;
        }
        if !has_qs {
            self.quit_pre_client(id, &format!("{} is missing capab QS", name));
            return;
        }
        if !has_encap {
            self.quit_pre_client(id, &format!("{} is missing capab ENCAP", name));
            return;
        }
        let Some(link) = self.config.find_link(&name).cloned() else {
            self.quit_pre_client(id, &format!("Unknown server {}", name));
            return;
        };
        if link.pass != password {
            self.quit_pre_client(id, "Bad password");
            return;
        }
        if sid == self.config.ts6_sid || self.servers.contains_key(&sid) {
            self.quit_pre_client(id, "SID collision");
            return;
        }
        if self.is_linked_to_server(&name) {
            self.quit_pre_client(id, &format!("Already linked to {}", name));
            return;
        }

        let intro = (!sent_intro).then(|| self.server_intro(&link.pass));
        let svinfo = Message::new(
            "SVINFO",
            vec![
                "6".to_string(),
                "6".to_string(),
                "0".to_string(),
                now().to_string(),
            ],
        );

        let Some(client) = self.clients.get_mut(&id) else {
            return;
        };
        client.pre_server = Some(PreServer { name, description });
        client.sent_intro = true;
        let conn = client.conn.clone();

        if let Some(messages) = intro {
            for message in &messages {
                conn.send(message);
            }
        }
        conn.send(&svinfo);
    }

    fn preclient_svinfo(&mut self, id: ClientId, message: Message) {
        let has_server = match self.clients.get(&id) {
            Some(client) => client.pre_server.is_some(),
            None => return,
        };
        if !has_server {
            self.quit_pre_client(id, "Protocol sequencing error (SVINFO)");
            return;
        }
        if message.params.len() < 4 {
            self.quit_pre_client(id, "Invalid SVINFO");
            return;
        }
        if message.params[0] != "6" {
            self.quit_pre_client(id, "Unsupported TS version");
            return;
        }
        let Ok(their_time) = message.params[3].parse::<i64>() else {
            self.quit_pre_client(id, "Invalid TS (SVINFO)");
            return;
        };
        if (now() - their_time).abs() > self.config.dead_time as i64 {
            self.quit_pre_client(id, "Excessive TS skew");
            return;
        }
        self.promote_to_server(id);
    }
}
