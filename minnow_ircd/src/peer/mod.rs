//! Directly-linked peer servers: promotion, dispatch, link teardown, and
//! split cleanup. The per-command handlers live in [`commands`]; the burst
//! sender in [`burst`].

mod burst;
mod commands;

pub use burst::sjoin_frames;

use std::collections::HashSet;

use minnow_proto::{Message, Sid, Uid};

use crate::connection::{ClientId, Connection};
use crate::ircd::Ircd;
use crate::state::Server;
use crate::utils::now;

/// The capabilities we advertise during a link handshake. QS and ENCAP are
/// mandatory for the protocol; TB lets a peer burst topics to us.
pub const OUR_CAPABS: &[&str] = &["QS", "ENCAP", "TB"];

/// A connection registered as a server.
#[derive(Debug)]
pub struct LocalServer {
    pub conn: Connection,
    pub sid: Sid,
    pub name: String,
    pub capabs: HashSet<String>,

    /// Burst completion handshake: we expect one PING from the peer and one
    /// PONG answering ours. Both seen means the burst is over.
    pub bursting: bool,
    pub got_ping: bool,
    pub got_pong: bool,

    pub last_activity: i64,
    pub last_ping: i64,
    pub start: i64,
}

impl LocalServer {
    pub fn has_capab(&self, name: &str) -> bool {
        self.capabs.contains(name)
    }
}

impl Ircd {
    /// SVINFO checked out: the pre-registration client becomes a peer
    /// server, gets our burst, and is announced to operators.
    pub(crate) fn promote_to_server(&mut self, id: ClientId) {
        let Some(client) = self.clients.remove(&id) else {
            return;
        };
        let (pre_pass, pre_server) = match (client.pre_pass, client.pre_server) {
            (Some(pass), Some(server)) => (pass, server),
            _ => return,
        };

        let sid = pre_pass.sid;
        let registered_at = now();
        let description = pre_server.description.clone();
        self.servers.insert(
            sid,
            Server {
                sid,
                name: pre_server.name.clone(),
                description: pre_server.description,
                hops: 1,
                linked_to: None,
                closest: None,
                local_id: Some(id),
                capabs: Some(client.pre_capabs.clone()),
            },
        );
        self.local_servers.insert(
            id,
            LocalServer {
                conn: client.conn,
                sid,
                name: pre_server.name.clone(),
                capabs: client.pre_capabs,
                bursting: true,
                got_ping: false,
                got_pong: false,
                last_activity: registered_at,
                last_ping: registered_at,
                start: client.start,
            },
        );

        self.notice_opers(&format!("Established link with {}.", pre_server.name));

        // Introduce the new link to the rest of the network.
        let sid_intro = Message::with_source(
            self.config.ts6_sid.to_string(),
            "SID",
            vec![
                pre_server.name.clone(),
                "2".to_string(),
                sid.to_string(),
                description,
            ],
        );
        self.propagate(id, &sid_intro);
        let capabs = self
            .servers
            .get(&sid)
            .map(|s| s.capabs_string())
            .unwrap_or_default();
        if !capabs.is_empty() {
            let gcap = Message::with_source(
                sid.to_string(),
                "ENCAP",
                vec!["*".to_string(), "GCAP".to_string(), capabs],
            );
            self.propagate(id, &gcap);
        }

        self.send_burst(id);

        // Close our burst with a PING; the peer's PONG completes our half of
        // the handshake.
        if let Some(peer) = self.local_servers.get(&id) {
            peer.conn.send(&Message::with_source(
                self.config.ts6_sid.to_string(),
                "PING",
                vec![self.config.server_name.clone(), sid.to_string()],
            ));
        }
    }

    /// Every inbound server message lands here: stamp activity, default the
    /// source to the peer's SID, dispatch.
    pub(crate) fn handle_server_message(&mut self, id: ClientId, mut message: Message) {
        let peer_sid = {
            let Some(peer) = self.local_servers.get_mut(&id) else {
                return;
            };
            peer.last_activity = now();
            peer.sid
        };
        if message.source.is_none() {
            message.source = Some(peer_sid.to_string());
        }

        match message.command.as_str() {
            "PING" => self.server_ping(id, message),
            "PONG" => self.server_pong(id, message),
            "ERROR" => self.terminate_peer(id, "Bye"),
            "UID" => self.server_uid(id, message),
            "PRIVMSG" | "NOTICE" => self.server_privmsg(id, message),
            "SID" => self.server_sid(id, message),
            "SJOIN" => self.server_sjoin(id, message),
            "TB" => self.server_tb(id, message),
            "JOIN" => self.server_join(id, message),
            "NICK" => self.server_nick(id, message),
            "PART" => self.server_part(id, message),
            "WALLOPS" | "OPERWALL" => self.server_wallops(id, message),
            "QUIT" => self.server_quit(id, message),
            "MODE" => self.server_mode(id, message),
            "TOPIC" => self.server_topic(id, message),
            "SQUIT" => self.server_squit(id, message),
            "KILL" => self.server_kill(id, message),
            "ENCAP" => self.server_encap(id, message),
            "WHOIS" => self.server_whois(id, message),
            "AWAY" => self.server_away(id, message),
            "INVITE" => self.server_invite(id, message),
            "CLICONN" => self.propagate(id, &message),
            _ if message.is_numeric() => self.server_numeric(id, message),
            _ => {
                self.peer_numeric(
                    id,
                    "421",
                    vec![message.command.clone(), "Unknown command".to_string()],
                );
            }
        }
    }

    /// Reply to a peer in its own terms: our SID as source, and for numerics
    /// the peer's SID as the target parameter.
    pub(crate) fn peer_numeric(&self, id: ClientId, code: &str, params: Vec<String>) {
        let Some(peer) = self.local_servers.get(&id) else {
            return;
        };
        let mut full = Vec::with_capacity(params.len() + 1);
        full.push(peer.sid.to_string());
        full.extend(params);
        peer.conn.send(&Message::with_source(
            self.config.ts6_sid.to_string(),
            code,
            full,
        ));
    }

    /// Route a message toward the peer closest to a (remote) user.
    pub(crate) fn send_toward_user(&self, uid: Uid, message: &Message) {
        if let Some(peer) = self
            .users
            .get(&uid)
            .and_then(|u| u.closest)
            .and_then(|id| self.local_servers.get(&id))
        {
            peer.conn.send(message);
        }
    }

    /// Tear down a direct link: tell the peer why, clean up everything on
    /// the far side, and announce the SQUIT to the survivors.
    pub(crate) fn terminate_peer(&mut self, id: ClientId, reason: &str) {
        let Some(peer) = self.local_servers.remove(&id) else {
            return;
        };
        peer.conn.send(&Message::with_source(
            self.config.ts6_sid.to_string(),
            "ERROR",
            vec![reason.to_string()],
        ));
        peer.conn.close();

        self.server_split_cleanup(peer.sid);

        let squit = Message::with_source(
            self.config.ts6_sid.to_string(),
            "SQUIT",
            vec![peer.sid.to_string(), reason.to_string()],
        );
        self.broadcast_to_peers(&squit);

        self.notice_local_opers(&format!("Server {} delinked: {}", peer.name, reason));
    }

    /// A server is leaving, taking everything behind it. Synthesize netsplit
    /// QUITs for local observers and forget the lost servers and users. No
    /// server-to-server messages are emitted here; the caller announces the
    /// SQUIT.
    pub(crate) fn server_split_cleanup(&mut self, lost_sid: Sid) {
        let Some(root) = self.servers.get(&lost_sid) else {
            return;
        };
        let upstream_name = root
            .linked_to
            .and_then(|sid| self.servers.get(&sid))
            .map(|s| s.name.clone())
            .unwrap_or_else(|| self.config.server_name.clone());
        let lost_name = root.name.clone();
        let quit_text = format!("{} {}", upstream_name, lost_name);

        // Transitive closure over link-to chains.
        let mut lost: HashSet<Sid> = HashSet::new();
        lost.insert(lost_sid);
        loop {
            let mut grew = false;
            for server in self.servers.values() {
                if let Some(linked_to) = server.linked_to {
                    if lost.contains(&linked_to) && lost.insert(server.sid) {
                        grew = true;
                    }
                }
            }
            if !grew {
                break;
            }
        }

        let lost_users: Vec<Uid> = self
            .users
            .values()
            .filter(|u| !u.is_local() && lost.contains(&u.server))
            .map(|u| u.uid)
            .collect();
        for uid in lost_users {
            tracing::info!(%uid, "losing user in split");
            self.quit_remote_user(uid, &quit_text);
        }

        for sid in lost {
            if let Some(server) = self.servers.remove(&sid) {
                tracing::info!(name = %server.name, "losing server in split");
                if let Some(local_id) = server.local_id {
                    self.local_servers.remove(&local_id);
                }
            }
        }
    }
}
