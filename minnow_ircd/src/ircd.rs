//! The event loop and the network model it owns.
//!
//! `Ircd` is the single mutator of all shared state. Connection tasks,
//! listeners, the ticker, and the signal watcher only ever enqueue events;
//! every state change happens inside [`Ircd::handle_event`], one event at a
//! time.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::select;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, watch};

use minnow_proto::{casefold, Message, Sid, Uid};

use crate::client::LocalClient;
use crate::config::{Config, ConfigError, LinkConfig};
use crate::connection::ClientId;
use crate::event::Event;
use crate::listener;
use crate::peer::LocalServer;
use crate::state::{KLine, Server, User};
use crate::tls::{self, TlsError};
use crate::user::LocalUser;
use crate::utils::now;

/// Depth of the central event queue. Read tasks apply backpressure when it
/// fills.
const EVENT_QUEUE_LEN: usize = 1024;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),
    #[error("bad listen address: {0}")]
    Addr(#[from] std::net::AddrParseError),
    #[error("unable to listen on {0}: {1}")]
    Listen(SocketAddr, std::io::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct Ircd {
    pub config: Config,
    pub motd: Vec<String>,
    config_path: Option<PathBuf>,

    tls_server: Option<Arc<rustls::ServerConfig>>,
    tls_client: Arc<rustls::ClientConfig>,

    /// Minted from every task that creates connections.
    next_client_id: Arc<AtomicU64>,

    event_tx: mpsc::Sender<Event>,
    event_rx: mpsc::Receiver<Event>,
    shutdown_tx: watch::Sender<bool>,

    /// Pre-registration connections.
    pub clients: HashMap<ClientId, LocalClient>,
    /// Connections registered as users.
    pub local_users: HashMap<ClientId, LocalUser>,
    /// Connections registered as servers.
    pub local_servers: HashMap<ClientId, LocalServer>,

    /// Every user on the network, local or remote.
    pub users: HashMap<Uid, User>,
    /// Every other server on the network.
    pub servers: HashMap<Sid, Server>,
    /// Case-folded nick to UID.
    pub nicks: HashMap<String, Uid>,
    /// Users carrying +o.
    pub opers: HashSet<Uid>,
    /// Case-folded channel name to channel.
    pub channels: HashMap<String, crate::state::Channel>,
    pub klines: Vec<KLine>,

    /// Last dial attempt per configured link name.
    link_attempts: HashMap<String, i64>,

    pub started: i64,
}

impl Ircd {
    pub fn new(config: Config, config_path: Option<PathBuf>) -> Result<Self, ServerError> {
        let tls_server = match (&config.certificate_file, &config.key_file) {
            (Some(cert), Some(key)) => Some(tls::build_server_config(cert, key)?),
            _ => None,
        };

        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_LEN);
        let (shutdown_tx, _) = watch::channel(false);
        let motd = config.load_motd();

        Ok(Self {
            config,
            motd,
            config_path,
            tls_server,
            tls_client: tls::build_client_config(),
            next_client_id: Arc::new(AtomicU64::new(0)),
            event_tx,
            event_rx,
            shutdown_tx,
            clients: HashMap::new(),
            local_users: HashMap::new(),
            local_servers: HashMap::new(),
            users: HashMap::new(),
            servers: HashMap::new(),
            nicks: HashMap::new(),
            opers: HashSet::new(),
            channels: HashMap::new(),
            klines: Vec::new(),
            link_attempts: HashMap::new(),
            started: now(),
        })
    }

    pub fn event_sender(&self) -> mpsc::Sender<Event> {
        self.event_tx.clone()
    }

    pub fn next_client_id(&self) -> Arc<AtomicU64> {
        self.next_client_id.clone()
    }

    /// Run until shutdown. Listener binding happens first so startup
    /// failures surface before any event is processed.
    pub async fn run(&mut self) -> Result<(), ServerError> {
        self.start_listeners().await?;
        self.start_ticker();
        self.start_signal_watcher()?;

        tracing::info!(
            name = %self.config.server_name,
            sid = %self.config.ts6_sid,
            "server running"
        );

        loop {
            match self.event_rx.recv().await {
                Some(Event::Shutdown) => {
                    self.shutdown();
                    break;
                }
                Some(event) => self.handle_event(event),
                None => break,
            }
        }

        tracing::info!("server shutdown complete");
        Ok(())
    }

    async fn start_listeners(&self) -> Result<(), ServerError> {
        if let Some(port) = self.config.listen_port {
            let addr: SocketAddr = format!("{}:{}", self.config.listen_host, port).parse()?;
            let sock = tokio::net::TcpListener::bind(addr)
                .await
                .map_err(|e| ServerError::Listen(addr, e))?;
            tracing::info!(%addr, "listening");
            listener::spawn_accept_loop(
                sock,
                None,
                self.config.server_name.clone(),
                self.next_client_id.clone(),
                self.event_tx.clone(),
                self.shutdown_tx.subscribe(),
            );
        }

        if let Some(port) = self.config.listen_port_tls {
            let addr: SocketAddr = format!("{}:{}", self.config.listen_host, port).parse()?;
            let sock = tokio::net::TcpListener::bind(addr)
                .await
                .map_err(|e| ServerError::Listen(addr, e))?;
            tracing::info!(%addr, "listening (TLS)");
            listener::spawn_accept_loop(
                sock,
                self.tls_server.clone(),
                self.config.server_name.clone(),
                self.next_client_id.clone(),
                self.event_tx.clone(),
                self.shutdown_tx.subscribe(),
            );
        }

        Ok(())
    }

    fn start_ticker(&self) {
        let tx = self.event_tx.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                if *shutdown.borrow() {
                    break;
                }
                select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        if tx.send(Event::Tick).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }

    fn start_signal_watcher(&self) -> Result<(), ServerError> {
        let tx = self.event_tx.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut hangup = signal(SignalKind::hangup())?;
        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;
        tokio::spawn(async move {
            loop {
                if *shutdown.borrow() {
                    break;
                }
                select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = hangup.recv() => {
                        tracing::info!("received SIGHUP, rehashing");
                        if tx.send(Event::Rehash).await.is_err() {
                            break;
                        }
                    }
                    _ = interrupt.recv() => {
                        let _ = tx.send(Event::Shutdown).await;
                        break;
                    }
                    _ = terminate.recv() => {
                        let _ = tx.send(Event::Shutdown).await;
                        break;
                    }
                }
            }
        });
        Ok(())
    }

    /// Apply one event. This is the only place network state changes.
    pub fn handle_event(&mut self, event: Event) {
        match event {
            Event::NewClient(new_client) => {
                tracing::info!(
                    id = new_client.conn.id,
                    addr = %new_client.conn.remote_addr,
                    "new client connection"
                );
                let id = new_client.conn.id;
                self.clients
                    .insert(id, LocalClient::new(new_client.conn, new_client.link));
            }
            Event::Message(id, message) => self.dispatch_message(id, message),
            Event::DeadClient(id) => {
                if self.clients.contains_key(&id) {
                    self.quit_pre_client(id, "I/O error");
                } else if self.local_users.contains_key(&id) {
                    self.quit_local_user(id, "I/O error", true);
                } else if self.local_servers.contains_key(&id) {
                    self.terminate_peer(id, "I/O error");
                }
            }
            Event::Tick => {
                self.check_and_ping_clients();
                self.connect_to_servers();
                self.flood_control();
            }
            Event::Rehash => self.rehash(None),
            Event::Shutdown => self.shutdown(),
        }
    }

    fn dispatch_message(&mut self, id: ClientId, message: Message) {
        if self.clients.contains_key(&id) {
            self.handle_client_message(id, message);
        } else if self.local_users.contains_key(&id) {
            self.handle_user_event(id, message);
        } else if self.local_servers.contains_key(&id) {
            self.handle_server_message(id, message);
        }
    }

    fn shutdown(&mut self) {
        tracing::info!("server shutdown initiated");
        let error = Message::new("ERROR", vec!["Server shutting down".to_string()]);
        for client in self.clients.values() {
            client.conn.send(&error);
            client.conn.close();
        }
        for local_user in self.local_users.values() {
            local_user.conn.send(&error);
            local_user.conn.close();
        }
        for peer in self.local_servers.values() {
            peer.conn.send(&error);
            peer.conn.close();
        }
        let _ = self.shutdown_tx.send(true);
    }

    // Tick: pings and timeouts

    fn check_and_ping_clients(&mut self) {
        let now = now();
        let ping_time = self.config.ping_time as i64;
        let dead_time = self.config.dead_time as i64;

        // Unregistered connections only get a registration window.
        let mut dead: Vec<(ClientId, &'static str)> = Vec::new();
        for (id, client) in &self.clients {
            if client.conn.send_queue_exceeded() {
                dead.push((*id, "SendQ exceeded"));
            } else if now - client.start > ping_time {
                dead.push((*id, "Idle too long."));
            }
        }
        for (id, reason) in dead {
            self.quit_pre_client(id, reason);
        }

        let mut user_quits: Vec<(ClientId, String)> = Vec::new();
        let mut user_pings: Vec<ClientId> = Vec::new();
        for (id, local_user) in &self.local_users {
            if local_user.conn.send_queue_exceeded() {
                user_quits.push((*id, "SendQ exceeded".to_string()));
                continue;
            }
            let idle = now - local_user.last_activity;
            if idle < ping_time {
                continue;
            }
            if idle > dead_time {
                user_quits.push((*id, format!("Ping timeout: {} seconds", idle)));
                continue;
            }
            if now - local_user.last_ping >= ping_time {
                user_pings.push(*id);
            }
        }
        for (id, reason) in user_quits {
            self.quit_local_user(id, &reason, true);
        }
        for id in user_pings {
            if let Some(local_user) = self.local_users.get_mut(&id) {
                local_user.last_ping = now;
            }
            if let Some(local_user) = self.local_users.get(&id) {
                local_user.conn.send(&Message::with_source(
                    self.config.server_name.clone(),
                    "PING",
                    vec![self.config.server_name.clone()],
                ));
            }
        }

        let mut peer_quits: Vec<(ClientId, String)> = Vec::new();
        let mut peer_pings: Vec<ClientId> = Vec::new();
        for (id, peer) in &self.local_servers {
            if peer.conn.send_queue_exceeded() {
                peer_quits.push((*id, "SendQ exceeded".to_string()));
                continue;
            }
            if peer.bursting {
                if now - peer.start > ping_time {
                    peer_quits.push((*id, "Bursting too long".to_string()));
                }
                continue;
            }
            let idle = now - peer.last_activity;
            if idle < ping_time {
                continue;
            }
            if idle > dead_time {
                peer_quits.push((*id, format!("Ping timeout: {} seconds", idle)));
                continue;
            }
            if now - peer.last_ping >= ping_time {
                peer_pings.push(*id);
            }
        }
        for (id, reason) in peer_quits {
            self.terminate_peer(id, &reason);
        }
        for id in peer_pings {
            if let Some(peer) = self.local_servers.get_mut(&id) {
                peer.last_ping = now;
            }
            if let Some(peer) = self.local_servers.get(&id) {
                peer.conn.send(&Message::with_source(
                    self.config.ts6_sid.to_string(),
                    "PING",
                    vec![self.config.server_name.clone()],
                ));
            }
        }
    }

    // Tick: outbound links

    fn connect_to_servers(&mut self) {
        let now = now();
        let links: Vec<LinkConfig> = self.config.servers.clone();
        for link in links {
            if link.name == self.config.server_name {
                continue;
            }
            if self.is_linked_to_server(&link.name) {
                continue;
            }
            let last = self.link_attempts.get(&link.name).copied().unwrap_or(0);
            if now - last < self.config.connect_attempt_time as i64 {
                continue;
            }
            self.link_attempts.insert(link.name.clone(), now);
            self.connect_to_server(&link);
        }
    }

    fn connect_to_server(&self, link: &LinkConfig) {
        if link.tls {
            self.notice_opers(&format!("Connecting to {} with TLS...", link.name));
        } else {
            self.notice_opers(&format!("Connecting to {} without TLS...", link.name));
        }
        listener::spawn_dial(
            link.clone(),
            self.config.dead_time(),
            link.tls.then(|| self.tls_client.clone()),
            self.server_intro(&link.pass),
            self.next_client_id.clone(),
            self.event_tx.clone(),
        );
    }

    /// The PASS/CAPAB/SERVER sequence that opens a server link.
    pub(crate) fn server_intro(&self, pass: &str) -> Vec<Message> {
        vec![
            Message::new(
                "PASS",
                vec![
                    pass.to_string(),
                    "TS".to_string(),
                    "6".to_string(),
                    self.config.ts6_sid.to_string(),
                ],
            ),
            Message::new("CAPAB", vec![crate::peer::OUR_CAPABS.join(" ")]),
            Message::new(
                "SERVER",
                vec![
                    self.config.server_name.clone(),
                    "1".to_string(),
                    self.config.server_info.clone(),
                ],
            ),
        ]
    }

    // Tick: flood control

    /// Refill one token per user, then drain what the bucket allows, in
    /// order. Runs for every user, operators included, so a promotion never
    /// reorders a queue.
    fn flood_control(&mut self) {
        let ids: Vec<ClientId> = self.local_users.keys().copied().collect();
        for id in ids {
            if let Some(local_user) = self.local_users.get_mut(&id) {
                local_user.throttle.refill();
            }
            loop {
                let Some(local_user) = self.local_users.get_mut(&id) else {
                    break;
                };
                let Some(message) = local_user.throttle.pop_ready() else {
                    break;
                };
                self.process_user_message(id, message);
            }
        }
    }

    // Rehash

    pub fn rehash(&mut self, by: Option<Uid>) {
        let Some(path) = self.config_path.clone() else {
            self.notice_opers("Rehash: no configuration file to reload");
            return;
        };
        match Config::load(&path) {
            Ok(new_config) => {
                self.config.motd = new_config.motd;
                self.config.opers = new_config.opers;
                self.config.servers = new_config.servers;
                self.config.user_configs = new_config.user_configs;
                self.motd = self.config.load_motd();
                match by.and_then(|uid| self.users.get(&uid)).map(|u| u.nick.clone()) {
                    Some(nick) => {
                        self.notice_opers(&format!("{} rehashed configuration.", nick))
                    }
                    None => self.notice_opers("Rehashed configuration."),
                }
            }
            Err(e) => {
                self.notice_opers(&format!("Rehash: Configuration problem: {}", e));
            }
        }
    }

    // Lookup helpers

    pub fn is_linked_to_server(&self, name: &str) -> bool {
        name == self.config.server_name || self.servers.values().any(|s| s.name == name)
    }

    pub fn get_server_by_name(&self, name: &str) -> Option<&Server> {
        self.servers.values().find(|s| s.name == name)
    }

    pub fn local_user_conn(&self, uid: Uid) -> Option<&crate::connection::Connection> {
        self.users
            .get(&uid)
            .and_then(|u| u.local_id)
            .and_then(|id| self.local_users.get(&id))
            .map(|lu| &lu.conn)
    }

    // Message fan-out

    /// Enqueue to every local server except the ingress (split-horizon).
    pub fn propagate(&self, ingress: ClientId, message: &Message) {
        for (id, peer) in &self.local_servers {
            if *id != ingress {
                peer.conn.send(message);
            }
        }
    }

    pub fn broadcast_to_peers(&self, message: &Message) {
        for peer in self.local_servers.values() {
            peer.conn.send(message);
        }
    }

    /// Route a message toward a server: directly if it is a local peer,
    /// through its closest local peer otherwise.
    pub fn forward_to_server(&self, sid: Sid, message: &Message) {
        let Some(server) = self.servers.get(&sid) else {
            return;
        };
        let peer_id = server.local_id.or(server.closest);
        if let Some(peer) = peer_id.and_then(|id| self.local_servers.get(&id)) {
            peer.conn.send(message);
        }
    }

    /// Deliver to every local member of a channel.
    pub fn message_local_members(&self, chan_name: &str, message: &Message) {
        let Some(channel) = self.channels.get(chan_name) else {
            return;
        };
        for uid in &channel.members {
            let Some(user) = self.users.get(uid) else {
                continue;
            };
            if let Some(local_user) = user.local_id.and_then(|id| self.local_users.get(&id)) {
                local_user.conn.send(message);
            }
        }
    }

    // Numerics

    /// Send a numeric to a registered local user, inserting their nick as
    /// the first parameter.
    pub fn numeric(&self, id: ClientId, code: &str, params: Vec<String>) {
        let Some(local_user) = self.local_users.get(&id) else {
            return;
        };
        let nick = self
            .users
            .get(&local_user.uid)
            .map(|u| u.nick.clone())
            .unwrap_or_else(|| "*".to_string());
        let mut full = Vec::with_capacity(params.len() + 1);
        full.push(nick);
        full.extend(params);
        local_user
            .conn
            .send(&Message::with_source(self.config.server_name.clone(), code, full));
    }

    /// Send a numeric to a pre-registration client, whose nick slot is `*`
    /// until it has one.
    pub fn client_numeric(&self, id: ClientId, code: &str, params: Vec<String>) {
        let Some(client) = self.clients.get(&id) else {
            return;
        };
        let nick = client.pre_nick.clone().unwrap_or_else(|| "*".to_string());
        let mut full = Vec::with_capacity(params.len() + 1);
        full.push(nick);
        full.extend(params);
        client
            .conn
            .send(&Message::with_source(self.config.server_name.clone(), code, full));
    }

    // Operator notices

    pub fn server_notice(&self, id: ClientId, text: &str) {
        let Some(local_user) = self.local_users.get(&id) else {
            return;
        };
        let nick = self
            .users
            .get(&local_user.uid)
            .map(|u| u.nick.clone())
            .unwrap_or_else(|| "*".to_string());
        local_user.conn.send(&Message::with_source(
            self.config.server_name.clone(),
            "NOTICE",
            vec![nick, format!("*** Notice --- {}", text)],
        ));
    }

    /// Tell every operator on the network, routing to remote ones through
    /// their closest peer.
    pub fn notice_opers(&self, text: &str) {
        tracing::info!("global oper notice: {}", text);
        for uid in &self.opers {
            let Some(user) = self.users.get(uid) else {
                continue;
            };
            if let Some(local_id) = user.local_id {
                self.server_notice(local_id, text);
            } else if let Some(peer) = user
                .closest
                .and_then(|id| self.local_servers.get(&id))
            {
                peer.conn.send(&Message::with_source(
                    self.config.ts6_sid.to_string(),
                    "NOTICE",
                    vec![uid.to_string(), format!("*** Notice --- {}", text)],
                ));
            }
        }
    }

    pub fn notice_local_opers(&self, text: &str) {
        tracing::info!("local oper notice: {}", text);
        for uid in &self.opers {
            if let Some(local_id) = self.users.get(uid).and_then(|u| u.local_id) {
                self.server_notice(local_id, text);
            }
        }
    }

    /// Connection notices go to local operators carrying `+C`.
    pub fn notify_conn_opers(&self, text: &str) {
        for uid in &self.opers {
            let Some(user) = self.users.get(uid) else {
                continue;
            };
            if !user.modes.conn_notices {
                continue;
            }
            if let Some(local_id) = user.local_id {
                self.server_notice(local_id, text);
            }
        }
    }

    // User removal

    /// Drop a pre-registration connection.
    pub fn quit_pre_client(&mut self, id: ClientId, reason: &str) {
        let Some(client) = self.clients.remove(&id) else {
            return;
        };
        client
            .conn
            .send(&Message::new("ERROR", vec![format!("Closing Link: {}", reason)]));
        client.conn.close();
        tracing::info!(id, reason, "pre-registration client closed");
    }

    /// Drop a registered local user: tell them, tell their channel sharers,
    /// optionally tell the network, and forget them.
    pub fn quit_local_user(&mut self, id: ClientId, reason: &str, propagate: bool) {
        let Some(local_user) = self.local_users.remove(&id) else {
            return;
        };
        local_user
            .conn
            .send(&Message::new("ERROR", vec![format!("Closing Link: {}", reason)]));
        local_user.conn.close();

        if propagate {
            let quit = Message::with_source(
                local_user.uid.to_string(),
                "QUIT",
                vec![reason.to_string()],
            );
            self.broadcast_to_peers(&quit);
        }

        self.drop_user(local_user.uid, reason);
    }

    /// A remote user is gone: tell local sharers and forget them.
    pub fn quit_remote_user(&mut self, uid: Uid, message: &str) {
        self.drop_user(uid, message);
    }

    /// Remove a user from all records, informing each local user sharing a
    /// channel with them exactly once.
    fn drop_user(&mut self, uid: Uid, quit_text: &str) {
        let Some(user) = self.users.remove(&uid) else {
            return;
        };

        let mut params = Vec::new();
        if !quit_text.is_empty() {
            params.push(quit_text.to_string());
        }
        let quit = Message::with_source(user.nickmask(), "QUIT", params);

        let mut informed: HashSet<Uid> = HashSet::new();
        for chan_name in &user.channels {
            let Some(channel) = self.channels.get(chan_name) else {
                continue;
            };
            for member_uid in &channel.members {
                if *member_uid == uid || !informed.insert(*member_uid) {
                    continue;
                }
                if let Some(conn) = self.local_user_conn(*member_uid) {
                    conn.send(&quit);
                }
            }
        }

        for chan_name in &user.channels {
            let emptied = match self.channels.get_mut(chan_name) {
                Some(channel) => {
                    channel.members.remove(&uid);
                    channel.members.is_empty()
                }
                None => false,
            };
            if emptied {
                self.channels.remove(chan_name);
            }
        }

        let canonical = casefold(&user.nick);
        if self.nicks.get(&canonical) == Some(&uid) {
            self.nicks.remove(&canonical);
        }
        self.opers.remove(&uid);
    }

    // Kills

    /// Issue a KILL from this server (or from `by`, one of our users):
    /// broadcast it, cut the target off if local, synthesize the quit if
    /// remote.
    pub fn issue_kill(&mut self, by: Option<Uid>, target: Uid, message: &str) {
        let server_name = self.config.server_name.clone();
        let (reason, killer) = match by.and_then(|uid| self.users.get(&uid)) {
            Some(user) => (
                format!(
                    "{}!{}!{}!{} ({})",
                    server_name, user.hostname, user.username, user.nick, message
                ),
                user.nick.clone(),
            ),
            None => (format!("{} ({})", server_name, message), server_name.clone()),
        };

        let kill = Message::with_source(
            self.config.ts6_sid.to_string(),
            "KILL",
            vec![target.to_string(), reason],
        );
        self.broadcast_to_peers(&kill);

        let target_nick = self
            .users
            .get(&target)
            .map(|u| u.nick.clone())
            .unwrap_or_else(|| target.to_string());
        self.notice_opers(&format!(
            "Received KILL message for {}. From {} ({})",
            target_nick, killer, message
        ));

        let quit_reason = format!("Killed ({} ({}))", killer, message);
        let target_local_id = self.users.get(&target).and_then(|u| u.local_id);
        if let Some(local_id) = target_local_id {
            // The KILL already went everywhere; no propagated QUIT.
            self.quit_local_user(local_id, &quit_reason, false);
        } else if self.users.contains_key(&target) {
            self.quit_remote_user(target, &quit_reason);
        }
    }

    // K-lines

    /// Store a K-line and cut off any local user it matches. Does not
    /// propagate; K-lines travel inside ENCAP.
    pub fn add_and_apply_kline(&mut self, kline: KLine, source: &str) {
        if self
            .klines
            .iter()
            .any(|k| k.user_mask == kline.user_mask && k.host_mask == kline.host_mask)
        {
            self.notice_opers(&format!(
                "Ignoring duplicate K-Line for [{}@{}] from {}",
                kline.user_mask, kline.host_mask, source
            ));
            return;
        }

        self.notice_opers(&format!(
            "{} added K-Line for [{}@{}] [{}]",
            source, kline.user_mask, kline.host_mask, kline.reason
        ));

        let quit_reason = format!("Connection closed: {}", kline.reason);
        let matching: Vec<(ClientId, String)> = self
            .local_users
            .iter()
            .filter_map(|(id, local_user)| {
                let user = self.users.get(&local_user.uid)?;
                kline
                    .matches(&user.username, &user.hostname)
                    .then(|| (*id, user.nick.clone()))
            })
            .collect();

        self.klines.push(kline);

        for (id, nick) in matching {
            self.quit_local_user(id, &quit_reason, true);
            self.notice_opers(&format!("User disconnected due to K-Line: {}", nick));
        }
    }

    pub fn remove_kline(&mut self, user_mask: &str, host_mask: &str, source: &str) -> bool {
        let Some(index) = self
            .klines
            .iter()
            .position(|k| k.user_mask.as_str() == user_mask && k.host_mask.as_str() == host_mask)
        else {
            self.notice_opers(&format!(
                "Not removing K-Line for [{}@{}] (not found)",
                user_mask, host_mask
            ));
            return false;
        };
        self.klines.remove(index);
        self.notice_opers(&format!(
            "{} removed K-Line for [{}@{}]",
            source, user_mask, host_mask
        ));
        true
    }

    // WHOIS

    /// Build the numeric set answering a WHOIS about one of our local users.
    /// With `use_ids` the source and target are written as SID/UID for
    /// transport to a remote requester.
    pub fn create_whois_response(
        &self,
        target_uid: Uid,
        reply_uid: Uid,
        use_ids: bool,
    ) -> Vec<Message> {
        let Some(user) = self.users.get(&target_uid) else {
            return Vec::new();
        };
        let Some(reply_user) = self.users.get(&reply_uid) else {
            return Vec::new();
        };

        let from = if use_ids {
            self.config.ts6_sid.to_string()
        } else {
            self.config.server_name.clone()
        };
        let to = if use_ids {
            reply_uid.to_string()
        } else {
            reply_user.nick.clone()
        };

        let mut replies = Vec::new();

        replies.push(Message::with_source(
            from.clone(),
            "311",
            vec![
                to.clone(),
                user.nick.clone(),
                user.username.clone(),
                user.hostname.clone(),
                "*".to_string(),
                user.realname.clone(),
            ],
        ));

        replies.push(Message::with_source(
            from.clone(),
            "312",
            vec![
                to.clone(),
                user.nick.clone(),
                self.config.server_name.clone(),
                self.config.server_info.clone(),
            ],
        ));

        if let Some(away) = &user.away {
            replies.push(Message::with_source(
                from.clone(),
                "301",
                vec![to.clone(), user.nick.clone(), away.clone()],
            ));
        }

        if user.is_oper() {
            replies.push(Message::with_source(
                from.clone(),
                "313",
                vec![to.clone(), user.nick.clone(), "is an IRC operator".to_string()],
            ));
        }

        if let Some(local_user) = user.local_id.and_then(|id| self.local_users.get(&id)) {
            if local_user.conn.tls {
                replies.push(Message::with_source(
                    from.clone(),
                    "671",
                    vec![
                        to.clone(),
                        user.nick.clone(),
                        "is using a secure connection".to_string(),
                    ],
                ));
            }
            let idle = now() - local_user.last_message;
            replies.push(Message::with_source(
                from.clone(),
                "317",
                vec![
                    to.clone(),
                    user.nick.clone(),
                    idle.to_string(),
                    local_user.signon.to_string(),
                    "seconds idle, signon time".to_string(),
                ],
            ));
        }

        replies.push(Message::with_source(
            from,
            "318",
            vec![to, user.nick.clone(), "End of WHOIS list".to_string()],
        ));

        replies
    }
}
