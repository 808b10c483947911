//! End-to-end protocol scenarios, driven through the event loop with
//! in-memory connections.

mod util;

use minnow_ircd::state::Topic;
use minnow_proto::{Message, Uid};

use util::{check_invariants, count_command, messages_with_command, Net, LINK_PASS};

#[test]
fn burst_completeness() {
    let mut net = Net::new("a.example", "1AA");
    let (alice_id, alice_uid) = net.add_user("alice");
    net.line(alice_id, "JOIN #x");

    net.ircd.users.get_mut(&alice_uid).unwrap().nick_ts = 1000;
    {
        let channel = net.ircd.channels.get_mut("#x").unwrap();
        channel.ts = 500;
        channel.topic = Some(Topic {
            text: "greetings".to_string(),
            setter: "alice!alice@10.0.0.1".to_string(),
            ts: 800,
        });
    }

    let peer = net.add_peer_keep_output("b.example", "2AA");
    let lines = net.drain(peer);

    // We know no third server, so no SID frames.
    assert_eq!(count_command(&lines, "SID"), 0);

    let uids = messages_with_command(&lines, "UID");
    assert_eq!(uids.len(), 1);
    assert_eq!(uids[0].source.as_deref(), Some("1AA"));
    assert_eq!(
        uids[0].params,
        vec![
            "alice",
            "1",
            "1000",
            "+i",
            "alice",
            "10.0.0.1",
            "10.0.0.1",
            alice_uid.as_str(),
            "alice Real",
        ]
    );

    let sjoins = messages_with_command(&lines, "SJOIN");
    assert_eq!(sjoins.len(), 1);
    assert_eq!(sjoins[0].source.as_deref(), Some("1AA"));
    assert_eq!(
        sjoins[0].params,
        vec!["500", "#x", "+ns", alice_uid.as_str()]
    );

    // The peer advertised TB and the channel has a topic.
    let tbs = messages_with_command(&lines, "TB");
    assert_eq!(tbs.len(), 1);
    assert_eq!(
        tbs[0].params,
        vec!["#x", "800", "alice!alice@10.0.0.1", "greetings"]
    );

    // Burst closes with our PING toward the peer.
    let pings = messages_with_command(&lines, "PING");
    assert_eq!(pings.len(), 1);
    assert_eq!(pings[0].params, vec!["a.example", "2AA"]);

    // Servers before users before channels.
    let uid_index = lines.iter().position(|l| l.contains(" UID ")).unwrap();
    let sjoin_index = lines.iter().position(|l| l.contains(" SJOIN ")).unwrap();
    assert!(uid_index < sjoin_index);

    check_invariants(&net.ircd);
}

#[test]
fn burst_completion_handshake() {
    let mut net = Net::new("a.example", "1AA");
    let peer = net.add_peer("b.example", "2AA");
    assert!(net.ircd.local_servers[&peer].bursting);

    // The peer pings us at the end of its burst...
    net.line(peer, ":2AA PING b.example :1AA");
    let lines = net.drain(peer);
    assert_eq!(count_command(&lines, "PONG"), 1);
    assert!(net.ircd.local_servers[&peer].bursting);

    // ...and answers the ping that closed ours.
    net.line(peer, ":2AA PONG b.example :1AA");
    assert!(!net.ircd.local_servers[&peer].bursting);
}

#[test]
fn nick_collision_both_killed() {
    let mut net = Net::new("p1.example", "1AA");
    let (bob_id, bob_uid) = net.add_user("bob");
    assert_eq!(bob_uid.as_str(), "1AAAAAAAA");
    let (vic_id, _vic_uid) = net.add_user("vic");
    net.line(bob_id, "JOIN #r");
    net.line(vic_id, "JOIN #r");
    net.ircd.users.get_mut(&bob_uid).unwrap().nick_ts = 100;

    let s2 = net.add_peer("p2.example", "2AA");
    let s3 = net.add_peer("p3.example", "3AA");
    net.drain(bob_id);
    net.drain(vic_id);

    net.line(s2, ":2AA UID bob 1 100 +i bob host. 0 2AAAAAAAB :Bob");

    // Both users die; the nick is free.
    assert!(!net.ircd.users.contains_key(&bob_uid));
    assert!(!net.ircd.users.contains_key(&Uid::new("2AAAAAAAB").unwrap()));
    assert!(!net.ircd.nicks.contains_key("bob"));

    // Two KILL frames reach every local server.
    for peer in [s2, s3] {
        let kills = messages_with_command(&net.drain(peer), "KILL");
        assert_eq!(kills.len(), 2);
        assert_eq!(kills[0].params[0], bob_uid.as_str());
        assert!(kills[0].params[1].contains("Nick collision, both killed"));
        assert_eq!(kills[1].params[0], "2AAAAAAAB");
    }

    // The channel sharer sees the original bob quit.
    let quits = messages_with_command(&net.drain(vic_id), "QUIT");
    assert_eq!(quits.len(), 1);
    assert_eq!(quits[0].source.as_deref(), Some("bob!bob@10.0.0.1"));
    assert_eq!(
        quits[0].params[0],
        "Killed (p1.example (Nick collision, both killed))"
    );

    check_invariants(&net.ircd);
}

#[test]
fn nick_collision_older_wins() {
    let mut net = Net::new("p1.example", "1AA");
    let (_bob_id, bob_uid) = net.add_user("bob");
    net.ircd.users.get_mut(&bob_uid).unwrap().nick_ts = 100;
    let s2 = net.add_peer("p2.example", "2AA");

    // Incoming is older: the existing holder dies, the incoming survives.
    net.line(s2, ":2AA UID bob 1 50 +i bob host. 0 2AAAAAAAB :Bob");
    let incoming = Uid::new("2AAAAAAAB").unwrap();
    assert!(!net.ircd.users.contains_key(&bob_uid));
    assert_eq!(net.ircd.nicks.get("bob"), Some(&incoming));
    assert_eq!(count_command(&net.drain(s2), "KILL"), 1);

    check_invariants(&net.ircd);
}

#[test]
fn nick_collision_newer_loses() {
    let mut net = Net::new("p1.example", "1AA");
    let (_bob_id, bob_uid) = net.add_user("bob");
    net.ircd.users.get_mut(&bob_uid).unwrap().nick_ts = 100;
    let s2 = net.add_peer("p2.example", "2AA");

    // Incoming is newer: it dies, the existing holder is untouched.
    net.line(s2, ":2AA UID bob 1 200 +i bob host. 0 2AAAAAAAB :Bob");
    assert!(!net.ircd.users.contains_key(&Uid::new("2AAAAAAAB").unwrap()));
    assert_eq!(net.ircd.nicks.get("bob"), Some(&bob_uid));
    let kills = messages_with_command(&net.drain(s2), "KILL");
    assert_eq!(kills.len(), 1);
    assert_eq!(kills[0].params[0], "2AAAAAAAB");

    check_invariants(&net.ircd);
}

#[test]
fn split_cleanup() {
    let mut net = Net::new("self.example", "0AA");
    let (vic_id, vic_uid) = net.add_user("vic");
    net.line(vic_id, "JOIN #r");

    let s1 = net.add_peer("s1.example", "2AA");
    net.line(s1, ":2AA SID s2.example 2 3AA :far side");
    net.line(s1, ":3AA UID u1 2 100 +i u1 h1 0 3AAAAAAAA :U One");
    net.line(s1, ":3AA UID u2 2 100 +i u2 h2 0 3AAAAAAAB :U Two");
    let chan_ts = net.ircd.channels["#r"].ts;
    net.line(
        s1,
        &format!(":2AA SJOIN {} #r +ns :3AAAAAAAA 3AAAAAAAB", chan_ts),
    );
    assert_eq!(net.ircd.channels["#r"].members.len(), 3);
    net.drain(vic_id);

    // The direct link drops; everything behind it goes too.
    net.line(s1, "ERROR :bye");

    assert!(net.ircd.servers.is_empty());
    assert!(net.ircd.local_servers.is_empty());
    assert!(!net.ircd.users.contains_key(&Uid::new("3AAAAAAAA").unwrap()));
    assert!(!net.ircd.users.contains_key(&Uid::new("3AAAAAAAB").unwrap()));

    let quits = messages_with_command(&net.drain(vic_id), "QUIT");
    assert_eq!(quits.len(), 2);
    for quit in &quits {
        assert_eq!(quit.params[0], "self.example s1.example");
    }

    let channel = &net.ircd.channels["#r"];
    assert_eq!(channel.members.len(), 1);
    assert!(channel.members.contains(&vic_uid));

    check_invariants(&net.ircd);
}

#[test]
fn flood_control_defers_and_drains() {
    let mut net = Net::new("self.example", "0AA");
    let (src_id, _) = net.add_user("src");
    let (dst_id, _) = net.add_user("dst");
    net.drain(dst_id);

    for n in 0..15 {
        net.line(src_id, &format!("PRIVMSG dst :message {}", n));
    }

    // Ten handled immediately, five deferred.
    assert_eq!(count_command(&net.drain(dst_id), "PRIVMSG"), 10);
    assert_eq!(net.ircd.local_users[&src_id].throttle.queue_len(), 5);

    // One token per tick, one deferred message per token.
    net.tick();
    assert_eq!(count_command(&net.drain(dst_id), "PRIVMSG"), 1);

    let mut rest = 0;
    for _ in 0..5 {
        net.tick();
        rest += count_command(&net.drain(dst_id), "PRIVMSG");
    }
    assert_eq!(rest, 4);
    assert_eq!(net.ircd.local_users[&src_id].throttle.queue_len(), 0);

    check_invariants(&net.ircd);
}

#[test]
fn privmsg_channel_routing() {
    let mut net = Net::new("self.example", "0AA");
    let (la_id, _) = net.add_user("la");
    let (src_id, _src_uid) = net.add_user("src");
    net.line(la_id, "JOIN #m");
    net.line(src_id, "JOIN #m");

    let s1 = net.add_peer("s1.example", "2AA");
    let s2 = net.add_peer("s2.example", "3AA");
    net.line(s1, ":2AA UID rb 1 100 +i rb h 0 2AAAAAAAA :R B");
    net.line(s1, ":2AA UID rd 1 100 +i rd h 0 2AAAAAAAB :R D");
    net.line(s2, ":3AA UID rc 1 100 +i rc h 0 3AAAAAAAA :R C");
    let chan_ts = net.ircd.channels["#m"].ts;
    net.line(
        s1,
        &format!(":2AA SJOIN {} #m +ns :2AAAAAAAA 2AAAAAAAB", chan_ts),
    );
    net.line(s2, &format!(":3AA SJOIN {} #m +ns :3AAAAAAAA", chan_ts));
    net.drain(la_id);
    net.drain(src_id);
    net.drain(s1);
    net.drain(s2);

    net.line(src_id, "PRIVMSG #m :hi");

    let la_messages = messages_with_command(&net.drain(la_id), "PRIVMSG");
    assert_eq!(la_messages.len(), 1);
    assert_eq!(la_messages[0].source.as_deref(), Some("src!src@10.0.0.1"));
    assert_eq!(la_messages[0].params, vec!["#m", "hi"]);

    // No echo to the sender.
    assert_eq!(count_command(&net.drain(src_id), "PRIVMSG"), 0);

    // Exactly one copy per peer that links remote members, despite two
    // members being behind s1.
    assert_eq!(count_command(&net.drain(s1), "PRIVMSG"), 1);
    assert_eq!(count_command(&net.drain(s2), "PRIVMSG"), 1);

    check_invariants(&net.ircd);
}

#[test]
fn topic_burst_accept_and_reject() {
    let mut net = Net::new("self.example", "0AA");
    let (vic_id, _) = net.add_user("vic");
    net.line(vic_id, "JOIN #t");
    let s1 = net.add_peer("s1.example", "2AA");
    net.drain(vic_id);

    // No topic yet: adopt.
    net.line(s1, ":2AA TB #t 800 setter!s@h :first");
    assert_eq!(net.ircd.channels["#t"].topic.as_ref().unwrap().text, "first");

    // Newer than ours: ignore.
    net.line(s1, ":2AA TB #t 900 setter!s@h :newer");
    assert_eq!(net.ircd.channels["#t"].topic.as_ref().unwrap().text, "first");

    // Older than ours: adopt.
    net.line(s1, ":2AA TB #t 700 setter!s@h :older");
    let topic = net.ircd.channels["#t"].topic.as_ref().unwrap();
    assert_eq!(topic.text, "older");
    assert_eq!(topic.ts, 700);

    // The local member heard about both adoptions, not the rejection.
    assert_eq!(count_command(&net.drain(vic_id), "TOPIC"), 2);

    check_invariants(&net.ircd);
}

#[test]
fn duplicate_delivery_is_idempotent() {
    let mut net = Net::new("self.example", "0AA");
    let s1 = net.add_peer("s1.example", "2AA");

    net.line(s1, ":2AA SID s2.example 2 3AA :far side");
    net.line(s1, ":2AA SID s2.example 2 3AA :far side");
    assert_eq!(net.ircd.servers.len(), 2);
    assert!(net.ircd.local_servers.contains_key(&s1), "link survived");

    net.line(s1, ":3AA UID u1 2 100 +i u1 h 0 3AAAAAAAA :U One");
    net.line(s1, ":3AA UID u1 2 100 +i u1 h 0 3AAAAAAAA :U One");
    assert_eq!(net.ircd.users.len(), 1);
    assert!(net.ircd.local_servers.contains_key(&s1), "link survived");

    net.line(s1, ":2AA SJOIN 500 #d +ns :3AAAAAAAA");
    net.line(s1, ":2AA SJOIN 500 #d +ns :3AAAAAAAA");
    assert_eq!(net.ircd.channels["#d"].members.len(), 1);

    check_invariants(&net.ircd);
}

#[test]
fn kline_applies_and_dedupes() {
    let mut net = Net::new("self.example", "0AA");
    let (vic_id, vic_uid) = net.add_user("vic");
    let s1 = net.add_peer("s1.example", "2AA");
    let s2 = net.add_peer("s2.example", "3AA");
    net.line(s1, ":2AA UID op 1 100 +i op h 0 2AAAAAAAA :Op");
    net.drain(s2);
    net.drain(vic_id);

    net.line(s1, ":2AAAAAAAA ENCAP * KLINE 0 * 10.0.0.1 :bye bye");

    // Stored once, applied to the matching local user, propagated onward.
    assert_eq!(net.ircd.klines.len(), 1);
    assert!(!net.ircd.users.contains_key(&vic_uid));
    let vic_lines = net.drain(vic_id);
    assert!(vic_lines
        .iter()
        .any(|l| l.starts_with("ERROR") && l.contains("bye bye")));
    assert_eq!(count_command(&net.drain(s2), "ENCAP"), 1);

    // A duplicate is ignored.
    net.line(s1, ":2AAAAAAAA ENCAP * KLINE 0 * 10.0.0.1 :bye bye");
    assert_eq!(net.ircd.klines.len(), 1);

    // UNKLINE removes it.
    net.line(s1, ":2AAAAAAAA ENCAP * UNKLINE * 10.0.0.1");
    assert!(net.ircd.klines.is_empty());

    check_invariants(&net.ircd);
}

#[test]
fn remote_whois_answered_with_ids() {
    let mut net = Net::new("self.example", "0AA");
    let (_vic_id, vic_uid) = net.add_user("vic");
    let s1 = net.add_peer("s1.example", "2AA");
    net.line(s1, ":2AA UID asker 1 100 +i asker h 0 2AAAAAAAA :Asker");
    net.drain(s1);

    net.line(s1, &format!(":2AAAAAAAA WHOIS {} :vic", vic_uid));

    let lines = net.drain(s1);
    let whois_user = messages_with_command(&lines, "311");
    assert_eq!(whois_user.len(), 1);
    assert_eq!(whois_user[0].source.as_deref(), Some("0AA"));
    assert_eq!(whois_user[0].params[0], "2AAAAAAAA");
    assert_eq!(whois_user[0].params[1], "vic");
    assert_eq!(count_command(&lines, "318"), 1);
}

#[test]
fn unknown_command_yields_421() {
    let mut net = Net::new("self.example", "0AA");
    let s1 = net.add_peer("s1.example", "2AA");
    net.line(s1, ":2AA FROBNICATE something");
    let lines = net.drain(s1);
    let replies = messages_with_command(&lines, "421");
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].params, vec!["2AA", "FROBNICATE", "Unknown command"]);
}

#[test]
fn invite_timestamp_read_at_index_two() {
    let mut net = Net::new("self.example", "0AA");
    let (vic_id, vic_uid) = net.add_user("vic");
    net.line(vic_id, "JOIN #i");
    let s1 = net.add_peer("s1.example", "2AA");
    net.line(s1, ":2AA UID inviter 1 100 +i inv h 0 2AAAAAAAA :Inv");
    net.drain(vic_id);

    let chan_ts = net.ircd.channels["#i"].ts;

    // A TS newer than the channel's drops the invite.
    net.line(
        s1,
        &format!(":2AAAAAAAA INVITE {} #i {}", vic_uid, chan_ts + 10),
    );
    assert_eq!(count_command(&net.drain(vic_id), "INVITE"), 0);

    // An equal-or-older TS delivers it.
    net.line(
        s1,
        &format!(":2AAAAAAAA INVITE {} #i {}", vic_uid, chan_ts),
    );
    let invites = messages_with_command(&net.drain(vic_id), "INVITE");
    assert_eq!(invites.len(), 1);
    assert_eq!(invites[0].params, vec!["vic", "#i"]);
}

#[test]
fn burst_then_reverse_burst_converges() {
    let mut a = Net::new("a.example", "1AA");
    let mut b = Net::new("b.example", "2AA");

    let (alice_id, alice_uid) = a.add_user("alice");
    a.line(alice_id, "JOIN #x");
    let (bob_id, bob_uid) = b.add_user("bob");
    b.line(bob_id, "JOIN #x");
    b.line(bob_id, "JOIN #only-b");

    a.allow_link("b.example");
    b.allow_link("a.example");
    let ia = a.connect();
    let ib = b.connect();

    // b's introduction, as it would arrive at a.
    a.line(ia, &format!("PASS {} TS 6 2AA", LINK_PASS));
    a.line(ia, "CAPAB :QS ENCAP TB");
    a.line(ia, "SERVER b.example 1 :b description");

    // a answers with its own introduction and SVINFO; feed those to b.
    for line in a.drain(ia) {
        b.line(ib, &line);
    }

    // b now sends its (redundant) introduction, its SVINFO, and its burst.
    // a already holds the introduction we crafted, so skip that part.
    for line in b.drain(ib) {
        let message = Message::parse(&line).unwrap();
        if message.source.is_none()
            && matches!(message.command.as_str(), "PASS" | "CAPAB" | "SERVER")
        {
            continue;
        }
        a.line(ia, &line);
    }

    // Shuttle the remaining traffic until both sides go quiet.
    loop {
        let from_a = a.drain(ia);
        let from_b = b.drain(ib);
        if from_a.is_empty() && from_b.is_empty() {
            break;
        }
        for line in from_a {
            b.line(ib, &line);
        }
        for line in from_b {
            a.line(ia, &line);
        }
    }

    // Both lines are up and out of burst.
    assert!(!a.ircd.local_servers[&ia].bursting);
    assert!(!b.ircd.local_servers[&ib].bursting);

    // Agreement on users.
    let mut a_users: Vec<&str> = a.ircd.users.keys().map(|u| u.as_str()).collect();
    let mut b_users: Vec<&str> = b.ircd.users.keys().map(|u| u.as_str()).collect();
    a_users.sort_unstable();
    b_users.sort_unstable();
    assert_eq!(a_users, b_users);

    // Agreement on servers: each sees exactly the other.
    assert!(a.ircd.servers.contains_key(&b.ircd.config.ts6_sid));
    assert!(b.ircd.servers.contains_key(&a.ircd.config.ts6_sid));

    // Agreement on channel membership.
    for name in ["#x", "#only-b"] {
        let a_chan = &a.ircd.channels[name];
        let b_chan = &b.ircd.channels[name];
        assert_eq!(a_chan.members, b_chan.members);
        assert_eq!(a_chan.ts, b_chan.ts);
    }
    assert!(a.ircd.channels["#x"].members.contains(&alice_uid));
    assert!(a.ircd.channels["#x"].members.contains(&bob_uid));

    check_invariants(&a.ircd);
    check_invariants(&b.ircd);
}
