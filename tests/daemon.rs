//! Daemon dialogues driven entirely in memory, from both ends.

mod common;

use common::{install_test_logger, RustCryptoDigests};
use rsyn_wire::{Buffer, Event, Options, ServerStatistics, Session, State};

/// Drive `parse` until it stops making progress, collecting events.
fn drain(session: &mut Session) -> Vec<Event> {
    let mut events = Vec::new();
    loop {
        if session.state() == State::Fatal {
            return events;
        }
        let before = session.pending_input();
        match session.parse().expect("parse failed") {
            Some(event) => events.push(event),
            None => {
                if session.pending_input() == before {
                    return events;
                }
            }
        }
    }
}

fn client(module: &str, user: Option<&str>, pass: Option<&str>) -> Session {
    install_test_logger();
    let mut opts = Options::new();
    opts.apply_argv(&["-r"]).unwrap();
    let mut session = Session::new(opts);
    session.set_digest_provider(Box::new(RustCryptoDigests));
    session.start_daemon_client(module, user, pass).unwrap();
    session
}

#[test]
fn daemon_client_handshake() {
    let mut session = client("AllTheData", None, None);
    session.feed(b"@RSYNCD: 30.0\n@RSYNCD: OK\n");
    let events = drain(&mut session);
    assert_eq!(events, vec![Event::Protocol(30), Event::Ok]);
    assert_eq!(session.protocol_version(), 30);
    assert_eq!(
        session.take_output(),
        b"@RSYNCD: 30.0\nAllTheData\n".to_vec()
    );
}

#[test]
fn daemon_client_authenticates_itself() {
    let mut session = client("AllTheData", Some("user"), Some("pass"));
    session.feed(b"@RSYNCD: 30.0\n@RSYNCD: AUTHREQD qwerty12345\n@RSYNCD: OK\n");
    let events = drain(&mut session);
    assert_eq!(events, vec![Event::Protocol(30), Event::Ok]);
    assert_eq!(
        session.take_output(),
        b"@RSYNCD: 30.0\nAllTheData\nuser Zp77fT8TRrZ+9A9JFNT/UA\n".to_vec()
    );
    assert_eq!(session.passhash(), Some("Zp77fT8TRrZ+9A9JFNT/UA"));
}

#[test]
fn challenge_without_credentials_surfaces_to_the_caller() {
    let mut session = client("AllTheData", None, None);
    session.feed(b"@RSYNCD: 30.0\n@RSYNCD: AUTHREQD pepper\n");
    let events = drain(&mut session);
    assert_eq!(
        events,
        vec![
            Event::Protocol(30),
            Event::AuthReqd("pepper".to_string())
        ]
    );
    // The caller asks a human, then answers through the session.
    session.send_auth_response("user", "pass").unwrap();
    assert!(session
        .take_output()
        .ends_with(format!("user {}\n", session.passhash().unwrap()).as_bytes()));
}

#[test]
fn motd_lines_then_exit() {
    let mut session = client("#list", None, None);
    session.feed(
        b"@RSYNCD: 31.0\n\
          Welcome to the grotto.\n\
          Mind the stalactites.\n\
          No anonymous uploads.\n\
          @RSYNCD: EXIT\n",
    );
    let events = drain(&mut session);
    assert_eq!(
        events,
        vec![
            Event::Protocol(31),
            Event::Info("Welcome to the grotto.".to_string()),
            Event::Info("Mind the stalactites.".to_string()),
            Event::Info("No anonymous uploads.".to_string()),
            Event::Exit,
        ]
    );
}

#[test]
fn server_error_line_is_fatal() {
    let mut session = client("secrets", None, None);
    session.feed(b"@RSYNCD: 31.0\n@ERROR: access denied\n");
    let events = drain(&mut session);
    assert_eq!(
        events,
        vec![
            Event::Protocol(31),
            Event::Error("Protocol error during login: access denied".to_string()),
        ]
    );
    assert_eq!(session.state(), State::Fatal);
}

#[test]
fn chunked_input_yields_identical_events() {
    let wire: &[u8] = b"@RSYNCD: 30.0\n@RSYNCD: AUTHREQD qwerty12345\n@RSYNCD: OK\n";

    fn run(wire: &[u8], chunks: &[usize]) -> (Vec<Event>, Vec<u8>) {
        let mut session = client("AllTheData", Some("user"), Some("pass"));
        let mut events = Vec::new();
        let mut offset = 0;
        for &n in chunks {
            let end = (offset + n).min(wire.len());
            session.feed(&wire[offset..end]);
            offset = end;
            events.extend(drain(&mut session));
        }
        assert_eq!(offset, wire.len());
        (events, session.take_output())
    }

    let whole = run(wire, &[wire.len()]);
    let bytewise = run(wire, &vec![1; wire.len()]);
    let bursts = run(wire, &[3, 11, 1, 25, wire.len()]);
    assert_eq!(whole, bytewise);
    assert_eq!(whole, bursts);
}

#[test]
fn daemon_server_full_dialogue() {
    install_test_logger();
    let mut server = Session::new(Options::new());
    server.set_digest_provider(Box::new(RustCryptoDigests));
    server.start_daemon_server().unwrap();
    assert_eq!(server.take_output(), b"@RSYNCD: 31.0\n".to_vec());

    server.feed(b"@RSYNCD: 30.0\nAllTheData\n");
    let events = drain(&mut server);
    assert_eq!(
        events,
        vec![
            Event::Protocol(30),
            Event::Module("AllTheData".to_string())
        ]
    );
    assert_eq!(server.daemon_module(), Some("AllTheData"));

    server.send_auth_challenge("qwerty12345").unwrap();
    server.feed(b"user Zp77fT8TRrZ+9A9JFNT/UA\n");
    match drain(&mut server).as_slice() {
        [Event::Auth { username, passhash }] => {
            assert_eq!(username, "user");
            // The server knows the password and checks the response.
            assert_eq!(passhash, &server.compute_passhash("pass").unwrap());
        }
        other => panic!("expected an auth event, got {:?}", other),
    }

    server.send_ok().unwrap();
    server.feed(b"--server\0--sender\0-r\0.\0AllTheData/\0\0");
    let events = drain(&mut server);
    assert_eq!(
        events,
        vec![Event::Command(vec![
            "--server".to_string(),
            "--sender".to_string(),
            "-r".to_string(),
            ".".to_string(),
            "AllTheData/".to_string(),
        ])]
    );
    assert_eq!(server.state(), State::DaemonServerSend);
    assert_eq!(server.options().sender, 1);
    assert_eq!(server.options().recursive, 1);
    assert_eq!(
        server.take_output(),
        b"@RSYNCD: AUTHREQD qwerty12345\n@RSYNCD: OK\n".to_vec()
    );

    // Once transferring, the server talks to the client in frames.
    server.send_msg(2, b"files to consider\n").unwrap();
    let mut expected = Buffer::new();
    expected.pack_msg(2, b"files to consider\n").unwrap();
    assert_eq!(server.take_output(), expected.take());
}

#[test]
fn module_listing_server_side() {
    install_test_logger();
    let mut server = Session::new(Options::new());
    server.start_daemon_server().unwrap();
    server.feed(b"@RSYNCD: 31.0\n#list\n");
    drain(&mut server);
    server.take_output();
    server.send_motd("share and enjoy").unwrap();
    server.send_module_list(&["AllTheData", "scratch"]).unwrap();
    assert_eq!(
        server.take_output(),
        b"share and enjoy\nAllTheData\nscratch\n@RSYNCD: EXIT\n".to_vec()
    );
}

#[test]
fn rejected_module_server_side() {
    install_test_logger();
    let mut server = Session::new(Options::new());
    server.start_daemon_server().unwrap();
    server.feed(b"@RSYNCD: 31.0\nsecrets\n");
    drain(&mut server);
    server.send_error("unknown module 'secrets'").unwrap();
    assert!(server
        .take_output()
        .ends_with(b"@ERROR: unknown module 'secrets'\n"));
    assert_eq!(server.state(), State::Fatal);
    assert!(server.send_ok().is_err());
}

#[test]
fn client_reads_statistics_from_the_muxed_stream() {
    let mut session = client("AllTheData", None, None);
    session.feed(b"@RSYNCD: 31.0\n@RSYNCD: OK\n");
    drain(&mut session);
    session
        .start_remote_sender(&["rsync", "--server", "--sender", ".", "AllTheData/"])
        .unwrap();
    assert!(session
        .take_output()
        .ends_with(b"--server\0--sender\0.\0AllTheData/\0\0"));

    let mut counters = Buffer::new();
    counters.pack_s64(1234);
    counters.pack_s64(56);
    counters.pack_s64(1 << 33);
    counters.pack_s64(7);
    counters.pack_s64(8);
    let payload = counters.take();
    let mut wire = Buffer::new();
    // Split the counter block across two data frames.
    wire.pack_msg(0, &payload[..9]).unwrap();
    wire.pack_msg(0, &payload[9..]).unwrap();
    session.feed(&wire.take());
    assert_eq!(drain(&mut session), Vec::new());

    let protocol = session.protocol_version();
    let stats = ServerStatistics::unpack(session.data(), protocol).unwrap();
    assert_eq!(stats.total_bytes_read, 1234);
    assert_eq!(stats.total_bytes_written, 56);
    assert_eq!(stats.total_file_size, 1 << 33);
    assert_eq!(stats.flist_build_time, 7);
    assert_eq!(stats.flist_xfer_time, 8);
}
