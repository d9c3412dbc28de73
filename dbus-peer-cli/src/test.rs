use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use dbus_peer::auth::{Anonymous, ClientMechanism, ServerMechanism};
use dbus_peer::ErrorKind;

use super::*;

#[test]
fn test_cli_definition() {
    cli().debug_assert();
}

#[test]
fn test_cli_call() {
    let matches = cli()
        .try_get_matches_from([
            "dbus-peer",
            "-vv",
            "--address",
            "tcp:host=127.0.0.1,port=4711",
            "call",
            "-s",
            "su",
            "org.example.Test",
            "/org/example",
            "org.example.Test.Frob",
            "hello",
            "42",
        ])
        .unwrap();
    assert_eq!(matches.get_count("verbose"), 2);
    let (name, sub) = matches.subcommand().unwrap();
    assert_eq!(name, "call");
    let args: Vec<&String> = sub.get_many::<String>("ARGUMENTS").unwrap().collect();
    assert_eq!(args, ["hello", "42"]);

    assert!(cli()
        .try_get_matches_from(["dbus-peer", "--session", "--system", "ping"])
        .is_err());
}

#[test]
fn test_parse_basic_args() {
    let signature = Signature::parse("ybnqiuxtdsog").unwrap();
    let values = parse_args(
        &signature,
        &[
            "7", "true", "-3", "3", "-70000", "70000", "-5", "5", "0.5", "text", "/a/b", "a{sv}",
        ],
    )
    .unwrap();
    assert_eq!(
        values,
        vec![
            Value::Byte(7),
            Value::Boolean(true),
            Value::Int16(-3),
            Value::Uint16(3),
            Value::Int32(-70000),
            Value::Uint32(70000),
            Value::Int64(-5),
            Value::Uint64(5),
            Value::Double(0.5),
            Value::from("text"),
            Value::ObjectPath(ObjectPath::new("/a/b").unwrap()),
            Value::Signature(Signature::parse("a{sv}").unwrap()),
        ]
    );
}

#[test]
fn test_parse_bad_args() {
    let signature = Signature::parse("y").unwrap();
    assert!(parse_args(&signature, &["256"]).is_err());
    assert!(parse_args(&signature, &[]).is_err());
    assert!(parse_args(&Signature::parse("o").unwrap(), &["no/path"]).is_err());
    assert!(parse_args(&Signature::parse("b").unwrap(), &["maybe"]).is_err());
    assert!(parse_args(&Signature::parse("ai").unwrap(), &["[1,"]).is_err());
}

#[test]
fn test_parse_container_args() {
    let signature = Signature::parse("ai(sb)a{su}v").unwrap();
    let values = parse_args(
        &signature,
        &["[1, 2, 3]", r#"["x", true]"#, r#"{"one": 1}"#, "\"free\""],
    )
    .unwrap();
    assert_eq!(
        values,
        vec![
            Value::Array(vec![Value::Int32(1), Value::Int32(2), Value::Int32(3)]),
            Value::Struct(vec![Value::from("x"), Value::Boolean(true)]),
            Value::dict(vec![(Value::from("one"), Value::Uint32(1))]),
            Value::Variant(Box::new(Variant::from_value(Value::from("free")).unwrap())),
        ]
    );

    let err = parse_args(&Signature::parse("(ss)").unwrap(), &[r#"["x"]"#]).unwrap_err();
    assert!(err.to_string().contains("needs 2 fields"));
}

#[test]
fn test_split_member() {
    assert_eq!(
        split_member("org.freedesktop.DBus.Peer.Ping").unwrap(),
        ("org.freedesktop.DBus.Peer", "Ping")
    );
    assert!(split_member("Ping").is_err());
    assert!(split_member("org.example.").is_err());
}

#[test]
fn test_peer_handler() {
    let stop = Arc::new(AtomicBool::new(false));
    let server_mechanisms: Vec<Arc<dyn ServerMechanism>> = vec![Arc::new(Anonymous)];
    let config = ListenConfig {
        mechanisms: server_mechanisms,
        poll_interval_ms: 20,
        stop_listening: Some(Arc::clone(&stop)),
        ..Default::default()
    };
    let server = Arc::new(
        Server::bind(&BusAddress::parse("tcp:host=127.0.0.1,port=0").unwrap(), config).unwrap(),
    );
    server.add_handler(peer_handler);
    let s = Arc::clone(&server);
    let handle = thread::spawn(move || s.run());

    let client_mechanisms: Vec<Arc<dyn ClientMechanism>> = vec![Arc::new(Anonymous)];
    let client = Channel::connect(
        &server.local_address().unwrap(),
        ChannelConfig {
            mechanisms: client_mechanisms,
            call_timeout: Some(Duration::from_secs(10)),
            ..Default::default()
        },
    )
    .unwrap();

    let ping = Message::method_call(None, "/", Some(PEER_INTERFACE), "Ping").unwrap();
    let reply = client.call(ping).unwrap();
    assert_eq!(reply.message_type(), MessageType::MethodReturn);
    assert!(reply.body_values().unwrap().is_empty());

    let frob = Message::method_call(None, "/", Some("org.example.Test"), "Frob").unwrap();
    match client.call(frob).unwrap_err().kind() {
        ErrorKind::ErrorReply(e) => {
            assert_eq!(e.name(), ErrorName::UnknownMethod.as_str());
        }
        kind => panic!("unexpected error {:?}", kind),
    }

    client.close();
    stop.store(true, Ordering::SeqCst);
    handle.join().unwrap().unwrap();
}
