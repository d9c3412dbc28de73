use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use static_assertions::assert_impl_all;

use crate::auth::{self, Anonymous, ClientMechanism, ServerMechanism};
use crate::*;

assert_impl_all!(Channel: Send, Sync, Clone);
assert_impl_all!(Server: Send, Sync);
assert_impl_all!(PendingReply: Send);

fn client_config() -> ChannelConfig {
    let mechanisms: Vec<Arc<dyn ClientMechanism>> = vec![Arc::new(Anonymous)];
    ChannelConfig {
        mechanisms,
        call_timeout: Some(Duration::from_secs(10)),
        ..Default::default()
    }
}

fn listen_config() -> ListenConfig {
    let mechanisms: Vec<Arc<dyn ServerMechanism>> = vec![Arc::new(Anonymous)];
    ListenConfig {
        mechanisms,
        ..Default::default()
    }
}

fn call(member: &str) -> Message {
    Message::method_call(
        Some("org.example.Test"),
        "/org/example/Test",
        Some("org.example.Test"),
        member,
    )
    .unwrap()
}

/// Answers `Echo` with its arguments, `Delay` after sleeping the given
/// milliseconds, `Fail` with an error reply and `Broken` with a handler error.
fn test_service(msg: &Message, channel: &Channel) -> Result<bool> {
    if msg.message_type() != MessageType::MethodCall {
        return Ok(false);
    }
    match msg.member() {
        Some("Echo") => {
            let mut reply = Message::method_return(msg);
            reply.set_body(&msg.signature(), &msg.body_values()?)?;
            channel.emit(reply)?;
            Ok(true)
        }
        Some("Delay") => {
            let delay = msg.body_values()?[0].as_u32().unwrap_or(0);
            let mut reply = Message::method_return(msg);
            reply.set_body(&msg.signature(), &msg.body_values()?)?;
            let channel = channel.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(u64::from(delay)));
                let _ = channel.emit(reply);
            });
            Ok(true)
        }
        Some("Fail") => {
            let e = DBusError::new(ErrorName::UnknownMethod, "no such method");
            channel.emit(e.to_message(msg)?)?;
            Ok(true)
        }
        Some("Stray") => {
            let mut unrelated = call("Unrelated");
            unrelated.set_serial(999);
            channel.emit(Message::method_return(&unrelated))?;
            channel.emit(Message::method_return(msg))?;
            Ok(true)
        }
        Some("Broken") => Err(context!(ErrorKind::InvalidArgument("broken".into()))),
        _ => Ok(false),
    }
}

fn channel_pair() -> (Channel, Channel) {
    let (client, server) = UnixStream::pair().unwrap();

    let child = thread::spawn(move || {
        let mechanisms: Vec<Arc<dyn ServerMechanism>> = vec![Arc::new(Anonymous)];
        Channel::server_over(
            Box::new(server),
            "0123456789abcdef0123456789abcdef",
            &mechanisms,
            listen_config().channel,
        )
        .unwrap()
    });

    let client = Channel::client_over(Box::new(client), client_config()).unwrap();
    let server = child.join().unwrap();
    server.add_handler(test_service);
    (client, server)
}

fn wait_until<F: Fn() -> bool>(f: F) -> bool {
    for _ in 0..200 {
        if f() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

#[test]
fn test_channel_call() {
    let (client, server) = channel_pair();
    assert_eq!(client.state(), ChannelState::Connected);
    assert_eq!(client.role(), Role::Client);
    assert_eq!(server.role(), Role::Server);
    assert_eq!(
        client.server_guid().as_deref(),
        Some("0123456789abcdef0123456789abcdef")
    );

    let msg = call("Echo")
        .with_args(vec!["hello".into(), 42i32.into()])
        .unwrap();
    let reply = client.call(msg).unwrap();
    assert_eq!(reply.message_type(), MessageType::MethodReturn);
    assert_eq!(reply.signature().to_string(), "si");
    assert_eq!(
        reply.body_values().unwrap(),
        vec![Value::from("hello"), Value::Int32(42)]
    );
    assert_eq!(client.pending_calls(), 0);
}

#[test]
fn test_serials() {
    let (client, _server) = channel_pair();
    let a = client.next_serial();
    let b = client.next_serial();
    assert_eq!(b, a + 1);
    assert!(a >= 1);

    let e = client.send(call("Echo")).unwrap_err();
    assert_eq!(*e.kind(), ErrorKind::Frame(FrameFault::ZeroSerial));
}

#[test]
fn test_concurrent_calls_get_their_own_reply() {
    let (client, _server) = channel_pair();

    let threads: Vec<_> = [300u32, 200, 100, 10]
        .iter()
        .map(|&delay| {
            let client = client.clone();
            thread::spawn(move || {
                let msg = call("Delay").with_args(vec![delay.into()]).unwrap();
                let reply = client.call(msg).unwrap();
                reply.body_values().unwrap()[0].as_u32().unwrap()
            })
        })
        .collect();

    let got: Vec<u32> = threads.into_iter().map(|t| t.join().unwrap()).collect();
    assert_eq!(got, vec![300, 200, 100, 10]);
}

#[test]
fn test_error_reply() {
    let (client, _server) = channel_pair();
    let e = client.call(call("Fail")).unwrap_err();
    match e.kind() {
        ErrorKind::ErrorReply(DBusError::Standard { name, message }) => {
            assert_eq!(*name, ErrorName::UnknownMethod);
            assert_eq!(message.as_deref(), Some("no such method"));
        }
        kind => panic!("Unknown error {:?}", kind),
    }
}

#[test]
fn test_unmatched_reply_reaches_handlers() {
    let (client, _server) = channel_pair();
    let (tx, rx) = mpsc::channel();
    let tx = std::sync::Mutex::new(tx);
    client.add_handler(move |msg: &Message, _: &Channel| -> Result<bool> {
        if msg.reply_serial() == Some(999) {
            let _ = tx.lock().unwrap().send(msg.serial());
            return Ok(true);
        }
        Ok(false)
    });

    client.call(call("Stray")).unwrap();
    rx.recv_timeout(Duration::from_secs(5)).unwrap();
}

#[test]
fn test_handler_error_keeps_reader_running() {
    let (client, _server) = channel_pair();
    let mut broken = call("Broken");
    broken.set_flags(MessageFlags::NO_REPLY_EXPECTED);
    client.emit(broken).unwrap();

    let reply = client
        .call(call("Echo").with_args(vec!["still here".into()]).unwrap())
        .unwrap();
    assert_eq!(reply.body_values().unwrap(), vec![Value::from("still here")]);
}

#[test]
fn test_close_fails_pending_calls() {
    let (client, _server) = channel_pair();

    let mut msg = call("Ignored");
    msg.set_serial(client.next_serial());
    let pending = client.send_with_reply(msg).unwrap();
    assert_eq!(client.pending_calls(), 1);

    client.close();
    client.close();
    assert!(pending.wait().unwrap_err().kind().is_closed());
    assert_eq!(client.state(), ChannelState::Disconnected);
    assert!(client.emit(call("Echo")).unwrap_err().kind().is_closed());
}

#[test]
fn test_peer_disconnect_fails_pending_calls() {
    let (client, server) = channel_pair();
    let (tx, rx) = mpsc::channel();
    client.on_disconnect(move || {
        let _ = tx.send(());
    });

    let mut msg = call("Ignored");
    msg.set_serial(client.next_serial());
    let pending = client.send_with_reply(msg).unwrap();

    server.close();
    assert!(pending.wait().unwrap_err().kind().is_closed());
    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(client.state(), ChannelState::Disconnected);
}

#[test]
fn test_malformed_frame_is_dropped() {
    let (mut raw, server) = UnixStream::pair().unwrap();

    let child = thread::spawn(move || {
        let mechanisms: Vec<Arc<dyn ServerMechanism>> = vec![Arc::new(Anonymous)];
        Channel::server_over(Box::new(server), "feed", &mechanisms, listen_config().channel)
            .unwrap()
    });
    let mechanisms: Vec<Arc<dyn ClientMechanism>> = vec![Arc::new(Anonymous)];
    assert_eq!(auth::authenticate_client(&mut raw, &mechanisms).unwrap(), "feed");
    let server = child.join().unwrap();
    server.add_handler(test_service);

    let mut bad = call("Echo");
    bad.set_serial(1);
    let mut bytes = frame::encode_message(&bad).unwrap();
    bytes[3] = 2;
    std::io::Write::write_all(&mut raw, &bytes).unwrap();

    let mut good = call("Echo").with_args(vec![7u32.into()]).unwrap();
    good.set_serial(2);
    frame::write_message(&mut raw, &good).unwrap();

    let reply = frame::read_message(&mut raw).unwrap();
    assert_eq!(reply.reply_serial(), Some(2));
    assert_eq!(reply.body_values().unwrap(), vec![Value::Uint32(7)]);
}

#[test]
fn test_big_endian_channel() {
    let (client, server) = UnixStream::pair().unwrap();
    let child = thread::spawn(move || {
        let mechanisms: Vec<Arc<dyn ServerMechanism>> = vec![Arc::new(Anonymous)];
        Channel::server_over(Box::new(server), "feed", &mechanisms, listen_config().channel)
            .unwrap()
    });
    let config = ChannelConfig {
        endian: Some(Endian::Big),
        ..client_config()
    };
    let client = Channel::client_over(Box::new(client), config).unwrap();
    let server = child.join().unwrap();
    server.add_handler(test_service);

    let reply = client
        .call(call("Echo").with_args(vec!["Test String".into()]).unwrap())
        .unwrap();
    assert_eq!(reply.endian(), Endian::Big);
    assert_eq!(reply.body_values().unwrap(), vec![Value::from("Test String")]);
}

fn run_server(address: &str) -> (Arc<Server>, Arc<AtomicBool>, thread::JoinHandle<Result<()>>) {
    let stop = Arc::new(AtomicBool::new(false));
    let config = ListenConfig {
        stop_listening: Some(Arc::clone(&stop)),
        poll_interval_ms: 20,
        ..listen_config()
    };
    let server = Arc::new(Server::bind(&BusAddress::parse(address).unwrap(), config).unwrap());
    server.add_handler(test_service);

    let s = Arc::clone(&server);
    let handle = thread::spawn(move || s.run());
    (server, stop, handle)
}

#[test]
fn test_server_tcp() {
    let (server, stop, handle) = run_server("tcp:host=127.0.0.1,port=0");
    let address = server.local_address().unwrap();
    assert_eq!(address.transport(), "tcp");
    assert_ne!(address.get("port"), Some("0"));

    let client = Channel::connect(&address, client_config()).unwrap();
    assert_eq!(client.server_guid().as_deref(), Some(server.guid()));
    let reply = client
        .call(call("Echo").with_args(vec![true.into()]).unwrap())
        .unwrap();
    assert_eq!(reply.body_values().unwrap(), vec![Value::Boolean(true)]);
    assert!(wait_until(|| server.clients().len() == 1));

    client.close();
    assert!(wait_until(|| server.clients().is_empty()));

    stop.store(true, Ordering::SeqCst);
    handle.join().unwrap().unwrap();
}

#[test]
fn test_server_unix_broadcast() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bus");
    let (server, stop, handle) = run_server(&format!("unix:path={}", path.display()));

    let address = server.local_address().unwrap();
    assert_eq!(address.get("path"), Some(path.to_str().unwrap()));

    let (tx, rx) = mpsc::channel();
    let clients: Vec<Channel> = (0..2)
        .map(|_| {
            let client = Channel::connect(&address, client_config()).unwrap();
            let tx = std::sync::Mutex::new(tx.clone());
            client.add_handler(move |msg: &Message, _: &Channel| -> Result<bool> {
                if msg.message_type() == MessageType::Signal {
                    let _ = tx.lock().unwrap().send(msg.member().map(String::from));
                    return Ok(true);
                }
                Ok(false)
            });
            client
        })
        .collect();
    assert!(wait_until(|| server.clients().len() == 2));

    let signal = Message::signal("/org/example/Test", "org.example.Test", "Changed").unwrap();
    assert_eq!(server.send(&signal), 2);
    for _ in 0..2 {
        let member = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(member.as_deref(), Some("Changed"));
    }

    drop(clients);
    stop.store(true, Ordering::SeqCst);
    handle.join().unwrap().unwrap();
    drop(server);
    assert!(!path.exists());
}

#[test]
fn test_client_reconnects_once() {
    let (server, stop, handle) = run_server("tcp:host=127.0.0.1,port=0");
    let address = server.local_address().unwrap();

    let client = Channel::connect(&address, client_config()).unwrap();
    client.call(call("Echo")).unwrap();
    assert!(wait_until(|| server.clients().len() == 1));

    // drop the connection from the server side
    for c in server.clients() {
        c.close();
    }

    let reconnected = wait_until(|| {
        client.is_connected() && client.call(call("Echo")).is_ok()
    });
    assert!(reconnected);
    assert!(wait_until(|| server.clients().len() == 1));

    stop.store(true, Ordering::SeqCst);
    handle.join().unwrap().unwrap();
}

#[test]
fn test_reconnect_failure_disconnects() {
    let (server, stop, handle) = run_server("tcp:host=127.0.0.1,port=0");
    let address = server.local_address().unwrap();
    let client = Channel::connect(&address, client_config()).unwrap();
    assert!(wait_until(|| server.clients().len() == 1));

    stop.store(true, Ordering::SeqCst);
    handle.join().unwrap().unwrap();
    drop(server);

    assert!(wait_until(|| client.state() == ChannelState::Disconnected));
    assert!(client.call(call("Echo")).unwrap_err().kind().is_closed());
}

#[test]
fn test_idle_timeout() {
    let config = ListenConfig {
        idle_timeout: 1,
        ..listen_config()
    };
    let server =
        Server::bind(&BusAddress::parse("tcp:host=127.0.0.1,port=0").unwrap(), config).unwrap();
    let e = server.run().unwrap_err();
    assert_eq!(*e.kind(), ErrorKind::Timeout);
}

fn name_signal(member: &str, name: Value) -> Result<Message> {
    let mut signal = Message::signal(bus::BUS_PATH, bus::BUS_INTERFACE, member)?;
    signal.set_sender(bus::BUS_NAME);
    signal.with_args(vec![name])
}

fn fake_bus(msg: &Message, channel: &Channel) -> Result<bool> {
    if msg.interface() != Some(bus::BUS_INTERFACE) {
        return Ok(false);
    }
    let reply = Message::method_return(msg);
    let reply = match msg.member() {
        Some("Hello") => reply.with_args(vec![":1.42".into()])?,
        Some("RequestName") => {
            let args = msg.body_values()?;
            let flags = args[1].as_u32().unwrap_or(0);
            let code = if flags & bus::NAME_FLAG_DO_NOT_QUEUE != 0 { 3u32 } else { 1 };
            if code == 1 {
                channel.emit(name_signal("NameAcquired", args[0].clone())?)?;
            }
            reply.with_args(vec![code.into()])?
        }
        Some("ReleaseName") => {
            let name = msg.body_values()?.remove(0);
            channel.emit(name_signal("NameLost", name)?)?;
            reply.with_args(vec![1u32.into()])?
        }
        Some("AddMatch") => reply,
        _ => return Ok(false),
    };
    channel.emit(reply)?;
    Ok(true)
}

#[test]
fn test_bus_connection() {
    let (client, server) = channel_pair();
    server.add_handler(fake_bus);

    let bus = BusConnection::hello(client).unwrap();
    assert_eq!(bus.unique_name(), ":1.42");
    assert_eq!(
        bus.request_name("org.example.Name", 0).unwrap(),
        RequestNameReply::PrimaryOwner
    );
    assert_eq!(
        bus.request_name("org.example.Name", bus::NAME_FLAG_DO_NOT_QUEUE)
            .unwrap(),
        RequestNameReply::Exists
    );
    bus.add_match("type='signal'").unwrap();
    assert!(bus.is_connected());
}

#[test]
fn test_bus_connection_tracks_names() {
    let (client, server) = channel_pair();
    server.add_handler(fake_bus);

    let bus = BusConnection::hello(client).unwrap();
    assert_eq!(bus.first_name(), ":1.42");
    assert!(bus.owns_name(":1.42"));

    bus.request_name("org.example.Name", 0).unwrap();
    assert!(wait_until(|| bus.owns_name("org.example.Name")));
    assert_eq!(
        bus.names().into_iter().collect::<Vec<_>>(),
        vec![":1.42".to_string(), "org.example.Name".to_string()]
    );

    assert_eq!(bus.release_name("org.example.Name").unwrap(), 1);
    assert!(wait_until(|| !bus.owns_name("org.example.Name")));

    // only the bus itself may report name changes
    let mut forged = name_signal("NameAcquired", "org.example.Forged".into()).unwrap();
    forged.set_sender(":1.7");
    server.emit(forged).unwrap();
    server
        .emit(name_signal("NameAcquired", "org.example.Later".into()).unwrap())
        .unwrap();
    assert!(wait_until(|| bus.owns_name("org.example.Later")));
    assert!(!bus.owns_name("org.example.Forged"));
}
