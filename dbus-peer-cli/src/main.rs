use std::fs;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{crate_version, Arg, ArgAction, ArgMatches, Command};
use dbus_peer::{
    BusAddress, BusConnection, Channel, ChannelConfig, DBusError, ErrorName, ListenConfig,
    Message, MessageType, ObjectPath, Server, Signature, TypeCode, TypeNode, Value, Variant,
};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[cfg(test)]
mod test;

const PEER_INTERFACE: &str = "org.freedesktop.DBus.Peer";
const MACHINE_ID_PATHS: &[&str] = &["/etc/machine-id", "/var/lib/dbus/machine-id"];

/// Converts one command line argument to a value of type `t`.
///
/// Basic types are taken literally, containers and variants are read as JSON.
fn parse_arg(t: &TypeNode, text: &str) -> Result<Value> {
    if t.code().is_basic() {
        return parse_basic(t.code(), text);
    }
    let json: serde_json::Value =
        serde_json::from_str(text).with_context(|| format!("'{}' is not valid JSON", text))?;
    from_json(t, &json)
}

fn parse_basic(code: TypeCode, text: &str) -> Result<Value> {
    let invalid = || anyhow!("'{}' is not a valid '{}'", text, code.as_char());
    Ok(match code {
        TypeCode::Byte => Value::Byte(text.parse().map_err(|_| invalid())?),
        TypeCode::Boolean => match text {
            "true" | "1" | "yes" => Value::Boolean(true),
            "false" | "0" | "no" => Value::Boolean(false),
            _ => return Err(invalid()),
        },
        TypeCode::Int16 => Value::Int16(text.parse().map_err(|_| invalid())?),
        TypeCode::Uint16 => Value::Uint16(text.parse().map_err(|_| invalid())?),
        TypeCode::Int32 => Value::Int32(text.parse().map_err(|_| invalid())?),
        TypeCode::Uint32 => Value::Uint32(text.parse().map_err(|_| invalid())?),
        TypeCode::Int64 => Value::Int64(text.parse().map_err(|_| invalid())?),
        TypeCode::Uint64 => Value::Uint64(text.parse().map_err(|_| invalid())?),
        TypeCode::Double => Value::Double(text.parse().map_err(|_| invalid())?),
        TypeCode::String => Value::String(text.to_string()),
        TypeCode::ObjectPath => Value::ObjectPath(ObjectPath::new(text)?),
        TypeCode::Signature => Value::Signature(Signature::parse(text)?),
        _ => bail!("'{}' is not a basic type", code.as_char()),
    })
}

fn from_json(t: &TypeNode, json: &serde_json::Value) -> Result<Value> {
    use serde_json::Value as Json;

    match (t.code(), json) {
        (code, Json::String(s)) if code.is_basic() => parse_basic(code, s),
        (TypeCode::Boolean, Json::Bool(b)) => Ok(Value::Boolean(*b)),
        (code, Json::Number(n)) if code.is_basic() => parse_basic(code, &n.to_string()),
        (TypeCode::Array, Json::Object(map)) => {
            let entry = t
                .element()
                .ok_or_else(|| anyhow!("array without element type"))?;
            let (key_type, value_type) = entry
                .key_value()
                .ok_or_else(|| anyhow!("a JSON object needs a dict type, not '{}'", t))?;
            let entries = map
                .iter()
                .map(|(k, v)| Ok((parse_basic(key_type.code(), k)?, from_json(value_type, v)?)))
                .collect::<Result<Vec<_>>>()?;
            Ok(Value::dict(entries))
        }
        (TypeCode::Array, Json::Array(items)) => {
            let element = t
                .element()
                .ok_or_else(|| anyhow!("array without element type"))?;
            let items = items
                .iter()
                .map(|item| from_json(element, item))
                .collect::<Result<Vec<_>>>()?;
            Ok(Value::Array(items))
        }
        (TypeCode::Struct, Json::Array(items)) => {
            if items.len() != t.children().len() {
                bail!(
                    "struct '{}' needs {} fields, got {}",
                    t,
                    t.children().len(),
                    items.len()
                );
            }
            let fields = t
                .children()
                .iter()
                .zip(items)
                .map(|(t, item)| from_json(t, item))
                .collect::<Result<Vec<_>>>()?;
            Ok(Value::Struct(fields))
        }
        (TypeCode::Variant, json) => Ok(Value::Variant(Box::new(infer_variant(json)?))),
        (_, json) => bail!("cannot convert {} to '{}'", json, t),
    }
}

/// Picks the obvious D-Bus type for a JSON value inside a variant.
fn infer_variant(json: &serde_json::Value) -> Result<Variant> {
    use serde_json::Value as Json;

    let value = match json {
        Json::Bool(b) => Value::Boolean(*b),
        Json::String(s) => Value::String(s.clone()),
        Json::Number(n) => match (n.as_i64(), n.as_u64(), n.as_f64()) {
            (Some(i), _, _) => Value::Int64(i),
            (None, Some(u), _) => Value::Uint64(u),
            (None, None, Some(f)) => Value::Double(f),
            _ => bail!("cannot represent {}", n),
        },
        Json::Object(map) => Value::dict(
            map.iter()
                .map(|(k, v)| Ok((Value::from(k.as_str()), Value::Variant(Box::new(infer_variant(v)?)))))
                .collect::<Result<Vec<_>>>()?,
        ),
        Json::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| Ok(Value::Variant(Box::new(infer_variant(v)?))))
                .collect::<Result<Vec<_>>>()?,
        ),
        Json::Null => bail!("null has no D-Bus type"),
    };
    Ok(Variant::from_value(value)?)
}

/// Builds the body of a call from `signature` and one argument per type.
fn parse_args(signature: &Signature, args: &[&str]) -> Result<Vec<Value>> {
    if signature.len() != args.len() {
        bail!(
            "signature '{}' needs {} arguments, got {}",
            signature,
            signature.len(),
            args.len()
        );
    }
    signature
        .types()
        .iter()
        .zip(args)
        .map(|(t, arg)| parse_arg(t, arg))
        .collect()
}

/// Splits `org.example.Iface.Member` at the last dot.
fn split_member(method: &str) -> Result<(&str, &str)> {
    match method.rsplit_once('.') {
        Some((interface, member)) if !interface.is_empty() && !member.is_empty() => {
            Ok((interface, member))
        }
        _ => bail!("'{}' is not of the form INTERFACE.MEMBER", method),
    }
}

fn channel_config(matches: &ArgMatches) -> Result<ChannelConfig> {
    let mut config = ChannelConfig::default();
    if let Some(secs) = matches.get_one::<u64>("timeout") {
        config.call_timeout = Some(Duration::from_secs(*secs));
    }
    Ok(config)
}

fn connect(matches: &ArgMatches) -> Result<Channel> {
    let config = channel_config(matches)?;
    let bus = if let Some(address) = matches.get_one::<String>("address") {
        let addresses = BusAddress::parse_list(address)?;
        if !matches.get_flag("bus") {
            let first = addresses
                .first()
                .ok_or_else(|| anyhow!("empty address '{}'", address))?;
            let channel = Channel::connect(first, config)
                .with_context(|| format!("connecting to {}", first))?;
            return Ok(channel);
        }
        BusConnection::open(&addresses, config)?
    } else if matches.get_flag("system") {
        BusConnection::open(&dbus_peer::address::system_bus_address()?, config)?
    } else {
        BusConnection::open(&dbus_peer::address::session_bus_address()?, config)?
    };
    info!("connected as {}", bus.unique_name());
    Ok(bus.channel().clone())
}

fn print_reply(reply: &Message) -> Result<()> {
    let values = reply.body_values()?;
    match values.len() {
        0 => {}
        1 => println!("{}", serde_json::to_string_pretty(&values[0])?),
        _ => println!("{}", serde_json::to_string_pretty(&values)?),
    }
    Ok(())
}

fn dbus_call(matches: &ArgMatches, sub: &ArgMatches) -> Result<()> {
    let destination = sub
        .get_one::<String>("DESTINATION")
        .map(String::as_str)
        .filter(|d| !d.is_empty() && *d != "-");
    let path = sub
        .get_one::<String>("PATH")
        .ok_or_else(|| anyhow!("missing object path"))?;
    let method = sub
        .get_one::<String>("METHOD")
        .ok_or_else(|| anyhow!("missing method"))?;
    let (interface, member) = split_member(method)?;

    let signature = match sub.get_one::<String>("signature") {
        Some(s) => Signature::parse(s)?,
        None => Signature::empty(),
    };
    let args: Vec<&str> = sub
        .get_many::<String>("ARGUMENTS")
        .map(|v| v.map(String::as_str).collect())
        .unwrap_or_default();
    let values = parse_args(&signature, &args)?;

    let mut msg = Message::method_call(destination, path, Some(interface), member)?;
    msg.set_body(&signature, &values)?;

    let channel = connect(matches)?;
    let reply = channel
        .call(msg)
        .with_context(|| format!("calling {}", method))?;
    print_reply(&reply)?;
    channel.close();
    Ok(())
}

fn dbus_ping(matches: &ArgMatches, sub: &ArgMatches) -> Result<()> {
    let destination = sub.get_one::<String>("DESTINATION").map(String::as_str);
    let msg = Message::method_call(destination, "/", Some(PEER_INTERFACE), "Ping")?;

    let channel = connect(matches)?;
    let started = std::time::Instant::now();
    channel.call(msg).context("ping")?;
    println!("reply in {:?}", started.elapsed());
    channel.close();
    Ok(())
}

fn machine_id() -> Option<String> {
    MACHINE_ID_PATHS
        .iter()
        .filter_map(|path| fs::read_to_string(path).ok())
        .map(|id| id.trim().to_string())
        .find(|id| !id.is_empty())
}

/// Answers the `org.freedesktop.DBus.Peer` methods and rejects every other call.
fn peer_handler(msg: &Message, channel: &Channel) -> dbus_peer::Result<bool> {
    if msg.message_type() != MessageType::MethodCall {
        return Ok(false);
    }
    debug!("serving {}", msg);

    let member = msg.member().unwrap_or_default();
    let reply = match (msg.interface(), member) {
        (Some(PEER_INTERFACE) | None, "Ping") => Message::method_return(msg),
        (Some(PEER_INTERFACE) | None, "GetMachineId") => match machine_id() {
            Some(id) => Message::method_return(msg).with_args(vec![Value::String(id)])?,
            None => DBusError::new(ErrorName::Failed, "no machine id available").to_message(msg)?,
        },
        (interface, member) => DBusError::new(
            ErrorName::UnknownMethod,
            format!(
                "no method '{}' on interface '{}'",
                member,
                interface.unwrap_or_default()
            ),
        )
        .to_message(msg)?,
    };

    if msg.expects_reply() {
        channel.emit(reply)?;
    }
    Ok(true)
}

fn dbus_serve(sub: &ArgMatches) -> Result<()> {
    let address = sub
        .get_one::<String>("LISTEN")
        .ok_or_else(|| anyhow!("missing listen address"))?;
    let address = BusAddress::parse(address)?;

    let mut config = ListenConfig::default();
    if let Some(secs) = sub.get_one::<u64>("idle") {
        config.idle_timeout = *secs;
    }

    let server = Server::bind(&address, config)?;
    server.add_handler(peer_handler);
    println!("{}", server.local_address()?);
    info!("listening with guid {}", server.guid());
    server.run()?;
    Ok(())
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn cli() -> Command {
    Command::new("dbus-peer")
        .version(crate_version!())
        .about("Talk to D-Bus peers and message buses")
        .subcommand_required(true)
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::Count)
                .global(true)
                .help("log more, repeat for more detail"),
        )
        .arg(
            Arg::new("address")
                .short('a')
                .long("address")
                .value_name("ADDRESS")
                .help("connect directly to ADDRESS instead of a message bus")
                .conflicts_with_all(["session", "system"]),
        )
        .arg(
            Arg::new("bus")
                .long("bus")
                .action(ArgAction::SetTrue)
                .requires("address")
                .help("treat ADDRESS as a message bus and say Hello"),
        )
        .arg(
            Arg::new("session")
                .long("session")
                .action(ArgAction::SetTrue)
                .help("use the session bus (default)"),
        )
        .arg(
            Arg::new("system")
                .long("system")
                .action(ArgAction::SetTrue)
                .conflicts_with("session")
                .help("use the system bus"),
        )
        .arg(
            Arg::new("timeout")
                .short('t')
                .long("timeout")
                .value_name("SECONDS")
                .value_parser(clap::value_parser!(u64))
                .help("time in seconds to wait for a reply"),
        )
        .subcommand(
            Command::new("call")
                .about("Call a method")
                .long_about(
                    "Call METHOD on the object at PATH owned by DESTINATION. Basic arguments \
                     are given as plain text, containers and variants as JSON.",
                )
                .arg(
                    Arg::new("signature")
                        .short('s')
                        .long("signature")
                        .value_name("SIGNATURE")
                        .help("type signature of ARGUMENTS"),
                )
                .arg(
                    Arg::new("DESTINATION")
                        .required(true)
                        .help("bus name of the peer, '-' for none"),
                )
                .arg(Arg::new("PATH").required(true))
                .arg(
                    Arg::new("METHOD")
                        .value_name("INTERFACE.MEMBER")
                        .required(true),
                )
                .arg(Arg::new("ARGUMENTS").num_args(0..)),
        )
        .subcommand(
            Command::new("ping")
                .about("Ping a peer")
                .arg(Arg::new("DESTINATION").help("bus name of the peer")),
        )
        .subcommand(
            Command::new("serve")
                .about("Answer org.freedesktop.DBus.Peer calls on ADDRESS")
                .arg(Arg::new("LISTEN").value_name("ADDRESS").required(true))
                .arg(
                    Arg::new("idle")
                        .long("idle")
                        .value_name("SECONDS")
                        .value_parser(clap::value_parser!(u64))
                        .help("quit after SECONDS without clients"),
                ),
        )
}

fn do_main(matches: &ArgMatches) -> Result<()> {
    match matches.subcommand() {
        Some(("call", sub)) => dbus_call(matches, sub),
        Some(("ping", sub)) => dbus_ping(matches, sub),
        Some(("serve", sub)) => dbus_serve(sub),
        _ => bail!("no subcommand given"),
    }
}

fn main() {
    let matches = cli().get_matches();
    init_logging(matches.get_count("verbose"));

    if let Err(e) = do_main(&matches) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
