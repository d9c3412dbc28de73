//! EXTERNAL, ANONYMOUS and DBUS_COOKIE_SHA1.
//!
//! Each type implements both the client and the server side.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;
use sha1::{Digest, Sha1};
use tracing::{debug, warn};

use super::{
    auth_error, ClientMechanism, ClientSession, ServerMechanism, ServerSession, ServerStep,
};
use crate::error::{AuthFault, Result};

pub const EXTERNAL: &str = "EXTERNAL";
pub const ANONYMOUS: &str = "ANONYMOUS";
pub const DBUS_COOKIE_SHA1: &str = "DBUS_COOKIE_SHA1";

/// Cookie context used when none is configured.
pub const DEFAULT_COOKIE_CONTEXT: &str = "org_freedesktop_general";
/// Cookies older than this are not handed out for new handshakes.
const COOKIE_REUSE_SECS: u64 = 300;
/// Cookies older than this are dropped from the keyring.
const COOKIE_EXPIRE_SECS: u64 = 420;

#[cfg(unix)]
fn current_uid() -> u32 {
    // SAFETY: getuid has no preconditions and cannot fail
    unsafe { libc::getuid() }
}

fn mechanism_error(mechanism: &str, reason: impl ToString) -> crate::Error {
    auth_error(AuthFault::Mechanism {
        mechanism: mechanism.to_string(),
        reason: reason.to_string(),
    })
}

/// Authentication by the credentials of the connecting process.
///
/// The client claims a uid; the server accepts it when it matches the
/// configured uid, which defaults to the uid of the running process.
#[derive(Debug, Clone, Default)]
pub struct External {
    uid: Option<u32>,
}

impl External {
    pub fn new() -> Self {
        External { uid: None }
    }

    pub fn with_uid(uid: u32) -> Self {
        External { uid: Some(uid) }
    }

    fn uid(&self) -> u32 {
        self.uid.unwrap_or_else(current_uid)
    }
}

struct ExternalClient {
    uid: u32,
}

impl ClientSession for ExternalClient {
    fn initial_response(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(Some(self.uid.to_string().into_bytes()))
    }

    fn challenge(&mut self, _data: &[u8]) -> Result<Vec<u8>> {
        Ok(self.uid.to_string().into_bytes())
    }

    fn is_complete(&self) -> bool {
        true
    }
}

struct ExternalServer {
    uid: u32,
}

impl ServerSession for ExternalServer {
    fn step(&mut self, response: Option<&[u8]>) -> ServerStep {
        let response = match response {
            None => return ServerStep::Challenge(Vec::new()),
            Some(r) => r,
        };
        let claimed = std::str::from_utf8(response)
            .ok()
            .and_then(|s| s.parse::<u32>().ok());
        match claimed {
            Some(uid) if uid == self.uid => ServerStep::Complete,
            other => {
                debug!("EXTERNAL: rejecting uid {:?}", other);
                ServerStep::Reject
            }
        }
    }
}

impl ClientMechanism for External {
    fn name(&self) -> &str {
        EXTERNAL
    }

    fn start(&self) -> Result<Box<dyn ClientSession>> {
        Ok(Box::new(ExternalClient { uid: self.uid() }))
    }
}

impl ServerMechanism for External {
    fn name(&self) -> &str {
        EXTERNAL
    }

    fn start(&self) -> Box<dyn ServerSession> {
        Box::new(ExternalServer { uid: self.uid() })
    }
}

/// No authentication at all.
#[derive(Debug, Clone, Copy, Default)]
pub struct Anonymous;

impl ClientSession for Anonymous {
    fn initial_response(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    fn challenge(&mut self, _data: &[u8]) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    fn is_complete(&self) -> bool {
        true
    }
}

impl ServerSession for Anonymous {
    fn step(&mut self, _response: Option<&[u8]>) -> ServerStep {
        ServerStep::Complete
    }
}

impl ClientMechanism for Anonymous {
    fn name(&self) -> &str {
        ANONYMOUS
    }

    fn start(&self) -> Result<Box<dyn ClientSession>> {
        Ok(Box::new(Anonymous))
    }
}

impl ServerMechanism for Anonymous {
    fn name(&self) -> &str {
        ANONYMOUS
    }

    fn start(&self) -> Box<dyn ServerSession> {
        Box::new(Anonymous)
    }
}

/// Shared secret challenge/response using cookies in a keyring directory.
///
/// The keyring defaults to `$HOME/.dbus-keyrings`; each context is a file
/// in it with lines of `<id> <creation time> <cookie>`.
#[derive(Debug, Clone)]
pub struct CookieSha1 {
    keyring: Option<PathBuf>,
    context: String,
}

impl Default for CookieSha1 {
    fn default() -> Self {
        CookieSha1::new()
    }
}

impl CookieSha1 {
    pub fn new() -> Self {
        CookieSha1 {
            keyring: None,
            context: DEFAULT_COOKIE_CONTEXT.to_string(),
        }
    }

    pub fn with_keyring<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.keyring = Some(dir.into());
        self
    }

    /// Context the server issues cookies from.
    pub fn with_context<S: Into<String>>(mut self, context: S) -> Self {
        self.context = context.into();
        self
    }

    fn keyring_dir(&self) -> Result<PathBuf> {
        if let Some(ref dir) = self.keyring {
            return Ok(dir.clone());
        }
        match std::env::var_os("HOME") {
            Some(home) => Ok(Path::new(&home).join(".dbus-keyrings")),
            None => Err(mechanism_error(
                DBUS_COOKIE_SHA1,
                "HOME is not set, cannot locate the keyring",
            )),
        }
    }
}

/// Context names become file names; they must not escape the keyring.
pub fn validate_context(context: &str) -> Result<()> {
    let valid = !context.is_empty()
        && !context.starts_with('.')
        && !context
            .chars()
            .any(|c| c == '/' || c == '\\' || c.is_whitespace() || c.is_control());
    if valid {
        Ok(())
    } else {
        Err(auth_error(AuthFault::InvalidContext(context.to_string())))
    }
}

fn sha1_hex(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn random_bytes(n: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; n];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

#[derive(Debug, Clone, PartialEq)]
struct Cookie {
    id: u32,
    created: u64,
    secret: String,
}

fn parse_keyring(text: &str) -> Vec<Cookie> {
    text.lines()
        .filter_map(|line| {
            let mut parts = line.split(' ');
            let id = parts.next()?.parse().ok()?;
            let created = parts.next()?.parse().ok()?;
            let secret = parts.next()?.to_string();
            if parts.next().is_some() {
                return None;
            }
            Some(Cookie {
                id,
                created,
                secret,
            })
        })
        .collect()
}

/// Finds the secret for `id` in the keyring file of `context`.
fn find_cookie(dir: &Path, context: &str, id: &str) -> Result<String> {
    validate_context(context)?;
    let missing = || {
        auth_error(AuthFault::MissingCookie {
            context: context.to_string(),
            id: id.to_string(),
        })
    };
    let text = fs::read_to_string(dir.join(context)).map_err(|e| {
        debug!("cannot read keyring {}: {}", context, e);
        missing()
    })?;
    text.lines()
        .map(|line| line.split(' ').collect::<Vec<_>>())
        .find(|parts| parts.len() == 3 && parts[0] == id)
        .map(|parts| parts[2].to_string())
        .ok_or_else(missing)
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Returns a fresh enough cookie from `context`, creating one if needed.
fn load_or_create_cookie(dir: &Path, context: &str) -> Result<Cookie> {
    validate_context(context)?;
    let path = dir.join(context);
    let now = now_secs();

    let mut cookies: Vec<Cookie> = match fs::read_to_string(&path) {
        Ok(text) => parse_keyring(&text),
        Err(_) => Vec::new(),
    };
    cookies.retain(|c| now.saturating_sub(c.created) < COOKIE_EXPIRE_SECS);

    if let Some(c) = cookies
        .iter()
        .filter(|c| now.saturating_sub(c.created) < COOKIE_REUSE_SECS)
        .max_by_key(|c| c.created)
    {
        return Ok(c.clone());
    }

    let cookie = Cookie {
        id: next_cookie_id(&cookies),
        created: now,
        secret: hex::encode(random_bytes(24)),
    };
    cookies.push(cookie.clone());
    write_keyring(dir, &path, &cookies)?;
    Ok(cookie)
}

/// One past the highest id in use, or the lowest free id once that wraps.
fn next_cookie_id(cookies: &[Cookie]) -> u32 {
    match cookies.iter().map(|c| c.id).max() {
        None => 1,
        Some(id) => id.checked_add(1).unwrap_or_else(|| {
            (1..u32::MAX)
                .find(|id| cookies.iter().all(|c| c.id != *id))
                .unwrap_or(1)
        }),
    }
}

fn write_keyring(dir: &Path, path: &Path, cookies: &[Cookie]) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};

        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(dir)
            .map_err(map_context!())?;
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .map_err(map_context!())?;
        for c in cookies {
            writeln!(file, "{} {} {}", c.id, c.created, c.secret).map_err(map_context!())?;
        }
    }
    Ok(())
}

struct CookieClient {
    keyring: Result<PathBuf>,
    complete: bool,
}

impl ClientSession for CookieClient {
    fn initial_response(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(Some(current_uid().to_string().into_bytes()))
    }

    fn challenge(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let text = std::str::from_utf8(data)
            .map_err(|_| mechanism_error(DBUS_COOKIE_SHA1, "challenge is not text"))?;
        let parts: Vec<&str> = text.split(' ').collect();
        let (context, id, server_challenge) = match parts.as_slice() {
            [context, id, server] => (*context, *id, *server),
            _ => {
                return Err(mechanism_error(
                    DBUS_COOKIE_SHA1,
                    format!("invalid challenge '{}'", text),
                ))
            }
        };

        let dir = match self.keyring {
            Ok(ref dir) => dir,
            Err(ref e) => return Err(mechanism_error(DBUS_COOKIE_SHA1, e)),
        };
        let cookie = find_cookie(dir, context, id)?;

        let client_challenge = sha1_hex(&random_bytes(32));
        let response =
            sha1_hex(format!("{}:{}:{}", server_challenge, client_challenge, cookie).as_bytes());
        self.complete = true;
        Ok(format!("{} {}", client_challenge, response).into_bytes())
    }

    fn is_complete(&self) -> bool {
        self.complete
    }
}

enum CookieServerState {
    WaitingForUser,
    Challenged { server_challenge: String, secret: String },
}

struct CookieServer {
    keyring: Result<PathBuf>,
    context: String,
    state: CookieServerState,
}

impl CookieServer {
    fn challenge(&mut self) -> Result<ServerStep> {
        let dir = match self.keyring {
            Ok(ref dir) => dir.clone(),
            Err(ref e) => return Err(mechanism_error(DBUS_COOKIE_SHA1, e)),
        };
        let cookie = load_or_create_cookie(&dir, &self.context)?;
        let server_challenge = hex::encode(random_bytes(16));
        let challenge = format!("{} {} {}", self.context, cookie.id, server_challenge);
        self.state = CookieServerState::Challenged {
            server_challenge,
            secret: cookie.secret,
        };
        Ok(ServerStep::Challenge(challenge.into_bytes()))
    }
}

impl ServerSession for CookieServer {
    fn step(&mut self, response: Option<&[u8]>) -> ServerStep {
        match self.state {
            CookieServerState::WaitingForUser => match response {
                None => ServerStep::Challenge(Vec::new()),
                Some(_) => self.challenge().unwrap_or_else(|e| {
                    warn!("DBUS_COOKIE_SHA1: {}", e);
                    ServerStep::Reject
                }),
            },
            CookieServerState::Challenged {
                ref server_challenge,
                ref secret,
            } => {
                let text = response.and_then(|r| std::str::from_utf8(r).ok());
                let (client_challenge, hash) = match text.and_then(|t| t.split_once(' ')) {
                    Some(pair) => pair,
                    None => return ServerStep::Reject,
                };
                let expected = sha1_hex(
                    format!("{}:{}:{}", server_challenge, client_challenge, secret).as_bytes(),
                );
                if expected == hash {
                    ServerStep::Complete
                } else {
                    ServerStep::Reject
                }
            }
        }
    }
}

impl ClientMechanism for CookieSha1 {
    fn name(&self) -> &str {
        DBUS_COOKIE_SHA1
    }

    fn start(&self) -> Result<Box<dyn ClientSession>> {
        Ok(Box::new(CookieClient {
            keyring: self.keyring_dir(),
            complete: false,
        }))
    }
}

impl ServerMechanism for CookieSha1 {
    fn name(&self) -> &str {
        DBUS_COOKIE_SHA1
    }

    fn start(&self) -> Box<dyn ServerSession> {
        Box::new(CookieServer {
            keyring: self.keyring_dir(),
            context: self.context.clone(),
            state: CookieServerState::WaitingForUser,
        })
    }
}
