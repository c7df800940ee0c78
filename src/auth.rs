use crate::error::{ProxyError, Result};
use crate::protocol::{AuthMethod, AuthStatus, USERPASS_VERSION, Version};
use std::collections::HashMap;
use std::str::FromStr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// UserPass holds one username/password pair as configured
/// server-side
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserPass {
    pub username: String,
    pub password: String,
}

/// UserPass implementation block
impl UserPass {
    /// new checks both fields fit the one-octet RFC 1929 length prefixes
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Result<Self> {
        let (username, password) = (username.into(), password.into());

        if username.is_empty() || username.len() > u8::MAX as usize {
            return Err(ProxyError::Config(format!(
                "username must be 1 to 255 bytes: {username:?}"
            )));
        }
        if password.len() > u8::MAX as usize {
            return Err(ProxyError::Config(format!(
                "password for {username:?} exceeds 255 bytes"
            )));
        }

        Ok(UserPass { username, password })
    }
}

/// Parses `user:pass`; the password may itself contain ':'
impl FromStr for UserPass {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self> {
        let (username, password) = s
            .split_once(':')
            .ok_or_else(|| ProxyError::Config(format!("expected user:pass, got {s:?}")))?;

        UserPass::new(username, password)
    }
}

/// Credentials maps usernames to passwords; built once and never mutated
#[derive(Clone, Debug, Default)]
pub struct Credentials {
    users: HashMap<String, String>,
}

/// Credentials implementation block
impl Credentials {
    /// from_entries builds the set, rejecting duplicate usernames
    pub fn from_entries(entries: impl IntoIterator<Item = UserPass>) -> Result<Self> {
        let mut users = HashMap::new();
        for entry in entries {
            if users.contains_key(&entry.username) {
                return Err(ProxyError::Config(format!(
                    "duplicate username {:?}",
                    entry.username
                )));
            }
            users.insert(entry.username, entry.password);
        }
        Ok(Self { users })
    }

    /// verify succeeds only for an exact username/password pair
    pub fn verify(&self, username: &[u8], password: &[u8]) -> bool {
        let Ok(username) = std::str::from_utf8(username) else {
            return false;
        };
        self.users
            .get(username)
            .is_some_and(|stored| stored.as_bytes() == password)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

/// AuthMode selects which method the server insists on
#[derive(Clone, Debug, Default)]
pub enum AuthMode {
    #[default]
    None,
    UsernamePassword(Credentials),
}

/// AuthMode implementation block
impl AuthMode {
    /// required_method is the only method this mode accepts
    pub fn required_method(&self) -> AuthMethod {
        match self {
            AuthMode::None => AuthMethod::NoAuth,
            AuthMode::UsernamePassword(_) => AuthMethod::UserPass,
        }
    }
}

/// negotiate_auth handles authentication negotiation between the SOCKS server and client
pub async fn negotiate_auth<S>(stream: &mut S, mode: &AuthMode) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // ClientHello format
    // +----+----------+----------+
    // |VER | NMETHODS | METHODS  |
    // +----+----------+----------+
    // | 1  |    1     | 1 to 255 |
    // +----+----------+----------+

    // Instantiate handshake buffer & read
    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf).await?;

    // Parse version and client methods from handshake
    let version = buf[0];
    let n_methods = buf[1];

    // Ensure version is 0x05 -> SOCKS5
    if version != Version::SOCKS5 as u8 {
        return Err(ProxyError::UnsupportedVersion(version));
    }

    // Read offered methods
    let mut methods = vec![0u8; n_methods as usize];
    stream.read_exact(&mut methods).await?;

    // Retrieve desired method
    let method = select_auth_method(&methods, mode);

    // ServerChoice method selection reply format
    // +----+--------+
    // |VER | METHOD |
    // +----+--------+
    // | 1  |   1    |
    // +----+--------+
    stream
        .write_all(&[Version::SOCKS5 as u8, method as u8])
        .await?;

    // Route to appropriate auth handler
    match (method, mode) {
        (AuthMethod::UserPass, AuthMode::UsernamePassword(credentials)) => {
            authenticate_userpass(stream, credentials).await
        }
        (AuthMethod::NoAuth, AuthMode::None) => Ok(()),
        _ => Err(ProxyError::NoAcceptableMethod),
    }
}

/// select_auth_method returns the method the mode requires when the client
/// offers it, and NoAcceptable otherwise
pub fn select_auth_method(client_methods: &[u8], mode: &AuthMode) -> AuthMethod {
    let required = mode.required_method();
    if client_methods.contains(&(required as u8)) {
        required
    } else {
        AuthMethod::NoAcceptable
    }
}

/// authenticate_userpass handles username/password authentication according to RFC 1929
async fn authenticate_userpass<S>(stream: &mut S, credentials: &Credentials) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Client Username/Password Request
    // +----+------+----------+------+----------+
    // |VER | ULEN |  UNAME   | PLEN |  PASSWD  |
    // +----+------+----------+------+----------+
    // | 1  |  1   | 1 to 255 |  1   | 1 to 255 |
    // +----+------+----------+------+----------+

    // Get sub-negotiation version -> 0x01 expected
    let version = stream.read_u8().await?;
    if version != USERPASS_VERSION {
        return Err(ProxyError::AuthVersion(version));
    }

    // Collect the frame field by field, then hand it to the slice parser
    let mut frame = vec![version];

    let username_len = stream.read_u8().await?;
    frame.push(username_len);
    read_into(stream, &mut frame, username_len as usize).await?;

    let password_len = stream.read_u8().await?;
    frame.push(password_len);
    read_into(stream, &mut frame, password_len as usize).await?;

    let (username, password) = parse_userpass(&frame)?;

    // Validate credentials
    let status = if credentials.verify(username, password) {
        AuthStatus::Success
    } else {
        AuthStatus::Failure
    };

    // Username/Password Server response
    // +----+--------+
    // |VER | STATUS |
    // +----+--------+
    // | 1  |   1    |
    // +----+--------+
    stream.write_all(&[USERPASS_VERSION, status as u8]).await?;

    match status {
        AuthStatus::Success => {
            debug!(user = %String::from_utf8_lossy(username), "authenticated");
            Ok(())
        }
        AuthStatus::Failure => Err(ProxyError::AuthFailed(
            String::from_utf8_lossy(username).into_owned(),
        )),
    }
}

/// parse_userpass splits an RFC 1929 request into username and password,
/// checking both declared lengths against the buffer
pub fn parse_userpass(data: &[u8]) -> Result<(&[u8], &[u8])> {
    let truncated = |needed: usize| ProxyError::Truncated {
        frame: "username/password request",
        needed,
        actual: data.len(),
    };

    if data.len() < 2 {
        return Err(truncated(2));
    }
    if data[0] != USERPASS_VERSION {
        return Err(ProxyError::AuthVersion(data[0]));
    }

    let username_len = data[1] as usize;
    let password_len_at = 2 + username_len;
    if data.len() < password_len_at + 1 {
        return Err(truncated(password_len_at + 1));
    }
    let username = &data[2..password_len_at];

    let password_len = data[password_len_at] as usize;
    let end = password_len_at + 1 + password_len;
    if data.len() < end {
        return Err(truncated(end));
    }
    let password = &data[password_len_at + 1..end];

    Ok((username, password))
}

/// read_into appends exactly `len` bytes from the stream to `buf`
async fn read_into<S>(stream: &mut S, buf: &mut Vec<u8>, len: usize) -> Result<()>
where
    S: AsyncRead + Unpin,
{
    let start = buf.len();
    buf.resize(start + len, 0);
    stream.read_exact(&mut buf[start..]).await?;
    Ok(())
}
