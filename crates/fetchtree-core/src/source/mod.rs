//! Source connections: the transport the walker, coordinator and chunk
//! workers read from.
//!
//! Every worker opens its own connection through a [`Connector`]; handles are
//! never shared across threads because the transfer protocol keeps its read
//! cursor per connection.

use eyre::{bail, eyre, Result};
use percent_encoding::percent_decode_str;
use std::collections::BTreeMap;
use std::fmt;
use std::io::{Read, Seek};
use std::time::Duration;

pub mod ftp;
pub mod local;

pub use ftp::FtpSource;
pub use local::LocalSource;

/// Kind of a listed entry, taken from the transport's own type signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    File,
    Directory,
}

/// One immediate child of a listed directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub name: String,
    /// Full remote path of the entry (parent joined with `name`).
    pub path: String,
    pub kind: EntryKind,
}

impl RemoteEntry {
    pub fn new(parent: &str, name: impl Into<String>, kind: EntryKind) -> Self {
        let name = name.into();
        Self {
            path: join_remote(parent, &name),
            name,
            kind,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// Seekable byte stream returned by [`Source::open_read`].
pub trait ReadSeek: Read + Seek + Send {}

impl<T: Read + Seek + Send> ReadSeek for T {}

/// An independently usable connection to a source tree.
pub trait Source: Send {
    /// Non-recursive listing of `path`.
    fn list(&mut self, path: &str) -> Result<Vec<RemoteEntry>>;

    /// Size of the file at `path` in bytes.
    fn stat(&mut self, path: &str) -> Result<u64>;

    /// Open `path` for binary reading.
    fn open_read<'a>(&'a mut self, path: &str) -> Result<Box<dyn ReadSeek + 'a>>;
}

/// Builds fresh connections from connection parameters.
pub trait Connector: Send + Sync {
    fn connect(&self, params: &SourceParams) -> Result<Box<dyn Source>>;
}

/// Default connector: dispatches on the `scheme` parameter.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchemeConnector;

impl Connector for SchemeConnector {
    fn connect(&self, params: &SourceParams) -> Result<Box<dyn Source>> {
        match params.scheme() {
            "ftp" => Ok(Box::new(FtpSource::connect(params)?)),
            "file" => Ok(Box::new(LocalSource::new(params)?)),
            other => bail!("unsupported source scheme '{other}'"),
        }
    }
}

/// Credentials/address map handed to a [`Connector`].
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SourceParams {
    values: BTreeMap<String, String>,
}

impl SourceParams {
    pub const SCHEME: &'static str = "scheme";
    pub const HOST: &'static str = "host";
    pub const PORT: &'static str = "port";
    pub const USER: &'static str = "user";
    pub const PASSWORD: &'static str = "password";
    pub const ROOT: &'static str = "root";
    pub const TIMEOUT_SECS: &'static str = "timeout_secs";

    const DEFAULT_FTP_PORT: u16 = 21;

    pub fn new() -> Self {
        Self::default()
    }

    /// Parameters for a local directory tree rooted at `root`.
    pub fn local(root: impl Into<String>) -> Self {
        Self::new()
            .with(Self::SCHEME, "file")
            .with(Self::ROOT, root)
    }

    /// Parameters for an FTP server.
    pub fn ftp(host: impl Into<String>, port: u16) -> Self {
        Self::new()
            .with(Self::SCHEME, "ftp")
            .with(Self::HOST, host)
            .with(Self::PORT, port.to_string())
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn scheme(&self) -> &str {
        self.get(Self::SCHEME).unwrap_or("file")
    }

    pub fn host(&self) -> Result<&str> {
        self.get(Self::HOST)
            .filter(|h| !h.is_empty())
            .ok_or_else(|| eyre!("source parameters missing host"))
    }

    pub fn port(&self) -> Result<u16> {
        match self.get(Self::PORT) {
            None | Some("") => Ok(Self::DEFAULT_FTP_PORT),
            Some(raw) => raw
                .parse::<u16>()
                .map_err(|_| eyre!("invalid port '{}'", raw)),
        }
    }

    pub fn user(&self) -> &str {
        self.get(Self::USER).unwrap_or("anonymous")
    }

    pub fn password(&self) -> &str {
        self.get(Self::PASSWORD).unwrap_or("anonymous@")
    }

    pub fn root(&self) -> Option<&str> {
        self.get(Self::ROOT)
    }

    /// Optional connect/read deadline; absent means block indefinitely.
    pub fn timeout(&self) -> Result<Option<Duration>> {
        match self.get(Self::TIMEOUT_SECS) {
            None | Some("") | Some("0") => Ok(None),
            Some(raw) => raw
                .parse::<u64>()
                .map(|secs| Some(Duration::from_secs(secs)))
                .map_err(|_| eyre!("invalid timeout_secs '{}'", raw)),
        }
    }

    /// Parses `ftp://[user[:password]@]host[:port]/path`, `file:///path` or a
    /// bare local path into parameters plus the seed remote path.
    ///
    /// IPv6 hosts must be wrapped in `[]` (e.g. `ftp://[::1]:2121/pub`). For
    /// local trees the path becomes the `root` parameter and the seed is `/`.
    pub fn parse(raw: &str) -> Result<(Self, String)> {
        if let Some(body) = raw.strip_prefix("ftp://") {
            return Self::parse_ftp(body, raw);
        }
        if let Some(path) = raw.strip_prefix("file://") {
            if path.is_empty() {
                bail!("file URL missing path: {}", raw);
            }
            return Ok((Self::local(path), "/".to_string()));
        }
        if raw.contains("://") {
            bail!("unsupported source URL scheme: {}", raw);
        }
        if raw.is_empty() {
            bail!("source path cannot be empty");
        }
        Ok((Self::local(raw), "/".to_string()))
    }

    fn parse_ftp(body: &str, raw: &str) -> Result<(Self, String)> {
        let (authority, path) = match body.find('/') {
            Some(idx) => (&body[..idx], &body[idx..]),
            None => (body, "/"),
        };

        let (userinfo, hostport) = match authority.rsplit_once('@') {
            Some((user, host)) => (Some(user), host),
            None => (None, authority),
        };

        let (host, port) = parse_authority(hostport)
            .map_err(|err| eyre!("invalid FTP URL {}: {}", raw, err))?;

        let mut params = Self::ftp(host, port);
        if let Some(info) = userinfo {
            let (user, password) = match info.split_once(':') {
                Some((u, p)) => (u, Some(p)),
                None => (info, None),
            };
            let user = percent_decode(user)?;
            if user.is_empty() {
                bail!("FTP URL has empty user name: {}", raw);
            }
            params.insert(Self::USER, user);
            if let Some(password) = password {
                params.insert(Self::PASSWORD, percent_decode(password)?);
            }
        }

        Ok((params, normalize_remote(&percent_decode(path)?)))
    }
}

impl fmt::Debug for SourceParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (k, v) in &self.values {
            if k == Self::PASSWORD {
                map.entry(k, &"***");
            } else {
                map.entry(k, v);
            }
        }
        map.finish()
    }
}

/// Decode `%XX` escapes in one URL component.
fn percent_decode(component: &str) -> Result<String> {
    percent_decode_str(component)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|err| eyre!("invalid percent-encoding in FTP URL: {}", err))
}

fn parse_authority(authority: &str) -> Result<(String, u16)> {
    if authority.is_empty() {
        bail!("missing host component");
    }

    if authority.starts_with('[') {
        // IPv6 literal
        let closing = authority
            .find(']')
            .ok_or_else(|| eyre!("unterminated IPv6 address: {}", authority))?;
        let host = &authority[1..closing];
        let port = match authority.get(closing + 1..) {
            None | Some("") => SourceParams::DEFAULT_FTP_PORT,
            Some(rem) => match rem.strip_prefix(':') {
                Some(port) => parse_port(port)?,
                None => bail!("invalid authority {}", authority),
            },
        };
        return Ok((host.to_string(), port));
    }

    if let Some((host, port)) = authority.rsplit_once(':') {
        if host.is_empty() {
            bail!("missing host before port specification");
        }
        Ok((host.to_string(), parse_port(port)?))
    } else {
        Ok((authority.to_string(), SourceParams::DEFAULT_FTP_PORT))
    }
}

fn parse_port(raw: &str) -> Result<u16> {
    if raw.is_empty() {
        return Ok(SourceParams::DEFAULT_FTP_PORT);
    }
    raw.parse::<u16>()
        .map_err(|_| eyre!("invalid port '{}'", raw))
}

/// Join a child name onto a `/`-separated remote path.
pub fn join_remote(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        format!("/{name}")
    } else if parent.ends_with('/') {
        format!("{parent}{name}")
    } else {
        format!("{parent}/{name}")
    }
}

/// Collapse duplicate slashes and drop a trailing slash (except for `/`).
pub fn normalize_remote(path: &str) -> String {
    let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
    format!("/{}", parts.join("/"))
}
