//! Minimal passive-mode FTP client (RFC 959, RFC 3659 MLSD/SIZE/REST).
//!
//! One [`FtpSource`] is one control connection. Listings prefer `MLSD`,
//! whose `type` fact is the server's own file/directory signal, and fall
//! back to `LIST` with the unix permission column. Reads issue `REST` +
//! `RETR`; a reader dropped before the transfer completes retires the
//! connection, since the control channel is then out of sync.

use eyre::{bail, eyre, Context, Result};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use super::{EntryKind, ReadSeek, RemoteEntry, Source, SourceParams};

/// A parsed control-channel reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub text: String,
}

impl Reply {
    fn is_preliminary(&self) -> bool {
        (100..200).contains(&self.code)
    }
}

pub struct FtpSource {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    peer: IpAddr,
    timeout: Option<Duration>,
    epsv: bool,
    retired: bool,
}

impl FtpSource {
    /// Connect, log in and switch to binary mode.
    pub fn connect(params: &SourceParams) -> Result<Self> {
        let host = params.host()?;
        let port = params.port()?;
        let timeout = params.timeout()?;

        let stream = open_stream((host, port), timeout)
            .wrap_err_with(|| format!("connect to {host}:{port}"))?;
        let peer = stream.peer_addr()?.ip();
        let writer = stream.try_clone()?;

        let mut source = Self {
            reader: BufReader::new(stream),
            writer,
            peer,
            timeout,
            epsv: true,
            retired: false,
        };

        let mut greeting = source.read_reply()?;
        while greeting.is_preliminary() {
            greeting = source.read_reply()?;
        }
        if greeting.code != 220 {
            return Err(reply_error("greeting", &greeting));
        }

        source.login(params.user(), params.password())?;
        source.expect("TYPE I", &[200])?;
        log::debug!("ftp session established with {host}:{port}");
        Ok(source)
    }

    fn login(&mut self, user: &str, password: &str) -> Result<()> {
        let reply = self.command(&format!("USER {user}"))?;
        match reply.code {
            230 => Ok(()),
            331 => {
                self.expect(&format!("PASS {password}"), &[230, 202])?;
                Ok(())
            }
            332 => bail!("FTP server requires an account (ACCT), which is not supported"),
            _ => Err(reply_error("USER", &reply)),
        }
    }

    fn read_reply(&mut self) -> Result<Reply> {
        read_reply(&mut self.reader)
    }

    fn command(&mut self, cmd: &str) -> Result<Reply> {
        if self.retired {
            bail!("FTP control connection retired after an abandoned transfer");
        }
        if cmd.starts_with("PASS ") {
            log::trace!("ftp> PASS ***");
        } else {
            log::trace!("ftp> {cmd}");
        }
        self.writer
            .write_all(format!("{cmd}\r\n").as_bytes())
            .wrap_err_with(|| format!("send {}", command_name(cmd)))?;
        self.writer.flush()?;
        let reply = self.read_reply()?;
        log::trace!("ftp< {} {}", reply.code, reply.text);
        Ok(reply)
    }

    fn expect(&mut self, cmd: &str, codes: &[u16]) -> Result<Reply> {
        let reply = self.command(cmd)?;
        if codes.contains(&reply.code) {
            Ok(reply)
        } else {
            Err(reply_error(command_name(cmd), &reply))
        }
    }

    /// Read the completion reply that follows a data transfer.
    fn expect_completion(&mut self, what: &str) -> Result<Reply> {
        let reply = self.read_reply()?;
        if matches!(reply.code, 226 | 250) {
            Ok(reply)
        } else {
            Err(reply_error(what, &reply))
        }
    }

    /// Open a passive data connection. The server-advertised address is
    /// ignored in favour of the control peer.
    fn open_data(&mut self) -> Result<TcpStream> {
        if self.epsv {
            let reply = self.command("EPSV")?;
            if reply.code == 229 {
                let port = parse_epsv(&reply.text)?;
                return open_stream(SocketAddr::new(self.peer, port), self.timeout)
                    .wrap_err("open EPSV data connection");
            }
            self.epsv = false;
        }
        let reply = self.expect("PASV", &[227])?;
        let (_advertised, port) = parse_pasv(&reply.text)?;
        open_stream(SocketAddr::new(self.peer, port), self.timeout)
            .wrap_err("open PASV data connection")
    }

    /// Run a listing command. `Ok(None)` means the server does not implement it.
    fn retrieve_listing(&mut self, cmd: &str) -> Result<Option<String>> {
        let mut data = self.open_data()?;
        let reply = self.command(cmd)?;
        if matches!(reply.code, 500 | 502 | 504) {
            return Ok(None);
        }
        if !reply.is_preliminary() {
            return Err(reply_error(command_name(cmd), &reply));
        }

        let mut raw = Vec::new();
        data.read_to_end(&mut raw)
            .wrap_err_with(|| format!("read {} data", command_name(cmd)))?;
        drop(data);
        self.expect_completion(command_name(cmd))?;
        Ok(Some(String::from_utf8_lossy(&raw).into_owned()))
    }
}

impl Source for FtpSource {
    fn list(&mut self, path: &str) -> Result<Vec<RemoteEntry>> {
        if let Some(text) = self.retrieve_listing(&format!("MLSD {path}"))? {
            return Ok(parse_mlsd(path, &text));
        }
        log::debug!("MLSD unsupported, falling back to LIST for {path}");
        let text = self
            .retrieve_listing(&format!("LIST {path}"))?
            .ok_or_else(|| eyre!("server supports neither MLSD nor LIST"))?;
        Ok(parse_list(path, &text))
    }

    fn stat(&mut self, path: &str) -> Result<u64> {
        let reply = self.expect(&format!("SIZE {path}"), &[213])?;
        reply
            .text
            .trim()
            .parse::<u64>()
            .map_err(|_| eyre!("malformed SIZE reply for {}: {}", path, reply.text))
    }

    fn open_read<'a>(&'a mut self, path: &str) -> Result<Box<dyn ReadSeek + 'a>> {
        if self.retired {
            bail!("FTP control connection retired after an abandoned transfer");
        }
        Ok(Box::new(FtpReader {
            source: self,
            path: path.to_string(),
            offset: 0,
            data: None,
            finished: false,
        }))
    }
}

impl Drop for FtpSource {
    fn drop(&mut self) {
        if !self.retired {
            let _ = self.writer.write_all(b"QUIT\r\n");
        }
    }
}

/// Byte stream over `REST` + `RETR`.
struct FtpReader<'a> {
    source: &'a mut FtpSource,
    path: String,
    offset: u64,
    data: Option<TcpStream>,
    finished: bool,
}

impl FtpReader<'_> {
    fn start_transfer(&mut self) -> Result<()> {
        let data = self.source.open_data()?;
        if self.offset > 0 {
            self.source
                .expect(&format!("REST {}", self.offset), &[350])?;
        }
        let reply = self.source.command(&format!("RETR {}", self.path))?;
        if !reply.is_preliminary() {
            return Err(reply_error("RETR", &reply));
        }
        self.data = Some(data);
        Ok(())
    }

    fn finish_transfer(&mut self) -> Result<()> {
        self.data = None;
        self.finished = true;
        self.source.expect_completion("RETR")?;
        Ok(())
    }
}

impl Read for FtpReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.finished || buf.is_empty() {
            return Ok(0);
        }
        if self.data.is_none() {
            self.start_transfer().map_err(to_io)?;
        }
        let n = match self.data.as_mut() {
            Some(data) => data.read(buf)?,
            None => return Ok(0),
        };
        if n == 0 {
            self.finish_transfer().map_err(to_io)?;
        } else {
            self.offset += n as u64;
        }
        Ok(n)
    }
}

impl Seek for FtpReader<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(n) => n,
            SeekFrom::Current(delta) => offset_by(self.offset, delta)?,
            SeekFrom::End(delta) => {
                if self.data.is_some() {
                    return Err(in_flight());
                }
                let size = self.source.stat(&self.path).map_err(to_io)?;
                offset_by(size, delta)?
            }
        };
        if target == self.offset {
            return Ok(target);
        }
        if self.data.is_some() {
            return Err(in_flight());
        }
        self.offset = target;
        self.finished = false;
        Ok(target)
    }
}

impl Drop for FtpReader<'_> {
    fn drop(&mut self) {
        if self.data.take().is_some() && !self.finished {
            log::debug!(
                "abandoned RETR {} at offset {}; retiring control connection",
                self.path,
                self.offset
            );
            self.source.retired = true;
        }
    }
}

fn in_flight() -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        "cannot seek an FTP transfer in flight",
    )
}

fn offset_by(base: u64, delta: i64) -> io::Result<u64> {
    base.checked_add_signed(delta).ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "seek to a negative offset")
    })
}

fn to_io(err: eyre::Report) -> io::Error {
    io::Error::new(io::ErrorKind::Other, format!("{err:#}"))
}

fn open_stream<A: ToSocketAddrs>(addr: A, timeout: Option<Duration>) -> io::Result<TcpStream> {
    let stream = match timeout {
        None => TcpStream::connect(addr)?,
        Some(limit) => {
            let mut last_err = None;
            let mut connected = None;
            for candidate in addr.to_socket_addrs()? {
                match TcpStream::connect_timeout(&candidate, limit) {
                    Ok(stream) => {
                        connected = Some(stream);
                        break;
                    }
                    Err(err) => last_err = Some(err),
                }
            }
            match connected {
                Some(stream) => stream,
                None => {
                    return Err(last_err.unwrap_or_else(|| {
                        io::Error::new(io::ErrorKind::NotFound, "host resolved to no addresses")
                    }))
                }
            }
        }
    };
    stream.set_read_timeout(timeout)?;
    stream.set_write_timeout(timeout)?;
    Ok(stream)
}

fn command_name(cmd: &str) -> &str {
    cmd.split_whitespace().next().unwrap_or(cmd)
}

fn reply_error(what: &str, reply: &Reply) -> eyre::Report {
    if (400..500).contains(&reply.code) {
        eyre!("{what}: transient reply {}: {}", reply.code, reply.text)
    } else {
        eyre!("{what}: reply {}: {}", reply.code, reply.text)
    }
}

/// Read one (possibly multi-line) reply from the control channel.
pub fn read_reply<R: BufRead>(reader: &mut R) -> Result<Reply> {
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        bail!("control connection closed by server");
    }
    let first = line.trim_end_matches(&['\r', '\n'][..]).to_string();
    let code_str = first
        .get(..3)
        .ok_or_else(|| eyre!("malformed reply: {:?}", first))?;
    let code: u16 = code_str
        .parse()
        .map_err(|_| eyre!("malformed reply code: {:?}", first))?;
    let mut text = first.get(4..).unwrap_or("").to_string();

    if first.as_bytes().get(3) == Some(&b'-') {
        let terminator = format!("{code_str} ");
        loop {
            line.clear();
            if reader.read_line(&mut line)? == 0 {
                bail!("control connection closed inside multi-line reply {code}");
            }
            let next = line.trim_end_matches(&['\r', '\n'][..]);
            if next == code_str {
                break;
            }
            text.push('\n');
            if let Some(rest) = next.strip_prefix(&terminator) {
                text.push_str(rest);
                break;
            }
            text.push_str(next);
        }
    }

    Ok(Reply { code, text })
}

/// Extract the port from a `229 Entering Extended Passive Mode (|||port|)` reply.
pub fn parse_epsv(text: &str) -> Result<u16> {
    let open = text.find('(').ok_or_else(|| eyre!("malformed EPSV reply: {}", text))?;
    let close = text[open..]
        .find(')')
        .map(|idx| open + idx)
        .ok_or_else(|| eyre!("malformed EPSV reply: {}", text))?;
    let inner = &text[open + 1..close];
    let delim = inner
        .chars()
        .next()
        .ok_or_else(|| eyre!("malformed EPSV reply: {}", text))?;
    let fields: Vec<&str> = inner.split(delim).collect();
    fields
        .get(3)
        .and_then(|port| port.parse::<u16>().ok())
        .ok_or_else(|| eyre!("malformed EPSV reply: {}", text))
}

/// Extract address and port from a `227 Entering Passive Mode (h1,h2,h3,h4,p1,p2)` reply.
pub fn parse_pasv(text: &str) -> Result<(Ipv4Addr, u16)> {
    let start = text
        .find(|c: char| c.is_ascii_digit())
        .ok_or_else(|| eyre!("malformed PASV reply: {}", text))?;
    let numbers: Vec<u8> = text[start..]
        .split(|c: char| !(c.is_ascii_digit() || c == ','))
        .next()
        .unwrap_or("")
        .split(',')
        .map(|n| n.trim().parse::<u8>())
        .collect::<std::result::Result<_, _>>()
        .map_err(|_| eyre!("malformed PASV reply: {}", text))?;
    if numbers.len() != 6 {
        bail!("malformed PASV reply: {}", text);
    }
    let addr = Ipv4Addr::new(numbers[0], numbers[1], numbers[2], numbers[3]);
    let port = (u16::from(numbers[4]) << 8) | u16::from(numbers[5]);
    Ok((addr, port))
}

/// Parse `MLSD` output; `cdir`, `pdir` and non file/dir types are skipped.
pub fn parse_mlsd(parent: &str, text: &str) -> Vec<RemoteEntry> {
    let mut entries = Vec::new();
    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        let Some((facts, name)) = line.split_once(' ') else {
            continue;
        };
        let name = name.rsplit('/').next().unwrap_or(name);
        if name.is_empty() || name == "." || name == ".." {
            continue;
        }
        let kind = facts
            .split(';')
            .filter_map(|fact| fact.split_once('='))
            .find(|(key, _)| key.eq_ignore_ascii_case("type"))
            .and_then(|(_, value)| match value.to_ascii_lowercase().as_str() {
                "file" => Some(EntryKind::File),
                "dir" => Some(EntryKind::Directory),
                _ => None,
            });
        if let Some(kind) = kind {
            entries.push(RemoteEntry::new(parent, name, kind));
        }
    }
    entries
}

/// Parse unix-style `LIST` output using the permission column's type flag.
pub fn parse_list(parent: &str, text: &str) -> Vec<RemoteEntry> {
    let mut entries = Vec::new();
    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        let kind = match line.chars().next() {
            Some('d') => EntryKind::Directory,
            Some('-') => EntryKind::File,
            _ => continue,
        };
        let Some(name) = field_remainder(line, 8) else {
            continue;
        };
        if name == "." || name == ".." {
            continue;
        }
        entries.push(RemoteEntry::new(parent, name, kind));
    }
    entries
}

/// Everything after the first `n` whitespace-separated fields.
fn field_remainder(line: &str, n: usize) -> Option<&str> {
    let mut rest = line.trim_start();
    for _ in 0..n {
        let idx = rest.find(char::is_whitespace)?;
        rest = rest[idx..].trim_start();
    }
    if rest.is_empty() {
        None
    } else {
        Some(rest)
    }
}
