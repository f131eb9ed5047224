//! Minimal single-user FTP server over loopback, enough for the client:
//! USER, PASS, TYPE, EPSV, PASV, MLSD, LIST, SIZE, REST, RETR, QUIT.

use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use fetchtree_core::EntryKind;

use super::FakeTree;

pub struct FtpServer {
    addr: SocketAddr,
    sessions: Arc<AtomicUsize>,
}

#[derive(Clone, Copy, Default)]
pub struct ServerOptions {
    /// Reply 502 to MLSD so clients fall back to LIST.
    pub no_mlsd: bool,
    /// Reply 502 to EPSV so clients fall back to PASV.
    pub no_epsv: bool,
}

impl FtpServer {
    pub fn start(tree: FakeTree) -> Self {
        Self::start_with(tree, ServerOptions::default())
    }

    pub fn start_with(tree: FakeTree, options: ServerOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind control listener");
        let addr = listener.local_addr().expect("local addr");
        let tree = Arc::new(tree);
        let sessions = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&sessions);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                counter.fetch_add(1, Ordering::SeqCst);
                let tree = Arc::clone(&tree);
                thread::spawn(move || {
                    let _ = Session::new(stream, tree, options).serve();
                });
            }
        });
        Self { addr, sessions }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Control connections accepted so far.
    pub fn sessions(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }
}

struct Session {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    tree: Arc<FakeTree>,
    options: ServerOptions,
    passive: Option<TcpListener>,
    rest: u64,
    logged_in: bool,
}

impl Session {
    fn new(stream: TcpStream, tree: Arc<FakeTree>, options: ServerOptions) -> Self {
        let writer = stream.try_clone().expect("clone control stream");
        Self {
            reader: BufReader::new(stream),
            writer,
            tree,
            options,
            passive: None,
            rest: 0,
            logged_in: false,
        }
    }

    fn reply(&mut self, code: u16, text: &str) -> std::io::Result<()> {
        self.writer.write_all(format!("{code} {text}\r\n").as_bytes())?;
        self.writer.flush()
    }

    fn serve(mut self) -> std::io::Result<()> {
        self.writer
            .write_all(b"220-fetchtree test server\r\n220 ready\r\n")?;
        let mut line = String::new();
        loop {
            line.clear();
            if self.reader.read_line(&mut line)? == 0 {
                return Ok(());
            }
            let line = line.trim_end().to_string();
            let (cmd, arg) = match line.split_once(' ') {
                Some((cmd, arg)) => (cmd.to_ascii_uppercase(), arg.to_string()),
                None => (line.to_ascii_uppercase(), String::new()),
            };
            match cmd.as_str() {
                "USER" => self.reply(331, "password required")?,
                "PASS" => {
                    self.logged_in = true;
                    self.reply(230, "logged in")?
                }
                "QUIT" => {
                    self.reply(221, "bye")?;
                    return Ok(());
                }
                _ if !self.logged_in => {
                    self.reply(530, "not logged in")?
                }
                "TYPE" => self.reply(200, "type set")?,
                "EPSV" if self.options.no_epsv => self.reply(502, "EPSV not implemented")?,
                "EPSV" => {
                    let listener = TcpListener::bind("127.0.0.1:0")?;
                    let port = listener.local_addr()?.port();
                    self.passive = Some(listener);
                    self.reply(229, &format!("Entering Extended Passive Mode (|||{port}|)"))?
                }
                "PASV" => {
                    let listener = TcpListener::bind("127.0.0.1:0")?;
                    let port = listener.local_addr()?.port();
                    self.passive = Some(listener);
                    self.reply(
                        227,
                        &format!("Entering Passive Mode (127,0,0,1,{},{})", port >> 8, port & 0xff),
                    )?
                }
                "MLSD" if self.options.no_mlsd => self.reply(502, "MLSD not implemented")?,
                "MLSD" | "LIST" => self.listing(&cmd, &arg)?,
                "SIZE" => match self.tree.contents(&arg) {
                    Some(data) => self.reply(213, &data.len().to_string())?,
                    None => self.reply(550, "no such file")?,
                },
                "REST" => match arg.parse::<u64>() {
                    Ok(offset) => {
                        self.rest = offset;
                        self.reply(350, "restarting")?
                    }
                    Err(_) => self.reply(501, "bad offset")?,
                },
                "RETR" => self.retrieve(&arg)?,
                _ => self.reply(502, "command not implemented")?,
            }
        }
    }

    fn data_connection(&mut self) -> Option<TcpStream> {
        let listener = self.passive.take()?;
        listener.accept().ok().map(|(stream, _)| stream)
    }

    fn listing(&mut self, cmd: &str, path: &str) -> std::io::Result<()> {
        let path = if path.is_empty() { "/" } else { path };
        if !self.tree.is_dir(path) {
            self.passive = None;
            return self.reply(550, "not a directory");
        }
        let Some(mut data) = self.data_connection() else {
            return self.reply(425, "use EPSV or PASV first");
        };
        self.reply(150, "listing follows")?;

        let mut body = String::new();
        if cmd == "MLSD" {
            body.push_str(&format!("type=cdir;perm=el; {path}\r\n"));
            body.push_str("type=pdir;perm=el; ..\r\n");
        }
        for entry in self.tree.children(path) {
            let name = entry.name;
            let is_dir = entry.kind == EntryKind::Directory;
            let size = self.tree.contents(&entry.path).map_or(0, |d| d.len());
            if cmd == "MLSD" {
                if is_dir {
                    body.push_str(&format!("type=dir;perm=el; {name}\r\n"));
                } else {
                    body.push_str(&format!("type=file;size={size};perm=r; {name}\r\n"));
                }
            } else {
                let flag = if is_dir { 'd' } else { '-' };
                body.push_str(&format!(
                    "{flag}rw-r--r--   1 ftp      ftp      {size:>10} Jan 01 00:00 {name}\r\n"
                ));
            }
        }
        let _ = data.write_all(body.as_bytes());
        drop(data);
        self.reply(226, "transfer complete")
    }

    fn retrieve(&mut self, path: &str) -> std::io::Result<()> {
        let offset = std::mem::take(&mut self.rest) as usize;
        let Some(data) = self.tree.contents(path) else {
            self.passive = None;
            return self.reply(550, "no such file");
        };
        let Some(mut stream) = self.data_connection() else {
            return self.reply(425, "use EPSV or PASV first");
        };
        self.reply(150, "opening binary data connection")?;
        let start = offset.min(data.len());
        // The client may hang up after reading its span.
        let complete = stream.write_all(&data[start..]).is_ok();
        drop(stream);
        if complete {
            self.reply(226, "transfer complete")
        } else {
            self.reply(426, "connection closed; transfer aborted")
        }
    }
}
