//! A small in-process FTP server for tests.
//!
//! Serves an in-memory tree on `127.0.0.1` with passive data connections
//! only, over plain FTP or either FTPS flavour. Optional extensions
//! (`MLSD`, `REST STREAM`, `MFMT`, ...) are advertised only when enabled,
//! and `FEAT` is rejected with `502` when none are.

use crate::ftp::parser::{format_mlsd_line, format_mlsd_time, format_unix_line, parse_mlsd_time};
use crate::ftp::types::{FtpEntry, FtpEntryKind};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use xfer_core::{join_remote, parent_remote};

#[derive(Debug, Clone)]
enum Node {
    Dir(DateTime<Utc>),
    File(Vec<u8>, DateTime<Utc>),
}

/// Extensions the server advertises in `FEAT`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MockFeatures {
    pub mlsd: bool,
    pub size: bool,
    pub rest_stream: bool,
    pub mfmt: bool,
    /// Answer `LIST -a` with 501, like servers that take no `ls` options.
    pub reject_list_options: bool,
}

impl MockFeatures {
    pub fn all() -> Self {
        Self {
            mlsd: true,
            size: true,
            rest_stream: true,
            mfmt: true,
            reject_list_options: false,
        }
    }

    fn any(&self) -> bool {
        self.mlsd || self.size || self.rest_stream || self.mfmt
    }
}

/// How an FTPS server secures the control connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockTls {
    /// Plain greeting, then `AUTH TLS`.
    Explicit,
    /// TLS from the first byte.
    Implicit,
}

#[derive(Clone)]
struct TlsSetup {
    mode: MockTls,
    acceptor: TlsAcceptor,
}

struct Shared {
    nodes: BTreeMap<String, Node>,
    user: String,
    pass: String,
    features: MockFeatures,
    commands: Vec<String>,
}

/// Handle to a running mock server. Dropping it stops accepting.
pub struct MockFtpServer {
    addr: SocketAddr,
    shared: Arc<Mutex<Shared>>,
    task: JoinHandle<()>,
}

impl MockFtpServer {
    pub async fn start(user: &str, pass: &str, features: MockFeatures) -> std::io::Result<Self> {
        Self::launch(user, pass, features, None).await
    }

    /// Start an FTPS server presenting the certificate in `config`. Data
    /// connections are wrapped once the client sends `PROT P`.
    pub async fn start_tls(
        user: &str,
        pass: &str,
        features: MockFeatures,
        mode: MockTls,
        config: Arc<ServerConfig>,
    ) -> std::io::Result<Self> {
        let tls = TlsSetup {
            mode,
            acceptor: TlsAcceptor::from(config),
        };
        Self::launch(user, pass, features, Some(tls)).await
    }

    async fn launch(
        user: &str,
        pass: &str,
        features: MockFeatures,
        tls: Option<TlsSetup>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), Node::Dir(Utc::now()));
        let shared = Arc::new(Mutex::new(Shared {
            nodes,
            user: user.to_string(),
            pass: pass.to_string(),
            features,
            commands: Vec::new(),
        }));
        let state = shared.clone();
        let task = tokio::spawn(async move {
            while let Ok((sock, _)) = listener.accept().await {
                let state = state.clone();
                let tls = tls.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve(sock, state, tls).await {
                        log::debug!("mock ftp connection ended: {}", e);
                    }
                });
            }
        });
        Ok(Self { addr, shared, task })
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn add_dir(&self, path: &str) {
        if let Ok(mut s) = self.shared.lock() {
            s.nodes.insert(path.to_string(), Node::Dir(Utc::now()));
        }
    }

    pub fn add_file(&self, path: &str, data: &[u8], modified: DateTime<Utc>) {
        if let Ok(mut s) = self.shared.lock() {
            s.nodes
                .insert(path.to_string(), Node::File(data.to_vec(), modified));
        }
    }

    pub fn read(&self, path: &str) -> Option<Vec<u8>> {
        let s = self.shared.lock().ok()?;
        match s.nodes.get(path) {
            Some(Node::File(data, _)) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn modified(&self, path: &str) -> Option<DateTime<Utc>> {
        let s = self.shared.lock().ok()?;
        match s.nodes.get(path) {
            Some(Node::File(_, m)) | Some(Node::Dir(m)) => Some(*m),
            None => None,
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        self.shared
            .lock()
            .map(|s| s.nodes.contains_key(path))
            .unwrap_or(false)
    }

    /// Every command received so far, in order, with `PASS` masked.
    pub fn commands(&self) -> Vec<String> {
        self.shared
            .lock()
            .map(|s| s.commands.clone())
            .unwrap_or_default()
    }
}

impl Drop for MockFtpServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct Conn {
    cwd: String,
    user: Option<String>,
    logged_in: bool,
    rest: u64,
    pasv: Option<TcpListener>,
    rename_from: Option<String>,
    greeted: bool,
    tls: Option<TlsAcceptor>,
    secure: bool,
    protect_data: bool,
}

trait DataIo: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> DataIo for T {}

async fn serve(
    sock: TcpStream,
    shared: Arc<Mutex<Shared>>,
    tls: Option<TlsSetup>,
) -> std::io::Result<()> {
    let mut conn = Conn {
        cwd: "/".into(),
        user: None,
        logged_in: false,
        rest: 0,
        pasv: None,
        rename_from: None,
        greeted: false,
        tls: tls.as_ref().map(|t| t.acceptor.clone()),
        secure: false,
        protect_data: false,
    };
    match tls {
        Some(TlsSetup {
            mode: MockTls::Implicit,
            acceptor,
        }) => {
            let stream = acceptor.accept(sock).await?;
            conn.secure = true;
            command_loop(stream, &shared, &mut conn).await?;
        }
        Some(TlsSetup { acceptor, .. }) => {
            if let Some(plain) = command_loop(sock, &shared, &mut conn).await? {
                let stream = acceptor.accept(plain).await?;
                conn.secure = true;
                command_loop(stream, &shared, &mut conn).await?;
            }
        }
        None => {
            command_loop(sock, &shared, &mut conn).await?;
        }
    }
    Ok(())
}

/// Answer commands until the client leaves. Returns the stream when the
/// client asked for `AUTH TLS` so the caller can wrap it.
async fn command_loop<S>(
    stream: S,
    shared: &Arc<Mutex<Shared>>,
    conn: &mut Conn,
) -> std::io::Result<Option<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let shared = shared.clone();
    let (rd, mut wr) = tokio::io::split(stream);
    let mut lines = BufReader::new(rd).lines();
    if !conn.greeted {
        conn.greeted = true;
        reply(&mut wr, "220 mock ftp ready").await?;
    }

    while let Some(line) = lines.next_line().await? {
        let (cmd, arg) = match line.split_once(' ') {
            Some((c, a)) => (c.to_uppercase(), a.to_string()),
            None => (line.to_uppercase(), String::new()),
        };
        if let Ok(mut s) = shared.lock() {
            let logged = if cmd == "PASS" { "PASS ****".into() } else { line.clone() };
            s.commands.push(logged);
        }
        if cmd == "AUTH" {
            if conn.tls.is_none() || !arg.eq_ignore_ascii_case("TLS") {
                reply(&mut wr, "504 security mechanism not available").await?;
            } else if conn.secure {
                reply(&mut wr, "503 already secured").await?;
            } else {
                reply(&mut wr, "234 proceed with negotiation").await?;
                let rd = lines.into_inner();
                if !rd.buffer().is_empty() {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "client sent data before the TLS handshake",
                    ));
                }
                return Ok(Some(rd.into_inner().unsplit(wr)));
            }
            continue;
        }
        let path = resolve(&conn.cwd, &arg);
        let response: String = match cmd.as_str() {
            "PBSZ" if conn.secure => "200 PBSZ=0".into(),
            "PROT" if conn.secure => match arg.to_uppercase().as_str() {
                "P" => {
                    conn.protect_data = true;
                    "200 protection level set to P".into()
                }
                "C" => {
                    conn.protect_data = false;
                    "200 protection level set to C".into()
                }
                _ => "504 protection level not supported".into(),
            },
            "USER" => {
                conn.user = Some(arg.clone());
                "331 password required".into()
            }
            "PASS" => {
                let ok = shared
                    .lock()
                    .map(|s| conn.user.as_deref() == Some(s.user.as_str()) && arg == s.pass)
                    .unwrap_or(false);
                conn.logged_in = ok;
                if ok {
                    "230 logged in".into()
                } else {
                    "530 login incorrect".into()
                }
            }
            "QUIT" => {
                reply(&mut wr, "221 bye").await?;
                return Ok(None);
            }
            _ if !conn.logged_in => "530 not logged in".into(),
            "FEAT" => {
                let f = features(&shared);
                if !f.any() {
                    "502 command not implemented".into()
                } else {
                    let mut out = vec!["211-Features:".to_string()];
                    if f.mlsd {
                        out.push(" MLSD".into());
                        out.push(" MLST type*;size*;modify*;".into());
                    }
                    if f.size {
                        out.push(" SIZE".into());
                    }
                    if f.rest_stream {
                        out.push(" REST STREAM".into());
                    }
                    if f.mfmt {
                        out.push(" MFMT".into());
                    }
                    out.push("211 End".into());
                    out.join("\r\n")
                }
            }
            "TYPE" => "200 type set".into(),
            "NOOP" => "200 ok".into(),
            "PWD" => format!("257 \"{}\" is the current directory", conn.cwd),
            "CWD" => {
                if is_dir(&shared, &path) {
                    conn.cwd = path;
                    "250 ok".into()
                } else {
                    "550 no such directory".into()
                }
            }
            "PASV" => {
                let listener = TcpListener::bind("127.0.0.1:0").await?;
                let port = listener.local_addr()?.port();
                conn.pasv = Some(listener);
                format!(
                    "227 Entering Passive Mode (127,0,0,1,{},{})",
                    port / 256,
                    port % 256
                )
            }
            "REST" => match arg.parse::<u64>() {
                Ok(n) if features(&shared).rest_stream => {
                    conn.rest = n;
                    format!("350 restarting at {}", n)
                }
                _ => "502 command not implemented".into(),
            },
            "SIZE" if features(&shared).size => match file(&shared, &path) {
                Some((data, _)) => format!("213 {}", data.len()),
                None => "550 no such file".into(),
            },
            "MDTM" => match file(&shared, &path) {
                Some((_, m)) => format!("213 {}", format_mlsd_time(&m)),
                None => "550 no such file".into(),
            },
            "MFMT" if features(&shared).mfmt => {
                let (ts, target) = arg.split_once(' ').unwrap_or((arg.as_str(), ""));
                let target = resolve(&conn.cwd, target);
                match parse_mlsd_time(ts) {
                    Some(t) if set_mtime(&shared, &target, t) => {
                        format!("213 Modify={}; {}", ts, target)
                    }
                    Some(_) => "550 no such file".into(),
                    None => "501 bad timestamp".into(),
                }
            }
            "MLST" if features(&shared).mlsd => match entry_for(&shared, &path) {
                Some(e) => format!(
                    "250-Listing {}\r\n {}\r\n250 End",
                    path,
                    format_mlsd_line(&FtpEntry { name: path.clone(), ..e })
                ),
                None => "550 no such file".into(),
            },
            "MKD" => {
                let exists = shared.lock().map(|s| s.nodes.contains_key(&path)).unwrap_or(true);
                let parent_ok = parent_remote(&path).map(|p| is_dir(&shared, p)).unwrap_or(false);
                if exists || !parent_ok {
                    "550 cannot create directory".into()
                } else {
                    if let Ok(mut s) = shared.lock() {
                        s.nodes.insert(path.clone(), Node::Dir(Utc::now()));
                    }
                    format!("257 \"{}\" created", path)
                }
            }
            "RMD" => {
                let has_children = !children(&shared, &path).is_empty();
                if !is_dir(&shared, &path) {
                    "550 no such directory".into()
                } else if has_children {
                    "550 directory not empty".into()
                } else {
                    if let Ok(mut s) = shared.lock() {
                        s.nodes.remove(&path);
                    }
                    "250 removed".into()
                }
            }
            "DELE" => {
                if file(&shared, &path).is_some() {
                    if let Ok(mut s) = shared.lock() {
                        s.nodes.remove(&path);
                    }
                    "250 deleted".into()
                } else {
                    "550 no such file".into()
                }
            }
            "RNFR" => {
                if entry_for(&shared, &path).is_some() {
                    conn.rename_from = Some(path);
                    "350 ready for RNTO".into()
                } else {
                    "550 no such file".into()
                }
            }
            "RNTO" => match conn.rename_from.take() {
                Some(from) => {
                    if let Ok(mut s) = shared.lock() {
                        if let Some(node) = s.nodes.remove(&from) {
                            s.nodes.insert(path, node);
                        }
                    }
                    "250 renamed".into()
                }
                None => "503 RNFR first".into(),
            },
            "LIST" | "MLSD" | "NLST" => {
                // `LIST` hides dotfiles unless asked with `-a`, as vsftpd does.
                let (opts, operand) = match arg.strip_prefix('-') {
                    Some(rest) => rest.split_once(' ').unwrap_or((rest, "")),
                    None => ("", arg.as_str()),
                };
                let target = if operand.is_empty() {
                    conn.cwd.clone()
                } else {
                    resolve(&conn.cwd, operand)
                };
                let show_hidden = cmd == "MLSD" || opts.contains('a');
                if !opts.is_empty() && features(&shared).reject_list_options {
                    "501 unrecognized option".into()
                } else if !is_dir(&shared, &target) {
                    "550 no such directory".into()
                } else {
                    let body: String = children(&shared, &target)
                        .into_iter()
                        .filter(|e| show_hidden || !e.name.starts_with('.'))
                        .map(|e| {
                            let line = if cmd == "MLSD" {
                                format_mlsd_line(&e)
                            } else {
                                format_unix_line(&e)
                            };
                            format!("{}\r\n", line)
                        })
                        .collect();
                    send_data(&mut wr, conn, body.as_bytes()).await?
                }
            }
            "RETR" => match file(&shared, &path) {
                Some((data, _)) => {
                    let start = (conn.rest as usize).min(data.len());
                    conn.rest = 0;
                    send_data(&mut wr, conn, &data[start..]).await?
                }
                None => "550 no such file".into(),
            },
            "STOR" | "APPE" => {
                let parent_ok = parent_remote(&path).map(|p| is_dir(&shared, p)).unwrap_or(false);
                if !parent_ok {
                    "553 cannot store here".into()
                } else {
                    match conn.pasv.take() {
                        None => "425 use PASV first".into(),
                        Some(listener) => {
                            reply(&mut wr, "150 ok to send data").await?;
                            let mut data_sock = accept_data(conn, listener).await?;
                            let mut received = Vec::new();
                            data_sock.read_to_end(&mut received).await?;
                            let rest = std::mem::take(&mut conn.rest) as usize;
                            if let Ok(mut s) = shared.lock() {
                                let mut base = match s.nodes.get(&path) {
                                    Some(Node::File(d, _)) => d.clone(),
                                    _ => Vec::new(),
                                };
                                if cmd == "STOR" {
                                    base.truncate(rest);
                                }
                                base.extend_from_slice(&received);
                                s.nodes.insert(path, Node::File(base, Utc::now()));
                            }
                            "226 transfer complete".into()
                        }
                    }
                }
            }
            "ABOR" => "226 abort ok".into(),
            _ => "502 command not implemented".into(),
        };
        reply(&mut wr, &response).await?;
    }
    Ok(None)
}

async fn reply<W: AsyncWriteExt + Unpin>(wr: &mut W, text: &str) -> std::io::Result<()> {
    wr.write_all(format!("{}\r\n", text).as_bytes()).await?;
    wr.flush().await
}

async fn accept_data(conn: &Conn, listener: TcpListener) -> std::io::Result<Box<dyn DataIo>> {
    let (sock, _) = listener.accept().await?;
    match (&conn.tls, conn.protect_data) {
        (Some(acceptor), true) => Ok(Box::new(acceptor.accept(sock).await?)),
        _ => Ok(Box::new(sock)),
    }
}

/// Send `150`, push `data` over the passive connection and return the
/// completion reply.
async fn send_data<W: AsyncWriteExt + Unpin>(
    wr: &mut W,
    conn: &mut Conn,
    data: &[u8],
) -> std::io::Result<String> {
    let listener = match conn.pasv.take() {
        Some(l) => l,
        None => return Ok("425 use PASV first".into()),
    };
    reply(wr, "150 opening data connection").await?;
    let mut data_sock = accept_data(conn, listener).await?;
    let sent = async {
        data_sock.write_all(data).await?;
        data_sock.shutdown().await
    }
    .await;
    Ok(match sent {
        Ok(()) => "226 transfer complete".into(),
        Err(_) => "426 connection closed; transfer aborted".into(),
    })
}

fn resolve(cwd: &str, arg: &str) -> String {
    let arg = arg.trim();
    let joined = if arg.starts_with('/') {
        arg.to_string()
    } else {
        join_remote(cwd, arg)
    };
    if joined.len() > 1 {
        joined.trim_end_matches('/').to_string()
    } else {
        joined
    }
}

fn features(shared: &Arc<Mutex<Shared>>) -> MockFeatures {
    shared.lock().map(|s| s.features).unwrap_or_default()
}

fn is_dir(shared: &Arc<Mutex<Shared>>, path: &str) -> bool {
    shared
        .lock()
        .map(|s| matches!(s.nodes.get(path), Some(Node::Dir(_))))
        .unwrap_or(false)
}

fn file(shared: &Arc<Mutex<Shared>>, path: &str) -> Option<(Vec<u8>, DateTime<Utc>)> {
    match shared.lock().ok()?.nodes.get(path) {
        Some(Node::File(d, m)) => Some((d.clone(), *m)),
        _ => None,
    }
}

fn entry_for(shared: &Arc<Mutex<Shared>>, path: &str) -> Option<FtpEntry> {
    let s = shared.lock().ok()?;
    let node = s.nodes.get(path)?;
    Some(to_entry(path, node))
}

fn to_entry(path: &str, node: &Node) -> FtpEntry {
    let name = path.rsplit('/').next().unwrap_or(path).to_string();
    let (kind, size, modified, perms) = match node {
        Node::Dir(m) => (FtpEntryKind::Directory, 0, *m, "drwxr-xr-x"),
        Node::File(d, m) => (FtpEntryKind::File, d.len() as u64, *m, "-rw-r--r--"),
    };
    FtpEntry {
        name,
        kind,
        size,
        modified: Some(modified),
        permissions: Some(perms.to_string()),
        owner: Some("ftp".into()),
        group: Some("ftp".into()),
        link_target: None,
    }
}

fn set_mtime(shared: &Arc<Mutex<Shared>>, path: &str, t: DateTime<Utc>) -> bool {
    let Ok(mut s) = shared.lock() else {
        return false;
    };
    match s.nodes.get_mut(path) {
        Some(Node::File(_, m)) | Some(Node::Dir(m)) => {
            *m = t;
            true
        }
        None => false,
    }
}

fn children(shared: &Arc<Mutex<Shared>>, dir: &str) -> Vec<FtpEntry> {
    shared
        .lock()
        .map(|s| {
            s.nodes
                .iter()
                .filter(|(p, _)| p.as_str() != "/" && parent_remote(p) == Some(dir))
                .map(|(p, n)| to_entry(p, n))
                .collect()
        })
        .unwrap_or_default()
}
