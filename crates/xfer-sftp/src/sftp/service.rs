// ── SFTP service: connect, verify, authenticate ──────────────────────────────
//
// Everything here is blocking libssh2 work. Callers run it on the blocking
// thread pool.

use crate::sftp::known_hosts::{HostKeyStatus, KnownHosts};
use crate::sftp::types::{SftpConnectionConfig, SftpSessionInfo};
use log::{debug, info, warn};
use secrecy::ExposeSecret;
use ssh2::{ErrorCode, HostKeyType, Session, Sftp};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use uuid::Uuid;
use xfer_core::{XfrError, XfrResult};

/// An authenticated SSH session with its SFTP channel open.
pub struct SftpConn {
    pub session: Session,
    pub sftp: Sftp,
    pub info: SftpSessionInfo,
    _tcp: TcpStream,
}

// ── Connect ──────────────────────────────────────────────────────────────────

pub fn connect_blocking(config: &SftpConnectionConfig) -> XfrResult<SftpConn> {
    if config.host.is_empty() {
        return Err(XfrError::protocol("SFTP host must not be empty"));
    }
    let addr = format!("{}:{}", config.host, config.port);
    info!("SFTP connecting to {}", addr);

    let tcp = open_tcp(&addr, config)?;

    let mut session =
        Session::new().map_err(|e| map_ssh_err(e, "Failed to create SSH session"))?;
    session.set_timeout(millis(config.connect_timeout));
    session.set_tcp_stream(
        tcp.try_clone()
            .map_err(|e| XfrError::connection(format!("Socket clone failed: {}", e)))?,
    );
    session
        .handshake()
        .map_err(|e| XfrError::connection(format!("SSH handshake with {} failed: {}", addr, e)))?;

    let banner = session.banner().map(|b| b.to_string());
    let fingerprint = verify_host_key(&session, config)?;

    // ── Authentication ───────────────────────────────────────────────────────

    let auth_method = authenticate(&session, config)?;
    if !session.authenticated() {
        return Err(XfrError::authentication(format!(
            "Authentication to {} failed",
            addr
        )));
    }
    info!("SFTP authenticated to {} via {}", addr, auth_method);

    session.set_timeout(millis(config.io_timeout));
    session.set_keepalive(true, 30);

    let sftp = session
        .sftp()
        .map_err(|e| map_ssh_err(e, "Failed to open SFTP channel"))?;

    let remote_home = sftp
        .realpath(Path::new("."))
        .ok()
        .map(|p| p.to_string_lossy().to_string());

    let current_directory = resolve_initial_directory(&sftp, config, remote_home.as_deref());

    let info = SftpSessionInfo {
        id: Uuid::new_v4().to_string(),
        host: config.host.clone(),
        port: config.port,
        username: config.username.clone(),
        auth_method,
        server_banner: banner,
        remote_home,
        current_directory,
        host_key_fingerprint: fingerprint,
    };

    Ok(SftpConn {
        session,
        sftp,
        info,
        _tcp: tcp,
    })
}

fn open_tcp(addr: &str, config: &SftpConnectionConfig) -> XfrResult<TcpStream> {
    let addrs: Vec<_> = addr
        .to_socket_addrs()
        .map_err(|e| XfrError::connection(format!("Cannot resolve {}: {}", addr, e)))?
        .collect();
    let mut last_err = None;
    for sa in addrs {
        match TcpStream::connect_timeout(&sa, config.connect_timeout) {
            Ok(tcp) => {
                tcp.set_nonblocking(false)?;
                return Ok(tcp);
            }
            Err(e) => {
                debug!("TCP connect to {} failed: {}", sa, e);
                last_err = Some(e);
            }
        }
    }
    Err(match last_err {
        Some(e) => XfrError::connection(format!("TCP connection to {} failed: {}", addr, e)),
        None => XfrError::connection(format!("{} resolved to no addresses", addr)),
    })
}

/// Use the configured initial directory if the server can resolve it,
/// otherwise stay in the login directory.
fn resolve_initial_directory(
    sftp: &Sftp,
    config: &SftpConnectionConfig,
    remote_home: Option<&str>,
) -> String {
    let home = remote_home.unwrap_or("/").to_string();
    match config.initial_directory.as_deref() {
        Some(dir) if !dir.is_empty() => match sftp.realpath(Path::new(dir)) {
            Ok(p) => p.to_string_lossy().to_string(),
            Err(e) => {
                warn!("Initial directory {} unavailable ({}), staying in {}", dir, e, home);
                home
            }
        },
        _ => home,
    }
}

fn millis(d: std::time::Duration) -> u32 {
    d.as_millis().min(u32::MAX as u128) as u32
}

// ── Host key verification ────────────────────────────────────────────────────

pub fn key_type_name(kind: HostKeyType) -> &'static str {
    match kind {
        HostKeyType::Rsa => "ssh-rsa",
        HostKeyType::Dss => "ssh-dss",
        HostKeyType::Ecdsa256 => "ecdsa-sha2-nistp256",
        HostKeyType::Ecdsa384 => "ecdsa-sha2-nistp384",
        HostKeyType::Ecdsa521 => "ecdsa-sha2-nistp521",
        HostKeyType::Ed25519 => "ssh-ed25519",
        HostKeyType::Unknown => "unknown",
    }
}

fn verify_host_key(session: &Session, config: &SftpConnectionConfig) -> XfrResult<String> {
    let (key, kind) = session
        .host_key()
        .ok_or_else(|| XfrError::protocol("Server did not present a host key"))?;
    let key_type = key_type_name(kind);
    let fingerprint = KnownHosts::fingerprint(key);
    let store = KnownHosts::new(&config.known_hosts_path);

    match store.check(&config.host, config.port, key_type, &fingerprint)? {
        HostKeyStatus::Trusted => {
            debug!("Host key {} for {} is trusted", fingerprint, config.host);
            Ok(fingerprint)
        }
        HostKeyStatus::Unknown => Err(XfrError::unknown_host_key(
            &config.host,
            config.port,
            key_type,
            fingerprint,
        )),
        HostKeyStatus::Mismatch { expected } => {
            warn!(
                "Host key for [{}]:{} changed: expected {}, got {}",
                config.host, config.port, expected, fingerprint
            );
            Err(XfrError::host_key_mismatch(
                &config.host,
                config.port,
                expected,
                fingerprint,
            ))
        }
    }
}

// ── Authentication helpers ───────────────────────────────────────────────────

struct PasswordPrompt {
    password: String,
}

impl ssh2::KeyboardInteractivePrompt for PasswordPrompt {
    fn prompt(
        &mut self,
        _username: &str,
        _instructions: &str,
        prompts: &[ssh2::Prompt],
    ) -> Vec<String> {
        prompts.iter().map(|_| self.password.clone()).collect()
    }
}

/// Try key file, password, keyboard-interactive and agent identities in
/// that order. Returns the method that succeeded.
fn authenticate(session: &Session, config: &SftpConnectionConfig) -> XfrResult<String> {
    let user = config.username.as_str();
    let offered = session
        .auth_methods(user)
        .map(|m| m.to_string())
        .unwrap_or_default();
    debug!("Server offers auth methods: {}", offered);
    let allows = |m: &str| offered.is_empty() || offered.split(',').any(|o| o == m);
    let password = config
        .password
        .as_ref()
        .map(|p| p.expose_secret().to_string());

    // 1. Private-key file; the password doubles as the key passphrase.
    if let Some(ref key_path) = config.private_key_path {
        if allows("publickey") {
            match session.userauth_pubkey_file(user, None, key_path, password.as_deref()) {
                Ok(()) if session.authenticated() => return Ok("publickey".to_string()),
                Ok(()) => {}
                Err(e) => debug!("Public-key auth with {} failed: {}", key_path.display(), e),
            }
        }
    }

    // 2. Password / keyboard-interactive
    if let Some(ref password) = password {
        if allows("password")
            && session.userauth_password(user, password).is_ok()
            && session.authenticated()
        {
            return Ok("password".to_string());
        }

        let mut prompt = PasswordPrompt {
            password: password.clone(),
        };
        if allows("keyboard-interactive")
            && session
                .userauth_keyboard_interactive(user, &mut prompt)
                .is_ok()
            && session.authenticated()
        {
            return Ok("keyboard-interactive".to_string());
        }
    }

    // 3. Agent-based auth
    if config.use_agent && allows("publickey") {
        if let Ok(mut agent) = session.agent() {
            if agent.connect().is_ok() {
                let _ = agent.list_identities();
                for identity in agent.identities().unwrap_or_default() {
                    if agent.userauth(user, &identity).is_ok() && session.authenticated() {
                        let _ = agent.disconnect();
                        return Ok("agent".to_string());
                    }
                }
                let _ = agent.disconnect();
            }
        }
    }

    Err(XfrError::authentication(format!(
        "No authentication method succeeded for {}@{}",
        user, config.host
    )))
}

// ── Error mapping ────────────────────────────────────────────────────────────

const FX_NO_SUCH_FILE: i32 = 2;
const FX_PERMISSION_DENIED: i32 = 3;
const FX_NO_CONNECTION: i32 = 6;
const FX_CONNECTION_LOST: i32 = 7;
const FX_OP_UNSUPPORTED: i32 = 8;
const FX_NO_SUCH_PATH: i32 = 10;

const ERROR_TIMEOUT: i32 = -9;
const ERROR_AUTHENTICATION_FAILED: i32 = -18;
const ERROR_PUBLICKEY_UNVERIFIED: i32 = -19;

/// Classify a libssh2 error. SFTP status codes become protocol errors,
/// transport-level codes become connection errors.
pub fn map_ssh_err(e: ssh2::Error, context: &str) -> XfrError {
    let msg = format!("{}: {}", context, e);
    match e.code() {
        ErrorCode::SFTP(FX_NO_SUCH_FILE) | ErrorCode::SFTP(FX_NO_SUCH_PATH) => {
            XfrError::protocol(msg).missing()
        }
        ErrorCode::SFTP(FX_PERMISSION_DENIED) => XfrError::protocol(msg),
        ErrorCode::SFTP(FX_NO_CONNECTION) | ErrorCode::SFTP(FX_CONNECTION_LOST) => {
            XfrError::connection(msg)
        }
        ErrorCode::SFTP(FX_OP_UNSUPPORTED) => XfrError::unsupported(msg),
        ErrorCode::SFTP(_) => XfrError::protocol(msg),
        ErrorCode::Session(ERROR_TIMEOUT) => XfrError::timeout(msg),
        ErrorCode::Session(ERROR_AUTHENTICATION_FAILED)
        | ErrorCode::Session(ERROR_PUBLICKEY_UNVERIFIED) => XfrError::authentication(msg),
        ErrorCode::Session(_) => XfrError::connection(msg),
    }
}

/// Errors surfaced through `std::io::Read`/`Write` on a remote file handle.
pub fn map_remote_io(e: std::io::Error, context: &str) -> XfrError {
    if e.kind() == std::io::ErrorKind::TimedOut {
        XfrError::timeout(format!("{}: {}", context, e))
    } else {
        XfrError::transfer(format!("{}: {}", context, e))
    }
}
