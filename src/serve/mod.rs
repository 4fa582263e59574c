//! Serving the newest artifact
//!
//! Target selection prefers the tarball pointer over the zip pointer. The
//! static server is rooted at the backup root and answers `GET`/`HEAD` for
//! the `latest.*` pointers only; release slots, the lock file, the PID file
//! and the logs stay unreachable. Every request gets one line in the server
//! log.
//!
//! Background mode re-executes this binary as `relpack serve ...` in its
//! own process group and records the child's PID.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::path::{Component, Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use chrono::Local;
use thiserror::Error;
use tiny_http::{Header, Method, Request, Response, Server, StatusCode};
use tracing::{debug, info, warn};

use crate::artifact::{LatestPointers, POINTER_PREFIX};
use crate::bundle::ArchiveFormat;

/// File holding the background server's PID
pub const PID_FILENAME: &str = "server.pid";

/// Server log file name
pub const LOG_FILENAME: &str = "server.log";

/// How often the foreground loop checks for a stop request
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// How long a background child must survive to count as started
pub const DEFAULT_STARTUP_GRACE: Duration = Duration::from_millis(500);

/// Errors for serving
#[derive(Debug, Error)]
pub enum ServeError {
    #[error("no artifact to serve: neither latest.tar.gz nor latest.zip exists in {0}")]
    NoArtifact(PathBuf),

    #[error("failed to bind {addr}: {message}")]
    Bind { addr: SocketAddr, message: String },

    #[error("background server exited during startup ({status})")]
    EarlyExit { status: String },

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
}

/// The artifact a run hands to the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServingTarget {
    pub format: ArchiveFormat,
    /// Directory the server is rooted at
    pub root: PathBuf,
    /// Name the artifact is served under
    pub file_name: String,
    /// What the pointer refers to (the pointer itself for a copy)
    pub artifact: PathBuf,
}

impl ServingTarget {
    pub fn url(&self, host: &str, port: u16) -> String {
        let host = match host.parse::<IpAddr>() {
            Ok(IpAddr::V6(v6)) => format!("[{}]", v6),
            _ => host.to_string(),
        };
        format!("http://{}:{}/{}", host, port, self.file_name)
    }
}

/// Pick the pointer to serve: tarball first, then zip
///
/// Only formats listed in `fresh` (pointers this run actually updated) are
/// candidates, so a stale pointer left by an earlier run is never served in
/// place of a format that failed this time.
pub fn select_serving_target(
    pointers: &LatestPointers,
    fresh: &[ArchiveFormat],
) -> Result<ServingTarget, ServeError> {
    for format in [ArchiveFormat::Tar, ArchiveFormat::Zip] {
        if !fresh.contains(&format) {
            continue;
        }
        if let Some(location) = pointers.resolve(format) {
            let artifact = pointers.target(format).unwrap_or_else(|| location.clone());
            return Ok(ServingTarget {
                format,
                root: pointers.root().to_path_buf(),
                file_name: LatestPointers::file_name(format),
                artifact,
            });
        }
    }

    Err(ServeError::NoArtifact(pointers.root().to_path_buf()))
}

/// Primary LAN IPv4 address, if the host has a route out
///
/// Connecting a UDP socket sends nothing; it only asks the kernel which
/// local address it would use.
pub fn detect_lan_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect((Ipv4Addr::new(192, 0, 2, 1), 9)).ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified()).then_some(ip)
}

/// Map a request path to a servable file name
///
/// Only a single `latest.*` path component is accepted.
fn servable_name(url: &str) -> Option<&str> {
    let path = url.split(['?', '#']).next()?;
    let name = path.strip_prefix('/')?;
    let is_pointer = name
        .strip_prefix(POINTER_PREFIX)
        .is_some_and(|rest| rest.starts_with('.'));
    if !is_pointer || name.contains(['/', '\\', '%']) {
        return None;
    }
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Some(name),
        _ => None,
    }
}

fn content_type(name: &str) -> &'static str {
    if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        "application/gzip"
    } else if name.ends_with(".zip") {
        "application/zip"
    } else if name.ends_with(".json") {
        "application/json"
    } else {
        "application/octet-stream"
    }
}

/// Blocking static file server
pub struct StaticServer {
    server: Server,
    root: PathBuf,
    addr: SocketAddr,
    access_log: Option<File>,
}

impl StaticServer {
    /// Bind `addr` (port 0 picks a free port) and serve files from `root`
    pub fn bind(addr: SocketAddr, root: &Path, log_path: Option<&Path>) -> Result<Self, ServeError> {
        let server = Server::http(addr).map_err(|e| ServeError::Bind {
            addr,
            message: e.to_string(),
        })?;
        let bound = server.server_addr().to_ip().unwrap_or(addr);

        let access_log = match log_path {
            Some(path) => Some(OpenOptions::new().create(true).append(true).open(path)?),
            None => None,
        };

        Ok(Self {
            server,
            root: root.to_path_buf(),
            addr: bound,
            access_log,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn local_port(&self) -> u16 {
        self.addr.port()
    }

    /// Serve until `stop` becomes true
    pub fn serve_until(&mut self, stop: &AtomicBool) -> Result<(), ServeError> {
        info!(addr = %self.addr, root = %self.root.display(), "serving");
        self.log_line(&format!("server started on {}", self.addr));

        while !stop.load(Ordering::SeqCst) {
            match self.server.recv_timeout(POLL_INTERVAL) {
                Ok(Some(request)) => self.handle(request),
                Ok(None) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }

        self.log_line("server stopped");
        info!("server stopped");
        Ok(())
    }

    fn handle(&mut self, request: Request) {
        let method = request.method().clone();
        let url = request.url().to_string();
        let remote = request
            .remote_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|| "-".to_string());

        let status = match method {
            Method::Get | Method::Head => self.respond_file(request, &url),
            _ => respond(request, Response::empty(StatusCode(405))),
        };

        self.log_line(&format!("{} {} {} {}", remote, method, url, status));
    }

    fn respond_file(&self, request: Request, url: &str) -> u16 {
        let Some(name) = servable_name(url) else {
            return respond(request, Response::empty(StatusCode(404)));
        };

        let path = self.root.join(name);
        let file = match fs::metadata(&path) {
            Ok(m) if m.is_file() => File::open(&path),
            _ => return respond(request, Response::empty(StatusCode(404))),
        };

        match file {
            Ok(file) => {
                let mut response = Response::from_file(file);
                if let Ok(header) = Header::from_bytes(&b"Content-Type"[..], content_type(name).as_bytes()) {
                    response.add_header(header);
                }
                respond(request, response)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not open file for serving");
                respond(request, Response::empty(StatusCode(500)))
            }
        }
    }

    fn log_line(&mut self, line: &str) {
        if let Some(log) = self.access_log.as_mut() {
            let stamp = Local::now().format("%Y-%m-%d %H:%M:%S");
            if let Err(e) = writeln!(log, "[{}] {}", stamp, line) {
                debug!(error = %e, "server log write failed");
            }
        }
    }
}

fn respond<R: io::Read>(request: Request, response: Response<R>) -> u16 {
    let status = response.status_code().0;
    if let Err(e) = request.respond(response) {
        debug!(error = %e, "client went away");
    }
    status
}

/// What a `relpack serve` process is asked to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServeOptions {
    pub root: PathBuf,
    pub bind: IpAddr,
    pub port: u16,
    pub log_path: Option<PathBuf>,
}

impl ServeOptions {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    /// Arguments for the `serve` subcommand
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "serve".to_string(),
            "--root".to_string(),
            self.root.display().to_string(),
            "--bind".to_string(),
            self.bind.to_string(),
            "--port".to_string(),
            self.port.to_string(),
        ];
        if let Some(log) = &self.log_path {
            args.push("--log".to_string());
            args.push(log.display().to_string());
        }
        args
    }
}

/// Starts detached `serve` processes
#[derive(Debug, Clone)]
pub struct BackgroundLauncher {
    program: PathBuf,
    prefix_args: Vec<String>,
    startup_grace: Duration,
}

impl BackgroundLauncher {
    /// Re-execute the running binary
    pub fn current_exe() -> io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }

    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            prefix_args: Vec::new(),
            startup_grace: DEFAULT_STARTUP_GRACE,
        }
    }

    /// Arguments placed before the `serve` arguments
    pub fn with_prefix_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.prefix_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_startup_grace(mut self, grace: Duration) -> Self {
        self.startup_grace = grace;
        self
    }

    /// Spawn the server, wait out the grace period, and record its PID
    ///
    /// The PID file is replaced atomically and only once the child has
    /// survived startup.
    pub fn launch(&self, options: &ServeOptions, pid_file: &Path) -> Result<u32, ServeError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.prefix_args)
            .args(options.to_args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        detach(&mut command);

        let mut child = command.spawn()?;
        let pid = child.id();
        thread::sleep(self.startup_grace);

        if let Some(status) = child.try_wait()? {
            return Err(ServeError::EarlyExit {
                status: status.to_string(),
            });
        }

        write_pid_file(pid_file, pid)?;
        info!(pid, pid_file = %pid_file.display(), "background server started");
        Ok(pid)
    }
}

#[cfg(unix)]
fn detach(command: &mut Command) {
    use std::os::unix::process::CommandExt;
    // own process group: a Ctrl-C in the launching terminal does not reach it
    command.process_group(0);
}

#[cfg(not(unix))]
fn detach(_command: &mut Command) {}

/// Atomically replace the PID file
pub fn write_pid_file(path: &Path, pid: u32) -> io::Result<()> {
    let mut temp_name = path.as_os_str().to_owned();
    temp_name.push(".tmp");
    let temp = PathBuf::from(temp_name);

    let result = fs::write(&temp, format!("{}\n", pid)).and_then(|()| fs::rename(&temp, path));
    if result.is_err() {
        let _ = fs::remove_file(&temp);
    }
    result
}

/// PID recorded by the last background run, if any
pub fn read_pid_file(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}
