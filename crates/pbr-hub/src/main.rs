mod relay;

use axum::{
    extract::{ConnectInfo, State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
    Router,
};
use clap::Parser;
use pbr_channel::DEFAULT_REQUEST_TIMEOUT;
use relay::HubState;
use std::{
    fs::OpenOptions,
    io::{self, Write},
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing::{error, info};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

const DEFAULT_HUB_ADDR: &str = "127.0.0.1:42917";

#[derive(Clone, Debug)]
pub struct Config {
    pub addr: String,
    pub session_id: String,
    pub debug: bool,
    pub stale_seconds: u64,
    pub ping_interval: Duration,
    pub write_timeout: Duration,
    pub request_timeout: Duration,
    pub log_dir: String,
}

impl Config {
    pub fn stale_after(&self) -> Option<Duration> {
        (self.stale_seconds > 0).then(|| Duration::from_secs(self.stale_seconds))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: DEFAULT_HUB_ADDR.to_string(),
            session_id: "default".to_string(),
            debug: false,
            stale_seconds: 30,
            ping_interval: Duration::from_secs(10),
            write_timeout: Duration::from_secs(2),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            log_dir: String::new(),
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "pbr-hub", about = "Relay between playback surfaces and page agents")]
struct Args {
    #[arg(long, default_value = "")]
    addr: String,
    #[arg(long, default_value = "")]
    session: String,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[arg(long, default_value_t = 30)]
    stale_seconds: u64,
    #[arg(long, default_value_t = 10)]
    ping_interval: u64,
    #[arg(long, default_value_t = 2)]
    write_timeout: u64,
    #[arg(long, default_value_t = 5000)]
    request_timeout_ms: u64,
    #[arg(long, default_value = "")]
    log_dir: String,
}

#[tokio::main]
async fn main() {
    let config = load_config(Args::parse());
    let _log_guard = init_logging(&config);
    let addr: SocketAddr = match config.addr.parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, addr = %config.addr);
            return;
        }
    };
    if !addr.ip().is_loopback() {
        error!(event = "invalid_addr", addr = %config.addr);
        return;
    }

    let hub = Arc::new(HubState::new(config.clone()));
    hub.clone().start_stale_reaper();

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(|| async { "ok" }))
        .with_state(hub.clone());

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "hub_error", error = %err);
            return;
        }
    };

    info!(event = "hub_start", session_id = %config.session_id, addr = %config.addr);

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    if let Err(err) = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    {
        error!(event = "hub_error", error = %err);
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(hub): State<Arc<HubState>>,
) -> impl IntoResponse {
    if !addr.ip().is_loopback() {
        return axum::http::StatusCode::FORBIDDEN.into_response();
    }
    ws.on_upgrade(move |socket| async move {
        hub.handle_socket(socket, addr).await;
    })
}

fn load_config(args: Args) -> Config {
    let mut session_id = args.session.clone();
    if session_id.trim().is_empty() {
        session_id = resolve_session_id();
    }
    Config {
        addr: resolve_addr(&args.addr),
        session_id,
        debug: args.debug || env_true("PBR_HUB_DEBUG"),
        stale_seconds: args.stale_seconds,
        ping_interval: Duration::from_secs(args.ping_interval),
        write_timeout: Duration::from_secs(args.write_timeout),
        request_timeout: Duration::from_millis(args.request_timeout_ms),
        log_dir: resolve_log_dir(&args.log_dir),
    }
}

fn init_logging(config: &Config) -> Option<LogGuard> {
    let level = if config.debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("PBR_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let writer = match open_log_file(&config.log_dir, &config.session_id) {
        Ok(log_guard) => log_guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let file = writer.file.clone();
    let make_writer = BoxMakeWriter::new(move || MultiWriter::new(file.clone()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(writer)
}

struct LogGuard {
    file: Option<Arc<Mutex<std::fs::File>>>,
}

/// Tees log output to stdout and the optional log file.
struct MultiWriter {
    stdout: io::Stdout,
    file: Option<Arc<Mutex<std::fs::File>>>,
}

impl MultiWriter {
    fn new(file: Option<Arc<Mutex<std::fs::File>>>) -> Self {
        Self {
            stdout: io::stdout(),
            file,
        }
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.stdout.write_all(buf);
        if let Some(file) = &self.file {
            let mut file = file.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let _ = file.write_all(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.stdout.flush();
        if let Some(file) = &self.file {
            let mut file = file.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let _ = file.flush();
        }
        Ok(())
    }
}

fn open_log_file(log_dir: &str, session_id: &str) -> io::Result<LogGuard> {
    if log_dir.trim().is_empty() {
        return Ok(LogGuard { file: None });
    }
    let dir = PathBuf::from(log_dir);
    std::fs::create_dir_all(&dir)?;
    let path = dir.join(log_file_name(session_id));
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
    })
}

fn log_file_name(session_id: &str) -> String {
    let safe: String = session_id
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' { ch } else { '_' })
        .collect();
    format!("pbr-hub-{safe}.log")
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn resolve_session_id() -> String {
    env_non_empty("PBR_SESSION_ID").unwrap_or_else(|| format!("pid-{}", std::process::id()))
}

fn resolve_addr(addr_flag: &str) -> String {
    if !addr_flag.trim().is_empty() {
        return addr_flag.to_string();
    }
    env_non_empty("PBR_HUB_ADDR").unwrap_or_else(|| DEFAULT_HUB_ADDR.to_string())
}

fn resolve_log_dir(log_dir_flag: &str) -> String {
    if !log_dir_flag.trim().is_empty() {
        return log_dir_flag.to_string();
    }
    env_non_empty("PBR_LOG_DIR").unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_win_over_defaults() {
        let args = Args::parse_from([
            "pbr-hub",
            "--addr",
            "127.0.0.1:5000",
            "--session",
            "s1",
            "--request-timeout-ms",
            "250",
            "--stale-seconds",
            "0",
            "--log-dir",
            "/tmp/pbr-logs",
        ]);
        let config = load_config(args);
        assert_eq!(config.addr, "127.0.0.1:5000");
        assert_eq!(config.session_id, "s1");
        assert_eq!(config.request_timeout, Duration::from_millis(250));
        assert_eq!(config.stale_after(), None);
        assert_eq!(config.log_dir, "/tmp/pbr-logs");
    }

    #[test]
    fn default_config_reaps_after_thirty_seconds() {
        assert_eq!(Config::default().stale_after(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn log_file_lands_in_log_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log_dir = dir.path().join("logs");
        let guard = open_log_file(log_dir.to_str().expect("utf8"), "s/1").expect("open");
        assert!(guard.file.is_some());
        assert!(log_dir.join("pbr-hub-s_1.log").exists());

        let mut writer = MultiWriter::new(guard.file.clone());
        writer.write_all(b"line\n").expect("write");
        writer.flush().expect("flush");
        let content = std::fs::read_to_string(log_dir.join("pbr-hub-s_1.log")).expect("read");
        assert_eq!(content, "line\n");
    }

    #[test]
    fn empty_log_dir_disables_file_logging() {
        assert!(open_log_file("  ", "s1").expect("open").file.is_none());
    }

    #[test]
    fn truthy_env_values() {
        std::env::set_var("PBR_TEST_TRUTHY", " Yes ");
        assert!(env_true("PBR_TEST_TRUTHY"));
        std::env::set_var("PBR_TEST_TRUTHY", "0");
        assert!(!env_true("PBR_TEST_TRUTHY"));
        std::env::remove_var("PBR_TEST_TRUTHY");
        assert!(!env_true("PBR_TEST_TRUTHY"));
    }
}
