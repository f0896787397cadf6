use std::io::Write;
use std::net::TcpStream;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

pub struct GuardianGuard {
    pub proxy_addr: String,
    pub token_api_base: String,
    pub approval_api_base: String,
    _data_dir: tempfile::TempDir,
    child: Child,
}

impl Drop for GuardianGuard {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

pub struct SpawnOptions<'a> {
    pub default_allowlist: Option<&'a str>,
    pub approval_timeout_secs: u64,
}

impl Default for SpawnOptions<'_> {
    fn default() -> Self {
        Self { default_allowlist: None, approval_timeout_secs: 30 }
    }
}

pub fn spawn_guardian(opts: SpawnOptions) -> Result<GuardianGuard> {
    let data_dir = tempfile::tempdir().context("create guardian tempdir")?;

    let proxy_addr_file = data_dir.path().join("proxy-addr.txt");
    let token_api_addr_file = data_dir.path().join("token-api-addr.txt");
    let approval_api_addr_file = data_dir.path().join("approval-api-addr.txt");

    let mut args = vec![
        "--proxy-addr".to_string(),
        "127.0.0.1:0".to_string(),
        "--token-api-addr".to_string(),
        "127.0.0.1:0".to_string(),
        "--approval-api-addr".to_string(),
        "127.0.0.1:0".to_string(),
        "--data-dir".to_string(),
        data_dir.path().to_str().unwrap().to_string(),
        "--proxy-addr-file".to_string(),
        proxy_addr_file.to_str().unwrap().to_string(),
        "--token-api-addr-file".to_string(),
        token_api_addr_file.to_str().unwrap().to_string(),
        "--approval-api-addr-file".to_string(),
        approval_api_addr_file.to_str().unwrap().to_string(),
        "--approval-timeout".to_string(),
        opts.approval_timeout_secs.to_string(),
    ];

    if let Some(contents) = opts.default_allowlist {
        let path = data_dir.path().join("default.allowlist");
        std::fs::write(&path, contents).context("write default allowlist")?;
        args.push("--default-allowlist".to_string());
        args.push(path.to_str().unwrap().to_string());
    }

    let child = Command::new(env!("CARGO_BIN_EXE_guardian"))
        .args(&args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .context("spawn guardian")?;

    let proxy_addr = read_addr_file(&proxy_addr_file)?;
    let token_api_addr = read_addr_file(&token_api_addr_file)?;
    let approval_api_addr = read_addr_file(&approval_api_addr_file)?;
    let token_api_base = format!("http://{token_api_addr}");
    let approval_api_base = format!("http://{approval_api_addr}");

    wait_for_up(&token_api_base)?;
    wait_for_up(&approval_api_base)?;

    Ok(GuardianGuard { proxy_addr, token_api_base, approval_api_base, _data_dir: data_dir, child })
}

fn read_addr_file(path: &Path) -> Result<String> {
    let start = Instant::now();
    loop {
        if start.elapsed() > Duration::from_secs(5) {
            anyhow::bail!("addr file not written at {}", path.display());
        }
        if let Ok(s) = std::fs::read_to_string(path) {
            let s = s.trim();
            if !s.is_empty() {
                return Ok(s.to_string());
            }
        }
        thread::sleep(Duration::from_millis(10));
    }
}

fn wait_for_up(base_url: &str) -> Result<()> {
    let client = reqwest::blocking::Client::new();
    let start = Instant::now();
    loop {
        if start.elapsed() > Duration::from_secs(5) {
            anyhow::bail!("{base_url} did not come up in time");
        }
        if client.get(format!("{base_url}/tokens")).send().is_ok() || client.get(format!("{base_url}/pending-domains")).send().is_ok() {
            return Ok(());
        }
        thread::sleep(Duration::from_millis(20));
    }
}

pub fn register_token(base_url: &str, token: &str, cloister: &str, project: &str) -> Result<()> {
    let client = reqwest::blocking::Client::new();
    client
        .post(format!("{base_url}/tokens"))
        .json(&serde_json::json!({"token": token, "cloister": cloister, "project": project, "worktree": "/work"}))
        .send()
        .context("register token")?
        .error_for_status()
        .context("register token status")?;
    Ok(())
}

/// A bare TCP echo server: accepts connections for as long as the test
/// holds its `JoinHandle`, echoing everything it reads back to the client.
pub fn spawn_echo_server() -> Result<(std::net::SocketAddr, thread::JoinHandle<()>)> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").context("bind echo listener")?;
    let addr = listener.local_addr()?;
    let handle = thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { break };
            thread::spawn(move || {
                let mut reader = stream.try_clone().unwrap();
                let _ = std::io::copy(&mut reader, &mut stream);
            });
        }
    });
    Ok((addr, handle))
}

/// Issues a raw CONNECT through the guardian proxy and returns the status
/// line and the already-connected socket (on a 200).
pub fn connect_through_proxy(proxy_addr: &str, token: &str, target: &str) -> Result<(String, TcpStream)> {
    let mut stream = TcpStream::connect(proxy_addr).context("dial proxy")?;
    let auth = base64_basic(token);
    let request = format!(
        "CONNECT {target} HTTP/1.1\r\nHost: {target}\r\nProxy-Authorization: Basic {auth}\r\n\r\n"
    );
    stream.write_all(request.as_bytes())?;

    let status_line = read_status_line(&mut stream)?;
    Ok((status_line, stream))
}

fn base64_basic(token: &str) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(format!("token:{token}"))
}

fn read_status_line(stream: &mut TcpStream) -> Result<String> {
    use std::io::Read;
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).context("read proxy response")?;
        if n == 0 {
            break;
        }
        buf.push(byte[0]);
        if buf.ends_with(b"\r\n\r\n") {
            break;
        }
    }
    Ok(String::from_utf8_lossy(&buf).lines().next().unwrap_or_default().to_string())
}
