//! The sandbox-facing CONNECT proxy. Carries only CONNECT tunnels
//! byte-for-byte — no TLS termination, no retrying the upstream dial.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use base64::Engine;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, AsyncWrite, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use crate::approver::{ConnectRequest, DomainApprover};
use crate::tokens::TokenRegistry;

struct Running {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    accept_task: tokio::task::JoinHandle<()>,
}

pub struct Proxy {
    registry: Arc<TokenRegistry>,
    approver: Arc<DomainApprover>,
    state: Mutex<Option<Running>>,
}

impl Proxy {
    pub fn new(registry: Arc<TokenRegistry>, approver: Arc<DomainApprover>) -> Arc<Self> {
        Arc::new(Self { registry, approver, state: Mutex::new(None) })
    }

    pub async fn start(self: &Arc<Self>, addr: SocketAddr) -> Result<()> {
        {
            let state = self.state.lock().unwrap();
            anyhow::ensure!(state.is_none(), "proxy is already running");
        }

        let listener = TcpListener::bind(addr).await.with_context(|| format!("bind {addr}"))?;
        let local_addr = listener.local_addr().context("read listener local addr")?;
        tracing::info!(%local_addr, "guardian proxy listening");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let this = self.clone();
        let accept_task = tokio::spawn(this.accept_loop(listener, shutdown_rx));

        *self.state.lock().unwrap() = Some(Running { local_addr, shutdown_tx, accept_task });
        Ok(())
    }

    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.state.lock().unwrap().as_ref().map(|running| running.local_addr)
    }

    /// Graceful, idempotent: a second call while already stopped is a no-op.
    pub async fn stop(&self, deadline: Duration) -> Result<()> {
        let running = self.state.lock().unwrap().take();
        let Some(running) = running else {
            return Ok(());
        };
        let _ = running.shutdown_tx.send(true);

        if tokio::time::timeout(deadline, running.accept_task).await.is_err() {
            tracing::warn!("proxy stop: deadline elapsed before accept loop exited");
        }
        Ok(())
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _peer)) => {
                            let this = self.clone();
                            tokio::spawn(async move { this.handle_connection(stream).await; });
                        }
                        Err(err) => tracing::warn!(?err, "proxy accept failed"),
                    }
                }
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream) {
        if let Err(err) = self.serve(stream).await {
            tracing::debug!(?err, "proxy connection ended with an error");
        }
    }

    async fn serve(&self, stream: TcpStream) -> Result<()> {
        let mut reader = BufReader::new(stream);

        let mut request_line = String::new();
        if reader.read_line(&mut request_line).await? == 0 {
            return Ok(());
        }
        let mut parts = request_line.trim_end().splitn(3, ' ');
        let (method, target) = match (parts.next(), parts.next()) {
            (Some(method), Some(target)) if !method.is_empty() => (method.to_string(), target.to_string()),
            _ => {
                respond(&mut reader, "GET", 400, "Bad Request", Some("malformed request line")).await?;
                return Ok(());
            }
        };

        let headers = read_headers(&mut reader).await?;

        if !method.eq_ignore_ascii_case("CONNECT") {
            let body = format!("only CONNECT is supported here, got {method}");
            respond(&mut reader, &method, 405, "Method Not Allowed", Some(&body)).await?;
            return Ok(());
        }

        let Some(token) = headers.get("proxy-authorization").and_then(|v| parse_bearer(v)) else {
            respond_unauthorized(&mut reader, "missing or malformed Proxy-Authorization").await?;
            return Ok(());
        };

        let Some(identity) = self.registry.validate(&token).await else {
            respond_unauthorized(&mut reader, "unknown bearer token").await?;
            return Ok(());
        };

        let Some(host) = normalize_host(&target) else {
            respond(&mut reader, &method, 400, "Bad Request", Some("invalid CONNECT target")).await?;
            return Ok(());
        };

        let verdict = self
            .approver
            .authorize(ConnectRequest {
                token,
                cloister: identity.cloister,
                project: identity.project,
                host,
            })
            .await?;

        if !verdict.approved {
            let reason = verdict.reason.unwrap_or_else(|| "denied".to_string());
            respond(&mut reader, &method, 403, "Forbidden", Some(&reason)).await?;
            return Ok(());
        }

        let mut upstream = match TcpStream::connect(&target).await {
            Ok(stream) => stream,
            Err(err) => {
                tracing::warn!(?err, target, "upstream dial failed");
                respond(&mut reader, &method, 502, "Bad Gateway", Some("upstream dial failed")).await?;
                return Ok(());
            }
        };

        // Anything the client already pushed past the blank line (shouldn't
        // happen for a well-behaved CONNECT client, but don't lose it).
        let pipelined = reader.buffer().to_vec();
        let mut client = reader.into_inner();
        client.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n").await?;
        if !pipelined.is_empty() {
            upstream.write_all(&pipelined).await?;
        }

        tokio::io::copy_bidirectional(&mut client, &mut upstream).await.ok();
        Ok(())
    }
}

async fn read_headers(reader: &mut BufReader<TcpStream>) -> Result<HashMap<String, String>> {
    let mut headers = HashMap::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            break;
        }
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((key, value)) = line.split_once(':') {
            headers.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }
    Ok(headers)
}

async fn respond(
    reader: &mut BufReader<TcpStream>,
    method: &str,
    status: u16,
    reason: &str,
    body: Option<&str>,
) -> Result<()> {
    write_response(reader, method, status, reason, body, &[]).await
}

async fn respond_unauthorized(reader: &mut BufReader<TcpStream>, body: &str) -> Result<()> {
    write_response(
        reader,
        "CONNECT",
        407,
        "Proxy Authentication Required",
        Some(body),
        &[("Proxy-Authenticate", "Basic realm=\"cloister\"")],
    )
    .await
}

async fn write_response(
    writer: &mut (impl AsyncWrite + Unpin),
    method: &str,
    status: u16,
    reason: &str,
    body: Option<&str>,
    extra_headers: &[(&str, &str)],
) -> Result<()> {
    let body = if method.eq_ignore_ascii_case("HEAD") { "" } else { body.unwrap_or("") };

    let mut response = format!("HTTP/1.1 {status} {reason}\r\nContent-Length: {}\r\n", body.len());
    for (name, value) in extra_headers {
        response.push_str(&format!("{name}: {value}\r\n"));
    }
    response.push_str("\r\n");
    response.push_str(body);

    writer.write_all(response.as_bytes()).await?;
    Ok(())
}

/// `Proxy-Authorization: Basic base64("token:"+bearer)`.
fn parse_bearer(header_value: &str) -> Option<String> {
    let encoded = header_value.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD.decode(encoded).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let bearer = decoded.strip_prefix("token:")?;
    if bearer.is_empty() {
        None
    } else {
        Some(bearer.to_string())
    }
}

/// Strips the port from a CONNECT authority-form target, handling bracketed
/// IPv6 literals. Returns `None` for an empty host.
fn normalize_host(target: &str) -> Option<String> {
    let host = if let Some(rest) = target.strip_prefix('[') {
        let end = rest.find(']')?;
        &rest[..end]
    } else {
        target.rsplit_once(':').map_or(target, |(host, _port)| host)
    };
    if host.is_empty() {
        None
    } else {
        Some(host.to_ascii_lowercase())
    }
}
