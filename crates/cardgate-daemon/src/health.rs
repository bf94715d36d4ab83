use anyhow::{Context, Result};
use cardgate_core::{ContextSnapshot, Status};
use log::{info, warn};
use std::net::SocketAddr;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::watch;

/// What the health endpoint reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Health {
    /// Authenticated card, with its cardholder name.
    Ready(String),
    Degraded(Status),
}

impl Health {
    pub fn from_snapshot(snapshot: &ContextSnapshot) -> Self {
        match (&snapshot.status, &snapshot.display_name) {
            (Status::Authenticated, Some(name)) => Health::Ready(name.clone()),
            (status, _) => Health::Degraded(*status),
        }
    }

    pub fn body(&self) -> String {
        match self {
            Health::Ready(name) => format!("OK {name}"),
            Health::Degraded(status) => format!("DEGRADED {status}"),
        }
    }
}

pub async fn serve(addr: String, status_rx: watch::Receiver<Health>) -> Result<()> {
    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("parse health address {addr}"))?;

    let listener = TcpListener::bind(addr).await?;
    info!("health endpoint listening on http://{addr}");

    loop {
        let (mut stream, peer) = listener.accept().await?;
        let body = status_rx.borrow().body();
        let response = format!(
            "HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\ncontent-length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        if let Err(err) = stream.write_all(response.as_bytes()).await {
            warn!("failed to respond to {peer}: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(status: Status, display_name: Option<&str>) -> ContextSnapshot {
        ContextSnapshot {
            status,
            reader_name: Some("Reader A".into()),
            display_name: display_name.map(str::to_string),
            public_key: Vec::new(),
        }
    }

    #[test]
    fn authenticated_card_reports_ok() {
        let health = Health::from_snapshot(&snapshot(Status::Authenticated, Some("Ada")));
        assert_eq!(health.body(), "OK Ada");
    }

    #[test]
    fn anything_else_is_degraded() {
        let health = Health::from_snapshot(&snapshot(Status::Cooldown, None));
        assert_eq!(health, Health::Degraded(Status::Cooldown));
        assert_eq!(health.body(), "DEGRADED cooldown");
    }
}
