//! Minimal DNS client used by health checks and upstream validation.
//! Sends one A query over UDP and reads back the response header.

use std::net::SocketAddr;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::timeout;

const RCODE_NXDOMAIN: u8 = 3;

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no answer from {0} within timeout")]
    Timeout(SocketAddr),
    #[error("malformed response: {0}")]
    Malformed(&'static str),
}

/// What the resolver said about a name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeAnswer {
    pub rcode: u8,
    pub answer_count: u16,
}

impl ProbeAnswer {
    pub fn resolved(&self) -> bool {
        self.rcode == 0 && self.answer_count > 0
    }

    pub fn nxdomain(&self) -> bool {
        self.rcode == RCODE_NXDOMAIN
    }
}

/// Encode a DNS name into wire format labels.
fn encode_name(name: &str, buf: &mut Vec<u8>) {
    for label in name.trim_end_matches('.').split('.').filter(|l| !l.is_empty()) {
        let len = label.len().min(63);
        buf.push(len as u8);
        buf.extend_from_slice(&label.as_bytes()[..len]);
    }
    buf.push(0);
}

/// Build a recursive A query for `name`.
pub fn build_query(txid: u16, name: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(12 + name.len() + 6);
    buf.extend_from_slice(&txid.to_be_bytes());
    buf.extend_from_slice(&0x0100u16.to_be_bytes()); // RD
    buf.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    buf.extend_from_slice(&[0, 0, 0, 0, 0, 0]); // AN/NS/AR
    encode_name(name, &mut buf);
    buf.extend_from_slice(&1u16.to_be_bytes()); // A
    buf.extend_from_slice(&1u16.to_be_bytes()); // IN
    buf
}

/// Read rcode and answer count from a response to `txid`.
pub fn parse_answer(buf: &[u8], txid: u16) -> Result<ProbeAnswer, ProbeError> {
    if buf.len() < 12 {
        return Err(ProbeError::Malformed("response shorter than header"));
    }
    if u16::from_be_bytes([buf[0], buf[1]]) != txid {
        return Err(ProbeError::Malformed("transaction id mismatch"));
    }
    if buf[2] & 0x80 == 0 {
        return Err(ProbeError::Malformed("QR flag not set"));
    }
    Ok(ProbeAnswer {
        rcode: buf[3] & 0x0F,
        answer_count: u16::from_be_bytes([buf[6], buf[7]]),
    })
}

/// Ask `server` for the A record of `name`.
pub async fn query(server: SocketAddr, name: &str, dur: Duration) -> Result<ProbeAnswer, ProbeError> {
    let bind_addr: SocketAddr = if server.is_ipv4() {
        SocketAddr::from(([0, 0, 0, 0], 0))
    } else {
        SocketAddr::from(([0u16; 8], 0))
    };
    let socket = UdpSocket::bind(bind_addr).await?;

    let txid: u16 = rand::rng().random();
    socket.send_to(&build_query(txid, name), server).await?;

    let mut buf = vec![0u8; 1500];
    let deadline = tokio::time::Instant::now() + dur;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let (len, src) = timeout(remaining, socket.recv_from(&mut buf))
            .await
            .map_err(|_| ProbeError::Timeout(server))??;
        // Ignore stray datagrams from anyone but the server we asked.
        if src.ip() != server.ip() {
            continue;
        }
        return parse_answer(&buf[..len], txid);
    }
}
