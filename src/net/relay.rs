//! Full-duplex byte relay between two connections.

use std::fmt;
use std::io;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::trace;

/// Bytes moved per read. The relay never holds more than this per direction.
pub const RELAY_CHUNK_SIZE: usize = 16 * 1024;

/// Which half of the relay finished first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// From the first connection to the second.
    AToB,
    /// From the second connection to the first.
    BToA,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::AToB => "a_to_b",
            Direction::BToA => "b_to_a",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a relay ended.
#[derive(Debug)]
pub struct RelayOutcome {
    /// The direction that ended the relay.
    pub finished: Direction,
    /// Bytes copied by that direction, or the error that stopped it.
    pub result: io::Result<u64>,
    /// Bytes written `a → b`, whether or not that direction finished.
    pub a_to_b: u64,
    /// Bytes written `b → a`, whether or not that direction finished.
    pub b_to_a: u64,
}

/// Copy `a → b` and `b → a` concurrently until either direction hits
/// end-of-stream or an error.
///
/// The direction that ends first shuts down the write side it was feeding;
/// the other direction is then dropped mid-copy. Closing `a` and `b` is
/// left to the caller.
pub async fn relay<A, B>(a: &mut A, b: &mut B) -> RelayOutcome
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let (a_read, mut a_write) = tokio::io::split(a);
    let (b_read, mut b_write) = tokio::io::split(b);
    let mut a_to_b = 0;
    let mut b_to_a = 0;

    let (finished, result) = {
        let forward = half_copy(a_read, &mut b_write, &mut a_to_b);
        let backward = half_copy(b_read, &mut a_write, &mut b_to_a);
        tokio::pin!(forward, backward);

        tokio::select! {
            res = &mut forward => (Direction::AToB, res),
            res = &mut backward => (Direction::BToA, res),
        }
    };
    trace!(%finished, ?result, a_to_b, b_to_a, "relay direction finished, abandoning the other");

    RelayOutcome {
        finished,
        result,
        a_to_b,
        b_to_a,
    }
}

/// Copy until end-of-stream, keeping `copied` current after every write so
/// the count survives the copy being dropped.
async fn half_copy<R, W>(reader: R, writer: &mut W, copied: &mut u64) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = BufReader::with_capacity(RELAY_CHUNK_SIZE, reader);
    loop {
        let chunk = reader.fill_buf().await?;
        if chunk.is_empty() {
            break;
        }
        writer.write_all(chunk).await?;
        let n = chunk.len();
        reader.consume(n);
        *copied += n as u64;
    }
    writer.flush().await?;
    // Half-close: tell the peer this side is done.
    writer.shutdown().await.ok();
    Ok(*copied)
}

#[cfg(test)]
mod tests {
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn copies_both_directions_until_close() {
        let (mut client, mut proxy_client_side) = duplex(64);
        let (mut proxy_upstream_side, mut upstream) = duplex(64);

        let relay_task = tokio::spawn(async move {
            relay(&mut proxy_client_side, &mut proxy_upstream_side).await
        });

        client.write_all(b"PING").await.unwrap();
        let mut buf = [0u8; 4];
        upstream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"PING");

        upstream.write_all(b"PONG").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"PONG");

        drop(client);
        let outcome = relay_task.await.unwrap();
        assert_eq!(outcome.finished, Direction::AToB);
        assert_eq!(outcome.result.unwrap(), 4);
        assert_eq!(outcome.a_to_b, 4);
        assert_eq!(outcome.b_to_a, 4);

        // The upstream sees the half-close as end-of-stream.
        let mut rest = Vec::new();
        upstream.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn large_payload_arrives_intact() {
        let (mut client, mut proxy_client_side) = duplex(1024);
        let (mut proxy_upstream_side, mut upstream) = duplex(1024);

        let relay_task = tokio::spawn(async move {
            relay(&mut proxy_client_side, &mut proxy_upstream_side).await
        });

        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            client.write_all(&payload).await.unwrap();
            client.shutdown().await.unwrap();
            client
        });

        let mut received = Vec::new();
        upstream.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, expected);

        let _client = writer.await.unwrap();
        let outcome = relay_task.await.unwrap();
        assert_eq!(outcome.result.unwrap(), expected.len() as u64);
    }

    #[tokio::test]
    async fn upstream_close_ends_relay() {
        let (_client, mut proxy_client_side) = duplex(64);
        let (mut proxy_upstream_side, upstream) = duplex(64);
        drop(upstream);

        let outcome = relay(&mut proxy_client_side, &mut proxy_upstream_side).await;
        assert_eq!(outcome.finished, Direction::BToA);
    }

    #[tokio::test]
    async fn abandoned_direction_still_counts_its_bytes() {
        let (mut client, mut proxy_client_side) = duplex(64);
        let (mut proxy_upstream_side, mut upstream) = duplex(1024);

        let relay_task = tokio::spawn(async move {
            relay(&mut proxy_client_side, &mut proxy_upstream_side).await
        });

        client.write_all(b"GET").await.unwrap();
        let mut buf = [0u8; 3];
        upstream.read_exact(&mut buf).await.unwrap();

        // The upstream answers and closes while the client side stays open.
        upstream.write_all(&[7u8; 500]).await.unwrap();
        upstream.shutdown().await.unwrap();
        let mut answer = vec![0u8; 500];
        client.read_exact(&mut answer).await.unwrap();
        drop(upstream);

        let outcome = relay_task.await.unwrap();
        assert_eq!(outcome.finished, Direction::BToA);
        assert_eq!(outcome.result.unwrap(), 500);
        assert_eq!(outcome.b_to_a, 500);
        assert_eq!(outcome.a_to_b, 3);
    }
}
