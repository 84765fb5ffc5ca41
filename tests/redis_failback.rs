//! Failback against a Redis server whose connection handshake is slower than
//! a single check is allowed to take.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use hivegate::events::EventEmitter;
use hivegate::ratelimit::{
    DistributedRateLimiter, HealthState, LimiterBackend, LocalRateLimiter, PolicyResolver,
    PolicySet, PrincipalTier, RateLimiter, SubjectInput,
};
use hivegate::store::{RedisStore, RedisStoreConfig};

const HANDSHAKE_DELAY: Duration = Duration::from_millis(60);

/// Read one RESP array command, returning its arguments.
async fn read_command(reader: &mut BufReader<TcpStream>) -> Option<Vec<String>> {
    let mut line = String::new();
    if reader.read_line(&mut line).await.ok()? == 0 {
        return None;
    }
    let count: usize = line.trim_end().strip_prefix('*')?.parse().ok()?;

    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        line.clear();
        reader.read_line(&mut line).await.ok()?;
        let len: usize = line.trim_end().strip_prefix('$')?.parse().ok()?;
        let mut buf = vec![0u8; len + 2];
        reader.read_exact(&mut buf).await.ok()?;
        buf.truncate(len);
        args.push(String::from_utf8(buf).ok()?);
    }
    Some(args)
}

/// Answers PING with PONG and everything else with OK, holding back the
/// first reply on every connection.
async fn serve(stream: TcpStream) {
    let mut reader = BufReader::new(stream);
    let mut first = true;

    while let Some(args) = read_command(&mut reader).await {
        if first {
            tokio::time::sleep(HANDSHAKE_DELAY).await;
            first = false;
        }
        let reply: &[u8] = match args.first().map(|cmd| cmd.to_ascii_uppercase()) {
            Some(cmd) if cmd == "PING" => b"+PONG\r\n",
            _ => b"+OK\r\n",
        };
        if reader.get_mut().write_all(reply).await.is_err() {
            return;
        }
    }
}

async fn slow_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(serve(stream));
        }
    });
    format!("redis://{}", addr)
}

#[tokio::test]
async fn test_slow_handshake_store_fails_back() {
    let url = slow_server().await;
    let store = RedisStore::new(RedisStoreConfig {
        url,
        key_prefix: "hivegate".to_string(),
        connect_timeout: Duration::from_millis(500),
    })
    .unwrap();

    let limiter = RateLimiter::new(
        Arc::new(PolicyResolver::new(PolicySet::builtin())),
        DistributedRateLimiter::new(Arc::new(store)),
        Arc::new(LocalRateLimiter::default()),
        EventEmitter::disabled(),
    );
    let input = SubjectInput::new("user-1", PrincipalTier::User);

    // The handshake cannot finish inside one check, so the request fails over.
    let decision = limiter.evaluate(&input).await;
    assert_eq!(decision.backend, LimiterBackend::Local);
    assert_eq!(limiter.state(), HealthState::Degraded);

    assert_eq!(limiter.probe_now().await, HealthState::Healthy);
    assert_eq!(limiter.health().failovers, 1);
}
