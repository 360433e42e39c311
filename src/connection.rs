use std::io;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::sleep;
use tracing::{error, info};

const MAX_RECONNECT_DELAY_MS: u64 = 30_000;

/// Dials the bridge server, retrying with exponential backoff and jitter.
#[derive(Debug, Clone)]
pub struct ConnectionManager {
    addr: String,
    max_reconnect_attempts: u32,
    reconnect_delay_ms: u64,
}

impl ConnectionManager {
    pub fn new(addr: &str) -> Self {
        ConnectionManager {
            addr: addr.to_string(),
            max_reconnect_attempts: 10,
            reconnect_delay_ms: 1000,
        }
    }

    pub fn with_reconnect_policy(mut self, max_attempts: u32, initial_delay_ms: u64) -> Self {
        self.max_reconnect_attempts = max_attempts.max(1);
        self.reconnect_delay_ms = initial_delay_ms;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub async fn connect(&self) -> io::Result<TcpStream> {
        let mut attempts = 0;
        let mut delay = self.reconnect_delay_ms;

        loop {
            info!("Attempting to connect to bridge at {}", self.addr);

            match TcpStream::connect(&self.addr).await {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    info!("Connected to bridge at {}", self.addr);
                    return Ok(stream);
                }
                Err(err) => {
                    attempts += 1;
                    error!(
                        "Failed to connect to {} (attempt {}/{}): {}",
                        self.addr, attempts, self.max_reconnect_attempts, err
                    );

                    if attempts >= self.max_reconnect_attempts {
                        error!("Max reconnection attempts reached. Giving up.");
                        return Err(err);
                    }

                    let sleep_time = jittered(delay);
                    info!("Waiting {}ms before next reconnect attempt", sleep_time);
                    sleep(Duration::from_millis(sleep_time)).await;

                    delay = std::cmp::min(delay.saturating_mul(2), MAX_RECONNECT_DELAY_MS);
                }
            }
        }
    }
}

// +/-15% around `delay`.
fn jittered(delay: u64) -> u64 {
    let jitter = (rand::random::<f64>() * 0.3 - 0.15) * delay as f64;
    (delay as f64 + jitter).max(0.0) as u64
}
