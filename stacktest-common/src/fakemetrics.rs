//! Synthetic carbon workload.
//!
//! Sends a fixed number of plaintext carbon points per period to a TCP
//! endpoint until closed. Delivery is best effort: connection and write
//! failures are logged and retried on the next tick.

use std::io::Write;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

/// Default metric name prefix; the series index is appended.
pub const DEFAULT_PREFIX: &str = "some.id.of.a.metric";

const STOP_POLL: Duration = Duration::from_millis(50);

/// Upper bound on a single connect or write, so `close` never waits on a
/// listener that stopped reading.
const IO_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum WorkloadError {
    #[error("Invalid workload rate: {0} (must be > 0)")]
    InvalidRate(u32),

    #[error("Workload is already running")]
    AlreadyRunning,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A workload generator driven by the scenario.
pub trait Workload: Send {
    /// Begin emitting `rate` points per second.
    fn start(&mut self, rate: u32) -> Result<(), WorkloadError>;

    /// Stop emitting and wait for the generator to finish. Idempotent.
    fn close(&mut self);
}

#[derive(Debug)]
struct Running {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Background generator of carbon plaintext points.
#[derive(Debug)]
pub struct CarbonWorkload {
    addr: String,
    prefix: String,
    period: Duration,
    sent: Arc<AtomicU64>,
    running: Option<Running>,
}

impl CarbonWorkload {
    /// `addr` is the `host:port` of the carbon plaintext listener.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            prefix: DEFAULT_PREFIX.to_string(),
            period: Duration::from_secs(1),
            sent: Arc::new(AtomicU64::new(0)),
            running: None,
        }
    }

    /// Emit the per-second rate once every `period` instead.
    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    /// Points written so far.
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }
}

impl Workload for CarbonWorkload {
    fn start(&mut self, rate: u32) -> Result<(), WorkloadError> {
        if rate == 0 {
            return Err(WorkloadError::InvalidRate(rate));
        }
        if self.running.is_some() {
            return Err(WorkloadError::AlreadyRunning);
        }

        info!(addr = %self.addr, rate, "starting carbon workload");
        let stop = Arc::new(AtomicBool::new(false));
        let generator = Generator {
            addr: self.addr.clone(),
            prefix: self.prefix.clone(),
            period: self.period,
            rate,
        };
        let handle = {
            let stop = Arc::clone(&stop);
            let sent = Arc::clone(&self.sent);
            thread::Builder::new()
                .name("fakemetrics-carbon".to_string())
                .spawn(move || generator.run(&stop, &sent))?
        };
        self.running = Some(Running { stop, handle });
        Ok(())
    }

    fn close(&mut self) {
        if let Some(running) = self.running.take() {
            running.stop.store(true, Ordering::Relaxed);
            if running.handle.join().is_err() {
                warn!("carbon workload thread panicked");
            }
            info!(sent = self.sent(), "carbon workload stopped");
        }
    }
}

impl Drop for CarbonWorkload {
    fn drop(&mut self) {
        self.close();
    }
}

/// Render one tick of points.
pub fn render_batch(prefix: &str, rate: u32, value: u64, timestamp: i64) -> String {
    let mut batch = String::with_capacity(rate as usize * (prefix.len() + 32));
    for i in 1..=rate {
        batch.push_str(&format!("{prefix}.{i} {value} {timestamp}\n"));
    }
    batch
}

struct Generator {
    addr: String,
    prefix: String,
    period: Duration,
    rate: u32,
}

impl Generator {
    fn io_timeout(&self) -> Duration {
        self.period.clamp(STOP_POLL, IO_TIMEOUT)
    }

    fn run(&self, stop: &AtomicBool, sent: &AtomicU64) {
        let mut conn: Option<TcpStream> = None;
        let mut tick: u64 = 0;
        let mut next = Instant::now();

        while !stop.load(Ordering::Relaxed) {
            let now = Instant::now();
            if now < next {
                thread::sleep((next - now).min(STOP_POLL));
                continue;
            }
            next += self.period;
            tick += 1;

            if conn.is_none() {
                match connect(&self.addr, self.io_timeout()) {
                    Ok(stream) => {
                        debug!(addr = %self.addr, "carbon connection established");
                        conn = Some(stream);
                    }
                    Err(e) => {
                        warn!(addr = %self.addr, "carbon connect failed: {e}");
                        continue;
                    }
                }
            }

            let batch = render_batch(
                &self.prefix,
                self.rate,
                tick,
                chrono::Utc::now().timestamp(),
            );
            if let Some(stream) = conn.as_mut() {
                match stream.write_all(batch.as_bytes()) {
                    Ok(()) => {
                        sent.fetch_add(u64::from(self.rate), Ordering::Relaxed);
                    }
                    // Includes WouldBlock/TimedOut from a peer that stopped reading.
                    Err(e) => {
                        warn!(addr = %self.addr, "carbon write failed, reconnecting: {e}");
                        conn = None;
                    }
                }
            }
        }
    }
}

/// Connect to the first reachable address of `addr`, bounded by `timeout`
/// per address, with writes bounded by the same timeout.
fn connect(addr: &str, timeout: Duration) -> std::io::Result<TcpStream> {
    let mut last_err = None;
    for resolved in addr.to_socket_addrs()? {
        match TcpStream::connect_timeout(&resolved, timeout) {
            Ok(stream) => {
                stream.set_write_timeout(Some(timeout))?;
                return Ok(stream);
            }
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::AddrNotAvailable,
            format!("{addr} resolved to no addresses"),
        )
    }))
}
