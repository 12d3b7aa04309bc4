//! Bridge load generator.
//!
//! Starts the send-side worker against a local or UDP destination and feeds
//! it synthetic AMQP messages until the requested count is reached or Ctrl-C
//! is pressed, then prints the worker counters.
//!
//! # Usage
//!
//! ```sh
//! sgbridge --count 100000 --size 512 unix --path /tmp/smartgateway
//! sgbridge --rate 5000 inet --host 127.0.0.1 --port 30000
//! ```
//!
//! # Signals
//!
//! - `SIGINT` / `SIGTERM`: stop generating and shut down

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::{Parser, Subcommand};
use minstant::Instant;
use sgbridge::cancel::CancelToken;
use sgbridge::config::{AddressDomain, BridgeConfig, DEFAULT_CONTAINER_ID, DEFAULT_UNIX_PATH};
use sgbridge::envelope::{Body, Envelope, MessageBuilder};
use sgbridge::queue::{self, DEFAULT_QUEUE_DEPTH, Producer, PushError};
use sgbridge::runtime::{DispatchExit, Worker, WorkerError};
use tracing::{error, info, warn};

/// How long one push waits on a full queue before rechecking for Ctrl-C.
const PUSH_WAIT: Duration = Duration::from_millis(50);

#[derive(Parser, Debug)]
#[command(name = "sgbridge")]
#[command(about = "Forward AMQP message bodies to a local or UDP datagram socket")]
struct Args {
    /// Identifier used in log lines.
    #[arg(long, env = "SGBRIDGE_ID", default_value = DEFAULT_CONTAINER_ID)]
    id: String,

    /// Messages to generate. Runs until Ctrl-C when omitted.
    #[arg(long, env = "SGBRIDGE_COUNT")]
    count: Option<u64>,

    /// Body size in bytes.
    #[arg(long, env = "SGBRIDGE_SIZE", default_value_t = 256)]
    size: usize,

    /// Messages per second. Unpaced when omitted.
    #[arg(long, env = "SGBRIDGE_RATE")]
    rate: Option<u64>,

    /// Socket send buffer size in bytes.
    #[arg(long, env = "SGBRIDGE_SNDBUF")]
    sndbuf: Option<usize>,

    /// Inbound queue depth.
    #[arg(long, env = "SGBRIDGE_QUEUE_DEPTH", default_value_t = DEFAULT_QUEUE_DEPTH, value_parser = parse_depth)]
    queue_depth: usize,

    /// Let sends block instead of counting a full buffer as would-block.
    #[arg(long)]
    blocking: bool,

    #[command(subcommand)]
    destination: DestinationArgs,
}

#[derive(Subcommand, Debug)]
enum DestinationArgs {
    /// Send to a local datagram socket bound at a filesystem path.
    Unix {
        /// Socket path.
        #[arg(long, env = "SGBRIDGE_PATH", default_value = DEFAULT_UNIX_PATH)]
        path: PathBuf,
    },
    /// Send UDP datagrams to a host and port.
    Inet {
        /// Host name or IP address.
        #[arg(long, env = "SGBRIDGE_HOST", default_value = "127.0.0.1")]
        host: String,

        /// Port number or service name.
        #[arg(long, env = "SGBRIDGE_PORT")]
        port: String,
    },
}

impl Args {
    fn config(&self) -> BridgeConfig {
        let mut config = BridgeConfig {
            container_id: self.id.clone(),
            nonblocking: !self.blocking,
            ..BridgeConfig::default()
        };
        match &self.destination {
            DestinationArgs::Unix { path } => {
                config.domain = AddressDomain::Unix.to_string();
                config.unix_path.clone_from(path);
            }
            DestinationArgs::Inet { host, port } => {
                config.domain = AddressDomain::Inet.to_string();
                config.peer_host.clone_from(host);
                config.peer_port.clone_from(port);
            }
        }
        config
    }
}

fn parse_depth(s: &str) -> Result<usize, String> {
    match s.parse::<usize>() {
        Ok(0) => Err("queue depth must be at least 1".into()),
        Ok(n) => Ok(n),
        Err(e) => Err(e.to_string()),
    }
}

fn main() -> ExitCode {
    sgbridge::init_tracing();
    let args = Args::parse();

    match run(&args) {
        Ok(DispatchExit::Fatal(_)) => ExitCode::FAILURE,
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("sgbridge: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<DispatchExit, WorkerError> {
    let worker = Worker::from_config(&args.config())?;
    if let Some(size) = args.sndbuf {
        let socket = worker.socket().socket();
        match socket.set_send_buffer_size(size) {
            Ok(()) => info!(
                requested = size,
                actual = socket.send_buffer_size().unwrap_or(0),
                "send buffer resized"
            ),
            Err(e) => warn!(requested = size, error = %e, "could not set send buffer size"),
        }
    }

    let (tx, rx) = queue::channel(args.queue_depth);
    let handle = worker.start(rx, CancelToken::new())?;
    let stats = Arc::clone(handle.stats());

    let stop = CancelToken::new();
    let (done_tx, done_rx) = mpsc::channel::<&'static str>();
    {
        let stop = stop.clone();
        let done_tx = done_tx.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            stop.cancel();
            let _ = done_tx.send("interrupted");
        }) {
            error!("failed to set Ctrl-C handler: {e}");
        }
    }

    let started = Instant::now();
    let generator = {
        let stop = stop.clone();
        let count = args.count;
        let size = args.size;
        let rate = args.rate;
        thread::Builder::new()
            .name("sgbridge-gen".into())
            .spawn(move || {
                let generated = generate(&tx, &stop, count, size, rate);
                let _ = done_tx.send("generator finished");
                generated
            })
            .expect("failed to spawn generator thread")
    };

    let reason = done_rx.recv().unwrap_or("generator gone");
    info!(reason, "stopping");
    stop.cancel();
    let generated = generator.join().unwrap_or(0);

    // The generator dropped its producer; let the worker drain unless the
    // user asked to stop right away.
    let exit = if reason == "interrupted" {
        handle.shutdown()?
    } else {
        handle.join()?
    };

    let elapsed = started.elapsed();
    let snapshot = stats.snapshot();
    println!("exit:          {exit:?}");
    println!("generated:     {generated}");
    println!("sent:          {}", snapshot.sent);
    println!("decode errors: {}", snapshot.decode_errors);
    println!("would block:   {}", snapshot.would_block);
    println!("refused:       {}", snapshot.refused);
    println!("empty bodies:  {}", snapshot.empty_bodies);
    println!(
        "elapsed:       {:.3}s ({:.0} msg/s)",
        elapsed.as_secs_f64(),
        snapshot.sent as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );
    Ok(exit)
}

/// Pushes synthetic messages until `count` is reached or `stop` fires.
/// Returns how many were queued.
fn generate(
    tx: &Producer<Envelope>,
    stop: &CancelToken,
    count: Option<u64>,
    size: usize,
    rate: Option<u64>,
) -> u64 {
    let interval = rate
        .filter(|&r| r > 0)
        .map(|r| Duration::from_nanos(1_000_000_000 / r));
    let start = Instant::now();
    let mut seq = 0u64;

    while count.is_none_or(|c| seq < c) && !stop.is_cancelled() {
        if let Some(interval) = interval {
            let due = start + interval * u32::try_from(seq).unwrap_or(u32::MAX);
            let now = Instant::now();
            if due > now {
                thread::sleep(due - now);
            }
        }

        let mut envelope = synthetic(seq, size);
        loop {
            match tx.push_timeout(envelope, Some(PUSH_WAIT)) {
                Ok(()) => break,
                Err(PushError::Full(returned)) if !stop.is_cancelled() => envelope = returned,
                Err(_) => return seq,
            }
        }
        seq += 1;
    }
    seq
}

/// A collectd-style JSON body padded to `size` bytes.
fn synthetic(seq: u64, size: usize) -> Envelope {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0.0, |d| d.as_secs_f64());
    let mut body = format!(
        r#"[{{"values":[{seq}],"dstypes":["derive"],"dsnames":["samples"],"time":{ts:.6},"interval":1,"host":"sgbridge","plugin":"generator","type":"counter","pad":""#
    )
    .into_bytes();
    let tail = br#""}]"#;
    let pad = size.saturating_sub(body.len() + tail.len());
    body.resize(body.len() + pad, b'x');
    body.extend_from_slice(tail);

    MessageBuilder::new()
        .durable(false)
        .message_id(format!("sgbridge-{seq}"))
        .body(Body::data(body))
        .encode()
        .into()
}
