use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use clap::Parser;

use ul_engine::{BlockSet, Engine, EngineConfig, IqMode, StreamFormat, MAX_RECEIVERS};

#[derive(Parser, Debug)]
#[command(name = "uberlink")]
#[command(about = "Multi-receiver UberSDR WebSocket IQ client")]
struct Cli {
    /// Server hostname or IP
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Server port (admission and WebSocket)
    #[arg(short = 'p', long, default_value = "8080")]
    port: u16,

    /// Receiver frequency in Hz; repeat for multiple receivers (max 8)
    #[arg(short = 'f', long = "frequency", required = true)]
    frequencies: Vec<u64>,

    /// IQ mode: iq48, iq96, iq192, or iq384
    #[arg(short = 'm', long, default_value = "iq192")]
    mode: String,

    /// Stream format: pcm-zstd or opus
    #[arg(long, default_value = "pcm-zstd")]
    format: String,

    /// Server password
    #[arg(long)]
    password: Option<String>,

    /// Software frequency offset in Hz applied to every receiver
    #[arg(long, default_value = "0")]
    offset: i32,

    /// Swap I and Q at ingest (sideband orientation)
    #[arg(long)]
    swap_iq: bool,

    /// Record the first 10 seconds of each receiver to <frequency>.wav
    #[arg(long)]
    debug_rec: bool,

    /// Print a status line every second
    #[arg(long)]
    stats: bool,

    /// Run duration in seconds (0 = until interrupted)
    #[arg(short = 'd', long, default_value = "0")]
    duration: u64,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if cli.frequencies.len() > MAX_RECEIVERS {
        eprintln!(
            "error: {} frequencies given, at most {} receivers supported",
            cli.frequencies.len(),
            MAX_RECEIVERS
        );
        std::process::exit(1);
    }

    let mode: IqMode = match cli.mode.parse() {
        Ok(mode) => mode,
        Err(e) => {
            eprintln!("error: {}", e);
            std::process::exit(1);
        }
    };
    let format: StreamFormat = match cli.format.parse() {
        Ok(format) => format,
        Err(e) => {
            eprintln!("error: {}", e);
            std::process::exit(1);
        }
    };

    let config = EngineConfig {
        host: cli.host.clone(),
        port: cli.port,
        password: cli.password.clone(),
        format,
        frequency_offset_hz: cli.offset,
        swap_iq: cli.swap_iq,
        debug_rec: cli.debug_rec,
        ..EngineConfig::default()
    };

    log::info!(
        "uberlink starting: {}:{} mode {} format {}",
        cli.host,
        cli.port,
        mode,
        format
    );

    let mut engine = match Engine::new(config) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("error: {}", e);
            std::process::exit(1);
        }
    };

    // Per-receiver RMS of the latest block, for the stats line.
    let levels: Arc<Mutex<[f32; MAX_RECEIVERS]>> = Arc::new(Mutex::new([0.0; MAX_RECEIVERS]));
    {
        let levels = levels.clone();
        engine.install_callback(move |set: &BlockSet| {
            let mut levels = levels.lock().unwrap();
            for rx in 0..MAX_RECEIVERS {
                if !set.is_active(rx) {
                    continue;
                }
                let block = set.block(rx);
                let power: f32 = block.iter().map(|s| s.norm_sqr()).sum();
                levels[rx] = (power / block.len() as f32).sqrt();
            }
        });
    }

    for (rx, &frequency) in cli.frequencies.iter().enumerate() {
        if let Err(e) = engine.start_receiver(rx, frequency, mode) {
            eprintln!("error: receiver {}: {}", rx, e);
            std::process::exit(1);
        }
        eprintln!("receiver {} started at {} Hz ({})", rx, frequency, mode);
    }

    // Ctrl-C flips the flag; the loop below notices and shuts down.
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        eprintln!("\ninterrupted, stopping...");
        r.store(false, Ordering::SeqCst);
    })
    .expect("failed to set Ctrl-C handler");

    let start = Instant::now();
    let mut last_stats = Instant::now();
    while running.load(Ordering::SeqCst) {
        if cli.duration > 0 && start.elapsed().as_secs() >= cli.duration {
            break;
        }
        std::thread::sleep(Duration::from_millis(100));

        if cli.stats && last_stats.elapsed().as_secs() >= 1 {
            print_stats(&engine, &levels, start.elapsed().as_secs_f64());
            last_stats = Instant::now();
        }
    }

    engine.shutdown();
}

fn print_stats(engine: &Engine, levels: &Arc<Mutex<[f32; MAX_RECEIVERS]>>, elapsed: f64) {
    let status = engine.read_status();
    let levels = levels.lock().unwrap();
    for rx in status.receivers.iter().filter(|r| r.active) {
        eprintln!(
            "[{:.1}s] rx{} {} {} Hz: fill {:.0}% over/under {}/{} peak {:.3}/{:.3} rms {:.4} {:.1} KiB/s",
            elapsed,
            rx.id,
            rx.state,
            rx.frequency,
            rx.ring_fill * 100.0,
            rx.ring_overruns,
            rx.ring_underruns,
            rx.peak_i,
            rx.peak_q,
            levels[rx.id],
            rx.throughput_kbps,
        );
    }
    eprintln!(
        "[{:.1}s] callbacks: {} samples: {} ({} Hz, block {})",
        elapsed, status.total_callbacks, status.total_samples, status.sample_rate, status.block_size,
    );
}
