/*!
MPS central node daemon.

Wires the evaluation engine to its worker threads: firmware update reader,
mitigation writer, power-class-change monitor, bypass expiration sweep,
heartbeat writer and history sender. Without hardware attached the
`--simulate` flag feeds synthetic nominal update packets at 360 Hz so the
full pipeline runs end to end.
*/

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use byteorder::{ByteOrder, LittleEndian};
use clap::Parser;
use log::{error, info, warn};

use mps_central_node::bypass::run_bypass_thread;
use mps_central_node::defs::{UPDATE_SEQUENCE_OFFSET, UPDATE_TIMESTAMP_OFFSET};
use mps_central_node::engine::Engine;
use mps_central_node::firmware::{
    run_mitigation_writer, run_pc_change_reader, run_update_reader, FirmwareIo, PowerClassMonitor,
    SimFirmware, UpdateReaderStats,
};
use mps_central_node::heartbeat::{NonBlockingHeartbeat, DEFAULT_WATCHDOG_TIMEOUT_US};
use mps_central_node::history::{History, DEFAULT_COLLECTOR};

#[derive(Parser, Debug)]
#[command(name = "mps-central-node", about = "MPS central node evaluation engine")]
struct Args {
    /// MPS database YAML file.
    database: PathBuf,

    /// History collector address (host:port).
    #[arg(long, default_value = DEFAULT_COLLECTOR)]
    history_collector: String,

    /// Disable the history UDP sender.
    #[arg(long)]
    no_history: bool,

    /// Feed synthetic nominal update packets at 360 Hz (no hardware).
    #[arg(long)]
    simulate: bool,

    /// Stop after this many evaluation cycles.
    #[arg(long)]
    cycles: Option<u64>,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let run = Arc::new(AtomicBool::new(true));
    {
        let run = Arc::clone(&run);
        if let Err(e) = ctrlc::set_handler(move || {
            info!("shutdown requested");
            run.store(false, Ordering::Relaxed);
        }) {
            warn!("failed to install SIGINT handler: {e}");
        }
    }

    let history = History::new();
    let mut history_thread = None;
    if args.no_history {
        history.set_enabled(false);
    } else {
        match history.start_sender(&args.history_collector, Arc::clone(&run)) {
            Ok(handle) => history_thread = Some(handle),
            Err(e) => {
                warn!(
                    "history sender unavailable ({}): {e}; continuing without audit channel",
                    args.history_collector
                );
                history.set_enabled(false);
            }
        }
    }

    let firmware = Arc::new(SimFirmware::new());
    let firmware_io: Arc<dyn FirmwareIo> = Arc::clone(&firmware) as Arc<dyn FirmwareIo>;

    let mut engine = Engine::new(Arc::clone(&firmware_io), history.clone(), Arc::clone(&run));
    if let Err(e) = engine.load_config(&args.database) {
        error!("failed to load configuration: {e}");
        return ExitCode::FAILURE;
    }
    engine.set_heartbeat(NonBlockingHeartbeat::new(
        Arc::clone(&firmware_io),
        DEFAULT_WATCHDOG_TIMEOUT_US,
        360,
    ));

    let reader_stats = Arc::new(UpdateReaderStats::default());
    let pc_monitor = Arc::new(PowerClassMonitor::new());
    let bypass = engine.bypass_manager();

    let mut workers = Vec::new();

    workers.push(spawn_named("fw-reader", {
        let fw = Arc::clone(&firmware_io);
        let queue = engine.update_queue();
        let run = Arc::clone(&run);
        let stats = Arc::clone(&reader_stats);
        move || run_update_reader(fw, queue, run, stats)
    }));

    workers.push(spawn_named("mit-writer", {
        let fw = Arc::clone(&firmware_io);
        let queue = engine.mitigation_queue();
        let run = Arc::clone(&run);
        move || run_mitigation_writer(fw, queue, run)
    }));

    workers.push(spawn_named("pc-change", {
        let fw = Arc::clone(&firmware_io);
        let monitor = Arc::clone(&pc_monitor);
        let run = Arc::clone(&run);
        move || run_pc_change_reader(fw, monitor, run)
    }));

    workers.push(spawn_named("bypass", {
        let bypass = Arc::clone(&bypass);
        let run = Arc::clone(&run);
        move || run_bypass_thread(bypass, run)
    }));

    if args.simulate {
        workers.push(spawn_named("simulator", {
            let fw = Arc::clone(&firmware);
            let run = Arc::clone(&run);
            let template = mps_central_node::packets::nominal_packet(engine.database());
            move || run_simulator(fw, run, template)
        }));
    }

    // The evaluation loop runs on the main thread until shutdown or the
    // requested cycle count.
    info!("central node running");
    match args.cycles {
        None => engine.run_evaluation_loop(),
        Some(limit) => {
            while run.load(Ordering::Relaxed) && engine.update_count() < limit {
                engine.run_cycle();
            }
            run.store(false, Ordering::Relaxed);
        }
    }
    run.store(false, Ordering::Relaxed);

    for worker in workers {
        let _ = worker.join();
    }
    if let Some(handle) = history_thread {
        let _ = handle.join();
    }

    println!("{}", engine.stats_report());
    println!("{}", engine.database().show_beam_destinations());
    println!("{}", bypass.lock().unwrap().queue_report());
    println!("{}", pc_monitor.counters().report());
    println!(
        "history: sent={} dropped={}",
        history.sent(),
        history.dropped()
    );
    ExitCode::SUCCESS
}

fn spawn_named(
    name: &str,
    body: impl FnOnce() + Send + 'static,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(body)
        .unwrap_or_else(|e| panic!("failed to spawn {name} thread: {e}"))
}

/// Push a nominal update packet every 360 Hz period with a live timestamp,
/// standing in for the hardware stream.
fn run_simulator(fw: Arc<SimFirmware>, run: Arc<AtomicBool>, template: Vec<u8>) {
    info!("update simulator started");
    let period = Duration::from_nanos(1_000_000_000 / 360);
    let mut sequence = 0u32;
    while run.load(Ordering::Relaxed) {
        let mut packet = template.clone();
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        LittleEndian::write_u64(
            &mut packet[UPDATE_TIMESTAMP_OFFSET..UPDATE_TIMESTAMP_OFFSET + 8],
            now,
        );
        LittleEndian::write_u32(
            &mut packet[UPDATE_SEQUENCE_OFFSET..UPDATE_SEQUENCE_OFFSET + 4],
            sequence,
        );
        sequence = sequence.wrapping_add(1);
        fw.push_update(packet);
        std::thread::sleep(period);
    }
    info!("update simulator stopped");
}
