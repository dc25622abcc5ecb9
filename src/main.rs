use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use clap::{Parser, Subcommand};
use log::{error, info, warn};

use trackside::config::CaptureConfig;
use trackside::export::{self, ExportPipeline, SqliteBackend};
use trackside::logfile::{self, LogWriter};
use trackside::telemetry::{
    LapEngine, ReplayFixSource, SensorCell, SensorProducer, SyntheticSensor, TelemetryAggregator,
};
use trackside::{Session, Track, TracksideError};

/// Replay rate for recorded fix files.
const REPLAY_HZ: f64 = 10.0;
const IMPORT_COMMIT_EVERY: usize = 100;
const PRODUCER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(name = "trackside", version, about = "Vehicle telemetry capture and export")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture a session: fixes fan in with sensor data, points land in
    /// the append log and the database
    Record {
        /// Capture configuration file
        #[arg(short, long)]
        config: PathBuf,
        /// JSON-lines file of position fixes to replay
        #[arg(short, long)]
        fixes: PathBuf,
        /// Mark the session as live data
        #[arg(long)]
        live: bool,
    },
    /// Rebuild a session from an append log and export it to a database
    Import {
        /// Directory holding the log segments
        #[arg(short, long)]
        dir: PathBuf,
        #[arg(short, long, default_value = "telemetry")]
        prefix: String,
        /// Track definition file, used to redo lap detection
        #[arg(short, long)]
        track: PathBuf,
        #[arg(long)]
        database: PathBuf,
        #[arg(long, default_value = "unknown")]
        car: String,
    },
    /// Summarize the contents of an append log
    Inspect {
        #[arg(short, long)]
        dir: PathBuf,
        #[arg(short, long, default_value = "telemetry")]
        prefix: String,
    },
}

fn main() {
    colog::init();
    let cli = Cli::parse();

    let stop = Arc::new(AtomicBool::new(false));
    let handler_stop = stop.clone();
    ctrlc::set_handler(move || {
        info!("stop requested");
        handler_stop.store(true, Ordering::Relaxed);
    })
    .expect("could not install signal handler");

    let result = match cli.command {
        Commands::Record {
            config,
            fixes,
            live,
        } => record(&config, &fixes, live, stop),
        Commands::Import {
            dir,
            prefix,
            track,
            database,
            car,
        } => import(&dir, &prefix, &track, &database, &car, stop),
        Commands::Inspect { dir, prefix } => inspect(&dir, &prefix),
    };
    if let Err(e) = result {
        error!("{}", e);
        std::process::exit(1);
    }
}

fn record(
    config_path: &Path,
    fixes: &Path,
    live: bool,
    stop: Arc<AtomicBool>,
) -> Result<(), TracksideError> {
    let config = CaptureConfig::from_file(config_path)?;
    let track = Track::from_file(&config.track_file)?;

    let (queues, receivers) = export::queues();
    let mut pipeline = ExportPipeline::new(
        SqliteBackend::new(&config.database),
        receivers,
        config.commit_every,
    );
    let pipeline_stop = stop.clone();
    let exporter = thread::spawn(move || pipeline.run(&pipeline_stop));

    let mut cells = Vec::new();
    let mut producers = Vec::new();
    for sensor in config.resolve_sensors()? {
        let cell = SensorCell::new();
        producers.push(SensorProducer::spawn_cell(
            &sensor.name,
            sensor.hz,
            SyntheticSensor::new(sensor.fields),
            cell.clone(),
        ));
        cells.push(cell);
    }
    let (fix_tx, fix_rx) = crossbeam_channel::unbounded();
    let source = ReplayFixSource::from_file(fixes)?;
    producers.push(SensorProducer::spawn_fix("gps", REPLAY_HZ, source, fix_tx));

    let log = LogWriter::create(&config.log_dir, &config.log_prefix)?;
    let mut aggregator = TelemetryAggregator::new(
        Session::new(&config.car, live),
        track,
        cells,
        Some(log),
        queues,
        LapEngine::new(config.proximity_m, config.min_lap_points),
    );
    aggregator.run(fix_rx, &stop)?;

    for producer in producers {
        let name = producer.name().to_string();
        if let Err(e) = producer.join(Some(PRODUCER_JOIN_TIMEOUT)) {
            warn!("producer {} did not stop cleanly: {}", name, e);
        }
    }

    let session = aggregator.session();
    let complete = session.laps.iter().filter(|l| l.duration_ns.is_some()).count();
    let points: usize = session.laps.iter().map(|l| l.points.len()).sum();
    info!(
        "capture finished: {} points, {} laps ({} complete)",
        points,
        session.laps.len(),
        complete
    );

    // let the exporter work off its backlog, then join it
    stop.store(true, Ordering::Relaxed);
    let _ = exporter.join();
    Ok(())
}

fn import(
    dir: &Path,
    prefix: &str,
    track_path: &Path,
    database: &Path,
    car: &str,
    stop: Arc<AtomicBool>,
) -> Result<(), TracksideError> {
    let track = Track::from_file(track_path)?;
    let points = logfile::read_points(dir, prefix)?;
    info!("replaying {} points from {}", points.len(), dir.display());

    let (queues, receivers) = export::queues();
    let mut pipeline = ExportPipeline::new(
        SqliteBackend::new(database),
        receivers,
        IMPORT_COMMIT_EVERY,
    );
    let pipeline_stop = stop.clone();
    let exporter = thread::spawn(move || pipeline.run(&pipeline_stop));

    // no sensor cells and no log writer: the points already carry their
    // sensor values and rewriting the log would duplicate it
    let mut aggregator = TelemetryAggregator::new(
        Session::new(car, false),
        track,
        Vec::new(),
        None,
        queues,
        LapEngine::default(),
    );
    for point in points {
        if stop.load(Ordering::Relaxed) {
            warn!("import interrupted");
            break;
        }
        aggregator.process_point(point)?;
    }
    let laps = aggregator.session().laps.len();
    drop(aggregator);

    stop.store(true, Ordering::Relaxed);
    let _ = exporter.join();
    info!("import finished: {} laps", laps);
    Ok(())
}

fn inspect(dir: &Path, prefix: &str) -> Result<(), TracksideError> {
    let points = logfile::read_points(dir, prefix)?;
    let Some(first) = points.first() else {
        println!("no points recorded under {}", dir.display());
        return Ok(());
    };
    let last = points.last().unwrap_or(first);
    let span_s = last.timestamp_ns.saturating_sub(first.timestamp_ns) as f64 * 1e-9;
    let max_speed = points.iter().map(|p| p.speed).fold(0.0, f64::max);

    println!("segments:  {}", logfile::discover(dir, prefix)?.len());
    println!("points:    {}", points.len());
    println!("span:      {:.1}s", span_s);
    println!("max speed: {:.1} m/s", max_speed);
    println!(
        "start:     {:.6}, {:.6} @ {}",
        first.lat, first.lon, first.timestamp_ns
    );
    Ok(())
}
