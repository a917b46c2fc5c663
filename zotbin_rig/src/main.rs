// THEORY:
// `zotbin_rig` is the bench tool for the sensing core. It is what a technician
// runs next to a bin: calibrate the load cell interactively, read or stream
// weight as JSON lines, replay a recorded drop through the detector, or run the
// whole pipeline on the live camera (or a recording) with stdin lines standing
// in for the drop trigger. Each
// subcommand is a thin shell over `zotbin_sense`; all the behavior lives in the
// library.

mod args;
mod sink;

use anyhow::{Context, Result};
use args::Command;
use serde_json::json;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use zotbin_sense::core_modules::background::BackgroundModel;
use zotbin_sense::core_modules::camera::{BoxedCamera, ReplayCamera};
use zotbin_sense::core_modules::capture::{self, CaptureOutcome};
use zotbin_sense::core_modules::clock::{ManualClock, MonotonicClock};
#[cfg(feature = "live-camera")]
use zotbin_sense::core_modules::device_camera::DeviceCamera;
use zotbin_sense::core_modules::gpio::BoxedBackend;
use zotbin_sense::core_modules::hx711::Hx711;
use zotbin_sense::core_modules::presence::PresenceDetector;
use zotbin_sense::core_modules::scale::{READ_SETTLE, WeightSensor};
use zotbin_sense::pipeline::{BinRecord, SensePipeline, VisionWorker};
use zotbin_sense::{SenseConfig, SenseError};

type Sensor = WeightSensor<Hx711<BoxedBackend>>;

fn main() -> Result<()> {
    let cli = match args::parse(std::env::args().skip(1)) {
        Ok(cli) => cli,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(2);
        }
    };

    env_logger::Builder::from_default_env()
        .filter_level(cli.log_level)
        .format_timestamp_millis()
        .init();

    let config = SenseConfig::load_or_default(cli.config.as_deref()).context("loading config")?;
    log::debug!("config: {config:?}");

    match cli.command {
        Command::Calibrate { known_grams } => calibrate(&config, known_grams),
        Command::Read { samples, raw } => read_once(&config, samples, raw),
        Command::Stream { hz, samples, raw } => stream(&config, hz, samples, raw),
        Command::Replay { frames, out } => replay(&config, &frames, &out),
        Command::Run { frames, out } => tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("starting tokio runtime")?
            .block_on(run(config, frames, out)),
    }
}

fn open_sensor(config: &SenseConfig) -> Result<Sensor> {
    let backend = config.adc.open_backend().context("opening gpio backend")?;
    let adc = Hx711::new(backend, config.adc.hx711_config()).context("initializing HX711")?;
    Ok(WeightSensor::new(
        adc,
        config.calibration_store(),
        config.sampling.outliers,
    ))
}

fn prompt(message: &str) -> Result<String> {
    print!("{message}");
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

fn wait_stable(ws: &mut Sensor, config: &SenseConfig) -> Result<()> {
    let s = &config.sampling;
    let stats = ws.wait_for_stability(
        s.stability_window_samples,
        s.stability_span_raw,
        s.settle(),
        s.stability_timeout(),
    )?;
    log::info!("stable: mean={:.1} span={:.1}", stats.mean, stats.span());
    Ok(())
}

fn calibrate(config: &SenseConfig, known_grams: Option<f64>) -> Result<()> {
    let mut ws = open_sensor(config)?;
    let s = &config.sampling;

    ws.warmup(s.warmup_attempts, s.settle()).context("HX711 warmup")?;

    prompt("Remove all weight. Press Enter to tare...")?;
    wait_stable(&mut ws, config)?;
    ws.tare(s.tare_samples.max(s.stability_window_samples))?;
    println!(
        "Tare complete. offset={:.2} cal_file={}",
        ws.calibration().offset,
        ws.store().path().display()
    );

    let known = match known_grams {
        Some(grams) => grams,
        None => prompt("Place a known weight (grams). Enter grams: ")?
            .parse::<f64>()
            .context("known weight must be a number")?,
    };
    prompt(&format!("Place {known}g on the platform. Press Enter to continue..."))?;
    wait_stable(&mut ws, config)?;
    ws.calibrate_with_known_weight(known, s.calibration_samples, s.min_delta_raw)?;
    println!(
        "Calibration complete. scale={:.6} raw/g updated_at={}",
        ws.calibration().scale,
        ws.calibration().updated_at
    );

    prompt("Remove weight. Press Enter to do a quick check...")?;
    wait_stable(&mut ws, config)?;
    let empty = ws.read_grams(s.tare_samples)?;
    println!("Empty reading: {empty:.2} g");
    Ok(())
}

fn read_once(config: &SenseConfig, samples: Option<usize>, raw: bool) -> Result<()> {
    let mut ws = open_sensor(config)?;
    let samples = samples.unwrap_or(config.sampling.read_samples);
    if raw {
        println!("{:.1}", ws.read_raw_avg(samples, READ_SETTLE)?);
    } else {
        println!("{:.2}", ws.read_grams(samples)?);
    }
    Ok(())
}

fn now_secs() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

/// `Some(status)` for faults a stream reports and keeps going on.
fn stream_status(err: &SenseError) -> Option<&'static str> {
    match err {
        SenseError::NotReady { .. } | SenseError::ReadError(_) | SenseError::InsufficientSamples { .. } => {
            Some("not_ready")
        }
        SenseError::Calibration(_) => Some("not_calibrated"),
        _ => None,
    }
}

fn stream(config: &SenseConfig, hz: f64, samples: Option<usize>, raw: bool) -> Result<()> {
    let mut ws = open_sensor(config)?;
    let samples = samples.unwrap_or(config.sampling.read_samples);
    let period = Duration::from_secs_f64(1.0 / hz);
    let bin_id = &config.bin_id;

    let cal = *ws.calibration();
    println!(
        "{}",
        json!({
            "status": "boot",
            "bin_id": bin_id,
            "dt": config.adc.dout_pin,
            "sck": config.adc.sck_pin,
            "gain": u32::from(config.adc.gain),
            "samples": samples,
            "hz": hz,
            "calibration_file": ws.store().path().display().to_string(),
            "offset": cal.offset,
            "scale": cal.scale,
            "cal_updated_at": cal.updated_at,
            "ts": now_secs(),
        })
    );

    let mut next = Instant::now();
    loop {
        let ts = now_secs();
        let reading = if raw {
            ws.read_raw_avg(samples, READ_SETTLE).map(|v| ("raw", v))
        } else {
            ws.read_grams(samples).map(|v| ("weight_grams", v))
        };
        let line = match reading {
            Ok((key, value)) => json!({ "status": "ok", "bin_id": bin_id, "ts": ts, key: value }),
            Err(err) => match stream_status(&err) {
                Some(status) => json!({ "status": status, "bin_id": bin_id, "ts": ts, "error": err.to_string() }),
                None => return Err(err).context("weight stream stopped"),
            },
        };
        println!("{line}");

        next += period;
        let now = Instant::now();
        if next <= now {
            next = now + period;
        }
        std::thread::sleep(next - now);
    }
}

fn replay(config: &SenseConfig, frames: &Path, out: &Path) -> Result<()> {
    let clock = ManualClock::new();
    let mut camera = ReplayCamera::open(frames, config.vision.frame_interval())?.simulated(clock.clone());
    let background =
        BackgroundModel::capture_reference(&mut camera, config.vision.kernel()?, config.vision.process_width)?;
    let detector = PresenceDetector::new(background, config.vision.detection_params());

    let outcome = capture::capture_transit(&mut camera, &detector, &clock, &config.vision.capture_params())?;
    match outcome {
        CaptureOutcome::Detected(result) => {
            let path = sink::save_frame(out, &result.selected.image)?;
            println!(
                "{}",
                json!({
                    "status": "detected",
                    "image": path.display().to_string(),
                    "enter_s": result.enter_time.as_secs_f64(),
                    "exit_s": result.exit_time.as_secs_f64(),
                    "selected_s": result.selected.timestamp.as_secs_f64(),
                    "ended_by": result.ended_by,
                    "frames_in_transit": result.frames_in_transit,
                })
            );
        }
        CaptureOutcome::NoDetection => println!("{}", json!({ "status": "no_detection" })),
    }
    Ok(())
}

fn report(record: &BinRecord, out: &Path) -> Result<()> {
    let path = sink::save_frame(out, &record.detection.selected.image)?;
    println!(
        "{}",
        json!({
            "sequence": record.trigger.sequence,
            "triggered_at": record.trigger.at,
            "image": path.display().to_string(),
            "enter_s": record.detection.enter_time.as_secs_f64(),
            "exit_s": record.detection.exit_time.as_secs_f64(),
            "ended_by": record.detection.ended_by,
            "weight": record.weight,
        })
    );
    Ok(())
}

#[cfg(feature = "live-camera")]
fn open_device(config: &SenseConfig) -> Result<BoxedCamera> {
    let c = &config.vision.camera;
    let camera = DeviceCamera::open(c.device, c.width, c.height, c.warmup_frames)
        .with_context(|| format!("opening /dev/video{}", c.device))?;
    Ok(Box::new(camera))
}

#[cfg(not(feature = "live-camera"))]
fn open_device(_config: &SenseConfig) -> Result<BoxedCamera> {
    anyhow::bail!("built without the live-camera feature; pass a <frames dir> to run from a recording")
}

fn open_camera(config: &SenseConfig, frames: Option<&Path>) -> Result<BoxedCamera> {
    match frames {
        Some(dir) => Ok(Box::new(ReplayCamera::open(dir, config.vision.frame_interval())?)),
        None => open_device(config),
    }
}

async fn run(config: SenseConfig, frames: Option<PathBuf>, out: PathBuf) -> Result<()> {
    use tokio::io::AsyncBufReadExt;

    let mut camera = open_camera(&config, frames.as_deref())?;
    let background =
        BackgroundModel::capture_reference(&mut camera, config.vision.kernel()?, config.vision.process_width)?;
    let vision = VisionWorker {
        camera,
        detector: PresenceDetector::new(background, config.vision.detection_params()),
        clock: MonotonicClock::new(),
        params: config.vision.capture_params(),
    };
    let sensor = open_sensor(&config)?;
    let mut pipeline = SensePipeline::start(vision, sensor, config.sampling.read_samples);
    log::info!("pipeline running; press Enter to trigger, Ctrl-D to stop");

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(_) => {
                    let sequence = pipeline.trigger().await?;
                    log::info!("trigger #{sequence} queued");
                }
                None => break,
            },
            record = pipeline.next_record() => match record {
                Some(record) => report(&record, &out)?,
                None => break,
            },
        }
    }

    for record in pipeline.shutdown().await? {
        report(&record, &out)?;
    }
    Ok(())
}
