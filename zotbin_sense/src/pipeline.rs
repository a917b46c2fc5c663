// THEORY:
// The `pipeline` module is the top-level API of the sensing core. It wires the
// two independent workers together with bounded channels and hands the caller
// one `BinRecord` per detected transit.
//
// Key architectural principles:
// 1.  **Ownership by worker**: the camera, the background model and the
//     presence detector live inside the vision worker; the ADC driver and the
//     calibration live inside the weight actor. Nothing else touches them, so
//     there are no locks around hardware.
// 2.  **Blocking work off the reactor**: a capture window and an averaged ADC
//     read both block for a long time. Each worker runs on its own
//     `spawn_blocking` thread and talks to the async side through
//     `blocking_recv` / `blocking_send`.
// 3.  **Request/response for weight**: the weight actor takes commands with a
//     `oneshot` reply, so the assembler, a CLI, or a test can all ask it for a
//     reading or a tare through the same cloneable `WeightHandle`.
// 4.  **Backpressure**: every queue is bounded. A burst of triggers waits at
//     the trigger queue instead of piling up frames in memory.
// 5.  **Negatives are quiet**: a window with no transit produces no record; a
//     failed weight read still produces a record, carrying its error code.

use crate::core_modules::calibration::Calibration;
use crate::core_modules::camera::Camera;
use crate::core_modules::capture::{self, CaptureOutcome, CaptureParams, DetectionResult};
use crate::core_modules::clock::Clock;
use crate::core_modules::presence::PresenceDetector;
use crate::core_modules::sampler::RawSampleSource;
use crate::core_modules::scale::WeightSensor;
use crate::error::{Result, SenseError, WeightErrorCode};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

pub const TRIGGER_QUEUE_DEPTH: usize = 10;
pub const VISION_QUEUE_DEPTH: usize = 5;
pub const RECORD_QUEUE_DEPTH: usize = 100;
pub const WEIGHT_QUEUE_DEPTH: usize = 10;

/// An opaque "something was dropped in" event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Trigger {
    pub sequence: u64,
    pub at: DateTime<Utc>,
}

impl Trigger {
    pub fn new(sequence: u64) -> Self {
        Self {
            sequence,
            at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisionCommand {
    Capture(Trigger),
    RecaptureBackground,
}

#[derive(Debug)]
pub struct VisionEvent {
    pub trigger: Trigger,
    pub outcome: Result<CaptureOutcome>,
}

/// The weight half of a record, as a publisher would see it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WeightReading {
    Ok { grams: f64 },
    Error { code: WeightErrorCode, message: String },
}

impl From<Result<f64>> for WeightReading {
    fn from(result: Result<f64>) -> Self {
        match result {
            Ok(grams) => WeightReading::Ok { grams },
            Err(err) => WeightReading::Error {
                code: err.code(),
                message: err.to_string(),
            },
        }
    }
}

impl WeightReading {
    pub fn grams(&self) -> Option<f64> {
        match self {
            WeightReading::Ok { grams } => Some(*grams),
            WeightReading::Error { .. } => None,
        }
    }
}

/// One detected transit with the weight read right after it.
#[derive(Debug, Clone)]
pub struct BinRecord {
    pub trigger: Trigger,
    pub detection: DetectionResult,
    pub weight: WeightReading,
}

pub enum WeightCommand {
    ReadGrams {
        samples: usize,
        reply: oneshot::Sender<Result<f64>>,
    },
    Tare {
        samples: usize,
        reply: oneshot::Sender<Result<()>>,
    },
    Calibrate {
        known_grams: f64,
        samples: usize,
        min_delta_raw: f64,
        reply: oneshot::Sender<Result<()>>,
    },
    Calibration {
        reply: oneshot::Sender<Calibration>,
    },
    Shutdown,
}

/// Cloneable front door to the weight actor.
#[derive(Clone)]
pub struct WeightHandle {
    commands: mpsc::Sender<WeightCommand>,
}

impl WeightHandle {
    /// Moves `sensor` onto a blocking thread and serves commands until every
    /// handle is dropped or `Shutdown` arrives.
    pub fn spawn<S>(mut sensor: WeightSensor<S>) -> (Self, JoinHandle<()>)
    where
        S: RawSampleSource + Send + 'static,
    {
        let (commands, mut rx) = mpsc::channel::<WeightCommand>(WEIGHT_QUEUE_DEPTH);
        let worker = tokio::task::spawn_blocking(move || {
            while let Some(command) = rx.blocking_recv() {
                match command {
                    WeightCommand::ReadGrams { samples, reply } => {
                        let _ = reply.send(sensor.read_grams(samples));
                    }
                    WeightCommand::Tare { samples, reply } => {
                        let _ = reply.send(sensor.tare(samples));
                    }
                    WeightCommand::Calibrate {
                        known_grams,
                        samples,
                        min_delta_raw,
                        reply,
                    } => {
                        let _ = reply.send(sensor.calibrate_with_known_weight(known_grams, samples, min_delta_raw));
                    }
                    WeightCommand::Calibration { reply } => {
                        let _ = reply.send(*sensor.calibration());
                    }
                    WeightCommand::Shutdown => break,
                }
            }
            debug!("weight actor stopped");
        });
        (Self { commands }, worker)
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> WeightCommand) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| SenseError::Worker("weight actor is gone".into()))?;
        response
            .await
            .map_err(|_| SenseError::Worker("weight actor dropped the request".into()))
    }

    pub async fn read_grams(&self, samples: usize) -> Result<f64> {
        self.request(|reply| WeightCommand::ReadGrams { samples, reply }).await?
    }

    pub async fn tare(&self, samples: usize) -> Result<()> {
        self.request(|reply| WeightCommand::Tare { samples, reply }).await?
    }

    pub async fn calibrate(&self, known_grams: f64, samples: usize, min_delta_raw: f64) -> Result<()> {
        self.request(|reply| WeightCommand::Calibrate {
            known_grams,
            samples,
            min_delta_raw,
            reply,
        })
        .await?
    }

    pub async fn calibration(&self) -> Result<Calibration> {
        self.request(|reply| WeightCommand::Calibration { reply }).await
    }

    pub async fn shutdown(&self) {
        let _ = self.commands.send(WeightCommand::Shutdown).await;
    }
}

/// Everything the vision worker owns.
pub struct VisionWorker<C, K> {
    pub camera: C,
    pub detector: PresenceDetector,
    pub clock: K,
    pub params: CaptureParams,
}

impl<C, K> VisionWorker<C, K>
where
    C: Camera + Send + 'static,
    K: Clock + Send + 'static,
{
    pub fn spawn(
        mut self,
        mut commands: mpsc::Receiver<VisionCommand>,
        events: mpsc::Sender<VisionEvent>,
    ) -> JoinHandle<()> {
        tokio::task::spawn_blocking(move || {
            while let Some(command) = commands.blocking_recv() {
                match command {
                    VisionCommand::Capture(trigger) => {
                        info!("trigger #{}: watching for {:?}", trigger.sequence, self.params.window);
                        let outcome = capture::capture_transit(&mut self.camera, &self.detector, &self.clock, &self.params);
                        if events.blocking_send(VisionEvent { trigger, outcome }).is_err() {
                            break;
                        }
                    }
                    VisionCommand::RecaptureBackground => {
                        if let Err(err) = self.detector.recapture_background(&mut self.camera) {
                            warn!("background recapture failed, keeping the old reference: {err}");
                        }
                    }
                }
            }
            self.camera.close();
            debug!("vision worker stopped");
        })
    }
}

/// The running sensing core.
pub struct SensePipeline {
    commands: mpsc::Sender<VisionCommand>,
    records: mpsc::Receiver<BinRecord>,
    weight: WeightHandle,
    workers: Vec<JoinHandle<()>>,
    next_sequence: u64,
}

impl SensePipeline {
    pub fn start<C, K, S>(vision: VisionWorker<C, K>, sensor: WeightSensor<S>, read_samples: usize) -> Self
    where
        C: Camera + Send + 'static,
        K: Clock + Send + 'static,
        S: RawSampleSource + Send + 'static,
    {
        let (commands, command_rx) = mpsc::channel(TRIGGER_QUEUE_DEPTH);
        let (event_tx, event_rx) = mpsc::channel(VISION_QUEUE_DEPTH);
        let (record_tx, records) = mpsc::channel(RECORD_QUEUE_DEPTH);

        let (weight, weight_worker) = WeightHandle::spawn(sensor);
        let vision_worker = vision.spawn(command_rx, event_tx);
        let assembler = tokio::spawn(assemble(event_rx, weight.clone(), read_samples, record_tx));

        Self {
            commands,
            records,
            weight,
            workers: vec![vision_worker, assembler, weight_worker],
            next_sequence: 1,
        }
    }

    /// Queues a detection window and returns its sequence number.
    pub async fn trigger(&mut self) -> Result<u64> {
        let trigger = Trigger::new(self.next_sequence);
        self.commands
            .send(VisionCommand::Capture(trigger))
            .await
            .map_err(|_| SenseError::Worker("vision worker is gone".into()))?;
        self.next_sequence += 1;
        Ok(trigger.sequence)
    }

    pub async fn recapture_background(&self) -> Result<()> {
        self.commands
            .send(VisionCommand::RecaptureBackground)
            .await
            .map_err(|_| SenseError::Worker("vision worker is gone".into()))
    }

    pub async fn next_record(&mut self) -> Option<BinRecord> {
        self.records.recv().await
    }

    pub fn weight(&self) -> &WeightHandle {
        &self.weight
    }

    /// Stops accepting triggers, lets queued windows finish, and returns the
    /// records nobody collected yet.
    pub async fn shutdown(self) -> Result<Vec<BinRecord>> {
        let Self {
            commands,
            mut records,
            weight,
            workers,
            ..
        } = self;
        drop(commands);

        let mut leftover = Vec::new();
        while let Some(record) = records.recv().await {
            leftover.push(record);
        }
        weight.shutdown().await;
        drop(weight);

        for joined in futures::future::join_all(workers).await {
            joined.map_err(|e| SenseError::Worker(format!("worker panicked: {e}")))?;
        }
        info!("pipeline stopped with {} uncollected records", leftover.len());
        Ok(leftover)
    }
}

async fn assemble(
    mut events: mpsc::Receiver<VisionEvent>,
    weight: WeightHandle,
    read_samples: usize,
    records: mpsc::Sender<BinRecord>,
) {
    while let Some(VisionEvent { trigger, outcome }) = events.recv().await {
        let detection = match outcome {
            Ok(CaptureOutcome::Detected(detection)) => detection,
            Ok(CaptureOutcome::NoDetection) => {
                info!("trigger #{}: no object detected", trigger.sequence);
                continue;
            }
            Err(err) => {
                warn!("trigger #{}: capture failed: {err}", trigger.sequence);
                continue;
            }
        };

        let weight = WeightReading::from(weight.read_grams(read_samples).await);
        match &weight {
            WeightReading::Ok { grams } => info!("trigger #{}: {grams:.2} g", trigger.sequence),
            WeightReading::Error { code, message } => {
                warn!("trigger #{}: weight unavailable ({code:?}): {message}", trigger.sequence)
            }
        }

        let record = BinRecord {
            trigger,
            detection,
            weight,
        };
        if records.send(record).await.is_err() {
            break;
        }
    }
    debug!("record assembler stopped");
}
