//! Extraction stage handler: one `VideoTask` in, ordered `FrameTask`s out.
//!
//! The video is decoded on a blocking thread which streams encoded samples
//! over a bounded channel. Each sample is digested, stored and published
//! before the next one is taken, so the channel bounds memory and publish
//! order equals frame order. The task succeeds only once every sample has
//! been published.

use crate::config::ExtractionSettings;
use crate::decoder::VideoDecoder;
use crate::extractor::{sampling_interval, EncodedFrame, ExtractError, FrameEncoder, FrameSampler, SampleStats};
use frame_pipeline::integrity::digest_file;
use frame_pipeline::{
    async_trait, BrokerError, FrameStore, FrameTask, PipelineError, TaskHandler, TaskProducer, VideoTask,
};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tempfile::NamedTempFile;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, instrument, warn};

/// A video available as a local file for the decoder
struct LocalVideo {
    path: PathBuf,
    /// Keeps a spilled copy alive until decoding is done
    _spill: Option<NamedTempFile>,
}

pub struct ExtractionHandler {
    store: Arc<dyn FrameStore>,
    decoder: Arc<dyn VideoDecoder>,
    producer: Mutex<TaskProducer<FrameTask>>,
    settings: ExtractionSettings,
}

impl ExtractionHandler {
    /// `producer` must already be started
    pub fn new(
        store: Arc<dyn FrameStore>,
        decoder: Arc<dyn VideoDecoder>,
        producer: TaskProducer<FrameTask>,
        settings: ExtractionSettings,
    ) -> Self {
        Self {
            store,
            decoder,
            producer: Mutex::new(producer),
            settings,
        }
    }

    /// Close the frame task producer
    pub async fn stop(&self) -> Result<(), BrokerError> {
        self.producer.lock().await.stop().await
    }

    async fn resolve(&self, task: &VideoTask) -> Result<LocalVideo, PipelineError> {
        if let Some(path) = self.store.local_path(&task.video_path) {
            return match tokio::fs::metadata(&path).await {
                Ok(metadata) if metadata.is_file() => Ok(LocalVideo { path, _spill: None }),
                Ok(_) => Err(PipelineError::MissingSource(task.video_path.clone())),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    Err(PipelineError::MissingSource(task.video_path.clone()))
                }
                Err(e) => Err(PipelineError::TransientStorage(format!(
                    "{}: {}",
                    task.video_path, e
                ))),
            };
        }

        // Remote stores: the decoder needs a file
        let bytes = self.store.read(&task.video_path).await?;
        let spill = tempfile::Builder::new()
            .prefix("video-")
            .tempfile()
            .map_err(|e| PipelineError::TransientStorage(format!("spill file: {}", e)))?;
        tokio::fs::write(spill.path(), &bytes)
            .await
            .map_err(|e| PipelineError::TransientStorage(format!("spill file: {}", e)))?;

        debug!(video_path = %task.video_path, size_bytes = bytes.len(), "Video spilled to local file");
        Ok(LocalVideo {
            path: spill.path().to_path_buf(),
            _spill: Some(spill),
        })
    }

    async fn publish_frame(
        &self,
        task: &VideoTask,
        video_hash: &str,
        frame: EncodedFrame,
    ) -> Result<(), PipelineError> {
        let frame_hash = self.store.digest(&frame.bytes);
        let frame_path = self
            .store
            .save_frame(&task.video_id, frame.index, &frame.bytes)
            .await?;

        let frame_task = FrameTask {
            video_id: task.video_id.clone(),
            frame_path,
            frame_index: frame.index,
            frame_hash,
            video_hash: video_hash.to_string(),
        };
        self.producer.lock().await.publish(&frame_task).await?;

        metrics::counter!("extraction.frames_published").increment(1);
        Ok(())
    }
}

#[async_trait]
impl TaskHandler<VideoTask> for ExtractionHandler {
    #[instrument(skip(self, task), fields(video_id = %task.video_id))]
    async fn handle(&self, task: &VideoTask) -> Result<(), PipelineError> {
        let started = Instant::now();
        info!(video_path = %task.video_path, "Processing video");

        let video = self.resolve(task).await?;
        let video_hash = digest_file(&video.path).await.map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                PipelineError::MissingSource(task.video_path.clone())
            } else {
                PipelineError::TransientStorage(format!("{}: {}", task.video_path, e))
            }
        })?;

        let (tx, mut rx) = mpsc::channel::<EncodedFrame>(self.settings.channel_capacity.max(1));
        let decoder = Arc::clone(&self.decoder);
        let path = video.path.clone();
        let period = self.settings.sample_period();
        let default_fps = self.settings.default_fps;
        let encoder = FrameEncoder::new(self.settings.jpeg_quality);

        let decoding = tokio::task::spawn_blocking(move || -> Result<SampleStats, ExtractError> {
            let mut source = decoder.open(&path)?;
            let interval = sampling_interval(source.fps(), period, default_fps);
            debug!(fps = ?source.fps(), interval = interval, "Sampling video");

            FrameSampler::new(interval, encoder).run(source.as_mut(), |frame| tx.blocking_send(frame).is_ok())
        });

        let mut published = 0u64;
        let mut failure = None;
        while let Some(frame) = rx.recv().await {
            let index = frame.index;
            if let Err(e) = self.publish_frame(task, &video_hash, frame).await {
                warn!(frame_index = index, error = %e, "Failed to emit frame task");
                failure = Some(e);
                break;
            }
            published += 1;
        }
        // Unblocks the decoder thread if we stopped early
        drop(rx);

        let outcome = decoding.await;
        if let Some(e) = failure {
            return Err(e);
        }

        let stats = match outcome {
            Ok(Ok(stats)) => stats,
            Ok(Err(e)) => {
                metrics::counter!("extraction.decode_failures").increment(1);
                return Err(PipelineError::UndecodableSource(format!(
                    "{} after {} published frames: {}",
                    task.video_path, published, e
                )));
            }
            Err(e) => {
                metrics::counter!("extraction.decode_failures").increment(1);
                return Err(PipelineError::UndecodableSource(format!(
                    "{}: decoder thread failed: {}",
                    task.video_path, e
                )));
            }
        };

        metrics::counter!("extraction.videos_processed").increment(1);
        metrics::histogram!("extraction.video_seconds").record(started.elapsed().as_secs_f64());
        info!(
            frames_decoded = stats.decoded,
            frames_published = published,
            video_hash = %video_hash,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Finished processing video"
        );

        Ok(())
    }

    async fn after_acknowledge(&self, task: &VideoTask) {
        match self.store.delete(&task.video_path).await {
            Ok(()) => info!(video_id = %task.video_id, video_path = %task.video_path, "Cleaned up source video"),
            Err(e) => warn!(
                video_id = %task.video_id,
                video_path = %task.video_path,
                error = %e,
                "Could not delete source video"
            ),
        }
    }
}
