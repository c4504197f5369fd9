//! Background loading off the caller's thread.
//!
//! A load runs on Tokio's blocking pool. The caller keeps a [`LoadHandle`]
//! to cancel or await it, and hands finished pairs to the render side
//! through a [`StereoSlot`].

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::config::ScanConfig;
use crate::decoder::DecodeBudget;
use crate::error::{ConfigError, PipelineError, Result};
use crate::pipeline::{ContainerPipeline, PipelineStage, StageTracker, StereoPair};
use crate::source::ByteSource;

/// Starts loading `source` in the background.
///
/// Must be called from within a Tokio runtime. The config is validated
/// up front so a bad signature list fails here rather than in the task.
pub fn spawn_load<S>(
    source: S,
    budget: DecodeBudget,
    config: &ScanConfig,
) -> std::result::Result<LoadHandle, ConfigError>
where
    S: ByteSource + 'static,
{
    let cancel = CancelToken::new();
    let tracker = StageTracker::new();
    let pipeline = ContainerPipeline::from_config(config)?
        .with_cancel(cancel.clone())
        .with_tracker(tracker.clone());

    debug!("Spawning load of {}", source.name());
    let join = tokio::task::spawn_blocking(move || pipeline.run(&source, budget));

    Ok(LoadHandle {
        cancel,
        tracker,
        join: Some(join),
    })
}

/// Handle to a background load.
///
/// Dropping the handle without awaiting it cancels the load.
#[derive(Debug)]
pub struct LoadHandle {
    cancel: CancelToken,
    tracker: StageTracker,
    join: Option<JoinHandle<Result<StereoPair>>>,
}

impl LoadHandle {
    /// Requests cancellation. The load stops at its next checkpoint.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// A token that cancels this load, for use from other threads.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn stage(&self) -> PipelineStage {
        self.tracker.get()
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Waits for the load to finish.
    ///
    /// A cancelled load never yields images, even if decoding completed
    /// before the cancellation was seen.
    pub async fn wait(mut self) -> Result<StereoPair> {
        let Some(join) = self.join.take() else {
            return Err(PipelineError::Cancelled {
                stage: self.tracker.get(),
            });
        };

        let result = match join.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => {
                warn!("Load task did not complete: {e}");
                return Err(PipelineError::Cancelled {
                    stage: self.tracker.get(),
                });
            }
        };

        // Failures already name their stage; only a finished pair is
        // withheld here.
        match result {
            Ok(pair) if self.cancel.is_cancelled() => {
                debug!("Discarding {} after cancellation", pair.display_name);
                Err(PipelineError::Cancelled {
                    stage: PipelineStage::Decoding,
                })
            }
            other => other,
        }
    }
}

impl Drop for LoadHandle {
    fn drop(&mut self) {
        if self.join.is_some() {
            self.cancel.cancel();
        }
    }
}

/// Single-entry handoff between the loader and whoever displays the pair.
#[derive(Debug, Default)]
pub struct StereoSlot {
    current: Mutex<Option<StereoPair>>,
}

impl StereoSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `pair`, returning whatever it replaced.
    pub fn publish(&self, pair: StereoPair) -> Option<StereoPair> {
        self.current.lock().replace(pair)
    }

    pub fn take(&self) -> Option<StereoPair> {
        self.current.lock().take()
    }

    pub fn is_empty(&self) -> bool {
        self.current.lock().is_none()
    }

    /// Runs `f` against the current pair while holding the lock.
    pub fn with_current<R>(&self, f: impl FnOnce(&StereoPair) -> R) -> Option<R> {
        self.current.lock().as_ref().map(f)
    }
}
