use std::sync::Arc;

use backoff::retry::{Retry, RetryError};
use tracing::{error, warn};

use crate::buffer::Batch;
use crate::config::{LoadOptions, RetryBackoff};
use crate::error::{Error, Result};
use crate::loader::{LoadOutcome, Loader};

/// Bounded retry around a [Loader]. Every attempt resubmits the same batch, hence the same label,
/// so a load that committed but lost its response is answered with "Label Already Exists".
pub struct RetryController<L> {
    loader: Arc<L>,
    max_retries: usize,
    backoff: RetryBackoff,
}

impl<L> Clone for RetryController<L> {
    fn clone(&self) -> Self {
        Self {
            loader: Arc::clone(&self.loader),
            max_retries: self.max_retries,
            backoff: self.backoff.clone(),
        }
    }
}

impl<L> RetryController<L>
where
    L: Loader + Sync + 'static,
{
    pub fn new(loader: L, options: &LoadOptions) -> Self {
        Self {
            loader: Arc::new(loader),
            max_retries: options.max_retries(),
            backoff: options.retry_backoff().clone(),
        }
    }

    /// Runs at most `max_retries + 1` attempts. Fatal errors return right away, running out of
    /// retries yields [Error::RetryExhausted] wrapping the last transient error.
    pub async fn submit_with_retry(&self, batch: Arc<Batch>) -> Result<LoadOutcome> {
        let label = batch.label().to_string();
        let loader = Arc::clone(&self.loader);
        let operation = move |attempt: usize| {
            let loader = Arc::clone(&loader);
            let batch = Arc::clone(&batch);
            async move { loader.load(&batch, attempt).await }
        };
        let condition = |err: &Error| {
            let retryable = err.is_retryable();
            if retryable {
                warn!(%label, error = %err, "Stream load failed, retrying");
            }
            retryable
        };

        match Retry::new(self.backoff.schedule(self.max_retries), operation, condition).await {
            Ok(outcome) => Ok(outcome),
            Err(RetryError::Aborted { error, attempts }) => {
                error!(%label, attempts, %error, "Stream load failed with a non-retryable error");
                Err(error)
            }
            Err(RetryError::Exhausted { error, attempts }) => {
                error!(%label, attempts, %error, "Stream load retries exhausted");
                Err(Error::RetryExhausted {
                    attempts,
                    last: Box::new(error),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::*;
    use crate::buffer::BatchBuffer;
    use crate::error::FatalKind;
    use crate::loader::LoadResponse;

    /// Replays scripted results and records the attempts it saw.
    struct ScriptedLoader {
        script: Mutex<VecDeque<Result<LoadOutcome>>>,
        attempts: Mutex<Vec<(String, usize)>>,
    }

    impl ScriptedLoader {
        fn new(script: Vec<Result<LoadOutcome>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                attempts: Mutex::new(Vec::new()),
            }
        }
    }

    impl Loader for ScriptedLoader {
        async fn load(&self, batch: &Batch, attempt: usize) -> Result<LoadOutcome> {
            self.attempts
                .lock()
                .push((batch.label().to_string(), attempt));
            self.script
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(Error::TransientLoad("script exhausted".into())))
        }
    }

    fn options(max_retries: usize) -> LoadOptions {
        LoadOptions::builder()
            .max_retries(max_retries)
            .retry_backoff(RetryBackoff::Fixed(Duration::from_millis(10)))
            .build()
            .unwrap()
    }

    fn batch(options: &LoadOptions) -> Arc<Batch> {
        let mut buffer = BatchBuffer::new(options);
        buffer.append("a\n".to_string().into());
        Arc::new(buffer.snapshot_and_reset().unwrap())
    }

    fn loaded() -> Result<LoadOutcome> {
        Ok(LoadOutcome::Loaded(LoadResponse {
            status: "Success".into(),
            ..Default::default()
        }))
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_then_label_exists_is_success() {
        let options = options(3);
        let batch = batch(&options);
        let loader = ScriptedLoader::new(vec![
            Err(Error::TransientLoad("operation timed out".into())),
            Ok(LoadOutcome::AlreadyLoaded {
                label: batch.label().to_string(),
            }),
            loaded(),
        ]);
        let controller = RetryController::new(loader, &options);

        let outcome = controller
            .submit_with_retry(Arc::clone(&batch))
            .await
            .unwrap();
        assert!(matches!(outcome, LoadOutcome::AlreadyLoaded { .. }));

        // no third attempt, and both attempts used the same label
        let attempts = controller.loader.attempts.lock().clone();
        assert_eq!(
            attempts,
            vec![
                (batch.label().to_string(), 1),
                (batch.label().to_string(), 2)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn schema_mismatch_is_not_retried() {
        let options = options(3);
        let loader = ScriptedLoader::new(vec![
            Err(Error::fatal(FatalKind::SchemaMismatch, "unknown column")),
            loaded(),
        ]);
        let controller = RetryController::new(loader, &options);

        let err = controller
            .submit_with_retry(batch(&options))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::FatalLoad {
                kind: FatalKind::SchemaMismatch,
                ..
            }
        ));
        assert_eq!(controller.loader.attempts.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_after_max_retries_plus_one() {
        let options = options(2);
        let loader = ScriptedLoader::new(vec![]);
        let controller = RetryController::new(loader, &options);

        let err = controller
            .submit_with_retry(batch(&options))
            .await
            .unwrap_err();
        let Error::RetryExhausted { attempts, last } = err else {
            panic!("expected exhaustion, got {err:?}");
        };
        assert_eq!(attempts, 3);
        assert!(last.is_retryable());
        assert_eq!(controller.loader.attempts.lock().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_retries_means_single_attempt() {
        let options = options(0);
        let controller = RetryController::new(ScriptedLoader::new(vec![]), &options);
        let err = controller
            .submit_with_retry(batch(&options))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RetryExhausted { attempts: 1, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_then_success() {
        let options = options(3);
        let loader = ScriptedLoader::new(vec![
            Err(Error::TransientLoad("503".into())),
            Err(Error::TransientLoad("connection reset".into())),
            loaded(),
        ]);
        let controller = RetryController::new(loader, &options);
        let started = tokio::time::Instant::now();

        let outcome = controller.submit_with_retry(batch(&options)).await.unwrap();
        assert!(matches!(outcome, LoadOutcome::Loaded(_)));
        assert_eq!(controller.loader.attempts.lock().len(), 3);
        // two fixed delays of 10ms
        assert!(started.elapsed() >= Duration::from_millis(20));
    }
}
