use super::SpanExporter;
use crate::{errors::TracesError, span::FinishedSpan};
use std::sync::{Arc, Mutex};
use tokio::{
    runtime::Handle,
    sync::mpsc::{unbounded_channel, UnboundedSender},
    task::JoinHandle,
};
use tracing::{debug, warn};

/// Moves span export off the caller's task.
///
/// Spans go through an unbounded channel to a task that forwards them to the
/// wrapped exporter, so `emit` never waits on the backend.
pub struct BackgroundExporter {
    sender: Mutex<Option<UnboundedSender<FinishedSpan>>>,
}

impl BackgroundExporter {
    pub fn spawn(
        inner: Arc<dyn SpanExporter>,
    ) -> Result<(Arc<BackgroundExporter>, JoinHandle<()>), TracesError> {
        let handle = Handle::try_current().map_err(|err| {
            warn!(error = err.to_string(), "span export requires a tokio runtime");
            TracesError::MissingRuntime
        })?;

        let (sender, mut receiver) = unbounded_channel::<FinishedSpan>();

        let task = handle.spawn(async move {
            while let Some(span) = receiver.recv().await {
                inner.emit(span);
            }
            debug!("traces::background exporter drained");
        });

        Ok((
            Arc::new(BackgroundExporter {
                sender: Mutex::new(Some(sender)),
            }),
            task,
        ))
    }

    /// Stops accepting spans. Spans already queued are still exported.
    pub fn close(&self) {
        match self.sender.lock() {
            Ok(mut sender) => sender.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
    }
}

impl SpanExporter for BackgroundExporter {
    fn emit(&self, span: FinishedSpan) {
        let sender = match self.sender.lock() {
            Ok(sender) => sender,
            Err(poisoned) => poisoned.into_inner(),
        };

        let Some(sender) = sender.as_ref() else {
            warn!(span = span.name.as_ref(), "span exporter closed, dropping span");
            return;
        };

        if let Err(err) = sender.send(span) {
            warn!(error = err.to_string(), "failure to enqueue finished span");
        }
    }
}
