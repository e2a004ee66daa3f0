use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    control::protocol::{Reply, Request, StatusReport},
    daemon::{
        classify::Classifier,
        collection::Observation,
        config::TrackerConfig,
        storage::{entities::SpanAnnotation, Store},
    },
    error::TrackerError,
};

use super::session::SessionMachine;

#[derive(Debug)]
pub enum EngineMessage {
    Observe(Observation),
    Control {
        request: Request,
        reply: oneshot::Sender<Result<Reply, TrackerError>>,
    },
    Classified {
        span_id: Uuid,
        annotation: SpanAnnotation,
    },
    /// Seal, end, flush, then stop consuming the queue.
    Shutdown,
}

/// Single writer of tracking state. Owns the [SessionMachine] and republishes a [StatusReport]
/// after every message.
pub struct Engine<S> {
    machine: SessionMachine<S>,
    receiver: mpsc::Receiver<EngineMessage>,
    feedback: mpsc::WeakSender<EngineMessage>,
    status: watch::Sender<Arc<StatusReport>>,
    config: watch::Receiver<Arc<TrackerConfig>>,
    classifier: Arc<dyn Classifier>,
    classifications: TaskTracker,
}

impl<S: Store> Engine<S> {
    /// `sender` is the sending half of `receiver`; the engine keeps a weak handle to it so
    /// classifier results can be queued behind everything else.
    pub fn new(
        machine: SessionMachine<S>,
        receiver: mpsc::Receiver<EngineMessage>,
        sender: &mpsc::Sender<EngineMessage>,
        config: watch::Receiver<Arc<TrackerConfig>>,
        classifier: Arc<dyn Classifier>,
    ) -> (Self, watch::Receiver<Arc<StatusReport>>) {
        let (status, status_receiver) = watch::channel(Arc::new(machine.status()));
        let engine = Self {
            machine,
            receiver,
            feedback: sender.downgrade(),
            status,
            config,
            classifier,
            classifications: TaskTracker::new(),
        };
        (engine, status_receiver)
    }

    fn publish(&self) {
        self.status.send_replace(Arc::new(self.machine.status()));
    }

    fn refresh_config(&mut self) {
        if !self.config.has_changed().unwrap_or(false) {
            return;
        }
        let config = self.config.borrow_and_update().clone();
        self.classifier.reconfigure(&config);
        self.machine.set_config(config);
        info!("Engine picked up new configuration");
    }

    async fn handle(&mut self, request: Request) -> Result<Reply, TrackerError> {
        debug!("Handling {request:?}");
        let machine = &mut self.machine;
        match request {
            Request::Status => Ok(Reply::Status(machine.status())),
            Request::Start { project } => machine.start(project).await.map(Reply::Session),
            Request::Stop => machine.stop().await.map(Reply::Session),
            Request::Pause => machine.pause().await.map(Reply::Session),
            Request::Resume => machine.resume().await.map(Reply::Session),
            Request::WorkOn { work_item_id } => machine
                .work_on(&work_item_id)
                .await
                .map(|v| Reply::WorkItem { work_item: Some(v) }),
            Request::WorkOff => machine
                .work_off()
                .await
                .map(|work_item| Reply::WorkItem { work_item }),
            Request::SessionStart { id, project } => machine
                .start_session(&id, project)
                .await
                .map(Reply::Session),
            Request::SessionEnd { id, reason } => {
                machine.end_session(&id, reason).await.map(Reply::Session)
            }
            Request::SessionLink {
                id,
                issue_id,
                system,
                relationship,
            } => machine
                .link(&id, issue_id, system, relationship)
                .await
                .map(Reply::Link),
            Request::SessionOutcome {
                id,
                kind,
                reference,
                description,
            } => machine
                .record_outcome(&id, kind, reference, description)
                .await
                .map(|(outcome, created)| Reply::Outcome { outcome, created }),
        }
    }

    /// Hands freshly sealed spans to the classifier. Results come back through the queue, so a
    /// slow classifier never holds up ticks.
    fn dispatch_classification(&mut self) {
        let spans = self.machine.take_sealed();
        if spans.is_empty() {
            return;
        }
        let Some(sender) = self.feedback.upgrade() else {
            return;
        };
        let timeout = self.machine.config().classify_timeout();

        for span in spans {
            let classifier = self.classifier.clone();
            let sender = sender.clone();
            self.classifications.spawn(async move {
                let classification =
                    match tokio::time::timeout(timeout, classifier.classify(&span)).await {
                        Ok(Ok(classification)) => classification,
                        Ok(Err(e)) => {
                            warn!(span_id = %span.id, "Classifier failed {e:?}");
                            None
                        }
                        Err(_) => {
                            warn!(span_id = %span.id, "Classifier timed out after {timeout:?}");
                            None
                        }
                    };
                let Some(classification) = classification else {
                    return;
                };
                let annotation = SpanAnnotation {
                    category: Some(classification.category),
                    // An explicitly chosen work item wins over a guessed one.
                    work_item_id: classification
                        .work_item_id
                        .filter(|_| span.work_item_id.is_none()),
                };
                let message = EngineMessage::Classified {
                    span_id: span.id,
                    annotation,
                };
                if sender.send(message).await.is_err() {
                    debug!("Engine stopped before the classification of {} arrived", span.id);
                }
            });
        }
    }

    pub async fn run(mut self) -> Result<()> {
        while let Some(message) = self.receiver.recv().await {
            self.refresh_config();
            match message {
                EngineMessage::Observe(observation) => self.machine.observe(observation).await,
                EngineMessage::Control { request, reply } => {
                    let result = self.handle(request).await;
                    self.dispatch_classification();
                    // Publish first so a client that reads status right after the reply sees
                    // its own write.
                    self.publish();
                    if reply.send(result).is_err() {
                        debug!("Control client went away before the reply");
                    }
                    continue;
                }
                EngineMessage::Classified {
                    span_id,
                    annotation,
                } => self.machine.annotate(span_id, annotation).await,
                EngineMessage::Shutdown => break,
            }
            self.dispatch_classification();
            self.publish();
        }

        info!("Engine is shutting down");
        self.receiver.close();
        self.machine.shutdown().await;
        self.publish();
        self.classifications.close();
        Ok(())
    }
}
