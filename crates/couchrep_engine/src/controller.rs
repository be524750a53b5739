//! Replication controller.
//!
//! A controller owns one replication. All state lives in a single actor
//! task; the public [`ReplicationController`] handle sends it commands and
//! reads snapshots it publishes. Request completions are funneled back into
//! the same task, so reconciliation never runs concurrently.

use crate::config::ControllerConfig;
use crate::database::LocalDatabase;
use crate::error::{ReplicationError, ReplicationResult};
use crate::reconcile::{Reconciler, TaskObservation};
use crate::state::{ReplicationMode, ReplicationState};
use crate::tracker::{RequestId, RequestPurpose, RequestTracker, TrackedRequest};
use crate::transport::{RequestEngine, RestRequest, RestResponse};
use couchrep_protocol::{
    error_reason, parse_active_tasks, start_body, stop_body, ActiveTask, JsonObject,
    OAuthCredentials, ReplicationConfig, StartResponse, ACTIVE_TASKS_PATH, REPLICATE_PATH,
};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

/// Outcome of [`ReplicationController::start`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// The server accepted the replication.
    Started {
        /// Server identity of the task.
        task_id: String,
    },
    /// A replication was already running or starting; nothing was sent.
    AlreadyRunning,
}

enum Command {
    Start(oneshot::Sender<ReplicationResult<StartOutcome>>),
    Stop(oneshot::Sender<ReplicationResult<()>>),
    Deliver(Vec<ActiveTask>, oneshot::Sender<()>),
}

enum CompletionKind {
    Start,
    Stop,
    Poll { sequence: u64 },
}

struct Completion {
    id: RequestId,
    generation: u64,
    kind: CompletionKind,
    outcome: ReplicationResult<RestResponse>,
}

struct ConfigSlot {
    config: ReplicationConfig,
    locked: bool,
    /// Start commands sent but not yet handled by the actor.
    pending_starts: usize,
}

struct Shared {
    database: Arc<dyn LocalDatabase>,
    config: RwLock<ConfigSlot>,
    state: RwLock<ReplicationState>,
    requests: RwLock<Vec<TrackedRequest>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<ReplicationState>>>,
}

/// Handle to a replication between a local database and a remote URL.
///
/// Cloning the handle shares the same replication. The controller task
/// shuts down, cancelling outstanding requests, once every handle is
/// dropped.
#[derive(Clone)]
pub struct ReplicationController {
    shared: Arc<Shared>,
    commands: mpsc::Sender<Command>,
}

impl ReplicationController {
    /// Creates a controller and spawns its task on the current Tokio runtime.
    pub fn new<E: RequestEngine>(
        database: Arc<dyn LocalDatabase>,
        config: ReplicationConfig,
        engine: E,
        settings: ControllerConfig,
    ) -> ReplicationResult<Self> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| ReplicationError::InvalidState(format!("no Tokio runtime: {e}")))?;

        let shared = Arc::new(Shared {
            database,
            config: RwLock::new(ConfigSlot {
                config,
                locked: false,
                pending_starts: 0,
            }),
            state: RwLock::new(ReplicationState::default()),
            requests: RwLock::new(Vec::new()),
            subscribers: Mutex::new(Vec::new()),
        });

        let (commands, mailbox) = mpsc::channel(settings.command_buffer.max(1));
        let (completions_tx, completions) = mpsc::unbounded_channel();
        let actor = Actor {
            shared: Arc::clone(&shared),
            engine: Arc::new(engine),
            reconciler: Reconciler::new(false, settings.appearance_grace_polls),
            settings,
            mailbox,
            completions_tx,
            completions,
            tracker: RequestTracker::new(),
            state: ReplicationState::default(),
            generation: 0,
            run_config: None,
            local_id: String::new(),
            pending_start: None,
            pending_stops: HashMap::new(),
            sequence: 0,
            poll_failures: 0,
            next_poll: None,
        };
        runtime.spawn(actor.run());

        Ok(Self { shared, commands })
    }

    /// Starts the replication.
    ///
    /// Resolves once the server accepts or rejects the start request.
    /// Configuration errors are reported without contacting the server.
    pub async fn start(&self) -> ReplicationResult<StartOutcome> {
        let permit = self
            .commands
            .reserve()
            .await
            .map_err(|_| ReplicationError::ControllerClosed)?;
        {
            // Parameters freeze here, not when the actor gets to the command.
            let mut slot = self.shared.config.write();
            if !slot.locked {
                slot.config.validate()?;
            }
            slot.pending_starts += 1;
        }
        let (reply, response) = oneshot::channel();
        permit.send(Command::Start(reply));
        response.await.map_err(|_| ReplicationError::ControllerClosed)?
    }

    /// Stops the replication.
    ///
    /// The observable state switches to `Stopped` immediately; the returned
    /// future resolves once the server acknowledges the cancellation. Does
    /// nothing if the replication is not running.
    pub async fn stop(&self) -> ReplicationResult<()> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Stop(reply)).await?;
        response.await.map_err(|_| ReplicationError::ControllerClosed)?
    }

    /// Feeds a task list obtained elsewhere through reconciliation.
    pub async fn deliver_tasks(&self, tasks: Vec<ActiveTask>) -> ReplicationResult<()> {
        let (ack, applied) = oneshot::channel();
        self.send(Command::Deliver(tasks, ack)).await?;
        applied.await.map_err(|_| ReplicationError::ControllerClosed)
    }

    async fn send(&self, command: Command) -> ReplicationResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ReplicationError::ControllerClosed)
    }

    /// Subscribes to state changes.
    ///
    /// Every change is delivered as one complete snapshot, in order.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ReplicationState> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.subscribers.lock().push(tx);
        rx
    }

    /// Returns a snapshot of the current state.
    pub fn state(&self) -> ReplicationState {
        self.shared.state.read().clone()
    }

    /// Returns the current mode.
    pub fn mode(&self) -> ReplicationMode {
        self.shared.state.read().mode
    }

    /// Returns true while the replication runs.
    pub fn is_running(&self) -> bool {
        self.shared.state.read().running
    }

    /// Returns true if the last stop was requested by the caller.
    pub fn was_manually_stopped(&self) -> bool {
        self.shared.state.read().manually_stopped
    }

    /// Returns the last status line reported by the server.
    pub fn status_text(&self) -> String {
        self.shared.state.read().status_text.clone()
    }

    /// Returns the number of changes processed.
    pub fn completed(&self) -> u64 {
        self.shared.state.read().completed
    }

    /// Returns the number of changes known to exist.
    pub fn total(&self) -> u64 {
        self.shared.state.read().total
    }

    /// Returns the most recent error.
    pub fn last_error(&self) -> Option<ReplicationError> {
        self.shared.state.read().last_error.clone()
    }

    /// Returns the server identity of the task.
    pub fn remote_task_id(&self) -> Option<String> {
        self.shared.state.read().remote_task_id.clone()
    }

    /// Returns a snapshot of the requests currently in flight.
    pub fn current_requests(&self) -> Vec<TrackedRequest> {
        self.shared.requests.read().clone()
    }

    /// Returns the local database.
    pub fn local_database(&self) -> Arc<dyn LocalDatabase> {
        Arc::clone(&self.shared.database)
    }

    /// Returns the remote database URL.
    pub fn remote_url(&self) -> String {
        self.shared.config.read().config.remote_url().to_string()
    }

    /// Returns true for a pull replication.
    pub fn is_pull(&self) -> bool {
        self.shared.config.read().config.is_pull()
    }

    /// Returns true for a continuous replication.
    pub fn is_continuous(&self) -> bool {
        self.shared.config.read().config.is_continuous()
    }

    /// Returns a copy of the configuration.
    pub fn config(&self) -> ReplicationConfig {
        self.shared.config.read().config.clone()
    }

    /// Sets whether the target database should be created.
    pub fn set_create_target(&self, create: bool) -> ReplicationResult<()> {
        self.update_config(|c| c.create_target = create)
    }

    /// Sets the filter function, as `"designdoc/filtername"`.
    pub fn set_filter(&self, filter: Option<String>) -> ReplicationResult<()> {
        self.update_config(|c| c.filter = filter)
    }

    /// Sets the filter parameters.
    pub fn set_filter_params(&self, params: Option<JsonObject>) -> ReplicationResult<()> {
        self.update_config(|c| c.filter_params = params)
    }

    /// Replaces the extra HTTP headers.
    pub fn set_headers(&self, headers: BTreeMap<String, String>) -> ReplicationResult<()> {
        self.update_config(|c| c.headers = headers)
    }

    /// Sets the OAuth credentials for the remote endpoint.
    pub fn set_credentials(&self, credentials: Option<OAuthCredentials>) -> ReplicationResult<()> {
        self.update_config(|c| c.credentials = credentials)
    }

    /// Replaces the extra replicator options.
    pub fn set_extra_options(&self, options: JsonObject) -> ReplicationResult<()> {
        self.update_config(|c| c.extra_options = options)
    }

    fn update_config(&self, update: impl FnOnce(&mut ReplicationConfig)) -> ReplicationResult<()> {
        let mut slot = self.shared.config.write();
        if slot.locked || slot.pending_starts > 0 {
            return Err(ReplicationError::InvalidState(
                "replication parameters cannot change while it is running".into(),
            ));
        }
        update(&mut slot.config);
        Ok(())
    }
}

struct Actor<E: RequestEngine> {
    shared: Arc<Shared>,
    engine: Arc<E>,
    settings: ControllerConfig,
    mailbox: mpsc::Receiver<Command>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions: mpsc::UnboundedReceiver<Completion>,
    tracker: RequestTracker<AbortHandle>,
    state: ReplicationState,
    /// Bumped on every start, stop and termination; replies from older
    /// generations are ignored.
    generation: u64,
    /// Configuration copied at start.
    run_config: Option<ReplicationConfig>,
    local_id: String,
    reconciler: Reconciler,
    pending_start: Option<(RequestId, oneshot::Sender<ReplicationResult<StartOutcome>>)>,
    pending_stops: HashMap<RequestId, oneshot::Sender<ReplicationResult<()>>>,
    /// Observation sequence, shared by polls and delivered snapshots.
    sequence: u64,
    poll_failures: u32,
    next_poll: Option<Instant>,
}

impl<E: RequestEngine> Actor<E> {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.mailbox.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(completion) = self.completions.recv() => self.handle_completion(completion),
                _ = wait_until(self.next_poll) => self.poll(),
            }
        }

        let abandoned = self.tracker.cancel_all();
        self.publish_requests();
        if let Some((_, reply)) = self.pending_start.take() {
            let _ = reply.send(Err(ReplicationError::Cancelled));
        }
        for (_, reply) in self.pending_stops.drain() {
            let _ = reply.send(Err(ReplicationError::Cancelled));
        }
        debug!(abandoned = abandoned.len(), "replication controller shut down");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start(reply) => self.start(reply),
            Command::Stop(reply) => self.stop(reply),
            Command::Deliver(tasks, ack) => {
                self.deliver(&tasks);
                let _ = ack.send(());
            }
        }
    }

    fn start(&mut self, reply: oneshot::Sender<ReplicationResult<StartOutcome>>) {
        let config = {
            let mut slot = self.shared.config.write();
            slot.pending_starts = slot.pending_starts.saturating_sub(1);
            if self.state.running || self.pending_start.is_some() {
                debug!("start ignored, replication already running");
                let _ = reply.send(Ok(StartOutcome::AlreadyRunning));
                return;
            }
            if let Err(e) = slot.config.validate() {
                let _ = reply.send(Err(e.into()));
                return;
            }
            slot.locked = true;
            slot.config.clone()
        };

        self.generation += 1;
        self.local_id = self.shared.database.identifier();
        self.reconciler = Reconciler::new(
            config.is_continuous(),
            self.settings.appearance_grace_polls,
        );
        self.poll_failures = 0;
        self.next_poll = None;
        self.publish(ReplicationState::default());

        info!(
            remote = config.remote_url(),
            local = %self.local_id,
            pull = config.is_pull(),
            continuous = config.is_continuous(),
            generation = self.generation,
            "starting replication"
        );
        let request = RestRequest::post(REPLICATE_PATH, start_body(&config, &self.local_id))
            .with_headers(&config.headers);
        self.run_config = Some(config);
        let id = self.submit(request, RequestPurpose::Start, CompletionKind::Start);
        self.pending_start = Some((id, reply));
    }

    fn stop(&mut self, reply: oneshot::Sender<ReplicationResult<()>>) {
        if !self.state.running && self.pending_start.is_none() {
            debug!("stop ignored, replication not running");
            let _ = reply.send(Ok(()));
            return;
        }

        let abandoned = self.abandon_run();
        if let Some((_, start_reply)) = self.pending_start.take() {
            let _ = start_reply.send(Err(ReplicationError::Cancelled));
        }
        self.generation += 1;
        self.next_poll = None;
        self.publish(self.state.clone().into_stopped(true));
        self.unlock_config();

        info!(
            task_id = ?self.state.remote_task_id,
            abandoned,
            "stopping replication"
        );
        let request = match &self.run_config {
            Some(config) => RestRequest::post(REPLICATE_PATH, stop_body(config, &self.local_id))
                .with_headers(&config.headers),
            None => {
                let _ = reply.send(Ok(()));
                return;
            }
        };
        let id = self.submit(request, RequestPurpose::Stop, CompletionKind::Stop);
        self.pending_stops.insert(id, reply);
    }

    fn deliver(&mut self, tasks: &[ActiveTask]) {
        if !self.state.running {
            return;
        }
        self.sequence += 1;
        let observation = match &self.state.remote_task_id {
            Some(task_id) => TaskObservation::from_tasks(tasks, task_id),
            None => TaskObservation::Malformed,
        };
        self.apply(self.sequence, observation);
    }

    fn poll(&mut self) {
        self.next_poll = None;
        if !self.state.running || self.tracker.has_purpose(RequestPurpose::StatusPoll) {
            return;
        }
        self.sequence += 1;
        let sequence = self.sequence;
        let mut request = RestRequest::get(ACTIVE_TASKS_PATH);
        if let Some(config) = &self.run_config {
            request = request.with_headers(&config.headers);
        }
        self.submit(request, RequestPurpose::StatusPoll, CompletionKind::Poll { sequence });
    }

    fn submit(
        &mut self,
        request: RestRequest,
        purpose: RequestPurpose,
        kind: CompletionKind,
    ) -> RequestId {
        let engine = Arc::clone(&self.engine);
        let done = self.completions_tx.clone();
        let generation = self.generation;
        let one_shot = !self
            .run_config
            .as_ref()
            .is_some_and(ReplicationConfig::is_continuous);
        let timeout = match purpose {
            RequestPurpose::Start if one_shot => self.settings.one_shot_start_timeout,
            _ => Some(self.settings.request_timeout),
        };

        let id = self.tracker.track_with(purpose, generation, move |id| {
            tokio::spawn(async move {
                let outcome = match timeout {
                    Some(limit) => tokio::time::timeout(limit, engine.submit(request))
                        .await
                        .unwrap_or_else(|_| Err(ReplicationError::Timeout)),
                    None => engine.submit(request).await,
                };
                let _ = done.send(Completion {
                    id,
                    generation,
                    kind,
                    outcome,
                });
            })
            .abort_handle()
        });
        self.publish_requests();
        id
    }

    fn handle_completion(&mut self, completion: Completion) {
        let Completion {
            id,
            generation,
            kind,
            outcome,
        } = completion;

        if !self.tracker.untrack(id) {
            debug!(request = %id, "discarding reply of cancelled request");
            return;
        }
        self.publish_requests();

        match kind {
            CompletionKind::Start => self.on_start_reply(id, generation, outcome),
            CompletionKind::Stop => self.on_stop_reply(id, generation, outcome),
            CompletionKind::Poll { sequence } => self.on_poll_reply(generation, sequence, outcome),
        }
    }

    fn on_start_reply(
        &mut self,
        id: RequestId,
        generation: u64,
        outcome: ReplicationResult<RestResponse>,
    ) {
        let reply = match self.pending_start.take() {
            Some((pending, reply)) if pending == id && generation == self.generation => reply,
            other => {
                self.pending_start = other;
                return;
            }
        };

        let result = outcome.and_then(|response| {
            if response.is_success() {
                Ok(StartResponse::parse(&response.body)?)
            } else {
                Err(ReplicationError::ServerRejected {
                    status: response.status,
                    reason: error_reason(&response.body),
                })
            }
        });

        match result {
            Ok(StartResponse { task_id }) => {
                info!(%task_id, generation, "replication started");
                self.publish(ReplicationState::started(task_id.clone(), None));
                self.next_poll = Some(Instant::now());
                let _ = reply.send(Ok(StartOutcome::Started { task_id }));
            }
            Err(error) => {
                warn!(%error, "replication failed to start");
                self.unlock_config();
                self.publish(ReplicationState {
                    last_error: Some(error.clone()),
                    ..ReplicationState::default()
                });
                let _ = reply.send(Err(error));
            }
        }
    }

    fn on_stop_reply(
        &mut self,
        id: RequestId,
        generation: u64,
        outcome: ReplicationResult<RestResponse>,
    ) {
        // 404 means the server no longer runs it, which is what we asked for.
        let result = outcome.and_then(|response| {
            if response.is_success() || response.status == 404 {
                Ok(())
            } else {
                Err(ReplicationError::ServerRejected {
                    status: response.status,
                    reason: error_reason(&response.body),
                })
            }
        });

        match &result {
            Ok(()) => info!(generation, "replication stop acknowledged"),
            Err(error) => {
                warn!(%error, "replication stop failed");
                if generation == self.generation {
                    self.publish(ReplicationState {
                        last_error: Some(error.clone()),
                        ..self.state.clone()
                    });
                }
            }
        }
        if let Some(reply) = self.pending_stops.remove(&id) {
            let _ = reply.send(result);
        }
    }

    fn on_poll_reply(
        &mut self,
        generation: u64,
        sequence: u64,
        outcome: ReplicationResult<RestResponse>,
    ) {
        if generation != self.generation {
            debug!(sequence, generation, "discarding poll from an earlier run");
            return;
        }

        let observation = match outcome {
            Ok(response) if response.is_success() => match parse_active_tasks(&response.body) {
                Ok(tasks) => match &self.state.remote_task_id {
                    Some(task_id) => TaskObservation::from_tasks(&tasks, task_id),
                    None => TaskObservation::Malformed,
                },
                Err(error) => {
                    debug!(%error, "unreadable task list");
                    TaskObservation::Malformed
                }
            },
            Ok(response) => TaskObservation::FetchFailed(ReplicationError::Transport {
                message: format!(
                    "GET {ACTIVE_TASKS_PATH} returned {}: {}",
                    response.status,
                    error_reason(&response.body)
                ),
                retryable: response.status >= 500,
            }),
            Err(error) => TaskObservation::FetchFailed(error),
        };

        if let TaskObservation::FetchFailed(error) = &observation {
            self.poll_failures += 1;
            debug!(%error, failures = self.poll_failures, "status poll failed");
        } else {
            self.poll_failures = 0;
        }

        self.apply(sequence, observation);
        if self.state.running {
            self.next_poll = Some(Instant::now() + self.settings.next_poll_delay(self.poll_failures));
        }
    }

    fn apply(&mut self, sequence: u64, observation: TaskObservation) {
        let next = self.reconciler.reduce(
            &self.state,
            sequence,
            observation,
            self.state.manually_stopped,
        );
        let ended = self.state.running && !next.running;
        self.publish(next);

        if ended {
            match &self.state.last_error {
                Some(error) => warn!(
                    %error,
                    seen = self.reconciler.has_seen_task(),
                    "replication ended unexpectedly"
                ),
                None => info!(task_id = ?self.state.remote_task_id, "replication finished"),
            }
            self.abandon_run();
            self.generation += 1;
            self.next_poll = None;
            self.unlock_config();
        }
    }

    fn publish(&mut self, next: ReplicationState) {
        if next == self.state {
            return;
        }
        debug!(
            mode = %next.mode,
            completed = next.completed,
            total = next.total,
            "replication state changed"
        );
        self.state = next;
        *self.shared.state.write() = self.state.clone();
        let snapshot = &self.state;
        self.shared
            .subscribers
            .lock()
            .retain(|subscriber| subscriber.send(snapshot.clone()).is_ok());
    }

    /// Cancels the start and poll requests of the current run. Stop
    /// requests stay in flight so their callers get an answer.
    fn abandon_run(&mut self) -> usize {
        let abandoned = self.tracker.cancel_where(RequestPurpose::Start).len()
            + self.tracker.cancel_where(RequestPurpose::StatusPoll).len();
        self.publish_requests();
        abandoned
    }

    fn publish_requests(&self) {
        *self.shared.requests.write() = self.tracker.all();
    }

    fn unlock_config(&self) {
        self.shared.config.write().locked = false;
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
