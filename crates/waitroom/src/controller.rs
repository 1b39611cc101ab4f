//! Admission controller: the public handle over the state machine.
//!
//! A single driver task owns the [`AdmissionMachine`]. The handle sends it
//! commands; spawned join, re-join and poll tasks send it completions. The
//! driver applies each one, performs the resulting effects and publishes the
//! new [`AdmissionView`] on a watch channel.
//!
//! Lifecycle:
//! - Dropping the handle is an unmount: everything stops, the persisted
//!   record is kept so a later controller can resume.
//! - [`AdmissionController::exit`] is an abandonment: everything stops and the
//!   record is cleared.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::AdmissionService;
use crate::config::AdmissionConfig;
use crate::identity::ClientIdentity;
use crate::machine::{AdmissionMachine, AdmissionView, Effect, Event, Failure, Progress};
use crate::poller::{PollerHandle, StatusPoller};
use crate::store::{PersistedRecord, ResumeStore};

type TerminalCallback = Box<dyn FnOnce() + Send + 'static>;

enum Command {
    Start,
    Retry,
    Exit,
    OnTerminal(TerminalCallback),
}

/// Drives one client through admission.
///
/// Must be created inside a tokio runtime.
pub struct AdmissionController {
    identity: ClientIdentity,
    commands: mpsc::UnboundedSender<Command>,
    view: watch::Receiver<AdmissionView>,
    shutdown: CancellationToken,
}

impl AdmissionController {
    pub fn new(
        identity: ClientIdentity,
        service: Arc<dyn AdmissionService>,
        store: Arc<dyn ResumeStore>,
        config: AdmissionConfig,
    ) -> Self {
        let machine = AdmissionMachine::new(config.policy());
        let (view_tx, view) = watch::channel(machine.view());
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let driver = Driver {
            machine,
            identity: identity.clone(),
            service,
            store,
            poller: StatusPoller::new(config.poll_interval),
            config,
            active_poller: None,
            calls: shutdown.child_token(),
            events_tx,
            view_tx,
            shutdown: shutdown.clone(),
            callbacks: Vec::new(),
        };
        tokio::spawn(driver.run(commands_rx, events_rx));

        Self {
            identity,
            commands,
            view,
            shutdown,
        }
    }

    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    /// Begin admission. Calling it again while admission is underway has no effect.
    pub fn start(&self) {
        self.send(Command::Start);
    }

    /// Leave `Error` and try again. Ignored in any other state.
    pub fn retry(&self) {
        self.send(Command::Retry);
    }

    /// Abandon admission and forget the persisted record.
    pub fn exit(&self) {
        self.send(Command::Exit);
    }

    /// Run `callback` once on hand-off. Fires immediately if hand-off already happened.
    pub fn on_terminal<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.send(Command::OnTerminal(Box::new(callback)));
    }

    pub fn view(&self) -> AdmissionView {
        self.view.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<AdmissionView> {
        self.view.clone()
    }

    /// Wait until the client is handed off or has exited.
    pub async fn wait_terminal(&self) -> AdmissionView {
        let mut view = self.view.clone();
        let finished = match view.wait_for(|v| v.terminal || v.closed).await {
            Ok(v) => v.clone(),
            Err(_) => self.view(),
        };
        finished
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!(identity = %self.identity, "Admission driver gone, command dropped");
        }
    }
}

impl Drop for AdmissionController {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct Driver {
    machine: AdmissionMachine,
    identity: ClientIdentity,
    service: Arc<dyn AdmissionService>,
    store: Arc<dyn ResumeStore>,
    config: AdmissionConfig,
    poller: StatusPoller,
    active_poller: Option<PollerHandle>,
    /// Parent of every spawned join and re-join task.
    calls: CancellationToken,
    events_tx: mpsc::UnboundedSender<Event>,
    view_tx: watch::Sender<AdmissionView>,
    shutdown: CancellationToken,
    callbacks: Vec<TerminalCallback>,
}

impl Driver {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<Event>,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                Some(command) = commands.recv() => self.on_command(command),
                Some(event) = events.recv() => self.dispatch(event),
                else => break,
            }
        }

        self.stop_everything();
        debug!(identity = %self.identity, status = %self.machine.status(), "Admission driver stopped");
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Start => {
                let resume = self.load_record();
                self.dispatch(Event::Start {
                    identity: self.identity.clone(),
                    resume,
                });
            }
            Command::Retry => {
                let resume = self.load_record();
                self.dispatch(Event::Retry { resume });
            }
            Command::Exit => self.dispatch(Event::Exit),
            Command::OnTerminal(callback) => {
                if self.machine.is_terminal() {
                    callback();
                } else {
                    self.callbacks.push(callback);
                }
            }
        }
    }

    fn dispatch(&mut self, event: Event) {
        let mut handed_off = false;
        for effect in self.machine.apply(event) {
            match effect {
                Effect::IssueJoin { epoch } => self.issue_join(epoch),
                Effect::StartPoller { generation } => self.start_poller(generation),
                Effect::StopPoller => self.stop_poller(),
                Effect::ScheduleRejoin { epoch, delay } => self.schedule_rejoin(epoch, delay),
                Effect::Persist(progress) => self.persist(progress),
                Effect::ClearRecord => self.clear_record(),
                Effect::HandOff => handed_off = true,
            }
        }

        if self.machine.is_terminal() || self.machine.is_closed() {
            self.stop_everything();
        }
        self.view_tx.send_replace(self.machine.view());

        if handed_off {
            info!(identity = %self.identity, callbacks = self.callbacks.len(), "Handing off to session");
            for callback in self.callbacks.drain(..) {
                callback();
            }
        }
    }

    /// Read the persisted record, discarding anything unusable.
    fn load_record(&self) -> Option<PersistedRecord> {
        if self.identity.validate().is_err() {
            return None;
        }

        let payload = match self.store.load(&self.identity) {
            Ok(Some(payload)) => payload,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "Could not read resume record, starting fresh");
                return None;
            }
        };

        let record = match PersistedRecord::decode(&payload) {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "Discarding unreadable resume record");
                return None;
            }
        };

        if record.client_identity != self.identity {
            debug!(
                stored = %record.client_identity,
                "Discarding resume record of another client"
            );
            return None;
        }
        if record.is_stale(Utc::now(), self.config.resume_max_age) {
            info!(updated_at = %record.updated_at, "Discarding stale resume record");
            return None;
        }
        Some(record)
    }

    fn issue_join(&self, epoch: u64) {
        let token = self.calls.child_token();
        let service = Arc::clone(&self.service);
        let identity = self.identity.clone();
        let events = self.events_tx.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => debug!(epoch, "Join abandoned"),
                result = service.join_queue(&identity) => {
                    let _ = events.send(Event::JoinCompleted {
                        epoch,
                        outcome: result.map_err(Failure::from),
                    });
                }
            }
        });
    }

    fn schedule_rejoin(&self, epoch: u64, delay: std::time::Duration) {
        let token = self.calls.child_token();
        let events = self.events_tx.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = events.send(Event::RejoinDue { epoch });
                }
            }
        });
    }

    fn start_poller(&mut self, generation: u64) {
        self.stop_poller();

        let service = Arc::clone(&self.service);
        let identity = self.identity.clone();
        let events = self.events_tx.clone();

        debug!(generation, interval_ms = self.poller.interval().as_millis() as u64, "Starting status poller");
        self.active_poller = Some(self.poller.begin(move || {
            let service = Arc::clone(&service);
            let identity = identity.clone();
            let events = events.clone();
            async move {
                let outcome = service.poll_status(&identity).await.map_err(Failure::from);
                let _ = events.send(Event::PollCompleted {
                    generation,
                    outcome,
                });
            }
        }));
    }

    fn stop_poller(&mut self) {
        if let Some(poller) = self.active_poller.take() {
            poller.cancel();
        }
    }

    fn stop_everything(&mut self) {
        self.stop_poller();
        self.calls.cancel();
    }

    fn persist(&self, progress: Progress) {
        let record = PersistedRecord::new(self.identity.clone(), progress);
        let payload = match record.encode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Could not encode resume record");
                return;
            }
        };
        if let Err(e) = self.store.save(&self.identity, &payload) {
            warn!(error = %e, "Could not save resume record");
        }
    }

    fn clear_record(&self) {
        if let Err(e) = self.store.clear(&self.identity) {
            warn!(error = %e, "Could not clear resume record");
        }
    }
}
