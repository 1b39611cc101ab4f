//! Admission state machine.
//!
//! `apply(event) -> effects` is pure: no I/O, no clock, no tasks. The
//! controller performs the returned effects and feeds completions back in as
//! events. Every outstanding call is tagged (join epoch, poller generation) so
//! a completion that arrives after the machine has moved on is dropped.
//!
//! Invariants:
//! - At most one join is outstanding.
//! - A poller runs iff the status is `Waiting`.
//! - `Error` is left only through `Retry`.
//! - After hand-off or exit, every event is ignored.

use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::DEFAULT_FAILURE_THRESHOLD;
use crate::identity::ClientIdentity;
use crate::status::{AdmissionStatus, QueueSnapshot};
use crate::store::PersistedRecord;

/// How the state machine sees a failed call.
///
/// Transport and application failures take the same transitions and differ
/// only in the message shown to the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    Transport,
    Application,
    /// Malformed request; retrying cannot help.
    Validation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

impl Failure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Transport, message)
    }

    pub fn application(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Application, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Validation, message)
    }

    fn counts_toward_threshold(&self) -> bool {
        self.kind != FailureKind::Validation
    }

    /// Operator-facing text for the error display.
    pub fn display_message(&self) -> String {
        match self.kind {
            FailureKind::Transport => format!(
                "Failed to connect to the interview system. Please try again. ({})",
                self.message
            ),
            FailureKind::Application => {
                format!("The interview system reported an error: {}", self.message)
            }
            FailureKind::Validation => {
                format!("The admission request was rejected: {}", self.message)
            }
        }
    }
}

pub type Outcome = Result<QueueSnapshot, Failure>;

#[derive(Debug, Clone)]
pub enum Event {
    /// Mount. `resume` is the persisted record, already checked for
    /// identity and staleness.
    Start {
        identity: ClientIdentity,
        resume: Option<PersistedRecord>,
    },
    JoinCompleted {
        epoch: u64,
        outcome: Outcome,
    },
    PollCompleted {
        generation: u64,
        outcome: Outcome,
    },
    RejoinDue {
        epoch: u64,
    },
    Retry {
        resume: Option<PersistedRecord>,
    },
    /// Explicit abandonment.
    Exit,
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::JoinCompleted { .. } => "join_completed",
            Self::PollCompleted { .. } => "poll_completed",
            Self::RejoinDue { .. } => "rejoin_due",
            Self::Retry { .. } => "retry",
            Self::Exit => "exit",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    IssueJoin { epoch: u64 },
    StartPoller { generation: u64 },
    StopPoller,
    ScheduleRejoin { epoch: u64, delay: Duration },
    Persist(Progress),
    ClearRecord,
    HandOff,
}

/// Fields of the persisted record owned by the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub status: AdmissionStatus,
    pub position: u32,
    pub consecutive_errors: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachinePolicy {
    pub failure_threshold: u32,
    pub rejoin_delay: Duration,
}

impl Default for MachinePolicy {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            rejoin_delay: Duration::from_secs(1),
        }
    }
}

/// Observable state for rendering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionView {
    pub status: AdmissionStatus,
    pub position: u32,
    pub consecutive_error_count: u32,
    pub message: String,
    /// Last snapshot received, kept as context when in `Error`.
    pub last_snapshot: Option<QueueSnapshot>,
    pub last_failure: Option<Failure>,
    /// Hand-off happened; nothing further will be issued.
    pub terminal: bool,
    /// Abandoned through exit.
    pub closed: bool,
}

#[derive(Debug, Clone)]
pub struct AdmissionMachine {
    policy: MachinePolicy,
    identity: Option<ClientIdentity>,
    status: AdmissionStatus,
    position: u32,
    /// Status most recently written to the persisted record.
    record_status: AdmissionStatus,
    consecutive_errors: u32,
    last_snapshot: Option<QueueSnapshot>,
    last_failure: Option<Failure>,
    /// Tags the outstanding join or the scheduled re-join.
    epoch: u64,
    join_in_flight: bool,
    rejoin_pending: bool,
    /// Generation of the running poller.
    poller: Option<u64>,
    generations: u64,
    started: bool,
    handed_off: bool,
    exited: bool,
}

impl AdmissionMachine {
    pub fn new(policy: MachinePolicy) -> Self {
        Self {
            policy,
            identity: None,
            status: AdmissionStatus::Checking,
            position: 0,
            record_status: AdmissionStatus::Checking,
            consecutive_errors: 0,
            last_snapshot: None,
            last_failure: None,
            epoch: 0,
            join_in_flight: false,
            rejoin_pending: false,
            poller: None,
            generations: 0,
            started: false,
            handed_off: false,
            exited: false,
        }
    }

    pub fn status(&self) -> AdmissionStatus {
        self.status
    }

    pub fn position(&self) -> u32 {
        self.position
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    pub fn identity(&self) -> Option<&ClientIdentity> {
        self.identity.as_ref()
    }

    pub fn poller_active(&self) -> bool {
        self.poller.is_some()
    }

    pub fn join_in_flight(&self) -> bool {
        self.join_in_flight
    }

    pub fn is_terminal(&self) -> bool {
        self.handed_off
    }

    pub fn is_closed(&self) -> bool {
        self.exited
    }

    pub fn apply(&mut self, event: Event) -> Vec<Effect> {
        if self.handed_off || self.exited {
            debug!(event = event.name(), "Admission finished, ignoring event");
            return Vec::new();
        }

        match event {
            Event::Start { identity, resume } => self.on_start(identity, resume),
            Event::JoinCompleted { epoch, outcome } => self.on_join_completed(epoch, outcome),
            Event::PollCompleted {
                generation,
                outcome,
            } => self.on_poll_completed(generation, outcome),
            Event::RejoinDue { epoch } => self.on_rejoin_due(epoch),
            Event::Retry { resume } => self.on_retry(resume),
            Event::Exit => self.on_exit(),
        }
    }

    pub fn view(&self) -> AdmissionView {
        AdmissionView {
            status: self.status,
            position: self.position,
            consecutive_error_count: self.consecutive_errors,
            message: self.message(),
            last_snapshot: self.last_snapshot,
            last_failure: self.last_failure.clone(),
            terminal: self.handed_off,
            closed: self.exited,
        }
    }

    fn message(&self) -> String {
        if self.exited {
            return "You have left the waiting room.".to_string();
        }
        match self.status {
            AdmissionStatus::Checking => "Checking availability...".to_string(),
            AdmissionStatus::Joining => "Joining the queue...".to_string(),
            AdmissionStatus::Idle => "Not in the queue yet.".to_string(),
            AdmissionStatus::Waiting => format!(
                "The interview room is currently full. Your position in the queue: #{}",
                self.position
            ),
            AdmissionStatus::Ready | AdmissionStatus::InSession => {
                "A spot has opened! Joining the interview now...".to_string()
            }
            AdmissionStatus::Error => self
                .last_failure
                .as_ref()
                .map(Failure::display_message)
                .unwrap_or_else(|| "Something went wrong. Please try again.".to_string()),
        }
    }

    fn progress(&self) -> Progress {
        Progress {
            status: self.record_status,
            position: self.position,
            consecutive_errors: self.consecutive_errors,
        }
    }

    fn on_start(&mut self, identity: ClientIdentity, resume: Option<PersistedRecord>) -> Vec<Effect> {
        if self.started {
            debug!(status = %self.status, "Start ignored, admission already underway");
            return Vec::new();
        }
        self.started = true;
        self.identity = Some(identity);
        self.begin(resume)
    }

    /// Shared by start and retry: resume polling or join.
    fn begin(&mut self, resume: Option<PersistedRecord>) -> Vec<Effect> {
        self.status = AdmissionStatus::Checking;

        let Some(identity) = self.identity.clone() else {
            return Vec::new();
        };
        if let Err(e) = identity.validate() {
            return self.fail(Failure::validation(e.to_string()));
        }

        if let Some(record) = resume {
            self.consecutive_errors = record.consecutive_error_count;
            self.position = record.last_position;
            if record.last_status == AdmissionStatus::Waiting {
                info!(
                    %identity,
                    position = record.last_position,
                    "Resuming queue slot without re-joining"
                );
                self.last_snapshot = Some(QueueSnapshot::waiting(record.last_position));
                return self.enter_waiting(record.last_position);
            }
        }

        self.issue_join()
    }

    fn issue_join(&mut self) -> Vec<Effect> {
        self.epoch += 1;
        self.status = AdmissionStatus::Joining;
        self.join_in_flight = true;
        self.rejoin_pending = false;
        self.record_status = AdmissionStatus::Joining;
        debug!(epoch = self.epoch, "Issuing join");
        vec![
            Effect::Persist(self.progress()),
            Effect::IssueJoin { epoch: self.epoch },
        ]
    }

    fn enter_waiting(&mut self, position: u32) -> Vec<Effect> {
        self.status = AdmissionStatus::Waiting;
        self.position = position;
        self.record_status = AdmissionStatus::Waiting;

        let mut effects = vec![Effect::Persist(self.progress())];
        if self.poller.is_none() {
            self.generations += 1;
            self.poller = Some(self.generations);
            effects.push(Effect::StartPoller {
                generation: self.generations,
            });
        }
        info!(position, "Waiting for a slot");
        effects
    }

    fn stop_poller(&mut self) -> Vec<Effect> {
        match self.poller.take() {
            Some(_) => vec![Effect::StopPoller],
            None => Vec::new(),
        }
    }

    /// Invalidate every outstanding call.
    fn abandon_outstanding(&mut self) -> Vec<Effect> {
        self.epoch += 1;
        self.join_in_flight = false;
        self.rejoin_pending = false;
        self.stop_poller()
    }

    fn on_join_completed(&mut self, epoch: u64, outcome: Outcome) -> Vec<Effect> {
        if !self.join_in_flight || epoch != self.epoch {
            debug!(epoch, current = self.epoch, "Discarding stale join response");
            return Vec::new();
        }
        self.join_in_flight = false;

        let snapshot = match outcome {
            Ok(snapshot) => snapshot,
            Err(failure) => {
                // A failed join has unknown backend side effects: no silent retry.
                if failure.counts_toward_threshold() {
                    self.consecutive_errors += 1;
                }
                return self.fail(failure);
            }
        };

        self.consecutive_errors = 0;
        self.last_snapshot = Some(snapshot);

        match snapshot.status {
            status if status.is_admitted() => self.hand_off(),
            AdmissionStatus::Waiting => self.enter_waiting(snapshot.position),
            AdmissionStatus::Idle => {
                self.position = 0;
                self.record_status = AdmissionStatus::Idle;
                self.rejoin_pending = true;
                info!(
                    delay_ms = self.policy.rejoin_delay.as_millis() as u64,
                    "Backend reports not enqueued, re-joining"
                );
                vec![
                    Effect::Persist(self.progress()),
                    Effect::ScheduleRejoin {
                        epoch: self.epoch,
                        delay: self.policy.rejoin_delay,
                    },
                ]
            }
            other => {
                self.consecutive_errors += 1;
                self.fail(Failure::application(format!(
                    "unexpected status '{other}' in join response"
                )))
            }
        }
    }

    fn on_rejoin_due(&mut self, epoch: u64) -> Vec<Effect> {
        if !self.rejoin_pending || epoch != self.epoch {
            debug!(epoch, current = self.epoch, "Discarding stale re-join timer");
            return Vec::new();
        }
        self.issue_join()
    }

    fn on_poll_completed(&mut self, generation: u64, outcome: Outcome) -> Vec<Effect> {
        if self.poller != Some(generation) || self.status != AdmissionStatus::Waiting {
            debug!(generation, "Discarding stale poll response");
            return Vec::new();
        }

        let snapshot = match outcome {
            Ok(snapshot) => snapshot,
            Err(failure) => return self.on_poll_failure(failure),
        };

        match snapshot.status {
            status if status.is_admitted() => {
                self.consecutive_errors = 0;
                self.last_snapshot = Some(snapshot);
                self.hand_off()
            }
            AdmissionStatus::Waiting => {
                self.consecutive_errors = 0;
                self.last_snapshot = Some(snapshot);
                self.position = snapshot.position;
                debug!(position = snapshot.position, "Queue position update");
                vec![Effect::Persist(self.progress())]
            }
            AdmissionStatus::Idle => {
                self.consecutive_errors = 0;
                self.last_snapshot = Some(snapshot);
                info!("Queue slot lost, re-joining");
                let mut effects = self.stop_poller();
                effects.extend(self.issue_join());
                effects
            }
            other => self.on_poll_failure(Failure::application(format!(
                "unexpected status '{other}' in status response"
            ))),
        }
    }

    fn on_poll_failure(&mut self, failure: Failure) -> Vec<Effect> {
        if !failure.counts_toward_threshold() {
            return self.fail(failure);
        }

        self.consecutive_errors += 1;
        if self.consecutive_errors >= self.policy.failure_threshold {
            return self.fail(failure);
        }

        warn!(
            attempt = self.consecutive_errors,
            threshold = self.policy.failure_threshold,
            error = %failure.message,
            "Status poll failed, will try again on next tick"
        );
        self.last_failure = Some(failure);
        vec![Effect::Persist(self.progress())]
    }

    fn fail(&mut self, failure: Failure) -> Vec<Effect> {
        let mut effects = self.abandon_outstanding();
        self.status = AdmissionStatus::Error;

        error!(
            kind = ?failure.kind,
            error = %failure.message,
            consecutive_errors = self.consecutive_errors,
            "Admission failed, waiting for manual retry"
        );

        // Validation failures never touch the counter, so there is nothing new to write.
        if failure.counts_toward_threshold() {
            effects.push(Effect::Persist(self.progress()));
        }
        self.last_failure = Some(failure);
        effects
    }

    fn hand_off(&mut self) -> Vec<Effect> {
        let mut effects = self.abandon_outstanding();
        self.status = AdmissionStatus::InSession;
        self.position = 0;
        self.handed_off = true;
        info!("Admitted, handing off to session");
        effects.push(Effect::ClearRecord);
        effects.push(Effect::HandOff);
        effects
    }

    fn on_retry(&mut self, resume: Option<PersistedRecord>) -> Vec<Effect> {
        if self.status != AdmissionStatus::Error {
            debug!(status = %self.status, "Retry ignored outside of error state");
            return Vec::new();
        }

        info!("Retrying admission");
        self.consecutive_errors = 0;
        self.last_failure = None;
        let resume = resume.map(|record| PersistedRecord {
            consecutive_error_count: 0,
            ..record
        });
        self.begin(resume)
    }

    fn on_exit(&mut self) -> Vec<Effect> {
        let mut effects = self.abandon_outstanding();
        self.exited = true;
        info!("Leaving the waiting room");
        // A record from an earlier mount may exist even if start never ran.
        effects.push(Effect::ClearRecord);
        effects
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    const REJOIN: Duration = Duration::from_millis(500);

    fn machine() -> AdmissionMachine {
        AdmissionMachine::new(MachinePolicy {
            failure_threshold: 3,
            rejoin_delay: REJOIN,
        })
    }

    fn id() -> ClientIdentity {
        ClientIdentity::new("user_42")
    }

    fn record(status: AdmissionStatus, position: u32, errors: u32) -> PersistedRecord {
        PersistedRecord {
            client_identity: id(),
            last_status: status,
            last_position: position,
            consecutive_error_count: errors,
            updated_at: Utc::now(),
        }
    }

    fn progress(status: AdmissionStatus, position: u32, consecutive_errors: u32) -> Progress {
        Progress {
            status,
            position,
            consecutive_errors,
        }
    }

    fn start(m: &mut AdmissionMachine) -> Vec<Effect> {
        m.apply(Event::Start {
            identity: id(),
            resume: None,
        })
    }

    fn join_ok(m: &mut AdmissionMachine, snapshot: QueueSnapshot) -> Vec<Effect> {
        let epoch = m.epoch;
        m.apply(Event::JoinCompleted {
            epoch,
            outcome: Ok(snapshot),
        })
    }

    fn poll(m: &mut AdmissionMachine, outcome: Outcome) -> Vec<Effect> {
        let generation = m.poller.expect("poller should be running");
        m.apply(Event::PollCompleted {
            generation,
            outcome,
        })
    }

    /// Machine that joined and is polling at `position`.
    fn waiting_at(position: u32) -> AdmissionMachine {
        let mut m = machine();
        start(&mut m);
        join_ok(&mut m, QueueSnapshot::waiting(position));
        m
    }

    #[test]
    fn start_issues_exactly_one_join() {
        let mut m = machine();
        let effects = start(&mut m);
        assert_eq!(
            effects,
            vec![
                Effect::Persist(progress(AdmissionStatus::Joining, 0, 0)),
                Effect::IssueJoin { epoch: 1 },
            ]
        );
        assert_eq!(m.status(), AdmissionStatus::Joining);
        assert!(m.join_in_flight());
    }

    #[test]
    fn second_start_while_joining_is_noop() {
        let mut m = machine();
        start(&mut m);
        assert!(start(&mut m).is_empty());
        assert_eq!(m.epoch, 1);
    }

    #[test]
    fn join_waiting_persists_and_starts_poller() {
        let mut m = machine();
        start(&mut m);
        let effects = join_ok(&mut m, QueueSnapshot::waiting(4));
        assert_eq!(
            effects,
            vec![
                Effect::Persist(progress(AdmissionStatus::Waiting, 4, 0)),
                Effect::StartPoller { generation: 1 },
            ]
        );
        assert_eq!(m.status(), AdmissionStatus::Waiting);
        assert!(m.poller_active());
    }

    #[test]
    fn waiting_then_position_update_then_ready() {
        let mut m = waiting_at(4);

        let effects = poll(&mut m, Ok(QueueSnapshot::waiting(2)));
        assert_eq!(
            effects,
            vec![Effect::Persist(progress(AdmissionStatus::Waiting, 2, 0))]
        );
        assert_eq!(m.view().position, 2);
        assert_eq!(m.status(), AdmissionStatus::Waiting);

        let effects = poll(&mut m, Ok(QueueSnapshot::ready()));
        assert_eq!(
            effects,
            vec![Effect::StopPoller, Effect::ClearRecord, Effect::HandOff]
        );
        assert_eq!(m.status(), AdmissionStatus::InSession);
        assert!(m.is_terminal());
        assert!(!m.poller_active());
    }

    #[test]
    fn join_admitted_hands_off_without_polling() {
        let mut m = machine();
        start(&mut m);
        let effects = join_ok(&mut m, QueueSnapshot::new(AdmissionStatus::InSession, 0));
        assert_eq!(effects, vec![Effect::ClearRecord, Effect::HandOff]);
        assert!(m.is_terminal());
    }

    #[test]
    fn join_idle_rejoins_without_waiting_or_polling() {
        let mut m = machine();
        start(&mut m);

        let effects = join_ok(&mut m, QueueSnapshot::idle());
        assert_eq!(
            effects,
            vec![
                Effect::Persist(progress(AdmissionStatus::Idle, 0, 0)),
                Effect::ScheduleRejoin {
                    epoch: 1,
                    delay: REJOIN
                },
            ]
        );
        assert_eq!(m.status(), AdmissionStatus::Joining);
        assert!(!m.poller_active());

        let effects = m.apply(Event::RejoinDue { epoch: 1 });
        assert_eq!(
            effects,
            vec![
                Effect::Persist(progress(AdmissionStatus::Joining, 0, 0)),
                Effect::IssueJoin { epoch: 2 },
            ]
        );
        assert!(!m.poller_active());
    }

    #[test]
    fn stale_rejoin_timer_is_ignored() {
        let mut m = machine();
        start(&mut m);
        join_ok(&mut m, QueueSnapshot::idle());
        m.apply(Event::Exit);
        assert!(m.apply(Event::RejoinDue { epoch: 1 }).is_empty());

        let mut m = machine();
        start(&mut m);
        assert!(m.apply(Event::RejoinDue { epoch: 1 }).is_empty());
    }

    #[test]
    fn join_failure_goes_straight_to_error() {
        let mut m = machine();
        start(&mut m);
        let effects = m.apply(Event::JoinCompleted {
            epoch: 1,
            outcome: Err(Failure::transport("connection refused")),
        });
        assert_eq!(
            effects,
            vec![Effect::Persist(progress(AdmissionStatus::Joining, 0, 1))]
        );
        assert_eq!(m.status(), AdmissionStatus::Error);
        assert_eq!(m.consecutive_errors(), 1);
        assert!(!m.join_in_flight());
        assert!(m.view().message.starts_with("Failed to connect"));
    }

    #[test]
    fn join_rejection_does_not_count() {
        let mut m = machine();
        start(&mut m);
        let effects = m.apply(Event::JoinCompleted {
            epoch: 1,
            outcome: Err(Failure::validation("missing user_id")),
        });
        assert!(effects.is_empty());
        assert_eq!(m.status(), AdmissionStatus::Error);
        assert_eq!(m.consecutive_errors(), 0);
    }

    #[test]
    fn join_with_client_only_status_is_application_failure() {
        let mut m = machine();
        start(&mut m);
        join_ok(&mut m, QueueSnapshot::new(AdmissionStatus::Checking, 0));
        assert_eq!(m.status(), AdmissionStatus::Error);
        assert_eq!(
            m.view().last_failure.map(|f| f.kind),
            Some(FailureKind::Application)
        );
    }

    #[test]
    fn invalid_identity_fails_without_any_call() {
        let mut m = machine();
        let effects = m.apply(Event::Start {
            identity: ClientIdentity::new(""),
            resume: None,
        });
        assert!(effects.is_empty());
        assert_eq!(m.status(), AdmissionStatus::Error);
        assert_eq!(m.consecutive_errors(), 0);
        assert!(m.view().message.contains("rejected"));
    }

    #[test]
    fn poll_failures_hit_threshold_on_third() {
        let mut m = waiting_at(4);

        for attempt in 1..=2 {
            let effects = poll(&mut m, Err(Failure::transport("timeout")));
            assert_eq!(
                effects,
                vec![Effect::Persist(progress(AdmissionStatus::Waiting, 4, attempt))]
            );
            assert_eq!(m.status(), AdmissionStatus::Waiting);
            assert!(m.poller_active());
        }

        let effects = poll(&mut m, Err(Failure::application("500")));
        assert_eq!(
            effects,
            vec![
                Effect::StopPoller,
                Effect::Persist(progress(AdmissionStatus::Waiting, 4, 3)),
            ]
        );
        assert_eq!(m.status(), AdmissionStatus::Error);
        assert!(!m.poller_active());
        assert_eq!(m.view().last_snapshot, Some(QueueSnapshot::waiting(4)));
    }

    #[test]
    fn poll_success_resets_failure_count() {
        let mut m = waiting_at(4);
        poll(&mut m, Err(Failure::transport("timeout")));
        poll(&mut m, Err(Failure::transport("timeout")));
        poll(&mut m, Ok(QueueSnapshot::waiting(3)));
        assert_eq!(m.consecutive_errors(), 0);

        poll(&mut m, Err(Failure::transport("timeout")));
        poll(&mut m, Err(Failure::transport("timeout")));
        assert_eq!(m.status(), AdmissionStatus::Waiting);
    }

    #[test]
    fn poll_rejection_is_fatal_immediately() {
        let mut m = waiting_at(4);
        let effects = poll(&mut m, Err(Failure::validation("bad id")));
        assert_eq!(effects, vec![Effect::StopPoller]);
        assert_eq!(m.status(), AdmissionStatus::Error);
        assert_eq!(m.consecutive_errors(), 0);
    }

    #[test]
    fn poll_unexpected_status_counts_as_failure() {
        let mut m = waiting_at(4);
        poll(&mut m, Ok(QueueSnapshot::new(AdmissionStatus::Error, 0)));
        assert_eq!(m.status(), AdmissionStatus::Waiting);
        assert_eq!(m.consecutive_errors(), 1);
    }

    #[test]
    fn poll_idle_stops_poller_and_rejoins() {
        let mut m = waiting_at(4);
        let effects = poll(&mut m, Ok(QueueSnapshot::idle()));
        assert_eq!(
            effects,
            vec![
                Effect::StopPoller,
                Effect::Persist(progress(AdmissionStatus::Joining, 4, 0)),
                Effect::IssueJoin { epoch: 2 },
            ]
        );
        assert_eq!(m.status(), AdmissionStatus::Joining);
        assert!(!m.poller_active());
    }

    #[test]
    fn poll_from_previous_poller_is_discarded() {
        let mut m = waiting_at(4);
        poll(&mut m, Ok(QueueSnapshot::idle()));
        join_ok(&mut m, QueueSnapshot::waiting(9));
        assert_eq!(m.poller, Some(2));

        let effects = m.apply(Event::PollCompleted {
            generation: 1,
            outcome: Ok(QueueSnapshot::ready()),
        });
        assert!(effects.is_empty());
        assert_eq!(m.status(), AdmissionStatus::Waiting);
    }

    #[test]
    fn stale_poll_after_hand_off_is_discarded() {
        let mut m = waiting_at(4);
        poll(&mut m, Ok(QueueSnapshot::ready()));

        let effects = m.apply(Event::PollCompleted {
            generation: 1,
            outcome: Err(Failure::transport("late")),
        });
        assert!(effects.is_empty());
        assert_eq!(m.status(), AdmissionStatus::InSession);
    }

    #[test]
    fn stale_join_after_error_is_discarded() {
        let mut m = waiting_at(4);
        for _ in 0..3 {
            poll(&mut m, Err(Failure::transport("timeout")));
        }
        let effects = m.apply(Event::JoinCompleted {
            epoch: 1,
            outcome: Ok(QueueSnapshot::ready()),
        });
        assert!(effects.is_empty());
        assert_eq!(m.status(), AdmissionStatus::Error);
    }

    #[test]
    fn resume_waiting_skips_join() {
        let mut m = machine();
        let effects = m.apply(Event::Start {
            identity: id(),
            resume: Some(record(AdmissionStatus::Waiting, 7, 0)),
        });
        assert_eq!(
            effects,
            vec![
                Effect::Persist(progress(AdmissionStatus::Waiting, 7, 0)),
                Effect::StartPoller { generation: 1 },
            ]
        );
        assert!(!effects.iter().any(|e| matches!(e, Effect::IssueJoin { .. })));
        assert_eq!(m.position(), 7);
    }

    #[test]
    fn resume_restores_error_count() {
        let mut m = machine();
        m.apply(Event::Start {
            identity: id(),
            resume: Some(record(AdmissionStatus::Waiting, 7, 2)),
        });
        poll(&mut m, Err(Failure::transport("timeout")));
        assert_eq!(m.status(), AdmissionStatus::Error);
    }

    #[test]
    fn resume_other_status_joins() {
        let mut m = machine();
        let effects = m.apply(Event::Start {
            identity: id(),
            resume: Some(record(AdmissionStatus::Joining, 0, 0)),
        });
        assert!(effects.contains(&Effect::IssueJoin { epoch: 1 }));
    }

    #[test]
    fn retry_resumes_polling_when_record_says_waiting() {
        let mut m = waiting_at(4);
        for _ in 0..3 {
            poll(&mut m, Err(Failure::transport("timeout")));
        }
        assert_eq!(m.status(), AdmissionStatus::Error);

        let effects = m.apply(Event::Retry {
            resume: Some(record(AdmissionStatus::Waiting, 4, 3)),
        });
        assert_eq!(
            effects,
            vec![
                Effect::Persist(progress(AdmissionStatus::Waiting, 4, 0)),
                Effect::StartPoller { generation: 2 },
            ]
        );
        assert_eq!(m.status(), AdmissionStatus::Waiting);
        assert_eq!(m.consecutive_errors(), 0);
        assert!(m.view().last_failure.is_none());
    }

    #[test]
    fn retry_without_record_joins_again() {
        let mut m = machine();
        start(&mut m);
        m.apply(Event::JoinCompleted {
            epoch: 1,
            outcome: Err(Failure::transport("refused")),
        });

        let effects = m.apply(Event::Retry { resume: None });
        assert_eq!(
            effects,
            vec![
                Effect::Persist(progress(AdmissionStatus::Joining, 0, 0)),
                Effect::IssueJoin { epoch: 3 },
            ]
        );
    }

    #[test]
    fn retry_outside_error_is_ignored() {
        let mut m = waiting_at(4);
        assert!(m.apply(Event::Retry { resume: None }).is_empty());
        assert_eq!(m.status(), AdmissionStatus::Waiting);
    }

    #[test]
    fn start_does_not_leave_error() {
        let mut m = waiting_at(4);
        for _ in 0..3 {
            poll(&mut m, Err(Failure::transport("timeout")));
        }
        assert!(start(&mut m).is_empty());
        assert_eq!(m.status(), AdmissionStatus::Error);
    }

    #[test]
    fn exit_stops_everything_and_clears_record() {
        let mut m = waiting_at(4);
        let effects = m.apply(Event::Exit);
        assert_eq!(effects, vec![Effect::StopPoller, Effect::ClearRecord]);
        assert!(m.is_closed());
        assert!(m.view().closed);
        assert!(m.apply(Event::Retry { resume: None }).is_empty());
        assert!(start(&mut m).is_empty());
    }

    #[test]
    fn exit_before_start_still_clears_record() {
        let mut m = machine();
        assert_eq!(m.apply(Event::Exit), vec![Effect::ClearRecord]);
        assert!(m.is_closed());
        assert!(start(&mut m).is_empty());
    }

    #[test]
    fn terminal_ignores_everything() {
        let mut m = waiting_at(4);
        poll(&mut m, Ok(QueueSnapshot::ready()));

        assert!(start(&mut m).is_empty());
        assert!(m.apply(Event::Retry { resume: None }).is_empty());
        assert!(m.apply(Event::Exit).is_empty());
        assert!(m.apply(Event::RejoinDue { epoch: m.epoch }).is_empty());
        assert_eq!(m.status(), AdmissionStatus::InSession);
    }

    #[test]
    fn view_serializes_camel_case() {
        let m = waiting_at(4);
        insta::assert_json_snapshot!(m.view(), @r#"
        {
          "status": "waiting",
          "position": 4,
          "consecutiveErrorCount": 0,
          "message": "The interview room is currently full. Your position in the queue: #4",
          "lastSnapshot": {
            "status": "waiting",
            "position": 4
          },
          "lastFailure": null,
          "terminal": false,
          "closed": false
        }
        "#);
    }

    #[derive(Debug, Clone, Copy)]
    enum Step {
        Start,
        JoinWaiting,
        JoinIdle,
        JoinReady,
        JoinFailed,
        PollWaiting,
        PollIdle,
        PollReady,
        PollFailed,
        PollStale,
        Rejoin,
        RetryResume,
        RetryFresh,
        Exit,
    }

    const STEPS: [Step; 14] = [
        Step::Start,
        Step::JoinWaiting,
        Step::JoinIdle,
        Step::JoinReady,
        Step::JoinFailed,
        Step::PollWaiting,
        Step::PollIdle,
        Step::PollReady,
        Step::PollFailed,
        Step::PollStale,
        Step::Rejoin,
        Step::RetryResume,
        Step::RetryFresh,
        Step::Exit,
    ];

    /// Build the event a real driver could deliver from this state.
    fn event_for(m: &AdmissionMachine, step: Step) -> Event {
        let generation = m.poller.unwrap_or(m.generations);
        match step {
            Step::Start => Event::Start {
                identity: id(),
                resume: None,
            },
            Step::JoinWaiting => Event::JoinCompleted {
                epoch: m.epoch,
                outcome: Ok(QueueSnapshot::waiting(3)),
            },
            Step::JoinIdle => Event::JoinCompleted {
                epoch: m.epoch,
                outcome: Ok(QueueSnapshot::idle()),
            },
            Step::JoinReady => Event::JoinCompleted {
                epoch: m.epoch,
                outcome: Ok(QueueSnapshot::ready()),
            },
            Step::JoinFailed => Event::JoinCompleted {
                epoch: m.epoch,
                outcome: Err(Failure::transport("down")),
            },
            Step::PollWaiting => Event::PollCompleted {
                generation,
                outcome: Ok(QueueSnapshot::waiting(2)),
            },
            Step::PollIdle => Event::PollCompleted {
                generation,
                outcome: Ok(QueueSnapshot::idle()),
            },
            Step::PollReady => Event::PollCompleted {
                generation,
                outcome: Ok(QueueSnapshot::ready()),
            },
            Step::PollFailed => Event::PollCompleted {
                generation,
                outcome: Err(Failure::transport("down")),
            },
            Step::PollStale => Event::PollCompleted {
                generation: generation.wrapping_sub(1),
                outcome: Ok(QueueSnapshot::ready()),
            },
            Step::Rejoin => Event::RejoinDue { epoch: m.epoch },
            Step::RetryResume => Event::Retry {
                resume: Some(record(AdmissionStatus::Waiting, 5, 1)),
            },
            Step::RetryFresh => Event::Retry { resume: None },
            Step::Exit => Event::Exit,
        }
    }

    /// Walk every event sequence up to `depth`, checking invariants after each step.
    fn explore(m: &AdmissionMachine, depth: usize, hand_offs: usize) {
        if depth == 0 {
            return;
        }
        for step in STEPS {
            let mut next = m.clone();
            let was_joining = next.join_in_flight;
            let was_finished = next.is_terminal() || next.is_closed();

            let effects = next.apply(event_for(m, step));

            if next.is_closed() {
                assert!(!next.poller_active(), "exit must stop the poller");
            } else {
                assert_eq!(
                    next.poller_active(),
                    next.status() == AdmissionStatus::Waiting,
                    "poller must run iff waiting (after {step:?}, status {})",
                    next.status()
                );
            }
            let joins = effects
                .iter()
                .filter(|e| matches!(e, Effect::IssueJoin { .. }))
                .count();
            assert!(joins <= 1, "at most one join per event");
            if was_joining {
                assert_eq!(joins, 0, "no second join while one is outstanding");
            }
            if was_finished {
                assert!(effects.is_empty(), "finished machine must stay inert");
            }
            let hand_offs = hand_offs
                + effects
                    .iter()
                    .filter(|e| matches!(e, Effect::HandOff))
                    .count();
            assert!(hand_offs <= 1, "hand-off fires at most once");
            if next.status() == AdmissionStatus::Error {
                assert!(!next.join_in_flight());
            }

            explore(&next, depth - 1, hand_offs);
        }
    }

    #[test]
    fn invariants_hold_on_all_short_traces() {
        explore(&machine(), 5, 0);
    }
}
