//! Human-in-the-loop intervention: pause, resume, cancel, and
//! quality-gate review requests.
//!
//! Grounded on the teacher's approval-flow module: a request/response pair
//! delivered over a dedicated channel, with the responder side
//! (`PendingIntervention`) holding a `oneshot::Sender` so exactly one
//! response can be delivered and a dropped responder is never silently
//! ignored.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use std::collections::BTreeMap;

use crate::constants::{DEFAULT_APPROVAL_TIMEOUT, DEFAULT_INTERVENTION_CHANNEL_CAPACITY};
use crate::types::{PlanId, ProcessStep, StepId};

/// A single control-plane mutation applied to a running plan's tree
/// (spec §4.8). Every action is appended to the plan's intervention log
/// with a before/after state checksum once applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum InterventionAction {
    /// Force a step back to `Pending` regardless of its current status,
    /// so it runs again the next time its level is reached.
    RetryStep(StepId),
    /// Mark a step `Skipped`, as if a required upstream dependency had
    /// failed.
    SkipStep(StepId),
    /// Merge the given key/value pairs into a step's parameters.
    ModifyStep {
        /// Step to modify.
        step_id: StepId,
        /// Parameters to merge in, overwriting any existing keys.
        patch: BTreeMap<String, String>,
    },
    /// Insert a brand-new step into the tree.
    AddStep(ProcessStep),
    /// Remove a step from the tree, along with any reference to it in
    /// other steps' `depends_on` lists.
    RemoveStep(StepId),
    /// Preferred execution order for steps that land in the same
    /// dependency level; steps not named here keep their existing
    /// relative order, placed after the named ones.
    ReorderSteps(Vec<StepId>),
}

/// What kind of human decision an [`InterventionRequest`] is asking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InterventionKind {
    /// The orchestrator is asking whether to resume a paused plan.
    ResumeConfirmation,
    /// The quality gate escalated a step's result for human review.
    QualityReview,
}

impl fmt::Display for InterventionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterventionKind::ResumeConfirmation => write!(f, "resume confirmation"),
            InterventionKind::QualityReview => write!(f, "quality review"),
        }
    }
}

/// A request for a human decision, surfaced to whatever control-plane
/// interface is driving the orchestrator (out of scope for this crate —
/// see `spec.md` §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterventionRequest {
    /// Plan this request concerns.
    pub plan_id: PlanId,
    /// Step this request concerns, if any (absent for plan-wide requests).
    pub step_id: Option<StepId>,
    /// What kind of decision is being asked for.
    pub kind: InterventionKind,
    /// Human-readable explanation shown to the reviewer.
    pub message: String,
    /// How long to wait for a response before timing out.
    pub timeout: Duration,
    /// Unique id for tracking this specific request.
    pub request_id: String,
}

impl InterventionRequest {
    /// Build a new request with a freshly generated id and the default
    /// timeout.
    pub fn new(plan_id: PlanId, kind: InterventionKind, message: impl Into<String>) -> Self {
        Self {
            plan_id,
            step_id: None,
            kind,
            message: message.into(),
            timeout: DEFAULT_APPROVAL_TIMEOUT,
            request_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Attach the step this request concerns.
    #[must_use]
    pub fn with_step(mut self, step_id: StepId) -> Self {
        self.step_id = Some(step_id);
        self
    }

    /// Override the default timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// A human's decision in response to an [`InterventionRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterventionResponse {
    /// Id of the request this responds to.
    pub request_id: String,
    /// Whether execution should proceed (approve/resume) or not (deny).
    pub approved: bool,
    /// Optional explanation for the decision.
    pub reason: Option<String>,
}

impl InterventionResponse {
    /// Build an approval for the given request id.
    pub fn approve(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            approved: true,
            reason: None,
        }
    }

    /// Build a denial for the given request id.
    pub fn deny(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            approved: false,
            reason: None,
        }
    }

    /// Attach a reason to the decision.
    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// A request awaiting a human response, holding the sender half of the
/// oneshot channel the orchestrator is blocked on.
pub struct PendingIntervention {
    /// The request being responded to.
    pub request: InterventionRequest,
    response_tx: oneshot::Sender<InterventionResponse>,
}

impl PendingIntervention {
    /// Approve this request. Returns `false` if the orchestrator side had
    /// already given up waiting (e.g. on a plan-level timeout).
    pub fn approve(self) -> bool {
        self.respond(InterventionResponse::approve(self.request.request_id.clone()))
    }

    /// Deny this request. Returns `false` if the orchestrator side had
    /// already given up waiting.
    pub fn deny(self) -> bool {
        self.respond(InterventionResponse::deny(self.request.request_id.clone()))
    }

    fn respond(self, response: InterventionResponse) -> bool {
        let request_id = response.request_id.clone();
        match self.response_tx.send(response) {
            Ok(()) => true,
            Err(_) => {
                tracing::error!(request_id = %request_id, "failed to deliver intervention response: receiver dropped");
                false
            }
        }
    }
}

/// Sending half of the intervention channel, held by the orchestrator.
#[derive(Clone)]
pub struct InterventionChannel {
    tx: mpsc::Sender<PendingIntervention>,
}

/// Receiving half of the intervention channel, held by whatever
/// control-plane surface presents requests to a human.
pub struct InterventionReceiver {
    rx: mpsc::Receiver<PendingIntervention>,
}

impl InterventionChannel {
    /// Create a linked channel pair with the default bounded capacity.
    pub fn new() -> (Self, InterventionReceiver) {
        Self::with_capacity(DEFAULT_INTERVENTION_CHANNEL_CAPACITY)
    }

    /// Create a linked channel pair with an explicit bounded capacity.
    pub fn with_capacity(capacity: usize) -> (Self, InterventionReceiver) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, InterventionReceiver { rx })
    }

    /// Submit a request and await the human's response, or a timeout.
    ///
    /// Returns `Ok(None)` if the response did not arrive within the
    /// request's timeout; the caller decides what that means (e.g. a
    /// `ResumeConfirmation` timing out leaves the plan paused).
    pub async fn request(
        &self,
        request: InterventionRequest,
    ) -> Result<Option<InterventionResponse>, crate::error::Error> {
        let (response_tx, response_rx) = oneshot::channel();
        let timeout = request.timeout;
        let pending = PendingIntervention {
            request,
            response_tx,
        };

        self.tx.send(pending).await.map_err(|_| {
            crate::error::Error::Internal("intervention receiver dropped".into())
        })?;

        match tokio::time::timeout(timeout, response_rx).await {
            Ok(Ok(response)) => Ok(Some(response)),
            Ok(Err(_)) => Ok(None),
            Err(_) => Ok(None),
        }
    }
}

impl InterventionReceiver {
    /// Receive the next pending intervention request, if the channel is
    /// still open.
    pub async fn recv(&mut self) -> Option<PendingIntervention> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn approved_request_resolves_true() {
        let (channel, mut receiver) = InterventionChannel::new();
        let plan_id = PlanId::new();

        let requester = tokio::spawn(async move {
            channel
                .request(InterventionRequest::new(
                    plan_id,
                    InterventionKind::ResumeConfirmation,
                    "resume?",
                ))
                .await
        });

        let pending = receiver.recv().await.unwrap();
        assert_eq!(pending.request.kind, InterventionKind::ResumeConfirmation);
        assert!(pending.approve());

        let response = requester.await.unwrap().unwrap();
        assert!(response.unwrap().approved);
    }

    #[tokio::test]
    async fn denied_request_resolves_false() {
        let (channel, mut receiver) = InterventionChannel::new();
        let plan_id = PlanId::new();

        let requester = tokio::spawn(async move {
            channel
                .request(InterventionRequest::new(
                    plan_id,
                    InterventionKind::QualityReview,
                    "review needed",
                ))
                .await
        });

        let pending = receiver.recv().await.unwrap();
        assert!(pending.deny());

        let response = requester.await.unwrap().unwrap();
        assert!(!response.unwrap().approved);
    }

    #[tokio::test]
    async fn timeout_resolves_to_none() {
        let (channel, mut receiver) = InterventionChannel::new();
        let plan_id = PlanId::new();

        let request = InterventionRequest::new(plan_id, InterventionKind::ResumeConfirmation, "slow")
            .with_timeout(Duration::from_millis(20));

        let requester = tokio::spawn(async move { channel.request(request).await });

        let _pending = receiver.recv().await.unwrap();
        // Deliberately never respond; let the timeout fire.

        let response = requester.await.unwrap().unwrap();
        assert!(response.is_none());
    }
}
