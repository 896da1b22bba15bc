//! Per-request actor: owns one flow state machine, drains its event
//! channel, and executes the actions the flow emits. Provider invocations
//! run as sub-tasks that feed replies back into the same channel, so every
//! state mutation happens on the actor task.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::session::clear::{ClearQuery, ClearSession};
use crate::session::core::{
    ClientCallback, ProviderTransport, Selector, SessionAction, SessionEvent,
};
use crate::session::create::{CreateQuery, CreateSession};
use crate::session::entries::{CandidateBundle, CreateBundle};
use crate::session::get::{GetQuery, GetSession};
use crate::session::types::{Credential, CreationReceipt, RequestId, ServiceId};

/// A flow state machine drivable by the session actor.
pub trait RequestFlow: Send + 'static {
    type Query: Send + 'static;
    type Candidates: Send + 'static;
    type Response: Send + 'static;

    /// Flow name for logs.
    const KIND: &'static str;

    fn request(&self) -> &RequestId;
    fn handle(
        &mut self,
        event: SessionEvent<Self::Candidates>,
    ) -> Vec<SessionAction<Self::Query, Self::Response>>;
}

impl RequestFlow for GetSession {
    type Query = GetQuery;
    type Candidates = CandidateBundle;
    type Response = Credential;
    const KIND: &'static str = "get";

    fn request(&self) -> &RequestId {
        GetSession::request(self)
    }

    fn handle(
        &mut self,
        event: SessionEvent<CandidateBundle>,
    ) -> Vec<SessionAction<GetQuery, Credential>> {
        GetSession::handle(self, event)
    }
}

impl RequestFlow for CreateSession {
    type Query = CreateQuery;
    type Candidates = CreateBundle;
    type Response = CreationReceipt;
    const KIND: &'static str = "create";

    fn request(&self) -> &RequestId {
        CreateSession::request(self)
    }

    fn handle(
        &mut self,
        event: SessionEvent<CreateBundle>,
    ) -> Vec<SessionAction<CreateQuery, CreationReceipt>> {
        CreateSession::handle(self, event)
    }
}

impl RequestFlow for ClearSession {
    type Query = ClearQuery;
    type Candidates = ();
    type Response = ();
    const KIND: &'static str = "clear";

    fn request(&self) -> &RequestId {
        ClearSession::request(self)
    }

    fn handle(&mut self, event: SessionEvent<()>) -> Vec<SessionAction<ClearQuery, ()>> {
        ClearSession::handle(self, event)
    }
}

/// Notice sent to the owner when a session actor delivers its terminal
/// callback (or its event channel closes).
#[derive(Debug)]
pub struct SessionEnded {
    pub request: RequestId,
}

/// Spawn the actor for one request session. Returns the event sender the
/// owner uses to route provider results, selections, and cancellation into
/// the session.
pub fn spawn_session<F, T, S, C>(
    flow: F,
    initial: Vec<SessionAction<F::Query, F::Response>>,
    transport: Arc<T>,
    selector: Arc<S>,
    callback: C,
    ended_tx: mpsc::UnboundedSender<SessionEnded>,
) -> mpsc::UnboundedSender<SessionEvent<F::Candidates>>
where
    F: RequestFlow,
    T: ProviderTransport<F::Query, F::Candidates> + 'static,
    S: Selector + 'static,
    C: ClientCallback<F::Response> + 'static,
{
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let feedback = events_tx.clone();
    tokio::spawn(drive(
        flow, initial, transport, selector, callback, events_rx, feedback, ended_tx,
    ));
    events_tx
}

#[allow(clippy::too_many_arguments)]
async fn drive<F, T, S, C>(
    mut flow: F,
    initial: Vec<SessionAction<F::Query, F::Response>>,
    transport: Arc<T>,
    selector: Arc<S>,
    mut callback: C,
    mut events_rx: mpsc::UnboundedReceiver<SessionEvent<F::Candidates>>,
    feedback: mpsc::UnboundedSender<SessionEvent<F::Candidates>>,
    ended_tx: mpsc::UnboundedSender<SessionEnded>,
) where
    F: RequestFlow,
    T: ProviderTransport<F::Query, F::Candidates> + 'static,
    S: Selector + 'static,
    C: ClientCallback<F::Response> + 'static,
{
    let request = flow.request().clone();
    tracing::debug!(%request, flow = F::KIND, "session actor started");

    let mut step = execute(
        &request, initial, &transport, &selector, &mut callback, &feedback,
    )
    .await;
    while step == Step::Continue {
        let Some(event) = events_rx.recv().await else {
            tracing::debug!(%request, "session event channel closed");
            break;
        };
        let actions = flow.handle(event);
        step = execute(
            &request, actions, &transport, &selector, &mut callback, &feedback,
        )
        .await;
    }

    let _ = ended_tx.send(SessionEnded {
        request: request.clone(),
    });
    tracing::debug!(%request, flow = F::KIND, "session actor stopped");
}

#[derive(Debug, PartialEq, Eq)]
enum Step {
    Continue,
    Finished,
}

/// Execute one batch of actions. A terminal action is always the last of
/// its batch; delivering it finishes the actor.
async fn execute<Q, Cand, R, T, S, C>(
    request: &RequestId,
    actions: Vec<SessionAction<Q, R>>,
    transport: &Arc<T>,
    selector: &Arc<S>,
    callback: &mut C,
    feedback: &mpsc::UnboundedSender<SessionEvent<Cand>>,
) -> Step
where
    Q: Send + 'static,
    Cand: Send + 'static,
    R: Send + 'static,
    T: ProviderTransport<Q, Cand> + 'static,
    S: Selector + 'static,
    C: ClientCallback<R>,
{
    for action in actions {
        match action {
            SessionAction::Invoke { service, query } => {
                spawn_invoke(request.clone(), service, query, transport, feedback);
            }
            SessionAction::Present(providers) => {
                if let Err(error) = selector.present(request, providers).await {
                    tracing::warn!(%request, %error, "chooser could not be shown");
                    let _ = feedback.send(SessionEvent::ChooserUnavailable);
                }
            }
            SessionAction::Respond(response) => {
                if let Err(error) = callback.on_response(response).await {
                    // The outcome stands; delivery failures are not retried.
                    tracing::warn!(%request, %error, "client response delivery failed");
                }
                return Step::Finished;
            }
            SessionAction::Fail(error) => {
                tracing::debug!(%request, kind = error.kind.as_str(), "request failed");
                if let Err(delivery) = callback.on_error(error).await {
                    tracing::warn!(%request, %delivery, "client error delivery failed");
                }
                return Step::Finished;
            }
        }
    }
    Step::Continue
}

fn spawn_invoke<Q, Cand, T>(
    request: RequestId,
    service: ServiceId,
    query: Q,
    transport: &Arc<T>,
    feedback: &mpsc::UnboundedSender<SessionEvent<Cand>>,
) where
    Q: Send + 'static,
    Cand: Send + 'static,
    T: ProviderTransport<Q, Cand> + 'static,
{
    let transport = Arc::clone(transport);
    let feedback = feedback.clone();
    tokio::spawn(async move {
        let reply = transport.invoke(&request, &service, query).await;
        // The actor may already be finished; a dropped reply is fine.
        let _ = feedback.send(SessionEvent::ProviderReply { service, reply });
    });
}
