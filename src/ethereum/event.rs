//! Typed event access: a merged historical/live cursor and a push-mode
//! dispatcher.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use alloy::rpc::types::Log;
use futures::Stream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{BackendError, BindError, BindResult};
use crate::ethereum::abi::Tokens;
use crate::ethereum::contract::{BoundContract, FilterOpts, WatchOpts};
use crate::ethereum::provider::{LogSubscription, SubscriptionItem, Unsubscriber};

/// A contract event with a typed representation.
///
/// Implementors carry the raw log they were decoded from so callers can
/// deduplicate or audit by block hash and log index.
pub trait ContractEvent: Sized + Send + 'static {
    /// Event name as declared in the ABI.
    const NAME: &'static str;

    /// Build the event from its decoded fields (declaration order) and the raw log.
    fn from_tokens(tokens: Tokens, raw: Log) -> BindResult<Self>;

    fn raw(&self) -> &Log;
}

/// Forward-only cursor over every `E` from a historical start block through
/// the live head of the chain.
///
/// The historical backlog is fetched and decoded when the cursor opens; the
/// live subscription is opened alongside it and buffers new records from
/// that moment, so nothing emitted between the two is missed. A record may
/// show up in both; the cursor does not deduplicate.
///
/// [`next`](Self::next) never fails. After it returns `false`, check
/// [`error`](Self::error) to tell exhaustion or cancellation (`None`) from a
/// failure. Call [`close`](Self::close) to release the subscription; dropping
/// the cursor closes it too.
pub struct EventIterator<E: ContractEvent> {
    contract: Arc<BoundContract>,
    backlog: VecDeque<E>,
    live: Option<LogSubscription>,
    unsubscriber: Option<Unsubscriber>,
    cancel: CancellationToken,
    event: Option<E>,
    // Subscription failure held back until buffered records are drained.
    pending: Option<BindError>,
    fail: Option<BindError>,
    done: bool,
}

impl<E: ContractEvent> EventIterator<E> {
    /// Issue the historical query and open the live subscription.
    ///
    /// With a bounded `opts.end` no subscription is opened and the cursor
    /// ends after the backlog.
    pub async fn open(contract: Arc<BoundContract>, opts: &FilterOpts) -> BindResult<Self> {
        let (history, live) = match opts.end {
            Some(_) => (contract.filter_logs(opts, E::NAME).await, None),
            None => {
                let watch = WatchOpts {
                    start: None,
                    cancel: opts.cancel.clone(),
                };
                let (history, live) = tokio::join!(
                    contract.filter_logs(opts, E::NAME),
                    contract.watch_logs(&watch, E::NAME)
                );
                (history, Some(live))
            }
        };

        let logs = match history {
            Ok(logs) => logs,
            Err(e) => {
                if let Some(Ok(subscription)) = &live {
                    subscription.unsubscribe();
                }
                return Err(e);
            }
        };
        let live = live.transpose()?;
        let unsubscriber = live.as_ref().map(LogSubscription::unsubscriber);
        let release = || {
            if let Some(unsubscriber) = &unsubscriber {
                unsubscriber.unsubscribe();
            }
        };

        let mut backlog = VecDeque::with_capacity(logs.len());
        for log in logs {
            match contract.parse_event::<E>(log) {
                Ok(event) => backlog.push_back(event),
                Err(e) => {
                    release();
                    return Err(e);
                }
            }
        }

        debug!(
            event = E::NAME,
            backlog = backlog.len(),
            live = live.is_some(),
            "Opened event iterator"
        );

        Ok(Self {
            contract,
            backlog,
            live,
            unsubscriber,
            cancel: opts.cancel.clone(),
            event: None,
            pending: None,
            fail: None,
            done: false,
        })
    }

    /// Advance to the next event. Returns `false` when there are no more
    /// events, the cursor failed, or the cancellation signal fired.
    ///
    /// Waits for live records once the backlog is empty. When the
    /// subscription fails, records it had already buffered are still
    /// yielded before the failure becomes the terminal error.
    pub async fn next(&mut self) -> bool {
        loop {
            if self.fail.is_some() {
                return false;
            }

            if let Some(event) = self.backlog.pop_front() {
                self.event = Some(event);
                return true;
            }

            let Some(live) = self.live.as_mut() else {
                self.done = true;
                return false;
            };

            if self.cancel.is_cancelled() {
                return false;
            }

            if self.done {
                return match live.try_recv() {
                    Some(log) => self.accept(log),
                    None => {
                        self.fail = self.pending.take();
                        false
                    }
                };
            }

            let step = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                item = live.next_item() => Some(item),
            };

            match step {
                Some(SubscriptionItem::Log(log)) => return self.accept(log),
                Some(SubscriptionItem::Ended(err)) => {
                    // Drain what the subscription already buffered, then report.
                    self.done = true;
                    self.pending = err.map(BindError::Subscription);
                }
                None => return false,
            }
        }
    }

    fn accept(&mut self, log: Log) -> bool {
        match self.contract.parse_event::<E>(log) {
            Ok(event) => {
                self.event = Some(event);
                true
            }
            Err(e) => {
                warn!(event = E::NAME, error = %e, "Failed to decode live event");
                self.event = None;
                self.fail = Some(e);
                false
            }
        }
    }

    /// The event produced by the last successful [`next`](Self::next).
    pub fn event(&self) -> Option<&E> {
        self.event.as_ref()
    }

    pub fn take_event(&mut self) -> Option<E> {
        self.event.take()
    }

    /// Terminal error, if iteration stopped because of a failure.
    pub fn error(&self) -> Option<&BindError> {
        self.fail.as_ref()
    }

    /// Release the live subscription. Idempotent.
    ///
    /// Later calls to [`next`](Self::next) only yield what was already
    /// fetched or buffered and never wait.
    pub fn close(&mut self) {
        self.done = true;
        if let Some(unsubscriber) = &self.unsubscriber {
            if !unsubscriber.is_unsubscribed() {
                debug!(event = E::NAME, "Closing event iterator");
            }
            unsubscriber.unsubscribe();
        }
    }

    /// Adapt the cursor into a stream; a terminal error is yielded as the
    /// final item.
    pub fn into_stream(self) -> impl Stream<Item = BindResult<E>> {
        futures::stream::unfold(Some(self), |state| async move {
            let mut iter = state?;
            if iter.next().await {
                let event = iter.take_event()?;
                Some((Ok(event), Some(iter)))
            } else {
                let err = iter.fail.clone()?;
                Some((Err(err), None))
            }
        })
    }
}

impl<E: ContractEvent> Drop for EventIterator<E> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<E: ContractEvent> fmt::Debug for EventIterator<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventIterator")
            .field("event", &E::NAME)
            .field("backlog", &self.backlog.len())
            .field("live", &self.live.is_some())
            .field("done", &self.done)
            .field("fail", &self.fail)
            .finish()
    }
}

/// Handle to a running watch. Dropping it stops the watch.
#[derive(Debug)]
pub struct WatchHandle {
    stop: CancellationToken,
    task: Option<JoinHandle<BindResult<()>>>,
}

impl WatchHandle {
    /// Ask the watch to stop. It exits without reporting an error.
    pub fn unsubscribe(&self) {
        self.stop.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Wait for the watch to end and return why it ended: `Ok` for a
    /// requested stop or a cleanly closed stream, `Err` for a decode or
    /// subscription failure.
    pub async fn wait(mut self) -> BindResult<()> {
        let Some(task) = self.task.take() else {
            return Ok(());
        };
        match task.await {
            Ok(result) => result,
            Err(e) => Err(BindError::Subscription(BackendError::Rpc(format!(
                "watch task aborted: {}",
                e
            )))),
        }
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// Subscribe to `E` and forward each decoded event into `sink` from a
/// background task.
///
/// The task stops on the first decode failure or subscription error and
/// reports it through [`WatchHandle::wait`]; it stops quietly when
/// cancelled or when the sink is dropped.
pub async fn watch_events<E: ContractEvent>(
    contract: Arc<BoundContract>,
    opts: &WatchOpts,
    sink: mpsc::Sender<E>,
) -> BindResult<WatchHandle> {
    let subscription = contract.watch_logs(opts, E::NAME).await?;
    let stop = opts.cancel.child_token();
    let task = tokio::spawn(dispatch(contract, subscription, sink, stop.clone()));

    Ok(WatchHandle {
        stop,
        task: Some(task),
    })
}

enum Delivery {
    Sent,
    SinkClosed,
    Failed(BackendError),
    Stopped,
}

async fn dispatch<E: ContractEvent>(
    contract: Arc<BoundContract>,
    mut subscription: LogSubscription,
    sink: mpsc::Sender<E>,
    stop: CancellationToken,
) -> BindResult<()> {
    // Set once the producer went away without an error; records it had
    // already buffered are still forwarded.
    let mut ended = false;

    let result = loop {
        let log = if stop.is_cancelled() {
            break Ok(());
        } else if ended {
            match subscription.try_recv() {
                Some(log) => log,
                None => break Ok(()),
            }
        } else {
            let item = tokio::select! {
                biased;
                _ = stop.cancelled() => None,
                item = subscription.next_item() => Some(item),
            };
            match item {
                Some(SubscriptionItem::Log(log)) => log,
                Some(SubscriptionItem::Ended(Some(e))) => break Err(BindError::Subscription(e)),
                Some(SubscriptionItem::Ended(None)) => {
                    ended = true;
                    continue;
                }
                None => break Ok(()),
            }
        };

        let event = match contract.parse_event::<E>(log) {
            Ok(event) => event,
            Err(e) => break Err(e),
        };

        let delivery = deliver(&sink, event, &mut subscription, &stop, &mut ended).await;
        match delivery {
            Delivery::Sent => {}
            Delivery::SinkClosed => {
                debug!(event = E::NAME, "Watch sink dropped");
                break Ok(());
            }
            Delivery::Stopped => break Ok(()),
            Delivery::Failed(e) => break Err(BindError::Subscription(e)),
        }
    };

    subscription.unsubscribe();
    match &result {
        Ok(()) => debug!(event = E::NAME, "Watch stopped"),
        Err(e) => warn!(event = E::NAME, error = %e, "Watch failed"),
    }
    result
}

/// Hand `event` to the sink, racing the subscription failing and the stop
/// signal. A clean close while waiting does not drop the event.
async fn deliver<E>(
    sink: &mpsc::Sender<E>,
    event: E,
    subscription: &mut LogSubscription,
    stop: &CancellationToken,
    ended: &mut bool,
) -> Delivery {
    loop {
        let outcome = if *ended {
            tokio::select! {
                biased;
                _ = stop.cancelled() => Err(None),
                permit = sink.reserve() => Ok(permit),
            }
        } else {
            tokio::select! {
                biased;
                _ = stop.cancelled() => Err(None),
                permit = sink.reserve() => Ok(permit),
                err = subscription.failed() => Err(Some(err)),
            }
        };

        match outcome {
            Ok(Ok(permit)) => {
                permit.send(event);
                return Delivery::Sent;
            }
            Ok(Err(_)) => return Delivery::SinkClosed,
            Err(Some(Some(e))) => return Delivery::Failed(e),
            Err(Some(None)) => *ended = true,
            Err(None) => return Delivery::Stopped,
        }
    }
}
