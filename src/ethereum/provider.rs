use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use alloy::network::EthereumWallet;
use alloy::primitives::{Bytes, TxHash};
use alloy::providers::{Provider, ProviderBuilder, WsConnect};
use alloy::pubsub::PubSubFrontend;
use alloy::rpc::types::{BlockId, Filter, Log, TransactionRequest};
use alloy::signers::local::PrivateKeySigner;
use alloy::transports::http::{Client, Http};
use alloy::transports::Transport as RpcTransport;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::NetworkConfig;
use crate::error::BackendError;

/// Capability set a bound contract needs from the network.
///
/// Implementations never retry and never decode; they move bytes and raw
/// log records and report failures as [`BackendError`].
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Execute a read-only call against the given block.
    async fn call(&self, request: TransactionRequest, block: BlockId)
        -> Result<Bytes, BackendError>;

    /// Submit a transaction and return as soon as the node accepts it.
    async fn send_transaction(&self, request: TransactionRequest) -> Result<TxHash, BackendError>;

    /// One-shot historical log query.
    async fn filter_logs(&self, filter: &Filter) -> Result<Vec<Log>, BackendError>;

    /// Open a live log subscription.
    async fn subscribe_logs(&self, filter: &Filter) -> Result<LogSubscription, BackendError>;

    /// Number of the latest block the node knows about.
    async fn block_number(&self) -> Result<u64, BackendError>;

    fn endpoint_name(&self) -> String;
}

/// Releases a subscription's transport resources.
///
/// Cloneable and safe to trigger from several places; the release runs once.
#[derive(Clone)]
pub struct Unsubscriber {
    token: CancellationToken,
    hook: Arc<Mutex<Option<Box<dyn FnOnce() + Send>>>>,
}

impl Unsubscriber {
    fn new(token: CancellationToken) -> Self {
        Self {
            token,
            hook: Arc::new(Mutex::new(None)),
        }
    }

    pub fn unsubscribe(&self) {
        let hook = self.hook.lock().take();
        self.token.cancel();
        if let Some(hook) = hook {
            hook();
        }
    }

    pub fn is_unsubscribed(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl fmt::Debug for Unsubscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unsubscriber")
            .field("unsubscribed", &self.is_unsubscribed())
            .finish()
    }
}

/// Consumer side of a live log subscription: a buffered delivery channel,
/// a single-assignment error slot and an unsubscribe handle.
#[derive(Debug)]
pub struct LogSubscription {
    logs: mpsc::Receiver<Log>,
    error: Option<oneshot::Receiver<BackendError>>,
    unsubscriber: Unsubscriber,
}

/// Producer side of a [`LogSubscription`], held by the backend.
#[derive(Debug)]
pub struct SubscriptionFeed {
    logs: mpsc::Sender<Log>,
    error: Option<oneshot::Sender<BackendError>>,
    closed: CancellationToken,
}

impl LogSubscription {
    /// Create a connected feed/subscription pair with `buffer` slots of
    /// delivery capacity.
    pub fn channel(buffer: usize) -> (SubscriptionFeed, LogSubscription) {
        let (log_tx, log_rx) = mpsc::channel(buffer.max(1));
        let (err_tx, err_rx) = oneshot::channel();
        let closed = CancellationToken::new();

        let feed = SubscriptionFeed {
            logs: log_tx,
            error: Some(err_tx),
            closed: closed.clone(),
        };
        let subscription = LogSubscription {
            logs: log_rx,
            error: Some(err_rx),
            unsubscriber: Unsubscriber::new(closed),
        };
        (feed, subscription)
    }

    /// Run `hook` once, the first time this subscription is released.
    pub fn on_unsubscribe(self, hook: impl FnOnce() + Send + 'static) -> Self {
        *self.unsubscriber.hook.lock() = Some(Box::new(hook));
        self
    }

    pub async fn recv(&mut self) -> Option<Log> {
        self.logs.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Log> {
        self.logs.try_recv().ok()
    }

    /// Resolves when the producer reports an error (`Some`) or goes away
    /// without one (`None`). After resolving once it never resolves again.
    pub async fn failed(&mut self) -> Option<BackendError> {
        wait_error(&mut self.error).await
    }

    /// Wait for the next record or for the subscription to end.
    ///
    /// An [`SubscriptionItem::Ended`] may be reported while records are
    /// still buffered; drain them with [`try_recv`](Self::try_recv).
    pub async fn next_item(&mut self) -> SubscriptionItem {
        let received = tokio::select! {
            log = self.logs.recv() => Ok(log),
            err = wait_error(&mut self.error) => Err(err),
        };

        match received {
            Ok(Some(log)) => SubscriptionItem::Log(log),
            Ok(None) if self.error.is_none() => SubscriptionItem::Ended(None),
            // Channel closed: the producer is gone, so its error slot is settled.
            Ok(None) => SubscriptionItem::Ended(wait_error(&mut self.error).await),
            Err(err) => SubscriptionItem::Ended(err),
        }
    }

    pub fn unsubscriber(&self) -> Unsubscriber {
        self.unsubscriber.clone()
    }

    pub fn unsubscribe(&self) {
        self.unsubscriber.unsubscribe();
    }
}

async fn wait_error(slot: &mut Option<oneshot::Receiver<BackendError>>) -> Option<BackendError> {
    match slot.as_mut() {
        Some(rx) => {
            let result = rx.await.ok();
            *slot = None;
            result
        }
        None => std::future::pending().await,
    }
}

/// What a live subscription produced next.
#[derive(Debug)]
pub enum SubscriptionItem {
    Log(Log),
    /// The producer finished: with its error, or `None` for a clean close.
    Ended(Option<BackendError>),
}

impl SubscriptionFeed {
    /// Push a record to the consumer, waiting for buffer space. Returns
    /// `false` once the consumer is gone or has unsubscribed.
    pub async fn deliver(&self, log: Log) -> bool {
        if self.closed.is_cancelled() {
            return false;
        }
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => false,
            sent = self.logs.send(log) => sent.is_ok(),
        }
    }

    /// Non-blocking push; `false` if the buffer is full or the consumer left.
    pub fn try_deliver(&self, log: Log) -> bool {
        !self.closed.is_cancelled() && self.logs.try_send(log).is_ok()
    }

    /// Record the terminal error. Only the first call has any effect.
    pub fn fail(&mut self, error: BackendError) {
        if let Some(tx) = self.error.take() {
            let _ = tx.send(error);
        }
    }

    pub async fn unsubscribed(&self) {
        self.closed.cancelled().await
    }

    pub fn is_unsubscribed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

/// [`Backend`] over an alloy provider.
pub struct AlloyBackend<P, T> {
    provider: Arc<P>,
    endpoint: String,
    buffer_size: usize,
    _transport: PhantomData<fn() -> T>,
}

impl<P, T> AlloyBackend<P, T>
where
    P: Provider<T> + 'static,
    T: RpcTransport + Clone,
{
    pub fn new(provider: P, endpoint: impl Into<String>, buffer_size: usize) -> Self {
        Self {
            provider: Arc::new(provider),
            endpoint: endpoint.into(),
            buffer_size,
            _transport: PhantomData,
        }
    }
}

/// Sorts a transport error into a revert or a plain RPC failure.
fn classify(error: impl fmt::Display) -> BackendError {
    let message = error.to_string();
    if message.contains("execution reverted") || message.contains("revert") {
        BackendError::Reverted(message)
    } else {
        BackendError::Rpc(message)
    }
}

#[async_trait]
impl<P, T> Backend for AlloyBackend<P, T>
where
    P: Provider<T> + 'static,
    T: RpcTransport + Clone,
{
    async fn call(
        &self,
        request: TransactionRequest,
        block: BlockId,
    ) -> Result<Bytes, BackendError> {
        self.provider
            .call(&request)
            .block(block)
            .await
            .map_err(classify)
    }

    async fn send_transaction(&self, request: TransactionRequest) -> Result<TxHash, BackendError> {
        let pending = self
            .provider
            .send_transaction(request)
            .await
            .map_err(classify)?;
        Ok(*pending.tx_hash())
    }

    async fn filter_logs(&self, filter: &Filter) -> Result<Vec<Log>, BackendError> {
        self.provider
            .get_logs(filter)
            .await
            .map_err(|e| BackendError::Rpc(e.to_string()))
    }

    async fn subscribe_logs(&self, filter: &Filter) -> Result<LogSubscription, BackendError> {
        if !is_websocket(&self.endpoint) {
            return Err(BackendError::Unsupported(
                "log subscriptions need a ws:// or wss:// endpoint",
            ));
        }

        let subscription = self
            .provider
            .subscribe_logs(filter)
            .await
            .map_err(|e| BackendError::Rpc(e.to_string()))?;

        let (feed, log_subscription) = LogSubscription::channel(self.buffer_size);
        let id = *subscription.local_id();
        let provider = self.provider.clone();
        let endpoint = self.endpoint.clone();

        let source = futures::stream::unfold(subscription, |mut subscription| async move {
            let item = subscription.recv().await;
            Some((item, subscription))
        });
        let release = move || {
            if let Err(e) = provider.root().unsubscribe(id) {
                debug!(error = %e, "eth_unsubscribe failed");
            }
        };
        tokio::spawn(forward_logs(source, feed, endpoint, release));

        Ok(log_subscription)
    }

    async fn block_number(&self) -> Result<u64, BackendError> {
        self.provider
            .get_block_number()
            .await
            .map_err(|e| BackendError::Rpc(e.to_string()))
    }

    fn endpoint_name(&self) -> String {
        self.endpoint.clone()
    }
}

/// Pump records from a node subscription into `feed` until either side
/// ends, then run `release` to drop the node-side subscription.
///
/// Records the node dropped because the consumer fell behind end the
/// subscription with an error rather than leaving a silent gap.
async fn forward_logs<S>(
    source: S,
    mut feed: SubscriptionFeed,
    endpoint: String,
    release: impl FnOnce(),
) where
    S: Stream<Item = Result<Log, RecvError>>,
{
    let mut source = std::pin::pin!(source);
    loop {
        let next = tokio::select! {
            biased;
            _ = feed.unsubscribed() => None,
            item = source.next() => Some(item),
        };

        match next {
            None => {
                debug!(endpoint = %endpoint, "Log subscription released");
                break;
            }
            Some(Some(Ok(log))) => {
                if !feed.deliver(log).await {
                    debug!(endpoint = %endpoint, "Log subscription consumer gone");
                    break;
                }
            }
            Some(Some(Err(RecvError::Lagged(missed)))) => {
                warn!(endpoint = %endpoint, missed, "Log subscription lagged");
                feed.fail(BackendError::Rpc(format!(
                    "subscription lagged, {} logs dropped",
                    missed
                )));
                break;
            }
            Some(Some(Err(RecvError::Closed))) | Some(None) => {
                warn!(endpoint = %endpoint, "Log subscription stream closed by node");
                feed.fail(BackendError::Closed);
                break;
            }
        }
    }
    release();
}

fn is_websocket(url: &str) -> bool {
    url.starts_with("ws://") || url.starts_with("wss://")
}

/// Build a backend for a configured network.
///
/// WebSocket endpoints support live subscriptions; HTTP endpoints only
/// serve calls, transactions and historical queries. When a signer is
/// given, transactions are filled and signed locally.
pub async fn connect(
    network: &NetworkConfig,
    buffer_size: usize,
    signer: Option<PrivateKeySigner>,
) -> Result<Arc<dyn Backend>> {
    let url = network.rpc_url.clone();

    let backend: Arc<dyn Backend> = match (is_websocket(&url), signer) {
        (true, None) => {
            let provider = ProviderBuilder::new()
                .on_ws(WsConnect::new(url.clone()))
                .await
                .map_err(|e| anyhow!("Failed to connect to WebSocket endpoint {}: {}", url, e))?;
            Arc::new(AlloyBackend::<_, PubSubFrontend>::new(provider, url, buffer_size))
        }
        (true, Some(signer)) => {
            let provider = ProviderBuilder::new()
                .with_recommended_fillers()
                .wallet(EthereumWallet::from(signer))
                .on_ws(WsConnect::new(url.clone()))
                .await
                .map_err(|e| anyhow!("Failed to connect to WebSocket endpoint {}: {}", url, e))?;
            Arc::new(AlloyBackend::<_, PubSubFrontend>::new(provider, url, buffer_size))
        }
        (false, None) => {
            let provider = ProviderBuilder::new().on_http(
                url.parse()
                    .map_err(|e| anyhow!("Invalid RPC URL '{}': {}", url, e))?,
            );
            Arc::new(AlloyBackend::<_, Http<Client>>::new(provider, url, buffer_size))
        }
        (false, Some(signer)) => {
            let provider = ProviderBuilder::new()
                .with_recommended_fillers()
                .wallet(EthereumWallet::from(signer))
                .on_http(
                    url.parse()
                        .map_err(|e| anyhow!("Invalid RPC URL '{}': {}", url, e))?,
                );
            Arc::new(AlloyBackend::<_, Http<Client>>::new(provider, url, buffer_size))
        }
    };

    debug!(endpoint = %backend.endpoint_name(), chain_id = network.chain_id, "Connected backend");
    Ok(backend)
}
