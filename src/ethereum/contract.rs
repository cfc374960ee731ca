use std::future::Future;
use std::sync::Arc;

use alloy::dyn_abi::DynSolValue;
use alloy::network::TransactionBuilder;
use alloy::primitives::{Address, TxHash, B256, U256};
use alloy::rpc::types::{BlockId, Filter, Log, TransactionRequest};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{BackendError, BindError, BindResult};
use crate::ethereum::abi::{AbiGateway, Tokens};
use crate::ethereum::event::ContractEvent;
use crate::ethereum::provider::{Backend, LogSubscription};

/// Options for read-only calls.
#[derive(Debug, Clone)]
pub struct CallOpts {
    /// Optional caller identity (`msg.sender` for the call).
    pub from: Option<Address>,
    /// Block to execute against.
    pub block: BlockId,
    pub cancel: CancellationToken,
}

impl Default for CallOpts {
    fn default() -> Self {
        Self {
            from: None,
            block: BlockId::latest(),
            cancel: CancellationToken::new(),
        }
    }
}

/// Options for state-mutating transactions.
///
/// Signing happens in the backend (a wallet-filled provider); `from` picks
/// the identity and any gas/nonce field left `None` is filled by the node.
#[derive(Debug, Clone, Default)]
pub struct TransactOpts {
    pub from: Option<Address>,
    pub value: U256,
    pub gas_limit: Option<u64>,
    pub gas_price: Option<u128>,
    pub max_fee_per_gas: Option<u128>,
    pub max_priority_fee_per_gas: Option<u128>,
    pub nonce: Option<u64>,
    pub cancel: CancellationToken,
}

/// Options for historical event queries.
#[derive(Debug, Clone, Default)]
pub struct FilterOpts {
    pub start: u64,
    /// Last block to query. `None` follows the chain: the cursor continues
    /// with live events after the backlog.
    pub end: Option<u64>,
    pub cancel: CancellationToken,
}

/// Options for live event subscriptions.
#[derive(Debug, Clone, Default)]
pub struct WatchOpts {
    pub start: Option<u64>,
    pub cancel: CancellationToken,
}

/// Runs `fut` unless `cancel` fires first.
pub(crate) async fn cancellable<F: Future>(
    cancel: &CancellationToken,
    fut: F,
) -> BindResult<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(BindError::Cancelled),
        out = fut => Ok(out),
    }
}

/// A contract interface bound to an address and a backend.
///
/// Immutable after construction and cheap to share behind an `Arc`;
/// rebinding to another address or interface means building a new one.
pub struct BoundContract {
    address: Address,
    abi: AbiGateway,
    backend: Arc<dyn Backend>,
}

impl std::fmt::Debug for BoundContract {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundContract")
            .field("address", &self.address)
            .field("endpoint", &self.backend.endpoint_name())
            .finish()
    }
}

impl BoundContract {
    pub fn new(address: Address, abi: AbiGateway, backend: Arc<dyn Backend>) -> Self {
        Self {
            address,
            abi,
            backend,
        }
    }

    /// Parse `abi_json` and bind it to `address`.
    pub fn bind(address: Address, abi_json: &str, backend: Arc<dyn Backend>) -> BindResult<Self> {
        let abi = AbiGateway::parse(abi_json)?;
        Ok(Self::new(address, abi, backend))
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn abi(&self) -> &AbiGateway {
        &self.abi
    }

    pub fn event_topic(&self, event: &str) -> BindResult<B256> {
        self.abi.event_topic(event)
    }

    /// Invoke a read-only method and decode its declared outputs.
    pub async fn call(
        &self,
        opts: &CallOpts,
        method: &str,
        args: &[DynSolValue],
    ) -> BindResult<Vec<DynSolValue>> {
        let input = self.abi.encode(method, args)?;

        let mut request = TransactionRequest::default()
            .with_to(self.address)
            .with_input(input);
        if let Some(from) = opts.from {
            request = request.with_from(from);
        }

        debug!(method, contract = %self.address, "Calling contract");
        let output = cancellable(&opts.cancel, self.backend.call(request, opts.block))
            .await?
            .map_err(|e| match e {
                BackendError::Reverted(reason) => BindError::CallReverted {
                    method: method.to_string(),
                    reason,
                },
                other => BindError::Call {
                    method: method.to_string(),
                    source: other,
                },
            })?;

        self.abi.decode_result(method, args.len(), &output)
    }

    /// Encode and submit a state-mutating method call. Returns once the
    /// backend accepts the transaction; confirmation is the caller's concern.
    pub async fn transact(
        &self,
        opts: &TransactOpts,
        method: &str,
        args: &[DynSolValue],
    ) -> BindResult<TxHash> {
        let input = self.abi.encode(method, args)?;
        self.submit(opts, input, method).await
    }

    /// Plain value transfer to the contract (empty calldata, runs the fallback).
    pub async fn transfer(&self, opts: &TransactOpts) -> BindResult<TxHash> {
        self.submit(opts, Default::default(), "transfer").await
    }

    async fn submit(
        &self,
        opts: &TransactOpts,
        input: alloy::primitives::Bytes,
        label: &str,
    ) -> BindResult<TxHash> {
        let mut request = TransactionRequest::default()
            .with_to(self.address)
            .with_input(input)
            .with_value(opts.value);

        if let Some(from) = opts.from {
            request = request.with_from(from);
        }
        if let Some(gas) = opts.gas_limit {
            request = request.with_gas_limit(gas);
        }
        if let Some(price) = opts.gas_price {
            request = request.with_gas_price(price);
        }
        if let Some(cap) = opts.max_fee_per_gas {
            request = request.with_max_fee_per_gas(cap);
        }
        if let Some(tip) = opts.max_priority_fee_per_gas {
            request = request.with_max_priority_fee_per_gas(tip);
        }
        if let Some(nonce) = opts.nonce {
            request = request.with_nonce(nonce);
        }

        let hash = cancellable(&opts.cancel, self.backend.send_transaction(request))
            .await?
            .map_err(BindError::Submission)?;

        info!(method = label, contract = %self.address, tx = %hash, "Transaction submitted");
        Ok(hash)
    }

    fn event_filter(&self, event: &str) -> BindResult<Filter> {
        let topic = self.abi.event_topic(event)?;
        Ok(Filter::new().address(self.address).event_signature(topic))
    }

    /// One-shot historical query for `event` logs in `opts.start..=opts.end`
    /// (or up to the latest block).
    pub async fn filter_logs(&self, opts: &FilterOpts, event: &str) -> BindResult<Vec<Log>> {
        let mut filter = self.event_filter(event)?.from_block(opts.start);
        if let Some(end) = opts.end {
            filter = filter.to_block(end);
        }

        let logs = cancellable(&opts.cancel, self.backend.filter_logs(&filter))
            .await?
            .map_err(BindError::Filter)?;

        debug!(event, from = opts.start, count = logs.len(), "Fetched historical logs");
        Ok(logs)
    }

    /// Open a live subscription for `event` logs.
    pub async fn watch_logs(&self, opts: &WatchOpts, event: &str) -> BindResult<LogSubscription> {
        let mut filter = self.event_filter(event)?;
        if let Some(start) = opts.start {
            filter = filter.from_block(start);
        }

        let subscription = cancellable(&opts.cancel, self.backend.subscribe_logs(&filter))
            .await?
            .map_err(BindError::Subscription)?;

        debug!(event, endpoint = %self.backend.endpoint_name(), "Opened log subscription");
        Ok(subscription)
    }

    /// Decode a raw log into the event's fields in declaration order.
    pub fn unpack_log(&self, event: &str, log: &Log) -> BindResult<Vec<DynSolValue>> {
        self.abi.decode_log(event, log)
    }

    /// Decode a raw log into a typed event, keeping the log as provenance.
    pub fn parse_event<E: ContractEvent>(&self, log: Log) -> BindResult<E> {
        let values = self.unpack_log(E::NAME, &log)?;
        E::from_tokens(Tokens::new(E::NAME, values), log)
    }
}
