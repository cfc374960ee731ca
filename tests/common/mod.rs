//! In-memory backend for driving the binding without a node.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use alloy::dyn_abi::DynSolValue;
use alloy::primitives::{Address, Bytes, LogData, Selector, TxHash, B256, U256};
use alloy::rpc::types::{BlockId, Filter, Log, TransactionRequest};
use async_trait::async_trait;
use parking_lot::Mutex;
use testimonium_client::error::BackendError;
use testimonium_client::ethereum::abi::AbiGateway;
use testimonium_client::ethereum::provider::{Backend, LogSubscription, SubscriptionFeed};
use testimonium_client::testimonium::{Testimonium, TESTIMONIUM_ABI};

pub const RELAY: Address = Address::repeat_byte(0x42);

#[derive(Default)]
pub struct MockBackend {
    responses: Mutex<HashMap<Selector, Result<Bytes, BackendError>>>,
    calls: Mutex<Vec<(TransactionRequest, BlockId)>>,
    sent: Mutex<Vec<TransactionRequest>>,
    send_error: Mutex<Option<BackendError>>,
    history: Mutex<Vec<Log>>,
    filter_error: Mutex<Option<BackendError>>,
    filters: Mutex<Vec<Filter>>,
    subscribe_error: Mutex<Option<BackendError>>,
    feeds: Mutex<Vec<SubscriptionFeed>>,
    subscriptions: AtomicUsize,
    unsubscribes: Arc<AtomicUsize>,
    head: Mutex<u64>,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Answer calls to `method` with `outputs` ABI-encoded.
    pub fn respond(&self, method: &str, outputs: Vec<DynSolValue>) {
        let selector = gateway().selector(method).unwrap();
        let data = DynSolValue::Tuple(outputs).abi_encode_params();
        self.responses.lock().insert(selector, Ok(data.into()));
    }

    /// Answer calls carrying `selector`, for interfaces other than the relay's.
    pub fn respond_to(&self, selector: Selector, outputs: Vec<DynSolValue>) {
        let data = DynSolValue::Tuple(outputs).abi_encode_params();
        self.responses.lock().insert(selector, Ok(data.into()));
    }

    pub fn respond_raw(&self, method: &str, data: Vec<u8>) {
        let selector = gateway().selector(method).unwrap();
        self.responses.lock().insert(selector, Ok(data.into()));
    }

    pub fn fail_call(&self, method: &str, error: BackendError) {
        let selector = gateway().selector(method).unwrap();
        self.responses.lock().insert(selector, Err(error));
    }

    pub fn fail_send(&self, error: BackendError) {
        *self.send_error.lock() = Some(error);
    }

    pub fn set_history(&self, logs: Vec<Log>) {
        *self.history.lock() = logs;
    }

    pub fn fail_filter(&self, error: BackendError) {
        *self.filter_error.lock() = Some(error);
    }

    pub fn fail_subscribe(&self, error: BackendError) {
        *self.subscribe_error.lock() = Some(error);
    }

    /// Producer side of the most recently opened subscription.
    pub fn take_feed(&self) -> SubscriptionFeed {
        self.feeds.lock().pop().expect("no open subscription")
    }

    pub fn calls(&self) -> Vec<(TransactionRequest, BlockId)> {
        self.calls.lock().clone()
    }

    pub fn sent(&self) -> Vec<TransactionRequest> {
        self.sent.lock().clone()
    }

    pub fn filters(&self) -> Vec<Filter> {
        self.filters.lock().clone()
    }

    pub fn subscriptions(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }

    pub fn unsubscribes(&self) -> usize {
        self.unsubscribes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn call(
        &self,
        request: TransactionRequest,
        block: BlockId,
    ) -> Result<Bytes, BackendError> {
        let input = request.input.input().cloned().unwrap_or_default();
        self.calls.lock().push((request, block));

        if input.len() < 4 {
            return Err(BackendError::Rpc("missing selector".into()));
        }
        let selector = Selector::from_slice(&input[..4]);
        self.responses
            .lock()
            .get(&selector)
            .cloned()
            .unwrap_or_else(|| Err(BackendError::Rpc("no canned response".into())))
    }

    async fn send_transaction(&self, request: TransactionRequest) -> Result<TxHash, BackendError> {
        if let Some(error) = self.send_error.lock().clone() {
            return Err(error);
        }
        let mut sent = self.sent.lock();
        sent.push(request);
        Ok(B256::with_last_byte(sent.len() as u8))
    }

    async fn filter_logs(&self, filter: &Filter) -> Result<Vec<Log>, BackendError> {
        self.filters.lock().push(filter.clone());
        if let Some(error) = self.filter_error.lock().clone() {
            return Err(error);
        }
        Ok(self.history.lock().clone())
    }

    async fn subscribe_logs(&self, _filter: &Filter) -> Result<LogSubscription, BackendError> {
        if let Some(error) = self.subscribe_error.lock().clone() {
            return Err(error);
        }
        self.subscriptions.fetch_add(1, Ordering::SeqCst);

        let (feed, subscription) = LogSubscription::channel(16);
        let counter = self.unsubscribes.clone();
        self.feeds.lock().push(feed);
        Ok(subscription.on_unsubscribe(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
    }

    async fn block_number(&self) -> Result<u64, BackendError> {
        Ok(*self.head.lock())
    }

    fn endpoint_name(&self) -> String {
        "mock".to_string()
    }
}

pub fn gateway() -> AbiGateway {
    AbiGateway::parse(TESTIMONIUM_ABI).unwrap()
}

pub fn relay(mock: &Arc<MockBackend>) -> Testimonium {
    Testimonium::new(RELAY, mock.clone()).unwrap()
}

pub fn word(value: B256) -> DynSolValue {
    DynSolValue::FixedBytes(value, 32)
}

/// A `SubmitBlockHeader` log for block hash `0xNN..NN`, emitted in block
/// `block` at position `index`.
pub fn submit_log(tag: u8, nonce: u64, block: u64, index: u64) -> Log {
    let fields = vec![
        word(B256::repeat_byte(tag)),
        word(B256::repeat_byte(tag.wrapping_add(1))),
        DynSolValue::Uint(U256::from(nonce), 256),
        word(B256::repeat_byte(tag.wrapping_sub(1))),
    ];
    log_with_data(DynSolValue::Tuple(fields).abi_encode_params(), block, index)
}

/// A log carrying the event topic but a body that cannot be decoded.
pub fn garbled_log(block: u64, index: u64) -> Log {
    log_with_data(vec![0xde, 0xad], block, index)
}

fn log_with_data(data: Vec<u8>, block: u64, index: u64) -> Log {
    let topic = gateway().event_topic("SubmitBlockHeader").unwrap();
    Log {
        inner: alloy::primitives::Log {
            address: RELAY,
            data: LogData::new_unchecked(vec![topic], data.into()),
        },
        block_hash: Some(B256::with_last_byte(block as u8)),
        block_number: Some(block),
        transaction_hash: Some(B256::repeat_byte(0xEE)),
        log_index: Some(index),
        ..Default::default()
    }
}
