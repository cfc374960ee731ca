//! Binding for the Testimonium relay contract.
//!
//! Testimonium stores Ethereum block headers submitted by relayers and lets
//! clients check block membership, lock state and transaction inclusion
//! against them.

use std::sync::Arc;

use alloy::dyn_abi::DynSolValue;
use alloy::primitives::{Address, Bytes, TxHash, B256, U256};
use alloy::rpc::types::Log;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::BindResult;
use crate::ethereum::abi::Tokens;
use crate::ethereum::contract::{BoundContract, CallOpts, FilterOpts, TransactOpts, WatchOpts};
use crate::ethereum::event::{ContractEvent, EventIterator, WatchHandle};
use crate::ethereum::facade::{Events, Facade, Read, Session, WithOptions, Write};
use crate::ethereum::provider::Backend;

/// JSON interface of the deployed contract.
pub const TESTIMONIUM_ABI: &str = r#"[
  {"constant":true,"inputs":[{"name":"blockHash","type":"bytes32"}],"name":"isUnlocked","outputs":[{"name":"","type":"bool"}],"payable":false,"stateMutability":"view","type":"function"},
  {"constant":true,"inputs":[{"name":"hash","type":"bytes32"}],"name":"isBlock","outputs":[{"name":"","type":"bool"}],"payable":false,"stateMutability":"view","type":"function"},
  {"constant":false,"inputs":[{"name":"blockHash","type":"bytes32"}],"name":"disputeBlock","outputs":[],"payable":false,"stateMutability":"nonpayable","type":"function"},
  {"constant":true,"inputs":[{"name":"hash","type":"bytes32"}],"name":"getBlock","outputs":[{"name":"","type":"bytes32"},{"name":"","type":"uint256"},{"name":"","type":"uint256"},{"name":"","type":"uint256"},{"name":"","type":"uint256"},{"name":"","type":"uint256"},{"name":"","type":"bytes32"}],"payable":false,"stateMutability":"view","type":"function"},
  {"constant":true,"inputs":[{"name":"txHash","type":"bytes32"},{"name":"requested","type":"bytes32"},{"name":"noOfConfirmations","type":"uint8"}],"name":"verifyTransaction","outputs":[{"name":"","type":"bool"}],"payable":false,"stateMutability":"view","type":"function"},
  {"constant":true,"inputs":[{"name":"index","type":"uint256"}],"name":"getBlockHashOfEndpoint","outputs":[{"name":"","type":"bytes32"}],"payable":false,"stateMutability":"view","type":"function"},
  {"constant":true,"inputs":[{"name":"","type":"bytes32"}],"name":"headers","outputs":[{"name":"parent","type":"bytes32"},{"name":"stateRoot","type":"bytes32"},{"name":"transactionsRoot","type":"bytes32"},{"name":"receiptsRoot","type":"bytes32"},{"name":"blockNumber","type":"uint256"},{"name":"rlpHeaderHashWithoutNonce","type":"bytes32"},{"name":"nonce","type":"uint256"},{"name":"lockedUntil","type":"uint256"},{"name":"totalDifficulty","type":"uint256"},{"name":"orderedIndex","type":"uint256"},{"name":"iterableIndex","type":"uint256"},{"name":"latestFork","type":"bytes32"}],"payable":false,"stateMutability":"view","type":"function"},
  {"constant":false,"inputs":[{"name":"_rlpHeader","type":"bytes"}],"name":"submitHeader","outputs":[],"payable":false,"stateMutability":"nonpayable","type":"function"},
  {"constant":true,"inputs":[],"name":"getNoOfForks","outputs":[{"name":"","type":"uint256"}],"payable":false,"stateMutability":"view","type":"function"},
  {"inputs":[{"name":"_rlpHeader","type":"bytes"},{"name":"totalDifficulty","type":"uint256"}],"payable":false,"stateMutability":"nonpayable","type":"constructor"},
  {"anonymous":false,"inputs":[{"indexed":false,"name":"hash","type":"bytes32"},{"indexed":false,"name":"hashWithoutNonce","type":"bytes32"},{"indexed":false,"name":"nonce","type":"uint256"},{"indexed":false,"name":"parent","type":"bytes32"}],"name":"SubmitBlockHeader","type":"event"}
]"#;

fn bind(address: Address, backend: Arc<dyn Backend>) -> BindResult<Arc<BoundContract>> {
    BoundContract::bind(address, TESTIMONIUM_ABI, backend).map(Arc::new)
}

fn word(value: B256) -> DynSolValue {
    DynSolValue::FixedBytes(value, 32)
}

/// Output of `getBlock`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockSummary {
    pub parent: B256,
    pub block_number: U256,
    pub locked_until: U256,
    pub total_difficulty: U256,
    pub ordered_index: U256,
    pub iterable_index: U256,
    pub latest_fork: B256,
}

impl BlockSummary {
    fn from_tokens(tokens: &mut Tokens) -> BindResult<Self> {
        Ok(Self {
            parent: tokens.b256()?,
            block_number: tokens.uint()?,
            locked_until: tokens.uint()?,
            total_difficulty: tokens.uint()?,
            ordered_index: tokens.uint()?,
            iterable_index: tokens.uint()?,
            latest_fork: tokens.b256()?,
        })
    }
}

/// A stored header, as returned by the public `headers` mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Header {
    pub parent: B256,
    pub state_root: B256,
    pub transactions_root: B256,
    pub receipts_root: B256,
    pub block_number: U256,
    pub rlp_header_hash_without_nonce: B256,
    pub nonce: U256,
    pub locked_until: U256,
    pub total_difficulty: U256,
    pub ordered_index: U256,
    pub iterable_index: U256,
    pub latest_fork: B256,
}

impl Header {
    fn from_tokens(tokens: &mut Tokens) -> BindResult<Self> {
        Ok(Self {
            parent: tokens.b256()?,
            state_root: tokens.b256()?,
            transactions_root: tokens.b256()?,
            receipts_root: tokens.b256()?,
            block_number: tokens.uint()?,
            rlp_header_hash_without_nonce: tokens.b256()?,
            nonce: tokens.uint()?,
            locked_until: tokens.uint()?,
            total_difficulty: tokens.uint()?,
            ordered_index: tokens.uint()?,
            iterable_index: tokens.uint()?,
            latest_fork: tokens.b256()?,
        })
    }
}

/// Emitted for every accepted header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitBlockHeader {
    pub hash: B256,
    pub hash_without_nonce: B256,
    pub nonce: U256,
    pub parent: B256,
    pub raw: Log,
}

impl ContractEvent for SubmitBlockHeader {
    const NAME: &'static str = "SubmitBlockHeader";

    fn from_tokens(mut tokens: Tokens, raw: Log) -> BindResult<Self> {
        let event = Self {
            hash: tokens.b256()?,
            hash_without_nonce: tokens.b256()?,
            nonce: tokens.uint()?,
            parent: tokens.b256()?,
            raw,
        };
        tokens.finish()?;
        Ok(event)
    }

    fn raw(&self) -> &Log {
        &self.raw
    }
}

/// Read-only view of the contract.
#[derive(Debug, Clone)]
pub struct TestimoniumCaller(Facade<Read>);

impl TestimoniumCaller {
    pub fn new(address: Address, backend: Arc<dyn Backend>) -> BindResult<Self> {
        Ok(Self(Facade::new(bind(address, backend)?)))
    }

    /// Untyped access for methods without a wrapper.
    pub fn raw(&self) -> &Facade<Read> {
        &self.0
    }

    async fn call(&self, opts: &CallOpts, method: &str, args: &[DynSolValue]) -> BindResult<Tokens> {
        let values = self.0.call_raw(opts, method, args).await?;
        Ok(Tokens::new(method, values))
    }

    async fn call_bool(&self, opts: &CallOpts, method: &str, args: &[DynSolValue]) -> BindResult<bool> {
        let mut out = self.call(opts, method, args).await?;
        let value = out.bool()?;
        out.finish()?;
        Ok(value)
    }

    pub async fn is_unlocked(&self, opts: &CallOpts, block_hash: B256) -> BindResult<bool> {
        self.call_bool(opts, "isUnlocked", &[word(block_hash)]).await
    }

    pub async fn is_block(&self, opts: &CallOpts, hash: B256) -> BindResult<bool> {
        self.call_bool(opts, "isBlock", &[word(hash)]).await
    }

    pub async fn get_block(&self, opts: &CallOpts, hash: B256) -> BindResult<BlockSummary> {
        let mut out = self.call(opts, "getBlock", &[word(hash)]).await?;
        let block = BlockSummary::from_tokens(&mut out)?;
        out.finish()?;
        Ok(block)
    }

    /// Whether `tx_hash` is included in `requested` and that block is buried
    /// under at least `no_of_confirmations` blocks.
    pub async fn verify_transaction(
        &self,
        opts: &CallOpts,
        tx_hash: B256,
        requested: B256,
        no_of_confirmations: u8,
    ) -> BindResult<bool> {
        let args = [
            word(tx_hash),
            word(requested),
            DynSolValue::Uint(U256::from(no_of_confirmations), 8),
        ];
        self.call_bool(opts, "verifyTransaction", &args).await
    }

    pub async fn get_block_hash_of_endpoint(&self, opts: &CallOpts, index: U256) -> BindResult<B256> {
        let mut out = self
            .call(opts, "getBlockHashOfEndpoint", &[DynSolValue::Uint(index, 256)])
            .await?;
        let hash = out.b256()?;
        out.finish()?;
        Ok(hash)
    }

    pub async fn headers(&self, opts: &CallOpts, hash: B256) -> BindResult<Header> {
        let mut out = self.call(opts, "headers", &[word(hash)]).await?;
        let header = Header::from_tokens(&mut out)?;
        out.finish()?;
        Ok(header)
    }

    pub async fn get_no_of_forks(&self, opts: &CallOpts) -> BindResult<U256> {
        let mut out = self.call(opts, "getNoOfForks", &[]).await?;
        let forks = out.uint()?;
        out.finish()?;
        Ok(forks)
    }
}

/// Write-only view of the contract.
#[derive(Debug, Clone)]
pub struct TestimoniumTransactor(Facade<Write>);

impl TestimoniumTransactor {
    pub fn new(address: Address, backend: Arc<dyn Backend>) -> BindResult<Self> {
        Ok(Self(Facade::new(bind(address, backend)?)))
    }

    pub fn raw(&self) -> &Facade<Write> {
        &self.0
    }

    pub async fn dispute_block(&self, opts: &TransactOpts, block_hash: B256) -> BindResult<TxHash> {
        self.0
            .transact_raw(opts, "disputeBlock", &[word(block_hash)])
            .await
    }

    /// Submit an RLP-encoded block header.
    pub async fn submit_header(&self, opts: &TransactOpts, rlp_header: Bytes) -> BindResult<TxHash> {
        self.0
            .transact_raw(opts, "submitHeader", &[DynSolValue::Bytes(rlp_header.to_vec())])
            .await
    }

    pub async fn transfer(&self, opts: &TransactOpts) -> BindResult<TxHash> {
        self.0.transfer(opts).await
    }
}

/// Event view of the contract.
#[derive(Debug, Clone)]
pub struct TestimoniumFilterer(Facade<Events>);

impl TestimoniumFilterer {
    pub fn new(address: Address, backend: Arc<dyn Backend>) -> BindResult<Self> {
        Ok(Self(Facade::new(bind(address, backend)?)))
    }

    pub fn raw(&self) -> &Facade<Events> {
        &self.0
    }

    /// Every `SubmitBlockHeader` from `opts.start`, followed by live ones
    /// unless `opts.end` bounds the range.
    pub async fn filter_submit_block_header(
        &self,
        opts: &FilterOpts,
    ) -> BindResult<EventIterator<SubmitBlockHeader>> {
        self.0.filter(opts).await
    }

    pub async fn watch_submit_block_header(
        &self,
        opts: &WatchOpts,
        sink: mpsc::Sender<SubmitBlockHeader>,
    ) -> BindResult<WatchHandle> {
        self.0.watch(opts, sink).await
    }

    pub fn parse_submit_block_header(&self, log: Log) -> BindResult<SubmitBlockHeader> {
        self.0.parse(log)
    }
}

/// Full binding: read, write and event views sharing one bound contract.
#[derive(Debug, Clone)]
pub struct Testimonium {
    pub caller: TestimoniumCaller,
    pub transactor: TestimoniumTransactor,
    pub filterer: TestimoniumFilterer,
}

impl Testimonium {
    pub fn new(address: Address, backend: Arc<dyn Backend>) -> BindResult<Self> {
        let contract = bind(address, backend)?;
        Ok(Self {
            caller: TestimoniumCaller(Facade::new(contract.clone())),
            transactor: TestimoniumTransactor(Facade::new(contract.clone())),
            filterer: TestimoniumFilterer(Facade::new(contract)),
        })
    }

    pub fn address(&self) -> Address {
        self.caller.0.address()
    }

    pub fn session(&self, call_opts: CallOpts, transact_opts: TransactOpts) -> TestimoniumSession {
        TestimoniumSession {
            caller: Session::new(self.caller.clone(), call_opts),
            transactor: Session::new(self.transactor.clone(), transact_opts),
        }
    }
}

impl WithOptions for TestimoniumCaller {
    type Options = CallOpts;
}

impl WithOptions for TestimoniumTransactor {
    type Options = TransactOpts;
}

pub type CallerSession = Session<TestimoniumCaller>;
pub type TransactorSession = Session<TestimoniumTransactor>;

impl Session<TestimoniumCaller> {
    pub async fn is_unlocked(&self, block_hash: B256) -> BindResult<bool> {
        self.handle().is_unlocked(self.opts(), block_hash).await
    }

    pub async fn is_block(&self, hash: B256) -> BindResult<bool> {
        self.handle().is_block(self.opts(), hash).await
    }

    pub async fn get_block(&self, hash: B256) -> BindResult<BlockSummary> {
        self.handle().get_block(self.opts(), hash).await
    }

    pub async fn verify_transaction(
        &self,
        tx_hash: B256,
        requested: B256,
        no_of_confirmations: u8,
    ) -> BindResult<bool> {
        self.handle()
            .verify_transaction(self.opts(), tx_hash, requested, no_of_confirmations)
            .await
    }

    pub async fn get_block_hash_of_endpoint(&self, index: U256) -> BindResult<B256> {
        self.handle().get_block_hash_of_endpoint(self.opts(), index).await
    }

    pub async fn headers(&self, hash: B256) -> BindResult<Header> {
        self.handle().headers(self.opts(), hash).await
    }

    pub async fn get_no_of_forks(&self) -> BindResult<U256> {
        self.handle().get_no_of_forks(self.opts()).await
    }
}

impl Session<TestimoniumTransactor> {
    pub async fn dispute_block(&self, block_hash: B256) -> BindResult<TxHash> {
        self.handle().dispute_block(self.opts(), block_hash).await
    }

    pub async fn submit_header(&self, rlp_header: Bytes) -> BindResult<TxHash> {
        self.handle().submit_header(self.opts(), rlp_header).await
    }

    pub async fn transfer(&self) -> BindResult<TxHash> {
        self.handle().transfer(self.opts()).await
    }
}

/// Read and write sessions over the same contract.
#[derive(Debug, Clone)]
pub struct TestimoniumSession {
    pub caller: CallerSession,
    pub transactor: TransactorSession,
}

impl TestimoniumSession {
    pub async fn is_unlocked(&self, block_hash: B256) -> BindResult<bool> {
        self.caller.is_unlocked(block_hash).await
    }

    pub async fn is_block(&self, hash: B256) -> BindResult<bool> {
        self.caller.is_block(hash).await
    }

    pub async fn get_block(&self, hash: B256) -> BindResult<BlockSummary> {
        self.caller.get_block(hash).await
    }

    pub async fn verify_transaction(
        &self,
        tx_hash: B256,
        requested: B256,
        no_of_confirmations: u8,
    ) -> BindResult<bool> {
        self.caller
            .verify_transaction(tx_hash, requested, no_of_confirmations)
            .await
    }

    pub async fn get_block_hash_of_endpoint(&self, index: U256) -> BindResult<B256> {
        self.caller.get_block_hash_of_endpoint(index).await
    }

    pub async fn headers(&self, hash: B256) -> BindResult<Header> {
        self.caller.headers(hash).await
    }

    pub async fn get_no_of_forks(&self) -> BindResult<U256> {
        self.caller.get_no_of_forks().await
    }

    pub async fn dispute_block(&self, block_hash: B256) -> BindResult<TxHash> {
        self.transactor.dispute_block(block_hash).await
    }

    pub async fn submit_header(&self, rlp_header: Bytes) -> BindResult<TxHash> {
        self.transactor.submit_header(rlp_header).await
    }

    pub async fn transfer(&self) -> BindResult<TxHash> {
        self.transactor.transfer().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BindError;
    use crate::ethereum::abi::AbiGateway;
    use alloy::primitives::{b256, LogData};

    fn submit_log(fields: Vec<DynSolValue>) -> Log {
        let gateway = AbiGateway::parse(TESTIMONIUM_ABI).unwrap();
        let topic = gateway.event_topic(SubmitBlockHeader::NAME).unwrap();
        let data = DynSolValue::Tuple(fields).abi_encode_params();
        Log {
            inner: alloy::primitives::Log {
                address: Address::repeat_byte(0x42),
                data: LogData::new_unchecked(vec![topic], data.into()),
            },
            block_hash: Some(B256::repeat_byte(0x01)),
            block_number: Some(100),
            transaction_hash: Some(B256::repeat_byte(0x02)),
            log_index: Some(3),
            ..Default::default()
        }
    }

    #[test]
    fn test_abi_declares_every_member() {
        let gateway = AbiGateway::parse(TESTIMONIUM_ABI).unwrap();
        for method in [
            "isUnlocked",
            "isBlock",
            "disputeBlock",
            "getBlock",
            "verifyTransaction",
            "getBlockHashOfEndpoint",
            "headers",
            "submitHeader",
            "getNoOfForks",
        ] {
            assert!(gateway.function(method, None).is_ok(), "missing {}", method);
        }
        assert_eq!(gateway.function("headers", None).unwrap().outputs.len(), 12);
        assert!(gateway.event(SubmitBlockHeader::NAME).is_ok());
    }

    #[test]
    fn test_event_topic_is_signature_hash() {
        let gateway = AbiGateway::parse(TESTIMONIUM_ABI).unwrap();
        assert_eq!(
            gateway.event_topic("SubmitBlockHeader").unwrap(),
            alloy::primitives::keccak256("SubmitBlockHeader(bytes32,bytes32,uint256,bytes32)")
        );
    }

    #[test]
    fn test_submit_block_header_keeps_fields_and_provenance() {
        let hash = b256!("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");
        let parent = b256!("bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb");
        let log = submit_log(vec![
            word(hash),
            word(B256::repeat_byte(0xCC)),
            DynSolValue::Uint(U256::from(5u64), 256),
            word(parent),
        ]);

        let gateway = AbiGateway::parse(TESTIMONIUM_ABI).unwrap();
        let values = gateway.decode_log(SubmitBlockHeader::NAME, &log).unwrap();
        let event =
            SubmitBlockHeader::from_tokens(Tokens::new(SubmitBlockHeader::NAME, values), log.clone())
                .unwrap();

        assert_eq!(event.hash, hash);
        assert_eq!(event.nonce, U256::from(5u64));
        assert_eq!(event.parent, parent);
        assert_eq!(event.raw().block_hash, Some(B256::repeat_byte(0x01)));
        assert_eq!(event.raw().transaction_hash, Some(B256::repeat_byte(0x02)));
        assert_eq!(event.raw().log_index, Some(3));
        assert_eq!(event.raw, log);
    }

    #[test]
    fn test_block_summary_field_order() {
        let mut tokens = Tokens::new(
            "getBlock",
            vec![
                word(B256::repeat_byte(0xAA)),
                DynSolValue::Uint(U256::from(1u64), 256),
                DynSolValue::Uint(U256::from(2u64), 256),
                DynSolValue::Uint(U256::from(3u64), 256),
                DynSolValue::Uint(U256::from(4u64), 256),
                DynSolValue::Uint(U256::from(5u64), 256),
                word(B256::repeat_byte(0xBB)),
            ],
        );
        let block = BlockSummary::from_tokens(&mut tokens).unwrap();
        tokens.finish().unwrap();

        assert_eq!(block.parent, B256::repeat_byte(0xAA));
        assert_eq!(block.block_number, U256::from(1u64));
        assert_eq!(block.locked_until, U256::from(2u64));
        assert_eq!(block.total_difficulty, U256::from(3u64));
        assert_eq!(block.ordered_index, U256::from(4u64));
        assert_eq!(block.iterable_index, U256::from(5u64));
        assert_eq!(block.latest_fork, B256::repeat_byte(0xBB));
    }

    #[test]
    fn test_header_rejects_short_output() {
        let mut tokens = Tokens::new("headers", vec![word(B256::ZERO)]);
        assert!(matches!(
            Header::from_tokens(&mut tokens),
            Err(BindError::Decode { .. })
        ));
    }
}
