//! Read, write and event views over a [`BoundContract`].
//!
//! The three views share one generic type; the kind parameter decides which
//! operations are available, so a read-only handle cannot submit
//! transactions.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use alloy::dyn_abi::DynSolValue;
use alloy::primitives::{Address, TxHash};
use alloy::rpc::types::Log;
use tokio::sync::mpsc;

use crate::error::BindResult;
use crate::ethereum::contract::{BoundContract, CallOpts, FilterOpts, TransactOpts, WatchOpts};
use crate::ethereum::event::{watch_events, ContractEvent, EventIterator, WatchHandle};

/// Marker for the operation family a [`Facade`] exposes.
pub trait Kind: Send + Sync + 'static {}

/// Read-only calls.
#[derive(Debug)]
pub struct Read;

/// State-mutating transactions.
#[derive(Debug)]
pub struct Write;

/// Event filtering, watching and parsing.
#[derive(Debug)]
pub struct Events;

impl Kind for Read {}
impl Kind for Write {}
impl Kind for Events {}

pub struct Facade<K: Kind> {
    contract: Arc<BoundContract>,
    _kind: PhantomData<K>,
}

impl<K: Kind> Clone for Facade<K> {
    fn clone(&self) -> Self {
        Self::new(self.contract.clone())
    }
}

impl<K: Kind> fmt::Debug for Facade<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Facade")
            .field("kind", &std::any::type_name::<K>())
            .field("contract", &self.contract)
            .finish()
    }
}

impl<K: Kind> Facade<K> {
    pub fn new(contract: Arc<BoundContract>) -> Self {
        Self {
            contract,
            _kind: PhantomData,
        }
    }

    pub fn contract(&self) -> &Arc<BoundContract> {
        &self.contract
    }

    pub fn address(&self) -> Address {
        self.contract.address()
    }
}

impl Facade<Read> {
    /// Call any view method by name and return its decoded outputs.
    pub async fn call_raw(
        &self,
        opts: &CallOpts,
        method: &str,
        args: &[DynSolValue],
    ) -> BindResult<Vec<DynSolValue>> {
        self.contract.call(opts, method, args).await
    }
}

impl Facade<Write> {
    /// Submit any mutating method by name.
    pub async fn transact_raw(
        &self,
        opts: &TransactOpts,
        method: &str,
        args: &[DynSolValue],
    ) -> BindResult<TxHash> {
        self.contract.transact(opts, method, args).await
    }

    pub async fn transfer(&self, opts: &TransactOpts) -> BindResult<TxHash> {
        self.contract.transfer(opts).await
    }
}

impl Facade<Events> {
    pub async fn filter<E: ContractEvent>(&self, opts: &FilterOpts) -> BindResult<EventIterator<E>> {
        EventIterator::open(self.contract.clone(), opts).await
    }

    pub async fn watch<E: ContractEvent>(
        &self,
        opts: &WatchOpts,
        sink: mpsc::Sender<E>,
    ) -> BindResult<WatchHandle> {
        watch_events(self.contract.clone(), opts, sink).await
    }

    pub fn parse<E: ContractEvent>(&self, log: Log) -> BindResult<E> {
        self.contract.parse_event(log)
    }
}

/// A handle whose operations take a per-call options value.
pub trait WithOptions {
    type Options: Clone + Send + Sync + fmt::Debug;
}

impl WithOptions for Facade<Read> {
    type Options = CallOpts;
}

impl WithOptions for Facade<Write> {
    type Options = TransactOpts;
}

/// A handle paired with default options, so repeated calls need not
/// restate them.
#[derive(Debug, Clone)]
pub struct Session<F: WithOptions> {
    handle: F,
    opts: F::Options,
}

impl<F: WithOptions> Session<F> {
    pub fn new(handle: F, opts: F::Options) -> Self {
        Self { handle, opts }
    }

    pub fn handle(&self) -> &F {
        &self.handle
    }

    pub fn opts(&self) -> &F::Options {
        &self.opts
    }

    /// Same handle, different defaults.
    pub fn with_opts(&self, opts: F::Options) -> Self
    where
        F: Clone,
    {
        Self::new(self.handle.clone(), opts)
    }
}

impl Session<Facade<Read>> {
    pub async fn call_raw(&self, method: &str, args: &[DynSolValue]) -> BindResult<Vec<DynSolValue>> {
        self.handle.call_raw(&self.opts, method, args).await
    }
}

impl Session<Facade<Write>> {
    pub async fn transact_raw(&self, method: &str, args: &[DynSolValue]) -> BindResult<TxHash> {
        self.handle.transact_raw(&self.opts, method, args).await
    }

    pub async fn transfer(&self) -> BindResult<TxHash> {
        self.handle.transfer(&self.opts).await
    }
}
