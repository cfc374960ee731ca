pub mod abi;
pub mod contract;
pub mod event;
pub mod facade;
pub mod provider;
pub mod utils;

pub use abi::{AbiGateway, Tokens};
pub use contract::{BoundContract, CallOpts, FilterOpts, TransactOpts, WatchOpts};
pub use event::{watch_events, ContractEvent, EventIterator, WatchHandle};
pub use facade::{Events, Facade, Read, Session, WithOptions, Write};
pub use provider::{
    connect, AlloyBackend, Backend, LogSubscription, SubscriptionFeed, SubscriptionItem,
    Unsubscriber,
};
