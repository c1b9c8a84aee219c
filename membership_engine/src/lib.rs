//! Membership Payment Engine
//!
//! The membership engine sells time-boxed memberships. A user buys a catalog membership by creating an order, pays for
//! it with a third-party provider, and the engine extends their membership when the provider confirms payment. Orders
//! that are never paid are cancelled by a scheduled sweep. This library contains the core logic; it knows nothing
//! about HTTP or about any particular payment provider.
//!
//! The library is divided into these main sections:
//! 1. Database management and control ([`mod@traits`] and [`mod@sqlite`]). The traits define the order state machine
//!    and the read-only queries; SQLite is the supported backend. The data types used in the database are defined in
//!    the [`mod@db_types`] module and are public.
//! 2. The public API ([`mod@engine_api`]). This provides order creation, settlement, expiry and statistics.
//! 3. Infrastructure: the [`mod@cache`] for statistics and catalog entries, and the [`mod@queue`] bridge that carries
//!    expired order ids from the sweep to its consumer.
//!
//! The engine also provides a set of events that can be subscribed to. These events are emitted after certain actions
//! have been committed. For example, when an order is paid, an `OrderPaidEvent` is emitted.
pub mod cache;
pub mod db_types;
pub mod engine_api;
pub mod events;
pub mod helpers;
pub mod queue;
#[cfg(feature = "sqlite")]
pub mod sqlite;
pub mod traits;

#[cfg(any(feature = "test_utils", test))]
pub mod test_utils;

pub use engine_api::{
    accounts_api::AccountApi,
    expiry_api::{ExpiryApi, ExpirySweepReport},
    order_flow_api::OrderFlowApi,
    stats_api::StatsApi,
};
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteDatabase;
pub use traits::{AccountApiError, AccountManagement, ExpiryPublisher, PaymentGatewayDatabase, PaymentGatewayError};
