//! # Membership engine public API
//!
//! The `engine_api` module exposes the programmatic API of the membership engine. The API is modular, so that clients
//! can pick the parts they need.
//!
//! * [`order_flow_api`] creates orders and settles them when a payment provider reports success.
//! * [`expiry_api`] cancels orders that were never paid: the scheduled sweep, and the queue consumer that
//!   re-applies the sweep's decisions.
//! * [`stats_api`] serves the cache-backed monthly statistics.
//! * [`accounts_api`] answers read-only questions about users and their orders.
//!
//! # API usage
//!
//! Every API is created by supplying a database backend that implements the backend traits the API requires, plus
//! whatever collaborators it needs (a cache, event producers).
//!
//! ```rust,ignore
//! use membership_engine::{cache::MemoryCache, events::EventProducers, OrderFlowApi, SqliteDatabase};
//! let db = SqliteDatabase::new_with_url(...).await?;
//! let api = OrderFlowApi::new(db, MemoryCache::default(), EventProducers::default());
//! let order = api.create_order(user_id, membership_id).await?;
//! ```
pub mod accounts_api;
pub mod expiry_api;
pub mod order_flow_api;
pub mod stats_api;
