use std::fmt::Debug;

use chrono::Utc;
use log::*;

use crate::{
    cache::KeyValueCache,
    db_types::{Membership, NewOrder, Order, OrderStatusType, OutTradeNo, Settlement, SettlementOutcome, StatsType},
    engine_api::stats_api::StatsApi,
    events::{EventProducers, OrderCreatedEvent, OrderPaidEvent},
    traits::{PaymentGatewayDatabase, PaymentGatewayError},
};

/// `OrderFlowApi` is the primary API for the order lifecycle: creating orders for catalog memberships, and settling
/// them when a payment provider reports that they have been paid.
///
/// Side effects that follow a committed change (stats invalidation, event hooks) are best-effort. They are logged
/// when they fail and never undo or fail the change itself.
pub struct OrderFlowApi<B, C> {
    db: B,
    cache: C,
    stats: StatsApi<B, C>,
    producers: EventProducers,
}

impl<B, C> Debug for OrderFlowApi<B, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "OrderFlowApi")
    }
}

impl<B, C> OrderFlowApi<B, C>
where
    B: PaymentGatewayDatabase,
    C: KeyValueCache,
{
    pub fn new(db: B, cache: C, producers: EventProducers) -> Self {
        let stats = StatsApi::new(db.clone(), cache.clone());
        Self { db, cache, stats, producers }
    }

    pub fn db(&self) -> &B {
        &self.db
    }

    /// Fetches a catalog entry, reading through the `membership:<id>` cache entry.
    pub async fn membership(&self, membership_id: i64) -> Result<Membership, PaymentGatewayError> {
        let key = Membership::cache_key(membership_id);
        match self.cache.get(&key).await {
            Ok(Some(json)) => match serde_json::from_str::<Membership>(&json) {
                Ok(membership) => return Ok(membership),
                Err(e) => warn!("🔄️ Ignoring corrupt cache entry {key}: {e}"),
            },
            Ok(None) => {},
            Err(e) => warn!("🔄️ Could not read {key} from the cache: {e}"),
        }
        let membership = self
            .db
            .fetch_membership(membership_id)
            .await?
            .ok_or(PaymentGatewayError::MembershipNotFound(membership_id))?;
        match serde_json::to_string(&membership) {
            Ok(json) => {
                if let Err(e) = self.cache.set(&key, &json).await {
                    warn!("🔄️ Could not write {key} to the cache: {e}");
                }
            },
            Err(e) => warn!("🔄️ Could not serialize {key}: {e}"),
        }
        Ok(membership)
    }

    /// Creates a new `Pending` order for `user_id` to buy the given membership.
    pub async fn create_order(&self, user_id: i64, membership_id: i64) -> Result<Order, PaymentGatewayError> {
        if self.db.fetch_user(user_id).await?.is_none() {
            return Err(PaymentGatewayError::UserNotFound(user_id));
        }
        let membership = self.membership(membership_id).await?;
        let order = self.db.insert_order(NewOrder::for_membership(user_id, &membership)).await?;
        info!(
            "🔄️📦️ Order {} created for user #{user_id}: {} at {}",
            order.out_trade_no, order.subject, order.total_amount
        );
        self.stats.invalidate(StatsType::Order).await;
        for emitter in &self.producers.order_created_producer {
            debug!("🔄️📦️ Notifying order created hook subscribers");
            emitter.publish_event(OrderCreatedEvent::new(order.clone()));
        }
        Ok(order)
    }

    /// Fetches an order that `user_id` may still pay for.
    ///
    /// Orders that do not exist and orders that belong to someone else are both reported as not found. Orders that
    /// are no longer `Pending` are reported as [`PaymentGatewayError::OrderNotPayable`].
    pub async fn payable_order_for_user(
        &self,
        user_id: i64,
        out_trade_no: &OutTradeNo,
    ) -> Result<Order, PaymentGatewayError> {
        let order = self
            .db
            .fetch_order_by_out_trade_no(out_trade_no)
            .await?
            .filter(|o| o.user_id == user_id)
            .ok_or_else(|| PaymentGatewayError::OrderNotFound(out_trade_no.clone()))?;
        if order.status != OrderStatusType::Pending {
            return Err(PaymentGatewayError::OrderNotPayable(out_trade_no.clone()));
        }
        Ok(order)
    }

    /// Settles an order after a payment provider has confirmed payment. See
    /// [`PaymentGatewayDatabase::settle_order`] for the guarantees.
    ///
    /// Settling an order that is already final is not an error, and triggers no side effects.
    pub async fn settle(&self, settlement: Settlement) -> Result<SettlementOutcome, PaymentGatewayError> {
        trace!("🔄️💰️ Settling {} via {}", settlement.out_trade_no, settlement.payment_method);
        let outcome = self.db.settle_order(&settlement, Utc::now()).await?;
        match &outcome {
            SettlementOutcome::Settled { order, user } => {
                self.stats.invalidate(StatsType::Order).await;
                for emitter in &self.producers.order_paid_producer {
                    debug!("🔄️💰️ Notifying order paid hook subscribers");
                    emitter.publish_event(OrderPaidEvent::new(order.clone(), user.clone()));
                }
            },
            SettlementOutcome::AlreadyFinal(order) => {
                debug!("🔄️💰️ Order {} was already {}. Nothing to do.", order.out_trade_no, order.status);
            },
        }
        Ok(outcome)
    }
}
