use std::{future::Future, pin::Pin, sync::Arc};

use crate::events::{EventHandler, EventProducer, Handler, OrderCreatedEvent, OrderPaidEvent, OrdersExpiredEvent};

#[derive(Default, Clone)]
pub struct EventProducers {
    pub order_created_producer: Vec<EventProducer<OrderCreatedEvent>>,
    pub order_paid_producer: Vec<EventProducer<OrderPaidEvent>>,
    pub orders_expired_producer: Vec<EventProducer<OrdersExpiredEvent>>,
}

pub struct EventHandlers {
    pub on_order_created: Option<EventHandler<OrderCreatedEvent>>,
    pub on_order_paid: Option<EventHandler<OrderPaidEvent>>,
    pub on_orders_expired: Option<EventHandler<OrdersExpiredEvent>>,
}

impl EventHandlers {
    pub fn new(buffer_size: usize, hooks: EventHooks) -> Self {
        let on_order_created = hooks.on_order_created.map(|f| EventHandler::new(buffer_size, f));
        let on_order_paid = hooks.on_order_paid.map(|f| EventHandler::new(buffer_size, f));
        let on_orders_expired = hooks.on_orders_expired.map(|f| EventHandler::new(buffer_size, f));
        Self { on_order_created, on_order_paid, on_orders_expired }
    }

    pub fn producers(&self) -> EventProducers {
        let mut result = EventProducers::default();
        if let Some(handler) = &self.on_order_created {
            result.order_created_producer.push(handler.subscribe());
        }
        if let Some(handler) = &self.on_order_paid {
            result.order_paid_producer.push(handler.subscribe());
        }
        if let Some(handler) = &self.on_orders_expired {
            result.orders_expired_producer.push(handler.subscribe());
        }
        result
    }

    pub fn start_handlers(self) {
        if let Some(handler) = self.on_order_created {
            tokio::spawn(handler.start_handler());
        }
        if let Some(handler) = self.on_order_paid {
            tokio::spawn(handler.start_handler());
        }
        if let Some(handler) = self.on_orders_expired {
            tokio::spawn(handler.start_handler());
        }
    }
}

type BoxedHook<E> = dyn (Fn(E) -> Pin<Box<dyn Future<Output = ()> + Send>>) + Send + Sync + 'static;

#[derive(Default, Clone)]
pub struct EventHooks {
    pub on_order_created: Option<Handler<OrderCreatedEvent>>,
    pub on_order_paid: Option<Handler<OrderPaidEvent>>,
    pub on_orders_expired: Option<Handler<OrdersExpiredEvent>>,
}

impl EventHooks {
    pub fn on_order_created<F>(&mut self, f: F) -> &mut Self
    where F: Fn(OrderCreatedEvent) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync + 'static {
        let f: Arc<BoxedHook<OrderCreatedEvent>> = Arc::new(f);
        self.on_order_created = Some(f);
        self
    }

    pub fn on_order_paid<F>(&mut self, f: F) -> &mut Self
    where F: Fn(OrderPaidEvent) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync + 'static {
        let f: Arc<BoxedHook<OrderPaidEvent>> = Arc::new(f);
        self.on_order_paid = Some(f);
        self
    }

    pub fn on_orders_expired<F>(&mut self, f: F) -> &mut Self
    where F: Fn(OrdersExpiredEvent) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync + 'static {
        let f: Arc<BoxedHook<OrdersExpiredEvent>> = Arc::new(f);
        self.on_orders_expired = Some(f);
        self
    }
}
