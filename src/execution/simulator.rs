use async_trait::async_trait;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::info;
use uuid::Uuid;
use crate::config::PaperTradingConfig;
use crate::execution::gateway::{GatewayError, OrderGateway};
use crate::execution::types::{OrderAck, OrderRequest, OrderState};

struct PaperOrder {
    ack: OrderAck,
    cost: f64,
}

struct PaperBook {
    balance: f64,
    orders: HashMap<String, PaperOrder>,
}

/// Paper-trading order gateway: fills at the limit price with a configurable fill
/// rate, rests the remainder, and tracks a simulated cash balance.
pub struct PaperGateway {
    fill_rate: f64,
    book: Mutex<PaperBook>,
}

impl PaperGateway {
    pub fn new(config: &PaperTradingConfig) -> Self {
        info!("Paper trading gateway initialized with ${:.2}", config.initial_balance_usd);
        Self {
            fill_rate: config.fill_rate,
            book: Mutex::new(PaperBook {
                balance: config.initial_balance_usd,
                orders: HashMap::new(),
            }),
        }
    }

    fn with_book<T>(&self, f: impl FnOnce(&mut PaperBook) -> T) -> Result<T, GatewayError> {
        let mut book = self
            .book
            .lock()
            .map_err(|_| GatewayError::Transport("paper book lock poisoned".to_string()))?;
        Ok(f(&mut book))
    }
}

#[async_trait]
impl OrderGateway for PaperGateway {
    async fn place_order(&self, order: &OrderRequest) -> Result<OrderAck, GatewayError> {
        let will_fill = rand::thread_rng().gen::<f64>() < self.fill_rate;

        self.with_book(|book| {
            // Resubmitting a client id returns the original order
            if let Some(existing) = book.orders.get(&order.client_order_id) {
                return Ok(existing.ack.clone());
            }

            let cost = order.cost();
            if cost > book.balance {
                return Err(GatewayError::Rejected(format!(
                    "insufficient balance: need ${:.2}, have ${:.2}",
                    cost, book.balance
                )));
            }
            book.balance -= cost;

            let state = if will_fill { OrderState::Filled } else { OrderState::Resting };
            let ack = OrderAck {
                order_id: format!("paper-{}", Uuid::new_v4()),
                client_order_id: order.client_order_id.clone(),
                state,
            };
            info!(
                "Paper order {:?}: {} x{} @ ${:.2} (cost ${:.2})",
                state, order.ticker, order.count, order.limit_price, cost
            );
            book.orders.insert(order.client_order_id.clone(), PaperOrder { ack: ack.clone(), cost });
            Ok(ack)
        })?
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), GatewayError> {
        self.with_book(|book| {
            let order = book
                .orders
                .values_mut()
                .find(|o| o.ack.order_id == order_id)
                .ok_or_else(|| GatewayError::NotFound(order_id.to_string()))?;

            let state = order.ack.state;
            match state {
                OrderState::Resting => {
                    order.ack.state = OrderState::Canceled;
                    let refund = order.cost;
                    book.balance += refund;
                    info!("Paper order {} canceled, refunded ${:.2}", order_id, refund);
                    Ok(())
                }
                OrderState::Canceled => Ok(()),
                OrderState::Filled => Err(GatewayError::Rejected(format!("order {} already filled", order_id))),
            }
        })?
    }

    async fn order_status(&self, client_order_id: &str) -> Result<Option<OrderAck>, GatewayError> {
        self.with_book(|book| book.orders.get(client_order_id).map(|o| o.ack.clone()))
    }

    async fn balance(&self) -> Result<f64, GatewayError> {
        self.with_book(|book| book.balance)
    }

    async fn credit_settlement(&self, amount: f64) -> Result<(), GatewayError> {
        self.with_book(|book| book.balance += amount)
    }
}
