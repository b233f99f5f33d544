//! Order read-model projection.

use crate::events::model::{
    ExecutionReceivedPayload, Order, OrderPlacedPayload, OrderStatus, OrderStatusChangedPayload,
};
use chrono::Utc;
use std::collections::HashMap;

#[derive(Default)]
pub struct OrderBook {
    pub orders: HashMap<String, Order>,
}

impl OrderBook {
    pub fn apply_placed(&mut self, p: &OrderPlacedPayload) {
        self.orders.insert(
            p.order_id.clone(),
            Order {
                order_id: p.order_id.clone(),
                symbol: p.symbol.clone(),
                side: p.side,
                original_qty: p.original_qty,
                filled_qty: 0.0,
                avg_price: 0.0,
                status: OrderStatus::Submitted,
                last_updated: Utc::now(),
                parent_correlation_id: p.parent_correlation_id.clone(),
                oca_group: p.oca_group.clone(),
            },
        );
    }

    pub fn apply_execution(&mut self, p: &ExecutionReceivedPayload) {
        let Some(order) = self.orders.get_mut(&p.order_id) else {
            return;
        };
        let old_filled = order.filled_qty;
        let new_filled = (old_filled + p.shares).min(order.original_qty);
        order.avg_price = if new_filled > 0.0 {
            (old_filled * order.avg_price + p.shares * p.price) / new_filled
        } else {
            order.avg_price
        };
        order.filled_qty = new_filled;
        order.status = if (new_filled - order.original_qty).abs() < 1e-9 {
            OrderStatus::Filled
        } else {
            OrderStatus::Partial
        };
        order.last_updated = Utc::now();
    }

    pub fn apply_status_change(&mut self, p: &OrderStatusChangedPayload) {
        if let Some(order) = self.orders.get_mut(&p.order_id) {
            order.status = p.status;
            order.last_updated = Utc::now();
        }
    }

    pub fn get(&self, order_id: &str) -> Option<&Order> {
        self.orders.get(order_id)
    }

    /// Orders sharing an OCA group with `order_id`, excluding it.
    pub fn oca_siblings(&self, order_id: &str) -> Vec<&Order> {
        let Some(group) = self.orders.get(order_id).and_then(|o| o.oca_group.clone()) else {
            return Vec::new();
        };
        self.orders
            .values()
            .filter(|o| o.order_id != order_id && o.oca_group.as_deref() == Some(group.as_str()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::model::Side;

    #[test]
    fn fill_never_exceeds_original_qty() {
        let mut book = OrderBook::default();
        book.apply_placed(&OrderPlacedPayload {
            order_id: "o1".into(),
            symbol: "AAPL".into(),
            side: Side::Buy,
            original_qty: 100.0,
            parent_correlation_id: None,
            oca_group: None,
        });
        book.apply_execution(&ExecutionReceivedPayload {
            execution_id: "e1".into(),
            order_id: "o1".into(),
            symbol: "AAPL".into(),
            side: Side::Buy,
            shares: 150.0,
            price: 10.0,
        });
        let order = book.get("o1").unwrap();
        assert!(order.filled_qty <= order.original_qty);
        assert!(order.is_filled_consistent());
        assert_eq!(order.status, OrderStatus::Filled);
    }
}
