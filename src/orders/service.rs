//! Order operations.
//!
//! Thin adapters over the REST client. Order placement, modification and
//! cancellation ride the `Order` endpoint class: never retried, never served
//! from cache, every failure surfaced — a rejected send must look rejected,
//! or the platform would re-send and break at-most-once.

use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::info;

use super::types::{
    DeleteOrderRequest, ModifyOrderRequest, Position, PriceType, SendOrderRequest,
    SubAccountQuery, TransactionRecord, TransactionStatus,
};
use crate::Result;
use crate::error::Error;
use crate::rest::endpoints::{
    DELETE_ORDER, INSTANT_POSITION, MODIFY_ORDER, SEND_ORDER, TODAYS_TRANSACTION,
};
use crate::rest::{Cached, EndpointClass, RestClient};

/// Order entry, amendment and inquiry against the broker.
#[derive(Debug)]
pub struct OrderService {
    rest: Arc<RestClient>,
}

impl OrderService {
    /// Wire the service against the REST client.
    #[must_use]
    pub fn new(rest: Arc<RestClient>) -> Self {
        Self { rest }
    }

    /// Place a new order; returns the broker's order reference.
    pub async fn send(&self, order: &SendOrderRequest) -> Result<String> {
        validate_order(order)?;
        let reference: String = self
            .rest
            .post_authed(SEND_ORDER, EndpointClass::Order, order)
            .await?;
        info!(symbol = %order.symbol, direction = %order.direction, %reference, "order placed");
        Ok(reference)
    }

    /// Modify a resting order's price and/or quantity.
    pub async fn modify(&self, request: &ModifyOrderRequest) -> Result<()> {
        if request.lot <= Decimal::ZERO {
            return Err(Error::validation("lot must be positive"));
        }
        let _: serde_json::Value = self
            .rest
            .post_authed(MODIFY_ORDER, EndpointClass::Order, request)
            .await?;
        info!(id = %request.id, "order modified");
        Ok(())
    }

    /// Cancel a resting order.
    pub async fn cancel(&self, request: &DeleteOrderRequest) -> Result<()> {
        let _: serde_json::Value = self
            .rest
            .post_authed(DELETE_ORDER, EndpointClass::Order, request)
            .await?;
        info!(id = %request.id, "order cancelled");
        Ok(())
    }

    /// Current positions. May be served from the last-good cache when the
    /// upstream is refusing; the result says which.
    pub async fn positions(&self) -> Result<Cached<Vec<Position>>> {
        self.rest
            .post_read(INSTANT_POSITION, &SubAccountQuery::default())
            .await
    }

    /// Everything that traded or rested today.
    pub async fn todays_transactions(&self) -> Result<Cached<Vec<TransactionRecord>>> {
        self.rest
            .post_read(TODAYS_TRANSACTION, &SubAccountQuery::default())
            .await
    }

    /// Today's transactions filtered down to orders still on the book.
    pub async fn pending_orders(&self) -> Result<Cached<Vec<TransactionRecord>>> {
        let Cached { value, cached } = self.todays_transactions().await?;
        Ok(Cached {
            value: value
                .into_iter()
                .filter(|t| t.status == TransactionStatus::Waiting)
                .collect(),
            cached,
        })
    }
}

fn validate_order(order: &SendOrderRequest) -> Result<()> {
    if order.symbol.trim().is_empty() {
        return Err(Error::validation("symbol must not be empty"));
    }
    if order.lot <= Decimal::ZERO {
        return Err(Error::validation("lot must be positive"));
    }
    if order.pricetype == PriceType::Limit && order.price <= Decimal::ZERO {
        return Err(Error::validation("limit orders need a positive price"));
    }
    Ok(())
}
