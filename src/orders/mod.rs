//! Order entry and inquiry.

mod service;
mod types;

pub use service::OrderService;
pub use types::{
    DeleteOrderRequest, Direction, ModifyOrderRequest, Position, PriceType, SendOrderRequest,
    SubAccountQuery, TransactionRecord, TransactionStatus,
};
