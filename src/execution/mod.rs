pub mod exchange;
pub mod order;
pub mod order_manager;
pub mod retry;

pub use exchange::{fill_channel, CancelAck, ExchangeAdapter, ExchangeFill, OrderAck, PaperExchange};
pub use order::{ExitReason, Order, OrderId, OrderIntent, OrderStatus, Side};
pub use order_manager::OrderManager;
pub use retry::RetryPolicy;
