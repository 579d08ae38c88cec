//! Orders domain module.
//!
//! Business rules for paid queue orders, implemented purely as deterministic
//! domain logic (no IO, no clock reads, no storage).

pub mod order;
pub mod score;

pub use order::{
    AssignQueueSlot, CancelOrder, ConfirmPayment, KeywordRecorded, Modification, ModifyOrder,
    Order, OrderCancelled, OrderCommand, OrderEvent, OrderModified, OrderRefunded, OrderReplied,
    OrderStatus, OrderSubmitted, PaymentConfirmed, ProcessingStarted, QueueSlot,
    QueueSlotAssigned, RecordKeyword, RefundOrder, ReplyToOrder, StartProcessing, SubmitOrder,
    DEFAULT_MAX_MODIFICATIONS, MAX_CONTENT_CHARS,
};
pub use score::{age_hours, priority_score, AGE_FACTOR_PER_HOUR, URGENT_MULTIPLIER};
