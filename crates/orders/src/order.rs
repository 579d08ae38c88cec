use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use augur_core::{Aggregate, AggregateRoot, DomainError, Money, OrderId, OwnerId};

use crate::score;

/// Maximum length of an order's free-text content, in characters.
pub const MAX_CONTENT_CHARS: usize = 800;

/// How many times an order may be edited after submission.
pub const DEFAULT_MAX_MODIFICATIONS: u32 = 5;

/// Order status lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Draft,
    PendingPayment,
    Queued,
    Processing,
    Completed,
    Refunded,
    Cancelled,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 7] = [
        OrderStatus::Draft,
        OrderStatus::PendingPayment,
        OrderStatus::Queued,
        OrderStatus::Processing,
        OrderStatus::Completed,
        OrderStatus::Refunded,
        OrderStatus::Cancelled,
    ];

    /// Active orders are exactly the members of the priority index.
    pub fn is_active(self) -> bool {
        matches!(self, OrderStatus::Queued | OrderStatus::Processing)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Completed | OrderStatus::Refunded | OrderStatus::Cancelled
        )
    }

    pub fn is_editable(self) -> bool {
        matches!(self, OrderStatus::PendingPayment | OrderStatus::Queued)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Draft => "draft",
            OrderStatus::PendingPayment => "pending_payment",
            OrderStatus::Queued => "queued",
            OrderStatus::Processing => "processing",
            OrderStatus::Completed => "completed",
            OrderStatus::Refunded => "refunded",
            OrderStatus::Cancelled => "cancelled",
        }
    }
}

impl core::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rank of an active order: 1-based position and percentile.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QueueSlot {
    pub position: u32,
    pub percentile: f64,
}

impl QueueSlot {
    /// `percentile = position / (total + 1) × 100`, rounded to two decimals.
    pub fn new(position: u32, total: usize) -> Self {
        let raw = f64::from(position) / (total as f64 + 1.0) * 100.0;
        Self {
            position,
            percentile: (raw * 100.0).round() / 100.0,
        }
    }
}

/// One accepted edit, kept for the owner's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Modification {
    pub number: u32,
    pub content: String,
    pub money: Money,
    pub normalized_amount: f64,
    pub urgent: bool,
    pub modified_at: DateTime<Utc>,
}

/// Aggregate root: Order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    id: OrderId,
    owner_id: Option<OwnerId>,
    content: String,
    money: Option<Money>,
    normalized_amount: f64,
    urgent: bool,
    status: OrderStatus,
    modification_count: u32,
    max_modifications: u32,
    modifications: Vec<Modification>,
    keyword: Option<String>,
    keyword_recorded_at: Option<DateTime<Utc>>,
    queue_slot: Option<QueueSlot>,
    reply: Option<String>,
    replied_at: Option<DateTime<Utc>>,
    refund_reason: Option<String>,
    cancel_reason: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    version: u64,
    created: bool,
}

impl Order {
    /// Create an empty, not-yet-submitted order (status `Draft`).
    pub fn empty(id: OrderId) -> Self {
        Self {
            id,
            owner_id: None,
            content: String::new(),
            money: None,
            normalized_amount: 0.0,
            urgent: false,
            status: OrderStatus::Draft,
            modification_count: 0,
            max_modifications: DEFAULT_MAX_MODIFICATIONS,
            modifications: Vec::new(),
            keyword: None,
            keyword_recorded_at: None,
            queue_slot: None,
            reply: None,
            replied_at: None,
            refund_reason: None,
            cancel_reason: None,
            created_at: DateTime::<Utc>::default(),
            updated_at: DateTime::<Utc>::default(),
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> OrderId {
        self.id
    }

    pub fn owner_id(&self) -> Option<OwnerId> {
        self.owner_id
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn money(&self) -> Option<Money> {
        self.money
    }

    /// Amount in the reference currency, used for scoring.
    pub fn normalized_amount(&self) -> f64 {
        self.normalized_amount
    }

    pub fn is_urgent(&self) -> bool {
        self.urgent
    }

    pub fn status(&self) -> OrderStatus {
        self.status
    }

    pub fn modification_count(&self) -> u32 {
        self.modification_count
    }

    pub fn max_modifications(&self) -> u32 {
        self.max_modifications
    }

    pub fn remaining_modifications(&self) -> u32 {
        self.max_modifications.saturating_sub(self.modification_count)
    }

    pub fn modifications(&self) -> &[Modification] {
        &self.modifications
    }

    pub fn keyword(&self) -> Option<&str> {
        self.keyword.as_deref()
    }

    pub fn keyword_recorded_at(&self) -> Option<DateTime<Utc>> {
        self.keyword_recorded_at
    }

    /// Persisted rank from the last rebuild; only present while active.
    pub fn queue_slot(&self) -> Option<QueueSlot> {
        self.queue_slot
    }

    pub fn reply(&self) -> Option<&str> {
        self.reply.as_deref()
    }

    pub fn replied_at(&self) -> Option<DateTime<Utc>> {
        self.replied_at
    }

    pub fn refund_reason(&self) -> Option<&str> {
        self.refund_reason.as_deref()
    }

    pub fn cancel_reason(&self) -> Option<&str> {
        self.cancel_reason.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    pub fn is_active(&self) -> bool {
        self.created && self.status.is_active()
    }

    /// Priority score evaluated at `now`.
    pub fn priority_score(&self, now: DateTime<Utc>) -> f64 {
        score::priority_score(self.normalized_amount, self.urgent, self.created_at, now)
    }
}

impl AggregateRoot for Order {
    type Id = OrderId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: SubmitOrder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitOrder {
    pub order_id: OrderId,
    pub owner_id: OwnerId,
    pub content: String,
    pub money: Money,
    pub normalized_amount: f64,
    pub urgent: bool,
    pub max_modifications: u32,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ConfirmPayment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmPayment {
    pub order_id: OrderId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: StartProcessing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartProcessing {
    pub order_id: OrderId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ModifyOrder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModifyOrder {
    pub order_id: OrderId,
    pub owner_id: OwnerId,
    pub content: String,
    pub money: Money,
    pub normalized_amount: f64,
    pub urgent: bool,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RecordKeyword.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordKeyword {
    pub order_id: OrderId,
    pub keyword: String,
    pub occurred_at: DateTime<Utc>,
}

/// Command: AssignQueueSlot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignQueueSlot {
    pub order_id: OrderId,
    pub slot: QueueSlot,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ReplyToOrder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyToOrder {
    pub order_id: OrderId,
    pub content: String,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RefundOrder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundOrder {
    pub order_id: OrderId,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CancelOrder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelOrder {
    pub order_id: OrderId,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OrderCommand {
    SubmitOrder(SubmitOrder),
    ConfirmPayment(ConfirmPayment),
    StartProcessing(StartProcessing),
    ModifyOrder(ModifyOrder),
    RecordKeyword(RecordKeyword),
    AssignQueueSlot(AssignQueueSlot),
    ReplyToOrder(ReplyToOrder),
    RefundOrder(RefundOrder),
    CancelOrder(CancelOrder),
}

/// Event: OrderSubmitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSubmitted {
    pub order_id: OrderId,
    pub owner_id: OwnerId,
    pub content: String,
    pub money: Money,
    pub normalized_amount: f64,
    pub urgent: bool,
    pub max_modifications: u32,
    pub occurred_at: DateTime<Utc>,
}

/// Event: PaymentConfirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentConfirmed {
    pub order_id: OrderId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ProcessingStarted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingStarted {
    pub order_id: OrderId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: OrderModified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderModified {
    pub order_id: OrderId,
    pub modification: Modification,
    pub occurred_at: DateTime<Utc>,
}

/// Event: KeywordRecorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordRecorded {
    pub order_id: OrderId,
    pub keyword: String,
    pub occurred_at: DateTime<Utc>,
}

/// Event: QueueSlotAssigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSlotAssigned {
    pub order_id: OrderId,
    pub slot: QueueSlot,
    pub occurred_at: DateTime<Utc>,
}

/// Event: OrderReplied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderReplied {
    pub order_id: OrderId,
    pub content: String,
    pub occurred_at: DateTime<Utc>,
}

/// Event: OrderRefunded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRefunded {
    pub order_id: OrderId,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

/// Event: OrderCancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCancelled {
    pub order_id: OrderId,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OrderEvent {
    OrderSubmitted(OrderSubmitted),
    PaymentConfirmed(PaymentConfirmed),
    ProcessingStarted(ProcessingStarted),
    OrderModified(OrderModified),
    KeywordRecorded(KeywordRecorded),
    QueueSlotAssigned(QueueSlotAssigned),
    OrderReplied(OrderReplied),
    OrderRefunded(OrderRefunded),
    OrderCancelled(OrderCancelled),
}

impl OrderEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            OrderEvent::OrderSubmitted(_) => "queue.order.submitted",
            OrderEvent::PaymentConfirmed(_) => "queue.order.payment_confirmed",
            OrderEvent::ProcessingStarted(_) => "queue.order.processing_started",
            OrderEvent::OrderModified(_) => "queue.order.modified",
            OrderEvent::KeywordRecorded(_) => "queue.order.keyword_recorded",
            OrderEvent::QueueSlotAssigned(_) => "queue.order.slot_assigned",
            OrderEvent::OrderReplied(_) => "queue.order.replied",
            OrderEvent::OrderRefunded(_) => "queue.order.refunded",
            OrderEvent::OrderCancelled(_) => "queue.order.cancelled",
        }
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            OrderEvent::OrderSubmitted(e) => e.occurred_at,
            OrderEvent::PaymentConfirmed(e) => e.occurred_at,
            OrderEvent::ProcessingStarted(e) => e.occurred_at,
            OrderEvent::OrderModified(e) => e.occurred_at,
            OrderEvent::KeywordRecorded(e) => e.occurred_at,
            OrderEvent::QueueSlotAssigned(e) => e.occurred_at,
            OrderEvent::OrderReplied(e) => e.occurred_at,
            OrderEvent::OrderRefunded(e) => e.occurred_at,
            OrderEvent::OrderCancelled(e) => e.occurred_at,
        }
    }
}

impl Aggregate for Order {
    type Command = OrderCommand;
    type Event = OrderEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            OrderEvent::OrderSubmitted(e) => {
                self.id = e.order_id;
                self.owner_id = Some(e.owner_id);
                self.content = e.content.clone();
                self.money = Some(e.money);
                self.normalized_amount = e.normalized_amount;
                self.urgent = e.urgent;
                self.status = OrderStatus::PendingPayment;
                self.max_modifications = e.max_modifications;
                self.created_at = e.occurred_at;
                self.created = true;
            }
            OrderEvent::PaymentConfirmed(_) => {
                self.status = OrderStatus::Queued;
            }
            OrderEvent::ProcessingStarted(_) => {
                self.status = OrderStatus::Processing;
            }
            OrderEvent::OrderModified(e) => {
                let m = &e.modification;
                self.content = m.content.clone();
                self.money = Some(m.money);
                self.normalized_amount = m.normalized_amount;
                self.urgent = m.urgent;
                self.modification_count = m.number;
                // New text needs a new summary.
                self.keyword = None;
                self.keyword_recorded_at = None;
                self.modifications.push(m.clone());
            }
            OrderEvent::KeywordRecorded(e) => {
                self.keyword = Some(e.keyword.clone());
                self.keyword_recorded_at = Some(e.occurred_at);
            }
            OrderEvent::QueueSlotAssigned(e) => {
                self.queue_slot = Some(e.slot);
            }
            OrderEvent::OrderReplied(e) => {
                self.status = OrderStatus::Completed;
                self.reply = Some(e.content.clone());
                self.replied_at = Some(e.occurred_at);
                self.queue_slot = None;
            }
            OrderEvent::OrderRefunded(e) => {
                self.status = OrderStatus::Refunded;
                self.refund_reason = Some(e.reason.clone());
                self.queue_slot = None;
            }
            OrderEvent::OrderCancelled(e) => {
                self.status = OrderStatus::Cancelled;
                self.cancel_reason = Some(e.reason.clone());
                self.queue_slot = None;
            }
        }

        self.updated_at = event.occurred_at();
        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            OrderCommand::SubmitOrder(cmd) => self.handle_submit(cmd),
            OrderCommand::ConfirmPayment(cmd) => self.handle_confirm_payment(cmd),
            OrderCommand::StartProcessing(cmd) => self.handle_start_processing(cmd),
            OrderCommand::ModifyOrder(cmd) => self.handle_modify(cmd),
            OrderCommand::RecordKeyword(cmd) => self.handle_record_keyword(cmd),
            OrderCommand::AssignQueueSlot(cmd) => self.handle_assign_slot(cmd),
            OrderCommand::ReplyToOrder(cmd) => self.handle_reply(cmd),
            OrderCommand::RefundOrder(cmd) => self.handle_refund(cmd),
            OrderCommand::CancelOrder(cmd) => self.handle_cancel(cmd),
        }
    }
}

fn validate_content(content: &str) -> Result<(), DomainError> {
    let chars = content.trim().chars().count();
    if chars == 0 {
        return Err(DomainError::validation("content must not be empty"));
    }
    if chars > MAX_CONTENT_CHARS {
        return Err(DomainError::validation(format!(
            "content must be at most {MAX_CONTENT_CHARS} characters"
        )));
    }
    Ok(())
}

fn validate_normalized_amount(amount: f64) -> Result<(), DomainError> {
    if !amount.is_finite() || amount <= 0.0 {
        return Err(DomainError::validation("normalized amount must be positive"));
    }
    Ok(())
}

impl Order {
    fn ensure_created(&self) -> Result<(), DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        Ok(())
    }

    fn ensure_order_id(&self, order_id: OrderId) -> Result<(), DomainError> {
        if self.id != order_id {
            return Err(DomainError::invariant("order_id mismatch"));
        }
        Ok(())
    }

    fn ensure_active(&self, action: &str) -> Result<(), DomainError> {
        if !self.status.is_active() {
            return Err(DomainError::invalid_transition(format!(
                "cannot {action} an order in status {}",
                self.status
            )));
        }
        Ok(())
    }

    fn handle_submit(&self, cmd: &SubmitOrder) -> Result<Vec<OrderEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("order already exists"));
        }
        validate_content(&cmd.content)?;
        validate_normalized_amount(cmd.normalized_amount)?;

        Ok(vec![OrderEvent::OrderSubmitted(OrderSubmitted {
            order_id: cmd.order_id,
            owner_id: cmd.owner_id,
            content: cmd.content.trim().to_string(),
            money: cmd.money,
            normalized_amount: cmd.normalized_amount,
            urgent: cmd.urgent,
            max_modifications: cmd.max_modifications,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_confirm_payment(
        &self,
        cmd: &ConfirmPayment,
    ) -> Result<Vec<OrderEvent>, DomainError> {
        self.ensure_created()?;
        self.ensure_order_id(cmd.order_id)?;

        if self.status != OrderStatus::PendingPayment {
            return Err(DomainError::invalid_transition(format!(
                "payment can only be confirmed while pending_payment (status: {})",
                self.status
            )));
        }

        Ok(vec![OrderEvent::PaymentConfirmed(PaymentConfirmed {
            order_id: cmd.order_id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_start_processing(
        &self,
        cmd: &StartProcessing,
    ) -> Result<Vec<OrderEvent>, DomainError> {
        self.ensure_created()?;
        self.ensure_order_id(cmd.order_id)?;

        if self.status != OrderStatus::Queued {
            return Err(DomainError::invalid_transition(format!(
                "only queued orders can start processing (status: {})",
                self.status
            )));
        }

        Ok(vec![OrderEvent::ProcessingStarted(ProcessingStarted {
            order_id: cmd.order_id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_modify(&self, cmd: &ModifyOrder) -> Result<Vec<OrderEvent>, DomainError> {
        self.ensure_created()?;
        self.ensure_order_id(cmd.order_id)?;

        // Someone else's order looks the same as a missing one.
        if self.owner_id != Some(cmd.owner_id) {
            return Err(DomainError::not_found());
        }

        if !self.status.is_editable() {
            return Err(DomainError::invalid_transition(format!(
                "cannot modify an order in status {}",
                self.status
            )));
        }

        if self.modification_count >= self.max_modifications {
            return Err(DomainError::ModificationLimitReached {
                limit: self.max_modifications,
            });
        }

        validate_content(&cmd.content)?;
        validate_normalized_amount(cmd.normalized_amount)?;

        Ok(vec![OrderEvent::OrderModified(OrderModified {
            order_id: cmd.order_id,
            modification: Modification {
                number: self.modification_count + 1,
                content: cmd.content.trim().to_string(),
                money: cmd.money,
                normalized_amount: cmd.normalized_amount,
                urgent: cmd.urgent,
                modified_at: cmd.occurred_at,
            },
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_record_keyword(
        &self,
        cmd: &RecordKeyword,
    ) -> Result<Vec<OrderEvent>, DomainError> {
        self.ensure_created()?;
        self.ensure_order_id(cmd.order_id)?;
        self.ensure_active("record a keyword on")?;

        if cmd.keyword.trim().is_empty() {
            return Err(DomainError::validation("keyword must not be empty"));
        }

        Ok(vec![OrderEvent::KeywordRecorded(KeywordRecorded {
            order_id: cmd.order_id,
            keyword: cmd.keyword.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_assign_slot(
        &self,
        cmd: &AssignQueueSlot,
    ) -> Result<Vec<OrderEvent>, DomainError> {
        self.ensure_created()?;
        self.ensure_order_id(cmd.order_id)?;
        self.ensure_active("rank")?;

        if cmd.slot.position == 0 {
            return Err(DomainError::validation("queue position is 1-based"));
        }

        Ok(vec![OrderEvent::QueueSlotAssigned(QueueSlotAssigned {
            order_id: cmd.order_id,
            slot: cmd.slot,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_reply(&self, cmd: &ReplyToOrder) -> Result<Vec<OrderEvent>, DomainError> {
        self.ensure_created()?;
        self.ensure_order_id(cmd.order_id)?;
        self.ensure_active("reply to")?;

        if cmd.content.trim().is_empty() {
            return Err(DomainError::validation("reply content must not be empty"));
        }

        Ok(vec![OrderEvent::OrderReplied(OrderReplied {
            order_id: cmd.order_id,
            content: cmd.content.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_refund(&self, cmd: &RefundOrder) -> Result<Vec<OrderEvent>, DomainError> {
        self.ensure_created()?;
        self.ensure_order_id(cmd.order_id)?;

        if self.status.is_terminal() {
            return Err(DomainError::invalid_transition(format!(
                "cannot refund an order in status {}",
                self.status
            )));
        }

        Ok(vec![OrderEvent::OrderRefunded(OrderRefunded {
            order_id: cmd.order_id,
            reason: cmd.reason.trim().to_string(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_cancel(&self, cmd: &CancelOrder) -> Result<Vec<OrderEvent>, DomainError> {
        self.ensure_created()?;
        self.ensure_order_id(cmd.order_id)?;

        if self.status != OrderStatus::PendingPayment {
            return Err(DomainError::invalid_transition(format!(
                "only unpaid orders can be cancelled (status: {})",
                self.status
            )));
        }

        Ok(vec![OrderEvent::OrderCancelled(OrderCancelled {
            order_id: cmd.order_id,
            reason: cmd.reason.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use augur_core::Currency;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 4, 9, 0, 0).unwrap()
    }

    fn cad(minor: i64) -> Money {
        Money::from_minor(minor, Currency::Cad).unwrap()
    }

    fn submit_cmd(order_id: OrderId, owner_id: OwnerId) -> SubmitOrder {
        SubmitOrder {
            order_id,
            owner_id,
            content: "  career questions for the coming year  ".to_string(),
            money: cad(10_000),
            normalized_amount: 100.0,
            urgent: false,
            max_modifications: DEFAULT_MAX_MODIFICATIONS,
            occurred_at: t0(),
        }
    }

    fn submitted() -> (Order, OwnerId) {
        let order_id = OrderId::new();
        let owner_id = OwnerId::new();
        let mut order = Order::empty(order_id);
        order
            .execute(&OrderCommand::SubmitOrder(submit_cmd(order_id, owner_id)))
            .unwrap();
        (order, owner_id)
    }

    fn queued() -> (Order, OwnerId) {
        let (mut order, owner) = submitted();
        order
            .execute(&OrderCommand::ConfirmPayment(ConfirmPayment {
                order_id: order.id_typed(),
                occurred_at: t0(),
            }))
            .unwrap();
        (order, owner)
    }

    fn modify_cmd(order: &Order, owner_id: OwnerId, content: &str) -> OrderCommand {
        OrderCommand::ModifyOrder(ModifyOrder {
            order_id: order.id_typed(),
            owner_id,
            content: content.to_string(),
            money: cad(20_000),
            normalized_amount: 200.0,
            urgent: true,
            occurred_at: t0(),
        })
    }

    #[test]
    fn submit_moves_draft_to_pending_payment() {
        let order_id = OrderId::new();
        let order = Order::empty(order_id);
        assert_eq!(order.status(), OrderStatus::Draft);

        let events = order
            .handle(&OrderCommand::SubmitOrder(submit_cmd(order_id, OwnerId::new())))
            .unwrap();
        assert_eq!(events.len(), 1);

        match &events[0] {
            OrderEvent::OrderSubmitted(e) => {
                assert_eq!(e.order_id, order_id);
                assert_eq!(e.content, "career questions for the coming year");
            }
            _ => panic!("Expected OrderSubmitted event"),
        }

        let (order, _) = submitted();
        assert_eq!(order.status(), OrderStatus::PendingPayment);
        assert_eq!(order.created_at(), t0());
        assert!(order.keyword().is_none());
        assert!(order.queue_slot().is_none());
    }

    #[test]
    fn submit_rejects_empty_and_oversized_content() {
        let order_id = OrderId::new();
        let order = Order::empty(order_id);

        let mut cmd = submit_cmd(order_id, OwnerId::new());
        cmd.content = "   ".to_string();
        let err = order.handle(&OrderCommand::SubmitOrder(cmd)).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));

        let mut cmd = submit_cmd(order_id, OwnerId::new());
        cmd.content = "字".repeat(MAX_CONTENT_CHARS + 1);
        let err = order.handle(&OrderCommand::SubmitOrder(cmd)).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));

        // Multi-byte text is measured in characters, not bytes.
        let mut cmd = submit_cmd(order_id, OwnerId::new());
        cmd.content = "字".repeat(MAX_CONTENT_CHARS);
        assert!(order.handle(&OrderCommand::SubmitOrder(cmd)).is_ok());
    }

    #[test]
    fn cannot_submit_twice() {
        let (order, owner) = submitted();
        let err = order
            .handle(&OrderCommand::SubmitOrder(submit_cmd(order.id_typed(), owner)))
            .unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
    }

    #[test]
    fn payment_confirmation_queues_order_once() {
        let (order, _) = queued();
        assert_eq!(order.status(), OrderStatus::Queued);
        assert!(order.is_active());

        let err = order
            .handle(&OrderCommand::ConfirmPayment(ConfirmPayment {
                order_id: order.id_typed(),
                occurred_at: t0(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidTransition(_)));
    }

    #[test]
    fn commands_on_unknown_order_are_not_found() {
        let order = Order::empty(OrderId::new());
        let err = order
            .handle(&OrderCommand::RefundOrder(RefundOrder {
                order_id: order.id_typed(),
                reason: "changed my mind".to_string(),
                occurred_at: t0(),
            }))
            .unwrap_err();
        assert_eq!(err, DomainError::NotFound);
    }

    #[test]
    fn modification_ceiling_is_enforced_with_visible_error() {
        let (mut order, owner) = queued();

        for i in 1..=DEFAULT_MAX_MODIFICATIONS {
            order
                .execute(&modify_cmd(&order, owner, &format!("edit number {i}")))
                .unwrap();
            assert_eq!(order.modification_count(), i);
        }
        assert_eq!(order.remaining_modifications(), 0);

        let err = order
            .handle(&modify_cmd(&order, owner, "one edit too many"))
            .unwrap_err();
        assert_eq!(
            err,
            DomainError::ModificationLimitReached {
                limit: DEFAULT_MAX_MODIFICATIONS
            }
        );
        assert_eq!(order.modification_count(), DEFAULT_MAX_MODIFICATIONS);
        assert_eq!(order.modifications().len() as u32, DEFAULT_MAX_MODIFICATIONS);
    }

    #[test]
    fn modification_updates_terms_and_clears_keyword() {
        let (mut order, owner) = queued();
        order
            .execute(&OrderCommand::RecordKeyword(RecordKeyword {
                order_id: order.id_typed(),
                keyword: "career, change".to_string(),
                occurred_at: t0(),
            }))
            .unwrap();
        assert_eq!(order.keyword(), Some("career, change"));

        order
            .execute(&modify_cmd(&order, owner, "new question about family"))
            .unwrap();

        assert_eq!(order.content(), "new question about family");
        assert_eq!(order.normalized_amount(), 200.0);
        assert!(order.is_urgent());
        assert!(order.keyword().is_none());
    }

    #[test]
    fn modification_by_another_owner_is_not_found() {
        let (order, _) = queued();
        let err = order
            .handle(&modify_cmd(&order, OwnerId::new(), "hijack"))
            .unwrap_err();
        assert_eq!(err, DomainError::NotFound);
    }

    #[test]
    fn processing_orders_cannot_be_modified() {
        let (mut order, owner) = queued();
        order
            .execute(&OrderCommand::StartProcessing(StartProcessing {
                order_id: order.id_typed(),
                occurred_at: t0(),
            }))
            .unwrap();

        let err = order.handle(&modify_cmd(&order, owner, "late edit")).unwrap_err();
        assert!(matches!(err, DomainError::InvalidTransition(_)));
    }

    #[test]
    fn keyword_requires_active_order() {
        let (order, _) = submitted();
        let err = order
            .handle(&OrderCommand::RecordKeyword(RecordKeyword {
                order_id: order.id_typed(),
                keyword: "too early".to_string(),
                occurred_at: t0(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidTransition(_)));
    }

    #[test]
    fn terminal_transitions_clear_queue_slot() {
        let (mut order, _) = queued();
        order
            .execute(&OrderCommand::AssignQueueSlot(AssignQueueSlot {
                order_id: order.id_typed(),
                slot: QueueSlot::new(1, 3),
                occurred_at: t0(),
            }))
            .unwrap();
        assert_eq!(order.queue_slot().map(|s| s.position), Some(1));

        order
            .execute(&OrderCommand::ReplyToOrder(ReplyToOrder {
                order_id: order.id_typed(),
                content: "Here is your reading.".to_string(),
                occurred_at: t0(),
            }))
            .unwrap();

        assert_eq!(order.status(), OrderStatus::Completed);
        assert!(order.queue_slot().is_none());
        assert_eq!(order.reply(), Some("Here is your reading."));
        assert!(!order.is_active());
    }

    #[test]
    fn refund_allowed_from_any_non_terminal_status() {
        let (mut pending, _) = submitted();
        pending
            .execute(&OrderCommand::RefundOrder(RefundOrder {
                order_id: pending.id_typed(),
                reason: "duplicate payment".to_string(),
                occurred_at: t0(),
            }))
            .unwrap();
        assert_eq!(pending.status(), OrderStatus::Refunded);
        assert_eq!(pending.refund_reason(), Some("duplicate payment"));

        let err = pending
            .handle(&OrderCommand::RefundOrder(RefundOrder {
                order_id: pending.id_typed(),
                reason: "again".to_string(),
                occurred_at: t0(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidTransition(_)));
    }

    #[test]
    fn only_unpaid_orders_can_be_cancelled() {
        let (mut pending, _) = submitted();
        pending
            .execute(&OrderCommand::CancelOrder(CancelOrder {
                order_id: pending.id_typed(),
                reason: "payment window expired".to_string(),
                occurred_at: t0(),
            }))
            .unwrap();
        assert_eq!(pending.status(), OrderStatus::Cancelled);
        assert_eq!(pending.cancel_reason(), Some("payment window expired"));

        let (queued, _) = queued();
        let err = queued
            .handle(&OrderCommand::CancelOrder(CancelOrder {
                order_id: queued.id_typed(),
                reason: "nope".to_string(),
                occurred_at: t0(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidTransition(_)));
    }

    #[test]
    fn version_increments_on_apply() {
        let (order, _) = queued();
        assert_eq!(order.version(), 2);
    }

    #[test]
    fn handle_does_not_mutate_state() {
        let (order, owner) = queued();
        let before = order.clone();

        let cmd = modify_cmd(&order, owner, "same edit");
        let events1 = order.handle(&cmd).unwrap();
        let events2 = order.handle(&cmd).unwrap();

        assert_eq!(order, before);
        assert_eq!(events1, events2);
    }

    #[test]
    fn queue_slot_percentile_uses_total_plus_one() {
        let slot = QueueSlot::new(1, 3);
        assert_eq!(slot.percentile, 25.0);

        let slot = QueueSlot::new(2, 2);
        assert_eq!(slot.percentile, 66.67);
    }
}
