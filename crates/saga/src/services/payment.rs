//! Payment service: authorizes and voids payments through the gateway.
//!
//! Gateway calls go through the `payment-gateway` circuit breaker. Only
//! transient gateway errors count as breaker failures; a decline is a
//! business answer, not an outage.
//!
//! A PENDING payment is committed before the gateway is asked to authorize,
//! so a cancellation that lands during the call is recorded against it. An
//! authorization that comes back after such a cancellation is still
//! recorded and announced, then voided like any other approved payment.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use common::OrderId;
use messaging::{
    Delivery, EventEnvelope, MessageHandler, OrderCancelData, OrderCreatedData, PaymentData,
    SagaEvent, Topic,
};
use outbox::Database;
use resilience::{BreakerError, CircuitBreaker, CircuitBreakerRegistry};
use serde::Serialize;
use uuid::Uuid;

use crate::cancel::{CancelRequestStatus, CancelRequests};
use crate::consumer::{consume, settle_error};
use crate::error::SagaError;
use crate::gateway::{GatewayError, PAYMENT_GATEWAY, PaymentGateway};

/// Consumer group and outbox owner name.
pub const PAYMENT_SERVICE: &str = "payment-service";

const AGGREGATE: &str = "Payment";

/// Lifecycle of a payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    /// Authorization requested; the gateway's answer is not recorded yet.
    Pending,
    Approved,
    Declined,
    Canceled,
    /// Voiding was refused by the gateway; needs an operator.
    CancelFailed,
}

/// A payment for one order.
#[derive(Debug, Clone, Serialize)]
pub struct Payment {
    /// Gateway payment id. `None` while pending and for declined payments.
    pub payment_id: Option<Uuid>,
    pub order_id: OrderId,
    pub amount_cents: i64,
    pub status: PaymentStatus,
    pub failure_reason: Option<String>,
}

/// Payment service state.
#[derive(Debug, Clone, Default)]
pub struct PaymentState {
    payments: HashMap<OrderId, Payment>,
    cancel_requests: CancelRequests,
}

/// Owns payments for orders.
pub struct PaymentService<G> {
    db: Database<PaymentState>,
    gateway: G,
    breaker: Arc<CircuitBreaker>,
}

impl<G: PaymentGateway> PaymentService<G> {
    /// Creates the service. The gateway breaker comes from `breakers`.
    pub fn new(gateway: G, breakers: &CircuitBreakerRegistry) -> Self {
        Self {
            db: Database::new(PAYMENT_SERVICE, PaymentState::default()),
            gateway,
            breaker: breakers.get(PAYMENT_GATEWAY),
        }
    }

    /// The service's datastore (outbox included).
    pub fn database(&self) -> &Database<PaymentState> {
        &self.db
    }

    /// The payment for an order, if any.
    pub async fn payment(&self, order_id: OrderId) -> Option<Payment> {
        self.db.read(|s| s.payments.get(&order_id).cloned()).await
    }

    /// Runs a gateway call through the breaker.
    ///
    /// `Ok(Err(reason))` is a decline. `Err(delivery)` is how the consumer
    /// should settle: `Defer` while the breaker is open, `Retry` on outages.
    async fn call_gateway<T, Fut>(
        &self,
        call: Fut,
    ) -> std::result::Result<std::result::Result<T, String>, Delivery>
    where
        Fut: Future<Output = std::result::Result<T, GatewayError>>,
    {
        let outcome = self
            .breaker
            .execute(|| async move {
                match call.await {
                    Ok(value) => Ok(Ok(value)),
                    Err(GatewayError::Declined(reason)) => Ok(Err(reason)),
                    Err(e) => Err(e),
                }
            })
            .await;

        match outcome {
            Ok(result) => Ok(result),
            Err(BreakerError::Open { retry_after, .. }) => {
                tracing::info!(
                    dependency = PAYMENT_GATEWAY,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "Gateway breaker open; deferring"
                );
                Err(Delivery::Defer(retry_after))
            }
            Err(BreakerError::Operation(e)) => Err(SagaError::from(e).into_delivery()),
        }
    }

    async fn approve(&self, envelope: &EventEnvelope, data: &OrderCreatedData) -> Delivery {
        if self.db.has_processed(envelope.event_id).await {
            return Delivery::Duplicate;
        }
        let order_id = data.order_id;
        let (payment, cancel_request) = self
            .db
            .read(|s| {
                (
                    s.payments.get(&order_id).cloned(),
                    s.cancel_requests.get(order_id).map(|r| r.status),
                )
            })
            .await;

        match payment {
            None if cancel_request.is_some() => {
                return consume(&self.db, envelope, |tx| {
                    if let Some(request) = tx.state_mut().cancel_requests.take(order_id) {
                        tracing::info!(
                            %order_id,
                            cancel_event_id = %request.cancel_event_id,
                            "Cancellation already on record; not charging"
                        );
                    }
                    Ok(())
                })
                .await;
            }
            None => {
                if let Err(delivery) = self.record_pending(envelope, data).await {
                    return delivery;
                }
            }
            // An earlier attempt may have reached the gateway; approve is
            // idempotent per order, so ask again.
            Some(Payment {
                status: PaymentStatus::Pending,
                ..
            }) => {}
            Some(Payment {
                payment_id: Some(payment_id),
                status: PaymentStatus::Approved,
                amount_cents,
                ..
            }) if cancel_request == Some(CancelRequestStatus::Requested) => {
                return self.void(envelope, order_id, payment_id, amount_cents).await;
            }
            Some(_) => return consume(&self.db, envelope, |_| Ok(())).await,
        }

        let authorization = match self
            .call_gateway(self.gateway.approve(order_id, data.amount_cents))
            .await
        {
            Ok(authorization) => authorization,
            Err(delivery) => return delivery,
        };

        let payment_id = match authorization {
            Ok(payment_id) => payment_id,
            Err(reason) => {
                return consume(&self.db, envelope, |tx| {
                    let state = tx.state_mut();
                    state.cancel_requests.take(order_id);
                    state.payments.insert(
                        order_id,
                        Payment {
                            payment_id: None,
                            order_id,
                            amount_cents: data.amount_cents,
                            status: PaymentStatus::Declined,
                            failure_reason: Some(reason.clone()),
                        },
                    );
                    tx.enqueue(
                        AGGREGATE,
                        order_id.as_uuid(),
                        SagaEvent::payment_approval_failed(order_id, reason),
                    )?;
                    tracing::info!(%order_id, "Payment declined");
                    Ok(())
                })
                .await;
            }
        };

        // The approval is committed even when a cancel arrived during the
        // gateway call. Such an envelope stays out of the ledger until the
        // void settles, so a redelivery retries the void.
        let mut tx = self.db.begin().await;
        let cancel_pending = tx.state().cancel_requests.is_pending(order_id);
        tx.state_mut().payments.insert(
            order_id,
            Payment {
                payment_id: Some(payment_id),
                order_id,
                amount_cents: data.amount_cents,
                status: PaymentStatus::Approved,
                failure_reason: None,
            },
        );
        let approved = SagaEvent::PaymentApproved(PaymentData {
            order_id,
            payment_id,
            amount_cents: data.amount_cents,
        });
        if let Err(e) = tx.enqueue(AGGREGATE, order_id.as_uuid(), approved) {
            return settle_error(self.db.name(), envelope, SagaError::from(e));
        }
        if !cancel_pending {
            tx.mark_processed(envelope.event_id, envelope.event_type.clone());
        }
        if let Err(e) = tx.commit().await {
            return settle_error(self.db.name(), envelope, SagaError::from(e));
        }
        tracing::info!(%order_id, %payment_id, "Payment approved");

        if !cancel_pending {
            return Delivery::Ack;
        }
        tracing::warn!(%order_id, %payment_id, "Authorized after cancellation; voiding");
        self.void(envelope, order_id, payment_id, data.amount_cents).await
    }

    /// Commits a PENDING payment before the gateway is called, so a cancel
    /// arriving mid-call is recorded against it.
    async fn record_pending(
        &self,
        envelope: &EventEnvelope,
        data: &OrderCreatedData,
    ) -> std::result::Result<(), Delivery> {
        let mut tx = self.db.begin().await;
        tx.state_mut().payments.insert(
            data.order_id,
            Payment {
                payment_id: None,
                order_id: data.order_id,
                amount_cents: data.amount_cents,
                status: PaymentStatus::Pending,
                failure_reason: None,
            },
        );
        tx.commit()
            .await
            .map_err(|e| settle_error(self.db.name(), envelope, SagaError::from(e)))
    }

    /// Voids an approved payment and records the outcome.
    ///
    /// `envelope` is settled in the same transaction, which also applies
    /// any pending cancel request for the order.
    async fn void(
        &self,
        envelope: &EventEnvelope,
        order_id: OrderId,
        payment_id: Uuid,
        amount_cents: i64,
    ) -> Delivery {
        let voided = match self.call_gateway(self.gateway.cancel(payment_id)).await {
            Ok(voided) => voided,
            Err(delivery) => return delivery,
        };

        consume(&self.db, envelope, |tx| {
            let (status, reason, event) = match voided {
                Ok(()) => (
                    PaymentStatus::Canceled,
                    None,
                    SagaEvent::PaymentCanceled(PaymentData {
                        order_id,
                        payment_id,
                        amount_cents,
                    }),
                ),
                Err(reason) => {
                    tracing::error!(%order_id, %payment_id, %reason, "Payment void refused; saga needs recovery");
                    (
                        PaymentStatus::CancelFailed,
                        Some(reason.clone()),
                        SagaEvent::payment_cancel_failed(order_id, reason),
                    )
                }
            };
            let state = tx.state_mut();
            state.cancel_requests.take(order_id);
            if let Some(payment) = state.payments.get_mut(&order_id) {
                payment.status = status;
                payment.failure_reason = reason;
            }
            tx.enqueue(AGGREGATE, order_id.as_uuid(), event)?;
            Ok(())
        })
        .await
    }

    async fn cancel(&self, envelope: &EventEnvelope, data: &OrderCancelData) -> Delivery {
        if self.db.has_processed(envelope.event_id).await {
            return Delivery::Duplicate;
        }
        let order_id = data.order_id;

        match self.payment(order_id).await {
            Some(Payment {
                payment_id: Some(payment_id),
                status: PaymentStatus::Approved,
                amount_cents,
                ..
            }) => self.void(envelope, order_id, payment_id, amount_cents).await,
            _ => {
                consume(&self.db, envelope, |tx| {
                    let state = tx.state_mut();
                    let awaiting_gateway = state
                        .payments
                        .get(&order_id)
                        .is_none_or(|p| p.status == PaymentStatus::Pending);
                    if awaiting_gateway {
                        state
                            .cancel_requests
                            .record(order_id, envelope.event_id, data.reason.clone());
                        tracing::info!(%order_id, "Cancel arrived before payment; recorded intent");
                    }
                    Ok(())
                })
                .await
            }
        }
    }
}

#[async_trait]
impl<G: PaymentGateway> MessageHandler for PaymentService<G> {
    fn name(&self) -> &str {
        PAYMENT_SERVICE
    }

    fn topics(&self) -> Vec<Topic> {
        vec![Topic::OrderCreated, Topic::OrderCancel]
    }

    #[tracing::instrument(
        skip(self, envelope),
        fields(event_id = %envelope.event_id, event_type = %envelope.event_type, order_id = %envelope.order_id())
    )]
    async fn handle(&self, envelope: &EventEnvelope) -> Delivery {
        match &envelope.payload {
            SagaEvent::OrderCreated(data) => self.approve(envelope, data).await,
            SagaEvent::OrderCancelRequested(data) => self.cancel(envelope, data).await,
            _ => Delivery::Ack,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::gateway::InMemoryPaymentGateway;
    use chrono::Utc;
    use common::{HubId, ProductId};
    use messaging::OrderLine;
    use resilience::{CircuitBreakerConfig, CircuitState};
    use tokio::sync::Notify;

    fn breakers() -> CircuitBreakerRegistry {
        CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 2,
            success_threshold: 1,
            timeout: Duration::from_secs(30),
        })
    }

    fn service() -> (PaymentService<InMemoryPaymentGateway>, InMemoryPaymentGateway) {
        let gateway = InMemoryPaymentGateway::new();
        (PaymentService::new(gateway.clone(), &breakers()), gateway)
    }

    /// Holds every approve call until released.
    #[derive(Clone, Default)]
    struct HeldGateway {
        inner: InMemoryPaymentGateway,
        entered: Arc<Notify>,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl PaymentGateway for HeldGateway {
        async fn approve(&self, order_id: OrderId, amount_cents: i64) -> Result<Uuid, GatewayError> {
            self.entered.notify_one();
            self.release.notified().await;
            self.inner.approve(order_id, amount_cents).await
        }

        async fn cancel(&self, payment_id: Uuid) -> Result<(), GatewayError> {
            self.inner.cancel(payment_id).await
        }
    }

    /// Starts handling `create` and returns once the gateway call is in flight.
    async fn approve_in_flight(
        gateway: &HeldGateway,
        create: EventEnvelope,
    ) -> (
        Arc<PaymentService<HeldGateway>>,
        tokio::task::JoinHandle<Delivery>,
    ) {
        let service = Arc::new(PaymentService::new(gateway.clone(), &breakers()));
        let task = tokio::spawn({
            let service = service.clone();
            async move { service.handle(&create).await }
        });
        gateway.entered.notified().await;
        (service, task)
    }

    fn order_created(order_id: OrderId) -> EventEnvelope {
        EventEnvelope::new(SagaEvent::OrderCreated(OrderCreatedData {
            order_id,
            customer_id: "customer-1".into(),
            lines: vec![OrderLine {
                product_id: ProductId::new("SKU-001"),
                quantity: 1,
            }],
            amount_cents: 2500,
            origin_hub: HubId::new(),
            destination_hub: HubId::new(),
            created_at: Utc::now(),
        }))
    }

    fn outbox_types(rows: Vec<outbox::OutboxEvent>) -> Vec<String> {
        rows.into_iter().map(|r| r.event_type).collect()
    }

    #[tokio::test]
    async fn approves_and_emits_payment_approved() {
        let (service, gateway) = service();
        let order_id = OrderId::new();

        assert_eq!(service.handle(&order_created(order_id)).await, Delivery::Ack);

        let payment = service.payment(order_id).await.unwrap();
        assert_eq!(payment.status, PaymentStatus::Approved);
        assert_eq!(gateway.active_count(), 1);
        assert_eq!(
            outbox_types(service.database().outbox_rows().await),
            vec!["PaymentApproved"]
        );
    }

    #[tokio::test]
    async fn duplicate_does_not_call_gateway_again() {
        let (service, gateway) = service();
        let envelope = order_created(OrderId::new());

        service.handle(&envelope).await;
        assert_eq!(service.handle(&envelope).await, Delivery::Duplicate);
        assert_eq!(gateway.approve_calls(), 1);
    }

    #[tokio::test]
    async fn decline_is_a_business_failure() {
        let (service, gateway) = service();
        gateway.set_decline_above(Some(1000));
        let order_id = OrderId::new();

        assert_eq!(service.handle(&order_created(order_id)).await, Delivery::Ack);

        assert_eq!(
            service.payment(order_id).await.unwrap().status,
            PaymentStatus::Declined
        );
        assert_eq!(
            outbox_types(service.database().outbox_rows().await),
            vec!["PaymentApprovalFailed"]
        );
        assert_eq!(service.breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn outage_retries_then_open_breaker_defers() {
        let (service, gateway) = service();
        gateway.set_fail_on_approve(Some(GatewayError::Unavailable("timeout".into())));
        let envelope = order_created(OrderId::new());

        assert!(matches!(
            service.handle(&envelope).await,
            Delivery::Retry { .. }
        ));
        assert!(matches!(
            service.handle(&envelope).await,
            Delivery::Retry { .. }
        ));
        assert_eq!(
            service.handle(&envelope).await,
            Delivery::Defer(Duration::from_secs(30))
        );
        assert_eq!(gateway.approve_calls(), 2);

        gateway.set_fail_on_approve(None);
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(service.handle(&envelope).await, Delivery::Ack);
        assert_eq!(service.breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn cancel_voids_approved_payment() {
        let (service, gateway) = service();
        let order_id = OrderId::new();
        service.handle(&order_created(order_id)).await;
        let payment_id = service.payment(order_id).await.unwrap().payment_id.unwrap();

        let cancel = EventEnvelope::new(SagaEvent::order_cancel_requested(order_id, "no stock"));
        assert_eq!(service.handle(&cancel).await, Delivery::Ack);

        assert!(gateway.is_voided(payment_id));
        assert_eq!(
            service.payment(order_id).await.unwrap().status,
            PaymentStatus::Canceled
        );
        assert_eq!(
            outbox_types(service.database().outbox_rows().await),
            vec!["PaymentApproved", "PaymentCanceled"]
        );
    }

    #[tokio::test]
    async fn refused_void_emits_cancel_failed() {
        let (service, gateway) = service();
        let order_id = OrderId::new();
        service.handle(&order_created(order_id)).await;
        gateway.set_fail_on_cancel(Some(GatewayError::Declined("already settled".into())));

        let cancel = EventEnvelope::new(SagaEvent::order_cancel_requested(order_id, "no stock"));
        assert_eq!(service.handle(&cancel).await, Delivery::Ack);

        assert_eq!(
            service.payment(order_id).await.unwrap().status,
            PaymentStatus::CancelFailed
        );
        assert_eq!(
            outbox_types(service.database().outbox_rows().await),
            vec!["PaymentApproved", "PaymentCancelFailed"]
        );
    }

    #[tokio::test]
    async fn cancel_before_create_never_charges() {
        let (service, gateway) = service();
        let order_id = OrderId::new();

        let cancel = EventEnvelope::new(SagaEvent::order_cancel_requested(order_id, "declined"));
        assert_eq!(service.handle(&cancel).await, Delivery::Ack);
        assert_eq!(service.handle(&order_created(order_id)).await, Delivery::Ack);

        assert_eq!(gateway.approve_calls(), 0);
        assert!(service.payment(order_id).await.is_none());
        assert!(service.database().outbox_rows().await.is_empty());
    }

    #[tokio::test]
    async fn cancel_during_authorization_voids_the_payment() {
        let gateway = HeldGateway::default();
        let order_id = OrderId::new();
        let (service, approving) = approve_in_flight(&gateway, order_created(order_id)).await;
        assert_eq!(
            service.payment(order_id).await.unwrap().status,
            PaymentStatus::Pending
        );

        let cancel = EventEnvelope::new(SagaEvent::order_cancel_requested(order_id, "no stock"));
        assert_eq!(service.handle(&cancel).await, Delivery::Ack);
        gateway.release.notify_one();
        assert_eq!(approving.await.unwrap(), Delivery::Ack);

        let payment = service.payment(order_id).await.unwrap();
        assert_eq!(payment.status, PaymentStatus::Canceled);
        assert!(gateway.inner.is_voided(payment.payment_id.unwrap()));
        assert_eq!(gateway.inner.active_count(), 0);
        assert_eq!(
            outbox_types(service.database().outbox_rows().await),
            vec!["PaymentApproved", "PaymentCanceled"]
        );
    }

    #[tokio::test]
    async fn refused_void_after_late_cancel_is_reported() {
        let gateway = HeldGateway::default();
        gateway
            .inner
            .set_fail_on_cancel(Some(GatewayError::Declined("already captured".into())));
        let order_id = OrderId::new();
        let (service, approving) = approve_in_flight(&gateway, order_created(order_id)).await;

        let cancel = EventEnvelope::new(SagaEvent::order_cancel_requested(order_id, "no stock"));
        assert_eq!(service.handle(&cancel).await, Delivery::Ack);
        gateway.release.notify_one();
        assert_eq!(approving.await.unwrap(), Delivery::Ack);

        let payment = service.payment(order_id).await.unwrap();
        assert_eq!(payment.status, PaymentStatus::CancelFailed);
        assert_eq!(payment.failure_reason.as_deref(), Some("already captured"));
        assert_eq!(
            outbox_types(service.database().outbox_rows().await),
            vec!["PaymentApproved", "PaymentCancelFailed"]
        );
        assert_eq!(service.database().processed_count().await, 2);
    }

    #[tokio::test]
    async fn late_void_outage_is_retried_on_redelivery() {
        let gateway = HeldGateway::default();
        gateway
            .inner
            .set_fail_on_cancel(Some(GatewayError::Unavailable("timeout".into())));
        let order_id = OrderId::new();
        let create = order_created(order_id);
        let (service, approving) = approve_in_flight(&gateway, create.clone()).await;

        let cancel = EventEnvelope::new(SagaEvent::order_cancel_requested(order_id, "no stock"));
        assert_eq!(service.handle(&cancel).await, Delivery::Ack);
        gateway.release.notify_one();
        assert!(matches!(approving.await.unwrap(), Delivery::Retry { .. }));
        assert_eq!(
            service.payment(order_id).await.unwrap().status,
            PaymentStatus::Approved
        );

        gateway.inner.set_fail_on_cancel(None);
        assert_eq!(service.handle(&create).await, Delivery::Ack);

        assert_eq!(
            service.payment(order_id).await.unwrap().status,
            PaymentStatus::Canceled
        );
        assert_eq!(gateway.inner.approve_calls(), 1);
        assert_eq!(
            outbox_types(service.database().outbox_rows().await),
            vec!["PaymentApproved", "PaymentCanceled"]
        );
    }

    #[tokio::test]
    async fn cancel_after_failed_authorization_voids_on_redelivery() {
        let (service, gateway) = service();
        gateway.set_fail_on_approve(Some(GatewayError::Unavailable("timeout".into())));
        let order_id = OrderId::new();
        let create = order_created(order_id);

        assert!(matches!(
            service.handle(&create).await,
            Delivery::Retry { .. }
        ));
        let cancel = EventEnvelope::new(SagaEvent::order_cancel_requested(order_id, "no stock"));
        assert_eq!(service.handle(&cancel).await, Delivery::Ack);

        gateway.set_fail_on_approve(None);
        assert_eq!(service.handle(&create).await, Delivery::Ack);

        assert_eq!(
            service.payment(order_id).await.unwrap().status,
            PaymentStatus::Canceled
        );
        assert_eq!(gateway.active_count(), 0);
    }
}
