use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use uuid::Uuid;

use super::{
    delivery::DeliveryEngine,
    topic::{RetentionPolicy, TopicRegistry},
    DeliveryGuarantee, GuaranteeKind, Message, MessageKind, RetryPolicy,
};
use crate::{BrokerError, BrokerResult};

/// Префикс приватных reply-тем.
const REPLY_PREFIX: &str = "_reply.";

/// Протокол корреляции запрос/ответ.
///
/// `request` выводит приватный reply-subject из корреляционного id,
/// подписывает отправителя на него и ждёт первый ответ в пределах
/// таймаута. Временная тема и подписка сносятся ровно один раз —
/// что бы ни наступило раньше, ответ или таймаут.
pub struct CorrelationManager {
    topics: Arc<TopicRegistry>,
    delivery: Arc<DeliveryEngine>,
}

impl CorrelationManager {
    pub fn new(topics: Arc<TopicRegistry>, delivery: Arc<DeliveryEngine>) -> Self {
        Self { topics, delivery }
    }

    pub async fn request(
        &self,
        from: &str,
        to: &str,
        subject: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> BrokerResult<Bytes> {
        let correlation_id = Uuid::new_v4();
        let reply_subject = format!("{REPLY_PREFIX}{correlation_id}");
        self.topics
            .create(&reply_subject, Some(RetentionPolicy::Last))?;

        let (tx, rx) = oneshot::channel::<Bytes>();
        let slot = Arc::new(Mutex::new(Some(tx)));
        let handler_slot = slot.clone();
        let subscription = self.topics.subscribe(
            from,
            &reply_subject,
            Arc::new(move |reply: &Message| {
                // Засчитывается только первый ответ.
                if let Some(tx) = handler_slot.lock().take() {
                    let _ = tx.send(reply.payload.clone());
                }
            }),
        )?;

        let mut message = Message::new(MessageKind::Request, from, subject, payload)
            .with_to(vec![to.to_string()])
            .with_correlation(correlation_id, reply_subject.clone());
        message.metadata.max_retries = 1;
        // Одиночный повтор, окно повтора ограничено таймаутом запроса.
        let guarantee = DeliveryGuarantee {
            kind: GuaranteeKind::AtLeastOnce,
            ack_timeout: timeout,
            retry: RetryPolicy {
                max_retries: 1,
                backoff_multiplier: 2.0,
                max_backoff: timeout,
            },
        };
        // Немедленный отказ не прерывает ожидание: фоновый повтор
        // может ещё добраться до получателя в пределах окна.
        if let Err(err) = self.delivery.send(message, guarantee).await {
            tracing::debug!(%err, %correlation_id, "request send failed, awaiting retry window");
        }

        let outcome = tokio::time::timeout(timeout, rx).await;

        subscription.unsubscribe();
        self.topics.remove(&reply_subject);

        match outcome {
            Ok(Ok(payload)) => Ok(payload),
            _ => Err(BrokerError::Timeout),
        }
    }

    /// Публикует ответ в `reply_to` исходного сообщения, наследуя
    /// корреляционный id.
    pub fn reply(&self, original: &Message, payload: Bytes) -> BrokerResult<()> {
        let reply_to = original
            .metadata
            .reply_to
            .clone()
            .ok_or(BrokerError::MissingReplyTo)?;
        let responder = original.to.first().cloned().unwrap_or_default();
        let mut response = Message::new(MessageKind::Response, responder, reply_to.clone(), payload);
        response.metadata.correlation_id = original.metadata.correlation_id;
        self.topics.publish(&reply_to, response)?;
        Ok(())
    }
}
