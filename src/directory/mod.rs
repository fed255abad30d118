//! Справочник агентов — граница с внешней средой исполнения.
//!
//! Брокер не владеет агентами: он лишь резолвит id получателя в
//! зарегистрированный [`Agent`] и вручает сообщение. Регистрацию и
//! снятие агентов сериализует владелец справочника (рантайм агентов).
//! Опциональный актёрный транспорт подключается через [`ActorMailbox`]:
//! если для agent id зарегистрирован mailbox, unicast-доставка идёт
//! через `cast`, минуя прямой `receive`.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::{broker::Message, error::DeliveryError};

/// Получатель сообщений.
#[async_trait]
pub trait Agent: Send + Sync {
    async fn receive(&self, message: Message) -> Result<(), DeliveryError>;
}

/// Альтернативный транспорт доставки: почтовый ящик актёра.
#[async_trait]
pub trait ActorMailbox: Send + Sync {
    async fn cast(&self, message: Message) -> Result<(), DeliveryError>;
}

/// Реестр агентов и их актёрных ящиков.
#[derive(Default)]
pub struct AgentDirectory {
    agents: DashMap<String, Arc<dyn Agent>>,
    mailboxes: DashMap<String, Arc<dyn ActorMailbox>>,
}

impl AgentDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, agent_id: impl Into<String>, agent: Arc<dyn Agent>) {
        self.agents.insert(agent_id.into(), agent);
    }

    /// Снимает агента вместе с его ящиком.
    pub fn unregister(&self, agent_id: &str) {
        self.agents.remove(agent_id);
        self.mailboxes.remove(agent_id);
    }

    pub fn resolve(&self, agent_id: &str) -> Option<Arc<dyn Agent>> {
        self.agents.get(agent_id).map(|a| a.value().clone())
    }

    pub fn register_mailbox(&self, agent_id: impl Into<String>, mailbox: Arc<dyn ActorMailbox>) {
        self.mailboxes.insert(agent_id.into(), mailbox);
    }

    pub fn mailbox(&self, agent_id: &str) -> Option<Arc<dyn ActorMailbox>> {
        self.mailboxes.get(agent_id).map(|m| m.value().clone())
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.agents.contains_key(agent_id)
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}
