use thiserror::Error;

/// Ошибка единичной попытки доставки сообщения получателю.
///
/// Движок доставки перехватывает её, планирует повтор или отправляет
/// сообщение в dead-letter, и дополнительно пробрасывает первую попытку
/// вызывающей стороне `send` (задокументированная асимметрия дизайна).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("no agent registered for id {0}")]
    AgentNotFound(String),

    #[error("recipient rejected message: {0}")]
    Rejected(String),

    #[error("actor mailbox for {0} is closed")]
    MailboxClosed(String),
}
