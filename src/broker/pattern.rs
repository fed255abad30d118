use std::sync::Arc;

use parking_lot::RwLock;

use super::Message;
use crate::{BrokerError, BrokerResult};

/// Обработчик, вызываемый при совпадении subject с шаблоном.
///
/// Вызывается синхронно в порядке регистрации и не ожидается:
/// fire-and-forget, блокировать роутер нельзя.
pub type PatternHandler = Arc<dyn Fn(&Message) + Send + Sync>;

/// Токен скомпилированного шаблона subject.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PatternToken {
    /// Литеральный сегмент, сравнивается как есть (точка экранирована
    /// самой сегментацией).
    Literal(String),
    /// `*` — ровно один сегмент.
    OneSegment,
    /// `#` — ноль или больше сегментов, включая точки.
    Rest,
}

/// Скомпилированный шаблон: `*` — ровно один сегмент между точками,
/// `#` — любая последовательность сегментов. Сопоставление заякорено:
/// шаблон должен покрыть subject целиком.
#[derive(Debug, Clone)]
pub struct SubjectPattern {
    raw: Arc<str>,
    tokens: Vec<PatternToken>,
}

impl SubjectPattern {
    pub fn compile(pattern: &str) -> BrokerResult<Self> {
        if pattern.is_empty() {
            return Err(BrokerError::InvalidPattern(pattern.to_string()));
        }
        let mut tokens = Vec::new();
        for segment in pattern.split('.') {
            match segment {
                "" => return Err(BrokerError::InvalidPattern(pattern.to_string())),
                "*" => tokens.push(PatternToken::OneSegment),
                "#" => tokens.push(PatternToken::Rest),
                lit => tokens.push(PatternToken::Literal(lit.to_string())),
            }
        }
        Ok(Self {
            raw: super::intern_subject(pattern),
            tokens,
        })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, subject: &str) -> bool {
        if subject.is_empty() {
            return false;
        }
        let segments: Vec<&str> = subject.split('.').collect();
        match_tokens(&self.tokens, &segments)
    }
}

fn match_tokens(tokens: &[PatternToken], segments: &[&str]) -> bool {
    match tokens.split_first() {
        None => segments.is_empty(),
        Some((PatternToken::Rest, rest)) => {
            // `#` поглощает от нуля сегментов до всего хвоста.
            (0..=segments.len()).any(|skip| match_tokens(rest, &segments[skip..]))
        }
        Some((token, rest)) => match segments.split_first() {
            Some((segment, tail)) => {
                let seg_ok = match token {
                    PatternToken::Literal(lit) => lit == segment,
                    PatternToken::OneSegment => !segment.is_empty(),
                    PatternToken::Rest => unreachable!(),
                };
                seg_ok && match_tokens(rest, tail)
            }
            None => false,
        },
    }
}

struct PatternEntry {
    pattern: SubjectPattern,
    /// agent id → обработчик; порядок регистрации сохраняется.
    handlers: Vec<(String, PatternHandler)>,
}

/// Роутер wildcard-подписок.
///
/// Шаблон компилируется один раз на уникальную строку; повторная
/// регистрация того же шаблона сливает наборы обработчиков, а пара
/// `(pattern, agent_id)` заменяет прежний обработчик агента.
#[derive(Default)]
pub struct PatternRouter {
    entries: RwLock<Vec<PatternEntry>>,
}

impl PatternRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        pattern: &str,
        agent_id: impl Into<String>,
        handler: PatternHandler,
    ) -> BrokerResult<()> {
        let agent_id = agent_id.into();
        let mut entries = self.entries.write();
        if let Some(entry) = entries.iter_mut().find(|e| e.pattern.raw() == pattern) {
            // Компиляция кэширована: существующая запись переиспользуется.
            match entry.handlers.iter_mut().find(|(id, _)| *id == agent_id) {
                Some((_, slot)) => *slot = handler,
                None => entry.handlers.push((agent_id, handler)),
            }
            return Ok(());
        }
        let compiled = SubjectPattern::compile(pattern)?;
        entries.push(PatternEntry {
            pattern: compiled,
            handlers: vec![(agent_id, handler)],
        });
        Ok(())
    }

    /// Вызывает обработчики всех шаблонов, принявших subject сообщения.
    /// Возвращает число вызванных обработчиков.
    pub fn dispatch(&self, message: &Message) -> usize {
        let entries = self.entries.read();
        let mut invoked = 0;
        for entry in entries.iter() {
            if entry.pattern.matches(&message.subject) {
                for (_, handler) in &entry.handlers {
                    handler(message);
                    invoked += 1;
                }
            }
        }
        invoked
    }

    pub fn pattern_count(&self) -> usize {
        self.entries.read().len()
    }
}
