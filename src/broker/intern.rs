use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;

/// Пул повторного использования `Arc<str>` для одинаковых subject'ов.
/// Имена тем и очередей повторяются в каждом сообщении, интернирование
/// избавляет от лишних аллокаций на горячем пути публикации.
static SUBJECT_INTERN: Lazy<DashMap<String, Arc<str>>> = Lazy::new(DashMap::new);

/// Возвращает interned `Arc<str>` для данного subject.
#[inline(always)]
pub(crate) fn intern_subject<S: AsRef<str>>(subject: S) -> Arc<str> {
    let key = subject.as_ref();
    if let Some(existing) = SUBJECT_INTERN.get(key) {
        return existing.clone();
    }
    let arc: Arc<str> = Arc::from(key);
    SUBJECT_INTERN.insert(key.to_string(), arc.clone());
    arc
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Проверяет, что повторный вызов для того же subject возвращает
    /// тот же самый Arc (по указателю).
    #[test]
    fn intern_repeats_share_arc() {
        let a1 = intern_subject("orders.created");
        let a2 = intern_subject("orders.created");
        assert_eq!(&*a1, "orders.created");
        assert!(Arc::ptr_eq(&a1, &a2));
    }

    /// Проверяет, что разные subject'ы дают разные Arc.
    #[test]
    fn intern_distinct_keys() {
        let a = intern_subject("a.b");
        let b = intern_subject("a.c");
        assert!(!Arc::ptr_eq(&a, &b));
    }
}
