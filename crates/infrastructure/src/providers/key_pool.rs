use std::sync::atomic::{AtomicUsize, Ordering};

/// 轮换密钥池
///
/// 密钥列表加一个原子游标，每次取用后游标自增并回绕。
#[derive(Debug)]
pub struct KeyPool {
    keys: Vec<String>,
    cursor: AtomicUsize,
}

impl KeyPool {
    pub fn new(keys: Vec<String>) -> Self {
        let keys = keys
            .into_iter()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect();
        Self {
            keys,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// 取出下一个密钥及其下标，密钥池为空时返回None
    pub fn next_key(&self) -> Option<(usize, &str)> {
        let len = self.keys.len();
        if len == 0 {
            return None;
        }
        let index = match self
            .cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| Some((c + 1) % len))
        {
            Ok(previous) | Err(previous) => previous % len,
        };
        Some((index, self.keys[index].as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn pool(n: usize) -> KeyPool {
        KeyPool::new((0..n).map(|i| format!("sk-{i}")).collect())
    }

    #[test]
    fn test_visits_every_key_before_repeating() {
        for n in 1..=5 {
            let pool = pool(n);
            let first_round: HashSet<_> = (0..n).map(|_| pool.next_key().unwrap().0).collect();
            assert_eq!(first_round.len(), n);
        }
    }

    #[test]
    fn test_never_same_index_twice_in_a_row() {
        let pool = pool(3);
        let mut previous = pool.next_key().unwrap().0;
        for _ in 0..20 {
            let (index, _) = pool.next_key().unwrap();
            assert_ne!(index, previous);
            previous = index;
        }
    }

    #[test]
    fn test_blank_keys_are_ignored() {
        let pool = KeyPool::new(vec![" ".to_string(), "sk-a".to_string(), String::new()]);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.next_key(), Some((0, "sk-a")));
        assert!(KeyPool::new(vec![]).next_key().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_rotation_is_balanced() {
        let pool = Arc::new(pool(4));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                (0..50).map(|_| pool.next_key().unwrap().0).collect::<Vec<_>>()
            }));
        }

        let mut counts = [0usize; 4];
        for handle in handles {
            for index in handle.await.unwrap() {
                counts[index] += 1;
            }
        }
        assert_eq!(counts, [100, 100, 100, 100]);
    }
}
