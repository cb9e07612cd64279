//! 策略注册表
//!
//! 启动时显式构造并注册，重复注册与访问未注册键都是配置错误。

use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;

use crate::core::RegistryError;

/// 通用键值注册表（步骤、协调者、顾问、超时追踪器工厂共用）
pub struct Registry<K, V> {
    entries: HashMap<K, V>,
}

impl<K, V> Registry<K, V>
where
    K: Eq + Hash + Display + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// 注册；键已存在时返回 DuplicateRegistry
    pub fn register(&mut self, key: K, value: V) -> Result<(), RegistryError> {
        if self.entries.contains_key(&key) {
            return Err(RegistryError::DuplicateRegistry(key.to_string()));
        }
        tracing::debug!("Registered {}", key);
        self.entries.insert(key, value);
        Ok(())
    }

    /// 链式注册（构建期使用）
    pub fn with(mut self, key: K, value: V) -> Result<Self, RegistryError> {
        self.register(key, value)?;
        Ok(self)
    }

    pub fn obtain(&self, key: &K) -> Result<V, RegistryError> {
        self.entries
            .get(key)
            .cloned()
            .ok_or_else(|| RegistryError::UnregisteredKeyAccess(key.to_string()))
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> Vec<K> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K, V> Default for Registry<K, V>
where
    K: Eq + Hash + Display + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
