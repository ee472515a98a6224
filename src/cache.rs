// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 内存缓存模块（Tier 1）
//!
//! 以命中次数淘汰的有界缓存：溢出时按命中次数升序删除条目，直到占用降到容量的 75%。
//! 命中次数相同的条目之间的淘汰顺序不作保证。

use std::{
    collections::HashMap,
    hash::Hash,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};

use log::{debug, warn};

use crate::{param::DEFAULT_CACHE_SIZE, template::CompiledUnit};

pub struct HitsCache<K, V> {
    cache: HashMap<K, (u64, V)>,
    size: usize,
}

impl<K: Eq + Hash + Clone, V: Clone> HitsCache<K, V> {
    // 根据容量构造
    pub fn from_capacity(capacity: usize) -> Self {
        if capacity == 0 {
            panic!("调用from_capacity时指定的大小是0。如果需要使用默认大小，请在调用处进行处理，而不是传入0");
        }
        Self {
            cache: HashMap::new(),
            size: capacity,
        }
    }

    // 放入，命中次数重置为1
    pub fn store(&mut self, key: K, val: V) {
        self.cache.insert(key, (1, val));
        if self.cache.len() > self.size {
            self.clean();
        }
    }

    // 查询，命中时命中次数加1
    pub fn get(&mut self, key: &K) -> Option<V> {
        match self.cache.get_mut(key) {
            Some((hits, val)) => {
                *hits += 1;
                Some(val.clone())
            }
            None => None,
        }
    }

    pub fn remove(&mut self, key: &K) {
        self.cache.remove(key);
    }

    // 删除命中次数最少的条目，使缓存只有75%满
    fn clean(&mut self) {
        let target = self.size * 3 / 4;
        let mut byhits: Vec<(u64, K)> = self
            .cache
            .iter()
            .map(|(key, (hits, _))| (*hits, key.clone()))
            .collect();
        byhits.sort_by_key(|(hits, _)| *hits);
        let excess = self.cache.len().saturating_sub(target);
        for (_, key) in byhits.into_iter().take(excess) {
            self.cache.remove(&key);
        }
        debug!("缓存已清理{}个条目，剩余{}个", excess, self.cache.len());
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.size
    }

    pub fn contains(&self, key: &K) -> bool {
        self.cache.contains_key(key)
    }

    pub fn hits(&self, key: &K) -> Option<u64> {
        self.cache.get(key).map(|(hits, _)| *hits)
    }
}

/// 以源字符串为键的编译缓存。字符串来源在进程生命周期内视为不变，不做新鲜度检查。
pub type StringCache = HitsCache<String, Arc<CompiledUnit>>;

/// 以文件路径为键、带修改时间检查的编译缓存
pub struct FileCache {
    inner: HitsCache<PathBuf, (u64, Arc<CompiledUnit>)>,
}

impl FileCache {
    pub fn from_capacity(capacity: usize) -> Self {
        Self {
            inner: HitsCache::from_capacity(capacity),
        }
    }

    pub fn store(&mut self, filename: &Path, mtime: u64, code: Arc<CompiledUnit>) {
        self.inner.store(filename.to_path_buf(), (mtime, code));
    }

    // 查询有效缓存；修改时间不一致的条目会被立即删除
    pub fn get(&mut self, filename: &Path, mtime: u64) -> Option<Arc<CompiledUnit>> {
        let key = filename.to_path_buf();
        let (cached_mtime, code) = self.inner.get(&key)?;
        if cached_mtime != mtime {
            debug!("{}的缓存已过期，删除", filename.display());
            self.inner.remove(&key);
            return None;
        }
        Some(code)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    pub fn contains(&self, filename: &Path) -> bool {
        self.inner.contains(&filename.to_path_buf())
    }
}

/// 页面引擎共享的内存缓存，在服务器启动时创建并以 `Arc` 注入各个请求
pub struct PageCache {
    strings: Mutex<StringCache>,
    files: Mutex<FileCache>,
}

impl PageCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            strings: Mutex::new(StringCache::from_capacity(capacity)),
            files: Mutex::new(FileCache::from_capacity(capacity)),
        }
    }

    pub fn strings(&self) -> MutexGuard<'_, StringCache> {
        match self.strings.lock() {
            Ok(lock) => lock,
            Err(poisoned) => {
                warn!("字符串缓存锁被污染，恢复并继续");
                poisoned.into_inner()
            }
        }
    }

    pub fn files(&self) -> MutexGuard<'_, FileCache> {
        match self.files.lock() {
            Ok(lock) => lock,
            Err(poisoned) => {
                warn!("文件缓存锁被污染，恢复并继续");
                poisoned.into_inner()
            }
        }
    }
}

impl Default for PageCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_SIZE)
    }
}
