// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 持久缓存模块（Tier 2）
//!
//! 磁盘上的键值存储，键为页面文件路径，值为 `"<mtime> "` 前缀加上编译产物的编码字节。
//! 多个进程可以共享同一个存储文件：每一次读写都在一个以存储文件命名的跨进程锁内完成，
//! 该锁对存储中的所有键串行化访问。

use std::{
    collections::HashMap,
    fs::{self, File, OpenOptions},
    io::ErrorKind,
    path::{Path, PathBuf},
};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use log::{debug, error};

use crate::{codec, exception::Exception, template::CompiledUnit};

const STORE_MAGIC: &[u8; 4] = b"PSPD";

/// 基于操作系统咨询锁的跨进程命名锁，随 guard 的析构释放
pub struct NamedLock {
    file: File,
    path: PathBuf,
}

impl NamedLock {
    pub fn acquire(path: &Path) -> Result<Self, Exception> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| store_error(path, "无法打开锁文件", e))?;
        file.lock()
            .map_err(|e| store_error(path, "无法获取锁", e))?;
        debug!("已获取锁{}", path.display());
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }
}

impl Drop for NamedLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            error!("释放锁{}失败：{}", self.path.display(), e);
        }
    }
}

fn store_error(path: &Path, what: &str, e: std::io::Error) -> Exception {
    error!("持久缓存{}：{}：{}", path.display(), what, e);
    Exception::Store(format!("{} {}: {}", what, path.display(), e))
}

/// 持久缓存存储
#[derive(Debug, Clone)]
pub struct DbmStore {
    path: PathBuf,
}

impl DbmStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(".lock");
        PathBuf::from(name)
    }

    /// 查询缓存：修改时间一致时返回解码后的编译产物
    pub fn get(&self, filename: &Path, mtime: u64) -> Result<Option<CompiledUnit>, Exception> {
        let _lock = NamedLock::acquire(&self.lock_path())?;
        let entries = self.load()?;
        let entry = match entries.get(&filename.display().to_string()) {
            Some(entry) => entry,
            None => return Ok(None),
        };
        let split = match entry.iter().position(|b| *b == b' ') {
            Some(i) => i,
            None => return Err(Exception::CorruptArtifact("store entry without mtime".to_string())),
        };
        let stored_mtime = std::str::from_utf8(&entry[..split])
            .ok()
            .and_then(|t| t.parse::<u64>().ok())
            .ok_or_else(|| Exception::CorruptArtifact("store entry with bad mtime".to_string()))?;
        if stored_mtime != mtime {
            debug!("持久缓存中{}的条目已过期", filename.display());
            return Ok(None);
        }
        codec::decode(&entry[split + 1..]).map(Some)
    }

    /// 写入或覆盖一个条目
    pub fn store(&self, filename: &Path, mtime: u64, unit: &CompiledUnit) -> Result<(), Exception> {
        let _lock = NamedLock::acquire(&self.lock_path())?;
        let mut entries = self.load()?;
        let mut value = BytesMut::new();
        value.put_slice(format!("{} ", mtime).as_bytes());
        value.put_slice(&codec::encode(unit));
        entries.insert(filename.display().to_string(), value.freeze());
        self.save(&entries)?;
        debug!("{}已写入持久缓存{}", filename.display(), self.path.display());
        Ok(())
    }

    fn load(&self) -> Result<HashMap<String, Bytes>, Exception> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => return Err(store_error(&self.path, "无法读取", e)),
        };
        if data.is_empty() {
            return Ok(HashMap::new());
        }
        let corrupt = || Exception::Store(format!("{} is not a page cache store", self.path.display()));
        let mut buf = &data[..];
        if buf.remaining() < STORE_MAGIC.len() || &buf[..STORE_MAGIC.len()] != STORE_MAGIC {
            return Err(corrupt());
        }
        buf.advance(STORE_MAGIC.len());
        let mut entries = HashMap::new();
        while buf.has_remaining() {
            let key = read_record(&mut buf).ok_or_else(corrupt)?;
            let value = read_record(&mut buf).ok_or_else(corrupt)?;
            let key = String::from_utf8(key.to_vec()).map_err(|_| corrupt())?;
            entries.insert(key, value);
        }
        Ok(entries)
    }

    fn save(&self, entries: &HashMap<String, Bytes>) -> Result<(), Exception> {
        let mut buf = BytesMut::new();
        buf.put_slice(STORE_MAGIC);
        for (key, value) in entries {
            buf.put_u32(key.len() as u32);
            buf.put_slice(key.as_bytes());
            buf.put_u32(value.len() as u32);
            buf.put_slice(value);
        }
        let mut tmp = self.path.as_os_str().to_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, &buf).map_err(|e| store_error(&tmp, "无法写入", e))?;
        fs::rename(&tmp, &self.path).map_err(|e| store_error(&self.path, "无法替换", e))
    }
}

fn read_record(buf: &mut &[u8]) -> Option<Bytes> {
    if buf.remaining() < 4 {
        return None;
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return None;
    }
    let record = Bytes::copy_from_slice(&buf[..len]);
    buf.advance(len);
    Some(record)
}
