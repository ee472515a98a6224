// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 请求协作者接口
//!
//! 页面引擎通过这些 trait 与宿主服务器交互：设置 Content-Type、写出数据、
//! 读取请求选项与服务器配置，以及按需获取会话与表单数据。

use std::{
    collections::HashMap,
    fs::File,
    io::{Read, Seek, SeekFrom},
    path::{Path, PathBuf},
};

use serde_json::Value;

use crate::exception::Exception;

/// 会话对象。获取后必须在所有退出路径上 `unlock`。
#[cfg_attr(test, mockall::automock)]
pub trait Session {
    /// 会话数据，绑定到页面环境中的 `session`
    fn data(&self) -> Value;
    fn save(&mut self) -> Result<(), Exception>;
    fn unlock(&mut self);
}

pub trait RequestContext {
    fn set_content_type(&mut self, content_type: &str);

    fn write(&mut self, data: &[u8]) -> Result<(), Exception>;

    /// 请求选项（如持久缓存路径）
    fn options(&self) -> HashMap<String, String>;

    /// 服务器配置（如调试开关）
    fn config(&self) -> HashMap<String, String>;

    fn document_root(&self) -> PathBuf;

    /// 本次请求映射到的文件
    fn filename(&self) -> PathBuf;

    /// 发送文件的一段内容。`length` 为 `None` 时发送到文件末尾。
    /// 默认实现读入内存后调用 `write`，宿主可以覆盖为零拷贝发送。
    fn write_file(&mut self, path: &Path, offset: u64, length: Option<u64>) -> Result<u64, Exception> {
        let mut file = File::open(path).map_err(|e| Exception::io(path, e))?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| Exception::io(path, e))?;
        let mut buffer = Vec::new();
        match length {
            Some(n) => file.take(n).read_to_end(&mut buffer),
            None => file.read_to_end(&mut buffer),
        }
        .map_err(|e| Exception::io(path, e))?;
        self.write(&buffer)?;
        Ok(buffer.len() as u64)
    }

    /// 获取（并加锁）本次请求的会话，没有会话支持时返回 `None`
    fn session(&mut self) -> Option<Box<dyn Session>> {
        None
    }

    /// 解析后的表单字段
    fn form(&mut self) -> HashMap<String, String> {
        HashMap::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    struct Sink {
        out: Vec<u8>,
    }

    impl RequestContext for Sink {
        fn set_content_type(&mut self, _content_type: &str) {}
        fn write(&mut self, data: &[u8]) -> Result<(), Exception> {
            self.out.extend_from_slice(data);
            Ok(())
        }
        fn options(&self) -> HashMap<String, String> {
            HashMap::new()
        }
        fn config(&self) -> HashMap<String, String> {
            HashMap::new()
        }
        fn document_root(&self) -> PathBuf {
            PathBuf::from("/")
        }
        fn filename(&self) -> PathBuf {
            PathBuf::from("/index.psp")
        }
    }

    #[test]
    fn test_default_write_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"0123456789").unwrap();
        let mut sink = Sink { out: Vec::new() };

        let sent = sink.write_file(file.path(), 2, Some(3)).unwrap();
        assert_eq!(sent, 3);
        assert_eq!(sink.out, b"234");

        let sent = sink.write_file(file.path(), 8, None).unwrap();
        assert_eq!(sent, 2);
        assert_eq!(sink.out, b"23489");
    }

    #[test]
    fn test_defaults_have_no_session_or_form() {
        let mut sink = Sink { out: Vec::new() };
        assert!(sink.session().is_none());
        assert!(sink.form().is_empty());
    }
}
