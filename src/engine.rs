// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 页面执行引擎
//!
//! [`Page`] 负责：
//! 1. 按 持久缓存 → 内存缓存 → 预编译文件 → 编译 的顺序取得编译产物；
//! 2. 在合并了请求绑定（`req`、`session`、`form`）与调用方变量的环境中解释执行指令；
//! 3. 执行失败时转交错误页（若已配置），否则把故障原样抛给调用方；
//! 4. 保证本次渲染获取的会话在所有退出路径上被保存并解锁。

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use log::{debug, error, warn};
use serde_json::{json, Map, Value};

use crate::{
    cache::PageCache,
    codec,
    context::{RequestContext, Session},
    exception::{Exception, Fault},
    expr::{stringify, Environment},
    param::{OPTION_DBM_CACHE, PRECOMPILED_MARKER},
    store::DbmStore,
    template::{self, CompiledUnit, Instruction, SourceUnit},
    util::escape_html,
};

/// 持有会话并在析构时解锁
struct SessionGuard(Option<Box<dyn Session>>);

impl SessionGuard {
    fn data(&self) -> Option<Value> {
        self.0.as_ref().map(|s| s.data())
    }

    fn save(&mut self) -> Result<(), Exception> {
        match self.0.as_mut() {
            Some(session) => session.save(),
            None => Ok(()),
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Some(session) = self.0.as_mut() {
            session.unlock();
        }
    }
}

pub struct Page {
    filename: Option<PathBuf>,
    code: Arc<CompiledUnit>,
    error_page: Option<Box<Page>>,
    output: Option<String>,
}

impl Page {
    /// 以本次请求映射到的文件构造页面
    pub fn from_request(req: &dyn RequestContext, caches: &PageCache) -> Result<Self, Exception> {
        Self::from_file(req, caches, &req.filename())
    }

    pub fn from_file(
        req: &dyn RequestContext,
        caches: &PageCache,
        path: &Path,
    ) -> Result<Self, Exception> {
        let code = load_from_file(req, caches, path)?;
        Ok(Self::with_code(Some(path.to_path_buf()), code))
    }

    pub fn from_string(caches: &PageCache, source: &str) -> Result<Self, Exception> {
        let cached = caches.strings().get(&source.to_string());
        let code = match cached {
            Some(code) => {
                debug!("字符串页面缓存命中");
                code
            }
            None => {
                let code = Arc::new(template::compile(&SourceUnit::Inline(source.to_string()))?);
                caches.strings().store(source.to_string(), code.clone());
                code
            }
        };
        Ok(Self::with_code(None, code))
    }

    fn with_code(filename: Option<PathBuf>, code: Arc<CompiledUnit>) -> Self {
        Self {
            filename,
            code,
            error_page: None,
            output: None,
        }
    }

    pub fn code(&self) -> &CompiledUnit {
        &self.code
    }

    pub fn filename(&self) -> Option<&Path> {
        self.filename.as_deref()
    }

    pub fn has_error_page(&self) -> bool {
        self.error_page.is_some()
    }

    /// 设置错误页：以 `/` 开头时相对于文档根目录，否则相对于当前页面所在目录
    pub fn set_error_page(
        &mut self,
        req: &dyn RequestContext,
        caches: &PageCache,
        page: &str,
    ) -> Result<(), Exception> {
        let path = match page.strip_prefix('/') {
            Some(relative) => req.document_root().join(relative),
            None => {
                let dir = self
                    .filename
                    .as_deref()
                    .and_then(Path::parent)
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| req.document_root());
                dir.join(page)
            }
        };
        debug!("错误页：{}", path.display());
        self.error_page = Some(Box::new(Page::from_file(req, caches, &path)?));
        Ok(())
    }

    /// 渲染页面。同一个实例只执行一次，之后的调用直接返回第一次的输出。
    pub fn render(
        &mut self,
        req: &mut dyn RequestContext,
        vars: &Environment,
    ) -> Result<&str, Exception> {
        if self.output.is_none() {
            let output = self.execute(req, vars)?;
            self.output = Some(output);
        }
        Ok(self.output.as_deref().unwrap_or_default())
    }

    /// 渲染并把结果写给请求
    pub fn run(&mut self, req: &mut dyn RequestContext, vars: &Environment) -> Result<(), Exception> {
        let output = self.render(req, vars)?;
        req.write(output.as_bytes())
    }

    fn execute(
        &mut self,
        req: &mut dyn RequestContext,
        vars: &Environment,
    ) -> Result<String, Exception> {
        match self.interpret_with_session(req, vars)? {
            Ok(output) => Ok(output),
            Err(fault) => match self.error_page.as_deref_mut() {
                Some(error_page) => {
                    warn!("页面{}执行失败（{}），转到错误页", self.code.origin(), fault);
                    let mut error_vars = Environment::new();
                    error_vars.insert("exception".to_string(), fault.to_value());
                    error_page.render(req, &error_vars).map(str::to_string)
                }
                None => {
                    error!("页面{}执行失败：{}", self.code.origin(), fault);
                    Err(Exception::Execution(fault))
                }
            },
        }
    }

    /// 执行指令；会话在返回前保存，并随 guard 析构解锁，之后才会转到错误页
    fn interpret_with_session(
        &self,
        req: &mut dyn RequestContext,
        vars: &Environment,
    ) -> Result<Result<String, Fault>, Exception> {
        let mut session = SessionGuard(match self.code.references("session") {
            true => req.session(),
            false => None,
        });
        let form = match self.code.references("form") {
            true => Some(req.form()),
            false => None,
        };
        let env = build_environment(&*req, session.data(), form, vars);
        let result = interpret(&self.code, &env);

        // 会话的访问时间总会改变，因此无论执行成功与否都要保存
        if let Err(e) = session.save() {
            if result.is_ok() {
                return Err(e);
            }
            error!("保存会话失败：{}", e);
        }
        Ok(result)
    }

    /// 调试输出：左侧为编译后的指令清单，右侧为页面源码
    pub fn display_code(&self, req: &mut dyn RequestContext) -> Result<(), Exception> {
        // 缓存命中时对象中没有源码，这里重新读取
        let source: Vec<String> = match &self.filename {
            Some(path) => fs::read_to_string(path)
                .map_err(|e| Exception::io(path, e))?
                .lines()
                .map(|s| s.trim_end().to_string())
                .collect(),
            None => Vec::new(),
        };
        let listing = self.code.listing();
        let origin = self.code.origin();

        req.write(b"<table>\n<tr>")?;
        for s in [
            "",
            "&nbsp;Compiled page instructions:",
            &format!("&nbsp;{}:", escape_html(origin)),
        ] {
            req.write(format!("<td><tt>{}</tt></td>", s).as_bytes())?;
        }
        req.write(b"</tr>\n")?;

        let rows = listing.len().max(source.len());
        for n in 0..rows {
            let left = listing.get(n).map(|l| code_cell(l)).unwrap_or_default();
            let right = source.get(n).map(|r| code_cell(r)).unwrap_or_default();
            req.write(b"<tr>")?;
            for s in [
                format!("{}.&nbsp;", n + 1),
                format!("<font color=blue>{}</font>", left),
                format!("&nbsp;<font color=green>{}</font>", right),
            ] {
                req.write(format!("<td><tt>{}</tt></td>", s).as_bytes())?;
            }
            req.write(b"</tr>\n")?;
        }
        req.write(b"</table>\n")
    }
}

fn code_cell(line: &str) -> String {
    escape_html(line)
        .replace('\t', "    ")
        .replace(' ', "&nbsp;")
}

/// 合并请求绑定与调用方变量，调用方变量优先
fn build_environment(
    req: &dyn RequestContext,
    session: Option<Value>,
    form: Option<std::collections::HashMap<String, String>>,
    vars: &Environment,
) -> Environment {
    let mut env = Environment::new();
    env.insert(
        "req".to_string(),
        json!({
            "filename": req.filename().display().to_string(),
            "document_root": req.document_root().display().to_string(),
            "options": req.options(),
        }),
    );
    if let Some(data) = session {
        env.insert("session".to_string(), data);
    }
    if let Some(fields) = form {
        let map: Map<String, Value> = fields
            .into_iter()
            .map(|(k, v)| (k, Value::String(v)))
            .collect();
        env.insert("form".to_string(), Value::Object(map));
    }
    for (name, value) in vars {
        env.insert(name.clone(), value.clone());
    }
    env
}

/// 解释执行编译产物，返回累积的输出
pub fn interpret(code: &CompiledUnit, env: &Environment) -> Result<String, Fault> {
    let mut output = String::new();
    for instruction in code.instructions() {
        match instruction {
            Instruction::Literal(text) => output.push_str(text),
            Instruction::Expression { line, source, expr } => {
                let value = expr.eval(env).map_err(|fault| {
                    fault.with_frame(format!("line {}, in {}: {}", line, code.origin(), source))
                })?;
                output.push_str(&stringify(&value));
            }
        }
    }
    Ok(output)
}

fn load_from_file(
    req: &dyn RequestContext,
    caches: &PageCache,
    path: &Path,
) -> Result<Arc<CompiledUnit>, Exception> {
    let source = SourceUnit::from_path(path)?;
    let mtime = match &source {
        SourceUnit::File { mtime, .. } => *mtime,
        SourceUnit::Inline(_) => 0,
    };
    let dbm = req.options().get(OPTION_DBM_CACHE).map(DbmStore::new);

    if let Some(store) = &dbm {
        if let Some(code) = store.get(path, mtime)? {
            debug!("持久缓存命中：{}", path.display());
            let code = Arc::new(code);
            caches.files().store(path, mtime, code.clone());
            return Ok(code);
        }
    }

    // 未从持久缓存取得的结果都要回写持久缓存，包括内存缓存命中
    let cached = caches.files().get(path, mtime);
    let code = match cached {
        Some(code) => {
            debug!("内存缓存命中：{}", path.display());
            code
        }
        None => {
            let code = match precompiled_get(path, mtime) {
                Some(code) => {
                    debug!("使用预编译文件：{}", precompiled_path(path).display());
                    code
                }
                None => template::compile(&source)?,
            };
            let code = Arc::new(code);
            caches.files().store(path, mtime, code.clone());
            code
        }
    };

    if let Some(store) = &dbm {
        store.store(path, mtime, &code)?;
    }
    Ok(code)
}

/// 预编译文件名：扩展名的最后一个字符替换为标记字符，没有扩展名时直接追加
pub fn precompiled_path(path: &Path) -> PathBuf {
    match path.extension() {
        Some(ext) => {
            let mut ext = ext.to_string_lossy().into_owned();
            ext.pop();
            ext.push(PRECOMPILED_MARKER);
            path.with_extension(ext)
        }
        None => {
            let mut name = path.as_os_str().to_os_string();
            name.push(PRECOMPILED_MARKER.to_string());
            PathBuf::from(name)
        }
    }
}

/// 读取不早于源文件的预编译产物；损坏的产物被忽略并重新编译
fn precompiled_get(path: &Path, mtime: u64) -> Option<CompiledUnit> {
    let cpath = precompiled_path(path);
    if !cpath.is_file() {
        return None;
    }
    let cmtime = template::modified_nanos(&cpath).ok()?;
    if cmtime < mtime {
        return None;
    }
    let decoded = fs::read(&cpath)
        .map_err(|e| Exception::io(&cpath, e))
        .and_then(|data| codec::decode(&data));
    match decoded {
        Ok(code) => Some(code),
        Err(e) => {
            warn!("预编译文件{}不可用：{}，重新编译", cpath.display(), e);
            None
        }
    }
}

/// 编译页面并写出预编译文件，返回其路径
pub fn precompile(path: &Path) -> Result<PathBuf, Exception> {
    let code = template::compile(&SourceUnit::from_path(path)?)?;
    let cpath = precompiled_path(path);
    fs::write(&cpath, codec::encode(&code)).map_err(|e| Exception::io(&cpath, e))?;
    debug!("已写出预编译文件{}", cpath.display());
    Ok(cpath)
}
