// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 演示宿主
//!
//! 把解析后的 HTTP 请求映射到网站根目录下的文件：
//! 页面文件交给 [`crate::handler::handle`] 执行，其余文件按原样发送。

use std::{
    collections::HashMap,
    path::{Component, Path, PathBuf},
};

use log::{debug, error, warn};

use crate::{
    cache::PageCache,
    config::Config,
    context::RequestContext,
    exception::Exception,
    handler,
    param::{HttpRequestMethod, PAGE_EXTENSION, PAGE_INDEX},
    request::Request,
    response::{get_mime, Response},
};

/// 单个请求的协作者：页面输出被追加到 `Response` 中。
pub struct PageContext<'a> {
    request: &'a Request,
    config: &'a Config,
    filename: PathBuf,
    response: Response,
}

impl<'a> PageContext<'a> {
    pub fn new(request: &'a Request, config: &'a Config, filename: PathBuf) -> Self {
        Self {
            request,
            config,
            filename,
            response: Response::new(),
        }
    }

    pub fn into_response(self) -> Response {
        self.response
    }
}

impl RequestContext for PageContext<'_> {
    fn set_content_type(&mut self, content_type: &str) {
        self.response.set_content_type(content_type);
    }

    fn write(&mut self, data: &[u8]) -> Result<(), Exception> {
        self.response.append(data);
        Ok(())
    }

    fn options(&self) -> HashMap<String, String> {
        self.config.options()
    }

    fn config(&self) -> HashMap<String, String> {
        self.config.server_config()
    }

    fn document_root(&self) -> PathBuf {
        PathBuf::from(self.config.www_root())
    }

    fn filename(&self) -> PathBuf {
        self.filename.clone()
    }

    fn form(&mut self) -> HashMap<String, String> {
        self.request.form()
    }
}

/// 处理一个请求并生成响应。页面执行是同步的，调用方应在阻塞线程池中运行。
pub fn serve(request: &Request, config: &Config, caches: &PageCache, id: u128) -> Response {
    let path = match route(request.path(), config, id) {
        Ok(path) => path,
        Err(Exception::NotAFile(_)) => {
            warn!("[ID{}]请求的路径：{} 不存在，返回404", id, request.path());
            return Response::from_status_code(404, id);
        }
        Err(e) => {
            warn!("[ID{}]请求的路径：{} 非法：{}，返回400", id, request.path(), e);
            return Response::from_status_code(400, id);
        }
    };

    let mut ctx = PageContext::new(request, config, path.clone());
    let result = if is_page(&path, config.debug()) {
        debug!("[ID{}]执行页面：{}", id, path.display());
        handler::handle(&mut ctx, caches)
    } else {
        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        ctx.set_content_type(get_mime(extension));
        ctx.write_file(&path, 0, None).map(|_| ())
    };

    match result {
        Ok(()) => ctx.into_response(),
        Err(Exception::NotAFile(p)) if p == path => {
            warn!("[ID{}]{}不是文件，返回404", id, p.display());
            Response::from_status_code(404, id)
        }
        Err(e) => {
            error!("[ID{}]处理{}时发生异常：{}", id, path.display(), e);
            Response::from_status_code(500, id)
        }
    }
}

fn is_page(path: &Path, debug: bool) -> bool {
    let name = path.to_string_lossy();
    let page_suffix = format!(".{}", PAGE_EXTENSION);
    name.ends_with(&page_suffix) || (debug && name.ends_with(&format!("{}_", page_suffix)))
}

/// 将请求路径映射到网站根目录下的文件。
///
/// 目录映射到其中的 `index.psp`；包含 `..` 的路径被拒绝。
/// 调试模式下以 `_` 结尾的页面路径在对应页面存在时被接受。
pub fn route(path: &str, config: &Config, id: u128) -> Result<PathBuf, Exception> {
    let relative = Path::new(path.trim_start_matches('/'));
    if relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Err(Exception::InvalidPath(path.to_string()));
    }

    let mut full_path = Path::new(config.www_root()).join(relative);
    if full_path.is_dir() {
        full_path.push(PAGE_INDEX);
    }
    debug!("[ID{}]映射物理路径：{}", id, full_path.display());

    if full_path.is_file() {
        return Ok(full_path);
    }
    if config.debug() {
        let name = full_path.to_string_lossy();
        if let Some(source) = name.strip_suffix('_') {
            if Path::new(source).is_file() {
                return Ok(full_path);
            }
        }
    }
    Err(Exception::NotAFile(full_path))
}

/// HEAD 请求只发送响应头
pub fn headonly(request: &Request) -> bool {
    request.method() == HttpRequestMethod::Head
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn config_for(root: &Path, extra: &str) -> Config {
        Config::from_toml_str(&format!(
            "www_root = {:?}\nport = 7878\nworker_threads = 1\nlocal = true\n{}",
            root.to_string_lossy(),
            extra
        ))
    }

    fn get(path: &str) -> Request {
        let raw = format!("GET {} HTTP/1.1\r\nHost: localhost\r\n\r\n", path);
        Request::try_from(raw.as_bytes(), 0).unwrap()
    }

    fn body(response: &Response) -> String {
        String::from_utf8_lossy(&response.content()).into_owned()
    }

    #[test]
    fn test_serve_page_with_form() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("index.psp"), "Hello <%= form.name | default('nobody') %>").unwrap();
        let config = config_for(dir.path(), "");
        let caches = PageCache::new(8);

        let response = serve(&get("/?name=World"), &config, &caches, 0);
        assert_eq!(response.status_code(), 200);
        assert_eq!(response.content_type(), Some("text/html"));
        assert_eq!(body(&response), "Hello World");

        let response = serve(&get("/index.psp"), &config, &caches, 1);
        assert_eq!(body(&response), "Hello nobody");
    }

    #[test]
    fn test_serve_static_file() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("style.css"), "body {}").unwrap();
        let config = config_for(dir.path(), "");

        let response = serve(&get("/style.css"), &config, &PageCache::new(8), 0);
        assert_eq!(response.status_code(), 200);
        assert_eq!(response.content_type(), Some("text/css;charset=utf-8"));
        assert_eq!(body(&response), "body {}");
    }

    #[test]
    fn test_serve_missing_and_invalid() {
        let dir = tempdir().unwrap();
        let config = config_for(dir.path(), "");
        let caches = PageCache::new(8);

        assert_eq!(serve(&get("/missing.psp"), &config, &caches, 0).status_code(), 404);
        assert_eq!(serve(&get("/../etc/passwd"), &config, &caches, 1).status_code(), 400);
    }

    #[test]
    fn test_serve_execution_failure() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("broken.psp"), "<%= missing %>").unwrap();
        let config = config_for(dir.path(), "");

        let response = serve(&get("/broken.psp"), &config, &PageCache::new(8), 0);
        assert_eq!(response.status_code(), 500);
    }

    #[test]
    fn test_serve_debug_listing() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("page.psp"), "A<%= 1 + 2 %>B").unwrap();
        let caches = PageCache::new(8);

        let config = config_for(dir.path(), "debug = true");
        let response = serve(&get("/page.psp_"), &config, &caches, 0);
        assert_eq!(response.status_code(), 200);
        assert!(body(&response).contains("1&nbsp;+&nbsp;2"));

        let config = config_for(dir.path(), "");
        assert_eq!(serve(&get("/page.psp_"), &config, &caches, 1).status_code(), 404);
    }

    #[test]
    fn test_headonly() {
        let raw = "HEAD / HTTP/1.1\r\n\r\n";
        assert!(headonly(&Request::try_from(raw.as_bytes(), 0).unwrap()));
        assert!(!headonly(&get("/")));
    }
}
