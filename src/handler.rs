// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 页面请求处理入口
//!
//! 宿主服务器把映射到页面文件的请求交给 [`handle`]。
//! 调试模式下，请求的文件名以 `_` 结尾时展示编译结果与源码的对照表，而不是执行页面。

use std::path::PathBuf;

use log::debug;

use crate::{
    cache::PageCache,
    context::RequestContext,
    engine::Page,
    exception::Exception,
    expr::Environment,
    param::{CONFIG_DEBUG, HTML_CONTENT_TYPE, OPTION_ERROR_PAGE},
};

pub fn handle(req: &mut dyn RequestContext, caches: &PageCache) -> Result<(), Exception> {
    req.set_content_type(HTML_CONTENT_TYPE);

    let debug = req
        .config()
        .get(CONFIG_DEBUG)
        .and_then(|v| v.trim().parse::<i64>().ok())
        .unwrap_or(0)
        != 0;
    let filename = req.filename();
    let name = filename.to_string_lossy();

    if debug && name.ends_with('_') {
        let source = PathBuf::from(&name[..name.len() - 1]);
        debug!("调试模式，展示{}的编译结果", source.display());
        let page = Page::from_file(&*req, caches, &source)?;
        page.display_code(req)
    } else {
        let mut page = Page::from_request(&*req, caches)?;
        if let Some(error_page) = req.options().get(OPTION_ERROR_PAGE) {
            page.set_error_page(&*req, caches, error_page)?;
        }
        page.run(req, &Environment::new())
    }
}
