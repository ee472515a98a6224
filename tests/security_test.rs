// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

#[cfg(test)]
mod security_tests {
    //! # 安全回归测试套件
    //!
    //! 通过模拟常见的攻击向量验证演示宿主与页面引擎的防御能力。
    //! 覆盖范围包括：
    //! - 路径遍历 (Path Traversal / LFI)
    //! - 模板注入 (表单值中的定界符不会被再次求值)
    //! - HTML 注入 (escape 过滤器)
    //! - 协议健壮性 (畸形请求行、不支持的方法与版本)

    use std::fs;
    use std::path::Path;
    use std::sync::Arc;

    use psp_server::{host, Config, Exception, PageCache, Request, Response};
    use tempfile::tempdir;

    fn config_for(root: &Path) -> Config {
        Config::from_toml_str(&format!(
            "www_root = {:?}\nport = 7878\nworker_threads = 1\nlocal = true\n",
            root.to_string_lossy()
        ))
    }

    fn send(raw: &str, config: &Config, caches: &PageCache) -> Response {
        let request = Request::try_from(raw.as_bytes(), 0).unwrap();
        host::serve(&request, config, caches, 0)
    }

    fn body(response: &Response) -> String {
        String::from_utf8_lossy(&response.content()).into_owned()
    }

    /// ## 攻击向量：基础路径遍历
    /// 通过 `../` 越权访问网站根目录之外的文件必须被拒绝。
    #[test]
    fn test_path_traversal_simple() {
        let outer = tempdir().unwrap();
        fs::write(outer.path().join("secret.txt"), "top secret").unwrap();
        let root = outer.path().join("www");
        fs::create_dir(&root).unwrap();
        let config = config_for(&root);
        let caches = PageCache::new(8);

        let attacks = [
            "GET /../secret.txt HTTP/1.1\r\nHost: localhost\r\n\r\n",
            "GET /sub/../../secret.txt HTTP/1.1\r\nHost: localhost\r\n\r\n",
            "GET //../secret.txt HTTP/1.1\r\nHost: localhost\r\n\r\n",
        ];
        for attack in attacks {
            let response = send(attack, &config, &caches);
            assert_eq!(response.status_code(), 400, "攻击未被拦截：{}", attack);
            assert!(!body(&response).contains("top secret"));
        }
    }

    /// ## 攻击向量：编码后的路径遍历
    /// 路径不做百分号解码，`%2e%2e` 只是一个普通的文件名。
    #[test]
    fn test_path_traversal_encoded() {
        let outer = tempdir().unwrap();
        fs::write(outer.path().join("secret.txt"), "top secret").unwrap();
        let root = outer.path().join("www");
        fs::create_dir(&root).unwrap();

        let response = send(
            "GET /%2e%2e/secret.txt HTTP/1.1\r\nHost: localhost\r\n\r\n",
            &config_for(&root),
            &PageCache::new(8),
        );
        assert_eq!(response.status_code(), 404);
    }

    /// ## 攻击向量：绝对路径
    #[test]
    fn test_absolute_path_stays_in_root() {
        let dir = tempdir().unwrap();
        let config = config_for(dir.path());

        let result = host::route("/etc/passwd", &config, 0);
        assert!(matches!(result, Err(Exception::NotAFile(p)) if p.starts_with(dir.path())));
    }

    /// ## 攻击向量：模板注入
    /// 表单值中出现的 `<%= %>` 只是普通文本，不会被编译执行。
    #[test]
    fn test_form_value_is_not_evaluated() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("echo.psp"), "[<%= form.q %>]").unwrap();
        let config = config_for(dir.path());

        let response = send(
            "GET /echo.psp?q=%3C%25%3D+req.document_root+%25%3E HTTP/1.1\r\n\r\n",
            &config,
            &PageCache::new(8),
        );
        assert_eq!(response.status_code(), 200);
        assert_eq!(body(&response), "[<%= req.document_root %>]");
    }

    /// ## 攻击向量：HTML 注入
    #[test]
    fn test_escape_filter_neutralizes_markup() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("echo.psp"), "<p><%= form.q | escape %></p>").unwrap();
        let config = config_for(dir.path());

        let response = send(
            "GET /echo.psp?q=%3Cscript%3Ealert(1)%3C%2Fscript%3E HTTP/1.1\r\n\r\n",
            &config,
            &PageCache::new(8),
        );
        assert_eq!(body(&response), "<p>&lt;script&gt;alert(1)&lt;/script&gt;</p>");
    }

    /// ## 协议健壮性
    #[test]
    fn test_malformed_requests() {
        let cases: [(&[u8], fn(&Exception) -> bool); 4] = [
            (b"GARBAGE\r\n\r\n", |e| matches!(e, Exception::BadRequest(_))),
            (b"GET / HTTP/1.0\r\n\r\n", |e| {
                matches!(e, Exception::UnsupportedHttpVersion(_))
            }),
            (b"POST / HTTP/1.1\r\n\r\n", |e| {
                matches!(e, Exception::UnsupportedMethod(_))
            }),
            (b"GET /a\r\nb HTTP/1.1\r\n\r\n", |e| {
                matches!(e, Exception::BadRequest(_))
            }),
        ];
        for (raw, check) in cases {
            let err = Request::try_from(raw, 0).unwrap_err();
            assert!(check(&err), "意外的错误类型：{:?}", err);
        }
    }

    /// ## 并发请求
    /// 页面执行在阻塞线程池中进行，共享同一份缓存。
    #[tokio::test]
    async fn test_concurrent_requests_on_blocking_pool() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("index.psp"), "n=<%= form.n %>").unwrap();
        let config = Arc::new(config_for(dir.path()));
        let caches = Arc::new(PageCache::new(4));

        let mut tasks = Vec::new();
        for i in 0..16u32 {
            let config = Arc::clone(&config);
            let caches = Arc::clone(&caches);
            tasks.push(tokio::task::spawn_blocking(move || {
                let raw = format!("GET /?n={} HTTP/1.1\r\n\r\n", i);
                let request = Request::try_from(raw.as_bytes(), i as u128).unwrap();
                host::serve(&request, &config, &caches, i as u128)
            }));
        }
        for (i, task) in tasks.into_iter().enumerate() {
            let response = task.await.unwrap();
            assert_eq!(response.status_code(), 200);
            assert_eq!(body(&response), format!("n={}", i));
        }
        assert_eq!(caches.files().len(), 1);
    }
}
