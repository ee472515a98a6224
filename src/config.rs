use num_cpus;
use serde_derive::Deserialize;
use serde_derive::Serialize;

use core::str;
use log::{error, warn};
use std::collections::HashMap;
use std::fs::File;
use std::io::prelude::*;

use crate::param::{CONFIG_DEBUG, DEFAULT_CACHE_SIZE, OPTION_DBM_CACHE, OPTION_ERROR_PAGE};

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    www_root: String,
    port: u16,
    worker_threads: usize,
    local: bool,
    #[serde(default = "default_cache_size")]
    cache_size: usize,
    #[serde(default)]
    dbm_cache: Option<String>,
    #[serde(default)]
    error_page: Option<String>,
    #[serde(default)]
    debug: bool,
}

fn default_cache_size() -> usize {
    DEFAULT_CACHE_SIZE
}

impl Config {
    pub fn new() -> Self {
        Self {
            www_root: ".".to_string(),
            port: 7878,
            worker_threads: 0,
            local: true,
            cache_size: default_cache_size(),
            dbm_cache: None,
            error_page: None,
            debug: false,
        }
    }

    pub fn from_toml(filename: &str) -> Self {
        let mut file = match File::open(filename) {
            Ok(f) => f,
            Err(e) => panic!("no such file {} exception:{}", filename, e),
        };
        let mut str_val = String::new();
        match file.read_to_string(&mut str_val) {
            Ok(s) => s,
            Err(e) => panic!("Error Reading file: {}", e),
        };
        Self::from_toml_str(&str_val)
    }

    pub fn from_toml_str(str_val: &str) -> Self {
        let mut raw_config = match toml::from_str(str_val) {
            Ok(t) => t,
            Err(e) => {
                error!("无法成功从配置文件构建配置对象，使用默认配置：{}", e);
                Config::new()
            }
        };
        if raw_config.worker_threads == 0 {
            raw_config.worker_threads = num_cpus::get();
        }
        if raw_config.cache_size == 0 {
            warn!(
                "cache_size被设置为0，但目前尚不支持禁用缓存，因此该值将被改为{}。",
                DEFAULT_CACHE_SIZE
            );
            raw_config.cache_size = DEFAULT_CACHE_SIZE;
        }
        raw_config
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub fn www_root(&self) -> &str {
        &self.www_root
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn worker_threads(&self) -> usize {
        self.worker_threads
    }

    pub fn cache_size(&self) -> usize {
        self.cache_size
    }

    pub fn local(&self) -> bool {
        self.local
    }

    pub fn dbm_cache(&self) -> Option<&str> {
        self.dbm_cache.as_deref()
    }

    pub fn error_page(&self) -> Option<&str> {
        self.error_page.as_deref()
    }

    pub fn debug(&self) -> bool {
        self.debug
    }

    /// 每个请求携带的选项
    pub fn options(&self) -> HashMap<String, String> {
        let mut options = HashMap::new();
        if let Some(path) = &self.dbm_cache {
            options.insert(OPTION_DBM_CACHE.to_string(), path.clone());
        }
        if let Some(page) = &self.error_page {
            options.insert(OPTION_ERROR_PAGE.to_string(), page.clone());
        }
        options
    }

    /// 服务器配置表
    pub fn server_config(&self) -> HashMap<String, String> {
        let mut config = HashMap::new();
        config.insert(
            CONFIG_DEBUG.to_string(),
            if self.debug { "1" } else { "0" }.to_string(),
        );
        config
    }
}
