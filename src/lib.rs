pub mod cache;
pub mod codec;
pub mod config;
pub mod context;
pub mod engine;
pub mod exception;
pub mod expr;
pub mod handler;
pub mod host;
pub mod param;
pub mod request;
pub mod response;
pub mod store;
pub mod template;
pub mod util;

pub use cache::{FileCache, HitsCache, PageCache, StringCache};
pub use config::Config;
pub use context::{RequestContext, Session};
pub use engine::{interpret, precompile, precompiled_path, Page};
pub use exception::{Exception, Fault, FaultKind};
pub use expr::Environment;
pub use handler::handle;
pub use param::{HttpRequestMethod, HttpVersion};
pub use request::Request;
pub use response::Response;
pub use store::{DbmStore, NamedLock};
pub use template::{compile, compile_str, CompiledUnit, DelimiterParser, Instruction, Parser, SourceUnit};
pub use util::HtmlBuilder;
