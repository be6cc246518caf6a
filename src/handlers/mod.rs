//! User-data part handlers
//!
//! A part handler claims one or more content types and receives every part
//! of those types during a consume pass, bracketed by `__begin__` and
//! `__end__` lifecycle calls. Built-in handlers live here; additional ones
//! are picked by name from a [`catalog::HandlerCatalog`] when user-data
//! carries a `#part-handler` manifest.

pub mod boot_hook;
pub mod catalog;
pub mod cloud_config;
pub mod registry;
pub mod shell_script;
pub mod walker;

pub use catalog::HandlerCatalog;
pub use registry::{HandlerRegistry, Mark};
pub use walker::{WalkReport, consume_userdata, load_persisted_handlers};

use crate::state::Frequency;
use crate::userdata::types;
use crate::{Cloud, CloudInitError};
use async_trait::async_trait;

/// Protocol version assumed when a handler declares none
pub const DEFAULT_HANDLER_VERSION: u32 = 1;

/// Arguments of one handler invocation
#[derive(Debug, Clone, Copy)]
pub struct PartCall<'a> {
    pub content_type: &'a str,
    /// `None` for lifecycle calls
    pub filename: Option<&'a str>,
    pub payload: &'a [u8],
    /// Pass frequency, only given to version 2+ handlers
    pub frequency: Option<Frequency>,
}

impl<'a> PartCall<'a> {
    /// Lifecycle call for `__begin__` or `__end__`
    pub fn lifecycle(marker: &'a str) -> Self {
        Self {
            content_type: marker,
            filename: None,
            payload: &[],
            frequency: None,
        }
    }

    pub fn is_begin(&self) -> bool {
        self.content_type == types::CONTENT_START
    }

    pub fn is_end(&self) -> bool {
        self.content_type == types::CONTENT_END
    }

    pub fn is_lifecycle(&self) -> bool {
        self.is_begin() || self.is_end()
    }
}

/// A consumer of user-data parts
///
/// Every method except `name` is optional; [`HandlerInfo::fixup`] fills in
/// the defaults once, when the handler is registered.
#[async_trait]
pub trait PartHandler: Send + Sync {
    fn name(&self) -> &str;

    /// Content types this handler claims
    fn list_types(&self) -> Vec<String> {
        Vec::new()
    }

    fn handler_version(&self) -> Option<u32> {
        None
    }

    /// Declared frequency, as spelled by the handler
    fn frequency(&self) -> Option<String> {
        None
    }

    async fn handle_part(&mut self, _cloud: &Cloud, _call: PartCall<'_>) -> Result<(), CloudInitError> {
        Ok(())
    }
}

/// Handler attributes after defaults are applied
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerInfo {
    pub version: u32,
    /// `None` when the declared frequency is not recognized; such a handler
    /// is never dispatched
    pub frequency: Option<Frequency>,
    pub types: Vec<String>,
}

impl HandlerInfo {
    /// Read a handler's optional attributes, defaulting the missing ones
    pub fn fixup(handler: &dyn PartHandler) -> Self {
        let frequency = match handler.frequency() {
            None => Some(Frequency::PerInstance),
            Some(raw) => {
                let parsed = Frequency::parse(&raw);
                if parsed.is_none() {
                    tracing::warn!("Handler {} has an unknown frequency {}", handler.name(), raw);
                }
                parsed
            }
        };

        Self {
            version: handler.handler_version().unwrap_or(DEFAULT_HANDLER_VERSION),
            frequency,
            types: handler.list_types(),
        }
    }

    /// Whether the handler runs in a pass of the given frequency
    pub fn runs_in(&self, pass: Frequency) -> bool {
        match self.frequency {
            Some(Frequency::Always) => true,
            Some(Frequency::PerInstance) => pass == Frequency::PerInstance,
            _ => false,
        }
    }
}

/// Built-in handlers, registered for whatever types are still free
pub fn default_handlers() -> Vec<Box<dyn PartHandler>> {
    vec![
        Box::new(cloud_config::CloudConfigHandler::new()),
        Box::new(shell_script::ShellScriptHandler),
        Box::new(boot_hook::BootHookHandler),
    ]
}

/// Make a part filename safe to use as a single path component
pub fn clean_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| !c.is_control())
        .map(|c| if c == '/' { '_' } else { c })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => "part".to_string(),
        _ => cleaned,
    }
}

/// Convert CRLF line endings to LF
pub fn dos2unix(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len());
    let mut iter = payload.iter().peekable();
    while let Some(&b) = iter.next() {
        if b == b'\r' && iter.peek() == Some(&&b'\n') {
            continue;
        }
        out.push(b);
    }
    out
}

/// First line of a payload if it is at least `size` bytes, otherwise the
/// first `size` bytes
pub fn first_line_or_bytes(payload: &[u8], size: usize) -> String {
    let first_line = payload.split(|b| *b == b'\n').next().unwrap_or_default();
    let start = if first_line.len() >= size {
        &first_line[..size]
    } else {
        &payload[..payload.len().min(size)]
    };
    String::from_utf8_lossy(start).escape_debug().to_string()
}
