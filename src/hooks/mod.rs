//! Hook model: execution policies, category masks, the naming grammar, and
//! the typed [`HookFunction`] record.
//!
//! A hook function is exported from a module under a name of the form
//! `h<Policy><Categories>_<hookName>`: the policy letter selects
//! SYNC/ASYNC/EVENT execution, the category letters build a 26-bit mask (no
//! letters means "all categories"), and everything after the underscore is
//! the hook name, used verbatim for routing. URI hooks follow the
//! `<canonical-host>$<path>` convention, site-default hooks
//! `<canonical-host>$`.

pub mod executor;
pub mod loader;
pub mod registry;
pub mod watcher;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::HeaderMap;

use crate::descriptor::ResponseDescriptor;
use crate::hooks::executor::{Continuation, RespondHandle};

/// Sentinel mask for functions declaring no categories: matches every
/// inclusive request.
pub const ALL_CATEGORIES: u32 = u32::MAX;

/// Hook name of the built-in event fired after each module reload batch.
pub const MODULE_CHANGED_HOOK: &str = "onHookModuleChanged";

/// Execution policy of a hook function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecPolicy {
    /// Runs to completion; its return value becomes the chain result.
    Sync,
    /// Suspends the chain until its continuation is invoked; the
    /// continuation value becomes the chain result.
    Async,
    /// Runs for its side effects; the chain result is left unchanged.
    Event,
}

impl ExecPolicy {
    fn from_letter(c: char) -> Option<Self> {
        match c.to_ascii_uppercase() {
            'S' => Some(ExecPolicy::Sync),
            'A' => Some(ExecPolicy::Async),
            'E' => Some(ExecPolicy::Event),
            _ => None,
        }
    }

    fn letter(self) -> char {
        match self {
            ExecPolicy::Sync => 'S',
            ExecPolicy::Async => 'A',
            ExecPolicy::Event => 'E',
        }
    }
}

/// How a requested category mask is compared against function masks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    /// Any shared bit matches; the all-categories sentinel matches every
    /// request.
    Inclusive,
    /// Exact mask equality.
    Strict,
}

/// Returns the mask bit for a category letter.
pub fn category_bit(c: char) -> Option<u32> {
    let c = c.to_ascii_uppercase();
    if c.is_ascii_uppercase() {
        Some(1 << (c as u32 - 'A' as u32))
    } else {
        None
    }
}

/// Whether a function's mask participates in a request under the given
/// match mode.
pub fn mask_matches(function_mask: u32, requested: u32, mode: MatchMode) -> bool {
    match mode {
        MatchMode::Inclusive => {
            function_mask == ALL_CATEGORIES || function_mask & requested != 0
        }
        MatchMode::Strict => function_mask == requested,
    }
}

/// Decoded export name: policy, category mask, and hook name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedName {
    pub policy: ExecPolicy,
    pub mask: u32,
    pub name: String,
}

/// Decodes an export name per the `h<Policy><Categories>_<hookName>`
/// grammar. Returns `None` for names that do not parse; such exports are
/// ignored by the loader.
pub fn decode_name(export: &str) -> Option<ParsedName> {
    let rest = export.strip_prefix('h')?;
    let mut chars = rest.char_indices();
    let (_, policy_char) = chars.next()?;
    let policy = ExecPolicy::from_letter(policy_char)?;

    let mut mask = 0u32;
    for (idx, c) in chars {
        if c == '_' {
            let name = &rest[idx + 1..];
            if name.is_empty() {
                return None;
            }
            return Some(ParsedName {
                policy,
                mask: if mask == 0 { ALL_CATEGORIES } else { mask },
                name: name.to_owned(),
            });
        }
        mask |= category_bit(c)?;
    }
    None
}

/// Re-encodes a parsed name. Inverse of [`decode_name`] up to letter case.
pub fn encode_name(policy: ExecPolicy, mask: u32, name: &str) -> String {
    let mut out = String::from("h");
    out.push(policy.letter());
    if mask != ALL_CATEGORIES {
        for i in 0..26 {
            if mask & (1 << i) != 0 {
                out.push((b'A' + i as u8) as char);
            }
        }
    }
    out.push('_');
    out.push_str(name);
    out
}

/// Condensed view of the request a manual-mode delegate receives.
#[derive(Debug, Clone)]
pub struct RequestSummary {
    pub method: String,
    pub target: String,
    pub headers: HeaderMap,
}

/// Arguments for request-serving hooks.
#[derive(Clone)]
pub struct RequestArgs {
    /// Set for site-default hooks, which receive the path as their first
    /// argument; URI hooks carry it in their name instead.
    pub path: Option<String>,
    pub params: HashMap<String, String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Arguments for manual-mode delegation: the raw exchange plus the
/// descriptor that requested it.
#[derive(Clone)]
pub struct ManualArgs {
    pub request: RequestSummary,
    pub respond: RespondHandle,
    pub descriptor: Arc<ResponseDescriptor>,
}

/// Positional arguments passed to a hook chain.
#[derive(Clone)]
pub enum HookArgs {
    /// (params, headers, body) for URI hooks; (path, params, headers, body)
    /// for site-default hooks.
    Request(RequestArgs),
    /// Absolute path of a reloaded module (`onHookModuleChanged`).
    ModuleChanged { path: PathBuf },
    /// Manual-mode delegation.
    Manual(ManualArgs),
}

/// Result a hook produces: a descriptor, or nothing.
pub type HookOutput = Option<ResponseDescriptor>;

/// Boxed future returned by hook handlers.
pub type HookFuture = BoxFuture<'static, anyhow::Result<HookOutput>>;

/// Typed hook handler. ASYNC handlers receive a continuation; SYNC and
/// EVENT handlers are invoked with `None`.
pub type HookHandler = Arc<dyn Fn(HookArgs, Option<Continuation>) -> HookFuture + Send + Sync>;

/// A registered hook function: a typed handler plus the metadata decoded
/// from its export name and module.
#[derive(Clone)]
pub struct HookFunction {
    /// Originating module identifier (the module file's basename).
    pub source: String,
    /// Routing name, verbatim from the export name.
    pub hook_name: String,
    /// Category mask; [`ALL_CATEGORIES`] when none were declared.
    pub mask: u32,
    /// Lower priorities execute earlier.
    pub priority: i64,
    pub policy: ExecPolicy,
    pub handler: HookHandler,
}

impl std::fmt::Debug for HookFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookFunction")
            .field("source", &self.source)
            .field("hook_name", &self.hook_name)
            .field("mask", &self.mask)
            .field("priority", &self.priority)
            .field("policy", &self.policy)
            .finish()
    }
}

impl HookFunction {
    /// Builds a function record from a handler closure; used by the module
    /// loader and by native built-ins.
    pub fn new(
        source: impl Into<String>,
        parsed: ParsedName,
        priority: i64,
        handler: HookHandler,
    ) -> Self {
        Self {
            source: source.into(),
            hook_name: parsed.name,
            mask: parsed.mask,
            priority,
            policy: parsed.policy,
            handler,
        }
    }
}
