//! Hook registry: the hookName → chain map and its maintenance rules.
//!
//! Reads happen on every dispatch and go through an `arc-swap` snapshot, so
//! a request always observes a consistent chain; mutation is confined to
//! the loader and the filesystem watcher, serialized behind a writer lock.
//! Chain reassignment is atomic per hook name.
//!
//! Removing every function of a chain leaves an *empty* chain behind:
//! callers can distinguish "no such chain" from "chain with no functions".

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tracing::debug;

use super::{mask_matches, HookFunction, MatchMode};

/// Priority-ordered list of the functions registered under one hook name.
#[derive(Clone, Default)]
pub struct HookChain {
    functions: Vec<HookFunction>,
}

impl HookChain {
    /// Functions in execution order (ascending priority; ties unspecified).
    pub fn functions(&self) -> &[HookFunction] {
        &self.functions
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Functions participating in a request under the given mask and mode.
    pub fn matching(
        &self,
        requested: u32,
        mode: MatchMode,
    ) -> impl Iterator<Item = &HookFunction> {
        self.functions
            .iter()
            .filter(move |f| mask_matches(f.mask, requested, mode))
    }

    /// Inserts a function, replacing any existing one with the same
    /// (source, hook_name) identity.
    fn upsert(&mut self, function: HookFunction) {
        match self
            .functions
            .iter_mut()
            .find(|f| f.source == function.source && f.hook_name == function.hook_name)
        {
            Some(slot) => *slot = function,
            None => self.functions.push(function),
        }
    }

    fn remove_source(&mut self, source: &str) -> usize {
        let before = self.functions.len();
        self.functions.retain(|f| f.source != source);
        before - self.functions.len()
    }

    fn resort(&mut self) {
        self.functions.sort_by_key(|f| f.priority);
    }
}

type ChainMap = HashMap<String, Arc<HookChain>>;

/// Mapping from hook name to its chain.
pub struct HookRegistry {
    chains: ArcSwap<ChainMap>,
    writer: Mutex<()>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self {
            chains: ArcSwap::from_pointee(ChainMap::new()),
            writer: Mutex::new(()),
        }
    }

    /// Snapshot of the chain registered under `name`. `Some` of an empty
    /// chain means the name once had functions; `None` means it never did.
    pub fn chain(&self, name: &str) -> Option<Arc<HookChain>> {
        self.chains.load().get(name).cloned()
    }

    /// True iff the chain exists and at least one function matches.
    pub fn check_target(&self, name: &str, requested: u32, mode: MatchMode) -> bool {
        match self.chain(name) {
            Some(chain) => chain.matching(requested, mode).next().is_some(),
            None => false,
        }
    }

    /// Hook names with at least one registered function.
    pub fn hook_names(&self) -> Vec<String> {
        self.chains
            .load()
            .iter()
            .filter(|(_, c)| !c.is_empty())
            .map(|(n, _)| n.clone())
            .collect()
    }

    /// Installs a batch of functions, replacing by (source, hook_name)
    /// identity and re-sorting every touched chain.
    pub fn install(&self, functions: Vec<HookFunction>) {
        self.mutate(|map| {
            for function in functions {
                let chain = map.entry(function.hook_name.clone()).or_default();
                let chain = Arc::make_mut(chain);
                chain.upsert(function);
                chain.resort();
            }
        });
    }

    /// Removes every function carrying `source`, leaving empty chains in
    /// place.
    pub fn remove_source(&self, source: &str) {
        self.mutate(|map| {
            let mut removed = 0;
            for chain in map.values_mut() {
                removed += Arc::make_mut(chain).remove_source(source);
            }
            if removed > 0 {
                debug!(source, removed, "removed hook functions");
            }
        });
    }

    /// Reload step: drops the module's previous functions, then installs
    /// the freshly discovered set in one atomic swap.
    pub fn replace_module(&self, source: &str, functions: Vec<HookFunction>) {
        self.mutate(|map| {
            for chain in map.values_mut() {
                Arc::make_mut(chain).remove_source(source);
            }
            for function in functions {
                let chain = map.entry(function.hook_name.clone()).or_default();
                let chain = Arc::make_mut(chain);
                chain.upsert(function);
            }
            for chain in map.values_mut() {
                Arc::make_mut(chain).resort();
            }
        });
    }

    fn mutate(&self, f: impl FnOnce(&mut ChainMap)) {
        let _guard = self.writer.lock();
        let mut map = ChainMap::clone(&self.chains.load());
        f(&mut map);
        self.chains.store(Arc::new(map));
    }
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::{decode_name, HookArgs, HookOutput, ALL_CATEGORIES};

    fn function(source: &str, export: &str, priority: i64) -> HookFunction {
        let parsed = decode_name(export).expect("test export name must parse");
        HookFunction::new(
            source,
            parsed,
            priority,
            Arc::new(|_args: HookArgs, _cont| {
                Box::pin(async { Ok::<HookOutput, anyhow::Error>(None) })
            }),
        )
    }

    #[test]
    fn chains_sort_by_priority() {
        let registry = HookRegistry::new();
        registry.install(vec![
            function("m1", "hS_page", 10),
            function("m2", "hS_page", -5),
            function("m3", "hS_page", 0),
        ]);

        let chain = registry.chain("page").unwrap();
        let priorities: Vec<i64> = chain.functions().iter().map(|f| f.priority).collect();
        assert_eq!(priorities, vec![-5, 0, 10]);
    }

    #[test]
    fn same_identity_replaces() {
        let registry = HookRegistry::new();
        registry.install(vec![function("m1", "hS_page", 1)]);
        registry.install(vec![function("m1", "hS_page", 7)]);

        let chain = registry.chain("page").unwrap();
        assert_eq!(chain.len(), 1);
        assert_eq!(chain.functions()[0].priority, 7);
    }

    #[test]
    fn empty_chain_is_distinct_from_absent() {
        let registry = HookRegistry::new();
        registry.install(vec![function("m1", "hS_page", 0)]);
        registry.remove_source("m1");

        let chain = registry.chain("page").expect("chain survives removal");
        assert!(chain.is_empty());
        assert!(registry.chain("never-registered").is_none());
        assert!(!registry.check_target("page", ALL_CATEGORIES, MatchMode::Inclusive));
    }

    #[test]
    fn replace_module_swaps_function_set() {
        let registry = HookRegistry::new();
        registry.install(vec![
            function("m1", "hS_page", 0),
            function("m1", "hS_other", 0),
            function("m2", "hS_page", 5),
        ]);

        registry.replace_module("m1", vec![function("m1", "hS_third", 2)]);

        assert!(registry.chain("page").unwrap().len() == 1);
        assert!(registry.chain("other").unwrap().is_empty());
        assert_eq!(registry.chain("third").unwrap().len(), 1);
        assert_eq!(registry.chain("page").unwrap().functions()[0].source, "m2");
    }

    #[test]
    fn check_target_honors_masks() {
        let registry = HookRegistry::new();
        let mut f = function("m1", "hSA_page", 0);
        assert_eq!(f.mask, 0b001);
        f.mask = 0b010;
        registry.install(vec![f]);

        assert!(registry.check_target("page", 0b010, MatchMode::Inclusive));
        assert!(!registry.check_target("page", 0b001, MatchMode::Inclusive));
        assert!(registry.check_target("page", 0b010, MatchMode::Strict));
        assert!(!registry.check_target("page", 0b011, MatchMode::Strict));
    }
}
