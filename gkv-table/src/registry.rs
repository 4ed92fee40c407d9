//! # Plug-in Registries
//!
//! String-keyed factories for every pluggable kind, consulted when a
//! `CreateTable` materializes its sharder/combiner/reducer/selector by
//! `type_id`. One process-wide registry per kind, pre-seeded with the
//! built-ins and open for user registration before tables are created.

use std::sync::{Arc, OnceLock};

use gkv_common::{GkvError, GkvResult, PluginSpec};
use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::plugin::{
    Accumulator, AppendAccumulator, HashSharder, IdentitySelector, LengthSelector, MaxAccumulator,
    ModSharder, ReplaceAccumulator, Selector, Sharder, SumAccumulator,
};

type Factory<P> = Arc<dyn Fn(&str) -> GkvResult<Arc<P>> + Send + Sync>;

/// Factory map for one plug-in kind.
pub struct Registry<P: ?Sized> {
    kind: &'static str,
    entries: RwLock<HashMap<String, Factory<P>>>,
}

impl<P: ?Sized> Registry<P> {
    pub fn new(kind: &'static str) -> Self {
        Registry {
            kind,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a factory under `id`, replacing any previous entry.
    ///
    /// The factory receives the opaque opts string from the `PluginSpec`.
    pub fn register<F>(&self, id: &str, factory: F)
    where
        F: Fn(&str) -> GkvResult<Arc<P>> + Send + Sync + 'static,
    {
        self.entries
            .write()
            .insert(id.to_string(), Arc::new(factory));
    }

    /// Instantiates the plug-in named by `spec`.
    pub fn create(&self, spec: &PluginSpec) -> GkvResult<Arc<P>> {
        let factory = {
            let entries = self.entries.read();
            entries.get(&spec.type_id).cloned()
        };
        match factory {
            Some(factory) => factory(&spec.opts),
            None => Err(GkvError::UnknownPlugin {
                kind: self.kind,
                id: spec.type_id.clone(),
            }),
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.read().contains_key(id)
    }
}

/// Process-wide sharder registry.
pub fn sharders() -> &'static Registry<dyn Sharder> {
    static REGISTRY: OnceLock<Registry<dyn Sharder>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let registry = Registry::new("sharder");
        registry.register("hash", |_| Ok(Arc::new(HashSharder::default()) as Arc<dyn Sharder>));
        registry.register("mod", |_| Ok(Arc::new(ModSharder::default()) as Arc<dyn Sharder>));
        registry
    })
}

/// Process-wide accumulator registry, serving combiner and reducer slots.
pub fn accumulators() -> &'static Registry<dyn Accumulator> {
    static REGISTRY: OnceLock<Registry<dyn Accumulator>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let registry = Registry::new("accumulator");
        registry.register("replace", |_| Ok(Arc::new(ReplaceAccumulator) as Arc<dyn Accumulator>));
        registry.register("sum", |_| Ok(Arc::new(SumAccumulator) as Arc<dyn Accumulator>));
        registry.register("max", |_| Ok(Arc::new(MaxAccumulator) as Arc<dyn Accumulator>));
        registry.register("append", |_| Ok(Arc::new(AppendAccumulator) as Arc<dyn Accumulator>));
        registry
    })
}

/// Process-wide selector registry.
pub fn selectors() -> &'static Registry<dyn Selector> {
    static REGISTRY: OnceLock<Registry<dyn Selector>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let registry = Registry::new("selector");
        registry.register("identity", |_| Ok(Arc::new(IdentitySelector) as Arc<dyn Selector>));
        registry.register("len", |_| Ok(Arc::new(LengthSelector) as Arc<dyn Selector>));
        registry
    })
}
