//! Function registry.
//!
//! The catalog is an immutable snapshot swapped atomically on every write, so
//! lookups never block registration and listings iterate a stable view.

use crate::error::AiError;
use crate::types::{Capability, ExecutionMode, FunctionCategory, FunctionDescriptor};
use arc_swap::ArcSwap;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default, Clone)]
struct Catalog {
    /// Identifiers in registration order
    order: Vec<String>,
    entries: HashMap<String, Arc<FunctionDescriptor>>,
}

/// Catalog mapping function identifiers to their descriptors.
#[derive(Debug, Default)]
pub struct FunctionRegistry {
    catalog: ArcSwap<Catalog>,
    /// Serializes writers; readers go through the snapshot only
    write_lock: Mutex<()>,
}

static GLOBAL: Lazy<FunctionRegistry> = Lazy::new(FunctionRegistry::new);

impl FunctionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide registry for test harnesses. Call [`reset`](Self::reset)
    /// between tests.
    pub fn global() -> &'static FunctionRegistry {
        &GLOBAL
    }

    /// Register a descriptor, replacing any existing one with the same id.
    ///
    /// A replaced descriptor keeps its original position in listings.
    pub fn register(&self, descriptor: FunctionDescriptor) {
        // non-strict writes never fail
        let _ = self.write(descriptor, false);
    }

    /// Register a descriptor, failing if the id is already present.
    pub fn register_strict(&self, descriptor: FunctionDescriptor) -> Result<(), AiError> {
        self.write(descriptor, true)
    }

    fn write(&self, descriptor: FunctionDescriptor, strict: bool) -> Result<(), AiError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let current = self.catalog.load();

        if current.entries.contains_key(&descriptor.id) {
            if strict {
                return Err(AiError::DuplicateFunction(descriptor.id));
            }
            tracing::debug!("Replacing function descriptor: {}", descriptor.id);
        }

        let mut next = Catalog::clone(&current);
        if !next.entries.contains_key(&descriptor.id) {
            next.order.push(descriptor.id.clone());
        }
        tracing::debug!("Registered function: {} ({})", descriptor.name, descriptor.id);
        next.entries
            .insert(descriptor.id.clone(), Arc::new(descriptor));
        self.catalog.store(Arc::new(next));
        Ok(())
    }

    /// Look up a descriptor by id
    pub fn resolve(&self, function_id: &str) -> Result<Arc<FunctionDescriptor>, AiError> {
        self.catalog
            .load()
            .entries
            .get(function_id)
            .cloned()
            .ok_or_else(|| AiError::UnknownFunction(function_id.to_string()))
    }

    /// Descriptors in `category`, in registration order.
    ///
    /// The listing captures the catalog at call time; iterate it as many times
    /// as needed.
    pub fn list_by_category(&self, category: FunctionCategory) -> CategoryListing {
        CategoryListing {
            snapshot: self.catalog.load_full(),
            category,
        }
    }

    /// Descriptors whose default mode runs without a typed prompt
    pub fn auto_functions(&self) -> Vec<Arc<FunctionDescriptor>> {
        let snapshot = self.catalog.load();
        snapshot
            .order
            .iter()
            .filter_map(|id| snapshot.entries.get(id))
            .filter(|d| d.default_mode.is_automatic())
            .cloned()
            .collect()
    }

    pub fn is_registered(&self, function_id: &str) -> bool {
        self.catalog.load().entries.contains_key(function_id)
    }

    pub fn len(&self) -> usize {
        self.catalog.load().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every registration
    pub fn reset(&self) {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.catalog.store(Arc::new(Catalog::default()));
        tracing::debug!("Function registry reset");
    }
}

/// Restartable, lazily filtered view over one category.
#[derive(Debug, Clone)]
pub struct CategoryListing {
    snapshot: Arc<Catalog>,
    category: FunctionCategory,
}

impl CategoryListing {
    /// Iterate the matching descriptors from the start
    pub fn iter(&self) -> impl Iterator<Item = &Arc<FunctionDescriptor>> + '_ {
        self.snapshot
            .order
            .iter()
            .filter_map(|id| self.snapshot.entries.get(id))
            .filter(|d| d.category == self.category)
    }
}

impl<'a> IntoIterator for &'a CategoryListing {
    type Item = &'a Arc<FunctionDescriptor>;
    type IntoIter = Box<dyn Iterator<Item = &'a Arc<FunctionDescriptor>> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.iter())
    }
}

/// Register the built-in writing functions.
pub fn register_builtin_functions(registry: &FunctionRegistry) {
    let builtins = [
        FunctionDescriptor::new(
            "intelligent_continuation",
            "Continue writing",
            FunctionCategory::Generation,
            ExecutionMode::AutoContext,
        )
        .with_min_context_length(50)
        .requires(Capability::TextGeneration)
        .requires(Capability::Streaming)
        .with_system_prompt(
            "Continue the passage below in the same voice, tense and style. \
             Output only the continuation.",
        ),
        FunctionDescriptor::new(
            "intelligent_optimization",
            "Polish text",
            FunctionCategory::Optimization,
            ExecutionMode::Hybrid,
        )
        .with_min_context_length(20)
        .requires(Capability::TextGeneration)
        .with_system_prompt(
            "Improve the clarity and flow of the text below while keeping its meaning. \
             Output only the revised text.",
        ),
        FunctionDescriptor::new(
            "intelligent_analysis",
            "Analyze selection",
            FunctionCategory::Analysis,
            ExecutionMode::AutoSelection,
        )
        .with_min_context_length(30)
        .requires(Capability::TextAnalysis)
        .with_system_prompt(
            "Analyze the text below: point of view, tone, pacing and notable literary devices.",
        ),
        FunctionDescriptor::new(
            "intelligent_inspiration",
            "Suggest ideas",
            FunctionCategory::Inspiration,
            ExecutionMode::AutoContext,
        )
        .with_min_context_length(40)
        .requires(Capability::TextGeneration)
        .with_system_prompt(
            "Based on the story so far, suggest three distinct directions the next scene could take.",
        ),
        FunctionDescriptor::new(
            "enhanced_ai_chat",
            "Writing assistant chat",
            FunctionCategory::Conversation,
            ExecutionMode::ManualInput,
        )
        .requires(Capability::TextGeneration),
    ];

    for descriptor in builtins {
        registry.register(descriptor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(id: &str, category: FunctionCategory) -> FunctionDescriptor {
        FunctionDescriptor::new(id, id, category, ExecutionMode::ManualInput)
    }

    #[test]
    fn test_resolve_unknown_function() {
        let registry = FunctionRegistry::new();
        assert!(matches!(
            registry.resolve("missing"),
            Err(AiError::UnknownFunction(id)) if id == "missing"
        ));
    }

    #[test]
    fn test_register_replaces_silently_and_keeps_order() {
        let registry = FunctionRegistry::new();
        registry.register(descriptor("a", FunctionCategory::Analysis));
        registry.register(descriptor("b", FunctionCategory::Analysis));
        registry.register(
            descriptor("a", FunctionCategory::Analysis).with_min_context_length(7),
        );

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.resolve("a").unwrap().min_context_length, 7);

        let ids: Vec<_> = registry
            .list_by_category(FunctionCategory::Analysis)
            .iter()
            .map(|d| d.id.clone())
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_strict_registration_rejects_duplicates() {
        let registry = FunctionRegistry::new();
        registry
            .register_strict(descriptor("a", FunctionCategory::Generation))
            .unwrap();
        let err = registry
            .register_strict(descriptor("a", FunctionCategory::Generation))
            .unwrap_err();
        assert!(matches!(err, AiError::DuplicateFunction(id) if id == "a"));
    }

    #[test]
    fn test_listing_is_restartable_snapshot() {
        let registry = FunctionRegistry::new();
        registry.register(descriptor("g1", FunctionCategory::Generation));
        registry.register(descriptor("x", FunctionCategory::Translation));
        registry.register(descriptor("g2", FunctionCategory::Generation));

        let listing = registry.list_by_category(FunctionCategory::Generation);
        registry.register(descriptor("g3", FunctionCategory::Generation));

        let first: Vec<_> = listing.iter().map(|d| d.id.as_str()).collect();
        let second: Vec<_> = (&listing).into_iter().map(|d| d.id.as_str()).collect();
        assert_eq!(first, vec!["g1", "g2"]);
        assert_eq!(first, second);

        let fresh = registry.list_by_category(FunctionCategory::Generation);
        assert_eq!(fresh.iter().count(), 3);
    }

    #[test]
    fn test_builtins_and_reset() {
        let registry = FunctionRegistry::new();
        register_builtin_functions(&registry);

        let continuation = registry.resolve("intelligent_continuation").unwrap();
        assert_eq!(continuation.default_mode, ExecutionMode::AutoContext);
        assert_eq!(continuation.min_context_length, 50);
        assert_eq!(registry.auto_functions().len(), 4);

        registry.reset();
        assert!(registry.is_empty());
        assert!(!registry.is_registered("intelligent_continuation"));
    }
}
