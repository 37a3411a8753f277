//! Catalog of fuzzable signatures.

use std::collections::HashSet;

use indexmap::{IndexMap, IndexSet};

use crate::signature::{
    CallableSignature, FunctionMetadata, FunctionSignature, SignatureTemplate, TypeSignature,
};
use crate::types::DataType;

/// A function as declared by the engine under test.
#[derive(Debug, Clone)]
pub struct FunctionEntry {
    pub metadata: FunctionMetadata,
    pub signatures: Vec<FunctionSignature>,
}

impl FunctionEntry {
    pub fn new(metadata: FunctionMetadata) -> Self {
        Self {
            metadata,
            signatures: Vec::new(),
        }
    }

    pub fn signature(mut self, signature: FunctionSignature) -> Self {
        self.signatures.push(signature);
        self
    }
}

/// Functions keyed by name, in registration order.
pub type FunctionRegistry = IndexMap<String, FunctionEntry>;

/// Bookkeeping of what the catalog saw and accepted.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FunctionsStats {
    pub num_functions: usize,
    pub num_signatures: usize,
    pub num_supported_functions: usize,
    pub num_supported_signatures: usize,
}

/// Immutable-after-construction set of concrete signatures and templates.
#[derive(Debug, Default, Clone)]
pub struct SignatureCatalog {
    signatures: Vec<CallableSignature>,
    templates: Vec<SignatureTemplate>,
    registered: HashSet<(String, Vec<TypeSignature>)>,
    functions: IndexMap<String, FunctionMetadata>,
    seen_functions: IndexSet<String>,
    stats: FunctionsStats,
}

impl SignatureCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_registry(registry: &FunctionRegistry) -> Self {
        let mut catalog = Self::new();
        for (name, entry) in registry {
            for signature in &entry.signatures {
                catalog.register(name, entry.metadata, signature.clone());
            }
        }
        catalog
    }

    /// Registers one signature. Returns false, without side effects, when the
    /// argument types were already seen under `name`, supported or not.
    /// Returns false when the signature mentions an unsupported type.
    pub fn register(
        &mut self,
        name: &str,
        metadata: FunctionMetadata,
        signature: FunctionSignature,
    ) -> bool {
        let key = (name.to_string(), signature.args.clone());
        if !self.registered.insert(key) {
            return false;
        }

        if self.seen_functions.insert(name.to_string()) {
            self.stats.num_functions += 1;
        }
        self.stats.num_signatures += 1;

        if !signature
            .concrete_types()
            .into_iter()
            .all(Self::is_supported_type)
        {
            tracing::debug!("skipping signature with unsupported types: {name}");
            return false;
        }

        if signature.is_template() {
            self.templates.push(SignatureTemplate {
                name: name.to_string(),
                signature,
                metadata,
            });
        } else {
            let Some(callable) = CallableSignature::from_concrete(name, &signature, metadata)
            else {
                return false;
            };
            self.signatures.push(callable);
        }

        self.stats.num_supported_signatures += 1;
        if !self.functions.contains_key(name) {
            self.functions.insert(name.to_string(), metadata);
            self.stats.num_supported_functions += 1;
        }
        true
    }

    pub fn signatures(&self) -> &[CallableSignature] {
        &self.signatures
    }

    pub fn templates(&self) -> &[SignatureTemplate] {
        &self.templates
    }

    /// Number of selectable slots: concrete signatures followed by templates.
    pub fn len(&self) -> usize {
        self.signatures.len() + self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains_function(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn find(&self, name: &str) -> Option<&FunctionMetadata> {
        self.functions.get(name)
    }

    pub fn function_names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }

    pub fn functions_stats(&self) -> FunctionsStats {
        self.stats
    }

    /// Date, interval and unknown types are not fuzzed, nor is any container
    /// holding them.
    pub fn is_supported_type(ty: &DataType) -> bool {
        match ty {
            DataType::Date | DataType::IntervalDayTime | DataType::Unknown => false,
            _ => ty.children().into_iter().all(Self::is_supported_type),
        }
    }
}
