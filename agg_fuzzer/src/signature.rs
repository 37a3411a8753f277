//! Function signatures and signature templates.
//!
//! A [`FunctionSignature`] may mention type variables (`T`, `ARRAY(T)`, ...).
//! Signatures without variables are registered as concrete signatures; the
//! others become [`SignatureTemplate`]s that are resolved into a concrete
//! [`CallableSignature`] each time they are picked.

use std::collections::HashMap;
use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::types::DataType;

/// Argument or return type, possibly referring to type variables.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeSignature {
    Concrete(DataType),
    Variable(String),
    Array(Box<TypeSignature>),
    Map(Box<TypeSignature>, Box<TypeSignature>),
}

impl TypeSignature {
    pub fn var(name: &str) -> Self {
        TypeSignature::Variable(name.to_string())
    }

    pub fn array(element: TypeSignature) -> Self {
        TypeSignature::Array(Box::new(element))
    }

    pub fn is_concrete(&self) -> bool {
        match self {
            TypeSignature::Concrete(_) => true,
            TypeSignature::Variable(_) => false,
            TypeSignature::Array(element) => element.is_concrete(),
            TypeSignature::Map(key, value) => key.is_concrete() && value.is_concrete(),
        }
    }

    /// Substitutes bound variables. Returns `None` if a variable is unbound.
    pub fn resolve(&self, bindings: &HashMap<String, DataType>) -> Option<DataType> {
        match self {
            TypeSignature::Concrete(ty) => Some(ty.clone()),
            TypeSignature::Variable(name) => bindings.get(name).cloned(),
            TypeSignature::Array(element) => Some(DataType::array(element.resolve(bindings)?)),
            TypeSignature::Map(key, value) => Some(DataType::map(
                key.resolve(bindings)?,
                value.resolve(bindings)?,
            )),
        }
    }

    /// Concrete types nested in this signature.
    pub fn concrete_types(&self) -> Vec<&DataType> {
        match self {
            TypeSignature::Concrete(ty) => vec![ty],
            TypeSignature::Variable(_) => Vec::new(),
            TypeSignature::Array(element) => element.concrete_types(),
            TypeSignature::Map(key, value) => {
                let mut types = key.concrete_types();
                types.extend(value.concrete_types());
                types
            }
        }
    }
}

impl From<DataType> for TypeSignature {
    fn from(ty: DataType) -> Self {
        TypeSignature::Concrete(ty)
    }
}

impl fmt::Display for TypeSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeSignature::Concrete(ty) => write!(f, "{ty}"),
            TypeSignature::Variable(name) => write!(f, "{name}"),
            TypeSignature::Array(element) => write!(f, "ARRAY({element})"),
            TypeSignature::Map(key, value) => write!(f, "MAP({key}, {value})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TypeVariable {
    pub name: String,
    /// Only orderable types may be bound to this variable.
    pub orderable_only: bool,
}

/// Contexts a function may be called in.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumIter,
)]
#[strum(serialize_all = "snake_case")]
pub enum FunctionKind {
    /// Usable as a plain aggregate and as a window function.
    Aggregate,
    /// Usable only inside a window.
    Window,
}

/// Declared properties of a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FunctionMetadata {
    pub kind: FunctionKind,
    /// The result depends on the order rows are fed in.
    pub order_sensitive: bool,
    /// The same input always yields the same result.
    pub deterministic: bool,
    pub supports_distinct: bool,
}

impl FunctionMetadata {
    pub const fn aggregate() -> Self {
        Self {
            kind: FunctionKind::Aggregate,
            order_sensitive: false,
            deterministic: true,
            supports_distinct: false,
        }
    }

    pub const fn window() -> Self {
        Self {
            kind: FunctionKind::Window,
            order_sensitive: true,
            deterministic: true,
            supports_distinct: false,
        }
    }

    pub const fn order_sensitive(mut self) -> Self {
        self.order_sensitive = true;
        self
    }

    pub const fn non_deterministic(mut self) -> Self {
        self.deterministic = false;
        self
    }

    pub const fn distinct(mut self) -> Self {
        self.supports_distinct = true;
        self
    }
}

/// Declared signature of a function, before type variable resolution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FunctionSignature {
    pub type_variables: Vec<TypeVariable>,
    pub args: Vec<TypeSignature>,
    pub return_type: TypeSignature,
    /// The last argument may be repeated.
    pub variable_arity: bool,
}

impl FunctionSignature {
    pub fn new(return_type: impl Into<TypeSignature>) -> Self {
        Self {
            type_variables: Vec::new(),
            args: Vec::new(),
            return_type: return_type.into(),
            variable_arity: false,
        }
    }

    pub fn type_variable(mut self, name: &str) -> Self {
        self.type_variables.push(TypeVariable {
            name: name.to_string(),
            orderable_only: false,
        });
        self
    }

    pub fn orderable_type_variable(mut self, name: &str) -> Self {
        self.type_variables.push(TypeVariable {
            name: name.to_string(),
            orderable_only: true,
        });
        self
    }

    pub fn arg(mut self, arg: impl Into<TypeSignature>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn variable_arity(mut self) -> Self {
        self.variable_arity = true;
        self
    }

    pub fn is_template(&self) -> bool {
        !self.type_variables.is_empty()
            || !self.return_type.is_concrete()
            || self.args.iter().any(|a| !a.is_concrete())
    }

    /// Every concrete type the signature mentions.
    pub fn concrete_types(&self) -> Vec<&DataType> {
        self.args
            .iter()
            .chain(std::iter::once(&self.return_type))
            .flat_map(TypeSignature::concrete_types)
            .collect()
    }
}

/// A fully resolved signature ready to be called.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallableSignature {
    pub name: String,
    pub args: Vec<DataType>,
    pub return_type: DataType,
    pub variable_arity: bool,
    pub metadata: FunctionMetadata,
}

impl CallableSignature {
    /// Builds a callable from a signature without type variables.
    pub fn from_concrete(
        name: &str,
        signature: &FunctionSignature,
        metadata: FunctionMetadata,
    ) -> Option<Self> {
        let empty = HashMap::new();
        Some(Self {
            name: name.to_string(),
            args: signature
                .args
                .iter()
                .map(|a| a.resolve(&empty))
                .collect::<Option<Vec<_>>>()?,
            return_type: signature.return_type.resolve(&empty)?,
            variable_arity: signature.variable_arity,
            metadata,
        })
    }

    pub fn is_window_only(&self) -> bool {
        self.metadata.kind == FunctionKind::Window
    }

    /// Repeats the last argument between zero and `max_num_varargs` extra
    /// times for variable arity signatures.
    pub fn with_random_varargs(mut self, max_num_varargs: usize, rng: &mut impl Rng) -> Self {
        if self.variable_arity {
            if let Some(last) = self.args.last().cloned() {
                let extra = rng.random_range(0..=max_num_varargs);
                self.args.extend(std::iter::repeat_n(last, extra));
            }
        }
        self
    }
}

impl fmt::Display for CallableSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name)?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{arg}")?;
        }
        if self.variable_arity {
            write!(f, "...")?;
        }
        write!(f, ") -> {}", self.return_type)
    }
}

/// Signature with type variables, resolved at pick time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SignatureTemplate {
    pub name: String,
    pub signature: FunctionSignature,
    pub metadata: FunctionMetadata,
}

impl SignatureTemplate {
    /// Binds every type variable to a random key type and substitutes the
    /// bindings. Returns `None` when a variable cannot be bound.
    pub fn resolve(&self, key_types: &[DataType], rng: &mut impl Rng) -> Option<CallableSignature> {
        let mut bindings = HashMap::new();
        for variable in &self.signature.type_variables {
            let candidates: Vec<&DataType> = key_types
                .iter()
                .filter(|t| !variable.orderable_only || t.is_orderable())
                .collect();
            if candidates.is_empty() {
                return None;
            }
            let chosen = candidates[rng.random_range(0..candidates.len())].clone();
            bindings.insert(variable.name.clone(), chosen);
        }
        Some(CallableSignature {
            name: self.name.clone(),
            args: self
                .signature
                .args
                .iter()
                .map(|a| a.resolve(&bindings))
                .collect::<Option<Vec<_>>>()?,
            return_type: self.signature.return_type.resolve(&bindings)?,
            variable_arity: self.signature.variable_arity,
            metadata: self.metadata,
        })
    }
}

impl fmt::Display for SignatureTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if !self.signature.type_variables.is_empty() {
            let names: Vec<&str> = self
                .signature
                .type_variables
                .iter()
                .map(|v| v.name.as_str())
                .collect();
            write!(f, "<{}>", names.join(", "))?;
        }
        write!(f, "(")?;
        for (i, arg) in self.signature.args.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{arg}")?;
        }
        if self.signature.variable_arity {
            write!(f, "...")?;
        }
        write!(f, ") -> {}", self.signature.return_type)
    }
}
