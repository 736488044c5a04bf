//! Declarative body schemas.
//!
//! A request body type implements [`BodyModel`] and lists its fields as
//! [`FieldRule`]s: the JSON name, the value shape, and the `normalize`,
//! `sanitize` and `validate` tags. The rules are compiled once per type by
//! [`cache::schema_for`] and every request after that walks the compiled form.

pub mod cache;
pub mod operators;

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::endpoint::RequestContext;
use crate::error::ApiError;

pub use cache::{schema_for, FieldSchema, OperatorChain, TypeSchema};
pub use operators::{register_normalizer, register_sanitizer, OperatorKind};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchemaError {
    #[error("{type_name}.{field}: unknown {kind} operator '{operator}'")]
    UnknownOperator {
        type_name: &'static str,
        field: &'static str,
        kind: OperatorKind,
        operator: String,
    },

    #[error("{type_name}.{field}: 'dive' is only valid on struct, list or map fields")]
    DiveNotAllowed { type_name: &'static str, field: &'static str },

    #[error("{type_name}.{field}: {kind} operators apply to string fields, use 'dive' for collections")]
    NotAString {
        type_name: &'static str,
        field: &'static str,
        kind: OperatorKind,
    },

    #[error("{type_name}.{field}: invalid validate tag: {message}")]
    InvalidValidateTag {
        type_name: &'static str,
        field: &'static str,
        message: String,
    },

    #[error("{type_name}: field '{field}' is declared twice")]
    DuplicateField { type_name: &'static str, field: &'static str },

    #[error("{kind} operator '{name}' is already registered")]
    AlreadyRegistered { kind: OperatorKind, name: String },

    #[error("invalid operator name '{0}'")]
    InvalidOperatorName(String),

    #[error("operator registry lock poisoned")]
    RegistryPoisoned,
}

/// Shape of a field's JSON value
#[derive(Clone)]
pub enum FieldKind {
    String,
    Int,
    Float,
    Bool,
    /// Arbitrary JSON, bound from form values by parsing the text as JSON
    Json,
    List(Box<FieldKind>),
    /// String-keyed map
    Map(Box<FieldKind>),
    Struct(NestedSchema),
    Optional(Box<FieldKind>),
}

impl FieldKind {
    /// The kind with any `Optional` wrappers removed
    pub fn base(&self) -> &FieldKind {
        match self {
            FieldKind::Optional(inner) => inner.base(),
            other => other,
        }
    }

    pub fn is_optional(&self) -> bool {
        matches!(self, FieldKind::Optional(_))
    }

    pub fn is_string(&self) -> bool {
        matches!(self.base(), FieldKind::String)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self.base(), FieldKind::Int | FieldKind::Float)
    }

    /// Lists and maps are measured by element count rather than by value
    pub fn is_collection(&self) -> bool {
        matches!(self.base(), FieldKind::List(_) | FieldKind::Map(_))
    }

    pub fn can_dive(&self) -> bool {
        matches!(self.base(), FieldKind::List(_) | FieldKind::Map(_) | FieldKind::Struct(_))
    }

    /// Element kind for lists and maps
    pub fn element(&self) -> Option<&FieldKind> {
        match self.base() {
            FieldKind::List(inner) | FieldKind::Map(inner) => Some(inner),
            _ => None,
        }
    }
}

impl fmt::Debug for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldKind::String => write!(f, "String"),
            FieldKind::Int => write!(f, "Int"),
            FieldKind::Float => write!(f, "Float"),
            FieldKind::Bool => write!(f, "Bool"),
            FieldKind::Json => write!(f, "Json"),
            FieldKind::List(inner) => write!(f, "List<{:?}>", inner),
            FieldKind::Map(inner) => write!(f, "Map<{:?}>", inner),
            FieldKind::Struct(nested) => write!(f, "Struct<{}>", nested.type_name),
            FieldKind::Optional(inner) => write!(f, "Option<{:?}>", inner),
        }
    }
}

/// Reference to another body type's schema, resolved on first use so
/// self-referencing types do not recurse while being compiled
#[derive(Clone, Copy)]
pub struct NestedSchema {
    pub type_name: &'static str,
    resolve: fn() -> Result<Arc<TypeSchema>, SchemaError>,
}

impl NestedSchema {
    pub fn of<T: BodyModel>() -> Self {
        Self {
            type_name: std::any::type_name::<T>(),
            resolve: schema_for::<T>,
        }
    }

    pub fn resolve(&self) -> Result<Arc<TypeSchema>, SchemaError> {
        (self.resolve)()
    }
}

/// One declared field of a body type
#[derive(Debug, Clone)]
pub struct FieldRule {
    /// Serialized (JSON) name, also used as the key in error details
    pub name: &'static str,
    pub kind: FieldKind,
    pub normalize_tag: Option<&'static str>,
    pub sanitize_tag: Option<&'static str>,
    pub validate_tag: Option<&'static str>,
}

impl FieldRule {
    pub fn new(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            normalize_tag: None,
            sanitize_tag: None,
            validate_tag: None,
        }
    }

    pub fn string(name: &'static str) -> Self {
        Self::new(name, FieldKind::String)
    }

    pub fn int(name: &'static str) -> Self {
        Self::new(name, FieldKind::Int)
    }

    pub fn float(name: &'static str) -> Self {
        Self::new(name, FieldKind::Float)
    }

    pub fn bool(name: &'static str) -> Self {
        Self::new(name, FieldKind::Bool)
    }

    pub fn json(name: &'static str) -> Self {
        Self::new(name, FieldKind::Json)
    }

    pub fn list(name: &'static str, element: FieldKind) -> Self {
        Self::new(name, FieldKind::List(Box::new(element)))
    }

    pub fn map(name: &'static str, value: FieldKind) -> Self {
        Self::new(name, FieldKind::Map(Box::new(value)))
    }

    pub fn nested<T: BodyModel>(name: &'static str) -> Self {
        Self::new(name, FieldKind::Struct(NestedSchema::of::<T>()))
    }

    /// Mark the field as `Option<_>`
    pub fn optional(mut self) -> Self {
        if !self.kind.is_optional() {
            self.kind = FieldKind::Optional(Box::new(self.kind));
        }
        self
    }

    pub fn normalize(mut self, tag: &'static str) -> Self {
        self.normalize_tag = Some(tag);
        self
    }

    pub fn sanitize(mut self, tag: &'static str) -> Self {
        self.sanitize_tag = Some(tag);
        self
    }

    pub fn validate(mut self, tag: &'static str) -> Self {
        self.validate_tag = Some(tag);
        self
    }
}

/// What a body hook did with its stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hook {
    /// Not implemented; run the tag-driven processing instead
    Generic,
    /// The hook took care of the stage
    Handled,
}

/// A request body type.
///
/// `fields` drives the generic normalize, sanitize and validate stages. A type
/// that overrides one of the hooks and returns [`Hook::Handled`] replaces the
/// generic processing for that stage on the top-level value.
pub trait BodyModel: Serialize + DeserializeOwned + Send + Sync + 'static {
    fn fields() -> Vec<FieldRule>
    where
        Self: Sized,
    {
        Vec::new()
    }

    fn normalize(&mut self, _ctx: &RequestContext) -> Result<Hook, ApiError> {
        Ok(Hook::Generic)
    }

    fn sanitize(&mut self, _ctx: &RequestContext) -> Result<Hook, ApiError> {
        Ok(Hook::Generic)
    }

    fn validate(&self, _ctx: &RequestContext) -> Result<Hook, ApiError> {
        Ok(Hook::Generic)
    }
}
