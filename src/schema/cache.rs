//! Compiled body schemas, memoized per type.
//!
//! Reads take a shared lock; a miss compiles outside the lock and the first
//! writer wins, so concurrent first requests for one type may each compile it
//! but only one copy is ever published.

use once_cell::sync::Lazy;
use std::any::TypeId;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use super::operators::{self, NamedOperator, OperatorKind};
use super::{BodyModel, FieldKind, FieldRule, SchemaError};
use crate::body::validate::RuleSet;

/// Ordered operator list from a `normalize` or `sanitize` tag
#[derive(Debug, Clone)]
pub struct OperatorChain {
    pub ops: Vec<NamedOperator>,
    pub dive: bool,
}

impl OperatorChain {
    /// Run every operator in order, stopping at the first failure
    pub fn apply(&self, input: &str) -> Result<String, String> {
        let mut current = input.to_string();
        for op in &self.ops {
            current = op.apply(&current)?;
        }
        Ok(current)
    }
}

#[derive(Debug, Clone)]
pub struct FieldSchema {
    /// Position among the type's declared fields
    pub index: usize,
    pub name: &'static str,
    pub kind: FieldKind,
    pub normalize: Option<OperatorChain>,
    pub sanitize: Option<OperatorChain>,
    pub validate: Option<RuleSet>,
}

impl FieldSchema {
    pub fn chain(&self, kind: OperatorKind) -> Option<&OperatorChain> {
        match kind {
            OperatorKind::Normalize => self.normalize.as_ref(),
            OperatorKind::Sanitize => self.sanitize.as_ref(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TypeSchema {
    pub type_name: &'static str,
    pub fields: Vec<FieldSchema>,
    pub has_validate_tags: bool,
}

impl TypeSchema {
    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Whether any field declares operators for this stage, directly or by diving
    pub fn has_operators(&self, kind: OperatorKind) -> bool {
        self.fields.iter().any(|f| f.chain(kind).is_some())
    }

    /// Compile a type's field rules
    pub fn compile(type_name: &'static str, rules: Vec<FieldRule>) -> Result<Self, SchemaError> {
        let mut seen = HashSet::new();
        let mut fields = Vec::with_capacity(rules.len());

        for (index, rule) in rules.into_iter().enumerate() {
            if !seen.insert(rule.name) {
                return Err(SchemaError::DuplicateField { type_name, field: rule.name });
            }

            let normalize = compile_chain(type_name, &rule, OperatorKind::Normalize, rule.normalize_tag)?;
            let sanitize = compile_chain(type_name, &rule, OperatorKind::Sanitize, rule.sanitize_tag)?;
            let validate = match rule.validate_tag {
                Some(tag) => {
                    let rules = RuleSet::parse(tag).map_err(|message| SchemaError::InvalidValidateTag {
                        type_name,
                        field: rule.name,
                        message,
                    })?;
                    if rules.dive.is_some() && !rule.kind.is_collection() {
                        return Err(SchemaError::DiveNotAllowed { type_name, field: rule.name });
                    }
                    Some(rules)
                }
                None => None,
            };

            fields.push(FieldSchema {
                index,
                name: rule.name,
                kind: rule.kind,
                normalize,
                sanitize,
                validate,
            });
        }

        let has_validate_tags = fields.iter().any(|f| f.validate.is_some());
        Ok(Self {
            type_name,
            fields,
            has_validate_tags,
        })
    }
}

fn compile_chain(
    type_name: &'static str,
    rule: &FieldRule,
    kind: OperatorKind,
    tag: Option<&'static str>,
) -> Result<Option<OperatorChain>, SchemaError> {
    let Some(tag) = tag else {
        return Ok(None);
    };

    let mut ops = Vec::new();
    let mut dive = false;
    for name in tag.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        if name == "dive" {
            dive = true;
            continue;
        }
        let op = operators::lookup(kind, name).ok_or_else(|| SchemaError::UnknownOperator {
            type_name,
            field: rule.name,
            kind,
            operator: name.to_string(),
        })?;
        ops.push(op);
    }

    if dive {
        if !rule.kind.can_dive() {
            return Err(SchemaError::DiveNotAllowed { type_name, field: rule.name });
        }
    } else if !ops.is_empty() && !rule.kind.is_string() {
        return Err(SchemaError::NotAString {
            type_name,
            field: rule.name,
            kind,
        });
    }

    if ops.is_empty() && !dive {
        return Ok(None);
    }
    Ok(Some(OperatorChain { ops, dive }))
}

static CACHE: Lazy<RwLock<HashMap<TypeId, Arc<TypeSchema>>>> = Lazy::new(|| RwLock::new(HashMap::new()));

/// Compiled schema for `T`, built on first call
pub fn schema_for<T: BodyModel>() -> Result<Arc<TypeSchema>, SchemaError> {
    let key = TypeId::of::<T>();
    {
        let cache = CACHE.read().map_err(|_| SchemaError::RegistryPoisoned)?;
        if let Some(schema) = cache.get(&key) {
            return Ok(Arc::clone(schema));
        }
    }

    let compiled = Arc::new(TypeSchema::compile(std::any::type_name::<T>(), T::fields())?);

    let mut cache = CACHE.write().map_err(|_| SchemaError::RegistryPoisoned)?;
    let schema = cache.entry(key).or_insert_with(|| {
        tracing::debug!("Cached body schema for {} ({} fields)", compiled.type_name, compiled.fields.len());
        Arc::clone(&compiled)
    });
    Ok(Arc::clone(schema))
}
