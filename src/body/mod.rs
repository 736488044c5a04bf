//! Request body processing: bind, then normalize, sanitize and validate.
//!
//! Each stage first offers the value to its [`BodyModel`] hook. When the hook
//! reports [`Hook::Generic`] the stage runs from the compiled schema instead,
//! over the value's JSON form.

pub mod bind;
pub mod validate;

use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;

use crate::endpoint::RequestContext;
use crate::error::{ApiError, FieldErrors};
use crate::schema::{schema_for, BodyModel, FieldKind, Hook, OperatorChain, OperatorKind, TypeSchema};

pub use bind::{parse_urlencoded, BodySource, FormValues};
pub use validate::from_validation_errors;

/// Run all three stages in order; the first failure wins
pub fn process<T: BodyModel>(body: &mut T, ctx: &RequestContext) -> Result<(), ApiError> {
    normalize(body, ctx)?;
    sanitize(body, ctx)?;
    validate(body, ctx)
}

pub fn normalize<T: BodyModel>(body: &mut T, ctx: &RequestContext) -> Result<(), ApiError> {
    if body.normalize(ctx)? == Hook::Handled {
        return Ok(());
    }
    apply_operators(body, OperatorKind::Normalize)
}

pub fn sanitize<T: BodyModel>(body: &mut T, ctx: &RequestContext) -> Result<(), ApiError> {
    if body.sanitize(ctx)? == Hook::Handled {
        return Ok(());
    }
    apply_operators(body, OperatorKind::Sanitize)
}

pub fn validate<T: BodyModel>(body: &T, ctx: &RequestContext) -> Result<(), ApiError> {
    if body.validate(ctx)? == Hook::Handled {
        return Ok(());
    }

    let schema = schema_for::<T>()?;
    if !schema.has_validate_tags {
        return Ok(());
    }

    let value = to_value(body)?;
    let mut errors = FieldErrors::new();
    validate::validate_object(&value, &schema, "", &mut errors)?;
    if errors.is_empty() {
        Ok(())
    } else {
        Err(ApiError::invalid_request("Validation failed", errors))
    }
}

fn apply_operators<T: BodyModel>(body: &mut T, kind: OperatorKind) -> Result<(), ApiError> {
    let schema = schema_for::<T>()?;
    if !schema.has_operators(kind) {
        return Ok(());
    }

    let mut value = to_value(body)?;
    let mut errors = FieldErrors::new();
    apply_to_object(&mut value, &schema, kind, "", &mut errors)?;
    if !errors.is_empty() {
        let message = match kind {
            OperatorKind::Normalize => "Normalization failed",
            OperatorKind::Sanitize => "Sanitization failed",
        };
        return Err(ApiError::invalid_request(message, errors));
    }

    *body = bind::from_value(value)?;
    Ok(())
}

fn to_value<T: BodyModel>(body: &T) -> Result<Value, ApiError> {
    serde_json::to_value(body).map_err(|e| {
        tracing::error!("Failed to serialize {} for processing: {}", std::any::type_name::<T>(), e);
        ApiError::internal_server_error("Failed to process request body")
    })
}

fn apply_to_object(
    value: &mut Value,
    schema: &TypeSchema,
    kind: OperatorKind,
    path: &str,
    errors: &mut FieldErrors,
) -> Result<(), ApiError> {
    let Value::Object(obj) = value else {
        return Ok(());
    };

    for field in &schema.fields {
        let Some(chain) = field.chain(kind) else {
            continue;
        };
        let Some(target) = obj.get_mut(field.name) else {
            continue;
        };
        let field_path = join(path, field.name);

        if !chain.dive {
            if let Value::String(s) = target {
                match chain.apply(s) {
                    Ok(out) => *s = out,
                    Err(message) => {
                        errors.insert(field_path, message);
                    }
                }
            }
            continue;
        }

        match field.kind.base() {
            FieldKind::Struct(nested) => {
                let nested = nested.resolve()?;
                apply_to_object(target, &nested, kind, &field_path, errors)?;
            }
            FieldKind::List(element) | FieldKind::Map(element) => {
                let element = element.as_ref();
                match target {
                    Value::Array(items) => {
                        for (i, item) in items.iter_mut().enumerate() {
                            let item_path = format!("{}[{}]", field_path, i);
                            apply_to_element(item, element, chain, kind, &item_path, errors)?;
                        }
                    }
                    Value::Object(map) => {
                        for (key, item) in map.iter_mut() {
                            let item_path = join(&field_path, key);
                            apply_to_element(item, element, chain, kind, &item_path, errors)?;
                        }
                    }
                    _ => {}
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn apply_to_element(
    item: &mut Value,
    element: &FieldKind,
    chain: &OperatorChain,
    kind: OperatorKind,
    path: &str,
    errors: &mut FieldErrors,
) -> Result<(), ApiError> {
    match element.base() {
        FieldKind::String => {
            if let Value::String(s) = item {
                match chain.apply(s) {
                    Ok(out) => *s = out,
                    Err(message) => {
                        errors.insert(path.to_string(), message);
                    }
                }
            }
        }
        FieldKind::Struct(nested) if item.is_object() => {
            let nested = nested.resolve()?;
            apply_to_object(item, &nested, kind, path, errors)?;
        }
        _ => {}
    }
    Ok(())
}

fn join(path: &str, name: &str) -> String {
    if path.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", path, name)
    }
}

// Collections of body models process every element through its own stages.
impl<T: BodyModel> BodyModel for Vec<T> {
    fn normalize(&mut self, ctx: &RequestContext) -> Result<Hook, ApiError> {
        for item in self.iter_mut() {
            normalize(item, ctx)?;
        }
        Ok(Hook::Handled)
    }

    fn sanitize(&mut self, ctx: &RequestContext) -> Result<Hook, ApiError> {
        for item in self.iter_mut() {
            sanitize(item, ctx)?;
        }
        Ok(Hook::Handled)
    }

    fn validate(&self, ctx: &RequestContext) -> Result<Hook, ApiError> {
        for item in self {
            validate(item, ctx)?;
        }
        Ok(Hook::Handled)
    }
}

impl<T: BodyModel> BodyModel for HashMap<String, T> {
    fn normalize(&mut self, ctx: &RequestContext) -> Result<Hook, ApiError> {
        for item in self.values_mut() {
            normalize(item, ctx)?;
        }
        Ok(Hook::Handled)
    }

    fn sanitize(&mut self, ctx: &RequestContext) -> Result<Hook, ApiError> {
        for item in self.values_mut() {
            sanitize(item, ctx)?;
        }
        Ok(Hook::Handled)
    }

    fn validate(&self, ctx: &RequestContext) -> Result<Hook, ApiError> {
        for item in self.values() {
            validate(item, ctx)?;
        }
        Ok(Hook::Handled)
    }
}

/// A bound and processed body, type-erased for the request context
pub struct ParsedBody {
    type_name: &'static str,
    value: Box<dyn Any + Send + Sync>,
}

impl ParsedBody {
    pub fn new<T: BodyModel>(value: T) -> Self {
        Self {
            type_name: std::any::type_name::<T>(),
            value: Box::new(value),
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn downcast_ref<T: BodyModel>(&self) -> Option<&T> {
        self.value.downcast_ref()
    }

    pub fn downcast<T: BodyModel>(self) -> Result<T, Self> {
        let type_name = self.type_name;
        self.value
            .downcast::<T>()
            .map(|boxed| *boxed)
            .map_err(|value| Self { type_name, value })
    }
}

impl fmt::Debug for ParsedBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParsedBody").field("type", &self.type_name).finish()
    }
}

/// Binds and processes one body type; stored on an endpoint declaration
#[derive(Clone, Copy)]
pub struct BodyBinder {
    pub type_name: &'static str,
    run: fn(BodySource, &RequestContext) -> Result<ParsedBody, ApiError>,
}

impl BodyBinder {
    pub fn of<T: BodyModel>() -> Self {
        Self {
            type_name: std::any::type_name::<T>(),
            run: bind_and_process::<T>,
        }
    }

    pub fn run(&self, source: BodySource, ctx: &RequestContext) -> Result<ParsedBody, ApiError> {
        (self.run)(source, ctx)
    }
}

impl fmt::Debug for BodyBinder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BodyBinder").field("type", &self.type_name).finish()
    }
}

fn bind_and_process<T: BodyModel>(source: BodySource, ctx: &RequestContext) -> Result<ParsedBody, ApiError> {
    let mut body: T = bind::bind(source)?;
    process(&mut body, ctx)?;
    Ok(ParsedBody::new(body))
}
