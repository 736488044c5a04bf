//! Named string operators used by `normalize` and `sanitize` field tags.
//!
//! Built-ins are registered on first use; applications may add their own at
//! startup. Registration is by name and a name can only be taken once.

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use unicode_normalization::char::{decompose_compatible, is_combining_mark};
use unicode_normalization::UnicodeNormalization;

use super::SchemaError;

pub type OperatorFn = Arc<dyn Fn(&str) -> Result<String, String> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperatorKind {
    Normalize,
    Sanitize,
}

impl fmt::Display for OperatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperatorKind::Normalize => write!(f, "normalize"),
            OperatorKind::Sanitize => write!(f, "sanitize"),
        }
    }
}

/// An operator resolved from the registry, kept with its tag name
#[derive(Clone)]
pub struct NamedOperator {
    pub name: String,
    apply: OperatorFn,
}

impl NamedOperator {
    pub fn apply(&self, input: &str) -> Result<String, String> {
        (self.apply)(input)
    }
}

impl fmt::Debug for NamedOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamedOperator").field("name", &self.name).finish()
    }
}

type Registry = HashMap<(OperatorKind, String), OperatorFn>;

static REGISTRY: Lazy<RwLock<Registry>> = Lazy::new(|| RwLock::new(builtins()));

fn builtins() -> Registry {
    let mut registry: Registry = HashMap::new();
    let mut add = |kind: OperatorKind, name: &str, f: fn(&str) -> String| {
        registry.insert((kind, name.to_string()), Arc::new(move |s: &str| Ok(f(s))));
    };

    add(OperatorKind::Normalize, "trim", |s| s.trim().to_string());
    add(OperatorKind::Normalize, "lowercase", |s| s.to_lowercase());
    add(OperatorKind::Normalize, "uppercase", |s| s.to_uppercase());
    add(OperatorKind::Normalize, "unaccent", unaccent);
    add(OperatorKind::Normalize, "unicode", |s| s.nfc().collect());

    add(OperatorKind::Sanitize, "html", |s| ammonia::clean(s));
    add(OperatorKind::Sanitize, "alphanumeric", |s| {
        s.chars().filter(|c| is_letter(*c) || is_decimal_digit(*c)).collect()
    });
    add(OperatorKind::Sanitize, "numeric", |s| s.chars().filter(|c| is_decimal_digit(*c)).collect());

    registry
}

/// Digits of any script. Fractions, roman numerals and super/subscripts are
/// numeric too, but they have compatibility decompositions and are dropped.
fn is_decimal_digit(c: char) -> bool {
    if c.is_ascii_digit() {
        return true;
    }
    if !c.is_numeric() || c.is_alphabetic() {
        return false;
    }
    let mut unchanged = true;
    decompose_compatible(c, |d| unchanged &= d == c);
    unchanged
}

/// Alphabetic minus letter-like numbers such as roman numerals
fn is_letter(c: char) -> bool {
    c.is_alphabetic() && !c.is_numeric()
}

/// Strip combining marks after canonical decomposition, then recompose
fn unaccent(s: &str) -> String {
    s.nfd().filter(|c| !is_combining_mark(*c)).nfc().collect()
}

pub fn register<F>(kind: OperatorKind, name: &str, f: F) -> Result<(), SchemaError>
where
    F: Fn(&str) -> Result<String, String> + Send + Sync + 'static,
{
    let name = name.trim();
    if name.is_empty() || name == "dive" || name.contains(',') {
        return Err(SchemaError::InvalidOperatorName(name.to_string()));
    }
    let mut registry = REGISTRY.write().map_err(|_| SchemaError::RegistryPoisoned)?;
    let key = (kind, name.to_string());
    if registry.contains_key(&key) {
        return Err(SchemaError::AlreadyRegistered { kind, name: name.to_string() });
    }
    registry.insert(key, Arc::new(f));
    tracing::debug!("Registered {} operator '{}'", kind, name);
    Ok(())
}

pub fn register_normalizer<F>(name: &str, f: F) -> Result<(), SchemaError>
where
    F: Fn(&str) -> Result<String, String> + Send + Sync + 'static,
{
    register(OperatorKind::Normalize, name, f)
}

pub fn register_sanitizer<F>(name: &str, f: F) -> Result<(), SchemaError>
where
    F: Fn(&str) -> Result<String, String> + Send + Sync + 'static,
{
    register(OperatorKind::Sanitize, name, f)
}

pub fn lookup(kind: OperatorKind, name: &str) -> Option<NamedOperator> {
    let registry = REGISTRY.read().ok()?;
    registry.get(&(kind, name.to_string())).map(|apply| NamedOperator {
        name: name.to_string(),
        apply: Arc::clone(apply),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(kind: OperatorKind, name: &str, input: &str) -> String {
        lookup(kind, name).unwrap().apply(input).unwrap()
    }

    #[test]
    fn builtin_normalizers() {
        assert_eq!(run(OperatorKind::Normalize, "trim", "  John  "), "John");
        assert_eq!(run(OperatorKind::Normalize, "lowercase", "JOHN"), "john");
        assert_eq!(run(OperatorKind::Normalize, "uppercase", "john"), "JOHN");
        assert_eq!(run(OperatorKind::Normalize, "unaccent", "Crème Brûlée"), "Creme Brulee");
        assert_eq!(run(OperatorKind::Normalize, "unicode", "e\u{301}"), "\u{e9}");
    }

    #[test]
    fn builtin_sanitizers() {
        assert_eq!(run(OperatorKind::Sanitize, "html", "<script>x</script>a@b.co"), "a@b.co");
        assert_eq!(run(OperatorKind::Sanitize, "html", "<b>bold</b>"), "<b>bold</b>");
        assert_eq!(run(OperatorKind::Sanitize, "alphanumeric", "j!@#ohn 42"), "john42");
        assert_eq!(run(OperatorKind::Sanitize, "numeric", "+1 (555) 010-99"), "155501099");
    }

    #[test]
    fn digit_sanitizers_keep_only_decimal_digits() {
        assert_eq!(run(OperatorKind::Sanitize, "numeric", "1½ Ⅻ x²3"), "13");
        assert_eq!(run(OperatorKind::Sanitize, "alphanumeric", "a½Ⅻb²"), "ab");
        // Arabic-Indic digits are decimal digits
        assert_eq!(run(OperatorKind::Sanitize, "numeric", "\u{663}-\u{664}"), "\u{663}\u{664}");
    }

    #[test]
    fn registration_is_once_per_name() {
        register_normalizer("collapse_spaces", |s| {
            Ok(s.split_whitespace().collect::<Vec<_>>().join(" "))
        })
        .unwrap();
        assert_eq!(run(OperatorKind::Normalize, "collapse_spaces", "a   b"), "a b");

        let again = register_normalizer("collapse_spaces", |s| Ok(s.to_string()));
        assert!(matches!(again, Err(SchemaError::AlreadyRegistered { .. })));
        assert!(register_normalizer("trim", |s| Ok(s.to_string())).is_err());
        assert!(register_sanitizer("dive", |s| Ok(s.to_string())).is_err());
    }

    #[test]
    fn kinds_are_separate_namespaces() {
        assert!(lookup(OperatorKind::Sanitize, "trim").is_none());
        assert!(lookup(OperatorKind::Normalize, "html").is_none());
    }
}
