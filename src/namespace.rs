//! The ACPI namespace: a tree of named objects, stored here as an ordered
//! map keyed by normalized absolute path. The execution engine resolves
//! NameStrings against it, stores into it, and populates it with
//! method-local names that are removed again when the method exits.

use crate::{value::AmlValue, AmlError};
use alloc::{
    collections::BTreeMap,
    string::{String, ToString},
    vec::Vec,
};
use core::fmt;

/// Longest normalized path the engine will accept, in bytes.
pub const MAX_NAME: usize = 64;

/// A normalized AML name: absolute, rooted at `\`, with 4-character segments
/// separated by `.` and no `^` prefixes (e.g. `\_SB.PCI0._STA`), or a
/// relative form as parsed from a NameString before resolution.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct AmlName(String);

impl AmlName {
    pub fn root() -> AmlName {
        AmlName("\\".to_string())
    }

    pub fn from_str(string: &str) -> Result<AmlName, AmlError> {
        if string.is_empty() {
            return Err(AmlError::EmptyNamesAreInvalid);
        }
        if string.len() > MAX_NAME {
            return Err(AmlError::NameTooLong);
        }
        Ok(AmlName(string.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_absolute(&self) -> bool {
        self.0.starts_with('\\')
    }

    /// Whether this is a plain single segment with no root or path prefixes.
    /// Only these are subject to the upward search rules.
    pub fn is_single_segment(&self) -> bool {
        !self.0.starts_with('\\') && !self.0.starts_with('^') && !self.0.contains('.')
    }

    pub fn parent(&self) -> Result<AmlName, AmlError> {
        if self.0 == "\\" {
            return Err(AmlError::RootHasNoParent);
        }
        match self.0.rfind('.') {
            Some(index) => Ok(AmlName(self.0[..index].to_string())),
            None => Ok(AmlName::root()),
        }
    }

    /// Resolve this name against `scope`, yielding an absolute name. `scope`
    /// must be absolute. Leading `^`s move up one level each.
    pub fn resolve(&self, scope: &AmlName) -> Result<AmlName, AmlError> {
        if self.is_absolute() {
            return Ok(self.clone());
        }

        let mut level = scope.clone();
        let mut path = self.0.as_str();
        while let Some(rest) = path.strip_prefix('^') {
            level = level.parent().map_err(|_| AmlError::InvalidNormalizedName(self.clone()))?;
            path = rest;
        }

        if path.is_empty() {
            return Ok(level);
        }

        let resolved = if level.0 == "\\" { format_name(&level.0, path) } else { format_name(&(level.0 + "."), path) };
        if resolved.len() > MAX_NAME {
            return Err(AmlError::NameTooLong);
        }
        Ok(AmlName(resolved))
    }
}

fn format_name(prefix: &str, path: &str) -> String {
    let mut name = String::with_capacity(prefix.len() + path.len());
    name.push_str(prefix);
    name.push_str(path);
    name
}

impl fmt::Display for AmlName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Default, Debug)]
pub struct Namespace {
    objects: BTreeMap<AmlName, AmlValue>,
}

impl Namespace {
    pub fn new() -> Namespace {
        Namespace { objects: BTreeMap::new() }
    }

    /// Add a value at an absolute path. Two values may not share a name.
    pub fn add_value(&mut self, path: AmlName, value: AmlValue) -> Result<(), AmlError> {
        if !path.is_absolute() {
            return Err(AmlError::InvalidNormalizedName(path));
        }
        if self.objects.contains_key(&path) {
            return Err(AmlError::NameCollision(path));
        }
        self.objects.insert(path, value);
        Ok(())
    }

    pub fn get_by_path(&self, path: &AmlName) -> Result<&AmlValue, AmlError> {
        self.objects.get(path).ok_or_else(|| AmlError::ValueDoesNotExist(path.clone()))
    }

    pub fn get_by_path_mut(&mut self, path: &AmlName) -> Result<&mut AmlValue, AmlError> {
        self.objects.get_mut(path).ok_or_else(|| AmlError::ValueDoesNotExist(path.clone()))
    }

    pub fn contains(&self, path: &AmlName) -> bool {
        self.objects.contains_key(path)
    }

    /// Resolve `path` against `scope` using the namespace search rules
    /// (§5.3 of the ACPI spec): a prefixed or multi-segment path resolves
    /// directly, while a bare single segment is searched for in the scope
    /// itself and then each ancestor up to the root.
    pub fn search(&self, path: &AmlName, scope: &AmlName) -> Result<AmlName, AmlError> {
        if path.is_single_segment() {
            let mut level = scope.clone();
            loop {
                let candidate = path.resolve(&level)?;
                if self.objects.contains_key(&candidate) {
                    return Ok(candidate);
                }
                match level.parent() {
                    Ok(parent) => level = parent,
                    Err(_) => return Err(AmlError::ValueDoesNotExist(path.resolve(scope)?)),
                }
            }
        } else {
            let resolved = path.resolve(scope)?;
            if self.objects.contains_key(&resolved) {
                Ok(resolved)
            } else {
                Err(AmlError::ValueDoesNotExist(resolved))
            }
        }
    }

    /// Remove every object below `prefix`. Used to destroy names a method
    /// created in its own scope when the invocation ends (§5.5.2.3).
    pub fn remove_level(&mut self, prefix: &AmlName) {
        let below: Vec<AmlName> = self
            .objects
            .keys()
            .filter(|name| name.0.len() > prefix.0.len() && name.0.starts_with(prefix.0.as_str()))
            .cloned()
            .collect();
        for name in below {
            self.objects.remove(&name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve() {
        let scope = AmlName::from_str("\\_SB.PCI0").unwrap();
        assert_eq!(AmlName::from_str("_STA").unwrap().resolve(&scope).unwrap().as_str(), "\\_SB.PCI0._STA");
        assert_eq!(AmlName::from_str("\\_OSI").unwrap().resolve(&scope).unwrap().as_str(), "\\_OSI");
        assert_eq!(AmlName::from_str("^^_TZ").unwrap().resolve(&scope).unwrap().as_str(), "\\_TZ");
        assert!(AmlName::from_str("^^^FOO_").unwrap().resolve(&scope).is_err());
    }

    #[test]
    fn test_resolve_at_root() {
        let root = AmlName::root();
        assert_eq!(AmlName::from_str("_SB_").unwrap().resolve(&root).unwrap().as_str(), "\\_SB_");
    }

    #[test]
    fn test_parent() {
        assert_eq!(AmlName::from_str("\\_SB.PCI0").unwrap().parent().unwrap().as_str(), "\\_SB");
        assert_eq!(AmlName::from_str("\\_SB").unwrap().parent().unwrap().as_str(), "\\");
        assert!(AmlName::root().parent().is_err());
    }

    #[test]
    fn test_search_walks_up() {
        let mut namespace = Namespace::new();
        namespace.add_value(AmlName::from_str("\\FOO_").unwrap(), AmlValue::Integer(1)).unwrap();
        namespace.add_value(AmlName::from_str("\\_SB.BAR_").unwrap(), AmlValue::Integer(2)).unwrap();

        let scope = AmlName::from_str("\\_SB.PCI0").unwrap();
        // BAR_ isn't in \_SB.PCI0, but is found one level up.
        assert_eq!(
            namespace.search(&AmlName::from_str("BAR_").unwrap(), &scope).unwrap().as_str(),
            "\\_SB.BAR_"
        );
        // FOO_ is only at the root.
        assert_eq!(namespace.search(&AmlName::from_str("FOO_").unwrap(), &scope).unwrap().as_str(), "\\FOO_");
        assert!(matches!(
            namespace.search(&AmlName::from_str("MISS").unwrap(), &scope),
            Err(AmlError::ValueDoesNotExist(_))
        ));
    }

    #[test]
    fn test_add_value_rejects_collisions() {
        let mut namespace = Namespace::new();
        let name = AmlName::from_str("\\FOO_").unwrap();
        namespace.add_value(name.clone(), AmlValue::Integer(1)).unwrap();
        assert_eq!(namespace.add_value(name.clone(), AmlValue::Integer(2)), Err(AmlError::NameCollision(name)));
    }

    #[test]
    fn test_remove_level() {
        let mut namespace = Namespace::new();
        namespace.add_value(AmlName::from_str("\\MTH_").unwrap(), AmlValue::Integer(0)).unwrap();
        namespace.add_value(AmlName::from_str("\\MTH_.TMP_").unwrap(), AmlValue::Integer(1)).unwrap();
        namespace.remove_level(&AmlName::from_str("\\MTH_").unwrap());
        assert!(namespace.contains(&AmlName::from_str("\\MTH_").unwrap()));
        assert!(!namespace.contains(&AmlName::from_str("\\MTH_.TMP_").unwrap()));
    }
}
