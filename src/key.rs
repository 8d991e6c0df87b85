use std::fmt;

use crate::Resource;

/// Identity of one remote object: `(namespace, name)`.
///
/// Used as the map key of the multiplexer. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn from_resource<K: Resource>(obj: &K) -> Self {
        Self::new(obj.namespace(), obj.name())
    }

    pub fn matches<K: Resource>(
        &self,
        obj: &K,
    ) -> bool {
        self.namespace == obj.namespace() && self.name == obj.name()
    }

    pub fn selector(&self) -> FieldSelector {
        FieldSelector {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Identity of a subscriber (e.g. the parent resource referencing an object).
///
/// Lives in its own key space: an `OwnerKey` is never used to look up a watch stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerKey {
    pub namespace: String,
    pub name: String,
}

impl OwnerKey {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of the object named `target_name` in the owner's namespace.
    pub fn target(
        &self,
        target_name: &str,
    ) -> ObjectKey {
        ObjectKey::new(self.namespace.clone(), target_name)
    }
}

impl fmt::Display for OwnerKey {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Restricts list/watch calls to a single object by `metadata.name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSelector {
    pub namespace: String,
    pub name: String,
}

impl FieldSelector {
    pub fn matches<K: Resource>(
        &self,
        obj: &K,
    ) -> bool {
        self.namespace == obj.namespace() && self.name == obj.name()
    }
}

impl fmt::Display for FieldSelector {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "metadata.namespace={},metadata.name={}", self.namespace, self.name)
    }
}
