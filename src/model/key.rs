//! Entity keys

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::codec::ID_KEY_LENGTH;
use crate::error::{DatastoreError, Result};

/// One (kind, id-or-name) step of a key path
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PathElement {
    pub kind: String,
    pub id: Option<i64>,
    pub name: Option<String>,
}

impl PathElement {
    pub fn with_id(kind: impl Into<String>, id: i64) -> Self {
        Self {
            kind: kind.into(),
            id: Some(id),
            name: None,
        }
    }

    pub fn with_name(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: None,
            name: Some(name.into()),
        }
    }

    /// An element whose numeric id will be allocated on put
    pub fn incomplete(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: None,
            name: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.id.is_some() || self.name.is_some()
    }

    fn validate(&self) -> Result<()> {
        if self.kind.is_empty() {
            return Err(DatastoreError::BadRequest("empty kind in key path".to_string()));
        }
        if self.kind.contains(&[':', '\u{0}', '\u{1}'][..]) {
            return Err(DatastoreError::BadRequest(format!(
                "invalid character in kind {:?}",
                self.kind
            )));
        }
        match (&self.id, &self.name) {
            (Some(_), Some(_)) => Err(DatastoreError::BadRequest(format!(
                "path element of kind {} has both id and name",
                self.kind
            ))),
            (Some(id), None) if *id <= 0 => Err(DatastoreError::BadRequest(format!(
                "path element of kind {} has non-positive id {}",
                self.kind, id
            ))),
            (None, Some(name)) if name.is_empty() || name.contains(&['\u{0}', '\u{1}'][..]) => {
                Err(DatastoreError::BadRequest(format!(
                    "invalid name {:?} in path element of kind {}",
                    name, self.kind
                )))
            }
            // Would read back as a zero-padded numeric id
            (None, Some(name)) if name.len() >= ID_KEY_LENGTH && name.bytes().all(|b| b.is_ascii_digit()) => {
                Err(DatastoreError::BadRequest(format!(
                    "name {:?} in path element of kind {} looks like a numeric id",
                    name, self.kind
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Identity of an entity: application, namespace and ancestor path
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Key {
    pub app: String,
    pub namespace: String,
    pub path: Vec<PathElement>,
}

impl Key {
    pub fn new(app: impl Into<String>, namespace: impl Into<String>, path: Vec<PathElement>) -> Self {
        Self {
            app: app.into(),
            namespace: namespace.into(),
            path,
        }
    }

    /// Root key with a numeric id in the default namespace
    pub fn with_id(app: impl Into<String>, kind: impl Into<String>, id: i64) -> Self {
        Self::new(app, "", vec![PathElement::with_id(kind, id)])
    }

    /// Root key with a name in the default namespace
    pub fn with_name(app: impl Into<String>, kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(app, "", vec![PathElement::with_name(kind, name)])
    }

    /// Root key awaiting an allocated id, in the default namespace
    pub fn incomplete(app: impl Into<String>, kind: impl Into<String>) -> Self {
        Self::new(app, "", vec![PathElement::incomplete(kind)])
    }

    /// Same key placed in another namespace
    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn child_with_id(&self, kind: impl Into<String>, id: i64) -> Self {
        self.child(PathElement::with_id(kind, id))
    }

    pub fn child_with_name(&self, kind: impl Into<String>, name: impl Into<String>) -> Self {
        self.child(PathElement::with_name(kind, name))
    }

    pub fn child(&self, element: PathElement) -> Self {
        let mut path = self.path.clone();
        path.push(element);
        Self::new(self.app.clone(), self.namespace.clone(), path)
    }

    /// Kind of the last path element
    pub fn kind(&self) -> &str {
        self.path.last().map(|e| e.kind.as_str()).unwrap_or("")
    }

    pub fn last(&self) -> Option<&PathElement> {
        self.path.last()
    }

    /// Key of the entity group root
    pub fn root(&self) -> Key {
        Self::new(
            self.app.clone(),
            self.namespace.clone(),
            self.path.iter().take(1).cloned().collect(),
        )
    }

    pub fn parent(&self) -> Option<Key> {
        if self.path.len() < 2 {
            return None;
        }
        Some(Self::new(
            self.app.clone(),
            self.namespace.clone(),
            self.path[..self.path.len() - 1].to_vec(),
        ))
    }

    pub fn is_complete(&self) -> bool {
        self.path.last().map(PathElement::is_complete).unwrap_or(false)
    }

    /// True when `other` equals this key or lives beneath it
    pub fn is_ancestor_of(&self, other: &Key) -> bool {
        self.app == other.app
            && self.namespace == other.namespace
            && other.path.len() >= self.path.len()
            && other.path[..self.path.len()] == self.path[..]
    }

    /// Validate the key shape.
    ///
    /// Only the last element may be incomplete, and only when
    /// `allow_incomplete` is set.
    pub fn validate(&self, allow_incomplete: bool) -> Result<()> {
        if self.app.is_empty() || self.app.contains('\u{0}') {
            return Err(DatastoreError::BadRequest(format!("invalid app id {:?}", self.app)));
        }
        if self.namespace.contains('\u{0}') {
            return Err(DatastoreError::BadRequest(format!(
                "invalid namespace {:?}",
                self.namespace
            )));
        }
        if self.path.is_empty() {
            return Err(DatastoreError::BadRequest("key has an empty path".to_string()));
        }

        let last = self.path.len() - 1;
        for (position, element) in self.path.iter().enumerate() {
            element.validate()?;
            if !element.is_complete() && (position != last || !allow_incomplete) {
                return Err(DatastoreError::BadRequest(format!(
                    "incomplete path element of kind {}",
                    element.kind
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.app, self.namespace)?;
        for element in &self.path {
            match (&element.id, &element.name) {
                (Some(id), _) => write!(f, "/{}:{}", element.kind, id)?,
                (None, Some(name)) => write!(f, "/{}:{:?}", element.kind, name)?,
                (None, None) => write!(f, "/{}:?", element.kind)?,
            }
        }
        Ok(())
    }
}
