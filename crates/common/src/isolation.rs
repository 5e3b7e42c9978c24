//! Hierarchical isolation contexts.
//!
//! Every read and write in the core happens inside an [`IsolationContext`].
//! Contexts are resolved once at request entry (see [`IsolationResolver`]),
//! validated on construction and never mutated afterwards.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Granularity of an isolation context, from widest to narrowest.
///
/// The derived ordering follows the hierarchy: `Platform < Tenant <
/// Organization < Department < User`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    Platform,
    Tenant,
    Organization,
    Department,
    User,
}

impl IsolationLevel {
    /// Number of scope identifiers a context at this level carries.
    pub fn depth(&self) -> usize {
        match self {
            IsolationLevel::Platform => 0,
            IsolationLevel::Tenant => 1,
            IsolationLevel::Organization => 2,
            IsolationLevel::Department => 3,
            IsolationLevel::User => 4,
        }
    }

    /// Returns the level name used in namespaces.
    pub fn as_str(&self) -> &'static str {
        match self {
            IsolationLevel::Platform => "platform",
            IsolationLevel::Tenant => "tenant",
            IsolationLevel::Organization => "organization",
            IsolationLevel::Department => "department",
            IsolationLevel::User => "user",
        }
    }
}

impl std::fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Errors raised while building or resolving an isolation context.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IsolationError {
    /// A level deeper than platform is missing one of its ancestor identifiers.
    #[error("Invalid isolation context: {level} level requires a {missing} identifier")]
    MissingIdentifier {
        level: IsolationLevel,
        missing: &'static str,
    },

    /// An identifier below the context's level was supplied.
    #[error("Invalid isolation context: {level} level cannot carry a {field} identifier")]
    UnexpectedIdentifier {
        level: IsolationLevel,
        field: &'static str,
    },

    /// An identifier is empty or contains the namespace separator.
    #[error("Invalid isolation context: {field} identifier {value:?} is empty or contains ':'")]
    MalformedIdentifier { field: &'static str, value: String },

    /// The resolver could not produce a context from the request.
    #[error("Isolation context could not be resolved: {0}")]
    Unresolved(String),
}

const SCOPE_FIELDS: [&str; 4] = ["tenant", "organization", "department", "user"];

/// The active scope of a request.
///
/// Invariant: a context at level `L` carries exactly the identifiers of the
/// levels from tenant down to `L`, all non-empty and free of `:`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawIsolationContext")]
pub struct IsolationContext {
    level: IsolationLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    tenant_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    organization_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    department_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_id: Option<String>,
}

#[derive(Deserialize)]
struct RawIsolationContext {
    level: IsolationLevel,
    #[serde(default)]
    tenant_id: Option<String>,
    #[serde(default)]
    organization_id: Option<String>,
    #[serde(default)]
    department_id: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
}

impl TryFrom<RawIsolationContext> for IsolationContext {
    type Error = IsolationError;

    fn try_from(raw: RawIsolationContext) -> Result<Self, Self::Error> {
        Self::new(
            raw.level,
            raw.tenant_id,
            raw.organization_id,
            raw.department_id,
            raw.user_id,
        )
    }
}

impl IsolationContext {
    /// Builds a context, validating that exactly the identifiers required by
    /// `level` are present.
    pub fn new(
        level: IsolationLevel,
        tenant_id: Option<String>,
        organization_id: Option<String>,
        department_id: Option<String>,
        user_id: Option<String>,
    ) -> Result<Self, IsolationError> {
        let ids = [&tenant_id, &organization_id, &department_id, &user_id];
        for (index, (field, id)) in SCOPE_FIELDS.into_iter().zip(ids).enumerate() {
            let required = index < level.depth();
            match (required, id) {
                (true, None) => {
                    return Err(IsolationError::MissingIdentifier {
                        level,
                        missing: field,
                    });
                }
                (false, Some(_)) => {
                    return Err(IsolationError::UnexpectedIdentifier { level, field });
                }
                (true, Some(value)) if value.is_empty() || value.contains(':') => {
                    return Err(IsolationError::MalformedIdentifier {
                        field,
                        value: value.clone(),
                    });
                }
                _ => {}
            }
        }

        Ok(Self {
            level,
            tenant_id,
            organization_id,
            department_id,
            user_id,
        })
    }

    /// The platform context, which contains every other context.
    pub fn platform() -> Self {
        Self {
            level: IsolationLevel::Platform,
            tenant_id: None,
            organization_id: None,
            department_id: None,
            user_id: None,
        }
    }

    /// A tenant-level context.
    pub fn tenant(tenant_id: impl Into<String>) -> Result<Self, IsolationError> {
        Self::new(
            IsolationLevel::Tenant,
            Some(tenant_id.into()),
            None,
            None,
            None,
        )
    }

    /// An organization-level context.
    pub fn organization(
        tenant_id: impl Into<String>,
        organization_id: impl Into<String>,
    ) -> Result<Self, IsolationError> {
        Self::new(
            IsolationLevel::Organization,
            Some(tenant_id.into()),
            Some(organization_id.into()),
            None,
            None,
        )
    }

    /// A department-level context.
    pub fn department(
        tenant_id: impl Into<String>,
        organization_id: impl Into<String>,
        department_id: impl Into<String>,
    ) -> Result<Self, IsolationError> {
        Self::new(
            IsolationLevel::Department,
            Some(tenant_id.into()),
            Some(organization_id.into()),
            Some(department_id.into()),
            None,
        )
    }

    /// A user-level context.
    pub fn user(
        tenant_id: impl Into<String>,
        organization_id: impl Into<String>,
        department_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Result<Self, IsolationError> {
        Self::new(
            IsolationLevel::User,
            Some(tenant_id.into()),
            Some(organization_id.into()),
            Some(department_id.into()),
            Some(user_id.into()),
        )
    }

    pub fn level(&self) -> IsolationLevel {
        self.level
    }

    pub fn tenant_id(&self) -> Option<&str> {
        self.tenant_id.as_deref()
    }

    pub fn organization_id(&self) -> Option<&str> {
        self.organization_id.as_deref()
    }

    pub fn department_id(&self) -> Option<&str> {
        self.department_id.as_deref()
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn is_platform(&self) -> bool {
        self.level == IsolationLevel::Platform
    }

    /// Scope identifiers from tenant down to this context's level.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        [
            &self.tenant_id,
            &self.organization_id,
            &self.department_id,
            &self.user_id,
        ]
        .into_iter()
        .flatten()
        .map(String::as_str)
    }

    /// Returns true if `other` is this context or lies beneath it.
    ///
    /// `other` must be at an equal or deeper level and share every identifier
    /// this context carries.
    pub fn contains(&self, other: &IsolationContext) -> bool {
        self.level <= other.level
            && self
                .segments()
                .zip(other.segments())
                .all(|(mine, theirs)| mine == theirs)
    }

    /// Derives `prefix:{level}:{tenant}[:{organization}[:{department}[:{user}]]]`.
    ///
    /// Cache keys and storage partition keys share this namespace.
    pub fn derive_namespace(&self, prefix: &str) -> String {
        let mut namespace = format!("{prefix}:{}", self.level);
        for segment in self.segments() {
            namespace.push(':');
            namespace.push_str(segment);
        }
        namespace
    }

    /// A cache key for `key` inside this context's namespace.
    pub fn cache_key(&self, prefix: &str, key: &str) -> String {
        format!("{}:{key}", self.derive_namespace(prefix))
    }
}

impl std::fmt::Display for IsolationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.level)?;
        let segments: Vec<&str> = self.segments().collect();
        if !segments.is_empty() {
            write!(f, "({})", segments.join("/"))?;
        }
        Ok(())
    }
}

/// Port that turns transport-level request data into an isolation context.
///
/// Resolution happens before dispatch; the resulting context is immutable.
pub trait IsolationResolver<R: ?Sized>: Send + Sync {
    fn resolve(&self, request: &R) -> Result<IsolationContext, IsolationError>;
}
