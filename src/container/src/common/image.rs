/// OCI image reference types
use std::fmt;

pub const DEFAULT_REGISTRY: &str = "docker.io";
const DEFAULT_TAG: &str = "latest";

/// Fully qualified OCI image reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry host (e.g., "docker.io", "quay.io", "localhost:5000")
    pub registry: String,

    /// Repository path within the registry
    pub name: String,

    /// Tag; `None` when the reference is pinned by digest only
    pub tag: Option<String>,

    /// Digest (e.g., "sha256:...")
    pub digest: Option<String>,
}

impl ImageReference {
    /// Resolve a possibly short reference against `default_registry`.
    ///
    /// The first path component is a registry when it contains `.` or `:` or is
    /// `localhost`. Single-component names on Docker Hub get the `library/` prefix. A missing
    /// tag and digest defaults to `latest`.
    pub fn resolve(reference: &str, default_registry: &str) -> Result<Self, String> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err("empty image reference".to_string());
        }

        let (remainder, digest) = match reference.split_once('@') {
            Some((r, d)) => (r, Some(d.to_string())),
            None => (reference, None),
        };

        // A ':' after the last '/' separates the tag; earlier ones belong to a registry port.
        let (path, tag) = match remainder.rfind(':') {
            Some(idx) if idx > remainder.rfind('/').unwrap_or(0) => {
                (&remainder[..idx], Some(remainder[idx + 1..].to_string()))
            }
            _ => (remainder, None),
        };

        let (registry, mut name) = match path.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), rest.to_string())
            }
            _ => {
                let registry = if default_registry.is_empty() {
                    DEFAULT_REGISTRY
                } else {
                    default_registry
                };
                (registry.to_string(), path.to_string())
            }
        };

        if name.is_empty() {
            return Err(format!("invalid image reference: {}", reference));
        }
        if registry == DEFAULT_REGISTRY && !name.contains('/') {
            name = format!("library/{}", name);
        }

        let tag = match (&tag, &digest) {
            (None, None) => Some(DEFAULT_TAG.to_string()),
            _ => tag,
        };

        Ok(Self {
            registry,
            name,
            tag,
            digest,
        })
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.name)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

/// Registry authentication
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryAuth {
    /// Registry host the credentials apply to
    pub server: String,

    /// Username
    pub username: String,

    /// Password or token
    pub password: String,
}

impl RegistryAuth {
    /// Credentials are only used when both user and password are set.
    pub fn from_parts(server: &str, username: &str, password: &str) -> Option<Self> {
        if username.is_empty() || password.is_empty() {
            return None;
        }
        Some(Self {
            server: server.to_string(),
            username: username.to_string(),
            password: password.to_string(),
        })
    }
}
