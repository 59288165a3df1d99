//! Locating shader and material files used by terrain renderers.

use std::path::{Path, PathBuf};

use ahash::AHashMap;
use tracing::debug;

/// Kinds of resources the terrain asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// Shader sources
    Shader,
    /// Material descriptions
    Material,
    /// Texture images
    Texture,
}

/// Resolves resource names to files.
pub trait ResourceLocator: Send + Sync {
    /// Returns the path of `name`, if this locator can find it.
    fn locate(&self, name: &str) -> Option<PathBuf>;
}

/// Looks resources up relative to a base directory.
#[derive(Debug, Clone)]
pub struct SimpleResourceLocator {
    base: PathBuf,
}

impl SimpleResourceLocator {
    /// Creates a locator rooted at `base`.
    #[must_use]
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// Base directory.
    #[must_use]
    pub fn base(&self) -> &Path {
        &self.base
    }
}

impl ResourceLocator for SimpleResourceLocator {
    fn locate(&self, name: &str) -> Option<PathBuf> {
        let candidate = self.base.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
        // Fall back to the bare file name for names carrying a directory prefix.
        let file_name = Path::new(name).file_name()?;
        let candidate = self.base.join(file_name);
        candidate.is_file().then_some(candidate)
    }
}

/// Locators grouped by resource kind, searched in registration order.
#[derive(Default)]
pub struct ResourceRegistry {
    locators: AHashMap<ResourceKind, Vec<Box<dyn ResourceLocator>>>,
}

impl ResourceRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the terrain shader and material directories under `root`.
    #[must_use]
    pub fn with_terrain_defaults(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        let mut registry = Self::new();
        registry.add_locator(
            ResourceKind::Shader,
            Box::new(SimpleResourceLocator::new(root.join("shaders").join("terrain"))),
        );
        registry.add_locator(
            ResourceKind::Material,
            Box::new(SimpleResourceLocator::new(root.join("materials").join("terrain"))),
        );
        registry
    }

    /// Adds a locator for a kind.
    pub fn add_locator(&mut self, kind: ResourceKind, locator: Box<dyn ResourceLocator>) {
        self.locators.entry(kind).or_default().push(locator);
    }

    /// Finds a resource with the first locator that knows it.
    #[must_use]
    pub fn locate(&self, kind: ResourceKind, name: &str) -> Option<PathBuf> {
        let found = self
            .locators
            .get(&kind)?
            .iter()
            .find_map(|locator| locator.locate(name));
        if found.is_none() {
            debug!("Resource {kind:?} '{name}' not found");
        }
        found
    }
}

impl std::fmt::Debug for ResourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts: Vec<_> = self.locators.iter().map(|(k, v)| (*k, v.len())).collect();
        f.debug_struct("ResourceRegistry")
            .field("locators", &counts)
            .finish()
    }
}
