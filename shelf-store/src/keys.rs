//! Logical key registry.
//!
//! Every logical key the store accepts is declared here up front: either a
//! static key with a fixed relative path, or a dynamic family matched by
//! prefix (e.g. `score_<id>`) with a path-resolution function. Registration
//! validates each rule once; ad hoc string checks at call sites are
//! deliberately impossible because resolution is the only way to obtain a
//! storage path.
//!
//! Resolution is memoized: the first lookup of a dynamic key runs the
//! family's resolver, later lookups are a single map read.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use shelf_core::{Record, ShelfError, ShelfResult, TtlClass};

/// Structural validation hook for a key family.
///
/// Runs against every record saved under the family; returning `Err`
/// aborts the save with [`ShelfError::InvalidShape`].
pub type ShapeValidator = Arc<dyn Fn(&Record) -> Result<(), String> + Send + Sync>;

/// Path resolver for a dynamic family. Receives the key suffix (the part
/// after the prefix) and returns a path relative to the data directory.
pub type PathResolver = Arc<dyn Fn(&str) -> PathBuf + Send + Sync>;

/// Auto-expiry policy for families whose records are cleared some time
/// after a successful save.
#[derive(Clone)]
pub struct AutoExpiryPolicy {
    /// Delay before the clear fires; `None` uses the store default.
    pub delay: Option<Duration>,
    /// Structure written over the record when the timer fires.
    pub cleared: Record,
}

impl std::fmt::Debug for AutoExpiryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoExpiryPolicy")
            .field("delay", &self.delay)
            .finish_non_exhaustive()
    }
}

/// Per-family options shared by static keys and dynamic families.
#[derive(Clone, Default)]
pub struct FamilyOptions {
    /// Freshness class for cache entries of this family.
    pub ttl_class: TtlClass,
    /// Override the class TTL for this family only.
    pub ttl_override: Option<Duration>,
    /// Pinned entries survive LRU eviction unless pressure is severe and
    /// count toward `critical_key_availability`.
    pub pinned: bool,
    /// Whether `delete` is allowed for keys of this family.
    pub deletable: bool,
    /// Clear-after-delay policy, if any.
    pub auto_expiry: Option<AutoExpiryPolicy>,
    /// Structural validation run on save.
    pub validator: Option<ShapeValidator>,
}

impl std::fmt::Debug for FamilyOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FamilyOptions")
            .field("ttl_class", &self.ttl_class)
            .field("ttl_override", &self.ttl_override)
            .field("pinned", &self.pinned)
            .field("deletable", &self.deletable)
            .field("auto_expiry", &self.auto_expiry)
            .field("has_validator", &self.validator.is_some())
            .finish()
    }
}

impl FamilyOptions {
    /// Options for rarely-changing reference data: lazy TTL, pinned.
    pub fn reference() -> Self {
        Self {
            ttl_class: TtlClass::Lazy,
            pinned: true,
            ..Self::default()
        }
    }

    /// Set the TTL class.
    pub fn with_ttl_class(mut self, class: TtlClass) -> Self {
        self.ttl_class = class;
        self
    }

    /// Override the class TTL for this family.
    pub fn with_ttl_override(mut self, ttl: Duration) -> Self {
        self.ttl_override = Some(ttl);
        self
    }

    /// Mark entries of this family pinned.
    pub fn with_pinned(mut self, pinned: bool) -> Self {
        self.pinned = pinned;
        self
    }

    /// Allow `delete` for this family.
    pub fn with_deletable(mut self, deletable: bool) -> Self {
        self.deletable = deletable;
        self
    }

    /// Clear records of this family after a delay following each save.
    pub fn with_auto_expiry(mut self, delay: Option<Duration>, cleared: Record) -> Self {
        self.auto_expiry = Some(AutoExpiryPolicy { delay, cleared });
        self
    }

    /// Attach a structural validator.
    pub fn with_validator(mut self, validator: ShapeValidator) -> Self {
        self.validator = Some(validator);
        self
    }
}

/// Fully resolved key: storage path plus the family's cache policy.
#[derive(Debug, Clone)]
pub struct KeySpec {
    /// The logical key as supplied by the caller.
    pub key: String,
    /// Path relative to the store's data directory.
    pub relative_path: PathBuf,
    /// Family options governing caching, deletion, and expiry.
    pub options: FamilyOptions,
}

impl KeySpec {
    /// The absolute storage path under the given data directory.
    pub fn path_under(&self, data_dir: &Path) -> PathBuf {
        data_dir.join(&self.relative_path)
    }
}

enum Rule {
    Static {
        relative_path: PathBuf,
        options: FamilyOptions,
    },
    Family {
        prefix: String,
        resolver: PathResolver,
        options: FamilyOptions,
    },
}

/// Registry of logical keys and dynamic key families.
pub struct KeyRegistry {
    statics: HashMap<String, Rule>,
    families: Vec<Rule>,
    resolved: RwLock<HashMap<String, Arc<KeySpec>>>,
}

impl std::fmt::Debug for KeyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyRegistry")
            .field("statics", &self.statics.len())
            .field("families", &self.families.len())
            .finish()
    }
}

impl Default for KeyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            statics: HashMap::new(),
            families: Vec::new(),
            resolved: RwLock::new(HashMap::new()),
        }
    }

    /// Register a static key with a fixed relative path.
    ///
    /// Returns an error if the key is already registered or the path is
    /// empty.
    pub fn register_static(
        &mut self,
        key: impl Into<String>,
        relative_path: impl Into<PathBuf>,
        options: FamilyOptions,
    ) -> ShelfResult<()> {
        let key = key.into();
        let relative_path = relative_path.into();

        if key.is_empty() || relative_path.as_os_str().is_empty() {
            return Err(ShelfError::UnknownKey { key });
        }
        if self.statics.contains_key(&key) {
            return Err(ShelfError::DuplicateKey { key });
        }

        self.statics.insert(
            key,
            Rule::Static {
                relative_path,
                options,
            },
        );
        Ok(())
    }

    /// Register a dynamic family matched by key prefix.
    ///
    /// The resolver receives the suffix after the prefix and returns the
    /// relative storage path. Prefixes must be non-empty and unique; the
    /// longest matching prefix wins at resolution time.
    pub fn register_family(
        &mut self,
        prefix: impl Into<String>,
        resolver: PathResolver,
        options: FamilyOptions,
    ) -> ShelfResult<()> {
        let prefix = prefix.into();

        if prefix.is_empty() {
            return Err(ShelfError::UnknownKey {
                key: "(empty family prefix)".to_string(),
            });
        }
        let duplicate = self.families.iter().any(|rule| {
            matches!(rule, Rule::Family { prefix: p, .. } if *p == prefix)
        });
        if duplicate {
            return Err(ShelfError::DuplicateKey { key: prefix });
        }

        self.families.push(Rule::Family {
            prefix,
            resolver,
            options,
        });
        Ok(())
    }

    /// Resolve a logical key to its spec.
    ///
    /// Static keys win over families; among families the longest matching
    /// prefix wins. Resolved specs are memoized so repeated resolution of
    /// a dynamic key is a single map read.
    pub fn resolve(&self, key: &str) -> ShelfResult<Arc<KeySpec>> {
        if let Some(spec) = self
            .resolved
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
        {
            return Ok(Arc::clone(spec));
        }

        let spec = self.resolve_uncached(key)?;
        let spec = Arc::new(spec);
        self.resolved
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), Arc::clone(&spec));
        Ok(spec)
    }

    fn resolve_uncached(&self, key: &str) -> ShelfResult<KeySpec> {
        if let Some(Rule::Static {
            relative_path,
            options,
        }) = self.statics.get(key)
        {
            return Ok(KeySpec {
                key: key.to_string(),
                relative_path: relative_path.clone(),
                options: options.clone(),
            });
        }

        let mut best: Option<(&str, &PathResolver, &FamilyOptions)> = None;
        for rule in &self.families {
            if let Rule::Family {
                prefix,
                resolver,
                options,
            } = rule
            {
                if key.starts_with(prefix.as_str())
                    && key.len() > prefix.len()
                    && best.map_or(true, |(p, _, _)| prefix.len() > p.len())
                {
                    best = Some((prefix, resolver, options));
                }
            }
        }

        match best {
            Some((prefix, resolver, options)) => {
                let suffix = &key[prefix.len()..];
                Ok(KeySpec {
                    key: key.to_string(),
                    relative_path: resolver(suffix),
                    options: options.clone(),
                })
            }
            None => Err(ShelfError::UnknownKey {
                key: key.to_string(),
            }),
        }
    }

    /// All registered static keys whose entries are pinned.
    ///
    /// Used by `health_check` for critical key availability. Dynamic
    /// families are open-ended so they never contribute here.
    pub fn pinned_static_keys(&self) -> Vec<String> {
        self.statics
            .iter()
            .filter_map(|(key, rule)| match rule {
                Rule::Static { options, .. } if options.pinned => Some(key.clone()),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn score_resolver() -> PathResolver {
        Arc::new(|suffix: &str| PathBuf::from("scores").join(format!("{suffix}.json")))
    }

    #[test]
    fn test_static_resolution() {
        let mut registry = KeyRegistry::new();
        registry
            .register_static("monsters", "data/monsters.json", FamilyOptions::reference())
            .unwrap();

        let spec = registry.resolve("monsters").unwrap();
        assert_eq!(spec.relative_path, PathBuf::from("data/monsters.json"));
        assert_eq!(spec.options.ttl_class, TtlClass::Lazy);
        assert!(spec.options.pinned);
    }

    #[test]
    fn test_family_resolution_and_memoization() {
        let mut registry = KeyRegistry::new();
        registry
            .register_family("score_", score_resolver(), FamilyOptions::default())
            .unwrap();

        let first = registry.resolve("score_123").unwrap();
        assert_eq!(first.relative_path, PathBuf::from("scores/123.json"));

        let second = registry.resolve("score_123").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_longest_prefix_wins() {
        let mut registry = KeyRegistry::new();
        registry
            .register_family("game_", score_resolver(), FamilyOptions::default())
            .unwrap();
        registry
            .register_family(
                "game_state_",
                Arc::new(|s: &str| PathBuf::from("state").join(format!("{s}.json"))),
                FamilyOptions::default().with_deletable(true),
            )
            .unwrap();

        let spec = registry.resolve("game_state_7").unwrap();
        assert_eq!(spec.relative_path, PathBuf::from("state/7.json"));
        assert!(spec.options.deletable);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let registry = KeyRegistry::new();
        assert!(matches!(
            registry.resolve("nope"),
            Err(ShelfError::UnknownKey { .. })
        ));
    }

    #[test]
    fn test_duplicate_registrations_rejected() {
        let mut registry = KeyRegistry::new();
        registry
            .register_static("monsters", "a.json", FamilyOptions::default())
            .unwrap();
        assert!(matches!(
            registry.register_static("monsters", "b.json", FamilyOptions::default()),
            Err(ShelfError::DuplicateKey { key }) if key == "monsters"
        ));

        registry
            .register_family("score_", score_resolver(), FamilyOptions::default())
            .unwrap();
        assert!(matches!(
            registry.register_family("score_", score_resolver(), FamilyOptions::default()),
            Err(ShelfError::DuplicateKey { key }) if key == "score_"
        ));
    }

    #[test]
    fn test_prefix_alone_is_not_a_key() {
        let mut registry = KeyRegistry::new();
        registry
            .register_family("score_", score_resolver(), FamilyOptions::default())
            .unwrap();
        // A bare prefix has no suffix to resolve a path from.
        assert!(registry.resolve("score_").is_err());
    }

    #[test]
    fn test_pinned_static_keys() {
        let mut registry = KeyRegistry::new();
        registry
            .register_static("monsters", "monsters.json", FamilyOptions::reference())
            .unwrap();
        registry
            .register_static("logs", "logs.json", FamilyOptions::default())
            .unwrap();

        let pinned = registry.pinned_static_keys();
        assert_eq!(pinned, vec!["monsters".to_string()]);
    }
}
