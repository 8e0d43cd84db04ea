use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    backend::{DocumentStore, MemoryStore},
    metadata::MetadataRegistry,
};

/// Per-session tunables. Deserializable so they can live in an
/// application's config file; the threshold is given in milliseconds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    /// Writes slower than this are logged under `rillodm::slow_write`.
    #[serde(rename = "slow_write_threshold_ms", with = "opt_millis")]
    pub slow_write_threshold: Option<Duration>,
    /// Namespace prefixed to the per-collection counters behind
    /// `IdStrategy::Increment`.
    pub sequence_collection: String,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            slow_write_threshold: None,
            sequence_collection: "rillodm".to_string(),
        }
    }
}

mod opt_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

impl SessionOptions {
    pub(crate) fn sequence_name(&self, collection: &str) -> String {
        format!("{}.{}", self.sequence_collection, collection)
    }
}

/// Everything a session needs from outside: class metadata, the backing
/// store and options. Cheap to clone.
#[derive(Clone)]
pub struct SessionContext {
    pub metadata: Arc<MetadataRegistry>,
    pub store: Arc<dyn DocumentStore>,
    pub options: SessionOptions,
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl SessionContext {
    pub fn builder() -> SessionContextBuilder {
        SessionContextBuilder::default()
    }
}

#[derive(Default)]
pub struct SessionContextBuilder {
    metadata: Option<Arc<MetadataRegistry>>,
    store: Option<Arc<dyn DocumentStore>>,
    options: SessionOptions,
}

impl SessionContextBuilder {
    pub fn metadata(mut self, metadata: impl Into<Arc<MetadataRegistry>>) -> Self {
        self.metadata = Some(metadata.into());
        self
    }

    pub fn store(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn slow_write_threshold(mut self, threshold: Duration) -> Self {
        self.options.slow_write_threshold = Some(threshold);
        self
    }

    pub fn sequence_collection(mut self, name: impl Into<String>) -> Self {
        self.options.sequence_collection = name.into();
        self
    }

    /// Missing pieces default to an empty registry and a fresh
    /// [`MemoryStore`].
    pub fn build(self) -> SessionContext {
        SessionContext {
            metadata: self.metadata.unwrap_or_default(),
            store: self.store.unwrap_or_else(|| Arc::new(MemoryStore::new())),
            options: self.options,
        }
    }
}
