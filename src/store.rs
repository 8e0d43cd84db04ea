use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;

use crate::{
    Result,
    backend::{DocumentStore, MemoryStore, PostgresStore},
    context::{SessionContext, SessionOptions},
    metadata::MetadataRegistry,
    session::DocumentSession,
};

/// Owns the metadata registry and the backing store; hands out sessions.
#[derive(Clone)]
pub struct Store {
    context: SessionContext,
}

impl Store {
    /// A store over a fresh [`MemoryStore`].
    pub fn in_memory(metadata: MetadataRegistry) -> Self {
        Self::with_backend(metadata, Arc::new(MemoryStore::new()))
    }

    pub fn with_backend(metadata: MetadataRegistry, backend: Arc<dyn DocumentStore>) -> Self {
        Self {
            context: SessionContext::builder()
                .metadata(metadata)
                .store(backend)
                .build(),
        }
    }

    pub async fn connect(url: &str, metadata: MetadataRegistry) -> Result<Self> {
        Self::builder(url, metadata).build().await
    }

    pub fn builder(url: impl Into<String>, metadata: MetadataRegistry) -> StoreBuilder {
        StoreBuilder::new(url, metadata)
    }

    pub fn from_context(context: SessionContext) -> Self {
        Self { context }
    }

    /// A new unit of work with an empty identity map.
    pub fn session(&self) -> DocumentSession {
        DocumentSession::new(self.context.clone())
    }

    pub fn session_context(&self) -> &SessionContext {
        &self.context
    }

    pub fn metadata(&self) -> &Arc<MetadataRegistry> {
        &self.context.metadata
    }

    pub fn backend(&self) -> &Arc<dyn DocumentStore> {
        &self.context.store
    }
}

pub struct StoreBuilder {
    url: String,
    metadata: MetadataRegistry,
    max_connections: Option<u32>,
    connect_timeout: Option<Duration>,
    options: SessionOptions,
}

impl StoreBuilder {
    pub fn new(url: impl Into<String>, metadata: MetadataRegistry) -> Self {
        Self {
            url: url.into(),
            metadata,
            max_connections: None,
            connect_timeout: None,
            options: SessionOptions::default(),
        }
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = Some(max.max(1));
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn session_options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }

    pub async fn build(self) -> Result<Store> {
        let mut opts = PgPoolOptions::new();
        if let Some(max) = self.max_connections {
            opts = opts.max_connections(max);
        }
        if let Some(t) = self.connect_timeout {
            opts = opts.acquire_timeout(t);
        }
        let pool = opts.connect(&self.url).await?;
        Ok(Store {
            context: SessionContext::builder()
                .metadata(self.metadata)
                .store(Arc::new(PostgresStore::new(pool)))
                .options(self.options)
                .build(),
        })
    }
}
