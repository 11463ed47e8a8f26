//! # Runtime
//!
//! The bundle of process-wide handles every task and cron runs against: config,
//! key-value store, locks, the three fair queues, contact queues, repositories,
//! the org asset cache, external collaborators and the task registries.
//!
//! [`Runtime::from_config`] wires the Redis and Postgres backends;
//! [`RuntimeBuilder::in_memory`] wires in-process ones for tests and local runs.

use std::sync::Arc;
use tracing::info;

use crate::config::MailroomConfig;
use crate::constants::queues;
use crate::contact_tasks::{self, ContactTaskRegistry};
use crate::contacts::{ContactQueueStore, MemoryContactQueue, RedisContactQueue};
use crate::database::{MemoryDatabase, PgRepositories, Repositories};
use crate::error::{MailroomError, MailroomResult};
use crate::kv::{self, KeyValueStore, MemoryStore, RedisStore};
use crate::locks::{Locker, MemoryLocker, RedisLocker};
use crate::queue::{MemoryFairQueue, Queues, RedisFairQueue};
use crate::services::assets::ASSETS_CACHE_TTL;
use crate::services::{
    AndroidSyncer, AssetCache, Courier, DisabledSearch, ElasticSearchClient, FcmSyncer,
    FlowEngine, IvrService, MemoryCourier, OrgAssetsProvider, RedisCourier, SearchClient,
    UnconfiguredEngine,
};
use crate::tasks::{self, TaskRegistry};

pub struct Runtime {
    pub config: MailroomConfig,
    pub kv: Arc<dyn KeyValueStore>,
    pub locker: Arc<dyn Locker>,
    pub queues: Queues,
    pub contact_queue: Arc<dyn ContactQueueStore>,
    pub db: Repositories,
    pub assets: Arc<dyn OrgAssetsProvider>,
    pub engine: Arc<dyn FlowEngine>,
    pub courier: Arc<dyn Courier>,
    pub search: Arc<dyn SearchClient>,
    /// Call initiation, retrying calls is skipped without it
    pub ivr: Option<Arc<dyn IvrService>>,
    /// Android channel syncing, only present when an FCM key is configured
    pub android: Option<Arc<dyn AndroidSyncer>>,
    pub tasks: TaskRegistry,
    pub contact_tasks: ContactTaskRegistry,
    postgres: Option<PgRepositories>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("instance_name", &self.config.instance_name)
            .field("kv", &self.kv.provider_name())
            .field("queues", &self.queues)
            .field("tasks", &self.tasks.types())
            .field("contact_tasks", &self.contact_tasks.types())
            .field("ivr", &self.ivr.is_some())
            .field("android", &self.android.is_some())
            .field(
                "postgres",
                &self
                    .postgres
                    .as_ref()
                    .map(|pg| format!("PgPool(size={})", pg.pool().size()))
                    .unwrap_or_else(|| "None".to_string()),
            )
            .finish()
    }
}

impl Runtime {
    /// Connect to Redis and Postgres and build the production runtime
    pub async fn from_config(config: MailroomConfig) -> MailroomResult<Self> {
        info!(instance = %config.instance_name, "Initializing runtime");

        let redis = kv::connect(&config.redis).await?;
        let postgres = PgRepositories::connect(&config).await?;
        let pg = Arc::new(postgres.clone());

        let queues = Queues {
            realtime: Arc::new(RedisFairQueue::new(
                queues::REALTIME,
                config.max_active_per_owner(queues::REALTIME),
                redis.clone(),
            )),
            batch: Arc::new(RedisFairQueue::new(
                queues::BATCH,
                config.max_active_per_owner(queues::BATCH),
                redis.clone(),
            )),
            throttled: Arc::new(RedisFairQueue::new(
                queues::THROTTLED,
                config.max_active_per_owner(queues::THROTTLED),
                redis.clone(),
            )),
        };

        let android: Option<Arc<dyn AndroidSyncer>> = config
            .fcm_key
            .as_deref()
            .filter(|key| !key.is_empty())
            .map(|key| Arc::new(FcmSyncer::new(key)) as Arc<dyn AndroidSyncer>);

        let builder = RuntimeBuilder {
            kv: Arc::new(RedisStore::new(redis.clone())),
            locker: Arc::new(RedisLocker::new(redis.clone())),
            queues,
            contact_queue: Arc::new(RedisContactQueue::new(redis.clone())),
            db: Repositories::from_single(pg.clone()),
            assets: Arc::new(AssetCache::new(pg, ASSETS_CACHE_TTL)),
            engine: Arc::new(UnconfiguredEngine),
            courier: Arc::new(RedisCourier::new(redis)),
            search: Arc::new(ElasticSearchClient::new(
                config.elastic.clone(),
                config.elastic_contact_index.clone(),
            )),
            ivr: None,
            android,
            tasks: tasks::default_registry(),
            contact_tasks: contact_tasks::default_registry(),
            postgres: Some(postgres),
            config,
        };
        builder.build()
    }

    pub fn postgres(&self) -> Option<&PgRepositories> {
        self.postgres.as_ref()
    }

    /// Release pooled connections
    pub async fn close(&self) {
        if let Some(pg) = &self.postgres {
            pg.close().await;
        }
    }
}

/// Assembles a [`Runtime`] piece by piece, starting from in-process backends
pub struct RuntimeBuilder {
    config: MailroomConfig,
    kv: Arc<dyn KeyValueStore>,
    locker: Arc<dyn Locker>,
    queues: Queues,
    contact_queue: Arc<dyn ContactQueueStore>,
    db: Repositories,
    assets: Arc<dyn OrgAssetsProvider>,
    engine: Arc<dyn FlowEngine>,
    courier: Arc<dyn Courier>,
    search: Arc<dyn SearchClient>,
    ivr: Option<Arc<dyn IvrService>>,
    android: Option<Arc<dyn AndroidSyncer>>,
    tasks: TaskRegistry,
    contact_tasks: ContactTaskRegistry,
    postgres: Option<PgRepositories>,
}

impl RuntimeBuilder {
    /// Everything in process, backed by the given database
    pub fn in_memory(config: MailroomConfig, db: Arc<MemoryDatabase>) -> Self {
        let queues = Queues {
            realtime: Arc::new(MemoryFairQueue::new(
                queues::REALTIME,
                config.max_active_per_owner(queues::REALTIME),
            )),
            batch: Arc::new(MemoryFairQueue::new(
                queues::BATCH,
                config.max_active_per_owner(queues::BATCH),
            )),
            throttled: Arc::new(MemoryFairQueue::new(
                queues::THROTTLED,
                config.max_active_per_owner(queues::THROTTLED),
            )),
        };

        Self {
            kv: Arc::new(MemoryStore::new()),
            locker: Arc::new(MemoryLocker::new()),
            queues,
            contact_queue: Arc::new(MemoryContactQueue::new()),
            db: Repositories::from_single(db.clone()),
            assets: Arc::new(AssetCache::new(db, ASSETS_CACHE_TTL)),
            engine: Arc::new(UnconfiguredEngine),
            courier: Arc::new(MemoryCourier::new()),
            search: Arc::new(DisabledSearch),
            ivr: None,
            android: None,
            tasks: tasks::default_registry(),
            contact_tasks: contact_tasks::default_registry(),
            postgres: None,
            config,
        }
    }

    pub fn kv(mut self, kv: Arc<dyn KeyValueStore>) -> Self {
        self.kv = kv;
        self
    }

    pub fn locker(mut self, locker: Arc<dyn Locker>) -> Self {
        self.locker = locker;
        self
    }

    pub fn queues(mut self, queues: Queues) -> Self {
        self.queues = queues;
        self
    }

    pub fn assets(mut self, assets: Arc<dyn OrgAssetsProvider>) -> Self {
        self.assets = assets;
        self
    }

    pub fn engine(mut self, engine: Arc<dyn FlowEngine>) -> Self {
        self.engine = engine;
        self
    }

    pub fn courier(mut self, courier: Arc<dyn Courier>) -> Self {
        self.courier = courier;
        self
    }

    pub fn search(mut self, search: Arc<dyn SearchClient>) -> Self {
        self.search = search;
        self
    }

    pub fn ivr(mut self, ivr: Arc<dyn IvrService>) -> Self {
        self.ivr = Some(ivr);
        self
    }

    pub fn android(mut self, android: Arc<dyn AndroidSyncer>) -> Self {
        self.android = Some(android);
        self
    }

    /// Task registry to use instead of the default one
    pub fn tasks(mut self, tasks: TaskRegistry) -> Self {
        self.tasks = tasks;
        self
    }

    pub fn build(self) -> MailroomResult<Runtime> {
        self.config.validate().map_err(MailroomError::from)?;

        Ok(Runtime {
            config: self.config,
            kv: self.kv,
            locker: self.locker,
            queues: self.queues,
            contact_queue: self.contact_queue,
            db: self.db,
            assets: self.assets,
            engine: self.engine,
            courier: self.courier,
            search: self.search,
            ivr: self.ivr,
            android: self.android,
            tasks: self.tasks,
            contact_tasks: self.contact_tasks,
            postgres: self.postgres,
        })
    }
}
