//! Org assets: the per-org configuration tasks run against.
//!
//! Loading assets touches several tables, so bundles are cached per org and
//! reused until they expire. A task that needs fresher data for part of the
//! bundle asks for it with a [`Refresh`] mask and only those parts are reloaded.

use async_trait::async_trait;
use dashmap::DashMap;
use std::ops::{BitOr, BitOrAssign};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{MailroomError, MailroomResult};
use crate::models::{
    CampaignPoint, Channel, ChannelId, Flow, FlowId, Group, GroupId, Org, OrgId, PointId,
};

/// Parts of an org's assets to reload before a task runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Refresh(u32);

impl Refresh {
    pub const NONE: Refresh = Refresh(0);
    pub const ORG: Refresh = Refresh(1);
    pub const CHANNELS: Refresh = Refresh(1 << 1);
    pub const CAMPAIGNS: Refresh = Refresh(1 << 2);
    pub const GROUPS: Refresh = Refresh(1 << 3);
    pub const FLOWS: Refresh = Refresh(1 << 4);
    pub const ALL: Refresh = Refresh((1 << 5) - 1);

    pub fn contains(&self, other: Refresh) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Refresh {
    type Output = Refresh;

    fn bitor(self, rhs: Self) -> Self::Output {
        Refresh(self.0 | rhs.0)
    }
}

impl BitOrAssign for Refresh {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrgAssets {
    pub org: Org,
    pub channels: Vec<Channel>,
    pub campaign_points: Vec<CampaignPoint>,
    pub groups: Vec<Group>,
    pub flows: Vec<Flow>,
}

impl OrgAssets {
    pub fn org_id(&self) -> OrgId {
        self.org.id
    }

    pub fn channel(&self, id: ChannelId) -> Option<&Channel> {
        self.channels.iter().find(|c| c.id == id)
    }

    pub fn campaign_point(&self, id: PointId) -> Option<&CampaignPoint> {
        self.campaign_points.iter().find(|p| p.id == id)
    }

    pub fn group(&self, id: GroupId) -> Option<&Group> {
        self.groups.iter().find(|g| g.id == id)
    }

    pub fn flow(&self, id: FlowId) -> Option<&Flow> {
        self.flows.iter().find(|f| f.id == id)
    }
}

/// Reads asset components from storage
#[async_trait]
pub trait AssetLoader: Send + Sync {
    async fn load_org(&self, org_id: OrgId) -> MailroomResult<Option<Org>>;

    async fn load_channels(&self, org_id: OrgId) -> MailroomResult<Vec<Channel>>;

    async fn load_campaign_points(&self, org_id: OrgId) -> MailroomResult<Vec<CampaignPoint>>;

    async fn load_groups(&self, org_id: OrgId) -> MailroomResult<Vec<Group>>;

    async fn load_flows(&self, org_id: OrgId) -> MailroomResult<Vec<Flow>>;
}

#[async_trait]
pub trait OrgAssetsProvider: Send + Sync {
    /// Assets for the org, with the parts named by `refresh` reloaded
    async fn get(&self, org_id: OrgId, refresh: Refresh) -> MailroomResult<Arc<OrgAssets>>;
}

#[derive(Debug, Clone)]
struct CachedAssets {
    assets: Arc<OrgAssets>,
    loaded_at: Instant,
}

/// Default lifetime of a cached bundle
pub const ASSETS_CACHE_TTL: Duration = Duration::from_secs(5);

pub struct AssetCache {
    loader: Arc<dyn AssetLoader>,
    cache: DashMap<OrgId, CachedAssets>,
    ttl: Duration,
}

impl std::fmt::Debug for AssetCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssetCache")
            .field("cached_orgs", &self.cache.len())
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl AssetCache {
    pub fn new(loader: Arc<dyn AssetLoader>, ttl: Duration) -> Self {
        Self {
            loader,
            cache: DashMap::new(),
            ttl,
        }
    }

    async fn load(&self, org_id: OrgId) -> MailroomResult<OrgAssets> {
        let org = self
            .loader
            .load_org(org_id)
            .await?
            .ok_or_else(|| MailroomError::NotFound(format!("org {org_id}")))?;

        Ok(OrgAssets {
            org,
            channels: self.loader.load_channels(org_id).await?,
            campaign_points: self.loader.load_campaign_points(org_id).await?,
            groups: self.loader.load_groups(org_id).await?,
            flows: self.loader.load_flows(org_id).await?,
        })
    }

    async fn reload(&self, mut assets: OrgAssets, refresh: Refresh) -> MailroomResult<OrgAssets> {
        let org_id = assets.org_id();

        if refresh.contains(Refresh::ORG) {
            assets.org = self
                .loader
                .load_org(org_id)
                .await?
                .ok_or_else(|| MailroomError::NotFound(format!("org {org_id}")))?;
        }
        if refresh.contains(Refresh::CHANNELS) {
            assets.channels = self.loader.load_channels(org_id).await?;
        }
        if refresh.contains(Refresh::CAMPAIGNS) {
            assets.campaign_points = self.loader.load_campaign_points(org_id).await?;
        }
        if refresh.contains(Refresh::GROUPS) {
            assets.groups = self.loader.load_groups(org_id).await?;
        }
        if refresh.contains(Refresh::FLOWS) {
            assets.flows = self.loader.load_flows(org_id).await?;
        }
        Ok(assets)
    }

    /// Drop the cached bundle of an org
    pub fn invalidate(&self, org_id: OrgId) {
        self.cache.remove(&org_id);
    }
}

#[async_trait]
impl OrgAssetsProvider for AssetCache {
    async fn get(&self, org_id: OrgId, refresh: Refresh) -> MailroomResult<Arc<OrgAssets>> {
        let cached = self
            .cache
            .get(&org_id)
            .map(|entry| entry.value().clone())
            .filter(|entry| entry.loaded_at.elapsed() < self.ttl);

        // a partial refresh keeps the bundle's age, so the untouched parts still
        // expire on schedule
        let (assets, loaded_at) = match cached {
            Some(entry) if refresh.is_empty() => return Ok(entry.assets),
            Some(entry) => {
                debug!(org_id = %org_id, ?refresh, "Refreshing org assets");
                (
                    self.reload((*entry.assets).clone(), refresh).await?,
                    entry.loaded_at,
                )
            }
            None => {
                debug!(org_id = %org_id, "Loading org assets");
                (self.load(org_id).await?, Instant::now())
            }
        };

        let assets = Arc::new(assets);
        self.cache.insert(
            org_id,
            CachedAssets {
                assets: assets.clone(),
                loaded_at,
            },
        );
        Ok(assets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Loader that counts how often each part is read
    #[derive(Debug, Default)]
    struct CountingLoader {
        orgs: AtomicUsize,
        campaigns: AtomicUsize,
    }

    #[async_trait]
    impl AssetLoader for CountingLoader {
        async fn load_org(&self, org_id: OrgId) -> MailroomResult<Option<Org>> {
            self.orgs.fetch_add(1, Ordering::SeqCst);
            Ok(Some(Org {
                id: org_id,
                name: "Nyaruka".to_string(),
                is_active: true,
                is_suspended: false,
            }))
        }

        async fn load_channels(&self, _org_id: OrgId) -> MailroomResult<Vec<Channel>> {
            Ok(vec![])
        }

        async fn load_campaign_points(&self, _org_id: OrgId) -> MailroomResult<Vec<CampaignPoint>> {
            self.campaigns.fetch_add(1, Ordering::SeqCst);
            Ok(vec![])
        }

        async fn load_groups(&self, _org_id: OrgId) -> MailroomResult<Vec<Group>> {
            Ok(vec![])
        }

        async fn load_flows(&self, _org_id: OrgId) -> MailroomResult<Vec<Flow>> {
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn test_cached_bundle_is_reused_until_expiry() {
        let loader = Arc::new(CountingLoader::default());
        let cache = AssetCache::new(loader.clone(), Duration::from_secs(60));

        cache.get(OrgId(1), Refresh::NONE).await.unwrap();
        cache.get(OrgId(1), Refresh::NONE).await.unwrap();
        assert_eq!(loader.orgs.load(Ordering::SeqCst), 1);

        cache.get(OrgId(1), Refresh::CAMPAIGNS).await.unwrap();
        assert_eq!(loader.orgs.load(Ordering::SeqCst), 1);
        assert_eq!(loader.campaigns.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_refreshes_do_not_extend_bundle_lifetime() {
        let loader = Arc::new(CountingLoader::default());
        let cache = AssetCache::new(loader.clone(), Duration::from_millis(100));

        cache.get(OrgId(1), Refresh::NONE).await.unwrap();

        // keep refreshing campaigns more often than the bundle expires
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(40)).await;
            cache.get(OrgId(1), Refresh::CAMPAIGNS).await.unwrap();
        }

        // past the lifetime of the first load, so the whole bundle was reloaded
        assert_eq!(loader.orgs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_refresh_mask() {
        let mask = Refresh::CAMPAIGNS | Refresh::GROUPS;
        assert!(mask.contains(Refresh::CAMPAIGNS));
        assert!(!mask.contains(Refresh::FLOWS));
        assert!(Refresh::ALL.contains(mask));
        assert!(Refresh::NONE.is_empty());

        let mut growing = Refresh::NONE;
        growing |= Refresh::ORG;
        assert_eq!(growing, Refresh::ORG);
    }
}
