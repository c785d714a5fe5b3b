//! GPU pricing lookups with a TTL cache
//!
//! Prices come from the cloud capability's instance tables, translated
//! from GPU types to instance classes. Results are cached for one hour
//! keyed by the full (GPU type, capacity class, region, zone) tuple.
//! Cache eviction is per-entry: expired entries are deleted in place and
//! bulk invalidation iterates, so concurrent readers never observe a
//! reassigned map.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use fleet_cloud::CloudProvider;
use fleet_core::{CapacityClass, Clock};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// How long a looked-up price stays valid
const PRICE_CACHE_TTL: Duration = Duration::from_secs(3600);

/// Parameters for a pricing lookup
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PricingRequest {
    pub gpu_type: String,
    pub capacity_class: CapacityClass,
    pub region: String,
    pub zone: String,
}

/// A resolved GPU price
#[derive(Debug, Clone, PartialEq)]
pub struct GpuPricing {
    pub gpu_type: String,
    pub capacity_class: CapacityClass,
    /// USD per GPU per hour
    pub price_per_gpu_hour: f64,
    /// USD per GPU per month (730 hours)
    pub price_per_gpu_month: f64,
    pub region: String,
    pub zone: String,
    pub currency: String,
    pub last_updated: DateTime<Utc>,
}

struct CachedPrice {
    pricing: GpuPricing,
    expires_at: DateTime<Utc>,
}

/// Pricing capability backed by the cloud provider's instance tables
pub struct PricingClient {
    cloud: Arc<dyn CloudProvider>,
    clock: Arc<dyn Clock>,
    default_region: String,
    cache: DashMap<String, CachedPrice>,
    cache_ttl: Duration,
}

impl PricingClient {
    pub fn new(
        cloud: Arc<dyn CloudProvider>,
        clock: Arc<dyn Clock>,
        default_region: impl Into<String>,
    ) -> Self {
        Self {
            cloud,
            clock,
            default_region: default_region.into(),
            cache: DashMap::new(),
            cache_ttl: PRICE_CACHE_TTL,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Price per GPU-hour for a configuration. Never fails: a miss in
    /// the provider tables falls back to the built-in estimates.
    pub async fn gpu_pricing(&self, request: &PricingRequest) -> GpuPricing {
        let region = if request.region.is_empty() {
            self.default_region.clone()
        } else {
            request.region.clone()
        };

        let cache_key = format!(
            "{}:{}:{}:{}",
            request.gpu_type, request.capacity_class, region, request.zone
        );
        let now = self.clock.now();

        if let Some(cached) = self.cache.get(&cache_key) {
            if now < cached.expires_at {
                debug!(key = %cache_key, "using cached price");
                return cached.pricing.clone();
            }
            drop(cached);
            // Expired: delete this entry in place
            self.cache.remove(&cache_key);
        }

        let pricing = match self.fetch(request, &region).await {
            Some(pricing) => pricing,
            None => {
                warn!(
                    gpu_type = %request.gpu_type,
                    capacity_class = %request.capacity_class,
                    "no provider price, using estimate"
                );
                self.estimate(request, &region)
            }
        };

        self.cache.insert(
            cache_key,
            CachedPrice {
                pricing: pricing.clone(),
                expires_at: now + chrono::Duration::from_std(self.cache_ttl).unwrap_or_default(),
            },
        );

        pricing
    }

    /// Drop every cached price, entry by entry
    pub fn invalidate_all(&self) {
        let keys: Vec<String> = self.cache.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            self.cache.remove(&key);
        }
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.len()
    }

    async fn fetch(&self, request: &PricingRequest, region: &str) -> Option<GpuPricing> {
        let instance = instance_class_for(&request.gpu_type)?;
        let instance_gpus = gpus_per_instance(instance) as f64;

        let instance_price = match request.capacity_class {
            CapacityClass::Spot => self.cloud.spot_price(instance).await.ok()?,
            CapacityClass::OnDemand | CapacityClass::Reserved => {
                self.cloud.on_demand_price(instance).await.ok()?
            }
        };

        let per_gpu = instance_price / instance_gpus;
        Some(self.build_pricing(request, region, per_gpu))
    }

    fn estimate(&self, request: &PricingRequest, region: &str) -> GpuPricing {
        let mut per_gpu = estimated_price(&request.gpu_type);
        if request.capacity_class == CapacityClass::Spot {
            // Spot capacity typically runs at a 60-70% discount
            per_gpu *= 0.35;
        }
        self.build_pricing(request, region, per_gpu)
    }

    fn build_pricing(&self, request: &PricingRequest, region: &str, per_gpu: f64) -> GpuPricing {
        GpuPricing {
            gpu_type: request.gpu_type.clone(),
            capacity_class: request.capacity_class,
            price_per_gpu_hour: per_gpu,
            price_per_gpu_month: per_gpu * 730.0,
            region: region.to_string(),
            zone: request.zone.clone(),
            currency: "USD".to_string(),
            last_updated: self.clock.now(),
        }
    }
}

/// Map a GPU type to the instance class the provider price tables key on
fn instance_class_for(gpu_type: &str) -> Option<&'static str> {
    match gpu_type {
        "nvidia-tesla-a100" => Some("p4d.24xlarge"),
        "nvidia-a100-80gb" => Some("p4de.24xlarge"),
        "nvidia-tesla-v100" => Some("p3.2xlarge"),
        "nvidia-tesla-t4" => Some("g4dn.xlarge"),
        "nvidia-a10" | "nvidia-a10g" => Some("g5.xlarge"),
        _ => None,
    }
}

fn gpus_per_instance(instance: &str) -> u32 {
    match instance {
        "p4d.24xlarge" | "p4de.24xlarge" | "p3.16xlarge" => 8,
        "p3.8xlarge" => 4,
        _ => 1,
    }
}

/// Built-in hourly estimates per GPU, used when live tables miss
fn estimated_price(gpu_type: &str) -> f64 {
    match gpu_type {
        "nvidia-tesla-a100" => 3.00,
        "nvidia-a100-80gb" => 4.00,
        "nvidia-h100" => 5.00,
        "nvidia-h100-80gb" => 5.50,
        "nvidia-tesla-v100" => 2.50,
        "nvidia-tesla-v100-32gb" => 2.80,
        "nvidia-tesla-t4" => 0.95,
        "nvidia-a10" => 1.20,
        "nvidia-l4" => 0.85,
        _ => 2.00,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_cloud::MockCloudProvider;
    use fleet_core::SystemClock;

    fn client() -> PricingClient {
        PricingClient::new(
            Arc::new(MockCloudProvider::new()),
            Arc::new(SystemClock),
            "us-east-1",
        )
    }

    fn request(gpu_type: &str, class: CapacityClass) -> PricingRequest {
        PricingRequest {
            gpu_type: gpu_type.into(),
            capacity_class: class,
            region: String::new(),
            zone: String::new(),
        }
    }

    #[tokio::test]
    async fn test_provider_backed_lookup() {
        let client = client();
        // Mock provider answers 3.00 on-demand for any instance class;
        // a100 maps to an 8-GPU instance
        let pricing = client
            .gpu_pricing(&request("nvidia-tesla-a100", CapacityClass::OnDemand))
            .await;
        assert!((pricing.price_per_gpu_hour - 3.00 / 8.0).abs() < 1e-9);
        assert_eq!(pricing.region, "us-east-1");
        assert!((pricing.price_per_gpu_month - pricing.price_per_gpu_hour * 730.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_estimate_fallback_with_spot_discount() {
        let client = client();
        let on_demand = client
            .gpu_pricing(&request("unknown-accelerator", CapacityClass::OnDemand))
            .await;
        let spot = client
            .gpu_pricing(&request("unknown-accelerator", CapacityClass::Spot))
            .await;

        assert!((on_demand.price_per_gpu_hour - 2.00).abs() < 1e-9);
        assert!((spot.price_per_gpu_hour - 0.70).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_cache_hit_and_invalidation() {
        let client = client();
        let req = request("nvidia-tesla-t4", CapacityClass::Spot);

        client.gpu_pricing(&req).await;
        assert_eq!(client.cached_entries(), 1);

        client.gpu_pricing(&req).await;
        assert_eq!(client.cached_entries(), 1);

        client.invalidate_all();
        assert_eq!(client.cached_entries(), 0);
    }

    #[tokio::test]
    async fn test_expired_entries_are_replaced() {
        let client = client().with_cache_ttl(Duration::from_secs(0));
        let req = request("nvidia-tesla-t4", CapacityClass::Spot);

        client.gpu_pricing(&req).await;
        client.gpu_pricing(&req).await;
        // Entry is re-inserted after per-entry eviction, never left stale
        assert_eq!(client.cached_entries(), 1);
    }
}
