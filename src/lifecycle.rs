//! Uniform start/stop lifecycle for the bridge's long-running background
//! services (SSDP discoverer, subscribe manager fan-out loop, GDM beacons).

use async_trait::async_trait;

#[async_trait]
pub trait Startable: Send + Sync {
    /// Service name, used in logging.
    fn name(&self) -> &'static str;

    /// Start the service. No-op if already running.
    async fn start(&self) -> anyhow::Result<()>;

    /// Stop the service gracefully, awaiting its worker's exit.
    async fn stop(&self);
}

/// Implements [`Startable`] in terms of `start_internal`/`stop_internal`.
#[macro_export]
macro_rules! impl_startable {
    ($ty:ty, $name:literal) => {
        #[async_trait::async_trait]
        impl $crate::lifecycle::Startable for $ty {
            fn name(&self) -> &'static str {
                $name
            }

            async fn start(&self) -> anyhow::Result<()> {
                self.start_internal().await
            }

            async fn stop(&self) {
                self.stop_internal().await
            }
        }
    };
}
