//! Applications: the consumers of a protocol's API

use std::sync::Arc;

use parking_lot::Mutex;

use crate::{
    error::Result,
    protocol::{ApplicationDriver, ProtocolDriver, ProtocolId},
    sync::{DriverSlot, EpochDomain},
    wakeup::{self, AppRoute, WakeupCounts, WakeupStats},
};

/// Registry-wide application identifier
pub type ApplicationId = u64;

/// Glue exposing one protocol to the surrounding system
#[derive(Debug)]
pub struct Application {
    id: ApplicationId,
    kind_tag: String,
    protocol: ProtocolId,
    route: DriverSlot<AppRoute>,
    /// Written under the protocol lock
    app_driver: Mutex<Option<Arc<dyn ApplicationDriver>>>,
    wakeups: WakeupStats,
}

impl Application {
    pub(crate) fn new(
        id: ApplicationId,
        kind_tag: impl Into<String>,
        protocol: ProtocolId,
        domain: Arc<EpochDomain>,
    ) -> Self {
        Self {
            id,
            kind_tag: kind_tag.into(),
            protocol,
            route: DriverSlot::new(domain),
            app_driver: Mutex::new(None),
            wakeups: WakeupStats::default(),
        }
    }

    pub fn id(&self) -> ApplicationId {
        self.id
    }

    /// Expected high-level API shape
    pub fn kind_tag(&self) -> &str {
        &self.kind_tag
    }

    /// Protocol this application sits on
    pub fn protocol(&self) -> ProtocolId {
        self.protocol
    }

    /// Send `event` to the protocol driver
    ///
    /// Returns `NotBound` while no protocol driver serves the application.
    pub fn wakeup(&self, event: u32) -> Result<()> {
        wakeup::app_wakeup(&self.route, &self.wakeups, event)
    }

    /// Wakeup counters for this application
    pub fn wakeup_stats(&self) -> WakeupCounts {
        self.wakeups.snapshot()
    }

    /// Protocol driver currently serving this application
    pub fn driver(&self) -> Option<Arc<dyn ProtocolDriver>> {
        self.route.load().map(|route| route.driver.clone())
    }

    /// Check if a protocol driver serves this application
    pub fn has_driver(&self) -> bool {
        self.route.is_set()
    }

    /// Application driver attached to this application
    pub fn app_driver(&self) -> Option<Arc<dyn ApplicationDriver>> {
        self.app_driver.lock().clone()
    }

    pub(crate) fn replace_app_driver(
        &self,
        driver: Option<Arc<dyn ApplicationDriver>>,
    ) -> Option<Arc<dyn ApplicationDriver>> {
        std::mem::replace(&mut *self.app_driver.lock(), driver)
    }

    pub(crate) fn attach_driver(&self, driver: Arc<dyn ProtocolDriver>) {
        self.route.replace(Some(Arc::new(AppRoute {
            protocol: self.protocol,
            driver,
        })));
    }

    pub(crate) fn detach_driver(&self) {
        self.route.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SignalDriver;

    #[test]
    fn test_application_wakeup_follows_driver() {
        let app = Application::new(5, "console", 2, Arc::new(EpochDomain::new()));
        assert!(app.wakeup(1).unwrap_err().is_not_bound());

        let driver = Arc::new(SignalDriver::new("sig", Vec::new()).unwrap());
        app.attach_driver(driver.clone());
        app.wakeup(1).unwrap();
        assert_eq!(driver.stats().app_events, 1);

        app.detach_driver();
        assert!(app.wakeup(2).unwrap_err().is_not_bound());
        assert_eq!(driver.stats().app_events, 1);

        let counts = app.wakeup_stats();
        assert_eq!(counts.delivered, 1);
        assert_eq!(counts.not_bound, 2);
    }
}
