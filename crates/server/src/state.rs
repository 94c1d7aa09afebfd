use std::sync::Arc;

use courier_broker::{ActivityLog, Broker};
use courier_core::Config;
use courier_queue::{Gateway, GatewaySettings};

/// Name this process records in the activity log.
pub const SERVER_NAME: &str = "web_server";

pub struct AppState {
    pub gateway: Gateway,
    pub activity: ActivityLog,
}

impl AppState {
    pub fn new(broker: Arc<dyn Broker>, config: &Config) -> Self {
        let activity = ActivityLog::new(broker.clone(), &config.log, SERVER_NAME);
        let gateway = Gateway::new(broker, GatewaySettings::from(&config.queue))
            .with_activity_log(activity.clone());
        Self { gateway, activity }
    }
}
