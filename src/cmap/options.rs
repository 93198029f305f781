use std::time::Duration;

use typed_builder::TypedBuilder;

use crate::options::ClientOptions;

/// Configuration for one server's connection pool (§3 `Pool`, §4.C).
#[derive(Clone, Debug, TypedBuilder)]
pub struct ConnectionPoolOptions {
    #[builder(default)]
    pub max_pool_size: Option<u32>,

    #[builder(default)]
    pub min_pool_size: Option<u32>,

    #[builder(default)]
    pub max_idle_time: Option<Duration>,

    #[builder(default)]
    pub wait_queue_timeout: Option<Duration>,

    #[builder(default)]
    pub max_connecting: Option<u32>,

    #[builder(default)]
    pub app_name: Option<String>,

    #[builder(default)]
    pub connect_timeout: Option<Duration>,

    #[builder(default)]
    pub load_balanced: bool,
}

impl ConnectionPoolOptions {
    pub(crate) fn from_client_options(options: &ClientOptions) -> Self {
        Self {
            max_pool_size: options.max_pool_size,
            min_pool_size: options.min_pool_size,
            max_idle_time: options.max_idle_time,
            wait_queue_timeout: options.wait_queue_timeout,
            max_connecting: options.max_connecting,
            app_name: options.app_name.clone(),
            connect_timeout: options.connect_timeout,
            load_balanced: options.load_balanced.unwrap_or(false),
        }
    }

    pub(crate) fn max_pool_size(&self) -> u32 {
        self.max_pool_size.unwrap_or(100)
    }

    pub(crate) fn max_connecting(&self) -> u32 {
        self.max_connecting.unwrap_or(2)
    }
}
