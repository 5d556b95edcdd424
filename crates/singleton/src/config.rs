/// Entity type under which every node registers for a service group.
pub const SERVICE_ENTITY_TYPE: &str = "proven.singleton.ServiceEntityType";

/// Entity type which only the current service entity owner registers for.
pub const CLEANUP_ENTITY_TYPE: &str = "proven.singleton.CleanupEntityType";

/// Configuration for the `ClusterSingletonServiceProvider`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProviderConfig {
    /// Entity type used for the service entity of each group.
    pub service_entity_type: String,

    /// Entity type used for the cleanup entity of each group.
    pub cleanup_entity_type: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            service_entity_type: SERVICE_ENTITY_TYPE.to_string(),
            cleanup_entity_type: CLEANUP_ENTITY_TYPE.to_string(),
        }
    }
}
