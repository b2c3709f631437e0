//! Resource descriptors, the producer capability and the process-wide
//! registry.
//!
//! A [`ResourceBean`] describes one configured resource manager. The pool
//! layer that owns actual connections implements [`ResourceProducer`] so the
//! recovery engine can reach a resource by the unique name stored in journal
//! records. The [`ResourceRegistry`] is the name → producer mapping shared by
//! the whole process.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use tandem_core::{Result, TransactionError, XaResource};

/// Configuration descriptor of one resource manager.
#[derive(Debug, Clone)]
pub struct ResourceBean {
    unique_name: String,
    class_name: String,
    use_tm_join: bool,
    two_pc_ordering_position: i32,
    ignore_recovery_failures: bool,
    apply_transaction_timeout: bool,
    driver_properties: HashMap<String, String>,
}

impl ResourceBean {
    /// Creates a descriptor with the given identity and defaults: TMJOIN
    /// enabled, ordering position 0, recovery failures fatal.
    pub fn new(unique_name: impl Into<String>, class_name: impl Into<String>) -> Self {
        Self {
            unique_name: unique_name.into(),
            class_name: class_name.into(),
            use_tm_join: true,
            two_pc_ordering_position: 0,
            ignore_recovery_failures: false,
            apply_transaction_timeout: false,
            driver_properties: HashMap::new(),
        }
    }

    /// Enables or disables starting sibling branches with TMJOIN.
    pub fn with_use_tm_join(mut self, use_tm_join: bool) -> Self {
        self.use_tm_join = use_tm_join;
        self
    }

    /// Sets the two-phase-commit ordering position.
    pub fn with_two_pc_ordering_position(mut self, position: i32) -> Self {
        self.two_pc_ordering_position = position;
        self
    }

    /// Tolerates recovery failures on this resource instead of surfacing
    /// them in the recovery result.
    pub fn with_ignore_recovery_failures(mut self, ignore: bool) -> Self {
        self.ignore_recovery_failures = ignore;
        self
    }

    /// Propagates the transaction timeout to the resource at enlistment.
    pub fn with_apply_transaction_timeout(mut self, apply: bool) -> Self {
        self.apply_transaction_timeout = apply;
        self
    }

    /// Sets a driver property.
    pub fn with_driver_property(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.driver_properties.insert(name.into(), value.into());
        self
    }

    /// The name identifying this resource in journal records and in the
    /// registry.
    pub fn unique_name(&self) -> &str {
        &self.unique_name
    }

    /// The driver class or type name, for diagnostics.
    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    /// Whether a second branch on the same resource manager joins the first
    /// one instead of opening a fresh branch.
    pub fn use_tm_join(&self) -> bool {
        self.use_tm_join
    }

    /// The position this resource prepares and commits at; rollback runs in
    /// reverse position order.
    pub fn two_pc_ordering_position(&self) -> i32 {
        self.two_pc_ordering_position
    }

    /// Whether recovery failures on this resource are logged and swallowed.
    pub fn ignore_recovery_failures(&self) -> bool {
        self.ignore_recovery_failures
    }

    /// Whether the transaction timeout is pushed to the resource.
    pub fn apply_transaction_timeout(&self) -> bool {
        self.apply_transaction_timeout
    }

    /// Driver-specific properties.
    pub fn driver_properties(&self) -> &HashMap<String, String> {
        &self.driver_properties
    }
}

/// Produces recovery access to one registered resource.
///
/// Implemented by the pool layer. `start_recovery` hands out a connection's
/// XA handle dedicated to a recovery scan; `end_recovery` releases it. The
/// failed flag is flipped by incremental recovery and healed by the pool on
/// the next acquisition; a failed producer stays registered.
#[async_trait]
pub trait ResourceProducer: Send + Sync {
    /// The descriptor of this resource.
    fn bean(&self) -> &ResourceBean;

    /// Acquires an XA handle usable for a recovery scan.
    async fn start_recovery(&self) -> Result<Arc<dyn XaResource>>;

    /// Releases the recovery handle acquired by `start_recovery`.
    async fn end_recovery(&self) -> Result<()>;

    /// Marks or clears the failed state.
    fn set_failed(&self, failed: bool);

    /// Returns `true` while the resource is marked failed.
    fn is_failed(&self) -> bool;
}

/// Process-wide mapping from unique resource name to producer.
///
/// Mutation is lock-guarded; reads take a snapshot so recovery scans hold no
/// lock while talking to resources.
#[derive(Default)]
pub struct ResourceRegistry {
    producers: RwLock<HashMap<String, Arc<dyn ResourceProducer>>>,
}

impl ResourceRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a producer under its bean's unique name.
    ///
    /// Registering a name twice is a configuration error.
    pub fn register(&self, producer: Arc<dyn ResourceProducer>) -> Result<()> {
        let name = producer.bean().unique_name().to_string();
        if name.is_empty() {
            return Err(TransactionError::Configuration(
                "cannot register a resource with an empty unique name".to_string(),
            ));
        }
        let mut producers = self.producers.write().expect("resource registry poisoned");
        if producers.contains_key(&name) {
            return Err(TransactionError::Configuration(format!(
                "resource with unique name \"{name}\" is already registered"
            )));
        }
        tracing::debug!(unique_name = %name, "registering resource");
        producers.insert(name, producer);
        Ok(())
    }

    /// Removes a producer. Unknown names are ignored.
    pub fn unregister(&self, unique_name: &str) {
        let mut producers = self.producers.write().expect("resource registry poisoned");
        if producers.remove(unique_name).is_some() {
            tracing::debug!(unique_name, "unregistered resource");
        }
    }

    /// Looks up a producer by unique name.
    pub fn get(&self, unique_name: &str) -> Option<Arc<dyn ResourceProducer>> {
        self.producers
            .read()
            .expect("resource registry poisoned")
            .get(unique_name)
            .cloned()
    }

    /// Returns a point-in-time snapshot of every registered producer.
    pub fn snapshot(&self) -> Vec<Arc<dyn ResourceProducer>> {
        let producers = self.producers.read().expect("resource registry poisoned");
        let mut snapshot: Vec<_> = producers.values().cloned().collect();
        snapshot.sort_by(|a, b| a.bean().unique_name().cmp(b.bean().unique_name()));
        snapshot
    }

    /// Number of registered resources.
    pub fn len(&self) -> usize {
        self.producers
            .read()
            .expect("resource registry poisoned")
            .len()
    }

    /// Returns `true` when no resource is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
