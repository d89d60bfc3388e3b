//! Lifecycle contract shared by acquisition and output modules.
//!
//! A provider's `init` creates a module and its private context. The event
//! loop then owns the module, calls `step` once per cycle and calls
//! `destroy` exactly once before dropping it.

use std::time::Duration;

use async_trait::async_trait;

use crate::{
    outcome::{ModuleError, Outcome},
    store::{Reading, ReadingStore},
};

/// Acquires one fresh reading per `step` and publishes it to the store.
#[async_trait]
pub trait Collection: Send {
    fn name(&self) -> &str;

    /// One acquisition attempt. On `Success` the store holds the new reading;
    /// on any other outcome the store is untouched.
    async fn step(&mut self) -> Outcome;

    /// Releases handles held by the module.
    async fn destroy(&mut self) {}
}

/// Drives one output sink from the latest reading.
#[async_trait]
pub trait PostCollection: Send {
    fn name(&self) -> &str;

    /// Publishes `reading`. Failures are logged by the caller and never stop
    /// the loop.
    async fn step(&mut self, reading: &Reading) -> Outcome;

    async fn destroy(&mut self) {}
}

/// Creates a module bound to the shared store.
///
/// # Example
///
/// ```no_run
/// use thmond::module::{Collection, ModuleProvider};
/// use thmond::outcome::{ModuleError, Outcome};
/// use thmond::store::ReadingStore;
///
/// struct Constant(ReadingStore);
///
/// #[async_trait::async_trait]
/// impl Collection for Constant {
///     fn name(&self) -> &str { "constant" }
///     async fn step(&mut self) -> Outcome {
///         self.0.publish(21.0, &[]).into()
///     }
/// }
///
/// struct ConstantProvider;
///
/// #[async_trait::async_trait]
/// impl ModuleProvider<dyn Collection> for ConstantProvider {
///     fn name(&self) -> &str { "constant" }
///     async fn init(&self, store: &ReadingStore) -> Result<Box<dyn Collection>, ModuleError> {
///         Ok(Box::new(Constant(store.clone())))
///     }
/// }
/// ```
#[async_trait]
pub trait ModuleProvider<M: ?Sized + Send>: Send + Sync {
    fn name(&self) -> &str;

    async fn init(&self, store: &ReadingStore) -> Result<Box<M>, ModuleError>;

    /// Output modules with a cadence run as detached consumers that poll the
    /// store on their own schedule.
    fn cadence(&self) -> Option<Duration> {
        None
    }
}

pub type CollectionProvider = Box<dyn ModuleProvider<dyn Collection>>;
pub type PostCollectionProvider = Box<dyn ModuleProvider<dyn PostCollection>>;
