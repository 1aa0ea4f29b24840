//! Versioned handler registries.
//!
//! `Registry<H>` stores orchestration and activity handlers by name and semver
//! version. Activities always live at 1.0.0. Orchestrations may carry several
//! versions; new instances pick one through the name's [`VersionPolicy`] and the
//! chosen version is pinned in `OrchestrationStarted`, so replays of existing
//! instances always resolve the exact version they started with.

use super::{ActivityHandler, FnActivity, FnOrchestration, OrchestrationHandler};
use crate::_typed_codec::{Codec, Json};
use crate::{ActivityContext, OrchestrationContext};
use semver::Version;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};

const DEFAULT_VERSION: Version = Version::new(1, 0, 0);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VersionPolicy {
    Latest,
    Exact(Version),
}

type VersionMap<H> = HashMap<String, BTreeMap<Version, Arc<H>>>;
type BoxedOutput = Pin<Box<dyn Future<Output = Result<String, String>> + Send>>;

pub struct Registry<H: ?Sized> {
    pub(crate) inner: Arc<VersionMap<H>>,
    pub(crate) policy: Arc<Mutex<HashMap<String, VersionPolicy>>>,
}

impl<H: ?Sized> Clone for Registry<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            policy: Arc::clone(&self.policy),
        }
    }
}

impl<H: ?Sized> Default for Registry<H> {
    fn default() -> Self {
        Self {
            inner: Arc::new(HashMap::new()),
            policy: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

pub struct RegistryBuilder<H: ?Sized> {
    map: VersionMap<H>,
    policy: HashMap<String, VersionPolicy>,
    errors: Vec<String>,
}

pub type OrchestrationRegistry = Registry<dyn OrchestrationHandler>;
pub type ActivityRegistry = Registry<dyn ActivityHandler>;
pub type OrchestrationRegistryBuilder = RegistryBuilder<dyn OrchestrationHandler>;
pub type ActivityRegistryBuilder = RegistryBuilder<dyn ActivityHandler>;

impl<H: ?Sized> Registry<H> {
    pub fn builder() -> RegistryBuilder<H> {
        RegistryBuilder {
            map: HashMap::new(),
            policy: HashMap::new(),
            errors: Vec::new(),
        }
    }

    pub fn builder_from(reg: &Registry<H>) -> RegistryBuilder<H> {
        RegistryBuilder {
            map: reg.inner.as_ref().clone(),
            policy: reg.policies().clone(),
            errors: Vec::new(),
        }
    }

    fn policies(&self) -> MutexGuard<'_, HashMap<String, VersionPolicy>> {
        self.policy.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Resolve the handler a new instance of `name` should run.
    pub fn resolve_handler(&self, name: &str) -> Option<(Version, Arc<H>)> {
        let policy = self.policies().get(name).cloned().unwrap_or(VersionPolicy::Latest);
        let versions = self.inner.get(name);
        let result = match &policy {
            VersionPolicy::Latest => versions
                .and_then(|m| m.iter().next_back())
                .map(|(v, h)| (v.clone(), Arc::clone(h))),
            VersionPolicy::Exact(v) => versions.and_then(|m| m.get(v)).map(|h| (v.clone(), Arc::clone(h))),
        };
        if result.is_none() {
            self.log_registry_miss(name, None, Some(&policy));
        }
        result
    }

    pub fn resolve_version(&self, name: &str) -> Option<Version> {
        self.resolve_handler(name).map(|(v, _)| v)
    }

    pub fn resolve_handler_exact(&self, name: &str, v: &Version) -> Option<Arc<H>> {
        let result = self.inner.get(name).and_then(|versions| versions.get(v)).cloned();
        if result.is_none() {
            self.log_registry_miss(name, Some(v), None);
        }
        result
    }

    /// Change which version new instances of `name` start on. Running instances are unaffected.
    pub fn set_version_policy(&self, name: &str, policy: VersionPolicy) {
        self.policies().insert(name.to_string(), policy);
    }

    pub fn list_names(&self) -> Vec<String> {
        self.inner.keys().cloned().collect()
    }

    pub fn list_versions(&self, name: &str) -> Vec<Version> {
        self.inner
            .get(name)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }

    pub fn count(&self) -> usize {
        self.inner.len()
    }

    fn log_registry_miss(&self, name: &str, requested_version: Option<&Version>, requested_policy: Option<&VersionPolicy>) {
        tracing::debug!(
            target: "duralane::runtime::registry",
            requested_name = %name,
            requested_version = ?requested_version,
            requested_policy = ?requested_policy,
            available_versions = ?self.list_versions(name),
            registered_names = ?self.list_names(),
            "Registry lookup miss"
        );
    }
}

impl<H: ?Sized> RegistryBuilder<H> {
    /// Build, logging and dropping rejected registrations. See [`build_result`](Self::build_result).
    pub fn build(self) -> Registry<H> {
        for error in &self.errors {
            tracing::warn!(target: "duralane::runtime::registry", %error, "Registration rejected");
        }
        Registry {
            inner: Arc::new(self.map),
            policy: Arc::new(Mutex::new(self.policy)),
        }
    }

    /// Build, or return every registration error joined with `; `.
    pub fn build_result(self) -> Result<Registry<H>, String> {
        if self.errors.is_empty() {
            Ok(self.build())
        } else {
            Err(self.errors.join("; "))
        }
    }

    pub fn merge_registry(mut self, other: Registry<H>, error_prefix: &str) -> Self {
        for (name, versions) in other.inner.iter() {
            let entry = self.map.entry(name.clone()).or_default();
            for (version, handler) in versions {
                if entry.contains_key(version) {
                    self.errors.push(format!("duplicate {error_prefix} in merge: {name}@{version}"));
                } else {
                    entry.insert(version.clone(), Arc::clone(handler));
                }
            }
        }
        self
    }

    /// Insert unless the pair exists or, with `monotonic`, the version is not above the latest.
    fn insert(&mut self, name: String, version: Version, handler: Arc<H>, kind: &str, monotonic: bool) {
        let entry = self.map.entry(name.clone()).or_default();
        if entry.contains_key(&version) {
            self.errors.push(format!("duplicate {kind} registration: {name}@{version}"));
            return;
        }
        if monotonic
            && let Some((latest, _)) = entry.iter().next_back()
            && &version <= latest
        {
            self.errors.push(format!(
                "non-monotonic {kind} version for {name}: {version} is not later than {latest}"
            ));
            return;
        }
        entry.insert(version, handler);
    }

    fn parse_version(&mut self, name: &str, version: &str) -> Option<Version> {
        match Version::parse(version) {
            Ok(v) => Some(v),
            Err(e) => {
                self.errors.push(format!("invalid version for {name}: {version}: {e}"));
                None
            }
        }
    }
}

fn typed_orchestration<In, Out, F, Fut>(f: F) -> impl Fn(OrchestrationContext, String) -> BoxedOutput + Send + Sync + 'static
where
    In: serde::de::DeserializeOwned + Send + 'static,
    Out: serde::Serialize + Send + 'static,
    F: Fn(OrchestrationContext, In) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Out, String>> + Send + 'static,
{
    let f = Arc::new(f);
    move |ctx: OrchestrationContext, input: String| -> BoxedOutput {
        let f = Arc::clone(&f);
        Box::pin(async move {
            let input: In = Json::decode(&input)?;
            let out = f(ctx, input).await?;
            Json::encode(&out)
        })
    }
}

impl OrchestrationRegistryBuilder {
    /// Register at version 1.0.0.
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, String>> + Send + 'static,
    {
        self.insert(name.into(), DEFAULT_VERSION, Arc::new(FnOrchestration(f)), "orchestration", false);
        self
    }

    pub fn register_typed<In, Out, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(OrchestrationContext, In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Out, String>> + Send + 'static,
    {
        self.register(name, typed_orchestration(f))
    }

    /// Register an explicit version. Versions of one name must be registered in increasing order.
    pub fn register_versioned<F, Fut>(mut self, name: impl Into<String>, version: impl AsRef<str>, f: F) -> Self
    where
        F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, String>> + Send + 'static,
    {
        let name = name.into();
        if let Some(v) = self.parse_version(&name, version.as_ref()) {
            self.insert(name, v, Arc::new(FnOrchestration(f)), "orchestration", true);
        }
        self
    }

    pub fn register_versioned_typed<In, Out, F, Fut>(self, name: impl Into<String>, version: impl AsRef<str>, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(OrchestrationContext, In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Out, String>> + Send + 'static,
    {
        self.register_versioned(name, version, typed_orchestration(f))
    }

    pub fn merge(self, other: OrchestrationRegistry) -> Self {
        self.merge_registry(other, "orchestration")
    }

    pub fn set_policy(mut self, name: impl Into<String>, policy: VersionPolicy) -> Self {
        self.policy.insert(name.into(), policy);
        self
    }
}

impl ActivityRegistryBuilder {
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, String>> + Send + 'static,
    {
        self.insert(name.into(), DEFAULT_VERSION, Arc::new(FnActivity(f)), "activity", false);
        self
    }

    pub fn register_typed<In, Out, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(ActivityContext, In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Out, String>> + Send + 'static,
    {
        let f = Arc::new(f);
        self.register(name, move |ctx: ActivityContext, input: String| {
            let f = Arc::clone(&f);
            async move {
                let input: In = Json::decode(&input)?;
                let out = f(ctx, input).await?;
                Json::encode(&out)
            }
        })
    }

    pub fn merge(self, other: ActivityRegistry) -> Self {
        self.merge_registry(other, "activity")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body(_ctx: OrchestrationContext, input: String) -> Result<String, String> {
        Ok(input)
    }

    #[test]
    fn latest_policy_picks_highest_version() {
        let reg = OrchestrationRegistry::builder()
            .register("Flow", body)
            .register_versioned("Flow", "1.2.0", body)
            .register_versioned("Flow", "2.0.0", body)
            .build();
        assert_eq!(reg.resolve_version("Flow"), Some(Version::new(2, 0, 0)));
        reg.set_version_policy("Flow", VersionPolicy::Exact(Version::new(1, 2, 0)));
        assert_eq!(reg.resolve_version("Flow"), Some(Version::new(1, 2, 0)));
        assert!(reg.resolve_handler_exact("Flow", &Version::new(1, 0, 0)).is_some());
        assert!(reg.resolve_handler_exact("Flow", &Version::new(3, 0, 0)).is_none());
        assert!(reg.resolve_handler("Missing").is_none());
    }

    #[test]
    fn duplicate_and_out_of_order_versions_are_rejected() {
        let err = OrchestrationRegistry::builder()
            .register("Flow", body)
            .register("Flow", body)
            .register_versioned("Flow", "0.9.0", body)
            .register_versioned("Flow", "not-semver", body)
            .build_result()
            .err()
            .unwrap_or_default();
        assert!(err.contains("duplicate orchestration registration: Flow@1.0.0"), "{err}");
        assert!(err.contains("non-monotonic"), "{err}");
        assert!(err.contains("invalid version"), "{err}");
    }

    #[test]
    fn merge_reports_collisions() {
        let a = ActivityRegistry::builder()
            .register("Echo", |_ctx: ActivityContext, s: String| async move { Ok(s) })
            .build();
        let b = ActivityRegistry::builder()
            .register("Echo", |_ctx: ActivityContext, s: String| async move { Ok(s) })
            .register("Other", |_ctx: ActivityContext, s: String| async move { Ok(s) })
            .build();
        let err = ActivityRegistry::builder_from(&a)
            .merge(b)
            .build_result()
            .err()
            .unwrap_or_default();
        assert_eq!(err, "duplicate activity in merge: Echo@1.0.0");
    }
}
