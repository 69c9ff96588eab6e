use crate::config::{CalledAeConfig, SourceConfig};
use crate::types::{AE, SourceId};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::info;

/// Lookup of permitted calling AEs and local called AEs.
///
/// Readers work on an immutable snapshot; [`AeRegistry::reload`] swaps the
/// snapshot wholesale so lookups never observe a half-applied table.
#[derive(Debug)]
pub struct AeRegistry {
	snapshot: RwLock<Arc<RegistrySnapshot>>,
}

#[derive(Debug, Default)]
pub struct RegistrySnapshot {
	calling: HashMap<AE, SourceId>,
	called: HashMap<AE, Arc<CalledAeConfig>>,
}

#[derive(Debug, Error)]
pub enum RegistryError {
	#[error("Duplicate calling AE title '{0}' in sources table")]
	DuplicateCallingAe(AE),
	#[error("Duplicate called AE title '{0}' in aets table")]
	DuplicateCalledAe(AE),
	#[error("Called AE '{0}' has no pipelines configured")]
	NoPipelines(AE),
	#[error("Called AE '{0}' quiet period exceeds its max-age bound")]
	QuietPeriodTooLong(AE),
	#[error("Called AE '{aet}' allows unknown source id '{source_id}'")]
	UnknownSource { aet: AE, source_id: SourceId },
}

impl RegistrySnapshot {
	fn build(
		sources: &[SourceConfig],
		aets: &[CalledAeConfig],
	) -> Result<Self, RegistryError> {
		let mut calling = HashMap::with_capacity(sources.len());
		for source in sources {
			if calling
				.insert(source.aet.clone(), source.id.clone())
				.is_some()
			{
				return Err(RegistryError::DuplicateCallingAe(source.aet.clone()));
			}
		}

		let known_sources: Vec<&SourceId> = calling.values().collect();
		let mut called = HashMap::with_capacity(aets.len());
		for ae in aets {
			if ae.pipelines.is_empty() {
				return Err(RegistryError::NoPipelines(ae.aet.clone()));
			}
			if ae.quiet_period() > ae.max_age() {
				return Err(RegistryError::QuietPeriodTooLong(ae.aet.clone()));
			}
			for source in &ae.allowed_sources {
				if !known_sources.contains(&source) {
					return Err(RegistryError::UnknownSource {
						aet: ae.aet.clone(),
						source_id: source.clone(),
					});
				}
			}
			if called
				.insert(ae.aet.clone(), Arc::new(ae.clone()))
				.is_some()
			{
				return Err(RegistryError::DuplicateCalledAe(ae.aet.clone()));
			}
		}

		Ok(Self { calling, called })
	}
}

impl AeRegistry {
	pub fn new(
		sources: &[SourceConfig],
		aets: &[CalledAeConfig],
	) -> Result<Self, RegistryError> {
		let snapshot = RegistrySnapshot::build(sources, aets)?;
		info!(
			sources = snapshot.calling.len(),
			aets = snapshot.called.len(),
			"Loaded AE registry"
		);
		Ok(Self {
			snapshot: RwLock::new(Arc::new(snapshot)),
		})
	}

	/// Replaces both tables with a freshly validated snapshot.
	pub fn reload(
		&self,
		sources: &[SourceConfig],
		aets: &[CalledAeConfig],
	) -> Result<(), RegistryError> {
		let snapshot = Arc::new(RegistrySnapshot::build(sources, aets)?);
		*self.snapshot.write().expect("registry lock poisoned") = snapshot;
		info!("Reloaded AE registry");
		Ok(())
	}

	pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
		Arc::clone(&self.snapshot.read().expect("registry lock poisoned"))
	}
}

impl RegistrySnapshot {
	pub fn resolve_calling(&self, aet: &str) -> Option<&SourceId> {
		self.calling.get(aet)
	}

	pub fn resolve_called(&self, aet: &str) -> Option<Arc<CalledAeConfig>> {
		self.called.get(aet).map(Arc::clone)
	}

	/// Whether a resolved source may address the given called AE.
	/// An empty allow-list accepts every configured source.
	pub fn source_allowed(&self, source: &SourceId, called: &CalledAeConfig) -> bool {
		called.allowed_sources.is_empty() || called.allowed_sources.contains(source)
	}

	/// Union of the SOP classes accepted across all called AEs.
	/// Empty when any AE accepts every storage SOP class.
	pub fn accepted_abstract_syntaxes(&self) -> Vec<String> {
		let mut sops = Vec::new();
		for config in self.called.values() {
			if config.allowed_sops.is_empty() {
				return Vec::new();
			}
			for sop in &config.allowed_sops {
				if !sops.contains(sop) {
					sops.push(sop.clone());
				}
			}
		}
		sops
	}
}
