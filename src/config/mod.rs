use crate::types::{AE, SourceId, UI};
use crate::DEFAULT_AET;

use serde::de::Error;
use serde::{Deserialize, Deserializer};
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AppConfig {
	#[serde(default)]
	pub telemetry: TelemetryConfig,
	#[serde(default)]
	pub dicom: DicomConfig,
	#[serde(default)]
	pub storage: StorageConfig,
	#[serde(default)]
	pub services: ServicesConfig,
	/// Calling-AE allow-list: remote AEs permitted to push instances.
	#[serde(default)]
	pub sources: Vec<SourceConfig>,
	/// Local called-AE table: grouping and routing policy per AE title.
	#[serde(default)]
	pub aets: Vec<CalledAeConfig>,
}

impl AppConfig {
	/// Loads the application configuration from the following sources:
	/// 1. Defaults (defined in `defaults.yaml`)
	/// 2. `config.yaml` in the working directory
	/// 3. Environment variables, prefixed with DICOM_BRIDGE
	/// # Errors
	/// Returns a [`config::ConfigError`] if source collection fails.
	pub fn new() -> Result<Self, config::ConfigError> {
		use config::{Config, Environment, File, FileFormat};
		Config::builder()
			.add_source(File::from_str(
				include_str!("defaults.yaml"),
				FileFormat::Yaml,
			))
			.add_source(File::with_name("config.yaml").required(false))
			.add_source(Environment::with_prefix("DICOM_BRIDGE").separator("_"))
			.build()?
			.try_deserialize()
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TelemetryConfig {
	#[serde(deserialize_with = "deserialize_log_level")]
	pub level: tracing::Level,
}

impl Default for TelemetryConfig {
	fn default() -> Self {
		Self {
			level: tracing::Level::INFO,
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DicomConfig {
	#[serde(default)]
	pub scp: ScpConfig,
	#[serde(default)]
	pub scu: ScuConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ScpConfig {
	pub interface: IpAddr,
	#[serde(default = "ScpConfig::default_port")]
	pub port: u16,
	#[serde(default = "ScpConfig::default_aet")]
	pub aet: AE,
	/// Upper bound on concurrently served associations.
	#[serde(default = "ScpConfig::default_max_associations")]
	pub max_associations: usize,
	/// Offer only codec-free transfer syntaxes during negotiation.
	#[serde(default = "ScpConfig::default_uncompressed")]
	pub uncompressed: bool,
	/// DIMSE message timeout in milliseconds.
	#[serde(default = "ScpConfig::default_dimse_timeout")]
	pub dimse_timeout: u64,
	/// Association idle timeout in milliseconds.
	#[serde(default = "ScpConfig::default_idle_timeout")]
	pub idle_timeout: u64,
}

impl ScpConfig {
	pub const fn default_port() -> u16 {
		7001
	}
	pub const fn default_max_associations() -> usize {
		32
	}
	pub const fn default_uncompressed() -> bool {
		true
	}
	pub const fn default_dimse_timeout() -> u64 {
		30_000
	}
	pub const fn default_idle_timeout() -> u64 {
		60_000
	}

	pub fn default_aet() -> AE {
		AE::from(DEFAULT_AET)
	}

	pub const fn dimse_timeout(&self) -> Duration {
		Duration::from_millis(self.dimse_timeout)
	}

	pub const fn idle_timeout(&self) -> Duration {
		Duration::from_millis(self.idle_timeout)
	}
}

impl Default for ScpConfig {
	fn default() -> Self {
		Self {
			interface: IpAddr::from([0, 0, 0, 0]),
			port: Self::default_port(),
			aet: Self::default_aet(),
			max_associations: Self::default_max_associations(),
			uncompressed: Self::default_uncompressed(),
			dimse_timeout: Self::default_dimse_timeout(),
			idle_timeout: Self::default_idle_timeout(),
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ScuConfig {
	/// Calling AE title used for outbound associations.
	#[serde(default = "ScpConfig::default_aet")]
	pub aet: AE,
	/// Destination AE title for C-MOVE sub-operations. Must resolve to one
	/// of the local SCP listeners.
	#[serde(default = "ScpConfig::default_aet")]
	pub move_destination: AE,
}

impl Default for ScuConfig {
	fn default() -> Self {
		Self {
			aet: ScpConfig::default_aet(),
			move_destination: ScpConfig::default_aet(),
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StorageConfig {
	/// Root directory for per-scope staging directories.
	pub staging_root: PathBuf,
	/// Path of the embedded key-value database.
	pub database_path: PathBuf,
	/// Hours a released staging scope survives before the reaper removes it.
	#[serde(default = "StorageConfig::default_retention_hours")]
	pub retention_hours: u64,
	/// Staging usage above which new associations are refused.
	#[serde(default = "StorageConfig::default_high_water_bytes")]
	pub high_water_bytes: u64,
	/// Reaper sweep interval in milliseconds.
	#[serde(default = "StorageConfig::default_sweep_interval")]
	pub sweep_interval: u64,
}

impl StorageConfig {
	pub const fn default_retention_hours() -> u64 {
		24
	}
	pub const fn default_high_water_bytes() -> u64 {
		50 * 1024 * 1024 * 1024
	}
	pub const fn default_sweep_interval() -> u64 {
		60_000
	}

	pub const fn retention(&self) -> Duration {
		Duration::from_secs(self.retention_hours * 3600)
	}

	pub const fn sweep_interval(&self) -> Duration {
		Duration::from_millis(self.sweep_interval)
	}
}

impl Default for StorageConfig {
	fn default() -> Self {
		Self {
			staging_root: PathBuf::from("data/staging"),
			database_path: PathBuf::from("data/bridge.db"),
			retention_hours: Self::default_retention_hours(),
			high_water_bytes: Self::default_high_water_bytes(),
			sweep_interval: Self::default_sweep_interval(),
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServicesConfig {
	pub platform: PlatformConfig,
	/// Number of inference request worker tasks.
	#[serde(default = "ServicesConfig::default_workers")]
	pub workers: usize,
	/// Transient-failure budget per inference request.
	#[serde(default = "ServicesConfig::default_max_retries")]
	pub max_retries: u32,
	/// Per-resource retrieval timeout in milliseconds.
	#[serde(default = "ServicesConfig::default_retrieve_timeout")]
	pub retrieve_timeout: u64,
}

impl ServicesConfig {
	pub const fn default_workers() -> usize {
		1
	}
	pub const fn default_max_retries() -> u32 {
		3
	}
	pub const fn default_retrieve_timeout() -> u64 {
		600_000
	}

	pub const fn retrieve_timeout(&self) -> Duration {
		Duration::from_millis(self.retrieve_timeout)
	}
}

impl Default for ServicesConfig {
	fn default() -> Self {
		Self {
			platform: PlatformConfig::default(),
			workers: Self::default_workers(),
			max_retries: Self::default_max_retries(),
			retrieve_timeout: Self::default_retrieve_timeout(),
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PlatformConfig {
	pub endpoint: String,
	/// Platform call timeout in milliseconds.
	#[serde(default = "PlatformConfig::default_timeout")]
	pub timeout: u64,
	/// Maximum job name length accepted by the platform.
	#[serde(default = "PlatformConfig::default_name_max_length")]
	pub name_max_length: usize,
}

impl PlatformConfig {
	pub const fn default_timeout() -> u64 {
		30_000
	}
	pub const fn default_name_max_length() -> usize {
		63
	}

	pub const fn timeout(&self) -> Duration {
		Duration::from_millis(self.timeout)
	}
}

impl Default for PlatformConfig {
	fn default() -> Self {
		Self {
			endpoint: String::from("http://localhost:8080"),
			timeout: Self::default_timeout(),
			name_max_length: Self::default_name_max_length(),
		}
	}
}

/// One entry of the calling-AE allow-list.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SourceConfig {
	pub aet: AE,
	pub id: SourceId,
}

/// Policy for one local called AE title.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CalledAeConfig {
	pub aet: AE,
	#[serde(default)]
	pub grouping: GroupingKind,
	/// Quiet period in milliseconds after which a bucket closes.
	#[serde(default = "CalledAeConfig::default_timeout")]
	pub timeout: u64,
	/// Upper bound on bucket lifetime in milliseconds.
	#[serde(default = "CalledAeConfig::default_max_age")]
	pub max_age: u64,
	/// SOP class UIDs accepted for this AE. Empty accepts every storage
	/// SOP class offered by the peer.
	#[serde(default)]
	pub allowed_sops: Vec<UI>,
	/// Source ids permitted to address this AE. Empty accepts every
	/// configured source.
	#[serde(default)]
	pub allowed_sources: Vec<SourceId>,
	/// Pipelines every closed bucket is submitted to.
	pub pipelines: Vec<String>,
	/// Job priority byte, mapped to a platform priority on submission.
	#[serde(default = "CalledAeConfig::default_priority")]
	pub priority: u8,
}

impl CalledAeConfig {
	pub const fn default_timeout() -> u64 {
		5_000
	}
	pub const fn default_max_age() -> u64 {
		60_000
	}
	pub const fn default_priority() -> u8 {
		128
	}

	pub const fn quiet_period(&self) -> Duration {
		Duration::from_millis(self.timeout)
	}

	pub const fn max_age(&self) -> Duration {
		Duration::from_millis(self.max_age)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GroupingKind {
	/// One bucket per received instance.
	None,
	/// Group by (called AE, patient id).
	PatientId,
	/// Group by (called AE, study instance UID).
	#[default]
	StudyInstanceUid,
	/// Group by (called AE, calling AE).
	CallingAet,
}

/// Deserializer for [`tracing::Level`] as it does not implement [Deserialize]
fn deserialize_log_level<'de, D>(deserializer: D) -> Result<tracing::Level, D::Error>
where
	D: Deserializer<'de>,
{
	let value = String::deserialize(deserializer)?;

	tracing::Level::from_str(&value)
		.map_err(|_| Error::unknown_variant(&value, &["TRACE", "DEBUG", "INFO", "WARN", "ERROR"]))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_parse() {
		let config: AppConfig = config::Config::builder()
			.add_source(config::File::from_str(
				include_str!("defaults.yaml"),
				config::FileFormat::Yaml,
			))
			.build()
			.unwrap()
			.try_deserialize()
			.unwrap();

		assert_eq!(config.dicom.scp.port, 7001);
		assert_eq!(config.dicom.scp.aet, DEFAULT_AET);
		assert_eq!(config.services.workers, 1);
		assert!(config.sources.is_empty());
	}

	#[test]
	fn called_ae_table_parses() {
		let yaml = r"
sources:
  - aet: PACS1
    id: src1
aets:
  - aet: BRIDGE1
    grouping: patient-id
    timeout: 2000
    pipelines: [liver-seg]
    allowed-sources: [src1]
";
		let config: AppConfig = config::Config::builder()
			.add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
			.build()
			.unwrap()
			.try_deserialize()
			.unwrap();

		let ae = &config.aets[0];
		assert_eq!(ae.grouping, GroupingKind::PatientId);
		assert_eq!(ae.quiet_period(), Duration::from_secs(2));
		assert_eq!(ae.max_age(), Duration::from_secs(60));
		assert_eq!(ae.priority, 128);
		assert_eq!(config.sources[0].id, "src1");
	}
}
