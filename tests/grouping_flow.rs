//! End-to-end flow from published instance events through the grouping
//! engine to job submissions, using a scripted platform sink.

use async_trait::async_trait;
use chrono::Utc;
use dicom_bridge::config::{CalledAeConfig, GroupingKind};
use dicom_bridge::grouping::{GroupingEngine, GroupingOptions};
use dicom_bridge::ingest::{Instance, InstanceEvent, InstanceNotifier};
use dicom_bridge::platform::{JobReceipt, JobSink, JobSubmission, PlatformError};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct CollectingSink {
	submissions: Mutex<Vec<JobSubmission>>,
}

#[async_trait]
impl JobSink for CollectingSink {
	async fn submit(&self, job: JobSubmission) -> Result<JobReceipt, PlatformError> {
		self.submissions.lock().unwrap().push(job);
		Ok(JobReceipt {
			job_id: String::from("job-1"),
			payload_id: String::from("payload-1"),
			job_name: String::from("job-1-name"),
			submitted_at: Utc::now(),
		})
	}
}

fn called_ae(aet: &str, grouping: GroupingKind, pipelines: &[&str]) -> Arc<CalledAeConfig> {
	Arc::new(CalledAeConfig {
		aet: String::from(aet),
		grouping,
		timeout: 5_000,
		max_age: 60_000,
		allowed_sops: Vec::new(),
		allowed_sources: Vec::new(),
		pipelines: pipelines.iter().map(|p| String::from(*p)).collect(),
		priority: 128,
	})
}

fn event(
	config: &Arc<CalledAeConfig>,
	calling: &str,
	sop: &str,
	study: &str,
	patient: &str,
) -> InstanceEvent {
	InstanceEvent {
		instance: Arc::new(Instance {
			sop_instance_uid: String::from(sop),
			series_instance_uid: format!("{study}.1"),
			study_instance_uid: String::from(study),
			patient_id: String::from(patient),
			called_ae: config.aet.clone(),
			calling_ae: String::from(calling),
			received_at: Utc::now(),
			file_path: PathBuf::from(format!("/staging/{calling}/{sop}.dcm")),
			transfer_syntax: String::from("1.2.840.10008.1.2.1"),
		}),
		config: Arc::clone(config),
	}
}

/// Two called AEs with different grouping rules, fed concurrently from one
/// source: study grouping yields one job per study, patient grouping one
/// job per patient and pipeline.
#[tokio::test(start_paused = true)]
async fn multi_ae_grouping_produces_expected_jobs() {
	let sink = Arc::new(CollectingSink {
		submissions: Mutex::new(Vec::new()),
	});
	let notifier = InstanceNotifier::new(64);
	let events = notifier.subscribe("grouping-engine");
	let engine = GroupingEngine::new(
		Arc::clone(&sink) as Arc<dyn JobSink>,
		GroupingOptions::default(),
	);
	engine.run(events, CancellationToken::new());

	let by_study = called_ae("BRIDGE1", GroupingKind::StudyInstanceUid, &["pipe-a"]);
	let by_patient = called_ae("BRIDGE2", GroupingKind::PatientId, &["pipe-a", "pipe-b"]);

	let studies = [
		("study-1", "PAT-1"),
		("study-2", "PAT-1"),
		("study-3", "PAT-2"),
		("study-4", "PAT-2"),
	];
	for (study, patient) in studies {
		for index in 0..3 {
			let sop = format!("{study}.{index}");
			notifier
				.publish(event(&by_study, "PACS1", &sop, study, patient))
				.await;
			notifier
				.publish(event(&by_patient, "PACS1", &sop, study, patient))
				.await;
		}
	}

	tokio::time::sleep(Duration::from_secs(10)).await;

	let submissions = sink.submissions.lock().unwrap();
	// 4 studies for BRIDGE1 plus 2 patients x 2 pipelines for BRIDGE2.
	assert_eq!(submissions.len(), 8);

	let study_jobs: Vec<_> = submissions
		.iter()
		.filter(|s| s.metadata["called-aet"] == "BRIDGE1")
		.collect();
	assert_eq!(study_jobs.len(), 4);
	for job in study_jobs {
		assert_eq!(job.payload_files.len(), 3);
	}

	let patient_jobs: Vec<_> = submissions
		.iter()
		.filter(|s| s.metadata["called-aet"] == "BRIDGE2")
		.collect();
	assert_eq!(patient_jobs.len(), 4);
	for job in patient_jobs {
		// Two studies x three instances per patient.
		assert_eq!(job.payload_files.len(), 6);
	}
}

/// Subsets of one study arriving over several sequential associations end
/// up in a single job whose manifest is the union of all sent instances.
#[tokio::test(start_paused = true)]
async fn one_study_across_associations_yields_one_job() {
	let sink = Arc::new(CollectingSink {
		submissions: Mutex::new(Vec::new()),
	});
	let notifier = InstanceNotifier::new(64);
	let events = notifier.subscribe("grouping-engine");
	let engine = GroupingEngine::new(
		Arc::clone(&sink) as Arc<dyn JobSink>,
		GroupingOptions::default(),
	);
	engine.run(events, CancellationToken::new());

	let config = called_ae("BRIDGE1", GroupingKind::StudyInstanceUid, &["pipe-a"]);

	// Five associations, each delivering two instances of the same study,
	// with one instance resent by a later association.
	for association in 0..5u32 {
		for index in 0..2u32 {
			let sop = if association == 4 && index == 1 {
				String::from("study-1.0.0") // duplicate of the very first
			} else {
				format!("study-1.{association}.{index}")
			};
			notifier
				.publish(event(&config, "PACS1", &sop, "study-1", "PAT-1"))
				.await;
		}
		tokio::time::sleep(Duration::from_secs(2)).await;
	}

	tokio::time::sleep(Duration::from_secs(6)).await;

	let submissions = sink.submissions.lock().unwrap();
	assert_eq!(submissions.len(), 1);
	// 10 sent, 1 duplicate collapsed.
	assert_eq!(submissions[0].payload_files.len(), 9);
}
