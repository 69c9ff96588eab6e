use super::{RetrieveError, RetrieveOutcome, Retriever};
use crate::config::ScuConfig;
use crate::dimse::association::outbound::RemoteNode;
use crate::dimse::cfind::findscu::{FindServiceClassUser, FindServiceClassUserOptions};
use crate::dimse::cmove::movescu::MoveServiceClassUser;
use crate::dimse::cmove::{CompositeMoveRequest, InstanceSink, RetrieveRouter, RouteKey};
use crate::dimse::next_message_id;
use crate::inference::{ConnectionDetails, DicomStudy, MetadataDetails, Resource};
use crate::types::{Priority, QueryInformationModel, QueryRetrieveLevel, AE, UI, US};
use async_trait::async_trait;
use dicom::core::{DataElement, PrimitiveValue, VR};
use dicom::dictionary_std::tags;
use dicom::object::mem::InMemElement;
use dicom::object::InMemDicomObject;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

/// Retrieval over DIMSE: C-FIND resolves patient/accession selectors to
/// studies, then one C-MOVE per study directs the instances to the local
/// store SCP, where the [`RetrieveRouter`] claims them into the target
/// directory. Every operation opens its own association to the remote
/// node.
pub struct DimseRetriever {
	router: RetrieveRouter,
	scu: ScuConfig,
	/// Budget for one DIMSE exchange (a whole C-FIND or C-MOVE).
	timeout: Duration,
}

impl DimseRetriever {
	pub fn new(router: RetrieveRouter, scu: ScuConfig, timeout: Duration) -> Self {
		Self {
			router,
			scu,
			timeout,
		}
	}

	fn endpoint(details: &ConnectionDetails) -> Result<(SocketAddr, AE), RetrieveError> {
		let (Some(aet), Some(host), Some(port)) =
			(details.aet.as_deref(), details.host.as_deref(), details.port)
		else {
			return Err(RetrieveError::BadResource(String::from(
				"DIMSE resource requires aet, host and port",
			)));
		};
		let address = (host, port)
			.to_socket_addrs()?
			.next()
			.ok_or_else(|| {
				RetrieveError::BadResource(format!("Host '{host}' does not resolve"))
			})?;
		Ok((address, AE::from(aet)))
	}

	/// Resolves the selector to a list of studies, via C-FIND where the
	/// selector is not already UID-based.
	async fn resolve_studies(
		&self,
		node: &RemoteNode,
		selector: &MetadataDetails,
	) -> Result<Vec<DicomStudy>, RetrieveError> {
		let identifiers: Vec<InMemDicomObject> = match selector {
			MetadataDetails::DicomUid { studies } => return Ok(studies.clone()),
			MetadataDetails::DicomPatientId { patient_id } => {
				vec![Self::study_query(DataElement::new(
					tags::PATIENT_ID,
					VR::LO,
					PrimitiveValue::from(patient_id.as_str()),
				))]
			}
			MetadataDetails::AccessionNumber { accession_numbers } => accession_numbers
				.iter()
				.map(|accession| {
					Self::study_query(DataElement::new(
						tags::ACCESSION_NUMBER,
						VR::SH,
						PrimitiveValue::from(accession.as_str()),
					))
				})
				.collect(),
		};

		let findscu = FindServiceClassUser::new(node.clone(), self.timeout);
		let mut studies = Vec::new();
		for identifier in identifiers {
			let matches = findscu
				.invoke(FindServiceClassUserOptions {
					query_information_model: QueryInformationModel::Study,
					identifier,
					priority: Priority::Medium,
				})
				.await?;

			for identifier in matches {
				let Some(uid) = identifier
					.element(tags::STUDY_INSTANCE_UID)
					.ok()
					.and_then(|element| element.to_str().ok())
					.map(|uid| uid.trim().to_string())
					.filter(|uid| !uid.is_empty())
				else {
					continue;
				};
				if !studies
					.iter()
					.any(|study: &DicomStudy| study.study_instance_uid == uid)
				{
					studies.push(DicomStudy {
						study_instance_uid: uid,
						series: Vec::new(),
					});
				}
			}
		}
		Ok(studies)
	}

	/// Study-level C-FIND identifier returning study UIDs for a criterion.
	fn study_query(criterion: InMemElement) -> InMemDicomObject {
		InMemDicomObject::from_element_iter([
			DataElement::new(
				tags::QUERY_RETRIEVE_LEVEL,
				VR::CS,
				PrimitiveValue::from(QueryRetrieveLevel::Study),
			),
			DataElement::new(tags::STUDY_INSTANCE_UID, VR::UI, PrimitiveValue::Empty),
			criterion,
		])
	}

	fn move_identifier(study: &DicomStudy) -> Vec<InMemDicomObject> {
		if study.series.is_empty() {
			vec![InMemDicomObject::from_element_iter([
				DataElement::new(
					tags::QUERY_RETRIEVE_LEVEL,
					VR::CS,
					PrimitiveValue::from(QueryRetrieveLevel::Study),
				),
				DataElement::new(
					tags::STUDY_INSTANCE_UID,
					VR::UI,
					PrimitiveValue::from(study.study_instance_uid.as_str()),
				),
			])]
		} else {
			study
				.series
				.iter()
				.map(|series| {
					InMemDicomObject::from_element_iter([
						DataElement::new(
							tags::QUERY_RETRIEVE_LEVEL,
							VR::CS,
							PrimitiveValue::from(QueryRetrieveLevel::Series),
						),
						DataElement::new(
							tags::STUDY_INSTANCE_UID,
							VR::UI,
							PrimitiveValue::from(study.study_instance_uid.as_str()),
						),
						DataElement::new(
							tags::SERIES_INSTANCE_UID,
							VR::UI,
							PrimitiveValue::from(series.as_str()),
						),
					])
				})
				.collect()
		}
	}
}

#[async_trait]
impl Retriever for DimseRetriever {
	#[instrument(skip_all, name = "DIMSE-RETRIEVE")]
	async fn retrieve(
		&self,
		resource: &Resource,
		selector: &MetadataDetails,
		target: &Path,
		cancel: &CancellationToken,
	) -> Result<RetrieveOutcome, RetrieveError> {
		let (address, remote_aet) = Self::endpoint(&resource.connection_details)?;
		let node = RemoteNode {
			address,
			calling_aet: self.scu.aet.clone(),
			called_aet: remote_aet.clone(),
		};

		let studies = self.resolve_studies(&node, selector).await?;
		debug!(studies = studies.len(), "Resolved retrieval selector");
		if studies.is_empty() {
			return Ok(RetrieveOutcome::default());
		}

		let movescu = MoveServiceClassUser::new(node, self.timeout);
		let (deposited_tx, mut deposited_rx) = mpsc::channel::<UI>(256);

		for study in &studies {
			for identifier in Self::move_identifier(study) {
				if cancel.is_cancelled() {
					return Err(RetrieveError::Cancelled);
				}

				let message_id: US = next_message_id();
				let sink = InstanceSink {
					dir: target.to_path_buf(),
					deposited: deposited_tx.clone(),
				};
				let _registration = self.router.register(
					vec![
						RouteKey::new(self.scu.aet.clone(), Some(message_id)),
						RouteKey::new(remote_aet.clone(), None),
					],
					sink,
				);

				let request = CompositeMoveRequest {
					identifier,
					message_id,
					priority: Priority::Medium as US,
					destination: self.scu.move_destination.clone(),
				};

				tokio::select! {
					() = cancel.cancelled() => return Err(RetrieveError::Cancelled),
					result = movescu.invoke(request) => result?,
				}
			}
		}
		drop(deposited_tx);

		let mut instances = Vec::new();
		while let Some(sop_instance_uid) = deposited_rx.recv().await {
			instances.push(sop_instance_uid);
		}

		info!(
			instances = instances.len(),
			studies = studies.len(),
			"DIMSE retrieval finished"
		);
		Ok(RetrieveOutcome { instances })
	}
}
