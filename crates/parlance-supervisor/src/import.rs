use std::sync::Arc;

use async_trait::async_trait;
use parlance_domain::{Installation, InstallationState, ResourceType};
use parlance_events::EventProducer;
use parlance_provisioner::{ImportBackend, ImportWork};
use parlance_store::Store;
use tracing::{info, warn};

use crate::supervisor::{set_installation_state, try_lock, unlock, Supervisor};

/// Drives workspace imports handed out by the external translation service.
/// One work item per tick: stage the translated archive next to the
/// installation, run the import command, report completion.
#[derive(Clone)]
pub struct ImportSupervisor {
    store: Arc<dyn Store>,
    backend: Arc<dyn ImportBackend>,
    events: Arc<EventProducer>,
    instance_id: String,
}

impl ImportSupervisor {
    pub fn new(
        store: Arc<dyn Store>,
        backend: Arc<dyn ImportBackend>,
        events: Arc<EventProducer>,
        instance_id: impl Into<String>,
    ) -> Self {
        ImportSupervisor {
            store,
            backend,
            events,
            instance_id: instance_id.into(),
        }
    }

    async fn run(&self, work: ImportWork) {
        let installation = match self.store.get_installation(&work.installation_id).await {
            Ok(Some(installation)) => installation,
            Ok(None) => {
                self.finish(&work, Some(format!(
                    "installation {} does not exist",
                    work.installation_id
                )))
                .await;
                return;
            }
            Err(err) => {
                warn!(work_id = %work.id, error = %err, "failed to load installation");
                self.finish(&work, Some(err.to_string())).await;
                return;
            }
        };

        let id = installation.id.clone();
        if !try_lock(&self.store, ResourceType::Installation, id.as_str(), &self.instance_id)
            .await
        {
            self.finish(&work, Some(format!("installation {id} is locked"))).await;
            return;
        }
        let resume_state = installation.state;
        if let Err(err) = self
            .mark_importing(&installation, InstallationState::ImportInProgress)
            .await
        {
            warn!(work_id = %work.id, error = %err, "failed to mark import in progress");
            unlock(&self.store, ResourceType::Installation, id.as_str(), &self.instance_id)
                .await;
            self.finish(&work, Some(err.to_string())).await;
            return;
        }

        // The lease may be released while the import command still runs;
        // the parked import-in-progress state is what keeps the other
        // supervisors away, so the release is best-effort.
        let outcome = self.stage_and_import(&work, &installation).await;

        if let Err(err) = self.mark_importing(&installation, resume_state).await {
            warn!(work_id = %work.id, error = %err, "failed to restore installation state");
        }
        unlock(&self.store, ResourceType::Installation, id.as_str(), &self.instance_id).await;

        match outcome {
            Ok(()) => {
                info!(work_id = %work.id, installation_id = %id, "import finished");
                self.finish(&work, None).await;
            }
            Err(message) => {
                warn!(work_id = %work.id, installation_id = %id, error = %message, "import failed");
                self.finish(&work, Some(message)).await;
            }
        }
    }

    async fn stage_and_import(
        &self,
        work: &ImportWork,
        installation: &Installation,
    ) -> Result<(), String> {
        let staged_key = self
            .backend
            .stage_archive(work, installation)
            .await
            .map_err(|err| format!("staging archive: {err}"))?;
        self.backend
            .run_import(work, installation, &staged_key)
            .await
            .map_err(|err| format!("running import: {err}"))
    }

    async fn mark_importing(
        &self,
        installation: &Installation,
        state: InstallationState,
    ) -> Result<(), crate::error::SupervisorError> {
        // Acquisition inside the helper is idempotent for this worker; the
        // helper also releases the lease when it is done.
        set_installation_state(
            &self.store,
            &self.events,
            &self.instance_id,
            &installation.id,
            state,
        )
        .await
    }

    async fn finish(&self, work: &ImportWork, error: Option<String>) {
        if let Err(err) = self.backend.complete(work, error).await {
            warn!(work_id = %work.id, error = %err, "failed to report import completion");
        }
    }
}

#[async_trait]
impl Supervisor for ImportSupervisor {
    fn name(&self) -> &'static str {
        "import"
    }

    async fn do_work(&self) {
        let work = match self.backend.next_ready_translation().await {
            Ok(Some(work)) => work,
            Ok(None) => return,
            Err(err) => {
                warn!(error = %err, "failed to fetch ready translations");
                return;
            }
        };
        info!(work_id = %work.id, installation_id = %work.installation_id, "import work claimed");
        self.run(work).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{test_env, test_installation};
    use parlance_provisioner::StubImportBackend;

    #[tokio::test]
    async fn import_runs_and_restores_installation_state() {
        let env = test_env(0).await;
        let mut installation = test_installation("import.chat.example.com");
        installation.state = InstallationState::Stable;
        env.store.create_installation(&installation).await.unwrap();

        let backend = Arc::new(StubImportBackend::new());
        backend
            .push_work(ImportWork {
                id: "translation-1".into(),
                installation_id: installation.id.clone(),
                archive_url: "s3://translations/translation-1.zip".into(),
            })
            .await;

        let supervisor = ImportSupervisor::new(
            env.store.clone(),
            backend.clone(),
            env.events.clone(),
            "test-instance",
        );
        supervisor.do_work().await;

        let stored = env
            .store
            .get_installation(&installation.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.state, InstallationState::Stable, "state restored");
        assert!(!stored.lease.is_locked());

        let completed = backend.completed().await;
        assert_eq!(completed, vec![("translation-1".to_string(), None)]);

        // The parked state was visible while the import ran.
        let events = env.store.list_state_change_events(100).await.unwrap();
        assert!(events.iter().any(|e| e.new_state == "import-in-progress"));
        assert!(events.iter().any(|e| {
            e.old_state == "import-in-progress" && e.new_state == "stable"
        }));
    }

    #[tokio::test]
    async fn unknown_installation_reports_failure() {
        let env = test_env(0).await;
        let backend = Arc::new(StubImportBackend::new());
        backend
            .push_work(ImportWork {
                id: "translation-2".into(),
                installation_id: parlance_domain::InstallationId::new("missing"),
                archive_url: "s3://translations/translation-2.zip".into(),
            })
            .await;

        let supervisor = ImportSupervisor::new(
            env.store.clone(),
            backend.clone(),
            env.events.clone(),
            "test-instance",
        );
        supervisor.do_work().await;

        let completed = backend.completed().await;
        assert_eq!(completed.len(), 1);
        assert!(completed[0].1.is_some(), "error reported to the service");
    }

    #[tokio::test]
    async fn idle_backend_is_a_noop() {
        let env = test_env(0).await;
        let backend = Arc::new(StubImportBackend::new());
        let supervisor = ImportSupervisor::new(
            env.store.clone(),
            backend,
            env.events.clone(),
            "test-instance",
        );
        supervisor.do_work().await;
        assert!(env.store.list_state_change_events(10).await.unwrap().is_empty());
    }
}
