//! Tenant scope isolation against the in-memory backend

use std::time::Duration;

use ontology_store::{
    MemoryScopeProvider, MemorySession, MemoryStore, MemoryWorkflowRepository, Provenance,
    ProvenanceSource, RequestContext, ScopeProvider, StoreError, StoreResult, TenantId, Workflow,
    WorkflowChange, WorkflowProgress, WorkflowRepository, WorkflowState,
};
use uuid::Uuid;

fn setup() -> (MemoryStore, MemoryScopeProvider, MemoryWorkflowRepository) {
    let store = MemoryStore::new();
    let provider = MemoryScopeProvider::new(store.clone());
    (store, provider, MemoryWorkflowRepository::new())
}

async fn scoped(provider: &MemoryScopeProvider, tenant: TenantId) -> RequestContext<MemorySession> {
    RequestContext::scoped(provider.acquire(tenant).await.unwrap())
}

#[tokio::test]
async fn test_tenants_with_same_business_key_are_isolated() {
    let (_store, provider, repo) = setup();
    let tenant_a = TenantId::new(Uuid::new_v4());
    let tenant_b = TenantId::new(Uuid::new_v4());
    let ontology = Uuid::new_v4();

    let wf_a = Workflow::new(tenant_a, ontology);
    let wf_b = Workflow::new(tenant_b, ontology);

    let mut ctx_a = scoped(&provider, tenant_a).await;
    let mut ctx_b = scoped(&provider, tenant_b).await;
    repo.create(&mut ctx_a, &wf_a).await.unwrap();
    repo.create(&mut ctx_b, &wf_b).await.unwrap();

    let latest_a = repo
        .get_latest_by_ontology(&mut ctx_a, ontology)
        .await
        .unwrap()
        .unwrap();
    let latest_b = repo
        .get_latest_by_ontology(&mut ctx_b, ontology)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(latest_a.id, wf_a.id);
    assert_eq!(latest_b.id, wf_b.id);

    // B's row does not exist from A's point of view
    assert!(repo.get_by_id(&mut ctx_a, wf_b.id).await.unwrap().is_none());
    assert!(!repo
        .claim_ownership(&mut ctx_a, wf_b.id, "a-worker")
        .await
        .unwrap());
    assert!(matches!(
        repo.update_state(&mut ctx_a, wf_b.id, WorkflowState::Failed, Some("x"))
            .await,
        Err(StoreError::NotFound(_))
    ));
    assert!(matches!(
        repo.release_ownership(&mut ctx_a, wf_b.id).await,
        Err(StoreError::NotFound(_))
    ));
    assert!(matches!(
        repo.delete(&mut ctx_a, wf_b.id).await,
        Err(StoreError::NotFound(_))
    ));

    let untouched = repo.get_by_id(&mut ctx_b, wf_b.id).await.unwrap().unwrap();
    assert_eq!(untouched.state, WorkflowState::Pending);
    assert!(untouched.owner_id.is_none());
}

#[tokio::test]
async fn test_administrative_scope_sees_all_tenants() {
    let (_store, provider, repo) = setup();
    let tenant_a = TenantId::new(Uuid::new_v4());
    let tenant_b = TenantId::new(Uuid::new_v4());
    let wf_a = Workflow::new(tenant_a, Uuid::new_v4());
    let wf_b = Workflow::new(tenant_b, Uuid::new_v4());

    let mut admin = RequestContext::scoped(provider.acquire_administrative().await.unwrap());
    assert!(admin.tenant().is_none());
    repo.create(&mut admin, &wf_a).await.unwrap();
    repo.create(&mut admin, &wf_b).await.unwrap();

    assert!(repo.get_by_id(&mut admin, wf_a.id).await.unwrap().is_some());
    assert!(repo.get_by_id(&mut admin, wf_b.id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_writing_another_tenants_row_is_rejected() {
    let (_store, provider, repo) = setup();
    let tenant_a = TenantId::new(Uuid::new_v4());
    let tenant_b = TenantId::new(Uuid::new_v4());
    let mut ctx_a = scoped(&provider, tenant_a).await;

    let err = repo
        .create(&mut ctx_a, &Workflow::new(tenant_b, Uuid::new_v4()))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::IsolationViolation(_)));
}

#[tokio::test]
async fn test_missing_scope_fails_before_any_round_trip() {
    let (store, _provider, repo) = setup();
    let tenant = TenantId::new(Uuid::new_v4());
    let id = Uuid::new_v4();
    let mut ctx: RequestContext<MemorySession> = RequestContext::new()
        .with_provenance(Provenance::system(ProvenanceSource::Inference));

    let results: Vec<StoreResult<()>> = vec![
        repo.create(&mut ctx, &Workflow::new(tenant, Uuid::new_v4()))
            .await,
        repo.get_by_id(&mut ctx, id).await.map(|_| ()),
        repo.get_latest_by_ontology(&mut ctx, id).await.map(|_| ()),
        repo.update(&mut ctx, &Workflow::new(tenant, Uuid::new_v4()))
            .await,
        repo.update_state(&mut ctx, id, WorkflowState::Running, None)
            .await,
        repo.update_progress(&mut ctx, id, &WorkflowProgress::default())
            .await,
        repo.update_task_queue(&mut ctx, id, &[]).await,
        repo.apply_as_owner(&mut ctx, id, "p1", &WorkflowChange::state(WorkflowState::Running))
            .await,
        repo.delete(&mut ctx, id).await,
        repo.claim_ownership(&mut ctx, id, "p1").await.map(|_| ()),
        repo.update_heartbeat(&mut ctx, id, "p1").await,
        repo.release_ownership(&mut ctx, id).await,
        repo.release_owned(&mut ctx, id, "p1").await.map(|_| ()),
        repo.list_stale_leases(&mut ctx, Duration::from_secs(30), 10)
            .await
            .map(|_| ()),
        repo.reset_stale_lease(&mut ctx, id, "p1", Duration::from_secs(30))
            .await
            .map(|_| ()),
    ];

    for result in results {
        let err = result.unwrap_err();
        assert!(matches!(err, StoreError::MissingScope), "got {:?}", err);
        assert!(err.is_caller_bug());
    }
    assert_eq!(store.round_trips(), 0);
}

#[tokio::test]
async fn test_released_scope_behaves_like_missing() {
    let (store, provider, repo) = setup();
    let tenant = TenantId::new(Uuid::new_v4());
    let mut ctx = scoped(&provider, tenant).await;
    ctx.release_scope();
    let before = store.round_trips();

    assert!(matches!(
        repo.claim_ownership(&mut ctx, Uuid::new_v4(), "p1").await,
        Err(StoreError::MissingScope)
    ));
    assert_eq!(store.round_trips(), before);
    assert_eq!(store.open_sessions(), 0);
}

#[tokio::test]
async fn test_scope_released_on_error_path() {
    async fn failing_operation(
        provider: &MemoryScopeProvider,
        repo: &MemoryWorkflowRepository,
        tenant: TenantId,
    ) -> StoreResult<()> {
        let mut ctx = RequestContext::scoped(provider.acquire(tenant).await?);
        repo.update_state(&mut ctx, Uuid::new_v4(), WorkflowState::Running, None)
            .await?;
        Ok(())
    }

    let (store, provider, repo) = setup();
    let tenant = TenantId::new(Uuid::new_v4());

    let err = failing_operation(&provider, &repo, tenant).await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)));
    assert_eq!(store.open_sessions(), 0);
}

#[tokio::test]
async fn test_expired_deadline_fails_without_round_trip() {
    let (store, provider, repo) = setup();
    let tenant = TenantId::new(Uuid::new_v4());
    let mut ctx = scoped(&provider, tenant).await.with_timeout(Duration::ZERO);
    let before = store.round_trips();

    let err = repo
        .get_by_id(&mut ctx, Uuid::new_v4())
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::DeadlineExceeded(_)));
    assert!(err.is_transient());
    assert_eq!(store.round_trips(), before);
}

#[tokio::test]
async fn test_unavailable_store_is_transient() {
    let (store, provider, repo) = setup();
    let tenant = TenantId::new(Uuid::new_v4());
    let mut ctx = scoped(&provider, tenant).await;

    store.set_available(false);
    let err = repo
        .claim_ownership(&mut ctx, Uuid::new_v4(), "p1")
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::StorageUnavailable(_)));
    assert!(err.is_transient());

    store.set_available(true);
    assert!(!repo
        .claim_ownership(&mut ctx, Uuid::new_v4(), "p1")
        .await
        .unwrap());
}
