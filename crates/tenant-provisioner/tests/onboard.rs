//! End-to-end onboarding against in-memory collaborators.

use std::collections::BTreeSet;

use k8s_openapi::api::core::v1::{Namespace, Secret};
use tempfile::TempDir;
use tenant_provisioner::cluster::crds::Gateway;
use tenant_provisioner::config::ProvisionerConfig;
use tenant_provisioner::identity::TOKEN_SECRET;
use tenant_provisioner::store::{CredentialStore, FileStore, RecordDomain, StoreError};
use tenant_provisioner::testing::{CertificateBehavior, FakeClock, FakeCluster, FakeDatabase};
use tenant_provisioner::{
    Environment, ProvisionError, Provisioner, Report, StepStatus, Tenant, TenantEnvironment,
};

const ADMIN_PASSWORD: &str = "admin-secret";

struct Harness {
    cluster: FakeCluster,
    database: FakeDatabase,
    store: FileStore,
    clock: FakeClock,
    config: ProvisionerConfig,
    _dir: TempDir,
}

impl Harness {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path().join("store")).unwrap();
        store
            .set(
                &RecordDomain::Infrastructure,
                "POSTGRES_ADMIN_PASSWORD",
                ADMIN_PASSWORD,
            )
            .unwrap();

        Self {
            cluster: FakeCluster::with_gateway(
                "gateway-system",
                "shared-gateway",
                Some("*.apps.example.com"),
            ),
            database: FakeDatabase::new(ADMIN_PASSWORD),
            store,
            clock: FakeClock::new(),
            config: ProvisionerConfig::default(),
            _dir: dir,
        }
    }

    async fn onboard(&self, name: &str) -> Result<Report, ProvisionError> {
        Provisioner::new(
            &self.cluster,
            &self.database,
            &self.store,
            &self.clock,
            &self.config,
        )
        .onboard(&Tenant::new(name).unwrap())
        .await
    }
}

fn listener_names(cluster: &FakeCluster) -> Vec<String> {
    let gateway: Gateway = cluster
        .object(Some("gateway-system"), "shared-gateway")
        .unwrap();
    gateway.spec.listeners.into_iter().map(|l| l.name).collect()
}

#[tokio::test]
async fn rerunning_onboard_changes_nothing() {
    let harness = Harness::new();

    let first = harness.onboard("acme").await.unwrap();
    assert!(first.is_success(), "{:?}", first.outcomes);
    let second = harness.onboard("acme").await.unwrap();

    assert!(
        second.outcomes.iter().all(|o| o.status == StepStatus::NoOp),
        "{:?}",
        second.outcomes
    );
    assert_eq!(second.exit_code(), 0);
    assert_eq!(harness.cluster.count::<Namespace>(), 2);
    assert_eq!(listener_names(&harness.cluster).len(), 3);
}

#[tokio::test]
async fn environments_get_distinct_credentials() {
    let harness = Harness::new();
    let tenant = Tenant::new("acme").unwrap();

    harness.onboard("acme").await.unwrap();

    let record = harness
        .store
        .read_record(&RecordDomain::Tenant(tenant.clone()))
        .unwrap()
        .unwrap();
    assert_ne!(record["ALPHA_DATABASE_PASSWORD"], record["PROD_DATABASE_PASSWORD"]);
    assert_eq!(
        harness.database.role_password("acme-prod").unwrap(),
        record["PROD_DATABASE_PASSWORD"]
    );

    let alpha_token = harness.cluster.service_account_token("acme-alpha");
    let prod_token = harness.cluster.service_account_token("acme-prod");
    assert!(!alpha_token.is_empty());
    assert_ne!(alpha_token, prod_token);

    for environment in Environment::ALL {
        let target = TenantEnvironment::new(&tenant, environment);
        let secret: Secret = harness
            .cluster
            .object(Some(&target.namespace()), "database-credentials")
            .unwrap();
        assert!(secret.data.unwrap().contains_key("DATABASE_URL"));
        assert!(harness
            .cluster
            .object::<Secret>(Some(&target.namespace()), TOKEN_SECRET)
            .is_some());
    }
}

#[tokio::test]
async fn listener_names_stay_unique_across_tenants() {
    let harness = Harness::new();

    harness.onboard("acme").await.unwrap();
    harness.onboard("globex").await.unwrap();
    harness.onboard("acme").await.unwrap();

    let names = listener_names(&harness.cluster);
    let unique: BTreeSet<_> = names.iter().collect();
    assert_eq!(names.len(), unique.len());
    assert_eq!(
        unique.into_iter().cloned().collect::<Vec<_>>(),
        [
            "http",
            "https-acme-alpha",
            "https-acme-prod",
            "https-globex-alpha",
            "https-globex-prod",
        ]
    );
}

#[tokio::test]
async fn slow_certificates_are_bounded_by_the_timeout() {
    let harness = Harness::new();
    harness
        .cluster
        .set_certificate_behavior(CertificateBehavior::NeverReady);

    let report = harness.onboard("acme").await.unwrap();

    let per_certificate =
        harness.config.certificate.timeout() + harness.config.certificate.poll_interval();
    assert!(harness.clock.elapsed() <= per_certificate * 2);
    for environment in Environment::ALL {
        let outcome = report
            .outcome(tenant_provisioner::Step::Certificate, environment)
            .unwrap();
        assert_eq!(outcome.status, StepStatus::Pending);
    }
    assert_eq!(report.exit_code(), 2);
}

#[tokio::test]
async fn certificate_issued_after_a_few_polls_completes() {
    let harness = Harness::new();
    harness
        .cluster
        .set_certificate_behavior(CertificateBehavior::ReadyAfterPolls(3));

    let report = harness.onboard("acme").await.unwrap();

    assert!(report.is_success(), "{:?}", report.outcomes);
    assert!(harness.clock.elapsed() < harness.config.certificate.timeout());
}

#[tokio::test]
async fn concurrent_invocation_fails_fast() {
    let harness = Harness::new();
    let _held = harness.store.lock().unwrap();

    let err = harness.onboard("acme").await.unwrap_err();

    match err {
        ProvisionError::Store(StoreError::Locked { holder, .. }) => {
            assert_eq!(holder, std::process::id().to_string());
        }
        other => panic!("expected lock error, got {other}"),
    }
    assert_eq!(harness.cluster.count::<Namespace>(), 0);
}

#[tokio::test]
async fn unreachable_cluster_fails_each_environment() {
    let harness = Harness::new();
    harness.cluster.set_unreachable(true);

    let report = harness.onboard("acme").await.unwrap();

    for environment in Environment::ALL {
        let namespace = report
            .outcome(tenant_provisioner::Step::Namespace, environment)
            .unwrap();
        assert_eq!(namespace.status, StepStatus::Failed);
        let database = report
            .outcome(tenant_provisioner::Step::Database, environment)
            .unwrap();
        assert_eq!(database.status, StepStatus::Skipped);
        let precondition = report
            .outcome(tenant_provisioner::Step::GatewayPrecondition, environment)
            .unwrap();
        assert_eq!(precondition.status, StepStatus::Failed);
    }
    assert_eq!(report.outcomes.len(), 12);
    assert_eq!(harness.database.sessions(), 0);
}
