//! PGUpgrade manifests as users write them

use kube::CustomResourceExt;
use pg_upgrade_operator::crd::{PGUpgrade, UpgradePhase};
use pg_upgrade_operator::resources::jobs::generate_upgrade_job;

use crate::common::*;

const MANIFEST: &str = r#"
apiVersion: postgres-operator.smoketurner.com/v1alpha1
kind: PGUpgrade
metadata:
  name: hippo-upgrade
  namespace: postgres
spec:
  postgresClusterName: hippo
  image: registry.example.com/upgrade:latest
  fromPostgresVersion: 14
  toPostgresVersion: 16
  imagePullPolicy: IfNotPresent
  imagePullSecrets:
    - name: registry
  resources:
    requests:
      cpu: "0.5"
      memory: 512Mi
"#;

#[test]
fn test_manifest_deserializes() {
    let upgrade: PGUpgrade = serde_yaml::from_str(MANIFEST).unwrap();

    assert_eq!(upgrade.spec.postgres_cluster_name, "hippo");
    assert_eq!(upgrade.spec.from_postgres_version, 14);
    assert_eq!(upgrade.spec.to_postgres_version, 16);
    assert_eq!(upgrade.spec.image_pull_secrets.len(), 1);
    assert_eq!(upgrade.phase(), UpgradePhase::Pending);
}

#[test]
fn test_manifest_generates_job() {
    let upgrade: PGUpgrade = serde_yaml::from_str(MANIFEST).unwrap();
    let job = generate_upgrade_job(&upgrade, &InstanceBuilder::new("hippo-a", "hippo").build());

    assert_eq!(job.metadata.name.as_deref(), Some("hippo-upgrade-pgdata"));
    assert_eq!(job.metadata.namespace.as_deref(), Some("postgres"));

    let container = &job.spec.unwrap().template.spec.unwrap().containers[0];
    let requests = container.resources.clone().unwrap().requests.unwrap();
    assert_eq!(requests["cpu"].0, "500m");
    assert_eq!(requests["memory"].0, "512Mi");
    assert_eq!(container.image_pull_policy.as_deref(), Some("IfNotPresent"));
}

#[test]
fn test_crd_definition() {
    let crd = PGUpgrade::crd();
    assert_eq!(crd.spec.group, "postgres-operator.smoketurner.com");
    assert_eq!(crd.spec.names.kind, "PGUpgrade");
    assert!(crd.spec.versions.iter().any(|v| v.name == "v1alpha1"));
}

#[test]
fn test_status_round_trips_through_yaml() {
    let upgrade = PGUpgradeBuilder::new("pgu", "db")
        .phase(UpgradePhase::RemovingOldData)
        .build();
    let yaml = serde_yaml::to_string(&upgrade).unwrap();
    assert!(yaml.contains("phase: RemovingOldData"));

    let parsed: PGUpgrade = serde_yaml::from_str(&yaml).unwrap();
    assert_eq!(parsed.phase(), UpgradePhase::RemovingOldData);
}
