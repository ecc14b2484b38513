//! Unit tests for admission rules as seen through the pipeline

use std::sync::Arc;

use dbaas_control_plane::crd::{
    AppState, BackupStorage, BackupStorageType, DatabaseCluster, EngineType,
};
use dbaas_control_plane::handlers::validation::engine_version::validate_engine_version_upgrade;
use dbaas_control_plane::handlers::{
    CreateBackupStorageRequest, Error, Handler, UpdateBackupStorageRequest, ValidationError,
};

use crate::common::*;

fn rejection(err: Error) -> ValidationError {
    match err {
        Error::InvalidRequest(e) => e,
        other => panic!("expected a validation error, got: {other}"),
    }
}

fn with_installed(engine_type: EngineType) -> FakeKube {
    FakeKube::new().with_engine(EngineBuilder::installed(NAMESPACE, engine_type).build())
}

fn handler_for(kube: FakeKube) -> (Arc<FakeKube>, Arc<dyn Handler>) {
    let kube = Arc::new(kube);
    let handler = open_pipeline(kube.clone(), Arc::new(StaticVersions::new()));
    (kube, handler)
}

mod create_cluster_tests {
    use super::*;

    #[tokio::test]
    async fn test_valid_cluster_is_created() {
        let (kube, handler) = handler_for(with_installed(EngineType::Pxc));
        let cluster = ClusterBuilder::new("mysql-db", NAMESPACE, EngineType::Pxc).build();

        handler
            .create_database_cluster(&as_user("admin"), &cluster)
            .await
            .unwrap();
        assert!(kube.cluster(NAMESPACE, "mysql-db").is_some());
    }

    #[tokio::test]
    async fn test_engine_not_installed() {
        let (kube, handler) = handler_for(FakeKube::new());
        let cluster = ClusterBuilder::new("db", NAMESPACE, EngineType::Postgresql).build();

        let err = handler
            .create_database_cluster(&as_user("admin"), &cluster)
            .await
            .unwrap_err();
        assert_eq!(
            rejection(err),
            ValidationError::EngineNotInstalled(EngineType::Postgresql)
        );
        assert_eq!(kube.call_count("create_database_cluster"), 0);
    }

    #[tokio::test]
    async fn test_invalid_name() {
        let (_, handler) = handler_for(with_installed(EngineType::Pxc));
        let cluster = ClusterBuilder::new("My_DB", NAMESPACE, EngineType::Pxc).build();

        let err = handler
            .create_database_cluster(&as_user("admin"), &cluster)
            .await
            .unwrap_err();
        assert_eq!(rejection(err), ValidationError::InvalidName("My_DB".to_string()));
    }

    #[tokio::test]
    async fn test_name_collision() {
        let existing = ClusterBuilder::new("db", NAMESPACE, EngineType::Pxc).build();
        let (_, handler) = handler_for(
            FakeKube::new()
                .with_engine(EngineBuilder::installed(NAMESPACE, EngineType::Pxc).build())
                .with_cluster(existing.clone()),
        );

        let err = handler
            .create_database_cluster(&as_user("admin"), &existing)
            .await
            .unwrap_err();
        assert!(matches!(
            rejection(err),
            ValidationError::AlreadyExists { name, .. } if name == "db"
        ));
    }

    #[tokio::test]
    async fn test_version_must_be_allowed() {
        let (_, handler) = handler_for(
            FakeKube::new().with_engine(
                EngineBuilder::installed(NAMESPACE, EngineType::Pxc)
                    .with_allowed_versions(&["8.0.31"])
                    .build(),
            ),
        );
        let cluster = ClusterBuilder::new("db", NAMESPACE, EngineType::Pxc).build();

        let err = handler
            .create_database_cluster(&as_user("admin"), &cluster)
            .await
            .unwrap_err();
        assert!(matches!(rejection(err), ValidationError::VersionNotAllowed { .. }));
    }

    #[tokio::test]
    async fn test_missing_monitoring_config() {
        let (_, handler) = handler_for(with_installed(EngineType::Psmdb));
        let cluster = ClusterBuilder::new("db", NAMESPACE, EngineType::Psmdb)
            .with_monitoring("pmm")
            .build();

        let err = handler
            .create_database_cluster(&as_user("admin"), &cluster)
            .await
            .unwrap_err();
        assert_eq!(
            rejection(err),
            ValidationError::MonitoringConfigNotFound("pmm".to_string())
        );
    }

    #[tokio::test]
    async fn test_pxc_pitr_storage_must_exist_and_be_s3() {
        let (_, handler) = handler_for(
            FakeKube::new()
                .with_engine(EngineBuilder::installed(NAMESPACE, EngineType::Pxc).build())
                .with_backup_storage(backup_storage(NAMESPACE, "azure", BackupStorageType::Azure)),
        );

        let missing = ClusterBuilder::new("db", NAMESPACE, EngineType::Pxc)
            .with_pitr("nowhere")
            .build();
        let err = handler
            .create_database_cluster(&as_user("admin"), &missing)
            .await
            .unwrap_err();
        assert_eq!(
            rejection(err),
            ValidationError::BackupStorageNotFound("nowhere".to_string())
        );

        let azure = ClusterBuilder::new("db", NAMESPACE, EngineType::Pxc)
            .with_pitr("azure")
            .build();
        let err = handler
            .create_database_cluster(&as_user("admin"), &azure)
            .await
            .unwrap_err();
        assert_eq!(rejection(err), ValidationError::PxcPitrS3Only);
    }

    #[tokio::test]
    async fn test_backup_history_counts_towards_storage_limit() {
        let (_, handler) = handler_for(
            FakeKube::new()
                .with_engine(EngineBuilder::installed(NAMESPACE, EngineType::Postgresql).build())
                .with_backup(cluster_backup(NAMESPACE, "b1", "pg", "s3-a"))
                .with_backup(cluster_backup(NAMESPACE, "b2", "pg", "s3-b"))
                .with_backup(cluster_backup(NAMESPACE, "b3", "pg", "s3-c"))
                .with_backup(cluster_backup(NAMESPACE, "b4", "other-pg", "s3-e")),
        );
        let cluster = ClusterBuilder::new("pg", NAMESPACE, EngineType::Postgresql)
            .with_schedule("daily", "0 0 * * *", "s3-d")
            .build();

        let err = handler
            .create_database_cluster(&as_user("admin"), &cluster)
            .await
            .unwrap_err();
        assert_eq!(
            rejection(err),
            ValidationError::TooManyStorages {
                limit: 3,
                engine: EngineType::Postgresql
            }
        );
    }
}

mod sharding_tests {
    use super::*;

    async fn create_sharded(
        replicas: i32,
        shards: i32,
        config_servers: i32,
    ) -> Result<(), ValidationError> {
        let (_, handler) = handler_for(with_installed(EngineType::Psmdb));
        let cluster = ClusterBuilder::new("mongo", NAMESPACE, EngineType::Psmdb)
            .with_replicas(replicas)
            .with_sharding(shards, config_servers)
            .build();
        handler
            .create_database_cluster(&as_user("admin"), &cluster)
            .await
            .map(|_| ())
            .map_err(rejection)
    }

    #[tokio::test]
    async fn test_valid_sharded_cluster() {
        assert_eq!(create_sharded(3, 2, 3).await, Ok(()));
        assert_eq!(create_sharded(1, 1, 1).await, Ok(()));
    }

    #[tokio::test]
    async fn test_shards_below_minimum() {
        assert_eq!(
            create_sharded(3, 0, 3).await,
            Err(ValidationError::InsufficientShards { min: 1 })
        );
    }

    #[tokio::test]
    async fn test_even_config_servers() {
        assert_eq!(
            create_sharded(3, 2, 4).await,
            Err(ValidationError::EvenConfigServers)
        );
    }

    #[tokio::test]
    async fn test_single_node_needs_a_config_server() {
        assert_eq!(
            create_sharded(1, 1, 0).await,
            Err(ValidationError::InsufficientConfigServersSingleNode { min: 1 })
        );
    }

    #[tokio::test]
    async fn test_multi_node_needs_three_config_servers() {
        assert_eq!(
            create_sharded(3, 2, 1).await,
            Err(ValidationError::InsufficientConfigServers { min: 3 })
        );
    }

    #[tokio::test]
    async fn test_sharding_needs_engine_version() {
        let (_, handler) = handler_for(with_installed(EngineType::Psmdb));
        let cluster = ClusterBuilder::new("mongo", NAMESPACE, EngineType::Psmdb)
            .with_version("")
            .with_sharding(2, 3)
            .build();

        let err = handler
            .create_database_cluster(&as_user("admin"), &cluster)
            .await
            .unwrap_err();
        assert_eq!(
            rejection(err),
            ValidationError::ShardingVersion {
                min: "1.17.0".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_sharding_ignores_operator_version() {
        let (_, handler) = handler_for(
            FakeKube::new().with_engine(
                EngineBuilder::installed(NAMESPACE, EngineType::Psmdb)
                    .with_operator_version("1.16.2")
                    .build(),
            ),
        );
        let cluster = ClusterBuilder::new("mongo", NAMESPACE, EngineType::Psmdb)
            .with_sharding(2, 3)
            .build();

        assert!(
            handler
                .create_database_cluster(&as_user("admin"), &cluster)
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_sharding_only_for_psmdb() {
        let (_, handler) = handler_for(with_installed(EngineType::Pxc));
        let cluster = ClusterBuilder::new("db", NAMESPACE, EngineType::Pxc)
            .with_sharding(2, 3)
            .build();

        let err = handler
            .create_database_cluster(&as_user("admin"), &cluster)
            .await
            .unwrap_err();
        assert_eq!(
            rejection(err),
            ValidationError::ShardingNotSupported(EngineType::Pxc)
        );
    }
}

mod update_cluster_tests {
    use super::*;

    const VERSIONS: &[&str] = &["8.0.21", "8.0.22", "8.0.23", "9.0.0"];

    fn fake_with(stored: DatabaseCluster) -> (Arc<FakeKube>, Arc<dyn Handler>) {
        handler_for(
            FakeKube::new()
                .with_engine(
                    EngineBuilder::new(NAMESPACE, EngineType::Pxc)
                        .with_available_versions(VERSIONS)
                        .build(),
                )
                .with_cluster(stored),
        )
    }

    #[tokio::test]
    async fn test_update_blocked_while_upgrading() {
        let stored = ClusterBuilder::new("db", NAMESPACE, EngineType::Pxc)
            .with_version("8.0.22")
            .with_status(AppState::Upgrading)
            .build();
        let (kube, handler) = fake_with(stored.clone());

        let mut update = stored.clone();
        update.spec.engine.replicas = 5;
        let err = handler
            .update_database_cluster(&as_user("admin"), &update)
            .await
            .unwrap_err();
        assert_eq!(
            rejection(err),
            ValidationError::UpdateNotAllowedInState(AppState::Upgrading)
        );
        assert_eq!(kube.cluster(NAMESPACE, "db").unwrap().spec.engine.replicas, 3);
    }

    #[tokio::test]
    async fn test_state_guard_precedes_content_rules() {
        let stored = ClusterBuilder::new("db", NAMESPACE, EngineType::Pxc)
            .with_version("8.0.22")
            .with_status(AppState::Upgrading)
            .build();
        let (kube, handler) = fake_with(stored.clone());

        let mut update = stored.clone();
        update.spec.engine.replicas = 4;
        let err = handler
            .update_database_cluster(&as_user("admin"), &update)
            .await
            .unwrap_err();
        assert_eq!(
            rejection(err),
            ValidationError::UpdateNotAllowedInState(AppState::Upgrading)
        );
        assert_eq!(kube.call_count("update_database_cluster"), 0);
    }

    #[tokio::test]
    async fn test_minor_upgrade_applied() {
        let stored = ClusterBuilder::new("db", NAMESPACE, EngineType::Pxc)
            .with_version("8.0.22")
            .with_status(AppState::Ready)
            .build();
        let (kube, handler) = fake_with(stored.clone());

        let update = ClusterBuilder::new("db", NAMESPACE, EngineType::Pxc)
            .with_version("8.0.23")
            .build();
        handler
            .update_database_cluster(&as_user("admin"), &update)
            .await
            .unwrap();
        assert_eq!(
            kube.cluster(NAMESPACE, "db").unwrap().spec.engine.version,
            "8.0.23"
        );
    }

    #[tokio::test]
    async fn test_downgrade_and_major_upgrade_rejected() {
        let stored = ClusterBuilder::new("db", NAMESPACE, EngineType::Pxc)
            .with_version("8.0.22")
            .with_status(AppState::Ready)
            .build();
        let (_, handler) = fake_with(stored);

        let downgrade = ClusterBuilder::new("db", NAMESPACE, EngineType::Pxc)
            .with_version("8.0.21")
            .build();
        let err = handler
            .update_database_cluster(&as_user("admin"), &downgrade)
            .await
            .unwrap_err();
        assert_eq!(rejection(err), ValidationError::EngineDowngrade);

        let major = ClusterBuilder::new("db", NAMESPACE, EngineType::Pxc)
            .with_version("9.0.0")
            .build();
        let err = handler
            .update_database_cluster(&as_user("admin"), &major)
            .await
            .unwrap_err();
        assert_eq!(rejection(err), ValidationError::MajorVersionUpgrade);
    }

    #[tokio::test]
    async fn test_storage_cannot_shrink() {
        let stored = ClusterBuilder::new("db", NAMESPACE, EngineType::Pxc)
            .with_version("8.0.22")
            .with_storage_size("20Gi")
            .build();
        let (_, handler) = fake_with(stored);

        let update = ClusterBuilder::new("db", NAMESPACE, EngineType::Pxc)
            .with_version("8.0.22")
            .with_storage_size("10Gi")
            .build();
        let err = handler
            .update_database_cluster(&as_user("admin"), &update)
            .await
            .unwrap_err();
        assert_eq!(rejection(err), ValidationError::CannotShrinkStorage);
    }

    #[tokio::test]
    async fn test_update_of_missing_cluster_is_not_found() {
        let (_, handler) = handler_for(with_installed(EngineType::Pxc));
        let update = ClusterBuilder::new("ghost", NAMESPACE, EngineType::Pxc).build();

        let err = handler
            .update_database_cluster(&as_user("admin"), &update)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_version_upgrade_table() {
        let cases: &[(EngineType, &str, &str, bool)] = &[
            (EngineType::Pxc, "8.0.23", "8.0.22", true),
            (EngineType::Pxc, "v8.0.23", "8.0.22", true),
            (EngineType::Pxc, "8.0.21", "8.0.22", false),
            (EngineType::Pxc, "9.0.0", "8.0.22", false),
            (EngineType::Pxc, "1!00;", "1.0.0", false),
            (EngineType::Psmdb, "7.0.2", "6.0.5", true),
            (EngineType::Psmdb, "8.0.0", "6.0.5", false),
        ];
        for (engine, new, old, ok) in cases {
            assert_eq!(
                validate_engine_version_upgrade(*engine, new, old).is_ok(),
                *ok,
                "{engine} {old} -> {new}"
            );
        }
    }
}

mod backup_storage_tests {
    use super::*;

    fn s3(name: &str) -> BackupStorage {
        backup_storage(NAMESPACE, name, BackupStorageType::S3)
    }

    #[tokio::test]
    async fn test_create_without_credentials_touches_nothing() {
        let (kube, handler) = handler_for(FakeKube::new());
        let req = CreateBackupStorageRequest {
            secret_key: String::new(),
            ..s3_storage_request("s3")
        };

        let err = handler
            .create_backup_storage(&as_user("admin"), NAMESPACE, &req)
            .await
            .unwrap_err();
        assert_eq!(rejection(err), ValidationError::MissingCredentials);
        assert!(kube.calls().is_empty());
    }

    #[tokio::test]
    async fn test_create_duplicate() {
        let (_, handler) = handler_for(FakeKube::new().with_backup_storage(s3("s3")));

        let err = handler
            .create_backup_storage(&as_user("admin"), NAMESPACE, &s3_storage_request("s3"))
            .await
            .unwrap_err();
        assert!(matches!(rejection(err), ValidationError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_update_with_lone_key_rejected() {
        let (_, handler) = handler_for(FakeKube::new().with_backup_storage(s3("s3")));
        let req = UpdateBackupStorageRequest {
            access_key: Some("new-key".to_string()),
            ..Default::default()
        };

        let err = handler
            .update_backup_storage(&as_user("admin"), NAMESPACE, "s3", &req)
            .await
            .unwrap_err();
        assert_eq!(rejection(err), ValidationError::MissingCredentials);
    }

    #[tokio::test]
    async fn test_delete_in_use_rejected() {
        let (kube, handler) = handler_for(
            FakeKube::new()
                .with_backup_storage(s3("s3"))
                .with_cluster(
                    ClusterBuilder::new("mongo", NAMESPACE, EngineType::Psmdb)
                        .with_schedule("daily", "0 0 * * *", "s3")
                        .build(),
                ),
        );

        let err = handler
            .delete_backup_storage(&as_user("admin"), NAMESPACE, "s3")
            .await
            .unwrap_err();
        assert_eq!(
            rejection(err),
            ValidationError::BackupStorageInUse {
                name: "s3".to_string(),
                cluster: "mongo".to_string(),
            }
        );
        assert!(kube.backup_storage(NAMESPACE, "s3").is_some());
    }
}
