// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Property-based tests for admission rules and their building blocks
//!
//! These tests use proptest to generate random inputs and verify that:
//! 1. Quantity parsing never panics and orders suffixes correctly
//! 2. Version comparison is a consistent total order
//! 3. A namespace-wide grant covers every name in that namespace only
//! 4. Sharded cluster rules accept exactly the valid config-server counts
//! 5. Engine version changes never allow a downgrade

use std::cmp::Ordering;
use std::collections::BTreeSet;

use proptest::prelude::*;

use dbaas_control_plane::crd::EngineType;
use dbaas_control_plane::handlers::ValidationError;
use dbaas_control_plane::handlers::rbac::{Enforcer, Policy};
use dbaas_control_plane::handlers::validation::database_cluster::{
    ValidationContext, validate_all,
};
use dbaas_control_plane::handlers::validation::engine_version::validate_engine_version_upgrade;
use dbaas_control_plane::handlers::validation::quantity::Quantity;
use dbaas_control_plane::version;

#[path = "../common/mod.rs"]
mod common;
use common::*;

// =============================================================================
// Strategies
// =============================================================================

fn version_triple() -> impl Strategy<Value = (u64, u64, u64)> {
    (0u64..30, 0u64..30, 0u64..60)
}

fn dns_label() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9-]{0,14}[a-z0-9]"
}

fn quantity(s: &str) -> Quantity {
    s.parse().unwrap()
}

// =============================================================================
// Quantities
// =============================================================================

proptest! {
    #[test]
    fn quantity_parse_never_panics(s in "\\PC{0,24}") {
        let _ = s.parse::<Quantity>();
    }

    #[test]
    fn binary_suffixes_are_ordered(n in 1u32..100_000) {
        let ki = quantity(&format!("{n}Ki"));
        let mi = quantity(&format!("{n}Mi"));
        let gi = quantity(&format!("{n}Gi"));
        let ti = quantity(&format!("{n}Ti"));
        prop_assert!(ki < mi);
        prop_assert!(mi < gi);
        prop_assert!(gi < ti);
    }

    #[test]
    fn binary_suffix_exceeds_decimal(n in 1u32..100_000) {
        let (dec, bin) = (format!("{n}k"), format!("{n}Ki"));
        prop_assert!(quantity(&dec) < quantity(&bin));
        let (dec, bin) = (format!("{n}M"), format!("{n}Mi"));
        prop_assert!(quantity(&dec) < quantity(&bin));
        let (dec, bin) = (format!("{n}G"), format!("{n}Gi"));
        prop_assert!(quantity(&dec) < quantity(&bin));
    }

    #[test]
    fn millis_equal_their_unit_value(n in 0i64..1_000_000) {
        prop_assert_eq!(quantity(&format!("{}m", n * 1000)), Quantity::from_units(n));
        prop_assert_eq!(quantity(&format!("{n}m")), Quantity::from_millis(n));
    }

    #[test]
    fn negative_quantities_rejected(n in 1u32..100_000) {
        let neg = format!("-{n}Gi");
        prop_assert!(neg.parse::<Quantity>().is_err());
    }
}

// =============================================================================
// Versions
// =============================================================================

proptest! {
    #[test]
    fn compare_matches_semver((a1, a2, a3) in version_triple(), (b1, b2, b3) in version_triple()) {
        let a = format!("{a1}.{a2}.{a3}");
        let b = format!("{b1}.{b2}.{b3}");
        prop_assert_eq!(version::compare(&a, &b), (a1, a2, a3).cmp(&(b1, b2, b3)));
    }

    #[test]
    fn compare_is_antisymmetric(a in "[v]?[0-9]{1,2}(\\.[0-9]{1,2}){0,2}", b in "\\PC{0,8}") {
        prop_assert_eq!(version::compare(&a, &b), version::compare(&b, &a).reverse());
    }

    #[test]
    fn v_prefix_is_ignored((major, minor, patch) in version_triple()) {
        let plain = format!("{major}.{minor}.{patch}");
        prop_assert_eq!(version::compare(&format!("v{plain}"), &plain), Ordering::Equal);
    }

    #[test]
    fn abbreviated_versions_pad_with_zero(major in 0u64..100, minor in 0u64..100) {
        prop_assert_eq!(
            version::compare(&format!("{major}.{minor}"), &format!("{major}.{minor}.0")),
            Ordering::Equal
        );
        prop_assert_eq!(
            version::compare(&major.to_string(), &format!("{major}.0.0")),
            Ordering::Equal
        );
    }

    #[test]
    fn downgrades_always_rejected(
        (a1, a2, a3) in version_triple(),
        (b1, b2, b3) in version_triple(),
        engine in prop_oneof![
            Just(EngineType::Pxc),
            Just(EngineType::Psmdb),
            Just(EngineType::Postgresql),
        ],
    ) {
        prop_assume!((a1, a2, a3) < (b1, b2, b3));
        let result = validate_engine_version_upgrade(
            engine,
            &format!("{a1}.{a2}.{a3}"),
            &format!("{b1}.{b2}.{b3}"),
        );
        prop_assert_eq!(result, Err(ValidationError::EngineDowngrade));
    }

    #[test]
    fn same_major_upgrades_allowed(
        major in 1u64..20,
        (a2, a3) in (0u64..30, 0u64..30),
        (b2, b3) in (0u64..30, 0u64..30),
    ) {
        prop_assume!((a2, a3) >= (b2, b3));
        let result = validate_engine_version_upgrade(
            EngineType::Pxc,
            &format!("{major}.{a2}.{a3}"),
            &format!("{major}.{b2}.{b3}"),
        );
        prop_assert!(result.is_ok());
    }
}

// =============================================================================
// Policy
// =============================================================================

proptest! {
    #[test]
    fn namespace_grant_covers_every_name(
        namespace in dns_label(),
        other in dns_label(),
        name in dns_label(),
    ) {
        prop_assume!(namespace != other);
        let policy = Policy::parse(&format!(
            "p, role:ns-reader, backup-storages, read, {namespace}/*\ng, alice, role:ns-reader"
        ))
        .unwrap();

        let inside = format!("{namespace}/{name}");
        let outside = format!("{other}/{name}");
        prop_assert!(policy.enforce("alice", "backup-storages", "read", &inside).unwrap());
        prop_assert!(!policy.enforce("alice", "backup-storages", "read", &outside).unwrap());
        prop_assert!(!policy.enforce("alice", "backup-storages", "delete", &inside).unwrap());
        prop_assert!(!policy.enforce("bob", "backup-storages", "read", &inside).unwrap());
    }

    #[test]
    fn disabled_policy_allows_everything(
        subject in "\\PC{0,12}",
        object in "\\PC{0,24}",
    ) {
        let policy = Policy::disabled();
        prop_assert!(policy.enforce(&subject, "database-clusters", "delete", &object).unwrap());
    }
}

// =============================================================================
// Sharding
// =============================================================================

proptest! {
    #[test]
    fn config_server_rules(
        replicas in prop_oneof![Just(1), Just(3), Just(5)],
        shards in 1i32..5,
        config_servers in 0i32..8,
    ) {
        let engine = EngineBuilder::installed(NAMESPACE, EngineType::Psmdb).build();
        let cluster = ClusterBuilder::new("mongo", NAMESPACE, EngineType::Psmdb)
            .with_replicas(replicas)
            .with_sharding(shards, config_servers)
            .build();
        let result = validate_all(&ValidationContext {
            cluster: &cluster,
            engine: &engine,
            old_cluster: None,
            pitr_storage: None,
            backup_history_storages: BTreeSet::new(),
            monitoring_config_exists: false,
        });

        let minimum = if replicas == 1 { 1 } else { 3 };
        let valid = config_servers >= minimum && config_servers % 2 == 1;
        prop_assert_eq!(result.is_ok(), valid, "result: {:?}", result);
    }

    #[test]
    fn shard_count_must_be_positive(shards in -5i32..1) {
        let engine = EngineBuilder::installed(NAMESPACE, EngineType::Psmdb).build();
        let cluster = ClusterBuilder::new("mongo", NAMESPACE, EngineType::Psmdb)
            .with_sharding(shards, 3)
            .build();
        let result = validate_all(&ValidationContext {
            cluster: &cluster,
            engine: &engine,
            old_cluster: None,
            pitr_storage: None,
            backup_history_storages: BTreeSet::new(),
            monitoring_config_exists: false,
        });
        prop_assert_eq!(result, Err(ValidationError::InsufficientShards { min: 1 }));
    }
}
