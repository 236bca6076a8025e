//! Resource quantities as they flow from a PGUpgrade into its jobs

use pg_upgrade_operator::controller::validate_upgrade;
use pg_upgrade_operator::resources::jobs::generate_upgrade_job;
use pg_upgrade_operator::resources::quantity::canonical_quantity;

use crate::common::*;

#[test]
fn test_canonical_forms() {
    let cases = [
        ("3.14", "3140m"),
        ("250m", "250m"),
        ("0.001", "1m"),
        ("1.5", "1500m"),
        ("2000m", "2"),
        ("1Ki", "1Ki"),
        ("2048Ki", "2Mi"),
        ("1000k", "1M"),
        ("1e6", "1e6"),
        ("+4", "4"),
        ("-1", "-1"),
    ];

    for (input, expected) in cases {
        assert_eq!(
            canonical_quantity(input).map(|q| q.0),
            Ok(expected.to_string()),
            "canonical form of {input}"
        );
    }
}

#[test]
fn test_requests_reach_the_job_in_canonical_form() {
    let upgrade = PGUpgradeBuilder::new("pgu", "db")
        .cpu_request("1.5")
        .memory_limit("2048Mi")
        .build();
    let job = generate_upgrade_job(&upgrade, &InstanceBuilder::new("pg-a", "pg").build());

    let resources = job.spec.unwrap().template.spec.unwrap().containers[0]
        .resources
        .clone()
        .unwrap();
    assert_eq!(resources.requests.unwrap()["cpu"].0, "1500m");
    assert_eq!(resources.limits.unwrap()["memory"].0, "2Gi");
}

#[test]
fn test_unparsable_quantities_fail_validation() {
    for bad in [
        "",
        "lots",
        "1.2.3",
        "5Xi",
        "2 cores",
        "1e2147483647",
        "1.5e-2147483648",
    ] {
        let upgrade = PGUpgradeBuilder::new("pgu", "db").cpu_request(bad).build();
        assert!(validate_upgrade(&upgrade).is_err(), "{bad:?} should be rejected");
    }
}

#[test]
fn test_valid_quantities_pass_validation() {
    let upgrade = PGUpgradeBuilder::new("pgu", "db")
        .cpu_request("500m")
        .memory_limit("1Gi")
        .build();
    assert!(validate_upgrade(&upgrade).is_ok());
}
